//! The full SSD detection pipeline, from raw network outputs to final detections.

use std::path::Path;
use std::sync::Arc;

use ndarray::{Array5, ArrayView5};
use rayon::prelude::*;
use ssd_config::Config;

use crate::anchor::{AnchorCache, LayerAnchors};
use crate::bbox::{Bbox, Yxyx};
use crate::box_coder::{BoxCoder, EncodedLayer};
use crate::config::{PostprocessConfig, ScaleConfig, SsdConfig};
use crate::error::{Error, Result};
use crate::matcher::Matcher;
use crate::nms::nms_batch;
use crate::select::{Candidate, Selector};
use crate::sort::sort_batch;

/// Clip the boxes of `candidates` to `reference`.
pub fn clip_boxes(reference: &Bbox<Yxyx>, candidates: &mut [Candidate]) {
    for candidate in candidates {
        candidate.bbox = candidate.bbox.clip(reference);
    }
}

/// Express the boxes of `candidates` in the frame of `reference`.
pub fn resize_boxes(reference: &Bbox<Yxyx>, candidates: &mut [Candidate]) {
    for candidate in candidates {
        candidate.bbox = candidate.bbox.resize(reference);
    }
}

/// Decodes and filters the raw outputs of an SSD network.
///
/// The detector owns the anchors of every input shape it has seen, so it should be built once
/// and reused for every batch.
///
/// ```
/// use ndarray::Array5;
/// use ssd::{Detector, PostprocessConfig, SsdConfig};
///
/// let detector = Detector::new(SsdConfig::default(), PostprocessConfig::default()).unwrap();
/// let anchors = detector.anchors().unwrap();
///
/// // a batch of two images where the network saw nothing
/// let predictions = anchors
///     .iter()
///     .map(|layer| {
///         let (rows, cols, per_cell) = layer.grid_shape();
///         let mut scores = Array5::<f32>::zeros((2, rows, cols, per_cell, 11));
///         scores.index_axis_mut(ndarray::Axis(4), 0).fill(1.0);
///         scores
///     })
///     .collect::<Vec<_>>();
/// let localisations = anchors
///     .iter()
///     .map(|layer| {
///         let (rows, cols, per_cell) = layer.grid_shape();
///         Array5::<f32>::zeros((2, rows, cols, per_cell, 4))
///     })
///     .collect::<Vec<_>>();
///
/// let detections = detector
///     .detect(
///         &predictions.iter().map(Array5::view).collect::<Vec<_>>(),
///         &localisations.iter().map(Array5::view).collect::<Vec<_>>(),
///         None,
///     )
///     .unwrap();
///
/// assert_eq!(detections.len(), 2);
/// assert!(detections.iter().all(Vec::is_empty));
/// ```
#[derive(Debug)]
pub struct Detector {
    config: SsdConfig,
    postprocess: PostprocessConfig,
    scales: Vec<ScaleConfig>,
    coder: BoxCoder,
    matcher: Matcher,
    selector: Selector,
    cache: AnchorCache,
}

impl Detector {
    /// Create a detector, validating both configs.
    pub fn new(config: SsdConfig, postprocess: PostprocessConfig) -> Result<Self> {
        config.validate()?;
        postprocess.validate()?;

        let scales = config.scales()?;
        let coder = BoxCoder::new(config.prior_scaling);
        let matcher = Matcher::new(
            config.num_classes,
            config.no_annotation_label,
            postprocess.ignore_threshold,
        );
        let selector = Selector::new(postprocess.select_threshold, config.num_classes);

        tracing::debug!(
            scales = scales.len(),
            num_classes = config.num_classes,
            "created ssd detector"
        );

        Ok(Self {
            config,
            postprocess,
            scales,
            coder,
            matcher,
            selector,
            cache: AnchorCache::new(),
        })
    }

    /// Load both configs from a config directory.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        Self::new(SsdConfig::load(root)?, PostprocessConfig::load(root)?)
    }

    /// Load both configs from a config directory, with overrides from an overlay directory.
    pub fn load_with_overlay(main: impl AsRef<Path>, overlay: impl AsRef<Path>) -> Result<Self> {
        let (main, overlay) = (main.as_ref(), overlay.as_ref());
        Self::new(
            SsdConfig::load_with_overlay(main, overlay)?,
            PostprocessConfig::load_with_overlay(main, overlay)?,
        )
    }

    #[must_use]
    pub fn config(&self) -> &SsdConfig {
        &self.config
    }

    #[must_use]
    pub fn postprocess_config(&self) -> &PostprocessConfig {
        &self.postprocess
    }

    #[must_use]
    pub fn box_coder(&self) -> &BoxCoder {
        &self.coder
    }

    /// The anchors of every scale for the configured input shape.
    pub fn anchors(&self) -> Result<Arc<[LayerAnchors]>> {
        self.anchors_for(self.config.img_shape)
    }

    /// The anchors of every scale for an arbitrary square input shape.
    pub fn anchors_for(&self, img_shape: (usize, usize)) -> Result<Arc<[LayerAnchors]>> {
        self.cache.get_or_generate(img_shape, &self.scales)
    }

    /// Decode the localisation output of every scale into `[ymin, xmin, ymax, xmax]` boxes.
    pub fn decode(&self, localisations: &[ArrayView5<f32>]) -> Result<Vec<Array5<f32>>> {
        let anchors = self.anchors()?;
        check_layers("localisation layers", anchors.len(), localisations.len())?;

        localisations
            .iter()
            .zip(anchors.iter())
            .map(|(offsets, layer)| self.coder.decode_batch(offsets.view(), layer))
            .collect()
    }

    /// Run the full detection pipeline on a batch.
    ///
    /// `predictions` holds the class scores of every scale with shape
    /// `(batch, rows, cols, anchors, classes)`, `localisations` the box offsets with shape
    /// `(batch, rows, cols, anchors, 4)`.
    ///
    /// The boxes are decoded, thresholded, clipped to `reference`, sorted, suppressed and finally
    /// expressed relative to `reference`. Without a reference the boxes are neither clipped nor
    /// resized. A reference without area is rejected. Returns the detections of every image, by
    /// descending score.
    pub fn detect(
        &self,
        predictions: &[ArrayView5<f32>],
        localisations: &[ArrayView5<f32>],
        reference: Option<Bbox<Yxyx>>,
    ) -> Result<Vec<Vec<Candidate>>> {
        check_layers("prediction layers", localisations.len(), predictions.len())?;
        if let Some(reference) = &reference {
            check_reference(reference)?;
        }

        let boxes = self.decode(localisations)?;
        let boxes = boxes.iter().map(Array5::view).collect::<Vec<_>>();

        let mut selected = self.selector.select_batch(predictions, &boxes)?;
        if let Some(reference) = &reference {
            selected
                .par_iter_mut()
                .for_each(|candidates| clip_boxes(reference, candidates));
        }

        let sorted = sort_batch(selected, self.postprocess.top_k);
        let mut detections = nms_batch(
            &sorted,
            self.postprocess.nms_threshold,
            self.postprocess.keep_top_k,
            self.postprocess.nms_mode,
        );

        if let Some(reference) = &reference {
            detections
                .par_iter_mut()
                .for_each(|candidates| resize_boxes(reference, candidates));
        }

        tracing::debug!(
            batch = detections.len(),
            detections = detections.iter().map(Vec::len).sum::<usize>(),
            "detected objects"
        );

        Ok(detections)
    }

    /// Build the training targets of every scale from the ground truth of a single image.
    pub fn encode(
        &self,
        gt_boxes: &[Bbox<Yxyx>],
        gt_labels: &[usize],
    ) -> Result<Vec<EncodedLayer>> {
        let anchors = self.anchors()?;

        anchors
            .iter()
            .map(|layer| self.coder.encode(&self.matcher, gt_boxes, gt_labels, layer))
            .collect()
    }
}

fn check_layers(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(Error::LengthMismatch {
            what,
            expected,
            found,
        });
    }

    Ok(())
}

fn check_reference(reference: &Bbox<Yxyx>) -> Result<()> {
    let height = reference.ymax() - reference.ymin();
    let width = reference.xmax() - reference.xmin();
    // also rejects NaN
    if !(height > 0.0 && width > 0.0) {
        return Err(Error::InvalidReference { height, width });
    }

    Ok(())
}
