use ndarray::{Array3, Array4};

use crate::anchor::LayerAnchors;
use crate::bbox::{Bbox, Yxyx};
use crate::error::{Error, Result};

/// Overlap score of anchors that are mostly covered by an annotation marked as "do not learn".
pub const IGNORED_SCORE: f32 = -1.0;

/// Assigns a ground truth box to every anchor of a scale.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// Number of classes, including the background class `0`.
    pub num_classes: usize,
    /// Label of annotations that should neither be learned nor count as background.
    pub no_annotation_label: usize,
    /// Minimum IoU for an anchor to take the class of its best ground truth box.
    pub ignore_threshold: f32,
}

/// The ground truth assigned to every anchor of a scale.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerTargets {
    /// Class of every anchor, shape `(rows, cols, anchors)`.
    pub labels: Array3<usize>,
    /// Matched ground truth box of every anchor, shape `(rows, cols, anchors, 4)`.
    pub boxes: Array4<f32>,
    /// IoU of every anchor with its matched box, shape `(rows, cols, anchors)`.
    ///
    /// Ignored anchors have a score of [`IGNORED_SCORE`].
    pub scores: Array3<f32>,
}

impl Matcher {
    #[must_use]
    pub fn new(num_classes: usize, no_annotation_label: usize, ignore_threshold: f32) -> Self {
        Self {
            num_classes,
            no_annotation_label,
            ignore_threshold,
        }
    }

    fn is_ignored(&self, label: usize) -> bool {
        label == self.no_annotation_label || label >= self.num_classes
    }

    /// Match the ground truth of a single image against the anchors of a scale.
    ///
    /// Every anchor takes the ground truth box with the highest IoU, the first one wins ties.
    /// Anchors whose best IoU is below the ignore threshold are labelled as background but keep
    /// their IoU as score, so the loss can mine hard negatives among them.
    ///
    /// Annotations with the `no_annotation_label` (or any label outside of the known classes) are
    /// never matched. Instead, anchors covered by such an annotation for more than the ignore
    /// threshold of their area are excluded from training, with a score of [`IGNORED_SCORE`].
    pub fn assign(
        &self,
        gt_boxes: &[Bbox<Yxyx>],
        gt_labels: &[usize],
        anchors: &LayerAnchors,
    ) -> Result<LayerTargets> {
        if gt_boxes.len() != gt_labels.len() {
            return Err(Error::LengthMismatch {
                what: "ground truth labels",
                expected: gt_boxes.len(),
                found: gt_labels.len(),
            });
        }

        let (rows, cols, per_cell) = anchors.grid_shape();
        let mut labels = Array3::zeros((rows, cols, per_cell));
        let mut boxes = Array4::zeros((rows, cols, per_cell, 4));
        let mut scores = Array3::zeros((rows, cols, per_cell));

        let (candidates, ignored): (Vec<_>, Vec<_>) = gt_boxes
            .iter()
            .zip(gt_labels)
            .partition(|(_, label)| !self.is_ignored(**label));

        let unit: [f32; 4] = Bbox::unit().into();
        let mut excluded = 0;

        for row in 0..rows {
            for col in 0..cols {
                for k in 0..per_cell {
                    let anchor = anchors.anchor(row, col, k);

                    let mut best: Option<(f32, &Bbox<Yxyx>, usize)> = None;
                    for &(gt_box, &label) in &candidates {
                        let iou = anchor.iou(gt_box);
                        if iou > best.map_or(0.0, |(score, _, _)| score) {
                            best = Some((iou, gt_box, label));
                        }
                    }

                    let (score, matched, label) = match best {
                        Some((iou, gt_box, label)) if iou >= self.ignore_threshold => {
                            (iou, <[f32; 4]>::from(*gt_box), label)
                        }
                        Some((iou, gt_box, _)) => (iou, <[f32; 4]>::from(*gt_box), 0),
                        None => (0.0, unit, 0),
                    };

                    let covered = ignored
                        .iter()
                        .any(|(gt_box, _)| anchor.coverage_by(*gt_box) > self.ignore_threshold);

                    if covered {
                        excluded += 1;
                        labels[[row, col, k]] = 0;
                        scores[[row, col, k]] = IGNORED_SCORE;
                    } else {
                        labels[[row, col, k]] = label;
                        scores[[row, col, k]] = score;
                    }

                    for (axis, value) in matched.into_iter().enumerate() {
                        boxes[[row, col, k, axis]] = value;
                    }
                }
            }
        }

        tracing::trace!(
            anchors = anchors.num_anchors(),
            positives = labels.iter().filter(|&&label| label != 0).count(),
            excluded,
            "matched ground truth to anchors"
        );

        Ok(LayerTargets {
            labels,
            boxes,
            scores,
        })
    }
}

/// The anchor masks consumed by the SSD loss.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingMasks {
    /// Anchors that contribute to the classification and localisation loss.
    pub positive: Array3<bool>,
    /// Anchors that may be mined as hard negatives.
    pub negative: Array3<bool>,
}

impl TrainingMasks {
    /// Derive the masks from the overlap scores of a scale.
    ///
    /// Ignored anchors are part of neither mask.
    #[must_use]
    pub fn new(scores: &Array3<f32>, match_threshold: f32) -> Self {
        let positive = scores.mapv(|score| score > match_threshold);
        let negative = ndarray::Zip::from(&positive)
            .and(scores)
            .map_collect(|&positive, &score| !positive && score > IGNORED_SCORE / 2.0);

        Self { positive, negative }
    }

    #[must_use]
    pub fn num_positives(&self) -> usize {
        self.positive.iter().filter(|&&p| p).count()
    }
}
