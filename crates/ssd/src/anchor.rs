use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::{Array, Array1, Array2, Array3, Axis};

use crate::bbox::{Bbox, ConvertBbox, Cyxhw, Yxyx};
use crate::config::ScaleConfig;
use crate::error::{Error, Result};
use crate::meshgrid::meshgrid;

/// The anchors of a single feature-map scale.
///
/// The anchors are stored as four parallel arrays that broadcast against each other: the
/// centers are shared by every anchor of a cell, and the sizes are shared by every cell. The
/// anchor `k` of cell `(row, col)` is centered on `(center_y[[row, col, 0]],
/// center_x[[row, col, 0]])` with size `(heights[k], widths[k])`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerAnchors {
    /// Relative center y of every cell, shape `(rows, cols, 1)`.
    pub center_y: Array3<f32>,
    /// Relative center x of every cell, shape `(rows, cols, 1)`.
    pub center_x: Array3<f32>,
    /// Relative height of every anchor in a cell, shape `(anchors_per_cell,)`.
    pub heights: Array1<f32>,
    /// Relative width of every anchor in a cell, shape `(anchors_per_cell,)`.
    pub widths: Array1<f32>,
}

impl LayerAnchors {
    /// Shape of the feature map, `(rows, cols)`.
    #[must_use]
    pub fn feat_shape(&self) -> (usize, usize) {
        let (rows, cols, _) = self.center_y.dim();
        (rows, cols)
    }

    #[must_use]
    pub fn anchors_per_cell(&self) -> usize {
        self.heights.len()
    }

    /// Total number of anchors of this scale.
    #[must_use]
    pub fn num_anchors(&self) -> usize {
        let (rows, cols) = self.feat_shape();
        rows * cols * self.anchors_per_cell()
    }

    /// Shape of a per-anchor tensor of this scale, `(rows, cols, anchors_per_cell)`.
    #[must_use]
    pub fn grid_shape(&self) -> (usize, usize, usize) {
        let (rows, cols) = self.feat_shape();
        (rows, cols, self.anchors_per_cell())
    }

    /// The anchor `k` of cell `(row, col)`.
    #[must_use]
    pub fn anchor(&self, row: usize, col: usize, k: usize) -> Bbox<Cyxhw> {
        Bbox::cyxhw(
            self.center_y[[row, col, 0]],
            self.center_x[[row, col, 0]],
            self.heights[k],
            self.widths[k],
        )
    }

    /// Iterate over all anchors, in `(row, col, k)` order.
    pub fn iter(&self) -> impl Iterator<Item = Bbox<Cyxhw>> + '_ {
        let (rows, cols, per_cell) = self.grid_shape();
        (0..rows).flat_map(move |row| {
            (0..cols).flat_map(move |col| (0..per_cell).map(move |k| self.anchor(row, col, k)))
        })
    }

    /// All anchors as a `(num_anchors, 4)` array of `[ymin, xmin, ymax, xmax]` rows.
    #[must_use]
    pub fn to_boxes(&self) -> Array2<f32> {
        let mut boxes = Array2::zeros((self.num_anchors(), 4));
        for (mut row, anchor) in boxes.axis_iter_mut(Axis(0)).zip(self.iter()) {
            let yxyx: Bbox<Yxyx> = anchor.convert();
            let (ymin, xmin, ymax, xmax) = yxyx.inner;
            row.assign(&ndarray::arr1(&[ymin, xmin, ymax, xmax]));
        }

        boxes
    }

    /// Index of the first anchor without area, if any.
    #[must_use]
    pub fn find_degenerate(&self) -> Option<usize> {
        self.heights
            .iter()
            .zip(&self.widths)
            .position(|(&h, &w)| !(h > 0.0 && w > 0.0))
    }
}

/// Compute the anchors of a single feature-map scale.
///
/// The center of cell `(r, c)` is at `((r + offset) * step / H, (c + offset) * step / W)`.
/// This uses the stride of the feature map rather than its shape, so the grid does not
/// necessarily span the image exactly when pooling rounded the feature map size.
///
/// The anchors of every cell are, in order:
/// - a square anchor of `sizes[0]`,
/// - if there is a second size, a square anchor of `sqrt(sizes[0] * sizes[1])`,
/// - for every ratio `r`, an anchor of height `sizes[0] / sqrt(r)` and width
///   `sizes[0] * sqrt(r)`.
pub fn generate_layer(img_shape: (usize, usize), scale: &ScaleConfig) -> Result<LayerAnchors> {
    check_img_shape(img_shape)?;
    scale.validate(0)?;

    let (img_height, img_width) = img_shape;
    let (rows, cols) = scale.feat_shape;
    let step = scale.step as f32;

    let ys = (Array::range(0.0, rows as f32, 1.0) + scale.offset) * step / img_height as f32;
    let xs = (Array::range(0.0, cols as f32, 1.0) + scale.offset) * step / img_width as f32;

    let mut grids = meshgrid(&[ys, xs])?.into_iter();
    let (Some(center_y), Some(center_x)) = (grids.next(), grids.next()) else {
        unreachable!("meshgrid returns one grid per input");
    };

    // the trailing axis broadcasts against the anchors of a cell
    let center_y = center_y.into_shape_with_order((rows, cols, 1))?;
    let center_x = center_x.into_shape_with_order((rows, cols, 1))?;

    let (img_height, img_width) = (img_height as f64, img_width as f64);
    let base = f64::from(scale.sizes[0]);

    let mut heights = Vec::with_capacity(scale.anchors_per_cell());
    let mut widths = Vec::with_capacity(scale.anchors_per_cell());

    heights.push(base / img_height);
    widths.push(base / img_width);

    if let Some(&next) = scale.sizes.get(1) {
        let size = (base * f64::from(next)).sqrt();
        heights.push(size / img_height);
        widths.push(size / img_width);
    }

    for &ratio in &scale.ratios {
        let sqrt_ratio = f64::from(ratio).sqrt();
        heights.push(base / img_height / sqrt_ratio);
        widths.push(base / img_width * sqrt_ratio);
    }

    tracing::trace!(
        rows,
        cols,
        anchors_per_cell = heights.len(),
        "generated anchors for scale"
    );

    Ok(LayerAnchors {
        center_y,
        center_x,
        heights: heights.into_iter().map(|h| h as f32).collect(),
        widths: widths.into_iter().map(|w| w as f32).collect(),
    })
}

/// Compute the anchors of every scale, in order.
pub fn generate_all(
    img_shape: (usize, usize),
    scales: &[ScaleConfig],
) -> Result<Vec<LayerAnchors>> {
    for (index, scale) in scales.iter().enumerate() {
        scale.validate(index)?;
    }

    let layers = scales
        .iter()
        .map(|scale| generate_layer(img_shape, scale))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        scales = layers.len(),
        anchors = layers.iter().map(LayerAnchors::num_anchors).sum::<usize>(),
        "generated anchors for {}x{} image",
        img_shape.0,
        img_shape.1
    );

    Ok(layers)
}

fn check_img_shape((height, width): (usize, usize)) -> Result<()> {
    if height == 0 || width == 0 {
        return Err(Error::NonPositive {
            what: "image shape",
            value: 0.0,
        });
    }

    if height != width {
        return Err(Error::NonSquareImage { height, width });
    }

    Ok(())
}

/// Compute absolute anchor sizes from relative size bounds.
///
/// The bounds are turned into integer percentages and split into `n_feat_layers - 2` equal
/// steps, and the first scale gets the fixed sizes `(0.04, 0.1)` of the image size. Every scale
/// gets two sizes, the second of which is the first size of the next scale.
pub fn size_bounds_to_values(
    size_bounds: (f32, f32),
    n_feat_layers: usize,
    img_shape: (usize, usize),
) -> Result<Vec<Vec<f32>>> {
    check_img_shape(img_shape)?;

    if n_feat_layers < 3 {
        return Err(Error::TooFewScales(n_feat_layers));
    }

    let img_size = img_shape.0 as f32;
    let min_ratio = (size_bounds.0 * 100.0).round() as i64;
    let max_ratio = (size_bounds.1 * 100.0).round() as i64;
    let step = (max_ratio - min_ratio) / (n_feat_layers as i64 - 2);

    if step <= 0 {
        return Err(Error::NonPositive {
            what: "size bound step",
            value: step as f64,
        });
    }

    let mut sizes = vec![vec![img_size * 0.04, img_size * 0.1]];
    for ratio in (min_ratio..=max_ratio).step_by(step as usize) {
        sizes.push(vec![
            img_size * ratio as f32 / 100.0,
            img_size * (ratio + step) as f32 / 100.0,
        ]);
    }

    Ok(sizes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    img_shape: (usize, usize),
    fingerprint: u64,
}

/// Memoizes the anchors of a set of scales per image shape.
///
/// Generation is deterministic, so two threads racing to populate the same key produce the
/// same anchors and only the first one is stored.
#[derive(Debug, Default)]
pub struct AnchorCache {
    layers: RwLock<HashMap<CacheKey, Arc<[LayerAnchors]>>>,
}

impl AnchorCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the anchors of `scales` for `img_shape`, generating them on the first request.
    pub fn get_or_generate(
        &self,
        img_shape: (usize, usize),
        scales: &[ScaleConfig],
    ) -> Result<Arc<[LayerAnchors]>> {
        let key = CacheKey {
            img_shape,
            fingerprint: fingerprint(scales),
        };

        if let Some(layers) = self
            .layers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(layers));
        }

        tracing::debug!("anchor cache miss for {}x{} image", img_shape.0, img_shape.1);
        let generated: Arc<[LayerAnchors]> = generate_all(img_shape, scales)?.into();

        let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(layers.entry(key).or_insert(generated)))
    }

    /// Number of cached anchor sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fingerprint(scales: &[ScaleConfig]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for scale in scales {
        scale.feat_shape.hash(&mut hasher);
        scale.step.hash(&mut hasher);
        scale.offset.to_bits().hash(&mut hasher);
        scale.sizes.len().hash(&mut hasher);
        for size in &scale.sizes {
            size.to_bits().hash(&mut hasher);
        }
        scale.ratios.len().hash(&mut hasher);
        for ratio in &scale.ratios {
            ratio.to_bits().hash(&mut hasher);
        }
    }

    hasher.finish()
}
