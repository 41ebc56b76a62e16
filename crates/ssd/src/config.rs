//! Configuration of the anchor layout and of the post-processing pipeline.
//!
//! Both configs can be loaded from TOML through [`ssd_config::Config`], and are checked with
//! their `validate` method before a [`Detector`](crate::Detector) is built from them.

use serde::{Deserialize, Serialize};
use ssd_config::Config;

use crate::error::{Error, Result};
use crate::nms::NmsMode;

/// Per-axis constants that rescale encoded box offsets, in `[y, x, h, w]` order.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PriorScaling(pub [f32; 4]);

impl PriorScaling {
    #[must_use]
    pub const fn y(&self) -> f32 {
        self.0[0]
    }

    #[must_use]
    pub const fn x(&self) -> f32 {
        self.0[1]
    }

    #[must_use]
    pub const fn h(&self) -> f32 {
        self.0[2]
    }

    #[must_use]
    pub const fn w(&self) -> f32 {
        self.0[3]
    }

    pub fn validate(&self) -> Result<()> {
        for value in self.0 {
            if !(value > 0.0) {
                return Err(Error::NonPositive {
                    what: "prior_scaling",
                    value: f64::from(value),
                });
            }
        }

        Ok(())
    }
}

impl Default for PriorScaling {
    fn default() -> Self {
        PriorScaling([0.1, 0.1, 0.2, 0.2])
    }
}

/// Anchor parameters of a single feature-map scale.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScaleConfig {
    /// Shape of the feature map, `(rows, cols)`.
    pub feat_shape: (usize, usize),
    /// One or two absolute box sizes in pixels.
    ///
    /// The first size gives a square anchor and is the base for every aspect ratio, the
    /// second one adds a square anchor with the geometric mean of both sizes.
    pub sizes: Vec<f32>,
    /// Aspect ratios (width / height), excluding `1.0`.
    pub ratios: Vec<f32>,
    /// Stride of the feature map in input pixels.
    pub step: u32,
    /// Offset of the anchor center within a cell, in cells.
    #[serde(default = "default_offset")]
    pub offset: f32,
}

const fn default_offset() -> f32 {
    0.5
}

impl ScaleConfig {
    /// Number of anchors generated for every cell of the feature map.
    #[must_use]
    pub fn anchors_per_cell(&self) -> usize {
        self.sizes.len() + self.ratios.len()
    }

    /// Check the parameters of the scale at index `scale`.
    pub fn validate(&self, scale: usize) -> Result<()> {
        match self.sizes.as_slice() {
            [] => return Err(Error::EmptySizes { scale }),
            [_] => {}
            [first, second] => {
                if second < first {
                    return Err(Error::DecreasingSizes {
                        scale,
                        first: *first,
                        second: *second,
                    });
                }
            }
            sizes => {
                return Err(Error::TooManySizes {
                    scale,
                    count: sizes.len(),
                })
            }
        }

        for &size in &self.sizes {
            if !(size > 0.0) {
                return Err(Error::NonPositive {
                    what: "anchor size",
                    value: f64::from(size),
                });
            }
        }

        for &ratio in &self.ratios {
            if !(ratio > 0.0) {
                return Err(Error::NonPositive {
                    what: "anchor ratio",
                    value: f64::from(ratio),
                });
            }
        }

        if self.step == 0 {
            return Err(Error::NonPositive {
                what: "anchor step",
                value: 0.0,
            });
        }

        if !(0.0..1.0).contains(&self.offset) {
            return Err(Error::InvalidOffset(self.offset));
        }

        if self.feat_shape.0 == 0 || self.feat_shape.1 == 0 {
            return Err(Error::NonPositive {
                what: "feature map shape",
                value: 0.0,
            });
        }

        Ok(())
    }
}

/// Parameters of the SSD network that determine the anchor layout and box encoding.
///
/// The per-scale lists (`feat_shapes`, `anchor_sizes`, `anchor_ratios`, `anchor_steps`) must
/// all have one entry per feature-map scale.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SsdConfig {
    /// Input shape of the network, `(height, width)`.
    pub img_shape: (usize, usize),
    /// Number of classes, including the background class `0`.
    pub num_classes: usize,
    /// Label of annotations that mark regions to ignore.
    pub no_annotation_label: usize,
    pub feat_shapes: Vec<(usize, usize)>,
    pub anchor_sizes: Vec<Vec<f32>>,
    pub anchor_ratios: Vec<Vec<f32>>,
    pub anchor_steps: Vec<u32>,
    pub anchor_offset: f32,
    pub prior_scaling: PriorScaling,
}

impl Config for SsdConfig {
    const PATH: &'static str = "ssd.toml";
}

impl Default for SsdConfig {
    /// The SSD-512 layout, with seven feature-map scales from 64x64 down to 1x1.
    fn default() -> Self {
        let wide = vec![2.0, 0.5, 3.0 / 5.0, 5.0 / 3.0];
        let all = vec![2.0, 0.5, 3.0, 1.0 / 3.0, 3.0 / 5.0, 5.0 / 3.0];

        SsdConfig {
            img_shape: (512, 512),
            num_classes: 11,
            no_annotation_label: 11,
            feat_shapes: vec![(64, 64), (32, 32), (16, 16), (8, 8), (4, 4), (2, 2), (1, 1)],
            anchor_sizes: vec![
                vec![20.48, 51.2],
                vec![51.2, 133.12],
                vec![133.12, 215.04],
                vec![215.04, 296.96],
                vec![296.96, 378.88],
                vec![378.88, 460.8],
                vec![460.8, 542.72],
            ],
            anchor_ratios: vec![
                wide.clone(),
                all.clone(),
                all.clone(),
                all.clone(),
                all,
                wide.clone(),
                wide,
            ],
            anchor_steps: vec![8, 16, 32, 64, 128, 256, 512],
            anchor_offset: 0.5,
            prior_scaling: PriorScaling::default(),
        }
    }
}

impl SsdConfig {
    /// Split the per-scale lists into one [`ScaleConfig`] per scale.
    pub fn scales(&self) -> Result<Vec<ScaleConfig>> {
        let expected = self.feat_shapes.len();
        check_len("anchor_sizes", expected, self.anchor_sizes.len())?;
        check_len("anchor_ratios", expected, self.anchor_ratios.len())?;
        check_len("anchor_steps", expected, self.anchor_steps.len())?;

        Ok(self
            .feat_shapes
            .iter()
            .zip(&self.anchor_sizes)
            .zip(&self.anchor_ratios)
            .zip(&self.anchor_steps)
            .map(|(((&feat_shape, sizes), ratios), &step)| ScaleConfig {
                feat_shape,
                sizes: sizes.clone(),
                ratios: ratios.clone(),
                step,
                offset: self.anchor_offset,
            })
            .collect())
    }

    pub fn validate(&self) -> Result<()> {
        let (height, width) = self.img_shape;
        if height == 0 || width == 0 {
            return Err(Error::NonPositive {
                what: "image shape",
                value: 0.0,
            });
        }

        if height != width {
            return Err(Error::NonSquareImage { height, width });
        }

        if self.num_classes == 0 {
            return Err(Error::NonPositive {
                what: "num_classes",
                value: 0.0,
            });
        }

        self.prior_scaling.validate()?;

        for (index, scale) in self.scales()?.iter().enumerate() {
            scale.validate(index)?;
        }

        Ok(())
    }
}

fn check_len(what: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(Error::LengthMismatch {
            what,
            expected,
            found,
        });
    }

    Ok(())
}

/// Parameters of the detection post-processing and target assignment.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct PostprocessConfig {
    /// Minimum class score for an anchor to become a candidate.
    ///
    /// If not set, every anchor whose best class is not the background becomes a candidate.
    pub select_threshold: Option<f32>,
    /// Candidates that overlap an accepted one by at least this IoU are suppressed.
    pub nms_threshold: f32,
    /// Number of candidates kept per image after sorting.
    pub top_k: usize,
    /// Number of detections kept per image after NMS.
    pub keep_top_k: usize,
    pub nms_mode: NmsMode,
    /// Minimum IoU for an anchor to be matched to a ground truth box.
    pub ignore_threshold: f32,
}

impl Config for PostprocessConfig {
    const PATH: &'static str = "postprocess.toml";
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        PostprocessConfig {
            select_threshold: None,
            nms_threshold: 0.45,
            top_k: 400,
            keep_top_k: 200,
            nms_mode: NmsMode::PerClass,
            ignore_threshold: 0.5,
        }
    }
}

impl PostprocessConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(threshold) = self.select_threshold {
            check_threshold("select_threshold", threshold)?;
        }
        check_threshold("nms_threshold", self.nms_threshold)?;
        check_threshold("ignore_threshold", self.ignore_threshold)?;

        Ok(())
    }
}

fn check_threshold(what: &'static str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::InvalidThreshold { what, value });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SsdConfig::default();
        config.validate().unwrap();

        let scales = config.scales().unwrap();
        assert_eq!(scales.len(), 7);
        assert_eq!(scales[0].anchors_per_cell(), 6);
        assert_eq!(scales[1].anchors_per_cell(), 8);
        assert_eq!(scales[6].step, 512);

        PostprocessConfig::default().validate().unwrap();
    }

    #[test]
    fn non_square_image_is_rejected() {
        let config = SsdConfig {
            img_shape: (512, 300),
            ..SsdConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(Error::NonSquareImage {
                height: 512,
                width: 300
            })
        ));
    }

    #[test]
    fn mismatched_scale_lists_are_rejected() {
        let mut config = SsdConfig::default();
        config.anchor_steps.pop();

        assert!(matches!(
            config.validate(),
            Err(Error::LengthMismatch {
                what: "anchor_steps",
                expected: 7,
                found: 6
            })
        ));
    }

    #[test]
    fn invalid_scales_are_rejected() {
        let scale = ScaleConfig {
            feat_shape: (4, 4),
            sizes: vec![296.96, 378.88],
            ratios: vec![2.0, 0.5],
            step: 128,
            offset: 0.5,
        };
        scale.validate(0).unwrap();

        let empty = ScaleConfig {
            sizes: Vec::new(),
            ..scale.clone()
        };
        assert!(matches!(empty.validate(3), Err(Error::EmptySizes { scale: 3 })));

        let decreasing = ScaleConfig {
            sizes: vec![378.88, 296.96],
            ..scale.clone()
        };
        assert!(matches!(
            decreasing.validate(0),
            Err(Error::DecreasingSizes { .. })
        ));

        let bad_ratio = ScaleConfig {
            ratios: vec![2.0, 0.0],
            ..scale.clone()
        };
        assert!(matches!(
            bad_ratio.validate(0),
            Err(Error::NonPositive {
                what: "anchor ratio",
                ..
            })
        ));

        let zero_step = ScaleConfig {
            step: 0,
            ..scale.clone()
        };
        assert!(matches!(
            zero_step.validate(0),
            Err(Error::NonPositive {
                what: "anchor step",
                ..
            })
        ));

        let bad_offset = ScaleConfig {
            offset: 1.0,
            ..scale
        };
        assert!(matches!(
            bad_offset.validate(0),
            Err(Error::InvalidOffset(_))
        ));
    }

    #[test]
    fn thresholds_are_checked() {
        let config = PostprocessConfig {
            nms_threshold: 1.5,
            ..PostprocessConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(Error::InvalidThreshold {
                what: "nms_threshold",
                ..
            })
        ));
    }
}
