use ndarray::{Array3, Array4, Array5, ArrayView3, ArrayView4, ArrayView5, Axis, stack};

use crate::anchor::LayerAnchors;
use crate::bbox::{Bbox, Cyxhw, Yxyx};
use crate::config::PriorScaling;
use crate::error::{Error, Result};
use crate::matcher::{LayerTargets, Matcher};

/// Utility that encodes boxes relative to anchors, and decodes the regression output of the
/// model back into boxes.
///
/// Offsets are stored along the last axis as `[x, y, w, h]`: the center offsets are relative to
/// the anchor size, the size offsets are log-ratios, and all of them are divided by the
/// matching [`PriorScaling`] constant.
#[derive(Debug, Clone)]
pub struct BoxCoder {
    /// The scaling applied to the encoded offsets.
    pub prior_scaling: PriorScaling,
    /// The upper bound of the log-size term, before applying the exponent.
    /// This is used to avoid overflow in the exponent.
    pub bbox_xform_clip: f32,
}

/// The training targets of a single feature-map scale.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedLayer {
    /// Class of every anchor, shape `(rows, cols, anchors)`.
    pub labels: Array3<usize>,
    /// Encoded offsets of every anchor, shape `(rows, cols, anchors, 4)`.
    pub localizations: Array4<f32>,
    /// Overlap of every anchor with its ground truth box, shape `(rows, cols, anchors)`.
    pub scores: Array3<f32>,
}

impl BoxCoder {
    /// Create a new [`BoxCoder`] with the given prior scaling.
    ///
    /// This will default to a `bbox_xform_clip` of `ln(1000/16)`.
    #[must_use]
    pub fn new(prior_scaling: PriorScaling) -> Self {
        Self::new_with_clip(prior_scaling, (1000.0_f32 / 16.0).ln())
    }

    /// Create a new [`BoxCoder`] with the given prior scaling and clipping value.
    #[must_use]
    pub fn new_with_clip(prior_scaling: PriorScaling, bbox_xform_clip: f32) -> Self {
        BoxCoder {
            prior_scaling,
            bbox_xform_clip: bbox_xform_clip.abs(),
        }
    }

    /// Decode the offsets of a single scale into boxes.
    ///
    /// `offsets` has shape `(rows, cols, anchors, 4)`, the returned boxes have the same shape
    /// with `[ymin, xmin, ymax, xmax]` along the last axis.
    pub fn decode(&self, offsets: ArrayView4<f32>, anchors: &LayerAnchors) -> Result<Array4<f32>> {
        if let Some(index) = anchors.find_degenerate() {
            return Err(Error::DegenerateAnchor { index });
        }

        let (rows, cols, per_cell) = anchors.grid_shape();
        check_shape("localisations", &[rows, cols, per_cell, 4], offsets.shape())?;

        let ps = self.prior_scaling;
        let ox = offsets.index_axis(Axis(3), 0);
        let oy = offsets.index_axis(Axis(3), 1);
        let ow = offsets.index_axis(Axis(3), 2);
        let oh = offsets.index_axis(Axis(3), 3);

        let center_x = &anchors.center_x + &(&ox * &anchors.widths * ps.x());
        let center_y = &anchors.center_y + &(&oy * &anchors.heights * ps.y());

        // clamp to avoid overflow in exp
        let mut clamped = 0;
        let width = self.guarded_exp(&ow, ps.w(), &mut clamped) * &anchors.widths;
        let height = self.guarded_exp(&oh, ps.h(), &mut clamped) * &anchors.heights;

        if clamped > 0 {
            tracing::debug!(clamped, "clamped box size offsets before decoding");
        }

        let half_height = height / 2.0;
        let half_width = width / 2.0;

        let ymin = &center_y - &half_height;
        let xmin = &center_x - &half_width;
        let ymax = &center_y + &half_height;
        let xmax = &center_x + &half_width;

        Ok(stack(
            Axis(3),
            &[ymin.view(), xmin.view(), ymax.view(), xmax.view()],
        )?)
    }

    /// Decode the offsets of a single scale for every image of a batch.
    ///
    /// `offsets` has shape `(batch, rows, cols, anchors, 4)`.
    pub fn decode_batch(
        &self,
        offsets: ArrayView5<f32>,
        anchors: &LayerAnchors,
    ) -> Result<Array5<f32>> {
        let decoded = offsets
            .axis_iter(Axis(0))
            .map(|image| self.decode(image, anchors))
            .collect::<Result<Vec<_>>>()?;

        if decoded.is_empty() {
            let (rows, cols, per_cell) = anchors.grid_shape();
            return Ok(Array5::zeros((0, rows, cols, per_cell, 4)));
        }

        let views = decoded.iter().map(|image| image.view()).collect::<Vec<_>>();
        Ok(stack(Axis(0), &views)?)
    }

    /// Decode a single offset vector relative to `anchor`.
    #[must_use]
    pub fn decode_box(&self, offsets: [f32; 4], anchor: &Bbox<Cyxhw>) -> Bbox<Yxyx> {
        let ps = self.prior_scaling;
        let (acy, acx, ah, aw) = anchor.inner;
        let [ox, oy, ow, oh] = offsets;

        let clip = self.bbox_xform_clip;
        let cx = acx + ox * aw * ps.x();
        let cy = acy + oy * ah * ps.y();
        let w = aw * (ow * ps.w()).min(clip).exp();
        let h = ah * (oh * ps.h()).min(clip).exp();

        Bbox::yxyx(cy - h / 2.0, cx - w / 2.0, cy + h / 2.0, cx + w / 2.0)
    }

    /// Encode `bbox` as offsets relative to `anchor`.
    #[must_use]
    pub fn encode_box(&self, bbox: &Bbox<Yxyx>, anchor: &Bbox<Cyxhw>) -> [f32; 4] {
        let ps = self.prior_scaling;
        let (acy, acx, ah, aw) = anchor.inner;
        let (ymin, xmin, ymax, xmax) = bbox.inner;

        let cy = (ymin + ymax) / 2.0;
        let cx = (xmin + xmax) / 2.0;
        let h = (ymax - ymin).max(f32::EPSILON);
        let w = (xmax - xmin).max(f32::EPSILON);

        [
            (cx - acx) / aw / ps.x(),
            (cy - acy) / ah / ps.y(),
            (w / aw).ln() / ps.w(),
            (h / ah).ln() / ps.h(),
        ]
    }

    /// Encode the boxes matched to every anchor of a single scale.
    ///
    /// `matched` has shape `(rows, cols, anchors, 4)` with `[ymin, xmin, ymax, xmax]` along the
    /// last axis, as produced by [`Matcher::assign`].
    pub fn encode_matched(
        &self,
        matched: ArrayView4<f32>,
        anchors: &LayerAnchors,
    ) -> Result<Array4<f32>> {
        if let Some(index) = anchors.find_degenerate() {
            return Err(Error::DegenerateAnchor { index });
        }

        let (rows, cols, per_cell) = anchors.grid_shape();
        check_shape("matched boxes", &[rows, cols, per_cell, 4], matched.shape())?;

        let ps = self.prior_scaling;
        let ymin = matched.index_axis(Axis(3), 0);
        let xmin = matched.index_axis(Axis(3), 1);
        let ymax = matched.index_axis(Axis(3), 2);
        let xmax = matched.index_axis(Axis(3), 3);

        let center_y = (&ymin + &ymax) / 2.0;
        let center_x = (&xmin + &xmax) / 2.0;
        // a box without size would encode to an infinite log-ratio
        let height = (&ymax - &ymin).mapv(|h| h.max(f32::EPSILON));
        let width = (&xmax - &xmin).mapv(|w| w.max(f32::EPSILON));

        let ox = (center_x - &anchors.center_x) / &(&anchors.widths * ps.x());
        let oy = (center_y - &anchors.center_y) / &(&anchors.heights * ps.y());
        let ow = (width / &anchors.widths).mapv(f32::ln) / ps.w();
        let oh = (height / &anchors.heights).mapv(f32::ln) / ps.h();

        Ok(stack(
            Axis(3),
            &[ox.view(), oy.view(), ow.view(), oh.view()],
        )?)
    }

    /// Build the training targets of a single scale from the ground truth of one image.
    pub fn encode(
        &self,
        matcher: &Matcher,
        gt_boxes: &[Bbox<Yxyx>],
        gt_labels: &[usize],
        anchors: &LayerAnchors,
    ) -> Result<EncodedLayer> {
        let LayerTargets {
            labels,
            boxes,
            scores,
        } = matcher.assign(gt_boxes, gt_labels, anchors)?;

        let localizations = self.encode_matched(boxes.view(), anchors)?;

        Ok(EncodedLayer {
            labels,
            localizations,
            scores,
        })
    }

    fn guarded_exp(
        &self,
        offsets: &ArrayView3<f32>,
        scaling: f32,
        clamped: &mut usize,
    ) -> Array3<f32> {
        let clip = self.bbox_xform_clip;
        offsets.mapv(|offset| {
            let value = offset * scaling;
            // only growth can overflow, shrinking saturates at zero
            if value > clip {
                *clamped += 1;
                return clip.exp();
            }

            value.exp()
        })
    }
}

fn check_shape(what: &'static str, expected: &[usize], found: &[usize]) -> Result<()> {
    if expected != found {
        return Err(Error::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            found: found.to_vec(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{Array3, Array4, Array5, arr1};

    use super::*;
    use crate::anchor::generate_layer;
    use crate::bbox::ConvertBbox;
    use crate::config::ScaleConfig;

    fn anchors() -> LayerAnchors {
        let scale = ScaleConfig {
            feat_shape: (4, 4),
            sizes: vec![296.96, 378.88],
            ratios: vec![2.0, 0.5],
            step: 128,
            offset: 0.5,
        };
        generate_layer((512, 512), &scale).unwrap()
    }

    #[test]
    fn zero_offsets_decode_to_anchors() {
        let anchors = anchors();
        let coder = BoxCoder::new(PriorScaling::default());

        let decoded = coder
            .decode(Array4::zeros((4, 4, 4, 4)).view(), &anchors)
            .unwrap();

        for (i, anchor) in anchors.iter().enumerate() {
            let (row, col, k) = (i / 16, (i / 4) % 4, i % 4);
            let expected: Bbox<Yxyx> = anchor.convert();
            for (axis, value) in <[f32; 4]>::from(expected).into_iter().enumerate() {
                assert_relative_eq!(decoded[[row, col, k, axis]], value, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn encode_then_decode_recovers_box() {
        let anchors = anchors();
        let coder = BoxCoder::new(PriorScaling::default());

        let boxes = [
            Bbox::yxyx(0.1, 0.2, 0.4, 0.9),
            Bbox::yxyx(0.0, 0.0, 1.0, 1.0),
            Bbox::yxyx(0.45, 0.5, 0.46, 0.52),
            Bbox::yxyx(-0.2, 0.7, 0.3, 1.1),
        ];

        for anchor in anchors.iter() {
            for bbox in &boxes {
                let offsets = coder.encode_box(bbox, &anchor);
                let decoded = coder.decode_box(offsets, &anchor);

                assert_relative_eq!(decoded.ymin(), bbox.ymin(), epsilon = 1e-5);
                assert_relative_eq!(decoded.xmin(), bbox.xmin(), epsilon = 1e-5);
                assert_relative_eq!(decoded.ymax(), bbox.ymax(), epsilon = 1e-5);
                assert_relative_eq!(decoded.xmax(), bbox.xmax(), epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn layer_and_single_box_agree() {
        let anchors = anchors();
        let coder = BoxCoder::new(PriorScaling::default());

        let offsets = Array4::from_shape_fn((4, 4, 4, 4), |(r, c, k, i)| {
            ((r * 64 + c * 16 + k * 4 + i) as f32 * 0.37).sin()
        });
        let decoded = coder.decode(offsets.view(), &anchors).unwrap();

        let matched = decoded.clone();
        let encoded = coder.encode_matched(matched.view(), &anchors).unwrap();

        for r in 0..4 {
            for c in 0..4 {
                for k in 0..4 {
                    let anchor = anchors.anchor(r, c, k);
                    let single = offsets.slice(ndarray::s![r, c, k, ..]).to_vec();
                    let bbox =
                        coder.decode_box([single[0], single[1], single[2], single[3]], &anchor);

                    assert_relative_eq!(decoded[[r, c, k, 0]], bbox.ymin(), epsilon = 1e-6);
                    assert_relative_eq!(decoded[[r, c, k, 3]], bbox.xmax(), epsilon = 1e-6);

                    for i in 0..4 {
                        assert_relative_eq!(
                            encoded[[r, c, k, i]],
                            offsets[[r, c, k, i]],
                            epsilon = 1e-4
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn huge_offsets_are_clamped() {
        let anchors = anchors();
        let coder = BoxCoder::new(PriorScaling::default());

        let mut offsets = Array4::zeros((4, 4, 4, 4));
        offsets[[0, 0, 0, 2]] = 1e6;
        offsets[[0, 0, 0, 3]] = -1e6;

        let decoded = coder.decode(offsets.view(), &anchors).unwrap();
        assert!(decoded.iter().all(|v| v.is_finite()));

        let width = decoded[[0, 0, 0, 3]] - decoded[[0, 0, 0, 1]];
        let height = decoded[[0, 0, 0, 2]] - decoded[[0, 0, 0, 0]];
        assert_relative_eq!(width, anchors.widths[0] * 62.5, epsilon = 1e-3);
        // shrinking is never clamped
        assert_relative_eq!(height, 0.0, epsilon = 1e-6);

        let anchor = anchors.anchor(0, 0, 0);
        let single = coder.decode_box([0.0, 0.0, 1e6, -1e6], &anchor);
        assert_relative_eq!(single.xmax() - single.xmin(), width, epsilon = 1e-3);
        assert_relative_eq!(single.ymax() - single.ymin(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn small_boxes_on_large_anchors_survive_decoding() {
        let coder = BoxCoder::new(PriorScaling::default());
        let anchor = Bbox::cyxhw(0.5, 0.5, 0.82, 0.41);
        let bbox = Bbox::yxyx(0.45, 0.5, 0.46, 0.52);

        // ln(0.01 / 0.82) lies below -ln(1000 / 16)
        let offsets = coder.encode_box(&bbox, &anchor);
        assert!(offsets[3] * PriorScaling::default().h() < -(1000.0_f32 / 16.0).ln());

        let decoded = coder.decode_box(offsets, &anchor);
        assert_relative_eq!(decoded.ymin(), 0.45, epsilon = 1e-5);
        assert_relative_eq!(decoded.xmin(), 0.5, epsilon = 1e-5);
        assert_relative_eq!(decoded.ymax(), 0.46, epsilon = 1e-5);
        assert_relative_eq!(decoded.xmax(), 0.52, epsilon = 1e-5);

        let layer = LayerAnchors {
            center_y: Array3::from_elem((1, 1, 1), 0.5),
            center_x: Array3::from_elem((1, 1, 1), 0.5),
            heights: arr1(&[0.82]),
            widths: arr1(&[0.41]),
        };
        let offsets = Array4::from_shape_vec((1, 1, 1, 4), offsets.to_vec()).unwrap();
        let decoded = coder.decode(offsets.view(), &layer).unwrap();
        assert_relative_eq!(decoded[[0, 0, 0, 0]], 0.45, epsilon = 1e-5);
        assert_relative_eq!(decoded[[0, 0, 0, 2]], 0.46, epsilon = 1e-5);
    }

    #[test]
    fn batch_decoding_and_shape_checks() {
        let anchors = anchors();
        let coder = BoxCoder::new(PriorScaling::default());

        let decoded = coder
            .decode_batch(Array5::zeros((3, 4, 4, 4, 4)).view(), &anchors)
            .unwrap();
        assert_eq!(decoded.dim(), (3, 4, 4, 4, 4));

        let empty = coder
            .decode_batch(Array5::zeros((0, 4, 4, 4, 4)).view(), &anchors)
            .unwrap();
        assert_eq!(empty.dim(), (0, 4, 4, 4, 4));

        assert!(matches!(
            coder.decode(Array4::zeros((4, 4, 6, 4)).view(), &anchors),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn degenerate_anchors_cannot_be_encoded() {
        let mut anchors = anchors();
        anchors.widths[2] = 0.0;

        let coder = BoxCoder::new(PriorScaling::default());
        assert!(matches!(
            coder.encode_matched(Array4::zeros((4, 4, 4, 4)).view(), &anchors),
            Err(Error::DegenerateAnchor { index: 2 })
        ));
    }

    #[test]
    fn degenerate_anchors_cannot_be_decoded() {
        let coder = BoxCoder::new(PriorScaling::default());
        let offsets = Array4::zeros((4, 4, 4, 4));

        let mut anchors = anchors();
        anchors.heights[1] = 0.0;
        assert!(matches!(
            coder.decode(offsets.view(), &anchors),
            Err(Error::DegenerateAnchor { index: 1 })
        ));

        let point = LayerAnchors {
            center_y: Array3::from_elem((1, 1, 1), 0.5),
            center_x: Array3::from_elem((1, 1, 1), 0.5),
            heights: arr1(&[0.0]),
            widths: arr1(&[0.0]),
        };
        assert!(matches!(
            coder.decode_batch(Array5::zeros((2, 1, 1, 1, 4)).view(), &point),
            Err(Error::DegenerateAnchor { index: 0 })
        ));
    }
}
