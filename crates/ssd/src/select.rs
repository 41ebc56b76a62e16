use ndarray::{ArrayView1, ArrayView4, ArrayView5, Axis};
use rayon::prelude::*;

use crate::bbox::{Bbox, Yxyx};
use crate::error::{Error, Result};

/// A scored box, before or after suppression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub bbox: Bbox<Yxyx>,
}

/// Turns the class scores of every anchor into detection candidates.
#[derive(Debug, Clone)]
pub struct Selector {
    /// Minimum score of a non-background class.
    ///
    /// Without a threshold an anchor is a candidate whenever its best class is not the
    /// background.
    pub threshold: Option<f32>,
    pub num_classes: usize,
}

impl Selector {
    #[must_use]
    pub fn new(threshold: Option<f32>, num_classes: usize) -> Self {
        Self {
            threshold,
            num_classes,
        }
    }

    /// Select the candidates of a single scale of a single image.
    ///
    /// `scores` has shape `(rows, cols, anchors, classes)` and `boxes` has shape
    /// `(rows, cols, anchors, 4)`. Candidates are returned in row-major anchor order.
    pub fn select_layer(
        &self,
        scores: ArrayView4<f32>,
        boxes: ArrayView4<f32>,
    ) -> Result<Vec<Candidate>> {
        let (rows, cols, per_cell, classes) = scores.dim();
        if classes != self.num_classes {
            return Err(Error::ShapeMismatch {
                what: "predictions",
                expected: vec![rows, cols, per_cell, self.num_classes],
                found: scores.shape().to_vec(),
            });
        }
        if boxes.dim() != (rows, cols, per_cell, 4) {
            return Err(Error::ShapeMismatch {
                what: "boxes",
                expected: vec![rows, cols, per_cell, 4],
                found: boxes.shape().to_vec(),
            });
        }

        let candidates = scores
            .lanes(Axis(3))
            .into_iter()
            .zip(boxes.lanes(Axis(3)))
            .filter_map(|(scores, bbox)| {
                let (class_id, score) = self.best_class(scores)?;
                Some(Candidate {
                    class_id,
                    score,
                    bbox: Bbox::yxyx(bbox[0], bbox[1], bbox[2], bbox[3]),
                })
            })
            .collect();

        Ok(candidates)
    }

    /// Select the candidates of every scale of a single image, flattened in scale order.
    pub fn select(
        &self,
        scores: &[ArrayView4<f32>],
        boxes: &[ArrayView4<f32>],
    ) -> Result<Vec<Candidate>> {
        check_layers(scores.len(), boxes.len())?;

        let mut candidates = Vec::new();
        for (scores, boxes) in scores.iter().zip(boxes) {
            candidates.extend(self.select_layer(scores.view(), boxes.view())?);
        }

        Ok(candidates)
    }

    /// Select the candidates of every image of a batch.
    ///
    /// Every scale has a leading batch axis, images are processed in parallel.
    pub fn select_batch(
        &self,
        scores: &[ArrayView5<f32>],
        boxes: &[ArrayView5<f32>],
    ) -> Result<Vec<Vec<Candidate>>> {
        check_layers(scores.len(), boxes.len())?;
        // the score and box views may borrow from different owners
        let batch = batch_size(
            scores
                .iter()
                .map(|layer| layer.len_of(Axis(0)))
                .chain(boxes.iter().map(|layer| layer.len_of(Axis(0)))),
        )?;

        let selected = (0..batch)
            .into_par_iter()
            .map(|image| {
                let scores = scores
                    .iter()
                    .map(|layer| layer.index_axis(Axis(0), image))
                    .collect::<Vec<_>>();
                let boxes = boxes
                    .iter()
                    .map(|layer| layer.index_axis(Axis(0), image))
                    .collect::<Vec<_>>();

                self.select(&scores, &boxes)
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::trace!(
            candidates = selected.iter().map(Vec::len).sum::<usize>(),
            batch,
            "selected candidates"
        );

        Ok(selected)
    }

    fn best_class(&self, scores: ArrayView1<f32>) -> Option<(usize, f32)> {
        match self.threshold {
            Some(threshold) => {
                let (class_id, score) = arg_max(scores, 1)?;
                (score >= threshold).then_some((class_id, score))
            }
            None => {
                let (class_id, score) = arg_max(scores, 0)?;
                (class_id != 0).then_some((class_id, score))
            }
        }
    }
}

/// Index and value of the largest score from `start` on, the lowest index wins ties.
fn arg_max(scores: ArrayView1<f32>, start: usize) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .skip(start)
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best, (index, score)| match best {
            Some((_, best_score)) if score <= best_score => best,
            _ => Some((index, score)),
        })
}

fn check_layers(scores: usize, boxes: usize) -> Result<()> {
    if scores != boxes {
        return Err(Error::LengthMismatch {
            what: "box layers",
            expected: scores,
            found: boxes,
        });
    }

    Ok(())
}

/// The shared batch size of a set of batched tensors, given the length of their batch axis.
pub(crate) fn batch_size(lengths: impl IntoIterator<Item = usize>) -> Result<usize> {
    let mut batch = None;
    for size in lengths {
        match batch {
            Some(expected) if expected != size => {
                return Err(Error::ShapeMismatch {
                    what: "batch",
                    expected: vec![expected],
                    found: vec![size],
                });
            }
            _ => batch = Some(size),
        }
    }

    Ok(batch.unwrap_or(0))
}
