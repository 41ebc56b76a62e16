use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::select::Candidate;

/// Which accepted boxes can suppress a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NmsMode {
    /// Only accepted boxes of the same class.
    #[default]
    PerClass,
    /// Every accepted box, regardless of its class.
    ClassAgnostic,
}

/// Applies Non-Maximum Suppression (NMS) to candidates sorted by descending score.
///
/// A candidate is accepted when its IoU with every accepted box it competes with is below
/// `threshold`. Suppression stops once `keep_top_k` candidates have been accepted.
///
/// Returns the indices of the accepted candidates, in order.
pub fn non_max_suppression(
    candidates: &[Candidate],
    threshold: f32,
    keep_top_k: usize,
    mode: NmsMode,
) -> Vec<usize> {
    let mut accepted: Vec<usize> = Vec::new();

    for (index, candidate) in candidates.iter().enumerate() {
        if accepted.len() >= keep_top_k {
            break;
        }

        let suppressed = accepted.iter().map(|&i| &candidates[i]).any(|kept| {
            let competes = match mode {
                NmsMode::PerClass => kept.class_id == candidate.class_id,
                NmsMode::ClassAgnostic => true,
            };

            competes && kept.bbox.iou(&candidate.bbox) >= threshold
        });

        if !suppressed {
            accepted.push(index);
        }
    }

    accepted
}

/// Suppress overlapping candidates, see [`non_max_suppression`].
pub fn nms(
    candidates: &[Candidate],
    threshold: f32,
    keep_top_k: usize,
    mode: NmsMode,
) -> Vec<Candidate> {
    non_max_suppression(candidates, threshold, keep_top_k, mode)
        .into_iter()
        .map(|i| candidates[i])
        .collect()
}

/// Suppress overlapping candidates of every image of a batch independently.
pub fn nms_batch(
    batch: &[Vec<Candidate>],
    threshold: f32,
    keep_top_k: usize,
    mode: NmsMode,
) -> Vec<Vec<Candidate>> {
    let kept = batch
        .par_iter()
        .map(|candidates| nms(candidates, threshold, keep_top_k, mode))
        .collect::<Vec<_>>();

    tracing::trace!(
        before = batch.iter().map(Vec::len).sum::<usize>(),
        after = kept.iter().map(Vec::len).sum::<usize>(),
        "suppressed overlapping candidates"
    );

    kept
}
