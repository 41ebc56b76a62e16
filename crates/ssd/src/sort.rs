use rayon::prelude::*;

use crate::select::Candidate;

/// Sort candidates by descending score and keep the `top_k` best.
///
/// The sort is stable, so candidates with equal scores keep their selection order.
pub fn sort_candidates(mut candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(top_k);
    candidates
}

/// Sort the candidates of every image of a batch independently.
pub fn sort_batch(batch: Vec<Vec<Candidate>>, top_k: usize) -> Vec<Vec<Candidate>> {
    batch
        .into_par_iter()
        .map(|candidates| sort_candidates(candidates, top_k))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bbox::Bbox;

    fn candidate(class_id: usize, score: f32) -> Candidate {
        Candidate {
            class_id,
            score,
            bbox: Bbox::yxyx(0.0, 0.0, 1.0, 1.0),
        }
    }

    #[test]
    fn descending_and_truncated() {
        let candidates = vec![
            candidate(1, 0.3),
            candidate(2, 0.9),
            candidate(3, 0.5),
            candidate(4, 0.7),
        ];

        let sorted = sort_candidates(candidates, 3);

        let scores = sorted.iter().map(|c| c.score).collect::<Vec<_>>();
        assert_eq!(scores, vec![0.9, 0.7, 0.5]);
        assert!(sorted.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn equal_scores_keep_their_order() {
        let candidates = vec![candidate(1, 0.5), candidate(2, 0.8), candidate(3, 0.5)];

        let sorted = sort_candidates(candidates, 10);

        let classes = sorted.iter().map(|c| c.class_id).collect::<Vec<_>>();
        assert_eq!(classes, vec![2, 1, 3]);
    }

    #[test]
    fn short_lists_are_not_padded() {
        assert!(sort_candidates(Vec::new(), 400).is_empty());
        assert_eq!(sort_candidates(vec![candidate(1, 0.1)], 400).len(), 1);
        assert!(sort_candidates(vec![candidate(1, 0.1)], 0).is_empty());
    }

    #[test]
    fn batches_are_sorted_independently() {
        let batch = vec![
            vec![candidate(1, 0.2), candidate(1, 0.4)],
            Vec::new(),
            vec![candidate(2, 0.6), candidate(2, 0.1), candidate(2, 0.9)],
        ];

        let sorted = sort_batch(batch, 2);

        assert_eq!(sorted.len(), 3);
        assert_eq!(sorted[0].iter().map(|c| c.score).collect::<Vec<_>>(), vec![0.4, 0.2]);
        assert!(sorted[1].is_empty());
        assert_eq!(sorted[2].iter().map(|c| c.score).collect::<Vec<_>>(), vec![0.9, 0.6]);
    }
}
