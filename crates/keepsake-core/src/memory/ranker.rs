//! Brute-force cosine ranking over stored memory vectors.
//!
//! The memory set is small (tens to low thousands), so every candidate is
//! scored on each turn. Ordering is deterministic: equal scores keep the
//! order in which candidates were supplied.

use serde::Serialize;
use tracing::warn;

use crate::types::{CoreError, MemoryId};

/// One ranked memory
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoredMemory {
    pub id: MemoryId,
    pub score: f32,
}

/// Outcome of a ranking pass
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    /// Best matches, highest score first, at most k long
    pub hits: Vec<ScoredMemory>,
    /// Candidates skipped because their length differs from the query's
    pub excluded: Vec<CoreError>,
}

impl Ranking {
    pub fn ids(&self) -> Vec<MemoryId> {
        self.hits.iter().map(|hit| hit.id).collect()
    }
}

/// Cosine similarity. A zero-magnitude side scores -1.0 so it sorts last.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b = b.iter().map(|y| y * y).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return -1.0;
    }
    dot / (mag_a * mag_b)
}

/// Score every candidate against `query` and keep the top `k`
pub fn rank<'a, I>(query: &[f32], candidates: I, k: usize) -> Ranking
where
    I: IntoIterator<Item = (MemoryId, &'a [f32])>,
{
    let mut ranking = Ranking::default();
    let mut scored = Vec::new();

    for (id, vector) in candidates {
        if vector.len() != query.len() {
            let mismatch = CoreError::DimensionMismatch {
                memory_id: id,
                expected: query.len(),
                actual: vector.len(),
            };
            warn!("Skipping candidate: {}", mismatch);
            ranking.excluded.push(mismatch);
            continue;
        }
        scored.push(ScoredMemory {
            id,
            score: cosine_similarity(query, vector),
        });
    }

    // sort_by is stable, so ties keep insertion order
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    ranking.hits = scored;
    ranking
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_similarity_is_one() {
        for v in [vec![1.0, 2.0, 3.0], vec![-0.5, 0.25], vec![1e-3, 4.0, -7.5, 0.0]] {
            assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_zero_vector_scores_lowest() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), -1.0);
    }

    #[test]
    fn test_orders_by_descending_score_and_truncates() {
        let a = vec![1.0, 0.0];
        let b = vec![0.7, 0.7];
        let c = vec![0.0, 1.0];
        let candidates = vec![(1, c.as_slice()), (2, b.as_slice()), (3, a.as_slice())];

        let ranking = rank(&[1.0, 0.1], candidates, 2);
        assert_eq!(ranking.ids(), vec![3, 2]);
        assert!(ranking.hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(ranking.excluded.is_empty());
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let v = vec![0.5, 0.5];
        let candidates = vec![(9, v.as_slice()), (4, v.as_slice()), (7, v.as_slice())];
        assert_eq!(rank(&[1.0, 1.0], candidates, 3).ids(), vec![9, 4, 7]);
    }

    #[test]
    fn test_dimension_mismatch_is_excluded_not_fatal() {
        let good = vec![1.0, 0.0];
        let stale = vec![1.0, 0.0, 0.0];
        let candidates = vec![(1, stale.as_slice()), (2, good.as_slice())];

        let ranking = rank(&[1.0, 0.0], candidates, 5);
        assert_eq!(ranking.ids(), vec![2]);
        assert_eq!(
            ranking.excluded,
            vec![CoreError::DimensionMismatch {
                memory_id: 1,
                expected: 2,
                actual: 3
            }]
        );
    }

    #[test]
    fn test_empty_candidates_and_zero_k() {
        let empty: Vec<(MemoryId, &[f32])> = Vec::new();
        assert!(rank(&[1.0], empty, 3).hits.is_empty());

        let v = vec![1.0];
        assert!(rank(&[1.0], vec![(1, v.as_slice())], 0).hits.is_empty());
    }
}
