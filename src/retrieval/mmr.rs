//! Vector math for candidate selection: cosine similarity, maximal marginal
//! relevance, the redundancy filter and the long-context reorder.

use std::collections::VecDeque;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Greedy MMR selection. Returns candidate indices in selection order.
///
/// Each step picks the candidate maximising
/// `lambda * sim(query, d) - (1 - lambda) * max(sim(d, s) for s in selected)`.
/// `lambda = 1.0` is pure relevance, `0.0` pure diversity.
pub fn maximal_marginal_relevance(
    query: &[f32],
    candidates: &[Vec<f32>],
    k: usize,
    lambda: f32,
) -> Vec<usize> {
    let lambda = lambda.clamp(0.0, 1.0);
    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| cosine_similarity(query, c))
        .collect();

    let mut selected: Vec<usize> = Vec::with_capacity(k.min(candidates.len()));
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < k && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|&s| cosine_similarity(&candidates[idx], &candidates[s]))
                .fold(0.0f32, f32::max);
            let score = lambda * relevance[idx] - (1.0 - lambda) * redundancy;
            // Strict comparison keeps the earliest candidate on ties
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        selected.push(remaining.remove(best_pos));
    }

    selected
}

/// Stable, first-seen-wins redundancy filter. Returns the indices to keep.
/// An item is dropped when its embedding is within `threshold` cosine
/// similarity of an already kept item, or its content hash matches one.
pub fn non_redundant_indices(
    embeddings: &[Vec<f32>],
    hashes: &[blake3::Hash],
    threshold: f32,
) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::new();
    for i in 0..embeddings.len() {
        let duplicate = kept.iter().any(|&j| {
            hashes.get(i).is_some_and(|h| Some(h) == hashes.get(j))
                || cosine_similarity(&embeddings[i], &embeddings[j]) >= threshold
        });
        if !duplicate {
            kept.push(i);
        }
    }
    kept
}

/// Place the most relevant items at both ends of the sequence and the least
/// relevant in the middle. Input is expected in descending relevance.
pub fn long_context_reorder<T>(items: Vec<T>) -> Vec<T> {
    let mut out = VecDeque::with_capacity(items.len());
    for (i, item) in items.into_iter().rev().enumerate() {
        if i % 2 == 1 {
            out.push_back(item);
        } else {
            out.push_front(item);
        }
    }
    out.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_mmr_prefers_diverse_second_pick() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            vec![1.0, 0.0],   // most relevant
            vec![0.99, 0.01], // near-duplicate of 0
            vec![0.7, 0.7],   // less relevant, different direction
        ];
        let picked = maximal_marginal_relevance(&query, &candidates, 2, 0.3);
        assert_eq!(picked, vec![0, 2]);
    }

    #[test]
    fn test_mmr_pure_relevance() {
        let query = vec![1.0, 0.0];
        let candidates = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![0.99, 0.01]];
        let picked = maximal_marginal_relevance(&query, &candidates, 3, 1.0);
        assert_eq!(picked, vec![1, 2, 0]);
    }

    #[test]
    fn test_redundancy_first_seen_wins() {
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.999, 0.001]];
        let hashes = vec![
            blake3::hash(b"a"),
            blake3::hash(b"b"),
            blake3::hash(b"c"),
        ];
        assert_eq!(non_redundant_indices(&embeddings, &hashes, 0.95), vec![0, 1]);
    }

    #[test]
    fn test_redundancy_identical_content() {
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let hashes = vec![blake3::hash(b"same"), blake3::hash(b"same")];
        assert_eq!(non_redundant_indices(&embeddings, &hashes, 0.95), vec![0]);
    }

    #[test]
    fn test_kept_items_are_pairwise_distinct() {
        let embeddings: Vec<Vec<f32>> = (0..20)
            .map(|i| {
                let angle = (i as f32) * 0.05;
                vec![angle.cos(), angle.sin()]
            })
            .collect();
        let hashes: Vec<_> = (0..20u8).map(|i| blake3::hash(&[i])).collect();
        let kept = non_redundant_indices(&embeddings, &hashes, 0.99);
        for (a, &i) in kept.iter().enumerate() {
            for &j in &kept[a + 1..] {
                assert!(cosine_similarity(&embeddings[i], &embeddings[j]) < 0.99);
            }
        }
    }

    #[test]
    fn test_long_context_reorder() {
        assert_eq!(long_context_reorder(vec![1, 2, 3, 4, 5]), vec![1, 3, 5, 4, 2]);
        assert_eq!(long_context_reorder(vec![1, 2]), vec![2, 1]);
        assert!(long_context_reorder(Vec::<u8>::new()).is_empty());
    }
}
