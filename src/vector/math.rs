/// Guard against divide-by-zero on degenerate vectors.
pub const SIM_EPSILON: f32 = 1e-8;

/// Pack an embedding as little-endian f32 bytes for BLOB storage.
pub fn pack_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian f32 BLOB. Trailing partial floats are dropped.
pub fn unpack_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity in f32. Vectors of unequal length score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (norm(a) * norm(b) + SIM_EPSILON)
}

/// Score every row of `matrix` against `query` in one pass.
pub fn batch_cosine_similarity(matrix: &[Vec<f32>], query: &[f32]) -> Vec<f32> {
    let query_norm = norm(query);
    matrix
        .iter()
        .map(|row| {
            if row.len() != query.len() {
                return 0.0;
            }
            let dot: f32 = row.iter().zip(query.iter()).map(|(x, y)| x * y).sum();
            dot / (norm(row) * query_norm + SIM_EPSILON)
        })
        .collect()
}

/// Indices of the `k` best similarities, descending, via partial selection.
///
/// `select_nth_unstable_by` partitions in expected O(n); only the selected
/// prefix is sorted. Ties break toward the lower index (earlier insertion).
pub fn top_k_indices(similarities: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..similarities.len()).collect();
    if k == 0 || indices.is_empty() {
        return Vec::new();
    }

    let better = |&a: &usize, &b: &usize| {
        similarities[b]
            .partial_cmp(&similarities[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    };

    if indices.len() > k {
        indices.select_nth_unstable_by(k - 1, better);
        indices.truncate(k);
    }
    indices.sort_unstable_by(better);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip_is_bit_exact() {
        let original = vec![0.1f32, -2.5, 3.75, f32::MIN_POSITIVE, 1e20, -0.0];
        let bytes = pack_embedding(&original);
        let decoded = unpack_embedding(&bytes);
        assert_eq!(original.len(), decoded.len());
        for (a, b) in original.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn identical_vectors_score_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn orthogonal_vectors_score_zero() {
        let sim = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn mismatched_lengths_score_zero() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn partial_selection_matches_full_sort() {
        // Deterministic pseudo-random similarities.
        let mut state = 0x2545F491u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 10_000) as f32 / 10_000.0
        };

        let sims: Vec<f32> = (0..500).map(|_| next()).collect();
        for k in [1usize, 5, 17, 100] {
            let partial = top_k_indices(&sims, k);

            let mut full: Vec<usize> = (0..sims.len()).collect();
            full.sort_by(|&a, &b| {
                sims[b]
                    .partial_cmp(&sims[a])
                    .unwrap()
                    .then(a.cmp(&b))
            });
            full.truncate(k);

            assert_eq!(partial, full, "k={}", k);
        }
    }

    #[test]
    fn ties_prefer_earlier_insertion() {
        let sims = vec![0.5, 0.9, 0.9, 0.9, 0.1];
        assert_eq!(top_k_indices(&sims, 2), vec![1, 2]);
    }

    #[test]
    fn k_larger_than_input_returns_all_sorted() {
        let sims = vec![0.1, 0.9, 0.5];
        assert_eq!(top_k_indices(&sims, 10), vec![1, 2, 0]);
    }
}
