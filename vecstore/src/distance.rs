/// Normalizes `v` to unit length in place.
///
/// Returns false (leaving `v` untouched) for zero or non-finite vectors.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm: f64 = v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in v.iter_mut() {
        *x = (*x as f64 / norm) as f32;
    }
    true
}

/// Cosine similarity in `[-1, 1]`.
///
/// Uses f64 accumulation. Returns 0.0 for zero vectors or mismatched
/// dimensions.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot: f64 = 0.0;
    let mut norm_a: f64 = 0.0;
    let mut norm_b: f64 = 0.0;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32
}

/// Euclidean distance. Returns `f32::MAX` on dimension mismatch.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Converts the L2 distance between two unit vectors into cosine similarity.
pub fn similarity_from_l2(distance: f32) -> f32 {
    (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        assert!(l2_normalize(&mut v));
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_vector() {
        let mut v = vec![0.0, 0.0, 0.0];
        assert!(!l2_normalize(&mut v));
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn cosine_identical_orthogonal_opposite() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn l2_to_similarity_matches_cosine() {
        let mut a = vec![1.0, 0.2, 0.0];
        let mut b = vec![0.7, 0.7, 0.1];
        l2_normalize(&mut a);
        l2_normalize(&mut b);
        let from_l2 = similarity_from_l2(l2_distance(&a, &b));
        assert!((from_l2 - cosine_similarity(&a, &b)).abs() < 1e-5);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity_from_l2(0.0), 1.0);
        assert!((similarity_from_l2(2.0) + 1.0).abs() < 1e-6);
        assert!((similarity_from_l2(2.0_f32.sqrt())).abs() < 1e-6);
    }
}
