//! Benjamini-Hochberg false discovery rate correction.

/// BH adjusted p-values, in input order.
///
/// q[i] = min over j ≥ rank(i) of p[j] · n / j, capped at 1. NaN p-values
/// sort last and stay NaN.
pub fn bh_adjust(p_values: &[f64]) -> Vec<f64> {
    let n = p_values.len();
    if n == 0 {
        return Vec::new();
    }

    let mut indices: Vec<usize> = (0..n).filter(|&i| !p_values[i].is_nan()).collect();
    indices.sort_by(|&a, &b| {
        p_values[a]
            .partial_cmp(&p_values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let m = indices.len();

    let mut q_values = vec![f64::NAN; n];
    let mut running = 1.0_f64;
    for (i, &orig) in indices.iter().enumerate().rev() {
        let rank = (i + 1) as f64;
        let adjusted = p_values[orig] * m as f64 / rank;
        running = running.min(adjusted).min(1.0);
        q_values[orig] = running;
    }
    q_values
}
