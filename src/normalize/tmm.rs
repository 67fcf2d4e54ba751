//! Trimmed Mean of M-values (TMM) normalization.
//!
//! TMM estimates per-profile scaling factors that correct library sizes for
//! compositional differences, so that a minority of strongly changing genes
//! does not distort the normalization of all others.
//!
//! # Algorithm
//!
//! 1. Pick a reference profile: the one whose upper-quartile CPM is closest
//!    to the mean upper quartile.
//! 2. For each profile, compute gene-wise M-values (log2 ratio against the
//!    reference) and A-values (average log2 proportion).
//! 3. Drop genes in the outer 30% of M and the outer 5% of A.
//! 4. The factor is 2 to the precision-weighted mean of the remaining M.
//! 5. Factors are rescaled to a geometric mean of one.
//!
//! # Reference
//!
//! Robinson MD, Oshlack A. A scaling normalization method for differential
//! expression analysis of RNA-seq data. Genome Biology 11, R25 (2010).

use crate::data::CountMatrix;
use crate::error::{PbError, Result};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration for TMM normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmmConfig {
    /// Fraction of M-values to trim from each tail.
    pub trim_m: f64,
    /// Fraction of A-values to trim from each tail.
    pub trim_a: f64,
    /// Use precision weights in the trimmed mean.
    pub weighted: bool,
    /// Reference profile index (None = upper-quartile rule).
    pub reference_sample: Option<usize>,
}

impl Default for TmmConfig {
    fn default() -> Self {
        Self {
            trim_m: 0.30,
            trim_a: 0.05,
            weighted: true,
            reference_sample: None,
        }
    }
}

/// Library sizes and TMM factors for a set of profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TmmFactors {
    pub sample_ids: Vec<String>,
    pub library_sizes: Vec<u64>,
    /// Scaling factors with geometric mean 1.
    pub norm_factors: Vec<f64>,
    /// `library_size * norm_factor`.
    pub effective_lib_sizes: Vec<f64>,
    pub reference_sample: usize,
}

impl TmmFactors {
    pub fn n_samples(&self) -> usize {
        self.norm_factors.len()
    }
}

/// TMM factors with default parameters.
pub fn norm_tmm(counts: &CountMatrix) -> Result<TmmFactors> {
    norm_tmm_with_config(counts, &TmmConfig::default())
}

/// TMM factors with custom configuration.
pub fn norm_tmm_with_config(counts: &CountMatrix, config: &TmmConfig) -> Result<TmmFactors> {
    let n_genes = counts.n_genes();
    let n_samples = counts.n_columns();

    if n_genes == 0 || n_samples == 0 {
        return Err(PbError::EmptyData(
            "Cannot apply TMM to empty matrix".to_string(),
        ));
    }
    if !(0.0..0.5).contains(&config.trim_m) {
        return Err(PbError::InvalidParameter(
            "trim_m must be in [0, 0.5)".to_string(),
        ));
    }
    if !(0.0..0.5).contains(&config.trim_a) {
        return Err(PbError::InvalidParameter(
            "trim_a must be in [0, 0.5)".to_string(),
        ));
    }

    let library_sizes = counts.col_sums();
    if let Some(j) = library_sizes.iter().position(|&l| l == 0) {
        return Err(PbError::Numerical(format!(
            "Profile {} has zero total counts",
            counts.column_ids()[j]
        )));
    }

    let ref_idx = match config.reference_sample {
        Some(idx) => idx,
        None => select_reference_sample(counts, &library_sizes),
    };
    if ref_idx >= n_samples {
        return Err(PbError::InvalidParameter(format!(
            "Reference sample index {} out of bounds (n_samples = {})",
            ref_idx, n_samples
        )));
    }

    let ref_counts = counts.col_dense(ref_idx);
    let raw: Vec<f64> = (0..n_samples)
        .into_par_iter()
        .map(|j| {
            if j == ref_idx {
                1.0
            } else {
                calculate_tmm_factor(
                    &counts.col_dense(j),
                    &ref_counts,
                    library_sizes[j] as f64,
                    library_sizes[ref_idx] as f64,
                    config,
                )
            }
        })
        .collect();

    // Rescale to geometric mean one
    let log_mean = raw.iter().map(|f| f.ln()).sum::<f64>() / n_samples as f64;
    let norm_factors: Vec<f64> = raw.iter().map(|f| f / log_mean.exp()).collect();

    let effective_lib_sizes: Vec<f64> = library_sizes
        .iter()
        .zip(&norm_factors)
        .map(|(&lib, &factor)| lib as f64 * factor)
        .collect();

    debug!(
        "TMM reference {} factors {:?}",
        counts.column_ids()[ref_idx],
        norm_factors
    );

    Ok(TmmFactors {
        sample_ids: counts.column_ids().to_vec(),
        library_sizes,
        norm_factors,
        effective_lib_sizes,
        reference_sample: ref_idx,
    })
}

/// Quantile with linear interpolation between order statistics.
pub(crate) fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let h = (sorted.len() - 1) as f64 * p;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Profile whose upper-quartile proportion is closest to the mean upper quartile.
fn select_reference_sample(counts: &CountMatrix, library_sizes: &[u64]) -> usize {
    let upper_quartiles: Vec<f64> = (0..counts.n_columns())
        .map(|j| {
            let lib = library_sizes[j] as f64;
            let mut props: Vec<f64> = counts
                .col_dense(j)
                .iter()
                .map(|&c| c as f64 / lib)
                .collect();
            props.sort_by(|a, b| a.total_cmp(b));
            quantile(&props, 0.75)
        })
        .collect();

    let mean_uq = upper_quartiles.iter().sum::<f64>() / upper_quartiles.len() as f64;
    upper_quartiles
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - mean_uq).abs().total_cmp(&(*b - mean_uq).abs()))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

/// Average ranks (1-based), ties share their mean rank.
fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// TMM factor of one profile against the reference.
fn calculate_tmm_factor(
    obs: &[u64],
    reference: &[u64],
    obs_lib: f64,
    ref_lib: f64,
    config: &TmmConfig,
) -> f64 {
    let mut m_values = Vec::new();
    let mut a_values = Vec::new();
    let mut variances = Vec::new();

    for (&o, &r) in obs.iter().zip(reference) {
        if o == 0 || r == 0 {
            continue;
        }
        let (o, r) = (o as f64, r as f64);
        let log_o = (o / obs_lib).log2();
        let log_r = (r / ref_lib).log2();
        m_values.push(log_o - log_r);
        a_values.push(0.5 * (log_o + log_r));
        variances.push((obs_lib - o) / obs_lib / o + (ref_lib - r) / ref_lib / r);
    }

    if m_values.is_empty() || m_values.iter().all(|m| m.abs() < 1e-6) {
        return 1.0;
    }

    let n = m_values.len() as f64;
    let lo_m = (n * config.trim_m).floor() + 1.0;
    let hi_m = n + 1.0 - lo_m;
    let lo_a = (n * config.trim_a).floor() + 1.0;
    let hi_a = n + 1.0 - lo_a;
    let m_ranks = average_ranks(&m_values);
    let a_ranks = average_ranks(&a_values);

    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..m_values.len() {
        let keep = m_ranks[i] >= lo_m
            && m_ranks[i] <= hi_m
            && a_ranks[i] >= lo_a
            && a_ranks[i] <= hi_a;
        if !keep {
            continue;
        }
        let w = if config.weighted && variances[i] > 0.0 {
            1.0 / variances[i]
        } else {
            1.0
        };
        num += m_values[i] * w;
        den += w;
    }

    if den <= 0.0 || !num.is_finite() {
        return 1.0;
    }
    2.0_f64.powf(num / den)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn matrix(cols: &[&[u64]]) -> CountMatrix {
        let mut triplets = Vec::new();
        for (j, col) in cols.iter().enumerate() {
            for (i, &v) in col.iter().enumerate() {
                triplets.push((i, j, v));
            }
        }
        let n_genes = cols[0].len();
        CountMatrix::from_triplets(
            &triplets,
            (0..n_genes).map(|i| format!("g{}", i)).collect(),
            (0..cols.len()).map(|j| format!("s{}", j)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_proportional_profiles_have_unit_factors() {
        let counts = matrix(&[
            &[500, 300, 150, 50, 20, 10],
            &[1000, 600, 300, 100, 40, 20],
            &[250, 150, 75, 25, 10, 5],
        ]);
        let tmm = norm_tmm(&counts).unwrap();
        assert_eq!(tmm.library_sizes, vec![1030, 2060, 515]);
        for f in &tmm.norm_factors {
            assert_relative_eq!(*f, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_composition_shift_detected() {
        // Profile 1 has one gene inflated 20-fold; the rest are unchanged
        let base: Vec<u64> = (0..20).map(|i| 100 + 10 * i).collect();
        let mut shifted = base.clone();
        shifted[0] *= 20;
        let counts = matrix(&[&base, &shifted]);
        let tmm = norm_tmm(&counts).unwrap();

        // Raw factor of the shifted profile is below 1 relative to the other
        assert!(tmm.norm_factors[1] < tmm.norm_factors[0]);
        // Effective library sizes agree on the unchanged genes
        let ratio = tmm.effective_lib_sizes[1] / tmm.effective_lib_sizes[0];
        assert_relative_eq!(ratio, 1.0, epsilon = 0.02);
    }

    #[test]
    fn test_geometric_mean_one() {
        let counts = matrix(&[
            &[10, 50, 300, 80, 9, 40],
            &[30, 40, 500, 70, 11, 35],
            &[15, 90, 200, 60, 4, 60],
            &[22, 45, 350, 95, 7, 30],
        ]);
        let tmm = norm_tmm(&counts).unwrap();
        let log_sum: f64 = tmm.norm_factors.iter().map(|f| f.ln()).sum();
        assert_relative_eq!(log_sum, 0.0, epsilon = 1e-10);
        for j in 0..4 {
            assert_relative_eq!(
                tmm.effective_lib_sizes[j],
                tmm.library_sizes[j] as f64 * tmm.norm_factors[j],
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_config_validation() {
        let counts = matrix(&[&[1, 2], &[3, 4]]);
        let bad_m = TmmConfig {
            trim_m: 0.6,
            ..Default::default()
        };
        assert!(norm_tmm_with_config(&counts, &bad_m).is_err());
        let bad_ref = TmmConfig {
            reference_sample: Some(5),
            ..Default::default()
        };
        assert!(norm_tmm_with_config(&counts, &bad_ref).is_err());
    }

    #[test]
    fn test_zero_library_rejected() {
        let counts = matrix(&[&[1, 2], &[0, 0]]);
        assert!(matches!(norm_tmm(&counts), Err(PbError::Numerical(_))));
    }

    #[test]
    fn test_average_ranks_ties() {
        assert_eq!(average_ranks(&[3.0, 1.0, 3.0, 2.0]), vec![3.5, 1.0, 3.5, 2.0]);
        assert_relative_eq!(quantile(&[1.0, 2.0, 3.0, 4.0, 5.0], 0.75), 4.0);
    }
}
