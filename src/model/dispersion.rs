//! Empirical Bayes negative binomial dispersion estimation.
//!
//! Every gene's Cox-Reid adjusted profile log-likelihood (APL) is tabulated on
//! a log-spaced dispersion grid. Three estimates are read off the table:
//!
//! - **common**: maximiser of the APL summed over genes
//! - **trended**: maximiser of the APL curve smoothed across genes of similar
//!   average abundance (tricube weights over a span of neighbours)
//! - **tagwise**: maximiser of `APL_g + prior_n · smoothedAPL_g`, the
//!   weighted-likelihood shrinkage of each gene toward its trend
//!
//! Maxima are refined by parabolic interpolation on the log grid.

use crate::data::{CountMatrix, DesignMatrix};
use crate::error::{PbError, Result};
use crate::model::glm::adjusted_profile_loglik;
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Configuration for dispersion estimation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispersionConfig {
    pub grid_min: f64,
    pub grid_max: f64,
    pub grid_size: usize,
    /// Prior degrees of freedom for tagwise shrinkage.
    pub prior_df: f64,
    /// Fraction of genes in each smoothing window; `None` uses `(10/G)^0.23`.
    pub span: Option<f64>,
}

impl Default for DispersionConfig {
    fn default() -> Self {
        Self {
            grid_min: 1e-4,
            grid_max: 10.0,
            grid_size: 30,
            prior_df: 10.0,
            span: None,
        }
    }
}

/// Estimated dispersions for all genes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispersions {
    pub common: f64,
    pub trended: Vec<f64>,
    pub tagwise: Vec<f64>,
    /// Weight of the smoothed curve in the tagwise objective.
    pub prior_n: f64,
    pub span: f64,
}

/// Log-spaced grid between `min` and `max`.
fn log_grid(min: f64, max: f64, size: usize) -> Vec<f64> {
    let (lo, hi) = (min.ln(), max.ln());
    (0..size)
        .map(|k| (lo + (hi - lo) * k as f64 / (size - 1) as f64).exp())
        .collect()
}

/// Maximiser of a curve over log-grid points, refined by a parabola
/// through the maximum and its neighbours.
pub(crate) fn refine_maximum(log_grid: &[f64], values: &[f64]) -> f64 {
    let k = values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(i, _)| i)
        .unwrap_or(0);
    if k == 0 || k + 1 >= values.len() {
        return log_grid[k].exp();
    }
    let (f0, f1, f2) = (values[k - 1], values[k], values[k + 1]);
    let denom = f0 - 2.0 * f1 + f2;
    let delta = if denom < 0.0 {
        (0.5 * (f0 - f2) / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let step = log_grid[k + 1] - log_grid[k];
    (log_grid[k] + delta * step).exp()
}

/// Tricube-weighted local mean of the rows of `table`, with genes ordered by
/// `covariate` and windows of `span · G` nearest neighbours.
pub(crate) fn smooth_rows(table: &[Vec<f64>], covariate: &[f64], span: f64) -> Vec<Vec<f64>> {
    let n = table.len();
    if n == 0 {
        return Vec::new();
    }
    let k = table[0].len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| covariate[a].total_cmp(&covariate[b]));
    let sorted_cov: Vec<f64> = order.iter().map(|&i| covariate[i]).collect();
    let window = ((span * n as f64).ceil() as usize).clamp(1, n);

    let mut smoothed = vec![vec![0.0; k]; n];
    for (pos, &gene) in order.iter().enumerate() {
        // Slide a window of `window` neighbours centred as far as possible on pos
        let mut lo = pos.saturating_sub(window / 2);
        if lo + window > n {
            lo = n - window;
        }
        let hi = lo + window;
        let x0 = sorted_cov[pos];
        let radius = (x0 - sorted_cov[lo])
            .abs()
            .max((sorted_cov[hi - 1] - x0).abs())
            * 1.0001;

        let mut acc = vec![0.0; k];
        let mut wsum = 0.0;
        for &other_pos in &(lo..hi).collect::<Vec<_>>() {
            let d = if radius > 0.0 {
                (sorted_cov[other_pos] - x0).abs() / radius
            } else {
                0.0
            };
            let w = (1.0 - d.powi(3)).max(0.0).powi(3);
            if w == 0.0 {
                continue;
            }
            wsum += w;
            for (a, v) in acc.iter_mut().zip(&table[order[other_pos]]) {
                *a += w * v;
            }
        }
        for (s, a) in smoothed[gene].iter_mut().zip(acc) {
            *s = a / wsum;
        }
    }
    smoothed
}

/// Estimate common, trended and tagwise dispersions.
///
/// `ave_log_cpm` orders genes for the trend. Fails with
/// `DispersionEstimation` when the design leaves fewer than two residual
/// degrees of freedom.
pub fn estimate_dispersions(
    counts: &CountMatrix,
    design: &DesignMatrix,
    offsets: &[f64],
    ave_log_cpm: &[f64],
    config: &DispersionConfig,
) -> Result<Dispersions> {
    let n_genes = counts.n_genes();
    let residual_df = design.residual_df();
    if residual_df < 2 {
        return Err(PbError::DispersionEstimation(format!(
            "{} residual degree(s) of freedom ({} profiles, {} coefficients); need at least 2",
            residual_df,
            design.n_samples(),
            design.n_coefficients()
        )));
    }
    if n_genes == 0 {
        return Err(PbError::DispersionEstimation("no genes".to_string()));
    }
    if ave_log_cpm.len() != n_genes || offsets.len() != counts.n_columns() {
        return Err(PbError::DimensionMismatch {
            expected: n_genes,
            actual: ave_log_cpm.len(),
        });
    }
    if config.grid_size < 3 || !(config.grid_min > 0.0 && config.grid_max > config.grid_min) {
        return Err(PbError::InvalidParameter(
            "dispersion grid needs >= 3 points and 0 < grid_min < grid_max".to_string(),
        ));
    }

    let grid = log_grid(config.grid_min, config.grid_max, config.grid_size);
    let log_grid: Vec<f64> = grid.iter().map(|g| g.ln()).collect();
    let x = design.matrix();

    let apl: Vec<Vec<f64>> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let y: Vec<f64> = counts.row_dense(g).iter().map(|&c| c as f64).collect();
            grid.iter()
                .map(|&phi| adjusted_profile_loglik(&y, x, offsets, phi))
                .collect()
        })
        .collect();

    let summed: Vec<f64> = (0..grid.len())
        .map(|k| apl.iter().map(|row| row[k]).sum())
        .collect();
    let common = refine_maximum(&log_grid, &summed);

    let span = config.span.unwrap_or_else(|| {
        if n_genes > 10 {
            (10.0 / n_genes as f64).powf(0.23)
        } else {
            1.0
        }
    });
    let smoothed = smooth_rows(&apl, ave_log_cpm, span);
    let prior_n = config.prior_df / residual_df as f64;

    let (trended, tagwise): (Vec<f64>, Vec<f64>) = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let trend = refine_maximum(&log_grid, &smoothed[g]);
            let combined: Vec<f64> = apl[g]
                .iter()
                .zip(&smoothed[g])
                .map(|(a, s)| a + prior_n * s)
                .collect();
            (trend, refine_maximum(&log_grid, &combined))
        })
        .unzip();

    info!(
        "Dispersion: common {:.4}, trended range [{:.4}, {:.4}], prior_n {:.2}",
        common,
        trended.iter().cloned().fold(f64::INFINITY, f64::min),
        trended.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        prior_n
    );
    debug!("Dispersion span {:.3} over {} genes", span, n_genes);

    Ok(Dispersions {
        common,
        trended,
        tagwise,
        prior_n,
        span,
    })
}
