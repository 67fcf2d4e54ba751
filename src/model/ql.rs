//! Quasi-likelihood dispersion with empirical Bayes squeezing.
//!
//! Each gene is fitted at its trended NB dispersion. The residual deviance
//! divided by the residual df is the raw QL dispersion `s²`. A scaled F prior
//! `s² ~ s₀² F(d, d₀)` is estimated by matching the first two moments of
//! `log s²` (Smyth 2004), with `s₀²` following a polynomial trend in average
//! abundance. Posterior dispersions are the df-weighted mix
//! `(d₀ s₀² + d s²) / (d₀ + d)`.

use crate::data::{CountMatrix, DesignMatrix};
use crate::error::{PbError, Result};
use crate::model::dispersion::{estimate_dispersions, DispersionConfig, Dispersions};
use crate::model::glm::{fit_glm, GlmFit};
use crate::normalize::{ave_log_cpm, TmmFactors};
use crate::normalize::tmm::quantile;
use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use statrs::function::gamma::digamma;

/// Denominator df beyond which the F distribution is replaced by its
/// chi-square limit.
const DF_CHISQ_LIMIT: f64 = 1e6;

/// QL fitting options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QlConfig {
    /// Protect the prior against genes with outlying dispersion.
    pub robust: bool,
    /// Prior count for the AveLogCPM covariate.
    pub prior_count: f64,
    /// Lower and upper tail fractions winsorized in robust mode.
    pub winsor_tail: (f64, f64),
    /// Upper-tail probability under which a gene's prior df is reduced.
    pub robust_alpha: f64,
}

impl Default for QlConfig {
    fn default() -> Self {
        Self {
            robust: false,
            prior_count: 2.0,
            winsor_tail: (0.05, 0.1),
            robust_alpha: 0.1,
        }
    }
}

/// Squeezed variances.
#[derive(Debug, Clone)]
pub struct SqueezedVar {
    /// Prior scale `s₀²` per gene.
    pub var_prior: Vec<f64>,
    /// Prior df `d₀` per gene (shared unless robust).
    pub df_prior: Vec<f64>,
    pub var_post: Vec<f64>,
}

/// Fitted quasi-likelihood model for one design and count matrix.
///
/// Shared by every contrast tested on that design.
#[derive(Debug, Clone)]
pub struct QlFit {
    pub gene_ids: Vec<String>,
    pub counts: CountMatrix,
    pub design: DesignMatrix,
    /// `ln` effective library size per profile.
    pub offsets: Vec<f64>,
    pub dispersions: Dispersions,
    pub glm: GlmFit,
    pub ave_log_cpm: Vec<f64>,
    pub df_residual: f64,
    pub s2: Vec<f64>,
    pub s2_prior: Vec<f64>,
    pub df_prior: Vec<f64>,
    pub s2_post: Vec<f64>,
    pub robust: bool,
}

impl QlFit {
    pub fn n_genes(&self) -> usize {
        self.gene_ids.len()
    }

    /// Denominator df of the QL F-test for gene `g`.
    pub fn df_total(&self, g: usize) -> f64 {
        self.df_prior[g] + self.df_residual
    }
}

/// Trigamma function `ψ'(x)` for `x > 0`.
pub fn trigamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc + 1.0 / x
        + x2 / 2.0
        + x2 / x * (1.0 / 6.0 - x2 * (1.0 / 30.0 - x2 * (1.0 / 42.0 - x2 / 30.0)))
}

/// Tetragamma function `ψ''(x)` for `x > 0`.
pub fn tetragamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc - x2
        - x2 / x
        - x2 * x2 * (0.5 - x2 * (1.0 / 6.0 - x2 * (1.0 / 6.0 - x2 * 3.0 / 10.0)))
}

/// Solve `ψ'(y) = x` by Newton iteration on `1/ψ'`.
pub fn trigamma_inverse(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    if x > 1e7 {
        return 1.0 / x.sqrt();
    }
    if x < 1e-6 {
        return 1.0 / x;
    }
    let mut y = 0.5 + 1.0 / x;
    for _ in 0..50 {
        let tri = trigamma(y);
        let dif = tri * (1.0 - tri / x) / tetragamma(y);
        y += dif;
        if -dif / y < 1e-8 {
            break;
        }
    }
    y
}

/// Upper tail of `F(df1, df2)` at `f`, using `χ²(df1) / df1` when `df2` is
/// infinite or very large.
pub fn f_upper_tail(f: f64, df1: f64, df2: f64) -> f64 {
    if f.is_nan() {
        return f64::NAN;
    }
    if f <= 0.0 {
        return 1.0;
    }
    if df2.is_infinite() || df2 > DF_CHISQ_LIMIT {
        return ChiSquared::new(df1)
            .map(|d| d.sf(f * df1))
            .unwrap_or(f64::NAN);
    }
    FisherSnedecor::new(df1, df2)
        .map(|d| d.sf(f))
        .unwrap_or(f64::NAN)
}

/// Number of trend coefficients for `n` genes: 1 to 4.
fn trend_terms(n: usize) -> usize {
    1 + usize::from(n >= 3) + usize::from(n >= 6) + usize::from(n >= 30)
}

/// Least-squares polynomial fit of `y` on a standardized covariate.
/// Returns fitted values and the number of coefficients used.
fn polynomial_trend(y: &[f64], covariate: &[f64], terms: usize) -> (Vec<f64>, usize) {
    let n = y.len() as f64;
    let mean_y = y.iter().sum::<f64>() / n;
    let constant = (vec![mean_y; y.len()], 1);

    let mean_c = covariate.iter().sum::<f64>() / n;
    let sd_c = (covariate.iter().map(|c| (c - mean_c).powi(2)).sum::<f64>() / n).sqrt();
    if terms <= 1 || !(sd_c > 0.0) {
        return constant;
    }

    let x = DMatrix::from_fn(y.len(), terms, |i, j| ((covariate[i] - mean_c) / sd_c).powi(j as i32));
    let xt = x.transpose();
    let beta = match (&xt * &x).cholesky() {
        Some(chol) => chol.solve(&(&xt * DVector::from_column_slice(y))),
        None => return constant,
    };
    ((x * beta).iter().cloned().collect(), terms)
}

/// Estimate the scaled F prior of `x` with residual df `df`.
///
/// Returns per-gene prior scales and the shared prior df (possibly
/// infinite). `winsor` clips the centred log values at the given tail
/// fractions before computing moments.
fn fit_f_dist(
    x: &[f64],
    df: f64,
    covariate: Option<&[f64]>,
    winsor: Option<(f64, f64)>,
) -> (Vec<f64>, f64) {
    let n = x.len();
    let mut sorted: Vec<f64> = x.iter().map(|v| v.max(0.0)).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mut median = quantile(&sorted, 0.5);
    if !(median > 0.0) {
        warn!("More than half of the QL dispersions are zero");
        median = 1.0;
    }
    let floor = 1e-5 * median;

    let half_df = df / 2.0;
    let shift = digamma(half_df) - half_df.ln();
    let mut e: Vec<f64> = x.iter().map(|v| v.max(floor).ln() - shift).collect();

    if let Some((lower, upper)) = winsor {
        let mut es = e.clone();
        es.sort_by(|a, b| a.total_cmp(b));
        let lo = quantile(&es, lower);
        let hi = quantile(&es, 1.0 - upper);
        for v in e.iter_mut() {
            *v = v.clamp(lo, hi);
        }
    }

    let (emean, used) = match covariate {
        Some(cov) => polynomial_trend(&e, cov, trend_terms(n)),
        None => (vec![e.iter().sum::<f64>() / n as f64; n], 1),
    };
    let resid_df = n.saturating_sub(used).max(1) as f64;
    let evar = e
        .iter()
        .zip(&emean)
        .map(|(a, m)| (a - m).powi(2))
        .sum::<f64>()
        / resid_df
        - trigamma(half_df);

    if evar > 0.0 {
        let d0 = 2.0 * trigamma_inverse(evar);
        let adjust = digamma(d0 / 2.0) - (d0 / 2.0).ln();
        (emean.iter().map(|m| (m + adjust).exp()).collect(), d0)
    } else if covariate.is_some() {
        (emean.iter().map(|m| m.exp()).collect(), f64::INFINITY)
    } else {
        let mean_x = x.iter().sum::<f64>() / n as f64;
        (vec![mean_x; n], f64::INFINITY)
    }
}

/// Empirical Bayes squeeze of variances `s2`, all with residual df `df`.
///
/// With `robust`, moments are computed from winsorized log variances and
/// genes whose `s2` is extreme in the upper tail of the fitted prior get a
/// proportionally smaller prior df.
pub fn squeeze_var(s2: &[f64], df: f64, covariate: Option<&[f64]>, config: &QlConfig) -> Result<SqueezedVar> {
    if s2.is_empty() {
        return Err(PbError::EmptyData("No variances to squeeze".to_string()));
    }
    if !(df > 0.0) {
        return Err(PbError::InvalidParameter(format!(
            "residual df must be positive, got {}",
            df
        )));
    }
    if let Some(cov) = covariate {
        if cov.len() != s2.len() {
            return Err(PbError::DimensionMismatch {
                expected: s2.len(),
                actual: cov.len(),
            });
        }
    }

    let winsor = config.robust.then_some(config.winsor_tail);
    let (var_prior, d0) = fit_f_dist(s2, df, covariate, winsor);

    let df_prior: Vec<f64> = if config.robust {
        // Infinite prior df has no scale to shrink; fall back to a large finite one.
        let base = if d0.is_finite() { d0 } else { 100.0 * df };
        s2.iter()
            .zip(&var_prior)
            .map(|(&s, &s0)| {
                let p_upper = f_upper_tail(s / s0, df, base);
                if p_upper.is_nan() {
                    base
                } else if p_upper < config.robust_alpha {
                    base * p_upper / config.robust_alpha
                } else {
                    d0
                }
            })
            .collect()
    } else {
        vec![d0; s2.len()]
    };

    let var_post = s2
        .iter()
        .zip(&var_prior)
        .zip(&df_prior)
        .map(|((&s, &s0), &d0g)| {
            if d0g.is_infinite() {
                s0
            } else {
                (d0g * s0 + df * s) / (d0g + df)
            }
        })
        .collect();

    Ok(SqueezedVar {
        var_prior,
        df_prior,
        var_post,
    })
}

/// Fit the QL model: dispersions, per-gene GLMs at the trended dispersion,
/// and squeezed QL dispersions.
pub fn fit_ql(
    counts: &CountMatrix,
    design: &DesignMatrix,
    norm: &TmmFactors,
    dispersion_config: &DispersionConfig,
    config: &QlConfig,
) -> Result<QlFit> {
    if counts.column_ids() != design.sample_ids() {
        return Err(PbError::SampleMismatch(
            "count matrix columns and design rows differ".to_string(),
        ));
    }
    if norm.effective_lib_sizes.len() != counts.n_columns() {
        return Err(PbError::DimensionMismatch {
            expected: counts.n_columns(),
            actual: norm.effective_lib_sizes.len(),
        });
    }
    design.check_full_rank()?;

    let offsets: Vec<f64> = norm.effective_lib_sizes.iter().map(|l| l.ln()).collect();
    let ave = ave_log_cpm(counts, &norm.effective_lib_sizes, config.prior_count)?;
    let dispersions = estimate_dispersions(counts, design, &offsets, &ave, dispersion_config)?;
    let glm = fit_glm(counts, design, &offsets, &dispersions.trended)?;
    if glm.n_converged() < glm.n_genes() {
        warn!(
            "{} of {} gene fits did not converge",
            glm.n_genes() - glm.n_converged(),
            glm.n_genes()
        );
    }

    let df_residual = design.residual_df() as f64;
    let s2: Vec<f64> = glm.fits.iter().map(|f| f.deviance / df_residual).collect();
    let squeezed = squeeze_var(&s2, df_residual, Some(&ave), config)?;

    let finite_d0 = squeezed.df_prior.iter().filter(|d| d.is_finite()).count();
    info!(
        "QL fit: {} genes, residual df {}, prior df {}{}",
        counts.n_genes(),
        df_residual,
        squeezed.df_prior.first().copied().unwrap_or(f64::NAN),
        if config.robust {
            format!(" (robust, {} finite)", finite_d0)
        } else {
            String::new()
        }
    );

    Ok(QlFit {
        gene_ids: counts.gene_ids().to_vec(),
        counts: counts.clone(),
        design: design.clone(),
        offsets,
        dispersions,
        glm,
        ave_log_cpm: ave,
        df_residual,
        s2,
        s2_prior: squeezed.var_prior,
        df_prior: squeezed.df_prior,
        s2_post: squeezed.var_post,
        robust: config.robust,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{ChiSquared as ChiSq, Distribution};
    use std::f64::consts::PI;

    #[test]
    fn test_trigamma_known_values() {
        assert_relative_eq!(trigamma(1.0), PI * PI / 6.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(0.5), PI * PI / 2.0, epsilon = 1e-10);
        assert_relative_eq!(tetragamma(1.0), -2.404_113_806_319_188, epsilon = 1e-9);
    }

    #[test]
    fn test_trigamma_inverse_roundtrip() {
        for y in [0.05, 0.7, 2.5, 40.0] {
            assert_relative_eq!(trigamma_inverse(trigamma(y)), y, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_f_upper_tail_limits() {
        assert_eq!(f_upper_tail(0.0, 1.0, 10.0), 1.0);
        let chi = f_upper_tail(3.84, 1.0, f64::INFINITY);
        assert_relative_eq!(chi, 0.05, epsilon = 1e-3);
        let f = f_upper_tail(3.84, 1.0, 1e5);
        assert_relative_eq!(f, chi, epsilon = 1e-3);
    }

    #[test]
    fn test_squeeze_constant_variances() {
        let s2 = vec![2.0; 50];
        let sq = squeeze_var(&s2, 4.0, None, &QlConfig::default()).unwrap();
        assert!(sq.df_prior[0].is_infinite());
        for v in &sq.var_post {
            assert_relative_eq!(*v, 2.0, epsilon = 1e-12);
        }
    }

    fn scaled_f_sample(n: usize, d: f64, d0: f64, s0: f64, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let num = ChiSq::new(d).unwrap();
        let den = ChiSq::new(d0).unwrap();
        (0..n)
            .map(|_| {
                let a: f64 = num.sample(&mut rng);
                let b: f64 = den.sample(&mut rng);
                s0 * (a / d) / (b / d0)
            })
            .collect()
    }

    #[test]
    fn test_squeeze_recovers_prior() {
        let s2 = scaled_f_sample(4000, 4.0, 10.0, 0.5, 11);
        let sq = squeeze_var(&s2, 4.0, None, &QlConfig::default()).unwrap();
        assert!(sq.df_prior[0] > 6.0 && sq.df_prior[0] < 16.0, "d0 {}", sq.df_prior[0]);
        assert!(sq.var_prior[0] > 0.4 && sq.var_prior[0] < 0.6);
        // Posterior lies between the raw value and the prior
        for (s, p) in s2.iter().zip(&sq.var_post).take(20) {
            let prior = sq.var_prior[0];
            let (lo, hi) = if *s < prior { (*s, prior) } else { (prior, *s) };
            assert!(*p >= lo - 1e-12 && *p <= hi + 1e-12);
        }
    }

    #[test]
    fn test_robust_reduces_outlier_prior_df() {
        let mut s2 = scaled_f_sample(1000, 4.0, 10.0, 0.5, 3);
        s2[0] = 50.0;
        let config = QlConfig {
            robust: true,
            ..QlConfig::default()
        };
        let sq = squeeze_var(&s2, 4.0, None, &config).unwrap();
        let typical = sq.df_prior[1..]
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(sq.df_prior[0] < typical);
        assert!(sq.var_post[0] > 10.0);
    }

    #[test]
    fn test_covariate_trend() {
        // Prior scale doubles along the covariate
        let mut s2 = scaled_f_sample(2000, 6.0, 20.0, 1.0, 5);
        let cov: Vec<f64> = (0..2000).map(|i| i as f64 / 2000.0).collect();
        for (s, c) in s2.iter_mut().zip(&cov) {
            *s *= 2f64.powf(*c);
        }
        let sq = squeeze_var(&s2, 6.0, Some(&cov), &QlConfig::default()).unwrap();
        assert!(sq.var_prior[1999] > 1.5 * sq.var_prior[0]);
    }

    #[test]
    fn test_squeeze_rejects_bad_input() {
        assert!(squeeze_var(&[], 3.0, None, &QlConfig::default()).is_err());
        assert!(squeeze_var(&[1.0], 0.0, None, &QlConfig::default()).is_err());
    }
}
