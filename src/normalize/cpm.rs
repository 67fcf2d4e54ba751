//! Counts per million, log-CPM and the heatmap matrix.

use crate::data::{CountMatrix, Metadata};
use crate::error::{PbError, Result};
use nalgebra::DMatrix;
use std::path::Path;

/// Counts per million using effective library sizes.
pub fn cpm(counts: &CountMatrix, effective_lib_sizes: &[f64]) -> Result<DMatrix<f64>> {
    check_libs(counts, effective_lib_sizes)?;
    let dense = counts.to_dense();
    Ok(DMatrix::from_fn(dense.nrows(), dense.ncols(), |i, j| {
        dense[(i, j)] / effective_lib_sizes[j] * 1e6
    }))
}

fn check_libs(counts: &CountMatrix, effective_lib_sizes: &[f64]) -> Result<()> {
    if effective_lib_sizes.len() != counts.n_columns() {
        return Err(PbError::DimensionMismatch {
            expected: counts.n_columns(),
            actual: effective_lib_sizes.len(),
        });
    }
    if effective_lib_sizes.iter().any(|&l| !(l > 0.0)) {
        return Err(PbError::Numerical(
            "effective library sizes must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Prior counts scaled to each library, and libraries enlarged to match.
fn scaled_prior(effective_lib_sizes: &[f64], prior_count: f64) -> (Vec<f64>, Vec<f64>) {
    let mean_lib = effective_lib_sizes.iter().sum::<f64>() / effective_lib_sizes.len() as f64;
    let priors: Vec<f64> = effective_lib_sizes
        .iter()
        .map(|l| prior_count * l / mean_lib)
        .collect();
    let libs = effective_lib_sizes
        .iter()
        .zip(&priors)
        .map(|(l, p)| l + 2.0 * p)
        .collect();
    (priors, libs)
}

/// log2 CPM with a library-size-scaled prior count (edgeR convention).
pub fn log_cpm(
    counts: &CountMatrix,
    effective_lib_sizes: &[f64],
    prior_count: f64,
) -> Result<DMatrix<f64>> {
    check_libs(counts, effective_lib_sizes)?;
    let (priors, libs) = scaled_prior(effective_lib_sizes, prior_count);
    let dense = counts.to_dense();
    Ok(DMatrix::from_fn(dense.nrows(), dense.ncols(), |i, j| {
        ((dense[(i, j)] + priors[j]) / libs[j] * 1e6).log2()
    }))
}

/// Average log2 CPM per gene.
///
/// Pooled estimate `log2(Σ(y + prior) / Σ lib · 1e6)`, which is the
/// one-group Poisson fit of the prior-augmented counts.
pub fn ave_log_cpm(
    counts: &CountMatrix,
    effective_lib_sizes: &[f64],
    prior_count: f64,
) -> Result<Vec<f64>> {
    check_libs(counts, effective_lib_sizes)?;
    let (priors, libs) = scaled_prior(effective_lib_sizes, prior_count);
    let total_lib: f64 = libs.iter().sum();
    let prior_sum: f64 = priors.iter().sum();
    Ok(counts
        .row_sums()
        .iter()
        .map(|&y| ((y as f64 + prior_sum) / total_lib * 1e6).log2())
        .collect())
}

/// Per-gene z-scored log-CPM with `<group>_<sample>` column labels.
#[derive(Debug, Clone)]
pub struct HeatmapMatrix {
    pub gene_ids: Vec<String>,
    pub column_labels: Vec<String>,
    /// Genes × profiles, each row centred and scaled to unit variance.
    pub values: DMatrix<f64>,
}

impl HeatmapMatrix {
    /// z-score each row of `log_cpm`. Rows with zero variance become zeros.
    ///
    /// Column labels join the profile's `group` value and its id with `_`.
    pub fn from_log_cpm(
        log_cpm: &DMatrix<f64>,
        gene_ids: &[String],
        metadata: &Metadata,
        group: &str,
    ) -> Result<Self> {
        if log_cpm.ncols() != metadata.n_samples() {
            return Err(PbError::DimensionMismatch {
                expected: metadata.n_samples(),
                actual: log_cpm.ncols(),
            });
        }
        let groups = metadata.column(group)?;
        let column_labels = metadata
            .sample_ids()
            .iter()
            .zip(groups)
            .map(|(id, g)| format!("{}_{}", g.label(), id))
            .collect();

        let n = log_cpm.ncols() as f64;
        let mut values = log_cpm.clone();
        for mut row in values.row_iter_mut() {
            let mean = row.sum() / n;
            let var = if n > 1.0 {
                row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
            } else {
                0.0
            };
            let sd = var.sqrt();
            for v in row.iter_mut() {
                *v = if sd > 0.0 { (*v - mean) / sd } else { 0.0 };
            }
        }

        Ok(Self {
            gene_ids: gene_ids.to_vec(),
            column_labels,
            values,
        })
    }

    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)?;
        let mut header = vec!["gene".to_string()];
        header.extend(self.column_labels.iter().cloned());
        writer.write_record(&header)?;
        for (i, gene) in self.gene_ids.iter().enumerate() {
            let mut record = vec![gene.clone()];
            record.extend(self.values.row(i).iter().map(|v| format!("{:.6}", v)));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }
}
