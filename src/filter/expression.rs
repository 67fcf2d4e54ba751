//! Low-expression gene filtering on pseudobulk counts.

use crate::data::CountMatrix;
use crate::error::{PbError, Result};
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

fn default_min_count() -> u64 {
    1
}

fn default_min_samples() -> usize {
    5
}

/// Keep a gene when its count exceeds `min_count` in at least `min_samples`
/// profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionFilterConfig {
    #[serde(default = "default_min_count")]
    pub min_count: u64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for ExpressionFilterConfig {
    fn default() -> Self {
        Self {
            min_count: default_min_count(),
            min_samples: default_min_samples(),
        }
    }
}

/// Filtered matrix and the genes that were removed.
#[derive(Debug, Clone)]
pub struct ExpressionFilterResult {
    pub counts: CountMatrix,
    /// Row indices of the input that were kept.
    pub kept: Vec<usize>,
    pub removed: Vec<String>,
}

/// Apply the low-expression filter.
///
/// All-zero genes never pass. When `min_samples` exceeds the number of
/// profiles it is lowered to the number of profiles.
pub fn filter_expression(
    counts: &CountMatrix,
    config: &ExpressionFilterConfig,
) -> Result<ExpressionFilterResult> {
    let n_profiles = counts.n_columns();
    if n_profiles == 0 {
        return Err(PbError::EmptyData("No profiles to filter".to_string()));
    }
    let mut min_samples = config.min_samples.max(1);
    if min_samples > n_profiles {
        warn!(
            "min_samples {} exceeds {} profiles; using {}",
            min_samples, n_profiles, n_profiles
        );
        min_samples = n_profiles;
    }

    let keep: Vec<bool> = (0..counts.n_genes())
        .into_par_iter()
        .map(|row| {
            let row = counts.row_dense(row);
            let total: u64 = row.iter().sum();
            let expressed = row.iter().filter(|&&c| c > config.min_count).count();
            total > 0 && expressed >= min_samples
        })
        .collect();

    let kept: Vec<usize> = keep
        .iter()
        .enumerate()
        .filter(|(_, &k)| k)
        .map(|(i, _)| i)
        .collect();
    let removed: Vec<String> = keep
        .iter()
        .zip(counts.gene_ids())
        .filter(|(&k, _)| !k)
        .map(|(_, id)| id.clone())
        .collect();

    if kept.is_empty() {
        return Err(PbError::EmptyData(format!(
            "No genes have count > {} in {} profiles",
            config.min_count, min_samples
        )));
    }
    info!(
        "Expression filter kept {} of {} genes (count > {} in >= {} profiles)",
        kept.len(),
        counts.n_genes(),
        config.min_count,
        min_samples
    );

    Ok(ExpressionFilterResult {
        counts: counts.subset_genes(&kept)?,
        kept,
        removed,
    })
}
