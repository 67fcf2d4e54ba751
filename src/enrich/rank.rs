//! Deterministic gene rankings for enrichment.

use crate::data::DeResultSet;
use crate::error::{PbError, Result};
use std::collections::{HashMap, HashSet};

/// Genes in descending score order, ties broken by ascending gene id.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedGenes {
    genes: Vec<String>,
    scores: Vec<f64>,
}

/// `sign(logFC) · −log10(p)`, with p floored at the smallest positive f64.
pub fn signed_significance(log_fc: f64, p_value: f64) -> f64 {
    let sign = if log_fc < 0.0 { -1.0 } else { 1.0 };
    let p = if p_value.is_nan() { 1.0 } else { p_value.clamp(f64::MIN_POSITIVE, 1.0) };
    sign * -p.log10()
}

impl RankedGenes {
    /// Rank arbitrary scores. Ids must be unique and scores finite.
    pub fn from_scores(mut entries: Vec<(String, f64)>) -> Result<Self> {
        let mut seen = HashSet::new();
        for (gene, score) in &entries {
            if !seen.insert(gene.as_str()) {
                return Err(PbError::InvalidParameter(format!(
                    "Gene '{}' ranked twice",
                    gene
                )));
            }
            if !score.is_finite() {
                return Err(PbError::Numerical(format!(
                    "Non-finite ranking score for gene '{}'",
                    gene
                )));
            }
        }
        entries.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let (genes, scores) = entries.into_iter().unzip();
        Ok(Self { genes, scores })
    }

    /// Rank the genes of a contrast by signed significance.
    pub fn from_de(results: &DeResultSet) -> Result<Self> {
        Self::from_scores(
            results
                .iter()
                .map(|r| (r.gene.clone(), signed_significance(r.log_fc, r.p_value)))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Gene id to rank position.
    pub fn positions(&self) -> HashMap<&str, usize> {
        self.genes
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect()
    }
}
