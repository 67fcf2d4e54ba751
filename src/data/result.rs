//! Per-gene differential expression results.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Test result for one gene under one contrast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeResult {
    pub gene: String,
    /// Log2 fold change, `cᵀβ / ln 2`.
    #[serde(rename = "logFC")]
    pub log_fc: f64,
    /// Average log2 counts per million.
    #[serde(rename = "logCPM")]
    pub log_cpm: f64,
    #[serde(rename = "F")]
    pub f: f64,
    /// Denominator df of the F-test (prior plus residual).
    #[serde(rename = "df.total")]
    pub df: f64,
    #[serde(rename = "PValue")]
    pub p_value: f64,
    #[serde(rename = "FDR")]
    pub fdr: f64,
}

/// Results of one contrast, sorted by ascending p-value with ties broken by
/// gene identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeResultSet {
    pub contrast: String,
    /// Numerator degrees of freedom.
    pub df1: f64,
    pub results: Vec<DeResult>,
}

/// Order by p-value, then gene id.
pub(crate) fn pvalue_order(a_p: f64, a_id: &str, b_p: f64, b_id: &str) -> Ordering {
    a_p.partial_cmp(&b_p)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a_id.cmp(b_id))
}

impl DeResultSet {
    /// Build a result set; rows are sorted on construction.
    pub fn new(contrast: String, df1: f64, mut results: Vec<DeResult>) -> Self {
        results.sort_by(|a, b| pvalue_order(a.p_value, &a.gene, b.p_value, &b.gene));
        Self {
            contrast,
            df1,
            results,
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeResult> {
        self.results.iter()
    }

    pub fn get(&self, gene: &str) -> Option<&DeResult> {
        self.results.iter().find(|r| r.gene == gene)
    }

    /// Genes with FDR below `alpha`.
    pub fn significant_at(&self, alpha: f64) -> Vec<&DeResult> {
        self.results.iter().filter(|r| r.fdr < alpha).collect()
    }

    /// Count up- and down-regulated genes at FDR < 0.05.
    pub fn summary(&self) -> ResultSummary {
        let sig = self.significant_at(0.05);
        ResultSummary {
            total: self.len(),
            up: sig.iter().filter(|r| r.log_fc > 0.0).count(),
            down: sig.iter().filter(|r| r.log_fc < 0.0).count(),
        }
    }
}

/// Significant gene counts for one contrast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: usize,
    pub up: usize,
    pub down: usize,
}

impl std::fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} genes tested, {} up / {} down at FDR < 0.05",
            self.total, self.up, self.down
        )
    }
}
