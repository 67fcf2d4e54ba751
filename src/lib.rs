//! Pseudobulk Differential Expression Library
//!
//! This library turns subset-labelled single-cell counts into per-donor
//! pseudobulk profiles and tests them with negative binomial quasi-likelihood
//! models, followed by preranked gene set enrichment.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (CountMatrix, LabeledCells, Metadata, DesignMatrix, Contrast, Results)
//! - **aggregate**: Summation of cells into (sample, subset) profiles
//! - **filter**: Low-expression gene filter
//! - **normalize**: TMM factors, CPM/logCPM, heatmap matrices
//! - **model**: NB GLM, dispersion estimation, QL fit with empirical Bayes squeezing
//! - **test**: QL F-test of contrasts
//! - **correct**: Multiple testing correction (Benjamini-Hochberg)
//! - **enrich**: Preranked GSEA with multilevel p-values
//! - **report**: Canonical result tables
//! - **pipeline**: YAML configuration and batch execution
//!
//! # Example
//!
//! ```no_run
//! use pseudobulk_de::prelude::*;
//! use std::collections::HashMap;
//!
//! let cells = LabeledCells::from_tsv("counts.tsv", "cells.tsv").unwrap();
//! let samples = Metadata::from_tsv("samples.tsv").unwrap();
//!
//! let config = AggregationConfig {
//!     subsets: Some(vec!["DC2".to_string()]),
//!     group: Some("disease".to_string()),
//!     ..Default::default()
//! };
//! let (pb, _report) = aggregate_pseudobulk(&cells, &samples, &config).unwrap();
//! let kept = filter_expression(&pb.counts, &ExpressionFilterConfig::default()).unwrap();
//! let norm = norm_tmm(&kept.counts).unwrap();
//!
//! let formula = Formula::parse("~ disease").unwrap();
//! let refs: HashMap<String, String> =
//!     [("disease".to_string(), "healthy".to_string())].into_iter().collect();
//! let design = DesignMatrix::from_formula(&pb.metadata, &formula, &refs).unwrap();
//!
//! let fit = fit_ql(&kept.counts, &design, &norm, &DispersionConfig::default(), &QlConfig::default())
//!     .unwrap();
//! let contrast = Contrast::parse("covid_vs_healthy", "diseasecovid").unwrap();
//! let results = test_ql_f(&fit, &contrast).unwrap();
//! ResultTable::from_de(&results).to_tsv("de.tsv").unwrap();
//! ```

pub mod aggregate;
pub mod correct;
pub mod data;
pub mod enrich;
pub mod error;
pub mod filter;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod test;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::aggregate::{
        aggregate_pseudobulk, AggregationConfig, AggregationReport, DropReason, DroppedProfile,
        Pseudobulk,
    };
    pub use crate::correct::bh_adjust;
    pub use crate::data::{
        Contrast, CountMatrix, DeResult, DeResultSet, DesignMatrix, Formula, LabeledCells,
        Metadata, Term, Variable, VariableType,
    };
    pub use crate::enrich::{
        run_gsea, EnrichmentResult, GeneSet, GeneSetCollection, GseaConfig, PathwayResult,
        RankedGenes,
    };
    pub use crate::error::{Note, PbError, Result};
    pub use crate::filter::{filter_expression, ExpressionFilterConfig, ExpressionFilterResult};
    pub use crate::model::{
        estimate_dispersions, fit_glm, fit_ql, squeeze_var, DispersionConfig, Dispersions, GlmFit,
        QlConfig, QlFit,
    };
    pub use crate::normalize::{
        ave_log_cpm, cpm, log_cpm, norm_tmm, norm_tmm_with_config, HeatmapMatrix, TmmConfig,
        TmmFactors,
    };
    pub use crate::pipeline::{
        run_batch, run_comparison, write_outputs, AnalysisConfig, BatchReport, ComparisonConfig,
        Inputs,
    };
    pub use crate::report::{ResultTable, Value};
    pub use crate::test::test_ql_f;
}
