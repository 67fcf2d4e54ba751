//! Configuration and batch execution of pseudobulk comparisons.

pub mod config;
mod runner;

pub use config::{
    example_yaml, AnalysisConfig, ComparisonConfig, ContrastSpec, EnrichmentConfig, InputPaths,
};
pub use runner::{
    analyze_profiles, run_batch, run_comparison, write_outputs, BatchOutcome, BatchReport,
    ComparisonResult, ContrastResult, Inputs, SkippedComparison,
};
