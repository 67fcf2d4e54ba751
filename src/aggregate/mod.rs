//! Pseudobulk aggregation of labelled single-cell counts.

mod pseudobulk;

pub use pseudobulk::{
    aggregate_pseudobulk, aggregation_report, AggregationConfig, AggregationReport, DropReason,
    DroppedProfile, Pseudobulk, N_CELLS_COLUMN, SAMPLE_COLUMN, SUBSET_COLUMN,
};
