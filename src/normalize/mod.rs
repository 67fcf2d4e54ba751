//! Library size normalization and expression scales.
//!
//! - **TMM**: Trimmed mean of M-values scale factors (robust to asymmetric changes)
//! - **CPM**: Counts per million, log-CPM with a prior count, and AveLogCPM
//! - **Heatmap**: Per-gene z-scored log-CPM with `<group>_<profile>` labels

pub mod cpm;
pub mod tmm;

pub use cpm::{ave_log_cpm, cpm, log_cpm, HeatmapMatrix};
pub use tmm::{norm_tmm, norm_tmm_with_config, TmmConfig, TmmFactors};
