//! Result tables for external handoff.

pub mod tables;

pub use tables::{ResultTable, Value};
