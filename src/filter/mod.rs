//! Filtering primitives for pseudobulk count matrices.

pub mod expression;

pub use expression::{filter_expression, ExpressionFilterConfig, ExpressionFilterResult};
