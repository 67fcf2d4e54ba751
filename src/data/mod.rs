//! Core data structures: counts, metadata, designs, contrasts and results.

mod cells;
mod contrast;
mod count_matrix;
mod design_matrix;
mod formula;
mod metadata;
mod result;

pub use cells::LabeledCells;
pub use contrast::Contrast;
pub use count_matrix::CountMatrix;
pub use design_matrix::DesignMatrix;
pub use formula::{Formula, Term};
pub use metadata::{Metadata, Variable, VariableType};
pub use result::{DeResult, DeResultSet, ResultSummary};
pub(crate) use result::pvalue_order;
