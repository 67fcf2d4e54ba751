//! Hypothesis tests on fitted models.


pub use qlf::{null_space_basis, test_ql_f};
