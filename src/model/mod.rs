//! Negative binomial GLMs, dispersion estimation and quasi-likelihood fits.

pub mod dispersion;
pub mod glm;
pub mod ql;

pub use dispersion::{estimate_dispersions, DispersionConfig, Dispersions};
pub use glm::{fit_glm, fit_nb_glm, GlmFit, GlmFitSingle};
pub use ql::{fit_ql, squeeze_var, QlConfig, QlFit, SqueezedVar};
