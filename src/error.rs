//! Error types for the pseudobulk-de library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the library.
#[derive(Error, Debug)]
pub enum PbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid count value '{value}' at row {row}, column {col}")]
    InvalidCount {
        value: String,
        row: usize,
        col: usize,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Sample ID mismatch: {0}")]
    SampleMismatch(String),

    #[error("Missing column '{0}' in metadata")]
    MissingColumn(String),

    #[error("Formula parse error: {0}")]
    FormulaParse(String),

    #[error("Contrast parse error: {0}")]
    ContrastParse(String),

    #[error("Empty data: {0}")]
    EmptyData(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A design cell has fewer samples than the replicate minimum.
    #[error("Insufficient replicates for '{factor}' level '{level}': {observed} sample(s), need {required}")]
    InsufficientReplicates {
        factor: String,
        level: String,
        observed: usize,
        required: usize,
    },

    /// Rank-deficient design or a factor with a single level.
    #[error("Degenerate design: {0}")]
    DesignDegenerate(String),

    /// Contrast cannot be expressed in the design's coefficient space.
    #[error("Invalid contrast '{contrast}': {reason}")]
    InvalidContrast { contrast: String, reason: String },

    #[error("Dispersion estimation failed: {0}")]
    DispersionEstimation(String),

    /// Every gene set of a collection fell outside the size bounds.
    #[error("No gene sets within size bounds [{min_size}, {max_size}] ({excluded} excluded)")]
    GeneSetSize {
        min_size: usize,
        max_size: usize,
        excluded: usize,
    },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PbError {
    /// Stable machine-readable code used in batch reports.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PbError::InsufficientReplicates { .. } => "INSUFFICIENT_REPLICATES",
            PbError::DesignDegenerate(_) => "DESIGN_DEGENERATE",
            PbError::InvalidContrast { .. } | PbError::ContrastParse(_) => "INVALID_CONTRAST",
            PbError::DispersionEstimation(_) => "DISPERSION_ESTIMATION",
            PbError::GeneSetSize { .. } => "GENE_SET_SIZE",
            PbError::EmptyData(_) => "EMPTY_DATA",
            PbError::Numerical(_) => "NUMERICAL",
            PbError::InvalidParameter(_) | PbError::FormulaParse(_) => "INVALID_PARAMETER",
            PbError::MissingColumn(_)
            | PbError::SampleMismatch(_)
            | PbError::DimensionMismatch { .. } => "INPUT_MISMATCH",
            PbError::Io(_)
            | PbError::Csv(_)
            | PbError::InvalidCount { .. }
            | PbError::Yaml(_)
            | PbError::Json(_) => "IO",
            PbError::Pipeline(_) => "PIPELINE",
        }
    }
}

/// A reason code and message kept in a report instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub reason_code: String,
    pub message: String,
}

impl From<&PbError> for Note {
    fn from(err: &PbError) -> Self {
        Self {
            reason_code: err.reason_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, PbError>;
