//! Design matrix construction from metadata and formula.

use crate::data::{Formula, Metadata, Term, Variable, VariableType};
use crate::error::{PbError, Result};
use nalgebra::DMatrix;
use std::collections::HashMap;

/// Relative tolerance for detecting aliased design columns.
const ALIAS_TOL: f64 = 1e-8;

/// A full-rank design matrix (profiles × coefficients).
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    matrix: DMatrix<f64>,
    coefficient_names: Vec<String>,
    sample_ids: Vec<String>,
    /// Reference level used for each categorical variable.
    reference_levels: HashMap<String, String>,
}

/// Ordered levels of a categorical column, reference first.
fn ordered_levels(
    metadata: &Metadata,
    var_name: &str,
    reference_levels: &HashMap<String, String>,
) -> Result<Vec<String>> {
    let mut levels = metadata.levels(var_name)?;
    if levels.len() < 2 {
        return Err(PbError::DesignDegenerate(format!(
            "factor '{}' has {} level(s) among the retained profiles",
            var_name,
            levels.len()
        )));
    }
    if let Some(reference) = reference_levels.get(var_name) {
        let pos = levels.iter().position(|l| l == reference).ok_or_else(|| {
            PbError::InvalidParameter(format!(
                "Reference level '{}' not present for '{}' (levels: {})",
                reference,
                var_name,
                levels.join(", ")
            ))
        })?;
        let r = levels.remove(pos);
        levels.insert(0, r);
    }
    Ok(levels)
}

fn indicator(values: &[&Variable], level: &str) -> Vec<f64> {
    values
        .iter()
        .map(|v| match v {
            Variable::Categorical(s) if s == level => 1.0,
            _ => 0.0,
        })
        .collect()
}

impl DesignMatrix {
    /// Create a design matrix directly from components.
    ///
    /// Used for reduced models in contrast tests and for hand-built designs.
    pub fn from_matrix(
        matrix: DMatrix<f64>,
        coefficient_names: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        if matrix.ncols() != coefficient_names.len() {
            return Err(PbError::DimensionMismatch {
                expected: matrix.ncols(),
                actual: coefficient_names.len(),
            });
        }
        if matrix.nrows() != sample_ids.len() {
            return Err(PbError::DimensionMismatch {
                expected: matrix.nrows(),
                actual: sample_ids.len(),
            });
        }
        Ok(Self {
            matrix,
            coefficient_names,
            sample_ids,
            reference_levels: HashMap::new(),
        })
    }

    /// Build a design matrix from metadata and formula.
    ///
    /// Categorical variables use treatment coding against `reference_levels`
    /// (alphabetically first level when a variable has no entry). Without an
    /// intercept the first categorical main effect is coded with one column
    /// per level. Fails with `DesignDegenerate` when a factor has a single
    /// level or columns are linearly dependent.
    pub fn from_formula(
        metadata: &Metadata,
        formula: &Formula,
        reference_levels: &HashMap<String, String>,
    ) -> Result<Self> {
        let sample_ids = metadata.sample_ids().to_vec();
        let n_samples = sample_ids.len();

        for var in formula.variables() {
            if !metadata.has_column(var) {
                return Err(PbError::MissingColumn(var.to_string()));
            }
            if let Some(id) = metadata
                .column(var)?
                .iter()
                .zip(&sample_ids)
                .find(|(v, _)| v.is_missing())
                .map(|(_, id)| id)
            {
                return Err(PbError::InvalidParameter(format!(
                    "Missing value for '{}' in profile '{}'",
                    var, id
                )));
            }
        }

        let mut used_refs = HashMap::new();
        let mut coefficient_names = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();
        let mut full_coding_used = formula.intercept;

        if formula.intercept {
            coefficient_names.push("(Intercept)".to_string());
            columns.push(vec![1.0; n_samples]);
        }

        for term in &formula.terms {
            match term {
                Term::Main(var_name) => {
                    let values = metadata.column(var_name)?;
                    match metadata.column_type(var_name) {
                        Some(VariableType::Continuous) => {
                            coefficient_names.push(var_name.clone());
                            columns.push(
                                values
                                    .iter()
                                    .map(|v| v.as_continuous().unwrap_or(0.0))
                                    .collect(),
                            );
                        }
                        Some(VariableType::Categorical) | None => {
                            let levels = ordered_levels(metadata, var_name, reference_levels)?;
                            let skip_reference = full_coding_used;
                            full_coding_used = true;
                            if skip_reference {
                                used_refs.insert(var_name.clone(), levels[0].clone());
                            }
                            let start = if skip_reference { 1 } else { 0 };
                            for level in &levels[start..] {
                                coefficient_names.push(format!("{}{}", var_name, level));
                                columns.push(indicator(&values, level));
                            }
                        }
                    }
                }
                Term::Interaction(var1, var2) => {
                    let cols1 = Self::contrast_columns(metadata, var1, reference_levels)?;
                    let cols2 = Self::contrast_columns(metadata, var2, reference_levels)?;
                    for (name1, col1) in &cols1 {
                        for (name2, col2) in &cols2 {
                            coefficient_names.push(format!("{}:{}", name1, name2));
                            columns.push(col1.iter().zip(col2).map(|(a, b)| a * b).collect());
                        }
                    }
                }
            }
        }

        let matrix = DMatrix::from_fn(n_samples, columns.len(), |r, c| columns[c][r]);
        let design = Self {
            matrix,
            coefficient_names,
            sample_ids,
            reference_levels: used_refs,
        };
        design.check_full_rank()?;
        Ok(design)
    }

    /// Treatment-coded columns of one variable, used for interaction terms.
    fn contrast_columns(
        metadata: &Metadata,
        var_name: &str,
        reference_levels: &HashMap<String, String>,
    ) -> Result<Vec<(String, Vec<f64>)>> {
        let values = metadata.column(var_name)?;
        match metadata.column_type(var_name) {
            Some(VariableType::Continuous) => Ok(vec![(
                var_name.to_string(),
                values.iter().map(|v| v.as_continuous().unwrap_or(0.0)).collect(),
            )]),
            Some(VariableType::Categorical) | None => {
                let levels = ordered_levels(metadata, var_name, reference_levels)?;
                Ok(levels[1..]
                    .iter()
                    .map(|level| (format!("{}{}", var_name, level), indicator(&values, level)))
                    .collect())
            }
        }
    }

    /// Sequential Gram-Schmidt over columns; a column whose residual vanishes
    /// is aliased with the ones before it.
    pub fn aliased_columns(&self) -> Vec<String> {
        let mut basis: Vec<nalgebra::DVector<f64>> = Vec::new();
        let mut aliased = Vec::new();
        for (j, name) in self.coefficient_names.iter().enumerate() {
            let col = self.matrix.column(j).into_owned();
            let scale = col.norm();
            let mut resid = col;
            for q in &basis {
                let proj = q.dot(&resid);
                resid -= q * proj;
            }
            let norm = resid.norm();
            if scale == 0.0 || norm <= ALIAS_TOL * scale.max(1.0) {
                aliased.push(name.clone());
            } else {
                basis.push(resid / norm);
            }
        }
        aliased
    }

    /// Fail with `DesignDegenerate` unless the design has full column rank
    /// and at least one residual degree of freedom.
    pub fn check_full_rank(&self) -> Result<()> {
        if self.n_coefficients() > self.n_samples() {
            return Err(PbError::DesignDegenerate(format!(
                "{} coefficients for {} profiles",
                self.n_coefficients(),
                self.n_samples()
            )));
        }
        let aliased = self.aliased_columns();
        if !aliased.is_empty() {
            return Err(PbError::DesignDegenerate(format!(
                "rank-deficient design, aliased column(s): {}",
                aliased.join(", ")
            )));
        }
        Ok(())
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn coefficient_names(&self) -> &[String] {
        &self.coefficient_names
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_coefficients(&self) -> usize {
        self.matrix.ncols()
    }

    /// Residual degrees of freedom.
    pub fn residual_df(&self) -> usize {
        self.n_samples().saturating_sub(self.n_coefficients())
    }

    /// Reference level actually used for a treatment-coded variable.
    pub fn reference_level(&self, variable: &str) -> Option<&str> {
        self.reference_levels.get(variable).map(|s| s.as_str())
    }

    pub fn coefficient_index(&self, name: &str) -> Option<usize> {
        self.coefficient_names.iter().position(|n| n == name)
    }

    pub fn has_intercept(&self) -> bool {
        self.coefficient_names.first().map(String::as_str) == Some("(Intercept)")
    }
}
