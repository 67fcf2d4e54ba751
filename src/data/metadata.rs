//! Sample and profile metadata tables.

use crate::error::{PbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Variable {
    /// Categorical variable with string levels.
    Categorical(String),
    /// Continuous numeric variable.
    Continuous(f64),
    Missing,
}

impl Variable {
    pub fn is_missing(&self) -> bool {
        matches!(self, Variable::Missing)
    }

    pub fn as_categorical(&self) -> Option<&str> {
        match self {
            Variable::Categorical(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_continuous(&self) -> Option<f64> {
        match self {
            Variable::Continuous(v) => Some(*v),
            _ => None,
        }
    }

    /// Text form used when a value becomes part of a label.
    pub fn label(&self) -> String {
        match self {
            Variable::Categorical(s) => s.clone(),
            Variable::Continuous(v) => v.to_string(),
            Variable::Missing => "NA".to_string(),
        }
    }
}

/// Type hint for columns when loading metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Categorical,
    Continuous,
}

/// Metadata rows keyed by identifier (donor/sample, or pseudobulk profile).
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Row identifiers in order.
    sample_ids: Vec<String>,
    column_names: Vec<String>,
    /// row id -> column name -> value
    data: HashMap<String, HashMap<String, Variable>>,
    column_types: HashMap<String, VariableType>,
}

fn parse_cell(raw: &str, var_type: VariableType) -> Variable {
    let raw = raw.trim();
    if raw.is_empty() || raw == "NA" || raw == "na" {
        return Variable::Missing;
    }
    match var_type {
        VariableType::Continuous => raw
            .parse::<f64>()
            .map(Variable::Continuous)
            .unwrap_or(Variable::Missing),
        VariableType::Categorical => Variable::Categorical(raw.to_string()),
    }
}

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self {
            sample_ids: Vec::new(),
            column_names: Vec::new(),
            data: HashMap::new(),
            column_types: HashMap::new(),
        }
    }

    /// Load metadata from a TSV file.
    ///
    /// The first column holds row identifiers. Columns whose values all parse as
    /// numbers are continuous, everything else is categorical. Use
    /// `with_column_types` to force e.g. numeric batch codes to categorical.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| PbError::EmptyData("Empty metadata file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(PbError::EmptyData(
                "Metadata must have at least one variable column".to_string(),
            ));
        }
        let column_names: Vec<String> = header[1..].iter().map(|s| s.trim().to_string()).collect();

        let mut raw_data: Vec<(String, Vec<String>)> = Vec::new();
        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let values: Vec<String> = fields[1..].iter().map(|s| s.to_string()).collect();
            raw_data.push((fields[0].trim().to_string(), values));
        }

        if raw_data.is_empty() {
            return Err(PbError::EmptyData("No samples in metadata".to_string()));
        }

        let mut meta = Self::new();
        meta.column_names = column_names.clone();
        for (col_idx, col_name) in column_names.iter().enumerate() {
            let all_numeric = raw_data.iter().all(|(_, values)| match values.get(col_idx) {
                None => true,
                Some(v) => {
                    let v = v.trim();
                    v.is_empty() || v == "NA" || v == "na" || v.parse::<f64>().is_ok()
                }
            });
            let var_type = if all_numeric {
                VariableType::Continuous
            } else {
                VariableType::Categorical
            };
            meta.column_types.insert(col_name.clone(), var_type);
        }

        for (sample_id, values) in raw_data {
            if meta.data.contains_key(&sample_id) {
                return Err(PbError::SampleMismatch(format!(
                    "Duplicate sample '{}' in metadata",
                    sample_id
                )));
            }
            let mut row = HashMap::new();
            for (col_idx, col_name) in column_names.iter().enumerate() {
                let var = match values.get(col_idx) {
                    None => Variable::Missing,
                    Some(raw) => parse_cell(raw, meta.column_types[col_name]),
                };
                row.insert(col_name.clone(), var);
            }
            meta.sample_ids.push(sample_id.clone());
            meta.data.insert(sample_id, row);
        }

        Ok(meta)
    }

    /// Build metadata from in-memory rows. Column types are taken from the
    /// first non-missing value of each column.
    pub fn from_records(
        column_names: Vec<String>,
        rows: Vec<(String, Vec<Variable>)>,
    ) -> Result<Self> {
        let mut meta = Self::new();
        for (col_idx, col_name) in column_names.iter().enumerate() {
            let var_type = rows
                .iter()
                .filter_map(|(_, values)| values.get(col_idx))
                .find(|v| !v.is_missing())
                .map(|v| match v {
                    Variable::Continuous(_) => VariableType::Continuous,
                    _ => VariableType::Categorical,
                })
                .unwrap_or(VariableType::Categorical);
            meta.column_types.insert(col_name.clone(), var_type);
        }
        meta.column_names = column_names;

        for (id, values) in rows {
            if values.len() != meta.column_names.len() {
                return Err(PbError::DimensionMismatch {
                    expected: meta.column_names.len(),
                    actual: values.len(),
                });
            }
            if meta.data.contains_key(&id) {
                return Err(PbError::SampleMismatch(format!("Duplicate row '{}'", id)));
            }
            let row = meta.column_names.iter().cloned().zip(values).collect();
            meta.sample_ids.push(id.clone());
            meta.data.insert(id, row);
        }
        Ok(meta)
    }

    /// Override the type of specific columns, re-interpreting their values.
    pub fn with_column_types(mut self, types: HashMap<String, VariableType>) -> Self {
        for (col_name, var_type) in &types {
            self.column_types.insert(col_name.clone(), *var_type);
            for row in self.data.values_mut() {
                if let Some(var) = row.get_mut(col_name) {
                    *var = match (&*var, var_type) {
                        (Variable::Missing, _) => Variable::Missing,
                        (other, VariableType::Categorical) => Variable::Categorical(other.label()),
                        (Variable::Categorical(s), VariableType::Continuous) => {
                            parse_cell(s, VariableType::Continuous)
                        }
                        (Variable::Continuous(v), VariableType::Continuous) => {
                            Variable::Continuous(*v)
                        }
                    };
                }
            }
        }
        self
    }

    /// Add a categorical column joining several columns with `_`,
    /// e.g. `severity` and `subset` into `severity_subset`.
    ///
    /// Rows with a missing component get a missing value.
    pub fn with_combined_column(mut self, name: &str, columns: &[String]) -> Result<Self> {
        if columns.is_empty() {
            return Err(PbError::InvalidParameter(format!(
                "Derived column '{}' needs at least one source column",
                name
            )));
        }
        for col in columns {
            if !self.has_column(col) {
                return Err(PbError::MissingColumn(col.clone()));
            }
        }
        for row in self.data.values_mut() {
            let parts: Vec<&Variable> = columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Variable::Missing))
                .collect();
            let value = if parts.iter().any(|v| v.is_missing()) {
                Variable::Missing
            } else {
                Variable::Categorical(
                    parts.iter().map(|v| v.label()).collect::<Vec<_>>().join("_"),
                )
            };
            row.insert(name.to_string(), value);
        }
        if !self.has_column(name) {
            self.column_names.push(name.to_string());
        }
        self.column_types
            .insert(name.to_string(), VariableType::Categorical);
        Ok(self)
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn n_columns(&self) -> usize {
        self.column_names.len()
    }

    /// Value for a specific row and column.
    pub fn get(&self, sample_id: &str, column: &str) -> Option<&Variable> {
        self.data.get(sample_id).and_then(|m| m.get(column))
    }

    /// All values of a column, in row order.
    pub fn column(&self, column: &str) -> Result<Vec<&Variable>> {
        if !self.has_column(column) {
            return Err(PbError::MissingColumn(column.to_string()));
        }
        Ok(self
            .sample_ids
            .iter()
            .map(|sid| {
                self.data
                    .get(sid)
                    .and_then(|m| m.get(column))
                    .unwrap_or(&Variable::Missing)
            })
            .collect())
    }

    pub fn column_type(&self, column: &str) -> Option<VariableType> {
        self.column_types.get(column).copied()
    }

    /// Distinct levels of a categorical column, sorted.
    pub fn levels(&self, column: &str) -> Result<Vec<String>> {
        let values = self.column(column)?;
        let levels: BTreeSet<String> = values
            .iter()
            .filter_map(|v| v.as_categorical().map(String::from))
            .collect();
        Ok(levels.into_iter().collect())
    }

    /// Row identifiers grouped by level of a categorical column.
    pub fn level_counts(&self, column: &str) -> Result<Vec<(String, usize)>> {
        let values = self.column(column)?;
        let mut counts: std::collections::BTreeMap<String, usize> = Default::default();
        for v in values.iter().filter_map(|v| v.as_categorical()) {
            *counts.entry(v.to_string()).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }

    /// Keep the given rows, in the given order.
    pub fn subset_samples(&self, sample_ids: &[String]) -> Result<Self> {
        let mut new_data = HashMap::new();
        let mut new_sample_ids = Vec::new();

        for sid in sample_ids {
            match self.data.get(sid) {
                Some(row) => {
                    new_data.insert(sid.clone(), row.clone());
                    new_sample_ids.push(sid.clone());
                }
                None => {
                    return Err(PbError::SampleMismatch(format!(
                        "Sample '{}' not found in metadata",
                        sid
                    )))
                }
            }
        }

        Ok(Self {
            sample_ids: new_sample_ids,
            column_names: self.column_names.clone(),
            data: new_data,
            column_types: self.column_types.clone(),
        })
    }

    pub fn has_sample(&self, sample_id: &str) -> bool {
        self.data.contains_key(sample_id)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_names.iter().any(|c| c == column)
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_tsv() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample_id\tdisease\tage\tbatch").unwrap();
        writeln!(file, "D1\thealthy\t25\t1").unwrap();
        writeln!(file, "D2\tcovid\t30\t2").unwrap();
        writeln!(file, "D3\thealthy\t35\t1").unwrap();
        writeln!(file, "D4\tcovid\t28\t2").unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_load_and_infer_types() {
        let file = create_test_tsv();
        let meta = Metadata::from_tsv(file.path()).unwrap();

        assert_eq!(meta.n_samples(), 4);
        assert_eq!(meta.column_names(), &["disease", "age", "batch"]);
        assert_eq!(meta.column_type("disease"), Some(VariableType::Categorical));
        assert_eq!(meta.column_type("age"), Some(VariableType::Continuous));
        assert_eq!(meta.get("D2", "age").unwrap().as_continuous(), Some(30.0));
    }

    #[test]
    fn test_force_batch_categorical() {
        let file = create_test_tsv();
        let mut types = HashMap::new();
        types.insert("batch".to_string(), VariableType::Categorical);
        let meta = Metadata::from_tsv(file.path()).unwrap().with_column_types(types);

        assert_eq!(meta.get("D2", "batch").unwrap().as_categorical(), Some("2"));
        assert_eq!(meta.levels("batch").unwrap(), vec!["1", "2"]);
    }

    #[test]
    fn test_levels_and_counts() {
        let file = create_test_tsv();
        let meta = Metadata::from_tsv(file.path()).unwrap();
        assert_eq!(meta.levels("disease").unwrap(), vec!["covid", "healthy"]);
        assert_eq!(
            meta.level_counts("disease").unwrap(),
            vec![("covid".to_string(), 2), ("healthy".to_string(), 2)]
        );
        assert!(meta.levels("nope").is_err());
    }

    #[test]
    fn test_combined_column() {
        let meta = Metadata::from_records(
            vec!["severity".into(), "subset".into()],
            vec![
                ("p1".into(), vec![Variable::Categorical("severe".into()), Variable::Categorical("DC3".into())]),
                ("p2".into(), vec![Variable::Categorical("healthy".into()), Variable::Missing]),
            ],
        )
        .unwrap()
        .with_combined_column("severity_subset", &["severity".into(), "subset".into()])
        .unwrap();

        assert_eq!(
            meta.get("p1", "severity_subset").unwrap().as_categorical(),
            Some("severe_DC3")
        );
        assert!(meta.get("p2", "severity_subset").unwrap().is_missing());
        assert_eq!(meta.column_type("severity_subset"), Some(VariableType::Categorical));
    }

    #[test]
    fn test_subset_samples() {
        let file = create_test_tsv();
        let meta = Metadata::from_tsv(file.path()).unwrap();

        let subset = meta.subset_samples(&["D3".to_string(), "D1".to_string()]).unwrap();
        assert_eq!(subset.sample_ids(), &["D3", "D1"]);
        assert!(meta.subset_samples(&["D9".to_string()]).is_err());
    }

    #[test]
    fn test_missing_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "sample_id\tdisease\tage").unwrap();
        writeln!(file, "D1\thealthy\t25").unwrap();
        writeln!(file, "D2\tcovid\tNA").unwrap();
        writeln!(file, "D3\t\t30").unwrap();
        file.flush().unwrap();

        let meta = Metadata::from_tsv(file.path()).unwrap();
        assert!(meta.get("D2", "age").unwrap().is_missing());
        assert!(meta.get("D3", "disease").unwrap().is_missing());
    }
}
