//! Canonical result tables for downstream reporting.
//!
//! Tables carry the identifier as an explicit first column. No statistics
//! are computed here.

use crate::data::DeResultSet;
use crate::enrich::EnrichmentResult;
use crate::error::{PbError, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// One table cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
    /// Rendered comma-separated.
    List(Vec<String>),
    Missing,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(v) if v.is_nan() => write!(f, "NA"),
            Value::Number(v) if *v == 0.0 || (1e-4..1e6).contains(&v.abs()) => write!(f, "{}", v),
            Value::Number(v) => write!(f, "{:e}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::List(items) => write!(f, "{}", items.join(",")),
            Value::Missing => write!(f, "NA"),
        }
    }
}

/// A named-column table keyed by an identifier column.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub id_column: String,
    /// Data columns, excluding the identifier.
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<Value>)>,
}

impl ResultTable {
    pub fn new(id_column: &str, columns: Vec<String>) -> Self {
        Self {
            id_column: id_column.to_string(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Append a row; its width must match the columns.
    pub fn push_row(&mut self, id: String, values: Vec<Value>) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(PbError::DimensionMismatch {
                expected: self.columns.len(),
                actual: values.len(),
            });
        }
        self.rows.push((id, values));
        Ok(())
    }

    /// Per-gene table `gene, logFC, PValue, FDR` in result order.
    pub fn from_de(results: &DeResultSet) -> Self {
        let mut table = Self::new(
            "gene",
            vec!["logFC".into(), "PValue".into(), "FDR".into()],
        );
        table.rows = results
            .iter()
            .map(|r| {
                (
                    r.gene.clone(),
                    vec![
                        Value::Number(r.log_fc),
                        Value::Number(r.p_value),
                        Value::Number(r.fdr),
                    ],
                )
            })
            .collect();
        table
    }

    /// Per-pathway table `pathway, NES, PValue, FDR, leadingEdge`.
    pub fn from_enrichment(result: &EnrichmentResult) -> Self {
        let mut table = Self::new(
            "pathway",
            vec![
                "NES".into(),
                "PValue".into(),
                "FDR".into(),
                "leadingEdge".into(),
            ],
        );
        table.rows = result
            .rows
            .iter()
            .map(|r| {
                (
                    r.pathway.clone(),
                    vec![
                        Value::Number(r.nes),
                        Value::Number(r.p_value),
                        Value::Number(r.fdr),
                        Value::List(r.leading_edge.clone()),
                    ],
                )
            })
            .collect();
        table
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn get(&self, id: &str, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows
            .iter()
            .find(|(row_id, _)| row_id == id)
            .map(|(_, values)| &values[col])
    }

    /// Outer-join tables on their identifier. Columns are renamed
    /// `<prefix>.<column>`; identifiers keep first-appearance order and absent
    /// cells are `Missing`.
    pub fn merge_on_identifier(tables: &[(&str, &ResultTable)]) -> Result<Self> {
        let (_, first) = tables
            .first()
            .ok_or_else(|| PbError::EmptyData("No tables to merge".to_string()))?;
        let id_column = first.id_column.clone();
        if let Some((prefix, other)) = tables.iter().find(|(_, t)| t.id_column != id_column) {
            return Err(PbError::InvalidParameter(format!(
                "Table '{}' is keyed by '{}', expected '{}'",
                prefix, other.id_column, id_column
            )));
        }

        let columns: Vec<String> = tables
            .iter()
            .flat_map(|(prefix, t)| t.columns.iter().map(move |c| format!("{}.{}", prefix, c)))
            .collect();

        let mut order: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for (_, table) in tables {
            for (id, _) in &table.rows {
                if !index.contains_key(id) {
                    index.insert(id.clone(), order.len());
                    order.push(id.clone());
                }
            }
        }

        let mut cells = vec![vec![Value::Missing; columns.len()]; order.len()];
        let mut offset = 0;
        for (_, table) in tables {
            for (id, values) in &table.rows {
                let row = index[id];
                for (j, v) in values.iter().enumerate() {
                    cells[row][offset + j] = v.clone();
                }
            }
            offset += table.columns.len();
        }

        Ok(Self {
            id_column,
            columns,
            rows: order.into_iter().zip(cells).collect(),
        })
    }

    fn write_delimited<P: AsRef<Path>>(&self, path: P, delimiter: u8) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(path)?;
        let mut header = vec![self.id_column.clone()];
        header.extend(self.columns.iter().cloned());
        writer.write_record(&header)?;
        for (id, values) in &self.rows {
            let mut record = vec![id.clone()];
            record.extend(values.iter().map(|v| v.to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_delimited(path, b'\t')
    }

    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.write_delimited(path, b',')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DeResult;
    use crate::enrich::PathwayResult;
    use tempfile::NamedTempFile;

    fn de_set(name: &str, genes: &[(&str, f64, f64)]) -> DeResultSet {
        DeResultSet::new(
            name.into(),
            1.0,
            genes
                .iter()
                .map(|(g, lfc, p)| DeResult {
                    gene: g.to_string(),
                    log_fc: *lfc,
                    log_cpm: 3.0,
                    f: 2.0,
                    df: 4.0,
                    p_value: *p,
                    fdr: (*p * 2.0).min(1.0),
                })
                .collect(),
        )
    }

    #[test]
    fn test_from_de_columns() {
        let t = ResultTable::from_de(&de_set("c", &[("B", 1.0, 0.2), ("A", -2.0, 0.01)]));
        assert_eq!(t.id_column, "gene");
        assert_eq!(t.columns, vec!["logFC", "PValue", "FDR"]);
        assert_eq!(t.rows[0].0, "A");
        assert_eq!(t.get("A", "logFC"), Some(&Value::Number(-2.0)));
    }

    #[test]
    fn test_from_enrichment() {
        let result = EnrichmentResult {
            rows: vec![PathwayResult {
                pathway: "P1".into(),
                es: 0.6,
                nes: 1.8,
                p_value: 0.001,
                fdr: 0.002,
                log2err: 0.5,
                size: 20,
                leading_edge: vec!["G1".into(), "G2".into()],
            }],
            excluded: Vec::new(),
            note: None,
        };
        let t = ResultTable::from_enrichment(&result);
        assert_eq!(t.get("P1", "leadingEdge").unwrap().to_string(), "G1,G2");
        assert_eq!(t.columns.len(), 4);
    }

    #[test]
    fn test_merge_outer_join() {
        let a = ResultTable::from_de(&de_set("a", &[("G1", 1.0, 0.01), ("G2", 0.5, 0.3)]));
        let b = ResultTable::from_de(&de_set("b", &[("G3", 1.0, 0.02), ("G1", -1.0, 0.04)]));
        let merged = ResultTable::merge_on_identifier(&[("DC2", &a), ("DC3", &b)]).unwrap();
        assert_eq!(merged.columns[0], "DC2.logFC");
        assert_eq!(merged.columns[3], "DC3.logFC");
        let ids: Vec<&str> = merged.rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["G1", "G2", "G3"]);
        assert_eq!(merged.get("G1", "DC3.logFC"), Some(&Value::Number(-1.0)));
        assert_eq!(merged.get("G2", "DC3.PValue"), Some(&Value::Missing));
    }

    #[test]
    fn test_merge_rejects_mixed_identifiers() {
        let a = ResultTable::from_de(&de_set("a", &[("G1", 1.0, 0.01)]));
        let p = ResultTable::new("pathway", vec!["NES".into()]);
        assert!(ResultTable::merge_on_identifier(&[("x", &a), ("y", &p)]).is_err());
        assert!(ResultTable::merge_on_identifier(&[]).is_err());
    }

    #[test]
    fn test_write_tsv() {
        let t = ResultTable::from_de(&de_set("a", &[("G1", 1.5, 1e-12)]));
        let file = NamedTempFile::new().unwrap();
        t.to_tsv(file.path()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("gene\tlogFC\tPValue\tFDR"));
        assert_eq!(lines.next(), Some("G1\t1.5\t1e-12\t2e-12"));
    }

    #[test]
    fn test_write_csv_missing_cells() {
        let a = ResultTable::from_de(&de_set("a", &[("G1", 0.25, 0.5)]));
        let b = ResultTable::from_de(&de_set("b", &[("G2", f64::NAN, 0.5)]));
        let merged = ResultTable::merge_on_identifier(&[("a", &a), ("b", &b)]).unwrap();
        let file = NamedTempFile::new().unwrap();
        merged.to_csv(file.path()).unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "gene,a.logFC,a.PValue,a.FDR,b.logFC,b.PValue,b.FDR");
        assert_eq!(lines[1], "G1,0.25,0.5,1,NA,NA,NA");
        assert_eq!(lines[2], "G2,NA,NA,NA,NA,0.5,1");
    }

    #[test]
    fn test_push_row_width() {
        let mut t = ResultTable::new("gene", vec!["logFC".into()]);
        assert!(t.push_row("G1".into(), vec![Value::Number(1.0)]).is_ok());
        assert!(t.push_row("G2".into(), vec![]).is_err());
    }
}
