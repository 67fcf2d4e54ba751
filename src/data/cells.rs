//! Cell-level counts labelled with sample and subset.

use crate::data::CountMatrix;
use crate::error::{PbError, Result};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One row of the cell annotation table.
#[derive(Debug, Clone, Deserialize)]
struct AnnotationRecord {
    cell_id: String,
    sample_id: String,
    subset: String,
}

/// Cell counts (genes × cells) with the donor/sample and subset of every cell.
///
/// Subset labels come from an upstream annotation step and are treated as
/// opaque strings.
#[derive(Debug, Clone)]
pub struct LabeledCells {
    counts: CountMatrix,
    samples: Vec<String>,
    subsets: Vec<String>,
}

impl LabeledCells {
    pub fn new(counts: CountMatrix, samples: Vec<String>, subsets: Vec<String>) -> Result<Self> {
        let n = counts.n_columns();
        for labels in [&samples, &subsets] {
            if labels.len() != n {
                return Err(PbError::DimensionMismatch {
                    expected: n,
                    actual: labels.len(),
                });
            }
        }
        Ok(Self {
            counts,
            samples,
            subsets,
        })
    }

    /// Load a genes × cells count TSV and a `cell_id`/`sample_id`/`subset`
    /// annotation TSV. Cells without an annotation are left out; a cell
    /// annotated twice is an error.
    pub fn from_tsv<P: AsRef<Path>, Q: AsRef<Path>>(counts_path: P, annotations_path: Q) -> Result<Self> {
        let counts = CountMatrix::from_tsv(counts_path)?;

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(csv::Trim::All)
            .from_path(annotations_path.as_ref())?;
        let mut by_cell: HashMap<String, AnnotationRecord> = HashMap::new();
        for record in reader.deserialize() {
            let record: AnnotationRecord = record?;
            if by_cell.contains_key(&record.cell_id) {
                return Err(PbError::SampleMismatch(format!(
                    "cell '{}' is annotated more than once in {}",
                    record.cell_id,
                    annotations_path.as_ref().display()
                )));
            }
            by_cell.insert(record.cell_id.clone(), record);
        }
        info!(
            "Loaded {} cell annotations from {}",
            by_cell.len(),
            annotations_path.as_ref().display()
        );

        let mut keep = Vec::new();
        let mut samples = Vec::new();
        let mut subsets = Vec::new();
        for (idx, cell) in counts.column_ids().iter().enumerate() {
            if let Some(rec) = by_cell.get(cell) {
                keep.push(idx);
                samples.push(rec.sample_id.clone());
                subsets.push(rec.subset.clone());
            }
        }
        let unannotated = counts.n_columns() - keep.len();
        if unannotated > 0 {
            warn!("{} cell(s) have no annotation and are ignored", unannotated);
        }
        if keep.is_empty() {
            return Err(PbError::SampleMismatch(
                "No cells matched between count matrix and annotation table".to_string(),
            ));
        }

        let counts = if unannotated > 0 {
            counts.subset_columns(&keep)?
        } else {
            counts
        };
        Self::new(counts, samples, subsets)
    }

    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    /// Sample (donor) identifier per cell.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// Subset label per cell.
    pub fn subsets(&self) -> &[String] {
        &self.subsets
    }

    pub fn n_cells(&self) -> usize {
        self.samples.len()
    }

    pub fn n_genes(&self) -> usize {
        self.counts.n_genes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_with_unannotated_cell() {
        let mut counts = NamedTempFile::new().unwrap();
        writeln!(counts, "gene\tc1\tc2\tc3").unwrap();
        writeln!(counts, "IFI27\t1\t0\t4").unwrap();
        writeln!(counts, "CD14\t0\t2\t3").unwrap();
        counts.flush().unwrap();

        let mut ann = NamedTempFile::new().unwrap();
        writeln!(ann, "cell_id\tsample_id\tsubset").unwrap();
        writeln!(ann, "c1\tD1\tMono").unwrap();
        writeln!(ann, "c3\tD2\tMono").unwrap();
        ann.flush().unwrap();

        let cells = LabeledCells::from_tsv(counts.path(), ann.path()).unwrap();
        assert_eq!(cells.n_cells(), 2);
        assert_eq!(cells.samples(), &["D1", "D2"]);
        assert_eq!(cells.counts().row_dense(0), vec![1, 4]);
    }

    #[test]
    fn test_duplicate_cell_annotation_rejected() {
        let mut counts = NamedTempFile::new().unwrap();
        writeln!(counts, "gene\tc1\tc2").unwrap();
        writeln!(counts, "IFI27\t1\t0").unwrap();
        counts.flush().unwrap();

        let mut ann = NamedTempFile::new().unwrap();
        writeln!(ann, "cell_id\tsample_id\tsubset").unwrap();
        writeln!(ann, "c1\tD1\tMono").unwrap();
        writeln!(ann, "c2\tD1\tMono").unwrap();
        writeln!(ann, "c1\tD2\tDC2").unwrap();
        ann.flush().unwrap();

        let err = LabeledCells::from_tsv(counts.path(), ann.path()).unwrap_err();
        assert!(matches!(err, PbError::SampleMismatch(_)));
        assert!(err.to_string().contains("'c1'"));
    }

    #[test]
    fn test_label_length_mismatch() {
        let counts = CountMatrix::from_triplets(&[(0, 0, 1)], vec!["g".into()], vec!["c1".into()])
            .unwrap();
        assert!(LabeledCells::new(counts, vec![], vec!["T".into()]).is_err());
    }
}
