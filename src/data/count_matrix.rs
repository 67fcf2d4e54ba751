//! Sparse gene count matrix shared by cell-level and pseudobulk data.

use crate::error::{PbError, Result};
use rayon::prelude::*;
use sprs::{CsMat, TriMat};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// A sparse count matrix with genes on rows.
///
/// Columns are cells for raw input and pseudobulk profiles after aggregation.
/// Stored as CSR so per-gene access (the hot path for model fitting) is cheap.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    /// Sparse matrix in CSR format (genes × columns)
    data: CsMat<u64>,
    gene_ids: Vec<String>,
    column_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a new CountMatrix from a sparse matrix and identifiers.
    pub fn new(data: CsMat<u64>, gene_ids: Vec<String>, column_ids: Vec<String>) -> Result<Self> {
        let (nrows, ncols) = data.shape();
        if nrows != gene_ids.len() {
            return Err(PbError::DimensionMismatch {
                expected: nrows,
                actual: gene_ids.len(),
            });
        }
        if ncols != column_ids.len() {
            return Err(PbError::DimensionMismatch {
                expected: ncols,
                actual: column_ids.len(),
            });
        }
        Ok(Self {
            data,
            gene_ids,
            column_ids,
        })
    }

    /// Build from `(gene, column, count)` triplets. Repeated coordinates are summed.
    pub fn from_triplets(
        triplets: &[(usize, usize, u64)],
        gene_ids: Vec<String>,
        column_ids: Vec<String>,
    ) -> Result<Self> {
        let shape = (gene_ids.len(), column_ids.len());
        let mut tri_mat = TriMat::new(shape);
        for &(row, col, val) in triplets {
            if row >= shape.0 || col >= shape.1 {
                return Err(PbError::InvalidParameter(format!(
                    "Triplet ({}, {}) outside a {}x{} matrix",
                    row, col, shape.0, shape.1
                )));
            }
            if val > 0 {
                tri_mat.add_triplet(row, col, val);
            }
        }
        Self::new(tri_mat.to_csr(), gene_ids, column_ids)
    }

    /// Load a count matrix from a TSV file.
    ///
    /// The header holds column IDs after a leading gene ID header cell; each
    /// following row is a gene ID and its counts.
    pub fn from_tsv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let header_line = lines
            .next()
            .ok_or_else(|| PbError::EmptyData("Empty TSV file".to_string()))??;
        let header: Vec<&str> = header_line.split('\t').collect();
        if header.len() < 2 {
            return Err(PbError::EmptyData(
                "TSV must have at least one count column".to_string(),
            ));
        }
        let column_ids: Vec<String> = header[1..].iter().map(|s| s.trim().to_string()).collect();
        let n_columns = column_ids.len();

        let mut triplets: Vec<(usize, usize, u64)> = Vec::new();
        let mut gene_ids: Vec<String> = Vec::new();

        for line_result in lines {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            let row_idx = gene_ids.len();
            gene_ids.push(fields[0].trim().to_string());

            if fields.len() - 1 != n_columns {
                return Err(PbError::DimensionMismatch {
                    expected: n_columns,
                    actual: fields.len() - 1,
                });
            }
            for (col_idx, value_str) in fields[1..].iter().enumerate() {
                let value: u64 = value_str.trim().parse().map_err(|_| PbError::InvalidCount {
                    value: value_str.to_string(),
                    row: row_idx,
                    col: col_idx,
                })?;
                if value > 0 {
                    triplets.push((row_idx, col_idx, value));
                }
            }
        }

        if gene_ids.is_empty() {
            return Err(PbError::EmptyData("No genes in TSV".to_string()));
        }

        Self::from_triplets(&triplets, gene_ids, column_ids)
    }

    /// Write the count matrix to a TSV file.
    pub fn to_tsv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        write!(writer, "gene")?;
        for column_id in &self.column_ids {
            write!(writer, "\t{}", column_id)?;
        }
        writeln!(writer)?;

        for (row_idx, gene_id) in self.gene_ids.iter().enumerate() {
            write!(writer, "{}", gene_id)?;
            for value in self.row_dense(row_idx) {
                write!(writer, "\t{}", value)?;
            }
            writeln!(writer)?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Get the value at (row, col), returning 0 for missing entries.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u64 {
        self.data.get(row, col).copied().unwrap_or(0)
    }

    #[inline]
    pub fn n_genes(&self) -> usize {
        self.data.rows()
    }

    #[inline]
    pub fn n_columns(&self) -> usize {
        self.data.cols()
    }

    #[inline]
    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    #[inline]
    pub fn column_ids(&self) -> &[String] {
        &self.column_ids
    }

    /// Position of a column identifier.
    pub fn column_index(&self, id: &str) -> Option<usize> {
        self.column_ids.iter().position(|c| c == id)
    }

    /// Dense counts for one gene.
    pub fn row_dense(&self, row: usize) -> Vec<u64> {
        let mut dense = vec![0u64; self.n_columns()];
        if let Some(row_vec) = self.data.outer_view(row) {
            for (col, &val) in row_vec.iter() {
                dense[col] = val;
            }
        }
        dense
    }

    /// Dense counts for one column.
    pub fn col_dense(&self, col: usize) -> Vec<u64> {
        (0..self.n_genes()).map(|row| self.get(row, col)).collect()
    }

    /// Total counts per gene.
    pub fn row_sums(&self) -> Vec<u64> {
        (0..self.n_genes())
            .into_par_iter()
            .map(|row| {
                self.data
                    .outer_view(row)
                    .map(|v| v.iter().map(|(_, &val)| val).sum())
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Library sizes (total counts per column).
    pub fn col_sums(&self) -> Vec<u64> {
        let mut sums = vec![0u64; self.n_columns()];
        for row_vec in self.data.outer_iterator() {
            for (col, &val) in row_vec.iter() {
                sums[col] += val;
            }
        }
        sums
    }

    /// Sum columns into groups.
    ///
    /// `assignment[c]` is the output column for input column `c`, or `None` to
    /// leave it out. Output columns are labelled by `group_ids`.
    pub fn sum_columns(
        &self,
        assignment: &[Option<usize>],
        group_ids: Vec<String>,
    ) -> Result<Self> {
        if assignment.len() != self.n_columns() {
            return Err(PbError::DimensionMismatch {
                expected: self.n_columns(),
                actual: assignment.len(),
            });
        }
        let mut triplets = Vec::new();
        for (row, row_vec) in self.data.outer_iterator().enumerate() {
            for (col, &val) in row_vec.iter() {
                if let Some(group) = assignment[col] {
                    triplets.push((row, group, val));
                }
            }
        }
        Self::from_triplets(&triplets, self.gene_ids.clone(), group_ids)
    }

    /// Keep only the given genes, in the given order.
    pub fn subset_genes(&self, indices: &[usize]) -> Result<Self> {
        let mut triplets = Vec::new();
        let mut gene_ids = Vec::with_capacity(indices.len());

        for (new_row, &old_row) in indices.iter().enumerate() {
            if old_row >= self.n_genes() {
                return Err(PbError::InvalidParameter(format!(
                    "Gene index {} out of bounds",
                    old_row
                )));
            }
            gene_ids.push(self.gene_ids[old_row].clone());
            if let Some(row_vec) = self.data.outer_view(old_row) {
                for (col, &val) in row_vec.iter() {
                    triplets.push((new_row, col, val));
                }
            }
        }

        Self::from_triplets(&triplets, gene_ids, self.column_ids.clone())
    }

    /// Keep only the given columns, in the given order.
    pub fn subset_columns(&self, indices: &[usize]) -> Result<Self> {
        let mut assignment = vec![None; self.n_columns()];
        let mut column_ids = Vec::with_capacity(indices.len());
        for (new_col, &old_col) in indices.iter().enumerate() {
            if old_col >= self.n_columns() {
                return Err(PbError::InvalidParameter(format!(
                    "Column index {} out of bounds",
                    old_col
                )));
            }
            assignment[old_col] = Some(new_col);
            column_ids.push(self.column_ids[old_col].clone());
        }
        self.sum_columns(&assignment, column_ids)
    }

    /// Dense f64 copy (genes × columns).
    pub fn to_dense(&self) -> nalgebra::DMatrix<f64> {
        let mut dense = nalgebra::DMatrix::zeros(self.n_genes(), self.n_columns());
        for (row, row_vec) in self.data.outer_iterator().enumerate() {
            for (col, &val) in row_vec.iter() {
                dense[(row, col)] = val as f64;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_matrix() -> CountMatrix {
        // 3 genes × 4 columns; gene C only seen in the first column
        let triplets = vec![
            (0, 0, 10),
            (0, 1, 20),
            (0, 3, 5),
            (1, 0, 100),
            (1, 1, 200),
            (1, 2, 150),
            (1, 3, 175),
            (2, 0, 1),
        ];
        CountMatrix::from_triplets(
            &triplets,
            vec!["GENE_A".into(), "GENE_B".into(), "GENE_C".into()],
            vec!["c1".into(), "c2".into(), "c3".into(), "c4".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_dimensions_and_get() {
        let mat = create_test_matrix();
        assert_eq!(mat.n_genes(), 3);
        assert_eq!(mat.n_columns(), 4);
        assert_eq!(mat.get(0, 0), 10);
        assert_eq!(mat.get(0, 2), 0);
        assert_eq!(mat.get(2, 1), 0);
        assert_eq!(mat.row_dense(0), vec![10, 20, 0, 5]);
    }

    #[test]
    fn test_sums() {
        let mat = create_test_matrix();
        assert_eq!(mat.col_sums(), vec![111, 220, 150, 180]);
        assert_eq!(mat.row_sums(), vec![35, 625, 1]);
    }

    #[test]
    fn test_sum_columns_groups_and_drops() {
        let mat = create_test_matrix();
        let summed = mat
            .sum_columns(&[Some(0), Some(0), None, Some(1)], vec!["g0".into(), "g1".into()])
            .unwrap();
        assert_eq!(summed.n_columns(), 2);
        assert_eq!(summed.col_dense(0), vec![30, 300, 1]);
        assert_eq!(summed.col_dense(1), vec![5, 175, 0]);
    }

    #[test]
    fn test_sum_columns_rejects_wrong_length() {
        let mat = create_test_matrix();
        assert!(mat.sum_columns(&[Some(0)], vec!["g".into()]).is_err());
    }

    #[test]
    fn test_tsv_roundtrip() {
        let mat = create_test_matrix();
        let temp_file = NamedTempFile::new().unwrap();
        mat.to_tsv(temp_file.path()).unwrap();

        let loaded = CountMatrix::from_tsv(temp_file.path()).unwrap();
        assert_eq!(loaded.gene_ids(), mat.gene_ids());
        assert_eq!(loaded.column_ids(), mat.column_ids());
        for row in 0..mat.n_genes() {
            assert_eq!(loaded.row_dense(row), mat.row_dense(row));
        }
    }

    #[test]
    fn test_tsv_ragged_row_is_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "gene\tc1\tc2").unwrap();
        writeln!(temp_file, "A\t1").unwrap();
        assert!(CountMatrix::from_tsv(temp_file.path()).is_err());
    }

    #[test]
    fn test_subsets() {
        let mat = create_test_matrix();
        let genes = mat.subset_genes(&[0, 2]).unwrap();
        assert_eq!(genes.gene_ids(), &["GENE_A", "GENE_C"]);
        assert_eq!(genes.get(1, 0), 1);

        let cols = mat.subset_columns(&[3, 1]).unwrap();
        assert_eq!(cols.column_ids(), &["c4", "c2"]);
        assert_eq!(cols.row_dense(0), vec![5, 20]);
    }
}
