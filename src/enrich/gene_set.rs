//! Gene set collections and size-bound filtering.

use crate::error::{PbError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A named set of gene identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneSet {
    pub name: String,
    pub description: String,
    /// Unique members in file order.
    pub genes: Vec<String>,
}

impl GeneSet {
    pub fn new(name: &str, genes: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let genes = genes.into_iter().filter(|g| seen.insert(g.clone())).collect();
        Self {
            name: name.to_string(),
            description: String::new(),
            genes,
        }
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }
}

/// Why a set was left out of testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    BelowMinSize,
    AboveMaxSize,
}

/// A gene set that fell outside the size bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSet {
    pub name: String,
    /// Members present in the ranked list.
    pub size: usize,
    pub reason: ExclusionReason,
}

/// A gene set restricted to a ranked universe.
#[derive(Debug, Clone)]
pub(crate) struct IndexedSet {
    pub name: String,
    /// Ascending positions in the ranked list.
    pub positions: Vec<usize>,
}

/// Read-only collection of gene sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneSetCollection {
    sets: Vec<GeneSet>,
}

impl GeneSetCollection {
    /// Build from sets; names must be unique.
    pub fn new(sets: Vec<GeneSet>) -> Result<Self> {
        let mut names = HashSet::new();
        for set in &sets {
            if !names.insert(set.name.as_str()) {
                return Err(PbError::InvalidParameter(format!(
                    "Duplicate gene set name '{}'",
                    set.name
                )));
            }
        }
        Ok(Self { sets })
    }

    /// Load a GMT file: one set per line, `name<TAB>description<TAB>gene...`.
    ///
    /// Blank lines and lines starting with `#` are skipped.
    pub fn from_gmt<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut sets = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or("").trim();
            if name.is_empty() {
                return Err(PbError::InvalidParameter(format!(
                    "GMT line {} has no set name",
                    line_no + 1
                )));
            }
            let description = fields.next().unwrap_or("").to_string();
            let genes: Vec<String> = fields
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(String::from)
                .collect();
            let mut set = GeneSet::new(name, genes);
            set.description = description;
            sets.push(set);
        }
        info!("Loaded {} gene sets from {}", sets.len(), path.as_ref().display());
        Self::new(sets)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeneSet> {
        self.sets.iter()
    }

    pub fn get(&self, name: &str) -> Option<&GeneSet> {
        self.sets.iter().find(|s| s.name == name)
    }

    /// Restrict each set to `universe` and split by `[min_size, max_size]`.
    pub(crate) fn restrict(
        &self,
        universe: &HashMap<&str, usize>,
        min_size: usize,
        max_size: usize,
    ) -> (Vec<IndexedSet>, Vec<ExcludedSet>) {
        let mut kept = Vec::new();
        let mut excluded = Vec::new();
        for set in &self.sets {
            let mut positions: Vec<usize> = set
                .genes
                .iter()
                .filter_map(|g| universe.get(g.as_str()).copied())
                .collect();
            positions.sort_unstable();
            let size = positions.len();
            let reason = if size < min_size {
                Some(ExclusionReason::BelowMinSize)
            } else if size > max_size {
                Some(ExclusionReason::AboveMaxSize)
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    debug!("Gene set '{}' excluded ({} genes, {:?})", set.name, size, reason);
                    excluded.push(ExcludedSet {
                        name: set.name.clone(),
                        size,
                        reason,
                    });
                }
                None => kept.push(IndexedSet {
                    name: set.name.clone(),
                    positions,
                }),
            }
        }
        (kept, excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_gmt() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "SET_A\thttp://x\tG1\tG2\tG2\tG3").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "SET_B\t\tG4").unwrap();
        let coll = GeneSetCollection::from_gmt(file.path()).unwrap();
        assert_eq!(coll.len(), 2);
        let a = coll.get("SET_A").unwrap();
        assert_eq!(a.genes, vec!["G1", "G2", "G3"]);
        assert_eq!(a.description, "http://x");
        assert_eq!(coll.get("SET_B").unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let sets = vec![
            GeneSet::new("X", vec!["a".into()]),
            GeneSet::new("X", vec!["b".into()]),
        ];
        assert!(GeneSetCollection::new(sets).is_err());
    }

    #[test]
    fn test_restrict_bounds() {
        let coll = GeneSetCollection::new(vec![
            GeneSet::new("small", vec!["g0".into(), "missing".into()]),
            GeneSet::new("ok", vec!["g3".into(), "g1".into(), "g2".into()]),
            GeneSet::new("big", (0..5).map(|i| format!("g{}", i)).collect()),
        ])
        .unwrap();
        let names: Vec<String> = (0..5).map(|i| format!("g{}", i)).collect();
        let universe: HashMap<&str, usize> =
            names.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect();
        let (kept, excluded) = coll.restrict(&universe, 2, 4);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].positions, vec![1, 2, 3]);
        assert_eq!(excluded.len(), 2);
        assert_eq!(excluded[0].reason, ExclusionReason::BelowMinSize);
        assert_eq!(excluded[0].size, 1);
        assert_eq!(excluded[1].reason, ExclusionReason::AboveMaxSize);
    }
}
