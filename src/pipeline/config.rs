//! YAML analysis configuration.

use crate::aggregate::AggregationConfig;
use crate::data::VariableType;
use crate::enrich::GseaConfig;
use crate::error::{PbError, Result};
use crate::filter::ExpressionFilterConfig;
use crate::model::{DispersionConfig, QlConfig};
use crate::normalize::TmmConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_min_cells() -> usize {
    10
}

fn default_min_replicates() -> usize {
    2
}

/// Input files shared by all comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPaths {
    /// Genes × cells count TSV.
    pub counts: PathBuf,
    /// `cell_id`, `sample_id`, `subset` TSV.
    pub annotations: PathBuf,
    /// One row per sample.
    pub metadata: PathBuf,
}

/// A named contrast expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastSpec {
    pub name: String,
    pub expression: String,
}

/// One comparison: which profiles, which design, which contrasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonConfig {
    pub name: String,
    /// Subsets aggregated into this comparison; all subsets when absent.
    #[serde(default)]
    pub subsets: Option<Vec<String>>,
    #[serde(default = "default_min_cells")]
    pub min_cells: usize,
    #[serde(default)]
    pub exclude_samples: Vec<String>,
    /// Grouping factor whose levels need replicates.
    pub group: String,
    /// Model formula over profile metadata, e.g. `~ dataset + disease`.
    pub formula: String,
    /// Reference level per categorical factor.
    #[serde(default)]
    pub reference_levels: BTreeMap<String, String>,
    /// Columns built by joining existing columns with `_`, e.g.
    /// `severity_subset: [severity, subset]`.
    #[serde(default)]
    pub derived_columns: BTreeMap<String, Vec<String>>,
    /// Forced column types, overriding detection.
    #[serde(default)]
    pub column_types: BTreeMap<String, VariableType>,
    pub contrasts: Vec<ContrastSpec>,
    #[serde(default)]
    pub expression_filter: ExpressionFilterConfig,
    /// Overrides the global `ql.robust`.
    #[serde(default)]
    pub robust: Option<bool>,
    #[serde(default = "default_min_replicates")]
    pub min_replicates: usize,
}

impl ComparisonConfig {
    /// Aggregation settings of this comparison.
    ///
    /// A derived grouping column does not exist until after aggregation, so
    /// its level check is left to the runner.
    pub fn aggregation(&self) -> AggregationConfig {
        AggregationConfig {
            subsets: self.subsets.clone(),
            min_cells: self.min_cells,
            exclude_samples: self.exclude_samples.clone(),
            group: if self.derived_columns.contains_key(&self.group) {
                None
            } else {
                Some(self.group.clone())
            },
        }
    }

    pub fn reference_levels(&self) -> HashMap<String, String> {
        self.reference_levels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn column_types(&self) -> HashMap<String, VariableType> {
        self.column_types.iter().map(|(k, v)| (k.clone(), *v)).collect()
    }

    /// QL settings with the per-comparison robust override applied.
    pub fn ql(&self, global: &QlConfig) -> QlConfig {
        let mut ql = global.clone();
        if let Some(robust) = self.robust {
            ql.robust = robust;
        }
        ql
    }
}

/// Gene set enrichment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// GMT collection.
    pub gene_sets: PathBuf,
    #[serde(default)]
    pub gsea: GseaConfig,
}

/// Top-level analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub name: String,
    pub inputs: InputPaths,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub tmm: TmmConfig,
    #[serde(default)]
    pub dispersion: DispersionConfig,
    #[serde(default)]
    pub ql: QlConfig,
    #[serde(default)]
    pub enrichment: Option<EnrichmentConfig>,
    pub comparisons: Vec<ComparisonConfig>,
}

impl AnalysisConfig {
    /// Load from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Save to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(PbError::from)
    }

    /// Structural checks that do not need the data.
    pub fn validate(&self) -> Result<()> {
        if self.comparisons.is_empty() {
            return Err(PbError::InvalidParameter(
                "configuration has no comparisons".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for cmp in &self.comparisons {
            if !names.insert(cmp.name.as_str()) {
                return Err(PbError::InvalidParameter(format!(
                    "duplicate comparison name '{}'",
                    cmp.name
                )));
            }
            if cmp.contrasts.is_empty() {
                return Err(PbError::InvalidParameter(format!(
                    "comparison '{}' has no contrasts",
                    cmp.name
                )));
            }
            let mut contrast_names = HashSet::new();
            for c in &cmp.contrasts {
                if !contrast_names.insert(c.name.as_str()) {
                    return Err(PbError::InvalidParameter(format!(
                        "comparison '{}' repeats contrast '{}'",
                        cmp.name, c.name
                    )));
                }
            }
            if cmp.min_replicates == 0 {
                return Err(PbError::InvalidParameter(format!(
                    "comparison '{}': min_replicates must be positive",
                    cmp.name
                )));
            }
        }
        Ok(())
    }
}

/// Commented example configuration.
pub fn example_yaml() -> &'static str {
    r#"# Pseudobulk differential expression analysis
name: dc_covid

inputs:
  counts: data/counts.tsv          # genes x cells
  annotations: data/cells.tsv      # cell_id, sample_id, subset
  metadata: data/samples.tsv       # sample_id, disease, severity, dataset, ...

output_dir: results

tmm:
  trim_m: 0.3
  trim_a: 0.05
  weighted: true

dispersion:
  prior_df: 10.0

ql:
  robust: true

enrichment:
  gene_sets: data/hallmark.gmt
  gsea:
    min_size: 15
    max_size: 500
    nperm: 1000
    sample_size: 101
    seed: 42

comparisons:
  # Disease effect within one subset, adjusted for dataset of origin
  - name: DC2_covid_vs_healthy
    subsets: [DC2]
    min_cells: 10
    exclude_samples: []
    group: disease
    formula: "~ dataset + disease"
    reference_levels:
      disease: healthy
    expression_filter:
      min_count: 1
      min_samples: 5
    contrasts:
      - name: covid_vs_healthy
        expression: diseasecovid

  # Interaction across subsets with a cell-means design
  - name: DC3_vs_DC2_severity
    subsets: [DC2, DC3]
    min_cells: 5
    group: severity_subset
    derived_columns:
      severity_subset: [severity, subset]
    formula: "~ 0 + severity_subset"
    contrasts:
      - name: severe_interaction
        expression: "(severity_subsetsevere_DC3 - severity_subsetsevere_DC2) - (severity_subsethealthy_DC3 - severity_subsethealthy_DC2)"
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_parses() {
        let config = AnalysisConfig::from_yaml(example_yaml()).unwrap();
        assert_eq!(config.comparisons.len(), 2);
        assert!(config.ql.robust);
        let first = &config.comparisons[0];
        assert_eq!(first.reference_levels["disease"], "healthy");
        assert_eq!(first.expression_filter.min_samples, 5);
        assert_eq!(first.min_replicates, 2);
        let second = &config.comparisons[1];
        assert_eq!(second.derived_columns["severity_subset"], vec!["severity", "subset"]);
        assert_eq!(second.aggregation().min_cells, 5);
        assert_eq!(second.aggregation().group, None);
        assert_eq!(first.aggregation().group.as_deref(), Some("disease"));
        let gsea = &config.enrichment.as_ref().unwrap().gsea;
        assert_eq!(gsea.seed, 42);
        assert_eq!(gsea.eps, 1e-50);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = AnalysisConfig::from_yaml(example_yaml()).unwrap();
        let again = AnalysisConfig::from_yaml(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(again.comparisons[1].contrasts, config.comparisons[1].contrasts);
        assert_eq!(again.output_dir, config.output_dir);
    }

    #[test]
    fn test_robust_override() {
        let mut config = AnalysisConfig::from_yaml(example_yaml()).unwrap();
        config.comparisons[0].robust = Some(false);
        assert!(!config.comparisons[0].ql(&config.ql).robust);
        assert!(config.comparisons[1].ql(&config.ql).robust);
    }

    #[test]
    fn test_duplicate_comparisons_rejected() {
        let mut config = AnalysisConfig::from_yaml(example_yaml()).unwrap();
        config.comparisons[1].name = config.comparisons[0].name.clone();
        assert!(config.validate().is_err());
    }
}
