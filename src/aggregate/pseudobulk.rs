//! Summation of cell counts into (sample, subset) pseudobulk profiles.

use crate::data::{CountMatrix, LabeledCells, Metadata, Variable};
use crate::error::{PbError, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Profile metadata columns added by aggregation.
pub const SAMPLE_COLUMN: &str = "sample";
pub const SUBSET_COLUMN: &str = "subset";
pub const N_CELLS_COLUMN: &str = "n_cells";

fn default_min_cells() -> usize {
    10
}

/// Configuration for pseudobulk aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Subsets to aggregate; `None` keeps all subsets.
    #[serde(default)]
    pub subsets: Option<Vec<String>>,
    /// Minimum number of cells for a (sample, subset) profile to be kept.
    #[serde(default = "default_min_cells")]
    pub min_cells: usize,
    /// Samples removed before aggregation.
    #[serde(default)]
    pub exclude_samples: Vec<String>,
    /// Metadata factor that must keep at least two levels.
    #[serde(default)]
    pub group: Option<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            subsets: None,
            min_cells: default_min_cells(),
            exclude_samples: Vec::new(),
            group: None,
        }
    }
}

/// Why a (sample, subset) pair has no profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Fewer cells than the threshold.
    BelowMinCells { observed: usize, required: usize },
    /// Sample is on the exclusion list.
    Excluded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedProfile {
    pub sample: String,
    pub subset: String,
    pub n_cells: usize,
    pub reason: DropReason,
}

/// Record of the pairs that did not become profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationReport {
    pub n_cells_used: usize,
    pub n_profiles: usize,
    pub dropped: Vec<DroppedProfile>,
}

impl AggregationReport {
    /// Whether a given pair was dropped.
    pub fn is_dropped(&self, sample: &str, subset: &str) -> bool {
        self.dropped
            .iter()
            .any(|d| d.sample == sample && d.subset == subset)
    }
}

/// Summed counts per retained (sample, subset) pair.
#[derive(Debug, Clone)]
pub struct Pseudobulk {
    /// Genes × profiles.
    pub counts: CountMatrix,
    /// One row per profile, keyed by the count matrix column ids.
    pub metadata: Metadata,
    /// Contributing cells per profile.
    pub n_cells: Vec<usize>,
}

impl Pseudobulk {
    pub fn n_profiles(&self) -> usize {
        self.counts.n_columns()
    }
}

/// Kept (subset, sample, n_cells) keys in output order.
type KeptProfiles<'a> = Vec<(&'a str, &'a str, usize)>;

/// Count cells per (subset, sample) pair and split the pairs into kept and
/// dropped. Also returns whether more than one subset is present.
fn tally_profiles<'a>(
    cells: &'a LabeledCells,
    config: &AggregationConfig,
) -> (KeptProfiles<'a>, AggregationReport, bool) {
    let wanted: Option<HashSet<&str>> = config
        .subsets
        .as_ref()
        .map(|s| s.iter().map(String::as_str).collect());
    let excluded: HashSet<&str> = config.exclude_samples.iter().map(String::as_str).collect();

    // (subset, sample) -> cell count
    let mut tally: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    for (sample, subset) in cells.samples().iter().zip(cells.subsets()) {
        if let Some(w) = &wanted {
            if !w.contains(subset.as_str()) {
                continue;
            }
        }
        *tally.entry((subset.as_str(), sample.as_str())).or_default() += 1;
    }

    if let Some(requested) = &config.subsets {
        for s in requested {
            if !tally.keys().any(|(subset, _)| *subset == s.as_str()) {
                warn!("Requested subset '{}' has no cells", s);
            }
        }
    }

    let mut report = AggregationReport::default();
    let mut kept: KeptProfiles<'a> = Vec::new();
    for (&(subset, sample), &n) in &tally {
        let reason = if excluded.contains(sample) {
            Some(DropReason::Excluded)
        } else if n < config.min_cells {
            Some(DropReason::BelowMinCells {
                observed: n,
                required: config.min_cells,
            })
        } else {
            None
        };
        match reason {
            Some(reason) => {
                debug!("Dropping ({}, {}) with {} cells: {:?}", sample, subset, n, reason);
                report.dropped.push(DroppedProfile {
                    sample: sample.to_string(),
                    subset: subset.to_string(),
                    n_cells: n,
                    reason,
                });
            }
            None => kept.push((subset, sample, n)),
        }
    }
    report.n_profiles = kept.len();
    report.n_cells_used = kept.iter().map(|&(_, _, n)| n).sum();

    let distinct_subsets: BTreeSet<&str> = tally.keys().map(|(subset, _)| *subset).collect();
    (kept, report, distinct_subsets.len() > 1)
}

/// Which (sample, subset) pairs `config` keeps and drops, without building
/// profiles. Needs no sample metadata, so it is available even when
/// aggregation itself fails.
pub fn aggregation_report(cells: &LabeledCells, config: &AggregationConfig) -> AggregationReport {
    tally_profiles(cells, config).1
}

/// Aggregate labelled cells into pseudobulk profiles.
///
/// Pairs with fewer than `min_cells` cells, and all cells of excluded samples,
/// are left out and listed in the report. Profiles are ordered by subset then
/// sample. Column ids are `<sample>` when one subset is aggregated and
/// `<sample>.<subset>` otherwise.
pub fn aggregate_pseudobulk(
    cells: &LabeledCells,
    sample_metadata: &Metadata,
    config: &AggregationConfig,
) -> Result<(Pseudobulk, AggregationReport)> {
    let (kept, report, multi_subset) = tally_profiles(cells, config);
    let single_subset = !multi_subset;
    let profile_id = |sample: &str, subset: &str| {
        if single_subset {
            sample.to_string()
        } else {
            format!("{}.{}", sample, subset)
        }
    };

    let mut index: BTreeMap<(&str, &str), usize> = BTreeMap::new();
    let mut profile_ids = Vec::with_capacity(kept.len());
    let mut n_cells = Vec::with_capacity(kept.len());
    for (i, &(subset, sample, n)) in kept.iter().enumerate() {
        index.insert((subset, sample), i);
        profile_ids.push(profile_id(sample, subset));
        n_cells.push(n);
    }

    let assignment: Vec<Option<usize>> = cells
        .samples()
        .iter()
        .zip(cells.subsets())
        .map(|(sample, subset)| index.get(&(subset.as_str(), sample.as_str())).copied())
        .collect();
    let counts = cells.counts().sum_columns(&assignment, profile_ids.clone())?;

    let metadata = profile_metadata(sample_metadata, &kept, &profile_ids)?;

    info!(
        "Aggregated {} cells into {} profiles ({} pairs dropped)",
        report.n_cells_used,
        report.n_profiles,
        report.dropped.len()
    );

    if let Some(group) = &config.group {
        let levels = metadata.levels(group)?;
        if levels.len() < 2 {
            return Err(PbError::DesignDegenerate(format!(
                "'{}' has {} level(s) after aggregation (min_cells = {})",
                group,
                levels.len(),
                config.min_cells
            )));
        }
    }
    if kept.is_empty() {
        return Err(PbError::EmptyData(format!(
            "no (sample, subset) pair reaches {} cells",
            config.min_cells
        )));
    }

    Ok((
        Pseudobulk {
            counts,
            metadata,
            n_cells,
        },
        report,
    ))
}

/// Sample metadata of each kept profile plus `sample`, `subset`, `n_cells`.
fn profile_metadata(
    sample_metadata: &Metadata,
    kept: &[(&str, &str, usize)],
    profile_ids: &[String],
) -> Result<Metadata> {
    let reserved = [SAMPLE_COLUMN, SUBSET_COLUMN, N_CELLS_COLUMN];
    let inherited: Vec<String> = sample_metadata
        .column_names()
        .iter()
        .filter(|c| !reserved.contains(&c.as_str()))
        .cloned()
        .collect();

    let mut column_names = inherited.clone();
    column_names.extend(reserved.iter().map(|s| s.to_string()));

    let mut rows = Vec::with_capacity(kept.len());
    for (&(subset, sample, n), id) in kept.iter().zip(profile_ids) {
        if !sample_metadata.has_sample(sample) {
            return Err(PbError::SampleMismatch(format!(
                "Sample '{}' has cells but no metadata row",
                sample
            )));
        }
        let mut values: Vec<Variable> = inherited
            .iter()
            .map(|c| {
                sample_metadata
                    .get(sample, c)
                    .cloned()
                    .unwrap_or(Variable::Missing)
            })
            .collect();
        values.push(Variable::Categorical(sample.to_string()));
        values.push(Variable::Categorical(subset.to_string()));
        values.push(Variable::Continuous(n as f64));
        rows.push((id.clone(), values));
    }

    let mut meta = Metadata::from_records(column_names, rows)?;
    // Keep inherited column types even when every kept value is missing
    let types = inherited
        .iter()
        .filter_map(|c| sample_metadata.column_type(c).map(|t| (c.clone(), t)))
        .collect();
    meta = meta.with_column_types(types);
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2 genes; D1 has 4 T cells and 3 B cells, D2 has 5 T cells, D3 has 4 T cells.
    fn toy_cells() -> (LabeledCells, Metadata) {
        let labels = [
            ("D1", "T"), ("D1", "T"), ("D1", "T"), ("D1", "T"),
            ("D1", "B"), ("D1", "B"), ("D1", "B"),
            ("D2", "T"), ("D2", "T"), ("D2", "T"), ("D2", "T"), ("D2", "T"),
            ("D3", "T"), ("D3", "T"), ("D3", "T"), ("D3", "T"),
        ];
        let mut triplets = Vec::new();
        for c in 0..labels.len() {
            triplets.push((0, c, (c + 1) as u64));
            if c % 2 == 0 {
                triplets.push((1, c, 2));
            }
        }
        let counts = CountMatrix::from_triplets(
            &triplets,
            vec!["G1".into(), "G2".into()],
            (0..labels.len()).map(|c| format!("cell{}", c)).collect(),
        )
        .unwrap();
        let cells = LabeledCells::new(
            counts,
            labels.iter().map(|(s, _)| s.to_string()).collect(),
            labels.iter().map(|(_, t)| t.to_string()).collect(),
        )
        .unwrap();
        let meta = Metadata::from_records(
            vec!["disease".into()],
            vec![
                ("D1".into(), vec![Variable::Categorical("healthy".into())]),
                ("D2".into(), vec![Variable::Categorical("covid".into())]),
                ("D3".into(), vec![Variable::Categorical("covid".into())]),
            ],
        )
        .unwrap();
        (cells, meta)
    }

    #[test]
    fn test_sums_match_manual() {
        let (cells, meta) = toy_cells();
        let config = AggregationConfig {
            subsets: Some(vec!["T".into()]),
            min_cells: 1,
            ..Default::default()
        };
        let (pb, report) = aggregate_pseudobulk(&cells, &meta, &config).unwrap();

        assert_eq!(pb.counts.column_ids(), &["D1", "D2", "D3"]);
        // D1 T cells are cells 0..4 with G1 counts 1..=4
        assert_eq!(pb.counts.get(0, 0), 1 + 2 + 3 + 4);
        // D2 T cells are cells 7..12 with G1 counts 8..=12
        assert_eq!(pb.counts.get(0, 1), 8 + 9 + 10 + 11 + 12);
        // G2 is 2 on even cells: D3 cells 12..16 -> 12, 14
        assert_eq!(pb.counts.get(1, 2), 4);
        assert_eq!(pb.n_cells, vec![4, 5, 4]);
        assert!(report.dropped.is_empty());
        assert_eq!(
            pb.metadata.get("D2", "disease").unwrap().as_categorical(),
            Some("covid")
        );
        assert_eq!(pb.metadata.get("D2", N_CELLS_COLUMN).unwrap().as_continuous(), Some(5.0));
    }

    #[test]
    fn test_threshold_and_exclusion_reported() {
        let (cells, meta) = toy_cells();
        let config = AggregationConfig {
            min_cells: 4,
            exclude_samples: vec!["D3".into()],
            ..Default::default()
        };
        let (pb, report) = aggregate_pseudobulk(&cells, &meta, &config).unwrap();

        assert_eq!(pb.counts.column_ids(), &["D1.T", "D2.T"]);
        assert!(report.is_dropped("D1", "B"));
        assert!(report.is_dropped("D3", "T"));
        let b = report.dropped.iter().find(|d| d.subset == "B").unwrap();
        assert_eq!(
            b.reason,
            DropReason::BelowMinCells { observed: 3, required: 4 }
        );
        let d3 = report.dropped.iter().find(|d| d.sample == "D3").unwrap();
        assert_eq!(d3.reason, DropReason::Excluded);
        assert_eq!(report.n_cells_used, 9);
    }

    #[test]
    fn test_single_group_level_is_degenerate() {
        let (cells, meta) = toy_cells();
        let config = AggregationConfig {
            subsets: Some(vec!["T".into()]),
            min_cells: 1,
            exclude_samples: vec!["D1".into()],
            group: Some("disease".into()),
        };
        let err = aggregate_pseudobulk(&cells, &meta, &config).unwrap_err();
        assert_eq!(err.reason_code(), "DESIGN_DEGENERATE");
    }

    #[test]
    fn test_report_available_when_aggregation_fails() {
        let (cells, meta) = toy_cells();
        let config = AggregationConfig {
            subsets: Some(vec!["T".into()]),
            min_cells: 5,
            exclude_samples: vec!["D1".into()],
            group: Some("disease".into()),
        };
        // Only D2 survives, leaving a single disease level.
        assert!(aggregate_pseudobulk(&cells, &meta, &config).is_err());
        let report = aggregation_report(&cells, &config);
        assert_eq!(report.n_profiles, 1);
        assert_eq!(report.n_cells_used, 5);
        assert_eq!(report.dropped.len(), 2);
        let d1 = report.dropped.iter().find(|d| d.sample == "D1").unwrap();
        assert_eq!(d1.reason, DropReason::Excluded);
        let d3 = report.dropped.iter().find(|d| d.sample == "D3").unwrap();
        assert_eq!(d3.reason, DropReason::BelowMinCells { observed: 4, required: 5 });
    }

    #[test]
    fn test_missing_metadata_row() {
        let (cells, _) = toy_cells();
        let meta = Metadata::from_records(
            vec!["disease".into()],
            vec![("D1".into(), vec![Variable::Categorical("healthy".into())])],
        )
        .unwrap();
        let config = AggregationConfig {
            min_cells: 1,
            ..Default::default()
        };
        assert!(matches!(
            aggregate_pseudobulk(&cells, &meta, &config),
            Err(PbError::SampleMismatch(_))
        ));
    }
}
