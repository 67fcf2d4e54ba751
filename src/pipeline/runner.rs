//! Batch execution of pseudobulk comparisons.
//!
//! Each comparison runs aggregation, filtering, TMM, QL fitting, one QL
//! F-test per contrast and optional GSEA. Comparisons run in parallel and a
//! failing comparison is recorded as skipped while the others complete.

use crate::aggregate::{
    aggregate_pseudobulk, aggregation_report, AggregationReport, DroppedProfile, Pseudobulk,
};
use crate::data::{Contrast, DeResultSet, DesignMatrix, Formula, LabeledCells, Metadata};
use crate::enrich::{run_gsea, EnrichmentResult, GeneSetCollection, RankedGenes};
use crate::error::{Note, PbError, Result};
use crate::filter::filter_expression;
use crate::model::{fit_ql, QlFit};
use crate::normalize::{log_cpm, norm_tmm_with_config, HeatmapMatrix, TmmFactors};
use crate::pipeline::config::{AnalysisConfig, ComparisonConfig};
use crate::report::ResultTable;
use crate::test::test_ql_f;
use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Data shared by every comparison of a batch.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub cells: LabeledCells,
    pub metadata: Metadata,
    pub gene_sets: Option<GeneSetCollection>,
}

impl Inputs {
    /// Load the files named by `config`.
    pub fn load(config: &AnalysisConfig) -> Result<Self> {
        let cells = LabeledCells::from_tsv(&config.inputs.counts, &config.inputs.annotations)?;
        let metadata = Metadata::from_tsv(&config.inputs.metadata)?;
        let gene_sets = match &config.enrichment {
            Some(e) => Some(GeneSetCollection::from_gmt(&e.gene_sets)?),
            None => None,
        };
        Ok(Self {
            cells,
            metadata,
            gene_sets,
        })
    }
}

/// Results of one contrast.
#[derive(Debug, Clone)]
pub struct ContrastResult {
    pub de: DeResultSet,
    pub enrichment: Option<EnrichmentResult>,
}

/// Everything produced by one comparison.
#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub name: String,
    pub aggregation: AggregationReport,
    pub norm: TmmFactors,
    /// Genes removed by the expression filter.
    pub filtered_genes: Vec<String>,
    pub contrasts: Vec<ContrastResult>,
    pub heatmap: HeatmapMatrix,
    pub notes: Vec<Note>,
}

/// A comparison that did not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedComparison {
    pub name: String,
    pub reason_code: String,
    pub message: String,
}

/// Machine-readable summary of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub name: String,
    pub completed: Vec<String>,
    pub skipped: Vec<SkippedComparison>,
    /// Profiles left out by aggregation, per comparison.
    pub dropped_profiles: BTreeMap<String, Vec<DroppedProfile>>,
    pub notes: BTreeMap<String, Vec<Note>>,
}

impl BatchReport {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(PbError::from)
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Completed comparisons plus the batch report.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<ComparisonResult>,
    pub report: BatchReport,
}

/// Apply derived columns and forced types to the profile metadata.
fn prepare_metadata(metadata: Metadata, cmp: &ComparisonConfig) -> Result<Metadata> {
    let mut metadata = metadata;
    for (name, columns) in &cmp.derived_columns {
        metadata = metadata.with_combined_column(name, columns)?;
    }
    if cmp.column_types.is_empty() {
        Ok(metadata)
    } else {
        Ok(metadata.with_column_types(cmp.column_types()))
    }
}

/// Every level of the grouping factor needs `min_replicates` profiles.
fn check_replicates(metadata: &Metadata, cmp: &ComparisonConfig) -> Result<()> {
    let counts = metadata.level_counts(&cmp.group)?;
    if counts.len() < 2 {
        return Err(PbError::DesignDegenerate(format!(
            "'{}' has {} level(s) among the retained profiles",
            cmp.group,
            counts.len()
        )));
    }
    if let Some((level, observed)) = counts.iter().find(|(_, n)| *n < cmp.min_replicates) {
        return Err(PbError::InsufficientReplicates {
            factor: cmp.group.clone(),
            level: level.clone(),
            observed: *observed,
            required: cmp.min_replicates,
        });
    }
    Ok(())
}

/// Parse every contrast and check it against the design.
fn resolve_contrasts(cmp: &ComparisonConfig, design: &DesignMatrix) -> Result<Vec<Contrast>> {
    cmp.contrasts
        .iter()
        .map(|spec| {
            let contrast = Contrast::parse(&spec.name, &spec.expression)?;
            contrast.to_vector(design)?;
            Ok(contrast)
        })
        .collect()
}

fn enrich(
    de: &DeResultSet,
    gene_sets: &GeneSetCollection,
    config: &AnalysisConfig,
    notes: &mut Vec<Note>,
) -> Result<Option<EnrichmentResult>> {
    let gsea = match &config.enrichment {
        Some(e) => &e.gsea,
        None => return Ok(None),
    };
    let ranked = RankedGenes::from_de(de)?;
    let result = run_gsea(&ranked, gene_sets, gsea)?;
    if let Some(note) = &result.note {
        notes.push(Note {
            reason_code: note.reason_code.clone(),
            message: format!("{}: {}", de.contrast, note.message),
        });
    }
    Ok(Some(result))
}

/// Run everything after aggregation.
pub fn analyze_profiles(
    pseudobulk: Pseudobulk,
    aggregation: AggregationReport,
    gene_sets: Option<&GeneSetCollection>,
    config: &AnalysisConfig,
    cmp: &ComparisonConfig,
) -> Result<ComparisonResult> {
    let metadata = prepare_metadata(pseudobulk.metadata, cmp)?;
    check_replicates(&metadata, cmp)?;

    let filtered = filter_expression(&pseudobulk.counts, &cmp.expression_filter)?;
    let counts = filtered.counts;
    if counts.n_genes() == 0 {
        return Err(PbError::EmptyData(
            "no gene passes the expression filter".to_string(),
        ));
    }
    let norm = norm_tmm_with_config(&counts, &config.tmm)?;

    let formula = Formula::parse(&cmp.formula)?;
    let design = DesignMatrix::from_formula(&metadata, &formula, &cmp.reference_levels())?;
    let contrasts = resolve_contrasts(cmp, &design)?;

    let ql = cmp.ql(&config.ql);
    let fit: QlFit = fit_ql(&counts, &design, &norm, &config.dispersion, &ql)?;
    info!(
        "[{}] {} genes x {} profiles, common dispersion {:.4}",
        cmp.name,
        fit.n_genes(),
        design.n_samples(),
        fit.dispersions.common
    );

    let mut notes = Vec::new();
    let mut results = Vec::with_capacity(contrasts.len());
    for contrast in &contrasts {
        let de = test_ql_f(&fit, contrast)?;
        let summary = de.summary();
        info!(
            "[{}] {}: {} up, {} down at FDR 0.05",
            cmp.name, contrast.name, summary.up, summary.down
        );
        let enrichment = match gene_sets {
            Some(sets) => enrich(&de, sets, config, &mut notes)?,
            None => None,
        };
        results.push(ContrastResult { de, enrichment });
    }

    let lc = log_cpm(&counts, &norm.effective_lib_sizes, ql.prior_count)?;
    let heatmap = HeatmapMatrix::from_log_cpm(&lc, counts.gene_ids(), &metadata, &cmp.group)?;

    Ok(ComparisonResult {
        name: cmp.name.clone(),
        aggregation,
        norm,
        filtered_genes: filtered.removed,
        contrasts: results,
        heatmap,
        notes,
    })
}

/// Run one comparison from labelled cells.
pub fn run_comparison(
    inputs: &Inputs,
    config: &AnalysisConfig,
    cmp: &ComparisonConfig,
) -> Result<ComparisonResult> {
    let (pseudobulk, report) =
        aggregate_pseudobulk(&inputs.cells, &inputs.metadata, &cmp.aggregation())?;
    analyze_profiles(pseudobulk, report, inputs.gene_sets.as_ref(), config, cmp)
}

/// Run all comparisons of `config`.
///
/// Failures are recorded in the report with their reason code. Aggregation
/// drops are recorded for every comparison, including those whose
/// aggregation step itself fails.
pub fn run_batch(inputs: &Inputs, config: &AnalysisConfig) -> BatchOutcome {
    let outcomes: Vec<(AggregationReport, Result<ComparisonResult>)> = config
        .comparisons
        .par_iter()
        .map(|cmp| {
            let agg_config = cmp.aggregation();
            match aggregate_pseudobulk(&inputs.cells, &inputs.metadata, &agg_config) {
                Ok((pseudobulk, report)) => {
                    let kept = report.clone();
                    let result = analyze_profiles(
                        pseudobulk,
                        report,
                        inputs.gene_sets.as_ref(),
                        config,
                        cmp,
                    );
                    (kept, result)
                }
                Err(e) => (aggregation_report(&inputs.cells, &agg_config), Err(e)),
            }
        })
        .collect();

    let mut report = BatchReport {
        name: config.name.clone(),
        ..Default::default()
    };
    let mut results = Vec::new();
    for (cmp, (aggregation, outcome)) in config.comparisons.iter().zip(outcomes) {
        report
            .dropped_profiles
            .insert(cmp.name.clone(), aggregation.dropped);
        match outcome {
            Ok(result) => {
                info!("Comparison '{}' completed", cmp.name);
                if !result.notes.is_empty() {
                    report.notes.insert(cmp.name.clone(), result.notes.clone());
                }
                report.completed.push(cmp.name.clone());
                results.push(result);
            }
            Err(e) => {
                warn!("Comparison '{}' skipped: {}", cmp.name, e);
                report.skipped.push(SkippedComparison {
                    name: cmp.name.clone(),
                    reason_code: e.reason_code().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    BatchOutcome { results, report }
}

/// Write per-comparison tables, the merged DE table and the batch report
/// under `out_dir`.
///
/// Layout: `<comparison>/de_<contrast>.tsv`, `<comparison>/gsea_<contrast>.tsv`,
/// `<comparison>/heatmap.tsv`, `merged_de.tsv`, `batch_report.json`.
pub fn write_outputs<P: AsRef<Path>>(outcome: &BatchOutcome, out_dir: P) -> Result<()> {
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir)?;

    let mut de_tables: Vec<(String, ResultTable)> = Vec::new();
    for result in &outcome.results {
        let dir = out_dir.join(&result.name);
        fs::create_dir_all(&dir)?;
        for contrast in &result.contrasts {
            let table = ResultTable::from_de(&contrast.de);
            table.to_tsv(dir.join(format!("de_{}.tsv", contrast.de.contrast)))?;
            if let Some(enrichment) = &contrast.enrichment {
                ResultTable::from_enrichment(enrichment)
                    .to_tsv(dir.join(format!("gsea_{}.tsv", contrast.de.contrast)))?;
            }
            de_tables.push((format!("{}.{}", result.name, contrast.de.contrast), table));
        }
        result.heatmap.to_tsv(dir.join("heatmap.tsv"))?;
    }

    if !de_tables.is_empty() {
        let refs: Vec<(&str, &ResultTable)> =
            de_tables.iter().map(|(p, t)| (p.as_str(), t)).collect();
        ResultTable::merge_on_identifier(&refs)?.to_tsv(out_dir.join("merged_de.tsv"))?;
    }
    outcome.report.write_json(out_dir.join("batch_report.json"))?;
    info!("Wrote results to {}", out_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::DropReason;
    use crate::data::{CountMatrix, Variable};
    use crate::pipeline::config::{ContrastSpec, InputPaths};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Poisson};
    use tempfile::TempDir;

    /// 8 donors (4 healthy, 4 covid), subsets DC2/DC3, 12 cells per pair
    /// except donor d8 in DC3 with 3 cells. gene00 is 4x up in covid DC2.
    fn make_inputs() -> Inputs {
        let n_genes = 40;
        let mut rng = StdRng::seed_from_u64(11);
        let mut triplets = Vec::new();
        let mut samples = Vec::new();
        let mut subsets = Vec::new();
        let mut cell = 0;
        for d in 1..=8 {
            let covid = d > 4;
            for subset in ["DC2", "DC3"] {
                let n_cells = if d == 8 && subset == "DC3" { 3 } else { 12 };
                for _ in 0..n_cells {
                    for g in 0..n_genes {
                        let base = 2.0 + (g % 5) as f64;
                        let mean = if g == 0 && covid && subset == "DC2" { base * 4.0 } else { base };
                        let y = Poisson::new(mean).unwrap().sample(&mut rng) as u64;
                        if y > 0 {
                            triplets.push((g, cell, y));
                        }
                    }
                    samples.push(format!("d{}", d));
                    subsets.push(subset.to_string());
                    cell += 1;
                }
            }
        }
        let genes: Vec<String> = (0..n_genes).map(|g| format!("gene{:02}", g)).collect();
        let cells: Vec<String> = (0..cell).map(|c| format!("c{}", c)).collect();
        let counts = CountMatrix::from_triplets(&triplets, genes, cells).unwrap();
        let cells = LabeledCells::new(counts, samples, subsets).unwrap();

        let rows = (1..=8)
            .map(|d| {
                let disease = if d > 4 { "covid" } else { "healthy" };
                (
                    format!("d{}", d),
                    vec![Variable::Categorical(disease.to_string())],
                )
            })
            .collect();
        let metadata = Metadata::from_records(vec!["disease".to_string()], rows).unwrap();
        Inputs {
            cells,
            metadata,
            gene_sets: None,
        }
    }

    fn comparison(name: &str, subsets: &[&str], contrast: &str) -> ComparisonConfig {
        ComparisonConfig {
            name: name.to_string(),
            subsets: Some(subsets.iter().map(|s| s.to_string()).collect()),
            min_cells: 10,
            exclude_samples: Vec::new(),
            group: "disease".to_string(),
            formula: "~ disease".to_string(),
            reference_levels: [("disease".to_string(), "healthy".to_string())]
                .into_iter()
                .collect(),
            derived_columns: BTreeMap::new(),
            column_types: BTreeMap::new(),
            contrasts: vec![ContrastSpec {
                name: "covid".to_string(),
                expression: contrast.to_string(),
            }],
            expression_filter: Default::default(),
            robust: None,
            min_replicates: 2,
        }
    }

    fn config(comparisons: Vec<ComparisonConfig>) -> AnalysisConfig {
        AnalysisConfig {
            name: "test".to_string(),
            inputs: InputPaths {
                counts: "counts.tsv".into(),
                annotations: "cells.tsv".into(),
                metadata: "samples.tsv".into(),
            },
            output_dir: "results".into(),
            tmm: Default::default(),
            dispersion: Default::default(),
            ql: Default::default(),
            enrichment: None,
            comparisons,
        }
    }

    #[test]
    fn test_run_comparison_finds_spiked_gene() {
        let inputs = make_inputs();
        let cmp = comparison("DC2", &["DC2"], "diseasecovid");
        let cfg = config(vec![cmp.clone()]);
        let result = run_comparison(&inputs, &cfg, &cmp).unwrap();
        let de = &result.contrasts[0].de;
        assert_eq!(de.results[0].gene, "gene00");
        assert!(de.results[0].log_fc > 1.0);
        assert_eq!(result.heatmap.column_labels[0], "healthy_d1");
        assert_eq!(result.heatmap.column_labels[7], "covid_d8");
    }

    #[test]
    fn test_batch_skips_failing_comparison() {
        let inputs = make_inputs();
        let good = comparison("DC2", &["DC2"], "diseasecovid");
        let bad = comparison("DC2_bad", &["DC2"], "diseaseflu");
        let dc3 = comparison("DC3", &["DC3"], "diseasecovid");
        let outcome = run_batch(&inputs, &config(vec![good, bad, dc3]));
        assert_eq!(outcome.report.completed, vec!["DC2", "DC3"]);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert_eq!(outcome.report.skipped[0].reason_code, "INVALID_CONTRAST");
        let dropped = &outcome.report.dropped_profiles["DC3"];
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].sample, "d8");
        assert!(outcome.report.dropped_profiles.contains_key("DC2_bad"));
    }

    #[test]
    fn test_failed_aggregation_keeps_drops() {
        let inputs = make_inputs();
        let mut cmp = comparison("DC3_healthy", &["DC3"], "diseasecovid");
        cmp.exclude_samples = vec!["d5".into(), "d6".into(), "d7".into()];
        let outcome = run_batch(&inputs, &config(vec![cmp]));
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.report.skipped[0].reason_code, "DESIGN_DEGENERATE");

        let dropped = &outcome.report.dropped_profiles["DC3_healthy"];
        assert_eq!(dropped.len(), 4);
        let excluded = dropped
            .iter()
            .filter(|d| d.reason == DropReason::Excluded)
            .count();
        assert_eq!(excluded, 3);
        let d8 = dropped.iter().find(|d| d.sample == "d8").unwrap();
        assert_eq!(
            d8.reason,
            DropReason::BelowMinCells {
                observed: 3,
                required: 10
            }
        );
    }

    #[test]
    fn test_insufficient_replicates() {
        let inputs = make_inputs();
        let mut cmp = comparison("DC3", &["DC3"], "diseasecovid");
        cmp.min_replicates = 4;
        let err = run_comparison(&inputs, &config(vec![cmp.clone()]), &cmp).unwrap_err();
        assert_eq!(err.reason_code(), "INSUFFICIENT_REPLICATES");
    }

    #[test]
    fn test_write_outputs_layout() {
        let inputs = make_inputs();
        let cmp = comparison("DC2", &["DC2"], "diseasecovid");
        let outcome = run_batch(&inputs, &config(vec![cmp]));
        let dir = TempDir::new().unwrap();
        write_outputs(&outcome, dir.path()).unwrap();
        assert!(dir.path().join("DC2/de_covid.tsv").exists());
        assert!(dir.path().join("DC2/heatmap.tsv").exists());
        assert!(dir.path().join("merged_de.tsv").exists());
        let json = std::fs::read_to_string(dir.path().join("batch_report.json")).unwrap();
        let report: BatchReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report.completed, vec!["DC2"]);
    }
}
