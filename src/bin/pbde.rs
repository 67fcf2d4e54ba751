//! pbde - Pseudobulk Differential Expression CLI
//!
//! Command-line interface for batch pseudobulk DE and gene set enrichment.

use clap::{Parser, Subcommand};
use log::info;
use pseudobulk_de::aggregate::{aggregate_pseudobulk, AggregationConfig};
use pseudobulk_de::data::{LabeledCells, Metadata};
use pseudobulk_de::error::Result;
use pseudobulk_de::pipeline::{example_yaml, run_batch, write_outputs, AnalysisConfig, Inputs};
use std::path::PathBuf;

/// Pseudobulk differential expression for subset-labelled single-cell counts
#[derive(Parser)]
#[command(name = "pbde")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every comparison of a YAML analysis configuration
    Run {
        /// Path to analysis configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Output directory (overrides `output_dir` of the configuration)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Aggregate cells into pseudobulk profiles without testing
    Aggregate {
        /// Path to genes x cells count TSV
        #[arg(short = 'c', long)]
        counts: PathBuf,

        /// Path to cell annotation TSV (cell_id, sample_id, subset)
        #[arg(short, long)]
        annotations: PathBuf,

        /// Path to sample metadata TSV
        #[arg(short, long)]
        metadata: PathBuf,

        /// Subsets to aggregate (default: all)
        #[arg(short, long, value_delimiter = ',')]
        subsets: Option<Vec<String>>,

        /// Minimum cells per (sample, subset) profile
        #[arg(long, default_value = "10")]
        min_cells: usize,

        /// Samples to leave out
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<String>,

        /// Output path for the pseudobulk count TSV
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write an example analysis configuration
    Example {
        /// Output path for the YAML file
        #[arg(short, long, default_value = "analysis.yaml")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { config, output } => cmd_run(&config, output.as_ref()),

        Commands::Aggregate {
            counts,
            annotations,
            metadata,
            subsets,
            min_cells,
            exclude,
            output,
        } => cmd_aggregate(
            &counts,
            &annotations,
            &metadata,
            AggregationConfig {
                subsets,
                min_cells,
                exclude_samples: exclude,
                group: None,
            },
            &output,
        ),

        Commands::Example { output } => cmd_example(&output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Run a batch from configuration
fn cmd_run(config_path: &PathBuf, output_dir: Option<&PathBuf>) -> Result<()> {
    info!("Loading analysis configuration from {:?}", config_path);
    let config = AnalysisConfig::from_yaml_file(config_path)?;

    let inputs = Inputs::load(&config)?;
    info!(
        "Loaded {} genes x {} cells",
        inputs.cells.counts().n_genes(),
        inputs.cells.counts().n_columns()
    );

    info!(
        "Running '{}' ({} comparisons)",
        config.name,
        config.comparisons.len()
    );
    let outcome = run_batch(&inputs, &config);

    let out_dir = output_dir.cloned().unwrap_or_else(|| config.output_dir.clone());
    write_outputs(&outcome, &out_dir)?;

    eprintln!(
        "Done! {} completed, {} skipped",
        outcome.report.completed.len(),
        outcome.report.skipped.len()
    );
    for skipped in &outcome.report.skipped {
        eprintln!("  {} [{}]: {}", skipped.name, skipped.reason_code, skipped.message);
    }
    Ok(())
}

/// Aggregate and write the pseudobulk matrix plus a drop report
fn cmd_aggregate(
    counts_path: &PathBuf,
    annotations_path: &PathBuf,
    metadata_path: &PathBuf,
    config: AggregationConfig,
    output_path: &PathBuf,
) -> Result<()> {
    let cells = LabeledCells::from_tsv(counts_path, annotations_path)?;
    let metadata = Metadata::from_tsv(metadata_path)?;
    let (pseudobulk, report) = aggregate_pseudobulk(&cells, &metadata, &config)?;

    pseudobulk.counts.to_tsv(output_path)?;
    let report_path = output_path.with_extension("dropped.json");
    std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)?;

    eprintln!(
        "Wrote {} profiles to {:?} ({} pairs dropped, see {:?})",
        pseudobulk.n_profiles(),
        output_path,
        report.dropped.len(),
        report_path
    );
    Ok(())
}

/// Write the example configuration
fn cmd_example(output_path: &PathBuf) -> Result<()> {
    let yaml = example_yaml();
    std::fs::write(output_path, yaml)?;
    eprintln!("Wrote example configuration to {:?}", output_path);
    eprintln!();
    eprintln!("Contents:");
    println!("{}", yaml);
    Ok(())
}
