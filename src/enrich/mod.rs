//! Gene set enrichment on ranked differential expression results.

pub mod gene_set;
pub mod gsea;
pub mod rank;

pub use gene_set::{ExcludedSet, ExclusionReason, GeneSet, GeneSetCollection};
pub use gsea::{run_gsea, EnrichmentResult, GseaConfig, PathwayResult};
pub use rank::{signed_significance, RankedGenes};
