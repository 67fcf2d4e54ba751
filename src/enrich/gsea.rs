//! Preranked gene set enrichment analysis.
//!
//! ## Pipeline
//!
//! 1. Restrict each set to the ranked genes and drop sets outside
//!    `[min_size, max_size]` (recorded, never raised).
//! 2. Enrichment score: weighted running sum over the ranking with hit weight
//!    `|score|^gsea_param`; ES is the extreme deviation from zero.
//! 3. Shared permutations: `nperm` random gene subsets, each from its own
//!    `StdRng` seeded with `seed + i`, give size-matched null ES values.
//!    NES divides ES by the mean null ES of the same sign.
//! 4. Simple p-value `min((1 + #≤ES)/(1 + #≤0), (1 + #≥ES)/(1 + #≥0))`.
//!    Sets with fewer than ten more extreme permutations are re-estimated by
//!    adaptive multilevel splitting, floored at `eps`.
//! 5. BH across tested sets, then the leading edge: members up to the
//!    running-sum extremum, in order of contribution.

use crate::correct::bh_adjust;
use crate::data::pvalue_order;
use crate::enrich::gene_set::{ExcludedSet, GeneSetCollection, IndexedSet};
use crate::enrich::rank::RankedGenes;
use crate::error::{Note, PbError, Result};
use crate::model::ql::trigamma;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF};
use statrs::function::gamma::digamma;
use std::collections::BTreeMap;

/// Sets with fewer more extreme permutations than this use multilevel p-values.
const MIN_MORE_EXTREME: usize = 10;

/// Configuration for GSEA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GseaConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Number of shared permutations for NES and simple p-values.
    pub nperm: usize,
    /// Samples per level of the multilevel splitting (made odd).
    pub sample_size: usize,
    /// Lower bound on reported p-values; 0 disables the bound.
    pub eps: f64,
    pub seed: u64,
    /// Exponent applied to ranking scores in the running sum.
    pub gsea_param: f64,
}

impl Default for GseaConfig {
    fn default() -> Self {
        Self {
            min_size: 15,
            max_size: 500,
            nperm: 1000,
            sample_size: 101,
            eps: 1e-50,
            seed: 42,
            gsea_param: 1.0,
        }
    }
}

impl GseaConfig {
    fn validate(&self) -> Result<()> {
        if self.min_size == 0 || self.max_size < self.min_size {
            return Err(PbError::InvalidParameter(format!(
                "gene set size bounds [{}, {}] are invalid",
                self.min_size, self.max_size
            )));
        }
        if self.nperm == 0 {
            return Err(PbError::InvalidParameter("nperm must be positive".to_string()));
        }
        if self.sample_size < 3 {
            return Err(PbError::InvalidParameter(
                "sample_size must be at least 3".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.eps) {
            return Err(PbError::InvalidParameter("eps must be in [0, 1)".to_string()));
        }
        if !(self.gsea_param >= 0.0) {
            return Err(PbError::InvalidParameter(
                "gsea_param must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Enrichment of one gene set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathwayResult {
    pub pathway: String,
    #[serde(rename = "ES")]
    pub es: f64,
    /// NaN when no permutation has the same sign as ES.
    #[serde(rename = "NES")]
    pub nes: f64,
    #[serde(rename = "PValue")]
    pub p_value: f64,
    #[serde(rename = "FDR")]
    pub fdr: f64,
    /// Standard deviation of log2 p-value; NaN when p hit the `eps` floor.
    pub log2err: f64,
    pub size: usize,
    #[serde(rename = "leadingEdge")]
    pub leading_edge: Vec<String>,
}

/// Result of one enrichment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    /// Tested sets, sorted by p-value then pathway name.
    pub rows: Vec<PathwayResult>,
    pub excluded: Vec<ExcludedSet>,
    /// Set when nothing was left to test.
    pub note: Option<Note>,
}

impl EnrichmentResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, pathway: &str) -> Option<&PathwayResult> {
        self.rows.iter().find(|r| r.pathway == pathway)
    }
}

/// Running-sum statistics of one set.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RunningSum {
    pub es: f64,
    /// Indices into the set's positions, most contributing first.
    pub leading_edge: Vec<usize>,
}

/// ES and leading edge of a set at ascending `positions` of `ranks`
/// (non-negative hit weights).
pub(crate) fn running_sum(ranks: &[f64], positions: &[usize]) -> RunningSum {
    let n = ranks.len();
    let k = positions.len();
    let ns: f64 = positions.iter().map(|&p| ranks[p]).sum();
    let miss = 1.0 / (n - k) as f64;

    let mut cur = 0.0;
    let mut last: i64 = -1;
    let (mut top, mut top_at) = (f64::NEG_INFINITY, 0);
    let (mut bottom, mut bottom_at) = (f64::INFINITY, 0);
    for (i, &p) in positions.iter().enumerate() {
        cur -= miss * (p as i64 - last - 1) as f64;
        if cur < bottom {
            bottom = cur;
            bottom_at = i;
        }
        cur += if ns > 0.0 { ranks[p] / ns } else { 1.0 / k as f64 };
        if cur > top {
            top = cur;
            top_at = i;
        }
        last = p as i64;
    }

    if top > -bottom {
        RunningSum {
            es: top,
            leading_edge: (0..=top_at).collect(),
        }
    } else if top < -bottom {
        RunningSum {
            es: bottom,
            leading_edge: (bottom_at..k).rev().collect(),
        }
    } else {
        RunningSum {
            es: 0.0,
            leading_edge: Vec::new(),
        }
    }
}

/// Largest positive deviation of the running sum.
fn positive_es(ranks: &[f64], positions: &[usize]) -> f64 {
    let n = ranks.len();
    let k = positions.len();
    let ns: f64 = positions.iter().map(|&p| ranks[p]).sum();
    let miss = 1.0 / (n - k) as f64;
    let mut cur = 0.0;
    let mut best = 0.0_f64;
    let mut last: i64 = -1;
    for &p in positions {
        let hit = if ns > 0.0 { ranks[p] / ns } else { 1.0 / k as f64 };
        cur += hit - miss * (p as i64 - last - 1) as f64;
        best = best.max(cur);
        last = p as i64;
    }
    best
}

/// Random `k`-subset of `0..n` as the prefix of a partial Fisher-Yates shuffle.
fn random_prefix(n: usize, k: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..n).collect();
    for i in 0..k {
        let j = rng.random_range(i..n);
        indices.swap(i, j);
    }
    indices.truncate(k);
    indices
}

/// Shared permutations, each drawn from its own seeded generator.
fn shared_permutations(n: usize, k_max: usize, nperm: usize, seed: u64) -> Vec<Vec<usize>> {
    (0..nperm)
        .into_par_iter()
        .map(|i| {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(i as u64));
            random_prefix(n, k_max, &mut rng)
        })
        .collect()
}

/// Null ES for every set size, from the prefixes of the shared permutations.
fn null_es_by_size(
    ranks: &[f64],
    sizes: &[usize],
    perms: &[Vec<usize>],
) -> BTreeMap<usize, Vec<f64>> {
    sizes
        .iter()
        .map(|&k| {
            let es: Vec<f64> = perms
                .par_iter()
                .map(|perm| {
                    let mut positions = perm[..k].to_vec();
                    positions.sort_unstable();
                    running_sum(ranks, &positions).es
                })
                .collect();
            (k, es)
        })
        .collect()
}

/// Permutation counts for one observed ES.
#[derive(Debug, Clone, Copy)]
struct NullCounts {
    le_es: usize,
    ge_es: usize,
    le_zero: usize,
    ge_zero: usize,
    le_zero_mean: f64,
    ge_zero_mean: f64,
}

impl NullCounts {
    fn new(es: f64, null: &[f64]) -> Self {
        let mut counts = NullCounts {
            le_es: 0,
            ge_es: 0,
            le_zero: 0,
            ge_zero: 0,
            le_zero_mean: 0.0,
            ge_zero_mean: 0.0,
        };
        let (mut le_sum, mut ge_sum) = (0.0, 0.0);
        for &v in null {
            if v <= es {
                counts.le_es += 1;
            }
            if v >= es {
                counts.ge_es += 1;
            }
            if v <= 0.0 {
                counts.le_zero += 1;
                le_sum += v;
            }
            if v >= 0.0 {
                counts.ge_zero += 1;
                ge_sum += v;
            }
        }
        counts.le_zero_mean = le_sum / counts.le_zero as f64;
        counts.ge_zero_mean = ge_sum / counts.ge_zero as f64;
        counts
    }

    fn nes(&self, es: f64) -> f64 {
        if es > 0.0 && self.ge_zero_mean > 0.0 {
            es / self.ge_zero_mean
        } else if es < 0.0 && self.le_zero_mean < 0.0 {
            es / self.le_zero_mean.abs()
        } else {
            f64::NAN
        }
    }

    fn simple_pvalue(&self) -> f64 {
        ((1 + self.le_es) as f64 / (1 + self.le_zero) as f64)
            .min((1 + self.ge_es) as f64 / (1 + self.ge_zero) as f64)
            .min(1.0)
    }

    fn n_more_extreme(&self, es: f64) -> usize {
        if es > 0.0 {
            self.ge_es
        } else {
            self.le_es
        }
    }

    /// Fraction of permutations with the same sign as `es`.
    fn mode_fraction(&self, es: f64, nperm: usize) -> f64 {
        let mode = if es >= 0.0 { self.ge_zero } else { self.le_zero };
        (mode + 1) as f64 / (nperm + 1) as f64
    }
}

/// Half-width of the 95% Beta interval of log2 p for a simple estimate.
fn simple_log2err(n_more_extreme: usize, nperm: usize) -> f64 {
    let n = n_more_extreme as f64;
    let total = nperm as f64;
    let crude = ((n + 1.0) / (total + 1.0)).log2();
    let left = if n > 0.0 {
        Beta::new(n, total - n + 1.0)
            .map(|b| b.inverse_cdf(0.025).log2())
            .unwrap_or(f64::NAN)
    } else {
        f64::NEG_INFINITY
    };
    let right = Beta::new(n + 1.0, (total - n).max(f64::MIN_POSITIVE))
        .map(|b| b.inverse_cdf(0.975).log2())
        .unwrap_or(f64::NAN);
    0.5 * (crude - left).max(right - crude)
}

fn multilevel_log2err(p_value: f64, sample_size: usize) -> f64 {
    let s = sample_size as f64;
    let levels = (-p_value.log2() + 1.0).floor();
    (levels * (trigamma((s + 1.0) / 2.0) - trigamma(s + 1.0))).sqrt() / std::f64::consts::LN_2
}

/// `E[log X]` for `X ~ Beta(a, b − a + 1)`.
fn beta_mean_log(a: usize, b: usize) -> f64 {
    digamma(a as f64) - digamma((b + 1) as f64)
}

/// Sign of the running sum without the positive-part restriction.
fn signed_es(ranks: &[f64], positions: &[usize]) -> f64 {
    running_sum(ranks, positions).es
}

/// Try `k / 10` random member swaps on one sample, keeping a swap only while
/// its positive ES stays above `bound`. Returns the number of accepted moves.
fn perturb(ranks: &[f64], sample: &mut Vec<usize>, bound: f64, rng: &mut StdRng) -> usize {
    let n = ranks.len();
    let k = sample.len();
    let attempts = (k / 10).max(1);
    let mut moves = 0;
    for _ in 0..attempts {
        let old_at = rng.random_range(0..k);
        let new = rng.random_range(0..n);
        if sample.binary_search(&new).is_ok() {
            if sample[old_at] == new {
                moves += 1;
            }
            continue;
        }
        let old = sample.remove(old_at);
        let insert_at = sample.partition_point(|&v| v < new);
        sample.insert(insert_at, new);
        if positive_es(ranks, sample) > bound {
            moves += 1;
        } else {
            sample.remove(insert_at);
            let restore_at = sample.partition_point(|&v| v < old);
            sample.insert(restore_at, old);
        }
    }
    moves
}

/// Adaptive multilevel estimator of `P(ES⁺ ≥ es)` for random sets of a
/// fixed size.
struct EsRuler<'a> {
    ranks: &'a [f64],
    sample_size: usize,
    pathway_size: usize,
    samples: Vec<Vec<usize>>,
    /// Level boundaries, one per discarded sample.
    levels: Vec<f64>,
    /// Samples with positive signed ES still alive at each level.
    prob_corrector: Vec<usize>,
}

impl<'a> EsRuler<'a> {
    fn new(ranks: &'a [f64], sample_size: usize, pathway_size: usize) -> Self {
        Self {
            ranks,
            sample_size,
            pathway_size,
            samples: Vec::with_capacity(sample_size),
            levels: Vec::new(),
            prob_corrector: Vec::new(),
        }
    }

    fn top_level(&self) -> f64 {
        self.levels.last().copied().unwrap_or(0.0)
    }

    /// Discard the lower half of the samples and duplicate the upper half.
    fn duplicate_samples(&mut self) {
        let s = self.sample_size;
        let mut stats: Vec<(f64, usize)> = self
            .samples
            .iter()
            .enumerate()
            .map(|(i, sample)| (positive_es(self.ranks, sample), i))
            .collect();
        let positive: Vec<bool> = self
            .samples
            .iter()
            .map(|sample| signed_es(self.ranks, sample) > 0.0)
            .collect();
        let mut n_positive = positive.iter().filter(|&&p| p).count();

        stats.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut id = 0;
        while 2 * id < s {
            self.levels.push(stats[id].0);
            if positive[stats[id].1] {
                n_positive -= 1;
            }
            self.prob_corrector.push(n_positive);
            id += 1;
        }

        let mut next = Vec::with_capacity(s);
        let mut id = 0;
        while 2 * id < s - 2 {
            let keep = &self.samples[stats[s - 1 - id].1];
            next.push(keep.clone());
            next.push(keep.clone());
            id += 1;
        }
        next.push(self.samples[stats[s >> 1].1].clone());
        self.samples = next;
    }

    fn extend(&mut self, es: f64, seed: u64, eps: f64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = self.ranks.len();
        self.samples = (0..self.sample_size)
            .map(|_| {
                let mut s = random_prefix(n, self.pathway_size, &mut rng);
                s.sort_unstable();
                s
            })
            .collect();
        self.duplicate_samples();

        let target_moves = self.sample_size * self.pathway_size;
        let max_rounds = 100 * self.pathway_size.max(10);
        let half = (self.sample_size + 1) / 2;
        while self.top_level() <= es - 1e-10 {
            let bound = self.top_level();
            let ranks = self.ranks;
            let mut moves = 0;
            let mut rounds = 0;
            while moves < target_moves && rounds < max_rounds {
                for sample in self.samples.iter_mut() {
                    moves += perturb(ranks, sample, bound, &mut rng);
                }
                rounds += 1;
            }

            let previous = self.top_level();
            self.duplicate_samples();
            if self.top_level() <= previous {
                break;
            }
            if eps > 0.0 {
                let depth = self.levels.len() / half;
                if depth as f64 > -(0.5 * eps).log2() {
                    break;
                }
            }
        }
    }

    /// Estimated `P(ES⁺ ≥ es)`, and whether the levels reached `es`.
    fn p_value(&self, es: f64) -> (f64, bool) {
        let s = self.sample_size;
        let half = (s + 1) / 2;
        let mut good_error = true;
        let idx = if es >= self.top_level() {
            let idx = self.levels.len() - 1;
            if es > self.levels[idx] + 1e-10 {
                good_error = false;
            }
            idx
        } else {
            self.levels.partition_point(|&l| l < es)
        };

        let depth = idx / half;
        let remainder = s - (idx % half);
        let log_p = depth as f64 * beta_mean_log(half, s) + beta_mean_log(remainder + 1, s);
        let correction = beta_mean_log(self.prob_corrector[idx] + 1, remainder);
        if correction.exp() < 0.5 {
            good_error = false;
        }
        ((log_p + correction).exp().clamp(0.0, 1.0), good_error)
    }
}

/// Multilevel p-value of `es` for sets of size `k`.
fn multilevel_pvalue(
    es: f64,
    abs_ranks: &[f64],
    k: usize,
    sample_size: usize,
    seed: u64,
    eps: f64,
) -> (f64, bool) {
    // Negative ES is the positive ES of the reversed ranking
    let oriented: Vec<f64> = if es >= 0.0 {
        abs_ranks.to_vec()
    } else {
        abs_ranks.iter().rev().copied().collect()
    };
    let mut ruler = EsRuler::new(&oriented, sample_size, k);
    ruler.extend(es.abs(), seed, eps);
    ruler.p_value(es.abs())
}

/// Run preranked GSEA of `collection` against `ranked`.
///
/// An empty collection after size filtering returns an empty table with a
/// `GENE_SET_SIZE` note rather than an error.
pub fn run_gsea(
    ranked: &RankedGenes,
    collection: &GeneSetCollection,
    config: &GseaConfig,
) -> Result<EnrichmentResult> {
    config.validate()?;
    if ranked.len() < 2 {
        return Err(PbError::EmptyData(
            "GSEA needs at least two ranked genes".to_string(),
        ));
    }
    let n = ranked.len();
    let sample_size = config.sample_size | 1;
    let max_size = config.max_size.min(n - 1);

    let universe = ranked.positions();
    let (sets, excluded) = collection.restrict(&universe, config.min_size, max_size);
    if sets.is_empty() {
        let err = PbError::GeneSetSize {
            min_size: config.min_size,
            max_size: config.max_size,
            excluded: excluded.len(),
        };
        warn!("{}", err);
        return Ok(EnrichmentResult {
            rows: Vec::new(),
            excluded,
            note: Some(Note::from(&err)),
        });
    }

    let ranks: Vec<f64> = ranked
        .scores()
        .iter()
        .map(|s| s.abs().powf(config.gsea_param))
        .collect();

    let observed: Vec<RunningSum> = sets
        .par_iter()
        .map(|set| running_sum(&ranks, &set.positions))
        .collect();

    let mut sizes: Vec<usize> = sets.iter().map(|s| s.positions.len()).collect();
    sizes.sort_unstable();
    sizes.dedup();
    let k_max = sizes.last().copied().unwrap_or(0);
    let perms = shared_permutations(n, k_max, config.nperm, config.seed);
    let null = null_es_by_size(&ranks, &sizes, &perms);
    debug!(
        "GSEA: {} sets, {} distinct sizes, {} permutations",
        sets.len(),
        sizes.len(),
        config.nperm
    );

    let ml_seed_base = config.seed.wrapping_add(config.nperm as u64);
    let scored: Vec<(f64, f64, f64)> = sets
        .par_iter()
        .zip(&observed)
        .enumerate()
        .map(|(i, (set, obs))| {
            let k = set.positions.len();
            let counts = match null.get(&k) {
                Some(values) => NullCounts::new(obs.es, values),
                None => NullCounts::new(obs.es, &[]),
            };
            let nes = counts.nes(obs.es);
            let more_extreme = counts.n_more_extreme(obs.es);
            if more_extreme >= MIN_MORE_EXTREME {
                return (
                    nes,
                    counts.simple_pvalue(),
                    simple_log2err(more_extreme, config.nperm),
                );
            }

            let (p_ml, good) = multilevel_pvalue(
                obs.es,
                &ranks,
                k,
                sample_size,
                ml_seed_base.wrapping_add(i as u64),
                config.eps,
            );
            let p = (p_ml / counts.mode_fraction(obs.es, config.nperm)).min(1.0);
            if p < config.eps || !good {
                (nes, p.max(config.eps), f64::NAN)
            } else {
                (nes, p, multilevel_log2err(p, sample_size))
            }
        })
        .collect();

    let p_values: Vec<f64> = scored.iter().map(|s| s.1).collect();
    let fdr = bh_adjust(&p_values);

    let genes = ranked.genes();
    let mut rows: Vec<PathwayResult> = sets
        .iter()
        .zip(&observed)
        .zip(scored)
        .zip(fdr)
        .map(|(((set, obs), (nes, p_value, log2err)), fdr)| PathwayResult {
            pathway: set.name.clone(),
            es: obs.es,
            nes,
            p_value,
            fdr,
            log2err,
            size: set.positions.len(),
            leading_edge: leading_edge_genes(set, obs, genes),
        })
        .collect();
    rows.sort_by(|a, b| pvalue_order(a.p_value, &a.pathway, b.p_value, &b.pathway));

    info!(
        "GSEA tested {} sets ({} excluded by size)",
        rows.len(),
        excluded.len()
    );
    Ok(EnrichmentResult {
        rows,
        excluded,
        note: None,
    })
}

fn leading_edge_genes(set: &IndexedSet, obs: &RunningSum, genes: &[String]) -> Vec<String> {
    obs.leading_edge
        .iter()
        .map(|&i| genes[set.positions[i]].clone())
        .collect()
}
