//! Cell-cycle phase assignment from pre-trained marker gene pairs.
//!
//! Every phase comes with pairs of genes `(first, second)` whose relative order is
//! informative: in cells of that phase `first` tends to be more highly expressed than
//! `second`. A cell's observed score is the fraction of informative pairs in that order.
//! Shuffling the cell's expression values among the marker genes gives a null
//! distribution of that fraction; the phase score is the fraction of shuffles scoring
//! strictly below the observed value.

use crate::config::CycleConfig;
use anyhow::{bail, Error};
use log::{info, warn};
use rand::prelude::SeedableRng;
use rand::seq::SliceRandom;
use rand_pcg::Pcg64Mcg;
use sc_types::{AnnotatedCounts, CyclePhase};
use std::collections::HashMap;

/// Marker pairs per phase, indexed by `CyclePhase::index()`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleMarkers {
    pairs: [Vec<(String, String)>; 3],
}

impl CycleMarkers {
    /// Add a pair to a phase
    pub fn push(&mut self, phase: CyclePhase, first: impl Into<String>, second: impl Into<String>) {
        self.pairs[phase.index()].push((first.into(), second.into()));
    }

    /// Pairs of one phase
    pub fn pairs(&self, phase: CyclePhase) -> &[(String, String)] {
        &self.pairs[phase.index()]
    }

    /// Total number of pairs over all phases
    pub fn len(&self) -> usize {
        self.pairs.iter().map(Vec::len).sum()
    }

    /// No pairs for any phase
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-cell classifier output, aligned with the columns of the input
#[derive(Clone, Debug)]
pub struct CycleAssignment {
    /// Assigned phase
    pub phases: Vec<CyclePhase>,
    /// Phase scores, one row per cell in `CyclePhase::ALL` order; NaN when not computable
    pub scores: Vec<[f64; 3]>,
    /// Scores divided by their per-cell sum
    pub normalized: Vec<[f64; 3]>,
}

impl CycleAssignment {
    /// Number of cells assigned to each phase, in `CyclePhase::ALL` order
    pub fn phase_counts(&self) -> [usize; 3] {
        let mut counts = [0; 3];
        for p in &self.phases {
            counts[p.index()] += 1;
        }
        counts
    }
}

/// Pick the phase from the three scores. NaN never reaches the 0.5 threshold.
pub fn assign_phase(scores: [f64; 3]) -> CyclePhase {
    let [g1, _, g2m] = scores;
    if g1 >= 0.5 && !(g1 <= g2m) {
        CyclePhase::G1
    } else if g2m >= 0.5 && !(g2m < g1) {
        CyclePhase::G2M
    } else {
        CyclePhase::S
    }
}

fn normalize_scores(scores: [f64; 3]) -> [f64; 3] {
    let total: f64 = scores.iter().filter(|s| !s.is_nan()).sum();
    if total > 0.0 {
        scores.map(|s| s / total)
    } else {
        [f64::NAN; 3]
    }
}

/// Marker pairs of one phase, as positions into a compact vector of used genes
struct PhasePairs {
    rows: Vec<usize>,
    pairs: Vec<(usize, usize)>,
}

impl PhasePairs {
    fn new(markers: &[(String, String)], index: &HashMap<&str, usize>) -> PhasePairs {
        let mut rows = Vec::new();
        let mut local: HashMap<usize, usize> = HashMap::new();
        let mut pairs = Vec::new();
        for (first, second) in markers {
            let (Some(&a), Some(&b)) = (index.get(first.as_str()), index.get(second.as_str())) else {
                continue;
            };
            let mut slot = |row: usize| {
                *local.entry(row).or_insert_with(|| {
                    rows.push(row);
                    rows.len() - 1
                })
            };
            let a = slot(a);
            let b = slot(b);
            pairs.push((a, b));
        }
        PhasePairs { rows, pairs }
    }

    /// Fraction of ordered pairs among the informative (non-tied) ones, and their number
    fn fraction(&self, values: &[f64]) -> (f64, usize) {
        let mut above = 0usize;
        let mut informative = 0usize;
        for &(a, b) in &self.pairs {
            if values[a] != values[b] {
                informative += 1;
                above += (values[a] > values[b]) as usize;
            }
        }
        if informative == 0 {
            (f64::NAN, 0)
        } else {
            (above as f64 / informative as f64, informative)
        }
    }

    fn score(&self, mut values: Vec<f64>, config: &CycleConfig, rng: &mut Pcg64Mcg) -> f64 {
        let (observed, informative) = self.fraction(&values);
        if informative < config.min_pairs {
            return f64::NAN;
        }
        let mut below = 0usize;
        let mut valid = 0usize;
        for _ in 0..config.iterations {
            values.shuffle(rng);
            let (null, n) = self.fraction(&values);
            if n >= config.min_pairs {
                valid += 1;
                below += (null < observed) as usize;
            }
        }
        if valid < config.min_iter {
            f64::NAN
        } else {
            below as f64 / valid as f64
        }
    }
}

/// Score every cell of `counts` against the marker pairs and assign phases.
/// Spike-in rows are never used as markers.
pub fn classify(counts: &AnnotatedCounts, markers: &CycleMarkers, config: &CycleConfig) -> Result<CycleAssignment, Error> {
    let index: HashMap<&str, usize> = counts
        .genes
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_spike)
        .map(|(i, g)| (g.id.as_str(), i))
        .collect();

    let phase_pairs: Vec<PhasePairs> = CyclePhase::ALL
        .iter()
        .map(|&p| {
            let pp = PhasePairs::new(markers.pairs(p), &index);
            info!(
                "{}: {} of {} marker pairs present in the data",
                p,
                pp.pairs.len(),
                markers.pairs(p).len()
            );
            pp
        })
        .collect();
    if phase_pairs.iter().all(|pp| pp.pairs.is_empty()) {
        bail!("none of the {} cell-cycle marker pairs match genes in the data", markers.len());
    }

    let dense: Vec<_> = phase_pairs.iter().map(|pp| counts.rows_dense(&pp.rows)).collect();
    let mut rngs: Vec<Pcg64Mcg> = (0..3)
        .map(|i| Pcg64Mcg::seed_from_u64(config.seed.wrapping_add(i as u64)))
        .collect();

    let mut scores = Vec::with_capacity(counts.num_cells());
    for cell in 0..counts.num_cells() {
        let mut cell_scores = [f64::NAN; 3];
        for (i, pp) in phase_pairs.iter().enumerate() {
            if pp.pairs.is_empty() {
                continue;
            }
            let values: Vec<f64> = dense[i].column(cell).iter().map(|&v| v as f64).collect();
            cell_scores[i] = pp.score(values, config, &mut rngs[i]);
        }
        scores.push(cell_scores);
    }

    let unscored = scores.iter().filter(|s| s.iter().all(|v| v.is_nan())).count();
    if unscored > 0 {
        warn!("{} cells have too few informative marker pairs for any phase", unscored);
    }

    let phases: Vec<CyclePhase> = scores.iter().map(|&s| assign_phase(s)).collect();
    let normalized = scores.iter().map(|&s| normalize_scores(s)).collect();
    let assignment = CycleAssignment {
        phases,
        scores,
        normalized,
    };
    let [g1, s, g2m] = assignment.phase_counts();
    info!("cell-cycle phases: G1 {}, S {}, G2M {}", g1, s, g2m);
    Ok(assignment)
}
