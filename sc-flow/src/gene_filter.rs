//! Removal of low-abundance genes.

use crate::size_factors::library_size_factors;
use anyhow::{bail, Error};
use log::info;
use ndarray::Array1;
use sc_types::AnnotatedCounts;

/// Library-size adjusted average count of every gene: counts of each cell are divided
/// by its library size factor before averaging across cells.
pub fn average_counts(counts: &AnnotatedCounts) -> Result<Array1<f64>, Error> {
    let sf = library_size_factors(counts)?;
    let n = counts.num_cells() as f64;
    let mut avg = Array1::<f64>::zeros(counts.num_genes());
    for (row, vec) in counts.counts.outer_iterator().enumerate() {
        avg[row] = vec.iter().map(|(col, &v)| v as f64 / sf[col]).sum::<f64>() / n;
    }
    Ok(avg)
}

/// Genes kept by the abundance filter
#[derive(Clone, Debug)]
pub struct GeneFilter {
    /// Average count of every input gene
    pub average: Array1<f64>,
    /// Rows with `average >= threshold`, increasing
    pub kept: Vec<usize>,
}

impl GeneFilter {
    /// Keep genes whose average count reaches `min_average`. Spike-ins follow the same rule.
    pub fn compute(counts: &AnnotatedCounts, min_average: f64) -> Result<GeneFilter, Error> {
        let average = average_counts(counts)?;
        let kept: Vec<usize> = (0..counts.num_genes()).filter(|&g| average[g] >= min_average).collect();

        let endogenous = kept.iter().filter(|&&g| !counts.genes[g].is_spike).count();
        let spikes = kept.len() - endogenous;
        info!(
            "gene filter (average count >= {}): kept {} endogenous genes and {} spike-ins of {} rows",
            min_average,
            endogenous,
            spikes,
            counts.num_genes()
        );
        if endogenous == 0 {
            bail!("no endogenous gene has an average count of at least {}", min_average);
        }
        Ok(GeneFilter { average, kept })
    }

    /// Apply the filter
    pub fn filter(&self, counts: &AnnotatedCounts) -> AnnotatedCounts {
        counts.select_rows(&self.kept)
    }
}
