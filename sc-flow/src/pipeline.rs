//! The analysis stages chained together, from raw counts to the PC1 association test.

use crate::annotation::{annotate, AnnotationSummary, GeneReference};
use crate::cell_cycle::{classify, CycleAssignment, CycleMarkers};
use crate::config::AnalysisConfig;
use crate::dim_red::{run_pca_on_genes, PcaResult};
use crate::gene_filter::GeneFilter;
use crate::normalization::normalize_with_spikes;
use crate::qc::{QcCounts, QcFilter};
use crate::size_factors::{deconvolution_size_factors, spike_size_factors};
use crate::variance::{decompose_variance, mean_var, select_hvg, GeneVariance, TrendFit};
use anyhow::{bail, Context, Error};
use diff_exp::{covariate_differential_expression, DiffExpResult};
use log::{info, warn};
use ndarray::{Array1, Array2, Axis};
use sc_types::{AnnotatedCounts, CyclePhase};
use serde::Serialize;

/// Number of cells assigned to each phase
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    /// G1 cells
    pub g1: usize,
    /// S cells
    pub s: usize,
    /// G2/M cells
    pub g2m: usize,
}

/// Sizes of the data after each stage
#[derive(Clone, Debug, Serialize)]
pub struct Summary {
    /// Dataset name
    pub name: String,
    /// Genes and spike-ins in the input table
    pub input_genes: usize,
    /// Cells in the input table
    pub input_cells: usize,
    /// Annotation outcome
    pub annotation: AnnotationSummary,
    /// Cells dropped by each QC criterion and kept overall
    pub qc: QcCounts,
    /// Phase assignment of the QC-passing cells, absent without marker pairs
    pub cell_cycle: Option<PhaseCounts>,
    /// Endogenous genes kept by the abundance filter
    pub endogenous_genes: usize,
    /// Spike-ins kept by the abundance filter
    pub spike_ins: usize,
    /// Spike-ins the technical trend was fitted on
    pub trend_spike_ins: usize,
    /// Highly variable genes
    pub hvg: usize,
    /// Computed principal components
    pub num_pcs: usize,
    /// Percentage of variance of each component
    pub percent_variance: Vec<f64>,
    /// Genes tested against PC1
    pub de_tested: usize,
    /// Genes with adjusted p-value below 0.05
    pub de_significant: usize,
}

/// Everything the pipeline computes, kept for the report
#[derive(Debug)]
pub struct AnalysisResult {
    /// Annotated input, all cells and genes
    pub raw: AnnotatedCounts,
    /// Cell QC over the input cells
    pub qc: QcFilter,
    /// Cell-cycle assignment of the QC-passing cells
    pub cycle: Option<CycleAssignment>,
    /// Gene filter over the rows of `raw`
    pub gene_filter: GeneFilter,
    /// QC-passing cells, filtered genes
    pub counts: AnnotatedCounts,
    /// Deconvolution size factors of the columns of `counts`
    pub size_factors: Array1<f64>,
    /// Spike-in size factors of the columns of `counts`
    pub spike_size_factors: Option<Array1<f64>>,
    /// log2 normalized expression, aligned with `counts`
    pub log_expr: Array2<f64>,
    /// Technical trend fitted on the spike-ins
    pub trend: TrendFit,
    /// Variance decomposition of every row of `counts`
    pub variance: Vec<GeneVariance>,
    /// Rows of `counts` selected as highly variable, by decreasing biological variance
    pub hvg: Vec<usize>,
    /// PCA of the cells on the HVGs
    pub pca: PcaResult,
    /// Endogenous rows of `counts` tested against PC1
    pub de_rows: Vec<usize>,
    /// Moderated test of every row in `de_rows`, aligned with it
    pub de: DiffExpResult,
    /// Stage sizes
    pub summary: Summary,
}

impl AnalysisResult {
    /// Phase of every kept cell, when the classifier ran
    pub fn phase(&self, cell: usize) -> Option<CyclePhase> {
        self.cycle.as_ref().map(|c| c.phases[cell])
    }
}

/// Run every stage on `counts` with the given reference and optional marker pairs.
pub fn run(
    mut counts: AnnotatedCounts,
    reference: &GeneReference,
    markers: Option<&CycleMarkers>,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, Error> {
    config.validate()?;
    let input_genes = counts.num_genes();
    let input_cells = counts.num_cells();
    info!("analysing {}: {} genes x {} cells", counts.name, input_genes, input_cells);

    let annotation = annotate(&mut counts, reference, &config.annotation);

    let qc = QcFilter::compute(&counts, &config.qc)?;
    let cells = counts.select_cols(&qc.kept)?;

    let cycle = match markers {
        Some(markers) => Some(classify(&cells, markers, &config.cycle).context("cell-cycle classification")?),
        None => {
            info!("no cell-cycle marker pairs given, skipping phase assignment");
            None
        }
    };

    let gene_filter = GeneFilter::compute(&cells, config.gene_filter.min_average_count)?;
    let filtered = gene_filter.filter(&cells);

    let size_factors = deconvolution_size_factors(&filtered, &config.size_factors.pool_sizes)?;
    let spike_sf = if config.size_factors.spike_factors && !filtered.spike_rows().is_empty() {
        Some(spike_size_factors(&filtered)?)
    } else {
        if config.size_factors.spike_factors {
            warn!("no spike-in transcripts left after filtering, using deconvolution factors for all rows");
        }
        None
    };
    let log_expr = normalize_with_spikes(&filtered, size_factors.view(), spike_sf.as_ref().map(|s| s.view()))?;

    let spikes = filtered.spike_rows();
    if spikes.is_empty() {
        bail!("the technical trend needs spike-in transcripts, none passed the gene filter");
    }
    let (spike_means, spike_vars) = mean_var(log_expr.select(Axis(0), &spikes).view());
    let trend = TrendFit::fit(&spike_means, &spike_vars, &config.trend)?;
    let variance = decompose_variance(log_expr.view(), &filtered.genes, &trend)?;
    let hvg = select_hvg(&variance, &filtered.genes, &config.hvg);
    if hvg.is_empty() {
        bail!("no highly variable genes at FDR {} and biological variance {}", config.hvg.max_fdr, config.hvg.min_bio);
    }

    let mut pca_config = config.pca.clone();
    let max_pcs = hvg.len().min(filtered.num_cells());
    if pca_config.num_pcs > max_pcs {
        warn!("only {} components can be computed, lowering num_pcs from {}", max_pcs, pca_config.num_pcs);
        pca_config.num_pcs = max_pcs;
    }
    let pca = run_pca_on_genes(log_expr.view(), &hvg, &pca_config)?;

    let de_rows = filtered.endogenous_rows();
    let pc1 = pca.component(0);
    let de = covariate_differential_expression(log_expr.select(Axis(0), &de_rows).view(), pc1.view())
        .context("testing genes against PC1")?;
    let de_significant = de.adjusted_p_values.iter().filter(|&&q| q < 0.05).count();
    info!("{} of {} genes associated with PC1 at adjusted p < 0.05", de_significant, de_rows.len());

    let summary = Summary {
        name: counts.name.clone(),
        input_genes,
        input_cells,
        annotation,
        qc: qc.counts.clone(),
        cell_cycle: cycle.as_ref().map(|c| {
            let [g1, s, g2m] = c.phase_counts();
            PhaseCounts { g1, s, g2m }
        }),
        endogenous_genes: de_rows.len(),
        spike_ins: spikes.len(),
        trend_spike_ins: trend.means.len(),
        hvg: hvg.len(),
        num_pcs: pca_config.num_pcs,
        percent_variance: pca.percent_variance.to_vec(),
        de_tested: de_rows.len(),
        de_significant,
    };

    Ok(AnalysisResult {
        raw: counts,
        qc,
        cycle,
        gene_filter,
        counts: filtered,
        size_factors,
        spike_size_factors: spike_sf,
        log_expr,
        trend,
        variance,
        hvg,
        pca,
        de_rows,
        de,
        summary,
    })
}

#[cfg(test)]
mod test_pipeline {
    use super::*;
    use crate::annotation::ReferenceEntry;
    use crate::config::CycleConfig;
    use rand::SeedableRng;
    use rand_distr::{Distribution, LogNormal, Poisson};
    use rand_pcg::Pcg64Mcg;
    use sc_types::GeneInfo;

    const NUM_CELLS: usize = 60;
    const NUM_DE: usize = 30;

    /// Two groups of cells differing in `NUM_DE` genes, background genes spanning a wide
    /// range of abundance, two mitochondrial genes and 30 spike-ins.
    fn synthetic() -> (AnnotatedCounts, GeneReference) {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let cell_factor = LogNormal::new(0.0, 0.25).unwrap();
        let capture = LogNormal::new(0.0, 0.1).unwrap();
        let cell_sf: Vec<f64> = (0..NUM_CELLS).map(|_| cell_factor.sample(&mut rng)).collect();
        let spike_sf: Vec<f64> = (0..NUM_CELLS).map(|_| capture.sample(&mut rng)).collect();

        let mut genes = Vec::new();
        let mut means: Vec<Box<dyn Fn(usize) -> f64>> = Vec::new();
        for g in 0..NUM_DE {
            genes.push(GeneInfo::new(format!("DE{}", g)));
            means.push(Box::new(move |c: usize| if c < NUM_CELLS / 2 { 80.0 } else { 10.0 }));
        }
        for g in 0..270 {
            genes.push(GeneInfo::new(format!("BG{}", g)));
            let m = 0.5 * 1.02f64.powi(g);
            means.push(Box::new(move |_: usize| m));
        }
        for g in 0..2 {
            genes.push(GeneInfo::new(format!("MT{}", g)));
            means.push(Box::new(|_: usize| 20.0));
        }
        let num_endogenous = genes.len();
        for g in 0..30 {
            genes.push(GeneInfo::new(format!("ERCC-{:05}", g)));
            let m = 0.5 * 1.2f64.powi(g);
            means.push(Box::new(move |_: usize| m));
        }

        let mut dense = ndarray::Array2::<u32>::zeros((genes.len(), NUM_CELLS));
        for (g, mean) in means.iter().enumerate() {
            for c in 0..NUM_CELLS {
                let scale = if g < num_endogenous { cell_sf[c] } else { spike_sf[c] };
                let lambda = mean(c) * scale;
                dense[(g, c)] = Poisson::new(lambda).unwrap().sample(&mut rng) as u32;
            }
        }
        let cells = (0..NUM_CELLS).map(|c| format!("cell{}", c)).collect();
        let counts = AnnotatedCounts::from_dense("synthetic", genes, cells, dense.view()).unwrap();

        let reference = counts
            .genes
            .iter()
            .filter(|g| !g.id.starts_with("ERCC"))
            .map(|g| {
                let chromosome = if g.id.starts_with("MT") { "MT" } else { "1" };
                (
                    g.id.clone(),
                    ReferenceEntry {
                        symbol: Some(format!("sym{}", g.id)),
                        chromosome: Some(chromosome.to_string()),
                        biotype: Some("protein_coding".to_string()),
                    },
                )
            })
            .collect();
        (counts, reference)
    }

    #[test]
    fn test_run() -> Result<(), Error> {
        let (counts, reference) = synthetic();
        let res = run(counts, &reference, None, &AnalysisConfig::default())?;

        let summary = &res.summary;
        assert_eq!(summary.input_genes, 332);
        assert_eq!(summary.input_cells, NUM_CELLS);
        assert_eq!(summary.annotation.spike, 30);
        assert_eq!(summary.annotation.mito, 2);
        assert!(summary.qc.kept > NUM_CELLS / 2);
        assert!(summary.cell_cycle.is_none());

        // stage outputs stay aligned
        assert_eq!(res.counts.num_cells(), res.qc.kept.len());
        assert_eq!(res.log_expr.dim(), (res.counts.num_genes(), res.counts.num_cells()));
        assert_eq!(res.variance.len(), res.counts.num_genes());
        assert_eq!(res.size_factors.len(), res.counts.num_cells());
        assert_eq!(res.de.p_values.len(), res.de_rows.len());

        // every differential gene is highly variable and ranks ahead of the background
        let hvg_ids: Vec<&str> = res.hvg.iter().map(|&g| res.counts.genes[g].id.as_str()).collect();
        assert!(hvg_ids.len() >= NUM_DE);
        assert!(hvg_ids[..NUM_DE].iter().all(|id| id.starts_with("DE")), "{:?}", hvg_ids);
        assert!(res.hvg.iter().all(|&g| !res.counts.genes[g].is_spike));

        // PC1 splits the two groups
        let pc1 = res.pca.component(0);
        let group = |c: usize| res.counts.cells[c].trim_start_matches("cell").parse::<usize>().unwrap() < NUM_CELLS / 2;
        let sign = pc1[0].signum();
        assert!((0..pc1.len()).all(|c| (pc1[c].signum() == sign) == (group(c) == group(0))));

        // and the differential genes are the top hits against it
        let top: Vec<usize> = res.de.top_table(Some(NUM_DE));
        assert!(top.iter().all(|&i| res.counts.genes[res.de_rows[i]].id.starts_with("DE")));
        assert!(summary.de_significant >= NUM_DE);
        Ok(())
    }

    #[test]
    fn test_run_with_markers() -> Result<(), Error> {
        let (counts, reference) = synthetic();
        let mut markers = CycleMarkers::default();
        for g in 0..10 {
            markers.push(CyclePhase::G1, format!("DE{}", g), format!("BG{}", 200 + g));
            markers.push(CyclePhase::S, format!("BG{}", 250 + g), format!("BG{}", 100 + g));
            markers.push(CyclePhase::G2M, format!("BG{}", 100 + g), format!("DE{}", 10 + g));
        }
        let config = AnalysisConfig {
            cycle: CycleConfig {
                iterations: 200,
                min_pairs: 5,
                min_iter: 50,
                seed: 1,
            },
            ..AnalysisConfig::default()
        };
        let res = run(counts, &reference, Some(&markers), &config)?;
        let cycle = res.cycle.as_ref().unwrap();
        assert_eq!(cycle.phases.len(), res.counts.num_cells());
        let phases = res.summary.cell_cycle.as_ref().unwrap();
        assert_eq!(phases.g1 + phases.s + phases.g2m, res.counts.num_cells());
        assert!(res.phase(0).is_some());
        Ok(())
    }

    #[test]
    fn test_run_without_spikes() {
        let (counts, reference) = synthetic();
        let rows: Vec<usize> = (0..counts.num_genes()).filter(|&g| !counts.genes[g].id.starts_with("ERCC")).collect();
        let counts = counts.select_rows(&rows);
        assert!(run(counts, &reference, None, &AnalysisConfig::default()).is_err());
    }
}
