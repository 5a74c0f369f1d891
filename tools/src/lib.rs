//! Driver for the `sc-flow-cmd` binary: loads the inputs, runs the pipeline and writes
//! the tables and plots of a run into an output directory.

use anyhow::{Context, Error};
use log::info;
use sc_flow::annotation::load_gene_reference;
use sc_flow::config::ReportConfig;
use sc_flow::io::{load_count_table, load_gene_list, load_marker_pairs};
use sc_flow::{AnalysisConfig, AnalysisResult};
use std::collections::HashSet;
use std::fs::{create_dir_all, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub mod plots;
pub mod tables;

/// Input files of a run
#[derive(Clone, Debug)]
pub struct Inputs {
    /// Gene x cell count table
    pub counts: PathBuf,
    /// Gene reference table
    pub reference: PathBuf,
    /// Cell-cycle marker pairs; phase assignment is skipped without them
    pub markers: Option<PathBuf>,
    /// Bulk-tissue signature genes to flag among the PC1 genes
    pub signature: Option<PathBuf>,
}

/// Write every table and plot of `res` into `out_dir`.
pub fn write_report(
    res: &AnalysisResult,
    signature: &HashSet<String>,
    config: &ReportConfig,
    out_dir: &Path,
) -> Result<(), Error> {
    create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;

    tables::write_cell_qc(res, &out_dir.join("cell_qc.tsv"))?;
    tables::write_hvg(res, &out_dir.join("hvg.tsv"))?;
    tables::write_variance(res, &out_dir.join("variance.tsv"))?;
    tables::write_pca(res, &out_dir.join("pca_cells.tsv"), &out_dir.join("pca_variance.tsv"))?;
    tables::write_de_pc1(res, signature, &out_dir.join("de_pc1.tsv"))?;
    if !signature.is_empty() {
        tables::log_signature_overlap(res, signature, config.heatmap_genes);
    }
    tables::write_summary(res, &out_dir.join("summary.json"))?;

    plots::qc_histograms(res, &out_dir.join("qc_histograms.svg"))?;
    plots::variance_trend(res, &out_dir.join("variance_trend.svg"))?;
    plots::pca(res, &out_dir.join("pca.svg"))?;
    plots::heatmap(res, config.heatmap_genes, &out_dir.join("heatmap.svg"))?;
    let scatters = plots::gene_scatters(res, config.scatter_genes, &out_dir.join("genes"))?;

    info!(
        "wrote tables, plots and {} gene scatter plots to {}",
        scatters.len(),
        out_dir.display()
    );
    Ok(())
}

/// Load the inputs, run the analysis, and write the effective configuration and the
/// report into `out_dir`.
pub fn analyse(inputs: &Inputs, config: &AnalysisConfig, out_dir: &Path) -> Result<AnalysisResult, Error> {
    config.validate()?;
    create_dir_all(out_dir).with_context(|| out_dir.display().to_string())?;
    let config_path = out_dir.join("config.json");
    let file = File::create(&config_path).with_context(|| config_path.display().to_string())?;
    serde_json::to_writer_pretty(BufWriter::new(file), config)?;

    let counts = load_count_table(&inputs.counts)?;
    let reference = load_gene_reference(&inputs.reference)?;
    let markers = inputs.markers.as_ref().map(|path| load_marker_pairs(path)).transpose()?;
    let signature = match &inputs.signature {
        Some(path) => tables::signature_set(&load_gene_list(path)?),
        None => HashSet::new(),
    };

    let res = sc_flow::run(counts, &reference, markers.as_ref(), config)?;
    write_report(&res, &signature, &config.report, out_dir)?;
    Ok(res)
}
