//! Tab-separated result tables and the JSON run summary.

use anyhow::{Context, Error};
use log::info;
use sc_flow::AnalysisResult;
use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

type TsvWriter = csv::Writer<BufWriter<File>>;

fn tsv_writer(path: &Path) -> Result<TsvWriter, Error> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    Ok(csv::WriterBuilder::new().delimiter(b'\t').from_writer(BufWriter::new(file)))
}

/// Floats as written in every table: `NA` for NaN.
pub fn fmt_f64(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else {
        v.to_string()
    }
}

fn fmt_opt(v: Option<f64>) -> String {
    v.map(fmt_f64).unwrap_or_default()
}

/// One row per input cell: QC metrics and flags, then phase and size factors for the
/// cells that passed QC.
pub fn write_cell_qc(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    let mut kept_pos = vec![None; res.raw.num_cells()];
    for (pos, &cell) in res.qc.kept.iter().enumerate() {
        kept_pos[cell] = Some(pos);
    }

    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "cell",
        "total_counts",
        "total_features",
        "pct_spike",
        "pct_mito",
        "drop_libsize",
        "drop_features",
        "drop_mito",
        "drop_spike",
        "kept",
        "phase",
        "G1_score",
        "S_score",
        "G2M_score",
        "size_factor",
        "spike_size_factor",
    ])?;
    for (cell, name) in res.raw.cells.iter().enumerate() {
        let m = &res.qc.metrics[cell];
        let f = &res.qc.flags[cell];
        let pos = kept_pos[cell];
        let phase = match (pos, &res.cycle) {
            (Some(p), Some(c)) => c.phases[p].to_string(),
            _ => "NA".to_string(),
        };
        let score = |i: usize| match (pos, &res.cycle) {
            (Some(p), Some(c)) => fmt_f64(c.scores[p][i]),
            _ => String::new(),
        };
        wtr.write_record([
            name.clone(),
            fmt_f64(m.total_counts),
            m.total_features.to_string(),
            fmt_f64(m.pct_spike),
            fmt_f64(m.pct_mito),
            f.libsize.to_string(),
            f.features.to_string(),
            f.mito.to_string(),
            f.spike.to_string(),
            pos.is_some().to_string(),
            phase,
            score(0),
            score(1),
            score(2),
            fmt_opt(pos.map(|p| res.size_factors[p])),
            fmt_opt(pos.and_then(|p| res.spike_size_factors.as_ref().map(|s| s[p]))),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

const VARIANCE_HEADER: [&str; 10] = [
    "gene_id", "symbol", "is_spike", "mean", "total", "bio", "tech", "p.value", "FDR", "hvg",
];

fn write_variance_rows(res: &AnalysisResult, rows: &[usize], path: &Path) -> Result<(), Error> {
    let hvg: HashSet<usize> = res.hvg.iter().copied().collect();
    let mut wtr = tsv_writer(path)?;
    wtr.write_record(VARIANCE_HEADER)?;
    for &g in rows {
        let gene = &res.counts.genes[g];
        let v = &res.variance[g];
        wtr.write_record([
            gene.id.clone(),
            gene.symbol.clone(),
            gene.is_spike.to_string(),
            fmt_f64(v.mean),
            fmt_f64(v.total),
            fmt_f64(v.bio),
            fmt_f64(v.tech),
            fmt_f64(v.p_value),
            fmt_f64(v.fdr),
            hvg.contains(&g).to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Highly variable genes, by decreasing biological variance
pub fn write_hvg(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    write_variance_rows(res, &res.hvg, path)
}

/// Variance decomposition of every retained gene and spike-in
pub fn write_variance(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    let rows: Vec<usize> = (0..res.counts.num_genes()).collect();
    write_variance_rows(res, &rows, path)
}

/// Cell scores (`pca_cells.tsv`) and variance explained per component (`pca_variance.tsv`)
pub fn write_pca(res: &AnalysisResult, cells_path: &Path, variance_path: &Path) -> Result<(), Error> {
    let k = res.pca.scores.ncols();

    let mut wtr = tsv_writer(cells_path)?;
    let mut header = vec!["cell".to_string(), "phase".to_string()];
    header.extend((1..=k).map(|pc| format!("PC{}", pc)));
    wtr.write_record(&header)?;
    for (cell, name) in res.counts.cells.iter().enumerate() {
        let mut record = vec![
            name.clone(),
            res.phase(cell).map_or_else(|| "NA".to_string(), |p| p.to_string()),
        ];
        record.extend(res.pca.scores.row(cell).iter().map(|&v| fmt_f64(v)));
        wtr.write_record(&record)?;
    }
    wtr.flush()?;

    let mut wtr = tsv_writer(variance_path)?;
    wtr.write_record(["component", "singular_value", "percent_variance"])?;
    for pc in 0..k {
        wtr.write_record([
            format!("PC{}", pc + 1),
            fmt_f64(res.pca.singular_values[pc]),
            fmt_f64(res.pca.percent_variance[pc]),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Genes in `signature`, matched by id or case-insensitively by symbol
pub fn in_signature(res: &AnalysisResult, signature: &HashSet<String>) -> Vec<bool> {
    res.counts
        .genes
        .iter()
        .map(|g| signature.contains(&g.id) || signature.contains(&g.symbol.to_ascii_uppercase()))
        .collect()
}

/// Normalize a signature list for `in_signature`: ids as given plus upper-cased symbols.
pub fn signature_set(genes: &[String]) -> HashSet<String> {
    genes
        .iter()
        .flat_map(|g| [g.clone(), g.to_ascii_uppercase()])
        .collect()
}

/// Every endogenous gene tested against PC1, ordered by p-value.
pub fn write_de_pc1(res: &AnalysisResult, signature: &HashSet<String>, path: &Path) -> Result<(), Error> {
    let flags = in_signature(res, signature);
    let de = &res.de;
    let mut wtr = tsv_writer(path)?;
    wtr.write_record([
        "gene_id",
        "symbol",
        "chromosome",
        "biotype",
        "logFC",
        "AveExpr",
        "t",
        "P.Value",
        "adj.P.Val",
        "in_signature",
    ])?;
    for i in de.top_table(None) {
        let g = res.de_rows[i];
        let gene = &res.counts.genes[g];
        wtr.write_record([
            gene.id.clone(),
            gene.symbol.clone(),
            gene.chromosome.clone().unwrap_or_else(|| "NA".to_string()),
            gene.biotype.clone().unwrap_or_else(|| "NA".to_string()),
            fmt_f64(de.fit.coefficient[i]),
            fmt_f64(de.fit.ave_expr[i]),
            fmt_f64(de.t_stat[i]),
            fmt_f64(de.p_values[i]),
            fmt_f64(de.adjusted_p_values[i]),
            flags[g].to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Log how many of the top `n` PC1 genes belong to the signature.
pub fn log_signature_overlap(res: &AnalysisResult, signature: &HashSet<String>, n: usize) -> usize {
    let flags = in_signature(res, signature);
    let top = res.de.top_table(Some(n));
    let overlap = top.iter().filter(|&&i| flags[res.de_rows[i]]).count();
    let present = res.de_rows.iter().filter(|&&g| flags[g]).count();
    info!(
        "{} of the top {} PC1 genes are signature genes ({} signature genes tested)",
        overlap,
        top.len(),
        present
    );
    overlap
}

/// Stage sizes as pretty-printed JSON
pub fn write_summary(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    let file = File::create(path).with_context(|| path.display().to_string())?;
    serde_json::to_writer_pretty(BufWriter::new(file), &res.summary)?;
    Ok(())
}

#[cfg(test)]
mod test_tables {
    use super::*;

    #[test]
    fn test_fmt() {
        assert_eq!(fmt_f64(f64::NAN), "NA");
        assert_eq!(fmt_f64(0.25), "0.25");
        assert_eq!(fmt_opt(None), "");
    }

    #[test]
    fn test_signature_set() {
        let set = signature_set(&["Actb".to_string(), "ENSG1".to_string()]);
        assert!(set.contains("Actb"));
        assert!(set.contains("ACTB"));
        assert!(set.contains("ENSG1"));
        assert!(!set.contains("actb"));
    }
}
