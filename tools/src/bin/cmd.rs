// Command line utility for running the sc-flow analysis

use anyhow::Error;
use clap::{value_parser, Arg, Command};
use sc_flow::AnalysisConfig;
use std::path::PathBuf;
use tools::{analyse, Inputs};

pub fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = Command::new("sc-flow-cmd")
        .about("Spike-in aware single-cell RNA-seq analysis: QC, normalization, HVGs, PCA and PC1 genes")
        .arg(
            Arg::new("COUNTS")
                .help("gene x cell count table (TSV, optionally gzipped)")
                .required(true)
                .index(1)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("REFERENCE")
                .help("gene reference table with gene_id, symbol, chromosome and biotype columns")
                .short('r')
                .long("reference")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("MARKERS")
                .help("cell-cycle marker pairs (phase, first, second)")
                .short('m')
                .long("markers")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("SIGNATURE")
                .help("signature genes to flag among the PC1 genes, one per line")
                .short('s')
                .long("signature")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("OUT_DIR")
                .help("Output directory")
                .short('o')
                .long("out_dir")
                .default_value("sc-flow-out")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("CONFIG")
                .help("JSON file overriding any subset of the analysis parameters")
                .short('c')
                .long("config")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("NUM_PCS")
                .help("Number of PCA dimensions to use")
                .short('d')
                .long("num_pcs")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("TOP_GENES")
                .help("Number of top PC1 genes in the heatmap")
                .short('n')
                .long("top-genes")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("SEED")
                .help("Seed of the cell-cycle permutations")
                .long("seed")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    let mut config = match matches.get_one::<PathBuf>("CONFIG") {
        Some(path) => AnalysisConfig::from_json_file(path)?,
        None => AnalysisConfig::default(),
    };
    if let Some(&num_pcs) = matches.get_one::<usize>("NUM_PCS") {
        config.pca.num_pcs = num_pcs;
    }
    if let Some(&top) = matches.get_one::<usize>("TOP_GENES") {
        config.report.heatmap_genes = top;
    }
    if let Some(&seed) = matches.get_one::<u64>("SEED") {
        config.cycle.seed = seed;
    }

    let inputs = Inputs {
        counts: matches.get_one::<PathBuf>("COUNTS").cloned().unwrap_or_default(),
        reference: matches.get_one::<PathBuf>("REFERENCE").cloned().unwrap_or_default(),
        markers: matches.get_one::<PathBuf>("MARKERS").cloned(),
        signature: matches.get_one::<PathBuf>("SIGNATURE").cloned(),
    };
    let out_dir = matches.get_one::<PathBuf>("OUT_DIR").cloned().unwrap_or_default();

    analyse(&inputs, &config, &out_dir)?;
    Ok(())
}
