//! Gene annotation from a local reference table.

use crate::config::AnnotationConfig;
use crate::io::{open_text, tsv_reader};
use anyhow::{bail, format_err, Context, Error};
use log::{info, warn};
use sc_types::AnnotatedCounts;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// One reference record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceEntry {
    /// gene symbol
    pub symbol: Option<String>,
    /// chromosome name
    pub chromosome: Option<String>,
    /// gene biotype, e.g. `protein_coding`
    pub biotype: Option<String>,
}

/// Gene id to annotation lookup
#[derive(Clone, Debug, Default)]
pub struct GeneReference {
    entries: HashMap<String, ReferenceEntry>,
}

impl GeneReference {
    /// Annotation of `gene_id`, if the reference has it
    pub fn get(&self, gene_id: &str) -> Option<&ReferenceEntry> {
        self.entries.get(gene_id)
    }

    /// Number of genes in the reference
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True for a reference without genes
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, ReferenceEntry)> for GeneReference {
    fn from_iter<I: IntoIterator<Item = (String, ReferenceEntry)>>(iter: I) -> Self {
        GeneReference {
            entries: iter.into_iter().collect(),
        }
    }
}

/// How many genes each annotation rule touched
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AnnotationSummary {
    /// genes found in the reference
    pub annotated: usize,
    /// genes missing from the reference
    pub unannotated: usize,
    /// spike-in rows
    pub spike: usize,
    /// mitochondrial rows
    pub mito: usize,
}

/// Load a reference table with a header naming at least the `gene_id` column.
/// `symbol`, `chromosome` and `biotype` are picked up when present, in any order.
pub fn load_gene_reference(path: impl AsRef<Path>) -> Result<GeneReference, Error> {
    let path = path.as_ref();
    let reference = read_gene_reference(open_text(path)?).with_context(|| path.display().to_string())?;
    info!("loaded {} reference genes from {}", reference.len(), path.display());
    Ok(reference)
}

/// Parse a reference table from any reader, see `load_gene_reference`.
pub fn read_gene_reference(reader: impl Read) -> Result<GeneReference, Error> {
    let mut rdr = tsv_reader(reader, true);
    let header = rdr.headers()?.clone();
    let column = |name: &str| header.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    let id_col = column("gene_id").ok_or_else(|| format_err!("reference has no gene_id column"))?;
    let symbol_col = column("symbol");
    let chrom_col = column("chromosome");
    let biotype_col = column("biotype");

    let field = |record: &csv::StringRecord, col: Option<usize>| {
        col.and_then(|c| record.get(c))
            .map(str::trim)
            .filter(|v| !v.is_empty() && *v != "NA")
            .map(str::to_string)
    };

    let mut entries = HashMap::new();
    for (line_idx, record) in rdr.records().enumerate() {
        let record = record?;
        let id = match record.get(id_col).map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => bail!("line {}: missing gene_id", line_idx + 2),
        };
        let entry = ReferenceEntry {
            symbol: field(&record, symbol_col),
            chromosome: field(&record, chrom_col),
            biotype: field(&record, biotype_col),
        };
        if entries.insert(id.clone(), entry).is_some() {
            warn!("gene {} listed more than once in the reference, keeping the last entry", id);
        }
    }
    Ok(GeneReference { entries })
}

/// Attach symbol, chromosome and biotype to every gene found in `reference`, and flag
/// spike-ins (by id prefix) and mitochondrial genes (by chromosome name).
pub fn annotate(
    counts: &mut AnnotatedCounts,
    reference: &GeneReference,
    config: &AnnotationConfig,
) -> AnnotationSummary {
    let mut summary = AnnotationSummary::default();
    for gene in &mut counts.genes {
        gene.is_spike = !config.spike_prefix.is_empty() && gene.id.starts_with(&config.spike_prefix);
        match reference.get(&gene.id) {
            Some(entry) => {
                summary.annotated += 1;
                if let Some(symbol) = &entry.symbol {
                    gene.symbol = symbol.clone();
                }
                gene.chromosome = entry.chromosome.clone();
                gene.biotype = entry.biotype.clone();
            }
            None => {
                summary.unannotated += 1;
            }
        }
        gene.is_mito = gene.chromosome.as_deref().map_or(false, |chrom| {
            config.mito_chromosomes.iter().any(|m| m.eq_ignore_ascii_case(chrom))
        });
        summary.spike += gene.is_spike as usize;
        summary.mito += gene.is_mito as usize;
    }

    info!(
        "annotated {} genes ({} without reference entry), {} spike-ins, {} mitochondrial",
        summary.annotated, summary.unannotated, summary.spike, summary.mito
    );
    if summary.spike == 0 {
        warn!("no spike-in transcripts with prefix '{}'", config.spike_prefix);
    }
    summary
}

#[cfg(test)]
mod test_annotation {
    use super::*;
    use ndarray::Array2;
    use sc_types::GeneInfo;

    #[test]
    fn test_annotate() -> Result<(), Error> {
        let text = "biotype\tgene_id\tchromosome\tsymbol\textra\n\
                    protein_coding\tENSG1\t1\tACTB\tx\n\
                    Mt_rRNA\tENSG2\tmt\tMT-RNR1\tx\n\
                    lincRNA\tENSG3\tNA\t\tx\n";
        let reference = read_gene_reference(text.as_bytes())?;
        assert_eq!(reference.len(), 3);

        let genes = ["ENSG1", "ENSG2", "ENSG3", "ENSG4", "ERCC-00002"]
            .iter()
            .map(|id| GeneInfo::new(*id))
            .collect();
        let cells = vec!["a".to_string(), "b".to_string()];
        let mut counts = AnnotatedCounts::from_dense("t", genes, cells, Array2::<u32>::zeros((5, 2)).view())?;

        let summary = annotate(&mut counts, &reference, &AnnotationConfig::default());
        assert_eq!(
            summary,
            AnnotationSummary {
                annotated: 3,
                unannotated: 2,
                spike: 1,
                mito: 1
            }
        );
        assert_eq!(counts.genes[0].symbol, "ACTB");
        assert_eq!(counts.genes[0].biotype.as_deref(), Some("protein_coding"));
        assert!(counts.genes[1].is_mito);
        // blank symbol keeps the id, NA chromosome is missing
        assert_eq!(counts.genes[2].symbol, "ENSG3");
        assert_eq!(counts.genes[2].chromosome, None);
        assert_eq!(counts.genes[3].symbol, "ENSG4");
        assert!(counts.genes[4].is_spike && !counts.genes[4].is_mito);
        Ok(())
    }

    #[test]
    fn test_missing_id_column() {
        assert!(read_gene_reference("symbol\tchromosome\nA\t1\n".as_bytes()).is_err());
    }
}
