use crate::cell_cycle::CycleMarkers;
use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::{debug, info};
use sc_types::{AnnotatedCounts, CyclePhase, GeneInfo};
use sprs::TriMat;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// Open a buffered text file, transparently decompressing it when the name ends in `.gz`.
pub fn open_text(path: impl AsRef<Path>) -> Result<Box<dyn BufRead>, Error> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

pub(crate) fn tsv_reader<R: Read>(reader: R, has_headers: bool) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(has_headers)
        .flexible(true)
        .comment(None)
        .from_reader(reader)
}

fn parse_count(field: &str) -> Result<u32, Error> {
    let field = field.trim();
    if let Ok(v) = field.parse::<u32>() {
        return Ok(v);
    }
    // tolerate integral values written as floats, e.g. "12.0"
    let v: f64 = field.parse().map_err(|_| format_err!("not a count: '{}'", field))?;
    if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
        bail!("not a non-negative integer count: '{}'", field);
    }
    Ok(v as u32)
}

/// Load a gene x cell count table from a tab-separated file.
///
/// The first line is a header naming the cells. It may or may not include a label for
/// the gene-id column: both `gene\tcellA\tcellB` and `cellA\tcellB` are accepted.
/// Rows whose id starts with `__` (HTSeq summary rows) are skipped.
pub fn load_count_table(path: impl AsRef<Path>) -> Result<AnnotatedCounts, Error> {
    let path = path.as_ref();
    let name = path
        .file_name()
        .map(|f| f.to_string_lossy().trim_end_matches(".gz").to_string())
        .unwrap_or_default();
    let counts = read_count_table(open_text(path)?, &name).with_context(|| path.display().to_string())?;
    info!(
        "loaded {} genes x {} cells from {}",
        counts.num_genes(),
        counts.num_cells(),
        path.display()
    );
    Ok(counts)
}

/// Parse a count table from any reader, see `load_count_table`.
pub fn read_count_table(reader: impl Read, name: &str) -> Result<AnnotatedCounts, Error> {
    let mut rdr = tsv_reader(reader, true);
    let header: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
    if header.is_empty() || header.iter().all(String::is_empty) {
        bail!("missing header line");
    }

    let mut cells: Vec<String> = Vec::new();
    let mut num_cells: Option<usize> = None;
    let mut genes = Vec::new();
    let mut triplets = Vec::new();
    let mut skipped = 0usize;

    for (line_idx, record) in rdr.records().enumerate() {
        let record = record?;
        // header is line 1
        let line = line_idx + 2;
        if record.len() == 1 && record[0].trim().is_empty() {
            continue;
        }

        let n = match num_cells {
            Some(n) => n,
            None => {
                cells = if record.len() == header.len() + 1 {
                    header.clone()
                } else if record.len() == header.len() {
                    header[1..].to_vec()
                } else {
                    bail!(
                        "line {}: {} fields do not match a header of {} fields",
                        line,
                        record.len(),
                        header.len()
                    );
                };
                if cells.is_empty() {
                    bail!("header names no cells");
                }
                num_cells = Some(cells.len());
                cells.len()
            }
        };

        if record.len() != n + 1 {
            bail!("line {}: expected {} fields, found {}", line, n + 1, record.len());
        }

        let id = record[0].trim();
        if id.is_empty() {
            bail!("line {}: empty gene id", line);
        }
        if id.starts_with("__") {
            skipped += 1;
            continue;
        }

        let row = genes.len();
        for (col, field) in record.iter().skip(1).enumerate() {
            let v = parse_count(field).with_context(|| format!("line {}, column {}", line, col + 2))?;
            if v > 0 {
                triplets.push((row, col, v));
            }
        }
        genes.push(GeneInfo::new(id));
    }

    if skipped > 0 {
        info!("skipped {} summary rows", skipped);
    }
    if num_cells.is_none() || genes.is_empty() {
        bail!("no genes found");
    }

    let mut tri = TriMat::with_capacity((genes.len(), cells.len()), triplets.len());
    for (r, c, v) in triplets {
        tri.add_triplet(r, c, v);
    }
    debug!("count matrix has {} non-zero entries", tri.nnz());
    AnnotatedCounts::new(name, genes, cells, tri.to_csr())
}

/// Load a list of identifiers, one per line (first tab-separated field).
/// Blank lines and lines starting with `#` are ignored.
pub fn load_gene_list(path: impl AsRef<Path>) -> Result<Vec<String>, Error> {
    let path = path.as_ref();
    let mut genes = Vec::new();
    for line in open_text(path)?.lines() {
        let line = line.with_context(|| path.display().to_string())?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(first) = line.split('\t').next() {
            let first = first.trim();
            if !first.is_empty() {
                genes.push(first.to_string());
            }
        }
    }
    info!("loaded {} genes from {}", genes.len(), path.display());
    Ok(genes)
}

/// Load cell-cycle marker pairs from a `phase\tfirst\tsecond` table. A first line whose
/// phase column reads `phase` is treated as a header.
pub fn load_marker_pairs(path: impl AsRef<Path>) -> Result<CycleMarkers, Error> {
    let path = path.as_ref();
    let markers = read_marker_pairs(open_text(path)?).with_context(|| path.display().to_string())?;
    info!("loaded {} cell-cycle marker pairs from {}", markers.len(), path.display());
    Ok(markers)
}

/// Parse marker pairs from any reader, see `load_marker_pairs`.
pub fn read_marker_pairs(reader: impl Read) -> Result<CycleMarkers, Error> {
    let mut rdr = tsv_reader(reader, false);
    let mut markers = CycleMarkers::default();
    for (line_idx, record) in rdr.records().enumerate() {
        let record = record?;
        let line = line_idx + 1;
        if record.len() == 1 && record[0].trim().is_empty() {
            continue;
        }
        if record.len() < 3 {
            bail!("line {}: expected phase, first and second gene", line);
        }
        if line == 1 && record[0].trim().eq_ignore_ascii_case("phase") {
            continue;
        }
        let phase: CyclePhase = record[0].parse().with_context(|| format!("line {}", line))?;
        markers.push(phase, record[1].trim(), record[2].trim());
    }
    if markers.is_empty() {
        bail!("no marker pairs found");
    }
    Ok(markers)
}
