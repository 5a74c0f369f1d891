use anyhow::{bail, Error};
use log::info;
use ndarray::prelude::*;
use sc_types::AnnotatedCounts;
use std::str::FromStr;

/// Base of logarithm used by log_normalize
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogBase {
    /// ln
    E,
    /// log2
    Two,
    /// log10
    Ten,
}

impl LogBase {
    fn apply(self, x: f64) -> f64 {
        match self {
            LogBase::E => x.ln(),
            LogBase::Two => x.log2(),
            LogBase::Ten => x.log10(),
        }
    }
}

impl FromStr for LogBase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "e" | "ln" => Ok(LogBase::E),
            "2" | "log2" => Ok(LogBase::Two),
            "10" | "log10" => Ok(LogBase::Ten),
            _ => bail!("log base not recognized: {}", s),
        }
    }
}

fn centered(size_factors: ArrayView1<f64>, num_cells: usize) -> Result<Array1<f64>, Error> {
    if size_factors.len() != num_cells {
        bail!(
            "{} size factors given for {} cells",
            size_factors.len(),
            num_cells
        );
    }
    if let Some(bad) = size_factors.iter().find(|&&s| !(s > 0.0) || !s.is_finite()) {
        bail!("size factors must be positive and finite, found {}", bad);
    }
    let mean = size_factors.sum() / num_cells as f64;
    Ok(size_factors.mapv(|s| s / mean))
}

/// Log-normalize the listed rows of `counts` into the same rows of `out`.
fn log_normalize_rows(
    counts: &AnnotatedCounts,
    rows: &[usize],
    size_factors: ArrayView1<f64>,
    pseudo_count: f64,
    log_base: LogBase,
    out: &mut Array2<f64>,
) -> Result<(), Error> {
    let sf = centered(size_factors, counts.num_cells())?;
    let zero = log_base.apply(pseudo_count);
    for &row in rows {
        let mut target = out.row_mut(row);
        target.fill(zero);
        if let Some(vec) = counts.counts.outer_view(row) {
            for (col, &v) in vec.iter() {
                target[col] = log_base.apply(v as f64 / sf[col] + pseudo_count);
            }
        }
    }
    Ok(())
}

/// Log-normalize a count matrix to a dense genes x cells array:
/// 1. Re-centre `size_factors` to mean 1
/// 2. Divide the counts of each column (cell) by its size factor
/// 3. Apply a transform `x -> log_b(x + pseudo_count)`, with `b` specified by `log_base`
pub fn log_normalize(
    counts: &AnnotatedCounts,
    size_factors: ArrayView1<f64>,
    pseudo_count: f64,
    log_base: LogBase,
) -> Result<Array2<f64>, Error> {
    let mut out = Array2::zeros((counts.num_genes(), counts.num_cells()));
    let rows: Vec<usize> = (0..counts.num_genes()).collect();
    log_normalize_rows(counts, &rows, size_factors, pseudo_count, log_base, &mut out)?;
    Ok(out)
}

/// `log2(count / sf + 1)` where endogenous rows use `endogenous_sf` and spike-in rows use
/// `spike_sf`. Without spike-in factors every row uses the endogenous ones.
pub fn normalize_with_spikes(
    counts: &AnnotatedCounts,
    endogenous_sf: ArrayView1<f64>,
    spike_sf: Option<ArrayView1<f64>>,
) -> Result<Array2<f64>, Error> {
    let mut out = Array2::zeros((counts.num_genes(), counts.num_cells()));
    match spike_sf {
        Some(spike_sf) => {
            log_normalize_rows(counts, &counts.endogenous_rows(), endogenous_sf, 1.0, LogBase::Two, &mut out)?;
            log_normalize_rows(counts, &counts.spike_rows(), spike_sf, 1.0, LogBase::Two, &mut out)?;
        }
        None => {
            let rows: Vec<usize> = (0..counts.num_genes()).collect();
            log_normalize_rows(counts, &rows, endogenous_sf, 1.0, LogBase::Two, &mut out)?;
        }
    }
    info!(
        "log2-normalized {} genes x {} cells{}",
        counts.num_genes(),
        counts.num_cells(),
        if spike_sf.is_some() { " with separate spike-in factors" } else { "" }
    );
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use sc_types::GeneInfo;

    fn counts() -> AnnotatedCounts {
        let dense = array![[0u32, 3, 6], [4, 0, 2], [1, 3, 7]];
        let mut genes: Vec<GeneInfo> = ["a", "b", "ERCC-1"].iter().map(|g| GeneInfo::new(*g)).collect();
        genes[2].is_spike = true;
        let cells = vec!["x".into(), "y".into(), "z".into()];
        AnnotatedCounts::from_dense("t", genes, cells, dense.view()).unwrap()
    }

    #[test]
    fn test_log_normalize() -> Result<(), Error> {
        let m = counts();
        // re-centred to [0.5, 1.0, 1.5]
        let sf = array![1.0, 2.0, 3.0];
        let out = log_normalize(&m, sf.view(), 1.0, LogBase::Two)?;
        assert_abs_diff_eq!(out[(0, 0)], 0.0);
        assert_abs_diff_eq!(out[(0, 1)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[(0, 2)], 5.0f64.log2(), epsilon = 1e-12);
        assert_abs_diff_eq!(out[(1, 0)], 9.0f64.log2(), epsilon = 1e-12);

        let ln = log_normalize(&m, sf.view(), 1.0, LogBase::E)?;
        assert_abs_diff_eq!(ln[(0, 1)], 4.0f64.ln(), epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_normalize_with_spikes() -> Result<(), Error> {
        let m = counts();
        let endo = array![1.0, 1.0, 1.0];
        let spike = array![0.5, 1.5, 1.0];
        let out = normalize_with_spikes(&m, endo.view(), Some(spike.view()))?;
        assert_abs_diff_eq!(out[(0, 1)], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[(2, 0)], 3.0f64.log2(), epsilon = 1e-12);
        assert_abs_diff_eq!(out[(2, 2)], 3.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_bad_size_factors() {
        let m = counts();
        assert!(log_normalize(&m, array![1.0, 1.0].view(), 1.0, LogBase::Two).is_err());
        assert!(log_normalize(&m, array![1.0, 0.0, 1.0].view(), 1.0, LogBase::Two).is_err());
        assert!(normalize_with_spikes(&m, array![1.0, 1.0, 1.0].view(), Some(array![1.0, -1.0, 1.0].view())).is_err());
    }

    #[test]
    fn test_log_base() {
        assert_eq!("log10".parse::<LogBase>().unwrap(), LogBase::Ten);
        assert!("3".parse::<LogBase>().is_err());
    }
}
