//! Per-cell quality control metrics and MAD-based outlier removal.

use crate::config::QcConfig;
use anyhow::{bail, Error};
use diff_exp::stat::{Statistics, MAD_CONSTANT};
use log::info;
use ndarray::Axis;
use sc_types::AnnotatedCounts;
use serde::Serialize;

/// Quality metrics of one cell
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CellQc {
    /// Sum of counts over all features
    pub total_counts: f64,
    /// Number of features with a non-zero count
    pub total_features: u32,
    /// Percentage of counts from spike-in transcripts
    pub pct_spike: f64,
    /// Percentage of counts from mitochondrial genes
    pub pct_mito: f64,
}

/// Which tail of the distribution counts as an outlier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutlierSide {
    /// below `median - nmads * mad`
    Lower,
    /// above `median + nmads * mad`
    Higher,
    /// either tail
    Both,
}

/// Compute QC metrics for every cell.
pub fn cell_qc_metrics(counts: &AnnotatedCounts) -> Vec<CellQc> {
    let totals = counts.sum_axis::<f64>(Axis(0));
    let detected = counts.detected_per_cell();
    let spike = counts.sum_cols_over_rows(&counts.spike_rows());
    let mito = counts.sum_cols_over_rows(&counts.mito_rows());
    let pct = |part: f64, total: f64| if total > 0.0 { 100.0 * part / total } else { 0.0 };

    (0..counts.num_cells())
        .map(|c| CellQc {
            total_counts: totals[c],
            total_features: detected[c],
            pct_spike: pct(spike[c], totals[c]),
            pct_mito: pct(mito[c], totals[c]),
        })
        .collect()
}

/// Flag values more than `nmads` scaled MADs away from the median.
/// With `log`, values are log10 transformed first; zeros become `-inf` and are low outliers.
pub fn is_outlier(values: &[f64], nmads: f64, side: OutlierSide, log: bool) -> Vec<bool> {
    let x: Vec<f64> = if log {
        values.iter().map(|&v| v.log10()).collect()
    } else {
        values.to_vec()
    };
    let finite: Vec<f64> = x.iter().copied().filter(|v| v.is_finite()).collect();
    let median = finite.median();
    let mad = finite.mad(MAD_CONSTANT);
    let lower = median - nmads * mad;
    let upper = median + nmads * mad;

    x.iter()
        .map(|&v| {
            let low = v < lower || v == f64::NEG_INFINITY;
            let high = v > upper || v == f64::INFINITY;
            match side {
                OutlierSide::Lower => low,
                OutlierSide::Higher => high,
                OutlierSide::Both => low || high,
            }
        })
        .collect()
}

/// Reasons a cell was dropped
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DropFlags {
    /// small library
    pub libsize: bool,
    /// few detected features
    pub features: bool,
    /// high mitochondrial fraction
    pub mito: bool,
    /// high spike-in fraction
    pub spike: bool,
}

impl DropFlags {
    /// Dropped for at least one reason
    pub fn any(&self) -> bool {
        self.libsize || self.features || self.mito || self.spike
    }
}

/// Number of cells flagged by each criterion, and the number kept
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QcCounts {
    /// dropped for a small library
    pub libsize: usize,
    /// dropped for few detected features
    pub features: usize,
    /// dropped for a high mitochondrial percentage
    pub mito: usize,
    /// dropped for a high spike-in percentage
    pub spike: usize,
    /// passing every criterion
    pub kept: usize,
}

/// Outcome of cell filtering
#[derive(Clone, Debug)]
pub struct QcFilter {
    /// Metrics of every input cell
    pub metrics: Vec<CellQc>,
    /// Drop reasons of every input cell
    pub flags: Vec<DropFlags>,
    /// Indices of the cells passing all criteria, increasing
    pub kept: Vec<usize>,
    /// Tally of the flags
    pub counts: QcCounts,
}

impl QcFilter {
    /// Apply the configured outlier criteria to `counts`.
    pub fn compute(counts: &AnnotatedCounts, config: &QcConfig) -> Result<QcFilter, Error> {
        let metrics = cell_qc_metrics(counts);
        let n = metrics.len();
        let column = |f: fn(&CellQc) -> f64| metrics.iter().map(f).collect::<Vec<f64>>();
        let none = vec![false; n];

        let libsize = if config.drop_low_libsize {
            is_outlier(&column(|m| m.total_counts), config.nmads, OutlierSide::Lower, true)
        } else {
            none.clone()
        };
        let features = if config.drop_low_features {
            is_outlier(&column(|m| m.total_features as f64), config.nmads, OutlierSide::Lower, true)
        } else {
            none.clone()
        };
        let mito = if config.drop_high_mito && !counts.mito_rows().is_empty() {
            is_outlier(&column(|m| m.pct_mito), config.nmads, OutlierSide::Higher, false)
        } else {
            none.clone()
        };
        let spike = if config.drop_high_spike && !counts.spike_rows().is_empty() {
            is_outlier(&column(|m| m.pct_spike), config.nmads, OutlierSide::Higher, false)
        } else {
            none
        };

        let flags: Vec<DropFlags> = (0..n)
            .map(|c| DropFlags {
                libsize: libsize[c],
                features: features[c],
                mito: mito[c],
                spike: spike[c],
            })
            .collect();
        let kept: Vec<usize> = flags
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.any())
            .map(|(i, _)| i)
            .collect();

        let tally = |pick: fn(&DropFlags) -> bool| flags.iter().filter(|f| pick(f)).count();
        let qc_counts = QcCounts {
            libsize: tally(|f| f.libsize),
            features: tally(|f| f.features),
            mito: tally(|f| f.mito),
            spike: tally(|f| f.spike),
            kept: kept.len(),
        };
        info!(
            "cell QC: dropped {} for library size, {} for features, {} for mito, {} for spike-ins; kept {} of {}",
            qc_counts.libsize, qc_counts.features, qc_counts.mito, qc_counts.spike, qc_counts.kept, n
        );
        if kept.is_empty() {
            bail!("all {} cells failed quality control", n);
        }

        Ok(QcFilter {
            metrics,
            flags,
            kept,
            counts: qc_counts,
        })
    }
}

#[cfg(test)]
mod test_qc {
    use super::*;
    use ndarray::Array2;
    use sc_types::GeneInfo;

    #[test]
    fn test_is_outlier() {
        // median 10, MAD 1.4826
        let values = [9.0, 10.0, 11.0, 10.0, 9.0, 11.0, 20.0, 0.0];
        let low = is_outlier(&values, 3.0, OutlierSide::Lower, false);
        assert_eq!(low, vec![false, false, false, false, false, false, false, true]);
        let high = is_outlier(&values, 3.0, OutlierSide::Higher, false);
        assert_eq!(high, vec![false, false, false, false, false, false, true, false]);
        let both = is_outlier(&values, 3.0, OutlierSide::Both, false);
        assert_eq!(both.iter().filter(|&&b| b).count(), 2);
    }

    #[test]
    fn test_is_outlier_log_zero() {
        let values = [100.0, 120.0, 90.0, 110.0, 0.0];
        let low = is_outlier(&values, 3.0, OutlierSide::Lower, true);
        assert_eq!(low, vec![false, false, false, false, true]);
    }

    fn dataset() -> AnnotatedCounts {
        let num_cells = 12;
        let dense = Array2::from_shape_fn((4, num_cells), |(g, c)| match (g, c) {
            // cell 10 has a tiny library, cell 11 is mostly mito
            (_, 10) => 1,
            (2, 11) => 400,
            (0, _) => 100 + c as u32,
            (1, _) => 50,
            (2, _) => 5 + (c % 2) as u32,
            (3, _) => 20 + (c % 3) as u32,
            _ => 0,
        });
        let mut genes: Vec<GeneInfo> = ["g0", "g1", "mt", "ERCC-1"].iter().map(|g| GeneInfo::new(*g)).collect();
        genes[2].is_mito = true;
        genes[3].is_spike = true;
        let cells = (0..num_cells).map(|c| format!("cell{c}")).collect();
        AnnotatedCounts::from_dense("qc", genes, cells, dense.view()).unwrap()
    }

    #[test]
    fn test_metrics_and_filter() -> Result<(), Error> {
        let counts = dataset();
        let metrics = cell_qc_metrics(&counts);
        assert_eq!(metrics[0].total_counts, 100.0 + 50.0 + 5.0 + 20.0);
        assert_eq!(metrics[0].total_features, 4);
        assert!((metrics[0].pct_spike - 100.0 * 20.0 / 175.0).abs() < 1e-12);

        let qc = QcFilter::compute(&counts, &QcConfig::default())?;
        assert!(qc.flags[10].libsize);
        assert!(qc.flags[11].mito);
        assert_eq!(qc.kept, (0..10).collect::<Vec<_>>());
        assert_eq!(qc.counts.kept, 10);
        Ok(())
    }

    #[test]
    fn test_all_dropped_is_error() {
        let counts = dataset().select_cols(&[10]).unwrap();
        let config = QcConfig {
            nmads: 3.0,
            ..QcConfig::default()
        };
        // a lone cell is never an outlier of itself
        assert!(QcFilter::compute(&counts, &config).is_ok());
        let zero = AnnotatedCounts::from_dense(
            "zero",
            vec![GeneInfo::new("g")],
            vec!["a".into(), "b".into()],
            Array2::<u32>::zeros((1, 2)).view(),
        )
        .unwrap();
        assert!(QcFilter::compute(&zero, &config).is_err());
    }

    #[test]
    fn test_no_spike_or_mito_rows() -> Result<(), Error> {
        let num_cells = 10;
        let dense = Array2::from_shape_fn((2, num_cells), |(g, c)| match g {
            0 => 100 + c as u32,
            _ => 50 + (c % 3) as u32,
        });
        let genes = vec![GeneInfo::new("g0"), GeneInfo::new("g1")];
        let cells = (0..num_cells).map(|c| format!("cell{c}")).collect();
        let counts = AnnotatedCounts::from_dense("plain", genes, cells, dense.view())?;

        let qc = QcFilter::compute(&counts, &QcConfig::default())?;
        assert!(qc.metrics.iter().all(|m| m.pct_spike == 0.0 && m.pct_mito == 0.0));
        assert!(qc.flags.iter().all(|f| !f.mito && !f.spike));
        assert_eq!(qc.counts.mito, 0);
        assert_eq!(qc.counts.spike, 0);
        assert_eq!(qc.counts.kept, num_cells);
        Ok(())
    }
}
