//! Per-cell size factors.
//!
//! Library-size factors are plain column totals. Deconvolution factors pool cells to
//! escape the zeros of single-cell counts: each pool is normalized against an average
//! pseudo-cell by the median ratio over genes, and the per-cell factors are recovered
//! from the pool factors by least squares.
//!
//! Lun ATL, Bach K, Marioni JC (2016). Pooling across cells to normalize single-cell
//! RNA sequencing data with many zero counts. Genome Biology 17:75.

use crate::stats::order;
use anyhow::{bail, format_err, Error};
use diff_exp::stat::Statistics;
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, Axis};
use sc_types::AnnotatedCounts;

// weight of the equations tying each cell to a factor of one
const RIDGE_WEIGHT: f64 = 1e-6;

fn scale_to_unit_mean(mut sf: Array1<f64>) -> Result<Array1<f64>, Error> {
    let mean = sf.mean().unwrap_or(f64::NAN);
    if !(mean > 0.0) || !mean.is_finite() {
        bail!("size factors have non-positive mean");
    }
    sf.mapv_inplace(|v| v / mean);
    Ok(sf)
}

fn column_totals(counts: &AnnotatedCounts, rows: &[usize], what: &str) -> Result<Array1<f64>, Error> {
    if counts.num_cells() == 0 {
        bail!("no cells to compute {} size factors for", what);
    }
    let totals = counts.sum_cols_over_rows(rows);
    if let Some(cell) = totals.iter().position(|&t| !(t > 0.0)) {
        bail!("cell {} has no {} counts", counts.cells[cell], what);
    }
    Ok(totals)
}

/// Column totals over all rows, scaled to mean 1.
pub fn library_size_factors(counts: &AnnotatedCounts) -> Result<Array1<f64>, Error> {
    let rows: Vec<usize> = (0..counts.num_genes()).collect();
    scale_to_unit_mean(column_totals(counts, &rows, "library")?)
}

/// Column totals over spike-in rows, scaled to mean 1.
pub fn spike_size_factors(counts: &AnnotatedCounts) -> Result<Array1<f64>, Error> {
    let rows = counts.spike_rows();
    if rows.is_empty() {
        bail!("no spike-in transcripts to compute spike-in size factors");
    }
    let sf = scale_to_unit_mean(column_totals(counts, &rows, "spike-in")?)?;
    info!("spike-in size factors from {} transcripts", rows.len());
    Ok(sf)
}

/// Cells ordered around a ring by library size: odd ranks ascending, then even ranks
/// descending, so that every window of consecutive cells mixes small and large libraries.
fn ring_order(lib: &[f64]) -> Vec<usize> {
    let ranked = order(lib);
    let ascending = ranked.iter().step_by(2).copied();
    let descending = ranked.iter().skip(1).step_by(2).rev().copied();
    ascending.chain(descending).collect()
}

/// Replace non-positive or NaN factors by the library size factor of the same cell.
/// Returns the number of replaced cells.
fn replace_non_positive(sf: &mut Array1<f64>, lib: &Array1<f64>) -> usize {
    let mut replaced = 0;
    for (v, &l) in sf.iter_mut().zip(lib.iter()) {
        if !(*v > 0.0) {
            *v = l;
            replaced += 1;
        }
    }
    replaced
}

/// Pooled deconvolution size factors over the endogenous rows of `counts`, scaled to mean 1.
pub fn deconvolution_size_factors(counts: &AnnotatedCounts, pool_sizes: &[usize]) -> Result<Array1<f64>, Error> {
    let num_cells = counts.num_cells();
    if num_cells < 2 {
        bail!("deconvolution needs at least 2 cells, got {}", num_cells);
    }
    let mut sizes: Vec<usize> = pool_sizes.iter().copied().filter(|&s| s > 0 && s <= num_cells).collect();
    if sizes.len() < pool_sizes.len() {
        warn!(
            "dropped {} pool sizes that are zero or larger than the {} available cells",
            pool_sizes.len() - sizes.len(),
            num_cells
        );
    }
    sizes.sort_unstable();
    sizes.dedup();
    if sizes.is_empty() {
        bail!("no pool size fits {} cells", num_cells);
    }

    let rows = counts.endogenous_rows();
    let lib = scale_to_unit_mean(column_totals(counts, &rows, "endogenous")?)?;

    // library-normalized expression and the average pseudo-cell
    let mut norm: Array2<f64> = counts.rows_dense(&rows).mapv(|v| v as f64);
    for (mut col, &l) in norm.axis_iter_mut(Axis(1)).zip(lib.iter()) {
        col.mapv_inplace(|v| v / l);
    }
    let reference = norm.mean_axis(Axis(1)).ok_or_else(|| format_err!("empty expression matrix"))?;
    let usable: Vec<usize> = (0..rows.len()).filter(|&g| reference[g] > 0.0).collect();
    if usable.is_empty() {
        bail!("no endogenous gene is expressed");
    }

    // Dense system of (|sizes| + 1) * N rows by N columns, solved by a full SVD: meant
    // for plate-based data sets of up to a few thousand cells.
    let ring = ring_order(&lib.to_vec());
    let num_pools = sizes.len() * num_cells;
    let mut design = DMatrix::<f64>::zeros(num_pools + num_cells, num_cells);
    let mut target = DVector::<f64>::zeros(num_pools + num_cells);

    let mut eq = 0;
    for &size in &sizes {
        let mut pooled: Array1<f64> = Array1::zeros(rows.len());
        for &cell in &ring[..size] {
            pooled += &norm.column(cell);
        }
        for start in 0..num_cells {
            if start > 0 {
                pooled -= &norm.column(ring[start - 1]);
                pooled += &norm.column(ring[(start + size - 1) % num_cells]);
            }
            let ratios: Vec<f64> = usable
                .iter()
                .map(|&g| pooled[g] / reference[g])
                .filter(|r| r.is_finite())
                .collect();
            let factor = ratios.median();
            if !factor.is_finite() {
                bail!("no finite pool ratio");
            }
            for k in 0..size {
                design[(eq, ring[(start + k) % num_cells])] = 1.0;
            }
            target[eq] = factor;
            eq += 1;
        }
    }
    let w = RIDGE_WEIGHT.sqrt();
    for cell in 0..num_cells {
        design[(eq + cell, cell)] = w;
        target[eq + cell] = w;
    }
    debug!(
        "deconvolution system: {} pool equations over {} cells",
        num_pools, num_cells
    );

    let theta = design
        .svd(true, true)
        .solve(&target, 1e-12)
        .map_err(|e| format_err!("deconvolution least squares failed: {}", e))?;

    let mut sf = Array1::from_iter(theta.iter().zip(lib.iter()).map(|(&t, &l)| t * l));
    let replaced = replace_non_positive(&mut sf, &lib);
    if replaced > 0 {
        warn!(
            "{} cells have non-positive deconvolution size factors, using their library size factors",
            replaced
        );
    }
    let sf = scale_to_unit_mean(sf)?;
    info!(
        "deconvolution size factors over {} genes, pool sizes {:?}: range {:.3} - {:.3}",
        usable.len(),
        sizes,
        sf.fold(f64::INFINITY, |a, &b| a.min(b)),
        sf.fold(f64::NEG_INFINITY, |a, &b| a.max(b))
    );
    Ok(sf)
}

#[cfg(test)]
mod test_size_factors {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use sc_types::GeneInfo;

    fn genes(n: usize, spikes: usize) -> Vec<GeneInfo> {
        (0..n)
            .map(|g| {
                if g >= n - spikes {
                    let mut info = GeneInfo::new(format!("ERCC-{g}"));
                    info.is_spike = true;
                    info
                } else {
                    GeneInfo::new(format!("g{g}"))
                }
            })
            .collect()
    }

    fn cells(n: usize) -> Vec<String> {
        (0..n).map(|c| format!("c{c}")).collect()
    }

    #[test]
    fn test_library_and_spike() -> Result<(), Error> {
        let dense = array![[1u32, 3, 2], [1, 1, 2], [2, 4, 0]];
        let counts = AnnotatedCounts::from_dense("t", genes(3, 1), cells(3), dense.view())?;
        let lib = library_size_factors(&counts)?;
        assert_abs_diff_eq!(lib, array![0.75, 1.5, 0.75], epsilon = 1e-12);
        // the third cell has no spike-in counts
        assert!(spike_size_factors(&counts).is_err());
        Ok(())
    }

    #[test]
    fn test_ring_order() {
        let lib = [5.0, 1.0, 4.0, 2.0, 3.0];
        // ranks: 1, 3, 4, 2, 0
        assert_eq!(ring_order(&lib), vec![1, 4, 0, 2, 3]);
    }

    #[test]
    fn test_non_positive_falls_back_to_library() {
        let mut sf = array![1.2, -0.3, 0.0, f64::NAN, 0.8];
        let lib = array![1.0, 0.6, 1.4, 0.9, 1.1];
        assert_eq!(replace_non_positive(&mut sf, &lib), 3);
        assert_abs_diff_eq!(sf, array![1.2, 0.6, 1.4, 0.9, 0.8], epsilon = 1e-12);
    }

    #[test]
    fn test_deconvolution_resists_composition_bias() -> Result<(), Error> {
        let num_genes = 200;
        let num_cells = 100;
        let truth = Array1::from_shape_fn(num_cells, |c| 0.5 + (c % 10) as f64 * 0.15);
        let dense = Array2::from_shape_fn((num_genes, num_cells), |(g, c)| {
            let mu = 20.0 + (g % 50) as f64 * 4.0;
            // strong upregulation of twenty genes in every other cell
            let de = if g < 20 && c % 2 == 0 { 30.0 } else { 1.0 };
            (truth[c] * mu * de).round() as u32
        });
        let counts = AnnotatedCounts::from_dense("t", genes(num_genes, 0), cells(num_cells), dense.view())?;

        let truth = scale_to_unit_mean(truth)?;
        let sf = deconvolution_size_factors(&counts, &[20, 40, 60, 80])?;
        assert_abs_diff_eq!(sf.mean().unwrap(), 1.0, epsilon = 1e-12);
        for c in 0..num_cells {
            assert!((sf[c] / truth[c] - 1.0).abs() < 0.05, "cell {c}: {} vs {}", sf[c], truth[c]);
        }

        let lib = library_size_factors(&counts)?;
        let worst = (0..num_cells).map(|c| (lib[c] / truth[c] - 1.0).abs()).fold(0.0, f64::max);
        assert!(worst > 0.2);
        Ok(())
    }

    #[test]
    fn test_deconvolution_pool_sizes() -> Result<(), Error> {
        let dense = Array2::from_shape_fn((30, 6), |(g, c)| (g as u32 + 1) * (c as u32 + 1));
        let counts = AnnotatedCounts::from_dense("t", genes(30, 0), cells(6), dense.view())?;
        // only the pool size of 4 fits
        let sf = deconvolution_size_factors(&counts, &[4, 20])?;
        let expected = scale_to_unit_mean(Array1::from_shape_fn(6, |c| c as f64 + 1.0))?;
        assert_abs_diff_eq!(sf, expected, epsilon = 1e-4);

        // duplicate sizes are used once
        let dup = deconvolution_size_factors(&counts, &[4, 4, 4])?;
        assert_abs_diff_eq!(dup, sf, epsilon = 1e-12);

        assert!(deconvolution_size_factors(&counts, &[20]).is_err());
        let one = counts.select_cols(&[0])?;
        assert!(deconvolution_size_factors(&one, &[1]).is_err());
        Ok(())
    }
}
