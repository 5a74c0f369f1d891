//! Diagnostic SVG plots.

use anyhow::Error;
use itertools::{Itertools, MinMaxResult};
use log::debug;
use ndarray::{Array2, ArrayView1, Axis};
use plotters::coord::Shift;
use plotters::prelude::*;
use sc_flow::AnalysisResult;
use sc_types::CyclePhase;
use std::ops::Range;
use std::path::Path;

type Area<'a> = DrawingArea<SVGBackend<'a>, Shift>;

const KEPT: RGBColor = RGBColor(0, 114, 178);
const DROPPED: RGBColor = RGBColor(213, 94, 0);
const GREY: RGBColor = RGBColor(160, 160, 160);

fn phase_color(phase: Option<CyclePhase>) -> RGBColor {
    match phase {
        Some(CyclePhase::G1) => RGBColor(0, 114, 178),
        Some(CyclePhase::S) => RGBColor(230, 159, 0),
        Some(CyclePhase::G2M) => RGBColor(0, 158, 115),
        None => GREY,
    }
}

/// Finite range of `values` with a 5% margin
fn padded_range(values: impl IntoIterator<Item = f64>) -> Range<f64> {
    match values.into_iter().filter(|v| v.is_finite()).minmax() {
        MinMaxResult::NoElements => 0.0..1.0,
        MinMaxResult::OneElement(v) => v - 1.0..v + 1.0,
        MinMaxResult::MinMax(lo, hi) => {
            let pad = if hi > lo { 0.05 * (hi - lo) } else { 1.0 };
            lo - pad..hi + pad
        }
    }
}

/// Stacked histogram of kept (bottom) and dropped (top) cells
fn histogram(area: &Area, title: &str, values: &[f64], kept: &[bool]) -> Result<(), Error> {
    const BINS: usize = 30;
    let range = padded_range(values.iter().copied());
    let width = (range.end - range.start) / BINS as f64;
    let mut counts = vec![[0u32; 2]; BINS];
    for (&v, &k) in values.iter().zip(kept) {
        if v.is_finite() {
            let bin = (((v - range.start) / width) as usize).min(BINS - 1);
            counts[bin][!k as usize] += 1;
        }
    }
    let max = counts.iter().map(|c| c[0] + c[1]).max().unwrap_or(0).max(1);

    let mut chart = ChartBuilder::on(area)
        .caption(title, ("sans-serif", 16))
        .margin(10)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(range.clone(), 0.0..max as f64 * 1.05)?;
    chart.configure_mesh().disable_mesh().y_desc("cells").draw()?;
    chart.draw_series(counts.iter().enumerate().flat_map(|(i, c)| {
        let x0 = range.start + i as f64 * width;
        let x1 = x0 + width;
        let kept = c[0] as f64;
        let total = kept + c[1] as f64;
        [
            Rectangle::new([(x0, 0.0), (x1, kept)], KEPT.mix(0.7).filled()),
            Rectangle::new([(x0, kept), (x1, total)], DROPPED.mix(0.7).filled()),
        ]
    }))?;
    Ok(())
}

/// Library size, detected features, mitochondrial and spike-in percentages of every
/// input cell, dropped cells stacked on top.
pub fn qc_histograms(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    let root = SVGBackend::new(path, (1000, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let areas = root.split_evenly((2, 2));

    let kept: Vec<bool> = res.qc.flags.iter().map(|f| !f.any()).collect();
    let metrics = &res.qc.metrics;
    let libsize: Vec<f64> = metrics.iter().map(|m| m.total_counts.max(1.0).log10()).collect();
    let features: Vec<f64> = metrics.iter().map(|m| m.total_features as f64).collect();
    let mito: Vec<f64> = metrics.iter().map(|m| m.pct_mito).collect();
    let spike: Vec<f64> = metrics.iter().map(|m| m.pct_spike).collect();

    histogram(&areas[0], "log10 library size", &libsize, &kept)?;
    histogram(&areas[1], "detected features", &features, &kept)?;
    histogram(&areas[2], "% mitochondrial", &mito, &kept)?;
    histogram(&areas[3], "% spike-in", &spike, &kept)?;
    root.present()?;
    Ok(())
}

/// Total variance against mean log-expression for every retained gene, spike-ins and
/// HVGs highlighted, with the fitted technical trend.
pub fn variance_trend(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    let root = SVGBackend::new(path, (900, 700)).into_drawing_area();
    root.fill(&WHITE)?;

    let means = res.variance.iter().map(|v| v.mean);
    let x_range = padded_range(means.chain(std::iter::once(0.0)));
    let y_range = padded_range(res.variance.iter().map(|v| v.total).chain(std::iter::once(0.0)));

    let mut chart = ChartBuilder::on(&root)
        .caption("mean-variance trend", ("sans-serif", 20))
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_range.clone(), y_range)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("mean log2 expression")
        .y_desc("variance of log2 expression")
        .draw()?;

    let mut is_hvg = vec![false; res.variance.len()];
    for &g in &res.hvg {
        is_hvg[g] = true;
    }
    let points = |pick: &dyn Fn(usize) -> bool| {
        (0..res.variance.len())
            .filter(|&g| pick(g))
            .map(|g| (res.variance[g].mean, res.variance[g].total))
            .collect::<Vec<_>>()
    };
    let genes = &res.counts.genes;
    chart.draw_series(
        points(&|g| !genes[g].is_spike && !is_hvg[g])
            .into_iter()
            .map(|p| Circle::new(p, 2, GREY.filled())),
    )?;
    chart
        .draw_series(points(&|g| is_hvg[g]).into_iter().map(|p| Circle::new(p, 2, DROPPED.filled())))?
        .label("HVG")
        .legend(|(x, y)| Circle::new((x, y), 3, DROPPED.filled()));
    chart
        .draw_series(points(&|g| genes[g].is_spike).into_iter().map(|p| Circle::new(p, 3, KEPT.filled())))?
        .label("spike-in")
        .legend(|(x, y)| Circle::new((x, y), 3, KEPT.filled()));

    let steps = 200;
    let x_max = x_range.end.max(0.0);
    chart
        .draw_series(LineSeries::new(
            (0..=steps).map(|i| {
                let m = x_max * i as f64 / steps as f64;
                (m, res.trend.eval(m))
            }),
            BLACK.stroke_width(2),
        ))?
        .label("technical trend")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 15, y)], BLACK.stroke_width(2)));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

/// First two components, cells coloured by cell-cycle phase
pub fn pca(res: &AnalysisResult, path: &Path) -> Result<(), Error> {
    let root = SVGBackend::new(path, (800, 700)).into_drawing_area();
    root.fill(&WHITE)?;

    let scores = &res.pca.scores;
    let pc1 = scores.column(0);
    let pc2 = if scores.ncols() > 1 {
        scores.column(1).to_owned()
    } else {
        ndarray::Array1::zeros(scores.nrows())
    };
    let pct = |pc: usize| res.pca.percent_variance.get(pc).copied().unwrap_or(0.0);

    let mut chart = ChartBuilder::on(&root)
        .caption("PCA of highly variable genes", ("sans-serif", 20))
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(padded_range(pc1.iter().copied()), padded_range(pc2.iter().copied()))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc(format!("PC1 ({:.1}%)", pct(0)))
        .y_desc(format!("PC2 ({:.1}%)", pct(1)))
        .draw()?;

    let phases: Vec<Option<CyclePhase>> = (0..scores.nrows()).map(|c| res.phase(c)).collect();
    let groups: Vec<Option<CyclePhase>> = if res.cycle.is_some() {
        CyclePhase::ALL.iter().map(|&p| Some(p)).collect()
    } else {
        vec![None]
    };
    for group in groups {
        let color = phase_color(group);
        let series = chart.draw_series(
            (0..scores.nrows())
                .filter(|&c| phases[c] == group)
                .map(|c| Circle::new((pc1[c], pc2[c]), 4, color.filled())),
        )?;
        if let Some(p) = group {
            series
                .label(p.to_string())
                .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
        }
    }
    if res.cycle.is_some() {
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
    }
    root.present()?;
    Ok(())
}

/// Expression rows scaled to mean 0 and unit variance; constant rows become 0.
pub fn z_scores(expr: &Array2<f64>) -> Array2<f64> {
    let mut z = expr.clone();
    let n = expr.ncols() as f64;
    for mut row in z.axis_iter_mut(Axis(0)) {
        let mean = row.sum() / n;
        let sd = (row.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0)).sqrt();
        if sd > 0.0 {
            row.mapv_inplace(|v| (v - mean) / sd);
        } else {
            row.fill(0.0);
        }
    }
    z
}

/// Blue-white-red scale over `[-limit, limit]`
fn diverging(z: f64, limit: f64) -> RGBColor {
    let t = (z / limit).clamp(-1.0, 1.0);
    let fade = |c: u8, t: f64| (255.0 + (c as f64 - 255.0) * t).round() as u8;
    if t < 0.0 {
        RGBColor(fade(33, -t), fade(102, -t), fade(172, -t))
    } else {
        RGBColor(fade(178, t), fade(24, t), fade(43, t))
    }
}

/// Z-scored expression of the top `n` PC1 genes, cells ordered by PC1
pub fn heatmap(res: &AnalysisResult, n: usize, path: &Path) -> Result<(), Error> {
    let top: Vec<usize> = res.de.top_table(Some(n)).into_iter().map(|i| res.de_rows[i]).collect();
    if top.is_empty() {
        debug!("no genes for the heatmap");
        return Ok(());
    }
    let pc1 = res.pca.component(0);
    let cell_order: Vec<usize> = (0..pc1.len()).sorted_by(|&a, &b| pc1[a].total_cmp(&pc1[b])).collect();
    let expr = res.log_expr.select(Axis(0), &top).select(Axis(1), &cell_order);
    let z = z_scores(&expr);

    let num_genes = top.len() as i32;
    let num_cells = cell_order.len() as i32;
    let height = (120 + 14 * top.len()) as u32;
    let root = SVGBackend::new(path, (900, height.max(300))).into_drawing_area();
    root.fill(&WHITE)?;

    let symbols: Vec<String> = top.iter().map(|&g| res.counts.genes[g].symbol.clone()).collect();
    let mut chart = ChartBuilder::on(&root)
        .caption(format!("top {} PC1 genes", top.len()), ("sans-serif", 20))
        .margin(15)
        .x_label_area_size(30)
        .y_label_area_size(110)
        .build_cartesian_2d(0..num_cells, 0..num_genes)?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("cells ordered by PC1")
        .x_labels(0)
        .y_labels(top.len())
        .y_label_formatter(&|y: &i32| {
            // first gene at the top
            let row = num_genes - 1 - *y;
            symbols.get(row as usize).cloned().unwrap_or_default()
        })
        .draw()?;
    chart.draw_series(z.indexed_iter().map(|((g, c), &v)| {
        let y = num_genes - 1 - g as i32;
        let x = c as i32;
        Rectangle::new([(x, y), (x + 1, y + 1)], diverging(v, 2.5).filled())
    }))?;
    root.present()?;
    Ok(())
}

/// Keep file names portable
fn file_stem(symbol: &str) -> String {
    symbol
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' { c } else { '_' })
        .collect()
}

fn gene_scatter(title: &str, pc1: ArrayView1<f64>, expr: ArrayView1<f64>, colors: &[RGBColor], path: &Path) -> Result<(), Error> {
    let root = SVGBackend::new(path, (600, 500)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 18))
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(padded_range(pc1.iter().copied()), padded_range(expr.iter().copied()))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("PC1")
        .y_desc("log2 expression")
        .draw()?;
    chart.draw_series(
        pc1.iter()
            .zip(expr.iter())
            .zip(colors)
            .map(|((&x, &y), c)| Circle::new((x, y), 3, c.filled())),
    )?;
    root.present()?;
    Ok(())
}

/// Expression against PC1 for each of the top `n` PC1 genes, written as
/// `<dir>/<symbol>.svg`. Returns the written paths.
pub fn gene_scatters(res: &AnalysisResult, n: usize, dir: &Path) -> Result<Vec<std::path::PathBuf>, Error> {
    std::fs::create_dir_all(dir)?;
    let pc1 = res.pca.component(0);
    let colors: Vec<RGBColor> = (0..pc1.len()).map(|c| phase_color(res.phase(c))).collect();
    let mut written = Vec::new();
    for i in res.de.top_table(Some(n)) {
        let g = res.de_rows[i];
        let gene = &res.counts.genes[g];
        let mut path = dir.join(format!("{}.svg", file_stem(&gene.symbol)));
        if written.contains(&path) {
            path = dir.join(format!("{}_{}.svg", file_stem(&gene.symbol), file_stem(&gene.id)));
        }
        let title = format!("{} (adj. p = {:.2e})", gene.symbol, res.de.adjusted_p_values[i]);
        gene_scatter(&title, pc1.view(), res.log_expr.row(g), &colors, &path)?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod test_plots {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_padded_range() {
        assert_eq!(padded_range(vec![]), 0.0..1.0);
        assert_eq!(padded_range(vec![2.0]), 1.0..3.0);
        let r = padded_range(vec![0.0, f64::NAN, 10.0]);
        assert_abs_diff_eq!(r.start, -0.5);
        assert_abs_diff_eq!(r.end, 10.5);
    }

    #[test]
    fn test_z_scores() {
        let z = z_scores(&array![[1.0, 2.0, 3.0], [5.0, 5.0, 5.0]]);
        assert_abs_diff_eq!(z, array![[-1.0, 0.0, 1.0], [0.0, 0.0, 0.0]], epsilon = 1e-12);
    }

    #[test]
    fn test_colors() {
        assert_eq!(diverging(0.0, 2.5), RGBColor(255, 255, 255));
        assert_eq!(diverging(-10.0, 2.5), RGBColor(33, 102, 172));
        assert_eq!(diverging(2.5, 2.5), RGBColor(178, 24, 43));
        assert_eq!(file_stem("Hist1h2/ab c"), "Hist1h2_ab_c");
    }
}
