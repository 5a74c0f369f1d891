//! Mean-variance trend of the spike-ins and decomposition of gene variances into a
//! technical part (read off the trend) and a biological remainder.

use crate::config::{HvgConfig, TrendConfig};
use crate::loess::Loess;
use anyhow::{bail, Error};
use diff_exp::dist::{adjusted_pvalue_bh, chisq_upper_tail};
use log::{debug, info, warn};
use nalgebra::{Matrix3, Vector3};
use ndarray::{ArrayView2, Axis};
use sc_types::GeneInfo;
use serde::Serialize;
use std::cmp::Ordering;

/// `v = a m / (m^n + b)`
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ParametricCurve {
    /// scale
    pub a: f64,
    /// offset of the denominator
    pub b: f64,
    /// exponent of the mean
    pub n: f64,
}

impl ParametricCurve {
    /// Curve value at mean `m`
    pub fn eval(&self, m: f64) -> f64 {
        self.a * m / (m.powf(self.n) + self.b)
    }

    /// Value and gradient with respect to `(ln a, ln b, ln n)`
    fn eval_with_gradient(&self, m: f64) -> (f64, [f64; 3]) {
        let mn = m.powf(self.n);
        let denom = mn + self.b;
        let f = self.a * m / denom;
        let dn = if m > 0.0 { -f * self.n * mn * m.ln() / denom } else { 0.0 };
        (f, [f, -f * self.b / denom, dn])
    }

    fn from_log(p: &Vector3<f64>) -> ParametricCurve {
        ParametricCurve {
            a: p[0].exp(),
            b: p[1].exp(),
            n: p[2].exp(),
        }
    }
}

fn sum_sq(curve: &ParametricCurve, means: &[f64], vars: &[f64]) -> f64 {
    means
        .iter()
        .zip(vars)
        .map(|(&m, &v)| {
            let r = v - curve.eval(m);
            r * r
        })
        .sum()
}

/// Least-squares fit of the parametric curve by Levenberg-Marquardt in log-parameter
/// space, which keeps `a`, `b` and `n` positive. `None` when the fit does not converge.
pub fn fit_parametric(means: &[f64], vars: &[f64]) -> Option<ParametricCurve> {
    const MAX_ITER: usize = 500;
    if means.is_empty() || means.len() != vars.len() {
        return None;
    }
    let max_var = vars.iter().copied().fold(0.0, f64::max);
    let mut sorted = means.to_vec();
    sorted.sort_by(f64::total_cmp);
    let median_mean = sorted[sorted.len() / 2];
    if !(max_var > 0.0 && median_mean > 0.0) {
        return None;
    }

    let mut p = Vector3::new(max_var.ln(), median_mean.ln(), 0.0);
    let mut curve = ParametricCurve::from_log(&p);
    let mut ssr = sum_sq(&curve, means, vars);
    let mut lambda = 1e-3;

    for iter in 0..MAX_ITER {
        let mut jtj = Matrix3::<f64>::zeros();
        let mut jtr = Vector3::<f64>::zeros();
        for (&m, &v) in means.iter().zip(vars) {
            let (f, g) = curve.eval_with_gradient(m);
            let g = Vector3::from(g);
            jtj += g * g.transpose();
            jtr += g * (v - f);
        }

        loop {
            let mut damped = jtj;
            for i in 0..3 {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1e-12);
            }
            let Some(step) = damped.lu().solve(&jtr) else {
                lambda *= 10.0;
                if lambda > 1e12 {
                    return None;
                }
                continue;
            };
            let candidate_p = p + step;
            let candidate = ParametricCurve::from_log(&candidate_p);
            let candidate_ssr = sum_sq(&candidate, means, vars);
            if candidate_ssr.is_finite() && candidate_ssr <= ssr {
                let improvement = ssr - candidate_ssr;
                p = candidate_p;
                curve = candidate;
                ssr = candidate_ssr;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement <= 1e-12 * ssr.max(1e-300) || step.norm() < 1e-10 {
                    debug!("parametric trend converged after {} iterations: {:?}", iter + 1, curve);
                    return Some(curve);
                }
                break;
            }
            lambda *= 10.0;
            if lambda > 1e12 {
                // no downhill step left: this is a minimum
                debug!("parametric trend stalled at a minimum after {} iterations: {:?}", iter + 1, curve);
                return p.iter().all(|v| v.is_finite()).then_some(curve);
            }
        }
    }
    None
}

/// Fitted technical mean-variance trend
#[derive(Clone, Debug)]
pub struct TrendFit {
    /// Parametric curve the LOESS corrects, if the parametric fit was used
    pub curve: Option<ParametricCurve>,
    loess: Loess,
    min_mean: f64,
    max_mean: f64,
    /// Means of the spike-ins used in the fit
    pub means: Vec<f64>,
    /// Variances of the spike-ins used in the fit
    pub vars: Vec<f64>,
}

impl TrendFit {
    /// Fit the trend to spike-in means and variances. Spike-ins with a non-positive mean
    /// or variance are ignored.
    pub fn fit(means: &[f64], vars: &[f64], config: &TrendConfig) -> Result<TrendFit, Error> {
        TrendFit::fit_with(means, vars, config, fit_parametric)
    }

    fn fit_with<F>(means: &[f64], vars: &[f64], config: &TrendConfig, parametric: F) -> Result<TrendFit, Error>
    where
        F: Fn(&[f64], &[f64]) -> Option<ParametricCurve>,
    {
        let (means, vars): (Vec<f64>, Vec<f64>) = means
            .iter()
            .zip(vars)
            .filter(|&(&m, &v)| m > 0.0 && v > 0.0 && m.is_finite() && v.is_finite())
            .map(|(&m, &v)| (m, v))
            .unzip();
        if means.len() < 3 {
            bail!("need at least 3 spike-ins with positive mean and variance to fit a trend, got {}", means.len());
        }

        let curve = if config.parametric {
            let curve = parametric(&means, &vars);
            if curve.is_none() {
                warn!("parametric trend fit failed, falling back to LOESS on log-variance");
            }
            curve
        } else {
            None
        };

        let response: Vec<f64> = match &curve {
            Some(c) => means.iter().zip(&vars).map(|(&m, &v)| (v / c.eval(m)).ln()).collect(),
            None => vars.iter().map(|v| v.ln()).collect(),
        };
        let loess = Loess::fit(&means, &response, config.span, config.robustness_iterations)?;
        let (min_mean, max_mean) = loess.range();

        info!(
            "technical trend fitted on {} spike-ins (mean {:.3} - {:.3}){}",
            means.len(),
            min_mean,
            max_mean,
            match &curve {
                Some(c) => format!(", curve a = {:.4}, b = {:.4}, n = {:.4}", c.a, c.b, c.n),
                None => String::new(),
            }
        );

        Ok(TrendFit {
            curve,
            loess,
            min_mean,
            max_mean,
            means,
            vars,
        })
    }

    fn inner(&self, m: f64) -> f64 {
        let correction = self.loess.predict(m).exp();
        match &self.curve {
            Some(c) => c.eval(m) * correction,
            None => correction,
        }
    }

    /// Technical variance expected at mean `m`: linear to zero below the smallest
    /// spike-in mean, constant above the largest.
    pub fn eval(&self, m: f64) -> f64 {
        if m.is_nan() {
            f64::NAN
        } else if m < self.min_mean {
            (m.max(0.0) / self.min_mean) * self.inner(self.min_mean)
        } else if m > self.max_mean {
            self.inner(self.max_mean)
        } else {
            self.inner(m)
        }
    }
}

/// Variance decomposition of one gene
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GeneVariance {
    /// mean log-expression
    pub mean: f64,
    /// sample variance of log-expression
    pub total: f64,
    /// technical component from the trend
    pub tech: f64,
    /// `total - tech`
    pub bio: f64,
    /// p-value of `total > tech`
    pub p_value: f64,
    /// BH adjusted p-value over the endogenous genes, NaN for spike-ins
    pub fdr: f64,
}

/// Per-row mean and sample variance (n - 1) of a genes x cells matrix.
pub fn mean_var(log_expr: ArrayView2<f64>) -> (Vec<f64>, Vec<f64>) {
    let n = log_expr.ncols() as f64;
    log_expr
        .axis_iter(Axis(0))
        .map(|row| {
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1.0);
            (mean, var)
        })
        .unzip()
}

/// Decompose the variance of every row of `log_expr` against `trend`.
/// Spike-ins get statistics but are excluded from the multiple-testing correction.
pub fn decompose_variance(
    log_expr: ArrayView2<f64>,
    genes: &[GeneInfo],
    trend: &TrendFit,
) -> Result<Vec<GeneVariance>, Error> {
    if genes.len() != log_expr.nrows() {
        bail!("{} genes for {} expression rows", genes.len(), log_expr.nrows());
    }
    let num_cells = log_expr.ncols();
    if num_cells < 2 {
        bail!("need at least 2 cells to estimate variances");
    }
    let df = (num_cells - 1) as f64;
    let (means, totals) = mean_var(log_expr);

    let mut result = Vec::with_capacity(genes.len());
    for (&mean, &total) in means.iter().zip(&totals) {
        let tech = trend.eval(mean);
        let p_value = if tech > 0.0 {
            chisq_upper_tail(df * total / tech, df)?
        } else {
            f64::NAN
        };
        result.push(GeneVariance {
            mean,
            total,
            tech,
            bio: total - tech,
            p_value,
            fdr: f64::NAN,
        });
    }

    let endogenous: Vec<(usize, f64)> = genes
        .iter()
        .enumerate()
        .filter(|(_, g)| !g.is_spike)
        .map(|(i, _)| (i, result[i].p_value))
        .collect();
    for (i, q) in adjusted_pvalue_bh(&endogenous) {
        result[i].fdr = q;
    }
    Ok(result)
}

/// Endogenous genes with `fdr <= max_fdr` and `bio >= min_bio`, by decreasing `bio`.
pub fn select_hvg(variance: &[GeneVariance], genes: &[GeneInfo], config: &HvgConfig) -> Vec<usize> {
    let mut hvg: Vec<usize> = (0..variance.len())
        .filter(|&i| !genes[i].is_spike && variance[i].fdr <= config.max_fdr && variance[i].bio >= config.min_bio)
        .collect();
    hvg.sort_by(|&a, &b| {
        variance[b]
            .bio
            .partial_cmp(&variance[a].bio)
            .unwrap_or(Ordering::Equal)
    });
    info!(
        "{} highly variable genes (FDR <= {}, biological variance >= {})",
        hvg.len(),
        config.max_fdr,
        config.min_bio
    );
    hvg
}
