//! Differential expression against a continuous covariate.
//!
//! Each gene's log-expression is regressed on `[1, x]` by ordinary least squares.
//! The residual variances are shrunk by empirical Bayes (`ebayes`) and the slope
//! is tested with a moderated t statistic; p-values are BH adjusted across genes.

use crate::dist::{adjust_bh, t_test_pvalue};
use crate::ebayes::squeeze_var;
use anyhow::{bail, Error};
use log::info;
use ndarray::{Array1, ArrayView1, ArrayView2, Zip};
use std::cmp::Ordering;

/// Per-gene least squares fit of `y = intercept + coefficient * x`
#[derive(Debug, Clone)]
pub struct LinearFit {
    /// slope per unit covariate
    pub coefficient: Array1<f64>,
    /// intercept
    pub intercept: Array1<f64>,
    /// mean log-expression
    pub ave_expr: Array1<f64>,
    /// residual variance
    pub sigma2: Array1<f64>,
    /// residual degrees of freedom, shared by all genes
    pub df_residual: f64,
    /// standard error of the slope divided by sigma
    pub stdev_unscaled: f64,
}

/// Moderated test results, aligned with the rows of the input matrix
#[derive(Debug, Clone)]
pub struct DiffExpResult {
    /// underlying least squares fit
    pub fit: LinearFit,
    /// prior degrees of freedom, possibly infinite
    pub df_prior: f64,
    /// prior variance
    pub var_prior: f64,
    /// shrunken residual variances
    pub var_post: Array1<f64>,
    /// moderated t statistics
    pub t_stat: Array1<f64>,
    /// degrees of freedom of the moderated t
    pub df_total: f64,
    /// two-sided p-values
    pub p_values: Array1<f64>,
    /// adjusted p_values (bh)
    pub adjusted_p_values: Array1<f64>,
}

/// Fit `y = a + b x` for every row of `log_expr` (genes x cells) against `covariate` (one value per cell).
pub fn fit_covariate_model(log_expr: ArrayView2<f64>, covariate: ArrayView1<f64>) -> Result<LinearFit, Error> {
    let (num_genes, num_cells) = log_expr.dim();
    if covariate.len() != num_cells {
        bail!(
            "covariate has {} values but the expression matrix has {} cells",
            covariate.len(),
            num_cells
        );
    }
    if num_cells < 3 {
        bail!("need at least 3 cells to fit a slope with residual variance, got {}", num_cells);
    }

    let n = num_cells as f64;
    let x_mean = covariate.sum() / n;
    let xc = covariate.mapv(|x| x - x_mean);
    let sxx = xc.dot(&xc);
    if !(sxx > 0.0) || !sxx.is_finite() {
        bail!("covariate is constant or not finite");
    }

    let mut coefficient = Array1::zeros(num_genes);
    let mut intercept = Array1::zeros(num_genes);
    let mut ave_expr = Array1::zeros(num_genes);
    let mut sigma2 = Array1::zeros(num_genes);
    let df_residual = n - 2.0;

    Zip::from(log_expr.rows())
        .and(&mut coefficient)
        .and(&mut intercept)
        .and(&mut ave_expr)
        .and(&mut sigma2)
        .par_for_each(|y, b, a, m, s2| {
            let y_mean = y.sum() / n;
            let slope = xc.dot(&y) / sxx;
            let icpt = y_mean - slope * x_mean;
            let rss = y
                .iter()
                .zip(covariate.iter())
                .map(|(&yi, &xi)| {
                    let r = yi - icpt - slope * xi;
                    r * r
                })
                .sum::<f64>();
            *b = slope;
            *a = icpt;
            *m = y_mean;
            *s2 = rss / df_residual;
        });

    Ok(LinearFit {
        coefficient,
        intercept,
        ave_expr,
        sigma2,
        df_residual,
        stdev_unscaled: 1.0 / sxx.sqrt(),
    })
}

/// Empirical Bayes moderated t-test of the slope.
pub fn moderated_test(fit: LinearFit) -> Result<DiffExpResult, Error> {
    let num_genes = fit.coefficient.len();
    let sigma2 = fit.sigma2.to_vec();
    let squeezed = squeeze_var(&sigma2, fit.df_residual);

    // capped at the pooled residual df
    let df_pooled = fit.df_residual * num_genes as f64;
    let df_total = (fit.df_residual + squeezed.df_prior).min(df_pooled);

    let var_post = Array1::from(squeezed.var_post);
    let t_stat = Zip::from(&fit.coefficient)
        .and(&var_post)
        .map_collect(|&b, &s2| b / (fit.stdev_unscaled * s2.sqrt()));

    let p_values = t_stat
        .iter()
        .map(|&t| t_test_pvalue(t, df_total))
        .collect::<Result<Vec<f64>, Error>>()?;
    let adjusted_p_values = Array1::from(adjust_bh(&p_values));

    info!(
        "moderated t-test on {} genes: prior df {:.2}, total df {:.2}",
        num_genes, squeezed.df_prior, df_total
    );

    Ok(DiffExpResult {
        fit,
        df_prior: squeezed.df_prior,
        var_prior: squeezed.var_prior,
        var_post,
        t_stat,
        df_total,
        p_values: Array1::from(p_values),
        adjusted_p_values,
    })
}

/// Fit and test in one step
pub fn covariate_differential_expression(
    log_expr: ArrayView2<f64>,
    covariate: ArrayView1<f64>,
) -> Result<DiffExpResult, Error> {
    moderated_test(fit_covariate_model(log_expr, covariate)?)
}

impl DiffExpResult {
    /// Row indices ordered by increasing p-value (ties broken by larger |t|), NaN last.
    /// At most `n` rows are returned when given.
    pub fn top_table(&self, n: Option<usize>) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.p_values.len()).collect();
        order.sort_by(|&a, &b| {
            let (pa, pb) = (self.p_values[a], self.p_values[b]);
            match (pa.is_nan(), pb.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => pa.partial_cmp(&pb).unwrap_or(Ordering::Equal).then_with(|| {
                    self.t_stat[b]
                        .abs()
                        .partial_cmp(&self.t_stat[a].abs())
                        .unwrap_or(Ordering::Equal)
                }),
            }
        });
        if let Some(n) = n {
            order.truncate(n);
        }
        order
    }
}
