//! Empirical Bayes shrinkage of per-gene residual variances.
//!
//! The residual variances `s2_g` (each on `df` degrees of freedom) are modelled as
//! scaled F draws around a common prior `s0^2` with `d0` prior degrees of freedom.
//! Both hyperparameters are estimated by matching the first two moments of
//! `ln(s2_g)`, after which each variance is replaced by its posterior mean
//! `(d0 * s0^2 + df * s2_g) / (d0 + df)`.
//!
//! Smyth GK (2004). Linear models and empirical Bayes methods for assessing
//! differential expression in microarray experiments. SAGMB 3, Article 3.

use crate::stat::Statistics;
use log::{debug, warn};
use statrs::function::gamma::digamma;

/// Prior hyperparameters and the shrunken variances
#[derive(Clone, Debug, PartialEq)]
pub struct SqueezedVar {
    /// Prior degrees of freedom, possibly infinite
    pub df_prior: f64,
    /// Prior (common) variance
    pub var_prior: f64,
    /// Posterior variance, one per input variance
    pub var_post: Vec<f64>,
}

/// Trigamma function, the second derivative of `ln(gamma(x))`, for `x > 0`.
pub fn trigamma(x: f64) -> f64 {
    if x.is_nan() || x <= 0.0 {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc + 1.0 / x
        + x2 / 2.0
        + x2 / x * (1.0 / 6.0 - x2 * (1.0 / 30.0 - x2 * (1.0 / 42.0 - x2 * (1.0 / 30.0 - x2 * 5.0 / 66.0))))
}

/// Tetragamma function, the derivative of `trigamma`, for `x > 0`.
pub fn tetragamma(x: f64) -> f64 {
    if x.is_nan() || x <= 0.0 {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let x2 = 1.0 / (x * x);
    acc - x2
        - x2 / x
        - x2 * x2
            * (0.5 - x2 * (1.0 / 6.0 - x2 * (1.0 / 6.0 - x2 * (3.0 / 10.0 - x2 * 5.0 / 6.0))))
}

/// Solve `trigamma(x) = y` for `x` by Newton iteration on `1/trigamma`.
pub fn trigamma_inverse(y: f64) -> f64 {
    if y.is_nan() || y <= 0.0 {
        return f64::NAN;
    }
    if y > 1e7 {
        return 1.0 / y.sqrt();
    }
    if y < 1e-6 {
        return 1.0 / y;
    }
    let mut x = 0.5 + 1.0 / y;
    for _ in 0..50 {
        let tri = trigamma(x);
        let dif = tri * (1.0 - tri / y) / tetragamma(x);
        x += dif;
        if -dif / x < 1e-8 {
            return x;
        }
    }
    warn!("trigamma inversion did not converge for y = {y}");
    x
}

/// Estimate the scaled F distribution `var ~ s0^2 * F(df, d0)` by moments of `ln(var)`.
/// Returns `(s0^2, d0)`; `d0` is infinite when the observed spread of log-variances is
/// fully explained by sampling error.
pub fn fit_f_dist(var: &[f64], df: f64) -> (f64, f64) {
    let finite: Vec<f64> = var.iter().copied().filter(|v| v.is_finite() && *v >= 0.0).collect();
    if finite.is_empty() || !(df > 0.0) {
        return (f64::NAN, f64::NAN);
    }

    let mut median = finite.median();
    if median == 0.0 {
        warn!("more than half of residual variances are exactly zero: eBayes unreliable");
        median = 1.0;
    }
    let floor = 1e-5 * median;

    let half_df = df / 2.0;
    let offset = digamma(half_df) - half_df.ln();
    let e: Vec<f64> = finite.iter().map(|&v| v.max(floor).ln() - offset).collect();
    let emean = e.mean();
    let evar = if e.len() > 1 {
        e.var(1.0) - trigamma(half_df)
    } else {
        0.0
    };

    if evar > 0.0 {
        let df_prior = 2.0 * trigamma_inverse(evar);
        let var_prior = (emean + digamma(df_prior / 2.0) - (df_prior / 2.0).ln()).exp();
        (var_prior, df_prior)
    } else {
        (emean.exp(), f64::INFINITY)
    }
}

/// Shrink residual variances towards a common prior.
pub fn squeeze_var(var: &[f64], df: f64) -> SqueezedVar {
    let (var_prior, df_prior) = fit_f_dist(var, df);
    debug!("variance prior: s0^2 = {var_prior:.4e}, d0 = {df_prior:.3}");

    let var_post = var
        .iter()
        .map(|&v| {
            if df_prior.is_infinite() {
                var_prior
            } else {
                (df * v + df_prior * var_prior) / (df + df_prior)
            }
        })
        .collect();

    SqueezedVar {
        df_prior,
        var_prior,
        var_post,
    }
}

#[cfg(test)]
mod test_ebayes {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand_distr::{ChiSquared, Distribution};
    use rand_pcg::Pcg64Mcg;
    use std::f64::consts::PI;

    #[test]
    fn test_polygamma() {
        assert_approx_eq!(trigamma(1.0), PI * PI / 6.0, 1e-10);
        assert_approx_eq!(trigamma(0.5), PI * PI / 2.0, 1e-10);
        assert_approx_eq!(trigamma(10.0), 0.10516633568168575, 1e-12);
        // psigamma(1, 2) == -2 * zeta(3)
        assert_approx_eq!(tetragamma(1.0), -2.0 * 1.2020569031595942, 1e-10);
        assert!(trigamma(0.0).is_nan());
    }

    #[test]
    fn test_trigamma_inverse() {
        for &x in &[0.1, 0.7, 1.0, 3.5, 20.0, 150.0] {
            assert_approx_eq!(trigamma_inverse(trigamma(x)), x, 1e-6 * x);
        }
    }

    #[test]
    fn test_fit_f_dist_recovers_prior() {
        // s2 = s0^2 * chi2(d) / d * d0 / chi2(d0) ~ scaled F(d, d0)
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let (s0, d0, d) = (0.25, 8.0, 4.0);
        let chi_d = ChiSquared::new(d).unwrap();
        let chi_d0 = ChiSquared::new(d0).unwrap();
        let var: Vec<f64> = (0..20_000)
            .map(|_| s0 * (chi_d.sample(&mut rng) / d) / (chi_d0.sample(&mut rng) / d0))
            .collect();

        let (s0_hat, d0_hat) = fit_f_dist(&var, d);
        assert!((s0_hat - s0).abs() < 0.02, "s0^2 = {s0_hat}");
        assert!((d0_hat - d0).abs() < 1.5, "d0 = {d0_hat}");
    }

    #[test]
    fn test_squeeze_equal_variances() {
        // identical variances leave no excess spread: infinite prior df
        let sq = squeeze_var(&[2.0; 10], 5.0);
        assert!(sq.df_prior.is_infinite());
        // the prior is the moment-corrected geometric mean, E[ln(chi2_d / d)] removed
        let expected = 2.0 * (2.5f64.ln() - digamma(2.5)).exp();
        assert_approx_eq!(sq.var_prior, expected, 1e-12);
        assert!(sq.var_post.iter().all(|&v| (v - expected).abs() < 1e-12));
    }

    #[test]
    fn test_squeeze_moves_towards_prior() {
        let var = vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 20.0, 0.3, 0.05, 0.8];
        let sq = squeeze_var(&var, 3.0);
        assert!(sq.df_prior.is_finite() && sq.df_prior > 0.0);
        for (v, p) in var.iter().zip(&sq.var_post) {
            assert!((p - sq.var_prior).abs() <= (v - sq.var_prior).abs() + 1e-12);
        }
    }
}
