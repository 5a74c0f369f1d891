//! Robust locally weighted linear regression (LOESS) of one response on one predictor.
//!
//! Cleveland WS (1979). Robust locally weighted regression and smoothing scatterplots.
//! JASA 74, 829-836.

use crate::stats::order;
use anyhow::{bail, Error};
use diff_exp::stat::Statistics;

/// A fitted LOESS smoother that can be evaluated at any predictor value
#[derive(Clone, Debug)]
pub struct Loess {
    x: Vec<f64>,
    y: Vec<f64>,
    robustness: Vec<f64>,
    neighbours: usize,
}

#[inline]
fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u * u;
        t * t * t
    }
}

#[inline]
fn bisquare(u: f64) -> f64 {
    if u.abs() >= 1.0 {
        0.0
    } else {
        let t = 1.0 - u * u;
        t * t
    }
}

impl Loess {
    /// Fit a local linear smoother with tricube weights over a `span` fraction of the
    /// points, followed by `iterations` rounds of bisquare robustness reweighting.
    /// Non-finite points are ignored.
    pub fn fit(x: &[f64], y: &[f64], span: f64, iterations: usize) -> Result<Loess, Error> {
        if x.len() != y.len() {
            bail!("loess: {} predictor values but {} responses", x.len(), y.len());
        }
        if !(span > 0.0 && span <= 1.0) {
            bail!("loess: span must lie in (0, 1], got {}", span);
        }
        let points: Vec<(f64, f64)> = x
            .iter()
            .zip(y)
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(&a, &b)| (a, b))
            .collect();
        if points.len() < 2 {
            bail!("loess needs at least 2 finite points, got {}", points.len());
        }
        let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
        let idx = order(&xs);
        let n = points.len();

        // a local line needs at least three points to be stable
        let neighbours = ((span * n as f64).ceil() as usize).max(3).min(n);
        let mut loess = Loess {
            x: idx.iter().map(|&i| points[i].0).collect(),
            y: idx.iter().map(|&i| points[i].1).collect(),
            robustness: vec![1.0; n],
            neighbours,
        };

        let mean_abs_y = loess.y.iter().map(|v| v.abs()).sum::<f64>() / n as f64;
        for _ in 0..iterations {
            let residuals: Vec<f64> = (0..n).map(|i| loess.y[i] - loess.predict(loess.x[i])).collect();
            let abs: Vec<f64> = residuals.iter().map(|r| r.abs()).filter(|r| r.is_finite()).collect();
            let scale = abs.median();
            // already an exact fit
            if !(6.0 * scale > 1e-7 * mean_abs_y) {
                break;
            }
            loess.robustness = residuals.iter().map(|r| bisquare(r / (6.0 * scale))).collect();
        }
        Ok(loess)
    }

    /// Range of the predictor values the smoother was fitted on
    pub fn range(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    /// Indices of the `neighbours` points nearest to `target`
    fn window(&self, target: f64) -> (usize, usize) {
        let n = self.x.len();
        let q = self.neighbours;
        let pos = self.x.partition_point(|&v| v < target);
        let (mut lo, mut hi) = (pos, pos);
        while hi - lo < q {
            let left = if lo > 0 { target - self.x[lo - 1] } else { f64::INFINITY };
            let right = if hi < n { self.x[hi] - target } else { f64::INFINITY };
            if left <= right {
                lo -= 1;
            } else {
                hi += 1;
            }
        }
        (lo, hi)
    }

    /// Evaluate the smoother at `target`.
    pub fn predict(&self, target: f64) -> f64 {
        if !target.is_finite() {
            return f64::NAN;
        }
        let (lo, hi) = self.window(target);
        let max_dist = self.x[lo..hi]
            .iter()
            .map(|v| (v - target).abs())
            .fold(0.0, f64::max)
            * (1.0 + 1e-6);

        let mut sw = 0.0;
        let mut swx = 0.0;
        let mut swy = 0.0;
        let mut swxx = 0.0;
        let mut swxy = 0.0;
        for i in lo..hi {
            let d = (self.x[i] - target).abs();
            let w = if max_dist > 0.0 { tricube(d / max_dist) } else { 1.0 } * self.robustness[i];
            let dx = self.x[i] - target;
            sw += w;
            swx += w * dx;
            swy += w * self.y[i];
            swxx += w * dx * dx;
            swxy += w * dx * self.y[i];
        }
        if !(sw > 0.0) {
            // every neighbour was down-weighted to zero, fall back to the plain local mean
            return self.y[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
        }
        // local line centred at the target: the intercept is the fitted value
        let denom = sw * swxx - swx * swx;
        if denom.abs() <= 1e-12 * sw * swxx.max(f64::MIN_POSITIVE) {
            swy / sw
        } else {
            (swxx * swy - swx * swxy) / denom
        }
    }
}

#[cfg(test)]
mod test_loess {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_reproduces_lines() -> Result<(), Error> {
        let x: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let fit = Loess::fit(&x, &y, 0.3, 4)?;
        for &t in &[0.0, 0.25, 3.3, 9.5] {
            assert_approx_eq!(fit.predict(t), 2.0 * t + 1.0, 1e-9);
        }
        assert_eq!(fit.range(), (0.0, 9.5));
        Ok(())
    }

    #[test]
    fn test_robust_to_outlier() -> Result<(), Error> {
        let x: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let mut y: Vec<f64> = x.iter().map(|v| 0.5 * v + 0.2 * (1.7 * v).sin()).collect();
        y[25] += 10.0;
        let plain = Loess::fit(&x, &y, 0.5, 0)?;
        let robust = Loess::fit(&x, &y, 0.5, 4)?;
        assert!((plain.predict(24.0) - 12.0).abs() > 0.3);
        assert!((robust.predict(24.0) - 12.0).abs() < 0.15);
        Ok(())
    }

    #[test]
    fn test_bad_input() {
        assert!(Loess::fit(&[1.0], &[1.0], 0.5, 0).is_err());
        assert!(Loess::fit(&[1.0, 2.0], &[1.0], 0.5, 0).is_err());
        assert!(Loess::fit(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0], 0.0, 0).is_err());
        assert!(Loess::fit(&[1.0, f64::NAN, 3.0], &[1.0, 2.0, f64::INFINITY], 0.5, 0).is_err());
    }
}
