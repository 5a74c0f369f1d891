//! statistics
//!
//! ## `Statistics` trait
//!
//! * Summary statistics over slices of anything convertible to `f64`, so the same
//!   code serves raw `u32` counts and `f64` log-expression.
//!
//!     ```rust
//!     use diff_exp::stat::Statistics;
//!
//!     let v = vec![1, 2, 4, 3, 5, 6];
//!     assert_eq!(v.median(), 3.5);
//!     ```
//!

use num_traits::ToPrimitive;
use std::cmp::Ordering;

/// Consistency constant making the MAD estimate the standard deviation of normal data
pub const MAD_CONSTANT: f64 = 1.4826;

/// Statistics Trait
///
/// It contains `sum`, `mean`, `var`, `percentile`, `median` and `mad`
pub trait Statistics {
    /// Compensated sum
    fn sum(&self) -> f64;
    /// Arithmetic mean, NaN for an empty input
    fn mean(&self) -> f64;
    /// Variance with `ddof` delta degrees of freedom
    fn var(&self, ddof: f64) -> f64;
    /// Percentile: the value below which `pct` percent of the values in `self` fall,
    /// linearly interpolated between order statistics
    fn percentile(&self, pct: f64) -> f64;
    /// 50th percentile
    fn median(&self) -> f64;
    /// Median absolute deviation around the median, scaled by `constant`
    fn mad(&self, constant: f64) -> f64;
}

impl<T: ToPrimitive + Copy> Statistics for [T] {
    fn sum(&self) -> f64 {
        // Neumaier summation
        let mut sum = 0.0f64;
        let mut comp = 0.0f64;
        for x in self.iter().map(to_f64) {
            let t = sum + x;
            if sum.abs() >= x.abs() {
                comp += (sum - t) + x;
            } else {
                comp += (x - t) + sum;
            }
            sum = t;
        }
        sum + comp
    }

    fn mean(&self) -> f64 {
        if self.is_empty() {
            return f64::NAN;
        }
        Statistics::sum(self) / (self.len() as f64)
    }

    fn var(&self, ddof: f64) -> f64 {
        let n = self.len() as f64;
        if n <= ddof {
            return f64::NAN;
        }
        let mean = self.mean();
        let ss = self.iter().map(to_f64).fold(0.0, |acc, x| acc + (x - mean) * (x - mean));
        ss / (n - ddof)
    }

    fn percentile(&self, pct: f64) -> f64 {
        let mut sorted: Vec<f64> = self.iter().map(to_f64).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        percentile_of_sorted(&sorted, pct)
    }

    fn median(&self) -> f64 {
        self.percentile(50.0)
    }

    fn mad(&self, constant: f64) -> f64 {
        let center = self.median();
        let deviations: Vec<f64> = self.iter().map(|x| (to_f64(x) - center).abs()).collect();
        constant * deviations.median()
    }
}

#[inline]
fn to_f64<T: ToPrimitive>(x: &T) -> f64 {
    x.to_f64().unwrap_or(f64::NAN)
}

// Value at the `pct` percentile of already-sorted samples, with linear interpolation.
// Empty input gives NaN.
fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        len => {
            let pct = pct.clamp(0.0, 100.0);
            let rank = (pct / 100.0) * (len - 1) as f64;
            let lo = rank.floor() as usize;
            if lo + 1 >= len {
                return sorted[len - 1];
            }
            let d = rank - lo as f64;
            sorted[lo] + (sorted[lo + 1] - sorted[lo]) * d
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_stats() {
        let v = vec![1, 2, 4, 3, 5, 6];
        assert_approx_eq!(v.mean(), 3.5, 1e-11);
        assert_approx_eq!(v.var(0.0), 2.9166666666666665, 1e-11);
        assert_approx_eq!(v.var(1.0), 3.5, 1e-11);
        assert_approx_eq!(v.median(), 3.5, 1e-11);
        assert_approx_eq!(v.percentile(0.95), 1.0475, 1e-11);

        let mut v = vec![1.0f64];
        v.append(&mut vec![1e-12f64; 1e6 as usize]);
        assert_approx_eq!(v.mean(), 9.999_999_999_999_974e-7, 1e-13);
        assert_approx_eq!(v.median(), 1e-12, 1e-13);
    }

    #[test]
    fn test_mad() {
        // R: mad(c(1, 2, 3, 4, 100)) == 1.4826
        let v = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        assert_approx_eq!(v.mad(MAD_CONSTANT), 1.4826, 1e-12);
        assert_approx_eq!(v.mad(1.0), 1.0, 1e-12);
    }

    #[test]
    fn test_empty() {
        let v: Vec<f64> = vec![];
        assert!(v.mean().is_nan());
        assert!(v.median().is_nan());
        assert!(vec![1.0].var(1.0).is_nan());
    }
}
