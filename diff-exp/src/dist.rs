use anyhow::Error;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};
use std::cmp::Ordering;

/// Benjamini-Hochberg adjustment of `(index, p-value)` pairs. The returned pairs are in
/// descending p-value order; NaN p-values stay NaN and do not count towards the number
/// of tests.
#[inline]
pub fn adjusted_pvalue_bh(pvalue: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let (mut arr, nans): (Vec<_>, Vec<_>) = pvalue.iter().copied().partition(|(_, p)| !p.is_nan());
    arr.sort_by(|&(_, a), &(_, b)| b.partial_cmp(&a).unwrap_or(Ordering::Equal));

    // q = min(1, cummin(n / rank * p)) walking from the largest p-value down
    let len = arr.len() as f64;
    let mut min = f64::MAX;
    for (idx, (_, val)) in arr.iter_mut().enumerate() {
        *val *= len / (len - idx as f64);
        if *val < min {
            min = *val
        }
        *val = min.min(1.0);
    }

    arr.extend(nans);
    arr
}

/// Benjamini-Hochberg adjustment of a whole vector, preserving its order.
pub fn adjust_bh(pvalues: &[f64]) -> Vec<f64> {
    let indexed: Vec<(usize, f64)> = pvalues.iter().copied().enumerate().collect();
    let mut adjusted = vec![f64::NAN; pvalues.len()];
    for (i, q) in adjusted_pvalue_bh(&indexed) {
        adjusted[i] = q;
    }
    adjusted
}

/// Two-sided p-value of a t statistic with `df` degrees of freedom. An infinite `df`
/// uses the standard normal.
pub fn t_test_pvalue(t: f64, df: f64) -> Result<f64, Error> {
    if t.is_nan() || df.is_nan() {
        return Ok(f64::NAN);
    }
    let lower = if df.is_infinite() {
        Normal::new(0.0, 1.0)?.cdf(-t.abs())
    } else {
        StudentsT::new(0.0, 1.0, df)?.cdf(-t.abs())
    };
    Ok((2.0 * lower).min(1.0))
}

/// Upper tail probability of a chi-squared variable with `df` degrees of freedom.
pub fn chisq_upper_tail(x: f64, df: f64) -> Result<f64, Error> {
    if x.is_nan() {
        return Ok(f64::NAN);
    }
    if x <= 0.0 {
        return Ok(1.0);
    }
    Ok(ChiSquared::new(df)?.sf(x))
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_adjusted_pvalue_bh() {
        let data = [
            ("Blue_fish", 0.34f64),
            ("Bread", 0.594f64),
            ("Butter", 0.212f64),
            ("Carbohydrates", 0.384f64),
            ("Cereals_and_pasta", 0.074f64),
            ("Dairy_products", 0.94f64),
            ("Eggs", 0.275f64),
            ("Fats", 0.696f64),
            ("Fruit", 0.269f64),
            ("Legumes", 0.341f64),
            ("Nuts", 0.06f64),
            ("Olive_oil", 0.008f64),
            ("Potatoes", 0.569f64),
            ("Processed_meat", 0.986f64),
            ("Proteins", 0.042f64),
            ("Red_meat", 0.251f64),
            ("Semi-skimmed_milk", 0.942f64),
            ("Skimmed_milk", 0.222f64),
            ("Sweets", 0.762f64),
            ("Total_calories", 0.001f64),
            ("Total_meat", 0.975f64),
            ("Vegetables", 0.216f64),
            ("White_fish", 0.205f64),
            ("White_meat", 0.041f64),
            ("Whole_milk", 0.039f64),
        ];
        let pv_value: Vec<(usize, f64)> = data.iter().enumerate().map(|x| (x.0, (x.1).1)).collect();

        let expected = [
            0.5328125f64,
            0.781578947368421,
            0.49107142857142866,
            0.5647058823529413,
            0.2642857142857143,
            0.986,
            0.49107142857142866,
            0.8699999999999999,
            0.49107142857142866,
            0.5328125,
            0.25,
            0.1,
            0.781578947368421,
            0.986,
            0.21000000000000002,
            0.49107142857142866,
            0.986,
            0.49107142857142866,
            0.9071428571428571,
            0.025,
            0.986,
            0.49107142857142866,
            0.49107142857142866,
            0.21000000000000002,
            0.21000000000000002,
        ];

        let mut adjusted_pvs = adjusted_pvalue_bh(&pv_value);
        adjusted_pvs.sort_by_key(|&(i, _)| i);
        for ((_, q), e) in adjusted_pvs.iter().zip(expected.iter()) {
            assert_approx_eq!(*q, *e, 1e-12);
        }
    }

    #[test]
    fn test_adjust_bh_with_nan() {
        // R: p.adjust(c(0.01, NA, 0.04, 0.03), "BH") == c(0.03, NA, 0.04, 0.04)
        let q = adjust_bh(&[0.01, f64::NAN, 0.04, 0.03]);
        assert_approx_eq!(q[0], 0.03, 1e-12);
        assert!(q[1].is_nan());
        assert_approx_eq!(q[2], 0.04, 1e-12);
        assert_approx_eq!(q[3], 0.04, 1e-12);
    }

    #[test]
    fn test_t_test_pvalue() {
        // R: 2 * pt(-2.0, 10) == 0.07338803
        assert_approx_eq!(t_test_pvalue(2.0, 10.0).unwrap(), 0.07338803, 1e-7);
        assert_approx_eq!(t_test_pvalue(-2.0, 10.0).unwrap(), 0.07338803, 1e-7);
        // R: 2 * pnorm(-1.96) == 0.04999579
        assert_approx_eq!(t_test_pvalue(1.96, f64::INFINITY).unwrap(), 0.04999579, 1e-7);
        assert_approx_eq!(t_test_pvalue(0.0, 5.0).unwrap(), 1.0, 1e-12);
    }

    #[test]
    fn test_chisq_upper_tail() {
        // R: pchisq(3.84, 1, lower.tail = FALSE) == 0.05004352
        assert_approx_eq!(chisq_upper_tail(3.84, 1.0).unwrap(), 0.05004352, 1e-7);
        assert_approx_eq!(chisq_upper_tail(0.0, 3.0).unwrap(), 1.0, 1e-12);
    }
}
