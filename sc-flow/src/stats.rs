//! Statistics functions

/// Rank of each value (0-based, ties broken by position) under `f64::total_cmp`.
pub fn order(values: &[f64]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
    idx
}

#[cfg(test)]
mod test_stats {
    use super::*;

    #[test]
    fn test_order() {
        assert_eq!(order(&[3.0, 1.0, 2.0, 1.0]), vec![1, 3, 2, 0]);
        assert!(order(&[]).is_empty());
    }
}
