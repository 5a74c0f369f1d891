use super::{DataMat, Pca, SvdResult};
use anyhow::{bail, format_err, Error};
use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView2};

/// Thin SVD of a dense matrix `a`, singular values in decreasing order.
pub(crate) fn thin_svd(a: ArrayView2<f64>) -> Result<SvdResult, Error> {
    let (m, n) = a.dim();
    let mat = DMatrix::from_fn(m, n, |i, j| a[(i, j)]);
    let svd = mat.svd(true, true);
    let u = svd.u.ok_or_else(|| format_err!("SVD did not return left singular vectors"))?;
    let v_t = svd.v_t.ok_or_else(|| format_err!("SVD did not return right singular vectors"))?;
    let sigma = svd.singular_values;

    let mut order: Vec<usize> = (0..sigma.len()).collect();
    order.sort_by(|&x, &y| sigma[y].total_cmp(&sigma[x]));

    let r = order.len();
    let left = Array2::from_shape_fn((m, r), |(i, j)| u[(i, order[j])]);
    let d = Array1::from_shape_fn(r, |j| sigma[order[j]]);
    let right = Array2::from_shape_fn((n, r), |(i, j)| v_t[(order[j], i)]);
    Ok((left, d, right))
}

/// Exact SVD through nalgebra, truncated to the requested rank.
/// Practical for matrices with a few thousand rows or columns at most.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExactSvd;

impl<T> Pca<T> for ExactSvd
where
    T: DataMat + AsDense,
{
    fn run_pca(&self, matrix: &T, k: usize) -> Result<SvdResult, Error> {
        let [m, n] = matrix.shape();
        if k == 0 || k > m.min(n) {
            bail!("invalid rank {} for a {} x {} matrix", k, m, n);
        }
        let (u, d, v) = thin_svd(matrix.as_dense())?;
        Ok((
            u.slice_move(ndarray::s![.., ..k]),
            d.slice_move(ndarray::s![..k]),
            v.slice_move(ndarray::s![.., ..k]),
        ))
    }
}

/// Dense view of a matrix
pub trait AsDense {
    /// Borrow as a dense view
    fn as_dense(&self) -> ArrayView2<'_, f64>;
}

impl AsDense for Array2<f64> {
    fn as_dense(&self) -> ArrayView2<'_, f64> {
        self.view()
    }
}

impl AsDense for ArrayView2<'_, f64> {
    fn as_dense(&self) -> ArrayView2<'_, f64> {
        self.view()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_thin_svd_reconstructs() -> Result<(), Error> {
        let a = array![[3.0, 1.0, 1.0], [-1.0, 3.0, 1.0]];
        let (u, d, v) = thin_svd(a.view())?;
        // R: svd(matrix(c(3, -1, 1, 3, 1, 1), 2))$d
        assert_abs_diff_eq!(d, array![12.0f64.sqrt(), 10.0f64.sqrt()], epsilon = 1e-12);
        let rebuilt = (&u * &d.view().insert_axis(ndarray::Axis(0))).dot(&v.t());
        assert_abs_diff_eq!(rebuilt, a, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn test_truncation() -> Result<(), Error> {
        let a = array![[2.0, 0.0, 0.0], [0.0, 5.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        let (u, d, v) = ExactSvd.run_pca(&a, 2)?;
        assert_eq!(u.dim(), (4, 2));
        assert_eq!(v.dim(), (3, 2));
        assert_abs_diff_eq!(d, array![5.0, 2.0], epsilon = 1e-12);
        assert_abs_diff_eq!(v[(1, 0)].abs(), 1.0, epsilon = 1e-12);
        assert!(ExactSvd.run_pca(&a, 4).is_err());
        Ok(())
    }
}
