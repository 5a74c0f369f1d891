#![allow(non_snake_case)]

use super::exact::thin_svd;
use super::{DataMat, Pca, SvdResult};
use anyhow::{bail, Error};
use log::{debug, warn};
use ndarray::linalg::Dot;
use ndarray::prelude::*;
use ndarray::{s, Array1, Array2, LinalgScalar};
use ndarray_rand::RandomExt;
use num_traits::Float;
use rand::SeedableRng;
use rand_distr::StandardNormal;
use std::cmp::{max, min};
use std::ops::Mul;

fn norm<T: LinalgScalar + Mul + Float>(x: &ArrayView1<T>) -> T {
    x.fold(T::zero(), |sum, v| sum + (*v) * (*v)).sqrt()
}

/// Orthogonalize a vector or matrix Y against the columns of the matrix X.
/// This function requires that the column dimension of Y is less than X and
/// that Y and X have the same number of rows.
fn orthog<T: LinalgScalar>(y: &ArrayView1<T>, x: &ArrayView2<T>) -> Array1<T> {
    let dot_y = &x.t().dot(y);
    y - &x.dot(dot_y)
}

/// utility function used to check linear dependencies during computation:
fn invcheck<T: Float>(x: T) -> T {
    let eps2 = (T::one() + T::one()) * T::epsilon();

    if x > eps2 {
        T::one() / x
    } else {
        T::zero()
    }
}

/// Struct for storing IRLBA parameters
#[derive(Clone, Debug)]
pub struct Irlba {
    /// IRLBA convergence tolerance
    pub tol: f64,
    /// Maximum number of restarts
    pub max_iter: usize,
    /// Seed of the random start vector
    pub seed: u64,
}

impl Irlba {
    /// New IRLBA with default settings
    pub fn new() -> Irlba {
        Irlba {
            tol: 1e-5,
            max_iter: 100,
            seed: 0,
        }
    }
}

impl Default for Irlba {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pca<T> for Irlba
where
    T: DataMat + for<'a> Dot<ArrayView1<'a, f64>, Output = Array1<f64>>,
    for<'a> ArrayView1<'a, f64>: Dot<T, Output = Array1<f64>>,
{
    fn run_pca(&self, array: &T, k: usize) -> Result<SvdResult, Error> {
        irlba(array, k, self.tol, self.max_iter, self.seed)
    }
}

/// Implementation of the IRLBA algorithm. Perform the SVD of matrix `A`, retaining `nu` singlular dimenstion
/// Try to acheive tolerance `tol`, stop after at most `maxit` restarts.
///
/// Baglama J, Reichel L (2005). Augmented implicitly restarted Lanczos bidiagonalization
/// methods. SIAM J. Sci. Comput. 27(1), 19-42.
pub fn irlba<T>(A: &T, nu: usize, tol: f64, maxit: usize, seed: u64) -> Result<SvdResult, Error>
where
    T: DataMat + for<'a> Dot<ArrayView1<'a, f64>, Output = Array1<f64>>,
    for<'a> ArrayView1<'a, f64>: Dot<T, Output = Array1<f64>>,
{
    let m = A.shape()[0];
    let n = A.shape()[1];

    if m < 2 || n < 2 {
        bail!("the input matrix must be at least 2x2, got {}x{}", m, n);
    }
    if nu == 0 || nu > min(m, n) {
        bail!("invalid rank {} for a {}x{} matrix", nu, m, n);
    }

    // working subspace dimension
    let m_b = min(nu + 20, min(3 * nu, min(m, n)));
    if m_b <= nu {
        bail!("rank {} leaves no room for a Krylov subspace in a {}x{} matrix", nu, m, n);
    }
    let mut mprod = 0;
    let mut it = 0;
    let mut j = 0;
    let mut k = nu;
    let mut smax = f64::MIN;
    let mut converged = false;

    let mut V: Array2<f64> = Array2::zeros((n, m_b));
    let mut W: Array2<f64> = Array2::zeros((m, m_b));
    let mut F: Array1<f64> = Array1::zeros(n);
    let mut B: Array2<f64> = Array2::zeros((m_b, m_b));
    let mut u: Array2<f64> = Array2::zeros((m_b, m_b));
    let mut sigma: Array1<f64> = Array1::zeros(m_b);
    let mut v: Array2<f64> = Array2::zeros((m_b, m_b));

    // random initial vector
    {
        let mut rng = rand_pcg::Pcg64Mcg::seed_from_u64(seed);
        let mut rand: Array1<f64> = Array1::random_using(n, StandardNormal, &mut rng);
        rand *= 1.0 / norm(&rand.view());
        V.column_mut(0).assign(&rand);
    }

    while it < maxit {
        if it > 0 {
            j = k;
        }

        W.column_mut(j).assign(&A.dot(&V.column(j)));
        mprod += 1;

        if it > 0 {
            let nc = orthog(&W.column(j), &W.slice(s![.., 0..j]));
            W.column_mut(j).assign(&nc);
        }

        let mut s = norm(&W.column(j));
        let mut sinv = invcheck(s);
        W.column_mut(j).mapv_inplace(|x| x * sinv);

        let mut fnorm = 0.0;

        // Lanczos process
        while j < m_b {
            F = W.column(j).dot(A);
            mprod += 1;

            F -= &(&V.column(j) * s);
            F = orthog(&F.view(), &V.slice(s![.., 0..j + 1]));
            fnorm = norm(&F.view());
            let finv = invcheck(fnorm);
            F *= finv;

            if j == m_b - 1 {
                B[(j, j)] = s
            } else {
                V.column_mut(j + 1).assign(&F);
                B[(j, j)] = s;
                B[(j, j + 1)] = fnorm;

                let mut new_w_col = A.dot(&V.column(j + 1));
                mprod += 1;
                new_w_col -= &(&W.column(j) * fnorm);
                new_w_col = orthog(&new_w_col.view(), &W.slice(s![.., 0..j + 1]));
                s = norm(&new_w_col.view());
                sinv = invcheck(s);

                W.column_mut(j + 1).assign(&(&new_w_col * sinv));
            }

            j += 1;
        }

        let svd = thin_svd(B.view())?;
        u = svd.0;
        sigma = svd.1;
        v = svd.2;

        let resid = fnorm * &u.slice(s![m_b - 1, ..]);
        smax = if sigma[0] > smax { sigma[0] } else { smax };

        let num_converged = (0..nu).filter(|&i| resid[i].abs() < tol * smax).count();
        if num_converged < nu {
            k = max(num_converged + nu, k);
            k = min(k, max(m_b.saturating_sub(3), nu));
        } else {
            converged = true;
            break;
        }

        // Update Ritz vectors
        let v_update = V.dot(&v.slice(s![.., 0..k]));
        V.slice_mut(s![.., 0..k]).assign(&v_update);
        V.column_mut(k).assign(&F);

        B = Array2::zeros((m_b, m_b));
        for l in 0..k {
            B[(l, l)] = sigma[l];
        }

        B.slice_mut(s![0..k, k]).assign(&resid.slice(s![0..k]));

        // right update
        let upd = W.dot(&u.slice(s![.., 0..k]));
        W.slice_mut(s![.., 0..k]).assign(&upd);

        it += 1;
    }

    if !converged {
        warn!("IRLBA did not converge to tolerance {} within {} restarts", tol, maxit);
    }

    let U = W.dot(&u.slice(s![.., 0..nu]));
    let V = V.dot(&v.slice(s![.., 0..nu]));

    debug!("IRLBA: {} restarts, {} matrix products", it, mprod);
    let sigma_out = sigma.slice(s![0..nu]).to_owned();
    Ok((U, sigma_out, V))
}
