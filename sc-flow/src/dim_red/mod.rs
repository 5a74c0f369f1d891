#![allow(non_snake_case)]

//! Notes on generic matrix algos
//! The SVD methods are written against the small `DataMat` trait plus the `Dot` products
//! they need (`A * x` and `x * A` for dense vectors `x`), so that the same IRLBA code runs
//! on owned arrays and on views. `x * A` is spelled `x.dot(A)`; the orphan rules keep us
//! from implementing `Mul` for it directly.

use crate::config::PcaConfig;
use anyhow::{bail, Error};
use log::info;
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

/// IRLBA svd method
pub mod irlba;

/// Full SVD through nalgebra
pub mod exact;

pub use exact::ExactSvd;
pub use irlba::Irlba;

/// `(U, d, V)` of a truncated SVD, with `A ~ U diag(d) V^T`
pub type SvdResult = (Array2<f64>, Array1<f64>, Array2<f64>);

/// Trait for getting the dimensions of a matrix
pub trait DataMat {
    /// Get the shape of the matrxix
    fn shape(&self) -> [usize; 2];
}

impl DataMat for ArrayView2<'_, f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }
}

impl DataMat for Array2<f64> {
    fn shape(&self) -> [usize; 2] {
        [self.nrows(), self.ncols()]
    }
}

/// Perform a SVD of a `matrix`, retaining `k` principal components.
/// This trait always performs the pure SVD of the matrix. Special cases of SVD
/// such as PCA can be achieved by the appropriate shifts and scaling of `matrix`
pub trait Pca<T> {
    /// Compute a rank `k` SVD of `matrix`
    fn run_pca(&self, matrix: &T, k: usize) -> Result<SvdResult, Error>;
}

/// Principal components of the cells, computed on a subset of genes
#[derive(Clone, Debug)]
pub struct PcaResult {
    /// Rows of the expression matrix used as variables
    pub genes: Vec<usize>,
    /// Cell coordinates, cells x k
    pub scores: Array2<f64>,
    /// Gene loadings, genes x k, unit columns
    pub loadings: Array2<f64>,
    /// Singular values of the centred matrix
    pub singular_values: Array1<f64>,
    /// Percentage of the total variance carried by each component
    pub percent_variance: Array1<f64>,
}

impl PcaResult {
    /// Scores of one component
    pub fn component(&self, pc: usize) -> Array1<f64> {
        self.scores.column(pc).to_owned()
    }
}

/// Flip each component so that its largest-magnitude loading is positive.
fn fix_signs(u: &mut Array2<f64>, v: &mut Array2<f64>) {
    for pc in 0..v.ncols() {
        let col = v.column(pc);
        let mut best = 0.0f64;
        for &x in col.iter() {
            if x.abs() > best.abs() {
                best = x;
            }
        }
        if best < 0.0 {
            v.column_mut(pc).mapv_inplace(|x| -x);
            u.column_mut(pc).mapv_inplace(|x| -x);
        }
    }
}

/// PCA of the cells on the genes listed in `gene_rows` of `log_expr` (genes x cells).
/// Genes are centred but not scaled. A full SVD is used when the smaller dimension is at
/// most `config.exact_threshold`, IRLBA otherwise.
pub fn run_pca_on_genes(log_expr: ArrayView2<f64>, gene_rows: &[usize], config: &PcaConfig) -> Result<PcaResult, Error> {
    let k = config.num_pcs;
    let num_genes = gene_rows.len();
    let num_cells = log_expr.ncols();
    if num_genes == 0 {
        bail!("no genes selected for PCA");
    }
    if k == 0 || k > num_genes.min(num_cells) {
        bail!(
            "cannot compute {} components from {} genes x {} cells",
            k,
            num_genes,
            num_cells
        );
    }

    // cells x genes, centred per gene
    let mut x = log_expr.select(Axis(0), gene_rows).reversed_axes();
    for mut col in x.axis_iter_mut(Axis(1)) {
        let mean = col.sum() / num_cells as f64;
        col.mapv_inplace(|v| v - mean);
    }
    let total_ss: f64 = x.iter().map(|v| v * v).sum();

    let (mut u, d, mut v) = if num_genes.min(num_cells) <= config.exact_threshold {
        ExactSvd.run_pca(&x, k)?
    } else {
        Irlba {
            tol: config.tol,
            max_iter: config.max_iter,
            seed: 0,
        }
        .run_pca(&x, k)?
    };
    fix_signs(&mut u, &mut v);

    let scores = &u * &d.view().insert_axis(Axis(0));
    let percent_variance = if total_ss > 0.0 {
        d.mapv(|s| 100.0 * s * s / total_ss)
    } else {
        Array1::from_elem(k, f64::NAN)
    };
    info!(
        "PCA on {} genes x {} cells: first components explain {:?} % of variance",
        num_genes,
        num_cells,
        percent_variance
            .slice(s![..k.min(3)])
            .iter()
            .map(|p| (p * 10.0).round() / 10.0)
            .collect::<Vec<_>>()
    );

    Ok(PcaResult {
        genes: gene_rows.to_vec(),
        scores,
        loadings: v,
        singular_values: d,
        percent_variance,
    })
}
