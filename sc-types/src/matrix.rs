use anyhow::{bail, Error};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::collections::HashMap;
use std::ops::AddAssign;

/// Raw counts, genes are rows and cells are columns, stored gene-major (CSR).
pub type CountMatrix = CsMat<u32>;

/// Annotation attached to one row of the count matrix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneInfo {
    /// Identifier as found in the count table (e.g. an Ensembl id or `ERCC-00002`)
    pub id: String,
    /// Display symbol, defaults to the id until annotated
    pub symbol: String,
    /// Chromosome or contig name
    pub chromosome: Option<String>,
    /// Gene biotype, e.g. `protein_coding`
    pub biotype: Option<String>,
    /// Synthetic spike-in transcript
    pub is_spike: bool,
    /// Encoded on the mitochondrial genome
    pub is_mito: bool,
}

impl GeneInfo {
    /// Unannotated gene whose symbol is its id.
    pub fn new(id: impl Into<String>) -> GeneInfo {
        let id = id.into();
        GeneInfo {
            symbol: id.clone(),
            id,
            ..GeneInfo::default()
        }
    }
}

/// A count matrix carried alongside its per-gene and per-cell metadata.
/// Row `i` of `counts` is described by `genes[i]`, column `j` by `cells[j]`.
#[derive(Clone, Debug)]
pub struct AnnotatedCounts {
    /// Dataset name, usually the input file stem
    pub name: String,
    /// One entry per matrix row
    pub genes: Vec<GeneInfo>,
    /// One entry per matrix column
    pub cells: Vec<String>,
    /// Gene x cell counts
    pub counts: CountMatrix,
}

impl AnnotatedCounts {
    /// Bundle a matrix with its metadata, checking that the dimensions agree and gene ids are unique.
    pub fn new(
        name: impl Into<String>,
        genes: Vec<GeneInfo>,
        cells: Vec<String>,
        counts: CountMatrix,
    ) -> Result<AnnotatedCounts, Error> {
        if genes.len() != counts.rows() {
            bail!(
                "gene metadata has {} entries but the matrix has {} rows",
                genes.len(),
                counts.rows()
            );
        }
        if cells.len() != counts.cols() {
            bail!(
                "cell metadata has {} entries but the matrix has {} columns",
                cells.len(),
                counts.cols()
            );
        }
        let mut seen = HashMap::with_capacity(genes.len());
        for (i, g) in genes.iter().enumerate() {
            if let Some(prev) = seen.insert(g.id.as_str(), i) {
                bail!("duplicate gene id {} at rows {} and {}", g.id, prev, i);
            }
        }
        let counts = if counts.is_csr() { counts } else { counts.to_csr() };
        Ok(AnnotatedCounts {
            name: name.into(),
            genes,
            cells,
            counts,
        })
    }

    /// Build from a dense gene x cell array. Mostly useful for tests and small inputs.
    pub fn from_dense(
        name: impl Into<String>,
        genes: Vec<GeneInfo>,
        cells: Vec<String>,
        dense: ArrayView2<u32>,
    ) -> Result<AnnotatedCounts, Error> {
        let mut tri = TriMat::new((dense.nrows(), dense.ncols()));
        for ((r, c), &v) in dense.indexed_iter() {
            if v > 0 {
                tri.add_triplet(r, c, v);
            }
        }
        AnnotatedCounts::new(name, genes, cells, tri.to_csr())
    }

    /// Number of genes (rows)
    pub fn num_genes(&self) -> usize {
        self.counts.rows()
    }

    /// Number of cells (columns)
    pub fn num_cells(&self) -> usize {
        self.counts.cols()
    }

    /// Sum along `axis`: `Axis(0)` gives one total per cell, `Axis(1)` one total per gene.
    pub fn sum_axis<O>(&self, axis: Axis) -> Array1<O>
    where
        u32: Into<O>,
        O: AddAssign + Clone + Zero,
    {
        let sz = if axis.index() == 0 {
            self.num_cells()
        } else {
            self.num_genes()
        };
        let mut arr = Array1::<O>::zeros((sz,));
        for (row, vec) in self.counts.outer_iterator().enumerate() {
            for (col, &value) in vec.iter() {
                let idx = if axis.index() == 0 { col } else { row };
                arr[idx] += value.into();
            }
        }
        arr
    }

    /// Per-cell totals restricted to the given rows.
    pub fn sum_cols_over_rows(&self, rows: &[usize]) -> Array1<f64> {
        let mut arr = Array1::<f64>::zeros((self.num_cells(),));
        for &row in rows {
            if let Some(vec) = self.counts.outer_view(row) {
                for (col, &value) in vec.iter() {
                    arr[col] += value as f64;
                }
            }
        }
        arr
    }

    /// Number of genes with a non-zero count, per cell.
    pub fn detected_per_cell(&self) -> Array1<u32> {
        let mut arr = Array1::<u32>::zeros((self.num_cells(),));
        for vec in self.counts.outer_iterator() {
            for (col, &value) in vec.iter() {
                if value > 0 {
                    arr[col] += 1;
                }
            }
        }
        arr
    }

    /// Dense copy of a single row as `f64`.
    pub fn row_dense(&self, row: usize) -> Array1<f64> {
        let mut arr = Array1::<f64>::zeros((self.num_cells(),));
        if let Some(vec) = self.counts.outer_view(row) {
            for (col, &value) in vec.iter() {
                arr[col] = value as f64;
            }
        }
        arr
    }

    /// Dense `rows.len() x num_cells` copy of the selected rows.
    pub fn rows_dense(&self, rows: &[usize]) -> Array2<u32> {
        let mut arr = Array2::<u32>::zeros((rows.len(), self.num_cells()));
        for (i, &row) in rows.iter().enumerate() {
            if let Some(vec) = self.counts.outer_view(row) {
                for (col, &value) in vec.iter() {
                    arr[(i, col)] = value;
                }
            }
        }
        arr
    }

    /// Keep only the listed rows, in the listed order.
    pub fn select_rows(&self, rows: &[usize]) -> AnnotatedCounts {
        let mut indptr = Vec::with_capacity(rows.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for &row in rows {
            if let Some(vec) = self.counts.outer_view(row) {
                for (col, &value) in vec.iter() {
                    indices.push(col);
                    data.push(value);
                }
            }
            indptr.push(indices.len());
        }
        AnnotatedCounts {
            name: self.name.clone(),
            genes: rows.iter().map(|&r| self.genes[r].clone()).collect(),
            cells: self.cells.clone(),
            counts: CsMat::new((rows.len(), self.num_cells()), indptr, indices, data),
        }
    }

    /// Keep only the listed columns. `cols` must be strictly increasing so that the
    /// compressed indices stay sorted.
    pub fn select_cols(&self, cols: &[usize]) -> Result<AnnotatedCounts, Error> {
        if cols.windows(2).any(|w| w[0] >= w[1]) {
            bail!("column selection must be strictly increasing");
        }
        let mut remap = vec![None; self.num_cells()];
        for (new, &old) in cols.iter().enumerate() {
            if old >= self.num_cells() {
                bail!("column {} out of range for {} cells", old, self.num_cells());
            }
            remap[old] = Some(new);
        }

        let mut indptr = Vec::with_capacity(self.num_genes() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for vec in self.counts.outer_iterator() {
            for (col, &value) in vec.iter() {
                if let Some(new) = remap[col] {
                    indices.push(new);
                    data.push(value);
                }
            }
            indptr.push(indices.len());
        }
        Ok(AnnotatedCounts {
            name: self.name.clone(),
            genes: self.genes.clone(),
            cells: cols.iter().map(|&c| self.cells[c].clone()).collect(),
            counts: CsMat::new((self.num_genes(), cols.len()), indptr, indices, data),
        })
    }

    /// Row indices of spike-in transcripts
    pub fn spike_rows(&self) -> Vec<usize> {
        self.rows_where(|g| g.is_spike)
    }

    /// Row indices of endogenous (non spike-in) genes
    pub fn endogenous_rows(&self) -> Vec<usize> {
        self.rows_where(|g| !g.is_spike)
    }

    /// Row indices of mitochondrial genes
    pub fn mito_rows(&self) -> Vec<usize> {
        self.rows_where(|g| g.is_mito)
    }

    fn rows_where(&self, pred: impl Fn(&GeneInfo) -> bool) -> Vec<usize> {
        self.genes
            .iter()
            .enumerate()
            .filter(|(_, g)| pred(g))
            .map(|(i, _)| i)
            .collect()
    }

    /// Lookup from gene id to row index
    pub fn gene_index(&self) -> HashMap<&str, usize> {
        self.genes.iter().enumerate().map(|(i, g)| (g.id.as_str(), i)).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn small() -> AnnotatedCounts {
        let dense: Array2<u32> = array![[1, 0, 3, 0], [0, 0, 0, 0], [5, 2, 0, 7]];
        let genes = vec![GeneInfo::new("a"), GeneInfo::new("b"), GeneInfo::new("ERCC-1")];
        let cells = (0..4).map(|i| format!("c{i}")).collect();
        AnnotatedCounts::from_dense("small", genes, cells, dense.view()).unwrap()
    }

    #[test]
    fn test_sums() {
        let m = small();
        assert_eq!(m.sum_axis::<u64>(Axis(0)), array![6u64, 2, 3, 7]);
        assert_eq!(m.sum_axis::<u64>(Axis(1)), array![4u64, 0, 14]);
        assert_eq!(m.detected_per_cell(), array![2u32, 1, 1, 1]);
        assert_eq!(m.sum_cols_over_rows(&[2]), array![5.0, 2.0, 0.0, 7.0]);
    }

    #[test]
    fn test_select() {
        let mut m = small();
        m.genes[2].is_spike = true;

        let rows = m.select_rows(&[2, 0]);
        assert_eq!(rows.genes[0].id, "ERCC-1");
        assert_eq!(rows.counts.to_dense(), array![[5u32, 2, 0, 7], [1, 0, 3, 0]]);

        let cols = m.select_cols(&[0, 3]).unwrap();
        assert_eq!(cols.cells, vec!["c0", "c3"]);
        assert_eq!(cols.counts.to_dense(), array![[1u32, 0], [0, 0], [5, 7]]);
        assert!(m.select_cols(&[3, 0]).is_err());

        assert_eq!(m.spike_rows(), vec![2]);
        assert_eq!(m.endogenous_rows(), vec![0, 1]);
        assert_eq!(m.rows_dense(&[1, 2]), array![[0u32, 0, 0, 0], [5, 2, 0, 7]]);
    }

    #[test]
    fn test_duplicate_ids() {
        let dense: Array2<u32> = Array2::zeros((2, 2));
        let genes = vec![GeneInfo::new("a"), GeneInfo::new("a")];
        let cells = vec!["x".to_string(), "y".to_string()];
        assert!(AnnotatedCounts::from_dense("dup", genes, cells, dense.view()).is_err());
    }
}
