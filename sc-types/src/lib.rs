//! Shared data types: an annotated gene x cell count matrix and cell-cycle labels.

pub mod matrix;
pub mod phase;

pub use matrix::{AnnotatedCounts, CountMatrix, GeneInfo};
pub use phase::CyclePhase;
