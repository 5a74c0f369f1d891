//! # sc-flow: spike-in aware single-cell RNA-seq analysis
//!
//! Stages of the analysis of a plate-based count matrix, each usable on its own:
//! loading and annotating counts, cell QC, cell-cycle phase assignment, gene filtering,
//! deconvolution and spike-in size factors, log-normalization, the technical
//! mean-variance trend with highly variable gene selection, and PCA. `pipeline::run`
//! chains them and tests every gene against the first principal component.

#![deny(missing_docs)]

/// Gene annotation from a reference table
pub mod annotation;

/// Marker-pair cell-cycle classifier
pub mod cell_cycle;

/// Analysis parameters
pub mod config;

/// Dimensionality reduction methods
pub mod dim_red;

/// Low-abundance gene filter
pub mod gene_filter;

/// Count table and gene list loading routines
pub mod io;

/// Local regression smoother
pub mod loess;

/// Count matrix normalization methods
pub mod normalization;

/// All stages in order
pub mod pipeline;

/// Cell quality control
pub mod qc;

/// Per-cell size factors
pub mod size_factors;

/// Statistics helpers
pub mod stats;

/// Technical trend and variance decomposition
pub mod variance;

pub use config::AnalysisConfig;
pub use pipeline::{run, AnalysisResult, Summary};
