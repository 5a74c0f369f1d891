/// differential expression against a continuous covariate
#[allow(clippy::module_inception)]
pub mod diff_exp;
/// p-value helpers: multiple testing and reference distributions
pub mod dist;
/// empirical Bayes variance moderation
pub mod ebayes;
/// statistics extension
pub mod stat;

pub use crate::diff_exp::{
    covariate_differential_expression, fit_covariate_model, moderated_test, DiffExpResult, LinearFit,
};
