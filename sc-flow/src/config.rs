//! Analysis parameters. Defaults reproduce the published analysis; any subset can be
//! overridden from a JSON file.

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Gene annotation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Gene ids starting with this prefix are spike-in transcripts
    pub spike_prefix: String,
    /// Chromosome names of the mitochondrial genome, compared case-insensitively
    pub mito_chromosomes: Vec<String>,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        AnnotationConfig {
            spike_prefix: "ERCC-".to_string(),
            mito_chromosomes: vec!["MT".to_string(), "chrM".to_string()],
        }
    }
}

/// Cell quality control settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    /// Number of MADs from the median beyond which a cell is an outlier
    pub nmads: f64,
    /// Drop cells with low library size (log scale)
    pub drop_low_libsize: bool,
    /// Drop cells with few detected features (log scale)
    pub drop_low_features: bool,
    /// Drop cells with a high mitochondrial percentage
    pub drop_high_mito: bool,
    /// Drop cells with a high spike-in percentage
    pub drop_high_spike: bool,
}

impl Default for QcConfig {
    fn default() -> Self {
        QcConfig {
            nmads: 3.0,
            drop_low_libsize: true,
            drop_low_features: true,
            drop_high_mito: true,
            drop_high_spike: true,
        }
    }
}

/// Marker-pair cell-cycle classifier settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Number of permutations for the null distribution
    pub iterations: usize,
    /// Minimum number of informative pairs for a score
    pub min_pairs: usize,
    /// Minimum number of valid permutations for a score
    pub min_iter: usize,
    /// RNG seed
    pub seed: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig {
            iterations: 1000,
            min_pairs: 50,
            min_iter: 100,
            seed: 100,
        }
    }
}

/// Low-abundance gene filter
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneFilterConfig {
    /// Keep genes whose library-size adjusted average count is at least this value
    pub min_average_count: f64,
}

impl Default for GeneFilterConfig {
    fn default() -> Self {
        GeneFilterConfig { min_average_count: 1.0 }
    }
}

/// Size factor estimation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeFactorConfig {
    /// Pool sizes for deconvolution
    pub pool_sizes: Vec<usize>,
    /// Use spike-in size factors for the spike-in rows
    pub spike_factors: bool,
}

impl Default for SizeFactorConfig {
    fn default() -> Self {
        SizeFactorConfig {
            pool_sizes: vec![20, 40, 60, 80],
            spike_factors: true,
        }
    }
}

/// Mean-variance trend fit on spike-ins
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Fit the parametric curve before the LOESS correction
    pub parametric: bool,
    /// LOESS span, as a fraction of points
    pub span: f64,
    /// Robustness iterations of the LOESS fit
    pub robustness_iterations: usize,
}

impl Default for TrendConfig {
    fn default() -> Self {
        TrendConfig {
            parametric: true,
            span: 0.2,
            robustness_iterations: 4,
        }
    }
}

/// Highly variable gene selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HvgConfig {
    /// Maximum FDR of the variance test
    pub max_fdr: f64,
    /// Minimum biological component of the variance
    pub min_bio: f64,
}

impl Default for HvgConfig {
    fn default() -> Self {
        HvgConfig {
            max_fdr: 0.05,
            min_bio: 0.5,
        }
    }
}

/// Principal component analysis
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    /// Number of components to compute
    pub num_pcs: usize,
    /// Use a full SVD when the smaller matrix dimension is at most this value, IRLBA otherwise
    pub exact_threshold: usize,
    /// IRLBA convergence tolerance
    pub tol: f64,
    /// IRLBA maximum number of restarts
    pub max_iter: usize,
}

impl Default for PcaConfig {
    fn default() -> Self {
        PcaConfig {
            num_pcs: 10,
            exact_threshold: 500,
            tol: 1e-5,
            max_iter: 100,
        }
    }
}

/// Tables and plots
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Number of top DE genes shown in the heatmap
    pub heatmap_genes: usize,
    /// Number of top DE genes given their own scatter plot
    pub scatter_genes: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            heatmap_genes: 50,
            scatter_genes: 10,
        }
    }
}

/// All analysis parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Gene annotation
    pub annotation: AnnotationConfig,
    /// Cell QC
    pub qc: QcConfig,
    /// Cell cycle
    pub cycle: CycleConfig,
    /// Gene filter
    pub gene_filter: GeneFilterConfig,
    /// Size factors
    pub size_factors: SizeFactorConfig,
    /// Variance trend
    pub trend: TrendConfig,
    /// HVG selection
    pub hvg: HvgConfig,
    /// PCA
    pub pca: PcaConfig,
    /// Report
    pub report: ReportConfig,
}

impl AnalysisConfig {
    /// Read a (possibly partial) JSON configuration; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<AnalysisConfig, Error> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
        let config: AnalysisConfig =
            serde_json::from_reader(reader).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter values no stage can work with.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.qc.nmads > 0.0) {
            bail!("qc.nmads must be positive, got {}", self.qc.nmads);
        }
        if self.size_factors.pool_sizes.is_empty() || self.size_factors.pool_sizes.contains(&0) {
            bail!("size_factors.pool_sizes must be non-empty and positive");
        }
        if !(self.trend.span > 0.0 && self.trend.span <= 1.0) {
            bail!("trend.span must lie in (0, 1], got {}", self.trend.span);
        }
        if self.pca.num_pcs == 0 {
            bail!("pca.num_pcs must be at least 1");
        }
        if self.cycle.min_iter > self.cycle.iterations {
            bail!(
                "cycle.min_iter ({}) exceeds cycle.iterations ({})",
                self.cycle.min_iter,
                self.cycle.iterations
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_config {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json() -> Result<(), Error> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, r#"{{"qc": {{"nmads": 2.5}}, "pca": {{"num_pcs": 5}}}}"#)?;
        let config = AnalysisConfig::from_json_file(file.path())?;
        assert_eq!(config.qc.nmads, 2.5);
        assert!(config.qc.drop_high_mito);
        assert_eq!(config.pca.num_pcs, 5);
        assert_eq!(config.pca.exact_threshold, 500);
        assert_eq!(config.size_factors.pool_sizes, vec![20, 40, 60, 80]);
        Ok(())
    }

    #[test]
    fn test_validate() {
        let mut config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        config.trend.span = 0.0;
        assert!(config.validate().is_err());
        let mut config = AnalysisConfig::default();
        config.size_factors.pool_sizes = vec![];
        assert!(config.validate().is_err());
    }
}
