//! Scan settings, loadable from TOML.

use crate::solver::{GlmmConfig, OptimizerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write the configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Kinship preprocessing before its eigendecomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KinshipConfig {
    /// Divide the kinship by the mean of its diagonal.
    pub normalize: bool,
    /// Eigenvalues at or below `tolerance · max` are treated as zero.
    pub eigen_tolerance: f64,
}

impl Default for KinshipConfig {
    fn default() -> Self {
        Self {
            normalize: true,
            eigen_tolerance: 1e-9,
        }
    }
}

/// Every tunable of a scan. Missing TOML keys take their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Print an input summary, a progress bar, and the final result to stderr.
    pub verbose: bool,
    pub optimizer: OptimizerConfig,
    pub glmm: GlmmConfig,
    pub kinship: KinshipConfig,
}

impl ScanConfig {
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = self.to_toml_string()?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = ScanConfig::from_toml_str(
            r#"
            verbose = true

            [optimizer]
            max_iterations = 50

            [kinship]
            normalize = false
            "#,
        )
        .unwrap();
        assert!(config.verbose);
        assert_eq!(config.optimizer.max_iterations, 50);
        assert_eq!(config.optimizer.grid_points, OptimizerConfig::default().grid_points);
        assert!(!config.kinship.normalize);
        assert_eq!(config.glmm, GlmmConfig::default());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.toml");
        let mut config = ScanConfig::default().verbose(true);
        config.glmm.max_iterations = 7;
        config.save(&path).unwrap();
        assert_eq!(ScanConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn malformed_toml_is_reported() {
        assert!(matches!(
            ScanConfig::from_toml_str("verbose = maybe"),
            Err(ConfigError::TomlParseError(_))
        ));
    }
}
