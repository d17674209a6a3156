//! Configuration for `fit`, `cv` and `cva`. Every struct deserializes from
//! TOML with defaults for missing keys, so a file only needs the settings it
//! changes.

use crate::design::{ConstructionMode, UnseenLevels};
use crate::engine::{Family, PathControl};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read options file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML options file: {0}")]
    TomlParseError(#[from] toml::de::Error),
}

/// Handling of rows with missing values at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NaAction {
    /// Drop incomplete rows before fitting.
    #[default]
    Omit,
    /// Refuse to fit when any row is incomplete.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    pub family: Family,
    /// Elastic-net mixing: 1 is the lasso, 0 is ridge.
    pub alpha: f64,
    pub nlambda: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lambda_min_ratio: Option<f64>,
    /// Explicit lambda sequence; overrides `nlambda` and `lambda_min_ratio`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lambda: Option<Vec<f64>>,
    pub sparse: bool,
    pub mode: ConstructionMode,
    pub unseen_levels: UnseenLevels,
    pub na_action: NaAction,
    /// Column of observation weights.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<String>,
    /// Column added to the linear predictor alongside any `offset()` terms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    /// Zero-based rows of the data to fit on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset: Option<Vec<usize>>,
    /// Column or term names forced to zero.
    pub exclude: Vec<String>,
    pub relax: bool,
    /// Per column or term penalty factor; unnamed columns use 1.
    pub penalty_factors: BTreeMap<String, f64>,
    pub control: PathControl,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            family: Family::Gaussian,
            alpha: 1.0,
            nlambda: 100,
            lambda_min_ratio: None,
            lambda: None,
            sparse: false,
            mode: ConstructionMode::TermByTerm,
            unseen_levels: UnseenLevels::Error,
            na_action: NaAction::Omit,
            weights: None,
            offset: None,
            subset: None,
            exclude: Vec::new(),
            relax: false,
            penalty_factors: BTreeMap::new(),
            control: PathControl::default(),
        }
    }
}

impl FitOptions {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Loss used to score held-out predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LossMeasure {
    /// Family deviance; mean-squared error for gaussian responses.
    #[default]
    Deviance,
    Mse,
    Mae,
    /// Misclassification rate (binomial only).
    Class,
}

impl LossMeasure {
    pub fn describe(self, family: Family) -> &'static str {
        match (self, family) {
            (LossMeasure::Deviance, Family::Gaussian) | (LossMeasure::Mse, _) => {
                "Mean-Squared Error"
            }
            (LossMeasure::Deviance, Family::Binomial) => "Binomial Deviance",
            (LossMeasure::Deviance, Family::Poisson) => "Poisson Deviance",
            (LossMeasure::Mae, _) => "Mean Absolute Error",
            (LossMeasure::Class, _) => "Misclassification Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CvOptions {
    pub nfolds: usize,
    /// Zero-based fold of every row used in the fit. Overrides `nfolds`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foldid: Option<Vec<usize>>,
    pub seed: u64,
    pub measure: LossMeasure,
    pub parallel: bool,
    /// Blend weights searched when `fit.relax` is set; 1 is the penalized fit
    /// and 0 the unpenalized refit.
    pub gamma: Vec<f64>,
    pub fit: FitOptions,
}

impl Default for CvOptions {
    fn default() -> Self {
        CvOptions {
            nfolds: 10,
            foldid: None,
            seed: 42,
            measure: LossMeasure::Deviance,
            parallel: false,
            gamma: vec![0.0, 0.25, 0.5, 0.75, 1.0],
            fit: FitOptions::default(),
        }
    }
}

impl CvOptions {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CvaOptions {
    /// Mixing values to search; defaults to `(0, 0.1, ..., 1)` cubed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alphas: Option<Vec<f64>>,
    pub cv: CvOptions,
}

impl CvaOptions {
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    pub fn alpha_grid(&self) -> Vec<f64> {
        self.alphas.clone().unwrap_or_else(default_alphas)
    }
}

/// Eleven values concentrated near zero, where the fit changes fastest.
pub fn default_alphas() -> Vec<f64> {
    (0..=10).map(|i| (i as f64 / 10.0).powi(3)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
family = "binomial"
alpha = 0.5
sparse = true
mode = "model-frame"
exclude = ["x2"]

[penalty_factors]
x1 = 0.0

[control]
standardize = false
"#
        )
        .unwrap();
        let options = FitOptions::from_toml_file(file.path()).unwrap();
        assert_eq!(options.family, Family::Binomial);
        assert_eq!(options.mode, ConstructionMode::ModelFrame);
        assert_eq!(options.nlambda, 100);
        assert_eq!(options.penalty_factors["x1"], 0.0);
        assert!(!options.control.standardize);
        assert!(options.control.intercept);
        assert_eq!(options.unseen_levels, UnseenLevels::Error);
    }

    #[test]
    fn cv_options_nest_fit_options() {
        let options: CvaOptions = toml::from_str(
            r#"
alphas = [0.0, 1.0]
[cv]
nfolds = 5
measure = "class"
[cv.fit]
family = "binomial"
"#,
        )
        .unwrap();
        assert_eq!(options.alpha_grid(), vec![0.0, 1.0]);
        assert_eq!(options.cv.nfolds, 5);
        assert_eq!(options.cv.measure, LossMeasure::Class);
        assert_eq!(options.cv.fit.family, Family::Binomial);
        assert_eq!(options.cv.seed, 42);
    }

    #[test]
    fn default_alpha_grid_is_cubed() {
        let grid = default_alphas();
        assert_eq!(grid.len(), 11);
        assert_eq!(grid[0], 0.0);
        assert_abs_diff_eq!(grid[1], 0.001, epsilon = 1e-15);
        assert_abs_diff_eq!(grid[10], 1.0, epsilon = 1e-15);
    }
}
