//! # The fitted model wrapper
//!
//! A [`FittedModel`] keeps the engine's path exactly as returned, together with
//! everything needed to rebuild a model matrix for new data. Prediction never
//! re-parses the formula or re-derives factor levels; it replays the recorded
//! [`DesignSpec`] and fails before touching any coefficient if the rebuilt
//! columns do not line up with the fitted ones.

use crate::design::{DesignError, DesignSpec, Frame};
use crate::engine::{EngineVersion, Family, PathFit};
use crate::fit::{self, FitError};
use crate::options::FitOptions;
use ndarray::{Array1, Array2, s};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

pub const INTERCEPT_NAME: &str = "(Intercept)";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error("Failed to read offsets for prediction: {0}")]
    Offset(#[from] FitError),
    #[error("gamma must lie in [0, 1], found {0}.")]
    InvalidGamma(f64),
    #[error("gamma = {0} blends in the relaxed fit, but this model was fit without relax.")]
    NotRelaxed(f64),
    #[error("Class predictions need a binomial model, but this model is {0}.")]
    ClassRequiresBinomial(Family),
    #[error("Lambda {0} is not a valid penalty value.")]
    InvalidLambda(f64),
    #[error("The fitted path is empty.")]
    EmptyPath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    pub version: EngineVersion,
}

/// Which lambdas to evaluate.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum LambdaSelection {
    /// Every lambda on the fitted path.
    #[default]
    All,
    /// Arbitrary values; those off the path are interpolated linearly between
    /// neighbouring path values and clamped to the path's range.
    Values(Vec<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PredictType {
    /// Linear predictor, offsets included.
    #[default]
    Link,
    /// Fitted mean on the response scale.
    Response,
    /// 0/1 class codes (binomial only).
    Class,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictOptions {
    pub kind: PredictType,
    pub lambda: LambdaSelection,
    /// Weight on the penalized coefficients; the rest goes to the relaxed fit.
    pub gamma: f64,
}

impl Default for PredictOptions {
    fn default() -> Self {
        PredictOptions {
            kind: PredictType::Link,
            lambda: LambdaSelection::All,
            gamma: 1.0,
        }
    }
}

/// Intercept and named coefficients, one column per selected lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct Coefficients {
    /// `(Intercept)` followed by the model matrix columns.
    pub names: Vec<String>,
    pub lambda: Vec<f64>,
    /// `names.len() × lambda.len()`
    pub values: Array2<f64>,
}

impl Coefficients {
    pub fn get(&self, name: &str, lambda_index: usize) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|row| self.values[[row, lambda_index]])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedModel {
    pub family: Family,
    pub alpha: f64,
    pub nobs: usize,
    /// Levels of a factor response; index 1 is the level coded as 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_levels: Option<Vec<String>>,
    pub engine: EngineInfo,
    pub options: FitOptions,
    pub design: DesignSpec,
    pub path: PathFit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relaxed: Option<PathFit>,
}

/// Where a lambda falls on the path: the bracketing indices and the weight
/// of the right-hand one.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    left: usize,
    right: usize,
    fraction: f64,
}

impl FittedModel {
    pub fn formula(&self) -> &str {
        &self.design.terms.formula
    }

    pub fn column_names(&self) -> &[String] {
        &self.design.layout.names
    }

    /// Data columns that were factors when the model was fit.
    pub fn factor_columns(&self) -> Vec<String> {
        self.design.levels.variables().map(str::to_string).collect()
    }

    fn position(&self, value: f64) -> Result<Position, ModelError> {
        let lambda = &self.path.lambda;
        if lambda.is_empty() {
            return Err(ModelError::EmptyPath);
        }
        if !value.is_finite() || value < 0.0 {
            return Err(ModelError::InvalidLambda(value));
        }
        if let Some(i) = lambda.iter().position(|&l| l == value) {
            return Ok(Position {
                left: i,
                right: i,
                fraction: 0.0,
            });
        }
        let last = lambda.len() - 1;
        if value >= lambda[0] {
            return Ok(Position {
                left: 0,
                right: 0,
                fraction: 0.0,
            });
        }
        if value <= lambda[last] {
            return Ok(Position {
                left: last,
                right: last,
                fraction: 0.0,
            });
        }
        // Path values decrease, so `value` sits between some pair.
        let right = lambda.iter().position(|&l| l < value).unwrap_or(last);
        let left = right - 1;
        Ok(Position {
            left,
            right,
            fraction: (lambda[left] - value) / (lambda[left] - lambda[right]),
        })
    }

    fn positions(&self, selection: &LambdaSelection) -> Result<(Vec<f64>, Vec<Position>), ModelError> {
        match selection {
            LambdaSelection::All => Ok((
                self.path.lambda.clone(),
                (0..self.path.len())
                    .map(|i| Position {
                        left: i,
                        right: i,
                        fraction: 0.0,
                    })
                    .collect(),
            )),
            LambdaSelection::Values(values) => {
                let positions = values
                    .iter()
                    .map(|&v| self.position(v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((values.clone(), positions))
            }
        }
    }

    /// Intercepts and coefficient columns of `path` at the given positions.
    fn blend(path: &PathFit, positions: &[Position]) -> (Array1<f64>, Array2<f64>) {
        let p = path.beta.nrows();
        let mut a0 = Array1::zeros(positions.len());
        let mut beta = Array2::zeros((p, positions.len()));
        for (k, pos) in positions.iter().enumerate() {
            if pos.left == pos.right {
                a0[k] = path.a0[pos.left];
                beta.column_mut(k).assign(&path.beta.column(pos.left));
            } else {
                let f = pos.fraction;
                a0[k] = (1.0 - f) * path.a0[pos.left] + f * path.a0[pos.right];
                let column = &path.beta.column(pos.left) * (1.0 - f) + &path.beta.column(pos.right) * f;
                beta.column_mut(k).assign(&column);
            }
        }
        (a0, beta)
    }

    fn coefficient_matrix(
        &self,
        selection: &LambdaSelection,
        gamma: f64,
    ) -> Result<(Vec<f64>, Array1<f64>, Array2<f64>), ModelError> {
        if !(0.0..=1.0).contains(&gamma) {
            return Err(ModelError::InvalidGamma(gamma));
        }
        let (lambda, positions) = self.positions(selection)?;
        let (a0, beta) = Self::blend(&self.path, &positions);
        if gamma == 1.0 {
            return Ok((lambda, a0, beta));
        }
        let relaxed = self.relaxed.as_ref().ok_or(ModelError::NotRelaxed(gamma))?;
        let (relaxed_a0, relaxed_beta) = Self::blend(relaxed, &positions);
        Ok((
            lambda,
            a0 * gamma + relaxed_a0 * (1.0 - gamma),
            beta * gamma + relaxed_beta * (1.0 - gamma),
        ))
    }

    pub fn coef(&self, selection: &LambdaSelection) -> Result<Coefficients, ModelError> {
        self.coef_with_gamma(selection, 1.0)
    }

    pub fn coef_with_gamma(
        &self,
        selection: &LambdaSelection,
        gamma: f64,
    ) -> Result<Coefficients, ModelError> {
        let (lambda, a0, beta) = self.coefficient_matrix(selection, gamma)?;
        let p = beta.nrows();
        let mut values = Array2::zeros((p + 1, lambda.len()));
        values.row_mut(0).assign(&a0);
        values.slice_mut(s![1.., ..]).assign(&beta);
        let names = std::iter::once(INTERCEPT_NAME.to_string())
            .chain(self.column_names().iter().cloned())
            .collect();
        Ok(Coefficients {
            names,
            lambda,
            values,
        })
    }

    /// Names of the non-zero columns at each selected lambda.
    pub fn nonzero(&self, selection: &LambdaSelection) -> Result<Vec<Vec<String>>, ModelError> {
        let (_, _, beta) = self.coefficient_matrix(selection, 1.0)?;
        Ok(beta
            .columns()
            .into_iter()
            .map(|column| {
                column
                    .iter()
                    .zip(self.column_names())
                    .filter(|(b, _)| **b != 0.0)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .collect())
    }

    /// Predictions for `newdata`, one column per selected lambda. Rows with a
    /// missing predictor or offset are `NaN`.
    pub fn predict(&self, newdata: &Frame, options: &PredictOptions) -> Result<Array2<f64>, ModelError> {
        if options.kind == PredictType::Class && self.family != Family::Binomial {
            return Err(ModelError::ClassRequiresBinomial(self.family));
        }
        let (_, a0, beta) = self.coefficient_matrix(&options.lambda, options.gamma)?;
        let x = self.design.rebuild(newdata)?;
        let mut complete = self.design.complete_rows(newdata)?;
        let offset = fit::offset_vector(&self.design, self.options.offset.as_deref(), newdata)?
            .map(Array1::from);
        if let Some(offset) = &offset {
            for (ok, o) in complete.iter_mut().zip(offset) {
                *ok = *ok && o.is_finite();
            }
        }

        let n = newdata.nrows();
        let mut out = Array2::zeros((n, a0.len()));
        for k in 0..a0.len() {
            let mut eta = x.matrix_vector_multiply(beta.column(k));
            eta += a0[k];
            if let Some(offset) = &offset {
                eta += offset;
            }
            for (i, value) in eta.iter().enumerate() {
                out[[i, k]] = if !complete[i] {
                    f64::NAN
                } else {
                    match options.kind {
                        PredictType::Link => *value,
                        PredictType::Response => self.family.linkinv(*value),
                        PredictType::Class => f64::from(u8::from(*value > 0.0)),
                    }
                };
            }
        }
        log::debug!(
            "Predicted {n} row(s) at {} lambda value(s); {} row(s) incomplete.",
            a0.len(),
            complete.iter().filter(|ok| !**ok).count()
        );
        Ok(out)
    }

    /// Class predictions as labels: the response's levels when it was a
    /// factor, `"0"`/`"1"` otherwise. `None` marks incomplete rows.
    pub fn predict_labels(
        &self,
        newdata: &Frame,
        lambda: &LambdaSelection,
    ) -> Result<Vec<Vec<Option<String>>>, ModelError> {
        let options = PredictOptions {
            kind: PredictType::Class,
            lambda: lambda.clone(),
            gamma: 1.0,
        };
        let codes = self.predict(newdata, &options)?;
        let labels = self
            .response_levels
            .clone()
            .unwrap_or_else(|| vec!["0".to_string(), "1".to_string()]);
        Ok(codes
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .map(|&c| (!c.is_nan()).then(|| labels[usize::from(c > 0.5)].clone()))
                    .collect()
            })
            .collect())
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        log::info!("Saved model to '{path}'.");
        Ok(())
    }

    /// Loads a model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}

impl fmt::Display for FittedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Call:  {}", self.formula())?;
        writeln!(
            f,
            "Family: {}   Alpha: {}   Engine: {} {}{}",
            self.family,
            self.alpha,
            self.engine.name,
            self.engine.version,
            if self.relaxed.is_some() { "   Relaxed" } else { "" }
        )?;
        writeln!(f)?;
        writeln!(f, "{:>4} {:>4} {:>6} {:>10}", "", "Df", "%Dev", "Lambda")?;
        for l in 0..self.path.len() {
            writeln!(
                f,
                "{:>4} {:>4} {:>6.2} {:>10.5}",
                l + 1,
                self.path.df[l],
                100.0 * self.path.dev_ratio[l],
                self.path.lambda[l]
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::{DesignOptions, model_matrix};
    use crate::engine::PathControl;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// A hand-built model so interpolation and blending can be checked
    /// against exact numbers.
    fn model(relaxed: bool) -> FittedModel {
        let data = Frame::new()
            .with_column("y", crate::design::Column::numeric(vec![0.0, 1.0]))
            .unwrap()
            .with_column("x", crate::design::Column::numeric(vec![1.0, 2.0]))
            .unwrap();
        let (design, _) = model_matrix("y ~ x", &data, DesignOptions::default()).unwrap();
        let path = PathFit {
            lambda: vec![1.0, 0.5, 0.25],
            a0: vec![2.0, 1.0, 0.0],
            beta: array![[0.0, 1.0, 3.0]],
            df: vec![0, 1, 1],
            dev_ratio: vec![0.0, 0.5, 0.75],
            null_dev: 10.0,
            npasses: 7,
        };
        let relaxed_path = PathFit {
            a0: vec![2.0, 0.0, -1.0],
            beta: array![[0.0, 3.0, 4.0]],
            ..path.clone()
        };
        FittedModel {
            family: Family::Gaussian,
            alpha: 1.0,
            nobs: 2,
            response_levels: None,
            engine: EngineInfo {
                name: "test".to_string(),
                version: EngineVersion::new(1, 2, 0),
            },
            options: FitOptions {
                control: PathControl::default(),
                ..FitOptions::default()
            },
            design,
            path,
            relaxed: relaxed.then_some(relaxed_path),
        }
    }

    #[test]
    fn exact_lambda_returns_path_column() {
        let coef = model(false)
            .coef(&LambdaSelection::Values(vec![0.5]))
            .unwrap();
        assert_eq!(coef.names, vec!["(Intercept)", "x"]);
        assert_eq!(coef.get("(Intercept)", 0), Some(1.0));
        assert_eq!(coef.get("x", 0), Some(1.0));
    }

    #[test]
    fn off_path_lambda_interpolates_and_clamps() {
        let coef = model(false)
            .coef(&LambdaSelection::Values(vec![0.75, 5.0, 0.01]))
            .unwrap();
        // Halfway between 1.0 and 0.5.
        assert_abs_diff_eq!(coef.values[[0, 0]], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(coef.values[[1, 0]], 0.5, epsilon = 1e-12);
        assert_eq!(coef.values.column(1).to_vec(), vec![2.0, 0.0]);
        assert_eq!(coef.values.column(2).to_vec(), vec![0.0, 3.0]);
    }

    #[test]
    fn gamma_blends_relaxed_coefficients() {
        let relaxed = model(true);
        let coef = relaxed
            .coef_with_gamma(&LambdaSelection::Values(vec![0.5]), 0.25)
            .unwrap();
        assert_abs_diff_eq!(coef.values[[1, 0]], 0.25 * 1.0 + 0.75 * 3.0, epsilon = 1e-12);
        assert!(matches!(
            model(false).coef_with_gamma(&LambdaSelection::All, 0.5),
            Err(ModelError::NotRelaxed(_))
        ));
        assert!(matches!(
            relaxed.coef_with_gamma(&LambdaSelection::All, 1.5),
            Err(ModelError::InvalidGamma(_))
        ));
    }

    #[test]
    fn predict_marks_incomplete_rows() {
        let newdata = Frame::new()
            .with_column("x", crate::design::Column::numeric(vec![2.0, f64::NAN]))
            .unwrap();
        let out = model(false)
            .predict(&newdata, &PredictOptions::default())
            .unwrap();
        assert_eq!(out.dim(), (2, 3));
        assert_eq!(out.row(0).to_vec(), vec![2.0, 3.0, 6.0]);
        assert!(out.row(1).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn class_predictions_need_binomial() {
        let newdata = Frame::new()
            .with_column("x", crate::design::Column::numeric(vec![2.0]))
            .unwrap();
        let options = PredictOptions {
            kind: PredictType::Class,
            ..PredictOptions::default()
        };
        assert!(matches!(
            model(false).predict(&newdata, &options),
            Err(ModelError::ClassRequiresBinomial(Family::Gaussian))
        ));
    }

    #[test]
    fn nonzero_and_display() {
        let m = model(false);
        let active = m.nonzero(&LambdaSelection::All).unwrap();
        assert_eq!(active, vec![vec![], vec!["x".to_string()], vec!["x".to_string()]]);
        let printed = m.to_string();
        assert!(printed.starts_with("Call:  y ~ x"));
        assert!(printed.contains("%Dev"));
        assert_eq!(printed.lines().count(), 4 + 3);
    }
}
