//! # Fitting
//!
//! Orchestrates one fit: formula expansion, response and weight extraction,
//! model matrix construction, missing-value handling, penalty resolution by
//! column name, and finally the engine call. The engine's path is stored
//! untouched in the returned [`FittedModel`].

use crate::design::{
    Column, ColumnLayout, DesignError, DesignMatrix, DesignOptions, DesignSpec, Frame, Terms,
};
use crate::engine::{
    CoordinateDescent, ElasticNetEngine, EngineError, EngineVersion, Family, LambdaSpec, PathFit,
    Problem, RELAX_MIN_ENGINE_VERSION,
};
use crate::model::{EngineInfo, FittedModel};
use crate::options::{FitOptions, NaAction};
use ahash::AHashMap;
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error(transparent)]
    Design(#[from] DesignError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("The formula has no response; fitting needs a variable on the left of '~'.")]
    MissingResponse,
    #[error("Response '{variable}' is a factor, which the {family} family does not accept.")]
    FactorResponse { variable: String, family: Family },
    #[error("Binomial response '{variable}' must have exactly two levels, but has {found}.")]
    ResponseLevels { variable: String, found: usize },
    #[error("Column '{column}' given as {option} must be numeric.")]
    NonNumericColumn {
        option: &'static str,
        column: String,
    },
    #[error("'{name}' in {option} matches no column or term of the model matrix.")]
    UnknownColumn { option: &'static str, name: String },
    #[error("{count} row(s) contain missing values and na_action is 'fail'.")]
    MissingValues { count: usize },
    #[error("No complete rows remain after removing rows with missing values.")]
    NoCompleteRows,
    #[error(
        "{feature} requires engine version {required} or newer, but '{engine}' is version {found}."
    )]
    EngineTooOld {
        feature: &'static str,
        engine: String,
        required: EngineVersion,
        found: EngineVersion,
    },
}

/// Model inputs after formula expansion and missing-value handling, ready to
/// be handed to an engine any number of times.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub design: DesignSpec,
    pub x: DesignMatrix,
    pub y: Vec<f64>,
    pub weights: Vec<f64>,
    pub offset: Option<Vec<f64>>,
    pub response_levels: Option<Vec<String>>,
    pub penalty_factors: Vec<f64>,
    pub exclude: Vec<usize>,
}

impl Prepared {
    pub fn nobs(&self) -> usize {
        self.y.len()
    }

    /// Restricts every per-row input to `rows`.
    pub fn rows(&self, rows: &[usize]) -> Result<Prepared, FitError> {
        let pick = |values: &[f64]| rows.iter().map(|&i| values[i]).collect::<Vec<f64>>();
        Ok(Prepared {
            design: self.design.clone(),
            x: self.x.select_rows(rows)?,
            y: pick(&self.y),
            weights: pick(&self.weights),
            offset: self.offset.as_deref().map(pick),
            response_levels: self.response_levels.clone(),
            penalty_factors: self.penalty_factors.clone(),
            exclude: self.exclude.clone(),
        })
    }
}

/// Fits `formula` on `data` with the bundled coordinate-descent engine.
pub fn fit(formula: &str, data: &Frame, options: &FitOptions) -> Result<FittedModel, FitError> {
    fit_with_engine(formula, data, options, &CoordinateDescent)
}

pub fn fit_with_engine(
    formula: &str,
    data: &Frame,
    options: &FitOptions,
    engine: &dyn ElasticNetEngine,
) -> Result<FittedModel, FitError> {
    check_engine(options, engine)?;
    let prepared = prepare(formula, data, options)?;
    fit_prepared(&prepared, options, engine)
}

/// Fails before any work is done when the engine is too old for a requested
/// feature.
pub(crate) fn check_engine(
    options: &FitOptions,
    engine: &dyn ElasticNetEngine,
) -> Result<(), FitError> {
    let found = engine.version();
    if options.relax && found < RELAX_MIN_ENGINE_VERSION {
        return Err(FitError::EngineTooOld {
            feature: "relax",
            engine: engine.name().to_string(),
            required: RELAX_MIN_ENGINE_VERSION,
            found,
        });
    }
    Ok(())
}

pub(crate) fn prepare(
    formula: &str,
    data: &Frame,
    options: &FitOptions,
) -> Result<Prepared, FitError> {
    let reserved: Vec<String> = options
        .weights
        .iter()
        .chain(options.offset.iter())
        .cloned()
        .collect();
    let terms = Terms::from_formula(formula, Some(data.names()), &reserved)
        .map_err(DesignError::from)?;
    let response = terms.response.clone().ok_or(FitError::MissingResponse)?;

    let subset;
    let frame = match &options.subset {
        Some(rows) => {
            subset = data.select_rows(rows).map_err(DesignError::from)?;
            &subset
        }
        None => data,
    };
    let n = frame.nrows();

    let (y, response_levels) = match frame
        .column(&response.column)
        .ok_or_else(|| DesignError::MissingVariable(response.column.clone()))?
    {
        Column::Numeric(values) => (
            values
                .iter()
                .map(|&v| response.transform.map_or(v, |t| t.apply(v)))
                .collect::<Vec<f64>>(),
            None,
        ),
        Column::Factor { values, levels } => {
            if let Some(t) = response.transform {
                return Err(DesignError::TransformOnFactor {
                    variable: response.column.clone(),
                    transform: t.name(),
                }
                .into());
            }
            if options.family != Family::Binomial {
                return Err(FitError::FactorResponse {
                    variable: response.column.clone(),
                    family: options.family,
                });
            }
            if levels.len() != 2 {
                return Err(FitError::ResponseLevels {
                    variable: response.column.clone(),
                    found: levels.len(),
                });
            }
            let y = values
                .iter()
                .map(|v| match v {
                    Some(level) if *level == levels[1] => 1.0,
                    Some(_) => 0.0,
                    None => f64::NAN,
                })
                .collect();
            (y, Some(levels.clone()))
        }
    };

    let weights = match &options.weights {
        Some(name) => numeric_column(frame, name, "weights")?.to_vec(),
        None => vec![1.0; n],
    };
    let design_options = DesignOptions {
        sparse: options.sparse,
        mode: options.mode,
        unseen_levels: options.unseen_levels,
    };
    let (design, x) = DesignSpec::fit(terms, frame, design_options)?;
    let offset = offset_vector(&design, options.offset.as_deref(), frame)?;

    let mut complete = design.complete_rows(frame)?;
    for (i, ok) in complete.iter_mut().enumerate() {
        let offset_ok = offset.as_ref().is_none_or(|o| o[i].is_finite());
        *ok = *ok && y[i].is_finite() && weights[i].is_finite() && offset_ok;
    }
    let keep: Vec<usize> = (0..n).filter(|&i| complete[i]).collect();

    let penalty_factors = resolve_penalties(&design.layout, options)?;
    let exclude = resolve_exclusions(&design.layout, options)?;
    let prepared = Prepared {
        design,
        x,
        y,
        weights,
        offset,
        response_levels,
        penalty_factors,
        exclude,
    };

    if keep.len() == n {
        return Ok(prepared);
    }
    if options.na_action == NaAction::Fail {
        return Err(FitError::MissingValues {
            count: n - keep.len(),
        });
    }
    if keep.is_empty() {
        return Err(FitError::NoCompleteRows);
    }
    log::info!(
        "Dropped {} of {n} row(s) with missing values.",
        n - keep.len()
    );
    prepared.rows(&keep)
}

pub(crate) fn numeric_column<'f>(
    frame: &'f Frame,
    name: &str,
    option: &'static str,
) -> Result<&'f [f64], FitError> {
    match frame.column(name) {
        Some(Column::Numeric(values)) => Ok(values),
        Some(Column::Factor { .. }) => Err(FitError::NonNumericColumn {
            option,
            column: name.to_string(),
        }),
        None => Err(DesignError::MissingVariable(name.to_string()).into()),
    }
}

/// Formula offsets plus the optional offset column, if there are any.
pub(crate) fn offset_vector(
    design: &DesignSpec,
    column: Option<&str>,
    frame: &Frame,
) -> Result<Option<Vec<f64>>, FitError> {
    let mut total = design.formula_offset(frame)?.map(|o| o.to_vec());
    if let Some(name) = column {
        let values = numeric_column(frame, name, "offset")?;
        match total.as_mut() {
            Some(sum) => sum.iter_mut().zip(values).for_each(|(s, v)| *s += v),
            None => total = Some(values.to_vec()),
        }
    }
    Ok(total)
}

fn resolve_penalties(layout: &ColumnLayout, options: &FitOptions) -> Result<Vec<f64>, FitError> {
    let mut factors = vec![1.0; layout.ncols()];
    for (name, &value) in &options.penalty_factors {
        let range = layout.resolve(name).ok_or_else(|| FitError::UnknownColumn {
            option: "penalty_factors",
            name: name.clone(),
        })?;
        factors[range].fill(value);
    }
    Ok(factors)
}

fn resolve_exclusions(layout: &ColumnLayout, options: &FitOptions) -> Result<Vec<usize>, FitError> {
    let mut exclude = Vec::new();
    for name in &options.exclude {
        let range = layout.resolve(name).ok_or_else(|| FitError::UnknownColumn {
            option: "exclude",
            name: name.clone(),
        })?;
        exclude.extend(range);
    }
    exclude.sort_unstable();
    exclude.dedup();
    Ok(exclude)
}

/// Calls the engine on prepared inputs.
pub(crate) fn run_path(
    engine: &dyn ElasticNetEngine,
    prepared: &Prepared,
    options: &FitOptions,
    lambda: LambdaSpec,
    exclude: &[usize],
) -> Result<PathFit, FitError> {
    let problem = Problem {
        x: &prepared.x,
        y: &prepared.y,
        weights: &prepared.weights,
        offset: prepared.offset.as_deref(),
        family: options.family,
        alpha: options.alpha,
        lambda,
        penalty_factors: &prepared.penalty_factors,
        exclude,
        control: &options.control,
    };
    Ok(engine.fit(&problem)?)
}

pub(crate) fn lambda_spec(options: &FitOptions) -> LambdaSpec {
    match &options.lambda {
        Some(values) => LambdaSpec::Values(values.clone()),
        None => LambdaSpec::Generated {
            nlambda: options.nlambda,
            min_ratio: options.lambda_min_ratio,
        },
    }
}

pub(crate) fn fit_prepared(
    prepared: &Prepared,
    options: &FitOptions,
    engine: &dyn ElasticNetEngine,
) -> Result<FittedModel, FitError> {
    log::info!(
        "Fitting {} elastic net (alpha = {}) on {} row(s) and {} column(s) with engine '{}' {}.",
        options.family,
        options.alpha,
        prepared.nobs(),
        prepared.x.ncols(),
        engine.name(),
        engine.version()
    );
    let path = run_path(
        engine,
        prepared,
        options,
        lambda_spec(options),
        &prepared.exclude,
    )?;
    log::info!(
        "Path has {} lambda value(s) after {} coordinate pass(es).",
        path.len(),
        path.npasses
    );
    let relaxed = if options.relax {
        Some(relax(engine, prepared, options, &path)?)
    } else {
        None
    };

    Ok(FittedModel {
        family: options.family,
        alpha: options.alpha,
        nobs: prepared.nobs(),
        response_levels: prepared.response_levels.clone(),
        engine: EngineInfo {
            name: engine.name().to_string(),
            version: engine.version(),
        },
        options: options.clone(),
        design: prepared.design.clone(),
        path,
        relaxed,
    })
}

/// Refits each lambda's active set without a penalty. Lambdas that share an
/// active set share one refit.
pub(crate) fn relax(
    engine: &dyn ElasticNetEngine,
    prepared: &Prepared,
    options: &FitOptions,
    path: &PathFit,
) -> Result<PathFit, FitError> {
    let p = path.beta.nrows();
    let mut cache: AHashMap<Vec<usize>, PathFit> = AHashMap::new();
    let mut a0 = Vec::with_capacity(path.len());
    let mut beta = Array2::zeros((p, path.len()));
    let mut dev_ratio = Vec::with_capacity(path.len());
    let mut npasses = 0;

    for l in 0..path.len() {
        let active: Vec<usize> = (0..p).filter(|&j| path.beta[[j, l]] != 0.0).collect();
        if !cache.contains_key(&active) {
            let inactive: Vec<usize> = (0..p).filter(|j| active.binary_search(j).is_err()).collect();
            let refit = run_path(
                engine,
                prepared,
                options,
                LambdaSpec::Values(vec![0.0]),
                &inactive,
            )?;
            npasses += refit.npasses;
            cache.insert(active.clone(), refit);
        }
        let refit = &cache[&active];
        a0.push(refit.a0[0]);
        beta.column_mut(l).assign(&refit.coefficients(0));
        dev_ratio.push(refit.dev_ratio[0]);
    }
    log::debug!(
        "Relaxed fit needed {} unpenalized refit(s) for {} lambda value(s).",
        cache.len(),
        path.len()
    );

    Ok(PathFit {
        lambda: path.lambda.clone(),
        a0,
        df: path.df.clone(),
        beta,
        dev_ratio,
        null_dev: path.null_dev,
        npasses,
    })
}
