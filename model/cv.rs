//! # Cross-validation over the lambda path
//!
//! The full-data fit fixes the lambda sequence. Every fold then refits on its
//! training rows with exactly those lambdas and scores the held-out rows. Folds
//! are independent, so they run on rayon's pool when asked; results are
//! collected in fold order and reduced once, which makes parallel and serial
//! runs bit-for-bit identical.
//!
//! With `relax` set, each fold also refits its active sets without a penalty,
//! and every blend `gamma * penalized + (1 - gamma) * relaxed` on the gamma
//! grid is scored alongside the penalized path.

use crate::design::Frame;
use crate::engine::{CoordinateDescent, ElasticNetEngine, Family, LambdaSpec, PathFit};
use crate::fit::{self, FitError, Prepared};
use crate::model::{Coefficients, FittedModel, LambdaSelection, ModelError, PredictOptions, PredictType};
use crate::options::{CvOptions, LossMeasure};
use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use std::fmt;
use thiserror::Error;

const PROB_EPS: f64 = 1e-5;

#[derive(Error, Debug)]
pub enum CvError {
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Cross-validation needs at least 3 folds, found {0}.")]
    TooFewFolds(usize),
    #[error("{nfolds} folds were requested, but only {nobs} row(s) are available.")]
    TooFewRows { nfolds: usize, nobs: usize },
    #[error("foldid has {found} entries, but {expected} row(s) are used in the fit.")]
    FoldLength { expected: usize, found: usize },
    #[error("Fold {0} has no rows.")]
    EmptyFold(usize),
    #[error("The observation weights of fold {0} sum to zero, so its loss is undefined.")]
    ZeroWeightFold(usize),
    #[error("Invalid alpha grid: {0}")]
    AlphaGrid(String),
    #[error("Invalid gamma grid: {0}")]
    GammaGrid(String),
    #[error("The '{measure:?}' loss is not available for the {family} family.")]
    MeasureFamily { measure: LossMeasure, family: Family },
}

/// Which point of the cross-validated path to use.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LambdaChoice {
    /// The lambda with the smallest mean loss.
    Min,
    /// The largest lambda within one standard error of the minimum.
    #[default]
    OneSe,
    Value(f64),
}

#[derive(Debug, Clone)]
pub struct CvModel {
    /// Fit on all rows; its lambdas are the ones cross-validated.
    pub model: FittedModel,
    pub measure: LossMeasure,
    pub lambda: Vec<f64>,
    pub cvm: Vec<f64>,
    pub cvsd: Vec<f64>,
    pub nzero: Vec<usize>,
    pub index_min: usize,
    pub index_1se: usize,
    pub lambda_min: f64,
    pub lambda_1se: f64,
    pub foldid: Vec<usize>,
    /// Losses of the relaxed blends, present when the model was fit with `relax`.
    pub relaxed: Option<RelaxedCv>,
}

/// Cross-validated losses over gamma × lambda for a relaxed fit. `cvm` and
/// `cvsd` have one row per entry of `gamma` and one column per lambda.
#[derive(Debug, Clone)]
pub struct RelaxedCv {
    pub gamma: Vec<f64>,
    pub cvm: Array2<f64>,
    pub cvsd: Array2<f64>,
    /// `(gamma, lambda)` position of the minimum loss.
    pub index_min: (usize, usize),
    /// Largest lambda, then largest gamma, within one standard error of the minimum.
    pub index_1se: (usize, usize),
    pub gamma_min: f64,
    pub lambda_min: f64,
    pub gamma_1se: f64,
    pub lambda_1se: f64,
}

/// Balanced random folds: row `i` gets `i mod nfolds`, then the labels are
/// shuffled with a seeded generator.
pub fn assign_folds(nobs: usize, nfolds: usize, seed: u64) -> Vec<usize> {
    let mut foldid: Vec<usize> = (0..nobs).map(|i| i % nfolds).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    foldid.shuffle(&mut rng);
    foldid
}

pub fn cv(formula: &str, data: &Frame, options: &CvOptions) -> Result<CvModel, CvError> {
    cv_with_engine(formula, data, options, &CoordinateDescent)
}

pub fn cv_with_engine(
    formula: &str,
    data: &Frame,
    options: &CvOptions,
    engine: &dyn ElasticNetEngine,
) -> Result<CvModel, CvError> {
    check_measure(options.measure, options.fit.family)?;
    check_gamma(options)?;
    fit::check_engine(&options.fit, engine)?;
    let prepared = fit::prepare(formula, data, &options.fit)?;
    let foldid = resolve_folds(options, &prepared.weights)?;
    cv_prepared(&prepared, options, &foldid, engine)
}

/// The gamma grid matters only for relaxed fits.
pub(crate) fn check_gamma(options: &CvOptions) -> Result<(), CvError> {
    if !options.fit.relax {
        return Ok(());
    }
    if options.gamma.is_empty() {
        return Err(CvError::GammaGrid("no gamma values were given".to_string()));
    }
    if let Some(bad) = options.gamma.iter().find(|g| !(0.0..=1.0).contains(*g)) {
        return Err(CvError::GammaGrid(format!("{bad} is outside [0, 1]")));
    }
    Ok(())
}

pub(crate) fn check_measure(measure: LossMeasure, family: Family) -> Result<(), CvError> {
    if measure == LossMeasure::Class && family != Family::Binomial {
        return Err(CvError::MeasureFamily { measure, family });
    }
    Ok(())
}

/// User folds, checked against the rows actually used, or fresh random ones.
/// `weights` are the observation weights of those rows.
pub(crate) fn resolve_folds(options: &CvOptions, weights: &[f64]) -> Result<Vec<usize>, CvError> {
    let nobs = weights.len();
    let foldid = match &options.foldid {
        Some(foldid) => {
            if foldid.len() != nobs {
                return Err(CvError::FoldLength {
                    expected: nobs,
                    found: foldid.len(),
                });
            }
            foldid.clone()
        }
        None => {
            if options.nfolds < 3 {
                return Err(CvError::TooFewFolds(options.nfolds));
            }
            if options.nfolds > nobs {
                return Err(CvError::TooFewRows {
                    nfolds: options.nfolds,
                    nobs,
                });
            }
            assign_folds(nobs, options.nfolds, options.seed)
        }
    };
    let nfolds = foldid.iter().max().map_or(0, |m| m + 1);
    if nfolds < 3 {
        return Err(CvError::TooFewFolds(nfolds));
    }
    if let Some(empty) = (0..nfolds).find(|k| !foldid.contains(k)) {
        return Err(CvError::EmptyFold(empty));
    }
    let mut fold_weight = vec![0.0; nfolds];
    for (&k, &w) in foldid.iter().zip(weights) {
        fold_weight[k] += w;
    }
    if let Some(k) = fold_weight.iter().position(|&w| !(w > 0.0)) {
        return Err(CvError::ZeroWeightFold(k));
    }
    Ok(foldid)
}

/// Weighted mean loss on one fold, plus the fold's total weight. Row 0 of
/// `mean` is the penalized path; row `g + 1` is the blend at `gamma[g]`.
struct FoldScore {
    mean: Vec<Vec<f64>>,
    weight: f64,
}

pub(crate) fn cv_prepared(
    prepared: &Prepared,
    options: &CvOptions,
    foldid: &[usize],
    engine: &dyn ElasticNetEngine,
) -> Result<CvModel, CvError> {
    let model = fit::fit_prepared(prepared, &options.fit, engine)?;
    let lambda = model.path.lambda.clone();
    let nfolds = foldid.iter().max().map_or(0, |m| m + 1);

    let gammas: &[f64] = if options.fit.relax { &options.gamma } else { &[] };
    let score = |k: usize| -> Result<FoldScore, CvError> {
        let train: Vec<usize> = (0..foldid.len()).filter(|&i| foldid[i] != k).collect();
        let test: Vec<usize> = (0..foldid.len()).filter(|&i| foldid[i] == k).collect();
        let training = prepared.rows(&train)?;
        let path = fit::run_path(
            engine,
            &training,
            &options.fit,
            LambdaSpec::Values(lambda.clone()),
            &prepared.exclude,
        )?;
        let relaxed = if options.fit.relax {
            Some(fit::relax(engine, &training, &options.fit, &path)?)
        } else {
            None
        };
        log::debug!(
            "Fold {}/{nfolds}: trained on {} row(s), scoring {}.",
            k + 1,
            train.len(),
            test.len()
        );
        Ok(score_fold(
            &prepared.rows(&test)?,
            &path,
            relaxed.as_ref(),
            gammas,
            options.fit.family,
            options.measure,
        ))
    };

    let scores: Vec<FoldScore> = if options.parallel {
        (0..nfolds).into_par_iter().map(score).collect::<Result<_, _>>()?
    } else {
        (0..nfolds).map(score).collect::<Result<_, _>>()?
    };

    // A fold path may stop early (dfmax or pass budget); score the common prefix.
    let nlambda = scores
        .iter()
        .map(|s| s.mean[0].len())
        .fold(lambda.len(), usize::min);
    if nlambda == 0 {
        return Err(ModelError::EmptyPath.into());
    }
    let mut lambda = lambda;
    lambda.truncate(nlambda);
    let mut nzero = model.path.df.clone();
    nzero.truncate(nlambda);

    let (cvm, cvsd) = summarize(&scores, 0, nlambda);
    let index_min = argmin(&cvm);
    let threshold = cvm[index_min] + cvsd[index_min];
    let index_1se = cvm.iter().position(|&m| m <= threshold).unwrap_or(index_min);
    log::info!(
        "Cross-validated {} lambda value(s) over {nfolds} folds: lambda.min = {:.5e}, lambda.1se = {:.5e}.",
        lambda.len(),
        lambda[index_min],
        lambda[index_1se]
    );
    let relaxed = options
        .fit
        .relax
        .then(|| relaxed_summary(&scores, gammas, &lambda));

    Ok(CvModel {
        nzero,
        lambda_min: lambda[index_min],
        lambda_1se: lambda[index_1se],
        index_min,
        index_1se,
        measure: options.measure,
        cvm,
        cvsd,
        lambda,
        foldid: foldid.to_vec(),
        model,
        relaxed,
    })
}

fn relaxed_summary(scores: &[FoldScore], gammas: &[f64], lambda: &[f64]) -> RelaxedCv {
    let nlambda = lambda.len();
    let mut cvm = Array2::<f64>::zeros((gammas.len(), nlambda));
    let mut cvsd = Array2::<f64>::zeros((gammas.len(), nlambda));
    for g in 0..gammas.len() {
        let (m, sd) = summarize(scores, g + 1, nlambda);
        cvm.row_mut(g).assign(&Array1::from(m));
        cvsd.row_mut(g).assign(&Array1::from(sd));
    }

    let mut index_min = (0, 0);
    for ((g, l), &value) in cvm.indexed_iter() {
        if value < cvm[index_min] {
            index_min = (g, l);
        }
    }
    let threshold = cvm[index_min] + cvsd[index_min];
    let index_1se = (0..nlambda)
        .find_map(|l| {
            (0..gammas.len())
                .filter(|&g| cvm[[g, l]] <= threshold)
                .max_by(|&a, &b| gammas[a].total_cmp(&gammas[b]))
                .map(|g| (g, l))
        })
        .unwrap_or(index_min);
    log::info!(
        "Relaxed cross-validation: gamma.min = {}, lambda.min = {:.5e}; gamma.1se = {}, lambda.1se = {:.5e}.",
        gammas[index_min.0],
        lambda[index_min.1],
        gammas[index_1se.0],
        lambda[index_1se.1]
    );

    RelaxedCv {
        gamma: gammas.to_vec(),
        gamma_min: gammas[index_min.0],
        lambda_min: lambda[index_min.1],
        gamma_1se: gammas[index_1se.0],
        lambda_1se: lambda[index_1se.1],
        index_min,
        index_1se,
        cvm,
        cvsd,
    }
}

fn score_fold(
    test: &Prepared,
    path: &PathFit,
    relaxed: Option<&PathFit>,
    gammas: &[f64],
    family: Family,
    measure: LossMeasure,
) -> FoldScore {
    let weight: f64 = test.weights.iter().sum();
    let offset = test.offset.clone().map(Array1::from);
    let mean_loss = |eta: &Array1<f64>| -> f64 {
        let total: f64 = test
            .y
            .iter()
            .zip(&test.weights)
            .zip(eta.iter())
            .map(|((&y, &w), &e)| w * loss(family, measure, y, e))
            .sum();
        total / weight
    };

    let rows = if relaxed.is_some() { gammas.len() + 1 } else { 1 };
    let mut mean = vec![Vec::with_capacity(path.len()); rows];
    for l in 0..path.len() {
        let eta = linear_predictor(test, path, l, offset.as_ref());
        mean[0].push(mean_loss(&eta));
        if let Some(relaxed) = relaxed {
            // The blend is linear in the coefficients, hence in eta.
            let unpenalized = linear_predictor(test, relaxed, l, offset.as_ref());
            for (g, &gamma) in gammas.iter().enumerate() {
                let blended = &eta * gamma + &unpenalized * (1.0 - gamma);
                mean[g + 1].push(mean_loss(&blended));
            }
        }
    }
    FoldScore { mean, weight }
}

fn linear_predictor(
    test: &Prepared,
    path: &PathFit,
    l: usize,
    offset: Option<&Array1<f64>>,
) -> Array1<f64> {
    let mut eta = test.x.matrix_vector_multiply(path.coefficients(l));
    eta += path.a0[l];
    if let Some(offset) = offset {
        eta += offset;
    }
    eta
}

fn loss(family: Family, measure: LossMeasure, y: f64, eta: f64) -> f64 {
    let mu = match family {
        Family::Binomial => family.linkinv(eta).clamp(PROB_EPS, 1.0 - PROB_EPS),
        _ => family.linkinv(eta),
    };
    match measure {
        LossMeasure::Deviance => family.unit_deviance(y, mu),
        LossMeasure::Mse => (y - mu).powi(2),
        LossMeasure::Mae => (y - mu).abs(),
        LossMeasure::Class => f64::from(u8::from((y > 0.5) != (mu > 0.5))),
    }
}

/// Fold-weighted mean of the fold means in `row`, and the standard error of
/// that mean.
fn summarize(scores: &[FoldScore], row: usize, nlambda: usize) -> (Vec<f64>, Vec<f64>) {
    let total: f64 = scores.iter().map(|s| s.weight).sum();
    let nfolds = scores.len() as f64;
    let mut cvm = vec![0.0; nlambda];
    let mut cvsd = vec![0.0; nlambda];
    for l in 0..nlambda {
        cvm[l] = scores.iter().map(|s| s.weight * s.mean[row][l]).sum::<f64>() / total;
        let spread = scores
            .iter()
            .map(|s| s.weight * (s.mean[row][l] - cvm[l]).powi(2))
            .sum::<f64>()
            / total;
        cvsd[l] = (spread / (nfolds - 1.0)).sqrt();
    }
    (cvm, cvsd)
}

/// First index of the minimum, which is the largest lambda attaining it.
fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v < values[best] {
            best = i;
        }
    }
    best
}

impl CvModel {
    /// The selected lambda. For a relaxed fit, `Min` and `OneSe` pick from the
    /// gamma × lambda search.
    pub fn lambda_for(&self, choice: LambdaChoice) -> f64 {
        match (choice, &self.relaxed) {
            (LambdaChoice::Min, Some(relaxed)) => relaxed.lambda_min,
            (LambdaChoice::OneSe, Some(relaxed)) => relaxed.lambda_1se,
            (LambdaChoice::Min, None) => self.lambda_min,
            (LambdaChoice::OneSe, None) => self.lambda_1se,
            (LambdaChoice::Value(value), _) => value,
        }
    }

    /// The blend weight paired with `lambda_for(choice)`; 1 is the penalized fit.
    pub fn gamma_for(&self, choice: LambdaChoice) -> f64 {
        match (choice, &self.relaxed) {
            (LambdaChoice::Min, Some(relaxed)) => relaxed.gamma_min,
            (LambdaChoice::OneSe, Some(relaxed)) => relaxed.gamma_1se,
            _ => 1.0,
        }
    }

    /// Cross-validated loss at the `Min` selection.
    pub fn cvm_min(&self) -> f64 {
        match &self.relaxed {
            Some(relaxed) => relaxed.cvm[relaxed.index_min],
            None => self.cvm[self.index_min],
        }
    }

    /// Cross-validated loss at the `OneSe` selection.
    pub fn cvm_1se(&self) -> f64 {
        match &self.relaxed {
            Some(relaxed) => relaxed.cvm[relaxed.index_1se],
            None => self.cvm[self.index_1se],
        }
    }

    /// Predictions at one chosen lambda.
    pub fn predict(
        &self,
        newdata: &Frame,
        choice: LambdaChoice,
        kind: PredictType,
    ) -> Result<Array1<f64>, ModelError> {
        let options = PredictOptions {
            kind,
            lambda: LambdaSelection::Values(vec![self.lambda_for(choice)]),
            gamma: self.gamma_for(choice),
        };
        Ok(self.model.predict(newdata, &options)?.column(0).to_owned())
    }

    pub fn coef(&self, choice: LambdaChoice) -> Result<Coefficients, ModelError> {
        self.model.coef_with_gamma(
            &LambdaSelection::Values(vec![self.lambda_for(choice)]),
            self.gamma_for(choice),
        )
    }

    /// Lower and upper one-standard-error bands around `cvm`.
    pub fn bands(&self) -> (Vec<f64>, Vec<f64>) {
        let lower = self.cvm.iter().zip(&self.cvsd).map(|(m, s)| m - s).collect();
        let upper = self.cvm.iter().zip(&self.cvsd).map(|(m, s)| m + s).collect();
        (lower, upper)
    }
}

impl fmt::Display for CvModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Call:  {}", self.model.formula())?;
        writeln!(f)?;
        writeln!(
            f,
            "Measure: {}",
            self.measure.describe(self.model.family)
        )?;
        writeln!(f)?;
        writeln!(
            f,
            "{:>4} {:>10} {:>6} {:>10} {:>10} {:>8}",
            "", "Lambda", "Index", "Measure", "SE", "Nonzero"
        )?;
        for (label, i) in [("min", self.index_min), ("1se", self.index_1se)] {
            writeln!(
                f,
                "{:>4} {:>10.5} {:>6} {:>10.4} {:>10.4} {:>8}",
                label,
                self.lambda[i],
                i + 1,
                self.cvm[i],
                self.cvsd[i],
                self.nzero[i]
            )?;
        }
        if let Some(relaxed) = &self.relaxed {
            writeln!(f)?;
            writeln!(
                f,
                "{:>4} {:>6} {:>10} {:>6} {:>10} {:>10} {:>8}",
                "", "Gamma", "Lambda", "Index", "Measure", "SE", "Nonzero"
            )?;
            for (label, (g, l)) in [("min", relaxed.index_min), ("1se", relaxed.index_1se)] {
                writeln!(
                    f,
                    "{:>4} {:>6.2} {:>10.5} {:>6} {:>10.4} {:>10.4} {:>8}",
                    label,
                    relaxed.gamma[g],
                    self.lambda[l],
                    l + 1,
                    relaxed.cvm[[g, l]],
                    relaxed.cvsd[[g, l]],
                    self.nzero[l]
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Column;
    use crate::options::FitOptions;
    use approx::assert_abs_diff_eq;

    fn frame() -> Frame {
        let n = 48;
        let x1: Vec<f64> = (0..n).map(|i| ((i * 7) % 13) as f64 / 13.0 - 0.5).collect();
        let x2: Vec<f64> = (0..n).map(|i| ((i * 5) % 11) as f64 / 11.0 - 0.5).collect();
        let x3: Vec<f64> = (0..n).map(|i| ((i * 3) % 17) as f64 / 17.0 - 0.5).collect();
        let y: Vec<f64> = (0..n)
            .map(|i| 3.0 * x1[i] - 1.5 * x2[i] + ((i * 11) % 7) as f64 * 0.05)
            .collect();
        Frame::new()
            .with_column("y", Column::numeric(y))
            .unwrap()
            .with_column("x1", Column::numeric(x1))
            .unwrap()
            .with_column("x2", Column::numeric(x2))
            .unwrap()
            .with_column("x3", Column::numeric(x3))
            .unwrap()
    }

    fn relaxed_options() -> CvOptions {
        CvOptions {
            nfolds: 4,
            fit: FitOptions {
                nlambda: 15,
                relax: true,
                ..FitOptions::default()
            },
            ..CvOptions::default()
        }
    }

    #[test]
    fn folds_are_balanced_and_reproducible() {
        let a = assign_folds(23, 5, 7);
        let b = assign_folds(23, 5, 7);
        assert_eq!(a, b);
        for k in 0..5 {
            let size = a.iter().filter(|&&f| f == k).count();
            assert!(size == 4 || size == 5);
        }
        assert_ne!(a, assign_folds(23, 5, 8));
    }

    #[test]
    fn user_folds_are_validated() {
        let options = CvOptions {
            foldid: Some(vec![0, 1, 2, 0]),
            ..CvOptions::default()
        };
        assert!(matches!(
            resolve_folds(&options, &[1.0; 5]),
            Err(CvError::FoldLength { expected: 5, found: 4 })
        ));
        let options = CvOptions {
            foldid: Some(vec![0, 1, 0, 1]),
            ..CvOptions::default()
        };
        assert!(matches!(resolve_folds(&options, &[1.0; 4]), Err(CvError::TooFewFolds(2))));
        let options = CvOptions {
            foldid: Some(vec![0, 1, 3, 0, 1, 3]),
            ..CvOptions::default()
        };
        assert!(matches!(resolve_folds(&options, &[1.0; 6]), Err(CvError::EmptyFold(2))));
    }

    #[test]
    fn summary_weights_folds_by_their_weight() {
        let scores = vec![
            FoldScore {
                mean: vec![vec![1.0]],
                weight: 1.0,
            },
            FoldScore {
                mean: vec![vec![2.0]],
                weight: 1.0,
            },
            FoldScore {
                mean: vec![vec![4.0]],
                weight: 2.0,
            },
        ];
        let (cvm, cvsd) = summarize(&scores, 0, 1);
        assert_abs_diff_eq!(cvm[0], 11.0 / 4.0, epsilon = 1e-12);
        let spread = (1.75f64.powi(2) + 0.75f64.powi(2) + 2.0 * 1.25f64.powi(2)) / 4.0;
        assert_abs_diff_eq!(cvsd[0], (spread / 2.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn argmin_prefers_largest_lambda() {
        assert_eq!(argmin(&[3.0, 1.0, 1.0, 2.0]), 1);
    }

    #[test]
    fn losses_follow_the_family() {
        assert_abs_diff_eq!(loss(Family::Gaussian, LossMeasure::Deviance, 1.0, 3.0), 4.0);
        assert_abs_diff_eq!(loss(Family::Gaussian, LossMeasure::Mae, 1.0, 3.0), 2.0);
        assert_eq!(loss(Family::Binomial, LossMeasure::Class, 1.0, 0.3), 0.0);
        assert_eq!(loss(Family::Binomial, LossMeasure::Class, 0.0, 0.3), 1.0);
        assert_abs_diff_eq!(
            loss(Family::Binomial, LossMeasure::Deviance, 1.0, 0.0),
            -2.0 * 0.5f64.ln(),
            epsilon = 1e-12
        );
        assert!(matches!(
            check_measure(LossMeasure::Class, Family::Poisson),
            Err(CvError::MeasureFamily { .. })
        ));
    }

    #[test]
    fn folds_without_weight_are_rejected() {
        let options = CvOptions {
            foldid: Some(vec![0, 1, 2, 0, 1, 2]),
            ..CvOptions::default()
        };
        assert!(matches!(
            resolve_folds(&options, &[1.0, 1.0, 0.0, 2.0, 1.0, 0.0]),
            Err(CvError::ZeroWeightFold(2))
        ));
        assert!(resolve_folds(&options, &[1.0, 1.0, 0.5, 2.0, 1.0, 0.0]).is_ok());
    }

    #[test]
    fn gamma_grid_is_checked_only_for_relaxed_fits() {
        let mut options = relaxed_options();
        options.gamma = vec![];
        assert!(matches!(
            cv("y ~ x1 + x2", &frame(), &options),
            Err(CvError::GammaGrid(_))
        ));
        options.gamma = vec![0.0, 1.5];
        assert!(matches!(
            cv("y ~ x1 + x2", &frame(), &options),
            Err(CvError::GammaGrid(_))
        ));
        options.fit.relax = false;
        assert!(check_gamma(&options).is_ok());
    }

    #[test]
    fn relaxed_fits_cross_validate_gamma() {
        let result = cv("y ~ x1 + x2 + x3", &frame(), &relaxed_options()).unwrap();
        let relaxed = result.relaxed.as_ref().unwrap();
        assert_eq!(relaxed.gamma, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(relaxed.cvm.dim(), (5, result.lambda.len()));

        // gamma = 1 is the penalized path itself.
        assert_eq!(relaxed.cvm.row(4).to_vec(), result.cvm);
        assert_eq!(relaxed.cvsd.row(4).to_vec(), result.cvsd);
        assert!(result.cvm_min() <= result.cvm[result.index_min]);
        assert!(result.cvm_min() <= result.cvm_1se());

        let (g, l) = relaxed.index_min;
        assert_eq!(result.gamma_for(LambdaChoice::Min), relaxed.gamma[g]);
        assert_eq!(result.lambda_for(LambdaChoice::Min), result.lambda[l]);
        assert_eq!(result.gamma_for(LambdaChoice::Value(0.1)), 1.0);

        let coef = result.coef(LambdaChoice::Min).unwrap();
        let expected = result
            .model
            .coef_with_gamma(
                &LambdaSelection::Values(vec![relaxed.lambda_min]),
                relaxed.gamma_min,
            )
            .unwrap();
        assert_eq!(coef.values, expected.values);
    }

    #[test]
    fn penalized_fits_have_no_gamma_search() {
        let options = CvOptions {
            fit: FitOptions {
                relax: false,
                ..relaxed_options().fit
            },
            ..relaxed_options()
        };
        let result = cv("y ~ x1 + x2 + x3", &frame(), &options).unwrap();
        assert!(result.relaxed.is_none());
        assert_eq!(result.gamma_for(LambdaChoice::Min), 1.0);
        assert_eq!(result.cvm_min(), result.cvm[result.index_min]);
    }
}
