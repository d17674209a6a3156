//! # Cross-validation over alpha and lambda
//!
//! One cross-validated path per alpha, all sharing a single fold assignment
//! and a single prepared model matrix, so the losses are directly comparable.

use crate::cv::{self, CvError, CvModel, LambdaChoice};
use crate::design::Frame;
use crate::engine::{CoordinateDescent, ElasticNetEngine};
use crate::fit;
use crate::model::{Coefficients, ModelError, PredictType};
use crate::options::{CvOptions, CvaOptions};
use ndarray::Array1;
use rayon::prelude::*;
use std::fmt;

#[derive(Debug, Clone)]
pub struct CvaModel {
    pub alphas: Vec<f64>,
    /// One cross-validated fit per entry of `alphas`.
    pub models: Vec<CvModel>,
    pub foldid: Vec<usize>,
}

/// The best (alpha, lambda) pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestFit {
    pub alpha_index: usize,
    pub alpha: f64,
    pub lambda: f64,
    /// Relaxed blend weight; 1 unless the fits were relaxed.
    pub gamma: f64,
    pub cvm: f64,
}

/// Per-alpha summary: the data behind a minimum-loss plot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaLoss {
    pub alpha: f64,
    pub lambda_min: f64,
    pub gamma_min: f64,
    pub cvm_min: f64,
    pub lambda_1se: f64,
    pub gamma_1se: f64,
    pub cvm_1se: f64,
}

pub fn cva(formula: &str, data: &Frame, options: &CvaOptions) -> Result<CvaModel, CvError> {
    cva_with_engine(formula, data, options, &CoordinateDescent)
}

pub fn cva_with_engine(
    formula: &str,
    data: &Frame,
    options: &CvaOptions,
    engine: &dyn ElasticNetEngine,
) -> Result<CvaModel, CvError> {
    let alphas = options.alpha_grid();
    if alphas.is_empty() {
        return Err(CvError::AlphaGrid("no alpha values were given".to_string()));
    }
    if let Some(bad) = alphas.iter().find(|a| !(0.0..=1.0).contains(*a)) {
        return Err(CvError::AlphaGrid(format!("{bad} is outside [0, 1]")));
    }
    cv::check_measure(options.cv.measure, options.cv.fit.family)?;
    cv::check_gamma(&options.cv)?;
    fit::check_engine(&options.cv.fit, engine)?;

    let prepared = fit::prepare(formula, data, &options.cv.fit)?;
    let foldid = cv::resolve_folds(&options.cv, &prepared.weights)?;
    log::info!(
        "Cross-validating {} alpha value(s) with {} shared folds.",
        alphas.len(),
        foldid.iter().max().map_or(0, |m| m + 1)
    );

    let run = |alpha: &f64| -> Result<CvModel, CvError> {
        let mut per_alpha: CvOptions = options.cv.clone();
        per_alpha.fit.alpha = *alpha;
        log::debug!("alpha = {alpha}");
        cv::cv_prepared(&prepared, &per_alpha, &foldid, engine)
    };
    let models: Vec<CvModel> = if options.cv.parallel {
        alphas.par_iter().map(run).collect::<Result<_, _>>()?
    } else {
        alphas.iter().map(run).collect::<Result<_, _>>()?
    };

    Ok(CvaModel {
        alphas,
        models,
        foldid,
    })
}

impl CvaModel {
    /// Minimum cross-validated loss over every alpha; ties go to the earliest
    /// alpha.
    pub fn best(&self) -> BestFit {
        let at = |i: usize| {
            let model = &self.models[i];
            BestFit {
                alpha_index: i,
                alpha: self.alphas[i],
                lambda: model.lambda_for(LambdaChoice::Min),
                gamma: model.gamma_for(LambdaChoice::Min),
                cvm: model.cvm_min(),
            }
        };
        let mut best = at(0);
        for i in 1..self.models.len() {
            let candidate = at(i);
            if candidate.cvm < best.cvm {
                best = candidate;
            }
        }
        best
    }

    pub fn loss_table(&self) -> Vec<AlphaLoss> {
        self.alphas
            .iter()
            .zip(&self.models)
            .map(|(&alpha, m)| AlphaLoss {
                alpha,
                lambda_min: m.lambda_for(LambdaChoice::Min),
                gamma_min: m.gamma_for(LambdaChoice::Min),
                cvm_min: m.cvm_min(),
                lambda_1se: m.lambda_for(LambdaChoice::OneSe),
                gamma_1se: m.gamma_for(LambdaChoice::OneSe),
                cvm_1se: m.cvm_1se(),
            })
            .collect()
    }

    /// The cross-validated fit whose alpha is nearest to `alpha`.
    pub fn model_for(&self, alpha: f64) -> &CvModel {
        let mut nearest = 0;
        for (i, a) in self.alphas.iter().enumerate() {
            if (a - alpha).abs() < (self.alphas[nearest] - alpha).abs() {
                nearest = i;
            }
        }
        &self.models[nearest]
    }

    pub fn predict(
        &self,
        newdata: &Frame,
        alpha: f64,
        choice: LambdaChoice,
        kind: PredictType,
    ) -> Result<Array1<f64>, ModelError> {
        self.model_for(alpha).predict(newdata, choice, kind)
    }

    pub fn coef(&self, alpha: f64, choice: LambdaChoice) -> Result<Coefficients, ModelError> {
        self.model_for(alpha).coef(choice)
    }
}

impl fmt::Display for CvaModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(first) = self.models.first() {
            writeln!(f, "Call:  {}", first.model.formula())?;
            writeln!(
                f,
                "Measure: {}",
                first.measure.describe(first.model.family)
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>8} {:>12} {:>10} {:>12} {:>10}",
            "Alpha", "Lambda.min", "Loss.min", "Lambda.1se", "Loss.1se"
        )?;
        for row in self.loss_table() {
            writeln!(
                f,
                "{:>8.4} {:>12.5} {:>10.4} {:>12.5} {:>10.4}",
                row.alpha, row.lambda_min, row.cvm_min, row.lambda_1se, row.cvm_1se
            )?;
        }
        let best = self.best();
        writeln!(f)?;
        write!(
            f,
            "Best: alpha = {:.4}, lambda = {:.5}, loss = {:.4}",
            best.alpha, best.lambda, best.cvm
        )?;
        if self.models.iter().any(|m| m.relaxed.is_some()) {
            write!(f, ", gamma = {:.2}", best.gamma)?;
        }
        Ok(())
    }
}
