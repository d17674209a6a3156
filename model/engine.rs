//! # Elastic-net engines
//!
//! The model layer never solves anything itself. It describes a penalized
//! regression path as a [`Problem`], hands it to an [`ElasticNetEngine`], and
//! wraps whatever [`PathFit`] comes back without touching its numbers.
//!
//! [`CoordinateDescent`] is the bundled engine. It minimizes
//!
//! ```text
//! (1/2) Σ wᵢ dev(yᵢ, ηᵢ) + λ Σ pfⱼ [ (1-α)/2 βⱼ² + α |βⱼ| ]
//! ```
//!
//! over a decreasing lambda sequence with warm starts, weights normalized to
//! sum to one. Gaussian responses are solved directly by cyclic coordinate
//! descent; binomial and poisson responses wrap the same solver in an IRLS
//! loop. Columns are standardized internally and coefficients are reported on
//! the original scale.

use crate::design::DesignMatrix;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Response distribution and its canonical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    #[default]
    Gaussian,
    Binomial,
    Poisson,
}

impl Family {
    pub fn name(self) -> &'static str {
        match self {
            Family::Gaussian => "gaussian",
            Family::Binomial => "binomial",
            Family::Poisson => "poisson",
        }
    }

    /// Maps a linear predictor onto the response scale.
    pub fn linkinv(self, eta: f64) -> f64 {
        match self {
            Family::Gaussian => eta,
            Family::Binomial => 1.0 / (1.0 + (-eta).exp()),
            Family::Poisson => eta.exp(),
        }
    }

    /// Contribution of one observation to the deviance.
    pub fn unit_deviance(self, y: f64, mu: f64) -> f64 {
        match self {
            Family::Gaussian => (y - mu).powi(2),
            Family::Binomial => {
                2.0 * (y_log_ratio(y, mu) + y_log_ratio(1.0 - y, 1.0 - mu))
            }
            Family::Poisson => 2.0 * (y_log_ratio(y, mu) - (y - mu)),
        }
    }

    fn validate_response(self, y: &[f64]) -> Result<(), EngineError> {
        if let Some(bad) = y.iter().find(|v| !v.is_finite()) {
            return Err(EngineError::InvalidResponse(format!(
                "the response contains the non-finite value {bad}"
            )));
        }
        match self {
            Family::Gaussian => Ok(()),
            Family::Binomial => match y.iter().find(|v| !(0.0..=1.0).contains(*v)) {
                Some(bad) => Err(EngineError::InvalidResponse(format!(
                    "binomial responses must lie in [0, 1], found {bad}"
                ))),
                None => Ok(()),
            },
            Family::Poisson => match y.iter().find(|v| **v < 0.0) {
                Some(bad) => Err(EngineError::InvalidResponse(format!(
                    "poisson responses must be non-negative, found {bad}"
                ))),
                None => Ok(()),
            },
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `y · ln(y / mu)`, taken as zero when `y` is zero.
fn y_log_ratio(y: f64, mu: f64) -> f64 {
    if y > 0.0 { y * (y / mu).ln() } else { 0.0 }
}

/// Semantic version reported by an engine, compared field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EngineVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EngineVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        EngineVersion {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for EngineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Oldest engine able to refit active sets with `lambda = 0`.
pub const RELAX_MIN_ENGINE_VERSION: EngineVersion = EngineVersion::new(1, 1, 0);

/// Version of the bundled [`CoordinateDescent`] engine.
pub const COORDINATE_DESCENT_VERSION: EngineVersion = EngineVersion::new(1, 2, 0);

/// How the penalty sequence is chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum LambdaSpec {
    /// `nlambda` values log-spaced from the smallest penalty that zeroes every
    /// coefficient down to that value times `min_ratio`.
    Generated {
        nlambda: usize,
        min_ratio: Option<f64>,
    },
    /// Explicit values, fitted in decreasing order.
    Values(Vec<f64>),
}

/// Solver controls that travel with a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathControl {
    pub standardize: bool,
    pub intercept: bool,
    /// Convergence threshold relative to the null deviance.
    pub thresh: f64,
    /// Total coordinate passes allowed over the whole path.
    pub maxit: usize,
    /// Generated paths stop before the number of non-zero coefficients
    /// exceeds this.
    pub dfmax: Option<usize>,
    pub lower_limit: f64,
    pub upper_limit: f64,
}

impl Default for PathControl {
    fn default() -> Self {
        PathControl {
            standardize: true,
            intercept: true,
            thresh: 1e-7,
            maxit: 100_000,
            dfmax: None,
            lower_limit: f64::NEG_INFINITY,
            upper_limit: f64::INFINITY,
        }
    }
}

/// Everything an engine needs to fit one regularization path.
#[derive(Debug, Clone)]
pub struct Problem<'a> {
    pub x: &'a DesignMatrix,
    pub y: &'a [f64],
    pub weights: &'a [f64],
    pub offset: Option<&'a [f64]>,
    pub family: Family,
    pub alpha: f64,
    pub lambda: LambdaSpec,
    pub penalty_factors: &'a [f64],
    /// Column indices forced to zero.
    pub exclude: &'a [usize],
    pub control: &'a PathControl,
}

/// A fitted path. Column `l` of `beta` holds the coefficients at `lambda[l]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathFit {
    pub lambda: Vec<f64>,
    pub a0: Vec<f64>,
    pub beta: Array2<f64>,
    pub df: Vec<usize>,
    pub dev_ratio: Vec<f64>,
    pub null_dev: f64,
    pub npasses: usize,
}

impl PathFit {
    pub fn len(&self) -> usize {
        self.lambda.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lambda.is_empty()
    }

    pub fn coefficients(&self, index: usize) -> ArrayView1<'_, f64> {
        self.beta.column(index)
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Input '{what}' has length {found}, but {expected} was expected.")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("Invalid engine parameter: {0}")]
    InvalidParameter(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("The solver exhausted its budget of {maxit} passes before fitting the first lambda.")]
    PassBudgetExhausted { maxit: usize },
}

/// The seam between the formula layer and the numeric path solver.
pub trait ElasticNetEngine: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> EngineVersion;
    fn fit(&self, problem: &Problem<'_>) -> Result<PathFit, EngineError>;
}

/// Pathwise cyclic coordinate descent with warm starts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinateDescent;

impl ElasticNetEngine for CoordinateDescent {
    fn name(&self) -> &str {
        "coordinate-descent"
    }

    fn version(&self) -> EngineVersion {
        COORDINATE_DESCENT_VERSION
    }

    fn fit(&self, problem: &Problem<'_>) -> Result<PathFit, EngineError> {
        solve(problem)
    }
}

const MIN_PATH_LENGTH: usize = 5;
const DEV_RATIO_MAX: f64 = 0.999;
const DEV_CHANGE_MIN: f64 = 1e-5;
const ALPHA_FLOOR: f64 = 1e-3;
const MAX_IRLS_ITERATIONS: usize = 100;
const IRLS_TOLERANCE: f64 = 1e-8;
const PROB_EPS: f64 = 1e-5;
const ETA_MAX: f64 = 700.0;

fn soft_threshold(z: f64, gamma: f64) -> f64 {
    if z > gamma {
        z - gamma
    } else if z < -gamma {
        z + gamma
    } else {
        0.0
    }
}

fn validate(problem: &Problem<'_>) -> Result<(), EngineError> {
    let n = problem.x.nrows();
    let p = problem.x.ncols();
    let check = |what: &'static str, found: usize, expected: usize| {
        if found == expected {
            Ok(())
        } else {
            Err(EngineError::DimensionMismatch {
                what,
                expected,
                found,
            })
        }
    };
    check("y", problem.y.len(), n)?;
    check("weights", problem.weights.len(), n)?;
    if let Some(offset) = problem.offset {
        check("offset", offset.len(), n)?;
    }
    check("penalty_factors", problem.penalty_factors.len(), p)?;

    if n < 2 {
        return Err(EngineError::InvalidParameter(format!(
            "at least two observations are required, found {n}"
        )));
    }
    if p == 0 {
        return Err(EngineError::InvalidParameter(
            "the design matrix has no columns".to_string(),
        ));
    }
    if let Some(&j) = problem.exclude.iter().find(|&&j| j >= p) {
        return Err(EngineError::InvalidParameter(format!(
            "excluded column {j} is out of range for {p} columns"
        )));
    }
    if !(0.0..=1.0).contains(&problem.alpha) {
        return Err(EngineError::InvalidParameter(format!(
            "alpha must lie in [0, 1], found {}",
            problem.alpha
        )));
    }
    if problem.weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(EngineError::InvalidParameter(
            "observation weights must be finite and non-negative".to_string(),
        ));
    }
    if problem.weights.iter().sum::<f64>() <= 0.0 {
        return Err(EngineError::InvalidParameter(
            "observation weights sum to zero".to_string(),
        ));
    }
    if problem
        .offset
        .is_some_and(|offset| offset.iter().any(|o| !o.is_finite()))
    {
        return Err(EngineError::InvalidParameter(
            "the offset contains non-finite values".to_string(),
        ));
    }
    if problem
        .penalty_factors
        .iter()
        .any(|pf| !pf.is_finite() || *pf < 0.0)
    {
        return Err(EngineError::InvalidParameter(
            "penalty factors must be finite and non-negative".to_string(),
        ));
    }
    if problem.penalty_factors.iter().all(|pf| *pf <= 0.0) {
        return Err(EngineError::InvalidParameter(
            "at least one penalty factor must be positive".to_string(),
        ));
    }
    match &problem.lambda {
        LambdaSpec::Generated { nlambda, min_ratio } => {
            if *nlambda == 0 {
                return Err(EngineError::InvalidParameter(
                    "nlambda must be at least 1".to_string(),
                ));
            }
            if let Some(ratio) = min_ratio.filter(|r| !(*r > 0.0 && *r < 1.0)) {
                return Err(EngineError::InvalidParameter(format!(
                    "lambda_min_ratio must lie in (0, 1), found {ratio}"
                )));
            }
        }
        LambdaSpec::Values(values) => {
            if values.is_empty() {
                return Err(EngineError::InvalidParameter(
                    "the lambda sequence is empty".to_string(),
                ));
            }
            if values.iter().any(|l| !l.is_finite() || *l < 0.0) {
                return Err(EngineError::InvalidParameter(
                    "lambda values must be finite and non-negative".to_string(),
                ));
            }
        }
    }
    let control = problem.control;
    if control.lower_limit > 0.0 || control.upper_limit < 0.0 || control.lower_limit.is_nan() {
        return Err(EngineError::InvalidParameter(format!(
            "coefficient limits must bracket zero, found [{}, {}]",
            control.lower_limit, control.upper_limit
        )));
    }
    if !(control.thresh > 0.0) || control.maxit == 0 {
        return Err(EngineError::InvalidParameter(
            "thresh and maxit must be positive".to_string(),
        ));
    }
    problem.family.validate_response(problem.y)
}

/// Per-column standardization and usability, computed once per path.
struct Setup<'a> {
    x: &'a DesignMatrix,
    scale: Vec<f64>,
    usable: Vec<bool>,
    penalty: Vec<f64>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    alpha: f64,
    intercept: bool,
    thresh: f64,
}

impl<'a> Setup<'a> {
    fn new(problem: &Problem<'a>, w: &[f64]) -> Self {
        let x = problem.x;
        let p = x.ncols();
        let control = problem.control;
        let mut excluded = vec![false; p];
        for &j in problem.exclude {
            excluded[j] = true;
        }

        let mut scale = vec![1.0; p];
        let mut usable = vec![false; p];
        for j in 0..p {
            let (mut sx, mut sxx) = (0.0, 0.0);
            x.for_each_in_column(j, |i, value| {
                sx += w[i] * value;
                sxx += w[i] * value * value;
            });
            let variance = if control.intercept {
                (sxx - sx * sx).max(0.0)
            } else {
                sxx
            };
            // A constant column carries no information once there is an intercept.
            usable[j] = !excluded[j]
                && if control.intercept {
                    variance > 1e-12 * sxx
                } else {
                    sxx > 0.0
                };
            if control.standardize && usable[j] {
                scale[j] = variance.sqrt();
            }
        }

        let total: f64 = problem.penalty_factors.iter().sum();
        let penalty = problem
            .penalty_factors
            .iter()
            .map(|pf| pf * p as f64 / total)
            .collect();
        let lower = scale.iter().map(|s| control.lower_limit * s).collect();
        let upper = scale.iter().map(|s| control.upper_limit * s).collect();

        Setup {
            x,
            scale,
            usable,
            penalty,
            lower,
            upper,
            alpha: problem.alpha,
            intercept: control.intercept,
            thresh: control.thresh,
        }
    }

    /// `a + X β` for standardized coefficients `beta`.
    fn linear_predictor(&self, state: &State, offset: &[f64]) -> Vec<f64> {
        let original = Array1::from_iter(
            state
                .beta
                .iter()
                .zip(&self.scale)
                .map(|(b, s)| b / s),
        );
        let xb = self.x.matrix_vector_multiply(original.view());
        offset
            .iter()
            .zip(xb.iter())
            .map(|(o, v)| o + state.intercept + v)
            .collect()
    }
}

/// Current coefficients on the standardized scale; the intercept is
/// uncentered.
#[derive(Debug, Clone)]
struct State {
    intercept: f64,
    beta: Vec<f64>,
}

/// Working residual stored as `q[i] + shift`, so that centering a sparse
/// column never touches its zero rows.
struct Residual {
    q: Vec<f64>,
    shift: f64,
    /// `Σ v q`
    vq: f64,
}

/// One penalized weighted least-squares problem:
/// `(1/2) Σ vᵢ (zᵢ - a - Σ βⱼ x̃ᵢⱼ)² + λ Σ pfⱼ [ (1-α)/2 βⱼ² + α |βⱼ| ]`.
struct WeightedLeastSquares<'s, 'a> {
    setup: &'s Setup<'a>,
    v: &'s [f64],
    vsum: f64,
    vx: Vec<f64>,
    center: Vec<f64>,
    xv: Vec<f64>,
    lambda: f64,
}

impl<'s, 'a> WeightedLeastSquares<'s, 'a> {
    fn new(setup: &'s Setup<'a>, v: &'s [f64], lambda: f64) -> Self {
        let p = setup.x.ncols();
        let vsum: f64 = v.iter().sum();
        let mut vx = vec![0.0; p];
        let mut center = vec![0.0; p];
        let mut xv = vec![0.0; p];
        for j in 0..p {
            if !setup.usable[j] {
                continue;
            }
            let s = setup.scale[j];
            let (mut sx, mut sxx) = (0.0, 0.0);
            setup.x.for_each_in_column(j, |i, value| {
                let t = value / s;
                sx += v[i] * t;
                sxx += v[i] * t * t;
            });
            vx[j] = sx;
            if setup.intercept && vsum > 0.0 {
                center[j] = sx / vsum;
                xv[j] = sxx - center[j] * sx;
            } else {
                xv[j] = sxx;
            }
        }
        WeightedLeastSquares {
            setup,
            v,
            vsum,
            vx,
            center,
            xv,
            lambda,
        }
    }

    /// Solves from the warm start in `state`. Returns the passes used and
    /// whether the threshold was met within `budget`.
    fn solve(&self, z: &[f64], state: &mut State, budget: usize) -> (usize, bool) {
        let zeros = vec![0.0; z.len()];
        let fitted = self.setup.linear_predictor(state, &zeros);
        let q: Vec<f64> = z.iter().zip(&fitted).map(|(z, f)| z - f).collect();
        let vq = q.iter().zip(self.v).map(|(q, v)| q * v).sum();
        let mut residual = Residual { q, shift: 0.0, vq };

        let centering: f64 = state
            .beta
            .iter()
            .zip(&self.center)
            .map(|(b, m)| b * m)
            .sum();
        let mut intercept = state.intercept + centering;

        let zbar = if self.setup.intercept && self.vsum > 0.0 {
            z.iter().zip(self.v).map(|(z, v)| z * v).sum::<f64>() / self.vsum
        } else {
            0.0
        };
        let spread: f64 = z
            .iter()
            .zip(self.v)
            .map(|(z, v)| v * (z - zbar).powi(2))
            .sum();
        let tolerance = self.setup.thresh * spread;

        let mut passes = 0;
        let mut converged = false;
        'outer: while passes < budget {
            passes += 1;
            if self.pass(false, state, &mut intercept, &mut residual) <= tolerance {
                converged = true;
                break;
            }
            while passes < budget {
                passes += 1;
                if self.pass(true, state, &mut intercept, &mut residual) <= tolerance {
                    continue 'outer;
                }
            }
        }

        let centering: f64 = state
            .beta
            .iter()
            .zip(&self.center)
            .map(|(b, m)| b * m)
            .sum();
        state.intercept = if self.setup.intercept {
            intercept - centering
        } else {
            0.0
        };
        (passes, converged)
    }

    /// One sweep over the coordinates; returns the largest weighted squared
    /// change.
    fn pass(
        &self,
        active_only: bool,
        state: &mut State,
        intercept: &mut f64,
        residual: &mut Residual,
    ) -> f64 {
        let setup = self.setup;
        let mut largest: f64 = 0.0;
        for j in 0..state.beta.len() {
            if !setup.usable[j] || (active_only && state.beta[j] == 0.0) {
                continue;
            }
            let s = setup.scale[j];
            let mut dot = 0.0;
            setup
                .x
                .for_each_in_column(j, |i, value| dot += self.v[i] * residual.q[i] * value);
            let sum_vr = residual.vq + residual.shift * self.vsum;
            let gradient = dot / s + residual.shift * self.vx[j] - self.center[j] * sum_vr;

            let pf = setup.penalty[j];
            let l1 = self.lambda * setup.alpha * pf;
            let l2 = self.lambda * (1.0 - setup.alpha) * pf;
            let denominator = self.xv[j] + l2;
            if denominator <= 0.0 {
                continue;
            }
            let old = state.beta[j];
            let new = (soft_threshold(gradient + self.xv[j] * old, l1) / denominator)
                .clamp(setup.lower[j], setup.upper[j]);
            let delta = new - old;
            if delta == 0.0 {
                continue;
            }
            state.beta[j] = new;
            let step = delta / s;
            setup
                .x
                .for_each_in_column(j, |i, value| residual.q[i] -= step * value);
            residual.vq -= delta * self.vx[j];
            residual.shift += delta * self.center[j];
            largest = largest.max(self.xv[j] * delta * delta);
        }

        if setup.intercept && self.vsum > 0.0 {
            let delta = (residual.vq + residual.shift * self.vsum) / self.vsum;
            if delta != 0.0 {
                *intercept += delta;
                residual.shift -= delta;
                largest = largest.max(self.vsum * delta * delta);
            }
        }
        largest
    }
}

/// Mean response and working quantities of a GLM at linear predictor `eta`.
fn working_response(
    family: Family,
    y: &[f64],
    w: &[f64],
    offset: &[f64],
    eta: &[f64],
) -> (Vec<f64>, Vec<f64>) {
    let mut v = Vec::with_capacity(y.len());
    let mut z = Vec::with_capacity(y.len());
    for i in 0..y.len() {
        let (mu, variance, e) = match family {
            Family::Gaussian => (eta[i], 1.0, eta[i]),
            Family::Binomial => {
                let mu = family.linkinv(eta[i]).clamp(PROB_EPS, 1.0 - PROB_EPS);
                (mu, mu * (1.0 - mu), eta[i])
            }
            Family::Poisson => {
                let e = eta[i].min(ETA_MAX);
                let mu = e.exp();
                (mu, mu, e)
            }
        };
        v.push(w[i] * variance);
        z.push(e - offset[i] + (y[i] - mu) / variance);
    }
    (v, z)
}

fn fitted_mean(family: Family, eta: f64) -> f64 {
    match family {
        Family::Gaussian => eta,
        Family::Binomial => family.linkinv(eta).clamp(PROB_EPS, 1.0 - PROB_EPS),
        Family::Poisson => eta.min(ETA_MAX).exp(),
    }
}

fn deviance(family: Family, y: &[f64], w: &[f64], eta: &[f64]) -> f64 {
    y.iter()
        .zip(w)
        .zip(eta)
        .map(|((&y, &w), &e)| w * family.unit_deviance(y, fitted_mean(family, e)))
        .sum()
}

/// Intercept-only fit (or offset-only fit without an intercept).
fn null_fit(family: Family, y: &[f64], w: &[f64], offset: &[f64], intercept: bool) -> (f64, f64) {
    let mut a = 0.0;
    if intercept {
        let ybar: f64 = y.iter().zip(w).map(|(y, w)| y * w).sum();
        a = match family {
            Family::Gaussian => y
                .iter()
                .zip(offset)
                .zip(w)
                .map(|((y, o), w)| w * (y - o))
                .sum(),
            Family::Binomial => {
                let p = ybar.clamp(PROB_EPS, 1.0 - PROB_EPS);
                (p / (1.0 - p)).ln()
            }
            Family::Poisson => ybar.max(PROB_EPS).ln(),
        };
        if family != Family::Gaussian {
            for _ in 0..50 {
                let (mut gradient, mut curvature) = (0.0, 0.0);
                for i in 0..y.len() {
                    let mu = fitted_mean(family, offset[i] + a);
                    let variance = if family == Family::Binomial {
                        mu * (1.0 - mu)
                    } else {
                        mu
                    };
                    gradient += w[i] * (y[i] - mu);
                    curvature += w[i] * variance;
                }
                if curvature <= 0.0 {
                    break;
                }
                let step = gradient / curvature;
                a += step;
                if step.abs() < 1e-10 {
                    break;
                }
            }
        }
    }
    let eta: Vec<f64> = offset.iter().map(|o| o + a).collect();
    (a, deviance(family, y, w, &eta))
}

fn solve(problem: &Problem<'_>) -> Result<PathFit, EngineError> {
    validate(problem)?;
    let n = problem.x.nrows();
    let p = problem.x.ncols();
    let family = problem.family;
    let control = problem.control;

    let weight_total: f64 = problem.weights.iter().sum();
    let w: Vec<f64> = problem.weights.iter().map(|wi| wi / weight_total).collect();
    let offset: Vec<f64> = problem
        .offset
        .map_or_else(|| vec![0.0; n], <[f64]>::to_vec);
    let y = problem.y;

    let setup = Setup::new(problem, &w);
    let (null_intercept, null_dev) = null_fit(family, y, &w, &offset, control.intercept);

    let (lambdas, generated) = match &problem.lambda {
        LambdaSpec::Generated { nlambda, min_ratio } => {
            let eta0: Vec<f64> = offset.iter().map(|o| o + null_intercept).collect();
            let mut lambda_max: f64 = 0.0;
            for j in (0..p).filter(|&j| setup.usable[j] && setup.penalty[j] > 0.0) {
                let mut g = 0.0;
                problem.x.for_each_in_column(j, |i, value| {
                    g += w[i] * (y[i] - fitted_mean(family, eta0[i])) * value;
                });
                g /= setup.scale[j];
                lambda_max = lambda_max.max(g.abs() / (problem.alpha.max(ALPHA_FLOOR) * setup.penalty[j]));
            }
            if !(lambda_max > 0.0 && lambda_max.is_finite()) {
                lambda_max = 1.0;
            }
            let ratio = min_ratio.unwrap_or(if n > p { 1e-4 } else { 1e-2 });
            let lambdas: Vec<f64> = if *nlambda == 1 {
                vec![lambda_max]
            } else {
                (0..*nlambda)
                    .map(|l| lambda_max * ratio.powf(l as f64 / (*nlambda - 1) as f64))
                    .collect()
            };
            (lambdas, true)
        }
        LambdaSpec::Values(values) => {
            let mut values = values.clone();
            values.sort_by(|a, b| b.total_cmp(a));
            (values, false)
        }
    };
    log::debug!(
        "Fitting {} path over {} lambda value(s), {} of {} column(s) usable.",
        family,
        lambdas.len(),
        setup.usable.iter().filter(|u| **u).count(),
        p
    );

    let mut state = State {
        intercept: null_intercept,
        beta: vec![0.0; p],
    };
    let mut fitted_lambda = Vec::new();
    let mut a0 = Vec::new();
    let mut columns: Vec<Vec<f64>> = Vec::new();
    let mut df = Vec::new();
    let mut dev_ratio = Vec::new();
    let mut npasses = 0usize;

    for (l, &lambda) in lambdas.iter().enumerate() {
        let budget = control.maxit.saturating_sub(npasses);
        if budget == 0 {
            if fitted_lambda.is_empty() {
                return Err(EngineError::PassBudgetExhausted {
                    maxit: control.maxit,
                });
            }
            log::warn!(
                "Pass budget of {} exhausted; the path stops after {} lambda value(s).",
                control.maxit,
                fitted_lambda.len()
            );
            break;
        }

        // The first generated value zeroes every penalized coefficient exactly.
        let effective = if generated && l == 0 { f64::MAX } else { lambda };
        let (passes, converged) = match family {
            Family::Gaussian => {
                let z: Vec<f64> = y.iter().zip(&offset).map(|(y, o)| y - o).collect();
                WeightedLeastSquares::new(&setup, &w, effective).solve(&z, &mut state, budget)
            }
            Family::Binomial | Family::Poisson => {
                irls(&setup, family, y, &w, &offset, effective, &mut state, budget)
            }
        };
        npasses += passes;
        if !converged {
            log::warn!(
                "Coordinate descent did not converge at lambda {} ({lambda:.4e}).",
                l + 1
            );
        }

        let eta = setup.linear_predictor(&state, &offset);
        let dev = deviance(family, y, &w, &eta);
        let ratio = if null_dev > 0.0 { 1.0 - dev / null_dev } else { 0.0 };
        let nonzero = state.beta.iter().filter(|b| **b != 0.0).count();
        if generated && control.dfmax.is_some_and(|d| nonzero > d) {
            log::info!(
                "Path stopped at lambda {}: {nonzero} non-zero coefficients exceed dfmax.",
                l + 1
            );
            break;
        }

        fitted_lambda.push(lambda);
        a0.push(state.intercept);
        columns.push(
            state
                .beta
                .iter()
                .zip(&setup.scale)
                .map(|(b, s)| b / s)
                .collect(),
        );
        df.push(nonzero);
        let previous = dev_ratio.last().copied();
        dev_ratio.push(ratio);
        log::debug!(
            "lambda {:>3}: {lambda:.5e}  df {nonzero:>4}  %dev {:.2}",
            l + 1,
            100.0 * ratio
        );

        if generated && fitted_lambda.len() >= MIN_PATH_LENGTH {
            if ratio > DEV_RATIO_MAX {
                break;
            }
            if previous.is_some_and(|prev| ratio - prev < DEV_CHANGE_MIN * ratio) {
                break;
            }
        }
    }

    let beta = Array2::from_shape_fn((p, columns.len()), |(j, l)| columns[l][j]);
    Ok(PathFit {
        lambda: fitted_lambda,
        a0,
        beta,
        df,
        dev_ratio,
        null_dev: null_dev * weight_total,
        npasses,
    })
}

#[allow(clippy::too_many_arguments)]
fn irls(
    setup: &Setup<'_>,
    family: Family,
    y: &[f64],
    w: &[f64],
    offset: &[f64],
    lambda: f64,
    state: &mut State,
    budget: usize,
) -> (usize, bool) {
    let mut passes = 0;
    let mut eta = setup.linear_predictor(state, offset);
    let mut previous = deviance(family, y, w, &eta);
    for _ in 0..MAX_IRLS_ITERATIONS {
        let (v, z) = working_response(family, y, w, offset, &eta);
        let (used, converged) = WeightedLeastSquares::new(setup, &v, lambda).solve(
            &z,
            state,
            budget.saturating_sub(passes),
        );
        passes += used;
        if !converged {
            return (passes, false);
        }
        eta = setup.linear_predictor(state, offset);
        let current = deviance(family, y, w, &eta);
        if (previous - current).abs() / (current.abs() + 0.1) < IRLS_TOLERANCE {
            return (passes, true);
        }
        previous = current;
    }
    (passes, false)
}
