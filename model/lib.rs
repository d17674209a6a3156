//! Formula and data-frame front end for elastic-net regularization paths.
//!
//! `design` turns a formula and a `Frame` into a model matrix and remembers
//! enough to rebuild the same layout on new data. The remaining modules fit,
//! cross-validate and persist models on top of an `ElasticNetEngine`.

#[path = "../design/mod.rs"]
pub mod design;

pub mod cv;
pub mod cva;
pub mod data;
pub mod engine;
pub mod fit;
pub mod model;
pub mod options;

pub use cv::{CvError, CvModel, LambdaChoice, RelaxedCv, cv, cv_with_engine};
pub use cva::{AlphaLoss, BestFit, CvaModel, cva, cva_with_engine};
pub use data::{DataError, load_frame};
pub use design::{Column, DesignMatrix, Frame, model_matrix};
pub use engine::{CoordinateDescent, ElasticNetEngine, EngineVersion, Family};
pub use fit::{FitError, fit, fit_with_engine};
pub use model::{Coefficients, FittedModel, ModelError, PredictOptions, PredictType};
pub use options::{CvOptions, CvaOptions, FitOptions};
