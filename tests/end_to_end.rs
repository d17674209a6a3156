use approx::assert_abs_diff_eq;
use ndarray::s;
use netformula::design::{Column, DesignError, Frame};
use netformula::engine::{
    CoordinateDescent, ElasticNetEngine, EngineError, EngineVersion, Family, PathFit, Problem,
};
use netformula::model::{LambdaSelection, ModelError, PredictOptions, PredictType};
use netformula::options::{CvOptions, CvaOptions, FitOptions, LossMeasure};
use netformula::{CvError, FitError, FittedModel, cv, cv_with_engine, cva, fit, fit_with_engine};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::Mutex;
use tempfile::tempdir;

const GROUPS: [&str; 4] = ["north", "south", "east", "west"];

/// Gaussian response driven by two of three numeric columns and one factor.
fn simulate(n: usize, seed: u64) -> Frame {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let x1: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let x2: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let x3: Vec<f64> = (0..n).map(|_| normal.sample(&mut rng)).collect();
    let region: Vec<&str> = (0..n).map(|_| GROUPS[rng.gen_range(0..4)]).collect();
    let y: Vec<f64> = (0..n)
        .map(|i| {
            let shift = if region[i] == "south" { 1.0 } else { 0.0 };
            3.0 * x1[i] - 2.0 * x2[i] + shift + 0.5 * normal.sample(&mut rng)
        })
        .collect();
    let count: Vec<f64> = (0..n)
        .map(|i| (0.4 * x1[i] + 1.0).exp().round())
        .collect();
    let outcome: Vec<&str> = (0..n)
        .map(|i| {
            if x1[i] + 2.0 * normal.sample(&mut rng) > 0.0 {
                "case"
            } else {
                "control"
            }
        })
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
        .with_column("region", Column::factor_from_strs(&region))
        .unwrap()
        .with_column("count", Column::numeric(count))
        .unwrap()
        .with_column("outcome", Column::factor_from_strs(&outcome))
        .unwrap()
}

fn options() -> FitOptions {
    FitOptions {
        nlambda: 30,
        ..FitOptions::default()
    }
}

#[test]
fn prediction_rebuilds_the_fitted_layout() {
    let data = simulate(120, 1);
    let model = fit("y ~ x1 + x2 + region + region:x1", &data, &options()).unwrap();
    assert_eq!(
        model.column_names()[..5],
        ["x1", "x2", "regioneast", "regionnorth", "regionsouth"]
    );

    // A reordered subset with only three regions present still gets every column.
    let Some(Column::Factor { values: region, .. }) = data.column("region") else {
        panic!("region should be a factor");
    };
    let rows: Vec<usize> = (0..120)
        .rev()
        .filter(|&i| region[i].as_deref() != Some("west"))
        .collect();
    let subset = data.select_rows(&rows).unwrap();
    let rebuilt = model.design.rebuild(&subset).unwrap();
    assert_eq!(rebuilt.ncols(), model.column_names().len());

    let full = model.predict(&data, &PredictOptions::default()).unwrap();
    let partial = model.predict(&subset, &PredictOptions::default()).unwrap();
    for (k, &row) in rows.iter().enumerate() {
        for l in 0..full.ncols() {
            assert_abs_diff_eq!(partial[[k, l]], full[[row, l]], epsilon = 1e-12);
        }
    }
}

#[test]
fn unseen_level_at_prediction_fails() {
    let data = simulate(80, 2);
    let model = fit("y ~ x1 + region", &data, &options()).unwrap();
    let newdata = Frame::new()
        .with_column("x1", Column::numeric(vec![0.0, 1.0]))
        .unwrap()
        .with_column("region", Column::factor_from_strs(&["north", "central"]))
        .unwrap();
    match model.predict(&newdata, &PredictOptions::default()) {
        Err(ModelError::Design(DesignError::UnseenLevel { variable, level })) => {
            assert_eq!(variable, "region");
            assert_eq!(level, "central");
        }
        other => panic!("expected an unseen level error, got {other:?}"),
    }
}

/// Delegates to the bundled engine and keeps a copy of what it returned.
struct RecordingEngine {
    seen: Mutex<Vec<PathFit>>,
}

impl ElasticNetEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn version(&self) -> EngineVersion {
        CoordinateDescent.version()
    }

    fn fit(&self, problem: &Problem<'_>) -> Result<PathFit, EngineError> {
        let path = CoordinateDescent.fit(problem)?;
        self.seen.lock().unwrap().push(path.clone());
        Ok(path)
    }
}

#[test]
fn coefficients_are_the_engine_output_unchanged() {
    let data = simulate(100, 3);
    let engine = RecordingEngine {
        seen: Mutex::new(Vec::new()),
    };
    let model = fit_with_engine("y ~ x1 + x2 + x3", &data, &options(), &engine).unwrap();
    let seen = engine.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(model.path, seen[0]);
    assert_eq!(model.engine.name, "recording");

    let coef = model.coef(&LambdaSelection::All).unwrap();
    assert_eq!(coef.lambda, seen[0].lambda);
    for l in 0..seen[0].len() {
        assert_eq!(coef.values[[0, l]], seen[0].a0[l]);
        assert_eq!(coef.values.slice(s![1.., l]), seen[0].beta.column(l));
    }
}

/// Reports a version that predates relaxed fits.
struct LegacyEngine;

impl ElasticNetEngine for LegacyEngine {
    fn name(&self) -> &str {
        "legacy"
    }

    fn version(&self) -> EngineVersion {
        EngineVersion::new(1, 0, 3)
    }

    fn fit(&self, problem: &Problem<'_>) -> Result<PathFit, EngineError> {
        CoordinateDescent.fit(problem)
    }
}

#[test]
fn relax_on_an_old_engine_names_the_required_version() {
    let data = simulate(60, 4);
    let relaxed = FitOptions {
        relax: true,
        ..options()
    };
    let err = fit_with_engine("y ~ x1 + x2", &data, &relaxed, &LegacyEngine).unwrap_err();
    assert!(matches!(err, FitError::EngineTooOld { feature: "relax", .. }));
    assert!(err.to_string().contains("1.1.0"));

    let cv_options = CvOptions {
        fit: relaxed,
        ..CvOptions::default()
    };
    assert!(matches!(
        cv_with_engine("y ~ x1 + x2", &data, &cv_options, &LegacyEngine),
        Err(CvError::Fit(FitError::EngineTooOld { .. }))
    ));

    // Without relax the old engine is fine.
    assert!(fit_with_engine("y ~ x1 + x2", &data, &options(), &LegacyEngine).is_ok());
}

#[test]
fn sparse_and_dense_matrices_fit_the_same_path() {
    let data = simulate(150, 5);
    let formula = "y ~ x1 + x2 + x3 + region + region:x2";
    let dense = fit(formula, &data, &options()).unwrap();
    let sparse = fit(
        formula,
        &data,
        &FitOptions {
            sparse: true,
            ..options()
        },
    )
    .unwrap();
    assert_eq!(dense.path.lambda.len(), sparse.path.lambda.len());
    for (a, b) in dense.path.lambda.iter().zip(&sparse.path.lambda) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
    }
    for (a, b) in dense.path.beta.iter().zip(sparse.path.beta.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
    assert_eq!(dense.path.df, sparse.path.df);
}

#[test]
fn saved_model_predicts_identically() {
    let data = simulate(90, 6);
    let model = fit(
        "outcome ~ x1 + x2 + region",
        &data,
        &FitOptions {
            family: Family::Binomial,
            relax: true,
            ..options()
        },
    )
    .unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.toml");
    let path = path.to_str().unwrap();
    model.save(path).unwrap();
    let loaded = FittedModel::load(path).unwrap();

    let predict = PredictOptions {
        kind: PredictType::Response,
        lambda: LambdaSelection::Values(vec![0.05, 0.01]),
        gamma: 0.5,
    };
    let before = model.predict(&data, &predict).unwrap();
    let after = loaded.predict(&data, &predict).unwrap();
    assert_eq!(before, after);
    assert_eq!(
        model.predict_labels(&data, &LambdaSelection::All).unwrap(),
        loaded.predict_labels(&data, &LambdaSelection::All).unwrap()
    );
    assert_eq!(
        loaded.response_levels,
        Some(vec!["case".to_string(), "control".to_string()])
    );
}

#[test]
fn parallel_and_serial_cross_validation_agree() {
    let data = simulate(100, 7);
    let serial = CvOptions {
        nfolds: 5,
        fit: options(),
        ..CvOptions::default()
    };
    let parallel = CvOptions {
        parallel: true,
        ..serial.clone()
    };
    let a = cv("y ~ x1 + x2 + x3 + region", &data, &serial).unwrap();
    let b = cv("y ~ x1 + x2 + x3 + region", &data, &parallel).unwrap();
    assert_eq!(a.cvm, b.cvm);
    assert_eq!(a.lambda_min, b.lambda_min);
    assert_eq!(a.lambda_1se, b.lambda_1se);

    let grid = CvaOptions {
        alphas: Some(vec![0.25, 1.0]),
        cv: serial.clone(),
    };
    let c = cva("y ~ x1 + x2 + x3 + region", &data, &grid).unwrap();
    let d = cva(
        "y ~ x1 + x2 + x3 + region",
        &data,
        &CvaOptions {
            cv: parallel,
            ..grid
        },
    )
    .unwrap();
    assert_eq!(c.best(), d.best());
}

#[test]
fn poisson_cross_validation_prefers_the_signal() {
    let data = simulate(200, 8);
    let result = cv(
        "count ~ x1 + x2 + x3",
        &data,
        &CvOptions {
            nfolds: 5,
            measure: LossMeasure::Deviance,
            fit: FitOptions {
                family: Family::Poisson,
                ..options()
            },
            ..CvOptions::default()
        },
    )
    .unwrap();
    let coef = result.coef(netformula::LambdaChoice::Min).unwrap();
    assert!(coef.get("x1", 0).unwrap() > 0.2);
    assert!(result.cvm[result.index_min] < result.cvm[0]);
}

#[test]
fn formula_errors_name_the_offending_token() {
    let data = simulate(20, 9);
    let message = fit("y ~ x1 + $x2", &data, &options()).unwrap_err().to_string();
    assert!(message.contains("'$'"), "{message}");
    let message = fit("y ~ x1 + spline(x2)", &data, &options())
        .unwrap_err()
        .to_string();
    assert!(message.contains("spline"), "{message}");
}
