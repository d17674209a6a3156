#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use netformula::cv::CvModel;
use netformula::data::{load_frame_for_model, load_frame_with_factors};
use netformula::engine::Family;
use netformula::model::{LambdaSelection, PredictOptions, PredictType};
use netformula::options::{CvOptions, CvaOptions, FitOptions, LossMeasure};
use netformula::{FittedModel, cv, cva, fit};

#[derive(Clone, Copy, ValueEnum)]
enum FamilyCli {
    Gaussian,
    Binomial,
    Poisson,
}

impl From<FamilyCli> for Family {
    fn from(family: FamilyCli) -> Self {
        match family {
            FamilyCli::Gaussian => Family::Gaussian,
            FamilyCli::Binomial => Family::Binomial,
            FamilyCli::Poisson => Family::Poisson,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum PredictTypeCli {
    Link,
    Response,
    Class,
}

#[derive(Clone, Copy, ValueEnum)]
enum MeasureCli {
    Deviance,
    Mse,
    Mae,
    Class,
}

impl From<MeasureCli> for LossMeasure {
    fn from(measure: MeasureCli) -> Self {
        match measure {
            MeasureCli::Deviance => LossMeasure::Deviance,
            MeasureCli::Mse => LossMeasure::Mse,
            MeasureCli::Mae => LossMeasure::Mae,
            MeasureCli::Class => LossMeasure::Class,
        }
    }
}

/// Options shared by `fit`, `cv` and `cva`. Flags override the config file.
#[derive(Args)]
struct FitArgs {
    /// Path to a TSV (or .csv) data file with a header row
    data: String,

    /// Model formula, e.g. "y ~ x1 + log(x2) + g:x1"
    #[arg(long)]
    formula: String,

    /// TOML file with fit options
    #[arg(long, value_name = "PATH")]
    config: Option<String>,

    #[arg(long, value_enum)]
    family: Option<FamilyCli>,

    /// Elastic-net mixing parameter in [0, 1]
    #[arg(long)]
    alpha: Option<f64>,

    #[arg(long, value_name = "N")]
    nlambda: Option<usize>,

    /// Build a sparse model matrix
    #[arg(long)]
    sparse: bool,

    /// Also fit the unpenalized relaxed path
    #[arg(long)]
    relax: bool,

    /// Column of observation weights
    #[arg(long, value_name = "COLUMN")]
    weights: Option<String>,

    /// Column added to the linear predictor
    #[arg(long, value_name = "COLUMN")]
    offset: Option<String>,

    /// Read these columns as factors even if they look numeric
    #[arg(long = "factor", value_name = "COLUMN")]
    factors: Vec<String>,
}

#[derive(Args)]
struct CvArgs {
    #[command(flatten)]
    fit: FitArgs,

    #[arg(long, value_name = "K")]
    nfolds: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum)]
    measure: Option<MeasureCli>,

    /// Run folds on all cores
    #[arg(long)]
    parallel: bool,

    /// Relaxed blend weights to search with --relax
    #[arg(long = "gamma", value_delimiter = ',')]
    gammas: Vec<f64>,
}

#[derive(Parser)]
#[command(
    name = "netformula",
    about = "Elastic-net regression driven by model formulas",
    long_about = "Fits, cross-validates and applies elastic-net regularization paths \
                 described by R-style model formulas over tabular data."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fit a regularization path (outputs: model.toml)")]
    Fit {
        #[command(flatten)]
        args: FitArgs,

        #[arg(long, default_value = "model.toml")]
        output: String,
    },

    #[command(about = "Apply a fitted model to new data (outputs: predictions.tsv)")]
    Predict {
        /// Path to a TSV (or .csv) data file with a header row
        data: String,

        /// Path to trained model file (.toml)
        #[arg(long)]
        model: String,

        #[arg(long = "type", value_enum, default_value_t = PredictTypeCli::Response)]
        kind: PredictTypeCli,

        /// Lambda values to predict at; defaults to the whole path
        #[arg(long, value_delimiter = ',')]
        lambda: Vec<f64>,

        /// Blend between penalized (1) and relaxed (0) coefficients
        #[arg(long, default_value = "1.0")]
        gamma: f64,

        #[arg(long = "factor", value_name = "COLUMN")]
        factors: Vec<String>,

        #[arg(long, default_value = "predictions.tsv")]
        output: String,
    },

    #[command(about = "Print the coefficients of a fitted model as TSV")]
    Coef {
        #[arg(long)]
        model: String,

        #[arg(long, value_delimiter = ',')]
        lambda: Vec<f64>,

        #[arg(long, default_value = "1.0")]
        gamma: f64,
    },

    #[command(about = "Summarize a fitted model's path")]
    Print {
        #[arg(long)]
        model: String,
    },

    #[command(about = "Cross-validate lambda (outputs: model.toml, cv.tsv)")]
    Cv {
        #[command(flatten)]
        args: CvArgs,

        #[arg(long, default_value = "model.toml")]
        output: String,

        /// Loss table path; defaults to cv.tsv next to the model file
        #[arg(long, value_name = "PATH")]
        table: Option<String>,
    },

    #[command(about = "Cross-validate alpha and lambda (outputs: model.toml, cva.tsv)")]
    Cva {
        #[command(flatten)]
        args: CvArgs,

        /// Alpha values to search; defaults to 0, 0.001, ..., 1 (tenths cubed)
        #[arg(long, value_delimiter = ',')]
        alphas: Vec<f64>,

        #[arg(long, default_value = "model.toml")]
        output: String,

        /// Loss table path; defaults to cva.tsv next to the model file
        #[arg(long, value_name = "PATH")]
        table: Option<String>,
    },
}

fn main() {
    env_logger::init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Fit { args, output }) => run_fit(args, &output),
        Some(Commands::Predict {
            data,
            model,
            kind,
            lambda,
            gamma,
            factors,
            output,
        }) => run_predict(&data, &model, kind, lambda, gamma, &factors, &output),
        Some(Commands::Coef {
            model,
            lambda,
            gamma,
        }) => run_coef(&model, lambda, gamma),
        Some(Commands::Print { model }) => {
            FittedModel::load(&model).map(|m| println!("{m}")).map_err(Into::into)
        }
        Some(Commands::Cv {
            args,
            output,
            table,
        }) => run_cv(args, &output, &table_path(&output, table, "cv.tsv")),
        Some(Commands::Cva {
            args,
            alphas,
            output,
            table,
        }) => run_cva(args, alphas, &output, &table_path(&output, table, "cva.tsv")),
        None => {
            let mut command = Cli::command();
            command.print_help().map(|_| println!()).map_err(Into::into)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn fit_options(args: &FitArgs) -> Result<FitOptions, Box<dyn Error>> {
    let mut options = match &args.config {
        Some(path) => FitOptions::from_toml_file(Path::new(path))?,
        None => FitOptions::default(),
    };
    if let Some(family) = args.family {
        options.family = family.into();
    }
    if let Some(alpha) = args.alpha {
        options.alpha = alpha;
    }
    if let Some(nlambda) = args.nlambda {
        options.nlambda = nlambda;
    }
    options.sparse |= args.sparse;
    options.relax |= args.relax;
    if args.weights.is_some() {
        options.weights = args.weights.clone();
    }
    if args.offset.is_some() {
        options.offset = args.offset.clone();
    }
    Ok(options)
}

fn cv_options(args: &CvArgs) -> Result<CvOptions, Box<dyn Error>> {
    let mut options = CvOptions {
        fit: fit_options(&args.fit)?,
        ..CvOptions::default()
    };
    if let Some(nfolds) = args.nfolds {
        options.nfolds = nfolds;
    }
    if let Some(seed) = args.seed {
        options.seed = seed;
    }
    if let Some(measure) = args.measure {
        options.measure = measure.into();
    }
    options.parallel = args.parallel;
    if !args.gammas.is_empty() {
        options.gamma = args.gammas.clone();
    }
    Ok(options)
}

fn lambda_selection(lambda: Vec<f64>) -> LambdaSelection {
    if lambda.is_empty() {
        LambdaSelection::All
    } else {
        LambdaSelection::Values(lambda)
    }
}

fn run_fit(args: FitArgs, output: &str) -> Result<(), Box<dyn Error>> {
    let options = fit_options(&args)?;
    let data = load_frame_with_factors(&args.data, &args.factors)?;
    let model = fit(&args.formula, &data, &options)?;
    println!("{model}");
    model.save(output)?;
    println!("Model saved to: {output}");
    Ok(())
}

fn run_predict(
    data: &str,
    model: &str,
    kind: PredictTypeCli,
    lambda: Vec<f64>,
    gamma: f64,
    factors: &[String],
    output: &str,
) -> Result<(), Box<dyn Error>> {
    let model = FittedModel::load(model)?;
    let newdata = load_frame_for_model(data, factors, &model.factor_columns())?;
    let lambda = lambda_selection(lambda);
    let columns = model.coef(&lambda)?.lambda;
    let header: Vec<String> = columns.iter().map(|l| format!("lambda={l}")).collect();

    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(output)?;
    writer.write_record(&header)?;
    match kind {
        PredictTypeCli::Class => {
            for row in model.predict_labels(&newdata, &lambda)? {
                writer.write_record(row.iter().map(|v| v.as_deref().unwrap_or("NA")))?;
            }
        }
        PredictTypeCli::Link | PredictTypeCli::Response => {
            let options = PredictOptions {
                kind: match kind {
                    PredictTypeCli::Link => PredictType::Link,
                    _ => PredictType::Response,
                },
                lambda,
                gamma,
            };
            write_matrix(&mut writer, &model.predict(&newdata, &options)?)?;
        }
    }
    writer.flush()?;
    println!("Predictions for {} row(s) written to {output}", newdata.nrows());
    Ok(())
}

fn write_matrix<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    values: &Array2<f64>,
) -> Result<(), Box<dyn Error>> {
    for row in values.rows() {
        writer.write_record(row.iter().map(|v| {
            if v.is_nan() {
                "NA".to_string()
            } else {
                v.to_string()
            }
        }))?;
    }
    Ok(())
}

fn run_coef(model: &str, lambda: Vec<f64>, gamma: f64) -> Result<(), Box<dyn Error>> {
    let model = FittedModel::load(model)?;
    let coef = model.coef_with_gamma(&lambda_selection(lambda), gamma)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(std::io::stdout());
    writer.write_record(
        std::iter::once("term".to_string()).chain(coef.lambda.iter().map(|l| format!("lambda={l}"))),
    )?;
    for (name, row) in coef.names.iter().zip(coef.values.rows()) {
        writer.write_record(std::iter::once(name.clone()).chain(row.iter().map(|v| v.to_string())))?;
    }
    writer.flush()?;
    Ok(())
}

/// `--table` when given, otherwise `name` in the model file's directory.
fn table_path(output: &str, table: Option<String>, name: &str) -> PathBuf {
    table.map_or_else(|| Path::new(output).with_file_name(name), PathBuf::from)
}

/// One row per lambda of the penalized path (gamma 1), followed by the relaxed
/// blends when the model was relaxed.
fn write_cv_table(cv: &CvModel, path: &Path) -> Result<(), Box<dyn Error>> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(["lambda", "gamma", "cvm", "cvsd", "cvup", "cvlo", "nzero"])?;
    let mut rows: Vec<(f64, Vec<f64>, Vec<f64>)> = vec![(1.0, cv.cvm.clone(), cv.cvsd.clone())];
    if let Some(relaxed) = &cv.relaxed {
        for (g, &gamma) in relaxed.gamma.iter().enumerate() {
            rows.push((gamma, relaxed.cvm.row(g).to_vec(), relaxed.cvsd.row(g).to_vec()));
        }
    }
    for (gamma, cvm, cvsd) in &rows {
        for i in 0..cv.lambda.len() {
            writer.write_record([
                cv.lambda[i].to_string(),
                gamma.to_string(),
                cvm[i].to_string(),
                cvsd[i].to_string(),
                (cvm[i] + cvsd[i]).to_string(),
                (cvm[i] - cvsd[i]).to_string(),
                cv.nzero[i].to_string(),
            ])?;
        }
    }
    writer.flush()?;
    Ok(())
}

fn run_cv(args: CvArgs, output: &str, table: &Path) -> Result<(), Box<dyn Error>> {
    let options = cv_options(&args)?;
    let data = load_frame_with_factors(&args.fit.data, &args.fit.factors)?;
    let result = cv(&args.fit.formula, &data, &options)?;
    println!("{result}");
    write_cv_table(&result, table)?;
    result.model.save(output)?;
    println!(
        "Loss table written to {}; model saved to: {output}",
        table.display()
    );
    Ok(())
}

fn run_cva(
    args: CvArgs,
    alphas: Vec<f64>,
    output: &str,
    table: &Path,
) -> Result<(), Box<dyn Error>> {
    let options = CvaOptions {
        alphas: (!alphas.is_empty()).then_some(alphas),
        cv: cv_options(&args)?,
    };
    let data = load_frame_with_factors(&args.fit.data, &args.fit.factors)?;
    let result = cva(&args.fit.formula, &data, &options)?;
    println!("{result}");

    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(table)?;
    writer.write_record([
        "alpha",
        "lambda_min",
        "gamma_min",
        "cvm_min",
        "lambda_1se",
        "gamma_1se",
        "cvm_1se",
    ])?;
    for row in result.loss_table() {
        writer.write_record([
            row.alpha.to_string(),
            row.lambda_min.to_string(),
            row.gamma_min.to_string(),
            row.cvm_min.to_string(),
            row.lambda_1se.to_string(),
            row.gamma_1se.to_string(),
            row.cvm_1se.to_string(),
        ])?;
    }
    writer.flush()?;

    let best = result.best();
    result.model_for(best.alpha).model.save(output)?;
    println!(
        "Loss table written to {}; model for alpha = {} saved to: {output}",
        table.display(),
        best.alpha
    );
    Ok(())
}
