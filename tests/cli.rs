use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

/// Forty rows where `y` tracks `x` and the `b` group sits higher.
fn write_training_data(dir: &Path) -> String {
    let mut data = String::from("y\tx\tz\tgroup\n");
    for i in 0..40 {
        let x = (i as f64 - 20.0) / 10.0;
        let z = ((i * 7) % 11) as f64 / 11.0;
        let group = ["a", "b"][i % 2];
        let y = 2.0 * x + if group == "b" { 0.8 } else { 0.0 } + 0.05 * ((i * 3) % 5) as f64;
        writeln!(data, "{y}\t{x}\t{z}\t{group}").expect("format row");
    }
    let path = dir.join("train.tsv");
    fs::write(&path, data).expect("write training data");
    path.to_str().expect("path str").to_string()
}

fn run(dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_netformula"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run netformula cli")
}

#[test]
fn fit_then_predict_writes_one_row_per_input_row() {
    let tmp = tempdir().expect("temporary directory");
    let training = write_training_data(tmp.path());

    let fitted = run(
        tmp.path(),
        &["fit", &training, "--formula", "y ~ x + z + group", "--nlambda", "15"],
    );
    assert!(fitted.status.success(), "{}", String::from_utf8_lossy(&fitted.stderr));
    assert!(tmp.path().join("model.toml").exists(), "model.toml missing");

    let newdata = tmp.path().join("new.tsv");
    fs::write(&newdata, "x\tz\tgroup\n0.5\t0.1\ta\n-1.0\tNA\tb\n").expect("write new data");
    let predicted = run(
        tmp.path(),
        &[
            "predict",
            newdata.to_str().expect("path str"),
            "--model",
            "model.toml",
            "--lambda",
            "0.01",
        ],
    );
    assert!(predicted.status.success(), "{}", String::from_utf8_lossy(&predicted.stderr));

    let output = fs::read_to_string(tmp.path().join("predictions.tsv")).expect("read predictions");
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "lambda=0.01");
    assert!(lines[1].parse::<f64>().is_ok());
    assert_eq!(lines[2], "NA");

    let coef = run(tmp.path(), &["coef", "--model", "model.toml", "--lambda", "0.01"]);
    assert!(coef.status.success());
    let table = String::from_utf8_lossy(&coef.stdout);
    assert!(table.starts_with("term\tlambda=0.01"));
    assert!(table.contains("(Intercept)\t"));
    assert!(table.contains("groupb\t"));
}

#[test]
fn unseen_level_exits_with_an_error() {
    let tmp = tempdir().expect("temporary directory");
    let training = write_training_data(tmp.path());
    let fitted = run(tmp.path(), &["fit", &training, "--formula", "y ~ x + group"]);
    assert!(fitted.status.success());

    let newdata = tmp.path().join("new.tsv");
    fs::write(&newdata, "x\tgroup\n0.5\tc\n").expect("write new data");
    let predicted = run(
        tmp.path(),
        &["predict", newdata.to_str().expect("path str"), "--model", "model.toml"],
    );
    assert!(!predicted.status.success());
    let stderr = String::from_utf8_lossy(&predicted.stderr);
    assert!(stderr.contains("'c'"), "{stderr}");
}

#[test]
fn cv_writes_the_loss_table() {
    let tmp = tempdir().expect("temporary directory");
    let training = write_training_data(tmp.path());
    let result = run(
        tmp.path(),
        &[
            "cv",
            &training,
            "--formula",
            "y ~ .",
            "--nfolds",
            "4",
            "--nlambda",
            "10",
            "--parallel",
        ],
    );
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    let table = fs::read_to_string(tmp.path().join("cv.tsv")).expect("read cv table");
    assert!(table.starts_with("lambda\tgamma\tcvm\tcvsd"));
    assert!(table.lines().count() > 1);
    assert!(String::from_utf8_lossy(&result.stdout).contains("Mean-Squared Error"));
}

#[test]
fn numeric_codes_fit_as_factors_stay_factors_at_prediction() {
    let tmp = tempdir().expect("temporary directory");
    let mut data = String::from("y\tx\tbatch\n");
    for i in 0..30 {
        let x = i as f64 / 10.0;
        let batch = 1 + i % 3;
        writeln!(data, "{}\t{x}\t{batch}", x + batch as f64 * 0.5).expect("format row");
    }
    let training = tmp.path().join("train.tsv");
    fs::write(&training, data).expect("write training data");

    let fitted = run(
        tmp.path(),
        &[
            "fit",
            training.to_str().expect("path str"),
            "--formula",
            "y ~ x + batch",
            "--factor",
            "batch",
        ],
    );
    assert!(fitted.status.success(), "{}", String::from_utf8_lossy(&fitted.stderr));

    let newdata = tmp.path().join("new.tsv");
    fs::write(&newdata, "x\tbatch\n0.5\t2\n1.0\t3\n").expect("write new data");
    let predicted = run(
        tmp.path(),
        &[
            "predict",
            newdata.to_str().expect("path str"),
            "--model",
            "model.toml",
            "--lambda",
            "0.01",
        ],
    );
    assert!(predicted.status.success(), "{}", String::from_utf8_lossy(&predicted.stderr));
    let output = fs::read_to_string(tmp.path().join("predictions.tsv")).expect("read predictions");
    assert_eq!(output.lines().count(), 3);
}

#[test]
fn loss_tables_follow_the_output_location() {
    let tmp = tempdir().expect("temporary directory");
    let training = write_training_data(tmp.path());
    fs::create_dir(tmp.path().join("out")).expect("create output directory");

    let result = run(
        tmp.path(),
        &[
            "cv",
            &training,
            "--formula",
            "y ~ x + group",
            "--nfolds",
            "4",
            "--nlambda",
            "10",
            "--output",
            "out/model.toml",
        ],
    );
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    assert!(tmp.path().join("out/cv.tsv").exists());
    assert!(!tmp.path().join("cv.tsv").exists());

    let result = run(
        tmp.path(),
        &[
            "cva",
            &training,
            "--formula",
            "y ~ x + group",
            "--nfolds",
            "4",
            "--nlambda",
            "10",
            "--alphas",
            "0.5,1",
            "--output",
            "out/model.toml",
            "--table",
            "out/search.tsv",
        ],
    );
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    let table = fs::read_to_string(tmp.path().join("out/search.tsv")).expect("read cva table");
    assert!(table.starts_with("alpha\tlambda_min\tgamma_min"));
    assert_eq!(table.lines().count(), 3);
    assert!(!tmp.path().join("cva.tsv").exists());
}

#[test]
fn relaxed_cv_writes_one_block_per_gamma() {
    let tmp = tempdir().expect("temporary directory");
    let training = write_training_data(tmp.path());
    let result = run(
        tmp.path(),
        &[
            "cv",
            &training,
            "--formula",
            "y ~ x + z + group",
            "--nfolds",
            "4",
            "--nlambda",
            "8",
            "--relax",
            "--gamma",
            "0,0.5",
        ],
    );
    assert!(result.status.success(), "{}", String::from_utf8_lossy(&result.stderr));
    let table = fs::read_to_string(tmp.path().join("cv.tsv")).expect("read cv table");
    let rows = table.lines().count() - 1;
    assert_eq!(rows % 3, 0, "{table}");
    assert!(table.lines().skip(1).any(|line| line.split('\t').nth(1) == Some("0.5")));
    assert!(String::from_utf8_lossy(&result.stdout).contains("Gamma"));
}
