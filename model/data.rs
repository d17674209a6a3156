//! # Data loading
//!
//! Reads a delimited text file with polars and converts it into a `Frame`.
//! Tab is the separator unless the file ends in `.csv`. `NA` and empty cells
//! are missing values. String columns become factors, boolean columns become
//! `FALSE`/`TRUE` factors and every other column is cast to `f64`.

use crate::design::{Column, Frame, FrameError};
use polars::prelude::{
    CsvParseOptions, CsvReadOptions, CsvReader, DataFrame, DataType, NullValues, PolarsError,
    SerReader,
};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(
        "Column '{column_name}' could not be read as numeric or categorical data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Column '{0}' was requested as a factor but does not exist.")]
    UnknownFactorColumn(String),
}

pub fn load_frame(path: &str) -> Result<Frame, DataError> {
    load_frame_with_factors(path, &[])
}

/// Like `load_frame`, but the named columns are read as factors even when
/// their values look numeric.
pub fn load_frame_with_factors(path: &str, factors: &[String]) -> Result<Frame, DataError> {
    load_frame_for_model(path, factors, &[])
}

/// Reads data for a fitted model. `recorded` are the columns the model saw as
/// factors; they are read as factors wherever present. Every column in
/// `factors` must exist.
pub fn load_frame_for_model(
    path: &str,
    factors: &[String],
    recorded: &[String],
) -> Result<Frame, DataError> {
    let path = Path::new(path);
    let separator = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };
    log::info!("Loading data from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default()
                        .with_separator(separator)
                        .with_null_values(Some(NullValues::AllColumnsSingle("NA".into()))),
                ),
        )
        .finish()?;

    if let Some(missing) = factors
        .iter()
        .find(|f| !df.get_column_names().iter().any(|c| c.as_str() == f.as_str()))
    {
        return Err(DataError::UnknownFactorColumn(missing.clone()));
    }
    let mut as_factors = factors.to_vec();
    as_factors.extend(recorded.iter().filter(|r| !factors.contains(r)).cloned());
    let frame = frame_from_polars(&df, &as_factors)?;
    log::info!(
        "Loaded {} row(s) and {} column(s).",
        frame.nrows(),
        frame.ncols()
    );
    Ok(frame)
}

pub fn frame_from_polars(df: &DataFrame, factors: &[String]) -> Result<Frame, DataError> {
    let mut frame = Frame::new();
    for series in df.get_columns() {
        let name = series.name().as_str();
        let as_factor = factors.iter().any(|f| f == name);
        let column = match series.dtype() {
            DataType::String => {
                Column::factor(series.str()?.into_iter().map(|v| v.map(str::to_string)))
            }
            DataType::Boolean => {
                let values: Vec<Option<bool>> = series.bool()?.into_iter().collect();
                Column::from_bools(&values)
            }
            dtype if as_factor => {
                let text = series.cast(&DataType::String).map_err(|_| {
                    DataError::ColumnWrongType {
                        column_name: name.to_string(),
                        found_type: format!("{dtype:?}"),
                    }
                })?;
                Column::factor(text.str()?.into_iter().map(|v| v.map(str::to_string)))
            }
            dtype => {
                let casted = series.cast(&DataType::Float64).map_err(|_| {
                    DataError::ColumnWrongType {
                        column_name: name.to_string(),
                        found_type: format!("{dtype:?}"),
                    }
                })?;
                Column::numeric(
                    casted
                        .f64()?
                        .into_iter()
                        .map(|v| v.unwrap_or(f64::NAN))
                        .collect(),
                )
            }
        };
        frame.insert(name, column)?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::ColumnKind;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    #[test]
    fn tsv_columns_become_numeric_and_factor() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "y\tx\tgroup\tflag").unwrap();
        writeln!(file, "1.5\t2\tb\ttrue").unwrap();
        writeln!(file, "NA\t3\ta\tfalse").unwrap();
        writeln!(file, "0.5\tNA\tNA\ttrue").unwrap();
        let frame = load_frame(file.path().to_str().unwrap()).unwrap();

        assert_eq!(frame.nrows(), 3);
        assert_eq!(frame.names(), &["y", "x", "group", "flag"]);
        assert_eq!(frame.column("x").unwrap().kind(), ColumnKind::Numeric);
        assert!(frame.column("y").unwrap().is_missing(1));
        assert!(frame.column("x").unwrap().is_missing(2));
        match frame.column("group").unwrap() {
            Column::Factor { values, levels } => {
                assert_eq!(levels, &["a", "b"]);
                assert_eq!(values[2], None);
            }
            other => panic!("expected a factor, got {other:?}"),
        }
        match frame.column("flag").unwrap() {
            Column::Factor { levels, .. } => assert_eq!(levels, &["FALSE", "TRUE"]),
            other => panic!("expected a factor, got {other:?}"),
        }
    }

    #[test]
    fn csv_extension_switches_separator() {
        let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "a,b").unwrap();
        writeln!(file, "1,x").unwrap();
        writeln!(file, "2,y").unwrap();
        let frame = load_frame(file.path().to_str().unwrap()).unwrap();
        assert_eq!(frame.ncols(), 2);
        assert_eq!(frame.column("b").unwrap().kind(), ColumnKind::Factor);
    }

    #[test]
    fn numeric_codes_can_be_read_as_factors() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "y\tbatch").unwrap();
        writeln!(file, "1\t3").unwrap();
        writeln!(file, "2\t1").unwrap();
        let path = file.path().to_str().unwrap();
        let frame = load_frame_with_factors(path, &["batch".to_string()]).unwrap();
        match frame.column("batch").unwrap() {
            Column::Factor { levels, .. } => assert_eq!(levels, &["1", "3"]),
            other => panic!("expected a factor, got {other:?}"),
        }
        assert!(matches!(
            load_frame_with_factors(path, &["nope".to_string()]),
            Err(DataError::UnknownFactorColumn(_))
        ));
    }

    #[test]
    fn recorded_factors_apply_only_where_present() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "x\tbatch").unwrap();
        writeln!(file, "0.5\t2").unwrap();
        writeln!(file, "1.5\t7").unwrap();
        let path = file.path().to_str().unwrap();
        let recorded = ["batch".to_string(), "gone".to_string()];
        let frame = load_frame_for_model(path, &[], &recorded).unwrap();
        assert_eq!(frame.column("batch").unwrap().kind(), ColumnKind::Factor);
        assert_eq!(frame.column("x").unwrap().kind(), ColumnKind::Numeric);
        assert!(matches!(
            load_frame_for_model(path, &["gone".to_string()], &recorded),
            Err(DataError::UnknownFactorColumn(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            load_frame("/definitely/not/here.tsv"),
            Err(DataError::IoError(_))
        ));
    }
}
