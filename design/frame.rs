//! # In-memory data frame
//!
//! The model-matrix builder never touches file formats directly. Everything it
//! consumes is a `Frame`: an ordered collection of equally long, named columns
//! that are either numeric (`NaN` marks a missing value) or categorical
//! (`None` marks a missing value).

use ahash::AHashMap;
use std::collections::BTreeSet;
use thiserror::Error;

/// The two kinds of column a formula can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Numeric,
    Factor,
}

impl ColumnKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Factor => "a factor",
        }
    }
}

/// A single named column of a `Frame`.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<f64>),
    /// Categorical values together with the declared level order.
    /// Every non-missing value is guaranteed to be one of `levels`.
    Factor {
        values: Vec<Option<String>>,
        levels: Vec<String>,
    },
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("column '{column}' has {found} rows, but the frame has {expected}")]
    LengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
    #[error("value '{level}' in column '{column}' is not one of its declared levels")]
    UndeclaredLevel { column: String, level: String },
    #[error("factor column '{0}' declares the same level more than once")]
    DuplicateLevel(String),
    #[error("row index {row} is out of bounds for a frame with {nrows} rows")]
    RowOutOfBounds { row: usize, nrows: usize },
}

impl Column {
    pub fn numeric(values: Vec<f64>) -> Self {
        Column::Numeric(values)
    }

    /// Builds a factor whose levels are the sorted unique non-missing values.
    pub fn factor<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        let values: Vec<Option<String>> = values.into_iter().map(|v| v.map(Into::into)).collect();
        let levels: BTreeSet<&String> = values.iter().flatten().collect();
        let levels = levels.into_iter().cloned().collect();
        Column::Factor { values, levels }
    }

    /// Builds a factor from strings with no missing entries.
    pub fn factor_from_strs(values: &[&str]) -> Self {
        Column::factor(values.iter().map(|v| Some(*v)))
    }

    /// Builds a factor with an explicit level order. Levels may be declared
    /// without being observed.
    pub fn factor_with_levels(
        name: &str,
        values: Vec<Option<String>>,
        levels: Vec<String>,
    ) -> Result<Self, FrameError> {
        let declared: BTreeSet<&String> = levels.iter().collect();
        if declared.len() != levels.len() {
            return Err(FrameError::DuplicateLevel(name.to_string()));
        }
        if let Some(bad) = values.iter().flatten().find(|v| !declared.contains(v)) {
            return Err(FrameError::UndeclaredLevel {
                column: name.to_string(),
                level: bad.clone(),
            });
        }
        Ok(Column::Factor { values, levels })
    }

    /// Logical columns are categorical with levels `FALSE` and `TRUE`.
    pub fn from_bools(values: &[Option<bool>]) -> Self {
        let values = values
            .iter()
            .map(|v| v.map(|b| if b { "TRUE" } else { "FALSE" }.to_string()))
            .collect();
        Column::Factor {
            values,
            levels: vec!["FALSE".to_string(), "TRUE".to_string()],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Factor { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ColumnKind {
        match self {
            Column::Numeric(_) => ColumnKind::Numeric,
            Column::Factor { .. } => ColumnKind::Factor,
        }
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            Column::Numeric(values) => values[row].is_nan(),
            Column::Factor { values, .. } => values[row].is_none(),
        }
    }

    fn select_rows(&self, rows: &[usize]) -> Column {
        match self {
            Column::Numeric(values) => Column::Numeric(rows.iter().map(|&r| values[r]).collect()),
            Column::Factor { values, levels } => Column::Factor {
                values: rows.iter().map(|&r| values[r].clone()).collect(),
                levels: levels.clone(),
            },
        }
    }
}

/// An ordered set of named columns sharing one row count.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    names: Vec<String>,
    columns: AHashMap<String, Column>,
    nrows: usize,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insertion used heavily by tests and callers assembling
    /// frames in code.
    pub fn with_column(mut self, name: &str, column: Column) -> Result<Self, FrameError> {
        self.insert(name, column)?;
        Ok(self)
    }

    /// Adds a column, or replaces an existing one in place.
    pub fn insert(&mut self, name: &str, column: Column) -> Result<(), FrameError> {
        if !self.names.is_empty() && column.len() != self.nrows {
            return Err(FrameError::LengthMismatch {
                column: name.to_string(),
                expected: self.nrows,
                found: column.len(),
            });
        }
        if self.names.is_empty() {
            self.nrows = column.len();
        }
        if !self.columns.contains_key(name) {
            self.names.push(name.to_string());
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.names.len()
    }

    /// Returns a frame holding only `rows`, in the given order. Factor levels
    /// are carried over untouched.
    pub fn select_rows(&self, rows: &[usize]) -> Result<Frame, FrameError> {
        if let Some(&row) = rows.iter().find(|&&r| r >= self.nrows) {
            return Err(FrameError::RowOutOfBounds {
                row,
                nrows: self.nrows,
            });
        }
        let columns = self
            .names
            .iter()
            .map(|name| (name.clone(), self.columns[name].select_rows(rows)))
            .collect();
        Ok(Frame {
            names: self.names.clone(),
            columns,
            nrows: rows.len(),
        })
    }
}
