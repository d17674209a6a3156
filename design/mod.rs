//! # Model matrix construction
//!
//! Formula → terms → per-term blocks → one dense or sparse matrix. The
//! `DesignSpec` produced at fit time captures everything needed to rebuild a
//! structurally identical matrix from new data: the expanded terms, the factor
//! levels, the column layout and the construction options.

pub mod builder;
pub mod formula;
pub mod frame;
pub mod levels;
pub mod matrix;
pub mod terms;

pub use formula::{Formula, FormulaError, Transform, Variable};
pub use frame::{Column, ColumnKind, Frame, FrameError};
pub use levels::{LevelMap, UnseenLevels};
pub use matrix::DesignMatrix;
pub use terms::{Term, Terms};

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("Variable '{0}' was not found in the data.")]
    MissingVariable(String),
    #[error(
        "Factor '{variable}' has level '{level}', which was not present when the model was fit."
    )]
    UnseenLevel { variable: String, level: String },
    #[error("Variable '{variable}' was {expected} when the model was fit, but is {found} in this data.")]
    KindMismatch {
        variable: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("Transform '{transform}' cannot be applied to factor '{variable}'.")]
    TransformOnFactor {
        variable: String,
        transform: &'static str,
    },
    #[error("The rebuilt model matrix does not match the fitted layout: {0}")]
    LayoutMismatch(String),
    #[error("Failed to assemble the sparse model matrix: {0}")]
    SparseAssembly(String),
}

/// How factors are expanded into indicator columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConstructionMode {
    /// Every factor keeps one column per level in every term.
    #[default]
    TermByTerm,
    /// Conventional model-frame coding: treatment contrasts chosen by marginality.
    ModelFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignOptions {
    pub sparse: bool,
    pub mode: ConstructionMode,
    pub unseen_levels: UnseenLevels,
}

/// Columns belonging to one term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TermColumns {
    pub label: String,
    pub columns: Range<usize>,
}

/// Column names in order, with the range each term occupies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnLayout {
    pub names: Vec<String>,
    pub terms: Vec<TermColumns>,
}

impl ColumnLayout {
    fn from_blocks(terms: &Terms, blocks: &[builder::Block]) -> Self {
        let mut names = Vec::new();
        let mut ranges = Vec::with_capacity(blocks.len());
        for (term, block) in terms.terms.iter().zip(blocks) {
            let start = names.len();
            names.extend(block.names.iter().cloned());
            ranges.push(TermColumns {
                label: terms.label(term),
                columns: start..names.len(),
            });
        }
        ColumnLayout {
            names,
            terms: ranges,
        }
    }

    pub fn ncols(&self) -> usize {
        self.names.len()
    }

    /// Columns selected by a column name or, failing that, a term label.
    pub fn resolve(&self, name: &str) -> Option<Range<usize>> {
        if let Some(i) = self.names.iter().position(|n| n == name) {
            return Some(i..i + 1);
        }
        self.terms
            .iter()
            .find(|t| t.label == name)
            .map(|t| t.columns.clone())
    }

    fn ensure_same(&self, rebuilt: &ColumnLayout) -> Result<(), DesignError> {
        if self.names.len() != rebuilt.names.len() {
            return Err(DesignError::LayoutMismatch(format!(
                "expected {} columns, built {}",
                self.names.len(),
                rebuilt.names.len()
            )));
        }
        if let Some((i, (a, b))) = self
            .names
            .iter()
            .zip(&rebuilt.names)
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            return Err(DesignError::LayoutMismatch(format!(
                "column {} is '{a}' in the fitted model but '{b}' in the new data",
                i + 1
            )));
        }
        Ok(())
    }
}

/// Everything needed to replay matrix construction on new data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignSpec {
    pub options: DesignOptions,
    pub terms: Terms,
    pub levels: LevelMap,
    pub layout: ColumnLayout,
}

impl DesignSpec {
    /// Records levels and layout from the fitting data and builds its matrix.
    pub fn fit(
        terms: Terms,
        frame: &Frame,
        options: DesignOptions,
    ) -> Result<(Self, DesignMatrix), DesignError> {
        let levels = LevelMap::record(&terms, frame)?;
        let blocks = builder::build_blocks(
            &terms,
            &levels,
            frame,
            options.mode,
            UnseenLevels::Error,
        )?;
        let layout = ColumnLayout::from_blocks(&terms, &blocks);
        let matrix = matrix::assemble(frame.nrows(), &blocks, options.sparse)?;
        log::debug!(
            "Built {}x{} {} model matrix from {} term(s).",
            matrix.nrows(),
            matrix.ncols(),
            if matrix.is_sparse() { "sparse" } else { "dense" },
            terms.terms.len()
        );
        Ok((
            DesignSpec {
                options,
                terms,
                levels,
                layout,
            },
            matrix,
        ))
    }

    /// Rebuilds the matrix for new data using the recorded levels, failing if
    /// the result would not line up column for column with the fitted layout.
    pub fn rebuild(&self, frame: &Frame) -> Result<DesignMatrix, DesignError> {
        self.levels.check_kinds(&self.terms, frame)?;
        let blocks = builder::build_blocks(
            &self.terms,
            &self.levels,
            frame,
            self.options.mode,
            self.options.unseen_levels,
        )?;
        self.layout
            .ensure_same(&ColumnLayout::from_blocks(&self.terms, &blocks))?;
        matrix::assemble(frame.nrows(), &blocks, self.options.sparse)
    }

    /// Sum of the formula's `offset(...)` columns, if it names any.
    pub fn formula_offset(&self, frame: &Frame) -> Result<Option<Array1<f64>>, DesignError> {
        Ok(builder::formula_offset(&self.terms, frame)?.map(Array1::from))
    }

    /// Rows whose predictors and offsets are all present.
    pub fn complete_rows(&self, frame: &Frame) -> Result<Vec<bool>, DesignError> {
        builder::complete_rows(frame, &self.terms.predictor_columns())
    }
}

/// Convenience entry point: expand `formula` against `frame` and build its matrix.
pub fn model_matrix(
    formula: &str,
    frame: &Frame,
    options: DesignOptions,
) -> Result<(DesignSpec, DesignMatrix), DesignError> {
    let terms = Terms::from_formula(formula, Some(frame.names()), &[])?;
    DesignSpec::fit(terms, frame, options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn training() -> Frame {
        Frame::new()
            .with_column("y", Column::numeric(vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap()
            .with_column("x", Column::numeric(vec![0.5, 1.5, 2.5, 3.5]))
            .unwrap()
            .with_column("g", Column::factor_from_strs(&["a", "b", "c", "a"]))
            .unwrap()
    }

    #[test]
    fn layout_records_term_ranges() {
        let (spec, matrix) =
            model_matrix("y ~ x * g", &training(), DesignOptions::default()).unwrap();
        assert_eq!(matrix.ncols(), 7);
        assert_eq!(spec.layout.names[4..], ["x:ga", "x:gb", "x:gc"]);
        assert_eq!(spec.layout.resolve("g"), Some(1..4));
        assert_eq!(spec.layout.resolve("x:gb"), Some(5..6));
        assert_eq!(spec.layout.resolve("zzz"), None);
    }

    #[test]
    fn rebuild_matches_fit_layout_on_identical_data() {
        for sparse in [false, true] {
            let options = DesignOptions {
                sparse,
                ..DesignOptions::default()
            };
            let (spec, fitted) = model_matrix("y ~ x + g + x:g", &training(), options).unwrap();
            let rebuilt = spec.rebuild(&training()).unwrap();
            assert_eq!(rebuilt.ncols(), fitted.ncols());
            assert_eq!(rebuilt.to_dense(), fitted.to_dense());
        }
    }

    #[test]
    fn rebuild_uses_recorded_levels_for_partial_data() {
        let (spec, _) = model_matrix("y ~ g", &training(), DesignOptions::default()).unwrap();
        let new = Frame::new()
            .with_column("g", Column::factor_from_strs(&["c"]))
            .unwrap();
        let x = spec.rebuild(&new).unwrap().to_dense();
        assert_eq!(x.row(0).to_vec(), vec![0.0, 0.0, 1.0]);
    }

    #[test]
    fn rebuild_rejects_unseen_level() {
        let (spec, _) = model_matrix("y ~ g", &training(), DesignOptions::default()).unwrap();
        let new = Frame::new()
            .with_column("g", Column::factor_from_strs(&["a", "d"]))
            .unwrap();
        assert!(matches!(
            spec.rebuild(&new),
            Err(DesignError::UnseenLevel { .. })
        ));
    }

    #[test]
    fn layout_mismatch_is_reported() {
        let (spec, _) = model_matrix("y ~ g", &training(), DesignOptions::default()).unwrap();
        let mut tampered = spec.clone();
        tampered.layout.names[1] = "gz".to_string();
        match tampered.rebuild(&training()).unwrap_err() {
            DesignError::LayoutMismatch(detail) => assert!(detail.contains("gz")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
