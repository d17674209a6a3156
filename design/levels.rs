//! Factor levels recorded at fit time and replayed verbatim at prediction time.

use crate::design::DesignError;
use crate::design::formula::Variable;
use crate::design::frame::{Column, ColumnKind, Frame};
use crate::design::terms::Terms;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with a factor value at prediction time that was not a level
/// when the model was fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnseenLevels {
    /// Fail before any prediction is computed.
    #[default]
    Error,
    /// Encode the row with all indicator columns of that factor set to zero.
    ZeroFill,
}

/// Per categorical variable, the ordered levels seen during fitting. Numeric
/// variables are absent from the map, which is how prediction detects a
/// column that changed kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelMap {
    levels: BTreeMap<String, Vec<String>>,
}

impl LevelMap {
    /// Records the declared levels of every factor the terms reference and
    /// checks that variables are present and transforms are only applied to
    /// numeric columns.
    pub fn record(terms: &Terms, frame: &Frame) -> Result<Self, DesignError> {
        let mut levels = BTreeMap::new();
        for var in &terms.variables {
            match lookup(frame, var)? {
                Column::Factor { levels: declared, .. } => {
                    if let Some(t) = var.transform {
                        return Err(DesignError::TransformOnFactor {
                            variable: var.column.clone(),
                            transform: t.name(),
                        });
                    }
                    levels.insert(var.label(), declared.clone());
                }
                Column::Numeric(_) => {}
            }
        }
        Ok(LevelMap { levels })
    }

    pub fn get(&self, variable: &str) -> Option<&[String]> {
        self.levels.get(variable).map(Vec::as_slice)
    }

    /// Factor variables in name order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.levels.keys().map(String::as_str)
    }

    pub fn is_factor(&self, variable: &str) -> bool {
        self.levels.contains_key(variable)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Checks a new frame against the recorded kinds so that a numeric column
    /// arriving as text (or the reverse) fails before any matrix is built.
    pub fn check_kinds(&self, terms: &Terms, frame: &Frame) -> Result<(), DesignError> {
        for var in &terms.variables {
            let found = lookup(frame, var)?.kind();
            let expected = if self.is_factor(&var.label()) {
                ColumnKind::Factor
            } else {
                ColumnKind::Numeric
            };
            if found != expected {
                return Err(DesignError::KindMismatch {
                    variable: var.label(),
                    expected: expected.as_str(),
                    found: found.as_str(),
                });
            }
        }
        Ok(())
    }

    /// Hash index from level text to its position, built once per block.
    pub(crate) fn index(&self, variable: &str) -> Option<AHashMap<&str, usize>> {
        self.levels.get(variable).map(|levels| {
            levels
                .iter()
                .enumerate()
                .map(|(i, l)| (l.as_str(), i))
                .collect()
        })
    }
}

pub(crate) fn lookup<'f>(frame: &'f Frame, var: &Variable) -> Result<&'f Column, DesignError> {
    frame
        .column(&var.column)
        .ok_or_else(|| DesignError::MissingVariable(var.column.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame::new()
            .with_column("x", Column::numeric(vec![1.0, 2.0, 3.0]))
            .unwrap()
            .with_column("g", Column::factor_from_strs(&["b", "a", "b"]))
            .unwrap()
    }

    #[test]
    fn records_only_factors() {
        let terms = Terms::from_formula("y ~ x + g", None, &[]).unwrap();
        let map = LevelMap::record(&terms, &frame()).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("g").unwrap(), &["a".to_string(), "b".to_string()]);
        assert!(!map.is_factor("x"));
        assert_eq!(map.variables().collect::<Vec<_>>(), vec!["g"]);
    }

    #[test]
    fn transform_on_factor_is_rejected() {
        let terms = Terms::from_formula("y ~ log(g)", None, &[]).unwrap();
        assert!(matches!(
            LevelMap::record(&terms, &frame()),
            Err(DesignError::TransformOnFactor { .. })
        ));
    }

    #[test]
    fn missing_variable_is_named() {
        let terms = Terms::from_formula("y ~ x + h", None, &[]).unwrap();
        match LevelMap::record(&terms, &frame()).unwrap_err() {
            DesignError::MissingVariable(name) => assert_eq!(name, "h"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn kind_changes_are_detected() {
        let terms = Terms::from_formula("y ~ x + g", None, &[]).unwrap();
        let map = LevelMap::record(&terms, &frame()).unwrap();
        let swapped = Frame::new()
            .with_column("x", Column::factor_from_strs(&["1", "2"]))
            .unwrap()
            .with_column("g", Column::factor_from_strs(&["a", "b"]))
            .unwrap();
        match map.check_kinds(&terms, &swapped).unwrap_err() {
            DesignError::KindMismatch {
                variable,
                expected,
                found,
            } => {
                assert_eq!(variable, "x");
                assert_eq!(expected, "numeric");
                assert_eq!(found, "a factor");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
