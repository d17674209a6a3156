//! # Per-term matrix builder
//!
//! Each term of the formula becomes one block of columns, built without ever
//! materializing a full model frame:
//!
//! - a numeric variable is a single dense column;
//! - a factor is a set of sparse indicator columns, one per recorded level
//!   (or one per level after the first when coded by contrasts);
//! - an interaction is the row-wise product of its variables' blocks, with the
//!   first variable varying fastest.
//!
//! Factor columns stay sparse all the way to the assembler, so a factor with
//! thousands of levels costs one entry per row rather than one per cell.

use crate::design::frame::{Column, Frame};
use crate::design::levels::{LevelMap, UnseenLevels, lookup};
use crate::design::terms::Terms;
use crate::design::{ConstructionMode, DesignError};

/// One column of a term block.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BlockColumn {
    Dense(Vec<f64>),
    /// `(row, value)` pairs sorted by row; absent rows are zero.
    Sparse(Vec<(usize, f64)>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Block {
    pub names: Vec<String>,
    pub columns: Vec<BlockColumn>,
}

/// Builds every term block in term order.
pub(crate) fn build_blocks(
    terms: &Terms,
    levels: &LevelMap,
    frame: &Frame,
    mode: ConstructionMode,
    unseen: UnseenLevels,
) -> Result<Vec<Block>, DesignError> {
    let first_factor_term = first_factor_main_effect(terms, levels);
    (0..terms.terms.len())
        .map(|t| {
            let contrasts = contrast_flags(terms, levels, t, mode, first_factor_term);
            term_block(terms, t, levels, frame, &contrasts, unseen)
        })
        .collect()
}

fn term_block(
    terms: &Terms,
    term_index: usize,
    levels: &LevelMap,
    frame: &Frame,
    contrasts: &[bool],
    unseen: UnseenLevels,
) -> Result<Block, DesignError> {
    let term = &terms.terms[term_index];
    let mut acc: Option<Block> = None;
    for (&var_index, &contrast) in term.variables.iter().zip(contrasts) {
        let block = variable_block(terms, var_index, levels, frame, contrast, unseen)?;
        acc = Some(match acc {
            None => block,
            Some(lhs) => cross(&lhs, &block),
        });
    }
    Ok(acc.unwrap_or(Block {
        names: Vec::new(),
        columns: Vec::new(),
    }))
}

fn variable_block(
    terms: &Terms,
    var_index: usize,
    levels: &LevelMap,
    frame: &Frame,
    contrast: bool,
    unseen: UnseenLevels,
) -> Result<Block, DesignError> {
    let var = &terms.variables[var_index];
    let label = var.label();
    match lookup(frame, var)? {
        Column::Numeric(values) => {
            let values = match var.transform {
                Some(t) => values.iter().map(|&v| t.apply(v)).collect(),
                None => values.clone(),
            };
            Ok(Block {
                names: vec![label],
                columns: vec![BlockColumn::Dense(values)],
            })
        }
        Column::Factor { values, .. } => {
            let recorded = levels.get(&label).ok_or_else(|| DesignError::KindMismatch {
                variable: label.clone(),
                expected: "numeric",
                found: "a factor",
            })?;
            let index = levels.index(&label).unwrap_or_default();
            let skip = usize::from(contrast);
            let width = recorded.len().saturating_sub(skip);
            let mut entries: Vec<Vec<(usize, f64)>> = vec![Vec::new(); width];
            let mut zero_filled = 0usize;

            for (row, value) in values.iter().enumerate() {
                let Some(value) = value else { continue };
                match index.get(value.as_str()) {
                    Some(&level) if level >= skip => entries[level - skip].push((row, 1.0)),
                    Some(_) => {}
                    None => match unseen {
                        UnseenLevels::Error => {
                            return Err(DesignError::UnseenLevel {
                                variable: label.clone(),
                                level: value.clone(),
                            });
                        }
                        UnseenLevels::ZeroFill => zero_filled += 1,
                    },
                }
            }
            if zero_filled > 0 {
                log::warn!(
                    "{zero_filled} row(s) of factor '{label}' carry levels unseen at fit time; their indicator columns are zero."
                );
            }

            Ok(Block {
                names: recorded[skip.min(recorded.len())..]
                    .iter()
                    .map(|level| format!("{label}{level}"))
                    .collect(),
                columns: entries.into_iter().map(BlockColumn::Sparse).collect(),
            })
        }
    }
}

/// Row-wise product of two blocks. The left block varies fastest.
fn cross(lhs: &Block, rhs: &Block) -> Block {
    let mut names = Vec::with_capacity(lhs.names.len() * rhs.names.len());
    let mut columns = Vec::with_capacity(names.capacity());
    for (rname, rcol) in rhs.names.iter().zip(&rhs.columns) {
        for (lname, lcol) in lhs.names.iter().zip(&lhs.columns) {
            names.push(format!("{lname}:{rname}"));
            columns.push(multiply(lcol, rcol));
        }
    }
    Block { names, columns }
}

fn multiply(a: &BlockColumn, b: &BlockColumn) -> BlockColumn {
    match (a, b) {
        (BlockColumn::Dense(x), BlockColumn::Dense(y)) => {
            BlockColumn::Dense(x.iter().zip(y).map(|(p, q)| p * q).collect())
        }
        (BlockColumn::Dense(x), BlockColumn::Sparse(s))
        | (BlockColumn::Sparse(s), BlockColumn::Dense(x)) => {
            BlockColumn::Sparse(s.iter().map(|&(row, v)| (row, v * x[row])).collect())
        }
        (BlockColumn::Sparse(s), BlockColumn::Sparse(t)) => {
            let mut out = Vec::new();
            let (mut i, mut j) = (0, 0);
            while i < s.len() && j < t.len() {
                match s[i].0.cmp(&t[j].0) {
                    std::cmp::Ordering::Less => i += 1,
                    std::cmp::Ordering::Greater => j += 1,
                    std::cmp::Ordering::Equal => {
                        out.push((s[i].0, s[i].1 * t[j].1));
                        i += 1;
                        j += 1;
                    }
                }
            }
            BlockColumn::Sparse(out)
        }
    }
}

/// Index of the first main-effect term whose variable is a factor.
fn first_factor_main_effect(terms: &Terms, levels: &LevelMap) -> Option<usize> {
    terms.terms.iter().position(|t| {
        t.order() == 1 && levels.is_factor(&terms.variables[t.variables[0]].label())
    })
}

/// For each variable of a term, whether it is coded by treatment contrasts.
///
/// In term-by-term mode every factor keeps all of its levels. In model-frame
/// mode a factor is coded by contrasts exactly when the term obtained by
/// deleting it is also in the model; the empty margin is the intercept. Without
/// an intercept, the first factor main effect keeps full indicator coding and
/// the remaining main effects use contrasts.
fn contrast_flags(
    terms: &Terms,
    levels: &LevelMap,
    term_index: usize,
    mode: ConstructionMode,
    first_factor_term: Option<usize>,
) -> Vec<bool> {
    let term = &terms.terms[term_index];
    term.variables
        .iter()
        .map(|&v| {
            if mode == ConstructionMode::TermByTerm
                || !levels.is_factor(&terms.variables[v].label())
            {
                return false;
            }
            let margin: Vec<usize> = term.variables.iter().copied().filter(|&u| u != v).collect();
            if margin.is_empty() && !terms.intercept {
                return first_factor_term != Some(term_index);
            }
            terms.contains_set(&margin)
        })
        .collect()
}

/// Sum of the formula's `offset(...)` terms, or `None` when it has none.
pub(crate) fn formula_offset(terms: &Terms, frame: &Frame) -> Result<Option<Vec<f64>>, DesignError> {
    let mut total: Option<Vec<f64>> = None;
    for var in &terms.offsets {
        let Column::Numeric(values) = lookup(frame, var)? else {
            return Err(DesignError::KindMismatch {
                variable: var.label(),
                expected: "numeric",
                found: "a factor",
            });
        };
        let sum = total.get_or_insert_with(|| vec![0.0; frame.nrows()]);
        for (acc, &v) in sum.iter_mut().zip(values) {
            *acc += var.transform.map_or(v, |t| t.apply(v));
        }
    }
    Ok(total)
}

/// `true` for rows where every listed column is present.
pub(crate) fn complete_rows(frame: &Frame, columns: &[&str]) -> Result<Vec<bool>, DesignError> {
    let mut complete = vec![true; frame.nrows()];
    for &name in columns {
        let column = frame
            .column(name)
            .ok_or_else(|| DesignError::MissingVariable(name.to_string()))?;
        for (row, ok) in complete.iter_mut().enumerate() {
            if column.is_missing(row) {
                *ok = false;
            }
        }
    }
    Ok(complete)
}
