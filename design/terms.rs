//! # Terms descriptor
//!
//! Expands a parsed formula into the ordered list of additive terms that the
//! matrix builder walks. The descriptor is computed once at fit time and is
//! serialized with the model; prediction never re-parses the formula, so `.`
//! keeps meaning the columns that existed when the model was fit.

use crate::design::formula::{Expr, Formula, FormulaError, Variable, parse};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One additive term: a set of variables multiplied together. Indices point
/// into `Terms::variables` and are kept sorted, which is also the order of
/// first appearance in the formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub variables: Vec<usize>,
}

impl Term {
    pub fn order(&self) -> usize {
        self.variables.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terms {
    pub formula: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Variable>,
    pub intercept: bool,
    /// Predictor variables in order of first appearance.
    pub variables: Vec<Variable>,
    pub terms: Vec<Term>,
    #[serde(default)]
    pub offsets: Vec<Variable>,
}

impl Terms {
    /// Parses and expands `formula`. `columns` are the data's column names,
    /// needed only when the formula contains `.`; `reserved` names columns
    /// that `.` must never pick up (weights, explicit offsets).
    pub fn from_formula(
        formula: &str,
        columns: Option<&[String]>,
        reserved: &[String],
    ) -> Result<Self, FormulaError> {
        let parsed = parse(formula)?;
        Self::expand(&parsed, columns, reserved)
    }

    pub fn expand(
        formula: &Formula,
        columns: Option<&[String]>,
        reserved: &[String],
    ) -> Result<Self, FormulaError> {
        let mut claimed: BTreeSet<String> = reserved.iter().cloned().collect();
        if let Some(response) = &formula.response {
            claimed.insert(response.column.clone());
        }
        collect_offset_columns(&formula.rhs, &mut claimed);

        let mut ctx = Expansion {
            variables: Vec::new(),
            columns,
            claimed: &claimed,
        };
        let mut list = ctx.eval(&formula.rhs)?;

        // A response written on the right-hand side is not a predictor.
        if let Some(response) = &formula.response {
            if let Some(r) = ctx.variables.iter().position(|v| v == response) {
                let before = list.terms.len();
                list.terms.retain(|t| !t.contains(&r));
                if list.terms.len() < before {
                    log::warn!(
                        "The response '{response}' appeared on the right-hand side of '{}' and was dropped.",
                        formula.source
                    );
                }
            }
        }

        // Order by interaction order; the sort is stable so appearance order
        // is preserved within an order.
        let mut ordered = list.terms;
        ordered.sort_by_key(|t| t.len());

        // Drop variables that survive only in removed terms and re-index.
        let used: BTreeSet<usize> = ordered.iter().flatten().copied().collect();
        let remap: Vec<Option<usize>> = {
            let mut next = 0;
            (0..ctx.variables.len())
                .map(|i| {
                    if used.contains(&i) {
                        next += 1;
                        Some(next - 1)
                    } else {
                        None
                    }
                })
                .collect()
        };
        let variables: Vec<Variable> = ctx
            .variables
            .iter()
            .enumerate()
            .filter(|(i, _)| remap[*i].is_some())
            .map(|(_, v)| v.clone())
            .collect();
        let terms = ordered
            .into_iter()
            .map(|set| Term {
                variables: set.into_iter().filter_map(|i| remap[i]).collect(),
            })
            .collect();

        Ok(Terms {
            formula: formula.source.clone(),
            response: formula.response.clone(),
            intercept: list.intercept.unwrap_or(true),
            variables,
            terms,
            offsets: list.offsets,
        })
    }

    /// Term label such as `x`, `g:x` or `log(z):g`.
    pub fn label(&self, term: &Term) -> String {
        term.variables
            .iter()
            .map(|&i| self.variables[i].label())
            .join(":")
    }

    pub fn labels(&self) -> Vec<String> {
        self.terms.iter().map(|t| self.label(t)).collect()
    }

    /// Whether a term with exactly these variables is part of the model. The
    /// empty set stands for the intercept.
    pub fn contains_set(&self, variables: &[usize]) -> bool {
        if variables.is_empty() {
            return self.intercept;
        }
        self.terms.iter().any(|t| t.variables == variables)
    }

    /// Every data column the model needs in order to build predictors and offsets.
    pub fn predictor_columns(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.variables
            .iter()
            .chain(self.offsets.iter())
            .filter(|v| seen.insert(v.column.as_str()))
            .map(|v| v.column.as_str())
            .collect()
    }
}

fn collect_offset_columns(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Offset(v) => {
            out.insert(v.column.clone());
        }
        Expr::Sum(a, b)
        | Expr::Diff(a, b)
        | Expr::Cross(a, b)
        | Expr::Nest(a, b)
        | Expr::Interact(a, b) => {
            collect_offset_columns(a, out);
            collect_offset_columns(b, out);
        }
        Expr::Negate(a) | Expr::Power(a, _) => collect_offset_columns(a, out),
        Expr::Var(_) | Expr::Dot | Expr::Intercept(_) => {}
    }
}

/// Intermediate result of evaluating a sub-expression.
#[derive(Debug, Default)]
struct TermList {
    terms: Vec<BTreeSet<usize>>,
    intercept: Option<bool>,
    offsets: Vec<Variable>,
}

impl TermList {
    fn push_unique(&mut self, term: BTreeSet<usize>) {
        if !self.terms.contains(&term) {
            self.terms.push(term);
        }
    }

    fn union(mut self, other: TermList) -> TermList {
        for term in other.terms {
            self.push_unique(term);
        }
        self.intercept = other.intercept.or(self.intercept);
        self.offsets.extend(other.offsets);
        self
    }
}

struct Expansion<'a> {
    variables: Vec<Variable>,
    columns: Option<&'a [String]>,
    claimed: &'a BTreeSet<String>,
}

impl Expansion<'_> {
    fn intern(&mut self, var: &Variable) -> usize {
        match self.variables.iter().position(|v| v == var) {
            Some(i) => i,
            None => {
                self.variables.push(var.clone());
                self.variables.len() - 1
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Result<TermList, FormulaError> {
        match expr {
            Expr::Var(v) => {
                let idx = self.intern(v);
                Ok(TermList {
                    terms: vec![BTreeSet::from([idx])],
                    ..TermList::default()
                })
            }
            Expr::Offset(v) => Ok(TermList {
                offsets: vec![v.clone()],
                ..TermList::default()
            }),
            Expr::Intercept(keep) => Ok(TermList {
                intercept: Some(*keep),
                ..TermList::default()
            }),
            Expr::Dot => {
                let columns = self.columns.ok_or(FormulaError::DotWithoutData)?;
                let claimed = self.claimed;
                let mut list = TermList::default();
                for name in columns.iter().filter(|c| !claimed.contains(*c)) {
                    let idx = self.intern(&Variable::column(name));
                    list.push_unique(BTreeSet::from([idx]));
                }
                Ok(list)
            }
            Expr::Sum(a, b) => {
                let lhs = self.eval(a)?;
                let rhs = self.eval(b)?;
                Ok(lhs.union(rhs))
            }
            Expr::Diff(a, b) => {
                let lhs = self.eval(a)?;
                let rhs = self.eval(b)?;
                Ok(remove(lhs, rhs))
            }
            Expr::Negate(a) => {
                let rhs = self.eval(a)?;
                Ok(remove(TermList::default(), rhs))
            }
            Expr::Interact(a, b) => {
                let lhs = self.factor_operand(a, expr)?;
                let rhs = self.factor_operand(b, expr)?;
                Ok(interact(&lhs, &rhs))
            }
            Expr::Cross(a, b) => {
                let lhs = self.factor_operand(a, expr)?;
                let rhs = self.factor_operand(b, expr)?;
                let both = interact(&lhs, &rhs);
                Ok(lhs.union(rhs).union(both))
            }
            Expr::Nest(a, b) => {
                let outer = self.factor_operand(a, expr)?;
                let inner = self.factor_operand(b, expr)?;
                let all_outer: BTreeSet<usize> = outer.terms.iter().flatten().copied().collect();
                let mut nested = TermList::default();
                for term in &inner.terms {
                    nested.push_unique(all_outer.union(term).copied().collect());
                }
                Ok(outer.union(nested))
            }
            Expr::Power(a, k) => {
                let base = self.factor_operand(a, expr)?;
                let mut acc = TermList {
                    terms: base.terms.clone(),
                    ..TermList::default()
                };
                for _ in 1..*k {
                    let next = interact(&acc, &base);
                    acc = acc.union(next);
                }
                Ok(acc)
            }
        }
    }

    /// Operands of `:`, `*`, `/` and `^` may only contain variables.
    fn factor_operand(&mut self, operand: &Expr, whole: &Expr) -> Result<TermList, FormulaError> {
        let list = self.eval(operand)?;
        if list.intercept.is_some() || !list.offsets.is_empty() {
            return Err(FormulaError::InvalidTerm {
                term: whole.to_string(),
                reason: "intercepts and offsets cannot be part of an interaction".to_string(),
            });
        }
        Ok(list)
    }
}

fn interact(lhs: &TermList, rhs: &TermList) -> TermList {
    let mut out = TermList::default();
    for a in &lhs.terms {
        for b in &rhs.terms {
            out.push_unique(a.union(b).copied().collect());
        }
    }
    out
}

fn remove(mut lhs: TermList, rhs: TermList) -> TermList {
    lhs.terms.retain(|t| !rhs.terms.contains(t));
    if let Some(keep) = rhs.intercept {
        lhs.intercept = Some(!keep);
    }
    lhs
}
