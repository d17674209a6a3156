//! # Formula parsing
//!
//! Turns a model formula such as `y ~ x * g + log(z) - 1 + offset(exposure)`
//! into an expression tree. The tree is not yet a list of terms: expansion of
//! `*`, `/`, `^` and `.` happens in `terms`, where the data's column names are
//! known.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! formula := [response] '~' sum
//! sum     := ['+'|'-'] prod (('+'|'-') prod)*
//! prod    := inter (('*'|'/') inter)*
//! inter   := power (':' power)*
//! power   := atom ['^' INTEGER]
//! atom    := '(' sum ')' | '0' | '1' | '.' | name | name '(' name ')'
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("The formula is empty.")]
    Empty,
    #[error("The formula '{0}' has no '~' separating the response from the predictors.")]
    MissingTilde(String),
    #[error("Formula parse error at position {position} near '{token}': {message}")]
    Parse {
        position: usize,
        token: String,
        message: String,
    },
    #[error("Unknown function '{name}' in formula term '{term}'.")]
    UnknownFunction { name: String, term: String },
    #[error("The formula uses '.', but no data columns were supplied to expand it against.")]
    DotWithoutData,
    #[error("Invalid formula term '{term}': {reason}")]
    InvalidTerm { term: String, reason: String },
}

/// Element-wise transforms that may wrap a numeric variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transform {
    Log,
    Log2,
    Log10,
    Exp,
    Sqrt,
    Abs,
}

impl Transform {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "log" => Some(Transform::Log),
            "log2" => Some(Transform::Log2),
            "log10" => Some(Transform::Log10),
            "exp" => Some(Transform::Exp),
            "sqrt" => Some(Transform::Sqrt),
            "abs" => Some(Transform::Abs),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Transform::Log => "log",
            Transform::Log2 => "log2",
            Transform::Log10 => "log10",
            Transform::Exp => "exp",
            Transform::Sqrt => "sqrt",
            Transform::Abs => "abs",
        }
    }

    pub fn apply(self, value: f64) -> f64 {
        match self {
            Transform::Log => value.ln(),
            Transform::Log2 => value.log2(),
            Transform::Log10 => value.log10(),
            Transform::Exp => value.exp(),
            Transform::Sqrt => value.sqrt(),
            Transform::Abs => value.abs(),
        }
    }
}

/// A reference to a data column, optionally transformed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variable {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
}

impl Variable {
    pub fn column(name: &str) -> Self {
        Variable {
            column: name.to_string(),
            transform: None,
        }
    }

    /// The label used for term and column names, e.g. `x` or `log(x)`.
    pub fn label(&self) -> String {
        match self.transform {
            Some(t) => format!("{}({})", t.name(), self.column),
            None => self.column.clone(),
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Right-hand side expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Var(Variable),
    Offset(Variable),
    /// `.`: every data column not otherwise claimed by the formula.
    Dot,
    /// `1` keeps the intercept, `0` drops it.
    Intercept(bool),
    Sum(Box<Expr>, Box<Expr>),
    Diff(Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    Cross(Box<Expr>, Box<Expr>),
    Nest(Box<Expr>, Box<Expr>),
    Interact(Box<Expr>, Box<Expr>),
    Power(Box<Expr>, u32),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Var(v) => write!(f, "{v}"),
            Expr::Offset(v) => write!(f, "offset({v})"),
            Expr::Dot => f.write_str("."),
            Expr::Intercept(true) => f.write_str("1"),
            Expr::Intercept(false) => f.write_str("0"),
            Expr::Sum(a, b) => write!(f, "{a} + {b}"),
            Expr::Diff(a, b) => write!(f, "{a} - {b}"),
            Expr::Negate(a) => write!(f, "-{a}"),
            Expr::Cross(a, b) => write!(f, "{a}*{b}"),
            Expr::Nest(a, b) => write!(f, "{a}/{b}"),
            Expr::Interact(a, b) => write!(f, "{a}:{b}"),
            Expr::Power(a, k) => write!(f, "({a})^{k}"),
        }
    }
}

/// A parsed, not yet expanded, formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub source: String,
    pub response: Option<Variable>,
    pub rhs: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        parse(source)
    }
}

/// Parses `source`. Error positions are byte offsets into `source` itself.
pub fn parse(source: &str) -> Result<Formula, FormulaError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(FormulaError::Empty);
    }
    let lead = source.len() - source.trim_start().len();
    parse_trimmed(trimmed).map_err(|e| match e {
        FormulaError::Parse {
            position,
            token,
            message,
        } => FormulaError::Parse {
            position: position + lead,
            token,
            message,
        },
        other => other,
    })
}

fn parse_trimmed(trimmed: &str) -> Result<Formula, FormulaError> {
    let tokens = lex(trimmed)?;
    let tilde = tokens
        .iter()
        .position(|t| t.kind == TokenKind::Tilde)
        .ok_or_else(|| FormulaError::MissingTilde(trimmed.to_string()))?;

    let response = if tilde == 0 {
        None
    } else {
        let mut lhs = Parser::new(&tokens[..tilde], trimmed.len());
        let var = lhs.response()?;
        lhs.expect_end()?;
        Some(var)
    };

    let mut rhs = Parser::new(&tokens[tilde + 1..], trimmed.len());
    if rhs.at_end() {
        return Err(FormulaError::Parse {
            position: trimmed.len(),
            token: "~".to_string(),
            message: "expected predictors after '~'".to_string(),
        });
    }
    let expr = rhs.sum()?;
    rhs.expect_end()?;

    Ok(Formula {
        source: trimmed.to_string(),
        response,
        rhs: expr,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Name(String),
    Number(String),
    Tilde,
    Plus,
    Minus,
    Star,
    Slash,
    Colon,
    Caret,
    LParen,
    RParen,
    Dot,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    position: usize,
    text: String,
}

fn lex(source: &str) -> Result<Vec<Token>, FormulaError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '~' => Some(TokenKind::Tilde),
            '+' => Some(TokenKind::Plus),
            '-' => Some(TokenKind::Minus),
            '*' => Some(TokenKind::Star),
            '/' => Some(TokenKind::Slash),
            ':' => Some(TokenKind::Colon),
            '^' => Some(TokenKind::Caret),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            _ => None,
        };
        if let Some(kind) = single {
            tokens.push(Token {
                kind,
                position,
                text: c.to_string(),
            });
            i += 1;
            continue;
        }

        if c == '`' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end].1 != '`' {
                end += 1;
            }
            if end >= chars.len() {
                return Err(FormulaError::Parse {
                    position,
                    token: "`".to_string(),
                    message: "unterminated back-quoted name".to_string(),
                });
            }
            let name: String = chars[start..end].iter().map(|(_, ch)| *ch).collect();
            if name.is_empty() {
                return Err(FormulaError::Parse {
                    position,
                    token: "``".to_string(),
                    message: "empty back-quoted name".to_string(),
                });
            }
            tokens.push(Token {
                kind: TokenKind::Name(name.clone()),
                position,
                text: format!("`{name}`"),
            });
            i = end + 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].1.is_ascii_digit() {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            if i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '.') {
                return Err(FormulaError::Parse {
                    position,
                    token: format!("{text}{}", chars[i].1),
                    message: "only integer constants are allowed".to_string(),
                });
            }
            tokens.push(Token {
                kind: TokenKind::Number(text.clone()),
                position,
                text,
            });
            continue;
        }

        if c.is_alphabetic() || c == '.' || c == '_' {
            let start = i;
            while i < chars.len()
                && (chars[i].1.is_alphanumeric() || chars[i].1 == '.' || chars[i].1 == '_')
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            let kind = if text == "." {
                TokenKind::Dot
            } else {
                TokenKind::Name(text.clone())
            };
            tokens.push(Token {
                kind,
                position,
                text,
            });
            continue;
        }

        return Err(FormulaError::Parse {
            position,
            token: c.to_string(),
            message: "unexpected character".to_string(),
        });
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    cursor: usize,
    source_len: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], source_len: usize) -> Self {
        Self {
            tokens,
            cursor: 0,
            source_len,
        }
    }

    fn at_end(&self) -> bool {
        self.cursor >= self.tokens.len()
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.cursor).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.cursor);
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn error_here(&self, message: &str) -> FormulaError {
        match self.tokens.get(self.cursor) {
            Some(token) => FormulaError::Parse {
                position: token.position,
                token: token.text.clone(),
                message: message.to_string(),
            },
            None => FormulaError::Parse {
                position: self.source_len,
                token: "<end>".to_string(),
                message: message.to_string(),
            },
        }
    }

    fn expect_end(&self) -> Result<(), FormulaError> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error_here("unexpected token"))
        }
    }

    fn response(&mut self) -> Result<Variable, FormulaError> {
        match self.atom()? {
            Expr::Var(v) => Ok(v),
            other => Err(FormulaError::InvalidTerm {
                term: other.to_string(),
                reason: "the response must be a single variable".to_string(),
            }),
        }
    }

    fn sum(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = match self.peek() {
            Some(TokenKind::Minus) => {
                self.advance();
                Expr::Negate(Box::new(self.prod()?))
            }
            Some(TokenKind::Plus) => {
                self.advance();
                self.prod()?
            }
            _ => self.prod()?,
        };
        loop {
            match self.peek() {
                Some(TokenKind::Plus) => {
                    self.advance();
                    lhs = Expr::Sum(Box::new(lhs), Box::new(self.prod()?));
                }
                Some(TokenKind::Minus) => {
                    self.advance();
                    lhs = Expr::Diff(Box::new(lhs), Box::new(self.prod()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn prod(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.inter()?;
        loop {
            match self.peek() {
                Some(TokenKind::Star) => {
                    self.advance();
                    lhs = Expr::Cross(Box::new(lhs), Box::new(self.inter()?));
                }
                Some(TokenKind::Slash) => {
                    self.advance();
                    lhs = Expr::Nest(Box::new(lhs), Box::new(self.inter()?));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn inter(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.power()?;
        while let Some(TokenKind::Colon) = self.peek() {
            self.advance();
            lhs = Expr::Interact(Box::new(lhs), Box::new(self.power()?));
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.atom()?;
        if let Some(TokenKind::Caret) = self.peek() {
            self.advance();
            let exponent = match self.advance() {
                Some(Token {
                    kind: TokenKind::Number(n),
                    ..
                }) => n.parse::<u32>().ok().filter(|&k| k >= 1),
                _ => None,
            };
            return match exponent {
                Some(k) => Ok(Expr::Power(Box::new(base), k)),
                None => {
                    self.cursor = self.cursor.saturating_sub(1);
                    Err(self.error_here("'^' must be followed by a positive integer"))
                }
            };
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        let Some(token) = self.advance() else {
            return Err(self.error_here("expected a term"));
        };
        match &token.kind {
            TokenKind::LParen => {
                let inner = self.sum()?;
                match self.peek() {
                    Some(TokenKind::RParen) => {
                        self.advance();
                        Ok(inner)
                    }
                    _ => Err(self.error_here("expected ')'")),
                }
            }
            TokenKind::Number(n) if n == "0" => Ok(Expr::Intercept(false)),
            TokenKind::Number(n) if n == "1" => Ok(Expr::Intercept(true)),
            TokenKind::Number(_) => {
                self.cursor -= 1;
                Err(self.error_here("only 0 and 1 may appear as constants"))
            }
            TokenKind::Dot => Ok(Expr::Dot),
            TokenKind::Name(name) => {
                if let Some(TokenKind::LParen) = self.peek() {
                    self.advance();
                    self.call(name, token)
                } else {
                    Ok(Expr::Var(Variable::column(name)))
                }
            }
            _ => {
                self.cursor -= 1;
                Err(self.error_here("expected a term"))
            }
        }
    }

    fn call(&mut self, function: &str, head: &Token) -> Result<Expr, FormulaError> {
        let argument = match self.advance() {
            Some(Token {
                kind: TokenKind::Name(arg),
                ..
            }) => arg.clone(),
            _ => {
                self.cursor = self.cursor.saturating_sub(1);
                return Err(self.error_here(&format!(
                    "'{function}(...)' takes a single column name"
                )));
            }
        };
        match self.peek() {
            Some(TokenKind::RParen) => {
                self.advance();
            }
            _ => return Err(self.error_here("expected ')'")),
        }

        if function == "offset" {
            return Ok(Expr::Offset(Variable::column(&argument)));
        }
        match Transform::from_name(function) {
            Some(transform) => Ok(Expr::Var(Variable {
                column: argument,
                transform: Some(transform),
            })),
            None => Err(FormulaError::UnknownFunction {
                name: function.to_string(),
                term: format!("{}({argument})", head.text),
            }),
        }
    }
}
