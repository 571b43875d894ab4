//! Formula expressions over named operands
//!
//! Arithmetic formulas reference operands (rasters or derived layers) and
//! named constants by name:
//!
//! - `"(nir - red) / (nir + red)"` → normalized difference
//! - `"(1 + p*c + x) / (y + p + c)"` → scalar ratio with constants `p`, `c`
//! - `"(after - before) / before * 100"` → percent change
//! - `"scene[3] - scene[2]"` → band 3 minus band 2 of one stack
//!
//! Supported: `+`, `-`, `*`, `/`, unary minus, parentheses, numeric
//! literals (including exponent notation such as `1e-4`) and band selection
//! `name[i]` (0-based). Division follows the [`NumericPolicy`] of the
//! evaluation.

use super::{combine, NumericPolicy};
use bandstack_core::{Error, Layer, LayerView, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A token in the parsed expression
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Op(char), // +, -, *, /
    LParen,
    RParen,
    LBracket,
    RBracket,
}

/// A node in the expression AST
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f64),
    Var { name: String, band: Option<usize> },
    BinOp {
        op: char,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Neg(Box<Expr>),
}

/// Tokenize a formula string
fn tokenize(formula: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = formula.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            c if c.is_whitespace() => {
                i += 1;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(chars[i]));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent: e, E followed by optional sign and digits
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let num_str: String = chars[start..i].iter().collect();
                let num = num_str
                    .parse::<f64>()
                    .map_err(|_| Error::Formula(format!("invalid number: {}", num_str)))?;
                tokens.push(Token::Number(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                tokens.push(Token::Name(name));
            }
            c => {
                return Err(Error::Formula(format!(
                    "unexpected character '{}' in formula",
                    c
                )));
            }
        }
    }

    Ok(tokens)
}

/// Recursive descent parser for arithmetic expressions
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    /// Parse a whole formula; every token must be consumed
    fn parse(mut self) -> Result<Expr> {
        let expr = self.parse_expr()?;
        match self.peek() {
            None => Ok(expr),
            Some(t) => Err(Error::Formula(format!("unexpected token {:?}", t))),
        }
    }

    /// expr = term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<Expr> {
        let mut left = self.parse_term()?;

        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_term()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// term = factor (('*' | '/') factor)*
    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_factor()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// factor = number | name ('[' integer ']')? | '(' expr ')' | ('-' | '+') factor
    fn parse_factor(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Num(n)),
            Some(Token::Name(name)) => {
                let band = if self.peek() == Some(&Token::LBracket) {
                    self.advance();
                    Some(self.parse_band_index(&name)?)
                } else {
                    None
                };
                Ok(Expr::Var { name, band })
            }
            Some(Token::LParen) => {
                let expr = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(Error::Formula("expected closing parenthesis".into())),
                }
            }
            Some(Token::Op('-')) => {
                let factor = self.parse_factor()?;
                Ok(Expr::Neg(Box::new(factor)))
            }
            Some(Token::Op('+')) => self.parse_factor(),
            Some(other) => Err(Error::Formula(format!("unexpected token {:?}", other))),
            None => Err(Error::Formula("unexpected end of formula".into())),
        }
    }

    fn parse_band_index(&mut self, name: &str) -> Result<usize> {
        let index = match self.advance() {
            Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
            other => {
                return Err(Error::Formula(format!(
                    "band index of '{}' must be a non-negative integer, got {:?}",
                    name, other
                )))
            }
        };
        match self.advance() {
            Some(Token::RBracket) => Ok(index),
            _ => Err(Error::Formula(format!("expected ']' after band index of '{}'", name))),
        }
    }
}

/// Collect referenced names in order of first appearance
fn collect_names(expr: &Expr, names: &mut Vec<String>) {
    match expr {
        Expr::Var { name, .. } => {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        Expr::BinOp { left, right, .. } => {
            collect_names(left, names);
            collect_names(right, names);
        }
        Expr::Neg(inner) => collect_names(inner, names),
        Expr::Num(_) => {}
    }
}

/// Expression tree with names resolved to operand slots and constant values
#[derive(Debug)]
enum Bound {
    Num(f64),
    Slot(usize),
    BinOp(char, Box<Bound>, Box<Bound>),
    Neg(Box<Bound>),
}

impl Bound {
    fn eval(&self, values: &[f64], policy: &NumericPolicy) -> f64 {
        match self {
            Bound::Num(n) => *n,
            Bound::Slot(i) => values[*i],
            Bound::BinOp(op, left, right) => {
                let l = left.eval(values, policy);
                let r = right.eval(values, policy);
                match op {
                    '+' => l + r,
                    '-' => l - r,
                    '*' => l * r,
                    '/' => policy.div(l, r),
                    _ => f64::NAN,
                }
            }
            Bound::Neg(inner) => -inner.eval(values, policy),
        }
    }
}

/// A parsed formula.
///
/// Parsing validates syntax only; names are resolved against operands and
/// constants when the expression is evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Expr,
    names: Vec<String>,
}

impl Expression {
    /// Parse a formula, reporting syntax problems as [`Error::Formula`]
    pub fn parse(formula: &str) -> Result<Self> {
        let tokens = tokenize(formula)?;
        if tokens.is_empty() {
            return Err(Error::Formula("empty formula".into()));
        }
        let root = Parser::new(tokens).parse()?;
        let mut names = Vec::new();
        collect_names(&root, &mut names);

        Ok(Self {
            source: formula.trim().to_string(),
            root,
            names,
        })
    }

    /// The formula text
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every name the formula references, in order of first appearance
    pub fn variables(&self) -> &[String] {
        &self.names
    }

    /// Evaluate against named operands and constants.
    ///
    /// A name is looked up among `operands` first, then `constants`. Unknown
    /// names and band selection on a constant are [`Error::Formula`]; a
    /// formula without any operand is rejected as well, since it has no
    /// grid to take its shape from. Operand shapes are checked as in
    /// [`combine`].
    pub fn evaluate(
        &self,
        operands: &[(&str, LayerView<'_>)],
        constants: &BTreeMap<String, f64>,
        policy: NumericPolicy,
    ) -> Result<Layer> {
        let mut views: Vec<LayerView<'_>> = Vec::new();
        let mut slots: Vec<(&str, Option<usize>)> = Vec::new();
        let bound = self.bind(&self.root, operands, constants, &mut views, &mut slots)?;

        if views.is_empty() {
            return Err(Error::Formula(format!(
                "'{}' references no raster operand",
                self.source
            )));
        }

        combine(&views, policy, |values, p| bound.eval(values, p))
    }

    fn bind<'a, 'v>(
        &'a self,
        expr: &'a Expr,
        operands: &[(&str, LayerView<'v>)],
        constants: &BTreeMap<String, f64>,
        views: &mut Vec<LayerView<'v>>,
        slots: &mut Vec<(&'a str, Option<usize>)>,
    ) -> Result<Bound> {
        Ok(match expr {
            Expr::Num(n) => Bound::Num(*n),
            Expr::Var { name, band } => {
                if let Some((_, view)) = operands.iter().find(|(n, _)| *n == name.as_str()) {
                    let key = (name.as_str(), *band);
                    match slots.iter().position(|s| *s == key) {
                        Some(slot) => Bound::Slot(slot),
                        None => {
                            let view = match band {
                                Some(index) => LayerView::Band(view.band(*index)?),
                                None => *view,
                            };
                            views.push(view);
                            slots.push(key);
                            Bound::Slot(views.len() - 1)
                        }
                    }
                } else if let Some(value) = constants.get(name) {
                    if band.is_some() {
                        return Err(Error::Formula(format!(
                            "'{}' is a constant and has no bands",
                            name
                        )));
                    }
                    Bound::Num(*value)
                } else {
                    return Err(Error::Formula(format!("unknown name '{}'", name)));
                }
            }
            Expr::BinOp { op, left, right } => Bound::BinOp(
                *op,
                Box::new(self.bind(left, operands, constants, views, slots)?),
                Box::new(self.bind(right, operands, constants, views, slots)?),
            ),
            Expr::Neg(inner) => {
                Bound::Neg(Box::new(self.bind(inner, operands, constants, views, slots)?))
            }
        })
    }
}

impl FromStr for Expression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse and evaluate `formula` in one step.
///
/// # Example
/// ```ignore
/// let ndvi = evaluate_formula(
///     "(scene[3] - scene[2]) / (scene[3] + scene[2])",
///     &[("scene", (&grid).into())],
///     &BTreeMap::new(),
///     NumericPolicy::default(),
/// )?;
/// ```
pub fn evaluate_formula(
    formula: &str,
    operands: &[(&str, LayerView<'_>)],
    constants: &BTreeMap<String, f64>,
    policy: NumericPolicy,
) -> Result<Layer> {
    Expression::parse(formula)?.evaluate(operands, constants, policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, Array3};

    fn no_constants() -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    fn value_at(layer: &Layer, band: usize) -> f64 {
        layer.band(band).unwrap()[(1, 1)]
    }

    #[test]
    fn test_ndvi_formula() {
        let nir = Array2::from_elem((5, 5), 0.8);
        let red = Array2::from_elem((5, 5), 0.2);

        let out = evaluate_formula(
            "(NIR - Red) / (NIR + Red)",
            &[("NIR", nir.view().into()), ("Red", red.view().into())],
            &no_constants(),
            NumericPolicy::default(),
        )
        .unwrap();

        assert_relative_eq!(value_at(&out, 0), 0.6, epsilon = 1e-12);
    }

    #[test]
    fn test_evi_formula() {
        let nir = Array2::from_elem((3, 3), 0.8);
        let red = Array2::from_elem((3, 3), 0.2);
        let blue = Array2::from_elem((3, 3), 0.1);

        let out = evaluate_formula(
            "2.5 * (NIR - Red) / (NIR + 6 * Red - 7.5 * Blue + 1)",
            &[
                ("NIR", nir.view().into()),
                ("Red", red.view().into()),
                ("Blue", blue.view().into()),
            ],
            &no_constants(),
            NumericPolicy::default(),
        )
        .unwrap();

        let expected = 2.5 * 0.6 / (0.8 + 1.2 - 0.75 + 1.0);
        assert_relative_eq!(value_at(&out, 0), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_constants_and_exponents() {
        let x = Array2::from_elem((3, 3), 3.0);
        let y = Array2::from_elem((3, 3), 1.0);
        let constants = BTreeMap::from([("p".to_string(), 2.0), ("c".to_string(), 0.5)]);

        let out = evaluate_formula(
            "(1 + p*c + x) / (y + p + c) * 1e0 + 2.5E-1 - 25e-2",
            &[("x", x.view().into()), ("y", y.view().into())],
            &constants,
            NumericPolicy::default(),
        )
        .unwrap();

        assert_relative_eq!(value_at(&out, 0), 5.0 / 3.5, epsilon = 1e-12);
    }

    #[test]
    fn test_band_selection() {
        let scene = Array3::from_shape_fn((4, 3, 3), |(b, _, _)| (b + 1) as f64 * 0.1);

        let out = evaluate_formula(
            "(scene[3] - scene[2]) / (scene[3] + scene[2])",
            &[("scene", scene.view().into())],
            &no_constants(),
            NumericPolicy::default(),
        )
        .unwrap();

        assert!(!out.is_stack());
        // (0.4 - 0.3) / (0.4 + 0.3)
        assert_relative_eq!(value_at(&out, 0), 1.0 / 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_whole_stack_formula_gives_stack() {
        let a = Array3::from_elem((2, 3, 3), 4.0);
        let b = Array3::from_elem((2, 3, 3), 2.0);

        let out = evaluate_formula(
            "a / b - -1",
            &[("a", a.view().into()), ("b", b.view().into())],
            &no_constants(),
            NumericPolicy::default(),
        )
        .unwrap();

        assert_eq!(out.shape(), (2, 3, 3));
        assert_eq!(value_at(&out, 1), 3.0);
    }

    #[test]
    fn test_mixing_stack_and_band_is_shape_mismatch() {
        let a = Array3::from_elem((2, 3, 3), 4.0);
        let result = evaluate_formula(
            "a[0] + a",
            &[("a", a.view().into())],
            &no_constants(),
            NumericPolicy::default(),
        );
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_division_by_zero_follows_policy() {
        let a = Array2::from_elem((3, 3), 1.0);
        let b = Array2::<f64>::zeros((3, 3));
        let operands = [("A", LayerView::from(a.view())), ("B", LayerView::from(b.view()))];

        let nan = evaluate_formula("A / B", &operands, &no_constants(), NumericPolicy::default())
            .unwrap();
        assert!(value_at(&nan, 0).is_nan());

        let inf = evaluate_formula("A / B", &operands, &no_constants(), NumericPolicy::ieee())
            .unwrap();
        assert_eq!(value_at(&inf, 0), f64::INFINITY);
    }

    #[test]
    fn test_variables_in_order() {
        let expr = Expression::parse("(b - a) / a * scale + b[1]").unwrap();
        assert_eq!(expr.variables(), ["b", "a", "scale"]);
        assert_eq!(expr.to_string(), "(b - a) / a * scale + b[1]");
    }

    #[test]
    fn test_syntax_errors() {
        for formula in ["(NIR - ", "NIR +", "a b", "a[1.5]", "a[0", "3 $ 4", "", "()"] {
            assert!(
                matches!(Expression::parse(formula), Err(Error::Formula(_))),
                "'{}' should not parse",
                formula
            );
        }
    }

    #[test]
    fn test_unknown_name_and_constant_only() {
        let a = Array2::from_elem((3, 3), 1.0);
        let result = evaluate_formula(
            "a + missing",
            &[("a", a.view().into())],
            &no_constants(),
            NumericPolicy::default(),
        );
        assert!(matches!(result, Err(Error::Formula(_))));

        let constants = BTreeMap::from([("k".to_string(), 2.0)]);
        let result = evaluate_formula("k * 2", &[], &constants, NumericPolicy::default());
        assert!(matches!(result, Err(Error::Formula(_))));

        let result = evaluate_formula(
            "a + k[0]",
            &[("a", a.view().into())],
            &constants,
            NumericPolicy::default(),
        );
        assert!(matches!(result, Err(Error::Formula(_))));
    }
}
