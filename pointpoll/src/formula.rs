//! Restricted arithmetic for scaling formulas.
//!
//! Formulas are parsed into an `evalexpr` operator tree and then checked
//! against a short whitelist: numeric literals, the placeholder `value`,
//! `+ - * /`, unary minus and parentheses. Function calls, other identifiers,
//! assignments, chains (`;`) and every other operator are rejected when the
//! formula is compiled, so nothing outside that arithmetic ever runs.
//!
//! The checked tree is evaluated in `f64`: integer literals behave as floats
//! (`1 / 2` is `0.5`) and dividing by zero gives an infinity, not an error.

use evalexpr::{Node, Operator, Value};
use thiserror::Error;

/// Identifier replaced by the decoded register value.
pub const PLACEHOLDER: &str = "value";

/// Longest accepted formula, in bytes. Also bounds the nesting depth.
pub const MAX_FORMULA_LEN: usize = 256;

/// Errors raised while compiling a formula.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("formula is {len} bytes long (at most {max} allowed)")]
    TooLong { len: usize, max: usize },
    #[error("invalid formula: {0}")]
    Syntax(String),
    #[error("unknown identifier '{0}' (only 'value' is allowed)")]
    UnknownIdentifier(String),
    #[error("unsupported operator {0}")]
    UnsupportedOperator(String),
    #[error("formula is empty")]
    Empty,
}

/// A compiled scaling formula.
#[derive(Debug)]
pub struct Formula {
    source: String,
    tree: Node,
}

impl Formula {
    /// Compile a formula, rejecting anything outside plain arithmetic on `value`.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        if source.len() > MAX_FORMULA_LEN {
            return Err(FormulaError::TooLong {
                len: source.len(),
                max: MAX_FORMULA_LEN,
            });
        }

        let tree = evalexpr::build_operator_tree(source)
            .map_err(|e| FormulaError::Syntax(e.to_string()))?;
        check(&tree)?;

        Ok(Self {
            source: source.to_string(),
            tree,
        })
    }

    /// Evaluate with `value` bound to the decoded register value.
    pub fn eval(&self, value: f64) -> f64 {
        eval_node(&self.tree, value)
    }

    /// The formula text as configured.
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn check(root: &Node) -> Result<(), FormulaError> {
    let mut pending = vec![root];
    while let Some(node) = pending.pop() {
        match node.operator() {
            Operator::RootNode if node.children().is_empty() => return Err(FormulaError::Empty),
            Operator::RootNode
            | Operator::Add
            | Operator::Sub
            | Operator::Mul
            | Operator::Div
            | Operator::Neg => {}
            Operator::Const {
                value: Value::Int(_) | Value::Float(_),
            } => {}
            Operator::VariableIdentifierRead { identifier } if identifier == PLACEHOLDER => {}
            Operator::VariableIdentifierRead { identifier }
            | Operator::VariableIdentifierWrite { identifier }
            | Operator::FunctionIdentifier { identifier } => {
                return Err(FormulaError::UnknownIdentifier(identifier.clone()));
            }
            other => return Err(FormulaError::UnsupportedOperator(format!("{:?}", other))),
        }
        pending.extend(node.children());
    }
    Ok(())
}

fn eval_node(node: &Node, value: f64) -> f64 {
    let children = node.children();
    let arg = |i: usize| children.get(i).map_or(f64::NAN, |child| eval_node(child, value));

    match node.operator() {
        Operator::Add => arg(0) + arg(1),
        Operator::Sub => arg(0) - arg(1),
        Operator::Mul => arg(0) * arg(1),
        Operator::Div => arg(0) / arg(1),
        Operator::Neg => -arg(0),
        Operator::Const {
            value: Value::Int(n),
        } => *n as f64,
        Operator::Const {
            value: Value::Float(n),
        } => *n,
        Operator::VariableIdentifierRead { .. } => value,
        // root and parenthesised groups
        _ => arg(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(source: &str, value: f64) -> f64 {
        Formula::parse(source).unwrap().eval(value)
    }

    #[test]
    fn test_placeholder_only() {
        assert_eq!(eval("value", 3.5), 3.5);
    }

    #[test]
    fn test_precedence_and_parentheses() {
        assert_eq!(eval("value * 10 + 2", 1.5), 17.0);
        assert_eq!(eval("(value + 2) * 10", 1.5), 35.0);
        assert_eq!(eval("100 - value / 4", 8.0), 98.0);
        assert_eq!(eval("10 - 4 - 3", 0.0), 3.0);
        assert_eq!(eval("64 / 4 / 2", 0.0), 8.0);
    }

    #[test]
    fn test_integer_literals_divide_as_floats() {
        assert_eq!(eval("1 / 2 * value", 3.0), 1.5);
        assert_eq!(eval("value * (7 / 2)", 2.0), 7.0);
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(eval("-value", 2.0), -2.0);
        assert_eq!(eval("2 * -value", -1.5), 3.0);
        assert_eq!(eval("-(value - 4)", 1.0), 3.0);
    }

    #[test]
    fn test_repeated_placeholder() {
        assert_eq!(eval("value * value + value", 3.0), 12.0);
    }

    #[test]
    fn test_decimal_literals() {
        assert_eq!(eval("0.5 * value", 4.0), 2.0);
        assert_eq!(eval("value * 0.001", 2500.0), 2.5);
    }

    #[test]
    fn test_rejects_identifiers() {
        assert!(matches!(
            Formula::parse("process.exit(1)"),
            Err(FormulaError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            Formula::parse("Math.sqrt(value)"),
            Err(FormulaError::UnknownIdentifier(_))
        ));
        assert!(matches!(
            Formula::parse("values * 2"),
            Err(FormulaError::UnknownIdentifier(id)) if id == "values"
        ));
        assert!(Formula::parse("value = 3").is_err());
    }

    #[test]
    fn test_rejects_other_operators() {
        assert!(matches!(
            Formula::parse("value; 1"),
            Err(FormulaError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            Formula::parse("value ^ 2"),
            Err(FormulaError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            Formula::parse("value > 1"),
            Err(FormulaError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            Formula::parse("\"on\""),
            Err(FormulaError::UnsupportedOperator(_))
        ));
        assert!(Formula::parse("value ** 2").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Formula::parse("").unwrap_err(), FormulaError::Empty);
        assert!(matches!(
            Formula::parse("(value + 1"),
            Err(FormulaError::Syntax(_))
        ));
        assert!(Formula::parse("value 2").is_err());
        assert!(Formula::parse("1.2.3").is_err());
    }

    #[test]
    fn test_length_limit() {
        let nested = format!("{}value", "(".repeat(100_000));
        assert_eq!(
            Formula::parse(&nested).unwrap_err(),
            FormulaError::TooLong {
                len: 100_005,
                max: MAX_FORMULA_LEN
            }
        );

        let deep = format!("{}value{}", "(".repeat(120), ")".repeat(120));
        assert_eq!(eval(&deep, 4.0), 4.0);
    }

    #[test]
    fn test_division_by_zero_is_infinite() {
        assert_eq!(eval("value / 0", 1.0), f64::INFINITY);
        assert!(eval("value / 0", 0.0).is_nan());
    }

    #[test]
    fn test_source_kept() {
        let formula = Formula::parse("value * 2").unwrap();
        assert_eq!(formula.source(), "value * 2");
    }
}
