//! Conversion of evalexpr expression strings into graph nodes.
//!
//! The evalexpr operator tree is walked recursively and every operator is mapped to the
//! corresponding graph operation. Identifiers resolve to symbols supplied by the caller,
//! numeric literals become scalar constants, and scalars broadcast over matrix operands.
//!
//! Supported syntax:
//! * Arithmetic: `+`, `-`, `*`, `/`, `^` and unary minus
//! * Constants: integer and floating point literals
//! * Functions of one argument: `abs`, `ln`, `log`, `sqrt`, `exp`, `sin`, `cos`, `tan`,
//!   `asin`, `acos`, `atan`, `sinh`, `cosh`, `tanh`, `floor`, `ceil`, `sign`

use std::collections::{BTreeSet, HashMap};

use evalexpr::{build_operator_tree, DefaultNumericTypes, Node, Operator, Value};

use crate::errors::ConvertError;
use crate::graph::Graph;
use crate::node::Mx;
use crate::ops::{BinaryOp, UnaryOp};

fn function_op(identifier: &str) -> Option<UnaryOp> {
    Some(match identifier {
        "abs" => UnaryOp::Abs,
        "ln" | "log" => UnaryOp::Log,
        "sqrt" => UnaryOp::Sqrt,
        "exp" => UnaryOp::Exp,
        "sin" => UnaryOp::Sin,
        "cos" => UnaryOp::Cos,
        "tan" => UnaryOp::Tan,
        "asin" => UnaryOp::Asin,
        "acos" => UnaryOp::Acos,
        "atan" => UnaryOp::Atan,
        "sinh" => UnaryOp::Sinh,
        "cosh" => UnaryOp::Cosh,
        "tanh" => UnaryOp::Tanh,
        "floor" => UnaryOp::Floor,
        "ceil" => UnaryOp::Ceil,
        "sign" => UnaryOp::Sign,
        _ => return None,
    })
}

fn constant_of(value: &Value<DefaultNumericTypes>) -> Result<f64, ConvertError> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(i) => Ok(*i as f64),
        _ => Err(ConvertError::ConstOperator(format!("{value:?}"))),
    }
}

/// Folds the children of a variadic operator left to right.
fn fold_children(
    graph: &mut Graph,
    node: &Node<DefaultNumericTypes>,
    symbols: &HashMap<String, Mx>,
    op: BinaryOp,
) -> Result<Mx, ConvertError> {
    let children = node.children();
    let (first, rest) = children
        .split_first()
        .ok_or_else(|| ConvertError::UnsupportedOperator(format!("{:?} without operands", node.operator())))?;
    let mut acc = build_node(graph, first, symbols)?;
    for child in rest {
        let rhs = build_node(graph, child, symbols)?;
        acc = graph.binary(op, acc, rhs)?;
    }
    Ok(acc)
}

/// Converts an evalexpr operator tree into graph nodes.
///
/// # Arguments
/// * `graph` - Graph to build in
/// * `node` - The evalexpr node to convert
/// * `symbols` - Graph expressions identifiers resolve to
///
/// # Returns
/// The expression of the node.
pub fn build_node(
    graph: &mut Graph,
    node: &Node<DefaultNumericTypes>,
    symbols: &HashMap<String, Mx>,
) -> Result<Mx, ConvertError> {
    let children = node.children();
    match node.operator() {
        Operator::RootNode => match children {
            [only] => build_node(graph, only, symbols),
            _ => Err(ConvertError::RootNode(format!("{} children", children.len()))),
        },
        Operator::Add => fold_children(graph, node, symbols, BinaryOp::Add),
        Operator::Mul => fold_children(graph, node, symbols, BinaryOp::Mul),
        Operator::Sub => fold_children(graph, node, symbols, BinaryOp::Sub),
        Operator::Div => fold_children(graph, node, symbols, BinaryOp::Div),
        Operator::Exp => match children {
            [base, exponent] => {
                let base = build_node(graph, base, symbols)?;
                // x^2 is common enough to deserve the cheaper square
                if let Operator::Const { value: Value::Int(2) } = exponent.operator() {
                    return Ok(graph.sq(base)?);
                }
                let exponent = build_node(graph, exponent, symbols)?;
                Ok(graph.pow(base, exponent)?)
            }
            _ => Err(ConvertError::UnsupportedOperator(format!(
                "^ with {} operands",
                children.len()
            ))),
        },
        Operator::Neg => match children {
            [x] => {
                let x = build_node(graph, x, symbols)?;
                Ok(graph.neg(x)?)
            }
            _ => Err(ConvertError::UnsupportedOperator(format!(
                "unary minus with {} operands",
                children.len()
            ))),
        },
        Operator::Const { value } => Ok(graph.scalar(constant_of(value)?)),
        Operator::VariableIdentifierRead { identifier } => symbols
            .get(identifier.as_str())
            .copied()
            .ok_or_else(|| ConvertError::VariableNotFound(identifier.to_string())),
        Operator::FunctionIdentifier { identifier } => {
            let op = function_op(identifier).ok_or_else(|| ConvertError::UnsupportedFunction(identifier.to_string()))?;
            match children {
                [arg] => {
                    let x = build_node(graph, arg, symbols)?;
                    Ok(graph.unary(op, x)?)
                }
                _ => Err(ConvertError::UnsupportedFunction(format!(
                    "{identifier} takes one argument"
                ))),
            }
        }
        other => Err(ConvertError::UnsupportedOperator(format!("{other:?}"))),
    }
}

/// Parses an expression string into graph nodes.
///
/// # Arguments
/// * `graph` - Graph to build in
/// * `text` - Expression in evalexpr syntax
/// * `symbols` - Graph expressions identifiers resolve to
///
/// # Errors
/// `ConvertError::Parse` for invalid syntax, `VariableNotFound` for an identifier
/// missing from `symbols`, `Graph` if an operation rejects its operands.
pub fn parse_expression(graph: &mut Graph, text: &str, symbols: &HashMap<String, Mx>) -> Result<Mx, ConvertError> {
    let tree = build_operator_tree::<DefaultNumericTypes>(text)?;
    build_node(graph, &tree, symbols)
}

/// Parses an expression string, creating one scalar symbol per identifier.
///
/// # Returns
/// The expression and its symbols sorted by name.
pub fn parse_with_symbols(graph: &mut Graph, text: &str) -> Result<(Mx, Vec<(String, Mx)>), ConvertError> {
    let tree = build_operator_tree::<DefaultNumericTypes>(text)?;
    let names: BTreeSet<String> = tree.iter_read_variable_identifiers().map(str::to_string).collect();
    let symbols: Vec<(String, Mx)> = names
        .into_iter()
        .map(|name| {
            let x = graph.sym(name.clone(), 1, 1);
            (name, x)
        })
        .collect();
    let lookup: HashMap<String, Mx> = symbols.iter().cloned().collect();
    let expr = build_node(graph, &tree, &lookup)?;
    Ok((expr, symbols))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;
    use crate::matrix::Matrix;
    use crate::sparsity::Shape;
    use approx::assert_relative_eq;

    fn eval_scalar(text: &str, values: &[f64]) -> f64 {
        let mut g = Graph::new();
        let (expr, symbols) = parse_with_symbols(&mut g, text).unwrap();
        let inputs: Vec<Mx> = symbols.iter().map(|(_, x)| *x).collect();
        let f = Function::new("f", &g, &inputs, &[expr]).unwrap();
        let args: Vec<Matrix> = values.iter().map(|&v| Matrix::scalar(v)).collect();
        f.evaluate(&args).unwrap()[0].get(0, 0)
    }

    #[test]
    fn test_arithmetic() {
        assert_relative_eq!(eval_scalar("2*x + y^2", &[1.0, 2.0]), 6.0);
        assert_relative_eq!(eval_scalar("x - y - 1", &[5.0, 2.0]), 2.0);
        assert_relative_eq!(eval_scalar("-x / 4", &[2.0]), -0.5);
        assert_relative_eq!(eval_scalar("x^0.5", &[9.0]), 3.0, epsilon = 1e-12);
        assert_relative_eq!(eval_scalar("(a + b) * c", &[1.0, 2.0, 3.0]), 9.0);
    }

    #[test]
    fn test_functions() {
        let x = 0.4;
        let cases: [(&str, f64); 17] = [
            ("abs(x)", x),
            ("ln(x)", x.ln()),
            ("log(x)", x.ln()),
            ("sqrt(x)", x.sqrt()),
            ("exp(x)", x.exp()),
            ("sin(x)", x.sin()),
            ("cos(x)", x.cos()),
            ("tan(x)", x.tan()),
            ("asin(x)", x.asin()),
            ("acos(x)", x.acos()),
            ("atan(x)", x.atan()),
            ("sinh(x)", x.sinh()),
            ("cosh(x)", x.cosh()),
            ("tanh(x)", x.tanh()),
            ("floor(x)", 0.0),
            ("ceil(x)", 1.0),
            ("sign(x)", 1.0),
        ];
        for (text, expected) in cases {
            assert_relative_eq!(eval_scalar(text, &[x]), expected, epsilon = 1e-14);
        }
    }

    #[test]
    fn test_symbols_are_sorted() {
        let mut g = Graph::new();
        let (_, symbols) = parse_with_symbols(&mut g, "z * a + m").unwrap();
        let names: Vec<&str> = symbols.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["a", "m", "z"]);
    }

    #[test]
    fn test_scalars_broadcast() {
        let mut g = Graph::new();
        let v = g.sym("v", 3, 1);
        let symbols = HashMap::from([("v".to_string(), v)]);
        let expr = parse_expression(&mut g, "2*v + 1", &symbols).unwrap();
        assert_eq!(g.shape(expr), Shape::new(3, 1));
        let f = Function::new("f", &g, &[v], &[expr]).unwrap();
        let out = f.evaluate(&[Matrix::column(&[0.0, 1.0, 2.0])]).unwrap();
        assert_eq!(out[0].nonzeros(), &[1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_errors() {
        let mut g = Graph::new();
        let symbols = HashMap::new();
        assert!(matches!(
            parse_expression(&mut g, "x + 1", &symbols),
            Err(ConvertError::VariableNotFound(name)) if name == "x"
        ));
        let mut g = Graph::new();
        assert!(matches!(
            parse_with_symbols(&mut g, "erf(x)"),
            Err(ConvertError::UnsupportedFunction(_))
        ));
        assert!(matches!(
            parse_with_symbols(&mut g, "x % 2"),
            Err(ConvertError::UnsupportedOperator(_))
        ));
        assert!(matches!(parse_with_symbols(&mut g, "x +"), Err(ConvertError::Parse(_))));

        let a = g.sym("a", 2, 1);
        let b = g.sym("b", 3, 1);
        let symbols = HashMap::from([("a".to_string(), a), ("b".to_string(), b)]);
        assert!(matches!(
            parse_expression(&mut g, "a + b", &symbols),
            Err(ConvertError::Graph(_))
        ));
    }
}
