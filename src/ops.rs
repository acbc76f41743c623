//! Elementwise operation table.
//!
//! Every unary and binary operation the graph knows is described here once: its numeric
//! value, its display name, its zero-preservation flags (which drive result sparsity),
//! and how it is spelled in generated C code and which libm symbol implements it.

use std::fmt;

/// Elementwise operations of one argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Sq,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Abs,
    Sign,
    Floor,
    Ceil,
    /// Reciprocal `1/x`
    Inv,
}

impl UnaryOp {
    pub const ALL: [UnaryOp; 19] = [
        UnaryOp::Neg,
        UnaryOp::Sqrt,
        UnaryOp::Sq,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Sin,
        UnaryOp::Cos,
        UnaryOp::Tan,
        UnaryOp::Asin,
        UnaryOp::Acos,
        UnaryOp::Atan,
        UnaryOp::Sinh,
        UnaryOp::Cosh,
        UnaryOp::Tanh,
        UnaryOp::Abs,
        UnaryOp::Sign,
        UnaryOp::Floor,
        UnaryOp::Ceil,
        UnaryOp::Inv,
    ];

    pub fn eval(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Sq => x * x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Asin => x.asin(),
            UnaryOp::Acos => x.acos(),
            UnaryOp::Atan => x.atan(),
            UnaryOp::Sinh => x.sinh(),
            UnaryOp::Cosh => x.cosh(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sign => sign(x),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Inv => 1.0 / x,
        }
    }

    /// True if `f(0) == 0`, so structural zeros stay zero.
    pub fn is_zero_preserving(self) -> bool {
        !matches!(
            self,
            UnaryOp::Exp | UnaryOp::Log | UnaryOp::Cos | UnaryOp::Acos | UnaryOp::Cosh | UnaryOp::Inv
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Sq => "sq",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Asin => "asin",
            UnaryOp::Acos => "acos",
            UnaryOp::Atan => "atan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Abs => "fabs",
            UnaryOp::Sign => "sign",
            UnaryOp::Floor => "floor",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Inv => "inv",
        }
    }

    /// C expression computing the operation on the operand `x`.
    pub fn c_expr(self, x: &str) -> String {
        match self {
            UnaryOp::Neg => format!("-{x}"),
            UnaryOp::Sq => format!("{x}*{x}"),
            UnaryOp::Inv => format!("1./{x}"),
            UnaryOp::Sign => format!("({x}>0 ? 1. : ({x}<0 ? -1. : 0.))"),
            op => format!("{}({x})", op.name()),
        }
    }
}

/// Elementwise operations of two arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Atan2,
    Fmax,
    /// One where both arguments are equal, zero elsewhere
    Eq,
}

impl BinaryOp {
    pub const ALL: [BinaryOp; 8] = [
        BinaryOp::Add,
        BinaryOp::Sub,
        BinaryOp::Mul,
        BinaryOp::Div,
        BinaryOp::Pow,
        BinaryOp::Atan2,
        BinaryOp::Fmax,
        BinaryOp::Eq,
    ];

    pub fn eval(self, x: f64, y: f64) -> f64 {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Pow => x.powf(y),
            BinaryOp::Atan2 => x.atan2(y),
            BinaryOp::Fmax => x.max(y),
            BinaryOp::Eq => f64::from(u8::from(x == y)),
        }
    }

    /// True if `f(0, y) == 0` for every `y`.
    pub fn is_lhs_zero_preserving(self) -> bool {
        matches!(self, BinaryOp::Mul | BinaryOp::Div)
    }

    /// True if `f(x, 0) == 0` for every `x`.
    pub fn is_rhs_zero_preserving(self) -> bool {
        matches!(self, BinaryOp::Mul)
    }

    /// True if `f(0, 0) == 0`.
    pub fn is_zero_at_origin(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Atan2 | BinaryOp::Fmax
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul | BinaryOp::Fmax | BinaryOp::Eq)
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Atan2 => "atan2",
            BinaryOp::Fmax => "fmax",
            BinaryOp::Eq => "eq",
        }
    }

    /// Infix symbol, if the operation is printed infix.
    pub fn infix(self) -> Option<&'static str> {
        match self {
            BinaryOp::Add => Some("+"),
            BinaryOp::Sub => Some("-"),
            BinaryOp::Mul => Some("*"),
            BinaryOp::Div => Some("/"),
            BinaryOp::Eq => Some("=="),
            BinaryOp::Pow | BinaryOp::Atan2 | BinaryOp::Fmax => None,
        }
    }

    pub fn c_expr(self, x: &str, y: &str) -> String {
        match self.infix() {
            Some(sym) => format!("{x}{sym}{y}"),
            None => format!("{}({x},{y})", self.name()),
        }
    }
}

fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Abs => "abs",
            op => op.name(),
        })
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_preservation_matches_values() {
        for op in UnaryOp::ALL {
            let at_zero = op.eval(0.0);
            if op.is_zero_preserving() {
                assert_eq!(at_zero, 0.0, "{op}");
            } else {
                assert_ne!(at_zero, 0.0, "{op}");
            }
        }
        for op in BinaryOp::ALL {
            assert_eq!(op.eval(0.0, 0.0) == 0.0, op.is_zero_at_origin(), "{op}");
            if op.is_lhs_zero_preserving() {
                assert_eq!(op.eval(0.0, 3.0), 0.0);
            }
            if op.is_rhs_zero_preserving() {
                assert_eq!(op.eval(3.0, 0.0), 0.0);
            }
        }
    }

    #[test]
    fn test_sign() {
        assert_eq!(UnaryOp::Sign.eval(-2.5), -1.0);
        assert_eq!(UnaryOp::Sign.eval(0.0), 0.0);
        assert_eq!(UnaryOp::Sign.eval(7.0), 1.0);
    }

    #[test]
    fn test_c_expressions() {
        assert_eq!(UnaryOp::Sq.c_expr("w[3]"), "w[3]*w[3]");
        assert_eq!(UnaryOp::Abs.c_expr("a"), "fabs(a)");
        assert_eq!(BinaryOp::Div.c_expr("a", "b"), "a/b");
        assert_eq!(BinaryOp::Pow.c_expr("a", "b"), "pow(a,b)");
        assert_eq!(BinaryOp::Fmax.c_expr("a", "b"), "fmax(a,b)");
        assert_eq!(BinaryOp::Eq.c_expr("a", "b"), "a==b");
    }

    #[test]
    fn test_comparison_ops() {
        assert_eq!(BinaryOp::Fmax.eval(-3.0, 2.0), 2.0);
        assert_eq!(BinaryOp::Eq.eval(2.0, 2.0), 1.0);
        assert_eq!(BinaryOp::Eq.eval(2.0, -2.0), 0.0);
    }
}
