//! Small arithmetic expressions over a scalar `x`, used by the
//! `function(expr)` tonemap operator.

// wavert
use crate::core::quantity::Float;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(Float),
    Var,
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Call(Func, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Func {
    Log,
    Log10,
    Exp,
    Sqrt,
    Abs,
}

impl Expr {
    pub fn eval(&self, x: Float) -> Float {
        match self {
            Expr::Num(v) => *v,
            Expr::Var => x,
            Expr::Add(a, b) => a.eval(x) + b.eval(x),
            Expr::Sub(a, b) => a.eval(x) - b.eval(x),
            Expr::Mul(a, b) => a.eval(x) * b.eval(x),
            Expr::Div(a, b) => a.eval(x) / b.eval(x),
            Expr::Neg(a) => -a.eval(x),
            Expr::Pow(a, b) => a.eval(x).powf(b.eval(x)),
            Expr::Call(f, a) => {
                let v = a.eval(x);
                match f {
                    Func::Log => v.ln(),
                    Func::Log10 => v.log10(),
                    Func::Exp => v.exp(),
                    Func::Sqrt => v.sqrt(),
                    Func::Abs => v.abs(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_nested_expressions() {
        // sqrt(x) * 2 + 1
        let e = Expr::Add(
            Box::new(Expr::Mul(
                Box::new(Expr::Call(Func::Sqrt, Box::new(Expr::Var))),
                Box::new(Expr::Num(2.0)),
            )),
            Box::new(Expr::Num(1.0)),
        );
        assert!((e.eval(4.0) - 5.0).abs() < 1e-6);
    }
}
