//! Row predicates of CHECK constraints and partial indexes.
//!
//! Evaluation uses three-valued logic: a comparison involving a null column
//! is unknown (`None`).

use std::cmp::Ordering;

use thiserror::Error;

use crate::schema::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(&self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord.is_eq(),
            Self::Ne => ord.is_ne(),
            Self::Lt => ord.is_lt(),
            Self::Le => ord.is_le(),
            Self::Gt => ord.is_gt(),
            Self::Ge => ord.is_ge(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Cmp { column: usize, op: CmpOp, value: Value },
    IsNull(usize),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("cannot compare column {column} with {value:?}")]
pub struct TypeMismatch {
    pub column: usize,
    pub value: Value,
}

impl Expr {
    pub fn cmp(column: usize, op: CmpOp, value: Value) -> Self {
        Self::Cmp { column, op, value }
    }

    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    pub fn eval(&self, row: &[Value]) -> Result<Option<bool>, TypeMismatch> {
        let res = match self {
            Self::Cmp { column, op, value } => {
                let lhs = row.get(*column).unwrap_or(&Value::Null);
                if lhs.is_null() || value.is_null() {
                    return Ok(None);
                }
                let ord = lhs.compare(value).ok_or_else(|| TypeMismatch {
                    column: *column,
                    value: value.clone(),
                })?;
                Some(op.holds(ord))
            }
            Self::IsNull(column) => Some(row.get(*column).is_none_or(Value::is_null)),
            Self::And(a, b) => match (a.eval(row)?, b.eval(row)?) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Self::Or(a, b) => match (a.eval(row)?, b.eval(row)?) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
            Self::Not(a) => a.eval(row)?.map(|b| !b),
        };
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_valued_logic() {
        let row = [Value::Int(5), Value::Null];
        let gt = Expr::cmp(0, CmpOp::Gt, Value::Int(3));
        let null_cmp = Expr::cmp(1, CmpOp::Eq, Value::Int(1));

        assert_eq!(gt.eval(&row), Ok(Some(true)));
        assert_eq!(null_cmp.eval(&row), Ok(None));
        assert_eq!(gt.clone().and(null_cmp.clone()).eval(&row), Ok(None));
        assert_eq!(gt.clone().or(null_cmp.clone()).eval(&row), Ok(Some(true)));
        assert_eq!(gt.clone().not().and(null_cmp.clone()).eval(&row), Ok(Some(false)));
        assert_eq!(Expr::IsNull(1).eval(&row), Ok(Some(true)));
        assert_eq!(null_cmp.not().eval(&row), Ok(None));
    }

    #[test]
    fn mixed_signedness_compares_numerically() {
        let row = [Value::UInt(u64::MAX)];
        assert_eq!(Expr::cmp(0, CmpOp::Gt, Value::Int(-1)).eval(&row), Ok(Some(true)));
        assert!(Expr::cmp(0, CmpOp::Eq, Value::Text("x".into())).eval(&row).is_err());
    }
}
