//! Check expression algebra.
//!
//! A pure, side-effect-free expression sub-language mirroring the IR's
//! value expressions, plus the two result forms (`Result`, named result
//! temporaries) and an explicit `Field(root, struct, field)` access. Check
//! expressions are total and referentially transparent: evaluating one
//! never changes program state, so the injector is free to materialise
//! them into shared temporaries.
//!
//! Three conversions live here:
//!
//! - [`CheckExpression::from_vir`] - verifier AST to algebra (the shape
//!   residual checks and branch conditions arrive in);
//! - [`CheckExpression::from_ir`] - IR specification values to algebra,
//!   with formal-to-actual substitution (used by the permission walk);
//! - [`CheckExpression::to_ir`] - algebra back to executable IR at a
//!   concrete program point.

use crate::error::{Result, WeaverError};
use gv_ir::program::{BinaryOp, Expression, UnaryOp};
use gv_ir::vir::{VirBinaryOp, VirExpr, VirExprKind, VirUnaryOp};
use std::collections::HashMap;

/// Verifier-side field names that encode a pointer dereference rather
/// than a struct field. One sentinel per pointable base kind.
pub const POINTER_SENTINELS: [&str; 3] = ["$int_value", "$bool_value", "$ref_value"];

/// The verifier's name for the method result.
pub const RESULT_VAR: &str = "$result";

/// Prefix of verifier-introduced result temporaries.
pub const RESULT_TEMP_PREFIX: &str = "$res_";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CheckExpression {
    IntLit(i64),
    CharLit(char),
    BoolLit(bool),
    StringLit(String),
    Null,
    Var(String),
    /// A named result temporary introduced by the verifier
    ResultVar(String),
    /// The enclosing method's return value
    Result,
    Binary {
        op: BinaryOp,
        left: Box<CheckExpression>,
        right: Box<CheckExpression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<CheckExpression>,
    },
    Field {
        root: Box<CheckExpression>,
        struct_name: String,
        field: String,
    },
    Deref(Box<CheckExpression>),
    Cond {
        cond: Box<CheckExpression>,
        then: Box<CheckExpression>,
        otherwise: Box<CheckExpression>,
    },
}

impl CheckExpression {
    pub fn not(operand: CheckExpression) -> CheckExpression {
        CheckExpression::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    pub fn binary(op: BinaryOp, left: CheckExpression, right: CheckExpression) -> CheckExpression {
        CheckExpression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }
}

fn lower_vir_binop(op: VirBinaryOp) -> BinaryOp {
    match op {
        VirBinaryOp::Add => BinaryOp::Add,
        VirBinaryOp::Subtract => BinaryOp::Subtract,
        VirBinaryOp::Multiply => BinaryOp::Multiply,
        VirBinaryOp::Divide => BinaryOp::Divide,
        VirBinaryOp::And => BinaryOp::And,
        VirBinaryOp::Or => BinaryOp::Or,
        VirBinaryOp::Equal => BinaryOp::Equal,
        VirBinaryOp::NotEqual => BinaryOp::NotEqual,
        VirBinaryOp::Less => BinaryOp::Less,
        VirBinaryOp::LessEq => BinaryOp::LessEq,
        VirBinaryOp::Greater => BinaryOp::Greater,
        VirBinaryOp::GreaterEq => BinaryOp::GreaterEq,
    }
}

impl CheckExpression {
    /// Translate a verifier expression into the algebra.
    ///
    /// `method` names the enclosing method for diagnostics only. Fails on
    /// any verifier construct the algebra does not model.
    pub fn from_vir(expr: &VirExpr, method: &str) -> Result<CheckExpression> {
        match &expr.kind {
            VirExprKind::IntLit(v) => Ok(CheckExpression::IntLit(*v)),
            VirExprKind::CharLit(c) => Ok(CheckExpression::CharLit(*c)),
            VirExprKind::BoolLit(b) => Ok(CheckExpression::BoolLit(*b)),
            VirExprKind::StringLit(s) => Ok(CheckExpression::StringLit(s.clone())),
            VirExprKind::NullLit => Ok(CheckExpression::Null),
            VirExprKind::LocalVar(name) => {
                if name == RESULT_VAR {
                    Ok(CheckExpression::Result)
                } else if name.starts_with(RESULT_TEMP_PREFIX) {
                    Ok(CheckExpression::ResultVar(name.clone()))
                } else {
                    Ok(CheckExpression::Var(name.clone()))
                }
            }
            VirExprKind::Binary { op, left, right } => {
                let left = Self::from_vir(left, method)?;
                let right = Self::from_vir(right, method)?;
                // `!=` is not primitive in the algebra
                if *op == VirBinaryOp::NotEqual {
                    Ok(Self::not(Self::binary(BinaryOp::Equal, left, right)))
                } else {
                    Ok(Self::binary(lower_vir_binop(*op), left, right))
                }
            }
            VirExprKind::Unary { op, operand } => match op {
                VirUnaryOp::Not => {
                    // collapse double negation
                    if let VirExprKind::Unary {
                        op: VirUnaryOp::Not,
                        operand: inner,
                    } = &operand.kind
                    {
                        Self::from_vir(inner, method)
                    } else {
                        Ok(Self::not(Self::from_vir(operand, method)?))
                    }
                }
                VirUnaryOp::Negate => Ok(CheckExpression::Unary {
                    op: UnaryOp::Negate,
                    operand: Box::new(Self::from_vir(operand, method)?),
                }),
            },
            VirExprKind::FieldAccess { receiver, field } => {
                let root = Self::from_vir(receiver, method)?;
                if POINTER_SENTINELS.contains(&field.as_str()) {
                    return Ok(CheckExpression::Deref(Box::new(root)));
                }
                match field.split_once('$') {
                    Some((struct_name, field_name))
                        if !struct_name.is_empty() && !field_name.is_empty() =>
                    {
                        Ok(CheckExpression::Field {
                            root: Box::new(root),
                            struct_name: struct_name.to_string(),
                            field: field_name.to_string(),
                        })
                    }
                    _ => Err(WeaverError::InvalidExpression {
                        node: expr.id,
                        detail: format!(
                            "field name '{}' does not follow the struct$field convention",
                            field
                        ),
                    }),
                }
            }
            VirExprKind::Cond {
                cond,
                then,
                otherwise,
            } => Ok(CheckExpression::Cond {
                cond: Box::new(Self::from_vir(cond, method)?),
                then: Box::new(Self::from_vir(then, method)?),
                otherwise: Box::new(Self::from_vir(otherwise, method)?),
            }),
            VirExprKind::FieldAccessPredicate { .. }
            | VirExprKind::PredicateAccess { .. }
            | VirExprKind::PredicateAccessPredicate { .. }
            | VirExprKind::Imprecise { .. } => Err(WeaverError::InvalidExpression {
                node: expr.id,
                detail: "permission or imprecision form where a value is required".to_string(),
            }),
        }
    }
}

/// Variable resolution used by [`CheckExpression::from_ir`].
///
/// `Identity` keeps variables as-is (specifications evaluated in their own
/// method's scope); `Call` substitutes a callee's formals with the actual
/// arguments at one call site.
pub(crate) enum VarMap {
    Identity,
    Call {
        method: String,
        formals: HashMap<String, CheckExpression>,
        result: Option<CheckExpression>,
    },
}

impl VarMap {
    fn resolve(&self, name: &str) -> Result<CheckExpression> {
        match self {
            VarMap::Identity => Ok(CheckExpression::Var(name.to_string())),
            VarMap::Call {
                method, formals, ..
            } => formals
                .get(name)
                .cloned()
                .ok_or_else(|| WeaverError::UnknownVariable {
                    method: method.clone(),
                    name: name.to_string(),
                }),
        }
    }

    fn resolve_result(&self) -> Result<CheckExpression> {
        match self {
            VarMap::Identity => Ok(CheckExpression::Result),
            VarMap::Call { method, result, .. } => {
                result
                    .clone()
                    .ok_or_else(|| WeaverError::UnknownVariable {
                        method: method.clone(),
                        name: RESULT_VAR.to_string(),
                    })
            }
        }
    }
}

impl CheckExpression {
    /// Convert an IR specification value into the algebra, resolving
    /// variables through `vars`. Specification-only forms are rejected:
    /// permissions are enumerated by the caller, never nested as values.
    pub(crate) fn from_ir(expr: &Expression, vars: &VarMap) -> Result<CheckExpression> {
        match expr {
            Expression::IntLit(v) => Ok(CheckExpression::IntLit(*v)),
            Expression::CharLit(c) => Ok(CheckExpression::CharLit(*c)),
            Expression::BoolLit(b) => Ok(CheckExpression::BoolLit(*b)),
            Expression::StringLit(s) => Ok(CheckExpression::StringLit(s.clone())),
            Expression::Null => Ok(CheckExpression::Null),
            Expression::Var(name) => vars.resolve(name),
            Expression::Result => vars.resolve_result(),
            Expression::Binary { op, left, right } => Ok(Self::binary(
                *op,
                Self::from_ir(left, vars)?,
                Self::from_ir(right, vars)?,
            )),
            Expression::Unary { op, operand } => Ok(CheckExpression::Unary {
                op: *op,
                operand: Box::new(Self::from_ir(operand, vars)?),
            }),
            Expression::Cond {
                cond,
                then,
                otherwise,
            } => Ok(CheckExpression::Cond {
                cond: Box::new(Self::from_ir(cond, vars)?),
                then: Box::new(Self::from_ir(then, vars)?),
                otherwise: Box::new(Self::from_ir(otherwise, vars)?),
            }),
            Expression::Member {
                root,
                struct_name,
                field,
            } => Ok(CheckExpression::Field {
                root: Box::new(Self::from_ir(root, vars)?),
                struct_name: struct_name.clone(),
                field: field.clone(),
            }),
            Expression::Deref(operand) => Ok(CheckExpression::Deref(Box::new(Self::from_ir(
                operand, vars,
            )?))),
            Expression::Accessibility(_)
            | Expression::PredicateInstance { .. }
            | Expression::Imprecise(_) => Err(WeaverError::invalid_spec(
                "permission or imprecision form nested in value position",
            )),
        }
    }

    /// Lower the expression back to executable IR.
    ///
    /// `result_var` supplies the IR variable standing in for the method
    /// result (or a call's returned value) at this program point; result
    /// forms fail without one.
    pub fn to_ir(&self, result_var: Option<&str>) -> Result<Expression> {
        match self {
            CheckExpression::IntLit(v) => Ok(Expression::IntLit(*v)),
            CheckExpression::CharLit(c) => Ok(Expression::CharLit(*c)),
            CheckExpression::BoolLit(b) => Ok(Expression::BoolLit(*b)),
            CheckExpression::StringLit(s) => Ok(Expression::StringLit(s.clone())),
            CheckExpression::Null => Ok(Expression::Null),
            CheckExpression::Var(name) => Ok(Expression::Var(name.clone())),
            CheckExpression::Result | CheckExpression::ResultVar(_) => result_var
                .map(|v| Expression::Var(v.to_string()))
                .ok_or_else(|| {
                    WeaverError::invalid_spec("result reference outside a result-bearing location")
                }),
            CheckExpression::Binary { op, left, right } => Ok(Expression::Binary {
                op: *op,
                left: Box::new(left.to_ir(result_var)?),
                right: Box::new(right.to_ir(result_var)?),
            }),
            CheckExpression::Unary { op, operand } => Ok(Expression::Unary {
                op: *op,
                operand: Box::new(operand.to_ir(result_var)?),
            }),
            CheckExpression::Field {
                root,
                struct_name,
                field,
            } => Ok(Expression::Member {
                root: Box::new(root.to_ir(result_var)?),
                struct_name: struct_name.clone(),
                field: field.clone(),
            }),
            CheckExpression::Deref(operand) => {
                Ok(Expression::Deref(Box::new(operand.to_ir(result_var)?)))
            }
            CheckExpression::Cond {
                cond,
                then,
                otherwise,
            } => Ok(Expression::Cond {
                cond: Box::new(cond.to_ir(result_var)?),
                then: Box::new(then.to_ir(result_var)?),
                otherwise: Box::new(otherwise.to_ir(result_var)?),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gv_ir::vir::NodeId;

    fn vir(id: u64, kind: VirExprKind) -> VirExpr {
        VirExpr {
            id: NodeId(id),
            kind,
        }
    }

    #[test]
    fn not_equal_lowers_to_negated_equality() {
        let e = vir(
            0,
            VirExprKind::Binary {
                op: VirBinaryOp::NotEqual,
                left: Box::new(vir(1, VirExprKind::LocalVar("a".to_string()))),
                right: Box::new(vir(2, VirExprKind::IntLit(0))),
            },
        );
        let lowered = CheckExpression::from_vir(&e, "m").unwrap();
        assert_eq!(
            lowered,
            CheckExpression::not(CheckExpression::binary(
                BinaryOp::Equal,
                CheckExpression::Var("a".to_string()),
                CheckExpression::IntLit(0),
            ))
        );
    }

    #[test]
    fn double_negation_collapses() {
        let inner = vir(2, VirExprKind::LocalVar("x".to_string()));
        let e = vir(
            0,
            VirExprKind::Unary {
                op: VirUnaryOp::Not,
                operand: Box::new(vir(
                    1,
                    VirExprKind::Unary {
                        op: VirUnaryOp::Not,
                        operand: Box::new(inner),
                    },
                )),
            },
        );
        assert_eq!(
            CheckExpression::from_vir(&e, "m").unwrap(),
            CheckExpression::Var("x".to_string())
        );
    }

    #[test]
    fn pointer_sentinel_becomes_deref() {
        let e = vir(
            0,
            VirExprKind::FieldAccess {
                receiver: Box::new(vir(1, VirExprKind::LocalVar("p".to_string()))),
                field: "$int_value".to_string(),
            },
        );
        assert_eq!(
            CheckExpression::from_vir(&e, "m").unwrap(),
            CheckExpression::Deref(Box::new(CheckExpression::Var("p".to_string())))
        );
    }

    #[test]
    fn qualified_field_name_splits_into_struct_and_field() {
        let e = vir(
            0,
            VirExprKind::FieldAccess {
                receiver: Box::new(vir(1, VirExprKind::LocalVar("n".to_string()))),
                field: "node$next".to_string(),
            },
        );
        let lowered = CheckExpression::from_vir(&e, "m").unwrap();
        assert_eq!(
            lowered,
            CheckExpression::Field {
                root: Box::new(CheckExpression::Var("n".to_string())),
                struct_name: "node".to_string(),
                field: "next".to_string(),
            }
        );
    }

    #[test]
    fn unqualified_field_name_is_rejected() {
        let e = vir(
            0,
            VirExprKind::FieldAccess {
                receiver: Box::new(vir(1, VirExprKind::LocalVar("n".to_string()))),
                field: "next".to_string(),
            },
        );
        assert!(CheckExpression::from_vir(&e, "m").is_err());
    }

    #[test]
    fn result_names_map_to_result_forms() {
        let r = vir(0, VirExprKind::LocalVar("$result".to_string()));
        assert_eq!(
            CheckExpression::from_vir(&r, "m").unwrap(),
            CheckExpression::Result
        );

        let tmp = vir(1, VirExprKind::LocalVar("$res_1".to_string()));
        assert_eq!(
            CheckExpression::from_vir(&tmp, "m").unwrap(),
            CheckExpression::ResultVar("$res_1".to_string())
        );
    }

    #[test]
    fn to_ir_requires_a_result_variable_for_result_forms() {
        assert!(CheckExpression::Result.to_ir(None).is_err());
        assert_eq!(
            CheckExpression::Result.to_ir(Some("_result")).unwrap(),
            Expression::Var("_result".to_string())
        );
    }
}
