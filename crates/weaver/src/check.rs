//! Check taxonomy: what must hold, and where.
//!
//! A [`RuntimeCheck`] is the collector's unit of output: a [`Check`] at a
//! [`Location`], optionally guarded by a branch-condition formula over
//! interned [`ConditionTerm`]s. Locations are structural - the same
//! operation id and phase always name the same insertion point - which is
//! what lets checks arriving from different verifier branches merge their
//! guards instead of duplicating.

use crate::error::{Result, WeaverError};
use crate::expr::CheckExpression;
use crate::logic::{Disjunction, TermId};
use gv_ir::program::OpId;
use gv_ir::vir::{VirExpr, VirExprKind};

/// An insertion point in a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Location {
    /// On entry, before the first operation
    MethodPre,
    /// On every exit path, after the result is computed
    MethodPost,
    /// Immediately before the operation
    Pre(OpId),
    /// Immediately after the operation
    Post(OpId),
    /// At the top of every iteration of the loop
    LoopStart(OpId),
    /// At the bottom of every iteration of the loop
    LoopEnd(OpId),
}

impl Location {
    /// The operation this location is anchored to, if any.
    pub fn op(&self) -> Option<OpId> {
        match self {
            Location::Pre(op)
            | Location::Post(op)
            | Location::LoopStart(op)
            | Location::LoopEnd(op) => Some(*op),
            Location::MethodPre | Location::MethodPost => None,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::MethodPre => write!(f, "method entry"),
            Location::MethodPost => write!(f, "method exit"),
            Location::Pre(op) => write!(f, "before {}", op),
            Location::Post(op) => write!(f, "after {}", op),
            Location::LoopStart(op) => write!(f, "loop start of {}", op),
            Location::LoopEnd(op) => write!(f, "loop end of {}", op),
        }
    }
}

/// A heap-field permission: `acc(root.field)` with the owning struct
/// resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPermission {
    pub root: CheckExpression,
    pub struct_name: String,
    pub field: String,
}

/// A predicate-instance permission: `name(args..)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredicatePermission {
    pub name: String,
    pub args: Vec<CheckExpression>,
}

/// One residual obligation in weaver form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Check {
    /// The expression must evaluate to true
    Expr(CheckExpression),
    /// The permission must be owned at the location
    FieldAccessibility(FieldPermission),
    /// The permission must be disjoint from every other permission
    /// granted by the same specification
    FieldSeparation(FieldPermission),
    PredicateAccessibility(PredicatePermission),
    PredicateSeparation(PredicatePermission),
}

impl Check {
    /// True for the permission-shaped kinds that require ownership
    /// tracking at run time.
    pub fn needs_tracking(&self) -> bool {
        !matches!(self, Check::Expr(_))
    }

    /// Translate a verifier formula into a check.
    pub fn from_vir(expr: &VirExpr, method: &str) -> Result<Check> {
        match &expr.kind {
            VirExprKind::FieldAccessPredicate { access } => {
                Ok(Check::FieldAccessibility(field_permission(access, method)?))
            }
            VirExprKind::PredicateAccess { name, args } => Ok(Check::PredicateAccessibility(
                predicate_permission(name, args, method)?,
            )),
            VirExprKind::PredicateAccessPredicate { access } => match &access.kind {
                VirExprKind::PredicateAccess { name, args } => Ok(Check::PredicateAccessibility(
                    predicate_permission(name, args, method)?,
                )),
                _ => Err(WeaverError::InvalidExpression {
                    node: access.id,
                    detail: "predicate permission over a non-predicate location".to_string(),
                }),
            },
            _ => Ok(Check::Expr(CheckExpression::from_vir(expr, method)?)),
        }
    }
}

fn field_permission(access: &VirExpr, method: &str) -> Result<FieldPermission> {
    match CheckExpression::from_vir(access, method)? {
        CheckExpression::Field {
            root,
            struct_name,
            field,
        } => Ok(FieldPermission {
            root: *root,
            struct_name,
            field,
        }),
        _ => Err(WeaverError::InvalidExpression {
            node: access.id,
            detail: "field permission over a non-field location".to_string(),
        }),
    }
}

fn predicate_permission(name: &str, args: &[VirExpr], method: &str) -> Result<PredicatePermission> {
    let args = args
        .iter()
        .map(|a| CheckExpression::from_vir(a, method))
        .collect::<Result<Vec<_>>>()?;
    Ok(PredicatePermission {
        name: name.to_string(),
        args,
    })
}

/// An interned branch-condition term: "at `location`, `value` holds,
/// given `when`".
///
/// Terms are interned by `(location, value)` and numbered densely in
/// first-seen order; `when` accumulates the disjunction of the contexts
/// this term was ever asked in, each context a conjunction of terms with
/// smaller ids.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionTerm {
    pub id: TermId,
    pub location: Location,
    pub value: CheckExpression,
    pub when: Disjunction,
}

impl ConditionTerm {
    /// A trivially-true `when` means the term is materialised
    /// unconditionally.
    pub fn is_unconditional(&self) -> bool {
        self.when.is_true()
    }
}

/// A check bound to its insertion point and guard.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeCheck {
    pub location: Location,
    pub check: Check,
    /// Guard under which the check must hold; `None` is unconditional
    pub when: Option<Disjunction>,
}

/// How a method participates in the permission calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStyle {
    /// The entry point: creates the instance counter and permission root
    Main,
    /// Precise pre- and postcondition
    Precise,
    /// Precise precondition, imprecise postcondition
    PrecisePre,
    /// Imprecise precondition
    Imprecise,
}

impl CallStyle {
    /// Methods with any imprecision receive the two permission objects as
    /// extra parameters.
    pub fn takes_permissions(&self) -> bool {
        matches!(self, CallStyle::PrecisePre | CallStyle::Imprecise)
    }

    /// Precise methods receive only the instance counter.
    pub fn takes_counter(&self) -> bool {
        matches!(self, CallStyle::Precise)
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
    fn field_access_predicate_becomes_field_accessibility() {
        let acc = vir(
            0,
            VirExprKind::FieldAccessPredicate {
                access: Box::new(vir(
                    1,
                    VirExprKind::FieldAccess {
                        receiver: Box::new(vir(2, VirExprKind::LocalVar("x".to_string()))),
                        field: "cell$val".to_string(),
                    },
                )),
            },
        );
        match Check::from_vir(&acc, "m").unwrap() {
            Check::FieldAccessibility(p) => {
                assert_eq!(p.root, CheckExpression::Var("x".to_string()));
                assert_eq!(p.struct_name, "cell");
                assert_eq!(p.field, "val");
            }
            other => panic!("expected field accessibility, got {:?}", other),
        }
    }

    #[test]
    fn predicate_access_becomes_predicate_accessibility() {
        let acc = vir(
            0,
            VirExprKind::PredicateAccessPredicate {
                access: Box::new(vir(
                    1,
                    VirExprKind::PredicateAccess {
                        name: "list".to_string(),
                        args: vec![vir(2, VirExprKind::LocalVar("h".to_string()))],
                    },
                )),
            },
        );
        match Check::from_vir(&acc, "m").unwrap() {
            Check::PredicateAccessibility(p) => {
                assert_eq!(p.name, "list");
                assert_eq!(p.args, vec![CheckExpression::Var("h".to_string())]);
            }
            other => panic!("expected predicate accessibility, got {:?}", other),
        }
    }

    #[test]
    fn plain_formula_becomes_expression_check() {
        let e = vir(0, VirExprKind::BoolLit(true));
        assert_eq!(
            Check::from_vir(&e, "m").unwrap(),
            Check::Expr(CheckExpression::BoolLit(true))
        );
    }

    #[test]
    fn only_expression_checks_skip_tracking() {
        assert!(!Check::Expr(CheckExpression::BoolLit(true)).needs_tracking());
        let perm = FieldPermission {
            root: CheckExpression::Var("x".to_string()),
            struct_name: "s".to_string(),
            field: "f".to_string(),
        };
        assert!(Check::FieldAccessibility(perm.clone()).needs_tracking());
        assert!(Check::FieldSeparation(perm).needs_tracking());
    }
}
