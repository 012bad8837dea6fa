//! Condition-variable materialisation and runtime-check lowering.
//!
//! Every surviving condition term becomes a boolean temporary assigned at
//! its location: unconditional terms get a plain assignment, guarded
//! terms default to `false` and assign under their `when` expression.
//! Materialisation order equals term-id order, so a term's guard only
//! ever reads temporaries that already hold their value.
//!
//! Runtime checks lower to `if (when) { <assertion>; }`: expression
//! checks to an imperative `assert`, permission checks to the runtime
//! interface calls. Everything lands in a per-location [`Slot`] that the
//! orchestrator splices into the method body.

use crate::check::{Check, ConditionTerm, FieldPermission, Location, PredicatePermission};
use crate::collector::CollectedMethod;
use crate::error::{Result, WeaverError};
use crate::logic::Disjunction;
use crate::runtime;
use gv_ir::program::{BinaryOp, Block, Expression, Op, OpId, OpKind, UnaryOp};
use std::collections::HashMap;

use super::{IdGen, Names, StructTable};

/// Checks and temporaries scheduled at one location.
#[derive(Default)]
pub(super) struct Slot {
    /// Condition-variable materialisations, in term-id order
    pub conds: Vec<Op>,
    /// Separation checks, kept apart so boundary emission can order them
    /// against permission transfers (and call-site prologues can realise
    /// them inline during population)
    pub seps: Vec<Op>,
    /// Expression and accessibility checks, in first-seen order
    pub checks: Vec<Op>,
}

impl Slot {
    pub fn is_empty(&self) -> bool {
        self.conds.is_empty() && self.seps.is_empty() && self.checks.is_empty()
    }
}

/// Name of the temporary holding condition term `id`.
pub(super) fn cond_var(names: &Names, id: u32) -> String {
    format!("{}{}", names.cond_prefix, id)
}

/// Fold a DNF guard into an executable boolean expression over the
/// already-materialised condition temporaries.
pub(super) fn fold_when(when: &Disjunction, names: &Names) -> Expression {
    let mut disjuncts = when.0.iter().map(|conj| {
        let mut literals = conj.iter().map(|t| {
            let var = Expression::Var(cond_var(names, t.term));
            if t.polarity {
                var
            } else {
                Expression::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(var),
                }
            }
        });
        match literals.next() {
            None => Expression::BoolLit(true),
            Some(first) => literals.fold(first, |acc, lit| Expression::Binary {
                op: BinaryOp::And,
                left: Box::new(acc),
                right: Box::new(lit),
            }),
        }
    });
    match disjuncts.next() {
        None => Expression::BoolLit(false),
        Some(first) => disjuncts.fold(first, |acc, d| Expression::Binary {
            op: BinaryOp::Or,
            left: Box::new(acc),
            right: Box::new(d),
        }),
    }
}

/// Wrap an assertion in its guard, when it has one.
fn guarded(guard: Option<Expression>, inner: Op, ids: &mut IdGen) -> Op {
    match guard {
        None => inner,
        Some(cond) => Op {
            id: ids.fresh(),
            kind: OpKind::If {
                cond,
                then_branch: Block(vec![inner]),
                else_branch: Block::new(),
            },
        },
    }
}

/// The IR variable standing in for a result reference at a location:
/// the method's result temporary on exit paths, a call's target after
/// the call, nothing elsewhere.
pub(super) fn result_var_for<'a>(
    location: Location,
    invoke_targets: &'a HashMap<OpId, Option<String>>,
    names: &'a Names,
) -> Option<&'a str> {
    match location {
        Location::MethodPost => Some(&names.result),
        Location::Post(op) => invoke_targets
            .get(&op)
            .and_then(|t| t.as_deref()),
        _ => None,
    }
}

/// Materialise one condition term at its location.
fn materialize_term(
    term: &ConditionTerm,
    names: &Names,
    invoke_targets: &HashMap<OpId, Option<String>>,
    ids: &mut IdGen,
    out: &mut Vec<Op>,
) -> Result<()> {
    // id order is materialisation order; a guard reading a term that is
    // not materialised yet means the input's encounter-order invariant
    // was violated
    if let Some(max) = term.when.referenced_terms().into_iter().max()
        && max >= term.id
    {
        return Err(WeaverError::invalid_spec(format!(
            "condition term {} guarded by a later term {}",
            term.id, max
        )));
    }

    let result_var = result_var_for(term.location, invoke_targets, names);
    let value = term.value.to_ir(result_var)?;
    let var = cond_var(names, term.id);

    if term.is_unconditional() {
        out.push(Op {
            id: ids.fresh(),
            kind: OpKind::Assign { target: var, value },
        });
    } else {
        out.push(Op {
            id: ids.fresh(),
            kind: OpKind::Assign {
                target: var.clone(),
                value: Expression::BoolLit(false),
            },
        });
        let assign = Op {
            id: ids.fresh(),
            kind: OpKind::Assign { target: var, value },
        };
        out.push(guarded(Some(fold_when(&term.when, names)), assign, ids));
    }
    Ok(())
}

/// The woven `obj._id` expression of a field permission.
pub(super) fn permission_object_id(
    perm: &FieldPermission,
    structs: &StructTable,
    names: &Names,
    result_var: Option<&str>,
) -> Result<Expression> {
    let root = perm.root.to_ir(result_var)?;
    if !structs.contains(&perm.struct_name) {
        return Err(WeaverError::invalid_spec(format!(
            "permission over unknown struct '{}'",
            perm.struct_name
        )));
    }
    Ok(Expression::Member {
        root: Box::new(root),
        struct_name: perm.struct_name.clone(),
        field: names.id_field.clone(),
    })
}

fn lower_field_accessibility(
    perm: &FieldPermission,
    structs: &StructTable,
    names: &Names,
    result_var: Option<&str>,
    ids: &mut IdGen,
) -> Result<Op> {
    let obj_id = permission_object_id(perm, structs, names, result_var)?;
    let field_index = structs.field_index(&perm.struct_name, &perm.field)?;
    Ok(runtime::assert_acc(
        ids.fresh(),
        Expression::Var(names.dynamic.clone()),
        obj_id,
        field_index,
    ))
}

fn lower_field_separation(
    perm: &FieldPermission,
    structs: &StructTable,
    names: &Names,
    result_var: Option<&str>,
    ids: &mut IdGen,
) -> Result<Op> {
    let obj_id = permission_object_id(perm, structs, names, result_var)?;
    let field_index = structs.field_index(&perm.struct_name, &perm.field)?;
    Ok(runtime::assert_disjoint_acc(
        ids.fresh(),
        Expression::Var(names.statics.clone()),
        Expression::Var(names.dynamic.clone()),
        obj_id,
        field_index,
    ))
}

fn lower_predicate_args(
    perm: &PredicatePermission,
    result_var: Option<&str>,
) -> Result<Vec<Expression>> {
    perm.args.iter().map(|a| a.to_ir(result_var)).collect()
}

/// Build the full check schedule of one collected method.
pub(super) fn build_schedule(
    collected: &CollectedMethod,
    structs: &StructTable,
    names: &Names,
    invoke_targets: &HashMap<OpId, Option<String>>,
    ids: &mut IdGen,
) -> Result<HashMap<Location, Slot>> {
    let mut schedule: HashMap<Location, Slot> = HashMap::new();

    // condition temporaries first: a check at a location may read terms
    // materialised at the same location
    for term in &collected.conditions {
        let slot = schedule.entry(term.location).or_default();
        materialize_term(term, names, invoke_targets, ids, &mut slot.conds)?;
    }

    for rc in &collected.checks {
        let result_var = result_var_for(rc.location, invoke_targets, names);
        let guard = rc.when.as_ref().map(|w| fold_when(w, names));
        let slot = schedule.entry(rc.location).or_default();
        match &rc.check {
            Check::Expr(expr) => {
                let inner = Op {
                    id: ids.fresh(),
                    kind: OpKind::Assert {
                        value: expr.to_ir(result_var)?,
                        kind: gv_ir::program::AssertKind::Imperative,
                    },
                };
                slot.checks.push(guarded(guard, inner, ids));
            }
            Check::FieldAccessibility(perm) => {
                let inner = lower_field_accessibility(perm, structs, names, result_var, ids)?;
                slot.checks.push(guarded(guard, inner, ids));
            }
            Check::FieldSeparation(perm) => {
                let inner = lower_field_separation(perm, structs, names, result_var, ids)?;
                slot.seps.push(guarded(guard, inner, ids));
            }
            Check::PredicateAccessibility(perm) => {
                let inner = runtime::assert_pred_acc(
                    ids.fresh(),
                    Expression::Var(names.dynamic.clone()),
                    &perm.name,
                    lower_predicate_args(perm, result_var)?,
                );
                slot.checks.push(guarded(guard, inner, ids));
            }
            Check::PredicateSeparation(perm) => {
                let inner = runtime::assert_disjoint_pred_acc(
                    ids.fresh(),
                    Expression::Var(names.statics.clone()),
                    Expression::Var(names.dynamic.clone()),
                    &perm.name,
                    lower_predicate_args(perm, result_var)?,
                );
                slot.seps.push(guarded(guard, inner, ids));
            }
        }
    }

    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::CheckExpression;
    use crate::logic::Conjunction;

    fn names() -> Names {
        Names::default()
    }

    #[test]
    fn fold_when_of_empty_disjunction_is_false() {
        assert_eq!(
            fold_when(&Disjunction::new(), &names()),
            Expression::BoolLit(false)
        );
    }

    #[test]
    fn fold_when_of_empty_conjunction_is_true() {
        let d = Disjunction::singleton(Conjunction::new());
        assert_eq!(fold_when(&d, &names()), Expression::BoolLit(true));
    }

    #[test]
    fn fold_when_negates_by_polarity() {
        let mut c = Conjunction::new();
        c.insert(0, false);
        let folded = fold_when(&Disjunction::singleton(c), &names());
        assert_eq!(
            folded,
            Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(Expression::Var("_cond_0".to_string())),
            }
        );
    }

    #[test]
    fn unconditional_term_is_a_plain_assignment() {
        let term = ConditionTerm {
            id: 0,
            location: Location::MethodPre,
            value: CheckExpression::Var("b".to_string()),
            when: Disjunction::singleton(Conjunction::new()),
        };
        let mut ids = IdGen::new(100);
        let mut out = Vec::new();
        materialize_term(&term, &names(), &HashMap::new(), &mut ids, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].kind, OpKind::Assign { .. }));
    }

    #[test]
    fn guarded_term_defaults_to_false() {
        let mut ctx = Conjunction::new();
        ctx.insert(0, true);
        let term = ConditionTerm {
            id: 1,
            location: Location::MethodPre,
            value: CheckExpression::Var("b".to_string()),
            when: Disjunction::singleton(ctx),
        };
        let mut ids = IdGen::new(100);
        let mut out = Vec::new();
        materialize_term(&term, &names(), &HashMap::new(), &mut ids, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        match &out[0].kind {
            OpKind::Assign { value, .. } => assert_eq!(*value, Expression::BoolLit(false)),
            other => panic!("expected default assignment, got {:?}", other),
        }
        assert!(matches!(out[1].kind, OpKind::If { .. }));
    }

    #[test]
    fn term_guarded_by_later_term_is_rejected() {
        let mut ctx = Conjunction::new();
        ctx.insert(5, true);
        let term = ConditionTerm {
            id: 1,
            location: Location::MethodPre,
            value: CheckExpression::Var("b".to_string()),
            when: Disjunction::singleton(ctx),
        };
        let mut ids = IdGen::new(100);
        let mut out = Vec::new();
        let res = materialize_term(&term, &names(), &HashMap::new(), &mut ids, &mut out);
        assert!(res.is_err());
    }
}
