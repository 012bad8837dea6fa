//! Permission enumeration and separation checks.
//!
//! When a permission-shaped residual check lands at a method boundary or
//! at a positioned location (call, loop, fold/unfold, specification
//! assert), runtime checking must also establish that the conjoined
//! permissions of the governing specification are pairwise disjoint - the
//! verifier's separating conjunction says so statically, so the woven
//! program has to say so dynamically.
//!
//! The walk re-traverses the originating specification for each marked
//! location, substituting actual arguments for formal parameters at call
//! sites, and enumerates every accessibility assertion in the precise
//! part. Conditional specifications split into both branches with the
//! branch condition conjoined onto the path (interned like any other
//! condition term). One separation check is emitted per enumerated
//! permission - but only when more than one distinct permission was
//! enumerated, since a single permission cannot overlap itself.

use crate::check::{Check, FieldPermission, Location, PredicatePermission};
use crate::collector::conditions::{CheckAccumulator, Interner};
use crate::collector::index::MethodIndex;
use crate::error::{Result, WeaverError};
use crate::expr::{CheckExpression, VarMap};
use crate::logic::Conjunction;
use gv_ir::program::{BinaryOp, Expression, Method, OpKind, Program};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One permission found by the walk, with the path condition under which
/// the specification grants it.
#[derive(Debug, Clone)]
enum WalkedPermission {
    Field {
        permission: FieldPermission,
        path: Conjunction,
    },
    Predicate {
        permission: PredicatePermission,
        path: Conjunction,
    },
}

/// Identity ignoring the path: a conditional's two branches granting the
/// same permission are one distinct permission.
#[derive(PartialEq, Eq, Hash)]
enum PermKey {
    Field(FieldPermission),
    Predicate(PredicatePermission),
}

impl WalkedPermission {
    fn key(&self) -> PermKey {
        match self {
            WalkedPermission::Field { permission, .. } => PermKey::Field(permission.clone()),
            WalkedPermission::Predicate { permission, .. } => {
                PermKey::Predicate(permission.clone())
            }
        }
    }
}

/// Emit separation checks for every marked location of one method.
pub(crate) fn emit_separation_checks(
    program: &Program,
    method: &Method,
    index: &MethodIndex<'_>,
    locations: &BTreeSet<Location>,
    interner: &mut Interner,
    acc: &mut CheckAccumulator,
) -> Result<()> {
    for &location in locations {
        let Some((spec, vars)) = originating_spec(program, method, index, location)? else {
            continue;
        };
        let Some(precise) = spec.precise_part() else {
            continue;
        };
        let mut perms = Vec::new();
        walk_spec(
            precise,
            &vars,
            location,
            interner,
            &Conjunction::new(),
            &mut perms,
        )?;

        let distinct: HashSet<PermKey> = perms.iter().map(WalkedPermission::key).collect();
        if distinct.len() <= 1 {
            continue;
        }
        for perm in perms {
            match perm {
                WalkedPermission::Field { permission, path } => {
                    acc.add(location, Check::FieldSeparation(permission), path);
                }
                WalkedPermission::Predicate { permission, path } => {
                    acc.add(location, Check::PredicateSeparation(permission), path);
                }
            }
        }
    }
    Ok(())
}

/// The specification governing a location, plus the variable mapping to
/// evaluate it in the enclosing method's scope.
fn originating_spec<'p>(
    program: &'p Program,
    method: &'p Method,
    index: &MethodIndex<'p>,
    location: Location,
) -> Result<Option<(&'p Expression, VarMap)>> {
    match location {
        Location::MethodPre => Ok(method
            .precondition
            .as_ref()
            .map(|spec| (spec, VarMap::Identity))),
        Location::MethodPost => Ok(method
            .postcondition
            .as_ref()
            .map(|spec| (spec, VarMap::Identity))),
        Location::Pre(op) | Location::Post(op) | Location::LoopStart(op)
        | Location::LoopEnd(op) => {
            let op_ref = index.ops.get(&op).ok_or_else(|| {
                WeaverError::invalid_spec(format!("permission walk at unknown {}", op))
            })?;
            match &op_ref.kind {
                OpKind::Invoke {
                    callee,
                    args,
                    target,
                } => {
                    let callee_method = program.find_method(callee).ok_or_else(|| {
                        WeaverError::invalid_spec(format!("call to unknown method '{}'", callee))
                    })?;
                    let spec = if matches!(location, Location::Post(_)) {
                        callee_method.postcondition.as_ref()
                    } else {
                        callee_method.precondition.as_ref()
                    };
                    let Some(spec) = spec else {
                        return Ok(None);
                    };
                    let vars = call_site_vars(&method.name, callee_method, args, target)?;
                    Ok(Some((spec, vars)))
                }
                OpKind::While { invariant, .. } => {
                    Ok(invariant.as_ref().map(|spec| (spec, VarMap::Identity)))
                }
                OpKind::Fold { predicate, args } | OpKind::Unfold { predicate, args } => {
                    let pred = program.find_predicate(predicate).ok_or_else(|| {
                        WeaverError::invalid_spec(format!("unknown predicate '{}'", predicate))
                    })?;
                    let vars = predicate_vars(&method.name, pred, args)?;
                    Ok(Some((&pred.body, vars)))
                }
                OpKind::Assert { value, .. } => Ok(Some((value, VarMap::Identity))),
                _ => Err(WeaverError::invalid_spec(format!(
                    "permission walk at {} has no governing specification",
                    location
                ))),
            }
        }
    }
}

/// Build the formal-to-actual substitution for one call site.
fn call_site_vars(
    caller: &str,
    callee: &Method,
    args: &[Expression],
    target: &Option<String>,
) -> Result<VarMap> {
    if callee.params.len() != args.len() {
        return Err(WeaverError::invalid_spec(format!(
            "call to '{}' passes {} arguments for {} parameters",
            callee.name,
            args.len(),
            callee.params.len()
        )));
    }
    let mut formals = HashMap::new();
    for (param, actual) in callee.params.iter().zip(args) {
        formals.insert(
            param.name.clone(),
            CheckExpression::from_ir(actual, &VarMap::Identity)?,
        );
    }
    Ok(VarMap::Call {
        method: caller.to_string(),
        formals,
        result: target
            .as_ref()
            .map(|t| CheckExpression::Var(t.clone())),
    })
}

fn predicate_vars(
    caller: &str,
    pred: &gv_ir::program::Predicate,
    args: &[Expression],
) -> Result<VarMap> {
    if pred.params.len() != args.len() {
        return Err(WeaverError::invalid_spec(format!(
            "predicate '{}' applied to {} arguments for {} parameters",
            pred.name,
            args.len(),
            pred.params.len()
        )));
    }
    let mut formals = HashMap::new();
    for (param, actual) in pred.params.iter().zip(args) {
        formals.insert(
            param.name.clone(),
            CheckExpression::from_ir(actual, &VarMap::Identity)?,
        );
    }
    Ok(VarMap::Call {
        method: caller.to_string(),
        formals,
        result: None,
    })
}

/// Enumerate the accessibility assertions of a precise specification.
fn walk_spec(
    spec: &Expression,
    vars: &VarMap,
    location: Location,
    interner: &mut Interner,
    path: &Conjunction,
    out: &mut Vec<WalkedPermission>,
) -> Result<()> {
    match spec {
        Expression::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            walk_spec(left, vars, location, interner, path, out)?;
            walk_spec(right, vars, location, interner, path, out)?;
            Ok(())
        }
        Expression::Accessibility(member) => match member.as_ref() {
            Expression::Member {
                root,
                struct_name,
                field,
            } => {
                out.push(WalkedPermission::Field {
                    permission: FieldPermission {
                        root: CheckExpression::from_ir(root, vars)?,
                        struct_name: struct_name.clone(),
                        field: field.clone(),
                    },
                    path: path.clone(),
                });
                Ok(())
            }
            _ => Err(WeaverError::invalid_spec(
                "accessibility assertion over a non-field location",
            )),
        },
        Expression::PredicateInstance { name, args } => {
            let args = args
                .iter()
                .map(|a| CheckExpression::from_ir(a, vars))
                .collect::<Result<Vec<_>>>()?;
            out.push(WalkedPermission::Predicate {
                permission: PredicatePermission {
                    name: name.clone(),
                    args,
                },
                path: path.clone(),
            });
            Ok(())
        }
        Expression::Cond {
            cond,
            then,
            otherwise,
        } => {
            // split into both branches with conjoined path conditions
            let cond_value = CheckExpression::from_ir(cond, vars)?;
            let term = interner.intern(location, cond_value);
            interner.record_context(term, path);

            let mut then_path = path.clone();
            then_path.insert(term, true);
            walk_spec(then, vars, location, interner, &then_path, out)?;

            let mut else_path = path.clone();
            else_path.insert(term, false);
            walk_spec(otherwise, vars, location, interner, &else_path, out)
        }
        Expression::Imprecise(_) => Err(WeaverError::invalid_spec(
            "imprecision marker nested inside a specification",
        )),
        value => {
            // a pure value conjunct carries no permissions, but must not
            // hide any either
            if value.contains_permission() {
                Err(WeaverError::invalid_spec(
                    "permission nested inside a value expression",
                ))
            } else {
                Ok(())
            }
        }
    }
}
