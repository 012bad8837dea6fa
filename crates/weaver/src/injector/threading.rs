//! Permission threading: calling conventions, boundaries, allocations.
//!
//! Two permission objects travel through imprecise code. The dynamic
//! object is the frame's pool - every permission the frame currently
//! owns; accessibility checks assert against it. The static object is
//! boundary scratch: at each imprecise boundary it is rebuilt to hold
//! exactly what the governing specification grants, which is what makes
//! separation checking direct while permissions transfer.
//!
//! Conventions:
//!
//! - `main` allocates and zeroes the instance counter, then (when
//!   tracking is on) allocates both permission objects;
//! - precise methods take the counter by pointer; precise methods that
//!   themselves carry permission checks build local objects and populate
//!   the pool from their precondition;
//! - imprecise-convention methods take `(dynamic, static)` as two extra
//!   parameters and fold the incoming grant into the pool at entry;
//! - at a call into an imprecise-convention callee the caller saves its
//!   static pointer, builds a fresh static from the callee's
//!   precondition (substituting actuals for formals), transfers those
//!   permissions out of the pool (`join` then `disjoin`), calls, rebuilds
//!   the static from the callee's postcondition, re-integrates, and
//!   restores the saved pointer - the prologue's `join(dyn, saved)` is
//!   matched by a `disjoin(dyn, saved)` on the return path;
//! - every allocation in tracked context registers with the pool via
//!   `add_struct_access`; untracked allocations mint ids from the
//!   counter directly.

use crate::check::CallStyle;
use crate::error::{Result, WeaverError};
use crate::runtime;
use gv_ir::program::{BinaryOp, Block, Expression, Op, OpKind, Type};
use std::collections::HashMap;

use super::{IdGen, Names, StructTable};

/// What the injector needs to know about a callee at a call site.
pub(super) struct CalleeSig {
    pub params: Vec<String>,
    pub precondition: Option<Expression>,
    pub postcondition: Option<Expression>,
    pub style: CallStyle,
}

pub(super) type Sigs = HashMap<String, CalleeSig>;

/// Per-method context threaded through the emission helpers.
pub(super) struct MethodCtx<'a> {
    pub names: &'a Names,
    pub structs: &'a StructTable,
    pub style: CallStyle,
    /// This method carries permission objects (locals or parameters)
    pub tracked: bool,
}

impl MethodCtx<'_> {
    /// The expression through which this method reaches the instance
    /// counter: its own cell in `main`, the counter parameter in precise
    /// methods, the pointer embedded in the dynamic object elsewhere.
    pub fn counter_expr(&self) -> Expression {
        if self.style.takes_permissions() {
            Expression::Member {
                root: Box::new(Expression::Var(self.names.dynamic.clone())),
                struct_name: runtime::OWNED_FIELDS_STRUCT.to_string(),
                field: runtime::INSTANCE_COUNTER_FIELD.to_string(),
            }
        } else {
            Expression::Var(self.names.counter.clone())
        }
    }

    fn dynamic(&self) -> Expression {
        Expression::Var(self.names.dynamic.clone())
    }

    fn statics(&self) -> Expression {
        Expression::Var(self.names.statics.clone())
    }
}

/// One field permission enumerated from a specification for population,
/// with variables already substituted into the enclosing scope.
pub(super) struct PopPerm {
    pub root: Expression,
    pub struct_name: String,
    pub field: String,
    /// Path condition of the conditional branches granting it
    pub path: Option<Expression>,
}

/// Formal-to-actual substitution over IR expressions.
pub(super) struct Subst {
    method: String,
    map: Option<HashMap<String, Expression>>,
    result: Option<Expression>,
}

impl Subst {
    pub fn identity(method: &str) -> Subst {
        Subst {
            method: method.to_string(),
            map: None,
            result: None,
        }
    }

    pub fn call(
        method: &str,
        formals: &[String],
        actuals: &[Expression],
        result: Option<Expression>,
    ) -> Result<Subst> {
        if formals.len() != actuals.len() {
            return Err(WeaverError::invalid_spec(format!(
                "call passes {} arguments for {} parameters",
                actuals.len(),
                formals.len()
            )));
        }
        let map = formals
            .iter()
            .cloned()
            .zip(actuals.iter().cloned())
            .collect();
        Ok(Subst {
            method: method.to_string(),
            map: Some(map),
            result,
        })
    }

    fn apply(&self, expr: &Expression) -> Result<Expression> {
        match expr {
            Expression::Var(name) => match &self.map {
                None => Ok(expr.clone()),
                Some(map) => map.get(name).cloned().ok_or_else(|| {
                    WeaverError::UnknownVariable {
                        method: self.method.clone(),
                        name: name.clone(),
                    }
                }),
            },
            Expression::Result => self.result.clone().ok_or_else(|| {
                WeaverError::UnknownVariable {
                    method: self.method.clone(),
                    name: "\\result".to_string(),
                }
            }),
            Expression::Binary { op, left, right } => Ok(Expression::Binary {
                op: *op,
                left: Box::new(self.apply(left)?),
                right: Box::new(self.apply(right)?),
            }),
            Expression::Unary { op, operand } => Ok(Expression::Unary {
                op: *op,
                operand: Box::new(self.apply(operand)?),
            }),
            Expression::Cond {
                cond,
                then,
                otherwise,
            } => Ok(Expression::Cond {
                cond: Box::new(self.apply(cond)?),
                then: Box::new(self.apply(then)?),
                otherwise: Box::new(self.apply(otherwise)?),
            }),
            Expression::Member {
                root,
                struct_name,
                field,
            } => Ok(Expression::Member {
                root: Box::new(self.apply(root)?),
                struct_name: struct_name.clone(),
                field: field.clone(),
            }),
            Expression::Deref(operand) => Ok(Expression::Deref(Box::new(self.apply(operand)?))),
            Expression::IntLit(_)
            | Expression::CharLit(_)
            | Expression::BoolLit(_)
            | Expression::StringLit(_)
            | Expression::Null => Ok(expr.clone()),
            Expression::Accessibility(_)
            | Expression::PredicateInstance { .. }
            | Expression::Imprecise(_) => Err(WeaverError::invalid_spec(
                "specification form in value position",
            )),
        }
    }
}

fn conjoin(path: Option<Expression>, cond: Expression, positive: bool) -> Expression {
    let cond = if positive {
        cond
    } else {
        Expression::Unary {
            op: gv_ir::program::UnaryOp::Not,
            operand: Box::new(cond),
        }
    };
    match path {
        None => cond,
        Some(prev) => Expression::Binary {
            op: BinaryOp::And,
            left: Box::new(prev),
            right: Box::new(cond),
        },
    }
}

/// Enumerate the field permissions of a precise specification, for
/// permission-object population. Predicate instances are left to the
/// runtime's predicate checker and contribute no entries here.
pub(super) fn field_permissions(
    spec: &Expression,
    subst: &Subst,
    path: Option<Expression>,
    out: &mut Vec<PopPerm>,
) -> Result<()> {
    match spec {
        Expression::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            field_permissions(left, subst, path.clone(), out)?;
            field_permissions(right, subst, path, out)
        }
        Expression::Accessibility(member) => match member.as_ref() {
            Expression::Member {
                root,
                struct_name,
                field,
            } => {
                out.push(PopPerm {
                    root: subst.apply(root)?,
                    struct_name: struct_name.clone(),
                    field: field.clone(),
                    path,
                });
                Ok(())
            }
            _ => Err(WeaverError::invalid_spec(
                "accessibility assertion over a non-field location",
            )),
        },
        Expression::PredicateInstance { .. } => Ok(()),
        Expression::Cond {
            cond,
            then,
            otherwise,
        } => {
            let cond = subst.apply(cond)?;
            field_permissions(
                then,
                subst,
                Some(conjoin(path.clone(), cond.clone(), true)),
                out,
            )?;
            field_permissions(otherwise, subst, Some(conjoin(path, cond, false)), out)
        }
        Expression::Imprecise(_) => Err(WeaverError::invalid_spec(
            "imprecision marker nested inside a specification",
        )),
        value => {
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

fn guarded(path: Option<Expression>, inner: Op, ids: &mut IdGen) -> Op {
    match path {
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

/// Emit `add_field_access` calls registering every permission of a
/// precise specification into `fields`, each under its path condition.
/// With `separate`, an `assert_disjoint_acc` against the pool precedes
/// every add - that interleaving is what enforces separation while a
/// grant set is being built.
pub(super) fn populate(
    fields: Expression,
    spec: Option<&Expression>,
    subst: &Subst,
    ctx: &MethodCtx<'_>,
    separate: bool,
    ids: &mut IdGen,
    out: &mut Vec<Op>,
) -> Result<()> {
    let Some(precise) = spec.and_then(Expression::precise_part) else {
        return Ok(());
    };
    let mut perms = Vec::new();
    field_permissions(precise, subst, None, &mut perms)?;
    for perm in perms {
        let obj_id = Expression::Member {
            root: Box::new(perm.root),
            struct_name: perm.struct_name.clone(),
            field: ctx.names.id_field.clone(),
        };
        let n_fields = ctx.structs.n_fields(&perm.struct_name)?;
        let field_index = ctx.structs.field_index(&perm.struct_name, &perm.field)?;
        if separate {
            let check = runtime::assert_disjoint_acc(
                ids.fresh(),
                fields.clone(),
                ctx.dynamic(),
                obj_id.clone(),
                field_index,
            );
            out.push(guarded(perm.path.clone(), check, ids));
        }
        let add = runtime::add_field_access(
            ids.fresh(),
            fields.clone(),
            obj_id,
            n_fields,
            field_index,
        );
        out.push(guarded(perm.path, add, ids));
    }
    Ok(())
}

/// Allocate and initialise one permission object into `var`.
fn alloc_perm_object(var: &str, ctx: &MethodCtx<'_>, ids: &mut IdGen, out: &mut Vec<Op>) {
    out.push(Op {
        id: ids.fresh(),
        kind: OpKind::AllocStruct {
            target: var.to_string(),
            struct_name: runtime::OWNED_FIELDS_STRUCT.to_string(),
        },
    });
    out.push(runtime::init_fields(
        ids.fresh(),
        Expression::Var(var.to_string()),
        ctx.counter_expr(),
    ));
}

/// Entry emission for `main`: the counter cell always, the permission
/// objects when tracking is on.
pub(super) fn main_entry(
    ctx: &MethodCtx<'_>,
    program_tracked: bool,
    ids: &mut IdGen,
    out: &mut Vec<Op>,
) {
    out.push(Op {
        id: ids.fresh(),
        kind: OpKind::AllocValue {
            target: ctx.names.counter.clone(),
            ty: Type::Int,
        },
    });
    out.push(Op {
        id: ids.fresh(),
        kind: OpKind::AssignDeref {
            pointer: Expression::Var(ctx.names.counter.clone()),
            value: Expression::IntLit(0),
        },
    });
    if program_tracked && ctx.tracked {
        alloc_perm_object(&ctx.names.dynamic, ctx, ids, out);
        alloc_perm_object(&ctx.names.statics, ctx, ids, out);
    }
}

/// Entry emission for a tracked precise method: local permission
/// objects, the pool populated from the (precise) precondition.
pub(super) fn precise_tracked_entry(
    method: &str,
    precondition: Option<&Expression>,
    ctx: &MethodCtx<'_>,
    ids: &mut IdGen,
    out: &mut Vec<Op>,
) -> Result<()> {
    alloc_perm_object(&ctx.names.dynamic, ctx, ids, out);
    alloc_perm_object(&ctx.names.statics, ctx, ids, out);
    populate(
        ctx.dynamic(),
        precondition,
        &Subst::identity(method),
        ctx,
        false,
        ids,
        out,
    )
}

/// The entry `join(dynamic, static)` folding an imprecise-convention
/// method's incoming grant into its pool.
pub(super) fn entry_join(ctx: &MethodCtx<'_>, ids: &mut IdGen) -> Op {
    runtime::join(ids.fresh(), ctx.dynamic(), ctx.statics())
}

/// The pre-return `join(dynamic, static)` handing an imprecise-
/// convention method's remaining grant back through the pool.
pub(super) fn exit_join(ctx: &MethodCtx<'_>, ids: &mut IdGen) -> Op {
    runtime::join(ids.fresh(), ctx.dynamic(), ctx.statics())
}

/// Everything woven around one call.
pub(super) struct CallWeave {
    pub prologue: Vec<Op>,
    pub extra_args: Vec<Expression>,
    pub epilogue: Vec<Op>,
}

impl CallWeave {
    fn empty() -> CallWeave {
        CallWeave {
            prologue: Vec::new(),
            extra_args: Vec::new(),
            epilogue: Vec::new(),
        }
    }
}

/// Weave one call site.
///
/// `saved_var` names the temporary holding the caller's static pointer
/// across an imprecise call; `interleave_separation` is set when the
/// collector marked this call's precondition for a full permission walk.
pub(super) fn weave_call(
    caller: &str,
    callee: &CalleeSig,
    args: &[Expression],
    target: Option<&str>,
    saved_var: &str,
    interleave_separation: bool,
    program_tracked: bool,
    ctx: &MethodCtx<'_>,
    ids: &mut IdGen,
) -> Result<CallWeave> {
    if !program_tracked {
        return Ok(CallWeave::empty());
    }

    if !callee.style.takes_permissions() {
        // precise callees thread only the instance counter
        let mut weave = CallWeave::empty();
        weave.extra_args.push(ctx.counter_expr());
        if ctx.tracked {
            // permissions minted by the callee (its postcondition's
            // grants) become part of the caller's pool
            let subst = Subst::call(
                caller,
                &callee.params,
                args,
                target.map(|t| Expression::Var(t.to_string())),
            )?;
            populate(
                ctx.dynamic(),
                callee.postcondition.as_ref(),
                &subst,
                ctx,
                false,
                ids,
                &mut weave.epilogue,
            )?;
        }
        return Ok(weave);
    }

    // imprecise-convention callee
    let mut weave = CallWeave::empty();
    let subst = Subst::call(
        caller,
        &callee.params,
        args,
        target.map(|t| Expression::Var(t.to_string())),
    )?;

    // save the caller's static pointer, build the callee's grant set
    weave.prologue.push(Op {
        id: ids.fresh(),
        kind: OpKind::Assign {
            target: saved_var.to_string(),
            value: ctx.statics(),
        },
    });
    alloc_perm_object(&ctx.names.statics, ctx, ids, &mut weave.prologue);
    populate(
        ctx.statics(),
        callee.precondition.as_ref(),
        &subst,
        ctx,
        interleave_separation,
        ids,
        &mut weave.prologue,
    )?;
    // split the pool: fold the saved boundary set back in, then move the
    // callee's grants out
    weave.prologue.push(runtime::join(
        ids.fresh(),
        ctx.dynamic(),
        Expression::Var(saved_var.to_string()),
    ));
    weave.prologue.push(runtime::disjoin(
        ids.fresh(),
        ctx.dynamic(),
        ctx.statics(),
    ));
    weave.extra_args.push(ctx.dynamic());
    weave.extra_args.push(ctx.statics());

    // after the call: rebuild the static from the postcondition's
    // precise part, re-integrate, balance the prologue join, restore
    alloc_perm_object(&ctx.names.statics, ctx, ids, &mut weave.epilogue);
    populate(
        ctx.statics(),
        callee.postcondition.as_ref(),
        &subst,
        ctx,
        false,
        ids,
        &mut weave.epilogue,
    )?;
    weave.epilogue.push(runtime::join(
        ids.fresh(),
        ctx.dynamic(),
        ctx.statics(),
    ));
    weave.epilogue.push(runtime::disjoin(
        ids.fresh(),
        ctx.dynamic(),
        Expression::Var(saved_var.to_string()),
    ));
    weave.epilogue.push(Op {
        id: ids.fresh(),
        kind: OpKind::Assign {
            target: ctx.names.statics.clone(),
            value: Expression::Var(saved_var.to_string()),
        },
    });
    Ok(weave)
}

/// Bookkeeping after one `AllocStruct`: tracked context registers the
/// allocation with the pool (which also mints the id); purely precise
/// context mints the id from the counter directly.
pub(super) fn alloc_struct_bookkeeping(
    target: &str,
    struct_name: &str,
    id_temp: &str,
    ctx: &MethodCtx<'_>,
    ids: &mut IdGen,
    out: &mut Vec<Op>,
) -> Result<()> {
    let n_fields = ctx.structs.n_fields(struct_name)?;
    if ctx.tracked {
        out.push(runtime::add_struct_access(
            ids.fresh(),
            ctx.dynamic(),
            n_fields,
            id_temp.to_string(),
        ));
        out.push(Op {
            id: ids.fresh(),
            kind: OpKind::AssignMember {
                root: Expression::Var(target.to_string()),
                struct_name: struct_name.to_string(),
                field: ctx.names.id_field.clone(),
                value: Expression::Var(id_temp.to_string()),
            },
        });
    } else {
        let counter = ctx.counter_expr();
        out.push(Op {
            id: ids.fresh(),
            kind: OpKind::AssignMember {
                root: Expression::Var(target.to_string()),
                struct_name: struct_name.to_string(),
                field: ctx.names.id_field.clone(),
                value: Expression::Deref(Box::new(counter.clone())),
            },
        });
        out.push(Op {
            id: ids.fresh(),
            kind: OpKind::AssignDeref {
                pointer: counter.clone(),
                value: Expression::Binary {
                    op: BinaryOp::Add,
                    left: Box::new(Expression::Deref(Box::new(counter))),
                    right: Box::new(Expression::IntLit(1)),
                },
            },
        });
    }
    Ok(())
}
