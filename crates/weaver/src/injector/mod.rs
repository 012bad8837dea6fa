//! IR mutation: lowering collected checks into executable code.
//!
//! The injector runs once per collected method and rewrites the body in a
//! single pass: condition temporaries and guarded checks splice in at
//! their locations, calls gain the arguments their callee's convention
//! demands plus the permission prologue/epilogue, allocations gain id
//! bookkeeping, and every exit path is rewritten through a result
//! temporary when exit checks need to observe the returned value.
//!
//! Emission order at one location is fixed: condition temporaries first
//! (term-id order), then separation checks, then expression and
//! accessibility checks. Method entry additionally orders the permission
//! setup before everything and - for imprecise-convention methods - the
//! entry `join` between the separation and accessibility checks, so
//! separation is judged on the incoming grant while accessibility is
//! judged on the folded pool.

mod checks;
mod threading;

use crate::check::{CallStyle, Location};
use crate::collector::{CollectedMethod, CollectedProgram};
use crate::config::WeaverConfig;
use crate::error::{Result, WeaverError};
use gv_ir::program::{Block, Expression, Method, Op, OpId, OpKind, Program, Type, Var};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use checks::{Slot, build_schedule, cond_var};
use threading::{CalleeSig, MethodCtx, Sigs};

/// Synthetic names the injector introduces. Defaults match the weaver's
/// usual output; embedders can override them through [`WeaverConfig`] to
/// dodge collisions.
#[derive(Debug, Clone)]
pub(crate) struct Names {
    pub counter: String,
    pub dynamic: String,
    pub statics: String,
    pub saved_prefix: String,
    pub cond_prefix: String,
    pub result: String,
    pub id_field: String,
    pub new_id_prefix: String,
}

impl Default for Names {
    fn default() -> Names {
        Names {
            counter: "_instance_counter".to_string(),
            dynamic: "_dyn_fields".to_string(),
            statics: "_static_fields".to_string(),
            saved_prefix: "_saved_static_".to_string(),
            cond_prefix: "_cond_".to_string(),
            result: "_result".to_string(),
            id_field: "_id".to_string(),
            new_id_prefix: "_new_id_".to_string(),
        }
    }
}

/// Mints operation ids for woven-in code.
pub(crate) struct IdGen {
    next: u32,
}

impl IdGen {
    pub fn new(next: u32) -> IdGen {
        IdGen { next }
    }

    pub fn fresh(&mut self) -> OpId {
        let id = OpId(self.next);
        self.next += 1;
        id
    }

    pub fn next_unused(&self) -> u32 {
        self.next
    }
}

/// Field layout of every struct after `_id` injection.
pub(crate) struct StructTable {
    layouts: HashMap<String, HashMap<String, usize>>,
}

impl StructTable {
    fn build(program: &Program) -> StructTable {
        let layouts = program
            .structs
            .iter()
            .map(|s| {
                let fields = s
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, f)| (f.name.clone(), i))
                    .collect();
                (s.name.clone(), fields)
            })
            .collect();
        StructTable { layouts }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layouts.contains_key(name)
    }

    pub fn n_fields(&self, name: &str) -> Result<usize> {
        self.layouts
            .get(name)
            .map(HashMap::len)
            .ok_or_else(|| WeaverError::invalid_spec(format!("unknown struct '{}'", name)))
    }

    pub fn field_index(&self, name: &str, field: &str) -> Result<usize> {
        self.layouts
            .get(name)
            .and_then(|fields| fields.get(field).copied())
            .ok_or_else(|| {
                WeaverError::invalid_spec(format!("unknown field '{}.{}'", name, field))
            })
    }
}

/// Lower a collected program into the IR, in place.
pub fn inject_program(
    program: &mut Program,
    collected: &CollectedProgram,
    config: &WeaverConfig,
) -> Result<()> {
    let names = config.names();
    let program_tracked = collected.requires_tracking();

    // synthetic `_id` on every struct the woven code may key permissions
    // by (idempotent)
    if program_tracked {
        for s in &mut program.structs {
            s.ensure_field(&names.id_field, Type::Int);
        }
    }
    let structs = StructTable::build(program);

    let styles: HashMap<String, CallStyle> = collected
        .methods
        .iter()
        .map(|m| (m.name.clone(), m.call_style))
        .collect();
    let sigs: Sigs = program
        .methods
        .iter()
        .map(|m| {
            let style = styles.get(&m.name).copied().unwrap_or(CallStyle::Precise);
            (
                m.name.clone(),
                CalleeSig {
                    params: m.params.iter().map(|p| p.name.clone()).collect(),
                    precondition: m.precondition.clone(),
                    postcondition: m.postcondition.clone(),
                    style,
                },
            )
        })
        .collect();

    // a method carries permission objects when it checks permissions
    // itself, participates in the imprecise convention, or drives an
    // imprecise call site (main always does once tracking is on)
    let tracked: HashSet<String> = if program_tracked {
        program
            .methods
            .iter()
            .zip(&collected.methods)
            .filter(|(m, cm)| {
                cm.call_style == CallStyle::Main
                    || cm.call_style.takes_permissions()
                    || cm.requires_tracking()
                    || calls_imprecise(&m.body.0, &styles)
            })
            .map(|(m, _)| m.name.clone())
            .collect()
    } else {
        HashSet::new()
    };

    let mut ids = IdGen::new(program.next_op_id);
    let mut methods = std::mem::take(&mut program.methods);
    for (method, cm) in methods.iter_mut().zip(&collected.methods) {
        if method.name != cm.name {
            return Err(WeaverError::mismatch(
                &method.name,
                "collector output out of order",
            ));
        }
        inject_method(
            method,
            cm,
            &names,
            &structs,
            &sigs,
            &tracked,
            program_tracked,
            &mut ids,
        )?;
    }
    program.methods = methods;
    program.next_op_id = ids.next_unused();
    Ok(())
}

fn calls_imprecise(ops: &[Op], styles: &HashMap<String, CallStyle>) -> bool {
    ops.iter().any(|op| match &op.kind {
        OpKind::Invoke { callee, .. } => styles
            .get(callee)
            .is_some_and(|s| s.takes_permissions()),
        OpKind::If {
            then_branch,
            else_branch,
            ..
        } => calls_imprecise(&then_branch.0, styles) || calls_imprecise(&else_branch.0, styles),
        OpKind::While { body, .. } => calls_imprecise(&body.0, styles),
        _ => false,
    })
}

fn collect_invoke_targets(ops: &[Op], out: &mut HashMap<OpId, Option<String>>) {
    for op in ops {
        match &op.kind {
            OpKind::Invoke { target, .. } => {
                out.insert(op.id, target.clone());
            }
            OpKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                collect_invoke_targets(&then_branch.0, out);
                collect_invoke_targets(&else_branch.0, out);
            }
            OpKind::While { body, .. } => collect_invoke_targets(&body.0, out),
            _ => {}
        }
    }
}

/// Give a cloned check op (and everything nested under it) fresh ids, so
/// a slot emitted on several exit paths never duplicates identities.
fn refresh_ids(op: &mut Op, ids: &mut IdGen) {
    op.id = ids.fresh();
    match &mut op.kind {
        OpKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            for inner in &mut then_branch.0 {
                refresh_ids(inner, ids);
            }
            for inner in &mut else_branch.0 {
                refresh_ids(inner, ids);
            }
        }
        OpKind::While { body, .. } => {
            for inner in &mut body.0 {
                refresh_ids(inner, ids);
            }
        }
        _ => {}
    }
}

struct Rebuilder<'a> {
    caller: String,
    ctx: MethodCtx<'a>,
    sigs: &'a Sigs,
    schedule: &'a HashMap<Location, Slot>,
    program_tracked: bool,
    needs_exit_join: bool,
    needs_result_temp: bool,
    temp_counter: usize,
    new_locals: Vec<Var>,
}

impl Rebuilder<'_> {
    fn fresh_temp(&mut self, prefix: &str, ty: Type) -> String {
        let name = format!("{}{}", prefix, self.temp_counter);
        self.temp_counter += 1;
        self.new_locals.push(Var {
            name: name.clone(),
            ty,
        });
        name
    }

    fn emit_list(&self, list: &[Op], ids: &mut IdGen, out: &mut Vec<Op>) {
        for op in list {
            let mut op = op.clone();
            refresh_ids(&mut op, ids);
            out.push(op);
        }
    }

    /// Emit one location's full slot: temporaries, separations, checks.
    fn emit_slot(&self, location: Location, ids: &mut IdGen, out: &mut Vec<Op>) {
        if let Some(slot) = self.schedule.get(&location) {
            self.emit_list(&slot.conds, ids, out);
            self.emit_list(&slot.seps, ids, out);
            self.emit_list(&slot.checks, ids, out);
        }
    }

    fn emit_return(
        &mut self,
        value: Option<Expression>,
        ids: &mut IdGen,
        out: &mut Vec<Op>,
    ) -> Result<()> {
        let value = match value {
            Some(v) if self.needs_result_temp => {
                out.push(Op {
                    id: ids.fresh(),
                    kind: OpKind::Assign {
                        target: self.ctx.names.result.clone(),
                        value: v,
                    },
                });
                Some(Expression::Var(self.ctx.names.result.clone()))
            }
            other => other,
        };
        self.emit_slot(Location::MethodPost, ids, out);
        if self.needs_exit_join {
            out.push(threading::exit_join(&self.ctx, ids));
        }
        out.push(Op {
            id: ids.fresh(),
            kind: OpKind::Return { value },
        });
        Ok(())
    }

    fn rebuild_block(&mut self, ops: Vec<Op>, ids: &mut IdGen, out: &mut Vec<Op>) -> Result<()> {
        for op in ops {
            self.rebuild_op(op, ids, out)?;
        }
        Ok(())
    }

    fn rebuild_op(&mut self, mut op: Op, ids: &mut IdGen, out: &mut Vec<Op>) -> Result<()> {
        let pre = Location::Pre(op.id);
        let post = Location::Post(op.id);
        match &mut op.kind {
            OpKind::Return { value } => {
                let value = value.take();
                return self.emit_return(value, ids, out);
            }
            OpKind::If {
                then_branch,
                else_branch,
                ..
            } => {
                self.emit_slot(pre, ids, out);
                let mut new_then = Vec::new();
                self.rebuild_block(std::mem::take(&mut then_branch.0), ids, &mut new_then)?;
                then_branch.0 = new_then;
                let mut new_else = Vec::new();
                self.rebuild_block(std::mem::take(&mut else_branch.0), ids, &mut new_else)?;
                else_branch.0 = new_else;
                out.push(op);
                // fall through to post emission below
            }
            OpKind::While { body, .. } => {
                self.emit_slot(pre, ids, out);
                let op_id = op.id;
                let mut new_body = Vec::new();
                self.emit_slot(Location::LoopStart(op_id), ids, &mut new_body);
                self.rebuild_block(std::mem::take(&mut body.0), ids, &mut new_body)?;
                self.emit_slot(Location::LoopEnd(op_id), ids, &mut new_body);
                body.0 = new_body;
                out.push(op);
            }
            OpKind::Invoke { callee, args, target } => {
                let callee_name = callee.clone();
                let target = target.clone();
                match self.sigs.get(&callee_name) {
                    None => {
                        // external call: nothing to thread
                        self.emit_slot(pre, ids, out);
                        out.push(op);
                    }
                    Some(sig) => {
                        let slot = self.schedule.get(&pre);
                        let imprecise_call =
                            sig.style.takes_permissions() && self.program_tracked;
                        // the prologue realises separation checks inline
                        // while it builds the callee's grant set
                        let interleave = imprecise_call
                            && slot.is_some_and(|s| !s.seps.is_empty());
                        if let Some(slot) = slot {
                            self.emit_list(&slot.conds, ids, out);
                            if !imprecise_call {
                                self.emit_list(&slot.seps, ids, out);
                            }
                            self.emit_list(&slot.checks, ids, out);
                        }
                        let saved_var = if imprecise_call {
                            self.fresh_temp(
                                &self.ctx.names.saved_prefix.clone(),
                                crate::runtime::owned_fields_type(),
                            )
                        } else {
                            String::new()
                        };
                        let weave = threading::weave_call(
                            &self.caller,
                            sig,
                            args,
                            target.as_deref(),
                            &saved_var,
                            interleave,
                            self.program_tracked,
                            &self.ctx,
                            ids,
                        )?;
                        out.extend(weave.prologue);
                        args.extend(weave.extra_args);
                        out.push(op);
                        out.extend(weave.epilogue);
                    }
                }
            }
            OpKind::AllocStruct {
                target,
                struct_name,
            } => {
                let target = target.clone();
                let struct_name = struct_name.clone();
                self.emit_slot(pre, ids, out);
                out.push(op);
                if self.program_tracked {
                    let id_temp = if self.ctx.tracked {
                        self.fresh_temp(&self.ctx.names.new_id_prefix.clone(), Type::Int)
                    } else {
                        String::new()
                    };
                    threading::alloc_struct_bookkeeping(
                        &target,
                        &struct_name,
                        &id_temp,
                        &self.ctx,
                        ids,
                        out,
                    )?;
                }
            }
            _ => {
                self.emit_slot(pre, ids, out);
                out.push(op);
            }
        }
        self.emit_slot(post, ids, out);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn inject_method(
    method: &mut Method,
    cm: &CollectedMethod,
    names: &Names,
    structs: &StructTable,
    sigs: &Sigs,
    tracked: &HashSet<String>,
    program_tracked: bool,
    ids: &mut IdGen,
) -> Result<()> {
    let mut invoke_targets = HashMap::new();
    collect_invoke_targets(&method.body.0, &mut invoke_targets);

    let schedule = build_schedule(cm, structs, names, &invoke_targets, ids)?;

    let ctx = MethodCtx {
        names,
        structs,
        style: cm.call_style,
        tracked: tracked.contains(&method.name),
    };

    // calling-convention parameters
    if program_tracked {
        match cm.call_style {
            CallStyle::Precise => method.params.push(Var {
                name: names.counter.clone(),
                ty: Type::Pointer(Box::new(Type::Int)),
            }),
            CallStyle::PrecisePre | CallStyle::Imprecise => {
                method.params.push(Var {
                    name: names.dynamic.clone(),
                    ty: crate::runtime::owned_fields_type(),
                });
                method.params.push(Var {
                    name: names.statics.clone(),
                    ty: crate::runtime::owned_fields_type(),
                });
            }
            CallStyle::Main => {}
        }
    }

    let post_slot_nonempty = schedule
        .get(&Location::MethodPost)
        .is_some_and(|s| !s.is_empty());
    let needs_exit_join = program_tracked && cm.call_style.takes_permissions();
    let needs_result_temp = method.return_type.is_some() && post_slot_nonempty;

    let mut rebuilder = Rebuilder {
        caller: method.name.clone(),
        ctx,
        sigs,
        schedule: &schedule,
        program_tracked,
        needs_exit_join,
        needs_result_temp,
        temp_counter: 0,
        new_locals: Vec::new(),
    };

    let mut out = Vec::new();

    // entry: permission setup, then the entry slot; imprecise-convention
    // methods fold their grant into the pool between the separation and
    // accessibility checks
    match cm.call_style {
        CallStyle::Main => {
            threading::main_entry(&rebuilder.ctx, program_tracked, ids, &mut out);
        }
        CallStyle::Precise if rebuilder.ctx.tracked => {
            threading::precise_tracked_entry(
                &method.name,
                method.precondition.as_ref(),
                &rebuilder.ctx,
                ids,
                &mut out,
            )?;
        }
        _ => {}
    }
    if let Some(slot) = schedule.get(&Location::MethodPre) {
        rebuilder.emit_list(&slot.conds, ids, &mut out);
        rebuilder.emit_list(&slot.seps, ids, &mut out);
        if program_tracked && cm.call_style.takes_permissions() {
            out.push(threading::entry_join(&rebuilder.ctx, ids));
        }
        rebuilder.emit_list(&slot.checks, ids, &mut out);
    } else if program_tracked && cm.call_style.takes_permissions() {
        out.push(threading::entry_join(&rebuilder.ctx, ids));
    }

    let body = std::mem::take(&mut method.body.0);
    rebuilder.rebuild_block(body, ids, &mut out)?;

    // a body that can fall off the end still owes its exit checks
    if cm.has_implicit_return && (post_slot_nonempty || needs_exit_join) {
        rebuilder.emit_slot(Location::MethodPost, ids, &mut out);
        if needs_exit_join {
            out.push(threading::exit_join(&rebuilder.ctx, ids));
        }
    }

    method.body = Block(out);

    // declarations for everything the weave introduced
    for term in &cm.conditions {
        method.ensure_local(&cond_var(names, term.id), Type::Bool);
    }
    if needs_result_temp {
        let ty = method.return_type.clone().expect("checked above");
        method.ensure_local(&names.result, ty);
    }
    if rebuilder.ctx.tracked && !cm.call_style.takes_permissions() {
        // main and tracked precise methods hold the objects in locals
        method.ensure_local(&names.dynamic, crate::runtime::owned_fields_type());
        method.ensure_local(&names.statics, crate::runtime::owned_fields_type());
    }
    if cm.call_style == CallStyle::Main {
        method.ensure_local(&names.counter, Type::Pointer(Box::new(Type::Int)));
    }
    let new_locals = std::mem::take(&mut rebuilder.new_locals);
    for var in new_locals {
        method.ensure_local(&var.name, var.ty);
    }

    debug!(
        method = %method.name,
        tracked = rebuilder.ctx.tracked,
        ops = method.body.0.len(),
        "injected method"
    );
    Ok(())
}
