//! Residual-check placement and branch-condition interning.
//!
//! Phase B resolves each residual check to the IR phase it must fire in:
//! the verifier reports a node plus a position tag, and the tag is
//! reclassified against the indexed location - loop positions move to the
//! loop's before/after/start/end phases, `Value` defaults to before the
//! operation unless the check was raised while establishing a callee's
//! postcondition, and loop-begin positions the verifier attached outside
//! the actual invariant tree are demoted to after the loop.
//!
//! Phase C lowers each check's branch-condition stack into the logic
//! kernel. Walking outermost-in, every frame's `(location, value)` pair is
//! interned to a condition term, the term learns the context it was asked
//! in (the conjunction of the frames outside it), and the running
//! conjunction gains the term with the frame's polarity. Checks sharing
//! `(location, check)` union their conjunctions into one DNF guard.

use crate::check::{Check, ConditionTerm, Location};
use crate::collector::index::{MethodIndex, SpecSets, op_is_while};
use crate::error::{Result, WeaverError};
use crate::expr::CheckExpression;
use crate::logic::{Conjunction, Disjunction, TermId};
use gv_ir::program::OpKind;
use gv_ir::vir::{
    BranchCond, NodeId, PositionKind, PositionRefinement, ResidualCheck, VirExpr, VirExprKind,
    VirUnaryOp,
};
use std::collections::HashMap;

/// Interns `(location, value)` pairs to densely-numbered condition terms.
pub(crate) struct Interner {
    by_key: HashMap<(Location, CheckExpression), TermId>,
    terms: Vec<ConditionTerm>,
}

impl Interner {
    pub fn new() -> Interner {
        Interner {
            by_key: HashMap::new(),
            terms: Vec::new(),
        }
    }

    pub fn intern(&mut self, location: Location, value: CheckExpression) -> TermId {
        if let Some(&id) = self.by_key.get(&(location, value.clone())) {
            return id;
        }
        let id = self.terms.len() as TermId;
        self.by_key.insert((location, value.clone()), id);
        self.terms.push(ConditionTerm {
            id,
            location,
            value,
            when: Disjunction::new(),
        });
        id
    }

    /// Record one context in which the term is asked about. The term's
    /// `when` is the disjunction of all such contexts.
    pub fn record_context(&mut self, id: TermId, context: &Conjunction) {
        self.terms[id as usize].when.insert(context.clone());
    }

    pub fn into_terms(self) -> Vec<ConditionTerm> {
        self.terms
    }

    pub fn terms(&self) -> &[ConditionTerm] {
        &self.terms
    }
}

/// Accumulates runtime checks, merging guards of checks that share a
/// `(location, check)` key and preserving first-seen order.
pub(crate) struct CheckAccumulator {
    order: Vec<(Location, Check)>,
    whens: HashMap<(Location, Check), Disjunction>,
}

impl CheckAccumulator {
    pub fn new() -> CheckAccumulator {
        CheckAccumulator {
            order: Vec::new(),
            whens: HashMap::new(),
        }
    }

    pub fn add(&mut self, location: Location, check: Check, context: Conjunction) {
        let key = (location, check);
        if !self.whens.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.whens.entry(key).or_default().insert(context);
    }

    pub fn into_ordered(self) -> Vec<(Location, Check, Disjunction)> {
        let mut whens = self.whens;
        self.order
            .into_iter()
            .map(|key| {
                let when = whens.remove(&key).unwrap_or_default();
                (key.0, key.1, when)
            })
            .collect()
    }
}

/// Where a residual check landed, and whether its position tag was an
/// explicit (non-`Value`) one - positioned permission checks trigger the
/// full permission walk of phase D.
pub(crate) struct PlacedCheck {
    pub location: Location,
    pub positioned: bool,
}

/// Reclassify a residual check's position tag against the node index.
pub(crate) fn place_check(
    method: &str,
    node: NodeId,
    rc: &ResidualCheck,
    index: &MethodIndex<'_>,
    specs: &SpecSets,
) -> Result<PlacedCheck> {
    let base = *index.locations.get(&node).ok_or_else(|| {
        WeaverError::mismatch(method, format!("residual check at unindexed {}", node))
    })?;

    // method-level locations accept only plain value positions
    if matches!(base, Location::MethodPre | Location::MethodPost) {
        if rc.position.kind != PositionKind::Value || rc.position.refinement.is_some() {
            return Err(WeaverError::UnhandledPosition {
                node,
                detail: "non-value position at a method-level location".to_string(),
            });
        }
        return Ok(PlacedCheck {
            location: base,
            positioned: true,
        });
    }

    let op = base.op().expect("non-method location carries an op");

    if let Some(refinement) = rc.position.refinement {
        if rc.position.kind != PositionKind::Value {
            return Err(WeaverError::UnhandledPosition {
                node,
                detail: "refined position with a non-value kind".to_string(),
            });
        }
        let kind = &index.ops[&op].kind;
        let location = match (refinement, kind) {
            (PositionRefinement::InCall, OpKind::Invoke { callee, .. }) => {
                if specs.in_postcondition(callee, rc.context) {
                    Location::Post(op)
                } else {
                    Location::Pre(op)
                }
            }
            (PositionRefinement::InFold, OpKind::Fold { .. })
            | (PositionRefinement::InUnfold, OpKind::Unfold { .. }) => Location::Pre(op),
            _ => {
                return Err(WeaverError::UnhandledPosition {
                    node,
                    detail: "position refinement does not match the operation".to_string(),
                });
            }
        };
        return Ok(PlacedCheck {
            location,
            positioned: true,
        });
    }

    match rc.position.kind {
        PositionKind::Value => {
            // default to before the operation; checks raised from a
            // callee's postcondition fire after the call instead
            let location = match &index.ops[&op].kind {
                OpKind::Invoke { callee, .. } if specs.in_postcondition(callee, rc.context) => {
                    Location::Post(op)
                }
                _ => Location::Pre(op),
            };
            Ok(PlacedCheck {
                location,
                positioned: false,
            })
        }
        PositionKind::LoopBefore | PositionKind::LoopAfter | PositionKind::LoopBegin
        | PositionKind::LoopEnd => {
            if !op_is_while(index.ops[&op]) {
                return Err(WeaverError::UnhandledPosition {
                    node,
                    detail: "loop position at a non-loop operation".to_string(),
                });
            }
            let location = match rc.position.kind {
                PositionKind::LoopBefore => Location::Pre(op),
                PositionKind::LoopAfter => Location::Post(op),
                PositionKind::LoopEnd => Location::LoopEnd(op),
                PositionKind::LoopBegin => {
                    // verifier artefact: loop-begin attached to a node
                    // outside the invariant tree means "after the loop"
                    let inside = index
                        .invariant_nodes
                        .get(&op)
                        .is_some_and(|nodes| nodes.contains(&node));
                    if inside {
                        Location::LoopStart(op)
                    } else {
                        Location::Post(op)
                    }
                }
                PositionKind::Value => unreachable!(),
            };
            Ok(PlacedCheck {
                location,
                positioned: true,
            })
        }
    }
}

/// Resolve the location of one branch-condition frame. Frames whose
/// condition lives inside a callee's specification resolve through their
/// origin call node.
fn resolve_frame(
    method: &str,
    frame: &BranchCond,
    index: &MethodIndex<'_>,
    specs: &SpecSets,
) -> Result<Location> {
    if let Some(loc) = index.locations.get(&frame.at) {
        return Ok(*loc);
    }
    let origin = frame.origin.ok_or_else(|| {
        WeaverError::mismatch(
            method,
            format!("branch condition at unindexed {} with no origin", frame.at),
        )
    })?;
    let call_loc = *index.locations.get(&origin).ok_or_else(|| {
        WeaverError::mismatch(
            method,
            format!("branch-condition origin {} is not indexed", origin),
        )
    })?;
    let op = call_loc.op().ok_or_else(|| {
        WeaverError::mismatch(
            method,
            format!("branch-condition origin {} is not an operation", origin),
        )
    })?;
    match &index.ops[&op].kind {
        OpKind::Invoke { callee, .. } => {
            if specs.in_postcondition(callee, frame.at) {
                Ok(Location::Post(op))
            } else if specs.in_precondition(callee, frame.at) {
                Ok(Location::Pre(op))
            } else {
                Err(WeaverError::mismatch(
                    method,
                    format!(
                        "branch condition {} is in neither specification of '{}'",
                        frame.at, callee
                    ),
                ))
            }
        }
        _ => Err(WeaverError::mismatch(
            method,
            format!("branch-condition origin {} is not a call", origin),
        )),
    }
}

/// Normalise a frame condition: strip negations, tracking polarity.
fn strip_negation(expr: &VirExpr) -> (&VirExpr, bool) {
    let mut current = expr;
    let mut polarity = true;
    while let VirExprKind::Unary {
        op: VirUnaryOp::Not,
        operand,
    } = &current.kind
    {
        polarity = !polarity;
        current = operand.as_ref();
    }
    (current, polarity)
}

/// Phase C for one residual check: intern its branch-condition stack and
/// register the check with its conjunction. Returns where the check
/// landed and whether it is permission-shaped (drives the phase-D
/// permission walk).
pub(crate) fn collect_check(
    method: &str,
    node: NodeId,
    rc: &ResidualCheck,
    index: &MethodIndex<'_>,
    specs: &SpecSets,
    interner: &mut Interner,
    acc: &mut CheckAccumulator,
) -> Result<(PlacedCheck, bool)> {
    let placed = place_check(method, node, rc, index, specs)?;
    let check = Check::from_vir(&rc.check, method)?;
    let needs_tracking = check.needs_tracking();

    let mut conj = Conjunction::new();
    for frame in &rc.conditions {
        let frame_loc = resolve_frame(method, frame, index, specs)?;
        let (value_expr, polarity) = strip_negation(&frame.cond);
        let value = CheckExpression::from_vir(value_expr, method)?;
        let id = interner.intern(frame_loc, value);
        interner.record_context(id, &conj);
        conj.insert(id, polarity);
    }

    acc.add(placed.location, check, conj);
    Ok((placed, needs_tracking))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interner_reuses_ids_for_equal_keys() {
        let mut interner = Interner::new();
        let loc = Location::MethodPre;
        let a = interner.intern(loc, CheckExpression::Var("a".to_string()));
        let b = interner.intern(loc, CheckExpression::Var("b".to_string()));
        let a2 = interner.intern(loc, CheckExpression::Var("a".to_string()));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(a2, a);
        assert_eq!(interner.terms().len(), 2);
    }

    #[test]
    fn same_value_at_different_locations_interns_separately() {
        let mut interner = Interner::new();
        let v = CheckExpression::Var("a".to_string());
        let a = interner.intern(Location::MethodPre, v.clone());
        let b = interner.intern(Location::MethodPost, v);
        assert_ne!(a, b);
    }

    #[test]
    fn accumulator_merges_guards_per_check() {
        let mut acc = CheckAccumulator::new();
        let check = Check::Expr(CheckExpression::BoolLit(true));
        let mut c1 = Conjunction::new();
        c1.insert(0, true);
        let mut c2 = Conjunction::new();
        c2.insert(0, false);
        acc.add(Location::MethodPre, check.clone(), c1);
        acc.add(Location::MethodPre, check.clone(), c2);
        let out = acc.into_ordered();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].2.0.len(), 2);
    }

    #[test]
    fn strip_negation_tracks_polarity() {
        use gv_ir::vir::{VirExpr, VirExprKind};
        let var = VirExpr {
            id: NodeId(0),
            kind: VirExprKind::LocalVar("p".to_string()),
        };
        let negated = VirExpr {
            id: NodeId(1),
            kind: VirExprKind::Unary {
                op: VirUnaryOp::Not,
                operand: Box::new(var.clone()),
            },
        };
        let (inner, polarity) = strip_negation(&negated);
        assert_eq!(inner, &var);
        assert!(!polarity);

        let (inner, polarity) = strip_negation(&var);
        assert_eq!(inner, &var);
        assert!(polarity);
    }
}
