//! Lock-step indexing of IR operations against verifier statements.
//!
//! The verifier guarantees that a method's statements correspond
//! one-to-one, in source order, with the method's IR operations - modulo
//! a fixed list of exceptions:
//!
//! - imperative `assert` ops and `error` ops are invisible to the
//!   verifier and consume no statement;
//! - a specification `assert` consumes one `Assert`;
//! - a value-returning `return` consumes the verifier's `$result`
//!   assignment; a void `return` consumes none.
//!
//! Any other disagreement is a fatal structural mismatch.
//!
//! Walking the two trees together produces the node index: for every
//! verifier node reachable from a specification clause, a loop invariant
//! or condition, a call formula, a fold/unfold operand or an intermediate
//! assertion, the [`Location`] at which that node's value is observable.
//! The walk also records the trace order of node ids - condition-term ids
//! are assigned in first-seen order along this trace, which is what makes
//! them a deterministic function of the input.

use crate::check::Location;
use crate::error::{Result, WeaverError};
use gv_ir::program::{AssertKind, Expression, Method, Op, OpId, OpKind};
use gv_ir::vir::{NodeId, VirExpr, VirMethod, VirProgram, VirStmt, VirStmtKind};
use std::collections::{HashMap, HashSet};

use crate::expr::RESULT_VAR;

/// Per-method node index produced by the lock-step walk.
pub(crate) struct MethodIndex<'p> {
    /// Verifier node → the location where its value is observable
    pub locations: HashMap<NodeId, Location>,
    /// For each loop: the nodes inside its invariant tree (used to demote
    /// loop-begin positions the verifier attached outside the invariant)
    pub invariant_nodes: HashMap<OpId, HashSet<NodeId>>,
    /// Every operation of the method, by id
    pub ops: HashMap<OpId, &'p Op>,
    /// All indexed node ids in trace order
    pub trace: Vec<NodeId>,
    pub invokes: Vec<OpId>,
    pub returns: Vec<OpId>,
    pub allocations: Vec<OpId>,
}

/// Node-id sets of every method's pre- and postcondition, program-wide.
/// Residual checks raised while establishing a callee's specification
/// reference nodes in the callee's trees; these sets resolve them.
pub(crate) struct SpecSets {
    pre: HashMap<String, HashSet<NodeId>>,
    post: HashMap<String, HashSet<NodeId>>,
}

impl SpecSets {
    pub fn build(vir: &VirProgram) -> SpecSets {
        let mut pre = HashMap::new();
        let mut post = HashMap::new();
        for method in &vir.methods {
            pre.insert(method.name.clone(), spec_ids(&method.preconditions));
            post.insert(method.name.clone(), spec_ids(&method.postconditions));
        }
        SpecSets { pre, post }
    }

    pub fn in_postcondition(&self, method: &str, node: NodeId) -> bool {
        self.post.get(method).is_some_and(|s| s.contains(&node))
    }

    pub fn in_precondition(&self, method: &str, node: NodeId) -> bool {
        self.pre.get(method).is_some_and(|s| s.contains(&node))
    }
}

fn spec_ids(exprs: &[VirExpr]) -> HashSet<NodeId> {
    let mut ids = Vec::new();
    for e in exprs {
        e.collect_ids(&mut ids);
    }
    ids.into_iter().collect()
}

struct Indexer<'p> {
    method: &'p str,
    index: MethodIndex<'p>,
}

pub(crate) fn index_method<'p>(method: &'p Method, vir: &VirMethod) -> Result<MethodIndex<'p>> {
    let mut indexer = Indexer {
        method: &method.name,
        index: MethodIndex {
            locations: HashMap::new(),
            invariant_nodes: HashMap::new(),
            ops: HashMap::new(),
            trace: Vec::new(),
            invokes: Vec::new(),
            returns: Vec::new(),
            allocations: Vec::new(),
        },
    };

    for pre in &vir.preconditions {
        indexer.record_expr(pre, Location::MethodPre);
    }
    indexer.walk_block(&method.body.0, &vir.body)?;
    for post in &vir.postconditions {
        indexer.record_expr(post, Location::MethodPost);
    }

    Ok(indexer.index)
}

impl<'p> Indexer<'p> {
    fn record_expr(&mut self, expr: &VirExpr, location: Location) {
        let mut ids = Vec::new();
        expr.collect_ids(&mut ids);
        for id in ids {
            // first assignment wins; shared sub-nodes keep their first site
            self.index.locations.entry(id).or_insert(location);
            self.index.trace.push(id);
        }
    }

    fn record_stmt_node(&mut self, node: NodeId, location: Location) {
        self.index.locations.entry(node).or_insert(location);
        self.index.trace.push(node);
    }

    fn mismatch(&self, op: &Op, expected: &str, got: Option<&VirStmt>) -> WeaverError {
        match got {
            Some(stmt) => WeaverError::mismatch(
                self.method,
                format!(
                    "{} expects a verifier {}, found {} at {}",
                    op.id,
                    expected,
                    stmt_kind_name(&stmt.kind),
                    stmt.id
                ),
            ),
            None => WeaverError::mismatch(
                self.method,
                format!("{} expects a verifier {}, but none are left", op.id, expected),
            ),
        }
    }

    fn walk_block(&mut self, ops: &'p [Op], stmts: &[VirStmt]) -> Result<()> {
        let mut stmts = stmts.iter();
        for op in ops {
            self.index.ops.insert(op.id, op);
            match &op.kind {
                // invisible to the verifier
                OpKind::Assert {
                    kind: AssertKind::Imperative,
                    ..
                }
                | OpKind::Error { .. } => {}
                OpKind::Return { value: None } => {
                    self.index.returns.push(op.id);
                }
                OpKind::Return { value: Some(_) } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::LocalVarAssign { target, value })
                            if target == RESULT_VAR =>
                        {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::MethodPost);
                            self.record_expr(value, Location::MethodPost);
                        }
                        _ => return Err(self.mismatch(op, "$result assignment", stmt)),
                    }
                    self.index.returns.push(op.id);
                }
                OpKind::If {
                    then_branch,
                    else_branch,
                    ..
                } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::If {
                            cond,
                            then_branch: vthen,
                            else_branch: velse,
                        }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.record_expr(cond, Location::Pre(op.id));
                            self.walk_block(&then_branch.0, vthen)?;
                            self.walk_block(&else_branch.0, velse)?;
                        }
                        _ => return Err(self.mismatch(op, "if", stmt)),
                    }
                }
                OpKind::While { body, .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::While {
                            cond,
                            invariants,
                            body: vbody,
                        }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            // the loop condition is (re-)evaluated at the
                            // head of every iteration
                            self.record_expr(cond, Location::LoopStart(op.id));
                            let mut inv_ids = Vec::new();
                            for inv in invariants {
                                self.record_expr(inv, Location::LoopStart(op.id));
                                inv.collect_ids(&mut inv_ids);
                            }
                            self.index
                                .invariant_nodes
                                .insert(op.id, inv_ids.into_iter().collect());
                            self.walk_block(&body.0, vbody)?;
                        }
                        _ => return Err(self.mismatch(op, "while", stmt)),
                    }
                }
                OpKind::Invoke { .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::MethodCall { args, .. }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            for arg in args {
                                self.record_expr(arg, Location::Pre(op.id));
                            }
                            self.index.invokes.push(op.id);
                        }
                        _ => return Err(self.mismatch(op, "method call", stmt)),
                    }
                }
                OpKind::AllocValue { .. } | OpKind::AllocStruct { .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::New { .. }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.index.allocations.push(op.id);
                        }
                        _ => return Err(self.mismatch(op, "allocation", stmt)),
                    }
                }
                OpKind::Assign { .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::LocalVarAssign { value, .. }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.record_expr(value, Location::Pre(op.id));
                        }
                        _ => return Err(self.mismatch(op, "assignment", stmt)),
                    }
                }
                OpKind::AssignMember { .. } | OpKind::AssignDeref { .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::FieldAssign { target, value }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.record_expr(target, Location::Pre(op.id));
                            self.record_expr(value, Location::Pre(op.id));
                        }
                        _ => return Err(self.mismatch(op, "field assignment", stmt)),
                    }
                }
                OpKind::Fold { .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::Fold { access }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.record_expr(access, Location::Pre(op.id));
                        }
                        _ => return Err(self.mismatch(op, "fold", stmt)),
                    }
                }
                OpKind::Unfold { .. } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::Unfold { access }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.record_expr(access, Location::Pre(op.id));
                        }
                        _ => return Err(self.mismatch(op, "unfold", stmt)),
                    }
                }
                OpKind::Assert {
                    kind: AssertKind::Specification,
                    ..
                } => {
                    let stmt = stmts.next();
                    match stmt.map(|s| &s.kind) {
                        Some(VirStmtKind::Assert { expr }) => {
                            let stmt = stmt.unwrap();
                            self.record_stmt_node(stmt.id, Location::Pre(op.id));
                            self.record_expr(expr, Location::Pre(op.id));
                        }
                        _ => return Err(self.mismatch(op, "assert", stmt)),
                    }
                }
            }
        }
        if let Some(stmt) = stmts.next() {
            return Err(WeaverError::mismatch(
                self.method,
                format!(
                    "verifier {} at {} has no matching operation",
                    stmt_kind_name(&stmt.kind),
                    stmt.id
                ),
            ));
        }
        Ok(())
    }
}

fn stmt_kind_name(kind: &VirStmtKind) -> &'static str {
    match kind {
        VirStmtKind::If { .. } => "if",
        VirStmtKind::While { .. } => "while",
        VirStmtKind::MethodCall { .. } => "method call",
        VirStmtKind::LocalVarAssign { .. } => "assignment",
        VirStmtKind::FieldAssign { .. } => "field assignment",
        VirStmtKind::New { .. } => "allocation",
        VirStmtKind::Assert { .. } => "assert",
        VirStmtKind::Fold { .. } => "fold",
        VirStmtKind::Unfold { .. } => "unfold",
    }
}

/// True if a non-`While` operation is matched against a value-bearing
/// expression location; used by tests and the position reclassifier.
pub(crate) fn op_is_while(op: &Op) -> bool {
    matches!(op.kind, OpKind::While { .. })
}

/// True if the last operation of a block can fall through to whatever
/// follows the block.
///
/// A block falls through unless its last operation is a `return`, an
/// unconditional loop, or an `if` neither of whose branches falls
/// through. The empty block always falls through.
pub(crate) fn block_falls_through(ops: &[Op]) -> bool {
    match ops.last() {
        None => true,
        Some(op) => match &op.kind {
            OpKind::Return { .. } => false,
            OpKind::While { cond, .. } => !matches!(cond, Expression::BoolLit(true)),
            OpKind::If {
                then_branch,
                else_branch,
                ..
            } => block_falls_through(&then_branch.0) || block_falls_through(&else_branch.0),
            _ => true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gv_ir::program::{Block, Type};
    use gv_ir::vir::VirExprKind;

    fn op(id: u32, kind: OpKind) -> Op {
        Op { id: OpId(id), kind }
    }

    fn stmt(id: u64, kind: VirStmtKind) -> VirStmt {
        VirStmt {
            id: NodeId(id),
            kind,
        }
    }

    fn vexpr(id: u64, kind: VirExprKind) -> VirExpr {
        VirExpr {
            id: NodeId(id),
            kind,
        }
    }

    fn method(body: Vec<Op>) -> Method {
        Method {
            name: "m".to_string(),
            params: vec![],
            return_type: Some(Type::Int),
            precondition: None,
            postcondition: None,
            locals: vec![],
            body: Block(body),
        }
    }

    fn vir_method(body: Vec<VirStmt>) -> VirMethod {
        VirMethod {
            name: "m".to_string(),
            preconditions: vec![],
            postconditions: vec![],
            body,
        }
    }

    #[test]
    fn imperative_assert_consumes_no_statement() {
        let m = method(vec![
            op(
                0,
                OpKind::Assert {
                    value: Expression::BoolLit(true),
                    kind: AssertKind::Imperative,
                },
            ),
            op(
                1,
                OpKind::Assign {
                    target: "x".to_string(),
                    value: Expression::IntLit(1),
                },
            ),
        ]);
        let v = vir_method(vec![stmt(
            10,
            VirStmtKind::LocalVarAssign {
                target: "x".to_string(),
                value: vexpr(11, VirExprKind::IntLit(1)),
            },
        )]);
        let index = index_method(&m, &v).unwrap();
        assert_eq!(index.locations[&NodeId(10)], Location::Pre(OpId(1)));
        assert_eq!(index.locations[&NodeId(11)], Location::Pre(OpId(1)));
    }

    #[test]
    fn value_return_consumes_result_assignment() {
        let m = method(vec![op(
            0,
            OpKind::Return {
                value: Some(Expression::IntLit(0)),
            },
        )]);
        let v = vir_method(vec![stmt(
            20,
            VirStmtKind::LocalVarAssign {
                target: "$result".to_string(),
                value: vexpr(21, VirExprKind::IntLit(0)),
            },
        )]);
        let index = index_method(&m, &v).unwrap();
        assert_eq!(index.locations[&NodeId(20)], Location::MethodPost);
        assert_eq!(index.returns, vec![OpId(0)]);
    }

    #[test]
    fn leftover_verifier_statement_is_a_mismatch() {
        let m = method(vec![]);
        let v = vir_method(vec![stmt(
            30,
            VirStmtKind::Assert {
                expr: vexpr(31, VirExprKind::BoolLit(true)),
            },
        )]);
        assert!(matches!(
            index_method(&m, &v),
            Err(WeaverError::StructuralMismatch { .. })
        ));
    }

    #[test]
    fn kind_disagreement_is_a_mismatch() {
        let m = method(vec![op(
            0,
            OpKind::Assign {
                target: "x".to_string(),
                value: Expression::IntLit(1),
            },
        )]);
        let v = vir_method(vec![stmt(
            40,
            VirStmtKind::New {
                target: "x".to_string(),
            },
        )]);
        assert!(matches!(
            index_method(&m, &v),
            Err(WeaverError::StructuralMismatch { .. })
        ));
    }

    #[test]
    fn loop_condition_and_invariant_index_at_loop_start() {
        let m = method(vec![op(
            0,
            OpKind::While {
                cond: Expression::Var("c".to_string()),
                invariant: Some(Expression::BoolLit(true)),
                body: Block::new(),
            },
        )]);
        let v = vir_method(vec![stmt(
            50,
            VirStmtKind::While {
                cond: vexpr(51, VirExprKind::LocalVar("c".to_string())),
                invariants: vec![vexpr(52, VirExprKind::BoolLit(true))],
                body: vec![],
            },
        )]);
        let index = index_method(&m, &v).unwrap();
        assert_eq!(index.locations[&NodeId(50)], Location::Pre(OpId(0)));
        assert_eq!(index.locations[&NodeId(51)], Location::LoopStart(OpId(0)));
        assert_eq!(index.locations[&NodeId(52)], Location::LoopStart(OpId(0)));
        assert!(index.invariant_nodes[&OpId(0)].contains(&NodeId(52)));
        assert!(!index.invariant_nodes[&OpId(0)].contains(&NodeId(51)));
    }

    #[test]
    fn fall_through_analysis_matches_op_shapes() {
        // empty body falls through
        assert!(block_falls_through(&[]));
        // trailing return does not
        assert!(!block_falls_through(&[op(0, OpKind::Return { value: None })]));
        // unconditional loop does not
        assert!(!block_falls_through(&[op(
            1,
            OpKind::While {
                cond: Expression::BoolLit(true),
                invariant: None,
                body: Block::new(),
            },
        )]));
        // if with one falling branch does
        assert!(block_falls_through(&[op(
            2,
            OpKind::If {
                cond: Expression::Var("c".to_string()),
                then_branch: Block(vec![op(3, OpKind::Return { value: None })]),
                else_branch: Block::new(),
            },
        )]));
        // if with both branches returning does not
        assert!(!block_falls_through(&[op(
            4,
            OpKind::If {
                cond: Expression::Var("c".to_string()),
                then_branch: Block(vec![op(5, OpKind::Return { value: None })]),
                else_branch: Block(vec![op(6, OpKind::Return { value: None })]),
            },
        )]));
    }

    #[test]
    fn spec_sets_cover_both_clauses() {
        let vp = VirProgram {
            methods: vec![VirMethod {
                name: "callee".to_string(),
                preconditions: vec![vexpr(60, VirExprKind::BoolLit(true))],
                postconditions: vec![vexpr(61, VirExprKind::BoolLit(true))],
                body: vec![],
            }],
        };
        let specs = SpecSets::build(&vp);
        assert!(specs.in_precondition("callee", NodeId(60)));
        assert!(specs.in_postcondition("callee", NodeId(61)));
        assert!(!specs.in_postcondition("callee", NodeId(60)));
    }

}
