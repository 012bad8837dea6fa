//! Verifier-facing AST and the residual-check table.
//!
//! The symbolic verifier works on its own statement/expression language,
//! decoupled from the IR in [`crate::program`]. What the weaver needs from
//! that side is small: every node carries a stable [`NodeId`], methods line
//! up statement-for-statement with IR operations (modulo a fixed list of
//! exceptions handled during index alignment), and the verifier reports
//! each undischarged assertion as a [`ResidualCheck`] keyed by the node it
//! failed at.
//!
//! Branch conditions come along as a stack of [`BranchCond`] frames,
//! outermost first: the chain of branches execution must take to reach the
//! failing assertion. A frame whose condition lives inside a callee's
//! pre/postcondition additionally names its `origin` - the call node in
//! the enclosing method - so the weaver can place it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable identity of one verifier AST node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VirBinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    And,
    Or,
    Equal,
    NotEqual,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VirUnaryOp {
    Not,
    Negate,
}

/// One verifier expression node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirExpr {
    pub id: NodeId,
    pub kind: VirExprKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VirExprKind {
    IntLit(i64),
    CharLit(char),
    BoolLit(bool),
    StringLit(String),
    NullLit,
    /// A local variable or parameter. The distinguished name `$result`
    /// denotes the method result; names with the `$res_` prefix are
    /// result temporaries introduced by the verifier.
    LocalVar(String),
    Binary {
        op: VirBinaryOp,
        left: Box<VirExpr>,
        right: Box<VirExpr>,
    },
    Unary {
        op: VirUnaryOp,
        operand: Box<VirExpr>,
    },
    /// `receiver.field`. Field names follow the `struct$field` convention;
    /// the three pointer sentinels (`$int_value`, `$bool_value`,
    /// `$ref_value`) encode pointer dereference instead.
    FieldAccess {
        receiver: Box<VirExpr>,
        field: String,
    },
    /// `acc(receiver.field)`
    FieldAccessPredicate { access: Box<VirExpr> },
    /// A predicate applied to arguments, as a location
    PredicateAccess { name: String, args: Vec<VirExpr> },
    /// `acc(name(args..))`
    PredicateAccessPredicate { access: Box<VirExpr> },
    Cond {
        cond: Box<VirExpr>,
        then: Box<VirExpr>,
        otherwise: Box<VirExpr>,
    },
    /// The verifier-side image of the `?` marker
    Imprecise { precise: Option<Box<VirExpr>> },
}

impl VirExpr {
    /// All node ids in this expression tree, including this node's.
    pub fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.id);
        match &self.kind {
            VirExprKind::Binary { left, right, .. } => {
                left.collect_ids(out);
                right.collect_ids(out);
            }
            VirExprKind::Unary { operand, .. } => operand.collect_ids(out),
            VirExprKind::FieldAccess { receiver, .. } => receiver.collect_ids(out),
            VirExprKind::FieldAccessPredicate { access }
            | VirExprKind::PredicateAccessPredicate { access } => access.collect_ids(out),
            VirExprKind::PredicateAccess { args, .. } => {
                for a in args {
                    a.collect_ids(out);
                }
            }
            VirExprKind::Cond {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_ids(out);
                then.collect_ids(out);
                otherwise.collect_ids(out);
            }
            VirExprKind::Imprecise { precise } => {
                if let Some(p) = precise {
                    p.collect_ids(out);
                }
            }
            VirExprKind::IntLit(_)
            | VirExprKind::CharLit(_)
            | VirExprKind::BoolLit(_)
            | VirExprKind::StringLit(_)
            | VirExprKind::NullLit
            | VirExprKind::LocalVar(_) => {}
        }
    }
}

/// One verifier statement node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirStmt {
    pub id: NodeId,
    pub kind: VirStmtKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VirStmtKind {
    If {
        cond: VirExpr,
        then_branch: Vec<VirStmt>,
        else_branch: Vec<VirStmt>,
    },
    While {
        cond: VirExpr,
        invariants: Vec<VirExpr>,
        body: Vec<VirStmt>,
    },
    MethodCall {
        method: String,
        args: Vec<VirExpr>,
        targets: Vec<String>,
    },
    LocalVarAssign {
        target: String,
        value: VirExpr,
    },
    FieldAssign {
        target: VirExpr,
        value: VirExpr,
    },
    /// Allocation (value cell or struct)
    New { target: String },
    Assert { expr: VirExpr },
    Fold { access: VirExpr },
    Unfold { access: VirExpr },
}

/// Verifier image of one method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirMethod {
    pub name: String,
    pub preconditions: Vec<VirExpr>,
    pub postconditions: Vec<VirExpr>,
    pub body: Vec<VirStmt>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VirProgram {
    pub methods: Vec<VirMethod>,
}

impl VirProgram {
    pub fn find_method(&self, name: &str) -> Option<&VirMethod> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Where, relative to its node, a residual check must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionKind {
    /// At the evaluation of the node itself
    Value,
    /// Before the loop is entered
    LoopBefore,
    /// After the loop has exited
    LoopAfter,
    /// At the top of every iteration
    LoopBegin,
    /// At the bottom of every iteration
    LoopEnd,
}

/// Optional refinement distinguishing checks raised while establishing a
/// callee's specification or a fold/unfold obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionRefinement {
    InCall,
    InFold,
    InUnfold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckPosition {
    pub kind: PositionKind,
    pub refinement: Option<PositionRefinement>,
}

impl CheckPosition {
    pub fn value() -> Self {
        CheckPosition {
            kind: PositionKind::Value,
            refinement: None,
        }
    }
}

/// One frame of a branch-condition stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchCond {
    /// The condition that must have evaluated true (or, when negated,
    /// false) for execution to reach the check
    pub cond: VirExpr,
    /// The node at which the branch was taken
    pub at: NodeId,
    /// For conditions inside a callee's pre/postcondition: the call node
    /// in the enclosing method
    pub origin: Option<NodeId>,
}

/// One assertion the verifier could not discharge statically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualCheck {
    /// The failing formula
    pub check: VirExpr,
    /// The specification clause the formula came from
    pub context: NodeId,
    pub position: CheckPosition,
    /// Branch frames, outermost first
    pub conditions: Vec<BranchCond>,
}

/// The verifier's full output: residual checks keyed by the node at which
/// they were raised.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResidualTable {
    pub checks: HashMap<NodeId, Vec<ResidualCheck>>,
}

impl ResidualTable {
    pub fn is_empty(&self) -> bool {
        self.checks.values().all(Vec::is_empty)
    }

    pub fn checks_at(&self, node: NodeId) -> &[ResidualCheck] {
        self.checks.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(id: u64, name: &str) -> VirExpr {
        VirExpr {
            id: NodeId(id),
            kind: VirExprKind::LocalVar(name.to_string()),
        }
    }

    #[test]
    fn collect_ids_covers_nested_nodes() {
        let expr = VirExpr {
            id: NodeId(1),
            kind: VirExprKind::Binary {
                op: VirBinaryOp::And,
                left: Box::new(var(2, "a")),
                right: Box::new(VirExpr {
                    id: NodeId(3),
                    kind: VirExprKind::Unary {
                        op: VirUnaryOp::Not,
                        operand: Box::new(var(4, "b")),
                    },
                }),
            },
        };
        let mut ids = Vec::new();
        expr.collect_ids(&mut ids);
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3), NodeId(4)]);
    }

    #[test]
    fn empty_table_reports_empty() {
        let mut table = ResidualTable::default();
        assert!(table.is_empty());
        table.checks.insert(NodeId(0), vec![]);
        assert!(table.is_empty());
        assert!(table.checks_at(NodeId(9)).is_empty());
    }
}
