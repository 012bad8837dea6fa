//! Data model consumed by the gv weaver.
//!
//! This crate defines the two inputs of the weaving pass and nothing else:
//!
//! - [`program`]: the C-like intermediate representation produced by the
//!   front end - structs, predicates, methods, a typed operation tree and
//!   an expression tree that includes first-class specification forms
//!   (`acc(..)`, predicate instances, the `?` imprecision marker).
//! - [`vir`]: the verifier-facing AST plus the residual-check table the
//!   symbolic verifier emits for assertions it could not discharge
//!   statically.
//!
//! The weaver lives in its own crate (`gv-weaver`) and depends on this one;
//! keeping the data model separate means front ends and verifier bridges
//! can build programs and check tables without pulling in the pass itself.
//!
//! Every type here derives serde traits so whole programs and check tables
//! round-trip through JSON - that is the interchange format the `gvweave`
//! CLI reads and writes.

pub mod program;
pub mod vir;

pub use program::{
    AssertKind, BinaryOp, Block, Expression, Method, Op, OpId, OpKind, Predicate, Program,
    StructDef, Type, UnaryOp, Var,
};
pub use vir::{
    BranchCond, CheckPosition, NodeId, PositionKind, PositionRefinement, ResidualCheck,
    ResidualTable, VirBinaryOp, VirExpr, VirExprKind, VirMethod, VirProgram, VirStmt, VirStmtKind,
    VirUnaryOp,
};
