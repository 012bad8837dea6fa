//! C-like intermediate representation with first-class specifications.
//!
//! Programs arrive here fully parsed and resolved: every member access
//! names its struct, every operation carries a dense [`OpId`], and
//! specifications (pre/postconditions, loop invariants, fold/unfold
//! operands) are ordinary [`Expression`] trees that may additionally use
//! `acc(..)`, predicate instances and the `?` imprecision marker.
//!
//! The weaver mutates programs in place: it appends parameters and locals,
//! rewrites operation blocks and adds synthetic fields. All of that goes
//! through the helpers at the bottom of this module so identity rules stay
//! in one place - an operation keeps its id for the lifetime of the pass,
//! and freshly emitted operations mint ids from the program's counter.

use serde::{Deserialize, Serialize};

/// Dense identity of one operation in a program.
///
/// Ids are minted by the front end in visitation order and by
/// [`Program::fresh_op_id`] for woven-in operations. Two occurrences of
/// the same id always denote the same operation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpId(pub u32);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Base types of the source language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    Int,
    Char,
    Bool,
    String,
    /// Pointer to a value cell of the inner type
    Pointer(Box<Type>),
    /// Named struct type (always held behind a pointer at runtime)
    Struct(String),
}

/// Binary operators shared by imperative code and specifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
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
pub enum UnaryOp {
    Not,
    Negate,
}

/// Expression tree.
///
/// Value expressions and specification expressions share this type; the
/// specification-only forms (`Accessibility`, `PredicateInstance`,
/// `Imprecise`) are rejected by the weaver wherever a plain value is
/// required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    IntLit(i64),
    CharLit(char),
    BoolLit(bool),
    StringLit(String),
    Null,
    Var(String),
    /// The value returned by the enclosing method (postconditions only)
    Result,
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    /// `cond ? then : otherwise`
    Cond {
        cond: Box<Expression>,
        then: Box<Expression>,
        otherwise: Box<Expression>,
    },
    /// Field access `root.field` where `root` has struct type `struct_name`
    Member {
        root: Box<Expression>,
        struct_name: String,
        field: String,
    },
    /// Pointer dereference `*operand`
    Deref(Box<Expression>),
    /// `acc(member)` - permission to read/write a heap location
    Accessibility(Box<Expression>),
    /// `name(args..)` - an instance of a named predicate
    PredicateInstance { name: String, args: Vec<Expression> },
    /// `?` or `? && inner` - the imprecision marker with its precise part
    Imprecise(Option<Box<Expression>>),
}

impl Expression {
    /// True if this specification starts with the imprecision marker.
    pub fn is_imprecise(&self) -> bool {
        matches!(self, Expression::Imprecise(_))
    }

    /// The precise part of a specification: the whole expression when it
    /// is precise, the inner conjunct (if any) when it is imprecise.
    pub fn precise_part(&self) -> Option<&Expression> {
        match self {
            Expression::Imprecise(inner) => inner.as_deref(),
            other => Some(other),
        }
    }

    /// True when the expression contains a permission form (`acc(..)` or
    /// a predicate instance) anywhere in its tree.
    pub fn contains_permission(&self) -> bool {
        match self {
            Expression::Accessibility(_) | Expression::PredicateInstance { .. } => true,
            Expression::Binary { left, right, .. } => {
                left.contains_permission() || right.contains_permission()
            }
            Expression::Unary { operand, .. } => operand.contains_permission(),
            Expression::Cond {
                cond,
                then,
                otherwise,
            } => {
                cond.contains_permission()
                    || then.contains_permission()
                    || otherwise.contains_permission()
            }
            Expression::Member { root, .. } => root.contains_permission(),
            Expression::Deref(operand) => operand.contains_permission(),
            Expression::Imprecise(inner) => {
                inner.as_ref().is_some_and(|e| e.contains_permission())
            }
            Expression::IntLit(_)
            | Expression::CharLit(_)
            | Expression::BoolLit(_)
            | Expression::StringLit(_)
            | Expression::Null
            | Expression::Var(_)
            | Expression::Result => false,
        }
    }
}

/// True if an optional specification is imprecise. Absent specifications
/// are precise (they default to `true`).
pub fn spec_is_imprecise(spec: Option<&Expression>) -> bool {
    spec.is_some_and(Expression::is_imprecise)
}

/// Whether an `assert` came from imperative code or from a specification.
///
/// Imperative asserts execute at run time and are invisible to the
/// verifier; specification asserts are verifier obligations and consume a
/// verifier statement during index alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssertKind {
    Imperative,
    Specification,
}

/// One operation: stable identity plus its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub id: OpId,
    pub kind: OpKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    If {
        cond: Expression,
        then_branch: Block,
        else_branch: Block,
    },
    While {
        cond: Expression,
        invariant: Option<Expression>,
        body: Block,
    },
    Invoke {
        callee: String,
        args: Vec<Expression>,
        /// Variable receiving the returned value, if any
        target: Option<String>,
    },
    /// Allocate a single value cell; `target` becomes a pointer to it
    AllocValue { target: String, ty: Type },
    /// Allocate a struct; `target` becomes a pointer to it
    AllocStruct { target: String, struct_name: String },
    Assign {
        target: String,
        value: Expression,
    },
    AssignMember {
        root: Expression,
        struct_name: String,
        field: String,
        value: Expression,
    },
    /// `*pointer = value`
    AssignDeref {
        pointer: Expression,
        value: Expression,
    },
    Fold {
        predicate: String,
        args: Vec<Expression>,
    },
    Unfold {
        predicate: String,
        args: Vec<Expression>,
    },
    Assert {
        value: Expression,
        kind: AssertKind,
    },
    /// Abort execution with a message value
    Error { value: Expression },
    Return { value: Option<Expression> },
}

/// An ordered sequence of operations (a method body or branch).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Block(pub Vec<Op>);

impl Block {
    pub fn new() -> Self {
        Block(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A named, typed variable (parameter or local declaration).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<Var>,
}

impl StructDef {
    /// Index of a field within this struct, if present.
    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == field)
    }

    /// Append a field unless one with that name already exists; returns
    /// its index either way.
    pub fn ensure_field(&mut self, name: &str, ty: Type) -> usize {
        if let Some(idx) = self.field_index(name) {
            return idx;
        }
        self.fields.push(Var {
            name: name.to_string(),
            ty,
        });
        self.fields.len() - 1
    }
}

/// A named predicate: an abstraction over a specification expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub name: String,
    pub params: Vec<Var>,
    pub body: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub name: String,
    pub params: Vec<Var>,
    pub return_type: Option<Type>,
    pub precondition: Option<Expression>,
    pub postcondition: Option<Expression>,
    /// Local declarations the body may reference. The weaver appends its
    /// synthetic temporaries here.
    #[serde(default)]
    pub locals: Vec<Var>,
    pub body: Block,
}

impl Method {
    pub fn has_imprecise_pre(&self) -> bool {
        spec_is_imprecise(self.precondition.as_ref())
    }

    pub fn has_imprecise_post(&self) -> bool {
        spec_is_imprecise(self.postcondition.as_ref())
    }

    /// Declare a local unless a parameter or local of that name exists.
    pub fn ensure_local(&mut self, name: &str, ty: Type) {
        let taken = self.params.iter().any(|v| v.name == name)
            || self.locals.iter().any(|v| v.name == name);
        if !taken {
            self.locals.push(Var {
                name: name.to_string(),
                ty,
            });
        }
    }
}

/// A whole program: the unit the weaver consumes and rewrites.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub structs: Vec<StructDef>,
    pub predicates: Vec<Predicate>,
    pub methods: Vec<Method>,
    /// Next unused operation id. Front ends set this past their highest
    /// minted id; the weaver draws fresh ids from it.
    #[serde(default)]
    pub next_op_id: u32,
}

impl Program {
    pub fn find_method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn find_struct(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }

    pub fn find_struct_mut(&mut self, name: &str) -> Option<&mut StructDef> {
        self.structs.iter_mut().find(|s| s.name == name)
    }

    pub fn find_predicate(&self, name: &str) -> Option<&Predicate> {
        self.predicates.iter().find(|p| p.name == name)
    }

    /// Number of fields a struct carries (used for permission sizing).
    pub fn struct_field_count(&self, name: &str) -> Option<usize> {
        self.find_struct(name).map(|s| s.fields.len())
    }

    /// Mint an id for a woven-in operation.
    pub fn fresh_op_id(&mut self) -> OpId {
        let id = OpId(self.next_op_id);
        self.next_op_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precise_part_of_imprecise_spec() {
        let spec = Expression::Imprecise(Some(Box::new(Expression::BoolLit(true))));
        assert!(spec.is_imprecise());
        assert_eq!(spec.precise_part(), Some(&Expression::BoolLit(true)));

        let bare = Expression::Imprecise(None);
        assert!(bare.is_imprecise());
        assert_eq!(bare.precise_part(), None);
    }

    #[test]
    fn precise_spec_is_its_own_precise_part() {
        let spec = Expression::BoolLit(true);
        assert!(!spec.is_imprecise());
        assert_eq!(spec.precise_part(), Some(&spec));
    }

    #[test]
    fn ensure_field_is_idempotent() {
        let mut s = StructDef {
            name: "node".to_string(),
            fields: vec![Var {
                name: "next".to_string(),
                ty: Type::Struct("node".to_string()),
            }],
        };
        assert_eq!(s.ensure_field("_id", Type::Int), 1);
        assert_eq!(s.ensure_field("_id", Type::Int), 1);
        assert_eq!(s.fields.len(), 2);
    }

    #[test]
    fn fresh_op_ids_are_dense() {
        let mut p = Program {
            next_op_id: 7,
            ..Program::default()
        };
        assert_eq!(p.fresh_op_id(), OpId(7));
        assert_eq!(p.fresh_op_id(), OpId(8));
    }
}
