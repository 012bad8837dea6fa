//! Input well-formedness checks.
//!
//! The weaver addresses heap locations by `(struct, field index)` pairs,
//! so a program with dangling names would weave into silently wrong
//! permission code. This pass rejects such programs up front: duplicate
//! definitions, calls to unknown methods, allocations of unknown structs
//! and member accesses that resolve to no field. It runs before
//! collection and touches nothing.

use crate::error::{Result, WeaverError};
use crate::runtime;
use gv_ir::program::{Expression, Method, Op, OpKind, Program};
use std::collections::HashSet;

pub fn validate_program(program: &Program) -> Result<()> {
    let mut seen = HashSet::new();
    for s in &program.structs {
        if !seen.insert(&s.name) {
            return Err(WeaverError::invalid_spec(format!(
                "duplicate struct '{}'",
                s.name
            )));
        }
        let mut fields = HashSet::new();
        for f in &s.fields {
            if !fields.insert(&f.name) {
                return Err(WeaverError::invalid_spec(format!(
                    "duplicate field '{}.{}'",
                    s.name, f.name
                )));
            }
        }
    }

    let mut seen = HashSet::new();
    for m in &program.methods {
        if !seen.insert(&m.name) {
            return Err(WeaverError::invalid_spec(format!(
                "duplicate method '{}'",
                m.name
            )));
        }
    }
    let mut seen = HashSet::new();
    for p in &program.predicates {
        if !seen.insert(&p.name) {
            return Err(WeaverError::invalid_spec(format!(
                "duplicate predicate '{}'",
                p.name
            )));
        }
    }

    for m in &program.methods {
        validate_method(program, m)?;
    }
    for p in &program.predicates {
        validate_expr(program, &p.body)?;
    }
    Ok(())
}

fn validate_method(program: &Program, method: &Method) -> Result<()> {
    if let Some(pre) = &method.precondition {
        validate_expr(program, pre)?;
    }
    if let Some(post) = &method.postcondition {
        validate_expr(program, post)?;
    }
    validate_ops(program, &method.body.0)
}

fn validate_ops(program: &Program, ops: &[Op]) -> Result<()> {
    for op in ops {
        validate_op(program, op)?;
    }
    Ok(())
}

fn validate_op(program: &Program, op: &Op) -> Result<()> {
    match &op.kind {
        OpKind::If {
            cond,
            then_branch,
            else_branch,
        } => {
            validate_expr(program, cond)?;
            validate_ops(program, &then_branch.0)?;
            validate_ops(program, &else_branch.0)
        }
        OpKind::While {
            cond,
            invariant,
            body,
        } => {
            validate_expr(program, cond)?;
            if let Some(inv) = invariant {
                validate_expr(program, inv)?;
            }
            validate_ops(program, &body.0)
        }
        OpKind::Invoke { callee, args, .. } => {
            if program.find_method(callee).is_none()
                && !runtime::RUNTIME_METHODS.contains(&callee.as_str())
            {
                return Err(WeaverError::invalid_spec(format!(
                    "call to unknown method '{}' at {}",
                    callee, op.id
                )));
            }
            for arg in args {
                validate_expr(program, arg)?;
            }
            Ok(())
        }
        OpKind::AllocStruct { struct_name, .. } => {
            if program.find_struct(struct_name).is_none() {
                return Err(WeaverError::invalid_spec(format!(
                    "allocation of unknown struct '{}' at {}",
                    struct_name, op.id
                )));
            }
            Ok(())
        }
        OpKind::AllocValue { .. } => Ok(()),
        OpKind::Assign { value, .. } => validate_expr(program, value),
        OpKind::AssignMember {
            root,
            struct_name,
            field,
            value,
        } => {
            check_field(program, struct_name, field)?;
            validate_expr(program, root)?;
            validate_expr(program, value)
        }
        OpKind::AssignDeref { pointer, value } => {
            validate_expr(program, pointer)?;
            validate_expr(program, value)
        }
        OpKind::Fold { predicate, args } | OpKind::Unfold { predicate, args } => {
            if program.find_predicate(predicate).is_none() {
                return Err(WeaverError::invalid_spec(format!(
                    "fold of unknown predicate '{}' at {}",
                    predicate, op.id
                )));
            }
            for arg in args {
                validate_expr(program, arg)?;
            }
            Ok(())
        }
        OpKind::Assert { value, .. } | OpKind::Error { value } => validate_expr(program, value),
        OpKind::Return { value } => match value {
            Some(v) => validate_expr(program, v),
            None => Ok(()),
        },
    }
}

fn check_field(program: &Program, struct_name: &str, field: &str) -> Result<()> {
    let s = program.find_struct(struct_name).ok_or_else(|| {
        WeaverError::invalid_spec(format!("member access on unknown struct '{}'", struct_name))
    })?;
    if s.field_index(field).is_none() {
        return Err(WeaverError::invalid_spec(format!(
            "unknown field '{}.{}'",
            struct_name, field
        )));
    }
    Ok(())
}

fn validate_expr(program: &Program, expr: &Expression) -> Result<()> {
    match expr {
        Expression::Binary { left, right, .. } => {
            validate_expr(program, left)?;
            validate_expr(program, right)
        }
        Expression::Unary { operand, .. } => validate_expr(program, operand),
        Expression::Cond {
            cond,
            then,
            otherwise,
        } => {
            validate_expr(program, cond)?;
            validate_expr(program, then)?;
            validate_expr(program, otherwise)
        }
        Expression::Member {
            root,
            struct_name,
            field,
        } => {
            check_field(program, struct_name, field)?;
            validate_expr(program, root)
        }
        Expression::Deref(operand) => validate_expr(program, operand),
        Expression::Accessibility(inner) => validate_expr(program, inner),
        Expression::PredicateInstance { name, args } => {
            if program.find_predicate(name).is_none() {
                return Err(WeaverError::invalid_spec(format!(
                    "instance of unknown predicate '{}'",
                    name
                )));
            }
            for arg in args {
                validate_expr(program, arg)?;
            }
            Ok(())
        }
        Expression::Imprecise(inner) => match inner {
            Some(e) => validate_expr(program, e),
            None => Ok(()),
        },
        Expression::IntLit(_)
        | Expression::CharLit(_)
        | Expression::BoolLit(_)
        | Expression::StringLit(_)
        | Expression::Null
        | Expression::Var(_)
        | Expression::Result => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gv_ir::program::{Block, OpId, StructDef, Type, Var};

    fn empty_method(name: &str, body: Vec<Op>) -> Method {
        Method {
            name: name.to_string(),
            params: vec![],
            return_type: None,
            precondition: None,
            postcondition: None,
            locals: vec![],
            body: Block(body),
        }
    }

    #[test]
    fn duplicate_method_names_are_rejected() {
        let program = Program {
            methods: vec![empty_method("f", vec![]), empty_method("f", vec![])],
            ..Program::default()
        };
        assert!(validate_program(&program).is_err());
    }

    #[test]
    fn unknown_callee_is_rejected() {
        let program = Program {
            methods: vec![empty_method(
                "main",
                vec![Op {
                    id: OpId(0),
                    kind: OpKind::Invoke {
                        callee: "ghost".to_string(),
                        args: vec![],
                        target: None,
                    },
                }],
            )],
            ..Program::default()
        };
        assert!(validate_program(&program).is_err());
    }

    #[test]
    fn unknown_member_field_is_rejected() {
        let program = Program {
            structs: vec![StructDef {
                name: "cell".to_string(),
                fields: vec![Var {
                    name: "val".to_string(),
                    ty: Type::Int,
                }],
            }],
            methods: vec![empty_method(
                "main",
                vec![Op {
                    id: OpId(0),
                    kind: OpKind::AssignMember {
                        root: Expression::Var("c".to_string()),
                        struct_name: "cell".to_string(),
                        field: "missing".to_string(),
                        value: Expression::IntLit(0),
                    },
                }],
            )],
            ..Program::default()
        };
        assert!(validate_program(&program).is_err());
    }

    #[test]
    fn well_formed_program_passes() {
        let program = Program {
            structs: vec![StructDef {
                name: "cell".to_string(),
                fields: vec![Var {
                    name: "val".to_string(),
                    ty: Type::Int,
                }],
            }],
            methods: vec![empty_method(
                "main",
                vec![Op {
                    id: OpId(0),
                    kind: OpKind::Return {
                        value: Some(Expression::IntLit(0)),
                    },
                }],
            )],
            ..Program::default()
        };
        assert!(validate_program(&program).is_ok());
    }
}
