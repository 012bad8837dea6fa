//! Permission-tracking runtime interface.
//!
//! The weaver commits to a fixed set of runtime operations with fixed
//! arities; everything the injector emits funnels through the builders in
//! this module so the contract lives in exactly one place. The concrete
//! data structure behind a permission object is the runtime's business -
//! the weaver only relies on the documented semantics: `add` is
//! idempotent, `assert` sees exactly the adds not revoked by `disjoin`,
//! `join(a, b)` is the union with `b` emptied, and `disjoin(a, b)` moves
//! exactly the permissions listed in `b` out of `a`.

use gv_ir::program::{Expression, Op, OpId, OpKind, Type};

/// Struct type of a permission object. External: the runtime defines its
/// layout, the weaver only allocates it and reads one field.
pub const OWNED_FIELDS_STRUCT: &str = "OwnedFields";

/// The one `OwnedFields` field the weaver references directly: the
/// embedded instance-counter pointer, used to hand the counter to precise
/// callees from imprecise code.
pub const INSTANCE_COUNTER_FIELD: &str = "instance_counter";

/// `init_fields(f, counter)` - initialise an empty permission object,
/// embedding the counter cell.
pub const INIT_FIELDS: &str = "init_fields";

/// `add_field_access(f, obj_id, n_fields, field_index)` - record one
/// field permission. Idempotent.
pub const ADD_FIELD_ACCESS: &str = "add_field_access";

/// `add_struct_access(f, n_fields) -> int` - mint a fresh object id and
/// register all of the struct's fields.
pub const ADD_STRUCT_ACCESS: &str = "add_struct_access";

/// `assert_acc(f, obj_id, field_index)` - runtime accessibility check.
pub const ASSERT_ACC: &str = "assert_acc";

/// `assert_disjoint_acc(f1, f2, obj_id, field_index)` - separation check
/// across the static and dynamic permission objects.
pub const ASSERT_DISJOINT_ACC: &str = "assert_disjoint_acc";

/// `assert_pred_acc(f, name, args..)` - predicate accessibility; the
/// runtime unfolds the predicate body.
pub const ASSERT_PRED_ACC: &str = "assert_pred_acc";

/// `assert_disjoint_pred_acc(f1, f2, name, args..)` - predicate
/// separation; the runtime unfolds the predicate body.
pub const ASSERT_DISJOINT_PRED_ACC: &str = "assert_disjoint_pred_acc";

/// `join(dst, src)` - transfer all permissions from `src` into `dst`,
/// leaving `src` empty.
pub const JOIN: &str = "join";

/// `disjoin(dst, src)` - remove from `dst` exactly the permissions
/// listed in `src`.
pub const DISJOIN: &str = "disjoin";

/// The pointer type of a permission object.
pub fn owned_fields_type() -> Type {
    Type::Struct(OWNED_FIELDS_STRUCT.to_string())
}

fn call(id: OpId, callee: &str, args: Vec<Expression>, target: Option<String>) -> Op {
    Op {
        id,
        kind: OpKind::Invoke {
            callee: callee.to_string(),
            args,
            target,
        },
    }
}

pub fn init_fields(id: OpId, fields: Expression, counter: Expression) -> Op {
    call(id, INIT_FIELDS, vec![fields, counter], None)
}

pub fn add_field_access(
    id: OpId,
    fields: Expression,
    obj_id: Expression,
    n_fields: usize,
    field_index: usize,
) -> Op {
    call(
        id,
        ADD_FIELD_ACCESS,
        vec![
            fields,
            obj_id,
            Expression::IntLit(n_fields as i64),
            Expression::IntLit(field_index as i64),
        ],
        None,
    )
}

pub fn add_struct_access(id: OpId, fields: Expression, n_fields: usize, target: String) -> Op {
    call(
        id,
        ADD_STRUCT_ACCESS,
        vec![fields, Expression::IntLit(n_fields as i64)],
        Some(target),
    )
}

pub fn assert_acc(id: OpId, fields: Expression, obj_id: Expression, field_index: usize) -> Op {
    call(
        id,
        ASSERT_ACC,
        vec![fields, obj_id, Expression::IntLit(field_index as i64)],
        None,
    )
}

pub fn assert_disjoint_acc(
    id: OpId,
    static_fields: Expression,
    dynamic_fields: Expression,
    obj_id: Expression,
    field_index: usize,
) -> Op {
    call(
        id,
        ASSERT_DISJOINT_ACC,
        vec![
            static_fields,
            dynamic_fields,
            obj_id,
            Expression::IntLit(field_index as i64),
        ],
        None,
    )
}

pub fn assert_pred_acc(id: OpId, fields: Expression, name: &str, args: Vec<Expression>) -> Op {
    let mut all = vec![fields, Expression::StringLit(name.to_string())];
    all.extend(args);
    call(id, ASSERT_PRED_ACC, all, None)
}

pub fn assert_disjoint_pred_acc(
    id: OpId,
    static_fields: Expression,
    dynamic_fields: Expression,
    name: &str,
    args: Vec<Expression>,
) -> Op {
    let mut all = vec![
        static_fields,
        dynamic_fields,
        Expression::StringLit(name.to_string()),
    ];
    all.extend(args);
    call(id, ASSERT_DISJOINT_PRED_ACC, all, None)
}

pub fn join(id: OpId, dst: Expression, src: Expression) -> Op {
    call(id, JOIN, vec![dst, src], None)
}

pub fn disjoin(id: OpId, dst: Expression, src: Expression) -> Op {
    call(id, DISJOIN, vec![dst, src], None)
}

/// Names of all runtime entry points, for validation: calls to these are
/// runtime calls, not user-method calls.
pub const RUNTIME_METHODS: [&str; 9] = [
    INIT_FIELDS,
    ADD_FIELD_ACCESS,
    ADD_STRUCT_ACCESS,
    ASSERT_ACC,
    ASSERT_DISJOINT_ACC,
    ASSERT_PRED_ACC,
    ASSERT_DISJOINT_PRED_ACC,
    JOIN,
    DISJOIN,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_fix_the_arity() {
        let f = Expression::Var("_dyn_fields".to_string());
        let obj = Expression::Var("x".to_string());
        let op = assert_acc(OpId(0), f.clone(), obj.clone(), 2);
        match op.kind {
            OpKind::Invoke { callee, args, .. } => {
                assert_eq!(callee, ASSERT_ACC);
                assert_eq!(args.len(), 3);
                assert_eq!(args[2], Expression::IntLit(2));
            }
            other => panic!("expected invoke, got {:?}", other),
        }

        let op = add_field_access(OpId(1), f, obj, 3, 1);
        match op.kind {
            OpKind::Invoke { callee, args, .. } => {
                assert_eq!(callee, ADD_FIELD_ACCESS);
                assert_eq!(args.len(), 4);
            }
            other => panic!("expected invoke, got {:?}", other),
        }
    }
}
