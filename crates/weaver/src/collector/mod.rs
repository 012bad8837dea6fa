//! Residual-check collection.
//!
//! The collector walks the IR and the verifier output jointly and
//! produces, per method, everything the injector needs: the interned
//! condition terms, the runtime checks with their guards, enumerations of
//! the operations the calling convention touches, and the method's call
//! style. It never mutates the input IR.
//!
//! Collection runs in phases:
//!
//! - **A** - index verifier nodes against IR locations ([`index`]);
//! - **B/C** - place each residual check and intern its branch-condition
//!   stack ([`conditions`]);
//! - **D** - walk specifications at permission-bearing locations and emit
//!   separation checks ([`separation`]);
//! - **E** - simplify every guard, drop unreferenced terms, fix emission
//!   order;
//! - **F** - classify the calling convention;
//! - **G** - decide whether the body can fall off the end.

mod conditions;
mod index;
mod separation;

use crate::check::{CallStyle, ConditionTerm, Location, RuntimeCheck};
use crate::error::{Result, WeaverError};
use crate::logic::TermId;
use gv_ir::program::{Method, OpId, Program};
use gv_ir::vir::{ResidualTable, VirProgram};
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

pub(crate) use conditions::{CheckAccumulator, Interner};
pub(crate) use index::{SpecSets, block_falls_through, index_method};

/// Everything the injector needs to know about one method.
#[derive(Debug)]
pub struct CollectedMethod {
    pub name: String,
    pub call_style: CallStyle,
    /// Surviving condition terms, in id order
    pub conditions: Vec<ConditionTerm>,
    /// Runtime checks in (location, first-seen) order
    pub checks: Vec<RuntimeCheck>,
    pub returns: Vec<OpId>,
    pub invokes: Vec<OpId>,
    pub allocations: Vec<OpId>,
    pub has_implicit_return: bool,
    /// Locations whose governing specification was fully enumerated for
    /// separation checking
    pub full_walk_locations: BTreeSet<Location>,
}

impl CollectedMethod {
    /// True when any check needs dynamic ownership tracking.
    pub fn requires_tracking(&self) -> bool {
        self.checks.iter().any(|c| c.check.needs_tracking())
    }
}

#[derive(Debug)]
pub struct CollectedProgram {
    /// One entry per program method, in program order
    pub methods: Vec<CollectedMethod>,
}

impl CollectedProgram {
    /// True when any method in the program needs ownership tracking.
    pub fn requires_tracking(&self) -> bool {
        self.methods.iter().any(CollectedMethod::requires_tracking)
    }

    pub fn find(&self, name: &str) -> Option<&CollectedMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn style_of(&self, name: &str) -> Option<CallStyle> {
        self.find(name).map(|m| m.call_style)
    }
}

/// Collect the whole program. The residual table is global; each check is
/// attributed to the method whose trace its node appears on.
pub fn collect_program(
    program: &Program,
    vir: &VirProgram,
    table: &ResidualTable,
) -> Result<CollectedProgram> {
    let specs = SpecSets::build(vir);
    let methods = program
        .methods
        .iter()
        .map(|m| collect_method(program, m, vir, table, &specs))
        .collect::<Result<Vec<_>>>()?;
    Ok(CollectedProgram { methods })
}

fn classify(method: &Method) -> CallStyle {
    if method.name == "main" {
        CallStyle::Main
    } else if method.has_imprecise_pre() {
        CallStyle::Imprecise
    } else if method.has_imprecise_post() {
        CallStyle::PrecisePre
    } else {
        CallStyle::Precise
    }
}

fn collect_method(
    program: &Program,
    method: &Method,
    vir: &VirProgram,
    table: &ResidualTable,
    specs: &SpecSets,
) -> Result<CollectedMethod> {
    let vir_method = vir.find_method(&method.name).ok_or_else(|| {
        WeaverError::mismatch(&method.name, "method has no verifier image")
    })?;

    // Phase A
    let method_index = index_method(method, vir_method)?;

    let mut interner = Interner::new();
    let mut acc = CheckAccumulator::new();
    let mut walk_locations = BTreeSet::new();

    // Phases B/C, in trace order so term ids are deterministic
    let mut visited = HashSet::new();
    for &node in &method_index.trace {
        if !visited.insert(node) {
            continue;
        }
        for rc in table.checks_at(node) {
            let (placed, needs_tracking) =
                conditions::collect_check(&method.name, node, rc, &method_index, specs, &mut interner, &mut acc)?;
            let at_boundary = matches!(
                placed.location,
                Location::MethodPre | Location::MethodPost
            );
            if needs_tracking && (at_boundary || placed.positioned) {
                walk_locations.insert(placed.location);
            }
        }
    }

    // Phase D
    separation::emit_separation_checks(
        program,
        method,
        &method_index,
        &walk_locations,
        &mut interner,
        &mut acc,
    )?;

    // Phase E: simplify guards, then keep only terms some surviving
    // guard (transitively) references
    let mut checks: Vec<RuntimeCheck> = acc
        .into_ordered()
        .into_iter()
        .map(|(location, check, when)| {
            let when = when.simplify();
            RuntimeCheck {
                location,
                check,
                when: if when.is_true() { None } else { Some(when) },
            }
        })
        .collect();
    checks.sort_by_key(|c| c.location);

    let mut terms = interner.into_terms();
    for term in &mut terms {
        term.when = term.when.simplify();
    }
    let mut live: BTreeSet<TermId> = checks
        .iter()
        .filter_map(|c| c.when.as_ref())
        .flat_map(|w| w.referenced_terms())
        .collect();
    let mut work: Vec<TermId> = live.iter().copied().collect();
    while let Some(id) = work.pop() {
        for dep in terms[id as usize].when.referenced_terms() {
            if live.insert(dep) {
                work.push(dep);
            }
        }
    }
    let conditions: Vec<ConditionTerm> =
        terms.into_iter().filter(|t| live.contains(&t.id)).collect();

    // Phases F/G
    let call_style = classify(method);
    let has_implicit_return = block_falls_through(&method.body.0);

    debug!(
        method = %method.name,
        checks = checks.len(),
        terms = conditions.len(),
        walks = walk_locations.len(),
        ?call_style,
        "collected method"
    );

    Ok(CollectedMethod {
        name: method.name.clone(),
        call_style,
        conditions,
        checks,
        returns: method_index.returns,
        invokes: method_index.invokes,
        allocations: method_index.allocations,
        has_implicit_return,
        full_walk_locations: walk_locations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gv_ir::program::{Block, Expression, Type};

    fn method(name: &str, pre: Option<Expression>, post: Option<Expression>) -> Method {
        Method {
            name: name.to_string(),
            params: vec![],
            return_type: None,
            precondition: pre,
            postcondition: post,
            locals: vec![],
            body: Block::new(),
        }
    }

    #[test]
    fn call_style_classification() {
        let imprecise = Expression::Imprecise(None);
        let precise = Expression::BoolLit(true);

        assert_eq!(classify(&method("main", None, None)), CallStyle::Main);
        assert_eq!(
            classify(&method("f", Some(imprecise.clone()), None)),
            CallStyle::Imprecise
        );
        assert_eq!(
            classify(&method("f", Some(precise.clone()), Some(imprecise))),
            CallStyle::PrecisePre
        );
        assert_eq!(
            classify(&method("f", Some(precise.clone()), Some(precise))),
            CallStyle::Precise
        );
        assert_eq!(classify(&method("f", None, None)), CallStyle::Precise);
    }
}
