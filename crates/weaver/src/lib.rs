//! Gradual-verification weaver.
//!
//! The static verifier discharges what it can; everything else comes back
//! as a table of residual checks - assertions that must hold at run time,
//! each tagged with the branch conditions under which execution reaches
//! it. This crate rewrites the program so those obligations are enforced:
//!
//! 1. the **collector** maps every residual check to an insertion point,
//!    interns the branch conditions into shared terms, derives separation
//!    checks from the governing specifications, and classifies each
//!    method's calling convention;
//! 2. the **injector** lowers that into IR: guarded condition
//!    temporaries, runtime check calls, and - where imprecision demands
//!    dynamic ownership tracking - two permission objects threaded
//!    through calls, allocations, returns and loop boundaries.
//!
//! The weaver is a pure, single-threaded pass: the IR is owned for the
//! duration, the collector reads, the injector mutates, nothing is
//! persisted. It never weakens or drops an obligation - any input it
//! cannot faithfully weave is a fatal [`WeaverError`].
//!
//! # Example
//!
//! ```rust,ignore
//! use gv_weaver::{WeaverConfig, weave};
//!
//! let mut program = front_end_output();
//! let (vir, table) = verifier_output();
//! weave(&mut program, &vir, &table, &WeaverConfig::new())?;
//! // `program` now carries its runtime checks
//! ```

pub mod check;
pub mod collector;
pub mod config;
pub mod error;
pub mod expr;
pub mod injector;
pub mod logic;
pub mod runtime;
pub mod validate;

pub use check::{CallStyle, Check, Location, RuntimeCheck};
pub use collector::{CollectedMethod, CollectedProgram, collect_program};
pub use config::WeaverConfig;
pub use error::{Result, WeaverError};
pub use expr::CheckExpression;
pub use injector::inject_program;
pub use validate::validate_program;

use gv_ir::program::Program;
use gv_ir::vir::{ResidualTable, VirProgram};
use tracing::debug;

/// Run the whole pass: validate, collect, inject.
pub fn weave(
    program: &mut Program,
    vir: &VirProgram,
    table: &ResidualTable,
    config: &WeaverConfig,
) -> Result<()> {
    validate_program(program)?;
    let collected = collect_program(program, vir, table)?;
    debug!(
        methods = collected.methods.len(),
        tracked = collected.requires_tracking(),
        "collection finished"
    );
    inject_program(program, &collected, config)
}
