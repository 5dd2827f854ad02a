//! DAG Engine: validation, naming-convention checks, and patch application
//! over a compiled `PlanDag`.

pub mod conventions;
pub mod patch;
pub mod validate;

pub use conventions::{validate_conventions, ConventionOptions, ConventionViolation};
pub use patch::{apply_patch, PatchError, PatchOp};
pub use validate::{validate_dag, DagError};
