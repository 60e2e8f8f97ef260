//! Workflow DAG engine.
//!
//! A workflow document is validated into typed steps ([`validate`]), ordered
//! by its dependency graph ([`graph`]), and executed by [`WorkflowEngine`],
//! which resolves `{{...}}` templates ([`template`]) and `condition`
//! expressions ([`condition`]) against earlier step results.

pub mod condition;
pub mod engine;
pub mod graph;
pub mod model;
pub mod run;
pub mod store;
pub mod template;
pub mod validate;

pub use engine::{SkillRunner, WorkflowEngine};
pub use model::{OnError, Step, StepDoc, StepKind, Workflow, WorkflowDoc};
pub use run::{RunMode, RunStatus, StepRunResult, StepStatus, WorkflowRun};
pub use store::{FileWorkflowStore, WorkflowError, WorkflowStore};
pub use validate::{ValidationErrors, is_valid_name, validate};
