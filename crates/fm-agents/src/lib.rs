//! Agent-side engine: the escalation ladder, the dual-engine supervisor,
//! the PM decision machine, and the pipeline orchestrator.
//!
//! Everything here is pure coordination. Model calls go through
//! `fm-harness`, typed outputs come from `fm-contract`, and every exchange
//! lands in the `fm-log` stream.

pub mod decision;
pub mod escalator;
pub mod orchestrator;
pub mod personas;
pub mod stages;
pub mod supervisor;

pub use decision::{Decision, DecisionMachine, EscalationReason, PipelineAction};
pub use escalator::{EscalationLevel, FailureSignature, RetryAction, RetryEscalator};
pub use orchestrator::PipelineOrchestrator;
pub use supervisor::{DualEngineSupervisor, SupervisorOutcome};
