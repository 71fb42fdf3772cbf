use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// SupervisorStage
// ---------------------------------------------------------------------------

/// Where one supervisor invocation currently sits. The audit-reject-then-
/// rewrite structure is a bounded loop over these stages, never recursion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorStage {
    Writing,
    Auditing,
    Stamping,
    Done,
    Failed,
}

impl SupervisorStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorStage::Done | SupervisorStage::Failed)
    }
}

impl fmt::Display for SupervisorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SupervisorStage::Writing => "Writing",
            SupervisorStage::Auditing => "Auditing",
            SupervisorStage::Stamping => "Stamping",
            SupervisorStage::Done => "Done",
            SupervisorStage::Failed => "Failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// StageEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEvent {
    /// Writer produced a guard-clean output.
    Produced,
    /// Auditor approved; move on to the stamp.
    AuditApprove,
    /// Auditor wants a rewrite; back to writing.
    AuditRevise,
    /// Auditor rejected outright.
    AuditReject,
    /// Stamp recorded (its verdict is advisory).
    Stamped,
    /// Unrecoverable failure at the current stage.
    Fail,
    /// Pipeline cancellation observed between stages.
    Cancel,
}

impl fmt::Display for StageEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StageEvent::Produced => "Produced",
            StageEvent::AuditApprove => "AuditApprove",
            StageEvent::AuditRevise => "AuditRevise",
            StageEvent::AuditReject => "AuditReject",
            StageEvent::Stamped => "Stamped",
            StageEvent::Fail => "Fail",
            StageEvent::Cancel => "Cancel",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StageMachineError {
    /// An event was applied in a stage where it has no meaning.
    #[error("invalid transition: cannot apply {event} in stage {stage}")]
    InvalidTransition {
        stage: SupervisorStage,
        event: StageEvent,
    },
}

// ---------------------------------------------------------------------------
// StageMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StageMachine {
    current: SupervisorStage,
    history: Vec<(SupervisorStage, StageEvent, SupervisorStage)>,
}

impl StageMachine {
    /// Every invocation starts at `Writing`.
    pub fn new() -> Self {
        Self {
            current: SupervisorStage::Writing,
            history: Vec::new(),
        }
    }

    pub fn stage(&self) -> SupervisorStage {
        self.current
    }

    pub fn history(&self) -> &[(SupervisorStage, StageEvent, SupervisorStage)] {
        &self.history
    }

    /// Attempt a stage transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Writing  + Produced     -> Auditing
    /// - Writing  + Fail         -> Failed
    /// - Auditing + AuditApprove -> Stamping
    /// - Auditing + AuditRevise  -> Writing
    /// - Auditing + AuditReject  -> Failed
    /// - Auditing + Fail         -> Failed
    /// - Stamping + Stamped      -> Done
    /// - Stamping + Fail         -> Failed
    /// - any non-terminal + Cancel -> Failed
    pub fn transition(&mut self, event: StageEvent) -> Result<SupervisorStage, StageMachineError> {
        let next = match (self.current, event) {
            (SupervisorStage::Writing, StageEvent::Produced) => SupervisorStage::Auditing,
            (SupervisorStage::Writing, StageEvent::Fail) => SupervisorStage::Failed,
            (SupervisorStage::Auditing, StageEvent::AuditApprove) => SupervisorStage::Stamping,
            (SupervisorStage::Auditing, StageEvent::AuditRevise) => SupervisorStage::Writing,
            (SupervisorStage::Auditing, StageEvent::AuditReject) => SupervisorStage::Failed,
            (SupervisorStage::Auditing, StageEvent::Fail) => SupervisorStage::Failed,
            (SupervisorStage::Stamping, StageEvent::Stamped) => SupervisorStage::Done,
            (SupervisorStage::Stamping, StageEvent::Fail) => SupervisorStage::Failed,
            (stage, StageEvent::Cancel) if !stage.is_terminal() => SupervisorStage::Failed,
            _ => {
                return Err(StageMachineError::InvalidTransition {
                    stage: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "supervisor stage transition");
        Ok(next)
    }

    /// Number of rewrite loops taken so far (Auditing → Writing edges).
    pub fn rewrite_count(&self) -> u32 {
        self.history
            .iter()
            .filter(|(_, event, _)| *event == StageEvent::AuditRevise)
            .count() as u32
    }
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
