use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use fm_contract::outputs::{AgentOutput, TaskSpec, Verdict};
use fm_core::config::SupervisorConfig;
use fm_core::types::{
    EventDraft, EventType, Job, Mode, Pipeline, PipelineState, Priority, Role,
};
use fm_log::EventLog;
use fm_telemetry::counters::RuntimeCounters;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::decision::{Decision, DecisionMachine, PipelineAction};
use crate::supervisor::CancelFlag;

// ---------------------------------------------------------------------------
// Seeds and results
// ---------------------------------------------------------------------------

/// A successor job the orchestrator wants enqueued. The queue assigns the
/// id and enforces slot uniqueness on `(pipeline_id, role, mode, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSeed {
    pub pipeline_id: Uuid,
    pub parent_job_id: Uuid,
    pub role: Role,
    pub mode: Mode,
    pub payload: String,
    pub context: Option<String>,
    pub priority: Priority,
    pub sequence: u32,
}

/// What a worker pushes back for a succeeded job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub output: AgentOutput,
    /// Final auditor verdict from the dual-engine loop, when one ran.
    #[serde(default)]
    pub audit_verdict: Option<Verdict>,
    /// Binding stamp flag; forces escalation regardless of verdicts.
    #[serde(default)]
    pub requires_escalation: bool,
    /// Auditor notes carried into rework payloads.
    #[serde(default)]
    pub notes: Option<String>,
}

/// The orchestrator's answer to one push.
#[derive(Debug, Clone)]
pub struct Routing {
    pub seeds: Vec<JobSeed>,
    pub pipeline_state: PipelineState,
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

/// Realizes the decision graph over concrete jobs.
///
/// Owns the pipeline table and per-pipeline cancellation flags. Pure
/// routing: it never enqueues anything itself, it hands [`JobSeed`]s back
/// to the queue layer, which enforces successor dedup via slot uniqueness.
pub struct PipelineOrchestrator {
    pipelines: Mutex<HashMap<Uuid, Pipeline>>,
    cancel_flags: Mutex<HashMap<Uuid, CancelFlag>>,
    machine: DecisionMachine,
    log: Arc<EventLog>,
    counters: Arc<RuntimeCounters>,
    config: SupervisorConfig,
}

impl PipelineOrchestrator {
    pub fn new(log: Arc<EventLog>, counters: Arc<RuntimeCounters>, config: SupervisorConfig) -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            machine: DecisionMachine::new(),
            log,
            counters,
            config,
        }
    }

    // -- pipeline lifecycle --------------------------------------------------

    /// Start a pipeline for a fresh user request and return it. The first
    /// job (a PM worker) is seeded by the caller.
    pub fn create_pipeline(&self, root_request: &str, session_id: &str) -> Pipeline {
        let mut pipeline = Pipeline::new(root_request, session_id);
        pipeline.deadline = Some(
            Utc::now() + chrono::Duration::seconds(self.config.pipeline_deadline_secs as i64),
        );
        self.cancel_flags
            .lock()
            .expect("cancel flags lock poisoned")
            .insert(pipeline.id, CancelFlag::new());
        self.pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .insert(pipeline.id, pipeline.clone());
        info!(pipeline_id = %pipeline.id, "pipeline created");
        pipeline
    }

    pub fn pipeline(&self, id: Uuid) -> Option<Pipeline> {
        self.pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .get(&id)
            .cloned()
    }

    /// The cancellation flag workers poll between supervisor stages.
    pub fn cancel_flag(&self, pipeline_id: Uuid) -> CancelFlag {
        self.cancel_flags
            .lock()
            .expect("cancel flags lock poisoned")
            .entry(pipeline_id)
            .or_default()
            .clone()
    }

    /// Flip the cancellation flag and mark the pipeline cancelled. Leases
    /// are not revoked; workers observe the flag at their next stage.
    pub fn cancel(&self, pipeline_id: Uuid) {
        self.cancel_flag(pipeline_id).cancel();
        self.set_state(pipeline_id, PipelineState::Cancelled, "cancel requested");
        if let Some(p) = self
            .pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .get_mut(&pipeline_id)
        {
            p.cancel_requested = true;
        }
    }

    /// Escalate every running pipeline whose wall clock expired. Returns
    /// the escalated ids.
    pub fn expire_deadlines(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let expired: Vec<Uuid> = {
            let pipelines = self.pipelines.lock().expect("pipelines lock poisoned");
            pipelines
                .values()
                .filter(|p| {
                    p.state == PipelineState::Running
                        && p.deadline.map(|d| d < now).unwrap_or(false)
                })
                .map(|p| p.id)
                .collect()
        };
        for id in &expired {
            self.escalate(*id, "pipeline wall clock expired");
        }
        expired
    }

    /// Mark a pipeline escalated and stop scheduling for it. Used directly
    /// by the queue when a job exhausts its attempts.
    pub fn escalate(&self, pipeline_id: Uuid, reason: &str) {
        self.counters.incr(fm_telemetry::counters::names::ESCALATIONS);
        self.set_state(pipeline_id, PipelineState::Escalated, reason);
        // Operator-facing marker event.
        let _ = self.log.append(
            EventDraft::new(pipeline_id, "pipeline", EventType::Error)
                .to_role("operator")
                .content(format!("ESCALATED: {reason}"))
                .metadata(json!({"reason": reason})),
        );
    }

    // -- push routing ---------------------------------------------------------

    /// Route a succeeded job to its successors.
    ///
    /// `parent` is the pushed job's own parent, used for RETRY re-enqueue.
    pub fn route_success(
        &self,
        job: &Job,
        parent: Option<&Job>,
        result: &WorkerResult,
    ) -> Routing {
        let state = self.state_of(job.pipeline_id);
        if state.is_terminal() || state == PipelineState::Escalated {
            // No further scheduling for closed pipelines.
            return Routing {
                seeds: Vec::new(),
                pipeline_state: state,
            };
        }

        // A binding stamp flag trumps every verdict.
        if result.requires_escalation {
            self.escalate(job.pipeline_id, "stamp flagged requires_escalation");
            return Routing {
                seeds: Vec::new(),
                pipeline_state: PipelineState::Escalated,
            };
        }

        match (&result.output, job.role) {
            (AgentOutput::Pm(pm), Role::Pm) => {
                let decision = self.machine.process(pm);
                self.append_decision(job, &decision);
                self.apply_pm_decision(job, parent, decision)
            }
            (AgentOutput::Qa(qa), Role::Qa) => match qa.verdict {
                fm_contract::TestVerdict::Pass => self.forward(job, Role::Reviewer, None),
                fm_contract::TestVerdict::Skip => {
                    self.forward(job, Role::Reviewer, Some("QA skipped: no runnable tests"))
                }
                fm_contract::TestVerdict::Fail => {
                    let failing = serde_json::to_string(&qa.issues).unwrap_or_default();
                    self.rework(job, Role::Coder, &format!("failing tests: {failing}"))
                }
            },
            (AgentOutput::Reviewer(review), Role::Reviewer) => match review.verdict {
                Verdict::Approve => {
                    self.set_state(job.pipeline_id, PipelineState::Done, "reviewer approved");
                    Routing {
                        seeds: Vec::new(),
                        pipeline_state: PipelineState::Done,
                    }
                }
                Verdict::Revise => {
                    let notes = result.notes.clone().unwrap_or_else(|| "see review".into());
                    self.rework(job, Role::Coder, &notes)
                }
                Verdict::Reject => self.block_to_pm(job, "reviewer rejected the change"),
            },
            (_, Role::Coder) => match result.audit_verdict.unwrap_or(Verdict::Approve) {
                Verdict::Approve => self.forward(job, Role::Qa, None),
                Verdict::Revise => {
                    let notes = result.notes.clone().unwrap_or_else(|| "see audit".into());
                    self.rework(job, Role::Coder, &notes)
                }
                Verdict::Reject => self.block_to_pm(job, "audit rejected the coder output"),
            },
            // Support roles report back to the PM, which decides what's next.
            (output, _) => {
                let summary = serde_json::to_string(output).unwrap_or_default();
                self.forward_to_pm(job, &format!("## {} result\n{summary}", job.role))
            }
        }
    }

    /// Route a failed job: a BLOCKED event plus a PM job carrying the
    /// reason, or escalation when the PM itself is the casualty.
    pub fn route_failure(&self, job: &Job, reason: &str) -> Routing {
        let state = self.state_of(job.pipeline_id);
        if state.is_terminal() || state == PipelineState::Escalated {
            return Routing {
                seeds: Vec::new(),
                pipeline_state: state,
            };
        }

        if job.role == Role::Pm {
            self.escalate(job.pipeline_id, &format!("pm failed: {reason}"));
            return Routing {
                seeds: Vec::new(),
                pipeline_state: PipelineState::Escalated,
            };
        }

        self.set_state(job.pipeline_id, PipelineState::Blocked, reason);
        self.block_to_pm(job, reason)
    }

    // -- internals ------------------------------------------------------------

    fn apply_pm_decision(&self, job: &Job, parent: Option<&Job>, decision: Decision) -> Routing {
        match decision.action {
            PipelineAction::Dispatch => {
                self.set_state(job.pipeline_id, PipelineState::Running, "pm dispatched");
                let seeds = decision
                    .tasks
                    .iter()
                    .map(|task| self.seed_from_task(job, task))
                    .collect();
                Routing {
                    seeds,
                    pipeline_state: PipelineState::Running,
                }
            }
            PipelineAction::Retry => {
                let Some(parent) = parent else {
                    // Nothing to retry against; treat as blocked.
                    self.set_state(job.pipeline_id, PipelineState::Blocked, "retry without parent");
                    return Routing {
                        seeds: Vec::new(),
                        pipeline_state: PipelineState::Blocked,
                    };
                };
                if self.try_record_rework(job.pipeline_id, parent.role).is_none() {
                    warn!(
                        pipeline_id = %job.pipeline_id,
                        role = %parent.role,
                        "rework cap exceeded, forcing BLOCKED"
                    );
                    self.set_state(job.pipeline_id, PipelineState::Blocked, "rework cap exceeded");
                    return Routing {
                        seeds: Vec::new(),
                        pipeline_state: PipelineState::Blocked,
                    };
                }
                let seed = JobSeed {
                    pipeline_id: job.pipeline_id,
                    parent_job_id: job.id,
                    role: parent.role,
                    mode: parent.mode,
                    payload: format!("{}\n\n[RETRY]\n{}", parent.payload, decision.summary),
                    context: parent.context.clone(),
                    priority: parent.priority,
                    sequence: parent.sequence + 1,
                };
                Routing {
                    seeds: vec![seed],
                    pipeline_state: PipelineState::Running,
                }
            }
            PipelineAction::Blocked => {
                self.set_state(job.pipeline_id, PipelineState::Blocked, &decision.summary);
                Routing {
                    seeds: Vec::new(),
                    pipeline_state: PipelineState::Blocked,
                }
            }
            PipelineAction::Escalate => {
                self.escalate(
                    job.pipeline_id,
                    &format!("pm escalated ({:?}): {}", decision.reason, decision.summary),
                );
                Routing {
                    seeds: Vec::new(),
                    pipeline_state: PipelineState::Escalated,
                }
            }
            PipelineAction::Done => {
                self.set_state(job.pipeline_id, PipelineState::Done, &decision.summary);
                Routing {
                    seeds: Vec::new(),
                    pipeline_state: PipelineState::Done,
                }
            }
        }
    }

    fn seed_from_task(&self, pm_job: &Job, task: &TaskSpec) -> JobSeed {
        let payload = match &task.context {
            Some(ctx) => format!("{}\n\n## Context\n{}", task.instruction, ctx),
            None => task.instruction.clone(),
        };
        JobSeed {
            pipeline_id: pm_job.pipeline_id,
            parent_job_id: pm_job.id,
            role: task.agent,
            mode: Mode::Worker,
            payload,
            context: None,
            priority: task.priority,
            sequence: pm_job.sequence,
        }
    }

    /// Successor in a different role; sequence inherits the parent's so a
    /// duplicate push lands on the same slot.
    fn forward(&self, job: &Job, next_role: Role, note: Option<&str>) -> Routing {
        let mut payload = job.payload.clone();
        if let Some(note) = note {
            payload = format!("{payload}\n\n[NOTE] {note}");
        }
        let seed = JobSeed {
            pipeline_id: job.pipeline_id,
            parent_job_id: job.id,
            role: next_role,
            mode: Mode::Worker,
            payload,
            context: job.context.clone(),
            priority: job.priority,
            sequence: job.sequence,
        };
        Routing {
            seeds: vec![seed],
            pipeline_state: self.state_of(job.pipeline_id),
        }
    }

    /// Same-role rework; counts against the role's rework budget and bumps
    /// the sequence so the slot stays unique.
    fn rework(&self, job: &Job, role: Role, notes: &str) -> Routing {
        if self.try_record_rework(job.pipeline_id, role).is_none() {
            warn!(
                pipeline_id = %job.pipeline_id,
                role = %role,
                "rework cap exceeded, forcing BLOCKED"
            );
            self.set_state(job.pipeline_id, PipelineState::Blocked, "rework cap exceeded");
            return self.block_to_pm(job, "rework cap exceeded");
        }
        let seed = JobSeed {
            pipeline_id: job.pipeline_id,
            parent_job_id: job.id,
            role,
            mode: Mode::Worker,
            payload: format!("{}\n\n[REVISION FEEDBACK]\n{}", job.payload, notes),
            context: job.context.clone(),
            priority: job.priority,
            sequence: job.sequence + 1,
        };
        Routing {
            seeds: vec![seed],
            pipeline_state: PipelineState::Running,
        }
    }

    /// A PM job carrying a block reason; the PM decides how to proceed.
    fn block_to_pm(&self, job: &Job, reason: &str) -> Routing {
        let seed = JobSeed {
            pipeline_id: job.pipeline_id,
            parent_job_id: job.id,
            role: Role::Pm,
            mode: Mode::Worker,
            payload: format!(
                "[BLOCKED] {} ({} / {})\n\nOriginal payload:\n{}",
                reason, job.role, job.mode, job.payload
            ),
            context: job.context.clone(),
            priority: Priority::High,
            sequence: job.sequence + 1,
        };
        Routing {
            seeds: vec![seed],
            pipeline_state: self.state_of(job.pipeline_id),
        }
    }

    fn forward_to_pm(&self, job: &Job, payload: &str) -> Routing {
        let seed = JobSeed {
            pipeline_id: job.pipeline_id,
            parent_job_id: job.id,
            role: Role::Pm,
            mode: Mode::Worker,
            payload: payload.to_string(),
            context: job.context.clone(),
            priority: job.priority,
            sequence: job.sequence + 1,
        };
        Routing {
            seeds: vec![seed],
            pipeline_state: self.state_of(job.pipeline_id),
        }
    }

    /// Record one rework round unless the role already sits at the cap, so
    /// the stored count never exceeds `max_rework_rounds`.
    fn try_record_rework(&self, pipeline_id: Uuid, role: Role) -> Option<u32> {
        let mut pipelines = self.pipelines.lock().expect("pipelines lock poisoned");
        match pipelines.get_mut(&pipeline_id) {
            Some(p) => {
                if p.rework_rounds_for(role) >= self.config.max_rework_rounds {
                    None
                } else {
                    Some(p.record_rework(role))
                }
            }
            None => Some(0),
        }
    }

    fn state_of(&self, pipeline_id: Uuid) -> PipelineState {
        self.pipelines
            .lock()
            .expect("pipelines lock poisoned")
            .get(&pipeline_id)
            .map(|p| p.state)
            .unwrap_or(PipelineState::Running)
    }

    fn set_state(&self, pipeline_id: Uuid, target: PipelineState, reason: &str) {
        let mut pipelines = self.pipelines.lock().expect("pipelines lock poisoned");
        let Some(pipeline) = pipelines.get_mut(&pipeline_id) else {
            return;
        };
        if pipeline.state == target {
            return;
        }
        if !pipeline.state.can_transition_to(&target) {
            warn!(
                pipeline_id = %pipeline_id,
                from = ?pipeline.state,
                to = ?target,
                "refusing invalid pipeline state transition"
            );
            return;
        }
        pipeline.state = target;
        pipeline.updated_at = Utc::now();
        drop(pipelines);

        let _ = self.log.append(
            EventDraft::new(pipeline_id, "pipeline", EventType::State)
                .content(format!("{target:?}: {reason}"))
                .metadata(json!({"reason": reason})),
        );
    }

    fn append_decision(&self, job: &Job, decision: &Decision) {
        let _ = self.log.append(
            EventDraft::new(job.pipeline_id, "pm", EventType::Decision)
                .job(job.id)
                .to_role("pipeline")
                .content(decision.summary.clone())
                .metadata(json!({
                    "action": decision.action,
                    "reason": decision.reason,
                    "confidence": decision.confidence,
                    "tasks": decision.tasks.len(),
                })),
        );
    }
}
