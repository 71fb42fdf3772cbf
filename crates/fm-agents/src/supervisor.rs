use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fm_contract::guard::SemanticGuard;
use fm_contract::outputs::{AgentOutput, ReviewerOutput, StampOutput, Verdict};
use fm_contract::parse_completion;
use fm_core::config::SupervisorConfig;
use fm_core::types::{EventDraft, EventType, Job, Role};
use fm_harness::backend::{BackendError, CallOptions};
use fm_harness::compactor::Compactor;
use fm_harness::{BackendRouter, Stage};
use fm_log::EventLog;
use fm_telemetry::counters::{names, RuntimeCounters};
use serde_json::json;
use tracing::{info, warn, Instrument};

use crate::escalator::{FailureSignature, RetryAction, RetryEscalator};
use crate::personas::PersonaRegistry;
use crate::stages::{StageEvent, StageMachine, SupervisorStage};

/// Hard ceiling on writer attempts within one invocation, across every
/// escalation path. The escalator normally terminates long before this.
const MAX_WRITER_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// CancelFlag
// ---------------------------------------------------------------------------

/// Per-pipeline cancellation flag. Cheap to clone and poll; the supervisor
/// checks it between stages, never mid-call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Outcome / error
// ---------------------------------------------------------------------------

/// What one supervised invocation produced.
#[derive(Debug, Clone)]
pub enum SupervisorOutcome {
    Completed(CompletedWork),
    /// Audit reject, rewrite budget exhausted, or escalator hard fail.
    Blocked { reason: String, event_id: u64 },
    Cancelled { event_id: u64 },
}

#[derive(Debug, Clone)]
pub struct CompletedWork {
    pub output: AgentOutput,
    pub audit: ReviewerOutput,
    pub stamp: Option<StampOutput>,
    pub rewrites: u32,
    pub degraded_parse: bool,
    pub role_switched: bool,
    /// The writer `response` event for the accepted output; successor
    /// events chain from here.
    pub response_event_id: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The event log refused an append; nothing is silently dropped.
    #[error("event log: {0}")]
    Log(#[from] fm_log::LogError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// DualEngineSupervisor
// ---------------------------------------------------------------------------

/// Runs a single role's work with a built-in auditor.
///
/// Per invocation: Write → Contract → Guard → Audit → Stamp, as an explicit
/// stage machine. Contract and guard failures climb the escalation ladder;
/// auditor REVISE loops back to Write at most `max_rewrites` times; the
/// stamp is advisory except for `requires_escalation`.
///
/// Reentrant: concurrent invocations for different jobs are independent. A
/// single job gets a single writer attempt at a time by construction (the
/// queue's lease exclusion).
pub struct DualEngineSupervisor {
    router: Arc<BackendRouter>,
    personas: Arc<PersonaRegistry>,
    guard: SemanticGuard,
    escalator: Arc<RetryEscalator>,
    log: Arc<EventLog>,
    compactor: Arc<dyn Compactor>,
    counters: Arc<RuntimeCounters>,
    config: SupervisorConfig,
}

impl DualEngineSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<BackendRouter>,
        personas: Arc<PersonaRegistry>,
        escalator: Arc<RetryEscalator>,
        log: Arc<EventLog>,
        compactor: Arc<dyn Compactor>,
        counters: Arc<RuntimeCounters>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            router,
            personas,
            guard: SemanticGuard::new(),
            escalator,
            log,
            compactor,
            counters,
            config,
        }
    }

    fn call_options(&self) -> CallOptions {
        CallOptions {
            timeout: Duration::from_secs(self.config.backend_timeout_secs),
            ..Default::default()
        }
    }

    /// Execute one job under full supervision.
    ///
    /// `parent_event_id` is the job's `request` event so the response chain
    /// stays connected across roles.
    pub async fn run(
        &self,
        job: &Job,
        cancel: &CancelFlag,
        parent_event_id: Option<u64>,
    ) -> Result<SupervisorOutcome> {
        let span = fm_telemetry::tracing_setup::job_span(job.pipeline_id, job.id, job.role.as_str());
        self.run_inner(job, cancel, parent_event_id)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        job: &Job,
        cancel: &CancelFlag,
        parent_event_id: Option<u64>,
    ) -> Result<SupervisorOutcome> {
        let writer_bundle = self.personas.get(job.role, Stage::Writer);
        let auditor_bundle = self.personas.get(job.role, Stage::Auditor);
        let stamp_bundle = self.personas.get(job.role, Stage::Stamp);

        let base_payload = match &job.context {
            Some(ctx) => format!("{}\n\n## Context\n{}", job.payload, ctx),
            None => job.payload.clone(),
        };

        let mut machine = StageMachine::new();
        let mut payload = base_payload.clone();
        let mut persona_text = writer_bundle.text.clone();
        let mut role_switched = false;
        let mut compacted = false;
        let mut writer_attempts = 0u32;
        let mut last_event = parent_event_id;

        let mut accepted: Option<(AgentOutput, bool, u64)> = None;
        let mut audit: Option<ReviewerOutput> = None;
        let mut stamp: Option<StampOutput> = None;

        while !machine.stage().is_terminal() {
            if cancel.is_cancelled() {
                let event_id = self.append_state(job, last_event, "cancelled", json!({}))?;
                let _ = machine.transition(StageEvent::Cancel);
                info!(job_id = %job.id, "job cancelled between stages");
                return Ok(SupervisorOutcome::Cancelled { event_id });
            }

            match machine.stage() {
                SupervisorStage::Writing => {
                    writer_attempts += 1;
                    if writer_attempts > MAX_WRITER_ATTEMPTS {
                        let event_id = self.append_error(
                            job,
                            last_event,
                            "writer attempt ceiling reached",
                            json!({"attempts": writer_attempts}),
                        )?;
                        let _ = machine.transition(StageEvent::Fail);
                        return Ok(SupervisorOutcome::Blocked {
                            reason: "writer attempt ceiling reached".into(),
                            event_id,
                        });
                    }

                    self.counters.incr(names::BACKEND_CALLS);
                    let call = self
                        .router
                        .call(job.role, Stage::Writer, &persona_text, &payload, &self.call_options())
                        .await;

                    let response = match call {
                        Ok(response) => response,
                        Err(BackendError::ContextOverflow) if !compacted => {
                            // Recoverable: compact once and retry.
                            compacted = true;
                            match self.compactor.compact(&payload).await {
                                Ok(smaller) => {
                                    payload = smaller;
                                    continue;
                                }
                                Err(e) => {
                                    let event_id = self.append_error(
                                        job,
                                        last_event,
                                        &format!("compactor failed: {e}"),
                                        json!({}),
                                    )?;
                                    let _ = machine.transition(StageEvent::Fail);
                                    return Ok(SupervisorOutcome::Blocked {
                                        reason: "context overflow and compaction failed".into(),
                                        event_id,
                                    });
                                }
                            }
                        }
                        Err(e) => {
                            if matches!(e, BackendError::Timeout) {
                                self.counters.incr(names::BACKEND_TIMEOUTS);
                            }
                            let signature = FailureSignature::new(
                                e.error_kind(),
                                vec![],
                                job.role,
                                &base_payload,
                            );
                            match self.consult_escalator(job, signature, &base_payload, &e.to_string())
                            {
                                EscalationOutcome::Retry(next_payload) => {
                                    payload = next_payload;
                                    continue;
                                }
                                EscalationOutcome::Switch(next_payload, new_profile) => {
                                    role_switched = true;
                                    persona_text =
                                        self.personas.get(new_profile, Stage::Writer).text.clone();
                                    payload = next_payload;
                                    continue;
                                }
                                EscalationOutcome::Abort(reason) => {
                                    let event_id = self.append_error(
                                        job,
                                        last_event,
                                        &reason,
                                        json!({"error_kind": e.error_kind()}),
                                    )?;
                                    let _ = machine.transition(StageEvent::Fail);
                                    return Ok(SupervisorOutcome::Blocked { reason, event_id });
                                }
                            }
                        }
                    };

                    let event_id = self.log.append(
                        EventDraft::new(job.pipeline_id, job.role.as_str(), EventType::Response)
                            .job(job.id)
                            .to_role("pipeline")
                            .content(response.text.clone())
                            .metadata(json!({
                                "stage": "writer",
                                "usage": response.usage,
                                "latency_ms": response.latency_ms,
                                "role_switched": role_switched,
                            }))
                            .parent_opt(last_event),
                    )?;
                    last_event = Some(event_id);

                    // Contract, then guard. Both feed the escalator.
                    let failure: Option<(String, Vec<String>, String)> =
                        match parse_completion(writer_bundle.schema_role, &response.text) {
                            Ok(parsed) => match self.guard.validate(&parsed.output) {
                                Ok(()) => {
                                    if parsed.degraded {
                                        self.counters.incr(names::DEGRADED_PARSES);
                                    }
                                    accepted = Some((parsed.output, parsed.degraded, event_id));
                                    None
                                }
                                Err(guard_err) => Some((
                                    guard_err.error_kind().to_string(),
                                    vec![guard_err.field().to_string()],
                                    guard_err.to_string(),
                                )),
                            },
                            Err(contract_err) => Some((
                                contract_err.error_kind().to_string(),
                                contract_err.missing_fields().to_vec(),
                                contract_err.to_string(),
                            )),
                        };

                    match failure {
                        None => {
                            machine
                                .transition(StageEvent::Produced)
                                .expect("Writing accepts Produced");
                        }
                        Some((kind, missing, message)) => {
                            let signature =
                                FailureSignature::new(kind, missing, job.role, &base_payload);
                            match self.consult_escalator(job, signature, &base_payload, &message) {
                                EscalationOutcome::Retry(next_payload) => payload = next_payload,
                                EscalationOutcome::Switch(next_payload, new_profile) => {
                                    role_switched = true;
                                    persona_text =
                                        self.personas.get(new_profile, Stage::Writer).text.clone();
                                    payload = next_payload;
                                }
                                EscalationOutcome::Abort(reason) => {
                                    let event_id = self.append_error(
                                        job,
                                        last_event,
                                        &reason,
                                        json!({"failed_stage": "contract"}),
                                    )?;
                                    let _ = machine.transition(StageEvent::Fail);
                                    return Ok(SupervisorOutcome::Blocked { reason, event_id });
                                }
                            }
                        }
                    }
                }

                SupervisorStage::Auditing => {
                    let (output, _, _) = accepted.as_ref().expect("Auditing requires an output");
                    let output_json =
                        serde_json::to_string_pretty(output).unwrap_or_else(|_| String::new());
                    let audit_payload = format!(
                        "## Original task\n{}\n\n## Worker output\n{}",
                        base_payload, output_json
                    );

                    self.counters.incr(names::BACKEND_CALLS);
                    let verdict = match self
                        .router
                        .call(
                            job.role,
                            Stage::Auditor,
                            &auditor_bundle.text,
                            &audit_payload,
                            &self.call_options(),
                        )
                        .await
                    {
                        Ok(response) => {
                            let event_id = self.log.append(
                                EventDraft::new(
                                    job.pipeline_id,
                                    format!("{}-auditor", job.role),
                                    EventType::Decision,
                                )
                                .job(job.id)
                                .to_role("pipeline")
                                .content(response.text.clone())
                                .metadata(json!({
                                    "stage": "auditor",
                                    "latency_ms": response.latency_ms,
                                }))
                                .parent_opt(last_event),
                            )?;
                            last_event = Some(event_id);
                            parse_completion(auditor_bundle.schema_role, &response.text)
                                .ok()
                                .and_then(|parsed| match parsed.output {
                                    AgentOutput::Reviewer(review) => Some(review),
                                    _ => None,
                                })
                        }
                        Err(e) => {
                            warn!(error = %e, "auditor call failed");
                            None
                        }
                    };

                    let Some(review) = verdict else {
                        // An unusable audit counts against the same ladder a
                        // broken writer output does.
                        let signature = FailureSignature::new(
                            "AUDIT_UNUSABLE",
                            vec![],
                            job.role,
                            &base_payload,
                        );
                        match self.consult_escalator(
                            job,
                            signature,
                            &base_payload,
                            "auditor produced no usable verdict",
                        ) {
                            EscalationOutcome::Abort(reason) => {
                                let event_id = self.append_error(
                                    job,
                                    last_event,
                                    &reason,
                                    json!({"failed_stage": "audit"}),
                                )?;
                                let _ = machine.transition(StageEvent::Fail);
                                return Ok(SupervisorOutcome::Blocked { reason, event_id });
                            }
                            // Switching profiles mid-audit has no meaning;
                            // both non-terminal rungs just retry the audit.
                            EscalationOutcome::Retry(_) | EscalationOutcome::Switch(_, _) => {
                                continue;
                            }
                        }
                    };

                    match review.verdict {
                        Verdict::Approve => {
                            audit = Some(review);
                            machine
                                .transition(StageEvent::AuditApprove)
                                .expect("Auditing accepts AuditApprove");
                        }
                        Verdict::Revise => {
                            if machine.rewrite_count() >= self.config.max_rewrites {
                                let reason = format!(
                                    "rewrite budget exhausted after {} iterations",
                                    machine.rewrite_count()
                                );
                                let event_id = self.append_error(
                                    job,
                                    last_event,
                                    &reason,
                                    json!({"failed_stage": "audit"}),
                                )?;
                                let _ = machine.transition(StageEvent::Fail);
                                return Ok(SupervisorOutcome::Blocked { reason, event_id });
                            }
                            self.counters.incr(names::REWRITES);
                            let notes = audit_notes(&review);
                            payload =
                                format!("{}\n\n[AUDIT_FEEDBACK]\n{}", base_payload, notes);
                            accepted = None;
                            machine
                                .transition(StageEvent::AuditRevise)
                                .expect("Auditing accepts AuditRevise");
                        }
                        Verdict::Reject => {
                            let reason = format!("auditor rejected: {}", audit_notes(&review));
                            let event_id = self.append_error(
                                job,
                                last_event,
                                &reason,
                                json!({"failed_stage": "audit", "verdict": "REJECT"}),
                            )?;
                            let _ = machine.transition(StageEvent::AuditReject);
                            return Ok(SupervisorOutcome::Blocked { reason, event_id });
                        }
                    }
                }

                SupervisorStage::Stamping => {
                    let (output, _, _) = accepted.as_ref().expect("Stamping requires an output");
                    let output_json =
                        serde_json::to_string_pretty(output).unwrap_or_else(|_| String::new());

                    self.counters.incr(names::BACKEND_CALLS);
                    stamp = match self
                        .router
                        .call(
                            job.role,
                            Stage::Stamp,
                            &stamp_bundle.text,
                            &output_json,
                            &self.call_options(),
                        )
                        .await
                    {
                        Ok(response) => {
                            let event_id = self.log.append(
                                EventDraft::new(
                                    job.pipeline_id,
                                    format!("{}-stamp", job.role),
                                    EventType::Decision,
                                )
                                .job(job.id)
                                .to_role("pipeline")
                                .content(response.text.clone())
                                .metadata(json!({"stage": "stamp"}))
                                .parent_opt(last_event),
                            )?;
                            last_event = Some(event_id);
                            parse_completion(stamp_bundle.schema_role, &response.text)
                                .ok()
                                .and_then(|parsed| match parsed.output {
                                    AgentOutput::Stamp(stamp) => Some(stamp),
                                    _ => None,
                                })
                        }
                        // Advisory stage: a broken stamp never blocks the work.
                        Err(e) => {
                            warn!(error = %e, "stamp call failed, continuing without stamp");
                            None
                        }
                    };

                    machine
                        .transition(StageEvent::Stamped)
                        .expect("Stamping accepts Stamped");
                }

                SupervisorStage::Done | SupervisorStage::Failed => unreachable!("loop guard"),
            }
        }

        let (output, degraded, response_event_id) =
            accepted.expect("Done stage requires an accepted output");
        let audit = audit.expect("Done stage requires an audit");

        Ok(SupervisorOutcome::Completed(CompletedWork {
            output,
            audit,
            stamp,
            rewrites: machine.rewrite_count(),
            degraded_parse: degraded,
            role_switched,
            response_event_id,
        }))
    }

    fn consult_escalator(
        &self,
        job: &Job,
        signature: FailureSignature,
        base_payload: &str,
        message: &str,
    ) -> EscalationOutcome {
        self.counters.incr(names::ESCALATIONS);
        let decision =
            self.escalator
                .record_failure(job.pipeline_id, signature, base_payload, message);
        match decision.action {
            RetryAction::Retry { modified_payload } => EscalationOutcome::Retry(modified_payload),
            RetryAction::SwitchProfile {
                new_profile,
                modified_payload,
            } => EscalationOutcome::Switch(modified_payload, new_profile),
            RetryAction::Abort { reason } => EscalationOutcome::Abort(reason),
        }
    }

    fn append_error(
        &self,
        job: &Job,
        parent: Option<u64>,
        reason: &str,
        metadata: serde_json::Value,
    ) -> Result<u64> {
        Ok(self.log.append(
            EventDraft::new(job.pipeline_id, job.role.as_str(), EventType::Error)
                .job(job.id)
                .to_role("pipeline")
                .content(format!("BLOCKED: {reason}"))
                .metadata(metadata)
                .parent_opt(parent),
        )?)
    }

    fn append_state(
        &self,
        job: &Job,
        parent: Option<u64>,
        state: &str,
        metadata: serde_json::Value,
    ) -> Result<u64> {
        Ok(self.log.append(
            EventDraft::new(job.pipeline_id, job.role.as_str(), EventType::State)
                .job(job.id)
                .to_role("pipeline")
                .content(state)
                .metadata(metadata)
                .parent_opt(parent),
        )?)
    }
}

enum EscalationOutcome {
    Retry(String),
    Switch(String, Role),
    Abort(String),
}

fn audit_notes(review: &ReviewerOutput) -> String {
    if review.risks.is_empty() {
        return "no specific notes".into();
    }
    review
        .risks
        .iter()
        .map(|r| format!("[{:?}] {}: {}", r.severity, r.file, r.issue))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// EventDraft chaining helper
// ---------------------------------------------------------------------------

trait ParentOpt {
    fn parent_opt(self, parent: Option<u64>) -> Self;
}

impl ParentOpt for EventDraft {
    fn parent_opt(self, parent: Option<u64>) -> Self {
        match parent {
            Some(id) => self.parent(id),
            None => self,
        }
    }
}
