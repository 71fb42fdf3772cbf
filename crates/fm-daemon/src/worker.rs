use std::sync::Arc;
use std::time::Duration;

use fm_agents::orchestrator::WorkerResult;
use fm_agents::supervisor::{DualEngineSupervisor, SupervisorOutcome};
use fm_bridge::dispatcher::{Dispatcher, PushBody};
use fm_core::types::{JobState, Mode, Role};
use fm_harness::shutdown::ShutdownSignal;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// In-process worker: pulls jobs for one `(role, mode)` key, runs them
/// under the supervisor, and pushes the result back.
///
/// This is the in-process flavor of the same contract external workers
/// speak over HTTP; both paths land on the dispatcher.
pub struct Worker {
    role: Role,
    mode: Mode,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<DualEngineSupervisor>,
    idle_backoff: Duration,
}

impl Worker {
    pub fn new(
        role: Role,
        mode: Mode,
        dispatcher: Arc<Dispatcher>,
        supervisor: Arc<DualEngineSupervisor>,
    ) -> Self {
        Self {
            role,
            mode,
            dispatcher,
            supervisor,
            idle_backoff: Duration::from_millis(500),
        }
    }

    /// Pull-execute-push until shutdown.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let ticket = shutdown.register(format!("worker-{}-{}", self.role, self.mode));
        info!(role = %self.role, mode = %self.mode, "worker loop started");
        while !shutdown.is_shutting_down() {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(self.idle_backoff).await,
                Err(e) => {
                    warn!(role = %self.role, error = %e, "worker step failed");
                    tokio::time::sleep(self.idle_backoff).await;
                }
            }
        }
        info!(role = %self.role, "worker loop stopped");
        ticket.confirm();
    }

    /// One pull-execute-push cycle. Returns `false` when the queue was
    /// empty.
    pub async fn step(&self) -> anyhow::Result<bool> {
        let Some(pulled) = self.dispatcher.pull(self.role, self.mode) else {
            return Ok(false);
        };

        // Reconstruct the job view the supervisor works on.
        let job = self
            .dispatcher
            .get_job(pulled.job_id)
            .ok_or_else(|| anyhow::anyhow!("leased job {} vanished", pulled.job_id))?;
        debug_assert_eq!(job.state, JobState::Leased);

        let cancel = self
            .dispatcher
            .orchestrator()
            .cancel_flag(job.pipeline_id);
        let request_event = None;
        let outcome = self.supervisor.run(&job, &cancel, request_event).await?;

        let body = match outcome {
            SupervisorOutcome::Completed(work) => PushBody {
                job_id: job.id,
                result: Some(build_result(work)),
                error: None,
            },
            SupervisorOutcome::Blocked { reason, .. } => PushBody {
                job_id: job.id,
                result: None,
                error: Some(reason),
            },
            SupervisorOutcome::Cancelled { .. } => PushBody {
                job_id: job.id,
                result: None,
                error: Some("cancelled".into()),
            },
        };

        self.dispatcher.push(body)?;
        Ok(true)
    }
}

fn build_result(work: fm_agents::supervisor::CompletedWork) -> WorkerResult {
    let requires_escalation = work
        .stamp
        .as_ref()
        .map(|s| s.requires_escalation)
        .unwrap_or(false);
    let notes = work
        .audit
        .risks
        .iter()
        .map(|r| format!("{}: {}", r.file, r.issue))
        .collect::<Vec<_>>()
        .join("\n");
    WorkerResult {
        audit_verdict: Some(work.audit.verdict),
        requires_escalation,
        notes: (!notes.is_empty()).then_some(notes),
        output: work.output,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
