use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use fm_agents::orchestrator::{PipelineOrchestrator, WorkerResult};
use fm_core::config::QueueConfig;
use fm_core::types::{EventDraft, EventType, Job, Mode, Priority, Role};
use fm_log::EventLog;
use fm_telemetry::counters::RuntimeCounters;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::event_bus::{EventBus, PipelineMessage};
use crate::queue::{CreateJob, JobQueue, QueueError, QueueStatus, ReapReport};

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBody {
    pub role: Role,
    pub mode: Mode,
    pub payload: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub parent_job_id: Option<Uuid>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBody {
    pub job_id: Uuid,
    #[serde(default)]
    pub result: Option<WorkerResult>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub next_jobs: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub job_id: Uuid,
    pub pipeline_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct PulledJob {
    pub job_id: Uuid,
    pub pipeline_id: Uuid,
    pub payload: String,
    pub context: Option<String>,
    pub lease_deadline: Option<chrono::DateTime<chrono::Utc>>,
    pub attempt_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// The push body names neither a result nor an error.
    #[error("push must carry a result or an error")]
    EmptyPush,

    #[error("event log: {0}")]
    Log(#[from] fm_log::LogError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Composes the queue, the orchestrator, and the event log into the
/// push/pull contract workers see.
///
/// Both dispatch paths go through here: the HTTP handlers are a thin layer
/// over these methods, and in-process callers can use them directly.
pub struct Dispatcher {
    queue: JobQueue,
    orchestrator: Arc<PipelineOrchestrator>,
    log: Arc<EventLog>,
    bus: EventBus,
    counters: Arc<RuntimeCounters>,
    /// `job → request event` so responses chain to their requests.
    request_events: Mutex<HashMap<Uuid, u64>>,
}

impl Dispatcher {
    pub fn new(
        queue_config: QueueConfig,
        orchestrator: Arc<PipelineOrchestrator>,
        log: Arc<EventLog>,
        bus: EventBus,
        counters: Arc<RuntimeCounters>,
    ) -> Self {
        Self {
            queue: JobQueue::new(queue_config, Arc::clone(&counters)),
            orchestrator,
            log,
            bus,
            counters,
            request_events: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a job. Without a parent this opens a fresh pipeline whose root
    /// request is the payload.
    pub fn create_job(&self, body: CreateBody) -> Result<(Job, bool)> {
        let (pipeline_id, parent_event, sequence) = match body.parent_job_id {
            Some(parent_id) => {
                let parent = self
                    .queue
                    .get(parent_id)
                    .ok_or(QueueError::NotFound(parent_id))?;
                let parent_event = self.response_event_of(parent_id);
                (parent.pipeline_id, parent_event, parent.sequence + 1)
            }
            None => {
                let pipeline = self.orchestrator.create_pipeline(
                    &body.payload,
                    body.session_id.as_deref().unwrap_or("default"),
                );
                (pipeline.id, None, 0)
            }
        };

        let (job, created) = self.queue.create(CreateJob {
            pipeline_id,
            parent_job_id: body.parent_job_id,
            role: body.role,
            mode: body.mode,
            payload: body.payload,
            context: body.context,
            priority: body.priority.unwrap_or_default(),
            sequence,
        });

        if created {
            self.append_request_event(&job, parent_event)?;
            self.bus.publish(PipelineMessage::JobCreated {
                job_id: job.id,
                pipeline_id: job.pipeline_id,
                role: job.role,
            });
        }
        Ok((job, created))
    }

    /// Lease the best pending job for `(role, mode)`, if any.
    pub fn pull(&self, role: Role, mode: Mode) -> Option<PulledJob> {
        let job = self.queue.pull(role, mode)?;
        Some(PulledJob {
            job_id: job.id,
            pipeline_id: job.pipeline_id,
            payload: job.payload,
            context: job.context,
            lease_deadline: job.lease_deadline,
            attempt_count: job.attempt_count,
        })
    }

    /// Complete a leased job and schedule its successors.
    ///
    /// Duplicate pushes replay the recorded `next_jobs` as a
    /// [`QueueError::DuplicatePush`]; successors deduplicate on their slot,
    /// so identical pushes never create extra jobs.
    pub fn push(&self, body: PushBody) -> Result<PushResponse> {
        let success = body.error.is_none() && body.result.is_some();
        if body.error.is_none() && body.result.is_none() {
            return Err(DispatchError::EmptyPush);
        }

        let job = self.queue.complete(body.job_id, success)?;
        let request_event = self.request_event_of(job.id);

        // Response event, chained to the job's request.
        let response_event = self.log.append(
            with_parent(
                EventDraft::new(
                    job.pipeline_id,
                    format!("{}-{}", job.role, job.mode),
                    if success {
                        EventType::Response
                    } else {
                        EventType::Error
                    },
                )
                .job(job.id)
                .to_role("pipeline")
                .content(match (success, &body.result, &body.error) {
                    (true, Some(result), _) => serde_json::to_string(&result.output)
                        .unwrap_or_else(|_| "<unserializable output>".into()),
                    (_, _, Some(error)) => error.clone(),
                    _ => String::new(),
                })
                .metadata(json!({
                    "success": success,
                    "attempt_count": job.attempt_count,
                })),
                request_event,
            ),
        )?;
        self.remember_response_event(job.id, response_event);

        self.bus.publish(PipelineMessage::JobFinished {
            job_id: job.id,
            pipeline_id: job.pipeline_id,
            state: job.state,
        });

        // Orchestrator hook: compute and enqueue successors.
        let parent = job.parent_job_id.and_then(|id| self.queue.get(id));
        let routing = if success {
            let result = body.result.as_ref().expect("success implies a result");
            self.orchestrator.route_success(&job, parent.as_ref(), result)
        } else {
            self.orchestrator
                .route_failure(&job, body.error.as_deref().unwrap_or("worker error"))
        };

        let mut next_jobs = Vec::new();
        for seed in &routing.seeds {
            let (successor, created) = self.queue.enqueue_seed(seed);
            if created {
                self.append_request_event(&successor, Some(response_event))?;
                self.bus.publish(PipelineMessage::JobCreated {
                    job_id: successor.id,
                    pipeline_id: successor.pipeline_id,
                    role: successor.role,
                });
            }
            next_jobs.push(successor.id);
        }

        self.bus.publish(PipelineMessage::PipelineState {
            pipeline_id: job.pipeline_id,
            state: routing.pipeline_state,
        });

        self.queue.record_push(job.id, next_jobs.clone());
        info!(
            job_id = %job.id,
            successors = next_jobs.len(),
            state = ?routing.pipeline_state,
            "push processed"
        );
        Ok(PushResponse { next_jobs })
    }

    /// Cancel a pipeline: flag, pipeline state, and pending jobs.
    pub fn cancel_pipeline(&self, pipeline_id: Uuid) -> usize {
        self.orchestrator.cancel(pipeline_id);
        self.queue.cancel_pipeline(pipeline_id)
    }

    /// One reaper sweep: requeue expired leases, escalate pipelines whose
    /// jobs ran out of attempts.
    pub fn reap(&self) -> ReapReport {
        let report = self.queue.reap_expired();
        for job in &report.exhausted {
            self.orchestrator
                .escalate(job.pipeline_id, "job attempts exhausted");
        }
        report
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn counters_snapshot(&self) -> fm_telemetry::counters::CountersSnapshot {
        self.counters.snapshot()
    }

    pub fn list_pipeline(&self, pipeline_id: Uuid) -> Vec<Job> {
        self.queue.list_pipeline(pipeline_id)
    }

    pub fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.queue.get(job_id)
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    // -- event chaining -------------------------------------------------------

    fn append_request_event(&self, job: &Job, parent: Option<u64>) -> Result<()> {
        let from = if job.parent_job_id.is_some() {
            "pipeline".to_string()
        } else {
            "operator".to_string()
        };
        let event_id = self.log.append(
            with_parent(
                EventDraft::new(job.pipeline_id, from, EventType::Request)
                    .job(job.id)
                    .to_role(format!("{}-{}", job.role, job.mode))
                    .content(job.payload.clone())
                    .metadata(json!({"sequence": job.sequence, "priority": job.priority})),
                parent,
            ),
        )?;
        self.request_events
            .lock()
            .expect("request events lock poisoned")
            .insert(job.id, event_id);
        Ok(())
    }

    fn request_event_of(&self, job_id: Uuid) -> Option<u64> {
        self.request_events
            .lock()
            .expect("request events lock poisoned")
            .get(&job_id)
            .copied()
    }

    /// The response event id is stored under a derived key so successors
    /// can chain to their parent's response.
    fn remember_response_event(&self, job_id: Uuid, event_id: u64) {
        self.request_events
            .lock()
            .expect("request events lock poisoned")
            .insert(response_key(job_id), event_id);
    }

    fn response_event_of(&self, job_id: Uuid) -> Option<u64> {
        self.request_events
            .lock()
            .expect("request events lock poisoned")
            .get(&response_key(job_id))
            .copied()
    }
}

/// Derived map key for a job's response event. A v5 UUID in the job's own
/// namespace cannot collide with a real job id.
fn response_key(job_id: Uuid) -> Uuid {
    Uuid::new_v5(&job_id, b"response-event")
}

fn with_parent(draft: EventDraft, parent: Option<u64>) -> EventDraft {
    match parent {
        Some(id) => draft.parent(id),
        None => draft,
    }
}
