use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use fm_agents::orchestrator::JobSeed;
use fm_core::config::QueueConfig;
use fm_core::types::{Job, JobState, Mode, Priority, Role};
use fm_telemetry::counters::{names, RuntimeCounters};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// The job already completed; the original `next_jobs` are replayed so
    /// duplicate pushes stay no-ops.
    #[error("job {job_id} already pushed")]
    DuplicatePush {
        job_id: Uuid,
        next_jobs: Vec<Uuid>,
    },

    /// The lease expired (or was reclaimed) before this push arrived.
    #[error("lease expired for job {0}")]
    LeaseExpired(Uuid),

    #[error("job {job_id} is {state:?}, expected {expected:?}")]
    InvalidState {
        job_id: Uuid,
        state: JobState,
        expected: JobState,
    },
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Admission parameters for a fresh root job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub pipeline_id: Uuid,
    pub parent_job_id: Option<Uuid>,
    pub role: Role,
    pub mode: Mode,
    pub payload: String,
    pub context: Option<String>,
    pub priority: Priority,
    pub sequence: u32,
}

/// Counts by state for the status endpoint.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub leased: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// What the reaper did in one sweep.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    /// Jobs returned to pending with a bumped attempt count.
    pub requeued: Vec<Uuid>,
    /// Jobs that exhausted their attempts; their pipelines must escalate.
    pub exhausted: Vec<Job>,
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

/// Role/mode-keyed pending queue with a lease model.
///
/// All state lives behind a single mutex: one mutator, no lock ordering to
/// get wrong, and nothing is held across an await point (no method here is
/// async). Delivery is at-least-once; successor dedup rides on the
/// `(pipeline_id, role, mode, sequence)` slot index.
pub struct JobQueue {
    config: QueueConfig,
    counters: Arc<RuntimeCounters>,
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    jobs: HashMap<Uuid, Job>,
    /// Pending job ids per `(role, mode)` key.
    pending: HashMap<(Role, Mode), Vec<Uuid>>,
    /// Slot index for successor dedup.
    slots: HashMap<(Uuid, Role, Mode, u32), Uuid>,
    /// Replay store for duplicate pushes.
    pushed: HashMap<Uuid, Vec<Uuid>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, counters: Arc<RuntimeCounters>) -> Self {
        Self {
            config,
            counters,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Admit a job. When the slot already exists the existing job is
    /// returned and `created` is `false` (idempotent successor scheduling).
    pub fn create(&self, req: CreateJob) -> (Job, bool) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let slot = (req.pipeline_id, req.role, req.mode, req.sequence);
        if let Some(existing_id) = inner.slots.get(&slot) {
            if let Some(existing) = inner.jobs.get(existing_id) {
                debug!(job_id = %existing_id, "slot occupied, returning existing job");
                self.counters.incr(names::DUPLICATE_PUSHES);
                return (existing.clone(), false);
            }
        }

        let mut job = Job::new(req.pipeline_id, req.role, req.mode, req.payload);
        job.parent_job_id = req.parent_job_id;
        job.context = req.context;
        job.priority = req.priority;
        job.sequence = req.sequence;

        inner.slots.insert(slot, job.id);
        inner
            .pending
            .entry((job.role, job.mode))
            .or_default()
            .push(job.id);
        inner.jobs.insert(job.id, job.clone());
        self.counters.incr(names::JOBS_CREATED);
        info!(job_id = %job.id, role = %job.role, mode = %job.mode, "job created");
        (job, true)
    }

    /// Enqueue an orchestrator seed; same dedup semantics as [`create`].
    pub fn enqueue_seed(&self, seed: &JobSeed) -> (Job, bool) {
        self.create(CreateJob {
            pipeline_id: seed.pipeline_id,
            parent_job_id: Some(seed.parent_job_id),
            role: seed.role,
            mode: seed.mode,
            payload: seed.payload.clone(),
            context: seed.context.clone(),
            priority: seed.priority,
            sequence: seed.sequence,
        })
    }

    /// Atomically dequeue the best pending job for `(role, mode)` and lease
    /// it. FIFO within the key, ordered by effective priority then age.
    pub fn pull(&self, role: Role, mode: Mode) -> Option<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let ids = inner.pending.get(&(role, mode))?;
        let age_threshold = Duration::seconds(self.config.age_threshold_secs as i64);

        let best = ids
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .min_by_key(|job| {
                (
                    effective_priority(job, now, age_threshold).rank(),
                    job.created_at,
                )
            })?
            .id;

        if let Some(ids) = inner.pending.get_mut(&(role, mode)) {
            ids.retain(|id| *id != best);
        }
        let job = inner.jobs.get_mut(&best).expect("pending id must resolve");
        job.state = JobState::Leased;
        job.leased_at = Some(now);
        job.lease_deadline = Some(now + Duration::seconds(self.config.lease_ttl_secs as i64));

        self.counters.incr(names::JOBS_PULLED);
        debug!(job_id = %job.id, deadline = ?job.lease_deadline, "job leased");
        Some(job.clone())
    }

    /// Atomically transition a leased job to `succeeded`/`failed`.
    ///
    /// Rejections: unknown id, duplicate push (replays the recorded
    /// successors), and pushes that arrive after the lease deadline.
    pub fn complete(&self, job_id: Uuid, success: bool) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        let job = inner.jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if job.state.is_terminal() {
            let next_jobs = inner.pushed.get(&job_id).cloned().unwrap_or_default();
            self.counters.incr(names::DUPLICATE_PUSHES);
            return Err(QueueError::DuplicatePush { job_id, next_jobs });
        }
        if job.state != JobState::Leased {
            return Err(QueueError::InvalidState {
                job_id,
                state: job.state,
                expected: JobState::Leased,
            });
        }
        if job.lease_deadline.map(|d| d < now).unwrap_or(false) {
            warn!(job_id = %job_id, "push after lease deadline");
            return Err(QueueError::LeaseExpired(job_id));
        }

        let job = inner.jobs.get_mut(&job_id).expect("checked above");
        job.state = if success {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        job.finished_at = Some(now);
        self.counters.incr(names::JOBS_PUSHED);
        Ok(job.clone())
    }

    /// Record the successors scheduled for a pushed job, for duplicate
    /// replay.
    pub fn record_push(&self, job_id: Uuid, next_jobs: Vec<Uuid>) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.pushed.insert(job_id, next_jobs);
    }

    /// Return expired leases to pending; fail jobs out of attempts.
    pub fn reap_expired(&self) -> ReapReport {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let mut report = ReapReport::default();

        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                job.state == JobState::Leased
                    && job.lease_deadline.map(|d| d < now).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        for id in expired {
            let job = inner.jobs.get_mut(&id).expect("expired id must resolve");
            job.attempt_count += 1;
            job.leased_at = None;
            job.lease_deadline = None;

            if job.attempt_count >= self.config.max_attempts {
                job.state = JobState::Failed;
                job.finished_at = Some(now);
                warn!(job_id = %id, attempts = job.attempt_count, "job failed: attempts exhausted");
                report.exhausted.push(job.clone());
            } else {
                job.state = JobState::Pending;
                let key = (job.role, job.mode);
                info!(job_id = %id, attempts = job.attempt_count, "lease reaped, job requeued");
                inner.pending.entry(key).or_default().push(id);
                report.requeued.push(id);
            }
            self.counters.incr(names::LEASES_REAPED);
        }
        report
    }

    /// Flip every non-terminal job of a pipeline to `cancelled`. Leased
    /// jobs keep their lease; the worker observes the flag and its push is
    /// rejected as a duplicate of the cancelled terminal state.
    pub fn cancel_pipeline(&self, pipeline_id: Uuid) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.pipeline_id == pipeline_id && j.state == JobState::Pending)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.state = JobState::Cancelled;
                job.finished_at = Some(Utc::now());
                let key = (job.role, job.mode);
                if let Some(pending) = inner.pending.get_mut(&key) {
                    pending.retain(|p| p != id);
                }
            }
        }
        ids.len()
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.jobs.get(&job_id).cloned()
    }

    /// Jobs of one pipeline, ordered by creation.
    pub fn list_pipeline(&self, pipeline_id: Uuid) -> Vec<Job> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.inner.lock().expect("queue lock poisoned");
        let mut status = QueueStatus {
            total: inner.jobs.len(),
            ..Default::default()
        };
        for job in inner.jobs.values() {
            match job.state {
                JobState::Pending => status.pending += 1,
                JobState::Leased => status.leased += 1,
                JobState::Succeeded => status.succeeded += 1,
                JobState::Failed => status.failed += 1,
                JobState::Cancelled => status.cancelled += 1,
            }
        }
        status
    }
}

/// Pending jobs past the age threshold climb one priority tier.
fn effective_priority(job: &Job, now: DateTime<Utc>, threshold: Duration) -> Priority {
    if now - job.created_at > threshold {
        job.priority.bumped()
    } else {
        job.priority
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
