use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

/// The agent role a job is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Pm,
    Excavator,
    Strategist,
    Coder,
    Qa,
    Reviewer,
    Researcher,
    Analyst,
    Stamp,
    Council,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Pm => "pm",
            Role::Excavator => "excavator",
            Role::Strategist => "strategist",
            Role::Coder => "coder",
            Role::Qa => "qa",
            Role::Reviewer => "reviewer",
            Role::Researcher => "researcher",
            Role::Analyst => "analyst",
            Role::Stamp => "stamp",
            Role::Council => "council",
        }
    }

    /// Roles the PM is allowed to dispatch work to. The PM never dispatches
    /// to itself, to the stamp, or to the council.
    pub fn dispatchable_from_pm(&self) -> bool {
        matches!(
            self,
            Role::Excavator
                | Role::Strategist
                | Role::Coder
                | Role::Qa
                | Role::Reviewer
                | Role::Researcher
                | Role::Analyst
        )
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm" => Ok(Role::Pm),
            "excavator" => Ok(Role::Excavator),
            "strategist" => Ok(Role::Strategist),
            "coder" => Ok(Role::Coder),
            "qa" => Ok(Role::Qa),
            "reviewer" => Ok(Role::Reviewer),
            "researcher" => Ok(Role::Researcher),
            "analyst" => Ok(Role::Analyst),
            "stamp" => Ok(Role::Stamp),
            "council" => Ok(Role::Council),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Whether a job runs a role's worker persona or its reviewer persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Worker,
    Reviewer,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Worker => "worker",
            Mode::Reviewer => "reviewer",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Mode::Worker),
            "reviewer" => Ok(Mode::Reviewer),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &JobState) -> bool {
        matches!(
            (self, target),
            (JobState::Pending, JobState::Leased)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Leased, JobState::Pending)
                | (JobState::Leased, JobState::Succeeded)
                | (JobState::Leased, JobState::Failed)
                | (JobState::Leased, JobState::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Ordering rank: lower sorts first when dequeuing.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    /// One tier up, saturating at `High`. Used by queue aging.
    pub fn bumped(&self) -> Priority {
        match self {
            Priority::High | Priority::Medium => Priority::High,
            Priority::Low => Priority::Medium,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// The unit of scheduled work: one role invocation within a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub parent_job_id: Option<Uuid>,
    pub role: Role,
    pub mode: Mode,
    pub state: JobState,
    pub payload: String,
    pub context: Option<String>,
    pub priority: Priority,
    /// Position of this job among same-(role, mode) jobs of its pipeline.
    /// `(pipeline_id, role, mode, sequence)` is unique.
    pub sequence: u32,
    pub created_at: DateTime<Utc>,
    pub leased_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lease_deadline: Option<DateTime<Utc>>,
    pub attempt_count: u32,
}

impl Job {
    pub fn new(pipeline_id: Uuid, role: Role, mode: Mode, payload: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            parent_job_id: None,
            role,
            mode,
            state: JobState::Pending,
            payload: payload.into(),
            context: None,
            priority: Priority::default(),
            sequence: 0,
            created_at: Utc::now(),
            leased_at: None,
            finished_at: None,
            lease_deadline: None,
            attempt_count: 0,
        }
    }

    /// The dedup key: unique per pipeline and role slot.
    pub fn slot(&self) -> (Uuid, Role, Mode, u32) {
        (self.pipeline_id, self.role, self.mode, self.sequence)
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Blocked,
    Escalated,
    Cancelled,
    Done,
}

impl PipelineState {
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        matches!(
            (self, target),
            (PipelineState::Running, PipelineState::Blocked)
                | (PipelineState::Running, PipelineState::Escalated)
                | (PipelineState::Running, PipelineState::Cancelled)
                | (PipelineState::Running, PipelineState::Done)
                | (PipelineState::Blocked, PipelineState::Running)
                | (PipelineState::Blocked, PipelineState::Escalated)
                | (PipelineState::Blocked, PipelineState::Cancelled)
                | (PipelineState::Escalated, PipelineState::Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Cancelled | PipelineState::Done)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The causal thread of one user request: a chain of jobs driven through the
/// plan → implement → test → review ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub root_request: String,
    pub session_id: String,
    pub state: PipelineState,
    /// Returned-to-predecessor cycles per role. Capped by
    /// `supervisor.max_rework_rounds`; exceeding the cap escalates.
    pub rework_rounds: HashMap<Role, u32>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Wall-clock deadline; expiry escalates the pipeline.
    pub deadline: Option<DateTime<Utc>>,
}

impl Pipeline {
    pub fn new(root_request: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            root_request: root_request.into(),
            session_id: session_id.into(),
            state: PipelineState::Running,
            rework_rounds: HashMap::new(),
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            deadline: None,
        }
    }

    pub fn rework_rounds_for(&self, role: Role) -> u32 {
        self.rework_rounds.get(&role).copied().unwrap_or(0)
    }

    /// Record one rework cycle for `role` and return the new count.
    pub fn record_rework(&mut self, role: Role) -> u32 {
        let count = self.rework_rounds.entry(role).or_insert(0);
        *count += 1;
        self.updated_at = Utc::now();
        *count
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Request,
    Response,
    Decision,
    State,
    Error,
}

/// One immutable record in the conversation stream. Records chain backwards
/// via `parent_event_id`, which always references a smaller `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub t: DateTime<Utc>,
    pub pipeline_id: Uuid,
    pub job_id: Option<Uuid>,
    pub from_role: String,
    pub to_role: Option<String>,
    pub event_type: EventType,
    pub parent_event_id: Option<u64>,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Builder-ish input for appending: everything except the log-assigned
/// `id` and `t`.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub pipeline_id: Uuid,
    pub job_id: Option<Uuid>,
    pub from_role: String,
    pub to_role: Option<String>,
    pub event_type: EventType,
    pub parent_event_id: Option<u64>,
    pub content: String,
    pub metadata: serde_json::Value,
}

impl EventDraft {
    pub fn new(pipeline_id: Uuid, from_role: impl Into<String>, event_type: EventType) -> Self {
        Self {
            pipeline_id,
            job_id: None,
            from_role: from_role.into(),
            to_role: None,
            event_type,
            parent_event_id: None,
            content: String::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn to_role(mut self, role: impl Into<String>) -> Self {
        self.to_role = Some(role.into());
        self
    }

    pub fn parent(mut self, parent_event_id: u64) -> Self {
        self.parent_event_id = Some(parent_event_id);
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
