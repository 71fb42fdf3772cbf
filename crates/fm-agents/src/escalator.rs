use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use fm_core::types::Role;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

/// How much of the prompt participates in the signature hash. Identical
/// failures on slightly different tails still collapse together.
const PROMPT_HASH_WINDOW: usize = 500;

/// Bound on the signature map; the oldest-touched signature is evicted.
const DEFAULT_CAPACITY: usize = 4096;

// ---------------------------------------------------------------------------
// EscalationLevel
// ---------------------------------------------------------------------------

/// The three rungs of the retry ladder. Ordering matters: a signature's
/// level never moves down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    SelfRepair,
    RoleSwitch,
    HardFail,
}

// ---------------------------------------------------------------------------
// FailureSignature
// ---------------------------------------------------------------------------

/// Equivalence class of failures. Two failures collapse iff all four fields
/// match; `missing_fields` is kept sorted so ordering differences in the
/// reporting path cannot split a class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureSignature {
    pub error_kind: String,
    pub missing_fields: Vec<String>,
    pub role: Role,
    pub prompt_hash: String,
}

impl FailureSignature {
    pub fn new(
        error_kind: impl Into<String>,
        mut missing_fields: Vec<String>,
        role: Role,
        prompt: &str,
    ) -> Self {
        missing_fields.sort();
        let mut window_end = PROMPT_HASH_WINDOW.min(prompt.len());
        while window_end > 0 && !prompt.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let mut hasher = Sha256::new();
        hasher.update(&prompt.as_bytes()[..window_end]);
        let digest = hasher.finalize();
        Self {
            error_kind: error_kind.into(),
            missing_fields,
            role,
            prompt_hash: format!("{:x}", digest)[..16].to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Records and actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub count: u32,
    pub level: EscalationLevel,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry the same profile with the prior error prepended as feedback.
    Retry { modified_payload: String },
    /// Retry the same job under the alternate profile.
    SwitchProfile {
        new_profile: Role,
        modified_payload: String,
    },
    /// Stop retrying; surface a BLOCKED event upward.
    Abort { reason: String },
}

#[derive(Debug, Clone)]
pub struct EscalationDecision {
    pub level: EscalationLevel,
    pub count: u32,
    pub action: RetryAction,
}

/// The profile a role hands its work to on a role switch.
pub fn alternate_profile(role: Role) -> Role {
    match role {
        Role::Coder => Role::Reviewer,
        Role::Reviewer => Role::Coder,
        Role::Qa => Role::Coder,
        Role::Council => Role::Reviewer,
        _ => Role::Reviewer,
    }
}

// ---------------------------------------------------------------------------
// RetryEscalator
// ---------------------------------------------------------------------------

/// Tracks failure signatures and decides what happens after each failure.
///
/// The ladder is strictly monotonic per signature: first occurrence is
/// self-repair, the second is a role switch (at most once per profile per
/// pipeline), the third and beyond are a hard fail. Once a signature has
/// hard-failed it stays hard-failed.
pub struct RetryEscalator {
    capacity: usize,
    inner: Mutex<EscalatorInner>,
}

#[derive(Default)]
struct EscalatorInner {
    records: HashMap<FailureSignature, EscalationRecord>,
    /// Access order for LRU eviction; front is the coldest signature.
    order: VecDeque<FailureSignature>,
    /// `(pipeline, profile)` pairs that already consumed their one switch.
    switches_used: HashSet<(Uuid, Role)>,
}

impl RetryEscalator {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(EscalatorInner::default()),
        }
    }

    /// Record one failure and return the resulting level and retry action.
    pub fn record_failure(
        &self,
        pipeline_id: Uuid,
        signature: FailureSignature,
        original_payload: &str,
        error_message: &str,
    ) -> EscalationDecision {
        let mut inner = self.inner.lock().expect("escalator lock poisoned");

        let record = match inner.records.get(&signature) {
            Some(record) => {
                let mut record = record.clone();
                record.count += 1;
                record
            }
            None => EscalationRecord {
                count: 1,
                level: EscalationLevel::SelfRepair,
            },
        };

        let computed = match record.count {
            1 => EscalationLevel::SelfRepair,
            2 => EscalationLevel::RoleSwitch,
            _ => EscalationLevel::HardFail,
        };
        // Never step down, even if counts were restored from a snapshot.
        let mut level = computed.max(record.level);

        let action = match level {
            EscalationLevel::SelfRepair => RetryAction::Retry {
                modified_payload: format!(
                    "[ERROR_FEEDBACK] {error_message}\n{original_payload}"
                ),
            },
            EscalationLevel::RoleSwitch => {
                let profile = signature.role;
                if inner.switches_used.contains(&(pipeline_id, profile)) {
                    // One switch per profile per pipeline; the ladder jumps
                    // straight to its terminal rung.
                    level = EscalationLevel::HardFail;
                    RetryAction::Abort {
                        reason: format!("role switch already used for {profile} in this pipeline"),
                    }
                } else {
                    inner.switches_used.insert((pipeline_id, profile));
                    RetryAction::SwitchProfile {
                        new_profile: alternate_profile(profile),
                        modified_payload: format!("[ROLE_SWITCH] {original_payload}"),
                    }
                }
            }
            EscalationLevel::HardFail => RetryAction::Abort {
                reason: format!(
                    "same failure repeated {} times ({})",
                    record.count, signature.error_kind
                ),
            },
        };

        let updated = EscalationRecord {
            count: record.count,
            level,
        };
        Self::touch(&mut inner, signature.clone(), updated, self.capacity);

        match level {
            EscalationLevel::HardFail => warn!(
                role = %signature.role,
                error_kind = %signature.error_kind,
                count = record.count,
                "failure signature hard-failed"
            ),
            _ => info!(
                role = %signature.role,
                error_kind = %signature.error_kind,
                count = record.count,
                level = ?level,
                "failure recorded"
            ),
        }

        EscalationDecision {
            level,
            count: record.count,
            action,
        }
    }

    /// Current level for a signature, if tracked.
    pub fn level_of(&self, signature: &FailureSignature) -> Option<EscalationLevel> {
        let inner = self.inner.lock().expect("escalator lock poisoned");
        inner.records.get(signature).map(|r| r.level)
    }

    pub fn tracked_signatures(&self) -> usize {
        let inner = self.inner.lock().expect("escalator lock poisoned");
        inner.records.len()
    }

    /// Serialize the signature map for best-effort persistence.
    pub fn snapshot(&self) -> Vec<(FailureSignature, EscalationRecord)> {
        let inner = self.inner.lock().expect("escalator lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|sig| inner.records.get(sig).map(|r| (sig.clone(), r.clone())))
            .collect()
    }

    /// Restore a previously snapshotted map. Existing entries win.
    pub fn restore(&self, entries: Vec<(FailureSignature, EscalationRecord)>) {
        let mut inner = self.inner.lock().expect("escalator lock poisoned");
        for (sig, record) in entries {
            if !inner.records.contains_key(&sig) {
                Self::touch(&mut inner, sig, record, self.capacity);
            }
        }
    }

    fn touch(
        inner: &mut EscalatorInner,
        signature: FailureSignature,
        record: EscalationRecord,
        capacity: usize,
    ) {
        if inner.records.insert(signature.clone(), record).is_some() {
            inner.order.retain(|s| s != &signature);
        }
        inner.order.push_back(signature);
        while inner.records.len() > capacity {
            if let Some(coldest) = inner.order.pop_front() {
                inner.records.remove(&coldest);
            } else {
                break;
            }
        }
    }
}

impl Default for RetryEscalator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
