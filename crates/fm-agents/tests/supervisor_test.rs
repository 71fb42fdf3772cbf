use std::path::Path;
use std::sync::Arc;

use fm_agents::escalator::{EscalationLevel, FailureSignature, RetryEscalator};
use fm_agents::personas::PersonaRegistry;
use fm_agents::supervisor::{CancelFlag, DualEngineSupervisor, SupervisorOutcome};
use fm_core::config::SupervisorConfig;
use fm_core::types::{Job, Mode, Role};
use fm_harness::backend::BackendError;
use fm_harness::compactor::TruncatingCompactor;
use fm_harness::{BackendRouter, StubBackend};
use fm_log::EventLog;
use fm_telemetry::counters::RuntimeCounters;
use uuid::Uuid;

const CODER_OK: &str = r#"```json
{"summary": "fix null check in the login handler", "files_changed": ["src/auth.rs"], "diff": "--- a/src/auth.rs\n+++ b/src/auth.rs\n@@ -10,3 +10,4 @@\n+    ok"}
```"#;

const CODER_SHORT_DIFF: &str = r#"```json
{"summary": "fix null check in the login handler", "files_changed": ["src/auth.rs"], "diff": "--- a\n+++ b"}
```"#;

const AUDIT_APPROVE: &str = r#"{"verdict": "APPROVE", "security_score": 9}"#;
const AUDIT_REVISE: &str = r#"{"verdict": "REVISE", "security_score": 6, "risks": [{"severity": "MEDIUM", "file": "src/auth.rs", "issue": "missing error propagation on the fallback path"}]}"#;
const AUDIT_REJECT: &str = r#"{"verdict": "REJECT", "security_score": 1, "risks": [{"severity": "CRITICAL", "file": "src/auth.rs", "issue": "auth bypass when the header is empty"}]}"#;
const STAMP_OK: &str = r#"{"verdict": "APPROVE", "score": 8}"#;
const STAMP_ESCALATE: &str =
    r#"{"verdict": "APPROVE", "score": 7, "requires_escalation": true}"#;

struct Harness {
    supervisor: DualEngineSupervisor,
    stub: Arc<StubBackend>,
    escalator: Arc<RetryEscalator>,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    harness_in(tmp)
}

fn harness_in(tmp: tempfile::TempDir) -> Harness {
    let stub = Arc::new(StubBackend::new("stub"));
    let mut router = BackendRouter::new();
    router.register(stub.clone());

    let counters = Arc::new(RuntimeCounters::new());
    let log = Arc::new(log_in(tmp.path(), &counters));
    let escalator = Arc::new(RetryEscalator::new());

    let supervisor = DualEngineSupervisor::new(
        Arc::new(router),
        Arc::new(PersonaRegistry::builtin()),
        escalator.clone(),
        log,
        Arc::new(TruncatingCompactor::default()),
        counters,
        SupervisorConfig::default(),
    );

    Harness {
        supervisor,
        stub,
        escalator,
        _tmp: tmp,
    }
}

fn log_in(path: &Path, counters: &Arc<RuntimeCounters>) -> EventLog {
    EventLog::open(path, 10_000, Arc::clone(counters)).unwrap()
}

fn coder_job() -> Job {
    Job::new(Uuid::new_v4(), Role::Coder, Mode::Worker, "implement fn X")
}

#[tokio::test]
async fn happy_path_write_audit_stamp() {
    let h = harness();
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_OK);

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();

    match outcome {
        SupervisorOutcome::Completed(work) => {
            assert_eq!(work.rewrites, 0);
            assert!(!work.role_switched);
            assert!(!work.degraded_parse);
            assert!(work.stamp.is_some());
            assert!(!work.stamp.unwrap().requires_escalation);
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(h.stub.remaining(), 0);
}

#[tokio::test]
async fn short_diff_self_repairs_then_completes() {
    let h = harness();
    h.stub.push_text(CODER_SHORT_DIFF);
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_OK);

    let job = coder_job();
    let outcome = h
        .supervisor
        .run(&job, &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SupervisorOutcome::Completed(_)));

    // The signature for that failure climbed exactly one rung.
    let signature = FailureSignature::new(
        "FIELD_TOO_SHORT",
        vec!["diff".into()],
        Role::Coder,
        &job.payload,
    );
    assert_eq!(
        h.escalator.level_of(&signature),
        Some(EscalationLevel::SelfRepair)
    );
}

#[tokio::test]
async fn same_failure_twice_switches_profile() {
    let h = harness();
    h.stub.push_text(CODER_SHORT_DIFF);
    h.stub.push_text(CODER_SHORT_DIFF);
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_OK);

    let job = coder_job();
    let outcome = h
        .supervisor
        .run(&job, &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Completed(work) => assert!(work.role_switched),
        other => panic!("expected completion, got {other:?}"),
    }

    let signature = FailureSignature::new(
        "FIELD_TOO_SHORT",
        vec!["diff".into()],
        Role::Coder,
        &job.payload,
    );
    assert_eq!(
        h.escalator.level_of(&signature),
        Some(EscalationLevel::RoleSwitch)
    );
}

#[tokio::test]
async fn same_failure_three_times_hard_fails() {
    let h = harness();
    for _ in 0..3 {
        h.stub.push_text(CODER_SHORT_DIFF);
    }

    let job = coder_job();
    let outcome = h
        .supervisor
        .run(&job, &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Blocked { reason, .. } => {
            assert!(reason.contains("repeated"), "unexpected reason: {reason}");
        }
        other => panic!("expected blocked, got {other:?}"),
    }

    let signature = FailureSignature::new(
        "FIELD_TOO_SHORT",
        vec!["diff".into()],
        Role::Coder,
        &job.payload,
    );
    assert_eq!(
        h.escalator.level_of(&signature),
        Some(EscalationLevel::HardFail)
    );
}

#[tokio::test]
async fn audit_revise_loops_back_to_writer() {
    let h = harness();
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_REVISE);
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_OK);

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Completed(work) => assert_eq!(work.rewrites, 1),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn rewrite_budget_exhaustion_blocks() {
    let h = harness();
    // max_rewrites = 3: the fourth REVISE trips the budget.
    for _ in 0..4 {
        h.stub.push_text(CODER_OK);
        h.stub.push_text(AUDIT_REVISE);
    }

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Blocked { reason, .. } => {
            assert!(reason.contains("rewrite budget"), "unexpected reason: {reason}");
        }
        other => panic!("expected blocked, got {other:?}"),
    }
}

#[tokio::test]
async fn audit_reject_blocks_immediately() {
    let h = harness();
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_REJECT);

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Blocked { reason, .. } => {
            assert!(reason.contains("rejected"), "unexpected reason: {reason}");
        }
        other => panic!("expected blocked, got {other:?}"),
    }
    // The stamp never ran.
    assert_eq!(h.stub.remaining(), 0);
}

#[tokio::test]
async fn transient_timeout_self_repairs() {
    let h = harness();
    h.stub.push_error(BackendError::Timeout);
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_OK);

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SupervisorOutcome::Completed(_)));
}

#[tokio::test]
async fn context_overflow_compacts_and_retries_once() {
    let h = harness();
    h.stub.push_error(BackendError::ContextOverflow);
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_OK);

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    assert!(matches!(outcome, SupervisorOutcome::Completed(_)));
}

#[tokio::test]
async fn cancellation_aborts_before_the_first_stage() {
    let h = harness();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let outcome = h
        .supervisor
        .run(&coder_job(), &cancel, None)
        .await
        .unwrap();
    assert!(matches!(outcome, SupervisorOutcome::Cancelled { .. }));
    // No backend call was made.
    assert_eq!(h.stub.remaining(), 0);
}

#[tokio::test]
async fn binding_stamp_escalation_flag_is_surfaced() {
    let h = harness();
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text(STAMP_ESCALATE);

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Completed(work) => {
            assert!(work.stamp.unwrap().requires_escalation);
        }
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn broken_stamp_is_advisory_only() {
    let h = harness();
    h.stub.push_text(CODER_OK);
    h.stub.push_text(AUDIT_APPROVE);
    h.stub.push_text("not json at all, and no verdict token either");

    let outcome = h
        .supervisor
        .run(&coder_job(), &CancelFlag::new(), None)
        .await
        .unwrap();
    match outcome {
        SupervisorOutcome::Completed(work) => assert!(work.stamp.is_none()),
        other => panic!("expected completion, got {other:?}"),
    }
}
