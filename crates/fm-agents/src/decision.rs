use fm_contract::guard::is_blacklisted;
use fm_contract::outputs::{PmAction, PmOutput, TaskSpec};
use fm_core::types::Role;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Summaries are log-only and capped hard at this length.
const SUMMARY_MAX: usize = 100;

// ---------------------------------------------------------------------------
// PipelineAction
// ---------------------------------------------------------------------------

/// The pipeline-level transitions a PM decision can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineAction {
    Dispatch,
    Retry,
    Blocked,
    Escalate,
    Done,
}

impl PipelineAction {
    /// The fixed transition graph. DONE is terminal.
    pub fn can_transition_to(&self, target: &PipelineAction) -> bool {
        matches!(
            (self, target),
            (PipelineAction::Dispatch, PipelineAction::Retry)
                | (PipelineAction::Dispatch, PipelineAction::Done)
                | (PipelineAction::Dispatch, PipelineAction::Blocked)
                | (PipelineAction::Retry, PipelineAction::Dispatch)
                | (PipelineAction::Retry, PipelineAction::Blocked)
                | (PipelineAction::Blocked, PipelineAction::Escalate)
                | (PipelineAction::Escalate, PipelineAction::Done)
        )
    }
}

impl std::fmt::Display for PipelineAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PipelineAction::Dispatch => "DISPATCH",
            PipelineAction::Retry => "RETRY",
            PipelineAction::Blocked => "BLOCKED",
            PipelineAction::Escalate => "ESCALATE",
            PipelineAction::Done => "DONE",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: PipelineAction,
        to: PipelineAction,
    },
}

impl DecisionError {
    pub fn error_kind(&self) -> &'static str {
        "INVALID_TRANSITION"
    }
}

/// Check a `(from, to)` pair against the allowed set.
pub fn validate_transition(
    from: PipelineAction,
    to: PipelineAction,
) -> Result<(), DecisionError> {
    if from.can_transition_to(&to) {
        Ok(())
    } else {
        Err(DecisionError::InvalidTransition { from, to })
    }
}

// ---------------------------------------------------------------------------
// EscalationReason
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Deploy,
    ApiKey,
    Payment,
    DataDelete,
    Dependency,
    Security,
    None,
}

/// Keyword dictionary for escalation detection. Bilingual, matched
/// case-insensitively over the summary and task instructions.
const ESCALATION_KEYWORDS: &[(EscalationReason, &[&str])] = &[
    (
        EscalationReason::Deploy,
        &["deploy", "production", "release", "rollout", "배포", "운영", "릴리즈"],
    ),
    (
        EscalationReason::ApiKey,
        &["api key", "api_key", "apikey", "credential", "token", "토큰", "인증키"],
    ),
    (
        EscalationReason::Payment,
        &["payment", "billing", "invoice", "결제", "요금"],
    ),
    (
        EscalationReason::DataDelete,
        &["delete", "drop table", "truncate", "wipe", "삭제"],
    ),
    (
        EscalationReason::Dependency,
        &["cargo add", "pip install", "npm install", "dependency", "의존성", "패키지 추가"],
    ),
    (
        EscalationReason::Security,
        &["security", "auth", "permission", "vulnerability", "보안", "권한"],
    ),
];

/// Scan free text for an escalation trigger.
pub fn detect_escalation(text: &str) -> Option<EscalationReason> {
    let lower = text.to_lowercase();
    for (reason, keywords) in ESCALATION_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            return Some(*reason);
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Role inference
// ---------------------------------------------------------------------------

const ROLE_KEYWORDS: &[(Role, &[&str])] = &[
    (
        Role::Coder,
        &["implement", "fix", "refactor", "bug", "code", "구현", "수정", "버그", "코드"],
    ),
    (
        Role::Qa,
        &["test", "verify", "reproduce", "qa", "테스트", "검증", "재현"],
    ),
    (
        Role::Reviewer,
        &["review", "approve", "audit", "리뷰", "검토"],
    ),
    (
        Role::Strategist,
        &["strategy", "architecture", "design", "plan", "전략", "설계", "아키텍처"],
    ),
    (
        Role::Analyst,
        &["log", "metric", "summarize", "analyse", "analyze", "로그", "요약", "통계"],
    ),
    (
        Role::Researcher,
        &["search", "research", "documentation", "latest", "검색", "리서치", "문서"],
    ),
    (
        Role::Excavator,
        &["requirement", "unclear", "clarify", "ambiguous", "요구사항", "불명확"],
    ),
];

/// Infer the best-fitting role for a free-text request, for PM-less direct
/// routing. Returns `None` when nothing scores.
pub fn infer_role_from_prompt(prompt: &str) -> Option<Role> {
    let lower = prompt.to_lowercase();
    ROLE_KEYWORDS
        .iter()
        .map(|(role, keywords)| {
            let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
            (*role, score)
        })
        .filter(|(_, score)| *score > 0)
        .max_by_key(|(_, score)| *score)
        .map(|(role, _)| role)
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The normalized result of one PM output. `summary` and `confidence` are
/// log metadata; `action` is the transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub action: PipelineAction,
    pub tasks: Vec<TaskSpec>,
    pub summary: String,
    pub reason: EscalationReason,
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// DecisionMachine
// ---------------------------------------------------------------------------

/// Converts a parsed PM output into the pipeline's next transition.
///
/// The PM's prose carries no authority: the summary is validated but only
/// affects confidence, never routing. Escalation keywords override the
/// stated action outright.
#[derive(Debug, Default)]
pub struct DecisionMachine;

impl DecisionMachine {
    pub fn new() -> Self {
        Self
    }

    pub fn process(&self, pm: &PmOutput) -> Decision {
        let mut confidence = 1.0;
        if let Some(pattern) = is_blacklisted(&pm.summary) {
            debug!(pattern, "vacuous PM summary, halving confidence");
            confidence = 0.5;
        }
        let summary = truncate(&pm.summary, SUMMARY_MAX);

        // CEO-required conditions always escalate, whatever the PM said.
        let mut scan_text = pm.summary.clone();
        for task in &pm.tasks {
            scan_text.push(' ');
            scan_text.push_str(&task.instruction);
            if let Some(ctx) = &task.context {
                scan_text.push(' ');
                scan_text.push_str(ctx);
            }
        }
        let detected = detect_escalation(&scan_text);
        if pm.action == PmAction::Escalate || pm.requires_escalation || detected.is_some() {
            if pm.action != PmAction::Escalate {
                warn!(reason = ?detected, "overriding PM action to ESCALATE");
            }
            return Decision {
                action: PipelineAction::Escalate,
                tasks: Vec::new(),
                summary,
                reason: detected.unwrap_or(EscalationReason::None),
                confidence,
            };
        }

        match pm.action {
            PmAction::Dispatch => {
                let tasks: Vec<TaskSpec> = pm
                    .tasks
                    .iter()
                    .filter(|t| t.agent.dispatchable_from_pm())
                    .cloned()
                    .collect();
                if tasks.is_empty() {
                    // DISPATCH with nothing dispatchable is not a decision.
                    return Decision {
                        action: PipelineAction::Blocked,
                        tasks: Vec::new(),
                        summary: "DISPATCH without dispatchable tasks".into(),
                        reason: EscalationReason::None,
                        confidence: 0.0,
                    };
                }
                Decision {
                    action: PipelineAction::Dispatch,
                    tasks,
                    summary,
                    reason: EscalationReason::None,
                    confidence,
                }
            }
            PmAction::Done => {
                if pm.summary.trim().is_empty() {
                    return Decision {
                        action: PipelineAction::Blocked,
                        tasks: Vec::new(),
                        summary: "DONE without a summary".into(),
                        reason: EscalationReason::None,
                        confidence: 0.0,
                    };
                }
                Decision {
                    action: PipelineAction::Done,
                    tasks: Vec::new(),
                    summary,
                    reason: EscalationReason::None,
                    confidence,
                }
            }
            PmAction::Retry => Decision {
                action: PipelineAction::Retry,
                tasks: Vec::new(),
                summary,
                reason: EscalationReason::None,
                confidence,
            },
            PmAction::Blocked => Decision {
                action: PipelineAction::Blocked,
                tasks: Vec::new(),
                summary,
                reason: EscalationReason::None,
                confidence,
            },
            // Handled above; kept for exhaustiveness.
            PmAction::Escalate => Decision {
                action: PipelineAction::Escalate,
                tasks: Vec::new(),
                summary,
                reason: EscalationReason::None,
                confidence,
            },
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::Priority;

    fn task(agent: Role, instruction: &str) -> TaskSpec {
        TaskSpec {
            agent,
            instruction: instruction.into(),
            context: None,
            priority: Priority::Medium,
        }
    }

    fn pm(action: PmAction, tasks: Vec<TaskSpec>, summary: &str) -> PmOutput {
        PmOutput {
            action,
            tasks,
            summary: summary.into(),
            requires_escalation: false,
        }
    }

    #[test]
    fn allowed_transition_graph() {
        use PipelineAction::*;
        assert!(Dispatch.can_transition_to(&Retry));
        assert!(Dispatch.can_transition_to(&Done));
        assert!(Dispatch.can_transition_to(&Blocked));
        assert!(Retry.can_transition_to(&Dispatch));
        assert!(Retry.can_transition_to(&Blocked));
        assert!(Blocked.can_transition_to(&Escalate));
        assert!(Escalate.can_transition_to(&Done));
    }

    #[test]
    fn forbidden_transitions_rejected() {
        use PipelineAction::*;
        for (from, to) in [
            (Dispatch, Escalate),
            (Retry, Escalate),
            (Blocked, Dispatch),
            (Done, Retry),
            (Done, Dispatch),
        ] {
            let err = validate_transition(from, to).unwrap_err();
            assert_eq!(err.error_kind(), "INVALID_TRANSITION");
        }
    }

    #[test]
    fn dispatch_with_valid_tasks_passes_through() {
        let out = DecisionMachine::new().process(&pm(
            PmAction::Dispatch,
            vec![task(Role::Coder, "implement the parser")],
            "handing to coder",
        ));
        assert_eq!(out.action, PipelineAction::Dispatch);
        assert_eq!(out.tasks.len(), 1);
        assert!((out.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn dispatch_without_tasks_is_blocked() {
        let out =
            DecisionMachine::new().process(&pm(PmAction::Dispatch, vec![], "dispatching nothing"));
        assert_eq!(out.action, PipelineAction::Blocked);
        assert_eq!(out.confidence, 0.0);
    }

    #[test]
    fn dispatch_filters_non_dispatchable_roles() {
        let out = DecisionMachine::new().process(&pm(
            PmAction::Dispatch,
            vec![task(Role::Stamp, "stamp it"), task(Role::Qa, "run the tests")],
            "mixed targets",
        ));
        assert_eq!(out.action, PipelineAction::Dispatch);
        assert_eq!(out.tasks.len(), 1);
        assert_eq!(out.tasks[0].agent, Role::Qa);
    }

    #[test]
    fn done_requires_summary() {
        let out = DecisionMachine::new().process(&pm(PmAction::Done, vec![], "   "));
        assert_eq!(out.action, PipelineAction::Blocked);
    }

    #[test]
    fn deploy_keyword_overrides_stated_action() {
        let out = DecisionMachine::new().process(&pm(
            PmAction::Done,
            vec![],
            "wrap up and deploy production",
        ));
        assert_eq!(out.action, PipelineAction::Escalate);
        assert_eq!(out.reason, EscalationReason::Deploy);
    }

    #[test]
    fn keywords_in_task_instructions_also_trigger() {
        let out = DecisionMachine::new().process(&pm(
            PmAction::Dispatch,
            vec![task(Role::Coder, "run pip install requests then wire it up")],
            "small dependency task",
        ));
        assert_eq!(out.action, PipelineAction::Escalate);
        assert_eq!(out.reason, EscalationReason::Dependency);
    }

    #[test]
    fn escalate_without_keyword_gets_reason_none() {
        let out = DecisionMachine::new().process(&pm(
            PmAction::Escalate,
            vec![],
            "operator intervention needed",
        ));
        assert_eq!(out.action, PipelineAction::Escalate);
        assert_eq!(out.reason, EscalationReason::None);
    }

    #[test]
    fn requires_escalation_flag_forces_escalate() {
        let mut output = pm(PmAction::Done, vec![], "all finished");
        output.requires_escalation = true;
        let out = DecisionMachine::new().process(&output);
        assert_eq!(out.action, PipelineAction::Escalate);
    }

    #[test]
    fn blacklisted_summary_halves_confidence_only() {
        let out = DecisionMachine::new().process(&pm(
            PmAction::Dispatch,
            vec![task(Role::Coder, "implement retry backoff in the client")],
            "looks good, will proceed",
        ));
        // Confidence drops but routing is untouched.
        assert_eq!(out.action, PipelineAction::Dispatch);
        assert!((out.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn summary_is_truncated_to_one_hundred_chars() {
        let long = "x".repeat(300);
        let out = DecisionMachine::new().process(&pm(PmAction::Done, vec![], &long));
        assert_eq!(out.summary.chars().count(), 100);
    }

    #[test]
    fn role_inference_scores_keywords() {
        assert_eq!(
            infer_role_from_prompt("fix the login bug in the code"),
            Some(Role::Coder)
        );
        assert_eq!(
            infer_role_from_prompt("please review and approve this change"),
            Some(Role::Reviewer)
        );
        assert_eq!(infer_role_from_prompt("완전히 불명확한 요구사항"), Some(Role::Excavator));
        assert_eq!(infer_role_from_prompt("hello there"), None);
    }
}
