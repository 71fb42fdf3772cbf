use fm_core::types::{Priority, Role};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Normalized review outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approve,
    Revise,
    Reject,
}

/// QA test outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestVerdict {
    Pass,
    Fail,
    Skip,
}

/// Stamp outcome: approve or reject only, no middle ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StampVerdict {
    Approve,
    Reject,
}

/// The two equivalence classes every verdict token collapses into for
/// routing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictClass {
    Approve,
    Revise,
}

/// Collapse a raw verdict token into its equivalence class.
///
/// APPROVE/SHIP/DONE/PASS are approve-equivalent; REJECT/REVISE/HOLD/
/// NEED_INFO/FAIL are revise-equivalent. Unknown tokens map to nothing.
pub fn classify_verdict_token(token: &str) -> Option<VerdictClass> {
    match token.trim().to_ascii_uppercase().as_str() {
        "APPROVE" | "SHIP" | "DONE" | "PASS" => Some(VerdictClass::Approve),
        "REJECT" | "REVISE" | "HOLD" | "NEED_INFO" | "FAIL" => Some(VerdictClass::Revise),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Per-role outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoderOutput {
    pub summary: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub diff: String,
    #[serde(default)]
    pub todo_next: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    pub result: TestVerdict,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaOutput {
    pub verdict: TestVerdict,
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default)]
    pub coverage: Option<String>,
    #[serde(default)]
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskSeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Risk {
    pub severity: RiskSeverity,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub issue: String,
    #[serde(default)]
    pub fix_suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewerOutput {
    pub verdict: Verdict,
    #[serde(default)]
    pub risks: Vec<Risk>,
    pub security_score: i64,
    #[serde(default)]
    pub approved_files: Vec<String>,
    #[serde(default)]
    pub blocked_files: Vec<String>,
}

/// One successor job the PM wants dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub agent: Role,
    pub instruction: String,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PmAction {
    Dispatch,
    Retry,
    Blocked,
    Escalate,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmOutput {
    pub action: PmAction,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    pub summary: String,
    #[serde(default)]
    pub requires_escalation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EffortLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyOption {
    pub name: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    pub effort: EffortLevel,
    pub risk: EffortLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategistOutput {
    pub problem_summary: String,
    pub options: Vec<StrategyOption>,
    pub recommendation: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalystOutput {
    pub summary: String,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearcherOutput {
    pub summary: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub findings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcavatorOutput {
    #[serde(default)]
    pub explicit: Vec<String>,
    #[serde(default)]
    pub implicit: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilOutput {
    pub score: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StampOutput {
    pub verdict: StampVerdict,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub blocking_issues: Vec<String>,
    #[serde(default)]
    pub requires_escalation: bool,
}

// ---------------------------------------------------------------------------
// AgentOutput
// ---------------------------------------------------------------------------

/// The typed result of one role invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum AgentOutput {
    Pm(PmOutput),
    Excavator(ExcavatorOutput),
    Strategist(StrategistOutput),
    Coder(CoderOutput),
    Qa(QaOutput),
    Reviewer(ReviewerOutput),
    Researcher(ResearcherOutput),
    Analyst(AnalystOutput),
    Stamp(StampOutput),
    Council(CouncilOutput),
}

impl AgentOutput {
    pub fn role(&self) -> Role {
        match self {
            AgentOutput::Pm(_) => Role::Pm,
            AgentOutput::Excavator(_) => Role::Excavator,
            AgentOutput::Strategist(_) => Role::Strategist,
            AgentOutput::Coder(_) => Role::Coder,
            AgentOutput::Qa(_) => Role::Qa,
            AgentOutput::Reviewer(_) => Role::Reviewer,
            AgentOutput::Researcher(_) => Role::Researcher,
            AgentOutput::Analyst(_) => Role::Analyst,
            AgentOutput::Stamp(_) => Role::Stamp,
            AgentOutput::Council(_) => Role::Council,
        }
    }

    /// The routing class of this output's verdict, for roles that carry one.
    pub fn verdict_class(&self) -> Option<VerdictClass> {
        match self {
            AgentOutput::Qa(out) => Some(match out.verdict {
                TestVerdict::Pass => VerdictClass::Approve,
                TestVerdict::Fail | TestVerdict::Skip => VerdictClass::Revise,
            }),
            AgentOutput::Reviewer(out) => Some(match out.verdict {
                Verdict::Approve => VerdictClass::Approve,
                Verdict::Revise | Verdict::Reject => VerdictClass::Revise,
            }),
            AgentOutput::Stamp(out) => Some(match out.verdict {
                StampVerdict::Approve => VerdictClass::Approve,
                StampVerdict::Reject => VerdictClass::Revise,
            }),
            _ => None,
        }
    }
}

/// Fields the contract expects for each role's output, used both for
/// key-intersection extraction and for missing-field reporting.
pub fn expected_fields(role: Role) -> &'static [&'static str] {
    match role {
        Role::Pm => &["action", "tasks", "summary", "requires_escalation"],
        Role::Excavator => &["explicit", "implicit", "confidence", "questions"],
        Role::Strategist => &["problem_summary", "options", "recommendation", "reasoning"],
        Role::Coder => &["summary", "files_changed", "diff", "todo_next"],
        Role::Qa => &["verdict", "tests", "coverage", "issues"],
        Role::Reviewer => &[
            "verdict",
            "risks",
            "security_score",
            "approved_files",
            "blocked_files",
        ],
        Role::Researcher => &["summary", "sources", "findings"],
        Role::Analyst => &["summary", "insights", "recommendations"],
        Role::Stamp => &["verdict", "score", "blocking_issues", "requires_escalation"],
        Role::Council => &["score", "reasoning"],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_tokens_collapse_into_two_classes() {
        for token in ["APPROVE", "SHIP", "DONE", "PASS", "pass", " ship "] {
            assert_eq!(classify_verdict_token(token), Some(VerdictClass::Approve));
        }
        for token in ["REJECT", "REVISE", "HOLD", "NEED_INFO", "FAIL", "fail"] {
            assert_eq!(classify_verdict_token(token), Some(VerdictClass::Revise));
        }
        assert_eq!(classify_verdict_token("MAYBE"), None);
    }

    #[test]
    fn agent_output_serde_round_trip_every_role() {
        let outputs = vec![
            AgentOutput::Pm(PmOutput {
                action: PmAction::Done,
                tasks: vec![],
                summary: "finished".into(),
                requires_escalation: false,
            }),
            AgentOutput::Excavator(ExcavatorOutput {
                explicit: vec!["add retry".into()],
                implicit: vec![],
                confidence: 0.9,
                questions: vec![],
            }),
            AgentOutput::Strategist(StrategistOutput {
                problem_summary: "auth refactor".into(),
                options: vec![StrategyOption {
                    name: "jwt".into(),
                    pros: vec!["scales".into()],
                    cons: vec![],
                    effort: EffortLevel::Medium,
                    risk: EffortLevel::Low,
                }],
                recommendation: "jwt".into(),
                reasoning: "scales best".into(),
            }),
            AgentOutput::Coder(CoderOutput {
                summary: "fix login handler".into(),
                files_changed: vec!["src/auth.rs".into()],
                diff: "--- a/src/auth.rs\n+++ b/src/auth.rs\n@@ -1 +1 @@\n-a\n+b".into(),
                todo_next: None,
            }),
            AgentOutput::Qa(QaOutput {
                verdict: TestVerdict::Pass,
                tests: vec![TestCase {
                    name: "login_ok".into(),
                    result: TestVerdict::Pass,
                    reason: None,
                }],
                coverage: Some("85%".into()),
                issues: vec![],
            }),
            AgentOutput::Reviewer(ReviewerOutput {
                verdict: Verdict::Approve,
                risks: vec![],
                security_score: 9,
                approved_files: vec!["src/auth.rs".into()],
                blocked_files: vec![],
            }),
            AgentOutput::Researcher(ResearcherOutput {
                summary: "found docs".into(),
                sources: vec!["https://example.com".into()],
                findings: vec![],
            }),
            AgentOutput::Analyst(AnalystOutput {
                summary: "error rate stable".into(),
                insights: vec![],
                recommendations: vec![],
            }),
            AgentOutput::Stamp(StampOutput {
                verdict: StampVerdict::Approve,
                score: Some(8.0),
                blocking_issues: vec![],
                requires_escalation: false,
            }),
            AgentOutput::Council(CouncilOutput {
                score: 7.5,
                reasoning: "solid but untested edge cases".into(),
            }),
        ];

        for output in outputs {
            let json = serde_json::to_string(&output).unwrap();
            let back: AgentOutput = serde_json::from_str(&json).unwrap();
            assert_eq!(back.role(), output.role());
        }
    }

    #[test]
    fn verdict_class_routes_by_role() {
        let qa = AgentOutput::Qa(QaOutput {
            verdict: TestVerdict::Fail,
            tests: vec![],
            coverage: None,
            issues: vec!["panic on empty input".into()],
        });
        assert_eq!(qa.verdict_class(), Some(VerdictClass::Revise));

        let coder = AgentOutput::Coder(CoderOutput {
            summary: "add input validation to parser".into(),
            files_changed: vec!["src/parse.rs".into()],
            diff: "--- a\n+++ b\n@@ -1 +1 @@".into(),
            todo_next: None,
        });
        assert_eq!(coder.verdict_class(), None);
    }

    #[test]
    fn expected_fields_cover_every_role() {
        for role in [
            Role::Pm,
            Role::Excavator,
            Role::Strategist,
            Role::Coder,
            Role::Qa,
            Role::Reviewer,
            Role::Researcher,
            Role::Analyst,
            Role::Stamp,
            Role::Council,
        ] {
            assert!(!expected_fields(role).is_empty());
        }
    }
}
