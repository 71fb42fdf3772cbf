use std::sync::LazyLock;

use regex::Regex;

use crate::outputs::{AgentOutput, TestVerdict, Verdict};

// ---------------------------------------------------------------------------
// Blacklist and token patterns
// ---------------------------------------------------------------------------

/// Phrases that pass every schema check while saying nothing. Bilingual:
/// the upstream fleet mixes English and Korean completions.
const NULL_PATTERNS: &[&str] = &[
    r"(?i)I have reviewed",
    r"(?i)I checked",
    r"(?i)looks good",
    r"(?i)no issues",
    r"(?i)seems fine",
    r"(?i)everything is fine",
    r"(?i)no problems found",
    r"(?i)will proceed",
    r"검토했습니다",
    r"확인했습니다",
    r"문제.*없습니다",
    r"이상.*없음",
    r"정상.*처리",
    r"완료.*되었습니다",
    r"진행.*하겠습니다",
    r"살펴보겠습니다",
];

/// A coder summary must contain at least one action verb...
const VERB_PATTERNS: &[&str] = &[
    r"(?i)fix",
    r"(?i)add",
    r"(?i)remove",
    r"(?i)update",
    r"(?i)create",
    r"(?i)implement",
    r"(?i)refactor",
    r"(?i)rename",
    r"(?i)extract",
    r"수정",
    r"추가",
    r"삭제",
    r"변경",
    r"생성",
    r"구현",
    r"적용",
    r"리팩토링",
    r"개선",
];

/// ...and at least one concrete subject it acted on.
const TARGET_PATTERNS: &[&str] = &[
    r"(?i)file",
    r"(?i)function",
    r"(?i)class",
    r"(?i)method",
    r"(?i)module",
    r"(?i)struct",
    r"(?i)trait",
    r"(?i)endpoint",
    r"(?i)route",
    r"(?i)handler",
    r"(?i)test",
    r"(?i)\.rs\b",
    r"(?i)\.py\b",
    r"(?i)\.ts\b",
    r"(?i)\.json\b",
    r"파일",
    r"함수",
    r"클래스",
    r"메서드",
    r"모듈",
    r"테스트",
];

static COMPILED_NULL: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(NULL_PATTERNS));
static COMPILED_VERBS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(VERB_PATTERNS));
static COMPILED_TARGETS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(TARGET_PATTERNS));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("guard pattern must compile"))
        .collect()
}

const CODER_SUMMARY_MIN: usize = 10;
const CODER_DIFF_MIN: usize = 20;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The output matched a vacuous-completion pattern.
    #[error("semantic null in '{field}': matched \"{pattern}\"")]
    SemanticNull { field: String, pattern: String },

    #[error("field '{field}' too short (minimum {min} chars)")]
    FieldTooShort { field: String, min: usize },

    #[error("field '{field}' invalid: {detail}")]
    InvalidValue { field: String, detail: String },
}

impl GuardError {
    /// Stable kind string used when building failure signatures.
    pub fn error_kind(&self) -> &'static str {
        match self {
            GuardError::SemanticNull { .. } => "SEMANTIC_NULL",
            GuardError::FieldTooShort { .. } => "FIELD_TOO_SHORT",
            GuardError::InvalidValue { .. } => "INVALID_VALUE",
        }
    }

    /// The offending field, for failure-signature grouping.
    pub fn field(&self) -> &str {
        match self {
            GuardError::SemanticNull { field, .. }
            | GuardError::FieldTooShort { field, .. }
            | GuardError::InvalidValue { field, .. } => field,
        }
    }
}

pub type Result<T> = std::result::Result<T, GuardError>;

// ---------------------------------------------------------------------------
// SemanticGuard
// ---------------------------------------------------------------------------

/// Code-based meaning checks, no model in the loop.
///
/// Rejects outputs that clear the schema but are semantically empty: a
/// blacklist of boilerplate phrases over primary content fields, plus
/// per-role minimums on the fields that carry the actual work.
#[derive(Debug, Default)]
pub struct SemanticGuard;

impl SemanticGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, output: &AgentOutput) -> Result<()> {
        match output {
            AgentOutput::Coder(out) => {
                check_null("summary", &out.summary)?;
                if out.summary.trim().chars().count() < CODER_SUMMARY_MIN {
                    return Err(GuardError::FieldTooShort {
                        field: "summary".into(),
                        min: CODER_SUMMARY_MIN,
                    });
                }
                if !matches_any(&COMPILED_VERBS, &out.summary) {
                    return Err(GuardError::InvalidValue {
                        field: "summary".into(),
                        detail: "no action verb".into(),
                    });
                }
                if !matches_any(&COMPILED_TARGETS, &out.summary) {
                    return Err(GuardError::InvalidValue {
                        field: "summary".into(),
                        detail: "no subject the change acted on".into(),
                    });
                }
                if out.diff.trim().len() < CODER_DIFF_MIN {
                    return Err(GuardError::FieldTooShort {
                        field: "diff".into(),
                        min: CODER_DIFF_MIN,
                    });
                }
                if !is_unified_diff(&out.diff) {
                    return Err(GuardError::InvalidValue {
                        field: "diff".into(),
                        detail: "does not begin with a unified diff header".into(),
                    });
                }
                if !out.diff.trim().is_empty() && out.files_changed.is_empty() {
                    return Err(GuardError::InvalidValue {
                        field: "files_changed".into(),
                        detail: "empty while diff is non-empty".into(),
                    });
                }
                Ok(())
            }
            AgentOutput::Qa(out) => {
                if out.verdict == TestVerdict::Pass && out.tests.is_empty() {
                    return Err(GuardError::InvalidValue {
                        field: "tests".into(),
                        detail: "PASS verdict with no test evidence".into(),
                    });
                }
                for issue in &out.issues {
                    check_null("issues", issue)?;
                }
                Ok(())
            }
            AgentOutput::Reviewer(out) => {
                if !(0..=10).contains(&out.security_score) {
                    return Err(GuardError::InvalidValue {
                        field: "security_score".into(),
                        detail: format!("{} outside 0..=10", out.security_score),
                    });
                }
                if out.verdict == Verdict::Reject && out.risks.is_empty() {
                    return Err(GuardError::InvalidValue {
                        field: "risks".into(),
                        detail: "REJECT verdict without a single named risk".into(),
                    });
                }
                for risk in &out.risks {
                    check_null("risks", &risk.issue)?;
                }
                Ok(())
            }
            AgentOutput::Pm(out) => check_null("summary", &out.summary),
            AgentOutput::Strategist(out) => {
                check_null("problem_summary", &out.problem_summary)?;
                check_null("reasoning", &out.reasoning)
            }
            AgentOutput::Analyst(out) => check_null("summary", &out.summary),
            AgentOutput::Researcher(out) => check_null("summary", &out.summary),
            AgentOutput::Excavator(out) => {
                if !(0.0..=1.0).contains(&out.confidence) {
                    return Err(GuardError::InvalidValue {
                        field: "confidence".into(),
                        detail: format!("{} outside 0.0..=1.0", out.confidence),
                    });
                }
                Ok(())
            }
            AgentOutput::Council(out) => {
                if !(0.0..=10.0).contains(&out.score) {
                    return Err(GuardError::InvalidValue {
                        field: "score".into(),
                        detail: format!("{} outside 0.0..=10.0", out.score),
                    });
                }
                check_null("reasoning", &out.reasoning)
            }
            AgentOutput::Stamp(out) => {
                if let Some(score) = out.score {
                    if !(0.0..=10.0).contains(&score) {
                        return Err(GuardError::InvalidValue {
                            field: "score".into(),
                            detail: format!("{score} outside 0.0..=10.0"),
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

/// Check whether a summary-like string matches the vacuous-phrase blacklist.
/// Exposed so the decision machine can reuse it for confidence scoring.
pub fn is_blacklisted(text: &str) -> Option<&'static str> {
    for (regex, pattern) in COMPILED_NULL.iter().zip(NULL_PATTERNS) {
        if regex.is_match(text) {
            return Some(pattern);
        }
    }
    None
}

fn check_null(field: &str, text: &str) -> Result<()> {
    if let Some(pattern) = is_blacklisted(text) {
        return Err(GuardError::SemanticNull {
            field: field.into(),
            pattern: pattern.into(),
        });
    }
    Ok(())
}

fn matches_any(regexes: &[Regex], text: &str) -> bool {
    regexes.iter().any(|r| r.is_match(text))
}

/// A diff must open with a unified-diff header line.
fn is_unified_diff(diff: &str) -> bool {
    let first = diff.trim_start().lines().next().unwrap_or("");
    first.starts_with("--- ") || first.starts_with("diff --git") || first.starts_with("@@ ")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
