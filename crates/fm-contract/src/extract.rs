use std::sync::LazyLock;

use fm_core::types::Role;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::outputs::{self, AgentOutput, StampOutput, StampVerdict, TestVerdict, Verdict};

// Compile once; the fence body is matched lazily so only the first block wins.
static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)```").unwrap());

/// How many trailing bytes the degraded verdict scan looks at.
const VERDICT_SCAN_WINDOW: usize = 512;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// No parseable, schema-valid object could be recovered from the
    /// completion.
    #[error("contract parse failed for {role}: {reason}")]
    Parse {
        role: Role,
        reason: String,
        missing_fields: Vec<String>,
    },
}

impl ContractError {
    /// Stable kind string used when building failure signatures.
    pub fn error_kind(&self) -> &'static str {
        "JSON_PARSE"
    }

    pub fn missing_fields(&self) -> &[String] {
        match self {
            ContractError::Parse { missing_fields, .. } => missing_fields,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContractError>;

// ---------------------------------------------------------------------------
// ParsedOutput
// ---------------------------------------------------------------------------

/// A typed output plus how it was recovered.
#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub output: AgentOutput,
    /// `true` when the output was synthesized from a bare verdict token
    /// because no JSON could be extracted.
    pub degraded: bool,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Convert a raw model completion into a typed [`AgentOutput`] for `role`.
///
/// Extraction order: a ```json fenced block, then the first embedded object
/// whose keys intersect the role's expected field set, then the whole text.
/// When none of those yields schema-valid JSON, the final
/// [`VERDICT_SCAN_WINDOW`] bytes are scanned for a bare verdict token and a
/// minimal output is synthesized with `degraded = true`.
pub fn parse_completion(role: Role, text: &str) -> Result<ParsedOutput> {
    let mut last_missing: Vec<String> = Vec::new();
    let mut last_reason = String::from("no JSON object found");

    for candidate in candidates(role, text) {
        let Ok(mut value) = serde_json::from_str::<Value>(&candidate) else {
            last_reason = "invalid JSON in candidate block".into();
            continue;
        };
        if !value.is_object() {
            continue;
        }
        normalize_verdict(role, &mut value);
        match deserialize_for_role(role, value.clone()) {
            Ok(output) => {
                return Ok(ParsedOutput {
                    output,
                    degraded: false,
                });
            }
            Err(e) => {
                last_reason = e.to_string();
                last_missing = missing_fields(role, &value);
            }
        }
    }

    if let Some(output) = degraded_from_verdict_scan(role, text) {
        debug!(role = %role, "degraded parse: synthesized output from verdict token");
        return Ok(ParsedOutput {
            output,
            degraded: true,
        });
    }

    Err(ContractError::Parse {
        role,
        reason: last_reason,
        missing_fields: last_missing,
    })
}

/// Candidate JSON strings in extraction priority order.
fn candidates(role: Role, text: &str) -> Vec<String> {
    let mut out = Vec::new();

    if let Some(caps) = JSON_FENCE_RE.captures(text) {
        out.push(caps[1].trim().to_string());
    }

    for object in embedded_objects(text) {
        if object_keys_intersect(role, &object) {
            out.push(object);
            break;
        }
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        out.push(trimmed.to_string());
    }

    out
}

/// Scan for balanced top-level `{...}` spans, skipping string literals.
fn embedded_objects(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut objects = Vec::new();
    let mut i = 0;

    while i < bytes.len() && objects.len() < 8 {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (offset, &b) in bytes[i..].iter().enumerate() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i + offset + 1);
                        break;
                    }
                }
                _ => {}
            }
        }
        match end {
            Some(end) => {
                if let Ok(span) = std::str::from_utf8(&bytes[i..end]) {
                    objects.push(span.to_string());
                }
                i = end;
            }
            None => break,
        }
    }
    objects
}

fn object_keys_intersect(role: Role, candidate: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(candidate) else {
        return false;
    };
    let Some(obj) = value.as_object() else {
        return false;
    };
    outputs::expected_fields(role)
        .iter()
        .any(|field| obj.contains_key(*field))
}

// ---------------------------------------------------------------------------
// Verdict normalization
// ---------------------------------------------------------------------------

/// Rewrite a raw `verdict` field into the role's canonical token set before
/// typed deserialization.
fn normalize_verdict(role: Role, value: &mut Value) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };
    let Some(raw) = obj.get("verdict").and_then(|v| v.as_str()) else {
        return;
    };
    let token = raw.trim().to_ascii_uppercase();

    let canonical = match role {
        Role::Qa => match token.as_str() {
            "PASS" | "APPROVE" | "SHIP" | "DONE" => "PASS",
            "SKIP" => "SKIP",
            "FAIL" | "REJECT" | "REVISE" | "HOLD" | "NEED_INFO" => "FAIL",
            _ => return,
        },
        Role::Reviewer => match token.as_str() {
            "APPROVE" | "SHIP" | "DONE" | "PASS" => "APPROVE",
            "REJECT" => "REJECT",
            "REVISE" | "HOLD" | "NEED_INFO" | "FAIL" => "REVISE",
            _ => return,
        },
        Role::Stamp => match token.as_str() {
            "APPROVE" | "SHIP" | "DONE" | "PASS" => "APPROVE",
            "REJECT" | "REVISE" | "HOLD" | "NEED_INFO" | "FAIL" => "REJECT",
            _ => return,
        },
        _ => return,
    };
    obj.insert("verdict".into(), Value::String(canonical.into()));
}

fn deserialize_for_role(role: Role, value: Value) -> serde_json::Result<AgentOutput> {
    Ok(match role {
        Role::Pm => AgentOutput::Pm(serde_json::from_value(value)?),
        Role::Excavator => AgentOutput::Excavator(serde_json::from_value(value)?),
        Role::Strategist => AgentOutput::Strategist(serde_json::from_value(value)?),
        Role::Coder => AgentOutput::Coder(serde_json::from_value(value)?),
        Role::Qa => AgentOutput::Qa(serde_json::from_value(value)?),
        Role::Reviewer => AgentOutput::Reviewer(serde_json::from_value(value)?),
        Role::Researcher => AgentOutput::Researcher(serde_json::from_value(value)?),
        Role::Analyst => AgentOutput::Analyst(serde_json::from_value(value)?),
        Role::Stamp => AgentOutput::Stamp(serde_json::from_value(value)?),
        Role::Council => AgentOutput::Council(serde_json::from_value(value)?),
    })
}

fn missing_fields(role: Role, value: &Value) -> Vec<String> {
    let Some(obj) = value.as_object() else {
        return outputs::expected_fields(role)
            .iter()
            .map(|s| s.to_string())
            .collect();
    };
    outputs::expected_fields(role)
        .iter()
        .filter(|field| !obj.contains_key(**field))
        .map(|s| s.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Degraded fallback
// ---------------------------------------------------------------------------

/// Case-insensitive verdict token scan over the tail of the completion.
/// Picks the token closest to the end. Only roles whose output is a bare
/// verdict at minimum (qa, reviewer, stamp) can be synthesized.
fn degraded_from_verdict_scan(role: Role, text: &str) -> Option<AgentOutput> {
    let start = text.len().saturating_sub(VERDICT_SCAN_WINDOW);
    let mut tail_start = start;
    while tail_start < text.len() && !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = text[tail_start..].to_ascii_uppercase();

    const TOKENS: &[&str] = &[
        "NEED_INFO", "APPROVE", "REJECT", "REVISE", "SHIP", "DONE", "PASS", "FAIL", "SKIP", "HOLD",
    ];
    let token = TOKENS
        .iter()
        .filter_map(|t| tail.rfind(t).map(|pos| (pos, *t)))
        .max_by_key(|(pos, _)| *pos)
        .map(|(_, t)| t)?;

    match role {
        Role::Qa => {
            let verdict = match token {
                "PASS" | "APPROVE" | "SHIP" | "DONE" => TestVerdict::Pass,
                "SKIP" => TestVerdict::Skip,
                _ => TestVerdict::Fail,
            };
            Some(AgentOutput::Qa(crate::outputs::QaOutput {
                verdict,
                tests: Vec::new(),
                coverage: None,
                issues: Vec::new(),
            }))
        }
        Role::Reviewer => {
            let verdict = match token {
                "APPROVE" | "SHIP" | "DONE" | "PASS" => Verdict::Approve,
                "REJECT" => Verdict::Reject,
                _ => Verdict::Revise,
            };
            Some(AgentOutput::Reviewer(crate::outputs::ReviewerOutput {
                verdict,
                risks: Vec::new(),
                security_score: 0,
                approved_files: Vec::new(),
                blocked_files: Vec::new(),
            }))
        }
        Role::Stamp => {
            let verdict = match token {
                "APPROVE" | "SHIP" | "DONE" | "PASS" => StampVerdict::Approve,
                _ => StampVerdict::Reject,
            };
            Some(AgentOutput::Stamp(StampOutput {
                verdict,
                score: None,
                blocking_issues: Vec::new(),
                requires_escalation: false,
            }))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::PmAction;

    #[test]
    fn fenced_block_wins_over_prose() {
        let text = r#"Here is my work.

```json
{"summary": "refactor auth module", "files_changed": ["src/auth.rs"], "diff": "--- a/src/auth.rs\n+++ b/src/auth.rs\n@@ -1 +1 @@\n-x\n+y"}
```

Let me know."#;
        let parsed = parse_completion(Role::Coder, text).unwrap();
        assert!(!parsed.degraded);
        match parsed.output {
            AgentOutput::Coder(out) => assert_eq!(out.files_changed, vec!["src/auth.rs"]),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn standalone_object_with_intersecting_keys() {
        let text = r#"The verdict object follows: {"verdict": "PASS", "tests": [], "issues": []} end."#;
        let parsed = parse_completion(Role::Qa, text).unwrap();
        assert!(!parsed.degraded);
        match parsed.output {
            AgentOutput::Qa(out) => assert_eq!(out.verdict, TestVerdict::Pass),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn verdict_tokens_are_normalized_per_role() {
        let parsed = parse_completion(
            Role::Reviewer,
            r#"{"verdict": "HOLD", "security_score": 5}"#,
        )
        .unwrap();
        match parsed.output {
            AgentOutput::Reviewer(out) => assert_eq!(out.verdict, Verdict::Revise),
            other => panic!("wrong variant: {other:?}"),
        }

        let parsed = parse_completion(Role::Qa, r#"{"verdict": "ship", "tests": []}"#).unwrap();
        match parsed.output {
            AgentOutput::Qa(out) => assert_eq!(out.verdict, TestVerdict::Pass),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn degraded_fallback_scans_tail_for_verdict() {
        let text = "I could not produce JSON this time.\nFinal answer: APPROVE";
        let parsed = parse_completion(Role::Reviewer, text).unwrap();
        assert!(parsed.degraded);
        match parsed.output {
            AgentOutput::Reviewer(out) => {
                assert_eq!(out.verdict, Verdict::Approve);
                assert!(out.risks.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn no_fallback_for_roles_without_verdicts() {
        let err = parse_completion(Role::Coder, "all DONE here, nothing else").unwrap_err();
        match &err {
            ContractError::Parse { role, .. } => assert_eq!(*role, Role::Coder),
        }
        assert_eq!(err.error_kind(), "JSON_PARSE");
    }

    #[test]
    fn missing_fields_are_reported() {
        let err = parse_completion(Role::Coder, r#"{"summary": "changed things"}"#).unwrap_err();
        let missing = err.missing_fields();
        assert!(missing.contains(&"diff".to_string()));
        assert!(!missing.contains(&"summary".to_string()));
    }

    #[test]
    fn pm_output_parses_with_tasks() {
        let text = r#"```json
{"action": "DISPATCH", "tasks": [{"agent": "coder", "instruction": "fix the login bug"}], "summary": "dispatching coder"}
```"#;
        let parsed = parse_completion(Role::Pm, text).unwrap();
        match parsed.output {
            AgentOutput::Pm(out) => {
                assert_eq!(out.action, PmAction::Dispatch);
                assert_eq!(out.tasks.len(), 1);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn braces_inside_strings_do_not_break_the_scan() {
        let text = r#"note: "{not json}" then {"score": 8.5, "reasoning": "clear separation of concerns in the module"}"#;
        let parsed = parse_completion(Role::Council, text).unwrap();
        match parsed.output {
            AgentOutput::Council(out) => assert!((out.score - 8.5).abs() < f64::EPSILON),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn round_trip_parse_of_serialized_output() {
        let original = AgentOutput::Qa(crate::outputs::QaOutput {
            verdict: TestVerdict::Fail,
            tests: vec![],
            coverage: None,
            issues: vec!["off-by-one in pagination".into()],
        });
        // Role-tagged envelope round-trips through untyped JSON.
        let json = serde_json::to_string(&original).unwrap();
        let back: AgentOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role(), Role::Qa);
    }
}
