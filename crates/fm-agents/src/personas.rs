use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use fm_core::types::Role;
use fm_harness::Stage;
use tracing::debug;

// ---------------------------------------------------------------------------
// PersonaBundle
// ---------------------------------------------------------------------------

/// An opaque prompt bundle for one `(role, stage)` seat.
///
/// The engine never interprets the prompt text. The single interpreted field
/// is `schema_role`: which role's output contract the completion must parse
/// against. Auditor personas typically declare the reviewer schema, stamp
/// personas the stamp schema.
#[derive(Debug, Clone)]
pub struct PersonaBundle {
    pub role: Role,
    pub stage: Stage,
    pub text: String,
    pub schema_role: Role,
}

// ---------------------------------------------------------------------------
// Built-in personas
// ---------------------------------------------------------------------------

const PM_WRITER_PERSONA: &str = "\
You are the project manager of a software engineering pipeline. \
Decide the next action for the request you are given.

Output JSON only:
{
    \"action\": \"DISPATCH\" | \"RETRY\" | \"BLOCKED\" | \"ESCALATE\" | \"DONE\",
    \"tasks\": [{\"agent\": \"coder|qa|reviewer|strategist|analyst|researcher|excavator\", \"instruction\": \"...\"}],
    \"summary\": \"under 100 chars, for the log\",
    \"requires_escalation\": false
}

You decide, you do not implement. No chatter outside the JSON object.";

const CODER_WRITER_PERSONA: &str = "\
You are an implementation engineer. Follow the instruction exactly and emit
a unified diff for every change you make.

Output JSON only:
{
    \"summary\": \"what changed and where\",
    \"files_changed\": [\"path\"],
    \"diff\": \"--- a/...\\n+++ b/...\\n@@ ... @@\",
    \"todo_next\": null
}";

const QA_WRITER_PERSONA: &str = "\
You are a test engineer. Exercise the change you are given and report
evidence, not impressions.

Output JSON only:
{
    \"verdict\": \"PASS\" | \"FAIL\" | \"SKIP\",
    \"tests\": [{\"name\": \"...\", \"result\": \"PASS|FAIL|SKIP\", \"reason\": null}],
    \"coverage\": null,
    \"issues\": []
}";

const AUDITOR_PERSONA: &str = "\
You are the auditor. Review the worker output against the original task.

Output JSON only:
{
    \"verdict\": \"APPROVE\" | \"REVISE\" | \"REJECT\",
    \"risks\": [],
    \"security_score\": 0-10,
    \"approved_files\": [],
    \"blocked_files\": []
}

APPROVE only when the output is correct and complete. REVISE with concrete
notes when it is fixable. REJECT when it is fundamentally broken.";

const STAMP_PERSONA: &str = "\
You are the stamp: a final, fast gate after the audit.

Output JSON only:
{
    \"verdict\": \"APPROVE\" | \"REJECT\",
    \"score\": 0-10,
    \"blocking_issues\": [],
    \"requires_escalation\": false
}

Set requires_escalation when the change deploys, pays, deletes data, or
touches credentials.";

const GENERIC_WRITER_PERSONA: &str = "\
You are a specialist agent in a software engineering pipeline. Do the task
you are given and answer with the JSON object your role's contract defines.
No chatter outside the JSON object.";

/// Built-in fallback persona for a seat, used when the bundle directory has
/// no file for it.
pub fn builtin_persona(role: Role, stage: Stage) -> &'static str {
    match stage {
        Stage::Auditor => AUDITOR_PERSONA,
        Stage::Stamp => STAMP_PERSONA,
        Stage::Writer => match role {
            Role::Pm => PM_WRITER_PERSONA,
            Role::Coder => CODER_WRITER_PERSONA,
            Role::Qa => QA_WRITER_PERSONA,
            _ => GENERIC_WRITER_PERSONA,
        },
    }
}

/// Which contract a seat's completion parses against by default.
pub fn default_schema_role(role: Role, stage: Stage) -> Role {
    match stage {
        Stage::Writer => role,
        Stage::Auditor => Role::Reviewer,
        Stage::Stamp => Role::Stamp,
    }
}

// ---------------------------------------------------------------------------
// PersonaRegistry
// ---------------------------------------------------------------------------

/// Loads persona bundles at job execution time.
///
/// A bundle file lives at `{dir}/{role}.{stage}.md` and is plain prompt
/// text, except for an optional first line `schema: {role}` declaring the
/// output contract. Missing files fall back to the built-ins, so a fresh
/// install runs without any persona directory at all.
pub struct PersonaRegistry {
    dir: Option<PathBuf>,
    cache: RwLock<HashMap<(Role, Stage), Arc<PersonaBundle>>>,
}

impl PersonaRegistry {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registry that only serves the built-ins.
    pub fn builtin() -> Self {
        Self::new(None)
    }

    pub fn get(&self, role: Role, stage: Stage) -> Arc<PersonaBundle> {
        {
            let cache = self.cache.read().expect("persona cache lock poisoned");
            if let Some(bundle) = cache.get(&(role, stage)) {
                return Arc::clone(bundle);
            }
        }

        let bundle = Arc::new(self.load(role, stage));
        self.cache
            .write()
            .expect("persona cache lock poisoned")
            .insert((role, stage), Arc::clone(&bundle));
        bundle
    }

    fn load(&self, role: Role, stage: Stage) -> PersonaBundle {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.{}.md", role, stage.as_str()));
            if let Ok(raw) = std::fs::read_to_string(&path) {
                debug!(path = %path.display(), "persona bundle loaded");
                return parse_bundle(role, stage, &raw);
            }
        }
        PersonaBundle {
            role,
            stage,
            text: builtin_persona(role, stage).to_string(),
            schema_role: default_schema_role(role, stage),
        }
    }
}

/// Split the optional `schema:` header off a bundle file.
fn parse_bundle(role: Role, stage: Stage, raw: &str) -> PersonaBundle {
    let mut schema_role = default_schema_role(role, stage);
    let mut text = raw;

    if let Some(first_line) = raw.lines().next() {
        if let Some(declared) = first_line.trim().strip_prefix("schema:") {
            if let Ok(parsed) = declared.trim().parse::<Role>() {
                schema_role = parsed;
                text = raw.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
            }
        }
    }

    PersonaBundle {
        role,
        stage,
        text: text.trim_start().to_string(),
        schema_role,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_serves_every_seat() {
        let registry = PersonaRegistry::builtin();
        for role in [Role::Pm, Role::Coder, Role::Qa, Role::Analyst] {
            for stage in [Stage::Writer, Stage::Auditor, Stage::Stamp] {
                let bundle = registry.get(role, stage);
                assert!(!bundle.text.is_empty());
            }
        }
    }

    #[test]
    fn auditor_seats_parse_against_reviewer_schema() {
        let registry = PersonaRegistry::builtin();
        let bundle = registry.get(Role::Coder, Stage::Auditor);
        assert_eq!(bundle.schema_role, Role::Reviewer);
        let bundle = registry.get(Role::Coder, Stage::Stamp);
        assert_eq!(bundle.schema_role, Role::Stamp);
        let bundle = registry.get(Role::Coder, Stage::Writer);
        assert_eq!(bundle.schema_role, Role::Coder);
    }

    #[test]
    fn file_bundle_overrides_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("coder.writer.md"),
            "You write embedded firmware.",
        )
        .unwrap();

        let registry = PersonaRegistry::new(Some(dir.path().to_path_buf()));
        let bundle = registry.get(Role::Coder, Stage::Writer);
        assert_eq!(bundle.text, "You write embedded firmware.");
        assert_eq!(bundle.schema_role, Role::Coder);
    }

    #[test]
    fn schema_header_is_the_only_interpreted_field() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("qa.writer.md"),
            "schema: reviewer\nActually review instead of testing.",
        )
        .unwrap();

        let registry = PersonaRegistry::new(Some(dir.path().to_path_buf()));
        let bundle = registry.get(Role::Qa, Stage::Writer);
        assert_eq!(bundle.schema_role, Role::Reviewer);
        assert_eq!(bundle.text, "Actually review instead of testing.");
    }

    #[test]
    fn bundles_are_cached_after_first_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pm.writer.md"), "v1").unwrap();

        let registry = PersonaRegistry::new(Some(dir.path().to_path_buf()));
        assert_eq!(registry.get(Role::Pm, Stage::Writer).text, "v1");

        // Changing the file does not change the cached bundle.
        std::fs::write(dir.path().join("pm.writer.md"), "v2").unwrap();
        assert_eq!(registry.get(Role::Pm, Stage::Writer).text, "v1");
    }
}
