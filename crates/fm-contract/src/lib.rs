//! Output contracts for agent completions.
//!
//! A raw model completion has no authority here: it must yield a typed,
//! schema-valid [`outputs::AgentOutput`] before anything downstream will
//! look at it. Extraction ([`extract`]) finds and parses the embedded JSON;
//! the semantic guard ([`guard`]) then rejects outputs that are
//! syntactically fine but say nothing.

pub mod extract;
pub mod guard;
pub mod outputs;

pub use extract::{parse_completion, ContractError, ParsedOutput};
pub use guard::{GuardError, SemanticGuard};
pub use outputs::{AgentOutput, StampVerdict, TestVerdict, Verdict, VerdictClass};
