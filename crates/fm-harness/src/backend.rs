use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors a backend call can surface.
///
/// The engine cares about the *kind*, not the vendor detail: transient kinds
/// are retried within the attempt budget, contract kinds feed the escalator,
/// everything else propagates.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The call did not complete within the configured timeout.
    #[error("backend call timed out")]
    Timeout,

    /// The payload exceeded the model's context window. Recoverable: the
    /// supervisor compacts the payload and retries once.
    #[error("context window overflow")]
    ContextOverflow,

    /// The vendor returned a server-side error.
    #[error("backend returned status {status}")]
    Server { status: u16 },

    /// Rate limited; retry after the indicated delay.
    #[error("rate limited – retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// The adapter's circuit breaker is refusing calls.
    #[error("circuit open for backend '{0}'")]
    CircuitOpen(String),

    /// Missing credentials or an unregistered adapter.
    #[error("backend not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Stable kind string used when building failure signatures.
    pub fn error_kind(&self) -> &'static str {
        match self {
            BackendError::Timeout => "timeout",
            BackendError::ContextOverflow => "context_overflow",
            BackendError::Server { .. } => "backend_5xx",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::CircuitOpen(_) => "circuit_open",
            BackendError::NotConfigured(_) => "not_configured",
            BackendError::Other(_) => "backend_other",
        }
    }

    /// Transient errors may be retried within the attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout
                | BackendError::ContextOverflow
                | BackendError::Server { .. }
                | BackendError::RateLimited { .. }
                | BackendError::CircuitOpen(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// What comes back from one backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendResponse {
    pub text: String,
    pub usage: Usage,
    pub latency_ms: u64,
}

/// Per-call knobs; the router fills `model` from its tier table.
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub timeout: Duration,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            model: None,
            max_tokens: None,
        }
    }
}

// ---------------------------------------------------------------------------
// BackendAdapter
// ---------------------------------------------------------------------------

/// Uniform call surface over LLM vendors.
///
/// Adapters are pluggable; the engine is indifferent to the model family
/// behind one. Implementations must be `Send + Sync` so the supervisor can
/// call them concurrently for independent jobs.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Run one completion: persona (system prompt bundle) plus payload.
    async fn call(
        &self,
        persona: &str,
        payload: &str,
        options: &CallOptions,
    ) -> Result<BackendResponse>;

    /// Stable adapter name used by the routing table and circuit breakers.
    fn name(&self) -> &str;
}

/// Run `adapter.call` under `options.timeout`, mapping elapsed deadlines to
/// [`BackendError::Timeout`].
pub async fn call_with_timeout(
    adapter: &dyn BackendAdapter,
    persona: &str,
    payload: &str,
    options: &CallOptions,
) -> Result<BackendResponse> {
    match tokio::time::timeout(options.timeout, adapter.call(persona, payload, options)).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout),
    }
}

// ---------------------------------------------------------------------------
// StubBackend
// ---------------------------------------------------------------------------

enum Scripted {
    Text(String),
    Error(BackendError),
}

/// Scripted backend for tests and placeholder wiring.
///
/// Responses are queued ahead of time and popped per call; an exhausted
/// queue reports `NotConfigured`, the same thing a never-scripted stub does.
pub struct StubBackend {
    name: String,
    script: Mutex<VecDeque<Scripted>>,
}

impl StubBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.script
            .lock()
            .expect("stub script lock poisoned")
            .push_back(Scripted::Text(text.into()));
    }

    pub fn push_error(&self, error: BackendError) {
        self.script
            .lock()
            .expect("stub script lock poisoned")
            .push_back(Scripted::Error(error));
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("stub script lock poisoned").len()
    }
}

#[async_trait]
impl BackendAdapter for StubBackend {
    async fn call(
        &self,
        _persona: &str,
        payload: &str,
        _options: &CallOptions,
    ) -> Result<BackendResponse> {
        let started = Instant::now();
        let next = self
            .script
            .lock()
            .expect("stub script lock poisoned")
            .pop_front();
        match next {
            Some(Scripted::Text(text)) => Ok(BackendResponse {
                usage: Usage {
                    input_tokens: payload.len() as u64 / 4,
                    output_tokens: text.len() as u64 / 4,
                },
                latency_ms: started.elapsed().as_millis() as u64,
                text,
            }),
            Some(Scripted::Error(error)) => Err(error),
            None => Err(BackendError::NotConfigured(format!(
                "stub '{}' has no scripted response",
                self.name
            ))),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_pops_responses_in_order() {
        let stub = StubBackend::new("stub");
        stub.push_text("first");
        stub.push_text("second");

        let opts = CallOptions::default();
        let a = stub.call("p", "x", &opts).await.unwrap();
        let b = stub.call("p", "x", &opts).await.unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(b.text, "second");
    }

    #[tokio::test]
    async fn exhausted_stub_is_not_configured() {
        let stub = StubBackend::new("stub");
        let err = stub
            .call("p", "x", &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let stub = StubBackend::new("stub");
        stub.push_error(BackendError::ContextOverflow);
        let err = stub
            .call("p", "x", &CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "context_overflow");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn timeout_wrapper_maps_deadline() {
        struct SlowBackend;

        #[async_trait]
        impl BackendAdapter for SlowBackend {
            async fn call(
                &self,
                _persona: &str,
                _payload: &str,
                _options: &CallOptions,
            ) -> Result<BackendResponse> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("call should have timed out");
            }

            fn name(&self) -> &str {
                "slow"
            }
        }

        let opts = CallOptions {
            timeout: Duration::from_millis(10),
            ..Default::default()
        };
        let err = call_with_timeout(&SlowBackend, "p", "x", &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout));
    }

    #[test]
    fn transient_classification() {
        assert!(BackendError::Timeout.is_transient());
        assert!(BackendError::Server { status: 503 }.is_transient());
        assert!(!BackendError::NotConfigured("x".into()).is_transient());
        assert!(!BackendError::Other("x".into()).is_transient());
    }
}
