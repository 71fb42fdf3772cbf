use std::collections::HashMap;
use std::sync::Arc;

use fm_core::types::Role;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{
    call_with_timeout, BackendAdapter, BackendError, BackendResponse, CallOptions, Result,
};
use crate::circuit_breaker::CircuitBreaker;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Which seat in the dual-engine loop a call serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Writer,
    Auditor,
    Stamp,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Writer => "writer",
            Stage::Auditor => "auditor",
            Stage::Stamp => "stamp",
        }
    }
}

// ---------------------------------------------------------------------------
// ModelTier
// ---------------------------------------------------------------------------

/// Model hint attached to a `(role, stage)` slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTier {
    pub model: String,
    pub max_tokens: u32,
}

/// Static tier map. Writers get the heavy model for the roles that produce
/// artifacts; auditors sit one tier down; the stamp is a cheap yes/no.
pub fn default_tier(role: Role, stage: Stage) -> ModelTier {
    let (model, max_tokens) = match (role, stage) {
        (Role::Coder | Role::Strategist | Role::Pm, Stage::Writer) => ("tier-heavy", 32_000),
        (_, Stage::Writer) => ("tier-standard", 16_000),
        (_, Stage::Auditor) => ("tier-standard", 8_000),
        (_, Stage::Stamp) => ("tier-light", 2_000),
    };
    ModelTier {
        model: model.to_string(),
        max_tokens,
    }
}

// ---------------------------------------------------------------------------
// BackendRouter
// ---------------------------------------------------------------------------

/// Routes `(role, stage)` to a named adapter and shields every call behind
/// that adapter's circuit breaker plus the per-call timeout.
///
/// The table is fixed at startup; there is no reflective adapter loading.
pub struct BackendRouter {
    adapters: HashMap<String, Arc<dyn BackendAdapter>>,
    breakers: HashMap<String, CircuitBreaker>,
    table: HashMap<(Role, Stage), String>,
    default_adapter: Option<String>,
}

impl BackendRouter {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            breakers: HashMap::new(),
            table: HashMap::new(),
            default_adapter: None,
        }
    }

    /// Register an adapter under its own name. The first registration
    /// becomes the default route.
    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        let name = adapter.name().to_string();
        if self.default_adapter.is_none() {
            self.default_adapter = Some(name.clone());
        }
        self.breakers
            .insert(name.clone(), CircuitBreaker::default());
        self.adapters.insert(name, adapter);
    }

    /// Pin a `(role, stage)` slot to a named adapter.
    pub fn route(&mut self, role: Role, stage: Stage, adapter_name: impl Into<String>) {
        self.table.insert((role, stage), adapter_name.into());
    }

    /// Resolve the adapter serving a slot.
    fn adapter_for(&self, role: Role, stage: Stage) -> Result<(&str, &Arc<dyn BackendAdapter>)> {
        let name = self
            .table
            .get(&(role, stage))
            .or(self.default_adapter.as_ref())
            .ok_or_else(|| {
                BackendError::NotConfigured(format!("no adapter for ({role}, {})", stage.as_str()))
            })?;
        let adapter = self
            .adapters
            .get(name)
            .ok_or_else(|| BackendError::NotConfigured(format!("adapter '{name}' missing")))?;
        Ok((name.as_str(), adapter))
    }

    /// Execute one call for a slot: breaker check, tier fill-in, timeout.
    pub async fn call(
        &self,
        role: Role,
        stage: Stage,
        persona: &str,
        payload: &str,
        options: &CallOptions,
    ) -> Result<BackendResponse> {
        let (name, adapter) = self.adapter_for(role, stage)?;

        let breaker = self
            .breakers
            .get(name)
            .ok_or_else(|| BackendError::NotConfigured(format!("breaker for '{name}' missing")))?;
        if !breaker.try_acquire() {
            return Err(BackendError::CircuitOpen(name.to_string()));
        }

        let mut options = options.clone();
        if options.model.is_none() {
            let tier = default_tier(role, stage);
            options.model = Some(tier.model);
            options.max_tokens.get_or_insert(tier.max_tokens);
        }

        debug!(role = %role, stage = stage.as_str(), adapter = name, "backend call");
        let result = call_with_timeout(adapter.as_ref(), persona, payload, &options).await;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(e) if e.is_transient() => breaker.record_failure(),
            // Contract-level noise is not the vendor's fault.
            Err(_) => {}
        }
        result
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StubBackend;

    fn router_with_stub(texts: &[&str]) -> (BackendRouter, Arc<StubBackend>) {
        let stub = Arc::new(StubBackend::new("stub"));
        for t in texts {
            stub.push_text(*t);
        }
        let mut router = BackendRouter::new();
        router.register(stub.clone());
        (router, stub)
    }

    #[tokio::test]
    async fn unrouted_slot_falls_back_to_default_adapter() {
        let (router, _stub) = router_with_stub(&["hello"]);
        let resp = router
            .call(
                Role::Coder,
                Stage::Writer,
                "persona",
                "payload",
                &CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(resp.text, "hello");
    }

    #[tokio::test]
    async fn explicit_route_overrides_default() {
        let stub_a = Arc::new(StubBackend::new("a"));
        let stub_b = Arc::new(StubBackend::new("b"));
        stub_b.push_text("from b");

        let mut router = BackendRouter::new();
        router.register(stub_a);
        router.register(stub_b);
        router.route(Role::Reviewer, Stage::Auditor, "b");

        let resp = router
            .call(
                Role::Reviewer,
                Stage::Auditor,
                "p",
                "x",
                &CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(resp.text, "from b");
    }

    #[tokio::test]
    async fn tier_model_is_filled_when_unset() {
        // Tier defaults: heavy for coder writer, light for stamp.
        let heavy = default_tier(Role::Coder, Stage::Writer);
        let light = default_tier(Role::Coder, Stage::Stamp);
        assert_eq!(heavy.model, "tier-heavy");
        assert_eq!(light.model, "tier-light");
        assert!(heavy.max_tokens > light.max_tokens);
    }

    #[tokio::test]
    async fn empty_router_reports_not_configured() {
        let router = BackendRouter::new();
        let err = router
            .call(Role::Pm, Stage::Writer, "p", "x", &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_transient_failures() {
        let stub = Arc::new(StubBackend::new("stub"));
        for _ in 0..5 {
            stub.push_error(BackendError::Server { status: 500 });
        }
        let mut router = BackendRouter::new();
        router.register(stub);

        for _ in 0..5 {
            let _ = router
                .call(Role::Qa, Stage::Writer, "p", "x", &CallOptions::default())
                .await;
        }
        let err = router
            .call(Role::Qa, Stage::Writer, "p", "x", &CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::CircuitOpen(_)));
    }
}
