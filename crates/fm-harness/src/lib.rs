//! Backend adapter surface for foreman.
//!
//! The engine never talks to a model vendor directly: every call goes
//! through a [`backend::BackendAdapter`] picked by the
//! [`router::BackendRouter`]'s `(role, stage)` table, wrapped in a per-call
//! timeout and a per-adapter circuit breaker. The [`compactor`] recovers
//! from context-window overflow; [`shutdown`] coordinates graceful exit.

pub mod backend;
pub mod circuit_breaker;
pub mod compactor;
pub mod router;
pub mod shutdown;

pub use backend::{BackendAdapter, BackendError, BackendResponse, CallOptions, StubBackend, Usage};
pub use router::{BackendRouter, Stage};
