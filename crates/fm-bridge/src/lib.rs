//! The dispatch boundary: job queue, push/pull service, and the HTTP API
//! workers talk to.
//!
//! The queue is a single-mutator store behind one mutex; the
//! [`dispatcher::Dispatcher`] composes it with the orchestrator and the
//! event log; [`http_api`] is a thin axum layer over the dispatcher, so the
//! in-process path and the HTTP path stay equivalent.

pub mod api_error;
pub mod dispatcher;
pub mod event_bus;
pub mod http_api;
pub mod queue;

pub use api_error::ApiError;
pub use dispatcher::{Dispatcher, PushBody, PushResponse};
pub use event_bus::{EventBus, PipelineMessage};
pub use queue::{JobQueue, QueueError};
