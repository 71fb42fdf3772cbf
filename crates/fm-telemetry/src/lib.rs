//! Observability layer for foreman services.
//!
//! Bundles structured logging setup (`tracing-subscriber` behind a
//! level/format knob), the dispatch trace middleware that anchors every
//! HTTP request to the pipeline it names, and the process-wide runtime
//! counters surfaced by the dispatch status endpoint.

pub mod counters;
pub mod logging;
pub mod tracing_setup;
