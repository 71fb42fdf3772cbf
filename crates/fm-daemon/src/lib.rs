//! Daemon assembly for foreman: builds the service graph out of the other
//! crates, serves the dispatch API, and runs the background sweeps (lease
//! reaper, event archiver, pipeline deadline check).

pub mod daemon;
pub mod worker;

pub use daemon::Daemon;
pub use worker::Worker;
