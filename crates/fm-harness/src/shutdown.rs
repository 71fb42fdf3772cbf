use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal — cooperative shutdown coordination
// ---------------------------------------------------------------------------

/// Shutdown coordinator for the daemon's background loops.
///
/// Every loop registers itself by name and receives a [`DrainTicket`]; on
/// shutdown it confirms through the ticket. The daemon then waits for the
/// registered set to empty, so it never has to guess how many loops exist,
/// and a hung loop is reported by name instead of as a missing count.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
    pending: Arc<Mutex<BTreeSet<String>>>,
    drained_tx: Arc<watch::Sender<u64>>,
    drained_rx: watch::Receiver<u64>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    /// Register a named component that must drain before the process may
    /// exit. Returns the ticket it confirms with.
    pub fn register(&self, name: impl Into<String>) -> DrainTicket {
        let name = name.into();
        self.pending
            .lock()
            .expect("shutdown pending lock poisoned")
            .insert(name.clone());
        debug!(component = %name, "registered for drain");
        DrainTicket {
            name,
            signal: self.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    /// Non-blocking flag check, for loops that poll between units of work.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown once; repeated triggers are no-ops.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        }
    }

    /// Components still registered and unconfirmed.
    pub fn pending_components(&self) -> Vec<String> {
        self.pending
            .lock()
            .expect("shutdown pending lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Wait until every registered component confirmed, or the timeout
    /// elapses. Returns the names of the stragglers (empty on a clean
    /// drain).
    pub async fn wait_for_drain(&mut self, timeout: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending = self.pending_components();
            if pending.is_empty() {
                info!("all components drained");
                return Vec::new();
            }
            match tokio::time::timeout_at(deadline, self.drained_rx.changed()).await {
                Ok(Ok(())) => continue,
                _ => {
                    warn!(stragglers = ?pending, "drain timeout");
                    return pending;
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainTicket
// ---------------------------------------------------------------------------

/// Held by a registered component; consuming it confirms the drain.
#[derive(Debug)]
pub struct DrainTicket {
    name: String,
    signal: ShutdownSignal,
}

impl DrainTicket {
    /// The shutdown receiver this component should `select!` against.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.signal.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Confirm this component finished cleanly.
    pub fn confirm(self) {
        self.signal
            .pending
            .lock()
            .expect("shutdown pending lock poisoned")
            .remove(&self.name);
        self.signal.drained_tx.send_modify(|count| *count += 1);
        debug!(component = %self.name, "drained");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
