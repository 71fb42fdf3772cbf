use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fm_agents::escalator::RetryEscalator;
use fm_agents::orchestrator::PipelineOrchestrator;
use fm_agents::personas::PersonaRegistry;
use fm_agents::supervisor::DualEngineSupervisor;
use fm_bridge::dispatcher::Dispatcher;
use fm_bridge::http_api::{api_router, ApiState};
use fm_bridge::EventBus;
use fm_core::Config;
use fm_harness::backend::BackendAdapter;
use fm_harness::compactor::TruncatingCompactor;
use fm_harness::shutdown::ShutdownSignal;
use fm_harness::{BackendRouter, StubBackend};
use fm_log::EventLog;
use fm_telemetry::counters::RuntimeCounters;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Owns the whole service graph: one event log, one queue/dispatcher, one
/// orchestrator, one escalator. Built once at startup, torn down once at
/// shutdown; nothing here is process-global.
pub struct Daemon {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<DualEngineSupervisor>,
    bus: EventBus,
    shutdown: ShutdownSignal,
    log: Arc<EventLog>,
}

impl Daemon {
    /// Build the daemon from configuration. Backend adapters default to a
    /// stub; callers register real adapters via [`Daemon::with_backends`].
    pub fn new(config: Config) -> Result<Self> {
        let mut router = BackendRouter::new();
        router.register(Arc::new(StubBackend::new("stub")));
        Self::with_backends(config, router)
    }

    /// Build the daemon with a caller-supplied backend routing table.
    pub fn with_backends(config: Config, backend_router: BackendRouter) -> Result<Self> {
        let counters = Arc::new(RuntimeCounters::new());

        let events_dir = expand_home(&config.events.dir);
        let log = Arc::new(
            EventLog::open(
                &events_dir,
                config.events.max_content_bytes,
                Arc::clone(&counters),
            )
            .with_context(|| format!("failed to open event log at {}", events_dir.display()))?,
        );

        let orchestrator = Arc::new(PipelineOrchestrator::new(
            Arc::clone(&log),
            Arc::clone(&counters),
            config.supervisor.clone(),
        ));

        let bus = EventBus::new();
        let dispatcher = Arc::new(Dispatcher::new(
            config.queue.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&log),
            bus.clone(),
            Arc::clone(&counters),
        ));

        let personas_dir = expand_home(&config.personas.dir);
        let personas = Arc::new(PersonaRegistry::new(
            personas_dir.exists().then_some(personas_dir),
        ));

        let supervisor = Arc::new(DualEngineSupervisor::new(
            Arc::new(backend_router),
            personas,
            Arc::new(RetryEscalator::new()),
            Arc::clone(&log),
            Arc::new(TruncatingCompactor::default()),
            Arc::clone(&counters),
            config.supervisor.clone(),
        ));

        Ok(Self {
            config,
            dispatcher,
            supervisor,
            bus,
            shutdown: ShutdownSignal::new(),
            log,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn supervisor(&self) -> Arc<DualEngineSupervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve the dispatch API on `listener` and run the background loops
    /// until shutdown is triggered.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        self.spawn_reaper();
        self.spawn_archiver();
        self.spawn_deadline_check();

        let state = Arc::new(ApiState {
            dispatcher: self.dispatcher(),
        });
        let app = api_router(state);

        let mut shutdown_rx = self.shutdown.subscribe();
        info!(addr = ?listener.local_addr().ok(), "dispatch API listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
            .context("dispatch API server failed")?;

        // Every spawned loop registered a drain ticket; wait on that set.
        let mut shutdown = self.shutdown.clone();
        let stragglers = shutdown.wait_for_drain(Duration::from_secs(5)).await;
        if !stragglers.is_empty() {
            warn!(?stragglers, "loops did not confirm drain");
        }
        info!("daemon stopped");
        Ok(())
    }

    fn spawn_reaper(&self) {
        let dispatcher = self.dispatcher();
        let ticket = self.shutdown.register("lease-reaper");
        let interval = Duration::from_secs(self.config.queue.reaper_interval_secs.max(1));
        tokio::spawn(async move {
            let mut rx = ticket.subscribe();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = dispatcher.reap();
                        if !report.requeued.is_empty() || !report.exhausted.is_empty() {
                            info!(
                                requeued = report.requeued.len(),
                                exhausted = report.exhausted.len(),
                                "reaper sweep"
                            );
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
            ticket.confirm();
        });
    }

    fn spawn_archiver(&self) {
        let log = Arc::clone(&self.log);
        let ticket = self.shutdown.register("event-archiver");
        let after_days = self.config.events.archive_after_days;
        let interval = Duration::from_secs(self.config.events.archive_interval_secs.max(1));
        tokio::spawn(async move {
            let mut rx = ticket.subscribe();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match log.archive_sweep(after_days) {
                            Ok(0) => {}
                            Ok(moved) => info!(moved, "archived event day files"),
                            Err(e) => warn!(error = %e, "archive sweep failed"),
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
            ticket.confirm();
        });
    }

    fn spawn_deadline_check(&self) {
        let orchestrator = Arc::clone(self.dispatcher.orchestrator());
        let ticket = self.shutdown.register("deadline-check");
        tokio::spawn(async move {
            let mut rx = ticket.subscribe();
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = orchestrator.expire_deadlines();
                        if !expired.is_empty() {
                            warn!(count = expired.len(), "pipelines escalated on deadline");
                        }
                    }
                    _ = rx.recv() => break,
                }
            }
            ticket.confirm();
        });
    }
}

/// Register an extra adapter on a router under construction. Convenience
/// for binaries that wire vendor adapters before calling
/// [`Daemon::with_backends`].
pub fn register_adapter(router: &mut BackendRouter, adapter: Arc<dyn BackendAdapter>) {
    router.register(adapter);
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
