pub mod auth;
pub mod backend;
pub mod config;
pub mod drift;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod rest;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod trinity;

use std::sync::Arc;

use backend::media::MediaClient;
use backend::ModelBackend;
use config::GatewayConfig;
use drift::LatencyDriftMonitor;
use ipc::registry::ConnectionRegistry;
use metrics::GatewayMetrics;
use rest::auth::RateLimiter;
use session::SessionTokenLedger;
use storage::AuditLog;
use trinity::admission::TierGates;
use trinity::clear::ClearTuner;

/// Shared application state passed to every handler and background task.
///
/// All process-wide mutable state (tier gates, connection registry, session
/// token counters, latency window, CLEAR threshold) lives here; startup
/// wires the dependencies explicitly and nothing is a module-level
/// singleton.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<GatewayConfig>,
    pub backend: Arc<dyn ModelBackend>,
    pub media: Arc<MediaClient>,
    /// Audit-log collaborator; absent when no database is configured.
    pub storage: Option<Arc<dyn AuditLog>>,
    pub gates: Arc<TierGates>,
    pub registry: Arc<ConnectionRegistry>,
    pub session_tokens: Arc<SessionTokenLedger>,
    pub drift: Arc<LatencyDriftMonitor>,
    pub clear_tuner: Arc<ClearTuner>,
    pub metrics: Arc<GatewayMetrics>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: std::time::Instant,
}

impl AppContext {
    /// Wire a context around a config and a model backend. Storage is
    /// attached separately because opening it is async and optional.
    pub fn new(config: GatewayConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit_window_ms,
            config.rate_limit_max_requests as usize,
        ));
        let media = Arc::new(MediaClient::from_config(&config));
        Self {
            config: Arc::new(config),
            backend,
            media,
            storage: None,
            gates: Arc::new(TierGates::default()),
            registry: Arc::new(ConnectionRegistry::new()),
            session_tokens: Arc::new(SessionTokenLedger::new()),
            drift: Arc::new(LatencyDriftMonitor::new()),
            clear_tuner: ClearTuner::new(),
            metrics: Arc::new(GatewayMetrics::new()),
            rate_limiter,
            started_at: std::time::Instant::now(),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn AuditLog>) -> Self {
        self.storage = Some(storage);
        self
    }
}
