//! forgefed - ActivityPub federation core for a software forge
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub actors and signed inboxes                    │
//! │  - NodeInfo                                                 │
//! │  - Metrics / health                                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Signature verification, host registry                    │
//! │  - Activity processing                                      │
//! │  - Delivery queues and workers                              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `federation`: ActivityPub federation handling
//! - `data`: Storage traits and the SQLite implementation
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;

use std::sync::Arc;

use federation::{
    ActivityPubClient, ActivityProcessor, DeliveryQueues, FederationHostRegistry,
    FederationRuntime, KeyProvider, LocalUrls, ProcessorDeps, SignatureVerifier,
    StoredKeyProvider,
};

/// Application state shared across all handlers
///
/// This struct is cloned for each request; every field is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// URLs of local actors
    pub urls: LocalUrls,

    /// Signing keys of local users and the instance actor
    pub keys: Arc<dyn KeyProvider>,

    /// Outbound HTTP client for federation
    pub client: Arc<ActivityPubClient>,

    /// Inbound signature verification
    pub verifier: Arc<SignatureVerifier>,

    /// Inbound and outbound activity handling
    pub processor: Arc<ActivityProcessor>,

    /// Durable delivery queues
    pub queues: DeliveryQueues,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the federation client and key provider
    /// 3. Wire the host registry, verifier and processor
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::FederationError> {
        tracing::info!("Initializing application state...");

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. Federation plumbing
        let urls = LocalUrls::new(config.server.base_url());
        let client = Arc::new(ActivityPubClient::new(&config.federation)?);
        let keys: Arc<dyn KeyProvider> = Arc::new(StoredKeyProvider::new(
            db.clone(),
            urls.clone(),
            config.instance.key_bits,
        ));
        let queues = DeliveryQueues::new(db.clone());

        // 3. Inbound processing
        let registry = Arc::new(FederationHostRegistry::new(
            db.clone(),
            client.clone(),
            keys.clone(),
        ));
        let verifier = Arc::new(SignatureVerifier::new(
            client.clone(),
            keys.clone(),
            &config.federation,
        ));
        let processor = Arc::new(ActivityProcessor::new(ProcessorDeps {
            users: db.clone(),
            repos: db.clone(),
            registry,
            client: client.clone(),
            keys: keys.clone(),
            queues: queues.clone(),
            urls: urls.clone(),
        }));

        tracing::info!(base_url = %urls.base_url(), "Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            urls,
            keys,
            client,
            verifier,
            processor,
            queues,
        })
    }

    /// Start the delivery workers and the profile refresh, unless federation
    /// is disabled.
    pub fn start_federation_runtime(&self) -> Option<FederationRuntime> {
        if !self.config.federation.enabled {
            tracing::info!("Federation disabled; delivery workers not started");
            return None;
        }

        let mut runtime = FederationRuntime::start(
            self.queues.clone(),
            self.db.clone(),
            self.client.clone(),
            self.keys.clone(),
            &self.config.federation.queue,
        );

        let interval = self.config.federation.profile_refresh_interval_secs;
        if interval > 0 {
            runtime.schedule_profile_refresh(
                self.processor.clone(),
                std::time::Duration::from_secs(interval),
            );
        }
        Some(runtime)
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::extract::DefaultBodyLimit;
    use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

    let mut router = Router::new();
    if state.config.federation.enabled {
        router = router
            .merge(api::wellknown_router())
            .merge(api::activitypub_router());
    }

    router
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.config.federation.max_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}
