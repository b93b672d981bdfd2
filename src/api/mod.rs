//! API layer
//!
//! HTTP handlers for:
//! - ActivityPub actors and inboxes (federation)
//! - NodeInfo discovery
//! - Metrics (Prometheus) and health

mod activitypub;
pub mod metrics;
mod wellknown;

pub use activitypub::activitypub_router;
pub use metrics::metrics_router;
pub use wellknown::wellknown_router;
