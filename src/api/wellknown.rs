//! Well-known and NodeInfo endpoints
//!
//! - /.well-known/nodeinfo
//! - /api/v1/nodeinfo

use axum::{Json, Router, extract::State, routing::get};

use crate::AppState;
use crate::error::FederationError;
use crate::federation::{NodeInfo, NodeInfoLinks, local_nodeinfo, well_known_links};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/nodeinfo
/// - GET /api/v1/nodeinfo
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/api/v1/nodeinfo", get(nodeinfo))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<NodeInfoLinks> {
    Json(well_known_links(&state.urls.nodeinfo()))
}

/// GET /api/v1/nodeinfo
///
/// Returns the NodeInfo 2.1 document. User counts are published only when
/// `federation.share_user_statistics` is set.
async fn nodeinfo(State(state): State<AppState>) -> Result<Json<NodeInfo>, FederationError> {
    let total_users = if state.config.federation.share_user_statistics {
        Some(state.db.count_local_users().await?)
    } else {
        None
    };

    Ok(Json(local_nodeinfo(
        &state.config.instance.software_name,
        &state.config.instance.name,
        total_users,
    )))
}
