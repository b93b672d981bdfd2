//! ActivityPub endpoints
//!
//! - Instance service actor
//! - Person and Repository actors
//! - Person and Repository inboxes (signed)
//! - Person outbox and followers collections (counts only)

use axum::body::Bytes;
use axum::extract::OriginalUri;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::AppState;
use crate::data::{RepoStore, User, UserDirectory};
use crate::error::{FederationError, Rejection};
use crate::federation::{ACTIVITY_JSON, InboundActivity, InboxOutcome, builder};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUESTS_TOTAL,
};

/// Create ActivityPub router
///
/// Routes:
/// - GET /api/v1/activitypub/actor - Instance service actor
/// - GET /api/v1/activitypub/user-id/:id - Person actor
/// - POST /api/v1/activitypub/user-id/:id/inbox - Person inbox
/// - GET /api/v1/activitypub/user-id/:id/outbox - Person outbox
/// - GET /api/v1/activitypub/user-id/:id/followers - Person followers
/// - GET /api/v1/activitypub/repository-id/:id - Repository actor
/// - POST /api/v1/activitypub/repository-id/:id/inbox - Repository inbox
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/activitypub/actor", get(instance_actor))
        .route("/api/v1/activitypub/user-id/:id", get(person))
        .route("/api/v1/activitypub/user-id/:id/inbox", post(person_inbox))
        .route("/api/v1/activitypub/user-id/:id/outbox", get(person_outbox))
        .route(
            "/api/v1/activitypub/user-id/:id/followers",
            get(person_followers),
        )
        .route("/api/v1/activitypub/repository-id/:id", get(repository))
        .route(
            "/api/v1/activitypub/repository-id/:id/inbox",
            post(repository_inbox),
        )
}

/// `application/activity+json` response
struct ActivityJson(serde_json::Value);

impl IntoResponse for ActivityJson {
    fn into_response(self) -> Response {
        let mut response = Json(self.0).into_response();
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
        response
    }
}

/// GET /api/v1/activitypub/actor
async fn instance_actor(State(state): State<AppState>) -> Result<ActivityJson, FederationError> {
    let public_key_pem = state.keys.instance_public_key().await?;
    let document = builder::application_document(
        &state.urls.instance_actor(),
        &state.config.instance.name,
        &public_key_pem,
    );

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/v1/activitypub/actor", "200"])
        .inc();
    Ok(ActivityJson(document))
}

/// GET /api/v1/activitypub/user-id/:id
///
/// Only local users have a Person document here; shadow users of remote
/// actors are served by their home instance.
async fn person(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<ActivityJson, FederationError> {
    let user = local_user(&state, user_id).await?;

    let public_key_pem = state.keys.user_public_key(user.id).await?;
    let display_name = if user.full_name.is_empty() {
        user.name.as_str()
    } else {
        user.full_name.as_str()
    };
    let document = builder::person_document(
        &state.urls.person_actor(user.id),
        &user.name,
        display_name,
        &public_key_pem,
    );

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/v1/activitypub/user-id/:id", "200"])
        .inc();
    Ok(ActivityJson(document))
}

/// Local user by id; shadow users of remote actors are not served.
async fn local_user(state: &AppState, user_id: i64) -> Result<User, FederationError> {
    state
        .db
        .get_user(user_id)
        .await?
        .filter(|user| !user.is_remote())
        .ok_or(FederationError::NotFound)
}

/// GET /api/v1/activitypub/user-id/:id/outbox
///
/// Activities are pushed to followers, never published here, so the
/// outbox is always empty.
async fn person_outbox(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<ActivityJson, FederationError> {
    let user = local_user(&state, user_id).await?;
    let document =
        builder::ordered_collection(&format!("{}/outbox", state.urls.person_actor(user.id)), 0);

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/v1/activitypub/user-id/:id/outbox", "200"])
        .inc();
    Ok(ActivityJson(document))
}

/// GET /api/v1/activitypub/user-id/:id/followers
async fn person_followers(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<ActivityJson, FederationError> {
    let user = local_user(&state, user_id).await?;
    let followers = state.db.list_followers(user.id).await?;
    let document = builder::ordered_collection(
        &format!("{}/followers", state.urls.person_actor(user.id)),
        followers.len(),
    );

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/v1/activitypub/user-id/:id/followers", "200"])
        .inc();
    Ok(ActivityJson(document))
}

/// GET /api/v1/activitypub/repository-id/:id
async fn repository(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
) -> Result<ActivityJson, FederationError> {
    let repo = state
        .db
        .get_repository(repo_id)
        .await?
        .ok_or(FederationError::NotFound)?;

    let document = builder::repository_document(
        &state.urls.repository_actor(repo.id),
        &repo.name,
        &state.urls.person_actor(repo.owner_id),
    );

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/api/v1/activitypub/repository-id/:id", "200"])
        .inc();
    Ok(ActivityJson(document))
}

/// POST /api/v1/activitypub/user-id/:id/inbox
async fn person_inbox(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let result = match verified_activity(&state, &uri, &headers, &body).await {
        Ok(activity) => {
            tracing::debug!(user_id, kind = activity.kind(), actor = %activity.actor(), "Person inbox");
            state.processor.process_person_inbox(user_id, activity).await
        }
        Err(rejection) => Err(rejection),
    };
    inbox_response("/api/v1/activitypub/user-id/:id/inbox", result)
}

/// POST /api/v1/activitypub/repository-id/:id/inbox
async fn repository_inbox(
    State(state): State<AppState>,
    Path(repo_id): Path<i64>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let result = match verified_activity(&state, &uri, &headers, &body).await {
        Ok(activity) => {
            tracing::debug!(repo_id, kind = activity.kind(), actor = %activity.actor(), "Repository inbox");
            state
                .processor
                .process_repository_inbox(repo_id, activity)
                .await
        }
        Err(rejection) => Err(rejection),
    };
    inbox_response("/api/v1/activitypub/repository-id/:id/inbox", result)
}

/// Check the request signature, then decode the body.
///
/// An unverifiable signature is a 400, a signature that does not match the
/// signer's key is a 403.
async fn verified_activity(
    state: &AppState,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<InboundActivity, Rejection> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    match state
        .verifier
        .verify("POST", path_and_query, headers, Some(body))
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(path = %path_and_query, "Inbox signature mismatch");
            return Err(Rejection::new(
                StatusCode::FORBIDDEN,
                "Invalid signature",
                FederationError::AuthenticationFailed(
                    "signature does not match the signer's key".to_string(),
                ),
            ));
        }
        Err(e) => {
            tracing::info!(path = %path_and_query, error = %e, "Inbox signature rejected");
            return Err(Rejection::new(
                StatusCode::BAD_REQUEST,
                "Invalid signature",
                e,
            ));
        }
    }

    InboundActivity::decode(body)
}

fn inbox_response(
    endpoint: &str,
    result: Result<InboxOutcome, Rejection>,
) -> Response {
    let response = match result {
        Ok(InboxOutcome::NoContent) => StatusCode::NO_CONTENT.into_response(),
        Ok(InboxOutcome::Accepted) => {
            let mut response = (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "status": "Accepted" })),
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(ACTIVITY_JSON));
            response
        }
        Err(rejection) => rejection.into_response(),
    };

    let status = response.status();
    let outcome = if status.is_success() {
        "accepted"
    } else if status == StatusCode::BAD_REQUEST || status == StatusCode::FORBIDDEN {
        "unauthorized"
    } else {
        "rejected"
    };
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["inbound", outcome])
        .inc();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, status.as_str()])
        .inc();
    response
}
