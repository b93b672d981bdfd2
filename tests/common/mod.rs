//! Common test utilities for E2E tests
//!
//! `TestServer` runs the forge under test; `RemoteForge` is a minimal
//! remote instance serving NodeInfo, Person documents and an inbox that
//! records what it receives.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use forgefed::federation::{
    ACTIVITY_JSON, FederationRuntime, SignatureAlgorithm, generate_key_pair, sign_request,
};
use forgefed::{AppState, config};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
    runtime: Option<FederationRuntime>,
}

impl TestServer {
    /// Create a new test server with delivery workers running
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server after applying `customize` to the default test config
    pub async fn with_config(customize: impl FnOnce(&mut config::AppConfig)) -> Self {
        // Create temporary directory for test database
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        // Bind first: the public domain must carry the real port so that
        // signatures over the Host header line up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut config = test_config(db_path, port);
        customize(&mut config);

        // Initialize app state
        let state = AppState::new(config).await.unwrap();
        let runtime = state.start_federation_runtime();

        // Create HTTP client
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        let app = forgefed::build_router(state.clone());

        // Spawn server in background
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr: format!("http://localhost:{}", port),
            state,
            _temp_dir: temp_dir,
            client,
            runtime,
        }
    }

    /// Get base URL for API requests
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    pub fn person_actor(&self, user_id: i64) -> String {
        self.state.urls.person_actor(user_id)
    }

    pub fn repository_actor(&self, repo_id: i64) -> String {
        self.state.urls.repository_actor(repo_id)
    }

    /// Stop the delivery workers
    pub async fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
    }
}

fn test_config(db_path: std::path::PathBuf, port: u16) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
            domain: format!("localhost:{}", port),
            protocol: "http".to_string(),
        },
        database: config::DatabaseConfig { path: db_path },
        instance: config::InstanceConfig {
            name: "forgefed-test".to_string(),
            software_name: "forgejo".to_string(),
            key_bits: 1024,
        },
        federation: config::FederationConfig {
            enabled: true,
            share_user_statistics: true,
            max_size: 64 * 1024,
            algorithms: vec!["rsa-sha256".to_string(), "rsa-sha512".to_string()],
            clock_skew_secs: 300,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            allow_private_networks: true,
            public_key_cache_ttl_secs: 3600,
            profile_refresh_interval_secs: 0,
            queue: config::QueueConfig {
                pending_workers: 1,
                refresh_workers: 1,
                delivery_workers: 1,
                batch_size: 10,
                poll_interval_ms: 50,
                lease_secs: 60,
                base_backoff_secs: 0,
                max_backoff_secs: 1,
                max_attempts: 0,
            },
        },
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

/// Activity received by the remote forge
#[derive(Debug, Clone)]
pub struct ReceivedActivity {
    pub path: String,
    pub body: Value,
    pub signature: Option<String>,
}

struct RemoteState {
    base_url: String,
    software: String,
    public_key_pem: String,
    persons: Mutex<HashMap<i64, String>>,
    received: Mutex<Vec<ReceivedActivity>>,
    nodeinfo_hits: Mutex<usize>,
    inbox_status: Mutex<StatusCode>,
    publish_inbox: Mutex<bool>,
}

/// Mock remote forge
pub struct RemoteForge {
    pub base_url: String,
    pub private_key_pem: String,
    state: Arc<RemoteState>,
}

impl RemoteForge {
    /// Start a remote forge advertising `forgejo` through NodeInfo
    pub async fn start() -> Self {
        Self::start_with_software("forgejo").await
    }

    pub async fn start_with_software(software: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://localhost:{}", port);
        let (private_key_pem, public_key_pem) = generate_key_pair(1024).unwrap();

        let state = Arc::new(RemoteState {
            base_url: base_url.clone(),
            software: software.to_string(),
            public_key_pem,
            persons: Mutex::new(HashMap::new()),
            received: Mutex::new(Vec::new()),
            nodeinfo_hits: Mutex::new(0),
            inbox_status: Mutex::new(StatusCode::ACCEPTED),
            publish_inbox: Mutex::new(true),
        });

        let app = Router::new()
            .route("/.well-known/nodeinfo", get(remote_nodeinfo_links))
            .route("/api/v1/nodeinfo", get(remote_nodeinfo))
            .route("/api/v1/activitypub/user-id/:id", get(remote_person))
            .route(
                "/api/v1/activitypub/user-id/:id/inbox",
                post(remote_person_inbox),
            )
            .route(
                "/api/v1/activitypub/repository-id/:id/inbox",
                post(remote_repository_inbox),
            )
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            private_key_pem,
            state,
        }
    }

    /// Publish a Person with `preferredUsername = username`
    pub fn add_person(&self, id: i64, username: &str) -> String {
        self.state
            .persons
            .lock()
            .unwrap()
            .insert(id, username.to_string());
        self.person_actor(id)
    }

    /// Stop publishing the Person document of `id`
    pub fn remove_person(&self, id: i64) {
        self.state.persons.lock().unwrap().remove(&id);
    }

    pub fn person_actor(&self, id: i64) -> String {
        format!("{}/api/v1/activitypub/user-id/{}", self.base_url, id)
    }

    /// Status the inboxes answer with; anything but 2xx records nothing
    pub fn set_inbox_status(&self, status: StatusCode) {
        *self.state.inbox_status.lock().unwrap() = status;
    }

    /// Whether Person documents carry an `inbox`
    pub fn set_publish_inbox(&self, publish: bool) {
        *self.state.publish_inbox.lock().unwrap() = publish;
    }

    pub fn repository_actor(&self, id: i64) -> String {
        format!("{}/api/v1/activitypub/repository-id/{}", self.base_url, id)
    }

    pub fn received(&self) -> Vec<ReceivedActivity> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn nodeinfo_hits(&self) -> usize {
        *self.state.nodeinfo_hits.lock().unwrap()
    }

    /// Wait until the inbox recorder holds at least `count` activities
    pub async fn wait_for_received(&self, count: usize) -> Vec<ReceivedActivity> {
        for _ in 0..200 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        self.received()
    }

    /// POST `activity` to `url`, signed with the key of `actor`
    pub async fn signed_post(
        &self,
        client: &reqwest::Client,
        url: &str,
        actor: &str,
        activity: &Value,
    ) -> reqwest::Response {
        self.post_signed_with(client, url, actor, activity, &self.private_key_pem)
            .await
    }

    /// POST signed with an arbitrary private key under `actor`'s keyId
    pub async fn post_signed_with(
        &self,
        client: &reqwest::Client,
        url: &str,
        actor: &str,
        activity: &Value,
        private_key_pem: &str,
    ) -> reqwest::Response {
        let body = serde_json::to_vec(activity).unwrap();
        let headers = sign_request(
            "POST",
            url,
            Some(&body),
            private_key_pem,
            &format!("{}#main-key", actor),
            SignatureAlgorithm::RsaSha256,
        )
        .unwrap();

        let mut request = client
            .post(url)
            .header("Content-Type", ACTIVITY_JSON)
            .header("Date", headers.date)
            .header("Signature", headers.signature);
        if let Some(digest) = headers.digest {
            request = request.header("Digest", digest);
        }
        request.body(body).send().await.unwrap()
    }
}

async fn remote_nodeinfo_links(State(state): State<Arc<RemoteState>>) -> Json<Value> {
    *state.nodeinfo_hits.lock().unwrap() += 1;
    Json(json!({
        "links": [{
            "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
            "href": format!("{}/api/v1/nodeinfo", state.base_url),
        }]
    }))
}

async fn remote_nodeinfo(State(state): State<Arc<RemoteState>>) -> Json<Value> {
    Json(json!({
        "version": "2.1",
        "software": { "name": state.software, "version": "9.0.0" },
        "protocols": ["activitypub"],
        "openRegistrations": false,
        "usage": { "users": {} },
        "metadata": {},
    }))
}

async fn remote_person(
    State(state): State<Arc<RemoteState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    let Some(username) = state.persons.lock().unwrap().get(&id).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let actor = format!("{}/api/v1/activitypub/user-id/{}", state.base_url, id);
    let mut person = json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": actor,
        "type": "Person",
        "preferredUsername": username,
        "name": format!("{} (remote)", username),
        "publicKey": {
            "id": format!("{}#main-key", actor),
            "owner": actor,
            "publicKeyPem": state.public_key_pem,
        },
    });
    if *state.publish_inbox.lock().unwrap() {
        person["inbox"] = json!(format!("{}/inbox", actor));
    }
    ([("Content-Type", ACTIVITY_JSON)], Json(person)).into_response()
}

async fn remote_person_inbox(
    State(state): State<Arc<RemoteState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(&state, format!("/api/v1/activitypub/user-id/{}/inbox", id), &headers, &body)
}

async fn remote_repository_inbox(
    State(state): State<Arc<RemoteState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    record(
        &state,
        format!("/api/v1/activitypub/repository-id/{}/inbox", id),
        &headers,
        &body,
    )
}

fn record(state: &RemoteState, path: String, headers: &HeaderMap, body: &[u8]) -> StatusCode {
    let status = *state.inbox_status.lock().unwrap();
    if !status.is_success() {
        return status;
    }
    let Ok(body) = serde_json::from_slice::<Value>(body) else {
        return StatusCode::BAD_REQUEST;
    };
    let signature = headers
        .get("signature")
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    state.received.lock().unwrap().push(ReceivedActivity {
        path,
        body,
        signature,
    });
    StatusCode::ACCEPTED
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
