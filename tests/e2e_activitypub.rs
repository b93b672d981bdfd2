//! E2E tests for ActivityPub endpoints
//!
//! Covers actor documents, inbox signature handling, and the
//! Like/Follow/Undo/Create flows against a mock remote forge.

mod common;

use chrono::{Duration, SecondsFormat, Utc};
use common::{RemoteForge, TestServer};
use forgefed::data::{HostStore, RepoStore, UserDirectory};
use forgefed::federation::{PUBLIC_COLLECTION, generate_key_pair};
use serde_json::{Value, json};

fn like(actor: &str, object: &str, start_time: chrono::DateTime<Utc>) -> Value {
    json!({
        "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
        "id": format!("{}/likes/{}", actor, start_time.timestamp()),
        "type": "Like",
        "actor": actor,
        "object": object,
        "startTime": start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

fn follow(actor: &str, object: &str) -> Value {
    json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/follows/1", actor),
        "type": "Follow",
        "actor": actor,
        "object": object,
    })
}

async fn error_label(response: reqwest::Response) -> String {
    let body: Value = response.json().await.unwrap();
    body["error"].as_str().unwrap_or_default().to_string()
}

// =============================================================================
// Actor documents
// =============================================================================

#[tokio::test]
async fn test_instance_actor_document() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/api/v1/activitypub/actor"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/activity+json"
    );
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Application");
    assert_eq!(json["id"], server.url("/api/v1/activitypub/actor"));
    assert_eq!(
        json["publicKey"]["id"],
        format!("{}#main-key", server.url("/api/v1/activitypub/actor"))
    );
    assert!(
        json["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY")
    );
}

#[tokio::test]
async fn test_person_document_for_local_user() {
    let server = TestServer::new().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();

    let response = server
        .client
        .get(&server.person_actor(alice.id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Person");
    assert_eq!(json["preferredUsername"], "alice");
    assert_eq!(json["inbox"], format!("{}/inbox", server.person_actor(alice.id)));
    assert_eq!(
        json["publicKey"]["owner"],
        server.person_actor(alice.id).as_str()
    );
}

#[tokio::test]
async fn test_person_document_unknown_user_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.person_actor(999))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_person_collections_resolve() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    let person: Value = server
        .client
        .get(&server.person_actor(alice.id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let outbox_url = person["outbox"].as_str().unwrap().to_string();
    let followers_url = person["followers"].as_str().unwrap().to_string();

    let response = server.client.get(&outbox_url).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "application/activity+json"
    );
    let outbox: Value = response.json().await.unwrap();
    assert_eq!(outbox["id"], outbox_url.as_str());
    assert_eq!(outbox["type"], "OrderedCollection");
    assert_eq!(outbox["totalItems"], 0);

    let inbox = format!("{}/inbox", server.person_actor(alice.id));
    let response = remote
        .signed_post(
            &server.client,
            &inbox,
            &carol,
            &follow(&carol, &server.person_actor(alice.id)),
        )
        .await;
    assert_eq!(response.status(), 202);

    let followers: Value = server
        .client
        .get(&followers_url)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(followers["id"], followers_url.as_str());
    assert_eq!(followers["totalItems"], 1);

    let response = server
        .client
        .get(&format!("{}/followers", server.person_actor(999)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_repository_document() {
    let server = TestServer::new().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();

    let response = server
        .client
        .get(&server.repository_actor(repo.id))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Repository");
    assert_eq!(json["name"], "forge");
    assert_eq!(json["attributedTo"], server.person_actor(alice.id).as_str());
}

// =============================================================================
// Signatures
// =============================================================================

#[tokio::test]
async fn test_inbox_rejects_unsigned_request() {
    let server = TestServer::new().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();

    let response = server
        .client
        .post(&format!("{}/inbox", server.person_actor(alice.id)))
        .header("Content-Type", "application/activity+json")
        .body(follow("https://remote.example/api/v1/activitypub/user-id/1", "x").to_string())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(error_label(response).await, "Invalid signature");
}

#[tokio::test]
async fn test_inbox_rejects_signature_from_wrong_key() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let bob = remote.add_person(30, "bob");
    let (other_private_key, _) = generate_key_pair(1024).unwrap();

    let response = remote
        .post_signed_with(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &bob,
            &follow(&bob, &server.person_actor(alice.id)),
            &other_private_key,
        )
        .await;

    assert_eq!(response.status(), 403);
    assert!(
        server
            .state
            .db
            .list_followers(alice.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_inbox_rejects_unresolvable_key() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    // Person 31 is never published, so its key cannot be fetched.
    let ghost = remote.person_actor(31);

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &ghost,
            &follow(&ghost, &server.person_actor(alice.id)),
        )
        .await;

    assert_eq!(response.status(), 400);
}

// =============================================================================
// Like
// =============================================================================

#[tokio::test]
async fn test_like_stars_repository_once_and_enforces_order() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();
    let bob = remote.add_person(30, "bob");
    let inbox = format!("{}/inbox", server.repository_actor(repo.id));
    let t0 = Utc::now() - Duration::seconds(30);

    // First Like creates the host, the shadow user and the star.
    let response = remote
        .signed_post(
            &server.client,
            &inbox,
            &bob,
            &like(&bob, &server.repository_actor(repo.id), t0),
        )
        .await;
    assert_eq!(response.status(), 204);
    assert_eq!(server.state.db.count_stars(repo.id).await.unwrap(), 1);

    let host = server
        .state
        .db
        .get_federation_host_by_fqdn("localhost")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(host.software_kind, "forgejo");
    assert_eq!(host.latest_activity.timestamp(), t0.timestamp());

    let (shadow, _) = server
        .state
        .db
        .find_federated_user("30", host.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shadow.name, "bob-localhost");
    assert_eq!(shadow.full_name, "bob (remote)");
    assert_eq!(shadow.login_name, "30-localhost");
    assert_eq!(shadow.normalized_federated_uri.as_deref(), Some(bob.as_str()));
    assert!(shadow.email.starts_with('f') && shadow.email.ends_with("@localhost"));

    // Same timestamp again is stale.
    let response = remote
        .signed_post(
            &server.client,
            &inbox,
            &bob,
            &like(&bob, &server.repository_actor(repo.id), t0),
        )
        .await;
    assert_eq!(response.status(), 406);
    assert_eq!(error_label(response).await, "Activity out of order.");

    // Newer Like is accepted without a second star.
    let t1 = t0 + Duration::seconds(1);
    let response = remote
        .signed_post(
            &server.client,
            &inbox,
            &bob,
            &like(&bob, &server.repository_actor(repo.id), t1),
        )
        .await;
    assert_eq!(response.status(), 204);
    assert_eq!(server.state.db.count_stars(repo.id).await.unwrap(), 1);

    let host = server
        .state
        .db
        .get_federation_host(host.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(host.latest_activity.timestamp(), t1.timestamp());

    // Discovery ran once; the host is cached afterwards.
    assert_eq!(remote.nodeinfo_hits(), 1);
}

#[tokio::test]
async fn test_like_from_the_future_is_rejected() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();
    let bob = remote.add_person(30, "bob");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.repository_actor(repo.id)),
            &bob,
            &like(
                &bob,
                &server.repository_actor(repo.id),
                Utc::now() + Duration::minutes(30),
            ),
        )
        .await;

    assert_eq!(response.status(), 406);
    assert_eq!(error_label(response).await, "Invalid activity");
    assert_eq!(server.state.db.count_stars(repo.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_like_for_other_repository_is_rejected() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();
    let other = server
        .state
        .db
        .create_repository(alice.id, "other", false)
        .await
        .unwrap();
    let bob = remote.add_person(30, "bob");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.repository_actor(repo.id)),
            &bob,
            &like(&bob, &server.repository_actor(other.id), Utc::now()),
        )
        .await;

    assert_eq!(response.status(), 406);
    assert_eq!(error_label(response).await, "Invalid objectId");
    assert_eq!(server.state.db.count_stars(repo.id).await.unwrap(), 0);
    assert_eq!(server.state.db.count_stars(other.id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_like_for_missing_repository_is_404() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let bob = remote.add_person(30, "bob");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.repository_actor(404)),
            &bob,
            &like(&bob, &server.repository_actor(404), Utc::now()),
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_like_from_unsupported_software_fails() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start_with_software("mastodon").await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();
    let bob = remote.add_person(30, "bob");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.repository_actor(repo.id)),
            &bob,
            &like(&bob, &server.repository_actor(repo.id), Utc::now()),
        )
        .await;

    assert_eq!(response.status(), 500);
    assert_eq!(error_label(response).await, "Wrong FederationHost");
    assert!(
        server
            .state
            .db
            .get_federation_host_by_fqdn("localhost")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_repository_inbox_rejects_follow() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();
    let bob = remote.add_person(30, "bob");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.repository_actor(repo.id)),
            &bob,
            &follow(&bob, &server.repository_actor(repo.id)),
        )
        .await;

    assert_eq!(response.status(), 406);
    assert_eq!(error_label(response).await, "Unsupported activity");
}

// =============================================================================
// Follow / Undo
// =============================================================================

#[tokio::test]
async fn test_follow_then_undo() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");
    let inbox = format!("{}/inbox", server.person_actor(alice.id));
    let follow_activity = follow(&carol, &server.person_actor(alice.id));

    let response = remote
        .signed_post(&server.client, &inbox, &carol, &follow_activity)
        .await;
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "status": "Accepted" }));
    assert_eq!(server.state.db.list_followers(alice.id).await.unwrap().len(), 1);

    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/undo/1", carol),
        "type": "Undo",
        "actor": carol,
        "object": follow_activity,
    });
    let response = remote.signed_post(&server.client, &inbox, &carol, &undo).await;
    assert_eq!(response.status(), 204);
    assert!(
        server
            .state
            .db
            .list_followers(alice.id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_undo_without_follow_is_noop() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    let undo = json!({
        "type": "Undo",
        "actor": carol,
        "object": follow(&carol, &server.person_actor(alice.id)),
    });
    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &carol,
            &undo,
        )
        .await;

    assert_eq!(response.status(), 204);
    // No shadow user is created for an Undo.
    assert!(
        server
            .state
            .db
            .get_federation_host_by_fqdn("localhost")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_follow_of_another_user_is_rejected() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let dave = server.state.db.create_local_user("dave").await.unwrap();
    let carol = remote.add_person(40, "carol");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &carol,
            &follow(&carol, &server.person_actor(dave.id)),
        )
        .await;

    assert_eq!(response.status(), 406);
    assert_eq!(error_label(response).await, "Wrong user to follow");
}

#[tokio::test]
async fn test_person_inbox_of_unknown_user_is_404() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let carol = remote.add_person(40, "carol");

    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(77)),
            &carol,
            &follow(&carol, &server.person_actor(77)),
        )
        .await;

    assert_eq!(response.status(), 404);
    assert_eq!(error_label(response).await, "User not found");
}

#[tokio::test]
async fn test_unsupported_activity_type() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    let announce = json!({
        "type": "Announce",
        "actor": carol,
        "object": "https://elsewhere.example/notes/1",
    });
    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &carol,
            &announce,
        )
        .await;

    assert_eq!(response.status(), 406);
    assert_eq!(error_label(response).await, "Unsupported activity");
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_note_is_sanitized_and_stored() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");
    let note_id = format!("{}/activities/7", carol);

    let create = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/activity", note_id),
        "type": "Create",
        "actor": carol,
        "to": [PUBLIC_COLLECTION],
        "cc": [format!("{}/followers", carol)],
        "object": {
            "id": note_id,
            "type": "Note",
            "content": "<p>pushed to <b>main</b></p><script>alert(1)</script>",
            "url": format!("{}/carol/forge/commit/abc", remote.base_url),
            "attributedTo": carol,
        },
    });
    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &carol,
            &create,
        )
        .await;
    assert_eq!(response.status(), 204);

    let activities = server
        .state
        .db
        .list_user_activities(alice.id, 10, 0)
        .await
        .unwrap();
    assert_eq!(activities.len(), 1);
    let stored = &activities[0];
    assert_eq!(stored.actor_uri, carol);
    assert!(stored.note_content.contains("<b>main</b>"));
    assert!(!stored.note_content.contains("<script>"));
    assert_eq!(
        stored.note_url,
        format!("{}/carol/forge/commit/abc", remote.base_url)
    );
    let original: Value = serde_json::from_str(&stored.original_note).unwrap();
    assert_eq!(original["id"], note_id.as_str());
}

#[tokio::test]
async fn test_create_without_note_is_rejected() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    let create = json!({
        "id": format!("{}/activities/8/activity", carol),
        "type": "Create",
        "actor": carol,
        "to": [PUBLIC_COLLECTION],
        "cc": [format!("{}/followers", carol)],
        "object": { "id": "x", "type": "Image" },
    });
    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(alice.id)),
            &carol,
            &create,
        )
        .await;

    assert_eq!(response.status(), 406);
    assert_eq!(
        error_label(response).await,
        "Invalid object type for Create activity"
    );
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let server = TestServer::with_config(|config| config.federation.max_size = 1024).await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();

    let response = server
        .client
        .post(&format!("{}/inbox", server.person_actor(alice.id)))
        .header("Content-Type", "application/activity+json")
        .body("x".repeat(4096))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
}
