//! E2E tests for federation scenarios
//!
//! These tests drive the delivery pipeline end to end:
//! - Follow → Accept delivered through pending → refresh → delivery
//! - Local user action → Create(Note) fanned out to remote followers
//! - Repository star → Like sent to followed remote repositories
//! - Follow/Unfollow of remote users
//! - Retries of failed refreshes and deliveries
//! - Refresh of federated user profiles

mod common;

use axum::http::StatusCode;
use common::{RemoteForge, TestServer, eventually};
use forgefed::data::{Database, HostStore, RepoStore, User, UserDirectory};
use forgefed::error::FederationError;
use forgefed::federation::{
    ActionRepo, DELIVERY_QUEUE, REFRESH_QUEUE, UserAction, UserActionKind,
};
use std::sync::Arc;
use serde_json::{Value, json};

/// Have `remote`'s person `id` follow `local` and wait for the Accept.
async fn remote_follows(
    server: &TestServer,
    remote: &RemoteForge,
    local: &User,
    id: i64,
    username: &str,
) -> (String, Value) {
    let actor = remote.add_person(id, username);
    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": format!("{}/follows/{}", actor, local.id),
        "type": "Follow",
        "actor": actor,
        "object": server.person_actor(local.id),
    });

    let before = remote.received().len();
    let response = remote
        .signed_post(
            &server.client,
            &format!("{}/inbox", server.person_actor(local.id)),
            &actor,
            &follow,
        )
        .await;
    assert_eq!(response.status(), 202);

    let received = remote.wait_for_received(before + 1).await;
    assert!(received.len() > before, "Accept was never delivered");
    (actor, received[before].body.clone())
}

fn star_action(server: &TestServer, doer: &User, is_private: bool) -> UserAction {
    UserAction {
        id: 11,
        actor_html_url: format!("{}/{}", server.addr, doer.name),
        actor_display_name: doer.name.clone(),
        repo: Some(ActionRepo {
            html_url: format!("{}/{}/forge", server.addr, doer.name),
            full_name: format!("{}/forge", doer.name),
            is_private,
            owner_private: false,
        }),
        kind: UserActionKind::StarRepo,
    }
}

// =============================================================================
// Scenario 1: Follow → Accept
// =============================================================================

#[tokio::test]
async fn test_accept_is_delivered_after_inbox_refresh() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();

    let (carol, accept) = remote_follows(&server, &remote, &alice, 40, "carol").await;

    assert_eq!(accept["type"], "Accept");
    assert_eq!(accept["actor"], server.person_actor(alice.id).as_str());
    assert!(
        accept["id"]
            .as_str()
            .unwrap()
            .starts_with(&format!("{}/follows/", server.person_actor(alice.id)))
    );
    assert_eq!(accept["object"]["type"], "Follow");
    assert_eq!(
        accept["object"]["id"],
        format!("{}/follows/{}", carol, alice.id).as_str()
    );
    assert!(accept["object"].get("@context").is_none());

    let received = remote.received();
    assert_eq!(received[0].path, "/api/v1/activitypub/user-id/40/inbox");
    let signature = received[0].signature.as_deref().unwrap();
    assert!(signature.contains(&format!("{}#main-key", server.person_actor(alice.id))));

    // The refresh stored the inbox it learned.
    let host = server
        .state
        .db
        .get_federation_host_by_fqdn("localhost")
        .await
        .unwrap()
        .unwrap();
    let (_, federated) = server
        .state
        .db
        .find_federated_user("40", host.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(federated.inbox(), Some(format!("{}/inbox", carol).as_str()));

    // Everything drained.
    let queues = server.state.queues.clone();
    assert!(
        eventually(|| {
            let queues = queues.clone();
            async move {
                queues.pending.len().await.unwrap() == 0
                    && queues.refresh.len().await.unwrap() == 0
                    && queues.delivery.len().await.unwrap() == 0
            }
        })
        .await
    );

    server.shutdown().await;
}

// =============================================================================
// Scenario 2: Local action → Create(Note)
// =============================================================================

#[tokio::test]
async fn test_user_action_is_announced_to_followers() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    remote_follows(&server, &remote, &alice, 40, "carol").await;

    let queued = server
        .state
        .processor
        .notify_followers(&alice, &star_action(&server, &alice, false))
        .await
        .unwrap();
    assert_eq!(queued, 1);

    let received = remote.wait_for_received(2).await;
    assert_eq!(received.len(), 2);
    let create = &received[1].body;
    assert_eq!(create["type"], "Create");
    let note_id = format!("{}/activities/11", server.person_actor(alice.id));
    assert_eq!(create["id"], format!("{}/activity", note_id).as_str());
    assert_eq!(create["object"]["id"], note_id.as_str());
    assert_eq!(create["object"]["type"], "Note");
    assert_eq!(
        create["to"][0],
        "https://www.w3.org/ns/activitystreams#Public"
    );
    assert_eq!(
        create["cc"][0],
        format!("{}/followers", server.person_actor(alice.id)).as_str()
    );
    assert!(
        create["object"]["content"]
            .as_str()
            .unwrap()
            .contains("starred a repository")
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_private_actions_are_not_announced() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    remote_follows(&server, &remote, &alice, 40, "carol").await;

    let queued = server
        .state
        .processor
        .notify_followers(&alice, &star_action(&server, &alice, true))
        .await
        .unwrap();
    assert_eq!(queued, 0);

    server
        .state
        .db
        .set_user_visibility(alice.id, false, true)
        .await
        .unwrap();
    let alice = server.state.db.get_user(alice.id).await.unwrap().unwrap();
    let queued = server
        .state
        .processor
        .notify_followers(&alice, &star_action(&server, &alice, false))
        .await
        .unwrap();
    assert_eq!(queued, 0);

    assert_eq!(server.state.queues.pending.len().await.unwrap(), 0);
    server.shutdown().await;
}

// =============================================================================
// Scenario 3: Star → Like to followed repositories
// =============================================================================

#[tokio::test]
async fn test_likes_are_sent_to_following_repositories() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();

    server
        .state
        .processor
        .store_following_repo_list(
            repo.id,
            &[remote.repository_actor(5), remote.repository_actor(6)],
        )
        .await
        .unwrap();
    let following = server.state.db.list_following_repos(repo.id).await.unwrap();
    assert_eq!(following.len(), 2);
    assert_eq!(following[0].external_id, "5");

    let queued = server
        .state
        .processor
        .send_like_activities(&alice, repo.id)
        .await
        .unwrap();
    assert_eq!(queued, 2);

    let received = remote.wait_for_received(2).await;
    assert_eq!(received.len(), 2);
    let mut paths: Vec<&str> = received.iter().map(|r| r.path.as_str()).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/api/v1/activitypub/repository-id/5/inbox",
            "/api/v1/activitypub/repository-id/6/inbox",
        ]
    );
    for activity in &received {
        assert_eq!(activity.body["type"], "Like");
        assert_eq!(activity.body["actor"], server.person_actor(alice.id).as_str());
        assert!(activity.body["startTime"].is_string());
    }

    server
        .state
        .processor
        .delete_following_repos(repo.id)
        .await
        .unwrap();
    assert!(
        server
            .state
            .db
            .list_following_repos(repo.id)
            .await
            .unwrap()
            .is_empty()
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_following_list_for_missing_repository_fails() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;

    let result = server
        .state
        .processor
        .store_following_repo_list(404, &[remote.repository_actor(5)])
        .await;
    assert!(matches!(result, Err(FederationError::NotFound)));
}

#[tokio::test]
async fn test_following_list_rejects_invalid_uri() {
    let server = TestServer::new().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let repo = server
        .state
        .db
        .create_repository(alice.id, "forge", false)
        .await
        .unwrap();

    let result = server
        .state
        .processor
        .store_following_repo_list(
            repo.id,
            &["https://user@remote.example/api/v1/activitypub/repository-id/1".to_string()],
        )
        .await;
    assert!(matches!(result, Err(FederationError::InvalidIdentity(_))));
}

// =============================================================================
// Scenario 4: Follow / Unfollow remote users
// =============================================================================

#[tokio::test]
async fn test_follow_and_unfollow_remote_user() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();
    let received = remote.wait_for_received(1).await;
    assert_eq!(received.len(), 1);
    let follow = received[0].body.clone();
    assert_eq!(follow["type"], "Follow");
    assert_eq!(follow["object"], carol.as_str());

    server
        .state
        .processor
        .unfollow_remote_user(&alice, &carol)
        .await
        .unwrap();
    let received = remote.wait_for_received(2).await;
    assert_eq!(received.len(), 2);
    let undo = &received[1].body;
    assert_eq!(undo["type"], "Undo");
    assert_eq!(undo["object"]["type"], "Follow");
    assert_eq!(undo["object"]["id"], follow["id"]);

    server.shutdown().await;
}

#[tokio::test]
async fn test_unfollow_unknown_remote_user_fails() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();

    let result = server
        .state
        .processor
        .unfollow_remote_user(&alice, &remote.person_actor(40))
        .await;
    assert!(matches!(result, Err(FederationError::NotFound)));
}

// =============================================================================
// Scenario 5: Queues without workers
// =============================================================================

#[tokio::test]
async fn test_items_stay_queued_without_workers() {
    let server = TestServer::with_config(|config| config.federation.enabled = false).await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();
    // Pushing the same Follow again is deduplicated.
    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(server.state.queues.pending.len().await.unwrap(), 1);
    assert!(remote.received().is_empty());
}

// =============================================================================
// Scenario 6: Failed refreshes and deliveries are retried
// =============================================================================

/// Wait until an item of `queue` has failed at least once with `error`.
async fn wait_for_failed_item(db: &Arc<Database>, queue: &'static str, error: &'static str) -> bool {
    let db = db.clone();
    eventually(move || {
        let db = db.clone();
        async move {
            db.list_queue_items(queue).await.unwrap().iter().any(|item| {
                item.attempts >= 1
                    && item
                        .last_error
                        .as_deref()
                        .is_some_and(|last_error| last_error.contains(error))
            })
        }
    })
    .await
}

#[tokio::test]
async fn test_rejected_delivery_stays_queued_until_inbox_recovers() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    remote.set_inbox_status(StatusCode::INTERNAL_SERVER_ERROR);
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();

    assert!(wait_for_failed_item(&server.state.db, DELIVERY_QUEUE, "answered 500").await);
    assert!(remote.received().is_empty());
    assert_eq!(server.state.queues.delivery.len().await.unwrap(), 1);

    remote.set_inbox_status(StatusCode::ACCEPTED);
    let received = remote.wait_for_received(1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body["type"], "Follow");

    let queues = server.state.queues.clone();
    assert!(
        eventually(|| {
            let queues = queues.clone();
            async move { queues.delivery.len().await.unwrap() == 0 }
        })
        .await
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_refresh_without_inbox_stays_queued() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    remote.set_publish_inbox(false);
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");

    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();

    assert!(wait_for_failed_item(&server.state.db, REFRESH_QUEUE, "publishes no inbox").await);
    assert_eq!(server.state.queues.pending.len().await.unwrap(), 1);
    assert!(remote.received().is_empty());

    let (_, federated) = server
        .state
        .processor
        .find_federated_user(&carol)
        .await
        .unwrap()
        .unwrap();
    assert!(federated.inbox().is_none());

    remote.set_publish_inbox(true);
    let received = remote.wait_for_received(1).await;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body["type"], "Follow");

    let (_, federated) = server
        .state
        .processor
        .find_federated_user(&carol)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(federated.inbox(), Some(format!("{}/inbox", carol).as_str()));

    server.shutdown().await;
}

// =============================================================================
// Scenario 7: Federated user profiles follow remote renames
// =============================================================================

#[tokio::test]
async fn test_profile_refresh_picks_up_remote_rename() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");
    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();

    // Nothing changed remotely yet.
    assert_eq!(
        server
            .state
            .processor
            .refresh_federated_user_profiles()
            .await
            .unwrap(),
        0
    );

    remote.add_person(40, "caroline");
    assert_eq!(
        server
            .state
            .processor
            .refresh_federated_user_profiles()
            .await
            .unwrap(),
        1
    );

    let (shadow, _) = server
        .state
        .processor
        .find_federated_user(&carol)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shadow.name, "caroline-localhost");
    assert_eq!(shadow.lower_name, "caroline-localhost");
    assert_eq!(shadow.full_name, "caroline (remote)");
    assert_eq!(shadow.login_name, "40-localhost");

    server.shutdown().await;
}

#[tokio::test]
async fn test_profile_refresh_skips_unreachable_users() {
    let server = TestServer::new().await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");
    let dave = remote.add_person(41, "dave");
    for actor in [&carol, &dave] {
        server
            .state
            .processor
            .follow_remote_user(&alice, actor)
            .await
            .unwrap();
    }

    // carol's document disappears, dave renames.
    remote.remove_person(40);
    remote.add_person(41, "david");

    let updated = server
        .state
        .processor
        .refresh_federated_user_profiles()
        .await
        .unwrap();
    assert_eq!(updated, 1);

    let (carol_shadow, _) = server
        .state
        .processor
        .find_federated_user(&carol)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(carol_shadow.name, "carol-localhost");

    server.shutdown().await;
}

#[tokio::test]
async fn test_runtime_refreshes_profiles_periodically() {
    let server =
        TestServer::with_config(|config| config.federation.profile_refresh_interval_secs = 1)
            .await;
    let remote = RemoteForge::start().await;
    let alice = server.state.db.create_local_user("alice").await.unwrap();
    let carol = remote.add_person(40, "carol");
    server
        .state
        .processor
        .follow_remote_user(&alice, &carol)
        .await
        .unwrap();

    remote.add_person(40, "caroline");

    let mut renamed = false;
    for _ in 0..50 {
        let (shadow, _) = server
            .state
            .processor
            .find_federated_user(&carol)
            .await
            .unwrap()
            .unwrap();
        if shadow.name == "caroline-localhost" {
            renamed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    assert!(renamed, "scheduled refresh never renamed the shadow user");

    server.shutdown().await;
}
