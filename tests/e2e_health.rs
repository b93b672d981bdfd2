//! E2E tests for health check and basic server functionality

mod common;

use common::TestServer;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, "OK");

    server.shutdown().await;
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_health_with_federation_disabled() {
    let server = TestServer::with_config(|config| config.federation.enabled = false).await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_404_for_unknown_routes() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/unknown/route"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);

    server.shutdown().await;
}
