//! HTTP gateway tests against a mock record-storage service

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use recsync::gateway::auth::{TENANT_HEADER, TOKEN_HEADER};
use recsync::gateway::http::build_client;
use recsync::gateway::{
    Credentials, GatewayClient, HttpGateway, HttpGatewayConfig, RecordCategory, RecordStatus,
    TokenManager,
};

async fn gateway_for(server: &MockServer) -> HttpGateway {
    let base_url = Url::parse(&server.uri()).unwrap();
    let client = build_client(Duration::from_secs(5)).unwrap();
    let tokens = Arc::new(TokenManager::new(
        client.clone(),
        base_url.clone(),
        Credentials {
            tenant: "diku".to_string(),
            username: "sync_admin".to_string(),
            password: "secret".to_string(),
        },
        600,
    ));
    HttpGateway::new(
        client,
        HttpGatewayConfig {
            base_url,
            timeout: Duration::from_secs(5),
            identifier_field: "id".to_string(),
        },
        tokens,
    )
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/authn/login"))
        .respond_with(ResponseTemplate::new(201).insert_header(TOKEN_HEADER, "tok-1"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn fetch_existing_queries_by_identifier_list() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("GET"))
        .and(path("/item-storage/items"))
        .and(query_param("query", r#"id==("a" or "b")"#))
        .and(query_param("limit", "2"))
        .and(header(TENANT_HEADER, "diku"))
        .and(header_exists(TOKEN_HEADER))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"id": "a", "barcode": "1", "_version": 3}
            ],
            "totalRecords": 1
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let snapshots = gateway
        .fetch_existing(RecordCategory::Items, &["a".to_string(), "b".to_string()])
        .await
        .unwrap();

    assert_eq!(snapshots.len(), 1);
    let snapshot = &snapshots["a"];
    assert_eq!(snapshot.version, 3);
    assert_eq!(snapshot.value["barcode"], "1");
    assert!(!snapshots.contains_key("b"));
}

#[tokio::test]
async fn fetch_existing_with_no_ids_skips_the_network() {
    let server = MockServer::start().await;
    // no mocks mounted: any request would fail the test
    let gateway = gateway_for(&server).await;
    let snapshots = gateway
        .fetch_existing(RecordCategory::Items, &[])
        .await
        .unwrap();
    assert!(snapshots.is_empty());
}

#[tokio::test]
async fn submit_infers_statuses_from_version_tokens_on_bodyless_success() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/item-storage/batch/synchronous"))
        .and(query_param("upsert", "true"))
        .and(body_partial_json(json!({
            "items": [{"id": "new"}, {"id": "old"}]
        })))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let outcome = gateway
        .submit_batch(
            RecordCategory::Items,
            &[
                json!({"id": "new", "barcode": "1"}),
                json!({"id": "old", "barcode": "2", "_version": 4}),
            ],
            true,
        )
        .await
        .unwrap();

    let by_id = outcome.by_id();
    assert_eq!(by_id["new"], &RecordStatus::Created);
    assert_eq!(by_id["old"], &RecordStatus::Updated);
}

#[tokio::test]
async fn submit_maps_conflict_status_onto_every_record() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/item-storage/batch/synchronous"))
        .respond_with(
            ResponseTemplate::new(409).set_body_string("optimistic locking failure"),
        )
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let outcome = gateway
        .submit_batch(
            RecordCategory::Items,
            &[json!({"id": "a", "_version": 1}), json!({"id": "b", "_version": 2})],
            true,
        )
        .await
        .unwrap();

    assert!(outcome
        .statuses
        .iter()
        .all(|(_, status)| *status == RecordStatus::Conflict));
}

#[tokio::test]
async fn submit_honors_per_record_statuses_in_error_bodies() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/item-storage/batch/synchronous"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "errors": [
                {"id": "bad", "status": "rejected", "message": "missing barcode"}
            ],
            "results": [
                {"id": "fine", "status": "updated"}
            ]
        })))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let outcome = gateway
        .submit_batch(
            RecordCategory::Items,
            &[json!({"id": "fine", "_version": 1}), json!({"id": "bad"})],
            true,
        )
        .await
        .unwrap();

    let by_id = outcome.by_id();
    assert_eq!(by_id["fine"], &RecordStatus::Updated);
    assert_eq!(
        by_id["bad"],
        &RecordStatus::Rejected {
            reason: "missing barcode".to_string()
        }
    );
}

#[tokio::test]
async fn server_errors_surface_as_transient() {
    let server = MockServer::start().await;
    mount_login(&server).await;
    Mock::given(method("POST"))
        .and(path("/item-storage/batch/synchronous"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let err = gateway
        .submit_batch(RecordCategory::Items, &[json!({"id": "a"})], false)
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_and_the_request_replayed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authn/login"))
        .respond_with(ResponseTemplate::new(201).insert_header(TOKEN_HEADER, "tok-fresh"))
        .expect(2)
        .mount(&server)
        .await;
    // the first submission hits an expired session
    Mock::given(method("POST"))
        .and(path("/item-storage/batch/synchronous"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/item-storage/batch/synchronous"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let gateway = gateway_for(&server).await;
    let outcome = gateway
        .submit_batch(RecordCategory::Items, &[json!({"id": "a"})], false)
        .await
        .unwrap();
    assert_eq!(outcome.statuses[0].1, RecordStatus::Created);
}

#[tokio::test]
async fn upsert_against_unsupported_category_is_fatal() {
    let server = MockServer::start().await;
    let gateway = gateway_for(&server).await;
    let err = gateway
        .submit_batch(RecordCategory::Users, &[json!({"id": "u1"})], true)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert!(err.to_string().contains("does not support upsert"));
}
