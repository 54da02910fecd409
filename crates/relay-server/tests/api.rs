use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use httpmock::prelude::*;
use relay_config::{CaseApi, Config, Redelivery, Secrets, Server, Store};
use relay_contracts::{ActionType, API_VERSION};
use relay_server::{build_app, router, Outcome, Relay, RelayError};
use serde_json::{json, Value};
use tower::util::ServiceExt;

const CREATE_UNIT_EVENT: &str = r#"{
  "city": "",
  "name": "HK_HKG_12ST - 1",
  "type": "Condominium",
  "state": null,
  "country": "Hong Kong",
  "ownerId": "NXnKGEdEwEvMgWQtG",
  "moreInfo": " ",
  "actionType": "CREATE_UNIT",
  "streetAddress": "12 Staunton Street",
  "mefeAPIRequestId": "x1",
  "unitCreationRequestId": 4771
}"#;

const NOTIFICATION_EVENT: &str = r#"{
  "bz_source_table": "ut_notification_message_new",
  "case_id": 70175,
  "notification_id": "ut_notification_message_new-80675",
  "notification_type": "case_new_message",
  "unit_id": 818
}"#;

fn test_config(base_url: &str) -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        case_api: CaseApi {
            base_url: base_url.to_string(),
            token_env: "RELAY_TEST_TOKEN".to_string(),
            timeout_ms: 2_000,
        },
        store: Store {
            kind: "memory".to_string(),
            url_env: None,
            sqlite_path: None,
            max_connections: 1,
            statement_mode: "bound".to_string(),
        },
        redelivery: Redelivery::default(),
    }
}

fn test_config_sqlite(base_url: &str) -> Config {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    let mut cfg = test_config(base_url);
    cfg.store.kind = "sqlite".to_string();
    cfg.store.sqlite_path = Some(
        std::env::temp_dir()
            .join(format!("relay-replies-{nanos}.db"))
            .to_string_lossy()
            .to_string(),
    );
    cfg
}

fn secrets() -> Secrets {
    Secrets {
        api_token: Some("test-token".to_string()),
        database_url: None,
    }
}

async fn relay(cfg: &Config) -> Arc<Relay> {
    Arc::new(Relay::init(cfg, &secrets()).await.expect("relay init"))
}

async fn post_event(relay: &Arc<Relay>, body: &str) -> (StatusCode, Value) {
    let response = router(relay.clone())
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/events")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config("http://127.0.0.1:1"), secrets())
        .await
        .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn created_unit_is_recorded_and_acknowledged() {
    let server = MockServer::start();
    let api = server.mock(|when, then| {
        when.method(POST)
            .path("/api/process-api-payload")
            .header("authorization", "Bearer test-token")
            .header("content-type", "application/json")
            .body(CREATE_UNIT_EVENT);
        then.status(201).json_body(json!({
            "unitMongoId": "abc123",
            "timestamp": "2020-01-01 00:00:00"
        }));
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let (status, payload) = post_event(&relay, CREATE_UNIT_EVENT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["outcome"], "applied");
    assert_eq!(payload["action_type"], "CREATE_UNIT");
    assert_eq!(payload["request_id"], 4771);
    assert_eq!(payload["created_here"], true);
    assert_eq!(payload["event_digest"].as_str().unwrap().len(), 64);
    assert_eq!(payload["api_version"], API_VERSION);
    assert_eq!(api.calls(), 1);

    let rows = relay.store().recorded().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].procedure, "ut_creation_unit_mefe_api_reply");
    assert_eq!(
        rows[0].params,
        json!({
            "unit_creation_request_id": 4771,
            "mefe_unit_id": "abc123",
            "creation_datetime": "2020-01-01 00:00:00",
            "is_created_by_me": 1,
            "mefe_api_error_message": ""
        })
    );
}

#[tokio::test]
async fn upstream_server_error_is_recorded_then_redelivered() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(500).body("\"boom\"");
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let (status, payload) = post_event(&relay, CREATE_UNIT_EVENT).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["error"]["code"], "upstream.unavailable");
    assert_eq!(payload["error"]["details"]["redeliver"], true);

    let rows = relay.store().recorded().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].error_message.contains("500 Internal Server Error"));
    assert!(rows[0].error_message.contains("\"boom\""));
    assert_eq!(rows[0].params["is_created_by_me"], 0);
    assert_eq!(rows[0].params["mefe_unit_id"], "");
}

#[tokio::test]
async fn upstream_client_error_is_recorded_without_redelivery() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(400).body("invalid unit");
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let invocation = relay.invoke(CREATE_UNIT_EVENT.as_bytes()).await;
    assert_eq!(
        invocation.result.unwrap(),
        Outcome::UpstreamRejected {
            action_type: ActionType::CreateUnit,
            request_id: 4771,
            status: 400,
        }
    );
    let rows = relay.store().recorded().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].error_message.contains("invalid unit"));
}

#[tokio::test]
async fn upstream_threshold_follows_policy() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(429).body("slow down");
    });
    let mut cfg = test_config(&server.base_url());
    cfg.redelivery = Redelivery {
        upstream_min_status: 429,
        forward_failures: false,
    };
    let relay = relay(&cfg).await;

    let invocation = relay.invoke(CREATE_UNIT_EVENT.as_bytes()).await;
    assert!(matches!(
        invocation.result,
        Err(RelayError::Upstream { status: 429, .. })
    ));
}

#[tokio::test]
async fn duplicate_reply_is_treated_as_already_applied() {
    let server = MockServer::start();
    let api = server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(200).json_body(json!({
            "unitMongoId": "abc123",
            "timestamp": "2020-01-01T00:00:00Z"
        }));
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let first = relay.invoke(CREATE_UNIT_EVENT.as_bytes()).await;
    assert!(matches!(
        first.result,
        Ok(Outcome::Applied {
            created_here: false,
            ..
        })
    ));

    let (status, payload) = post_event(&relay, CREATE_UNIT_EVENT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["outcome"], "duplicate_reply");
    assert_eq!(api.calls(), 2);
    assert_eq!(relay.store().recorded().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sqlite_duplicate_reply_is_treated_as_already_applied() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(201).json_body(json!({
            "userId": "user-1",
            "timestamp": "2020-01-01T00:00:00Z",
            "mefeApiKey": "key-1"
        }));
    });
    let cfg = test_config_sqlite(&server.base_url());
    let event = r#"{"actionType":"CREATE_USER","mefeAPIRequestId":"x9","userCreationRequestId":31}"#;

    let first = relay(&cfg).await;
    assert!(matches!(
        first.invoke(event.as_bytes()).await.result,
        Ok(Outcome::Applied { .. })
    ));

    // a fresh instance over the same journal, as after a cold start
    let second = relay(&cfg).await;
    assert_eq!(
        second.invoke(event.as_bytes()).await.result.unwrap(),
        Outcome::DuplicateReply {
            action_type: ActionType::CreateUser,
            request_id: 31,
        }
    );
    let rows = second.store().recorded().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].params["mefe_user_id"], "user-1");
    assert_eq!(rows[0].params["mefe_user_api_key"], "key-1");
}

#[tokio::test]
async fn unknown_action_type_never_reaches_network_or_store() {
    let server = MockServer::start();
    let any = server.mock(|_when, then| {
        then.status(500);
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let (status, payload) = post_event(
        &relay,
        r#"{"actionType":"FOO","mefeAPIRequestId":"x1","unitCreationRequestId":1}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["outcome"], "rejected");
    assert_eq!(payload["code"], "validation.unknown_action_type");
    assert_eq!(any.calls(), 0);
    assert!(relay.store().recorded().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_request_id_is_rejected_before_any_call() {
    let server = MockServer::start();
    let any = server.mock(|_when, then| {
        then.status(201).json_body(json!({}));
    });
    let relay = relay(&test_config(&server.base_url())).await;

    for t in ActionType::ALL {
        let event = json!({"actionType": t.as_str(), "mefeAPIRequestId": "x1"}).to_string();
        let invocation = relay.invoke(event.as_bytes()).await;
        assert_eq!(
            invocation.result.unwrap(),
            Outcome::Rejected {
                code: "validation.missing_field".to_string(),
                reason: format!("missing {}", t.request_id_field()),
            }
        );
    }
    assert_eq!(any.calls(), 0);
    assert!(relay.store().recorded().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_credential_fails_fast() {
    let server = MockServer::start();
    let any = server.mock(|_when, then| {
        then.status(201).json_body(json!({}));
    });
    let cfg = test_config(&server.base_url());
    let relay = Relay::init(&cfg, &Secrets::default()).await.unwrap();

    let invocation = relay.invoke(CREATE_UNIT_EVENT.as_bytes()).await;
    assert!(!invocation.redeliver());
    assert!(matches!(
        invocation.result,
        Ok(Outcome::Rejected { ref code, .. }) if code == "config.missing_credential"
    ));
    assert_eq!(any.calls(), 0);
}

#[tokio::test]
async fn transport_failure_is_redelivered() {
    // nothing listens on port 1
    let relay = relay(&test_config("http://127.0.0.1:1")).await;

    let (status, payload) = post_event(&relay, CREATE_UNIT_EVENT).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["error"]["code"], "network.error");
    assert!(relay.store().recorded().await.unwrap().is_empty());
}

#[tokio::test]
async fn unparseable_success_body_is_redelivered() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(201).body("not json");
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let invocation = relay.invoke(CREATE_UNIT_EVENT.as_bytes()).await;
    assert!(matches!(invocation.result, Err(RelayError::Parse(_))));
    assert!(relay.store().recorded().await.unwrap().is_empty());
}

#[tokio::test]
async fn change_message_is_forwarded_verbatim() {
    let server = MockServer::start();
    let action = server.mock(|when, then| {
        when.method(POST).path("/api/process-api-payload");
        then.status(201).json_body(json!({}));
    });
    let change = server.mock(|when, then| {
        when.method(POST)
            .path("/api/db-change-message/process")
            .header("authorization", "Bearer test-token")
            .body(NOTIFICATION_EVENT);
        then.status(200).body("ok");
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let (status, payload) = post_event(&relay, NOTIFICATION_EVENT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["outcome"], "forwarded");
    assert_eq!(change.calls(), 1);
    assert_eq!(action.calls(), 0);
}

#[tokio::test]
async fn non_string_action_type_is_a_change_message() {
    let server = MockServer::start();
    let change = server.mock(|when, then| {
        when.method(POST).path("/api/db-change-message/process");
        then.status(200);
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let invocation = relay
        .invoke(br#"{"actionType":1,"unitCreationRequestId":4771,"mefeAPIRequestId":"x1"}"#)
        .await;
    assert_eq!(invocation.result.unwrap(), Outcome::Forwarded);
    assert_eq!(change.calls(), 1);
}

#[tokio::test]
async fn forward_failure_is_not_redelivered_by_default() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/db-change-message/process");
        then.status(503).body("unavailable");
    });
    let relay = relay(&test_config(&server.base_url())).await;

    let (status, payload) = post_event(&relay, NOTIFICATION_EVENT).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["outcome"], "forward_failed");
    assert!(payload["reason"]
        .as_str()
        .unwrap()
        .contains("response code 503"));
}

#[tokio::test]
async fn forward_failure_can_be_made_redeliverable() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/api/db-change-message/process");
        then.status(201);
    });
    let mut cfg = test_config(&server.base_url());
    cfg.redelivery.forward_failures = true;
    let relay = relay(&cfg).await;

    let (status, payload) = post_event(&relay, NOTIFICATION_EVENT).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(payload["error"]["code"], "forward.failed");
}

#[tokio::test]
async fn malformed_event_is_rejected_without_redelivery() {
    let relay = relay(&test_config("http://127.0.0.1:1")).await;

    let (status, payload) = post_event(&relay, "not even JSON").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["outcome"], "rejected");
    assert_eq!(payload["code"], "event.malformed");
}
