use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use relay_config::{Config, Secrets};
use relay_contracts::{
    ActionEvent, ActionType, ErrorBody, ErrorResponse, API_VERSION, CHANGE_MESSAGE_PATH,
};
use relay_kernel::{
    build_reply, classify_event, created_here, event_digest, interpret_response, settle,
    upstream_failure, validate_action, ApiOutcome, ClassifyError, Disposition, EventKind,
    InterpretError, RedeliverCause, RedeliveryPolicy, ValidationError,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

mod case_api;
mod store;

pub use case_api::{CaseApiClient, CaseApiResponse};
pub use store::{RecordedReply, ReplyStore, StatementMode, StoreError};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("unknown action type: {0:?}")]
    UnknownActionType(String),
    #[error("missing API access token")]
    MissingCredential,
    #[error("POST {url} failed: {message}")]
    Network { url: String, message: String },
    #[error("case API answered {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("{0}")]
    Parse(String),
    #[error("reply statement failed: {0}")]
    Store(String),
    #[error("change message forward failed: {0}")]
    Forward(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::MalformedEvent(_) => "event.malformed",
            RelayError::MissingField(_) => "validation.missing_field",
            RelayError::UnknownActionType(_) => "validation.unknown_action_type",
            RelayError::MissingCredential => "config.missing_credential",
            RelayError::Network { .. } => "network.error",
            RelayError::Upstream { .. } => "upstream.unavailable",
            RelayError::Parse(_) => "upstream.parse_error",
            RelayError::Store(_) => "store.exec_error",
            RelayError::Forward(_) => "forward.failed",
        }
    }

    /// Payload and credential problems never fix themselves, so they are not redelivered.
    pub fn is_redeliverable(&self) -> bool {
        !matches!(
            self,
            RelayError::MalformedEvent(_)
                | RelayError::MissingField(_)
                | RelayError::UnknownActionType(_)
                | RelayError::MissingCredential
        )
    }
}

impl From<ClassifyError> for RelayError {
    fn from(err: ClassifyError) -> Self {
        match err {
            ClassifyError::Malformed(msg) => RelayError::MalformedEvent(msg),
        }
    }
}

impl From<ValidationError> for RelayError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::MissingField(field) => RelayError::MissingField(field),
            ValidationError::UnknownActionType(name) => RelayError::UnknownActionType(name),
        }
    }
}

impl From<InterpretError> for RelayError {
    fn from(err: InterpretError) -> Self {
        RelayError::Parse(err.to_string())
    }
}

/// What happened to an event that does not need redelivery.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Applied {
        action_type: ActionType,
        request_id: i64,
        created_here: bool,
    },
    DuplicateReply {
        action_type: ActionType,
        request_id: i64,
    },
    UpstreamRejected {
        action_type: ActionType,
        request_id: i64,
        status: u16,
    },
    Forwarded,
    ForwardFailed {
        reason: String,
    },
    Rejected {
        code: String,
        reason: String,
    },
}

#[derive(Debug)]
pub struct Invocation {
    pub invocation_id: String,
    pub event_digest: String,
    /// `Err` is the only redelivery signal.
    pub result: Result<Outcome, RelayError>,
}

impl Invocation {
    pub fn redeliver(&self) -> bool {
        self.result.is_err()
    }

    pub fn to_json(&self) -> Value {
        match &self.result {
            Ok(outcome) => {
                let mut body = match serde_json::to_value(outcome) {
                    Ok(Value::Object(m)) => m,
                    _ => Map::new(),
                };
                body.insert(
                    "invocation_id".to_string(),
                    Value::String(self.invocation_id.clone()),
                );
                body.insert(
                    "event_digest".to_string(),
                    Value::String(self.event_digest.clone()),
                );
                body.insert(
                    "api_version".to_string(),
                    Value::String(API_VERSION.to_string()),
                );
                Value::Object(body)
            }
            Err(err) => {
                let body = ErrorResponse {
                    error: ErrorBody {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        details: Some(json!({
                            "invocation_id": self.invocation_id,
                            "event_digest": self.event_digest,
                            "redeliver": true,
                        })),
                    },
                };
                serde_json::to_value(body).unwrap_or(Value::Null)
            }
        }
    }
}

/// Process-wide resources built once at startup and shared by every invocation.
pub struct Relay {
    api: CaseApiClient,
    store: ReplyStore,
    policy: RedeliveryPolicy,
}

impl Relay {
    pub async fn init(cfg: &Config, secrets: &Secrets) -> Result<Self, String> {
        let api = CaseApiClient::new(
            &cfg.case_api.base_url,
            secrets.api_token.clone(),
            Duration::from_millis(cfg.case_api.timeout_ms),
        )?;
        if secrets.api_token.is_none() {
            warn!(
                token_env = %cfg.case_api.token_env,
                "API access token is not set; every event will be rejected"
            );
        }
        let store = ReplyStore::open(&cfg.store, secrets.database_url.as_deref()).await?;
        Ok(Self {
            api,
            store,
            policy: RedeliveryPolicy {
                upstream_min_status: cfg.redelivery.upstream_min_status,
                forward_failures: cfg.redelivery.forward_failures,
            },
        })
    }

    pub fn store(&self) -> &ReplyStore {
        &self.store
    }

    pub async fn shutdown(&self) {
        self.store.close().await;
    }

    pub async fn invoke(&self, raw: &[u8]) -> Invocation {
        let invocation_id = uuid::Uuid::new_v4().to_string();
        let event_digest = event_digest(raw);
        let span = info_span!("invocation", %invocation_id, %event_digest);

        let result = async {
            match self.process(raw).await {
                Err(err) if !err.is_redeliverable() => {
                    error!(code = err.code(), error = %err, "event rejected");
                    Ok(Outcome::Rejected {
                        code: err.code().to_string(),
                        reason: err.to_string(),
                    })
                }
                other => other,
            }
        }
        .instrument(span)
        .await;

        Invocation {
            invocation_id,
            event_digest,
            result,
        }
    }

    async fn process(&self, raw: &[u8]) -> Result<Outcome, RelayError> {
        match classify_event(raw)? {
            EventKind::Action(fields) => {
                let event = validate_action(&fields)?;
                info!(
                    action_type = %event.action_type(),
                    request_id = event.request_id(),
                    correlation_id = %event.correlation_id,
                    "action event"
                );
                self.process_action(&event, raw).await
            }
            EventKind::Change => {
                info!("change message");
                self.forward_change(raw).await
            }
        }
    }

    async fn process_action(
        &self,
        event: &ActionEvent,
        raw: &[u8],
    ) -> Result<Outcome, RelayError> {
        let action_type = event.action_type();
        let request_id = event.request_id();

        let response = self.api.process_api_payload(raw).await.inspect_err(|err| {
            error!(%action_type, request_id, error = %err, "process-api-payload request failed");
        })?;

        let outcome = match created_here(response.status) {
            Some(created) => interpret_response(action_type, created, &response.body)
                .inspect_err(|err| {
                    error!(
                        %action_type,
                        request_id,
                        status = response.status,
                        body = %String::from_utf8_lossy(&response.body),
                        error = %err,
                        "unable to interpret case API response"
                    );
                })?,
            None => {
                error!(
                    %action_type,
                    request_id,
                    status = response.status,
                    response = %String::from_utf8_lossy(&response.body),
                    "case API rejected action"
                );
                // The failure is recorded through the reply rather than dropped.
                upstream_failure(
                    response.status,
                    &response.status_line,
                    &response.url,
                    &response.body,
                    raw,
                )
            }
        };

        let stmt = build_reply(event, &outcome, Utc::now().naive_utc());
        let executed = self.store.execute(&stmt).await;
        let disposition = settle(
            &outcome,
            executed.as_ref().map(|_| ()).map_err(|e| e.kind),
            &self.policy,
        );

        match disposition {
            Disposition::Applied => {
                info!(
                    %action_type,
                    request_id,
                    procedure = stmt.procedure(),
                    "reply recorded"
                );
                Ok(Outcome::Applied {
                    action_type,
                    request_id,
                    created_here: matches!(
                        outcome,
                        ApiOutcome::Accepted {
                            created_here: true,
                            ..
                        }
                    ),
                })
            }
            Disposition::DuplicateIgnored => {
                warn!(
                    %action_type,
                    request_id,
                    error = %store_message(&executed),
                    sql = %stmt.render_sql(),
                    "duplicate entry; reply already applied"
                );
                Ok(Outcome::DuplicateReply {
                    action_type,
                    request_id,
                })
            }
            Disposition::UpstreamRejected { status } => {
                warn!(
                    %action_type,
                    request_id,
                    status,
                    "payload rejected by case API; not requesting redelivery"
                );
                Ok(Outcome::UpstreamRejected {
                    action_type,
                    request_id,
                    status,
                })
            }
            Disposition::Redeliver(RedeliverCause::UpstreamUnavailable { status }) => {
                error!(
                    %action_type,
                    request_id,
                    status,
                    sql = %stmt.render_sql(),
                    "case API unavailable; requesting redelivery"
                );
                Err(RelayError::Upstream {
                    status,
                    message: outcome.error_message().to_string(),
                })
            }
            Disposition::Redeliver(RedeliverCause::StoreFailed) => {
                let message = store_message(&executed);
                error!(
                    %action_type,
                    request_id,
                    error = %message,
                    sql = %stmt.render_sql(),
                    "running reply statement failed"
                );
                Err(RelayError::Store(message))
            }
        }
    }

    async fn forward_change(&self, raw: &[u8]) -> Result<Outcome, RelayError> {
        let reason = match self.api.forward_change_message(raw).await {
            Ok(response) if response.status == 200 => {
                info!(
                    status = response.status,
                    response = %String::from_utf8_lossy(&response.body),
                    "change message forwarded"
                );
                return Ok(Outcome::Forwarded);
            }
            Ok(response) => format!(
                "{CHANGE_MESSAGE_PATH} response code {}, Request: {} Response: {}",
                response.status,
                String::from_utf8_lossy(raw),
                String::from_utf8_lossy(&response.body)
            ),
            Err(err) => err.to_string(),
        };
        error!(%reason, "change message forward failed");
        if self.policy.forward_failures {
            Err(RelayError::Forward(reason))
        } else {
            Ok(Outcome::ForwardFailed { reason })
        }
    }
}

fn store_message(executed: &Result<(), StoreError>) -> String {
    match executed {
        Ok(()) => String::new(),
        Err(err) => err.message.clone(),
    }
}

#[derive(Clone)]
struct AppState {
    relay: Arc<Relay>,
}

pub async fn serve(cfg: Config, secrets: Secrets) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let relay = Arc::new(Relay::init(&cfg, &secrets).await?);
    let app = router(relay.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "relay listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| format!("serve failed: {e}"));
    relay.shutdown().await;
    served
}

pub async fn build_app(cfg: Config, secrets: Secrets) -> Result<Router, String> {
    let relay = Relay::init(&cfg, &secrets).await?;
    Ok(router(Arc::new(relay)))
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/events", post(events))
        .with_state(AppState { relay })
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// 200 tells the caller the event is done with; 500 asks it to redeliver.
async fn events(State(state): State<AppState>, body: Bytes) -> (StatusCode, Json<Value>) {
    let invocation = state.relay.invoke(&body).await;
    let status = if invocation.redeliver() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(invocation.to_json()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
