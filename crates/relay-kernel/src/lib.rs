use chrono::{DateTime, NaiveDateTime};
use relay_contracts::{
    ActionEvent, ActionRequest, ActionType, CaseApiBody, ACTION_TYPE_KEY, CORRELATION_ID_KEY,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Datetime layout the store accepts in session variables.
pub const SQL_TIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

pub const ERROR_MESSAGE_VARIABLE: &str = "mefe_api_error_message";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("event is not a JSON object: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("unknown action type: {0:?}")]
    UnknownActionType(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpretError {
    #[error("unable to parse case API response: {0}")]
    Body(String),
    #[error("unparseable timestamp in case API response: {0:?}")]
    Timestamp(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Action(Map<String, Value>),
    Change,
}

/// Rewrites the characters MySQL treats specially inside a quoted literal. Each one is
/// prefixed with a backslash and kept as the same byte, except 0x1A which becomes `Z`.
pub fn escape(source: &str) -> String {
    let mut out = String::with_capacity(source.len() * 2);
    for ch in source.chars() {
        match ch {
            '\r' | '\n' | '\\' | '\'' | '"' => {
                out.push('\\');
                out.push(ch);
            }
            '\u{1a}' => out.push_str("\\Z"),
            other => out.push(other),
        }
    }
    out
}

/// Only a string-typed `actionType` makes an event an action.
pub fn classify_event(raw: &[u8]) -> Result<EventKind, ClassifyError> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|e| ClassifyError::Malformed(e.to_string()))?;
    let fields = match value {
        Value::Object(fields) => fields,
        other => {
            return Err(ClassifyError::Malformed(format!(
                "expected object, got {}",
                json_kind(&other)
            )))
        }
    };
    if fields.get(ACTION_TYPE_KEY).is_some_and(Value::is_string) {
        Ok(EventKind::Action(fields))
    } else {
        Ok(EventKind::Change)
    }
}

pub fn validate_action(fields: &Map<String, Value>) -> Result<ActionEvent, ValidationError> {
    let type_name = fields
        .get(ACTION_TYPE_KEY)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let action_type = ActionType::parse(type_name)
        .ok_or_else(|| ValidationError::UnknownActionType(type_name.to_string()))?;

    let correlation_id = fields
        .get(CORRELATION_ID_KEY)
        .and_then(Value::as_str)
        .unwrap_or_default();
    if correlation_id.is_empty() {
        return Err(ValidationError::MissingField(CORRELATION_ID_KEY));
    }

    let field = action_type.request_id_field();
    let request_id = fields.get(field).and_then(Value::as_i64).unwrap_or(0);
    if request_id == 0 {
        return Err(ValidationError::MissingField(field));
    }

    Ok(ActionEvent {
        correlation_id: correlation_id.to_string(),
        request: ActionRequest::new(action_type, request_id),
    })
}

/// 200 means the entity already existed, 201 that this call created it.
pub fn created_here(status: u16) -> Option<bool> {
    match status {
        200 => Some(false),
        201 => Some(true),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseApiReply {
    pub entity_id: String,
    pub timestamp: Option<NaiveDateTime>,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOutcome {
    Accepted {
        created_here: bool,
        reply: CaseApiReply,
    },
    Failed {
        status: u16,
        error_message: String,
    },
}

impl ApiOutcome {
    pub fn error_message(&self) -> &str {
        match self {
            ApiOutcome::Accepted { .. } => "",
            ApiOutcome::Failed { error_message, .. } => error_message,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiOutcome::Accepted {
                created_here: true, ..
            } => 201,
            ApiOutcome::Accepted { .. } => 200,
            ApiOutcome::Failed { status, .. } => *status,
        }
    }
}

pub fn interpret_response(
    action_type: ActionType,
    created_here: bool,
    body: &[u8],
) -> Result<ApiOutcome, InterpretError> {
    let parsed: CaseApiBody =
        serde_json::from_slice(body).map_err(|e| InterpretError::Body(e.to_string()))?;
    let timestamp = match parsed.timestamp.as_deref() {
        Some(ts) if !ts.is_empty() => Some(
            parse_api_timestamp(ts).ok_or_else(|| InterpretError::Timestamp(ts.to_string()))?,
        ),
        _ => None,
    };
    let entity_id = match action_type {
        ActionType::CreateUnit => parsed.unit_mongo_id,
        ActionType::CreateUser => parsed.user_id,
        _ => parsed.id,
    }
    .unwrap_or_default();
    Ok(ApiOutcome::Accepted {
        created_here,
        reply: CaseApiReply {
            entity_id,
            timestamp,
            api_key: parsed.mefe_api_key.unwrap_or_default(),
        },
    })
}

/// Captures everything needed to diagnose a rejected call; stored raw, escaped on render.
pub fn upstream_failure(
    status: u16,
    status_line: &str,
    url: &str,
    response_body: &[u8],
    request_body: &[u8],
) -> ApiOutcome {
    ApiOutcome::Failed {
        status,
        error_message: format!(
            "Error: {status_line} from case API: {url}, Response: {} from Request: {}",
            String::from_utf8_lossy(response_body),
            String::from_utf8_lossy(request_body),
        ),
    }
}

/// Keeps the wall-clock time the API reported, dropping any offset.
pub fn parse_api_timestamp(ts: &str) -> Option<NaiveDateTime> {
    if let Ok(v) = DateTime::parse_from_rfc3339(ts) {
        return Some(v.naive_local());
    }
    NaiveDateTime::parse_from_str(ts, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(ts, SQL_TIME_LAYOUT))
        .ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyValue {
    Int(i64),
    Flag(bool),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl ReplyValue {
    pub fn sql_literal(&self) -> String {
        match self {
            ReplyValue::Int(v) => v.to_string(),
            ReplyValue::Flag(v) => i64::from(*v).to_string(),
            ReplyValue::Text(v) => format!("'{}'", escape(v)),
            ReplyValue::Timestamp(v) => format!("'{}'", v.format(SQL_TIME_LAYOUT)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ReplyValue::Int(v) => json!(v),
            ReplyValue::Flag(v) => json!(i64::from(*v)),
            ReplyValue::Text(v) => json!(v),
            ReplyValue::Timestamp(v) => json!(v.format(SQL_TIME_LAYOUT).to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub variable: &'static str,
    pub value: ReplyValue,
}

/// Session-variable assignments followed by a single procedure call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyStatement {
    pub action_type: ActionType,
    pub request_id: i64,
    pub assignments: Vec<Assignment>,
}

impl ReplyStatement {
    pub fn procedure(&self) -> &'static str {
        self.action_type.reply_procedure()
    }

    pub fn value(&self, variable: &str) -> Option<&ReplyValue> {
        self.assignments
            .iter()
            .find(|a| a.variable == variable)
            .map(|a| &a.value)
    }

    pub fn error_message(&self) -> &str {
        match self.value(ERROR_MESSAGE_VARIABLE) {
            Some(ReplyValue::Text(v)) => v,
            _ => "",
        }
    }

    pub fn render_sql(&self) -> String {
        let mut out = String::new();
        for a in &self.assignments {
            out.push_str(&format!("SET @{} = {};\n", a.variable, a.value.sql_literal()));
        }
        out.push_str(&format!("CALL {};", self.procedure()));
        out
    }

    pub fn params_json(&self) -> Value {
        let mut m = Map::new();
        for a in &self.assignments {
            m.insert(a.variable.to_string(), a.value.to_json());
        }
        Value::Object(m)
    }
}

/// `now` stands in for the timestamp when the API gave none (always the case on failure).
pub fn build_reply(
    event: &ActionEvent,
    outcome: &ApiOutcome,
    now: NaiveDateTime,
) -> ReplyStatement {
    let (created, entity_id, timestamp, api_key) = match outcome {
        ApiOutcome::Accepted {
            created_here,
            reply,
        } => (
            *created_here,
            reply.entity_id.clone(),
            reply.timestamp.unwrap_or(now),
            reply.api_key.clone(),
        ),
        ApiOutcome::Failed { .. } => (false, String::new(), now, String::new()),
    };
    let error_message = ReplyValue::Text(outcome.error_message().to_string());

    let assign = |variable: &'static str, value: ReplyValue| Assignment { variable, value };
    let assignments = match event.request {
        ActionRequest::CreateUnit {
            unit_creation_request_id,
        } => vec![
            assign(
                "unit_creation_request_id",
                ReplyValue::Int(unit_creation_request_id),
            ),
            assign("mefe_unit_id", ReplyValue::Text(entity_id)),
            assign("creation_datetime", ReplyValue::Timestamp(timestamp)),
            assign("is_created_by_me", ReplyValue::Flag(created)),
            assign(ERROR_MESSAGE_VARIABLE, error_message),
        ],
        ActionRequest::CreateUser {
            user_creation_request_id,
        } => vec![
            assign(
                "user_creation_request_id",
                ReplyValue::Int(user_creation_request_id),
            ),
            assign("mefe_user_id", ReplyValue::Text(entity_id)),
            assign("creation_datetime", ReplyValue::Timestamp(timestamp)),
            assign("is_created_by_me", ReplyValue::Flag(created)),
            assign(ERROR_MESSAGE_VARIABLE, error_message),
            assign("mefe_user_api_key", ReplyValue::Text(api_key)),
        ],
        ActionRequest::AssignRole {
            id_map_user_unit_permission,
        } => vec![
            assign(
                "id_map_user_unit_permissions",
                ReplyValue::Int(id_map_user_unit_permission),
            ),
            assign("creation_datetime", ReplyValue::Timestamp(timestamp)),
            assign(ERROR_MESSAGE_VARIABLE, error_message),
        ],
        ActionRequest::EditUser {
            update_user_request_id,
        } => vec![
            assign(
                "update_user_request_id",
                ReplyValue::Int(update_user_request_id),
            ),
            assign("updated_datetime", ReplyValue::Timestamp(timestamp)),
            assign(ERROR_MESSAGE_VARIABLE, error_message),
        ],
        ActionRequest::EditUnit {
            update_unit_request_id,
        } => vec![
            assign(
                "update_unit_request_id",
                ReplyValue::Int(update_unit_request_id),
            ),
            assign("updated_datetime", ReplyValue::Timestamp(timestamp)),
            assign(ERROR_MESSAGE_VARIABLE, error_message),
        ],
        ActionRequest::DeassignRole {
            remove_user_from_unit_request_id,
        } => vec![
            assign(
                "remove_user_from_unit_request_id",
                ReplyValue::Int(remove_user_from_unit_request_id),
            ),
            assign("updated_datetime", ReplyValue::Timestamp(timestamp)),
            assign(ERROR_MESSAGE_VARIABLE, error_message),
        ],
    };

    ReplyStatement {
        action_type: event.action_type(),
        request_id: event.request_id(),
        assignments,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailure {
    Duplicate,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub upstream_min_status: u16,
    pub forward_failures: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            upstream_min_status: 500,
            forward_failures: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeliverCause {
    UpstreamUnavailable { status: u16 },
    StoreFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    DuplicateIgnored,
    UpstreamRejected { status: u16 },
    Redeliver(RedeliverCause),
}

pub fn settle(
    outcome: &ApiOutcome,
    executed: Result<(), StoreFailure>,
    policy: &RedeliveryPolicy,
) -> Disposition {
    match (executed, outcome) {
        (Err(StoreFailure::Duplicate), _) => Disposition::DuplicateIgnored,
        (Err(StoreFailure::Other), _) => Disposition::Redeliver(RedeliverCause::StoreFailed),
        (Ok(()), ApiOutcome::Accepted { .. }) => Disposition::Applied,
        (Ok(()), ApiOutcome::Failed { status, .. }) if *status >= policy.upstream_min_status => {
            Disposition::Redeliver(RedeliverCause::UpstreamUnavailable { status: *status })
        }
        (Ok(()), ApiOutcome::Failed { status, .. }) => {
            Disposition::UpstreamRejected { status: *status }
        }
    }
}

/// Stable across whitespace and key order so redeliveries of one event share a digest.
pub fn event_digest(raw: &[u8]) -> String {
    serde_json::from_slice::<Value>(raw)
        .ok()
        .and_then(|v| jcs_sha256_hex(&v).ok())
        .unwrap_or_else(|| sha256_hex(raw))
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
