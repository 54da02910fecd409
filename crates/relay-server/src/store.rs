use std::sync::Arc;

use chrono::Utc;
use relay_config::Store;
use relay_kernel::{ReplyStatement, ReplyValue, StoreFailure, SQL_TIME_LAYOUT};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;
use sqlx::mysql::{MySqlConnection, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreFailure,
    pub message: String,
}

impl StoreError {
    fn other(message: impl Into<String>) -> Self {
        Self {
            kind: StoreFailure::Other,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementMode {
    /// Each session variable is set through a prepared statement, then the procedure is called.
    Bound,
    /// The rendered, escaped multi-statement text is sent as one batch.
    Text,
}

impl StatementMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "bound" => Ok(StatementMode::Bound),
            "text" => Ok(StatementMode::Text),
            other => Err(format!("unsupported statement_mode: {other}")),
        }
    }
}

/// A reply as kept by the journal backends.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RecordedReply {
    pub procedure: String,
    pub request_id: i64,
    pub params: Value,
    pub error_message: String,
    pub recorded_at: String,
}

impl RecordedReply {
    fn from_statement(stmt: &ReplyStatement) -> Self {
        Self {
            procedure: stmt.procedure().to_string(),
            request_id: stmt.request_id,
            params: stmt.params_json(),
            error_message: stmt.error_message().to_string(),
            recorded_at: Utc::now().to_rfc3339(),
        }
    }
}

pub enum ReplyStore {
    MySql(MySqlReplyStore),
    Sqlite(SqliteReplyStore),
    Memory(MemoryReplyStore),
}

impl ReplyStore {
    pub async fn open(cfg: &Store, database_url: Option<&str>) -> Result<Self, String> {
        match cfg.kind.as_str() {
            "mysql" => {
                let url = database_url.ok_or_else(|| {
                    format!(
                        "store.url_env ({}) is not set",
                        cfg.url_env.as_deref().unwrap_or_default()
                    )
                })?;
                Ok(ReplyStore::MySql(MySqlReplyStore::connect_lazy(
                    url,
                    cfg.max_connections,
                    StatementMode::parse(&cfg.statement_mode)?,
                )?))
            }
            "sqlite" => {
                let path = cfg
                    .sqlite_path
                    .as_deref()
                    .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?
                    .to_string();
                // schema bootstrap is blocking file IO
                let store = tokio::task::spawn_blocking(move || SqliteReplyStore::new(&path))
                    .await
                    .map_err(|e| format!("sqlite open task failed: {e}"))??;
                Ok(ReplyStore::Sqlite(store))
            }
            "memory" => Ok(ReplyStore::Memory(MemoryReplyStore::default())),
            other => Err(format!("unsupported store type: {other}")),
        }
    }

    pub async fn execute(&self, stmt: &ReplyStatement) -> Result<(), StoreError> {
        match self {
            ReplyStore::MySql(store) => store.execute(stmt).await,
            ReplyStore::Sqlite(store) => store.execute(stmt).await,
            ReplyStore::Memory(store) => store.execute(stmt).await,
        }
    }

    pub async fn recorded(&self) -> Result<Vec<RecordedReply>, StoreError> {
        match self {
            ReplyStore::MySql(_) => Err(StoreError::other(
                "mysql store does not keep a reply journal",
            )),
            ReplyStore::Sqlite(store) => store.recorded().await,
            ReplyStore::Memory(store) => Ok(store.replies.lock().await.clone()),
        }
    }

    pub async fn close(&self) {
        if let ReplyStore::MySql(store) = self {
            store.pool.close().await;
        }
    }
}

pub struct MySqlReplyStore {
    pool: MySqlPool,
    mode: StatementMode,
}

impl MySqlReplyStore {
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        mode: StatementMode,
    ) -> Result<Self, String> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|e| e.to_string())?;
        Ok(Self { pool, mode })
    }

    /// Session variables only live on one connection, so the whole reply runs on a single
    /// pooled connection.
    async fn execute(&self, stmt: &ReplyStatement) -> Result<(), StoreError> {
        use sqlx::Executor;
        let mut pooled = self.pool.acquire().await.map_err(mysql_store_error)?;
        let conn: &mut MySqlConnection = &mut pooled;
        match self.mode {
            StatementMode::Bound => {
                for (sql, param) in bound_plan(stmt) {
                    let query = sqlx::query(&sql);
                    let query = match param {
                        BoundParam::Int(v) => query.bind(v),
                        BoundParam::Text(v) => query.bind(v),
                    };
                    query
                        .execute(&mut *conn)
                        .await
                        .map_err(mysql_store_error)?;
                }
                sqlx::query(&call_statement(stmt))
                    .execute(&mut *conn)
                    .await
                    .map_err(mysql_store_error)?;
            }
            StatementMode::Text => {
                let text = stmt.render_sql();
                conn.execute(sqlx::raw_sql(&text))
                    .await
                    .map_err(mysql_store_error)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BoundParam {
    Int(i64),
    Text(String),
}

/// One `SET @var = ?` per assignment, in template order. Flags go over the wire as 0/1 and
/// timestamps in the SQL layout, the same values the text form renders.
fn bound_plan(stmt: &ReplyStatement) -> Vec<(String, BoundParam)> {
    stmt.assignments
        .iter()
        .map(|a| {
            let param = match &a.value {
                ReplyValue::Int(v) => BoundParam::Int(*v),
                ReplyValue::Flag(v) => BoundParam::Int(i64::from(*v)),
                ReplyValue::Text(v) => BoundParam::Text(v.clone()),
                ReplyValue::Timestamp(v) => {
                    BoundParam::Text(v.format(SQL_TIME_LAYOUT).to_string())
                }
            };
            (format!("SET @{} = ?", a.variable), param)
        })
        .collect()
}

fn call_statement(stmt: &ReplyStatement) -> String {
    format!("CALL {}", stmt.procedure())
}

/// MySQL error number for a duplicate key (`ER_DUP_ENTRY`).
const ER_DUP_ENTRY: u16 = 1062;

/// Only a server-reported duplicate key counts; any other failure, whatever its text, is
/// redelivered.
fn classify_mysql_failure(err: &sqlx::Error) -> StoreFailure {
    let sqlx::Error::Database(db) = err else {
        return StoreFailure::Other;
    };
    let duplicate_number = db
        .try_downcast_ref::<MySqlDatabaseError>()
        .is_some_and(|e| e.number() == ER_DUP_ENTRY);
    if db.is_unique_violation() || duplicate_number {
        StoreFailure::Duplicate
    } else {
        StoreFailure::Other
    }
}

fn mysql_store_error(err: sqlx::Error) -> StoreError {
    StoreError {
        kind: classify_mysql_failure(&err),
        message: err.to_string(),
    }
}

/// Local reply journal. Successful replies are unique per procedure and request id, the
/// same way the production procedures reject a second successful reply.
pub struct SqliteReplyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReplyStore {
    pub fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS reply_calls (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                procedure_name TEXT NOT NULL,
                request_id INTEGER NOT NULL,
                params_json TEXT NOT NULL,
                error_message TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS reply_calls_applied
                ON reply_calls (procedure_name, request_id)
                WHERE error_message = '';
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn execute(&self, stmt: &ReplyStatement) -> Result<(), StoreError> {
        let rec = RecordedReply::from_statement(stmt);
        let params_json =
            serde_json::to_string(&rec.params).map_err(|e| StoreError::other(e.to_string()))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "
            INSERT INTO reply_calls
            (procedure_name, request_id, params_json, error_message, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                rec.procedure,
                rec.request_id,
                params_json,
                rec.error_message,
                rec.recorded_at
            ],
        )
        .map_err(sqlite_store_error)?;
        Ok(())
    }

    async fn recorded(&self) -> Result<Vec<RecordedReply>, StoreError> {
        let conn = self.conn.lock().await;
        let mut query = conn
            .prepare(
                "SELECT procedure_name, request_id, params_json, error_message, recorded_at
                 FROM reply_calls ORDER BY id",
            )
            .map_err(sqlite_store_error)?;
        let rows = query
            .query_map([], |row| {
                let params_json: String = row.get(2)?;
                let params = serde_json::from_str(&params_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                })?;
                Ok(RecordedReply {
                    procedure: row.get(0)?,
                    request_id: row.get(1)?,
                    params,
                    error_message: row.get(3)?,
                    recorded_at: row.get(4)?,
                })
            })
            .map_err(sqlite_store_error)?;
        let replies = rows
            .collect::<Result<Vec<_>, _>>()
            .map_err(sqlite_store_error)?;
        Ok(replies)
    }
}

fn sqlite_store_error(err: rusqlite::Error) -> StoreError {
    let duplicate = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    );
    StoreError {
        kind: if duplicate {
            StoreFailure::Duplicate
        } else {
            StoreFailure::Other
        },
        message: err.to_string(),
    }
}

#[derive(Default)]
pub struct MemoryReplyStore {
    replies: Mutex<Vec<RecordedReply>>,
}

impl MemoryReplyStore {
    async fn execute(&self, stmt: &ReplyStatement) -> Result<(), StoreError> {
        let rec = RecordedReply::from_statement(stmt);
        let mut replies = self.replies.lock().await;
        if rec.error_message.is_empty()
            && replies.iter().any(|r| {
                r.error_message.is_empty()
                    && r.procedure == rec.procedure
                    && r.request_id == rec.request_id
            })
        {
            return Err(StoreError {
                kind: StoreFailure::Duplicate,
                message: format!(
                    "Duplicate entry '{}-{}' for key 'reply_calls_applied'",
                    rec.procedure, rec.request_id
                ),
            });
        }
        replies.push(rec);
        Ok(())
    }
}
