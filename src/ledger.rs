//! Durable, strictly ordered message ledger
//!
//! Every cluster's event stream lives in one SQLite table. Appends are
//! serialized twice: by the in-process connection lock and by an
//! `IMMEDIATE` transaction, which also orders writers from other processes
//! sharing the same database file. Ids come from `AUTOINCREMENT`, so a
//! batch written inside one transaction always receives contiguous ids.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::message::{Message, MessageContent, NewMessage, Topic, TokenUsage};

/// Key under which [`Ledger::tokens_by_role`] reports the cluster total
pub const TOTAL_KEY: &str = "_total";

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Result ordering by ledger id
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter for read operations
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    pub cluster_id: String,
    pub topic: Option<Topic>,
    pub sender: Option<String>,
    /// Only entries with an id greater than this
    pub after_id: Option<i64>,
    /// Only entries with `timestamp >= since`
    pub since: Option<i64>,
    /// Only entries with `timestamp <= until`
    pub until: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order: SortOrder,
}

impl QueryCriteria {
    pub fn cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    pub fn topic(mut self, topic: impl Into<Topic>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn after_id(mut self, id: i64) -> Self {
        self.after_id = Some(id);
        self
    }

    pub fn since(mut self, timestamp: i64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: i64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    fn where_clause(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = vec!["cluster_id = ?".to_string()];
        let mut values = vec![SqlValue::Text(self.cluster_id.clone())];

        if let Some(topic) = &self.topic {
            clauses.push("topic = ?".into());
            values.push(SqlValue::Text(topic.as_str().to_string()));
        }
        if let Some(sender) = &self.sender {
            clauses.push("sender = ?".into());
            values.push(SqlValue::Text(sender.clone()));
        }
        if let Some(id) = self.after_id {
            clauses.push("id > ?".into());
            values.push(SqlValue::Integer(id));
        }
        if let Some(since) = self.since {
            clauses.push("timestamp >= ?".into());
            values.push(SqlValue::Integer(since));
        }
        if let Some(until) = self.until {
            clauses.push("timestamp <= ?".into());
            values.push(SqlValue::Integer(until));
        }

        (clauses.join(" AND "), values)
    }
}

/// Position to resume reading a cluster's stream from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Entries strictly newer than this timestamp
    AfterTimestamp(i64),
    /// Entries with an id strictly greater than this
    AfterId(i64),
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cluster_id TEXT NOT NULL,
        topic TEXT NOT NULL,
        sender TEXT NOT NULL,
        sender_model TEXT,
        content_text TEXT,
        content_data TEXT,
        timestamp INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_cluster ON messages(cluster_id, id);
    CREATE INDEX IF NOT EXISTS idx_messages_topic ON messages(cluster_id, topic, id);
"#;

const COLUMNS: &str =
    "id, cluster_id, topic, sender, sender_model, content_text, content_data, timestamp";

struct RawRow {
    id: i64,
    cluster_id: String,
    topic: String,
    sender: String,
    sender_model: Option<String>,
    content_text: Option<String>,
    content_data: Option<String>,
    timestamp: i64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cluster_id: row.get(1)?,
            topic: row.get(2)?,
            sender: row.get(3)?,
            sender_model: row.get(4)?,
            content_text: row.get(5)?,
            content_data: row.get(6)?,
            timestamp: row.get(7)?,
        })
    }

    fn into_message(self) -> Result<Message> {
        let data = match self.content_data {
            Some(raw) => serde_json::from_str(&raw)?,
            None => serde_json::Value::Null,
        };
        Ok(Message {
            id: self.id,
            cluster_id: self.cluster_id,
            topic: Topic::from(self.topic),
            sender: self.sender,
            sender_model: self.sender_model,
            content: MessageContent {
                text: self.content_text,
                data,
            },
            timestamp: self.timestamp,
        })
    }
}

/// Append-only event store for a set of clusters
pub struct Ledger {
    conn: Mutex<Connection>,
    closed: AtomicBool,
    notify_tx: broadcast::Sender<Message>,
}

impl Ledger {
    /// Open (or create) a ledger database file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, LedgerConfig::default().notify_capacity)
    }

    fn open_with<P: AsRef<Path>>(path: P, notify_capacity: usize) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        info!(path = %path.as_ref().display(), "Opened ledger");
        Self::with_connection(conn, notify_capacity)
    }

    /// Create an in-memory ledger (tests, ephemeral clusters)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, LedgerConfig::default().notify_capacity)
    }

    /// Build a ledger from configuration; no path means in-memory
    pub fn from_config(config: &LedgerConfig) -> Result<Self> {
        match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Self::open_with(path, config.notify_capacity)
            }
            None => {
                let conn = Connection::open_in_memory()?;
                Self::with_connection(conn, config.notify_capacity)
            }
        }
    }

    fn with_connection(conn: Connection, notify_capacity: usize) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let (notify_tx, _) = broadcast::channel(notify_capacity.max(1));
        Ok(Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
            notify_tx,
        })
    }

    /// Receive every message right after it is committed
    pub fn watch(&self) -> broadcast::Receiver<Message> {
        self.notify_tx.subscribe()
    }

    /// Append one message; `None` once the ledger is closed
    pub fn append(&self, message: NewMessage) -> Result<Option<Message>> {
        let mut appended = self.batch_append(vec![message])?;
        Ok(appended.pop())
    }

    /// Append several messages as one atomic, contiguous unit
    ///
    /// Returns an empty vector once the ledger is closed.
    pub fn batch_append(&self, messages: Vec<NewMessage>) -> Result<Vec<Message>> {
        if messages.is_empty() || self.is_closed() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.lock();
        // close() may have won the race for the lock
        if self.is_closed() {
            return Ok(Vec::new());
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let floor: Option<i64> = tx
            .query_row(
                "SELECT timestamp FROM messages ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let timestamp = chrono::Utc::now()
            .timestamp_millis()
            .max(floor.unwrap_or(i64::MIN));

        let mut persisted = Vec::with_capacity(messages.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO messages \
                 (cluster_id, topic, sender, sender_model, content_text, content_data, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for message in messages {
                let data = if message.content.data.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&message.content.data)?)
                };
                stmt.execute(params![
                    message.cluster_id,
                    message.topic.as_str(),
                    message.sender,
                    message.sender_model,
                    message.content.text,
                    data,
                    timestamp,
                ])?;

                persisted.push(Message {
                    id: tx.last_insert_rowid(),
                    cluster_id: message.cluster_id,
                    topic: message.topic,
                    sender: message.sender,
                    sender_model: message.sender_model,
                    content: message.content,
                    timestamp,
                });
            }
        }
        tx.commit()?;

        debug!(count = persisted.len(), "Appended to ledger");

        for message in &persisted {
            // No receivers is fine
            let _ = self.notify_tx.send(message.clone());
        }

        Ok(persisted)
    }

    /// Messages matching `criteria`
    pub fn query(&self, criteria: &QueryCriteria) -> Result<Vec<Message>> {
        let (clause, mut values) = criteria.where_clause();
        let order = match criteria.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let mut sql = format!("SELECT {COLUMNS} FROM messages WHERE {clause} ORDER BY id {order}");

        match (criteria.limit, criteria.offset) {
            (Some(limit), offset) => {
                sql.push_str(" LIMIT ? OFFSET ?");
                values.push(SqlValue::Integer(limit as i64));
                values.push(SqlValue::Integer(offset.unwrap_or(0) as i64));
            }
            (None, Some(offset)) => {
                sql.push_str(" LIMIT -1 OFFSET ?");
                values.push(SqlValue::Integer(offset as i64));
            }
            (None, None) => {}
        }

        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), RawRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        rows.into_iter().map(RawRow::into_message).collect()
    }

    /// Entries of a cluster after `cursor`, oldest first
    pub fn since(&self, cluster_id: &str, cursor: Cursor) -> Result<Vec<Message>> {
        let criteria = match cursor {
            Cursor::AfterId(id) => QueryCriteria::cluster(cluster_id).after_id(id),
            Cursor::AfterTimestamp(ts) => {
                QueryCriteria::cluster(cluster_id).since(ts.saturating_add(1))
            }
        };
        self.query(&criteria)
    }

    /// Number of messages matching `criteria` (limit/offset ignored)
    pub fn count(&self, criteria: &QueryCriteria) -> Result<usize> {
        let (clause, values) = criteria.where_clause();
        let sql = format!("SELECT COUNT(*) FROM messages WHERE {clause}");
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Most recent message matching `criteria`
    pub fn find_last(&self, criteria: &QueryCriteria) -> Result<Option<Message>> {
        let mut criteria = criteria.clone();
        criteria.order = SortOrder::Descending;
        criteria.limit = Some(1);
        criteria.offset = None;
        Ok(self.query(&criteria)?.into_iter().next())
    }

    /// Whole stream of a cluster, oldest first
    pub fn get_all(&self, cluster_id: &str) -> Result<Vec<Message>> {
        self.query(&QueryCriteria::cluster(cluster_id))
    }

    /// Distinct cluster ids with at least one message
    pub fn cluster_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT DISTINCT cluster_id FROM messages ORDER BY cluster_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Token usage per reporting role, plus the cluster total under [`TOTAL_KEY`]
    pub fn tokens_by_role(&self, cluster_id: &str) -> Result<BTreeMap<String, TokenUsage>> {
        let mut report: BTreeMap<String, TokenUsage> = BTreeMap::new();
        let mut total = TokenUsage::default();

        for message in self.get_all(cluster_id)? {
            let Some((role, usage)) = message.token_usage() else {
                continue;
            };
            report.entry(role).or_default().add(&usage);
            total.add(&usage);
        }

        report.insert(TOTAL_KEY.to_string(), total);
        Ok(report)
    }

    /// Stop accepting appends; reads keep working
    pub fn close(&self) {
        let _guard = self.conn.lock();
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Ledger closed");
        } else {
            warn!("Ledger closed twice");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
