/// Durable outbox/inbox store.
///
/// Bookkeeping for sends and receives, scoped to one process session:
/// `initialize` wipes all prior state on every start, so pending sends
/// and dedup history never survive a restart.
///
/// The in-memory tables are authoritative; when a path is configured
/// they are mirrored to sqlite for mid-session inspection. Storage
/// trouble never reaches callers — a failed open or write downgrades
/// the store to memory-only and logs a warning once.
use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{now_ms, MessageId, PeerId, SendStatus};

/// One message this side is attempting to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: MessageId,
    pub destination: PeerId,
    pub topic: String,
    pub payload: Value,
    pub status: SendStatus,
    pub attempts: u32,
    pub created_at: u64,
    pub last_attempt_at: Option<u64>,
}

impl OutboxEntry {
    /// New pending entry with a fresh message id and zero attempts.
    pub fn new(destination: PeerId, topic: String, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            destination,
            topic,
            payload,
            status: SendStatus::Pending,
            attempts: 0,
            created_at: now_ms(),
            last_attempt_at: None,
        }
    }
}

/// One message this side has received, keyed by `(from, seq)` for dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRecord {
    pub from: PeerId,
    pub seq: u64,
    pub id: MessageId,
    pub topic: String,
    pub payload: Value,
    pub processed: bool,
    pub received_at: u64,
}

/// Session-scoped store for outbox entries and inbox records.
pub struct Store {
    outbox: HashMap<MessageId, OutboxEntry>,
    inbox: HashMap<(PeerId, u64), InboxRecord>,
    disk: Option<Connection>,
    disk_warned: bool,
}

const SCHEMA: &str = "
    DROP TABLE IF EXISTS outbox;
    DROP TABLE IF EXISTS inbox;
    CREATE TABLE outbox (
        id TEXT PRIMARY KEY,
        destination TEXT NOT NULL,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        last_attempt_at INTEGER
    );
    CREATE TABLE inbox (
        sender TEXT NOT NULL,
        seq INTEGER NOT NULL,
        id TEXT NOT NULL,
        topic TEXT NOT NULL,
        payload TEXT NOT NULL,
        processed INTEGER NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (sender, seq)
    );
";

impl Store {
    /// Open (or fall back to memory-only) and wipe any prior state.
    ///
    /// Never fails: an unopenable database is a degraded mode, not an
    /// error the rest of the client should see.
    pub fn initialize(path: Option<&Path>) -> Self {
        let disk = match path {
            Some(path) => match Self::open_and_wipe(path) {
                Ok(conn) => Some(conn),
                Err(e) => {
                    tracing::warn!(
                        "store unavailable at {}, continuing memory-only: {e}",
                        path.display()
                    );
                    None
                }
            },
            None => None,
        };

        Self {
            outbox: HashMap::new(),
            inbox: HashMap::new(),
            disk,
            disk_warned: false,
        }
    }

    fn open_and_wipe(path: &Path) -> rusqlite::Result<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    /// Run a mirror write against the disk table, degrading on failure.
    fn mirror(&mut self, op: impl FnOnce(&Connection) -> rusqlite::Result<()>) {
        let Some(conn) = &self.disk else { return };
        if let Err(e) = op(conn) {
            if !self.disk_warned {
                tracing::warn!("store write failed, continuing memory-only: {e}");
                self.disk_warned = true;
            }
            self.disk = None;
        }
    }

    // ── Outbox ─────────────────────────────────────────────────────────

    /// Upsert an outbox entry.
    pub fn put_outbox(&mut self, entry: &OutboxEntry) {
        self.outbox.insert(entry.id.clone(), entry.clone());
        let entry = entry.clone();
        self.mirror(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO outbox
                 (id, destination, topic, payload, status, attempts, created_at, last_attempt_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    entry.id,
                    entry.destination,
                    entry.topic,
                    entry.payload.to_string(),
                    entry.status.as_str(),
                    entry.attempts,
                    entry.created_at,
                    entry.last_attempt_at,
                ],
            )?;
            Ok(())
        });
    }

    /// Remove an outbox entry. Returns whether it existed.
    pub fn delete_outbox(&mut self, id: &str) -> bool {
        let existed = self.outbox.remove(id).is_some();
        if existed {
            let id = id.to_string();
            self.mirror(move |conn| {
                conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
                Ok(())
            });
        }
        existed
    }

    pub fn get_outbox(&self, id: &str) -> Option<&OutboxEntry> {
        self.outbox.get(id)
    }

    /// All outbox entries, in no particular order.
    pub fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.outbox.values().cloned().collect()
    }

    /// Entries that exhausted their attempts. Retained until cleared.
    pub fn failed_entries(&self) -> Vec<OutboxEntry> {
        self.outbox
            .values()
            .filter(|e| e.status == SendStatus::Failed)
            .cloned()
            .collect()
    }

    /// Remove a failed entry. No-op for entries still being retried.
    pub fn clear_failed(&mut self, id: &str) -> bool {
        match self.outbox.get(id) {
            Some(entry) if entry.status == SendStatus::Failed => self.delete_outbox(id),
            _ => false,
        }
    }

    // ── Inbox ──────────────────────────────────────────────────────────

    /// Record a received message. First write for a `(from, seq)` key
    /// wins; a duplicate never overwrites the stored payload.
    pub fn put_inbox(&mut self, record: &InboxRecord) {
        let key = (record.from.clone(), record.seq);
        if self.inbox.contains_key(&key) {
            return;
        }
        self.inbox.insert(key, record.clone());
        let record = record.clone();
        self.mirror(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO inbox
                 (sender, seq, id, topic, payload, processed, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.from,
                    record.seq,
                    record.id,
                    record.topic,
                    record.payload.to_string(),
                    record.processed,
                    record.received_at,
                ],
            )?;
            Ok(())
        });
    }

    /// Dedup guard: has a message with this `(from, seq)` been seen?
    pub fn inbox_contains(&self, from: &str, seq: u64) -> bool {
        self.inbox.contains_key(&(from.to_string(), seq))
    }

    /// Mark an inbox record as processed (handler acknowledged it).
    pub fn mark_inbox_processed(&mut self, from: &str, seq: u64) {
        let key = (from.to_string(), seq);
        if let Some(record) = self.inbox.get_mut(&key) {
            record.processed = true;
            let from = from.to_string();
            self.mirror(move |conn| {
                conn.execute(
                    "UPDATE inbox SET processed = 1 WHERE sender = ?1 AND seq = ?2",
                    params![from, seq],
                )?;
                Ok(())
            });
        }
    }

    /// All inbox records, in no particular order.
    pub fn inbox_records(&self) -> Vec<InboxRecord> {
        self.inbox.values().cloned().collect()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("outbox", &self.outbox.len())
            .field("inbox", &self.inbox.len())
            .field("disk", &self.disk.is_some())
            .finish()
    }
}
