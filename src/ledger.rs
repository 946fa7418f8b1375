//! Persisted idempotency ledger.
//!
//! Single SQLite database behind a mutex: one logical operation completes
//! fully before the next begins, across all watcher loops. Rows are created
//! lazily on first observation and never deleted.
//!
//! Tables:
//!   chat_cursors    chat_id → last message id already notified
//!   orders_notified order ids already announced as new (one-way)
//!   order_status    order id → last observed status (overwritten)
//!   digest_sent     dedup keys of delivered broadcasts
//!   subscribers     notification recipients and their per-kind opt-ins

use std::path::Path;
use std::sync::Mutex;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

/// Which notification stream a recipient is resolved for. `Auth` and
/// `Digest` fan out to every authorized subscriber; the rest honor the
/// per-kind opt-in flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Auth,
    Chat,
    Orders,
    Bump,
    Digest,
}

impl NotifyKind {
    fn column(self) -> Option<&'static str> {
        match self {
            NotifyKind::Auth => Some("notify_auth"),
            NotifyKind::Chat => Some("notify_chat"),
            NotifyKind::Orders => Some("notify_orders"),
            NotifyKind::Bump => Some("notify_bump"),
            NotifyKind::Digest => None,
        }
    }
}

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrate(&conn)?;

        info!("ledger opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory ledger, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("ledger lock poisoned: {e}"))?;
        f(&conn)
    }

    // ── Chat cursors ──

    pub fn chat_cursor(&self, chat_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_message_id FROM chat_cursors WHERE chat_id = ?1",
                    [chat_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_chat_cursor(&self, chat_id: &str, message_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chat_cursors (chat_id, last_message_id) VALUES (?1, ?2) \
                 ON CONFLICT(chat_id) DO UPDATE SET last_message_id = excluded.last_message_id",
                [chat_id, message_id],
            )?;
            Ok(())
        })
    }

    // ── Order flags ──

    pub fn is_order_notified_new(&self, order_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let row: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM orders_notified WHERE order_id = ?1",
                    [order_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(row.is_some())
        })
    }

    /// One-way: an order never loses this flag.
    pub fn mark_order_notified_new(&self, order_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO orders_notified (order_id, created_at) VALUES (?1, ?2) \
                 ON CONFLICT(order_id) DO NOTHING",
                rusqlite::params![order_id, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    pub fn order_status(&self, order_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_status FROM order_status WHERE order_id = ?1",
                    [order_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_order_status(&self, order_id: &str, status: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO order_status (order_id, last_status, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(order_id) DO UPDATE SET \
                   last_status = excluded.last_status, updated_at = excluded.updated_at",
                rusqlite::params![order_id, status, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    // ── Digest dedup ──

    pub fn is_digest_sent(&self, key: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let row: Option<i64> = conn
                .query_row("SELECT 1 FROM digest_sent WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(row.is_some())
        })
    }

    pub fn mark_digest_sent(&self, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO digest_sent (key, created_at) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO NOTHING",
                rusqlite::params![key, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    // ── Subscribers ──

    pub fn upsert_subscriber(&self, subscriber_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO subscribers (subscriber_id) VALUES (?1) \
                 ON CONFLICT(subscriber_id) DO NOTHING",
                [subscriber_id],
            )?;
            Ok(())
        })
    }

    pub fn set_authorized(&self, subscriber_id: i64, authorized: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE subscribers SET authorized = ?2 WHERE subscriber_id = ?1",
                rusqlite::params![subscriber_id, authorized as i64],
            )?;
            Ok(())
        })
    }

    pub fn set_notify(&self, subscriber_id: i64, kind: NotifyKind, enabled: bool) -> Result<()> {
        let Some(column) = kind.column() else {
            return Ok(()); // digest has no opt-out
        };
        self.with_conn(|conn| {
            conn.execute(
                &format!("UPDATE subscribers SET {column} = ?2 WHERE subscriber_id = ?1"),
                rusqlite::params![subscriber_id, enabled as i64],
            )?;
            Ok(())
        })
    }

    /// Authorized recipients for a notification stream, in stable order.
    pub fn recipients(&self, kind: NotifyKind) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let sql = match kind.column() {
                Some(column) => format!(
                    "SELECT subscriber_id FROM subscribers \
                     WHERE authorized = 1 AND {column} = 1 ORDER BY subscriber_id"
                ),
                None => "SELECT subscriber_id FROM subscribers \
                         WHERE authorized = 1 ORDER BY subscriber_id"
                    .to_string(),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            Ok(ids)
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chat_cursors (
            chat_id TEXT PRIMARY KEY,
            last_message_id TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS orders_notified (
            order_id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS order_status (
            order_id TEXT PRIMARY KEY,
            last_status TEXT NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS digest_sent (
            key TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS subscribers (
            subscriber_id INTEGER PRIMARY KEY,
            authorized INTEGER NOT NULL DEFAULT 0,
            notify_auth INTEGER NOT NULL DEFAULT 1,
            notify_chat INTEGER NOT NULL DEFAULT 1,
            notify_orders INTEGER NOT NULL DEFAULT 1,
            notify_bump INTEGER NOT NULL DEFAULT 1
        );",
    )?;
    Ok(())
}
