//! SQLite persistence: clients, questionnaires, tokens, measurements,
//! Wunderlist mirrors, escalations and recipes.
//!
//! All timestamps are stored as unix seconds.

mod clients;
mod dashboard;
mod escalations;
mod measurements;
mod questionnaires;
mod recipes;
mod tokens;
mod wunderlist;

pub use clients::Client;
pub use dashboard::{BloodSeries, ClientDashboard, PamTotal, Point, QuestionSeries, Series};
pub use escalations::Escalation;
pub use questionnaires::{Answer, QuestionnaireInstance, QuestionnaireKind};
pub use recipes::Recipe;
pub use tokens::{StoredToken, TokenKind};
pub use wunderlist::StoredItem;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clients (
    id INTEGER NOT NULL,
    type TEXT NOT NULL,
    handle TEXT NOT NULL,
    name TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (id, type),
    UNIQUE (type, handle)
);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL,
    direction TEXT NOT NULL,
    text TEXT NOT NULL,
    action TEXT,
    session_id TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_log_client ON event_log(client_id, created_at);

CREATE TABLE IF NOT EXISTS questionnaire_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL,
    questionnaire TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    stopped_at INTEGER,
    last_nudged_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_questionnaire_client
    ON questionnaire_instances(client_id, questionnaire, stopped_at);

CREATE TABLE IF NOT EXISTS answers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    instance_id INTEGER NOT NULL REFERENCES questionnaire_instances(id),
    number INTEGER NOT NULL,
    value TEXT NOT NULL,
    score INTEGER,
    created_at INTEGER NOT NULL,
    UNIQUE (instance_id, number)
);

CREATE TABLE IF NOT EXISTS oauth_tokens (
    client_id INTEGER NOT NULL,
    provider TEXT NOT NULL,
    kind TEXT NOT NULL,
    token TEXT NOT NULL,
    secret TEXT NOT NULL,
    extra TEXT,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (client_id, provider, kind)
);
CREATE INDEX IF NOT EXISTS idx_oauth_tokens_token ON oauth_tokens(provider, kind, token);

CREATE TABLE IF NOT EXISTS blood_pressure (
    client_id INTEGER NOT NULL,
    measured_at INTEGER NOT NULL,
    systolic REAL NOT NULL,
    diastolic REAL NOT NULL,
    pulse REAL,
    source TEXT NOT NULL,
    PRIMARY KEY (client_id, measured_at)
);

CREATE TABLE IF NOT EXISTS weight (
    client_id INTEGER NOT NULL,
    measured_at INTEGER NOT NULL,
    kg REAL NOT NULL,
    source TEXT NOT NULL,
    PRIMARY KEY (client_id, measured_at)
);

CREATE TABLE IF NOT EXISTS wunderlist_lists (
    id INTEGER PRIMARY KEY,
    client_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    webhook_registered INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS wunderlist_items (
    id INTEGER PRIMARY KEY,
    list_id INTEGER NOT NULL,
    client_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    due_date TEXT,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_wunderlist_items_client ON wunderlist_items(client_id);

CREATE TABLE IF NOT EXISTS escalations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL,
    question TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    answered_at INTEGER,
    answer TEXT
);

CREATE TABLE IF NOT EXISTS recipes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    ingredients TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT ''
);
";

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to configure database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Create every table and index that does not exist yet.
    pub fn migrate(&self) -> Result<()> {
        self.lock_conn()
            .execute_batch(SCHEMA)
            .context("Failed to apply database schema")
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
