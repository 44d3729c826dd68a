use super::{now_ts, Store};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

/// A question Paula could not answer, handed to a human agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escalation {
    pub id: i64,
    pub client_id: i64,
    pub question: String,
    pub agent_id: String,
    pub created_at: i64,
    pub answered_at: Option<i64>,
    pub answer: Option<String>,
}

fn row_to_escalation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Escalation> {
    Ok(Escalation {
        id: row.get(0)?,
        client_id: row.get(1)?,
        question: row.get(2)?,
        agent_id: row.get(3)?,
        created_at: row.get(4)?,
        answered_at: row.get(5)?,
        answer: row.get(6)?,
    })
}

impl Store {
    pub fn create_escalation(&self, client_id: i64, question: &str, agent_id: &str) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO escalations (client_id, question, agent_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![client_id, question, agent_id, now_ts()],
        )
        .context("Failed to create escalation")?;
        Ok(conn.last_insert_rowid())
    }

    /// Oldest unanswered escalation of the client.
    pub fn open_escalation(&self, client_id: i64) -> Result<Option<Escalation>> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, client_id, question, agent_id, created_at, answered_at, answer
             FROM escalations WHERE client_id = ?1 AND answered_at IS NULL
             ORDER BY id LIMIT 1",
            params![client_id],
            row_to_escalation,
        )
        .optional()
        .context("Failed to look up escalation")
    }

    pub fn answer_escalation(&self, id: i64, answer: &str) -> Result<bool> {
        let n = self
            .lock_conn()
            .execute(
                "UPDATE escalations SET answer = ?2, answered_at = ?3
                 WHERE id = ?1 AND answered_at IS NULL",
                params![id, answer, now_ts()],
            )
            .context("Failed to answer escalation")?;
        Ok(n > 0)
    }
}
