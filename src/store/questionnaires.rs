use super::{now_ts, Store};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionnaireKind {
    /// Patient Activation Measure, scored 1..4 per question (0 = not applicable).
    Pam,
    /// SF-12 health survey.
    Sf12,
}

impl QuestionnaireKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pam => "pam",
            Self::Sf12 => "sf12",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "pam" => Some(Self::Pam),
            "sf12" => Some(Self::Sf12),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionnaireInstance {
    pub id: i64,
    pub client_id: i64,
    pub kind: QuestionnaireKind,
    pub started_at: i64,
    pub stopped_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub instance_id: i64,
    pub number: i64,
    pub value: String,
    pub score: Option<i64>,
    pub created_at: i64,
}

fn row_to_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuestionnaireInstance> {
    let kind: String = row.get(2)?;
    Ok(QuestionnaireInstance {
        id: row.get(0)?,
        client_id: row.get(1)?,
        kind: QuestionnaireKind::parse(&kind).unwrap_or(QuestionnaireKind::Pam),
        started_at: row.get(3)?,
        stopped_at: row.get(4)?,
    })
}

const LAST_ANSWER: &str =
    "COALESCE((SELECT MAX(created_at) FROM answers a WHERE a.instance_id = q.id), 0)";
const INSTANCE_COLUMNS: &str = "id, client_id, questionnaire, started_at, stopped_at";

impl Store {
    /// Start a fresh instance. An open instance of the same questionnaire is
    /// stopped first so answers never straddle two runs.
    pub fn start_questionnaire(
        &self,
        client_id: i64,
        kind: QuestionnaireKind,
    ) -> Result<QuestionnaireInstance> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let now = now_ts();
        tx.execute(
            "UPDATE questionnaire_instances SET stopped_at = ?3
             WHERE client_id = ?1 AND questionnaire = ?2 AND stopped_at IS NULL",
            params![client_id, kind.as_str(), now],
        )?;
        tx.execute(
            "INSERT INTO questionnaire_instances (client_id, questionnaire, started_at)
             VALUES (?1, ?2, ?3)",
            params![client_id, kind.as_str(), now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit().context("Failed to start questionnaire")?;
        Ok(QuestionnaireInstance {
            id,
            client_id,
            kind,
            started_at: now,
            stopped_at: None,
        })
    }

    pub fn open_questionnaire(
        &self,
        client_id: i64,
        kind: QuestionnaireKind,
    ) -> Result<Option<QuestionnaireInstance>> {
        let conn = self.lock_conn();
        conn.query_row(
            &format!(
                "SELECT {INSTANCE_COLUMNS} FROM questionnaire_instances
                 WHERE client_id = ?1 AND questionnaire = ?2 AND stopped_at IS NULL
                 ORDER BY id DESC LIMIT 1"
            ),
            params![client_id, kind.as_str()],
            row_to_instance,
        )
        .optional()
        .context("Failed to look up open questionnaire")
    }

    /// Stop every open questionnaire of the client. Returns how many stopped.
    pub fn stop_questionnaires(&self, client_id: i64) -> Result<usize> {
        self.lock_conn()
            .execute(
                "UPDATE questionnaire_instances SET stopped_at = ?2
                 WHERE client_id = ?1 AND stopped_at IS NULL",
                params![client_id, now_ts()],
            )
            .context("Failed to stop questionnaires")
    }

    /// Append an answer numbered one past the instance's current count.
    pub fn record_answer(&self, instance_id: i64, value: &str, score: Option<i64>) -> Result<Answer> {
        let conn = self.lock_conn();
        let tx = conn.unchecked_transaction()?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM answers WHERE instance_id = ?1",
            params![instance_id],
            |r| r.get(0),
        )?;
        let now = now_ts();
        let number = count + 1;
        tx.execute(
            "INSERT INTO answers (instance_id, number, value, score, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![instance_id, number, value, score, now],
        )?;
        tx.commit().context("Failed to record answer")?;
        Ok(Answer {
            instance_id,
            number,
            value: value.to_string(),
            score,
            created_at: now,
        })
    }

    pub fn answer_count(&self, instance_id: i64) -> Result<i64> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM answers WHERE instance_id = ?1",
            params![instance_id],
            |r| r.get(0),
        )
        .context("Failed to count answers")
    }

    pub fn answers(&self, instance_id: i64) -> Result<Vec<Answer>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT instance_id, number, value, score, created_at FROM answers
             WHERE instance_id = ?1 ORDER BY number",
        )?;
        let rows = stmt
            .query_map(params![instance_id], |row| {
                Ok(Answer {
                    instance_id: row.get(0)?,
                    number: row.get(1)?,
                    value: row.get(2)?,
                    score: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list answers")?;
        Ok(rows)
    }

    /// Open instances with no activity (answer, start or earlier nudge) since
    /// `cutoff`.
    /// Open runs idle since before `cutoff` that have not been reminded since
    /// their last answer. One reminder per idle stretch; a new answer re-arms it.
    pub fn stale_questionnaires(&self, cutoff: i64) -> Result<Vec<QuestionnaireInstance>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM questionnaire_instances q
             WHERE stopped_at IS NULL
               AND MAX(started_at, {LAST_ANSWER}) < ?1
               AND (last_nudged_at IS NULL OR last_nudged_at < {LAST_ANSWER})
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![cutoff], row_to_instance)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to list stale questionnaires")?;
        Ok(rows)
    }

    pub fn mark_nudged(&self, instance_id: i64) -> Result<()> {
        self.lock_conn()
            .execute(
                "UPDATE questionnaire_instances SET last_nudged_at = ?2 WHERE id = ?1",
                params![instance_id, now_ts()],
            )
            .context("Failed to mark questionnaire nudged")?;
        Ok(())
    }
}
