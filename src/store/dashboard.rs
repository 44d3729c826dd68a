use super::Store;
use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;

/// One chart point: unix milliseconds and value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub x: i64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PamTotal {
    pub instance_id: i64,
    pub started_at: i64,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuestionSeries {
    /// Question number within the questionnaire.
    pub label: i64,
    pub data: Vec<Point>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BloodSeries {
    pub systolic: Vec<Point>,
    pub diastolic: Vec<Point>,
    pub pulse: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series<T> {
    pub data: Vec<T>,
}

impl<T> Default for Series<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

/// Everything the client dashboard charts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientDashboard {
    /// PAM total per questionnaire run, over time.
    pub lists: Series<Point>,
    pub pam_totals: Vec<PamTotal>,
    /// PAM answers grouped per question number.
    pub questions: Series<QuestionSeries>,
    pub blood: BloodSeries,
    pub weight: Series<Point>,
}

impl Store {
    pub fn client_dashboard(&self, client_id: i64) -> Result<ClientDashboard> {
        let conn = self.lock_conn();

        let mut stmt = conn.prepare(
            "SELECT q.id, q.started_at, COALESCE(SUM(a.score), 0)
             FROM questionnaire_instances q
             LEFT JOIN answers a ON a.instance_id = q.id
             WHERE q.client_id = ?1 AND q.questionnaire = 'pam'
             GROUP BY q.id ORDER BY q.started_at, q.id",
        )?;
        let pam_totals = stmt
            .query_map(params![client_id], |row| {
                Ok(PamTotal {
                    instance_id: row.get(0)?,
                    started_at: row.get(1)?,
                    total: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load PAM totals")?;

        let mut stmt = conn.prepare(
            "SELECT a.number, a.created_at, a.score
             FROM answers a JOIN questionnaire_instances q ON q.id = a.instance_id
             WHERE q.client_id = ?1 AND q.questionnaire = 'pam' AND a.score IS NOT NULL
             ORDER BY a.number, a.created_at",
        )?;
        let mut questions: Vec<QuestionSeries> = Vec::new();
        let rows = stmt.query_map(params![client_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        for row in rows {
            let (number, created_at, score) = row.context("Failed to load answers")?;
            let point = Point {
                x: created_at * 1000,
                y: score as f64,
            };
            match questions.last_mut() {
                Some(series) if series.label == number => series.data.push(point),
                _ => questions.push(QuestionSeries {
                    label: number,
                    data: vec![point],
                }),
            }
        }

        let mut blood = BloodSeries::default();
        let mut stmt = conn.prepare(
            "SELECT measured_at, systolic, diastolic, pulse FROM blood_pressure
             WHERE client_id = ?1 ORDER BY measured_at",
        )?;
        let rows = stmt.query_map(params![client_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<f64>>(3)?,
            ))
        })?;
        for row in rows {
            let (ts, systolic, diastolic, pulse) = row.context("Failed to load blood pressure")?;
            let x = ts * 1000;
            blood.systolic.push(Point { x, y: systolic });
            blood.diastolic.push(Point { x, y: diastolic });
            if let Some(pulse) = pulse {
                blood.pulse.push(Point { x, y: pulse });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT measured_at, kg FROM weight WHERE client_id = ?1 ORDER BY measured_at",
        )?;
        let weight = stmt
            .query_map(params![client_id], |row| {
                Ok(Point {
                    x: row.get::<_, i64>(0)? * 1000,
                    y: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to load weight")?;

        Ok(ClientDashboard {
            lists: Series {
                data: pam_totals
                    .iter()
                    .map(|t| Point {
                        x: t.started_at * 1000,
                        y: t.total as f64,
                    })
                    .collect(),
            },
            pam_totals,
            questions: Series { data: questions },
            blood,
            weight: Series { data: weight },
        })
    }
}
