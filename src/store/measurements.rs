use super::Store;
use crate::integrations::{BloodPressureReading, Readings, SyncMarks, WeightReading};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

impl Store {
    /// Keyed by (client, measured_at); re-delivered readings overwrite.
    pub fn upsert_blood_pressure(
        &self,
        client_id: i64,
        reading: &BloodPressureReading,
        source: &str,
    ) -> Result<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO blood_pressure (client_id, measured_at, systolic, diastolic, pulse, source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(client_id, measured_at) DO UPDATE SET
                    systolic = excluded.systolic,
                    diastolic = excluded.diastolic,
                    pulse = COALESCE(excluded.pulse, pulse),
                    source = excluded.source",
                params![
                    client_id,
                    reading.measured_at.timestamp(),
                    reading.systolic,
                    reading.diastolic,
                    reading.pulse,
                    source
                ],
            )
            .context("Failed to store blood pressure")?;
        Ok(())
    }

    pub fn upsert_weight(&self, client_id: i64, reading: &WeightReading, source: &str) -> Result<()> {
        self.lock_conn()
            .execute(
                "INSERT INTO weight (client_id, measured_at, kg, source)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(client_id, measured_at) DO UPDATE SET
                    kg = excluded.kg,
                    source = excluded.source",
                params![client_id, reading.measured_at.timestamp(), reading.kg, source],
            )
            .context("Failed to store weight")?;
        Ok(())
    }

    /// Store one fetch worth of readings. Returns how many rows were written.
    pub fn store_readings(&self, client_id: i64, readings: &Readings, source: &str) -> Result<usize> {
        for reading in &readings.blood_pressure {
            self.upsert_blood_pressure(client_id, reading, source)?;
        }
        for reading in &readings.weight {
            self.upsert_weight(client_id, reading, source)?;
        }
        Ok(readings.blood_pressure.len() + readings.weight.len())
    }

    /// Newest measurement per series from `source`; the `since` of the next
    /// fetch of that series.
    pub fn sync_marks(&self, client_id: i64, source: &str) -> Result<SyncMarks> {
        let conn = self.lock_conn();
        let newest = |table: &str| -> Result<Option<DateTime<Utc>>> {
            let ts = conn
                .query_row(
                    &format!(
                        "SELECT MAX(measured_at) FROM {table} WHERE client_id = ?1 AND source = ?2"
                    ),
                    params![client_id, source],
                    |r| r.get::<_, Option<i64>>(0),
                )
                .with_context(|| format!("Failed to read latest {table} measurement"))?;
            Ok(ts.and_then(|ts| DateTime::from_timestamp(ts, 0)))
        };
        Ok(SyncMarks {
            blood_pressure: newest("blood_pressure")?,
            weight: newest("weight")?,
        })
    }

    pub fn blood_pressure_count(&self, client_id: i64) -> Result<i64> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT COUNT(*) FROM blood_pressure WHERE client_id = ?1",
            params![client_id],
            |r| r.get(0),
        )
        .context("Failed to count blood pressure rows")
    }
}
