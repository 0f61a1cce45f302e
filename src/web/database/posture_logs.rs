// Database methods for per-frame posture measurements

use super::{db_error, Database};
use crate::web::posture::MeasurementRecord;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PostureLogRow {
    pub id: i64,
    pub user_id: i64,
    pub angle: f64,
    pub shoulder_y_diff: f64,
    pub shoulder_y_avg: f64,
    pub logged_at: i64, // ms since epoch
}

impl Database {
    /// Append a batch of measurements for one user in a single transaction.
    /// Non-finite values are skipped. Returns how many rows were written.
    pub fn push_logs(&self, user_id: i64, records: &[MeasurementRecord]) -> Result<usize, String> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection();
        let tx = conn.transaction().map_err(db_error("begin posture log batch"))?;
        let mut written = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO posture_logs (user_id, angle, shoulder_y_diff, shoulder_y_avg, logged_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(db_error("prepare posture log insert"))?;

            for record in records {
                if ![record.angle, record.shoulder_y_diff, record.shoulder_y_avg]
                    .iter()
                    .all(|v| v.is_finite())
                {
                    continue;
                }
                stmt.execute(params![
                    user_id,
                    record.angle,
                    record.shoulder_y_diff,
                    record.shoulder_y_avg,
                    record.logged_at.timestamp_millis(),
                ])
                .map_err(db_error("insert posture log"))?;
                written += 1;
            }
        }
        tx.commit().map_err(db_error("commit posture log batch"))?;
        Ok(written)
    }

    /// Most recent measurements for a user, newest first
    pub fn recent_logs(&self, user_id: i64, limit: usize) -> Result<Vec<PostureLogRow>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, angle, shoulder_y_diff, shoulder_y_avg, logged_at FROM posture_logs WHERE user_id = ?1 ORDER BY logged_at DESC, id DESC LIMIT ?2",
            )
            .map_err(db_error("prepare recent posture logs"))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![user_id, limit], |row| {
                Ok(PostureLogRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    angle: row.get(2)?,
                    shoulder_y_diff: row.get(3)?,
                    shoulder_y_avg: row.get(4)?,
                    logged_at: row.get(5)?,
                })
            })
            .map_err(db_error("query recent posture logs"))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(db_error("read posture log row"))
    }
}

impl PostureLogRow {
    pub fn logged_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.logged_at)
    }
}
