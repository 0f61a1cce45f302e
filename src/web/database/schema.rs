// Database schema definitions for the posture server

use super::db_error;
use rusqlite::Connection;

const CREATE_POSTURE_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS posture_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    angle REAL NOT NULL,
    shoulder_y_diff REAL NOT NULL,
    shoulder_y_avg REAL NOT NULL,
    logged_at INTEGER NOT NULL
)
"#;

const CREATE_POSTURE_LOGS_USER_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_posture_logs_user
ON posture_logs(user_id, logged_at)
"#;

/// Initialize the database schema (create all tables and indexes)
pub fn initialize(conn: &Connection) -> Result<(), String> {
    let statements = [
        ("posture_logs", CREATE_POSTURE_LOGS_TABLE),
        ("posture_logs_user_index", CREATE_POSTURE_LOGS_USER_INDEX),
    ];

    for (name, sql) in statements.iter() {
        conn.execute(sql, [])
            .map_err(db_error(&format!("create {name}")))?;
    }

    Ok(())
}
