// SQLite database module for the posture server
// Per-frame posture measurements are appended here in batches by each session.

pub mod posture_logs;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Main database wrapper around a single serialized connection
pub struct Database {
    conn: Mutex<Connection>,
}

/// Shared database type for passing across async boundaries
pub type SharedDatabase = Arc<Database>;

/// Helper function to create standardized database error messages
///
/// Usage: `.map_err(db_error("insert posture log"))?`
pub fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> String + '_ {
    move |e| format!("Failed to {context}: {e}")
}

impl Database {
    /// Open (or create) the database file and initialize schema
    pub fn new(db_path: &Path) -> Result<Self, String> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create {}: {e}", parent.display()))?;
        }
        let conn = Connection::open(db_path).map_err(db_error("open database"))?;
        Self::from_connection(conn)
    }

    /// In-memory database (tests and anonymous-only deployments)
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(db_error("open in-memory database"))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, String> {
        // WAL keeps readers from blocking the batch writers
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get a reference to the connection (locked)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}
