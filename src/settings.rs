//! Persistent front-end settings

use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;

use crate::error::Result;
use crate::metadata::parse_json_or_string;

/// Settings stored as JSON text by name
pub struct SettingsStore {
    conn: Connection,
}

impl SettingsStore {
    /// Open or create the settings database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        debug!("Opened settings database {:?}", path);
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Value of a setting, `None` when it was never set
    pub fn get(&self, name: &str) -> Result<Option<Value>> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text.map(|t| parse_json_or_string(&t)))
    }

    pub fn set(&mut self, name: &str, value: &Value) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (name, value, updated_at) VALUES (?1, ?2, ?3)",
            params![name, serde_json::to_string(value)?, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Store every entry in one transaction
    pub fn set_all(&mut self, settings: &Map<String, Value>) -> Result<()> {
        let now = Utc::now().timestamp();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO settings (name, value, updated_at) VALUES (?1, ?2, ?3)",
            )?;
            for (name, value) in settings {
                stmt.execute(params![name, serde_json::to_string(value)?, now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Every setting by name
    pub fn all(&self) -> Result<Map<String, Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM settings ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut settings = Map::new();
        for row in rows {
            let (name, text) = row?;
            settings.insert(name, parse_json_or_string(&text));
        }
        Ok(settings)
    }

    /// Seconds since the epoch of the last write to a setting
    pub fn updated_at(&self, name: &str) -> Result<Option<i64>> {
        let ts = self
            .conn
            .query_row(
                "SELECT updated_at FROM settings WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }
}
