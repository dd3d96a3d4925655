use crate::{Db, RegistryError};
use rusqlite::params;
use std::time::{SystemTime, UNIX_EPOCH};

impl Db {
    /// Insert or replace a whole blob under `key`.
    pub fn put_blob(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.conn.execute(
            "INSERT INTO kv(key,value,updated_ms) VALUES (?,?,?)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_ms=excluded.updated_ms",
            params![key, value, now_ms],
        )?;
        Ok(())
    }
}
