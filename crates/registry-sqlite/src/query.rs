use crate::{Db, RegistryError};
use rusqlite::OptionalExtension;

impl Db {
    pub fn get_blob(&self, key: &str) -> Result<Option<String>, RegistryError> {
        let v = self
            .conn
            .query_row("SELECT value FROM kv WHERE key=?", [key], |r| r.get(0))
            .optional()?;
        Ok(v)
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, RegistryError> {
        let cnt: i64 = self.conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::Db;

    #[test]
    fn blob_round_trip_and_overwrite() {
        let db = Db::open_in_memory().unwrap();
        assert!(db.table_exists("kv").unwrap());
        assert_eq!(db.get_blob("deviceInfo").unwrap(), None);
        db.put_blob("deviceInfo", "{}").unwrap();
        db.put_blob("deviceInfo", r#"{"4501":1}"#).unwrap();
        assert_eq!(db.get_blob("deviceInfo").unwrap().as_deref(), Some(r#"{"4501":1}"#));
    }
}
