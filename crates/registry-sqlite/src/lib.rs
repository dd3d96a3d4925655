//! Persisted device registry: port → discovery record and port → decoded
//! device info, stored as two JSON blobs in a SQLite key-value table and
//! mutated only through a single-writer actor.

mod error;
mod insert;
mod open;
mod query;
mod registry;
mod schema;

pub use error::RegistryError;
pub use open::Db;
pub use registry::{DeviceRegistry, DISCOVER_KEY, INFO_KEY};

/// Blob storage the registry actor persists into.
///
/// `Db` is the production implementation; tests substitute stores that fail
/// on demand.
pub trait KvStore: Send + 'static {
    fn load(&self, key: &str) -> Result<Option<String>, RegistryError>;
    fn store(&mut self, key: &str, value: &str) -> Result<(), RegistryError>;
}

impl KvStore for Db {
    fn load(&self, key: &str) -> Result<Option<String>, RegistryError> {
        self.get_blob(key)
    }

    fn store(&mut self, key: &str, value: &str) -> Result<(), RegistryError> {
        self.put_blob(key, value)
    }
}
