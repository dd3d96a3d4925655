use mdstest_core::{FailureKind, Port};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no registry entry for port {0}")]
    NotFound(Port),
    /// A merge could not be written durably; the registry kept its previous state.
    #[error("registry persist failed: {0}")]
    PersistFailure(String),
    #[error("registry store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("persisted registry blob '{key}' is corrupt: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("device registry is shut down")]
    Closed,
}

impl RegistryError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            RegistryError::PersistFailure(_) => Some(FailureKind::RegistryPersistFailure),
            _ => None,
        }
    }
}
