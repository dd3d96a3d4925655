use crate::{Db, KvStore, RegistryError};
use mdstest_core::{DeviceInfo, DiscoveryRecord, Port};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Blob key holding port → discovery record.
pub const DISCOVER_KEY: &str = "deviceDiscover";
/// Blob key holding port → decoded device info.
pub const INFO_KEY: &str = "deviceInfo";

const MAILBOX: usize = 256;

type Reply<T> = oneshot::Sender<Result<T, RegistryError>>;

enum Command {
    MergeDiscovery(DiscoveryRecord, Reply<()>),
    MergeInfo(DeviceInfo, Reply<()>),
    Get(Port, Reply<Option<DiscoveryRecord>>),
    GetInfo(Port, Reply<Option<DeviceInfo>>),
    Snapshot(Reply<BTreeMap<Port, DiscoveryRecord>>),
    SnapshotInfo(Reply<BTreeMap<Port, DeviceInfo>>),
    Remove(Port, Reply<bool>),
    Clear(Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the registry actor.
///
/// Cloning is cheap; every clone talks to the same writer thread, which owns
/// the store and the in-memory maps. All read-modify-write cycles run on that
/// thread one command at a time, so merges to different ports never race.
#[derive(Clone)]
pub struct DeviceRegistry {
    tx: mpsc::Sender<Command>,
}

impl DeviceRegistry {
    /// Open (or create) the SQLite-backed registry at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::with_store(Db::open_or_create(path)?)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::with_store(Db::open_in_memory()?)
    }

    /// Load both maps from `store` and start the writer thread.
    pub fn with_store<S: KvStore>(store: S) -> Result<Self, RegistryError> {
        let discovery = Table::<DiscoveryRecord>::load(&store, DISCOVER_KEY)?;
        let info = Table::<DeviceInfo>::load(&store, INFO_KEY)?;
        debug!(
            discovered = discovery.entries.len(),
            described = info.entries.len(),
            "device registry loaded"
        );
        let (tx, rx) = mpsc::channel(MAILBOX);
        let actor = Actor { store: Box::new(store), discovery, info };
        std::thread::Builder::new()
            .name("device-registry".into())
            .spawn(move || actor.run(rx))
            .map_err(|e| RegistryError::PersistFailure(format!("spawn registry writer: {e}")))?;
        Ok(DeviceRegistry { tx })
    }

    /// Insert or replace the discovery record for `record.port`.
    ///
    /// Returns only after the full map has been persisted.
    pub async fn merge(&self, record: DiscoveryRecord) -> Result<(), RegistryError> {
        self.call(|r| Command::MergeDiscovery(record, r)).await
    }

    /// Insert or replace the decoded device info for `info.port`.
    pub async fn merge_info(&self, info: DeviceInfo) -> Result<(), RegistryError> {
        self.call(|r| Command::MergeInfo(info, r)).await
    }

    pub async fn get(&self, port: Port) -> Result<DiscoveryRecord, RegistryError> {
        self.call(|r| Command::Get(port, r)).await?.ok_or(RegistryError::NotFound(port))
    }

    pub async fn get_info(&self, port: Port) -> Result<DeviceInfo, RegistryError> {
        self.call(|r| Command::GetInfo(port, r)).await?.ok_or(RegistryError::NotFound(port))
    }

    /// Ports with a discovery record, ascending.
    pub async fn list_ports(&self) -> Result<Vec<Port>, RegistryError> {
        Ok(self.snapshot().await?.into_keys().collect())
    }

    /// Ports with decoded device info, ascending.
    pub async fn list_info_ports(&self) -> Result<Vec<Port>, RegistryError> {
        Ok(self.snapshot_info().await?.into_keys().collect())
    }

    pub async fn snapshot(&self) -> Result<BTreeMap<Port, DiscoveryRecord>, RegistryError> {
        self.call(Command::Snapshot).await
    }

    pub async fn snapshot_info(&self) -> Result<BTreeMap<Port, DeviceInfo>, RegistryError> {
        self.call(Command::SnapshotInfo).await
    }

    /// Drop `port` from both maps. Returns whether anything was removed.
    pub async fn remove(&self, port: Port) -> Result<bool, RegistryError> {
        self.call(|r| Command::Remove(port, r)).await
    }

    /// Drop every entry from both maps.
    pub async fn clear(&self) -> Result<(), RegistryError> {
        self.call(Command::Clear).await
    }

    /// Stop the writer thread after it drains queued commands.
    pub async fn shutdown(self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| RegistryError::Closed)?;
        rx.await.map_err(|_| RegistryError::Closed)?
    }
}

struct Table<T> {
    key: &'static str,
    entries: BTreeMap<Port, T>,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq,
{
    fn load(store: &dyn KvStore, key: &'static str) -> Result<Self, RegistryError> {
        let entries = match store.load(key)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|source| RegistryError::Corrupt { key: key.to_string(), source })?,
            None => BTreeMap::new(),
        };
        Ok(Table { key, entries })
    }

    fn merge(&mut self, store: &mut dyn KvStore, port: Port, value: T) -> Result<(), RegistryError> {
        if self.entries.get(&port) == Some(&value) {
            return Ok(());
        }
        let mut next = self.entries.clone();
        next.insert(port, value);
        self.commit(store, next)
    }

    fn remove(&mut self, store: &mut dyn KvStore, port: Port) -> Result<bool, RegistryError> {
        if !self.entries.contains_key(&port) {
            return Ok(false);
        }
        let mut next = self.entries.clone();
        next.remove(&port);
        self.commit(store, next)?;
        Ok(true)
    }

    fn clear(&mut self, store: &mut dyn KvStore) -> Result<(), RegistryError> {
        self.commit(store, BTreeMap::new())
    }

    // The new map only replaces the live one once the store accepted it.
    fn commit(&mut self, store: &mut dyn KvStore, next: BTreeMap<Port, T>) -> Result<(), RegistryError> {
        let raw = serde_json::to_string(&next).map_err(|e| RegistryError::PersistFailure(e.to_string()))?;
        store.store(self.key, &raw).map_err(|e| match e {
            RegistryError::PersistFailure(_) => e,
            other => RegistryError::PersistFailure(other.to_string()),
        })?;
        self.entries = next;
        Ok(())
    }
}

struct Actor {
    store: Box<dyn KvStore>,
    discovery: Table<DiscoveryRecord>,
    info: Table<DeviceInfo>,
}

impl Actor {
    fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                Command::MergeDiscovery(record, reply) => {
                    let port = record.port;
                    let res = self.discovery.merge(self.store.as_mut(), port, record);
                    log_write("merge discovery", port, &res);
                    let _ = reply.send(res);
                }
                Command::MergeInfo(info, reply) => {
                    let port = info.port;
                    let res = self.info.merge(self.store.as_mut(), port, info);
                    log_write("merge info", port, &res);
                    let _ = reply.send(res);
                }
                Command::Get(port, reply) => {
                    let _ = reply.send(Ok(self.discovery.entries.get(&port).cloned()));
                }
                Command::GetInfo(port, reply) => {
                    let _ = reply.send(Ok(self.info.entries.get(&port).cloned()));
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(Ok(self.discovery.entries.clone()));
                }
                Command::SnapshotInfo(reply) => {
                    let _ = reply.send(Ok(self.info.entries.clone()));
                }
                Command::Remove(port, reply) => {
                    let res = self
                        .discovery
                        .remove(self.store.as_mut(), port)
                        .and_then(|a| Ok(self.info.remove(self.store.as_mut(), port)? || a));
                    let _ = reply.send(res);
                }
                Command::Clear(reply) => {
                    let res = self
                        .discovery
                        .clear(self.store.as_mut())
                        .and_then(|_| self.info.clear(self.store.as_mut()));
                    let _ = reply.send(res);
                }
                Command::Shutdown(ack) => {
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!("device registry writer stopped");
    }
}

fn log_write(op: &str, port: Port, res: &Result<(), RegistryError>) {
    match res {
        Ok(()) => debug!(port, "{op}"),
        Err(e) => warn!(port, error = %e, "{op} failed"),
    }
}
