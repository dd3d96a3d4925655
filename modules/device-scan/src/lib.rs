//! Device-service discovery over a local port window with bounded concurrency.
//!
//! Every port in the window gets exactly one probe. At most `concurrency`
//! probes are outstanding; each completion frees a slot for the next queued
//! port. Successful probes are merged into the [`DeviceRegistry`] as they
//! complete, failures are counted and otherwise dropped. A scan returns only
//! after every launched probe has finished.

use backend_client::DeviceInfoDecoder;
use mdstest_core::ratelimiter::RateLimiter;
use mdstest_core::{DeviceInfo, DiscoveryRecord, Port, PortRange};
use mds_dispatch::{DeviceTransport, ProbeKind};
use registry_sqlite::{DeviceRegistry, RegistryError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CONCURRENCY: usize = 10;
const MAX_CONCURRENCY: usize = 1_024;

#[derive(Debug, Error)]
pub enum ScanError {
    /// A successful probe could not be persisted. Remaining ports were not probed.
    #[error("registry merge for port {port} failed: {source}")]
    Registry {
        port: Port,
        #[source]
        source: RegistryError,
    },
}

/// A device that answered DISCOVER but whose info could not be fetched or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeFailure {
    pub port: Port,
    pub message: String,
}

/// Aggregate result of one scan pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub range: PortRange,
    /// Probes that ran to completion.
    pub probed: usize,
    /// Ports merged into the registry.
    pub found: usize,
    /// Ports with no usable device service (refused, timed out, malformed).
    pub failed: usize,
    /// Stopped early; some ports in the window were never probed.
    pub cancelled: bool,
    pub decode_failures: Vec<DecodeFailure>,
}

impl ScanSummary {
    fn new(range: PortRange) -> Self {
        ScanSummary { range, probed: 0, found: 0, failed: 0, cancelled: false, decode_failures: Vec::new() }
    }
}

#[derive(Clone)]
enum Mode {
    Discover,
    Info(Arc<dyn DeviceInfoDecoder>),
}

enum PortResult {
    Merged,
    NoDevice,
    /// Discovery was merged but the device info could not be fetched or decoded.
    DecodeFailed(String),
    PersistFailed(RegistryError),
}

/// Scans the local port window and feeds the registry.
#[derive(Clone)]
pub struct Scanner {
    transport: Arc<dyn DeviceTransport>,
    registry: DeviceRegistry,
    pacer: Option<RateLimiter>,
}

impl Scanner {
    pub fn new(transport: Arc<dyn DeviceTransport>, registry: DeviceRegistry) -> Self {
        Scanner { transport, registry, pacer: None }
    }

    /// Cap probe launches per second; `None` or `Some(0)` disables pacing.
    pub fn with_qps(mut self, qps: Option<u32>) -> Self {
        self.pacer = RateLimiter::from_qps(qps);
        self
    }

    /// DISCOVER every port in `range`, merging each answer as a [`DiscoveryRecord`].
    pub async fn scan(&self, range: PortRange, concurrency: usize) -> Result<ScanSummary, ScanError> {
        self.scan_with_cancel(range, concurrency, CancellationToken::new()).await
    }

    pub async fn scan_with_cancel(
        &self,
        range: PortRange,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        self.run(range, concurrency, Mode::Discover, cancel).await
    }

    /// Like [`Scanner::scan`], then for each port that answered, fetch INFO,
    /// decode it through `decoder` and merge the result as [`DeviceInfo`].
    /// Fetch and decode failures are reported in the summary.
    pub async fn scan_with_info(
        &self,
        decoder: Arc<dyn DeviceInfoDecoder>,
        range: PortRange,
        concurrency: usize,
    ) -> Result<ScanSummary, ScanError> {
        self.scan_with_info_and_cancel(decoder, range, concurrency, CancellationToken::new()).await
    }

    pub async fn scan_with_info_and_cancel(
        &self,
        decoder: Arc<dyn DeviceInfoDecoder>,
        range: PortRange,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        self.run(range, concurrency, Mode::Info(decoder), cancel).await
    }

    #[instrument(skip(self, mode, cancel), fields(range = %range))]
    async fn run(
        &self,
        range: PortRange,
        concurrency: usize,
        mode: Mode,
        cancel: CancellationToken,
    ) -> Result<ScanSummary, ScanError> {
        let limit = concurrency.clamp(1, MAX_CONCURRENCY);
        let mut queue = range.iter();
        let mut set = JoinSet::new();
        let mut summary = ScanSummary::new(range);
        let mut launched = 0usize;
        let mut persist_error: Option<ScanError> = None;

        loop {
            while set.len() < limit && persist_error.is_none() && !cancel.is_cancelled() {
                let Some(port) = queue.next() else { break };
                if let Some(p) = &self.pacer {
                    tokio::select! {
                        _ = p.acquire() => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                let transport = self.transport.clone();
                let registry = self.registry.clone();
                let mode = mode.clone();
                set.spawn(async move { (port, probe_port(transport, registry, mode, port).await) });
                launched += 1;
            }

            let Some(joined) = set.join_next().await else { break };
            summary.probed += 1;
            match joined {
                Ok((_, PortResult::Merged)) => summary.found += 1,
                Ok((_, PortResult::NoDevice)) => summary.failed += 1,
                Ok((port, PortResult::DecodeFailed(message))) => {
                    summary.found += 1;
                    warn!(port, %message, "device info could not be decoded");
                    summary.decode_failures.push(DecodeFailure { port, message });
                }
                Ok((port, PortResult::PersistFailed(source))) => {
                    warn!(port, error = %source, "registry merge failed; draining scan");
                    if persist_error.is_none() {
                        persist_error = Some(ScanError::Registry { port, source });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "probe task aborted");
                    summary.failed += 1;
                }
            }
        }

        if let Some(e) = persist_error {
            return Err(e);
        }
        summary.cancelled = launched < range.len();
        summary.decode_failures.sort_by_key(|f| f.port);
        info!(
            probed = summary.probed,
            found = summary.found,
            failed = summary.failed,
            decode_failures = summary.decode_failures.len(),
            cancelled = summary.cancelled,
            "scan complete"
        );
        Ok(summary)
    }
}

async fn probe_port(
    transport: Arc<dyn DeviceTransport>,
    registry: DeviceRegistry,
    mode: Mode,
    port: Port,
) -> PortResult {
    match mode {
        Mode::Discover => match transport.probe(ProbeKind::Discover, port).await {
            Ok(payload) => match registry.merge(DiscoveryRecord::new(port, payload)).await {
                Ok(()) => PortResult::Merged,
                Err(e) => PortResult::PersistFailed(e),
            },
            Err(e) => {
                debug!(port, error = %e, "no device service");
                PortResult::NoDevice
            }
        },
        Mode::Info(decoder) => {
            let payload = match transport.probe(ProbeKind::Discover, port).await {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(port, error = %e, "no device service");
                    return PortResult::NoDevice;
                }
            };
            if let Err(e) = registry.merge(DiscoveryRecord::new(port, payload)).await {
                return PortResult::PersistFailed(e);
            }
            let raw = match transport.probe(ProbeKind::Info, port).await {
                Ok(raw) => raw,
                Err(e) => return PortResult::DecodeFailed(format!("device info unavailable: {e}")),
            };
            match decoder.decode_device_info(&raw).await {
                Ok(decoded) => match registry.merge_info(DeviceInfo::new(port, decoded)).await {
                    Ok(()) => PortResult::Merged,
                    Err(e) => PortResult::PersistFailed(e),
                },
                Err(e) => PortResult::DecodeFailed(e.to_string()),
            }
        }
    }
}
