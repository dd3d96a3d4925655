use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "mdstest.yaml";
pub const DEFAULT_REGISTRY_FILE: &str = "mdstest.db";
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8090/v1/mds";

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ScanConfig {
    pub ports: Option<String>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub qps: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub host: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Config {
    pub fn registry_path(&self) -> PathBuf {
        self.registry.path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_FILE))
    }

    pub fn backend_url(&self) -> &str {
        self.backend.base_url.as_deref().unwrap_or(DEFAULT_BACKEND_URL)
    }

    pub fn backend_timeout_ms(&self) -> u64 {
        self.backend.timeout_ms.unwrap_or(backend_client::DEFAULT_TIMEOUT_MS)
    }

    pub fn device_host(&self) -> &str {
        self.device.host.as_deref().unwrap_or(mds_dispatch::DEFAULT_HOST)
    }

    /// Per-call device timeout. `scan.timeout_ms` takes precedence for scans.
    pub fn device_timeout_ms(&self) -> u64 {
        self.device.timeout_ms.unwrap_or(mds_dispatch::DEFAULT_TIMEOUT_MS)
    }
}

/// Load an explicit config file, or `./mdstest.yaml` when present.
///
/// A missing default file yields the built-in defaults; an explicit path that
/// cannot be read, or any file that does not parse, is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}
