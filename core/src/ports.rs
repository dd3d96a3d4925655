//! Port window parsing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type Port = u16;

/// Default device-service scan window.
pub const DEFAULT_SCAN_START: Port = 4501;
pub const DEFAULT_SCAN_END: Port = 4600;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortRangeError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid port range: {0}")]
    InvalidRange(String),
}

/// Closed interval of local ports, `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    start: Port,
    end: Port,
}

impl PortRange {
    pub fn new(start: Port, end: Port) -> Result<Self, PortRangeError> {
        if start == 0 || end == 0 || start > end {
            return Err(PortRangeError::InvalidRange(format!("{}-{}", start, end)));
        }
        Ok(PortRange { start, end })
    }

    pub fn single(port: Port) -> Result<Self, PortRangeError> {
        Self::new(port, port)
    }

    pub fn start(&self) -> Port {
        self.start
    }

    pub fn end(&self) -> Port {
        self.end
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: Port) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<Port> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange { start: DEFAULT_SCAN_START, end: DEFAULT_SCAN_END }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Accepts `"4501-4600"` or a single port such as `"4501"`.
impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let parse = |s: &str| -> Result<Port, PortRangeError> {
            s.trim().parse::<Port>().map_err(|_| PortRangeError::InvalidPort(s.trim().to_string()))
        };
        if let Some((start, end)) = spec.split_once('-') {
            let s = parse(start)?;
            let e = parse(end)?;
            PortRange::new(s, e).map_err(|_| PortRangeError::InvalidRange(spec.to_string()))
        } else {
            let p = parse(spec)?;
            if p == 0 {
                return Err(PortRangeError::InvalidPort(spec.to_string()));
            }
            PortRange::single(p)
        }
    }
}
