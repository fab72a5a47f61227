// SPDX-License-Identifier: CEPL-1.0
//! Layer configuration: an optional TOML file overlaid by environment variables.
//!
//! ```toml
//! display_id = "8086:3e9b"
//! render_id = "10de"
//! worker_threads = "single"
//! ```

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CONFIG_FILE_ENV: &str = "PRIMUS_VK_CONFIG";
pub const DISPLAY_ID_ENV: &str = "PRIMUS_VK_DISPLAYID";
pub const RENDER_ID_ENV: &str = "PRIMUS_VK_RENDERID";
pub const MULTITHREADING_ENV: &str = "PRIMUS_VK_MULTITHREADING";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid device id {value:?}, expected hex vendor[:device]")]
    DeviceId { value: String },
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}

/// PCI vendor/device pair used to pin a physical device.
///
/// A `device` of zero matches any device of the vendor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct DeviceId {
    pub vendor: u32,
    pub device: u32,
}

impl DeviceId {
    pub fn matches(&self, vendor_id: u32, device_id: u32) -> bool {
        self.vendor == vendor_id && (self.device == 0 || self.device == device_id)
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

impl FromStr for DeviceId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::DeviceId { value: s.to_owned() };
        let mut parts = s.split(':');
        let vendor = parts.next().and_then(parse_hex).ok_or_else(bad)?;
        let device = match parts.next() {
            Some(d) => parse_hex(d).ok_or_else(bad)?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(DeviceId { vendor, device })
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How many threads drain a swapchain's present queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerThreads {
    /// One thread per swapchain image.
    #[default]
    PerImage,
    /// A single thread; presents are still strictly ordered but never overlap.
    Single,
}

impl WorkerThreads {
    pub fn count(self, image_count: usize) -> usize {
        match self {
            WorkerThreads::PerImage => image_count.max(1),
            WorkerThreads::Single => 1,
        }
    }

    fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "single" => WorkerThreads::Single,
            _ => WorkerThreads::PerImage,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub display_id: Option<DeviceId>,
    pub render_id: Option<DeviceId>,
    pub worker_threads: WorkerThreads,
}

impl LayerConfig {
    /// Read the file named by `PRIMUS_VK_CONFIG` (if any), then the environment.
    pub fn load() -> Self {
        let file = match std::env::var(CONFIG_FILE_ENV) {
            Ok(path) => match std::fs::read_to_string(&path) {
                Ok(text) => Some(text),
                Err(source) => {
                    warn!("{}", ConfigError::Read { path, source });
                    None
                }
            },
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Merge defaults, the TOML text and environment lookups, in that order.
    ///
    /// Bad values are logged and skipped.
    pub fn from_sources(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = match file.map(toml::from_str::<LayerConfig>) {
            Some(Ok(cfg)) => cfg,
            Some(Err(e)) => {
                warn!("{}", ConfigError::from(e));
                LayerConfig::default()
            }
            None => LayerConfig::default(),
        };

        for (key, slot) in [
            (DISPLAY_ID_ENV, &mut cfg.display_id),
            (RENDER_ID_ENV, &mut cfg.render_id),
        ] {
            if let Some(value) = env(key) {
                match value.parse::<DeviceId>() {
                    Ok(id) => *slot = Some(id),
                    Err(e) => warn!("{key}: {e}"),
                }
            }
        }
        if let Some(value) = env(MULTITHREADING_ENV) {
            cfg.worker_threads = WorkerThreads::from_env_value(&value);
        }

        debug!(?cfg, "layer configuration");
        cfg
    }
}
