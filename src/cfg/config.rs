// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Runtime configuration: servers to auto-register, default
//! `ServiceOptions`, and the logging section consumed by `cfg::logger`.

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{cfg::enums::InitialScanMode, service::ServiceOptions, topology::InitialScan};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Servers to connect to on startup.
    pub servers: Vec<ServerConfig>,
    /// Default scan/poll behaviour applied to every server unless
    /// overridden per-server.
    pub defaults: ServiceDefaults,
    /// Logging configuration file path, handed to `cfg::logger::init_logger`.
    #[serde(default)]
    pub logging_config: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServiceDefaults {
    #[serde(rename = "ScanSecs", default)]
    /// Period between periodic topology scans, in seconds. `0` disables
    /// periodic scanning.
    pub scan_secs: u64,

    #[serde(rename = "InitialScan", default = "default_initial_scan")]
    pub initial_scan: InitialScanMode,

    #[serde(rename = "Polling", default = "default_true")]
    pub polling: bool,

    #[serde(rename = "LoadStructs", default)]
    pub load_structs: bool,

    #[serde(rename = "Random", default = "default_random")]
    /// Scan-interval jitter knob; `0.0` disables jitter.
    pub random: f64,
}

fn default_initial_scan() -> InitialScanMode {
    InitialScanMode::Inline
}
fn default_true() -> bool {
    true
}
fn default_random() -> f64 {
    4.0
}

impl From<&ServiceDefaults> for ServiceOptions {
    fn from(d: &ServiceDefaults) -> Self {
        Self {
            scan: (d.scan_secs > 0).then(|| Duration::from_secs(d.scan_secs)),
            initial_scan: match d.initial_scan {
                InitialScanMode::Inline => InitialScan::Inline,
                InitialScanMode::Skip => InitialScan::Skip,
                InitialScanMode::Delayed { after_secs } =>
                    InitialScan::DelayedBy(Duration::from_secs(after_secs)),
            },
            polling: d.polling,
            load_structs: d.load_structs,
            random: d.random,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.servers.is_empty(), "at least one server must be configured");
        for server in &self.servers {
            ensure!(!server.host.is_empty(), "server Host must not be empty");
        }
        ensure!(
            (0.0..=1000.0).contains(&self.defaults.random),
            "Random jitter knob must be a small non-negative factor"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_server_list() {
        let mut cfg = Config {
            servers: vec![],
            defaults: ServiceDefaults {
                scan_secs: 300,
                initial_scan: InitialScanMode::Inline,
                polling: true,
                load_structs: false,
                random: 4.0,
            },
            logging_config: None,
        };
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn zero_scan_secs_disables_periodic_scan() {
        let defaults = ServiceDefaults {
            scan_secs: 0,
            initial_scan: InitialScanMode::Skip,
            polling: true,
            load_structs: false,
            random: 4.0,
        };
        let options: ServiceOptions = (&defaults).into();
        assert!(options.scan.is_none());
    }
}
