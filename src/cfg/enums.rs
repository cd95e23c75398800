// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Enumerations used in configuration.

use core::fmt;

use serde::{Deserialize, Serialize};

/// How a server's initial scan is scheduled relative to `add_server`
/// returning, as configured per-server or as a service-wide default.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitialScanMode {
    /// Scan before `add_server` returns.
    Inline,
    /// Never scan unless `scan_now` is called explicitly.
    Skip,
    /// Scan `after_secs` after `add_server` returns, in the background.
    Delayed { after_secs: u64 },
}

impl fmt::Display for InitialScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitialScanMode::Inline => f.write_str("inline"),
            InitialScanMode::Skip => f.write_str("skip"),
            InitialScanMode::Delayed { after_secs } => write!(f, "delayed({after_secs}s)"),
        }
    }
}
