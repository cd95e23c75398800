// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Top-level topology scan: discovers `bus.N` roots on a server and
//! delegates the rest of the walk to `Bus::scan_one`.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    error::OwfsError,
    events::Event,
    topology::{Topology, bus::Bus, server_node::ServerNode},
    utils::scan_jitter_ratio,
};

/// Inline, skipped, or delayed initial scan — mirrors the `initial_scan`
/// knob on `start_scan`.
#[derive(Debug, Clone, Copy)]
pub enum InitialScan {
    Inline,
    Skip,
    DelayedBy(Duration),
}

pub struct Scanner {
    node: Arc<ServerNode>,
    topology: Arc<Topology>,
}

impl Scanner {
    pub fn new(node: Arc<ServerNode>, topology: Arc<Topology>) -> Self {
        Self { node, topology }
    }

    /// Run one top-level scan pass. Guarantees at-most-one concurrent scan
    /// for this server via the node's scan lock.
    pub async fn scan_once(&self) -> Result<(), OwfsError> {
        let _guard = self.node.scan_lock.lock().await;
        self.scan_locked().await
    }

    async fn scan_locked(&self) -> Result<(), OwfsError> {
        let entries = self.node.server.dir(Vec::<String>::new()).await?;
        let mut seen = std::collections::HashSet::new();

        for name in &entries {
            if !name.starts_with("bus.") {
                continue;
            }
            let path = vec![name.clone()];
            let is_new = !self.node.buses.contains_key(&path);
            let bus = self.node.get_or_create_bus(path.clone(), &self.topology);
            bus.reset_unseen();
            if is_new {
                self.topology.events.push(Event::BusAdded { path: path.clone() }).await;
            }
            seen.insert(path);
            bus.scan_one(&self.node).await?;
        }

        self.evict_missing_roots(&seen).await;
        Ok(())
    }

    async fn evict_missing_roots(&self, seen: &std::collections::HashSet<Vec<String>>) {
        let stale: Vec<(Vec<String>, Arc<Bus>)> = self
            .node
            .buses
            .iter()
            .filter(|e| e.key().len() == 1 && !seen.contains(e.key()))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (path, bus) in stale {
            if bus.mark_unseen() {
                self.node.buses.remove(&path);
                self.topology.events.push(Event::BusDeleted { path }).await;
            }
        }
    }

    /// Drive periodic scanning per the `start_scan(scan, initial_scan,
    /// polling, random)` schedule until `cancel` fires.
    pub async fn run(
        self,
        scan: Option<Duration>,
        initial_scan: InitialScan,
        random: f64,
        cancel: CancellationToken,
    ) {
        match initial_scan {
            InitialScan::Inline => {
                if let Err(e) = self.scan_once().await {
                    tracing::warn!(error = %e, "initial scan failed");
                }
            },
            InitialScan::Skip => {},
            InitialScan::DelayedBy(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {},
                }
                if let Err(e) = self.scan_once().await {
                    tracing::warn!(error = %e, "delayed initial scan failed");
                }
            },
        }

        let Some(period) = scan else { return };
        loop {
            let sleep_for = if random > 0.0 {
                period.mul_f64(scan_jitter_ratio(random))
            } else {
                period
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {},
            }
            if let Err(e) = self.scan_once().await {
                tracing::warn!(error = %e, "periodic scan failed");
            }
        }
    }
}
