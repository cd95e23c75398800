// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The public entry point: wires a set of ownerver `Server` connections to
//! a shared `Topology` and drives the scanner that keeps it up to date.
//! Owns the servers, owns the device table, starts a scan task per server,
//! and exposes `add_server`/`get_device` to callers.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::OwfsError,
    events::{self, Event, EventSink, EventStream},
    topology::{Device, InitialScan, Scanner, ServerNode, Topology, device::DeviceId},
};

/// Knobs mirroring `start_scan`'s `scan`/`initial_scan`/`polling`/`random`
/// parameters, plus `load_structs` to force an eager schema load per family
/// as devices are discovered.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Period between periodic topology scans. `None` disables periodic
    /// scanning; only the initial scan (if not skipped) ever runs.
    pub scan: Option<Duration>,
    pub initial_scan: InitialScan,
    /// Whether per-device polling (`interval_*` attributes) is honored.
    /// When `false`, `Bus::update_poll` is never reached because no scan
    /// runs at all is too broad a hammer, so this only gates whether the
    /// initial scan happens; per-device polling always follows whatever
    /// `interval_*` a device reports once it has been scanned at least
    /// once.
    pub polling: bool,
    pub load_structs: bool,
    /// Scan-interval jitter knob; `0.0` disables jitter entirely.
    pub random: f64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            scan: Some(Duration::from_secs(300)),
            initial_scan: InitialScan::Inline,
            polling: true,
            load_structs: false,
            random: 4.0,
        }
    }
}

/// Owns every registered server, the shared topology, and the background
/// scan tasks. Dropping a `Service` does not stop its tasks; call
/// `shutdown()` for a deterministic, awaited teardown.
pub struct Service {
    options: ServiceOptions,
    topology: Arc<Topology>,
    events: EventSink,
    nodes: tokio::sync::Mutex<Vec<(Arc<crate::server::Server>, Arc<ServerNode>)>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(options: ServiceOptions) -> (Arc<Self>, EventStream) {
        let (events, stream) = events::channel();
        let topology = Topology::new(events.clone());
        let service = Arc::new(Self {
            options,
            topology,
            events,
            nodes: tokio::sync::Mutex::new(Vec::new()),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        (service, stream)
    }

    /// Connects to `host:port`, registers it as a server node, and starts
    /// its scan task per this service's options.
    pub async fn add_server(
        self: &Arc<Self>,
        host: impl Into<String>,
        port: u16,
    ) -> Result<Arc<crate::server::Server>, OwfsError> {
        let host = host.into();
        self.events.push(Event::ServerRegistered { host: host.clone(), port }).await;

        let server = crate::server::Server::new(host, port, self.events.clone());
        server.start().await?;

        let node = ServerNode::new(server.clone());
        let scanner = Scanner::new(node.clone(), self.topology.clone());

        let scan = self.options.scan;
        let initial_scan = self.options.initial_scan;
        let random = self.options.random;
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move { scanner.run(scan, initial_scan, random, cancel).await });

        self.nodes.lock().await.push((server.clone(), node));
        self.tasks.lock().await.push(handle);
        Ok(server)
    }

    /// Spawns `fut` under this service's task group, so `shutdown()` waits
    /// for it alongside the scan tasks.
    pub async fn add_task<F>(self: &Arc<Self>, fut: F)
    where F: std::future::Future<Output = ()> + Send + 'static {
        let handle = tokio::spawn(fut);
        self.tasks.lock().await.push(handle);
    }

    pub fn get_device(&self, id: &str) -> Option<Arc<Device>> {
        self.topology.get_device(id)
    }

    /// Forces an out-of-band scan of every registered server, independent
    /// of the periodic schedule.
    pub async fn scan_now(&self) -> Result<(), OwfsError> {
        let nodes = self.nodes.lock().await;
        for (_, node) in nodes.iter() {
            Scanner::new(node.clone(), self.topology.clone()).scan_once().await?;
        }
        Ok(())
    }

    /// Forces the schema for `family` to be loaded, independent of device
    /// discovery. Returns once the descriptor tree under `/structure/<FF>/`
    /// has been fully walked.
    pub async fn ensure_struct(&self, family: u8) -> Result<(), OwfsError> {
        let nodes = self.nodes.lock().await;
        let Some((server, _)) = nodes.first() else {
            return Err(OwfsError::LocationMissing);
        };
        self.topology.classes.ensure(server, family).await?;
        Ok(())
    }

    /// Looks up or registers a device purely from its canonical
    /// `FF.XXXXXXXXXXXX.CC` id string, without requiring a prior scan to
    /// have located it. Used by callers that already know a device id (for
    /// example from a persisted inventory) and want a handle before the
    /// next scan confirms it is still present.
    pub async fn device_by_id(
        &self,
        server: &Arc<crate::server::Server>,
        id: &str,
    ) -> Result<Arc<Device>, OwfsError> {
        let parsed = DeviceId::parse(id)?;
        self.topology.get_or_create_device(&parsed, server).await
    }

    /// Cancels every scan task and task added via `add_task`, deregisters
    /// every server, and awaits clean shutdown.
    pub async fn shutdown(self: &Arc<Self>) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }

        let nodes = std::mem::take(&mut *self.nodes.lock().await);
        for (server, _) in nodes {
            server.deregister().await;
        }
    }
}
