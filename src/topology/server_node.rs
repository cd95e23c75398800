// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-server topology state: the bus table and the scan lock that
//! guarantees at-most-one concurrent scan per server.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    server::Server,
    topology::{Topology, bus::Bus},
};

pub struct ServerNode {
    pub server: Arc<Server>,
    pub buses: DashMap<Vec<String>, Arc<Bus>>,
    pub(crate) scan_lock: Mutex<()>,
}

impl ServerNode {
    pub fn new(server: Arc<Server>) -> Arc<Self> {
        Arc::new(Self { server, buses: DashMap::new(), scan_lock: Mutex::new(()) })
    }

    pub fn get_or_create_bus(self: &Arc<Self>, path: Vec<String>, topology: &Arc<Topology>) -> Arc<Bus> {
        if let Some(bus) = self.buses.get(&path) {
            return bus.clone();
        }
        let bus = Bus::new(path.clone(), self.server.clone(), topology.clone());
        self.buses.insert(path, bus.clone());
        bus
    }
}
