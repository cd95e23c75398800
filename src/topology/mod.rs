// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Topology model: servers, buses, devices, and the scanner that discovers
//! and maintains them.

pub mod bus;
pub mod device;
pub mod scanner;
pub mod server_node;

use std::sync::Arc;

use dashmap::DashMap;

pub use bus::Bus;
pub use device::{Device, DeviceId};
pub use scanner::{InitialScan, Scanner};
pub use server_node::ServerNode;

use crate::{
    error::OwfsError,
    events::{Event, EventSink},
    schema::DeviceClassRegistry,
    server::Server,
};

/// Process-wide topology state shared by every server a `Service` manages:
/// the global device table (1-Wire ids are unique regardless of which bus
/// they were found on) and the per-family schema cache.
pub struct Topology {
    pub devices: DashMap<String, Arc<Device>>,
    pub classes: Arc<DeviceClassRegistry>,
    pub events: EventSink,
}

impl Topology {
    pub fn new(events: EventSink) -> Arc<Self> {
        Arc::new(Self { devices: DashMap::new(), classes: Arc::new(DeviceClassRegistry::new()), events })
    }

    pub async fn get_or_create_device(
        &self,
        id: &DeviceId,
        server: &Arc<Server>,
    ) -> Result<Arc<Device>, OwfsError> {
        let key = id.id_string();
        if let Some(device) = self.devices.get(&key) {
            return Ok(device.clone());
        }
        let class = self.classes.ensure(server, id.family).await?;
        let device = Device::new(key.clone(), id.family, class, self.events.clone());
        self.devices.insert(key.clone(), device.clone());
        self.events.push(Event::DeviceAdded { id: key }).await;
        Ok(device)
    }

    pub fn get_device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).map(|d| d.clone())
    }
}
