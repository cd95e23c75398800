// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single in-process fan-out queue of topology/connection lifecycle events.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::mpsc;

use crate::topology::device::Device;

/// Capacity of the event channel. Producers block rather than drop once
/// full — callers are expected to drain promptly.
pub const EVENT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub enum Event {
    ServerRegistered { host: String, port: u16 },
    ServerConnected { host: String, port: u16 },
    ServerDisconnected { host: String, port: u16 },
    ServerDeregistered { host: String, port: u16 },
    BusAdded { path: Vec<String> },
    BusDeleted { path: Vec<String> },
    DeviceAdded { id: String },
    DeviceLocated { id: String, bus: Vec<String> },
    DeviceNotFound { id: String },
    DeviceDeleted { id: String },
    DeviceValue { id: String, name: String, value: Arc<[u8]> },
    DeviceAlarm { id: String, reasons: HashMap<String, String> },
}

impl Event {
    pub fn device_value(device: &Device, name: &str, value: impl Into<Arc<[u8]>>) -> Self {
        Self::DeviceValue {
            id: device.id.clone(),
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// Cheaply-cloned handle producers use to push events.
#[derive(Debug, Clone)]
pub struct EventSink(mpsc::Sender<Event>);

impl EventSink {
    pub async fn push(&self, event: Event) {
        // Capacity is large and consumers are expected to drain promptly;
        // a full channel means a stalled observer, so we block rather than
        // drop, per the no-drop event bus policy.
        if self.0.send(event).await.is_err() {
            tracing::debug!("event queue has no observer; dropping event");
        }
    }
}

/// Receiving half an observer uses to drain the stream.
pub struct EventStream(mpsc::Receiver<Event>);

impl EventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        self.0.recv().await
    }
}

pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
    (EventSink(tx), EventStream(rx))
}
