// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A 1-Wire bus (top-level `bus.N` or a coupler's `main`/`aux` sub-bus):
//! device membership, scanning, and per-poll-name task scheduling.
//!
//! The scan walk attaches present devices, recurses into coupler sub-buses,
//! then evicts whatever went missing; simultaneous conversion follows a
//! write-then-settle-then-read pattern.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{OwfsError, ReplyError},
    events::Event,
    server::Server,
    topology::{
        Topology,
        device::{Device, DeviceId, UNSEEN_EVICTION_THRESHOLD, behavior_for_family},
        server_node::ServerNode,
    },
    utils::jitter,
};

const POLL_JITTER_SPREAD: f64 = 0.025;
const TEMPERATURE_SETTLE: Duration = Duration::from_millis(1200);

struct PollTask {
    cancel: CancellationToken,
}

pub struct Bus {
    pub path: Vec<String>,
    server: Arc<Server>,
    topology: Arc<Topology>,
    devices: DashMap<String, std::sync::Weak<Device>>,
    poll_tasks: Mutex<HashMap<String, PollTask>>,
    unseen: std::sync::atomic::AtomicU32,
}

impl Bus {
    pub fn new(path: Vec<String>, server: Arc<Server>, topology: Arc<Topology>) -> Arc<Self> {
        Arc::new(Self {
            path,
            server,
            topology,
            devices: DashMap::new(),
            poll_tasks: Mutex::new(HashMap::new()),
            unseen: std::sync::atomic::AtomicU32::new(0),
        })
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn reset_unseen(&self) {
        self.unseen.store(0, Ordering::SeqCst);
    }

    /// Record one more missed scan. Returns `true` if the counter was
    /// already at `UNSEEN_EVICTION_THRESHOLD` going in, meaning this miss is
    /// the one that evicts; the counter is left unchanged in that case.
    /// Otherwise bumps the counter and returns `false`.
    pub fn mark_unseen(&self) -> bool {
        if self.unseen.load(Ordering::SeqCst) >= UNSEEN_EVICTION_THRESHOLD {
            true
        } else {
            self.unseen.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    /// Step 1-3 of the scan algorithm for this bus: attach present
    /// devices, recurse into coupler sub-buses, evict what's no longer
    /// listed. Returns the full paths of every device and sub-bus seen, so
    /// a caller one level up can fold this into its own eviction pass.
    pub fn scan_one<'a>(
        self: &'a Arc<Self>,
        node: &'a Arc<ServerNode>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OwfsError>> + Send + 'a>> {
        Box::pin(async move {
            let entries = self.server.dir(self.path.clone()).await?;
            let mut seen_devices = HashSet::new();

            for name in &entries {
                let Ok(id) = DeviceId::parse(name) else { continue };
                let device = self.topology.get_or_create_device(&id, &self.server).await?;
                device.locate(self).await;
                device.refresh_polling_intervals().await;
                self.devices.insert(device.id.clone(), Arc::downgrade(&device));
                seen_devices.insert(device.id.clone());

                if let Some(behavior) = behavior_for_family(id.family) {
                    for extra in behavior.extra_buses() {
                        let mut sub_path = self.path.clone();
                        sub_path.push(name.clone());
                        sub_path.push((*extra).to_string());
                        let sub_bus = node.get_or_create_bus(sub_path, &self.topology);
                        sub_bus.reset_unseen();
                        sub_bus.scan_one(node).await?;
                    }
                }
            }

            self.evict_missing(node, &seen_devices).await;
            self.update_poll().await;
            Ok(())
        })
    }

    async fn evict_missing(&self, node: &Arc<ServerNode>, seen: &HashSet<String>) {
        let stale: Vec<String> =
            self.devices.iter().filter(|e| !seen.contains(e.key())).map(|e| e.key().clone()).collect();

        for id in stale {
            let Some(device) = self.topology.devices.get(&id).map(|d| d.clone()) else {
                self.devices.remove(&id);
                continue;
            };
            if device.mark_unseen() {
                device.delocate().await;
                self.devices.remove(&id);
                self.evict_coupler_children(node, &id).await;
                self.topology.events.push(Event::DeviceNotFound { id }).await;
            }
        }
    }

    async fn evict_coupler_children(&self, node: &Arc<ServerNode>, device_id: &str) {
        let mut prefix = self.path.clone();
        prefix.push(device_id.to_string());
        let dead: Vec<Vec<String>> =
            node.buses.iter().filter(|e| e.key().starts_with(&prefix)).map(|e| e.key().clone()).collect();
        for path in dead {
            node.buses.remove(&path);
            self.topology.events.push(Event::BusDeleted { path }).await;
        }
    }

    async fn update_poll(self: &Arc<Self>) {
        let mut wanted: HashMap<String, Duration> = HashMap::new();
        for entry in self.devices.iter() {
            let Some(device) = entry.value().upgrade() else { continue };
            for item in device.polling_items() {
                if let Some(interval) = device.polling_interval(&item) {
                    wanted
                        .entry(item)
                        .and_modify(|cur: &mut Duration| {
                            if interval < *cur {
                                *cur = interval;
                            }
                        })
                        .or_insert(interval);
                }
            }
        }

        let mut tasks = self.poll_tasks.lock().await;
        let stale: Vec<String> = tasks.keys().filter(|k| !wanted.contains_key(*k)).cloned().collect();
        for name in stale {
            if let Some(task) = tasks.remove(&name) {
                task.cancel.cancel();
            }
        }

        for (name, interval) in wanted {
            if tasks.contains_key(&name) {
                continue;
            }
            let cancel = CancellationToken::new();
            let bus = self.clone();
            let task_cancel = cancel.clone();
            let poll_name = name.clone();
            tokio::spawn(async move { bus.poll_loop(poll_name, interval, task_cancel).await });
            tasks.insert(name, PollTask { cancel });
        }
    }

    async fn poll_loop(self: Arc<Self>, name: String, interval: Duration, cancel: CancellationToken) {
        loop {
            let sleep_for = jitter(interval, POLL_JITTER_SPREAD);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep_for) => {},
            }
            if let Err(e) = self.poll(&name).await {
                tracing::warn!(bus = ?self.path, poll = %name, error = %e, "poll failed");
            }
        }
    }

    async fn poll(self: &Arc<Self>, name: &str) -> Result<(), OwfsError> {
        match name {
            "temperature" => self.poll_simultaneous("temperature", TEMPERATURE_SETTLE).await,
            "alarm" => self.poll_alarm().await,
            other => self.poll_generic(other).await,
        }
    }

    /// Write `1` to `simultaneous/<name>`, sleep `settle`, then read the
    /// per-device value for every device that declares interest in `name`.
    pub async fn poll_simultaneous(&self, name: &str, settle: Duration) -> Result<(), OwfsError> {
        let mut sim_path = self.path.clone();
        sim_path.push("simultaneous".to_string());
        sim_path.push(name.to_string());
        self.server.write(sim_path, b"1").await?;
        tokio::time::sleep(settle).await;
        self.poll_generic(name).await
    }

    async fn poll_generic(&self, name: &str) -> Result<(), OwfsError> {
        let attr = match name {
            "temperature" => "latesttemp",
            other => other,
        };
        for entry in self.devices.iter() {
            let Some(device) = entry.value().upgrade() else { continue };
            if device.polling_interval(name).is_some() {
                if let Err(e) = device.attr_get(attr).await {
                    tracing::debug!(device = %device.id, attr, error = %e, "poll read failed");
                }
            }
        }
        Ok(())
    }

    async fn poll_alarm(self: &Arc<Self>) -> Result<(), OwfsError> {
        let mut alarm_path = self.path.clone();
        alarm_path.push("alarm".to_string());
        let entries = match self.server.dir(alarm_path).await {
            Ok(e) => e,
            Err(OwfsError::Protocol(ReplyError::NoDirectory)) => return Ok(()),
            Err(e) => return Err(e),
        };

        for name in entries {
            let Ok(id) = DeviceId::parse(&name) else { continue };
            let device = self.topology.get_or_create_device(&id, &self.server).await?;
            device.locate(self).await;
            device.refresh_polling_intervals().await;
            self.devices.insert(device.id.clone(), Arc::downgrade(&device));

            let mut reasons = HashMap::new();
            if let Some(behavior) = behavior_for_family(id.family) {
                match behavior.reset_alarm(&device).await {
                    Ok(()) => {
                        if let Some(temp) = device.alarm_temperature().await {
                            reasons.insert("alarm_temperature".to_string(), temp.to_string());
                        }
                    },
                    Err(e) => {
                        reasons.insert("error".to_string(), e.to_string());
                    },
                }
            }
            self.topology.events.push(Event::DeviceAlarm { id: device.id.clone(), reasons }).await;
        }
        Ok(())
    }
}
