// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A located 1-Wire device: identity, current `Bus`, cached polling state,
//! and family-specific alarm behavior.
//!
//! Family-specific behavior (`poll_for_alarm`/alarm reset) is a small table
//! of trait objects keyed by family byte rather than per-family subclassing:
//! the `Device` struct stays uniform across every family and only the
//! behavior table varies.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::{
    error::{OwfsError, ReplyError},
    events::{Event, EventSink},
    schema::{DeviceClassEntry, ScalarValue},
    topology::bus::Bus,
};

/// A parsed `FF.XXXXXXXXXXXX.CC` identifier: family, 6-byte serial, CRC8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId {
    pub family: u8,
    pub serial: [u8; 6],
    pub crc: u8,
}

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, OwfsError> {
        let bad = || OwfsError::NotADevice(raw.to_string());
        let mut parts = raw.splitn(3, '.');
        let (Some(fam), Some(serial), Some(crc)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(bad());
        };
        if fam.len() != 2 || serial.len() != 12 || crc.len() != 2 {
            return Err(bad());
        }
        let family = u8::from_str_radix(fam, 16).map_err(|_| bad())?;
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&serial[i * 2..i * 2 + 2], 16).map_err(|_| bad())?;
        }
        let crc = u8::from_str_radix(crc, 16).map_err(|_| bad())?;
        Ok(Self { family, serial: bytes, crc })
    }

    pub fn id_string(&self) -> String {
        let mut s = format!("{:02X}.", self.family);
        for b in self.serial {
            s.push_str(&format!("{b:02X}"));
        }
        s.push_str(&format!(".{:02X}", self.crc));
        s
    }
}

/// Consecutive missed scans before a device is considered gone. The scanner
/// evicts at this count (spec scenario: unseen counters 1, 2, 3, then
/// deleted).
pub const UNSEEN_EVICTION_THRESHOLD: u32 = 3;

pub struct Device {
    pub id: String,
    pub family: u8,
    bus: Mutex<Option<Weak<Bus>>>,
    unseen: AtomicU32,
    /// Per polling-item cached interval override (`None` means "use the
    /// class default"); populated lazily as `Bus::update_poll` discovers
    /// items this device participates in.
    intervals: DashMap<String, Option<Duration>>,
    class: Arc<DeviceClassEntry>,
    events: EventSink,
    alarm_temperature: Mutex<Option<f64>>,
}

impl Device {
    pub fn new(id: String, family: u8, class: Arc<DeviceClassEntry>, events: EventSink) -> Arc<Self> {
        Arc::new(Self {
            id,
            family,
            bus: Mutex::new(None),
            unseen: AtomicU32::new(0),
            intervals: DashMap::new(),
            class,
            events,
            alarm_temperature: Mutex::new(None),
        })
    }

    pub async fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.lock().await.as_ref().and_then(Weak::upgrade)
    }

    pub async fn locate(self: &Arc<Self>, bus: &Arc<Bus>) {
        let was_located = self.bus().await.is_some();
        *self.bus.lock().await = Some(Arc::downgrade(bus));
        self.unseen.store(0, Ordering::SeqCst);
        if !was_located {
            self.events
                .push(Event::DeviceLocated { id: self.id.clone(), bus: bus.path.clone() })
                .await;
        }
    }

    pub async fn delocate(&self) {
        *self.bus.lock().await = None;
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

    pub fn unseen_count(&self) -> u32 {
        self.unseen.load(Ordering::SeqCst)
    }

    pub fn polling_interval(&self, item: &str) -> Option<Duration> {
        self.intervals.get(item).and_then(|v| *v)
    }

    pub fn set_polling_interval(&self, item: impl Into<String>, interval: Option<Duration>) {
        self.intervals.insert(item.into(), interval);
    }

    pub fn polling_items(&self) -> Vec<String> {
        self.intervals.iter().map(|e| e.key().clone()).collect()
    }

    /// Standard poll names every class may opt into by exposing a readable
    /// `interval_<name>` attribute.
    const STANDARD_POLL_NAMES: &'static [&'static str] = &["temperature", "alarm"];

    /// Re-read `interval_<name>` for each standard poll name this device's
    /// class exposes, updating the cached per-item interval. Devices whose
    /// class has no such attribute simply never declare that item.
    pub async fn refresh_polling_intervals(&self) {
        for name in Self::STANDARD_POLL_NAMES {
            let attr = format!("interval_{name}");
            let Ok(value) = self.read_scalar(&attr).await else { continue };
            let interval = value.as_f64().filter(|secs| *secs > 0.0).map(Duration::from_secs_f64);
            self.set_polling_interval(*name, interval);
        }
    }

    /// Read without emitting a `DeviceValue` event — used internally by
    /// polling bookkeeping (interval refresh) where the read isn't a
    /// user-observable value sample.
    async fn read_scalar(&self, name: &str) -> Result<ScalarValue, OwfsError> {
        let field = self.class.field(name).await.ok_or(OwfsError::Protocol(ReplyError::UnknownProperty))?;
        if !field.mode.readable() {
            return Err(OwfsError::Protocol(ReplyError::NotRProperty));
        }
        let bus = self.bus().await.ok_or(OwfsError::LocationMissing)?;
        let mut path = vec![self.id.clone()];
        path.extend(field.path.iter().cloned());
        let raw = bus.server().attr_get(path).await?;
        ScalarValue::decode(field.type_tag, &raw)
    }

    pub async fn attr_get(&self, name: &str) -> Result<ScalarValue, OwfsError> {
        let value = self.read_scalar(name).await?;
        self.events.push(Event::device_value(self, name, value.encode())).await;
        Ok(value)
    }

    pub async fn attr_set(&self, name: &str, value: &ScalarValue) -> Result<(), OwfsError> {
        let field = self.class.field(name).await.ok_or(OwfsError::Protocol(ReplyError::UnknownProperty))?;
        if !field.mode.writable() {
            return Err(OwfsError::Protocol(ReplyError::NotWProperty));
        }
        let bus = self.bus().await.ok_or(OwfsError::LocationMissing)?;
        let mut path = vec![self.id.clone()];
        path.extend(field.path.iter().cloned());
        bus.server().attr_set(path, &value.encode()).await
    }

    /// Write a single channel of an array field (e.g. `set_alarm/set_high`,
    /// channel `0` → `set_alarm/set_high.0`). `name` must resolve to a field
    /// with an `ArrayKind`; any other field is `UnknownProperty`.
    pub async fn attr_set_indexed(&self, name: &str, channel: u32, value: &ScalarValue) -> Result<(), OwfsError> {
        let field = self.class.field(name).await.ok_or(OwfsError::Protocol(ReplyError::UnknownProperty))?;
        if !field.mode.writable() {
            return Err(OwfsError::Protocol(ReplyError::NotWProperty));
        }
        let kind = field.array.ok_or(OwfsError::Protocol(ReplyError::UnknownProperty))?;
        let bus = self.bus().await.ok_or(OwfsError::LocationMissing)?;
        let mut path = vec![self.id.clone()];
        path.extend(field.path.iter().cloned());
        if let Some(last) = path.last_mut() {
            *last = format!("{last}.{}", kind.index_segment(channel));
        }
        bus.server().attr_set(path, &value.encode()).await
    }

    pub async fn alarm_temperature(&self) -> Option<f64> {
        *self.alarm_temperature.lock().await
    }

    async fn set_alarm_temperature(&self, temp: f64) {
        *self.alarm_temperature.lock().await = Some(temp);
    }
}

/// Family-specific alarm-reset and extra-polling-name behavior. Looked up
/// by family byte from a small static table; families without an entry get
/// no alarm handling and no extra poll names.
#[async_trait]
pub trait FamilyBehavior: Send + Sync {
    /// After an alarm fires, adjust the device's alarm thresholds so the
    /// condition clears (and re-triggers on the next crossing) instead of
    /// alarming on every poll.
    async fn reset_alarm(&self, device: &Device) -> Result<(), OwfsError>;

    /// Extra bus names this family's presence should imply polling for
    /// (e.g. a DS2409 coupler's `main`/`aux` sub-buses).
    fn extra_buses(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Family 0x10 (DS18S20) / 0x28 (DS18B20): temperature alarm, cleared by
/// widening whichever bound the current reading has crossed.
pub struct TemperatureAlarm;

#[async_trait]
impl FamilyBehavior for TemperatureAlarm {
    async fn reset_alarm(&self, device: &Device) -> Result<(), OwfsError> {
        let latest = device.attr_get("latesttemp").await?;
        let Some(temp) = latest.as_f64() else {
            return Err(OwfsError::Protocol(ReplyError::DataFormat));
        };
        device.set_alarm_temperature(temp).await;

        let temphigh = device.attr_get("temphigh").await?.as_f64().unwrap_or(f64::MAX);
        if temphigh < temp {
            device.attr_set("temphigh", &ScalarValue::Float(temp.floor() + 2.0)).await?;
        }

        let templow = device.attr_get("templow").await?.as_f64().unwrap_or(f64::MIN);
        if templow > temp {
            device.attr_set("templow", &ScalarValue::Float(temp.floor() - 1.0)).await?;
        }
        Ok(())
    }
}

/// Family 0x20 (DS2450): voltage alarm, reset by clearing the per-channel
/// high/low alarm enable bits on whichever channels currently assert.
pub struct VoltageAlarm;

#[async_trait]
impl FamilyBehavior for VoltageAlarm {
    async fn reset_alarm(&self, device: &Device) -> Result<(), OwfsError> {
        let high_all = device.attr_get("alarm/high_all").await?;
        for (channel, asserted) in channel_flags(&high_all).into_iter().enumerate() {
            if asserted {
                device.attr_set_indexed("set_alarm/set_high", channel as u32, &ScalarValue::Int(0)).await?;
            }
        }

        let low_all = device.attr_get("alarm/low_all").await?;
        for (channel, asserted) in channel_flags(&low_all).into_iter().enumerate() {
            if asserted {
                device.attr_set_indexed("set_alarm/set_low", channel as u32, &ScalarValue::Int(0)).await?;
            }
        }

        if let Ok(unset) = device.attr_get("set_alarm/unset").await {
            if unset.as_f64().is_some_and(|v| v != 0.0) {
                device.attr_set("set_alarm/unset", &ScalarValue::Int(0)).await?;
            }
        }
        Ok(())
    }
}

/// Decode a DS2450-style per-channel flag field, whichever wire
/// representation the descriptor gave it (comma list, raw bitfield bytes,
/// or a packed integer).
fn channel_flags(value: &ScalarValue) -> Vec<bool> {
    match value {
        ScalarValue::Text(s) => s.split(',').map(|c| c.trim() == "1").collect(),
        ScalarValue::Bytes(b) => b.iter().map(|c| *c != 0).collect(),
        ScalarValue::Int(v) => (0..4).map(|i| (v >> i) & 1 != 0).collect(),
        ScalarValue::Bool(b) => vec![*b],
        ScalarValue::Float(_) => Vec::new(),
    }
}

/// Family 0x1F (DS2409 coupler): no alarm of its own, but its presence
/// means the `main`/`aux` sub-buses need scanning too.
pub struct CouplerBehavior;

#[async_trait]
impl FamilyBehavior for CouplerBehavior {
    async fn reset_alarm(&self, _device: &Device) -> Result<(), OwfsError> {
        Ok(())
    }

    fn extra_buses(&self) -> &'static [&'static str] {
        &["main", "aux"]
    }
}

pub fn behavior_for_family(family: u8) -> Option<Arc<dyn FamilyBehavior>> {
    match family {
        0x10 | 0x28 => Some(Arc::new(TemperatureAlarm)),
        0x20 => Some(Arc::new(VoltageAlarm)),
        0x1F => Some(Arc::new(CouplerBehavior)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::Mutex as AsyncMutex,
    };

    use super::*;
    use crate::{
        codec::frame::{Command, HEADER_LEN, Header},
        events,
        topology::Topology,
    };

    #[test]
    fn parses_canonical_id() {
        let id = DeviceId::parse("10.67726B000800.C9").expect("valid id");
        assert_eq!(id.family, 0x10);
        assert_eq!(id.serial, [0x67, 0x72, 0x6B, 0x00, 0x08, 0x00]);
        assert_eq!(id.crc, 0xC9);
        assert_eq!(id.id_string(), "10.67726B000800.C9");
    }

    #[test]
    fn rejects_malformed_id() {
        assert!(DeviceId::parse("not-a-device").is_err());
        assert!(DeviceId::parse("10.tooshort.C9").is_err());
    }

    async fn read_request(stream: &mut TcpStream) -> Option<(Header, Vec<u8>)> {
        let mut hdr_buf = [0u8; HEADER_LEN];
        if stream.read_exact(&mut hdr_buf).await.is_err() {
            return None;
        }
        let header = Header::from_bytes(&hdr_buf);
        let len = header.payload_len.get().max(0) as usize;
        let mut payload = vec![0u8; len];
        if len > 0 && stream.read_exact(&mut payload).await.is_err() {
            return None;
        }
        Some((header, payload))
    }

    async fn write_reply(stream: &mut TcpStream, data_len: i32, payload: &[u8]) {
        let header = Header {
            version: 0.into(),
            payload_len: (payload.len() as i32).into(),
            ret_value: 0.into(),
            format_flags: 0.into(),
            data_len: data_len.into(),
            offset: 0.into(),
        };
        let _ = stream.write_all(&header.to_bytes()).await;
        if !payload.is_empty() {
            let _ = stream.write_all(payload).await;
        }
    }

    fn decode_path(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).trim_end_matches('\0').to_string()
    }

    /// Answers reads/dirall from a fixed path->bytes table and records every
    /// write for later inspection.
    async fn serve(
        mut stream: TcpStream,
        table: Arc<HashMap<String, Vec<u8>>>,
        writes: Arc<AsyncMutex<Vec<(String, Vec<u8>)>>>,
    ) {
        while let Some((header, payload)) = read_request(&mut stream).await {
            match Command::from_i32(header.ret_value.get()) {
                Some(Command::Write) => {
                    let data_len = header.data_len.get().max(0) as usize;
                    let split = payload.len().saturating_sub(data_len);
                    let path = decode_path(&payload[..split]);
                    let value = payload[split..].to_vec();
                    writes.lock().await.push((path, value));
                    write_reply(&mut stream, 0, &[]).await;
                },
                Some(_) => {
                    let path = decode_path(&payload);
                    let value = table.get(&path).cloned().unwrap_or_default();
                    write_reply(&mut stream, value.len() as i32, &value).await;
                },
                None => write_reply(&mut stream, 0, &[]).await,
            }
        }
    }

    #[tokio::test]
    async fn temperature_alarm_reset_widens_only_the_crossed_bound() {
        let device_id = "10.AABBCCDDEEFF.01";

        let mut table = HashMap::new();
        table.insert(
            "/structure/10".to_string(),
            b"/structure/10/latesttemp,/structure/10/temphigh,/structure/10/templow".to_vec(),
        );
        table.insert("/structure/10/latesttemp".to_string(), b"f,12,,ro".to_vec());
        table.insert("/structure/10/temphigh".to_string(), b"f,12,,rw".to_vec());
        table.insert("/structure/10/templow".to_string(), b"f,12,,rw".to_vec());
        table.insert(format!("/{device_id}/latesttemp"), b"12.5".to_vec());
        table.insert(format!("/{device_id}/temphigh"), b"20.0".to_vec());
        table.insert(format!("/{device_id}/templow"), b"15.0".to_vec());
        let table = Arc::new(table);
        let writes = Arc::new(AsyncMutex::new(Vec::new()));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accept_table = table.clone();
        let accept_writes = writes.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(serve(stream, accept_table.clone(), accept_writes.clone()));
            }
        });

        let (events_sink, _events_stream) = events::channel();
        let server = crate::server::Server::new("127.0.0.1", addr.port(), events_sink.clone());
        server.start().await.expect("start");

        let topology = Topology::new(events_sink);
        let id = DeviceId::parse(device_id).expect("valid id");
        let device = topology.get_or_create_device(&id, &server).await.expect("device class loads");
        let bus = Bus::new(vec!["bus.0".to_string()], server.clone(), topology.clone());
        device.locate(&bus).await;

        let behavior = behavior_for_family(0x10).expect("temperature behavior registered");
        behavior.reset_alarm(&device).await.expect("reset_alarm succeeds");

        assert_eq!(device.alarm_temperature().await, Some(12.5));

        let recorded = writes.lock().await;
        assert_eq!(recorded.len(), 1, "only templow crosses the current reading");
        assert_eq!(recorded[0].0, format!("/{device_id}/templow"));
        assert_eq!(&recorded[0].1[..], b"11");

        server.deregister().await;
    }
}
