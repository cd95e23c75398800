// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end exercises of the topology scanner against an in-process fake
//! ownerver: dropped-device eviction, coupler sub-bus expansion, and
//! family-specific alarm reset.

use std::{collections::HashMap, sync::Arc};

use owfs_client::{
    codec::frame::{Command, HEADER_LEN, Header},
    events,
    server::Server,
    topology::{Scanner, ServerNode, Topology, device::behavior_for_family},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Mutex as AsyncMutex,
};

/// A dirall or read reply table keyed by request path. Dirall entries are a
/// queue: the first reply is popped on first request, the last is repeated
/// forever after (a present device that then goes missing on every
/// subsequent scan).
#[derive(Default)]
struct Script {
    replies: HashMap<String, Vec<Vec<u8>>>,
    writes: Vec<(String, Vec<u8>)>,
}

struct FakeServer {
    script: AsyncMutex<Script>,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self { script: AsyncMutex::new(Script::default()) })
    }

    async fn set(&self, path: &str, replies: Vec<&[u8]>) {
        self.script.lock().await.replies.insert(path.to_string(), replies.into_iter().map(Vec::from).collect());
    }

    async fn writes(&self) -> Vec<(String, Vec<u8>)> {
        self.script.lock().await.writes.clone()
    }

    async fn reply_for(&self, path: &str) -> Vec<u8> {
        let mut script = self.script.lock().await;
        let Some(queue) = script.replies.get_mut(path) else { return Vec::new() };
        if queue.len() > 1 { queue.remove(0) } else { queue.first().cloned().unwrap_or_default() }
    }

    async fn record_write(&self, path: String, value: Vec<u8>) {
        self.script.lock().await.writes.push((path, value));
    }
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

async fn serve(mut stream: TcpStream, script: Arc<FakeServer>) {
    while let Some((header, payload)) = read_request(&mut stream).await {
        match Command::from_i32(header.ret_value.get()) {
            Some(Command::Write) => {
                let data_len = header.data_len.get().max(0) as usize;
                let split = payload.len().saturating_sub(data_len);
                let path = decode_path(&payload[..split]);
                let value = payload[split..].to_vec();
                script.record_write(path, value).await;
                write_reply(&mut stream, 0, &[]).await;
            },
            Some(_) => {
                let path = decode_path(&payload);
                let value = script.reply_for(&path).await;
                write_reply(&mut stream, value.len() as i32, &value).await;
            },
            None => write_reply(&mut stream, 0, &[]).await,
        }
    }
}

async fn start(script: Arc<FakeServer>) -> Arc<Server> {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            tokio::spawn(serve(stream, script.clone()));
        }
    });

    let (events, _stream) = events::channel();
    let server = Server::new("127.0.0.1", addr.port(), events);
    server.start().await.expect("start");
    server
}

#[tokio::test]
async fn dropped_device_is_evicted_on_the_fourth_consecutive_miss() {
    let script = FakeServer::new();
    script.set("", vec![b"/bus.0"]).await;
    script.set("/bus.0", vec![b"/bus.0/01.111111111111.AA", b""]).await;
    script.set("/structure/01", vec![b""]).await;
    let server = start(script).await;

    let (events, _stream) = events::channel();
    let topology = Topology::new(events);
    let node = ServerNode::new(server.clone());
    let scanner = Scanner::new(node, topology.clone());

    scanner.scan_once().await.expect("scan 1: device present");
    let device = topology.get_device("01.111111111111.AA").expect("device discovered");
    assert!(device.bus().await.is_some());

    for expected in [1, 2, 3] {
        scanner.scan_once().await.expect("scan: device missing");
        assert_eq!(device.unseen_count(), expected);
        assert!(device.bus().await.is_some(), "must not be evicted before the fourth consecutive miss");
    }

    scanner.scan_once().await.expect("scan: fourth consecutive miss evicts");
    assert_eq!(device.unseen_count(), 3, "the evicting call leaves the counter unchanged");
    assert!(device.bus().await.is_none(), "evicted device must be delocated");

    server.deregister().await;
}

#[tokio::test]
async fn coupler_presence_expands_into_main_and_aux_sub_buses() {
    let script = FakeServer::new();
    script.set("", vec![b"/bus.0"]).await;
    script.set("/bus.0", vec![b"/bus.0/1F.222222222222.BB"]).await;
    script.set("/structure/1F", vec![b""]).await;
    script.set("/bus.0/1F.222222222222.BB/main", vec![b"/bus.0/1F.222222222222.BB/main/10.333333333333.CC"]).await;
    script.set("/bus.0/1F.222222222222.BB/aux", vec![b""]).await;
    script.set("/structure/10", vec![b""]).await;
    let server = start(script).await;

    let (events, _stream) = events::channel();
    let topology = Topology::new(events);
    let node = ServerNode::new(server.clone());
    let scanner = Scanner::new(node.clone(), topology.clone());

    scanner.scan_once().await.expect("scan discovers the coupler and its sub-buses");

    let main_path = vec!["bus.0".to_string(), "1F.222222222222.BB".to_string(), "main".to_string()];
    let aux_path = vec!["bus.0".to_string(), "1F.222222222222.BB".to_string(), "aux".to_string()];
    assert!(node.buses.contains_key(&main_path), "coupler presence must add a main sub-bus");
    assert!(node.buses.contains_key(&aux_path), "coupler presence must add an aux sub-bus");

    let device = topology.get_device("10.333333333333.CC").expect("device behind the coupler discovered");
    let bus = device.bus().await.expect("device located on the main sub-bus");
    assert_eq!(bus.path, main_path);

    server.deregister().await;
}

#[tokio::test]
async fn temperature_alarm_reset_clears_via_bus_discovery() {
    let script = FakeServer::new();
    script.set("", vec![b"/bus.0"]).await;
    script.set("/bus.0", vec![b"/bus.0/10.444444444444.DD"]).await;
    script.set(
        "/structure/10",
        vec![b"/structure/10/latesttemp,/structure/10/temphigh,/structure/10/templow"],
    )
    .await;
    script.set("/structure/10/latesttemp", vec![b"f,12,,ro"]).await;
    script.set("/structure/10/temphigh", vec![b"f,12,,rw"]).await;
    script.set("/structure/10/templow", vec![b"f,12,,rw"]).await;
    script.set("/10.444444444444.DD/latesttemp", vec![b"12.5"]).await;
    script.set("/10.444444444444.DD/temphigh", vec![b"20.0"]).await;
    script.set("/10.444444444444.DD/templow", vec![b"15.0"]).await;
    let server = start(script.clone()).await;

    let (events, _stream) = events::channel();
    let topology = Topology::new(events);
    let node = ServerNode::new(server.clone());
    let scanner = Scanner::new(node, topology.clone());

    scanner.scan_once().await.expect("scan discovers the device");
    let device = topology.get_device("10.444444444444.DD").expect("device discovered");

    let behavior = behavior_for_family(device.family).expect("DS18S20 has temperature alarm behavior");
    behavior.reset_alarm(&device).await.expect("reset_alarm succeeds over the real wire");

    assert_eq!(device.alarm_temperature().await, Some(12.5));
    let writes = script.writes().await;
    assert_eq!(writes.len(), 1, "only templow crosses the current reading");
    assert_eq!(writes[0].0, "/10.444444444444.DD/templow");
    assert_eq!(&writes[0].1[..], b"11");

    server.deregister().await;
}
