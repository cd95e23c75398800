// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end exercises of the connection engine against an in-process
//! fake ownerver: the NOP handshake, read/write round-trips, busy-then-
//! retry, and reconnect after a dropped socket.

use std::time::Duration;

use owfs_client::{
    codec::{
        flags::FormatFlags,
        frame::{Command, HEADER_LEN, Header},
    },
    error::OwfsError,
    events,
    server::Server,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

async fn read_request(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut hdr_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut hdr_buf).await.expect("read request header");
    let header = Header::from_bytes(&hdr_buf);
    let len = header.payload_len.get().max(0) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        stream.read_exact(&mut payload).await.expect("read request payload");
    }
    (header, payload)
}

async fn write_reply(stream: &mut TcpStream, ret_value: i32, data_len: i32, offset: i32, payload: &[u8]) {
    let header = Header {
        version: 0.into(),
        payload_len: (payload.len() as i32).into(),
        ret_value: ret_value.into(),
        format_flags: 0.into(),
        data_len: data_len.into(),
        offset: offset.into(),
    };
    stream.write_all(&header.to_bytes()).await.expect("write reply header");
    if !payload.is_empty() {
        stream.write_all(payload).await.expect("write reply payload");
    }
}

async fn write_busy(stream: &mut TcpStream) {
    let header = Header {
        version: 0.into(),
        payload_len: (-1i32).into(),
        ret_value: 0.into(),
        format_flags: 0.into(),
        data_len: 0.into(),
        offset: 0.into(),
    };
    stream.write_all(&header.to_bytes()).await.expect("write busy header");
}

async fn handshake(stream: &mut TcpStream) {
    let (header, _) = read_request(stream).await;
    assert_eq!(header.ret_value.get(), Command::Nop as i32);
    write_reply(stream, 0, 0, 0, &[]).await;
}

#[tokio::test]
async fn read_and_write_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream).await;

        let (header, payload) = read_request(&mut stream).await;
        assert_eq!(header.ret_value.get(), Command::Read as i32);
        assert_eq!(String::from_utf8_lossy(&payload), "/10.67726B000800.C9/temperature\0");
        write_reply(&mut stream, 0, 5, 0, b"25.50").await;

        let (header, payload) = read_request(&mut stream).await;
        assert_eq!(header.ret_value.get(), Command::Write as i32);
        assert!(String::from_utf8_lossy(&payload).contains("75.00"));
        write_reply(&mut stream, 0, 0, 0, &[]).await;
    });

    let (events, _stream) = events::channel();
    let client = Server::new("127.0.0.1", addr.port(), events);
    client.start().await.expect("start");

    let value = client.read(["10.67726B000800.C9", "temperature"]).await.expect("read");
    assert_eq!(&value[..], b"25.50");

    client.write(["10.67726B000800.C9", "temperature"], b"75.00").await.expect("write");

    client.deregister().await;
    server_task.await.expect("server task");
}

#[tokio::test]
async fn busy_reply_is_retried_transparently() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let server_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        handshake(&mut stream).await;

        let (header, _) = read_request(&mut stream).await;
        assert_eq!(header.ret_value.get(), Command::Read as i32);
        write_busy(&mut stream).await;

        let (header, _) = read_request(&mut stream).await;
        assert_eq!(header.ret_value.get(), Command::Read as i32);
        write_reply(&mut stream, 0, 2, 0, b"OK").await;
    });

    let (events, _stream) = events::channel();
    let client = Server::new("127.0.0.1", addr.port(), events);
    client.start().await.expect("start");

    let value = tokio::time::timeout(Duration::from_secs(5), client.read(["10.67726B000800.C9", "PIO"]))
        .await
        .expect("read did not time out")
        .expect("read succeeded after retry");
    assert_eq!(&value[..], b"OK");

    client.deregister().await;
    server_task.await.expect("server task");
}

#[tokio::test]
async fn reconnect_after_socket_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let server_task = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.expect("accept first");
        handshake(&mut first).await;
        // Drop the socket without answering anything else: the client's
        // reader/writer tasks observe EOF/reset and reconnect.
        drop(first);

        let (mut second, _) = listener.accept().await.expect("accept second");
        let (header, _) = read_request(&mut second).await;
        assert_eq!(header.ret_value.get(), Command::Read as i32);
        write_reply(&mut second, 0, 1, 0, b"1").await;
    });

    let (events, _stream) = events::channel();
    let client = Server::new("127.0.0.1", addr.port(), events);
    client.start().await.expect("start");

    // Give the reader/writer tasks a moment to notice the drop and
    // reconnect before issuing the next request.
    let value = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.read(["10.67726B000800.C9", "present"]).await {
                Ok(v) => return v,
                Err(OwfsError::Retry) | Err(OwfsError::Transport(_)) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                },
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    })
    .await
    .expect("read did not time out after reconnect");
    assert_eq!(&value[..], b"1");

    client.deregister().await;
    server_task.await.expect("server task");
}

#[test]
fn request_flags_are_always_set() {
    let header = Header::request(Command::Nop, FormatFlags::for_request(), 0, 0, 0);
    assert_eq!(header.ret_value.get(), Command::Nop as i32);
}
