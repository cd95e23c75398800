// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single ownerver TCP connection: writer/reader tasks, FIFO request/reply
//! correlation, and the reconnect protocol.
//!
//! Split read/write halves each driven by their own task, an idle keepalive
//! ceiling on the writer, a read ceiling on the reader, and disconnect
//! handling that drains in-flight work before looping on reconnect. Replies
//! carry no request id, so correlation is purely FIFO — the reader always
//! answers the oldest still-unanswered request.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{
        flags::FormatFlags,
        frame::{HEADER_LEN, Header},
        path::last_segment,
    },
    error::{OwfsError, ReplyError},
    events::{Event, EventSink},
    message::{Message, MessageValue},
    server::io_timeout::io_with_timeout,
};

const WRITER_IDLE_KEEPALIVE: Duration = Duration::from_secs(10);
const READER_CEILING: Duration = Duration::from_secs(15);
const RECONNECT_INITIAL: Duration = Duration::from_millis(200);
const RECONNECT_FACTOR: f64 = 1.5;
const RECONNECT_CAP: Duration = Duration::from_secs(10);
const BUSY_INITIAL: Duration = Duration::from_millis(100);
const BUSY_FACTOR: f64 = 1.5;
const BUSY_CAP: Duration = Duration::from_secs(2);
const OUTBOX_CAPACITY: usize = 256;
/// Largest `payload_len` accepted from a reply. A value above this is a
/// fatal protocol violation rather than a large-but-legitimate reply; the
/// connection is torn down and reconnected rather than risking an unbounded
/// allocation/read.
const MAX_PAYLOAD_LEN: usize = 9999;

/// Which half of a connection generation a task drives — used by
/// `handle_disconnect` to know which sibling task to wait for before
/// reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Reader,
    Writer,
}

/// One managed ownerver connection. Survives transport failure by
/// reconnecting in place; callers never see a `Server` handle invalidated.
pub struct Server {
    pub host: String,
    pub port: u16,
    outbox: mpsc::Sender<Arc<Message>>,
    rx_slot: Mutex<Option<mpsc::Receiver<Arc<Message>>>>,
    in_flight: Mutex<VecDeque<Arc<Message>>>,
    connect_lock: Mutex<()>,
    connected: AtomicBool,
    epoch: AtomicU64,
    /// Cancelled (and replaced) on every reconnect, independently of
    /// `cancel`; lets `handle_disconnect` tell the sibling task of this
    /// connection generation to stop without tearing down the whole
    /// `Server`.
    io_cancel: Mutex<CancellationToken>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    events: EventSink,
}

impl Server {
    pub fn new(host: impl Into<String>, port: u16, events: EventSink) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let cancel = CancellationToken::new();
        let io_cancel = cancel.child_token();
        Arc::new(Self {
            host: host.into(),
            port,
            outbox: tx,
            rx_slot: Mutex::new(Some(rx)),
            in_flight: Mutex::new(VecDeque::new()),
            connect_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            io_cancel: Mutex::new(io_cancel),
            reader_handle: Mutex::new(None),
            writer_handle: Mutex::new(None),
            cancel,
            events,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect, spawn the reader/writer tasks, and fail fast if an initial
    /// `NOP` does not come back.
    pub async fn start(self: &Arc<Self>) -> Result<(), OwfsError> {
        let stream = self.connect().await.map_err(|e| OwfsError::transport(e.to_string()))?;
        self.spawn_io(stream).await;
        self.connected.store(true, Ordering::SeqCst);
        self.events
            .push(Event::ServerConnected { host: self.host.clone(), port: self.port })
            .await;

        let (nop, waiter) = Message::nop();
        self.submit(Arc::new(nop)).await?;
        waiter.await_reply().await?;
        Ok(())
    }

    /// Stop reconnecting and fail every request still in flight.
    pub async fn deregister(self: &Arc<Self>) {
        self.cancel.cancel();
        self.cancel_in_flight().await;
        self.events
            .push(Event::ServerDeregistered { host: self.host.clone(), port: self.port })
            .await;
    }

    pub async fn read<I, S>(&self, path: I) -> Result<Bytes, OwfsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (msg, _initial_waiter) = Message::read(path);
        let value = self.chat(Arc::new(msg)).await?;
        value.into_data().ok_or_else(|| OwfsError::transport("unexpected reply kind for read"))
    }

    pub async fn write<I, S>(&self, path: I, value: &[u8]) -> Result<(), OwfsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (msg, _initial_waiter) = Message::write(path, value);
        self.chat(Arc::new(msg)).await?;
        Ok(())
    }

    /// `dirall` a directory, returning last-segment entry names. Internal
    /// callers that need full paths (the scanner) use `dirall_paths`
    /// instead.
    pub async fn dir<I, S>(&self, path: I) -> Result<Vec<String>, OwfsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = self.dirall_paths(path).await?;
        Ok(paths.iter().map(|p| last_segment(p).to_string()).collect())
    }

    pub async fn dirall_paths<I, S>(&self, path: I) -> Result<Vec<String>, OwfsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (msg, _initial_waiter) = Message::dirall(path);
        let value = self.chat(Arc::new(msg)).await?;
        value.into_paths().ok_or_else(|| OwfsError::transport("unexpected reply kind for dirall"))
    }

    pub async fn attr_get<I, S>(&self, path: I) -> Result<Bytes, OwfsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.read(path).await
    }

    pub async fn attr_set<I, S>(&self, path: I, value: &[u8]) -> Result<(), OwfsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.write(path, value).await
    }

    /// Submit `msg`, retrying on `Busy` with capped exponential backoff.
    /// Every attempt replaces the message's completion slot via
    /// `resubmit()`, which is also the mechanism a reconnect uses to fail
    /// a stale in-flight attempt so this loop can try again on the new
    /// connection.
    async fn chat(&self, msg: Arc<Message>) -> Result<MessageValue, OwfsError> {
        let mut backoff = BUSY_INITIAL;
        loop {
            let waiter = msg.resubmit().await;
            self.submit(msg.clone()).await?;
            match waiter.await_reply().await {
                Ok(value) => return Ok(value),
                Err(OwfsError::Busy) | Err(OwfsError::Retry) => {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f64(BUSY_FACTOR).min(BUSY_CAP);
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn submit(&self, msg: Arc<Message>) -> Result<(), OwfsError> {
        self.outbox.send(msg).await.map_err(|_| OwfsError::transport("connection shut down"))
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr).await.with_context(|| format!("connecting to {addr}"))
    }

    async fn spawn_io(self: &Arc<Self>, stream: TcpStream) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let io_cancel = self.cancel.child_token();
        *self.io_cancel.lock().await = io_cancel.clone();
        let (read_half, write_half) = stream.into_split();
        let reader = tokio::spawn(self.clone().reader_loop(read_half, epoch, io_cancel.clone()));
        let writer = tokio::spawn(self.clone().writer_loop(write_half, epoch, io_cancel));
        *self.reader_handle.lock().await = Some(reader);
        *self.writer_handle.lock().await = Some(writer);
    }

    async fn take_outbox(&self) -> mpsc::Receiver<Arc<Message>> {
        self.rx_slot
            .lock()
            .await
            .take()
            .expect("outbox receiver missing: writer loop started twice concurrently")
    }

    async fn return_outbox(&self, rx: mpsc::Receiver<Arc<Message>>) {
        *self.rx_slot.lock().await = Some(rx);
    }

    /// Fails every in-flight request with `Retry` rather than `Transport`:
    /// per `OwfsError::Transport`'s contract, a live request never sees a
    /// transport error directly, since `chat()` is about to resubmit it
    /// once the reconnect succeeds.
    async fn cancel_in_flight(&self) {
        let mut in_flight = self.in_flight.lock().await;
        for msg in in_flight.drain(..) {
            msg.complete(Err(OwfsError::Retry)).await;
        }
    }

    fn writer_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        epoch: u64,
        io_cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut rx = self.take_outbox().await;
            let outcome = self.writer_drive(&mut write_half, &mut rx, &io_cancel).await;
            self.return_outbox(rx).await;
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "writer task exiting");
                self.handle_disconnect(epoch, Role::Writer).await;
            }
        })
    }

    async fn writer_drive(
        &self,
        write_half: &mut OwnedWriteHalf,
        rx: &mut mpsc::Receiver<Arc<Message>>,
        io_cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let msg = tokio::select! {
                _ = io_cancel.cancelled() => return Ok(()),
                recv = tokio::time::timeout(WRITER_IDLE_KEEPALIVE, rx.recv()) => match recv {
                    Ok(Some(msg)) => msg,
                    Ok(None) => return Ok(()),
                    // idle too long: keep the connection alive with an
                    // unawaited NOP rather than let the server time us out.
                    Err(_) => Arc::new(Message::nop().0),
                },
            };

            if msg.is_cancelled() {
                continue;
            }

            self.in_flight.lock().await.push_back(msg.clone());

            if let Err(e) = self.write_message(write_half, &msg, io_cancel).await {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(pos) = in_flight.iter().rposition(|m| Arc::ptr_eq(m, &msg)) {
                    in_flight.remove(pos);
                }
                drop(in_flight);
                // Per `OwfsError::Transport`'s contract, a message chat()
                // is still waiting on never sees the transport failure
                // directly; it gets `Retry` so the reconnect that's about
                // to happen can resubmit it.
                msg.complete(Err(OwfsError::Retry)).await;
                return Err(e);
            }
        }
    }

    async fn write_message(
        &self,
        write_half: &mut OwnedWriteHalf,
        msg: &Message,
        io_cancel: &CancellationToken,
    ) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let header = Header::request(
            msg.command,
            FormatFlags::for_request(),
            msg.payload.len() as i32,
            msg.data_len,
            msg.offset,
        );
        let mut buf = BytesMut::with_capacity(HEADER_LEN + msg.payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&msg.payload);
        io_with_timeout("write request", write_half.write_all(&buf), WRITER_IDLE_KEEPALIVE, io_cancel).await
    }

    fn reader_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        epoch: u64,
        io_cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            if let Err(e) = self.reader_drive(&mut read_half, &io_cancel).await {
                tracing::warn!(error = %e, "reader task exiting");
                self.handle_disconnect(epoch, Role::Reader).await;
            }
        })
    }

    async fn reader_drive(&self, read_half: &mut OwnedReadHalf, io_cancel: &CancellationToken) -> Result<()> {
        use tokio::io::AsyncReadExt;

        loop {
            let mut hdr_buf = [0u8; HEADER_LEN];
            io_with_timeout("read header", read_half.read_exact(&mut hdr_buf), READER_CEILING, io_cancel).await?;
            let header = Header::from_bytes(&hdr_buf);

            let payload_len = header.payload_len.get().max(0) as usize;
            if payload_len > MAX_PAYLOAD_LEN {
                return Err(anyhow!("oversized payload_len {payload_len} in reply header"));
            }
            let mut payload = BytesMut::zeroed(payload_len);
            if payload_len > 0 {
                io_with_timeout("read payload", read_half.read_exact(&mut payload), READER_CEILING, io_cancel).await?;
            }

            let msg = self.in_flight.lock().await.pop_front();
            let Some(msg) = msg else {
                tracing::warn!("reply received with no in-flight request, dropping");
                continue;
            };

            if header.is_busy() {
                msg.complete(Err(OwfsError::Busy)).await;
                continue;
            }
            if header.is_error() {
                let code = (-header.ret_value.get()).max(0) as u16;
                msg.complete_error(ReplyError::from_code(code)).await;
                continue;
            }

            let offset = header.offset_masked().max(0) as usize;
            let data_len = header.data_len.get().max(0) as usize;
            let sliced = slice_reply(&payload, offset, data_len);
            let reply = msg.interpret_reply(sliced);
            msg.complete(reply).await;
        }
    }

    /// `role` identifies which task detected the failure; its sibling (the
    /// other half of this same connection generation) is still alive and
    /// must be cancelled and joined before a new reader/writer pair is
    /// spawned, or the new writer's `take_outbox` would race the old one's
    /// `return_outbox`.
    async fn handle_disconnect(self: &Arc<Self>, epoch: u64, role: Role) {
        let _guard = self.connect_lock.lock().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            // Another task already drove this reconnect to completion.
            return;
        }
        self.io_cancel.lock().await.cancel();
        let sibling = match role {
            Role::Reader => self.writer_handle.lock().await.take(),
            Role::Writer => self.reader_handle.lock().await.take(),
        };
        if let Some(handle) = sibling {
            let _ = handle.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.events
            .push(Event::ServerDisconnected { host: self.host.clone(), port: self.port })
            .await;
        self.cancel_in_flight().await;
        if self.cancel.is_cancelled() {
            return;
        }
        self.reconnect_loop(epoch).await;
    }

    async fn reconnect_loop(self: &Arc<Self>, old_epoch: u64) {
        let mut backoff = RECONNECT_INITIAL;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.connect().await {
                Ok(stream) => {
                    self.epoch.store(old_epoch + 1, Ordering::SeqCst);
                    self.spawn_io(stream).await;
                    self.connected.store(true, Ordering::SeqCst);
                    self.events
                        .push(Event::ServerConnected { host: self.host.clone(), port: self.port })
                        .await;
                    return;
                },
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?backoff, "reconnect attempt failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {},
                    }
                    backoff = backoff.mul_f64(RECONNECT_FACTOR).min(RECONNECT_CAP);
                },
            }
        }
    }
}

fn slice_reply(payload: &[u8], offset: usize, data_len: usize) -> Bytes {
    let end = data_len.min(payload.len());
    let start = offset.min(end);
    Bytes::copy_from_slice(&payload[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_reply_respects_offset_and_len() {
        let payload = b"0123456789".to_vec();
        assert_eq!(&slice_reply(&payload, 2, 5)[..], b"234");
        assert_eq!(&slice_reply(&payload, 0, 0)[..], b"");
        assert_eq!(&slice_reply(&payload, 20, 3)[..], b"");
    }
}
