// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request messages: `NOP`, `READ`, `WRITE`, `DIR` (wire command `dirall`).

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{
    codec::{frame::Command, path::encode_path},
    error::{OwfsError, ReplyError},
    message::completion::{self, Completion, Waiter},
};

/// Decoded reply value, kind-specific.
#[derive(Debug, Clone)]
pub enum MessageValue {
    /// `NOP` acknowledgement.
    Unit,
    /// `READ` payload bytes (first `ret_value` bytes of the reply).
    Data(Bytes),
    /// `DIR` (`dirall`) entries, as full paths. Callers at the public API
    /// boundary decode these down to last-segment names; internal scan
    /// code consults `codec::path::last_segment` itself when it needs a
    /// bare device id.
    Paths(Vec<String>),
}

impl MessageValue {
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Self::Data(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_paths(self) -> Option<Vec<String>> {
        match self {
            Self::Paths(p) => Some(p),
            _ => None,
        }
    }
}

pub fn timeout_for(command: Command) -> Duration {
    match command {
        Command::Nop => Duration::from_millis(500),
        Command::Read | Command::Get | Command::GetSlash => Duration::from_secs(2),
        Command::Write => Duration::from_secs(1),
        Command::Dir | Command::Dirall | Command::DirallSlash => Duration::from_secs(10),
        Command::Size | Command::Presence | Command::Error => Duration::from_secs(2),
    }
}

/// A request in flight: wire payload plus a completion slot the reader
/// fires once a matching reply (or busy/error) arrives.
#[derive(Debug)]
pub struct Message {
    pub command: Command,
    pub payload: Bytes,
    pub data_len: i32,
    pub offset: i32,
    pub rlen: i32,
    pub timeout: Duration,
    pub cancelled: std::sync::Arc<AtomicBool>,
    completion: Mutex<Option<Completion>>,
}

impl Message {
    fn new(command: Command, payload: Bytes, data_len: i32, offset: i32, rlen: i32) -> (Self, Waiter) {
        let (tx, rx) = completion::pair();
        let msg = Self {
            command,
            payload,
            data_len,
            offset,
            rlen,
            timeout: timeout_for(command),
            cancelled: std::sync::Arc::new(AtomicBool::new(false)),
            completion: Mutex::new(Some(tx)),
        };
        (msg, rx)
    }

    pub fn nop() -> (Self, Waiter) {
        Self::new(Command::Nop, Bytes::new(), 0, 0, 0)
    }

    pub fn read<I, S>(path: I) -> (Self, Waiter)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        const READ_CAPACITY: i32 = 8192;
        let payload = Bytes::from(encode_path(path));
        Self::new(Command::Read, payload, 0, 0, READ_CAPACITY)
    }

    pub fn write<I, S>(path: I, value: &[u8]) -> (Self, Waiter)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut payload = encode_path(path);
        payload.extend_from_slice(value);
        let data_len = value.len() as i32;
        let offset = value.len() as i32;
        Self::new(Command::Write, Bytes::from(payload), data_len, offset, data_len)
    }

    pub fn dirall<I, S>(path: I) -> (Self, Waiter)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let payload = Bytes::from(encode_path(path));
        Self::new(Command::Dirall, payload, 0, 0, 0)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Replace the completion slot, firing the old one with `Retry` if it
    /// was still pending. Returns the new waiter the caller should await.
    pub async fn resubmit(&self) -> Waiter {
        let (tx, rx) = completion::pair();
        let mut slot = self.completion.lock().await;
        if let Some(old) = slot.take() {
            old.complete(Err(OwfsError::Retry));
        }
        *slot = Some(tx);
        rx
    }

    /// Decode a successful reply payload per this message's kind.
    pub fn interpret_reply(&self, payload: Bytes) -> Result<MessageValue, OwfsError> {
        match self.command {
            Command::Nop => Ok(MessageValue::Unit),
            Command::Write => Ok(MessageValue::Unit),
            Command::Read | Command::Get | Command::GetSlash => Ok(MessageValue::Data(payload)),
            Command::Dir | Command::Dirall | Command::DirallSlash => {
                Ok(MessageValue::Paths(crate::codec::path::split_dirall(&payload)))
            },
            Command::Size | Command::Presence | Command::Error => Ok(MessageValue::Data(payload)),
        }
    }

    /// Fire the current completion slot (used by the reader on error/busy
    /// paths that never reach `interpret_reply`).
    pub async fn complete(&self, reply: Result<MessageValue, OwfsError>) {
        let mut slot = self.completion.lock().await;
        if let Some(tx) = slot.take() {
            tx.complete(reply);
        }
    }

    pub async fn complete_error(&self, err: ReplyError) {
        self.complete(Err(OwfsError::Protocol(err))).await;
    }
}
