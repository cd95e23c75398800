// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Single-fire completion slot for an in-flight message.
//!
//! A plain `oneshot` pair, since an ownerver reply answers exactly one
//! request. Resubmission replaces the slot: the new slot is handed to the
//! writer, and the old one (if still unfired) is completed with
//! `OwfsError::Retry` so a blocked waiter can loop onto the fresh slot
//! instead of hanging forever.

use tokio::sync::oneshot;

use crate::{error::OwfsError, message::types::MessageValue};

pub type Reply = Result<MessageValue, OwfsError>;

#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Reply>,
}

#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<Reply>,
}

/// Build a fresh, unfired completion/waiter pair.
pub fn pair() -> (Completion, Waiter) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx }, Waiter { rx })
}

impl Completion {
    /// Fire the slot with a final outcome. Never panics if the waiter
    /// already gave up (dropped its receiver).
    pub fn complete(self, reply: Reply) {
        let _ = self.tx.send(reply);
    }
}

impl Waiter {
    /// Await the slot's outcome. A slot dropped without `complete()` (e.g.
    /// the message itself was dropped) reads back as `Cancelled`.
    pub async fn await_reply(self) -> Reply {
        self.rx.await.unwrap_or(Err(OwfsError::Cancelled))
    }
}
