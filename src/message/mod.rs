// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Request messages and their completion slots.

pub mod completion;
pub mod types;

pub use completion::{Reply, Waiter};
pub use types::{Message, MessageValue};
