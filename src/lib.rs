// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! An async client library for the 1-Wire File System (OWFS) `ownerver`
//! wire protocol: connection management, topology discovery, device
//! schema, and value polling.

pub mod cfg;
pub mod codec;
pub mod error;
pub mod events;
pub mod message;
pub mod schema;
pub mod server;
pub mod service;
pub mod topology;
pub mod utils;

pub use error::OwfsError;
pub use service::{Service, ServiceOptions};
pub use topology::{Device, DeviceId};
