// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-family attribute schema: descriptor parsing plus a cached registry.

pub mod descriptor;
pub mod registry;

pub use descriptor::{AccessMode, ArrayKind, Field, ScalarValue, SchemaNode, TypeTag};
pub use registry::{DeviceClassEntry, DeviceClassRegistry};
