// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-family schema cache with single-flight loading.
//!
//! Mirrors the connection engine's `connect_lock` idiom: the first caller
//! for a family loads the schema from `/structure/<FF>`, concurrent callers
//! wait on a `Notify` rather than issuing redundant reads.

use std::{future::Future, pin::Pin, sync::Arc};

use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, RwLock};

use crate::{
    error::{OwfsError, ReplyError},
    schema::descriptor::{AccessMode, ArrayKind, Field, SchemaNode, TypeTag},
    server::connection::Server,
};

enum SetupState {
    NotStarted,
    InProgress(Arc<Notify>),
    Done,
}

pub struct DeviceClassEntry {
    pub family: u8,
    schema: RwLock<SchemaNode>,
    state: Mutex<SetupState>,
}

impl DeviceClassEntry {
    fn new(family: u8) -> Self {
        Self {
            family,
            schema: RwLock::new(SchemaNode::default()),
            state: Mutex::new(SetupState::NotStarted),
        }
    }

    pub async fn field(&self, name: &str) -> Option<Field> {
        self.schema.read().await.resolve(name).cloned()
    }
}

#[derive(Default)]
pub struct DeviceClassRegistry {
    entries: DashMap<u8, Arc<DeviceClassEntry>>,
}

impl DeviceClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached class for `family`, loading it on first use.
    /// Concurrent callers for the same family block on the loader rather
    /// than each issuing their own `structure` walk.
    pub async fn ensure(
        &self,
        server: &Arc<Server>,
        family: u8,
    ) -> Result<Arc<DeviceClassEntry>, OwfsError> {
        let entry = self
            .entries
            .entry(family)
            .or_insert_with(|| Arc::new(DeviceClassEntry::new(family)))
            .clone();

        loop {
            enum Next {
                Done,
                Wait(Arc<Notify>),
                Load,
            }

            let next = {
                let mut state = entry.state.lock().await;
                match &*state {
                    SetupState::Done => Next::Done,
                    SetupState::InProgress(notify) => Next::Wait(notify.clone()),
                    SetupState::NotStarted => {
                        *state = SetupState::InProgress(Arc::new(Notify::new()));
                        Next::Load
                    },
                }
            };

            match next {
                Next::Done => return Ok(entry),
                Next::Load => return self.load(server, &entry).await.map(|()| entry.clone()),
                Next::Wait(notify) => notify.notified().await,
            }
        }
    }

    async fn load(&self, server: &Arc<Server>, entry: &DeviceClassEntry) -> Result<(), OwfsError> {
        let family_code = format!("{:02X}", entry.family);
        let result = load_schema_at(server, &[String::from("structure"), family_code], Vec::new()).await;

        let mut state = entry.state.lock().await;
        let notify = match &*state {
            SetupState::InProgress(n) => n.clone(),
            _ => Arc::new(Notify::new()),
        };

        match result {
            Ok(node) => {
                *entry.schema.write().await = node;
                *state = SetupState::Done;
                notify.notify_waiters();
                Ok(())
            },
            Err(e) => {
                *state = SetupState::NotStarted;
                notify.notify_waiters();
                Err(e)
            },
        }
    }
}

fn load_schema_at<'a>(
    server: &'a Arc<Server>,
    base: &'a [String],
    subdir: Vec<String>,
) -> Pin<Box<dyn Future<Output = Result<SchemaNode, OwfsError>> + Send + 'a>> {
    Box::pin(async move {
        let mut full_path = base.to_vec();
        full_path.extend(subdir.iter().cloned());

        let mut node = SchemaNode::default();
        let entries = server.dir(full_path).await?;

        for name in entries {
            let mut dd = subdir.clone();
            dd.push(name.clone());
            let mut field_path = base.to_vec();
            field_path.extend(dd.iter().cloned());

            match server.attr_get(field_path).await {
                Ok(raw) => {
                    let desc = String::from_utf8_lossy(&raw);
                    let parts: Vec<&str> = desc.trim_end_matches('\0').split(',').collect();
                    if parts.len() < 4 {
                        return Err(OwfsError::Protocol(ReplyError::DataFormat));
                    }
                    let type_tag = TypeTag::from_char(parts[0].chars().next().unwrap_or('s'));
                    let mode = AccessMode::from_str(parts[3]);

                    // `dd` is the path relative to the family root, which is
                    // also the path relative to any device of this family —
                    // that's the form callers need to build a read/write.
                    if let Some(stripped) = name.strip_suffix(".0") {
                        insert_array_field(&mut node, stripped, dd, type_tag, mode, ArrayKind::Numeric);
                    } else if let Some(stripped) = name.strip_suffix(".A") {
                        insert_array_field(&mut node, stripped, dd, type_tag, mode, ArrayKind::Alphabetic);
                    } else {
                        node.fields.insert(name, Field { path: dd, type_tag, mode, array: None });
                    }
                },
                Err(OwfsError::Protocol(ReplyError::IsDir)) => {
                    let sub = load_schema_at(server, base, dd).await?;
                    node.subdirs.insert(name, sub);
                },
                Err(e) => return Err(e),
            }
        }

        Ok(node)
    })
}

fn insert_array_field(
    node: &mut SchemaNode,
    base_name: &str,
    mut relative_path: Vec<String>,
    type_tag: TypeTag,
    mode: AccessMode,
    array: ArrayKind,
) {
    relative_path.pop();
    relative_path.push(base_name.to_string());
    node.fields
        .entry(base_name.to_string())
        .or_insert(Field { path: relative_path, type_tag, mode, array: Some(array) });
}
