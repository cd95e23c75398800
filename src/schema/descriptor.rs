// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-family descriptor tree: a statically-typed accessor table built once
//! per family from a `/structure/<FF>/` walk, rather than synthesizing
//! accessors per device at use time.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::OwfsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Float,
    Int,
    Bool,
    Bytes,
    Text,
}

impl TypeTag {
    pub fn from_char(c: char) -> Self {
        match c {
            'f' | 'g' | 'p' | 't' => Self::Float,
            'i' | 'u' => Self::Int,
            'y' => Self::Bool,
            'b' => Self::Bytes,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn from_str(s: &str) -> Self {
        match s {
            "ro" => Self::ReadOnly,
            "wo" => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }

    pub fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayKind {
    /// Suffix `.0`: indices are decimal, e.g. `PIO.0`, `PIO.1`.
    Numeric,
    /// Suffix `.A`: indices are `A`, `B`, `C`, ...
    Alphabetic,
}

impl ArrayKind {
    pub fn index_segment(self, idx: u32) -> String {
        match self {
            Self::Numeric => idx.to_string(),
            Self::Alphabetic => {
                char::from_u32('A' as u32 + idx).unwrap_or('?').to_string()
            },
        }
    }
}

/// One schema entry: a leaf field reachable at `path` relative to
/// `/structure/<FF>/`, which also doubles as the relative path under a
/// device's own directory.
#[derive(Debug, Clone)]
pub struct Field {
    pub path: Vec<String>,
    pub type_tag: TypeTag,
    pub mode: AccessMode,
    pub array: Option<ArrayKind>,
}

/// A node in the per-family schema tree: leaf fields plus nested
/// sub-directories (installed when a `structure` read returns `IsDir`).
#[derive(Debug, Clone, Default)]
pub struct SchemaNode {
    pub fields: HashMap<String, Field>,
    pub subdirs: HashMap<String, SchemaNode>,
}

impl SchemaNode {
    /// Resolve a `/`-separated name (e.g. `"humidity/HIH4000/humidity"`)
    /// down to its leaf field.
    pub fn resolve(&self, name: &str) -> Option<&Field> {
        let segs: Vec<&str> = name.split('/').filter(|s| !s.is_empty()).collect();
        let (last, dirs) = segs.split_last()?;
        let mut node = self;
        for seg in dirs {
            node = node.subdirs.get(*seg)?;
        }
        node.fields.get(*last)
    }
}

/// A decoded scalar value, tagged by the wire type character that produced
/// it.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Bytes(Bytes),
    Text(String),
}

impl ScalarValue {
    pub fn decode(type_tag: TypeTag, raw: &[u8]) -> Result<Self, OwfsError> {
        Ok(match type_tag {
            TypeTag::Float => {
                let s = std::str::from_utf8(raw)
                    .map_err(|_| OwfsError::Protocol(crate::error::ReplyError::DataFormat))?;
                let v: f64 = s
                    .trim()
                    .parse()
                    .map_err(|_| OwfsError::Protocol(crate::error::ReplyError::DataFormat))?;
                Self::Float(v)
            },
            TypeTag::Int => {
                let s = std::str::from_utf8(raw)
                    .map_err(|_| OwfsError::Protocol(crate::error::ReplyError::DataFormat))?;
                let v: i64 = s
                    .trim()
                    .parse()
                    .map_err(|_| OwfsError::Protocol(crate::error::ReplyError::DataFormat))?;
                Self::Int(v)
            },
            TypeTag::Bool => Self::Bool(raw.first() == Some(&b'1')),
            TypeTag::Bytes => Self::Bytes(Bytes::copy_from_slice(raw)),
            TypeTag::Text => Self::Text(String::from_utf8_lossy(raw).into_owned()),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Float(v) => v.to_string().into_bytes(),
            Self::Int(v) => v.to_string().into_bytes(),
            Self::Bool(v) => vec![if *v { b'1' } else { b'0' }],
            Self::Bytes(b) => b.to_vec(),
            Self::Text(s) => s.clone().into_bytes(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }
}
