// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The 24-byte ownerver frame header: six big-endian `i32` fields, no AHS,
//! no digests.

use zerocopy::{BigEndian, FromBytes, I32, Immutable, IntoBytes, KnownLayout};

pub const HEADER_LEN: usize = 24;

/// Sentinel `payload_len` on a server-busy reply (masked to 0 meaningful
/// bytes; never a legitimate byte count).
pub const BUSY_PAYLOAD_LEN: i32 = -1;

/// Command codes understood by ownerver. This crate only ever sends `Nop`,
/// `Read`, `Write`, `Dirall`; the rest are documented for completeness of
/// the wire contract.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Error = 0,
    Nop = 1,
    Read = 2,
    Write = 3,
    Dir = 4,
    Size = 5,
    Presence = 6,
    Dirall = 7,
    Get = 8,
    DirallSlash = 9,
    GetSlash = 10,
}

impl Command {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Error,
            1 => Self::Nop,
            2 => Self::Read,
            3 => Self::Write,
            4 => Self::Dir,
            5 => Self::Size,
            6 => Self::Presence,
            7 => Self::Dirall,
            8 => Self::Get,
            9 => Self::DirallSlash,
            10 => Self::GetSlash,
            _ => return None,
        })
    }
}

/// Wire-safe, zero-copy ownerver header.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct Header {
    pub version: I32<BigEndian>,
    pub payload_len: I32<BigEndian>,
    pub ret_value: I32<BigEndian>,
    pub format_flags: I32<BigEndian>,
    pub data_len: I32<BigEndian>,
    pub offset: I32<BigEndian>,
}

impl Header {
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Header::read_from_bytes(buf).expect("header buffer is exactly HEADER_LEN")
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(self.as_bytes());
        out
    }

    /// `offset & 0x8000` must be treated as 0 per the wire contract.
    pub fn offset_masked(&self) -> i32 {
        self.offset.get() & !0x8000
    }

    /// `payload_len == -1 && data_len == 0 && offset == 0` signals busy.
    pub fn is_busy(&self) -> bool {
        self.payload_len.get() == BUSY_PAYLOAD_LEN
            && self.data_len.get() == 0
            && self.offset_masked() == 0
    }

    pub fn is_error(&self) -> bool {
        self.ret_value.get() < 0
    }

    pub fn request(
        command: Command,
        format_flags: crate::codec::flags::FormatFlags,
        payload_len: i32,
        data_len: i32,
        offset: i32,
    ) -> Self {
        Header {
            version: I32::new(0),
            payload_len: I32::new(payload_len),
            ret_value: I32::new(command as i32),
            format_flags: I32::new(format_flags.bits() as i32),
            data_len: I32::new(data_len),
            offset: I32::new(offset),
        }
    }
}
