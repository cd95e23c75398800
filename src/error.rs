// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed error taxonomy for the OWFS ownerver wire protocol.
//!
//! `ReplyError` mirrors the positive errno-like codes ownerver returns in a
//! negated `ret_value`; unknown codes fall through to `Other`.

use thiserror::Error;

/// One variant per documented ownerver reply code, keyed by the positive
/// magnitude of the negative `ret_value` the server sent.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    #[error("no such entry (2)")]
    NoEntry,
    #[error("interrupted (4)")]
    Interrupted,
    #[error("bus I/O error (5)")]
    BusIO,
    #[error("bad filesystem (9)")]
    BadFS,
    #[error("try again (11)")]
    TryAgain,
    #[error("no free memory (12)")]
    NoFreeMemory,
    #[error("permission denied (13)")]
    Permission,
    #[error("fault (14)")]
    Fault,
    #[error("busy (16)")]
    Busy,
    #[error("no device (19)")]
    NoDevice,
    #[error("no directory (20)")]
    NoDirectory,
    #[error("is a directory (21)")]
    IsDir,
    #[error("invalid data (22)")]
    InvalidData,
    #[error("input path too long (26)")]
    InputPathTooLong,
    #[error("bad path syntax (27)")]
    BadPathSyntax,
    #[error("bad CRC8 (28)")]
    BadCRC8,
    #[error("unknown name (29)")]
    UnknownName,
    #[error("read only (30)")]
    ReadOnly,
    #[error("alias too long (31)")]
    AliasTooLong,
    #[error("unknown property (32)")]
    UnknownProperty,
    #[error("not an array (33)")]
    NotAnArray,
    #[error("out of range (34)")]
    Range,
    #[error("is an array (35)")]
    IsAnArray,
    #[error("name too long (36)")]
    NameTooLong,
    #[error("not a bitfield (37)")]
    NotBitfield,
    #[error("index too large (38)")]
    IndexTooLarge,
    #[error("no such subpath (39)")]
    NoSubpath,
    #[error("loop detected (40)")]
    Loop,
    #[error("device not found (41)")]
    DeviceNotFound,
    #[error("no message (42)")]
    NoMessage,
    #[error("device error (43)")]
    Device,
    #[error("bus short (44)")]
    BusShort,
    #[error("no such bus (45)")]
    NoSuchBus,
    #[error("bus not appropriate (46)")]
    BusNotAppropriate,
    #[error("bus not responding (47)")]
    BusNotResponding,
    #[error("bus reset (48)")]
    BusReset,
    #[error("bus closed (49)")]
    BusClosed,
    #[error("bus not opened (50)")]
    BusNotOpened,
    #[error("bus communication error (51)")]
    BusCommunication,
    #[error("bus timeout (52)")]
    BusTimeout,
    #[error("telnet error (53)")]
    Telnet,
    #[error("TCP error (54)")]
    TCP,
    #[error("bus is local (55)")]
    BusIsLocal,
    #[error("bus is remote (56)")]
    BusIsRemote,
    #[error("read too large (57)")]
    ReadTooLarge,
    #[error("data communication error (58)")]
    DataCommunication,
    #[error("not a readable property (59)")]
    NotRProperty,
    #[error("not a readable property (60)")]
    NotReadableProperty,
    #[error("data too large (61)")]
    DataTooLarge,
    #[error("data too small (62)")]
    DataTooSmall,
    #[error("bad data format (63)")]
    DataFormat,
    #[error("not a writable property (64)")]
    NotWProperty,
    #[error("not a writable property (65)")]
    NotWritableProperty,
    #[error("read only mode (66)")]
    ReadOnlyMode,
    #[error("data communication error (67)")]
    DataComm,
    #[error("output path too long (68)")]
    OutputPathTooLong,
    #[error("not a directory (69)")]
    NotADirectory,
    #[error("not a device (70)")]
    NotADevice,
    #[error("unknown query (71)")]
    UnknownQuery,
    #[error("socket error (72)")]
    Socket,
    #[error("timeout (73)")]
    Timeout,
    #[error("bad message (74)")]
    BadMsg,
    #[error("version mismatch (75)")]
    Version,
    #[error("packet size error (76)")]
    PacketSize,
    #[error("text in path (77)")]
    TextInPath,
    #[error("unexpected null (78)")]
    UnexpectedNull,
    #[error("no memory (79)")]
    NoMemory,
    #[error("message size error (90)")]
    MsgSize,
    #[error("not supported (95)")]
    NotSupported,
    #[error("in use (98)")]
    InUse,
    #[error("not available (99)")]
    NotAvailable,
    #[error("connection aborted (103)")]
    ConnAborted,
    #[error("no buffer space (105)")]
    NoBufs,
    /// Any code the table above does not recognise, carrying the raw value.
    #[error("owserver reply error {0}")]
    Other(u16),
}

impl ReplyError {
    /// Decode the positive magnitude of a negative `ret_value`.
    pub fn from_code(code: u16) -> Self {
        match code {
            2 => Self::NoEntry,
            4 => Self::Interrupted,
            5 => Self::BusIO,
            9 => Self::BadFS,
            11 => Self::TryAgain,
            12 => Self::NoFreeMemory,
            13 => Self::Permission,
            14 => Self::Fault,
            16 => Self::Busy,
            19 => Self::NoDevice,
            20 => Self::NoDirectory,
            21 => Self::IsDir,
            22 => Self::InvalidData,
            26 => Self::InputPathTooLong,
            27 => Self::BadPathSyntax,
            28 => Self::BadCRC8,
            29 => Self::UnknownName,
            30 => Self::ReadOnly,
            31 => Self::AliasTooLong,
            32 => Self::UnknownProperty,
            33 => Self::NotAnArray,
            34 => Self::Range,
            35 => Self::IsAnArray,
            36 => Self::NameTooLong,
            37 => Self::NotBitfield,
            38 => Self::IndexTooLarge,
            39 => Self::NoSubpath,
            40 => Self::Loop,
            41 => Self::DeviceNotFound,
            42 => Self::NoMessage,
            43 => Self::Device,
            44 => Self::BusShort,
            45 => Self::NoSuchBus,
            46 => Self::BusNotAppropriate,
            47 => Self::BusNotResponding,
            48 => Self::BusReset,
            49 => Self::BusClosed,
            50 => Self::BusNotOpened,
            51 => Self::BusCommunication,
            52 => Self::BusTimeout,
            53 => Self::Telnet,
            54 => Self::TCP,
            55 => Self::BusIsLocal,
            56 => Self::BusIsRemote,
            57 => Self::ReadTooLarge,
            58 => Self::DataCommunication,
            59 => Self::NotRProperty,
            60 => Self::NotReadableProperty,
            61 => Self::DataTooLarge,
            62 => Self::DataTooSmall,
            63 => Self::DataFormat,
            64 => Self::NotWProperty,
            65 => Self::NotWritableProperty,
            66 => Self::ReadOnlyMode,
            67 => Self::DataComm,
            68 => Self::OutputPathTooLong,
            69 => Self::NotADirectory,
            70 => Self::NotADevice,
            71 => Self::UnknownQuery,
            72 => Self::Socket,
            73 => Self::Timeout,
            74 => Self::BadMsg,
            75 => Self::Version,
            76 => Self::PacketSize,
            77 => Self::TextInPath,
            78 => Self::UnexpectedNull,
            79 => Self::NoMemory,
            90 => Self::MsgSize,
            95 => Self::NotSupported,
            98 => Self::InUse,
            99 => Self::NotAvailable,
            103 => Self::ConnAborted,
            105 => Self::NoBufs,
            other => Self::Other(other),
        }
    }
}

/// Top-level error type returned by every fallible public operation.
#[derive(Debug, Error)]
pub enum OwfsError {
    /// The server returned a negative `ret_value`; see `ReplyError`.
    #[error("protocol reply error: {0}")]
    Protocol(#[from] ReplyError),

    /// Transport-level failure (connect refused, reset, incomplete frame).
    /// Never surfaced for a live in-flight message: the connection engine
    /// recovers via reconnect and either resubmits or reports `Retry`.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server reported itself busy. Internal only; `chat()` retries
    /// with backoff and callers never observe this variant directly.
    #[error("server busy")]
    Busy,

    /// Raised on the previous completion slot when a message is
    /// resubmitted, so a blocked waiter can loop onto the new slot.
    #[error("message was resubmitted; retry")]
    Retry,

    /// The caller abandoned the request before it completed.
    #[error("request cancelled")]
    Cancelled,

    /// Attempted to read/write a Device that currently has no known Bus.
    #[error("device has no known location")]
    LocationMissing,

    /// A directory entry failed 1-Wire ID parsing (`FF.XXXXXXXXXXXX.CC`).
    #[error("not a device id: {0}")]
    NotADevice(String),
}

impl OwfsError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
