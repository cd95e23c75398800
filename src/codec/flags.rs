// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `format_flags` word carried in every ownerver frame header.
//!
//! Layout: single-bit flags OR-combined in the low byte plus `ownet` at bit
//! 8, and three packed sub-fields further up the word: temperature unit at
//! bit 16 (2 bits), pressure unit at bit 18 (3 bits), device-id format at
//! bit 24 (3 bits).

use std::fmt;

bitflags::bitflags! {
    #[derive(Default, PartialEq, Eq, Clone, Copy)]
    pub struct FormatFlags: u32 {
        const CACHE = 0x0001;
        /// Listings include the `bus.N` prefix in entry names.
        const BUSRET = 0x0002;
        const PERSIST = 0x0004;
        const ALIAS = 0x0008;
        const SAFEMODE = 0x0010;
        const UNCACHED = 0x0020;
        const OWNET = 0x0100;
        const TEMP_MASK = 0x0003 << 16;
        const PRESSURE_MASK = 0x0007 << 18;
        const DEVICE_ID_MASK = 0x0007 << 24;
    }
}

/// Flags every outgoing request must carry, per the wire protocol.
pub const REQUEST_FLAGS: FormatFlags = FormatFlags::PERSIST
    .union(FormatFlags::BUSRET)
    .union(FormatFlags::UNCACHED)
    .union(FormatFlags::OWNET);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TemperatureUnit {
    #[default]
    Celsius = 0,
    Fahrenheit = 1,
    Kelvin = 2,
    Rankine = 3,
}

impl TemperatureUnit {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::Fahrenheit,
            2 => Self::Kelvin,
            3 => Self::Rankine,
            _ => Self::Celsius,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PressureUnit {
    #[default]
    Mbar = 0,
    Atm = 1,
    MmHg = 2,
    InHg = 3,
    Psi = 4,
    Pa = 5,
}

impl PressureUnit {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => Self::Atm,
            2 => Self::MmHg,
            3 => Self::InHg,
            4 => Self::Psi,
            5 => Self::Pa,
            _ => Self::Mbar,
        }
    }
}

/// `device-id format` sub-field; `fdidc` (family.code.checksum) is what
/// this crate requires on every outgoing request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceIdFormat {
    Fdi = 0,
    Fi = 1,
    #[default]
    Fdidc = 2,
    Fdic = 3,
    Fidc = 4,
    Fic = 5,
}

impl DeviceIdFormat {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Self::Fdi,
            1 => Self::Fi,
            3 => Self::Fdic,
            4 => Self::Fidc,
            5 => Self::Fic,
            _ => Self::Fdidc,
        }
    }
}

impl FormatFlags {
    pub fn temperature_unit(self) -> TemperatureUnit {
        TemperatureUnit::from_bits((self.bits() & Self::TEMP_MASK.bits()) >> 16)
    }

    pub fn with_temperature_unit(mut self, unit: TemperatureUnit) -> Self {
        self.remove(Self::TEMP_MASK);
        self |= Self::from_bits_retain((unit as u32) << 16);
        self
    }

    pub fn pressure_unit(self) -> PressureUnit {
        PressureUnit::from_bits((self.bits() & Self::PRESSURE_MASK.bits()) >> 18)
    }

    pub fn with_pressure_unit(mut self, unit: PressureUnit) -> Self {
        self.remove(Self::PRESSURE_MASK);
        self |= Self::from_bits_retain((unit as u32) << 18);
        self
    }

    pub fn device_id_format(self) -> DeviceIdFormat {
        DeviceIdFormat::from_bits((self.bits() & Self::DEVICE_ID_MASK.bits()) >> 24)
    }

    pub fn with_device_id_format(mut self, fmt: DeviceIdFormat) -> Self {
        self.remove(Self::DEVICE_ID_MASK);
        self |= Self::from_bits_retain((fmt as u32) << 24);
        self
    }

    /// The flags this crate sets on every request: persist | busret |
    /// uncached | ownet, celsius, mbar, fdidc.
    pub fn for_request() -> Self {
        REQUEST_FLAGS
            .with_temperature_unit(TemperatureUnit::Celsius)
            .with_pressure_unit(PressureUnit::Mbar)
            .with_device_id_format(DeviceIdFormat::Fdidc)
    }
}

impl fmt::Debug for FormatFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FormatFlags(bits={:#010x}, temp={:?}, pressure={:?}, device_id={:?})",
            self.bits(),
            self.temperature_unit(),
            self.pressure_unit(),
            self.device_id_format()
        )
    }
}
