// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Sense data: parsing what a target reports, and producing it for the
//! emulated target.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Response code bits of the first sense byte (the top bit is VALID).
pub const SENSE_CODE_MASK: u8 = 0x7f;
/// Sense key bits; the upper nibble holds FILEMARK/EOM/ILI and friends.
pub const SENSE_KEY_MASK: u8 = 0x0f;

/// Length of the descriptor-format fields we copy out: code, key, ASC/ASCQ.
const DESCRIPTOR_SENSE_LEN: usize = 4;
/// Length of fixed-format sense data up to and including ASC/ASCQ.
const FIXED_SENSE_LEN: usize = 14;

/// Response codes 0x70 (current) and 0x71 (deferred) are fixed format.
const fn is_fixed_format(code: u8) -> bool {
    code & 0x7e == 0x70
}

/// Sense data normalised to the descriptor-format header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SenseRecord {
    /// Response code, including the VALID bit.
    pub code: u8,
    /// Sense key, possibly with flag bits in the upper nibble.
    pub key: u8,
    /// Additional sense code (high byte) and qualifier (low byte).
    pub additional: u16,
}

impl SenseRecord {
    pub const fn response_code(&self) -> u8 {
        self.code & SENSE_CODE_MASK
    }

    pub fn sense_key(&self) -> SenseKey {
        SenseKey::from_raw(self.key)
    }

    pub const fn asc(&self) -> u8 {
        self.additional.to_be_bytes()[0]
    }

    pub const fn ascq(&self) -> u8 {
        self.additional.to_be_bytes()[1]
    }
}

/// Parse raw sense data into a [`SenseRecord`].
///
/// Anything too short to hold a descriptor-format header yields an all-zero
/// record. Fixed-format data long enough to reach ASC/ASCQ has its
/// additional sense code taken from the fixed-format positions.
///
/// The sense key is converted from byte 2 as well, not only the additional
/// sense code, so a fixed-format key is never misread as a descriptor ASC.
pub fn parse_sense(data: &[u8]) -> SenseRecord {
    let mut sense = SenseRecord::default();

    if data.len() < DESCRIPTOR_SENSE_LEN {
        return sense;
    }
    sense.code = data[0];
    sense.key = data[1];
    sense.additional = u16::from_be_bytes([data[2], data[3]]);

    if data.len() < FIXED_SENSE_LEN || !is_fixed_format(data[0]) {
        return sense;
    }
    sense.key = data[2];
    sense.additional = u16::from_be_bytes([data[12], data[13]]);

    sense
}

/// The sixteen SCSI sense keys; each one is a distinct error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xa,
    AbortedCommand = 0xb,
    Reserved = 0xc,
    VolumeOverflow = 0xd,
    Miscompare = 0xe,
    Completed = 0xf,
}

impl SenseKey {
    /// Map the low nibble of a sense key byte to its kind.
    pub fn from_raw(key: u8) -> Self {
        Self::try_from(key & SENSE_KEY_MASK).unwrap_or(Self::Reserved)
    }
}

impl fmt::Display for SenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSense => "No sense",
            Self::RecoveredError => "Recovered error",
            Self::NotReady => "Not ready",
            Self::MediumError => "Medium error",
            Self::HardwareError => "Hardware error",
            Self::IllegalRequest => "Illegal request",
            Self::UnitAttention => "Unit attention",
            Self::DataProtect => "Data protect",
            Self::BlankCheck => "Blank check",
            Self::VendorSpecific => "Vendor specific",
            Self::CopyAborted => "Copy aborted",
            Self::AbortedCommand => "Aborted command",
            Self::Reserved => "Reserved",
            Self::VolumeOverflow => "Volume overflow",
            Self::Miscompare => "Miscompare",
            Self::Completed => "Completed",
        })
    }
}

/// Sense key, ASC and ASCQ of a condition the emulated target reports.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct SenseTriple(SenseKey, u8, u8);

impl SenseTriple {
    pub const fn key(self) -> SenseKey {
        self.0
    }

    pub fn to_fixed_sense(self) -> Vec<u8> {
        vec![
            0x70,          // response code (fixed, current); valid bit (0)
            0x0,           // obsolete
            self.0.into(), // sk; various upper bits 0
            0x0, 0x0, 0x0, 0x0, // information
            0xa, // add'l sense length
            0x0, 0x0, 0x0, 0x0,    // cmd-specific information
            self.1, // asc
            self.2, // ascq
            0x0,    // field-replacable unit code
            0x0, 0x0, 0x0, // sense-key-specific information
        ]
    }

    pub fn to_descriptor_sense(self) -> Vec<u8> {
        vec![
            0x72,          // response code (descriptor, current)
            self.0.into(), // sk
            self.1,        // asc
            self.2,        // ascq
            0x0, 0x0, 0x0, // reserved
            0x0, // add'l sense length: no descriptors
        ]
    }
}

pub const NO_ADDITIONAL_SENSE_INFORMATION: SenseTriple = SenseTriple(SenseKey::NoSense, 0, 0);

pub const LOGICAL_UNIT_BECOMING_READY: SenseTriple = SenseTriple(SenseKey::NotReady, 0x04, 0x01);

pub const WRITE_ERROR: SenseTriple = SenseTriple(SenseKey::MediumError, 0x0c, 0x0);
pub const UNRECOVERED_READ_ERROR: SenseTriple = SenseTriple(SenseKey::MediumError, 0x11, 0x0);

pub const INVALID_COMMAND_OPERATION_CODE: SenseTriple =
    SenseTriple(SenseKey::IllegalRequest, 0x20, 0x0);
pub const LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE: SenseTriple =
    SenseTriple(SenseKey::IllegalRequest, 0x21, 0x0);
pub const INVALID_FIELD_IN_CDB: SenseTriple = SenseTriple(SenseKey::IllegalRequest, 0x24, 0x0);
pub const LOGICAL_UNIT_NOT_SUPPORTED: SenseTriple =
    SenseTriple(SenseKey::IllegalRequest, 0x25, 0x0);

pub const WRITE_PROTECTED: SenseTriple = SenseTriple(SenseKey::DataProtect, 0x27, 0x0);
