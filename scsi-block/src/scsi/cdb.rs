// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Command descriptor blocks for the commands this layer issues.
//!
//! A `Cdb` is built by the command types in `command.rs` and turned into wire
//! bytes by the transport. The emulated target goes the other way with
//! `Cdb::parse`.

use std::fmt;

use log::warn;
use num_enum::TryFromPrimitive;

/// Highest block addressable by the 10-byte commands.
pub const MAX_BLOCK_10: u64 = 0xffff_ffff;

/// Service action of SERVICE ACTION IN (16) selecting READ CAPACITY (16).
pub const SERVICE_ACTION_READ_CAPACITY_16: u8 = 0x10;

/// Size of the parameter data returned by READ CAPACITY (10).
pub const CAPACITY_10_LEN: usize = 8;
/// Size of the parameter data returned by READ CAPACITY (16).
pub const CAPACITY_16_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    TestUnitReady = 0x00,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2a,
    Read16 = 0x88,
    Write16 = 0x8a,
    ServiceActionIn16 = 0x9e,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cdb {
    TestUnitReady,
    Read10 { lba: u32, len: u16 },
    Read16 { lba: u64, len: u32 },
    Write10 { lba: u32, len: u16 },
    Write16 { lba: u64, len: u32 },
    ReadCapacity10,
    /// READ CAPACITY (16); `len` is the allocation length.
    ReadCapacity16 { len: u32 },
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ParseError {
    /// The opcode is unknown, i.e. INVALID COMMAND OPERATION CODE.
    InvalidCommand,
    /// Another field of the CDB (including the service action) is invalid,
    /// i.e. INVALID FIELD IN CDB.
    InvalidField,
    /// The CDB has fewer bytes than its opcode requires.
    TooSmall,
}

/// Whether a transfer of `count` blocks at `lba` needs the 16-byte commands.
fn needs_16(lba: u64, count: u32) -> bool {
    lba.saturating_add(u64::from(count)) > MAX_BLOCK_10
}

/// The 10-byte commands carry a 16-bit transfer length.
fn short_len(count: u32) -> u16 {
    u16::try_from(count).unwrap_or_else(|_| {
        warn!("Transfer of {count} blocks truncated by 10-byte CDB");
        // low 16 bits, as the 10-byte field would carry them
        (count & 0xffff) as u16
    })
}

impl Cdb {
    /// READ (10) when the whole transfer lies below the 32-bit block limit,
    /// READ (16) otherwise.
    pub fn read(lba: u64, count: u32) -> Self {
        match u32::try_from(lba) {
            Ok(lba) if !needs_16(u64::from(lba), count) => Self::Read10 {
                lba,
                len: short_len(count),
            },
            _ => Self::Read16 { lba, len: count },
        }
    }

    /// WRITE (10) or WRITE (16), by the same rule as `read`.
    pub fn write(lba: u64, count: u32) -> Self {
        match u32::try_from(lba) {
            Ok(lba) if !needs_16(u64::from(lba), count) => Self::Write10 {
                lba,
                len: short_len(count),
            },
            _ => Self::Write16 { lba, len: count },
        }
    }

    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::TestUnitReady => Opcode::TestUnitReady,
            Self::Read10 { .. } => Opcode::Read10,
            Self::Read16 { .. } => Opcode::Read16,
            Self::Write10 { .. } => Opcode::Write10,
            Self::Write16 { .. } => Opcode::Write16,
            Self::ReadCapacity10 => Opcode::ReadCapacity10,
            Self::ReadCapacity16 { .. } => Opcode::ServiceActionIn16,
        }
    }

    /// Length in bytes of the encoded CDB.
    pub const fn size(&self) -> usize {
        Self::size_of(self.opcode())
    }

    const fn size_of(opcode: Opcode) -> usize {
        match opcode {
            Opcode::TestUnitReady => 6,
            Opcode::ReadCapacity10 | Opcode::Read10 | Opcode::Write10 => 10,
            Opcode::Read16 | Opcode::Write16 | Opcode::ServiceActionIn16 => 16,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cdb = vec![0; self.size()];
        cdb[0] = self.opcode() as u8;
        match *self {
            Self::TestUnitReady | Self::ReadCapacity10 => {}
            Self::Read10 { lba, len } | Self::Write10 { lba, len } => {
                cdb[2..6].copy_from_slice(&lba.to_be_bytes());
                cdb[7..9].copy_from_slice(&len.to_be_bytes());
            }
            Self::Read16 { lba, len } | Self::Write16 { lba, len } => {
                cdb[2..10].copy_from_slice(&lba.to_be_bytes());
                cdb[10..14].copy_from_slice(&len.to_be_bytes());
            }
            Self::ReadCapacity16 { len } => {
                cdb[1] = SERVICE_ACTION_READ_CAPACITY_16;
                cdb[10..14].copy_from_slice(&len.to_be_bytes());
            }
        }
        cdb
    }

    /// Decode a CDB received off the wire.
    ///
    /// Flag bits we never set (DPO, FUA, protection, group number) are
    /// accepted and ignored.
    pub fn parse(cdb: &[u8]) -> Result<Self, ParseError> {
        let opcode = cdb
            .first()
            .copied()
            .ok_or(ParseError::TooSmall)
            .and_then(|op| Opcode::try_from(op).map_err(|_| ParseError::InvalidCommand))?;
        if cdb.len() < Self::size_of(opcode) {
            return Err(ParseError::TooSmall);
        }
        let cdb = &cdb[..Self::size_of(opcode)];

        // unwraps below only convert constant-index subslices to arrays; the
        // length check above keeps them in bounds
        Ok(match opcode {
            Opcode::TestUnitReady => Self::TestUnitReady,
            Opcode::ReadCapacity10 => Self::ReadCapacity10,
            Opcode::Read10 => Self::Read10 {
                lba: u32::from_be_bytes(cdb[2..6].try_into().unwrap()),
                len: u16::from_be_bytes(cdb[7..9].try_into().unwrap()),
            },
            Opcode::Write10 => Self::Write10 {
                lba: u32::from_be_bytes(cdb[2..6].try_into().unwrap()),
                len: u16::from_be_bytes(cdb[7..9].try_into().unwrap()),
            },
            Opcode::Read16 => Self::Read16 {
                lba: u64::from_be_bytes(cdb[2..10].try_into().unwrap()),
                len: u32::from_be_bytes(cdb[10..14].try_into().unwrap()),
            },
            Opcode::Write16 => Self::Write16 {
                lba: u64::from_be_bytes(cdb[2..10].try_into().unwrap()),
                len: u32::from_be_bytes(cdb[10..14].try_into().unwrap()),
            },
            Opcode::ServiceActionIn16 => {
                if cdb[1] & 0b0001_1111 != SERVICE_ACTION_READ_CAPACITY_16 {
                    return Err(ParseError::InvalidField);
                }
                Self::ReadCapacity16 {
                    len: u32::from_be_bytes(cdb[10..14].try_into().unwrap()),
                }
            }
        })
    }
}

/// Hex dump of the CDB, for logging.
impl fmt::Display for Cdb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
