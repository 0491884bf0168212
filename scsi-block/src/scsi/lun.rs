// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{fmt, str::FromStr};

use super::{Error, Result};

/// A SCSI logical unit number.
///
/// SAM describes LUNs as a four-level hierarchy of 16-bit addresses; we keep
/// the components in host order and only convert to network order when
/// putting them on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScsiLun([u16; 4]);

impl ScsiLun {
    pub const fn new(components: [u16; 4]) -> Self {
        Self(components)
    }

    pub const fn components(self) -> [u16; 4] {
        self.0
    }

    /// Wire encoding: each component big-endian, first level first.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut bytes = [0; 8];
        for (chunk, component) in bytes.chunks_exact_mut(2).zip(self.0) {
            chunk.copy_from_slice(&component.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        let mut components = [0; 4];
        for (component, chunk) in components.iter_mut().zip(bytes.chunks_exact(2)) {
            *component = u16::from_be_bytes([chunk[0], chunk[1]]);
        }
        Self(components)
    }

    /// Parse an optional LUN string; no string at all means LUN 0.
    pub fn parse(lun: Option<&str>) -> Result<Self> {
        lun.map_or(Ok(Self::default()), str::parse)
    }
}

impl FromStr for ScsiLun {
    type Err = Error;

    /// Parse up to four hex components separated by `-`, e.g. `1-0-2`.
    /// Missing trailing components are zero.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidLun(s.to_owned());
        let mut components = [0; 4];
        let mut parts = s.split('-');

        for component in &mut components {
            let Some(part) = parts.next() else {
                break;
            };
            // from_str_radix would also take a leading '+'
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *component = u16::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self(components))
    }
}

impl fmt::Display for ScsiLun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a:04x}-{b:04x}-{c:04x}-{d:04x}")
    }
}
