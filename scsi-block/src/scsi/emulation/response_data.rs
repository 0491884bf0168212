// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Helpers for writing response data.

use std::{
    cmp::min,
    io::{self, Write},
};

/// A wrapper around a `Write` that silently truncates its input after a given
/// number of bytes. This matches the semantics of SCSI's ALLOCATION LENGTH
/// field; anything beyond the allocation length is silently omitted.
pub struct SilentlyTruncate<W: Write>(W, usize);

impl<W: Write> SilentlyTruncate<W> {
    pub fn new(writer: W, len: usize) -> Self {
        Self(writer, len)
    }
}

impl<W: Write> Write for SilentlyTruncate<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.1 == 0 {
            // once we've stopped actually writing, pretend all writes work
            return Ok(buf.len());
        }
        let len = min(buf.len(), self.1);
        let written = self.0.write(&buf[..len])?;
        self.1 -= written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Write READ CAPACITY (10) parameter data.
///
/// A last LBA that doesn't fit in 32 bits is reported as 0xffffffff, telling
/// the initiator to use READ CAPACITY (16).
pub fn respond_capacity_10(
    data_in: &mut impl Write,
    blocks: u64,
    block_size: u32,
) -> io::Result<()> {
    // n.b. this is the last block, ie (length-1), not length
    let final_block = u32::try_from(blocks.saturating_sub(1)).unwrap_or(u32::MAX);
    data_in.write_all(&final_block.to_be_bytes())?;
    data_in.write_all(&block_size.to_be_bytes())
}

/// Write READ CAPACITY (16) parameter data.
pub fn respond_capacity_16(
    data_in: &mut impl Write,
    blocks: u64,
    block_size: u32,
) -> io::Result<()> {
    data_in.write_all(&blocks.saturating_sub(1).to_be_bytes())?;
    data_in.write_all(&block_size.to_be_bytes())?;
    // no protection; 1-to-1 logical/physical blocks; lowest aligned LBA 0
    data_in.write_all(&[0; 4])?;
    // reserved
    data_in.write_all(&[0; 16])
}
