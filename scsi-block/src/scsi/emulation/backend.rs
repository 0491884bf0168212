// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::File,
    io::{self, ErrorKind},
    os::unix::prelude::*,
};

/// Default logical block size of emulated media.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Storage behind an emulated logical unit.
pub trait BlockDeviceBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_exact_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    fn size_in_blocks(&mut self) -> io::Result<u64>;
    fn block_size(&self) -> u32;
}

pub struct FileBackend {
    file: File,
    block_size: u32,
}

impl FileBackend {
    pub fn new(file: File) -> Self {
        Self {
            file,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl BlockDeviceBackend for FileBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_exact_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    fn size_in_blocks(&mut self) -> io::Result<u64> {
        // A trailing partial block is not addressable
        Ok(self.file.metadata()?.len() / u64::from(self.block_size))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}

/// A RAM disk.
pub struct MemoryBackend {
    data: Vec<u8>,
    block_size: u32,
}

impl MemoryBackend {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn zeroed(blocks: usize) -> Self {
        Self::new(vec![0; blocks * DEFAULT_BLOCK_SIZE as usize])
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= self.data.len())
            .ok_or_else(|| io::Error::from(ErrorKind::UnexpectedEof))
    }
}

impl BlockDeviceBackend for MemoryBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_exact_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn size_in_blocks(&mut self) -> io::Result<u64> {
        Ok(self.data.len() as u64 / u64::from(self.block_size))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}
