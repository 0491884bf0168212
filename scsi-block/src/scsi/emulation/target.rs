// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::io;

use log::{debug, error, warn};

use super::{
    backend::BlockDeviceBackend,
    response_data::{respond_capacity_10, respond_capacity_16, SilentlyTruncate},
};
use crate::scsi::{
    cdb::{Cdb, ParseError, CAPACITY_10_LEN},
    lun::ScsiLun,
    sense::{self, SenseTriple},
};

/// CHECK CONDITION
const CHECK_CONDITION: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOutput {
    pub status: u8,
    pub sense: Vec<u8>,
    /// Bytes the command wanted to move beyond the buffer (positive) or
    /// short of filling it (negative).
    pub overrun: isize,
}

impl CmdOutput {
    pub const fn ok() -> Self {
        Self {
            status: 0,
            sense: Vec::new(),
            overrun: 0,
        }
    }

    const fn with_overrun(overrun: isize) -> Self {
        Self {
            status: 0,
            sense: Vec::new(),
            overrun,
        }
    }
}

/// Which sense data format the target reports conditions in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SenseFormat {
    #[default]
    Fixed,
    Descriptor,
}

pub struct Request<'a> {
    pub lun: ScsiLun,
    pub cdb: &'a [u8],
    pub data_in: &'a mut [u8],
    pub data_out: &'a [u8],
}

/// A single-LUN direct-access target.
pub struct EmulatedTarget {
    backend: Box<dyn BlockDeviceBackend>,
    lun: ScsiLun,
    write_protected: bool,
    sense_format: SenseFormat,
    /// TEST UNIT READY probes still to be answered with NOT READY
    becoming_ready: u32,
}

impl EmulatedTarget {
    pub fn new(backend: Box<dyn BlockDeviceBackend>) -> Self {
        Self {
            backend,
            lun: ScsiLun::default(),
            write_protected: false,
            sense_format: SenseFormat::default(),
            becoming_ready: 0,
        }
    }

    pub fn set_lun(&mut self, lun: ScsiLun) {
        self.lun = lun;
    }

    pub fn set_write_protected(&mut self, write_protected: bool) {
        self.write_protected = write_protected;
    }

    pub fn set_sense_format(&mut self, sense_format: SenseFormat) {
        self.sense_format = sense_format;
    }

    /// Report LOGICAL UNIT IS IN PROCESS OF BECOMING READY to the next
    /// `probes` TEST UNIT READY commands.
    pub fn set_becoming_ready(&mut self, probes: u32) {
        self.becoming_ready = probes;
    }

    pub fn backend(&mut self) -> &mut dyn BlockDeviceBackend {
        &mut *self.backend
    }

    fn check_condition(&self, sense: SenseTriple) -> CmdOutput {
        CmdOutput {
            status: CHECK_CONDITION,
            sense: match self.sense_format {
                SenseFormat::Fixed => sense.to_fixed_sense(),
                SenseFormat::Descriptor => sense.to_descriptor_sense(),
            },
            overrun: 0,
        }
    }

    pub fn execute_command(&mut self, req: Request<'_>) -> CmdOutput {
        let cdb = match Cdb::parse(req.cdb) {
            Ok(cdb) => cdb,
            Err(ParseError::InvalidCommand) => {
                warn!("Rejecting CDB for unknown command: {:02x?}", req.cdb);
                return self.check_condition(sense::INVALID_COMMAND_OPERATION_CODE);
            }
            // TODO: SPC has a specific sense code for a CDB too short for its
            // opcode; INVALID FIELD IN CDB is the closest one we have here
            Err(ParseError::InvalidField | ParseError::TooSmall) => {
                warn!("Rejecting invalid CDB: {:02x?}", req.cdb);
                return self.check_condition(sense::INVALID_FIELD_IN_CDB);
            }
        };

        if req.lun != self.lun {
            debug!("Command for missing LUN {}", req.lun);
            return self.check_condition(sense::LOGICAL_UNIT_NOT_SUPPORTED);
        }

        debug!("Incoming command: {:?}", cdb);

        match cdb {
            Cdb::TestUnitReady => {
                if self.becoming_ready > 0 {
                    self.becoming_ready -= 1;
                    return self.check_condition(sense::LOGICAL_UNIT_BECOMING_READY);
                }
                CmdOutput::ok()
            }
            Cdb::ReadCapacity10 => self.read_capacity(req.data_in, CAPACITY_10_LEN, false),
            Cdb::ReadCapacity16 { len } => self.read_capacity(
                req.data_in,
                usize::try_from(len).unwrap_or(usize::MAX),
                true,
            ),
            Cdb::Read10 { lba, len } => self.read(lba.into(), len.into(), req.data_in),
            Cdb::Read16 { lba, len } => self.read(lba, u64::from(len), req.data_in),
            Cdb::Write10 { lba, len } => self.write(lba.into(), len.into(), req.data_out),
            Cdb::Write16 { lba, len } => self.write(lba, u64::from(len), req.data_out),
        }
    }

    fn read_capacity(
        &mut self,
        data_in: &mut [u8],
        allocation_length: usize,
        use16: bool,
    ) -> CmdOutput {
        let blocks = match self.backend.size_in_blocks() {
            Ok(blocks) => blocks,
            Err(e) => {
                error!("Error getting image size: {}", e);
                return self.check_condition(sense::UNRECOVERED_READ_ERROR);
            }
        };
        let block_size = self.backend.block_size();

        let limit = allocation_length.min(data_in.len());
        let mut data_in = SilentlyTruncate::new(data_in, limit);
        let written = if use16 {
            respond_capacity_16(&mut data_in, blocks, block_size)
        } else {
            respond_capacity_10(&mut data_in, blocks, block_size)
        };
        match written {
            Ok(()) => CmdOutput::ok(),
            Err(e) => {
                error!("Error writing capacity: {}", e);
                self.check_condition(sense::UNRECOVERED_READ_ERROR)
            }
        }
    }

    /// Byte offset and length of a transfer, if it lies within the medium.
    fn extent(&mut self, lba: u64, blocks: u64) -> io::Result<Option<(u64, u64)>> {
        let size = self.backend.size_in_blocks()?;
        let block_size = u64::from(self.backend.block_size());
        match lba.checked_add(blocks) {
            Some(end) if end <= size => Ok(Some((lba * block_size, blocks * block_size))),
            _ => Ok(None),
        }
    }

    fn read(&mut self, lba: u64, blocks: u64, data_in: &mut [u8]) -> CmdOutput {
        let (offset, wanted) = match self.extent(lba, blocks) {
            Ok(Some(extent)) => extent,
            Ok(None) => return self.check_condition(sense::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE),
            Err(e) => {
                error!("Error getting image size for read: {}", e);
                return self.check_condition(sense::UNRECOVERED_READ_ERROR);
            }
        };

        let len = data_in.len().min(usize::try_from(wanted).unwrap_or(usize::MAX));
        if let Err(e) = self.backend.read_exact_at(&mut data_in[..len], offset) {
            error!("Error reading image: {}", e);
            return self.check_condition(sense::UNRECOVERED_READ_ERROR);
        }

        CmdOutput::with_overrun(residual(wanted, data_in.len()))
    }

    fn write(&mut self, lba: u64, blocks: u64, data_out: &[u8]) -> CmdOutput {
        if self.write_protected {
            return self.check_condition(sense::WRITE_PROTECTED);
        }

        let (offset, wanted) = match self.extent(lba, blocks) {
            Ok(Some(extent)) => extent,
            Ok(None) => return self.check_condition(sense::LOGICAL_BLOCK_ADDRESS_OUT_OF_RANGE),
            Err(e) => {
                error!("Error getting image size for write: {}", e);
                return self.check_condition(sense::WRITE_ERROR);
            }
        };

        let len = data_out.len().min(usize::try_from(wanted).unwrap_or(usize::MAX));
        if let Err(e) = self.backend.write_exact_at(&data_out[..len], offset) {
            error!("Error writing image: {}", e);
            return self.check_condition(sense::WRITE_ERROR);
        }

        CmdOutput::with_overrun(residual(wanted, data_out.len()))
    }
}

fn residual(wanted: u64, buffer: usize) -> isize {
    let wanted = i128::from(wanted);
    let buffer = i128::try_from(buffer).unwrap_or(i128::MAX);
    isize::try_from(wanted - buffer).unwrap_or(if wanted > buffer {
        isize::MAX
    } else {
        isize::MIN
    })
}
