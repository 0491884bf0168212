// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! The contract between this layer and its neighbours.
//!
//! Upstream is a block consumer, downstream a SCSI transport. Both are
//! traits whose methods default to the behaviour of an unconnected endpoint:
//! notifications are ignored, and issuing a command fails.

use std::{
    cell::{Ref, RefCell, RefMut},
    fmt,
    rc::Rc,
};

use super::{cdb::Cdb, command::ScsiEndpoint, lun::ScsiLun, sense::SenseRecord};
use super::{CloseReason, Error, Result};

/// Geometry reported by READ CAPACITY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDeviceCapacity {
    /// Total number of blocks.
    pub blocks: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Maximum number of blocks per transfer.
    pub max_count: u32,
}

/// The consumer side of a device or of a single block operation.
pub trait BlockConsumer {
    /// The device's flow-control window may have changed.
    fn window_changed(&self) {}

    /// A READ CAPACITY completed with this geometry.
    fn capacity(&self, _capacity: &BlockDeviceCapacity) {}

    /// The operation (or device) is finished.
    fn close(&self, _reason: &CloseReason) {}
}

/// A SCSI transport, e.g. iSCSI, SRP or a host bus adapter.
pub trait ScsiTransport {
    /// Issue a command, returning its tag.
    ///
    /// The response is delivered later through `endpoint`. Issuing must not
    /// complete the command synchronously.
    fn command(&self, _endpoint: ScsiEndpoint, _command: &ScsiCmd) -> Result<u32> {
        Err(Error::NotSupported)
    }

    /// How many more commands the transport will accept right now.
    fn window(&self) -> usize {
        0
    }

    /// A READ CAPACITY through this transport completed.
    ///
    /// The transport may update the geometry, typically to lower
    /// `max_count`, before the consumer sees it.
    fn capacity(&self, _capacity: &mut BlockDeviceCapacity) {}

    /// The command issued as `tag` was closed before the transport finished
    /// with it.
    fn close_command(&self, _tag: u32, _reason: &CloseReason) {}

    /// The device using this transport has closed.
    fn close(&self, _reason: &CloseReason) {}
}

/// A shared data buffer, filled by the transport for data-in transfers and
/// drained by it for data-out transfers.
#[derive(Clone, Default)]
pub struct DataBuffer(Rc<RefCell<Vec<u8>>>);

impl DataBuffer {
    /// A zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from(vec![0; len])
    }

    /// Like `new`, but allocation failure is an error.
    pub fn try_new(len: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| Error::NoMemory)?;
        data.resize(len, 0);
        Ok(Self::from(data))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn borrow(&self) -> Ref<'_, [u8]> {
        Ref::map(self.0.borrow(), Vec::as_slice)
    }

    pub fn borrow_mut(&self) -> RefMut<'_, [u8]> {
        RefMut::map(self.0.borrow_mut(), Vec::as_mut_slice)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self(Rc::new(RefCell::new(data)))
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataBuffer({} bytes)", self.len())
    }
}

/// A command as handed to the transport.
#[derive(Debug, Clone)]
pub struct ScsiCmd {
    pub lun: ScsiLun,
    pub cdb: Cdb,
    pub data_in: Option<DataBuffer>,
    pub data_in_len: usize,
    pub data_out: Option<DataBuffer>,
    pub data_out_len: usize,
}

impl ScsiCmd {
    pub fn new(lun: ScsiLun, cdb: Cdb) -> Self {
        Self {
            lun,
            cdb,
            data_in: None,
            data_in_len: 0,
            data_out: None,
            data_out_len: 0,
        }
    }

    #[must_use]
    pub fn with_data_in(mut self, buffer: Option<DataBuffer>, len: usize) -> Self {
        self.data_in = buffer;
        self.data_in_len = len;
        self
    }

    #[must_use]
    pub fn with_data_out(mut self, buffer: Option<DataBuffer>, len: usize) -> Self {
        self.data_out = buffer;
        self.data_out_len = len;
        self
    }
}

/// A response as reported by the transport.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScsiResponse {
    /// SCSI status; zero is GOOD.
    pub status: u8,
    /// Bytes of data beyond the buffer (positive) or short of it (negative).
    pub overrun: isize,
    pub sense: SenseRecord,
}

impl ScsiResponse {
    pub const fn good() -> Self {
        Self {
            status: 0,
            overrun: 0,
            sense: SenseRecord {
                code: 0,
                key: 0,
                additional: 0,
            },
        }
    }
}
