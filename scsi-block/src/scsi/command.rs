// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! In-flight SCSI commands.
//!
//! A `ScsiCommand` is created for every block operation. It keeps its device
//! alive, is listed (weakly) on the device until it is closed, and is driven
//! to completion by responses arriving through its `ScsiEndpoint`. What CDB
//! gets sent and what happens on completion is decided by its
//! `CommandType`.

use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use log::debug;

use super::{
    cdb::{Cdb, CAPACITY_10_LEN, CAPACITY_16_LEN},
    device::ScsiDevice,
    intf::{BlockConsumer, BlockDeviceCapacity, DataBuffer, ScsiCmd, ScsiResponse, ScsiTransport},
    lun::ScsiLun,
    CloseReason, Error, Result,
};

/// Behaviour shared by all commands of one kind.
pub trait CommandType {
    fn name(&self) -> &'static str;

    /// Allocate the per-command working space this type needs.
    fn private(&self) -> Result<CommandPrivate> {
        Ok(CommandPrivate::None)
    }

    /// Construct the command to hand to the transport.
    ///
    /// Called on every issue, so anything derived from the command's state
    /// is re-evaluated when a command is re-issued.
    fn build(&self, command: &ScsiCommand) -> ScsiCmd;

    /// Handle completion (successful or not) of the command.
    fn done(&self, command: &Rc<ScsiCommand>, reason: CloseReason) {
        command.close(reason);
    }
}

/// Per-command working space, sized by the command type.
#[derive(Debug)]
pub enum CommandPrivate {
    None,
    ReadCapacity(ReadCapacityPrivate),
}

#[derive(Debug)]
pub struct ReadCapacityPrivate {
    /// Use READ CAPACITY (16)
    use16: bool,
    /// Parameter data for either READ CAPACITY variant
    capacity: DataBuffer,
}

impl ReadCapacityPrivate {
    /// Decode the returned parameter data; `None` when READ CAPACITY (10)
    /// could not represent the last LBA.
    fn extract(&self) -> Option<BlockDeviceCapacity> {
        let data = self.capacity.borrow();
        let be32 = |at: usize| {
            let mut raw = [0; 4];
            raw.copy_from_slice(&data[at..at + 4]);
            u32::from_be_bytes(raw)
        };

        let (blocks, block_size) = if self.use16 {
            let mut raw = [0; 8];
            raw.copy_from_slice(&data[0..8]);
            (u64::from_be_bytes(raw).wrapping_add(1), be32(8))
        } else {
            let lba = be32(0);
            if lba == u32::MAX {
                return None;
            }
            (u64::from(lba) + 1, be32(4))
        };

        Some(BlockDeviceCapacity {
            blocks,
            block_size,
            max_count: u32::MAX,
        })
    }
}

pub struct ReadCommand;
pub struct WriteCommand;
pub struct ReadCapacityCommand;
pub struct TestUnitReadyCommand;

pub static READ: ReadCommand = ReadCommand;
pub static WRITE: WriteCommand = WriteCommand;
pub static READ_CAPACITY: ReadCapacityCommand = ReadCapacityCommand;
pub static TEST_UNIT_READY: TestUnitReadyCommand = TestUnitReadyCommand;

impl CommandType for ReadCommand {
    fn name(&self) -> &'static str {
        "READ"
    }

    fn build(&self, command: &ScsiCommand) -> ScsiCmd {
        ScsiCmd::new(command.lun(), Cdb::read(command.lba, command.count))
            .with_data_in(command.buffer.clone(), command.len)
    }
}

impl CommandType for WriteCommand {
    fn name(&self) -> &'static str {
        "WRITE"
    }

    fn build(&self, command: &ScsiCommand) -> ScsiCmd {
        ScsiCmd::new(command.lun(), Cdb::write(command.lba, command.count))
            .with_data_out(command.buffer.clone(), command.len)
    }
}

impl CommandType for ReadCapacityCommand {
    fn name(&self) -> &'static str {
        "READ CAPACITY"
    }

    fn private(&self) -> Result<CommandPrivate> {
        Ok(CommandPrivate::ReadCapacity(ReadCapacityPrivate {
            use16: false,
            capacity: DataBuffer::try_new(CAPACITY_16_LEN)?,
        }))
    }

    fn build(&self, command: &ScsiCommand) -> ScsiCmd {
        let private = command.private.borrow();
        let CommandPrivate::ReadCapacity(private) = &*private else {
            unreachable!("READ CAPACITY command without its private data");
        };

        if private.use16 {
            ScsiCmd::new(
                command.lun(),
                Cdb::ReadCapacity16 {
                    len: CAPACITY_16_LEN as u32,
                },
            )
            .with_data_in(Some(private.capacity.clone()), CAPACITY_16_LEN)
        } else {
            ScsiCmd::new(command.lun(), Cdb::ReadCapacity10)
                .with_data_in(Some(private.capacity.clone()), CAPACITY_10_LEN)
        }
    }

    fn done(&self, command: &Rc<ScsiCommand>, reason: CloseReason) {
        if reason.is_err() {
            command.close(reason);
            return;
        }

        let capacity = match &mut *command.private.borrow_mut() {
            CommandPrivate::ReadCapacity(private) => {
                let capacity = private.extract();
                if capacity.is_none() {
                    // The last LBA didn't fit in 32 bits. READ CAPACITY (16)
                    // is optional, so it is only tried once (10) has told us
                    // it is needed.
                    private.use16 = true;
                }
                capacity
            }
            CommandPrivate::None => unreachable!("READ CAPACITY command without its private data"),
        };

        let Some(mut capacity) = capacity else {
            if let Err(e) = command.issue() {
                command.close(Err(e));
            }
            return;
        };

        debug!(
            "SCSI {} capacity is {} blocks of {} bytes",
            command.lun(),
            capacity.blocks,
            capacity.block_size
        );

        // The transport may impose its own limits
        if let Some(transport) = command.device.transport() {
            transport.capacity(&mut capacity);
        }
        let block = command.block.borrow().clone();
        if let Some(block) = block {
            block.capacity(&capacity);
        }

        command.close(Ok(()));
    }
}

impl CommandType for TestUnitReadyCommand {
    fn name(&self) -> &'static str {
        "TEST UNIT READY"
    }

    fn build(&self, command: &ScsiCommand) -> ScsiCmd {
        ScsiCmd::new(command.lun(), Cdb::TestUnitReady)
    }
}

/// One SCSI command, from issue until close.
pub struct ScsiCommand {
    device: Rc<ScsiDevice>,
    ty: &'static dyn CommandType,
    lba: u64,
    count: u32,
    buffer: Option<DataBuffer>,
    len: usize,
    tag: Cell<Option<u32>>,
    private: RefCell<CommandPrivate>,
    /// Consumer waiting for this command
    block: RefCell<Option<Rc<dyn BlockConsumer>>>,
    /// Transport the current issue went to
    scsi: RefCell<Option<Rc<dyn ScsiTransport>>>,
    /// Bumped on every issue, so endpoints from earlier issues go inert
    connection: Cell<u64>,
    /// Still on the device's command list
    linked: Cell<bool>,
}

impl ScsiCommand {
    /// Create a command, link it to `device` and issue it.
    ///
    /// On failure nothing is left on the device's list and `block` is never
    /// notified; the error is only returned.
    pub fn create(
        device: &Rc<ScsiDevice>,
        block: Rc<dyn BlockConsumer>,
        ty: &'static dyn CommandType,
        lba: u64,
        count: u32,
        buffer: Option<DataBuffer>,
        len: usize,
    ) -> Result<Rc<Self>> {
        let private = ty.private()?;
        let command = Rc::new(Self {
            device: Rc::clone(device),
            ty,
            lba,
            count,
            buffer,
            len,
            tag: Cell::new(None),
            private: RefCell::new(private),
            block: RefCell::new(None),
            scsi: RefCell::new(None),
            connection: Cell::new(0),
            linked: Cell::new(true),
        });
        device.link(&command);

        if let Err(e) = command.issue() {
            command.close(Err(e.clone()));
            return Err(e);
        }

        *command.block.borrow_mut() = Some(block);
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        self.ty.name()
    }

    pub fn lun(&self) -> ScsiLun {
        self.device.lun()
    }

    pub const fn lba(&self) -> u64 {
        self.lba
    }

    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Tag of the most recent issue.
    pub fn tag(&self) -> Option<u32> {
        self.tag.get()
    }

    pub fn device(&self) -> &Rc<ScsiDevice> {
        &self.device
    }

    /// Whether the command has not yet been closed.
    pub fn is_open(&self) -> bool {
        self.linked.get()
    }

    /// Build the command and hand it to the device's transport.
    fn issue(self: &Rc<Self>) -> Result<()> {
        let lun = self.lun();
        let command = self.ty.build(self);

        let Some(transport) = self.device.transport() else {
            debug!("SCSI {lun} could not issue command: {}", Error::NotSupported);
            return Err(Error::NotSupported);
        };

        let connection = self.connection.get().wrapping_add(1);
        self.connection.set(connection);
        *self.scsi.borrow_mut() = Some(Rc::clone(&transport));
        let endpoint = ScsiEndpoint {
            command: Rc::clone(self),
            connection,
        };

        let tag = match transport.command(endpoint, &command) {
            Ok(tag) => tag,
            Err(e) => {
                let _ = self.scsi.borrow_mut().take();
                debug!("SCSI {lun} could not issue command: {e}");
                return Err(e);
            }
        };

        if let Some(old) = self.tag.replace(Some(tag)) {
            debug!("SCSI {lun} tag {old:08x} is now tag {tag:08x}");
        }
        debug!(
            "SCSI {lun} tag {tag:08x} {} {}",
            self.ty.name(),
            command.cdb
        );

        Ok(())
    }

    fn response(self: &Rc<Self>, response: &ScsiResponse) {
        if response.status == 0 {
            self.done(Ok(()));
            return;
        }

        let residual = match response.overrun {
            0 => String::new(),
            n if n > 0 => format!(" overrun +{n}"),
            n => format!(" underrun -{}", n.unsigned_abs()),
        };
        debug!(
            "SCSI {} tag {:08x} status {:02x}{residual} sense {:02x} key {:02x} additional {:04x}",
            self.lun(),
            self.tag().unwrap_or_default(),
            response.status,
            response.sense.response_code(),
            u8::from(response.sense.sense_key()),
            response.sense.additional,
        );

        self.done(Err(Error::Sense(response.sense.sense_key())));
    }

    fn done(self: &Rc<Self>, reason: CloseReason) {
        // The transport is finished with this issue
        let _ = self.scsi.borrow_mut().take();

        self.ty.done(self, reason);
    }

    /// Close the command: take it off the device's list, then tell the
    /// transport (if the command is still outstanding there) and the
    /// consumer. Closing an already closed command does nothing.
    pub fn close(&self, reason: CloseReason) {
        if !self.linked.replace(false) {
            return;
        }

        if let Err(e) = &reason {
            debug!(
                "SCSI {} tag {:08x} closed: {e}",
                self.lun(),
                self.tag().unwrap_or_default()
            );
        }

        self.device.unlink(self);

        let scsi = self.scsi.borrow_mut().take();
        if let (Some(transport), Some(tag)) = (scsi, self.tag()) {
            transport.close_command(tag, &reason);
        }

        let block = self.block.borrow_mut().take();
        if let Some(block) = block {
            block.close(&reason);
        }
    }
}

impl fmt::Debug for ScsiCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiCommand")
            .field("type", &self.ty.name())
            .field("lba", &self.lba)
            .field("count", &self.count)
            .field("len", &self.len)
            .field("tag", &self.tag.get())
            .field("open", &self.linked.get())
            .finish_non_exhaustive()
    }
}

/// The transport's handle on one issue of a command.
///
/// Once the command has completed, been closed or been re-issued, the
/// handle is inert: responses and closes through it are ignored.
#[derive(Clone)]
pub struct ScsiEndpoint {
    command: Rc<ScsiCommand>,
    connection: u64,
}

impl ScsiEndpoint {
    pub fn is_connected(&self) -> bool {
        self.command.connection.get() == self.connection && self.command.scsi.borrow().is_some()
    }

    pub fn command(&self) -> &Rc<ScsiCommand> {
        &self.command
    }

    /// Deliver the command's response.
    pub fn response(&self, response: &ScsiResponse) {
        if self.is_connected() {
            self.command.response(response);
        }
    }

    /// The transport gave up on the command without a response.
    pub fn close(&self, reason: CloseReason) {
        if self.is_connected() {
            self.command.done(reason);
        }
    }
}

impl fmt::Debug for ScsiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiEndpoint")
            .field("command", &self.command)
            .field("connected", &self.is_connected())
            .finish()
    }
}
