// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! SCSI devices: one logical unit behind one transport.

use std::{
    cell::{Cell, RefCell},
    fmt, ptr,
    rc::{Rc, Weak},
};

use log::{debug, error, info, warn};

use super::{
    command::{ScsiCommand, READ, READ_CAPACITY, TEST_UNIT_READY, WRITE},
    intf::{BlockConsumer, DataBuffer, ScsiTransport},
    lun::ScsiLun,
    CloseReason, Result,
};

/// Number of failed TEST UNIT READY probes after which the device gives up.
pub const READY_MAX_RETRIES: u32 = 10;

/// Progress of the readiness task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// No TEST UNIT READY outstanding; the next step will send one.
    Untested,
    /// TEST UNIT READY sent, waiting for it to complete.
    ProbeSent,
    /// The unit answered TEST UNIT READY successfully.
    Ready,
    /// The device is closed.
    Closed,
}

/// A SCSI device.
///
/// Block operations are accepted at any time, but the flow-control window
/// stays shut until a TEST UNIT READY has succeeded. Readiness is established
/// by a polled task: the host calls [`ScsiDevice::step`] periodically, and
/// the transport calls [`ScsiDevice::window_changed`] when its window opens.
pub struct ScsiDevice {
    lun: ScsiLun,
    state: Cell<ReadinessState>,
    /// Failed readiness probes so far
    retries: Cell<u32>,
    /// Block consumer
    block: RefCell<Option<Rc<dyn BlockConsumer>>>,
    /// SCSI transport
    scsi: RefCell<Option<Rc<dyn ScsiTransport>>>,
    /// Outstanding TEST UNIT READY
    ready: RefCell<Weak<ScsiCommand>>,
    /// Live commands; the commands own the device, not the other way round
    commands: RefCell<Vec<Weak<ScsiCommand>>>,
}

/// Receives completion of the readiness probe on the device's behalf.
struct ReadyEndpoint(Weak<ScsiDevice>);

impl BlockConsumer for ReadyEndpoint {
    fn close(&self, reason: &CloseReason) {
        if let Some(device) = self.0.upgrade() {
            device.ready_done(reason.clone());
        }
    }
}

impl ScsiDevice {
    /// Open a device for `lun` on `scsi`, on behalf of `block`.
    ///
    /// Returns immediately; the device starts out untested.
    pub fn open(
        block: Rc<dyn BlockConsumer>,
        scsi: Rc<dyn ScsiTransport>,
        lun: ScsiLun,
    ) -> Rc<Self> {
        let device = Rc::new(Self {
            lun,
            state: Cell::new(ReadinessState::Untested),
            retries: Cell::new(0),
            block: RefCell::new(Some(block)),
            scsi: RefCell::new(Some(scsi)),
            ready: RefCell::new(Weak::new()),
            commands: RefCell::new(Vec::new()),
        });
        debug!("SCSI {lun} created");
        device
    }

    pub const fn lun(&self) -> ScsiLun {
        self.lun
    }

    pub fn state(&self) -> ReadinessState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    pub fn retries(&self) -> u32 {
        self.retries.get()
    }

    /// Number of commands not yet closed.
    pub fn outstanding(&self) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|command| command.strong_count() > 0)
            .count()
    }

    pub(crate) fn transport(&self) -> Option<Rc<dyn ScsiTransport>> {
        self.scsi.borrow().clone()
    }

    pub(crate) fn link(&self, command: &Rc<ScsiCommand>) {
        let mut commands = self.commands.borrow_mut();
        // Commands dropped by their transport without ever being closed
        commands.retain(|command| command.strong_count() > 0);
        commands.push(Rc::downgrade(command));
    }

    pub(crate) fn unlink(&self, command: &ScsiCommand) {
        self.commands
            .borrow_mut()
            .retain(|linked| !ptr::eq(linked.as_ptr(), command));
    }

    /// Read `count` blocks from `lba` into `buffer`.
    pub fn read(
        self: &Rc<Self>,
        block: Rc<dyn BlockConsumer>,
        lba: u64,
        count: u32,
        buffer: DataBuffer,
        len: usize,
    ) -> Result<Rc<ScsiCommand>> {
        ScsiCommand::create(self, block, &READ, lba, count, Some(buffer), len)
    }

    /// Write `count` blocks at `lba` from `buffer`.
    pub fn write(
        self: &Rc<Self>,
        block: Rc<dyn BlockConsumer>,
        lba: u64,
        count: u32,
        buffer: DataBuffer,
        len: usize,
    ) -> Result<Rc<ScsiCommand>> {
        ScsiCommand::create(self, block, &WRITE, lba, count, Some(buffer), len)
    }

    /// Read the device capacity; `block` gets a `capacity` call before its
    /// `close`.
    pub fn read_capacity(
        self: &Rc<Self>,
        block: Rc<dyn BlockConsumer>,
    ) -> Result<Rc<ScsiCommand>> {
        ScsiCommand::create(self, block, &READ_CAPACITY, 0, 0, None, 0)
    }

    /// Flow-control window: shut until the unit is known to be ready.
    pub fn window(&self) -> usize {
        if !self.is_ready() {
            return 0;
        }
        self.transport().map_or(0, |scsi| scsi.window())
    }

    /// Readiness task step.
    pub fn step(self: &Rc<Self>) {
        // Nothing to do unless a probe is due
        if self.state() != ReadinessState::Untested {
            return;
        }

        // Wait until the transport can take the probe
        if self.transport().map_or(0, |scsi| scsi.window()) == 0 {
            return;
        }

        debug!("SCSI {} waiting for unit to become ready", self.lun);
        self.state.set(ReadinessState::ProbeSent);

        let endpoint = Rc::new(ReadyEndpoint(Rc::downgrade(self)));
        match ScsiCommand::create(self, endpoint, &TEST_UNIT_READY, 0, 0, None, 0) {
            Ok(command) => *self.ready.borrow_mut() = Rc::downgrade(&command),
            Err(e) => self.close(Err(e)),
        }
    }

    /// The transport's window may have opened.
    pub fn window_changed(self: &Rc<Self>) {
        self.step();
    }

    fn ready_done(&self, reason: CloseReason) {
        if self.state() != ReadinessState::ProbeSent {
            return;
        }
        *self.ready.borrow_mut() = Weak::new();

        let e = match reason {
            Ok(()) => {
                info!("SCSI {} unit is ready", self.lun);
                self.state.set(ReadinessState::Ready);
                let block = self.block.borrow().clone();
                if let Some(block) = block {
                    block.window_changed();
                }
                return;
            }
            Err(e) => e,
        };
        warn!("SCSI {} not ready: {e}", self.lun);

        // Targets like to report one-off conditions such as "power on
        // occurred", so a failed probe is retried. Only running out of
        // retries takes the whole device down.
        let retries = self.retries.get() + 1;
        self.retries.set(retries);
        if retries < READY_MAX_RETRIES {
            debug!("SCSI {} retrying (retry {retries})", self.lun);
            self.state.set(ReadinessState::Untested);
            return;
        }

        error!("SCSI {} never became ready: {e}", self.lun);
        self.close(Err(e));
    }

    /// Close the device and every command still running on it.
    pub fn close(&self, reason: CloseReason) {
        if self.state.replace(ReadinessState::Closed) == ReadinessState::Closed {
            return;
        }
        match &reason {
            Ok(()) => debug!("SCSI {} closed", self.lun),
            Err(e) => debug!("SCSI {} closed: {e}", self.lun),
        }

        let block = self.block.borrow_mut().take();
        if let Some(block) = block {
            block.close(&reason);
        }
        let scsi = self.scsi.borrow_mut().take();
        if let Some(scsi) = scsi {
            scsi.close(&reason);
        }
        let ready = self.ready.replace(Weak::new()).upgrade();
        if let Some(ready) = ready {
            ready.close(reason.clone());
        }

        // Each close unlinks the command, so walk a snapshot
        let commands: Vec<Rc<ScsiCommand>> = self
            .commands
            .borrow()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for command in commands {
            command.close(reason.clone());
        }
    }
}

impl fmt::Debug for ScsiDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScsiDevice")
            .field("lun", &self.lun)
            .field("state", &self.state.get())
            .field("retries", &self.retries.get())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}
