// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::{Rc, Weak},
};

use log::{debug, info};

use super::target::{EmulatedTarget, Request};
use crate::scsi::{
    command::ScsiEndpoint,
    device::ScsiDevice,
    intf::{BlockDeviceCapacity, ScsiCmd, ScsiResponse, ScsiTransport},
    sense::parse_sense,
    CloseReason, Error, Result,
};

struct Pending {
    tag: u32,
    endpoint: ScsiEndpoint,
    command: ScsiCmd,
}

/// A transport whose far end is an [`EmulatedTarget`] in the same process.
///
/// Issued commands are queued; nothing completes until [`poll`] runs, so
/// completions never re-enter the caller that issued the command.
///
/// [`poll`]: LoopbackTransport::poll
pub struct LoopbackTransport {
    target: RefCell<EmulatedTarget>,
    pending: RefCell<VecDeque<Pending>>,
    /// Devices told about window changes and shutdown
    devices: RefCell<Vec<Weak<ScsiDevice>>>,
    next_tag: Cell<u32>,
    window: Cell<usize>,
    open: Cell<bool>,
    capacity: Cell<Option<BlockDeviceCapacity>>,
    /// Largest transfer, in blocks, a single command may carry
    max_count: Cell<u32>,
}

impl LoopbackTransport {
    pub fn new(target: EmulatedTarget, window: usize) -> Self {
        Self {
            target: RefCell::new(target),
            pending: RefCell::new(VecDeque::new()),
            devices: RefCell::new(Vec::new()),
            next_tag: Cell::new(1),
            window: Cell::new(window),
            open: Cell::new(true),
            capacity: Cell::new(None),
            max_count: Cell::new(u32::MAX),
        }
    }

    /// Have `device` notified of window changes and shutdown.
    pub fn attach(&self, device: &Rc<ScsiDevice>) {
        self.devices.borrow_mut().push(Rc::downgrade(device));
    }

    fn attached(&self) -> Vec<Rc<ScsiDevice>> {
        let mut devices = self.devices.borrow_mut();
        devices.retain(|device| device.strong_count() > 0);
        devices.iter().filter_map(Weak::upgrade).collect()
    }

    /// Change the number of commands the transport accepts.
    pub fn set_window(&self, window: usize) {
        self.window.set(window);
        for device in self.attached() {
            device.window_changed();
        }
    }

    /// Limit the number of blocks per command reported by READ CAPACITY.
    pub fn set_max_count(&self, max_count: u32) {
        self.max_count.set(max_count);
    }

    /// Commands waiting for the next `poll`.
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Geometry from the most recent READ CAPACITY through this transport,
    /// as adjusted by it.
    pub fn reported_capacity(&self) -> Option<BlockDeviceCapacity> {
        self.capacity.get()
    }

    pub fn with_target<R>(&self, f: impl FnOnce(&mut EmulatedTarget) -> R) -> R {
        f(&mut self.target.borrow_mut())
    }

    /// Execute every command queued so far and deliver the responses.
    ///
    /// Commands issued while responses are being delivered wait for the
    /// next call. Returns the number of responses delivered.
    pub fn poll(&self) -> usize {
        let batch: Vec<Pending> = self.pending.borrow_mut().drain(..).collect();
        let mut delivered = 0;

        for Pending {
            tag,
            endpoint,
            command,
        } in batch
        {
            if !endpoint.is_connected() {
                continue;
            }

            let data_out = command.data_out.as_ref().map_or_else(Vec::new, |buffer| {
                let data = buffer.borrow();
                data[..command.data_out_len.min(data.len())].to_vec()
            });
            let mut data_in = vec![0; command.data_in_len];

            let output = self.target.borrow_mut().execute_command(Request {
                lun: command.lun,
                cdb: &command.cdb.to_bytes(),
                data_in: &mut data_in,
                data_out: &data_out,
            });

            if let Some(buffer) = &command.data_in {
                let mut data = buffer.borrow_mut();
                let len = data.len().min(data_in.len());
                data[..len].copy_from_slice(&data_in[..len]);
            }

            debug!(
                "Loopback tag {tag:08x} status {:02x} overrun {}",
                output.status, output.overrun
            );
            endpoint.response(&ScsiResponse {
                status: output.status,
                overrun: output.overrun,
                sense: parse_sense(&output.sense),
            });
            delivered += 1;
        }

        delivered
    }

    /// Take the transport down: queued commands are closed with `reason`,
    /// then every attached device is.
    pub fn shutdown(&self, reason: CloseReason) {
        if !self.open.replace(false) {
            return;
        }
        info!("Loopback transport shutting down");

        let batch: Vec<Pending> = self.pending.borrow_mut().drain(..).collect();
        for pending in batch {
            pending.endpoint.close(reason.clone());
        }
        for device in self.attached() {
            device.close(reason.clone());
        }
    }
}

impl ScsiTransport for LoopbackTransport {
    fn command(&self, endpoint: ScsiEndpoint, command: &ScsiCmd) -> Result<u32> {
        if !self.open.get() {
            return Err(Error::NotSupported);
        }

        let tag = self.next_tag.get();
        self.next_tag.set(tag.wrapping_add(1));
        self.pending.borrow_mut().push_back(Pending {
            tag,
            endpoint,
            command: command.clone(),
        });
        Ok(tag)
    }

    fn window(&self) -> usize {
        if !self.open.get() {
            return 0;
        }
        self.window.get().saturating_sub(self.pending())
    }

    fn capacity(&self, capacity: &mut BlockDeviceCapacity) {
        capacity.max_count = capacity.max_count.min(self.max_count.get());
        debug!(
            "Loopback capacity {} blocks of {} bytes, at most {} per command",
            capacity.blocks, capacity.block_size, capacity.max_count
        );
        self.capacity.set(Some(*capacity));
    }

    fn close_command(&self, tag: u32, _reason: &CloseReason) {
        debug!("Loopback tag {tag:08x} aborted");
        self.pending.borrow_mut().retain(|pending| pending.tag != tag);
    }

    fn close(&self, reason: &CloseReason) {
        match reason {
            Ok(()) => debug!("Loopback device closed"),
            Err(e) => debug!("Loopback device closed: {e}"),
        }
    }
}
