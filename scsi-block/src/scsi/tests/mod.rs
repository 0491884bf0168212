// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![cfg(test)]

mod loopback;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use super::{
    cdb::Cdb,
    intf::{BlockConsumer, BlockDeviceCapacity, ScsiCmd, ScsiResponse, ScsiTransport},
    sense::{SenseKey, SenseRecord},
    CloseReason, Error, Result, ScsiDevice, ScsiEndpoint, ScsiLun,
};

/// One command as the mock transport received it.
#[derive(Debug, Clone)]
struct Issued {
    tag: u32,
    endpoint: ScsiEndpoint,
    command: ScsiCmd,
}

/// A transport that records everything and completes nothing on its own.
#[derive(Default)]
struct MockTransport {
    issued: RefCell<Vec<Issued>>,
    aborted: RefCell<Vec<u32>>,
    closed: RefCell<Vec<CloseReason>>,
    capacities: RefCell<Vec<BlockDeviceCapacity>>,
    window: Cell<usize>,
    max_count: Cell<Option<u32>>,
    fail: RefCell<Option<Error>>,
    next_tag: Cell<u32>,
}

impl MockTransport {
    fn new(window: usize) -> Rc<Self> {
        let transport = Self::default();
        transport.window.set(window);
        transport.next_tag.set(0x100);
        Rc::new(transport)
    }

    fn fail_with(&self, e: Option<Error>) {
        *self.fail.borrow_mut() = e;
    }

    fn issued(&self) -> Vec<Issued> {
        self.issued.borrow().clone()
    }

    fn last(&self) -> Issued {
        self.issued.borrow().last().cloned().unwrap()
    }

    fn cdbs(&self) -> Vec<Cdb> {
        self.issued.borrow().iter().map(|i| i.command.cdb).collect()
    }

    fn aborted(&self) -> Vec<u32> {
        self.aborted.borrow().clone()
    }

    fn closed(&self) -> Vec<CloseReason> {
        self.closed.borrow().clone()
    }
}

impl ScsiTransport for MockTransport {
    fn command(&self, endpoint: ScsiEndpoint, command: &ScsiCmd) -> Result<u32> {
        if let Some(e) = self.fail.borrow().clone() {
            return Err(e);
        }
        let tag = self.next_tag.get();
        self.next_tag.set(tag + 1);
        self.issued.borrow_mut().push(Issued {
            tag,
            endpoint,
            command: command.clone(),
        });
        Ok(tag)
    }

    fn window(&self) -> usize {
        self.window.get()
    }

    fn capacity(&self, capacity: &mut BlockDeviceCapacity) {
        self.capacities.borrow_mut().push(*capacity);
        if let Some(max_count) = self.max_count.get() {
            capacity.max_count = max_count;
        }
    }

    fn close_command(&self, tag: u32, _reason: &CloseReason) {
        self.aborted.borrow_mut().push(tag);
    }

    fn close(&self, reason: &CloseReason) {
        self.closed.borrow_mut().push(reason.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    WindowChanged,
    Capacity(BlockDeviceCapacity),
    Close(CloseReason),
}

/// A block consumer that records what it is told.
#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
}

impl Recorder {
    fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    fn closes(&self) -> Vec<CloseReason> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Close(reason) => Some(reason.clone()),
                _ => None,
            })
            .collect()
    }
}

impl BlockConsumer for Recorder {
    fn window_changed(&self) {
        self.events.borrow_mut().push(Event::WindowChanged);
    }

    fn capacity(&self, capacity: &BlockDeviceCapacity) {
        self.events.borrow_mut().push(Event::Capacity(*capacity));
    }

    fn close(&self, reason: &CloseReason) {
        self.events.borrow_mut().push(Event::Close(reason.clone()));
    }
}

fn open(window: usize) -> (Rc<MockTransport>, Rc<Recorder>, Rc<ScsiDevice>) {
    let transport = MockTransport::new(window);
    let block = Recorder::new();
    let device = ScsiDevice::open(block.clone(), transport.clone(), ScsiLun::default());
    (transport, block, device)
}

/// Run the readiness probe to success.
fn make_ready(transport: &MockTransport, device: &Rc<ScsiDevice>) {
    device.step();
    let probe = transport.last();
    assert_eq!(probe.command.cdb, Cdb::TestUnitReady);
    probe.endpoint.response(&ScsiResponse::good());
    assert!(device.is_ready());
}

fn check_condition(key: SenseKey, additional: u16) -> ScsiResponse {
    ScsiResponse {
        status: 0x02,
        overrun: 0,
        sense: SenseRecord {
            code: 0x70,
            key: key.into(),
            additional,
        },
    }
}
