// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fs::File,
    io::{self, Write},
    os::unix::prelude::*,
    rc::Rc,
};

use assert_matches::assert_matches;
use tempfile::tempfile;

use super::{Event, Recorder};
use crate::scsi::{
    device::READY_MAX_RETRIES,
    emulation::{
        BlockDeviceBackend, EmulatedTarget, FileBackend, LoopbackTransport, MemoryBackend,
        SenseFormat,
    },
    intf::{BlockDeviceCapacity, DataBuffer, ScsiTransport},
    sense::SenseKey,
    Error, ReadinessState, ScsiDevice, ScsiLun,
};

/// 16 512-byte sectors, each filled with its own index.
fn test_image() -> File {
    let mut f = tempfile().unwrap();
    for i in 0..16u8 {
        f.write_all(&[i; 512]).unwrap();
    }
    f
}

fn attach(
    target: EmulatedTarget,
    window: usize,
) -> (Rc<LoopbackTransport>, Rc<Recorder>, Rc<ScsiDevice>) {
    let transport = Rc::new(LoopbackTransport::new(target, window));
    let block = Recorder::new();
    let device = ScsiDevice::open(block.clone(), transport.clone(), ScsiLun::default());
    transport.attach(&device);
    (transport, block, device)
}

fn bring_up(transport: &LoopbackTransport, device: &Rc<ScsiDevice>) {
    for _ in 0..=READY_MAX_RETRIES {
        device.step();
        transport.poll();
        if device.state() != ReadinessState::Untested {
            break;
        }
    }
}

#[test]
fn test_file_image() {
    let image = test_image();
    let mut check = image.try_clone().unwrap();
    let target = EmulatedTarget::new(Box::new(FileBackend::new(image)));
    let (transport, block, device) = attach(target, 4);

    bring_up(&transport, &device);
    assert!(device.is_ready());
    assert_eq!(block.events(), vec![Event::WindowChanged]);
    assert_eq!(device.window(), 4);

    let op = Recorder::new();
    device.read_capacity(op.clone()).unwrap();
    assert_eq!(transport.poll(), 1);
    let capacity = BlockDeviceCapacity {
        blocks: 16,
        block_size: 512,
        max_count: u32::MAX,
    };
    assert_eq!(op.events(), vec![Event::Capacity(capacity), Event::Close(Ok(()))]);
    assert_eq!(transport.reported_capacity(), Some(capacity));

    let op = Recorder::new();
    let buffer = DataBuffer::new(1024);
    device.read(op.clone(), 3, 2, buffer.clone(), 1024).unwrap();
    assert_eq!(transport.pending(), 1);
    assert_eq!(device.window(), 3);
    transport.poll();
    assert_eq!(op.closes(), vec![Ok(())]);
    let data = buffer.to_vec();
    assert!(data[..512].iter().all(|&b| b == 3));
    assert!(data[512..].iter().all(|&b| b == 4));

    let op = Recorder::new();
    device
        .write(op.clone(), 15, 1, DataBuffer::from(vec![0xee; 512]), 512)
        .unwrap();
    transport.poll();
    assert_eq!(op.closes(), vec![Ok(())]);
    let mut written = [0; 512];
    check.read_exact_at(&mut written, 15 * 512).unwrap();
    assert_eq!(written, [0xee; 512]);
    // nothing past the end of the image
    check.flush().unwrap();
    assert_eq!(check.metadata().unwrap().len(), 16 * 512);
}

#[test]
fn test_transfer_limit() {
    let target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(1024)));
    let (transport, _, device) = attach(target, 1);
    transport.set_max_count(64);
    bring_up(&transport, &device);

    let op = Recorder::new();
    device.read_capacity(op.clone()).unwrap();
    transport.poll();

    let capacity = BlockDeviceCapacity {
        blocks: 1024,
        block_size: 512,
        max_count: 64,
    };
    assert_eq!(op.events(), vec![Event::Capacity(capacity), Event::Close(Ok(()))]);
    assert_eq!(transport.reported_capacity(), Some(capacity));
}

#[test]
fn test_out_of_range() {
    let target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
    let (transport, _, device) = attach(target, 4);
    bring_up(&transport, &device);

    let op = Recorder::new();
    device
        .read(op.clone(), 3, 2, DataBuffer::new(1024), 1024)
        .unwrap();
    transport.poll();
    assert_eq!(op.closes(), vec![Err(Error::Sense(SenseKey::IllegalRequest))]);
    // a failed command doesn't affect the device
    assert!(device.is_ready());
}

#[test]
fn test_becoming_ready() {
    for format in [SenseFormat::Fixed, SenseFormat::Descriptor] {
        let mut target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
        target.set_becoming_ready(3);
        target.set_sense_format(format);
        let (transport, block, device) = attach(target, 1);

        bring_up(&transport, &device);

        assert!(device.is_ready());
        assert_eq!(device.retries(), 3);
        assert_eq!(block.events(), vec![Event::WindowChanged]);
    }
}

#[test]
fn test_never_ready() {
    let mut target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
    target.set_becoming_ready(u32::MAX);
    let (transport, block, device) = attach(target, 1);

    bring_up(&transport, &device);

    assert_eq!(device.state(), ReadinessState::Closed);
    assert_eq!(device.retries(), READY_MAX_RETRIES);
    assert_eq!(
        block.closes(),
        vec![Err(Error::Sense(SenseKey::NotReady))]
    );
}

#[test]
fn test_missing_lun() {
    let target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
    let transport = Rc::new(LoopbackTransport::new(target, 1));
    let device = ScsiDevice::open(Recorder::new(), transport.clone(), ScsiLun::new([1, 0, 0, 0]));

    device.step();
    transport.poll();

    assert_eq!(device.state(), ReadinessState::Untested);
    assert_eq!(device.retries(), 1);
}

#[test]
fn test_window_opens() {
    let target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
    let (transport, _, device) = attach(target, 0);

    device.step();
    assert_eq!(transport.pending(), 0);

    transport.set_window(2);
    assert_eq!(transport.pending(), 1);
    transport.poll();
    assert!(device.is_ready());
    assert_eq!(device.window(), 2);
}

#[test]
fn test_write_protected() {
    let mut target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
    target.set_write_protected(true);
    let (transport, _, device) = attach(target, 1);
    bring_up(&transport, &device);

    let op = Recorder::new();
    device
        .write(op.clone(), 0, 1, DataBuffer::from(vec![1; 512]), 512)
        .unwrap();
    transport.poll();

    assert_eq!(op.closes(), vec![Err(Error::Sense(SenseKey::DataProtect))]);
}

#[test]
fn test_shutdown() {
    let target = EmulatedTarget::new(Box::new(MemoryBackend::zeroed(4)));
    let (transport, block, device) = attach(target, 4);
    bring_up(&transport, &device);

    let op = Recorder::new();
    device
        .read(op.clone(), 0, 1, DataBuffer::new(512), 512)
        .unwrap();
    transport.shutdown(Err(Error::NotSupported));

    assert_eq!(op.closes(), vec![Err(Error::NotSupported)]);
    assert_eq!(device.state(), ReadinessState::Closed);
    assert_eq!(
        block.events(),
        vec![Event::WindowChanged, Event::Close(Err(Error::NotSupported))]
    );
    assert_eq!(transport.pending(), 0);
    assert_eq!(transport.window(), 0);

    let late = device.read(Recorder::new(), 0, 1, DataBuffer::new(512), 512);
    assert_matches!(late, Err(Error::NotSupported));
}

/// Reports more blocks than READ CAPACITY (10) can express.
struct HugeBackend;

const HUGE_BLOCKS: u64 = 0x1_0000_0010;

impl BlockDeviceBackend for HugeBackend {
    fn read_exact_at(&mut self, buf: &mut [u8], _offset: u64) -> io::Result<()> {
        buf.fill(0xa5);
        Ok(())
    }

    fn write_exact_at(&mut self, _buf: &[u8], _offset: u64) -> io::Result<()> {
        Ok(())
    }

    fn size_in_blocks(&mut self) -> io::Result<u64> {
        Ok(HUGE_BLOCKS)
    }

    fn block_size(&self) -> u32 {
        4096
    }
}

#[test]
fn test_large_device() {
    let (transport, _, device) = attach(EmulatedTarget::new(Box::new(HugeBackend)), 4);
    bring_up(&transport, &device);

    let op = Recorder::new();
    device.read_capacity(op.clone()).unwrap();
    // READ CAPACITY (10) answers 0xffffffff, and the command goes round again
    assert_eq!(transport.poll(), 1);
    assert!(op.events().is_empty());
    assert_eq!(transport.pending(), 1);
    assert_eq!(transport.poll(), 1);

    let capacity = BlockDeviceCapacity {
        blocks: HUGE_BLOCKS,
        block_size: 4096,
        max_count: u32::MAX,
    };
    assert_eq!(op.events(), vec![Event::Capacity(capacity), Event::Close(Ok(()))]);

    let op = Recorder::new();
    let buffer = DataBuffer::new(4096);
    device
        .read(op.clone(), HUGE_BLOCKS - 1, 1, buffer.clone(), 4096)
        .unwrap();
    transport.poll();
    assert_eq!(op.closes(), vec![Ok(())]);
    assert!(buffer.to_vec().iter().all(|&b| b == 0xa5));
}
