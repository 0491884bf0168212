// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

mod args;

use std::{
    cell::{Cell, RefCell},
    fs::File,
    io,
    path::PathBuf,
    process::exit,
    rc::Rc,
};

use clap::Parser;
use log::{error, info};
use scsi_block::scsi::{
    self,
    device::READY_MAX_RETRIES,
    emulation::{EmulatedTarget, FileBackend, LoopbackTransport, SenseFormat},
    BlockConsumer, BlockDeviceCapacity, CloseReason, DataBuffer, ReadinessState, ScsiDevice,
    ScsiLun,
};
use thiserror::Error as ThisError;

use crate::args::ScsiArgs;

#[derive(Debug, ThisError)]
enum Error {
    #[error("Failed opening image {0:?}: {1}")]
    OpenImage(PathBuf, io::Error),
    #[error("{0}")]
    Scsi(#[from] scsi::Error),
    #[error("Device did not become ready")]
    NotReady,
    #[error("Transport finished without completing the command")]
    Stalled,
}

type Result<T> = std::result::Result<T, Error>;

/// Upstream of the device itself.
struct DeviceEvents;

impl BlockConsumer for DeviceEvents {
    fn window_changed(&self) {
        info!("Device window changed");
    }

    fn close(&self, reason: &CloseReason) {
        match reason {
            Ok(()) => info!("Device closed"),
            Err(e) => error!("Device closed: {e}"),
        }
    }
}

/// Upstream of a single block operation.
#[derive(Default)]
struct Completion {
    capacity: Cell<Option<BlockDeviceCapacity>>,
    reason: RefCell<Option<CloseReason>>,
}

impl BlockConsumer for Completion {
    fn capacity(&self, capacity: &BlockDeviceCapacity) {
        self.capacity.set(Some(*capacity));
    }

    fn close(&self, reason: &CloseReason) {
        *self.reason.borrow_mut() = Some(reason.clone());
    }
}

fn create_target(args: &ScsiArgs, lun: ScsiLun) -> Result<EmulatedTarget> {
    let file = File::options()
        .read(true)
        .write(!args.read_only)
        .open(&args.image)
        .map_err(|e| Error::OpenImage(args.image.clone(), e))?;

    let mut target = EmulatedTarget::new(Box::new(FileBackend::new(file)));
    target.set_lun(lun);
    target.set_write_protected(args.read_only);
    target.set_becoming_ready(args.becoming_ready);
    target.set_sense_format(if args.descriptor_sense {
        SenseFormat::Descriptor
    } else {
        SenseFormat::Fixed
    });
    Ok(target)
}

/// Drive the readiness task until the device is ready or gives up.
fn bring_up(transport: &LoopbackTransport, device: &Rc<ScsiDevice>) -> Result<()> {
    for _ in 0..=READY_MAX_RETRIES {
        device.step();
        transport.poll();
        match device.state() {
            ReadinessState::Ready => return Ok(()),
            ReadinessState::Closed => return Err(Error::NotReady),
            ReadinessState::Untested | ReadinessState::ProbeSent => {}
        }
    }
    Err(Error::NotReady)
}

/// Poll until the operation behind `completion` has closed.
fn complete(transport: &LoopbackTransport, completion: &Completion) -> Result<()> {
    while transport.pending() > 0 && completion.reason.borrow().is_none() {
        transport.poll();
    }
    let reason = completion.reason.borrow_mut().take();
    reason.ok_or(Error::Stalled)?.map_err(Error::from)
}

/// Bring the unit up, read its capacity and optionally some blocks.
fn inspect(args: &ScsiArgs) -> Result<(BlockDeviceCapacity, Option<Vec<u8>>)> {
    let lun = ScsiLun::parse(args.lun.as_deref())?;
    let target = create_target(args, lun)?;
    let transport = Rc::new(LoopbackTransport::new(target, 1));
    let device = ScsiDevice::open(Rc::new(DeviceEvents), transport.clone(), lun);
    transport.attach(&device);

    let result = read_device(args, &transport, &device);
    device.close(Ok(()));
    result
}

fn read_device(
    args: &ScsiArgs,
    transport: &LoopbackTransport,
    device: &Rc<ScsiDevice>,
) -> Result<(BlockDeviceCapacity, Option<Vec<u8>>)> {
    bring_up(transport, device)?;

    let completion = Rc::new(Completion::default());
    device.read_capacity(completion.clone())?;
    complete(transport, &completion)?;
    let capacity = completion.capacity.get().ok_or(Error::Stalled)?;
    info!(
        "Capacity: {} blocks of {} bytes",
        capacity.blocks, capacity.block_size
    );

    let Some(lba) = args.read else {
        return Ok((capacity, None));
    };
    let len = args.count as usize * capacity.block_size as usize;
    let buffer = DataBuffer::try_new(len)?;
    let completion = Rc::new(Completion::default());
    device.read(completion.clone(), lba, args.count, buffer.clone(), len)?;
    complete(transport, &completion)?;

    Ok((capacity, Some(buffer.to_vec())))
}

fn run() -> Result<()> {
    env_logger::init();
    let args = ScsiArgs::parse();
    let (capacity, data) = inspect(&args)?;

    println!("{} blocks of {} bytes", capacity.blocks, capacity.block_size);
    if let Some(data) = data {
        for (i, line) in data.chunks(16).enumerate() {
            let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:08x}  {}", i * 16, hex.join(" "));
        }
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("{e}");
        exit(1);
    }
}
