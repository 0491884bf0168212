// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! SCSI block device layer.
//!
//! A [`device::ScsiDevice`] sits between a block consumer (anything that wants
//! to read and write logical blocks) and a SCSI transport (anything that can
//! carry a CDB to a target and eventually report a status). Block operations
//! become [`command::ScsiCommand`]s; responses come back asynchronously
//! through a [`command::ScsiEndpoint`] and are turned into block-level
//! completions.
//!
//! Everything here is single-threaded: objects are shared with `Rc` and
//! callbacks may re-enter the layer (a completion can close the device that
//! owns the command being completed).

pub mod cdb;
pub mod command;
pub mod device;
pub mod emulation;
pub mod intf;
pub mod lun;
pub mod sense;
mod tests;

use thiserror::Error as ThisError;

pub use self::{
    command::ScsiEndpoint,
    device::{ReadinessState, ScsiDevice},
    intf::{BlockConsumer, BlockDeviceCapacity, DataBuffer, ScsiCmd, ScsiResponse, ScsiTransport},
    lun::ScsiLun,
    sense::{parse_sense, SenseKey, SenseRecord},
};

/// Errors produced by the SCSI layer.
///
/// These are `Clone` because a single closure reason is handed to every
/// endpoint and command being shut down.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("Could not allocate SCSI command")]
    NoMemory,
    #[error("SCSI command issuing not supported")]
    NotSupported,
    #[error("SCSI sense: {0}")]
    Sense(SenseKey),
    #[error("Invalid SCSI LUN {0:?}")]
    InvalidLun(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why an endpoint or command was closed: `Ok(())` on normal completion.
pub type CloseReason = std::result::Result<(), Error>;
