// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! An in-process SCSI transport backed by an emulated target.
//!
//! `LoopbackTransport` queues issued commands and completes them when
//! polled, so it behaves like a real asynchronous transport from the point of
//! view of a `ScsiDevice`. The commands are encoded to wire CDBs and decoded
//! again by `EmulatedTarget`, which executes them against a block backend.

pub mod backend;
mod response_data;
pub mod target;
pub mod transport;

pub use self::{
    backend::{BlockDeviceBackend, FileBackend, MemoryBackend},
    target::{CmdOutput, EmulatedTarget, Request, SenseFormat},
    transport::LoopbackTransport,
};
