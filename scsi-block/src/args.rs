// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::path::PathBuf;

use clap::Parser;

/// Attach a disk image as a SCSI logical unit and talk to it through the
/// SCSI block layer.
#[derive(Parser, Debug)]
pub struct ScsiArgs {
    /// Logical unit number, as up to four `-`-separated hex components.
    #[arg(long)]
    pub lun: Option<String>,
    /// Make the image read-only; writes fail with DATA PROTECT.
    #[arg(long = "read-only", short = 'r')]
    pub read_only: bool,
    /// Answer this many TEST UNIT READY probes with NOT READY before
    /// reporting the unit as ready.
    #[arg(long = "becoming-ready", default_value_t = 0)]
    pub becoming_ready: u32,
    /// Report sense data in descriptor format rather than fixed format.
    #[arg(long = "descriptor-sense")]
    pub descriptor_sense: bool,
    /// Read blocks starting at this LBA once the unit is ready.
    #[arg(long)]
    pub read: Option<u64>,
    /// Number of blocks to read.
    #[arg(long, default_value_t = 1)]
    pub count: u32,
    /// Image against which the SCSI commands are emulated.
    pub image: PathBuf,
}
