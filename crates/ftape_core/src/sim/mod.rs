/*
    QICTape

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! A simulated floppy controller with a QIC-117 tape drive behind it.
//!
//! The simulation runs on a virtual clock that only moves when the engine sleeps, so a
//! session against it is deterministic and runs as fast as the host allows. Tape motion is
//! modelled closely enough for positioning to matter: skips land off target, stops coast,
//! pauses back up, and sectors that have already passed the head cannot be read.

pub mod controller;
pub mod drive;
pub mod media;

use serde::Deserialize;

use crate::{
    device_types::{
        fdc::FDC_VERSION_82077,
        qic117::{DataRate, QicStandard, TapeLength},
    },
    devices::vendors::WakeupMethod,
};

pub use controller::{Fault, FaultKind, SimulatedFdc};
pub use drive::QicTapeDrive;
pub use media::TapeMedia;

/// Behaviour of the simulated drive and controller. Loaded from the `[sim]` table of the
/// configuration file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Cartridge formatted into the drive when the front end builds fresh media.
    pub standard: QicStandard,
    pub length: TapeLength,
    pub wakeup: WakeupMethod,
    pub vendor_id: u16,
    pub rom_version: u8,
    /// Answer to the VERSION command: 0x90 for an 82077, anything else for a plain 765.
    pub fdc_version: u8,
    /// Rates the drive accepts. Empty means everything the cartridge's standard allows.
    pub rates: Vec<DataRate>,
    /// Rate the drive powers up at. Defaults to the slowest accepted rate.
    pub initial_rate: Option<DataRate>,
    /// The drive implements Select Rate.
    pub rate_select: bool,
    /// The drive implements Report Tape Status.
    pub tape_status_report: bool,
    pub write_protected: bool,
    /// Time per step pulse.
    pub step_us: u64,
    /// Segments a forward skip lands beyond the requested count.
    pub skip_bias: i32,
    /// Segments a reverse skip travels beyond the requested count.
    pub reverse_bias: i32,
    /// Random scatter of skip landings, in segments either way.
    pub skip_noise: u32,
    /// Reverse skips shorter than this do not move the tape.
    pub min_reverse: u32,
    /// On a data CRC error the failing sector has already gone through DMA.
    pub crc_error_already_past: bool,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            standard: QicStandard::Qic80,
            length: TapeLength::Normal,
            wakeup: WakeupMethod::None,
            vendor_id: 0x0300,
            rom_version: 0x41,
            fdc_version: FDC_VERSION_82077,
            rates: Vec::new(),
            initial_rate: None,
            rate_select: true,
            tape_status_report: true,
            write_protected: false,
            step_us: 1000,
            skip_bias: 1,
            reverse_bias: 2,
            skip_noise: 0,
            min_reverse: 2,
            crc_error_already_past: true,
            seed: 0,
        }
    }
}
