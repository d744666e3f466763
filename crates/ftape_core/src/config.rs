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

    config.rs

    Session configuration.
*/

//! Session parameters. Loaded from the `[session]` table of the configuration file by the
//! config crate, or built in code with [SessionConfig::default].

use std::time::Duration;

use serde::Deserialize;

use crate::{device_types::qic117::DataRate, devices::vendors::WakeupMethod};

const fn _default_true() -> bool {
    true
}

/// Behaviour switches for controller and drive variations.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Quirks {
    /// On a data CRC error the controller has already moved past the failing sector, so the
    /// residue points one sector beyond it.
    #[serde(default = "_default_true")]
    pub crc_error_already_past: bool,
    /// Extra time a drive may take to raise the acknowledge bit of a report.
    pub report_extra_ack_delay_ms: u64,
}

impl Default for Quirks {
    fn default() -> Self {
        Quirks {
            crc_error_already_past: true,
            report_extra_ack_delay_ms: 8,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Floppy unit the drive is attached to (0-3).
    pub drive_select: u8,
    /// Wake-up method to use. Probed when unset.
    pub wakeup: Option<WakeupMethod>,
    /// Transfer rate to request. The standard's preferred rate is used when unset.
    pub data_rate: Option<DataRate>,
    /// Per-sector retries before a failing sector is treated as a hard error.
    pub soft_retries: u32,
    /// Repositioning attempts per segment before the pass is abandoned.
    pub segment_retries: u32,
    /// Re-reads of a segment whose ECC could not be resolved.
    pub ecc_retries: u32,
    /// Attempts to bring the tape into start position.
    pub start_retries: u32,
    /// Step down one data rate after this many retries on a segment. Zero disables.
    pub rate_fallback_retry: u32,
    /// Microseconds to wait for the controller to accept or offer a byte.
    pub byte_timeout_us: u32,
    pub interrupt_timeout_ms: u64,
    pub ready_poll_ms: u64,
    /// Spin loop rate in status reads per microsecond. Measured when unset.
    pub spins_per_us: Option<u32>,
    /// Ask the drive for the next segment while the current one is handed over.
    #[serde(default = "_default_true")]
    pub read_ahead: bool,
    pub quirks: Quirks,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            drive_select: 0,
            wakeup: None,
            data_rate: None,
            soft_retries: 2,
            segment_retries: 5,
            ecc_retries: 2,
            start_retries: 8,
            rate_fallback_retry: 0,
            byte_timeout_us: 500,
            interrupt_timeout_ms: 2000,
            ready_poll_ms: 100,
            spins_per_us: None,
            read_ahead: true,
            quirks: Quirks::default(),
        }
    }
}

impl SessionConfig {
    pub fn interrupt_timeout(&self) -> Duration {
        Duration::from_millis(self.interrupt_timeout_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(1))
    }

    pub fn report_ack_delay(&self) -> Duration {
        Duration::from_millis(self.quirks.report_extra_ack_delay_ms)
    }
}
