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

    devices::fdc::mod.rs

    The controller hardware interface and per-session controller state.
*/

//! Floppy controller layer of the tape engine.
//!
//! The engine never touches ports directly. Everything goes through [FdcHardware], which a
//! real port driver or the simulated controller in [crate::sim] implements. Interrupts are
//! posted as [FdcEvent]s on a channel and serviced by the session's interrupt handler the
//! next time the foreground pumps the channel, which happens inside every wait loop.

pub mod io;
pub mod isr;

use std::{fmt, time::Duration};

use ftape_common::types::history_buffer::HistoryBuffer;

use crate::device_types::{
    fdc::*,
    geometry::SectorId,
    qic117::DataRate,
};

pub const FDC_LOG_LEN: usize = 64;
/// How long the foreground sleeps between pumps while it waits for an interrupt.
pub const INTERRUPT_POLL_SLICE: Duration = Duration::from_millis(10);
/// Attempts per command or result byte before the controller is declared confused.
pub const FDC_BYTE_RETRIES: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmaMode {
    /// Controller to memory.
    Read,
    /// Memory to controller.
    Write,
}

/// Port and DMA access to a floppy controller.
pub trait FdcHardware {
    fn read_msr(&mut self) -> u8;
    fn read_data(&mut self) -> u8;
    fn write_data(&mut self, byte: u8);
    fn write_dor(&mut self, dor: u8);
    fn write_dsr(&mut self, dsr: u8);
    /// Program the DMA channel for the next transfer. For writes `data` is the source; for
    /// reads only its length counts.
    fn dma_setup(&mut self, mode: DmaMode, data: &[u8]);
    /// Bytes of the programmed transfer that were not moved.
    fn dma_residue(&mut self) -> usize;
    /// Copy what the last read transfer delivered into `dest`. Returns the bytes copied.
    fn dma_collect(&mut self, dest: &mut [u8]) -> usize;
    /// Block for up to `duration`. May return early when an interrupt is raised.
    fn sleep(&mut self, duration: Duration);
    /// Monotonic time in microseconds.
    fn now_us(&self) -> u64;
}

/// An interrupt from the controller, tagged with what raised it for the logs. The handler
/// works out what actually happened from the status register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdcEvent {
    /// Result phase pending after a transfer or Read ID.
    Result,
    /// Seek or recalibrate finished.
    SeekEnd,
    /// Controller came out of reset.
    Reset,
}

/// What the controller is doing, from the driver's point of view.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FdcMode {
    #[default]
    Idle,
    ReadingData,
    WritingData,
    ReadingId,
    Seeking,
    Recalibrating,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdcOperation {
    Read,
    Write,
    ReadDeleted,
    WriteDeleted,
}

impl FdcOperation {
    pub fn opcode(self) -> u8 {
        let command = match self {
            FdcOperation::Read => COMMAND_READ_DATA,
            FdcOperation::Write => COMMAND_WRITE_DATA,
            FdcOperation::ReadDeleted => COMMAND_READ_DELETED_DATA,
            FdcOperation::WriteDeleted => COMMAND_WRITE_DELETED_DATA,
        };
        command | COMMAND_MFM_BIT
    }

    pub fn dma_mode(self) -> DmaMode {
        match self {
            FdcOperation::Read | FdcOperation::ReadDeleted => DmaMode::Read,
            FdcOperation::Write | FdcOperation::WriteDeleted => DmaMode::Write,
        }
    }
}

/// Outcome of a transfer, decoded from ST0..ST2.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCause {
    NoError,
    /// No ID address mark found.
    IdAm,
    IdCrc,
    /// No data address mark after the ID.
    DataAm,
    DataCrc,
    /// Requested sector never came by.
    NoData,
    Overrun,
    WriteProtect,
    Invalid,
    ReadyChange,
}

impl ErrorCause {
    pub fn decode(st0: u8, st1: u8, st2: u8) -> ErrorCause {
        match st0 & ST0_INT_CODE_MASK {
            0 => ErrorCause::NoError,
            ST0_INVALID_OPCODE => ErrorCause::Invalid,
            ST0_READY_CHANGE => ErrorCause::ReadyChange,
            _ => {
                if st1 & ST1_CRC_ERROR != 0 {
                    if st2 & ST2_DATA_CRC_ERROR != 0 {
                        ErrorCause::DataCrc
                    }
                    else {
                        ErrorCause::IdCrc
                    }
                }
                else if st1 & ST1_OVERRUN != 0 {
                    ErrorCause::Overrun
                }
                else if st1 & ST1_WRITE_PROTECT != 0 {
                    ErrorCause::WriteProtect
                }
                else if st1 & ST1_NO_ID != 0 {
                    if st2 & ST2_NO_DAM != 0 {
                        ErrorCause::DataAm
                    }
                    else {
                        ErrorCause::IdAm
                    }
                }
                else if st1 & ST1_NODATA != 0 {
                    ErrorCause::NoData
                }
                else if st1 & ST1_END_OF_CYLINDER != 0 {
                    // Ran off the end of the requested sectors without terminal count.
                    ErrorCause::NoError
                }
                else {
                    ErrorCause::Invalid
                }
            }
        }
    }

    pub fn is_media_error(self) -> bool {
        matches!(
            self,
            ErrorCause::IdAm
                | ErrorCause::IdCrc
                | ErrorCause::DataAm
                | ErrorCause::DataCrc
                | ErrorCause::NoData
                | ErrorCause::Overrun
        )
    }
}

impl fmt::Display for ErrorCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCause::NoError => "no error",
            ErrorCause::IdAm => "id address mark not found",
            ErrorCause::IdCrc => "id crc error",
            ErrorCause::DataAm => "data address mark not found",
            ErrorCause::DataCrc => "data crc error",
            ErrorCause::NoData => "sector not found",
            ErrorCause::Overrun => "overrun",
            ErrorCause::WriteProtect => "write protected",
            ErrorCause::Invalid => "invalid command",
            ErrorCause::ReadyChange => "ready changed",
        };
        write!(f, "{}", s)
    }
}

pub struct FdcState {
    pub drive: u8,
    pub dor: u8,
    pub current_cylinder: u8,
    pub mode: FdcMode,
    pub rate: DataRate,
    pub version: u8,
    pub perpendicular: bool,
    /// Set by the interrupt handler for anything a foreground waiter should see.
    pub interrupt_seen: bool,
    /// The next seek interrupt belongs to a command the handler issued itself.
    pub hide_interrupt: bool,
    /// Seek interrupts the handler expects while idle, consumed silently.
    pub expected_stray: u32,
    /// The foreground is inside an interrupt wait.
    pub waiting: bool,
    pub resetting: bool,
    pub confused: bool,
    pub seek_completed: bool,
    pub in_isr: bool,
    pub last_id: Option<SectorId>,
    pub last_result: [u8; FDC_RESULT_LEN],
    pub cmd_log: HistoryBuffer<String>,
}

impl FdcState {
    pub fn new(drive: u8) -> Self {
        FdcState {
            drive: drive & DOR_DRIVE_SELECT_MASK,
            dor: DOR_FDC_RESET | DOR_DMA_ENABLED | (drive & DOR_DRIVE_SELECT_MASK),
            current_cylinder: 0,
            mode: FdcMode::Idle,
            rate: DataRate::default(),
            version: FDC_VERSION_765,
            perpendicular: false,
            interrupt_seen: false,
            hide_interrupt: false,
            expected_stray: 0,
            waiting: false,
            resetting: false,
            confused: false,
            seek_completed: false,
            in_isr: false,
            last_id: None,
            last_result: [0; FDC_RESULT_LEN],
            cmd_log: HistoryBuffer::new(FDC_LOG_LEN),
        }
    }

    /// Drive/head select byte for command parameters.
    pub fn dhs(&self, head: u8) -> u8 {
        DriveHeadSelect::new()
            .with_drive(self.drive)
            .with_head(head & 0x01)
            .into_bytes()[0]
    }

    pub fn log_cmd(&mut self, func: &str, s: &str) {
        self.cmd_log.push(format!("{}: {}", func, s));
        log::trace!("{}(): {}", func, s);
    }

    /// Dump the command history, oldest first. Used when the controller stops making sense.
    pub fn dump_log(&self) {
        for entry in self.cmd_log.iter() {
            log::debug!("fdc log: {}", entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_causes() {
        assert_eq!(ErrorCause::decode(0x00, 0, 0), ErrorCause::NoError);
        assert_eq!(
            ErrorCause::decode(ST0_ABNORMAL_TERMINATION, ST1_CRC_ERROR, ST2_DATA_CRC_ERROR),
            ErrorCause::DataCrc
        );
        assert_eq!(ErrorCause::decode(ST0_ABNORMAL_TERMINATION, ST1_CRC_ERROR, 0), ErrorCause::IdCrc);
        assert_eq!(ErrorCause::decode(ST0_ABNORMAL_TERMINATION, ST1_NO_ID, 0), ErrorCause::IdAm);
        assert_eq!(
            ErrorCause::decode(ST0_ABNORMAL_TERMINATION, ST1_NO_ID, ST2_NO_DAM),
            ErrorCause::DataAm
        );
        assert_eq!(ErrorCause::decode(ST0_ABNORMAL_TERMINATION, ST1_NODATA, 0), ErrorCause::NoData);
        assert_eq!(
            ErrorCause::decode(ST0_ABNORMAL_TERMINATION, ST1_END_OF_CYLINDER, 0),
            ErrorCause::NoError
        );
        assert_eq!(ErrorCause::decode(ST0_INVALID_OPCODE, 0, 0), ErrorCause::Invalid);
        assert!(ErrorCause::NoData.is_media_error());
        assert!(!ErrorCause::WriteProtect.is_media_error());
    }

    #[test]
    fn test_dhs() {
        let state = FdcState::new(2);
        assert_eq!(state.dhs(0), 0x02);
        assert_eq!(state.dhs(1), 0x06);
    }
}
