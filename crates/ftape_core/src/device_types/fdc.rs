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

    device_types::fdc.rs

    Register, command and status bit definitions for the floppy disk controller.
*/

//! Register layouts and command set of the µPD765-family floppy controller as the tape
//! driver uses it. Shared by the driver and by the simulated controller.

use modular_bitfield::{bitfield, prelude::*};

use crate::device_types::qic117::DataRate;

// Main Status Register Bit Definitions
// --------------------------------------------------------------------------------
pub const FDC_STATUS_FDC_BUSY: u8 = 0b0001_0000;
pub const FDC_STATUS_NON_DMA_MODE: u8 = 0b0010_0000;
/// Set when the controller has a byte for the CPU; clear when it expects one.
pub const FDC_STATUS_DIO: u8 = 0b0100_0000;
pub const FDC_STATUS_MRQ: u8 = 0b1000_0000;

pub const DOR_DRIVE_SELECT_MASK: u8 = 0b0000_0011;
pub const DOR_FDC_RESET: u8 = 0b0000_0100;
pub const DOR_DMA_ENABLED: u8 = 0b0000_1000;
pub const DOR_MOTOR_FDD_A: u8 = 0b0001_0000;

pub const COMMAND_MASK: u8 = 0b0001_1111;
pub const COMMAND_SKIP_BIT: u8 = 0b0010_0000;
pub const COMMAND_MFM_BIT: u8 = 0b0100_0000;
pub const COMMAND_MT_BIT: u8 = 0b1000_0000;

pub const COMMAND_SPECIFY: u8 = 0x03;
pub const COMMAND_SENSE_DRIVE_STATUS: u8 = 0x04;
pub const COMMAND_WRITE_DATA: u8 = 0x05;
pub const COMMAND_READ_DATA: u8 = 0x06;
pub const COMMAND_RECALIBRATE: u8 = 0x07;
pub const COMMAND_SENSE_INT_STATUS: u8 = 0x08;
pub const COMMAND_WRITE_DELETED_DATA: u8 = 0x09;
pub const COMMAND_READ_SECTOR_ID: u8 = 0x0A;
pub const COMMAND_READ_DELETED_DATA: u8 = 0x0C;
pub const COMMAND_SEEK_HEAD: u8 = 0x0F;
pub const COMMAND_VERSION: u8 = 0x10;
pub const COMMAND_PERPENDICULAR_MODE: u8 = 0x12;

pub const ST0_DRIVE_SELECT_MASK: u8 = 0b0000_0011;
pub const ST0_HEAD_ACTIVE: u8 = 0b0000_0100;
pub const ST0_NOT_READY: u8 = 0b0000_1000;
pub const ST0_UNIT_CHECK: u8 = 0b0001_0000;
pub const ST0_SEEK_END: u8 = 0b0010_0000;
pub const ST0_INT_CODE_MASK: u8 = 0b1100_0000;
pub const ST0_ABNORMAL_TERMINATION: u8 = 0b0100_0000;
pub const ST0_INVALID_OPCODE: u8 = 0b1000_0000;
pub const ST0_READY_CHANGE: u8 = 0b1100_0000;

pub const ST1_NO_ID: u8 = 0b0000_0001;
pub const ST1_WRITE_PROTECT: u8 = 0b0000_0010;
pub const ST1_NODATA: u8 = 0b0000_0100;
pub const ST1_OVERRUN: u8 = 0b0001_0000;
pub const ST1_CRC_ERROR: u8 = 0b0010_0000;
pub const ST1_END_OF_CYLINDER: u8 = 0b1000_0000;

pub const ST2_NO_DAM: u8 = 0b0000_0001;
pub const ST2_WRONG_CYLINDER: u8 = 0b0001_0000;
pub const ST2_DATA_CRC_ERROR: u8 = 0b0010_0000;
pub const ST2_DAD_MARK: u8 = 0b0100_0000;

pub const ST3_WRITE_PROTECT: u8 = 0b0100_0000;
pub const ST3_READY: u8 = 0b0010_0000;
pub const ST3_TRACK0: u8 = 0b0001_0000;
pub const ST3_DOUBLESIDED: u8 = 0b0000_1000;
pub const ST3_HEAD: u8 = 0b0000_0100;

/// Sector size code for 1024 byte sectors.
pub const SECTOR_SIZE_CODE_1K: u8 = 3;
pub const FDC_GAP3_LEN: u8 = 0x1b;

pub const FDC_VERSION_765: u8 = 0x80;
pub const FDC_VERSION_82077: u8 = 0x90;

/// Number of result bytes produced by the data transfer and Read ID commands.
pub const FDC_RESULT_LEN: usize = 7;

#[bitfield]
#[derive(Copy, Clone)]
pub struct CommandByte {
    pub command: B5,
    pub skip: bool,
    pub mfm: bool,
    pub mt: bool,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct DriveHeadSelect {
    pub drive: B2,
    pub head: B1,
    #[skip]
    unused: B5,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct StepRateHeadUnload {
    pub head_unload: B4,
    pub step_rate: B4,
}

#[bitfield]
#[derive(Copy, Clone)]
pub struct HeadLoadDma {
    pub non_dma: bool,
    pub head_load: B7,
}

/// Data Rate Select Register value for a transfer rate. The precompensation field sits
/// in bits 2..5.
pub fn dsr_byte(rate: DataRate) -> u8 {
    let (code, precomp) = match rate {
        DataRate::Rate500 => (0, 3),
        DataRate::Rate250 => (2, 5),
        DataRate::Rate1000 => (3, 1),
        // i82078-1 only.
        DataRate::Rate2000 => (1, 0),
    };
    code | (precomp << 2)
}

pub fn rate_from_dsr(dsr: u8) -> DataRate {
    match dsr & 0x03 {
        0 => DataRate::Rate500,
        1 => DataRate::Rate2000,
        2 => DataRate::Rate250,
        _ => DataRate::Rate1000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_byte() {
        let byte = CommandByte::from_bytes([COMMAND_READ_DATA | COMMAND_MFM_BIT]);
        assert_eq!(byte.command(), COMMAND_READ_DATA);
        assert!(byte.mfm());
        assert!(!byte.mt());
    }

    #[test]
    fn test_dsr_round_trip() {
        for rate in [DataRate::Rate250, DataRate::Rate500, DataRate::Rate1000, DataRate::Rate2000] {
            assert_eq!(rate_from_dsr(dsr_byte(rate)), rate);
        }
    }
}
