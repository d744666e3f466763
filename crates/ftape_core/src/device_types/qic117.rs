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

    device_types::qic117.rs

    QIC-117 command set, drive status and configuration bits.
*/

//! QIC-117 command set, status bits and drive identification codes.
//!
//! A QIC-117 drive hangs off the floppy controller and is commanded by step pulses:
//! command `n` is `n` pulses, parameters are `value + 2` pulses. Replies come back one bit
//! at a time on the TRACK0 line of ST3.

use std::{str::FromStr, time::Duration};

use modular_bitfield::bitfield;
use serde::Deserialize;
use strum_macros::Display;

pub const QIC_STATUS_READY: u8 = 0x01;
pub const QIC_STATUS_ERROR: u8 = 0x02;
pub const QIC_STATUS_CARTRIDGE: u8 = 0x04;
pub const QIC_STATUS_WRITE_PROTECT: u8 = 0x08;
pub const QIC_STATUS_NEW_CARTRIDGE: u8 = 0x10;
pub const QIC_STATUS_REFERENCED: u8 = 0x20;
pub const QIC_STATUS_AT_BOT: u8 = 0x40;
pub const QIC_STATUS_AT_EOT: u8 = 0x80;

pub const QIC_CONFIG_RATE_MASK: u8 = 0x18;
pub const QIC_CONFIG_RATE_SHIFT: u8 = 3;
pub const QIC_CONFIG_LONG: u8 = 0x40;
pub const QIC_CONFIG_80: u8 = 0x80;

pub const QIC_TAPE_STD_MASK: u8 = 0x0f;
pub const QIC_TAPE_LEN_MASK: u8 = 0x30;
pub const QIC_TAPE_LEN_SHIFT: u8 = 4;

/// Largest count a single skip command can carry; longer skips are issued in chunks.
pub const QIC_MAX_SKIP: u32 = 255;

/// Drive error codes fetched with [QicCommand::ReportErrorCode].
pub const QIC_ERR_UNDEFINED_COMMAND: u8 = 6;
pub const QIC_ERR_NEW_CARTRIDGE: u8 = 13;
pub const QIC_ERR_RATE_SELECT: u8 = 31;

#[bitfield]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QicStatus {
    pub ready: bool,
    pub error: bool,
    pub cartridge: bool,
    pub write_protect: bool,
    pub new_cartridge: bool,
    pub referenced: bool,
    pub at_bot: bool,
    pub at_eot: bool,
}

impl QicStatus {
    pub fn from_byte(byte: u8) -> Self {
        QicStatus::from_bytes([byte])
    }

    pub fn byte(&self) -> u8 {
        self.into_bytes()[0]
    }

    pub fn matches(&self, mask: u8, state: u8) -> bool {
        self.byte() & mask == state
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandType {
    Motion,
    Report,
    Control,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Display)]
pub enum QicCommand {
    #[default]
    NoCommand = 0,
    ReportNextBit = 2,
    Pause = 3,
    MicroStepPause = 4,
    ReportDriveStatus = 6,
    ReportErrorCode = 7,
    ReportDriveConfiguration = 8,
    ReportRomVersion = 9,
    LogicalForward = 10,
    PhysicalReverse = 11,
    PhysicalForward = 12,
    SeekHeadToTrack = 13,
    SeekLoadPoint = 14,
    StopTape = 18,
    SoftSelect = 23,
    SoftDeselect = 24,
    SkipReverse = 25,
    SkipForward = 26,
    SelectRate = 27,
    EnterPrimaryMode = 30,
    ReportVendorId = 32,
    ReportTapeStatus = 33,
    PhantomSelect = 46,
    PhantomDeselect = 47,
}

/// Preconditions and timing for a QIC-117 command. `mask`/`state` are applied to the
/// drive status byte before the command may be issued.
#[derive(Copy, Clone, Debug)]
pub struct QicCommandInfo {
    pub mask: u8,
    pub state: u8,
    pub cmd_type: CommandType,
    pub non_intr: bool,
    pub timeout: Duration,
}

const fn info(mask: u8, state: u8, cmd_type: CommandType, non_intr: bool, timeout_ms: u64) -> QicCommandInfo {
    QicCommandInfo {
        mask,
        state,
        cmd_type,
        non_intr,
        timeout: Duration::from_millis(timeout_ms),
    }
}

const LOADED: u8 = QIC_STATUS_READY | QIC_STATUS_CARTRIDGE;
const LOADED_REFERENCED: u8 = LOADED | QIC_STATUS_REFERENCED;

const TIMEOUT_REPORT: u64 = 1_000;
const TIMEOUT_STOP: u64 = 10_000;
const TIMEOUT_SEEK_TRACK: u64 = 15_000;
const TIMEOUT_SKIP: u64 = 130_000;
const TIMEOUT_REWIND: u64 = 650_000;

impl QicCommand {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<QicCommand> {
        use QicCommand::*;
        Some(match code {
            2 => ReportNextBit,
            3 => Pause,
            4 => MicroStepPause,
            6 => ReportDriveStatus,
            7 => ReportErrorCode,
            8 => ReportDriveConfiguration,
            9 => ReportRomVersion,
            10 => LogicalForward,
            11 => PhysicalReverse,
            12 => PhysicalForward,
            13 => SeekHeadToTrack,
            14 => SeekLoadPoint,
            18 => StopTape,
            23 => SoftSelect,
            24 => SoftDeselect,
            25 => SkipReverse,
            26 => SkipForward,
            27 => SelectRate,
            30 => EnterPrimaryMode,
            32 => ReportVendorId,
            33 => ReportTapeStatus,
            46 => PhantomSelect,
            47 => PhantomDeselect,
            _ => return None,
        })
    }

    pub fn info(self) -> QicCommandInfo {
        use CommandType::*;
        use QicCommand::*;
        match self {
            NoCommand => info(0, 0, Control, false, 0),
            ReportNextBit => info(0, 0, Report, false, TIMEOUT_REPORT),
            Pause | MicroStepPause => info(0, 0, Motion, true, TIMEOUT_STOP),
            StopTape => info(0, 0, Motion, true, TIMEOUT_STOP),
            ReportDriveStatus | ReportErrorCode | ReportDriveConfiguration | ReportRomVersion | ReportVendorId
            | ReportTapeStatus => info(0, 0, Report, false, TIMEOUT_REPORT),
            LogicalForward => info(LOADED_REFERENCED, LOADED_REFERENCED, Motion, false, TIMEOUT_REWIND),
            PhysicalReverse | PhysicalForward | SeekLoadPoint => info(LOADED, LOADED, Motion, true, TIMEOUT_REWIND),
            SeekHeadToTrack => info(LOADED, LOADED, Motion, true, TIMEOUT_SEEK_TRACK),
            SkipReverse | SkipForward => info(LOADED_REFERENCED, LOADED_REFERENCED, Motion, true, TIMEOUT_SKIP),
            SelectRate => info(QIC_STATUS_READY, QIC_STATUS_READY, Control, false, TIMEOUT_REPORT),
            EnterPrimaryMode => info(0, 0, Control, false, TIMEOUT_REPORT),
            SoftSelect | SoftDeselect | PhantomSelect | PhantomDeselect => info(0, 0, Control, false, TIMEOUT_REPORT),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, Deserialize)]
pub enum QicStandard {
    #[strum(to_string = "QIC-40")]
    #[serde(rename = "qic40")]
    Qic40,
    #[strum(to_string = "QIC-80")]
    #[serde(rename = "qic80")]
    Qic80,
    #[strum(to_string = "QIC-3010")]
    #[serde(rename = "qic3010")]
    Qic3010,
    #[strum(to_string = "QIC-3020")]
    #[serde(rename = "qic3020")]
    Qic3020,
}

impl QicStandard {
    /// Decode the low nibble of a tape status report.
    pub fn from_tape_status(status: u8) -> Option<QicStandard> {
        match status & QIC_TAPE_STD_MASK {
            1 => Some(QicStandard::Qic40),
            2 => Some(QicStandard::Qic80),
            3 => Some(QicStandard::Qic3010),
            4 => Some(QicStandard::Qic3020),
            _ => None,
        }
    }

    pub fn tape_status_code(self) -> u8 {
        match self {
            QicStandard::Qic40 => 1,
            QicStandard::Qic80 => 2,
            QicStandard::Qic3010 => 3,
            QicStandard::Qic3020 => 4,
        }
    }

    /// Preferred transfer rate first, then the fallbacks the standard permits.
    pub fn rates(self) -> &'static [DataRate] {
        match self {
            QicStandard::Qic40 => &[DataRate::Rate500, DataRate::Rate250],
            QicStandard::Qic80 => &[DataRate::Rate1000, DataRate::Rate500, DataRate::Rate250],
            QicStandard::Qic3010 => &[DataRate::Rate1000, DataRate::Rate500],
            QicStandard::Qic3020 => &[DataRate::Rate2000, DataRate::Rate1000],
        }
    }

    pub fn needs_perpendicular(self) -> bool {
        matches!(self, QicStandard::Qic3010 | QicStandard::Qic3020)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Display, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeLength {
    #[default]
    #[strum(to_string = "205ft")]
    Normal,
    #[strum(to_string = "425ft")]
    Long,
    #[strum(to_string = "1100ft")]
    ExtraLong,
}

impl TapeLength {
    pub fn from_tape_status(status: u8) -> TapeLength {
        match (status & QIC_TAPE_LEN_MASK) >> QIC_TAPE_LEN_SHIFT {
            1 => TapeLength::Long,
            2 => TapeLength::ExtraLong,
            _ => TapeLength::Normal,
        }
    }

    pub fn tape_status_code(self) -> u8 {
        let code = match self {
            TapeLength::Normal => 0,
            TapeLength::Long => 1,
            TapeLength::ExtraLong => 2,
        };
        code << QIC_TAPE_LEN_SHIFT
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Deserialize)]
pub enum DataRate {
    #[strum(to_string = "250Kbps")]
    #[serde(rename = "250")]
    Rate250,
    #[default]
    #[strum(to_string = "500Kbps")]
    #[serde(rename = "500")]
    Rate500,
    #[strum(to_string = "1Mbps")]
    #[serde(rename = "1000")]
    Rate1000,
    #[strum(to_string = "2Mbps")]
    #[serde(rename = "2000")]
    Rate2000,
}

impl DataRate {
    pub fn kbps(self) -> u32 {
        match self {
            DataRate::Rate250 => 250,
            DataRate::Rate500 => 500,
            DataRate::Rate1000 => 1000,
            DataRate::Rate2000 => 2000,
        }
    }

    /// Rate code as used both by the Select Rate parameter and the configuration report.
    pub fn qic_code(self) -> u8 {
        match self {
            DataRate::Rate250 => 0,
            DataRate::Rate2000 => 1,
            DataRate::Rate500 => 2,
            DataRate::Rate1000 => 3,
        }
    }

    pub fn from_qic_code(code: u8) -> DataRate {
        match code & 0x03 {
            0 => DataRate::Rate250,
            1 => DataRate::Rate2000,
            2 => DataRate::Rate500,
            _ => DataRate::Rate1000,
        }
    }

    pub fn from_config(config: u8) -> DataRate {
        DataRate::from_qic_code((config & QIC_CONFIG_RATE_MASK) >> QIC_CONFIG_RATE_SHIFT)
    }

    /// The next slower rate, if any.
    pub fn slower(self) -> Option<DataRate> {
        match self {
            DataRate::Rate250 => None,
            DataRate::Rate500 => Some(DataRate::Rate250),
            DataRate::Rate1000 => Some(DataRate::Rate500),
            DataRate::Rate2000 => Some(DataRate::Rate1000),
        }
    }
}

impl FromStr for DataRate {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().trim_end_matches("kbps") {
            "250" => Ok(DataRate::Rate250),
            "500" => Ok(DataRate::Rate500),
            "1000" | "1mbps" => Ok(DataRate::Rate1000),
            "2000" | "2mbps" => Ok(DataRate::Rate2000),
            _ => Err(format!("Bad value for data rate: {}", s)),
        }
    }
}

/// Text for the error codes returned by [QicCommand::ReportErrorCode].
pub fn qic_error_name(code: u8) -> &'static str {
    match code {
        0 => "No error",
        1 => "Command received while drive not ready",
        2 => "Cartridge not present or removed",
        3 => "Motor speed error (not within 1%)",
        4 => "Motor speed fault (jammed, or gross speed error)",
        5 => "Cartridge write protected",
        6 => "Undefined or reserved command code",
        7 => "Illegal track address specified for seek",
        8 => "Illegal command in report subcontext",
        9 => "Illegal entry into a diagnostic mode",
        10 => "Broken tape detected (based on hole sensor)",
        11 => "Warning: read gain setting error",
        12 => "Command received while error status pending (obs)",
        13 => "Command received while new cartridge pending",
        14 => "Command illegal or undefined in primary mode",
        15 => "Command illegal or undefined in format mode",
        16 => "Command illegal or undefined in verify mode",
        17 => "Logical forward not at logical BOT or no format segments in format mode",
        18 => "Logical EOT before all segments generated",
        19 => "Command illegal when cartridge not referenced",
        20 => "Self-diagnostic failed (cannot be cleared)",
        21 => "Warning: EEPROM not initialized, defaults set",
        22 => "EEPROM corrupted or hardware failure",
        23 => "Motion time-out error",
        24 => "Data segment too long: logical forward or pause",
        25 => "Transmit overrun (obs)",
        26 => "Power on reset occurred",
        27 => "Software reset occurred",
        28 => "Diagnostic mode 1 error",
        29 => "Diagnostic mode 2 error",
        30 => "Command received during non-interruptible process",
        31 => "Rate or format selection error",
        32 => "Illegal command while in high speed mode",
        33 => "Illegal seek segment value",
        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_round_trip() {
        for code in 0..64u8 {
            if let Some(cmd) = QicCommand::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(QicCommand::from_code(1), None);
    }

    #[test]
    fn test_status_bits() {
        let status = QicStatus::from_byte(QIC_STATUS_READY | QIC_STATUS_CARTRIDGE | QIC_STATUS_AT_BOT);
        assert!(status.ready());
        assert!(status.cartridge());
        assert!(status.at_bot());
        assert!(!status.error());
        assert!(status.matches(QIC_STATUS_READY | QIC_STATUS_ERROR, QIC_STATUS_READY));
    }

    #[test]
    fn test_rate_codes() {
        for rate in [DataRate::Rate250, DataRate::Rate500, DataRate::Rate1000, DataRate::Rate2000] {
            assert_eq!(DataRate::from_qic_code(rate.qic_code()), rate);
            let config = rate.qic_code() << QIC_CONFIG_RATE_SHIFT;
            assert_eq!(DataRate::from_config(config | QIC_CONFIG_80), rate);
        }
        assert_eq!(DataRate::Rate2000.slower(), Some(DataRate::Rate1000));
        assert_eq!("500Kbps".parse::<DataRate>(), Ok(DataRate::Rate500));
        assert_eq!("1000".parse::<DataRate>(), Ok(DataRate::Rate1000));
        assert!("300".parse::<DataRate>().is_err());
    }

    #[test]
    fn test_tape_status_decode() {
        let status = QicStandard::Qic3020.tape_status_code() | TapeLength::ExtraLong.tape_status_code();
        assert_eq!(QicStandard::from_tape_status(status), Some(QicStandard::Qic3020));
        assert_eq!(TapeLength::from_tape_status(status), TapeLength::ExtraLong);
    }
}
