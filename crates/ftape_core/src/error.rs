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

    error.rs

    Error types for each layer of the engine.
*/

//! Error types for each layer of the engine. Lower layers convert upward with `?`;
//! [TapeError::class] tells the caller what kind of recovery makes sense.

use std::time::Duration;

use thiserror::Error;

use crate::device_types::qic117::{DataRate, QicCommand};

#[derive(Debug, Error)]
pub enum FdcError {
    #[error("controller not ready to {0} (msr {1:02X})")]
    NotReady(&'static str, u8),
    #[error("timed out waiting for controller interrupt")]
    InterruptTimeout,
    #[error("controller did not accept command byte {0:02X}")]
    CommandRejected(u8),
    #[error("controller result phase ended after {0} of {1} bytes")]
    ShortResult(usize, usize),
    #[error("seek to cylinder {target} ended at {pcn} (st0 {st0:02X})")]
    SeekMismatch { target: u8, pcn: u8, st0: u8 },
    #[error("controller is confused and needs a reset")]
    Confused,
    #[error("interrupt channel disconnected")]
    Disconnected,
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum QicError {
    #[error("drive did not acknowledge {0}")]
    NoAck(QicCommand),
    #[error("missing stop bit after {0}")]
    NoStopBit(QicCommand),
    #[error("{command} needs status {state:02X} under mask {mask:02X}, drive reports {status:02X}")]
    Precondition {
        command: QicCommand,
        mask: u8,
        state: u8,
        status: u8,
    },
    #[error("drive error {code} ({name}) after command {command}")]
    DriveError { code: u8, command: u8, name: &'static str },
    #[error("drive not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("no tape drive answered the wake-up sequence")]
    WakeupFailed,
    #[error("no cartridge in drive")]
    NoCartridge,
    #[error("drive rejected data rate {0}")]
    RateRejected(DataRate),
    #[error(transparent)]
    Fdc(#[from] FdcError),
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("bad header signature {0:08X}")]
    BadSignature(u32),
    #[error("unknown format code {0}")]
    UnknownFormat(u8),
    #[error("header buffer too short: {need} bytes needed, {have} present")]
    Truncated { need: usize, have: usize },
    #[error("header layout: {0}")]
    Layout(#[from] binrw::Error),
    #[error("{0} does not fit in the header segment")]
    Overflow(&'static str),
    #[error("no readable header segment found")]
    NotFound,
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("file mark map full ({0} entries)")]
    FileMarksFull(usize),
    #[error("file marks are not supported by this header version")]
    FileMarksUnsupported,
}

#[derive(Debug, Error)]
pub enum EccError {
    #[error("segment with {0} blocks cannot carry parity")]
    TooFewBlocks(usize),
    #[error("codeword buffer holds {have} bytes, {need} needed")]
    ShortBuffer { need: usize, have: usize },
}

#[derive(Debug, Error)]
pub enum TapeError {
    #[error(transparent)]
    Fdc(#[from] FdcError),
    #[error(transparent)]
    Qic(#[from] QicError),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Ecc(#[from] EccError),
    #[error("segment {0} could not be corrected")]
    EccFailure(u32),
    #[error("segment {0} is unreadable after all retries")]
    MediaDefect(u32),
    #[error("no sector id found")]
    NoSectorId,
    #[error("positioning failed: {0}")]
    Positioning(&'static str),
    #[error("segment {0} is beyond the end of the tape")]
    EndOfTape(u32),
    #[error("beginning of tape reached")]
    BeginningOfTape,
    #[error("file mark in segment {0}")]
    EndOfFile(u32),
    #[error("cartridge is write protected")]
    WriteProtected,
    #[error("buffer too small: {need} bytes needed, {have} given")]
    BufferTooSmall { need: usize, have: usize },
    #[error("operation cancelled")]
    Cancelled,
    #[error("device failed earlier; close and reopen it")]
    Failed,
}

/// What a caller can usefully do about an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient media or timing trouble; the operation may succeed if repeated.
    Retry,
    EndOfTape,
    /// A file mark was crossed; the position is already past it.
    EndOfFile,
    Cancelled,
    InvalidArgument,
    /// The device is unusable until it is closed and reopened.
    Fatal,
}

impl FdcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FdcError::Cancelled => ErrorClass::Cancelled,
            FdcError::Confused | FdcError::Disconnected => ErrorClass::Fatal,
            _ => ErrorClass::Retry,
        }
    }
}

impl QicError {
    pub fn class(&self) -> ErrorClass {
        match self {
            QicError::Fdc(e) => e.class(),
            QicError::WakeupFailed | QicError::NoCartridge => ErrorClass::Fatal,
            QicError::RateRejected(_) => ErrorClass::InvalidArgument,
            _ => ErrorClass::Retry,
        }
    }
}

impl TapeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TapeError::Fdc(e) => e.class(),
            TapeError::Qic(e) => e.class(),
            TapeError::Header(_) | TapeError::Positioning(_) | TapeError::Failed => ErrorClass::Fatal,
            // Both are only returned once the segment and ECC retries are spent.
            TapeError::EccFailure(_) | TapeError::MediaDefect(_) => ErrorClass::Fatal,
            TapeError::Map(_) | TapeError::Ecc(_) | TapeError::BufferTooSmall { .. } | TapeError::WriteProtected => {
                ErrorClass::InvalidArgument
            }
            TapeError::NoSectorId => ErrorClass::Retry,
            TapeError::EndOfTape(_) | TapeError::BeginningOfTape => ErrorClass::EndOfTape,
            TapeError::EndOfFile(_) => ErrorClass::EndOfFile,
            TapeError::Cancelled => ErrorClass::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_classes() {
        let e: TapeError = QicError::Fdc(FdcError::Cancelled).into();
        assert!(e.is_cancelled());
        let e: TapeError = FdcError::InterruptTimeout.into();
        assert_eq!(e.class(), ErrorClass::Retry);
        let e: TapeError = QicError::WakeupFailed.into();
        assert!(e.is_fatal());
        assert_eq!(TapeError::EndOfTape(5).class(), ErrorClass::EndOfTape);
    }

    #[test]
    fn test_unrecoverable_segments_are_fatal() {
        assert!(TapeError::MediaDefect(50).is_fatal());
        assert!(TapeError::EccFailure(50).is_fatal());
        assert_eq!(TapeError::NoSectorId.class(), ErrorClass::Retry);
    }
}
