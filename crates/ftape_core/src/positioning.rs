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

    positioning.rs

    Brings the tape into start position in front of a segment.
*/

//! Segment positioning.
//!
//! The drive can only be steered roughly: blind skips that land somewhere near the goal,
//! and streaming while watching sector IDs go by. [TapeSession::start_tape] combines both
//! to get the tape running just ahead of a segment, learning from every skip how far off
//! its estimate was.

use crate::{
    buffer::RunnerStatus,
    device_types::{
        fdc::{COMMAND_MFM_BIT, COMMAND_READ_SECTOR_ID},
        geometry::TapeGeometry,
        qic117::{QicCommand, QicStatus},
        sector_map::SECTORS_PER_SEGMENT,
    },
    devices::{
        fdc::{FdcHardware, FdcMode},
        tape_drive::SkipDirection,
    },
    error::{FdcError, TapeError},
    session::TapeSession,
};

const MIN_OVERSHOOT: i32 = -8;
const MAX_OVERSHOOT: i32 = 16;
const MAX_MIN_REWIND: u32 = 16;
/// Sector IDs to try for before the position is declared unknowable.
const DETERMINE_TRIES: usize = 64;

/// Best knowledge of where the head is.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub track: Option<u32>,
    /// Last segment seen under the head; one before the track's first segment at its start.
    /// Kept as an estimate when `known` is cleared.
    pub segment: i64,
    pub sector: u8,
    pub known: bool,
    /// At the logical start of the track.
    pub bot: bool,
    /// At the logical end of the track.
    pub eot: bool,
}

impl Location {
    pub fn set_track_start(&mut self, track: u32, geometry: &TapeGeometry) {
        *self = Location {
            track: Some(track),
            segment: geometry.track_start(track) as i64 - 1,
            sector: 0,
            known: true,
            bot: true,
            eot: false,
        };
    }

    pub fn set_track_end(&mut self, track: u32, geometry: &TapeGeometry) {
        *self = Location {
            track: Some(track),
            segment: geometry.track_end(track) as i64,
            sector: (SECTORS_PER_SEGMENT - 1) as u8,
            known: true,
            bot: false,
            eot: true,
        };
    }
}

/// Odd tracks run the other way, so the physical end flags swap meaning.
pub fn logical_ends(track: u32, status: QicStatus) -> (bool, bool) {
    if track % 2 == 0 {
        (status.at_bot(), status.at_eot())
    }
    else {
        (status.at_eot(), status.at_bot())
    }
}

/// Correction terms learned from skips. They start at values that suit most drives and
/// drift towards whatever this drive and cartridge actually do.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PositioningCalibration {
    /// Segments a forward skip lands beyond the requested count.
    pub overshoot: i32,
    /// Shortest gap worth a forward skip; anything closer is crept up on.
    pub min_count: u32,
    /// Segments a reverse skip travels beyond the requested count.
    pub rev_overshoot: i32,
    /// Shortest reverse skip that reliably moves the tape.
    pub min_rewind: u32,
    /// Segments the tape travels between deciding to stop and stopping.
    pub start_offset: u32,
}

impl Default for PositioningCalibration {
    fn default() -> Self {
        PositioningCalibration {
            overshoot: 1,
            min_count: 8,
            rev_overshoot: 2,
            min_rewind: 2,
            start_offset: 1,
        }
    }
}

impl PositioningCalibration {
    /// `err` is how many segments past the estimate a forward skip landed.
    pub fn learn_forward(&mut self, err: i64) {
        let step = (err - self.overshoot as i64).signum() as i32;
        self.overshoot = (self.overshoot + step).clamp(MIN_OVERSHOOT, MAX_OVERSHOOT);
    }

    /// `err` is how many segments further back than estimated a reverse skip landed.
    /// A short skip that did not get far enough back raises the minimum rewind.
    pub fn learn_reverse(&mut self, err: i64, short: bool, early_enough: bool) {
        let step = (err - self.rev_overshoot as i64).signum() as i32;
        self.rev_overshoot = (self.rev_overshoot + step).clamp(MIN_OVERSHOOT, MAX_OVERSHOOT);
        if short && !early_enough {
            self.min_rewind = (self.min_rewind + 1).min(MAX_MIN_REWIND);
        }
    }
}

/// A skip whose landing has not been observed yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PendingSkip {
    pub expected: i64,
    pub goal: u32,
    pub reverse: bool,
    pub short: bool,
}

impl<H: FdcHardware> TapeSession<H> {
    /// Read the next sector ID passing under the head and update the location from it.
    pub fn read_id(&mut self) -> Result<(), TapeError> {
        self.fdc.last_id = None;
        self.fdc.mode = FdcMode::ReadingId;
        let dhs = self.fdc.dhs(0);
        if let Err(e) = self.fdc_command(&[COMMAND_READ_SECTOR_ID | COMMAND_MFM_BIT, dhs]) {
            self.fdc.mode = FdcMode::Idle;
            return Err(e.into());
        }
        match self.fdc_interrupt_wait(self.config.interrupt_timeout()) {
            Ok(()) => {}
            Err(FdcError::InterruptTimeout) => return Err(TapeError::NoSectorId),
            Err(e) => return Err(e.into()),
        }

        let id = self.fdc.last_id.take().ok_or(TapeError::NoSectorId)?;
        let Some((segment, sector)) = self.geometry.segment_from_id(&id)
        else {
            log::warn!("read_id(): id {:?} does not belong to this tape", id);
            return Err(TapeError::NoSectorId);
        };
        log::trace!("read_id(): segment {} sector {}", segment, sector);
        self.location.track = self.drive.track;
        self.location.segment = segment as i64;
        self.location.sector = sector;
        self.location.known = true;
        self.location.bot = false;
        self.location.eot = false;
        self.resolve_pending_skip(segment);
        Ok(())
    }

    fn resolve_pending_skip(&mut self, landed: u32) {
        let Some(skip) = self.pending_skip.take()
        else {
            return;
        };
        let landed = landed as i64;
        if skip.reverse {
            let early_enough = landed < skip.goal as i64 - 1;
            self.positioning
                .learn_reverse(skip.expected - landed, skip.short, early_enough);
        }
        else {
            self.positioning.learn_forward(landed - skip.expected);
        }
        log::debug!(
            "resolve_pending_skip(): expected {}, landed {}, calibration {:?}",
            skip.expected,
            landed,
            self.positioning
        );
    }

    /// Find out where the tape is, from the end-of-track flags if it is sitting at one end,
    /// otherwise by running it and reading sector IDs.
    pub fn determine_position(&mut self) -> Result<(), TapeError> {
        if self.runner == RunnerStatus::LogicalEot {
            // The drive is running out the track on its own.
            self.ready_wait(QicCommand::LogicalForward.info().timeout)?;
            self.runner = RunnerStatus::Idle;
        }
        else if self.drive.tape_running {
            self.stop_tape()?;
        }
        let status = self.ready_wait(QicCommand::StopTape.info().timeout)?;

        let track = match self.drive.track {
            Some(track) => track,
            None => {
                self.seek_head_to_track(0)?;
                0
            }
        };
        let (bot, eot) = logical_ends(track, status);
        if bot {
            log::debug!("determine_position(): at start of track {}", track);
            self.location.set_track_start(track, &self.geometry);
            self.pending_skip = None;
            return Ok(());
        }
        if eot {
            log::debug!("determine_position(): at end of track {}", track);
            self.location.set_track_end(track, &self.geometry);
            self.pending_skip = None;
            return Ok(());
        }

        self.logical_forward()?;
        for attempt in 0..DETERMINE_TRIES {
            self.check_cancel()?;
            match self.read_id() {
                Ok(()) => return Ok(()),
                Err(TapeError::NoSectorId) => {
                    if attempt % 8 == 7 {
                        let status = self.report_drive_status()?;
                        if status.ready() {
                            // Stopped by itself: either the end of the track, or trouble.
                            self.drive.tape_running = false;
                            let (_, eot) = logical_ends(track, status);
                            if eot {
                                self.location.set_track_end(track, &self.geometry);
                                self.pending_skip = None;
                                return Ok(());
                            }
                            log::error!("determine_position(): drive stopped without reason");
                            return Err(TapeError::Positioning("drive stopped while searching for sector ids"));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(TapeError::Positioning("no sector id found"))
    }

    /// The tape is streaming and the next sector to arrive is where the transfer starts.
    fn in_start_position(&self, segment: u32, sector_offset: u8) -> bool {
        let goal = segment as i64;
        self.location.known
            && self.drive.tape_running
            && (self.location.segment == goal - 1
                || (self.location.segment == goal && self.location.sector < sector_offset))
    }

    /// Get the tape streaming just ahead of `sector_offset` in `segment`. A failure to get
    /// there latches the session failed.
    pub fn start_tape(&mut self, segment: u32, sector_offset: u8) -> Result<(), TapeError> {
        let result = self.start_tape_inner(segment, sector_offset);
        if let Err(TapeError::Positioning(what)) = &result {
            log::error!("start_tape(): segment {}: {}", segment, what);
            self.failed = true;
        }
        result
    }

    fn start_tape_inner(&mut self, segment: u32, sector_offset: u8) -> Result<(), TapeError> {
        let track = self.geometry.track_of(segment);
        if self.runner == RunnerStatus::LogicalEot {
            self.ready_wait(QicCommand::LogicalForward.info().timeout)?;
            self.runner = RunnerStatus::Idle;
            self.location.known = false;
        }
        if self.drive.track != Some(track) || self.drive.offtrack_suspect {
            self.seek_head_to_track(track)?;
        }

        let goal = segment as i64;
        for attempt in 0..self.config.start_retries.max(1) {
            self.check_cancel()?;
            if !self.location.known {
                self.determine_position()?;
            }
            if self.in_start_position(segment, sector_offset) {
                log::trace!(
                    "start_tape(): in position for {}:{} after {} attempts",
                    segment,
                    sector_offset,
                    attempt
                );
                return Ok(());
            }

            let current = self.location.segment;
            if current == goal - 1 && !self.drive.tape_running {
                // Sitting right in front of it, typically at the start of the track.
                self.logical_forward()?;
                return Ok(());
            }
            if current >= goal {
                self.stop_tape()?;
                let into_track = goal - self.geometry.track_start(track) as i64;
                if into_track <= (self.positioning.start_offset + self.positioning.min_rewind) as i64 {
                    self.rewind_to_track_start()?;
                }
                else {
                    self.skip_reverse(segment)?;
                }
            }
            else {
                self.seek_forward(segment)?;
            }
        }
        Err(TapeError::Positioning("start position not reached"))
    }

    /// Move forward until the tape streams over the segment before `segment`. Long gaps
    /// are covered with a skip first.
    pub fn seek_forward(&mut self, segment: u32) -> Result<(), TapeError> {
        let target = segment as i64 - 1;
        if self.location.known {
            let from = self.location.segment;
            let count = target - from;
            if count > self.positioning.min_count as i64 {
                self.stop_tape()?;
                let skip = (count - self.positioning.overshoot as i64).max(1) as u32;
                log::debug!("seek_forward(): skipping {} from {} towards {}", skip, from, segment);
                self.skip_segments(skip, SkipDirection::Forward)?;
                self.pending_skip = Some(PendingSkip {
                    expected: from + skip as i64,
                    goal: segment,
                    reverse: false,
                    short: false,
                });
            }
        }
        if !self.drive.tape_running {
            self.logical_forward()?;
        }

        let track = self.drive.track.unwrap_or(0);
        let mut failures = 0;
        loop {
            self.check_cancel()?;
            if self.location.known && self.drive.tape_running && self.location.segment >= target {
                return Ok(());
            }
            match self.read_id() {
                Ok(()) => {
                    failures = 0;
                    let seen = self.location.segment as u32;
                    if self.geometry.track_of(seen) != track {
                        log::error!(
                            "seek_forward(): read segment {} on track {}, expected track {}",
                            seen,
                            self.geometry.track_of(seen),
                            track
                        );
                        return Err(TapeError::Positioning("head is off track"));
                    }
                }
                Err(TapeError::NoSectorId) => {
                    failures += 1;
                    if failures > SECTORS_PER_SEGMENT {
                        return Err(TapeError::Positioning("no sector ids while creeping"));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Back up to land a little ahead of `segment`. Leaves the tape stopped at an unknown
    /// position for the caller to locate.
    pub fn skip_reverse(&mut self, segment: u32) -> Result<(), TapeError> {
        let from = self.location.segment;
        let landing = segment as i64 - 1 - self.positioning.start_offset as i64;
        self.stop_tape()?;
        let travel = from - landing;
        let wanted = travel - self.positioning.rev_overshoot as i64;
        let short = wanted < self.positioning.min_rewind as i64;
        let skip = if short {
            self.positioning.min_rewind
        }
        else {
            wanted as u32
        };
        log::debug!("skip_reverse(): skipping back {} from {} towards {}", skip, from, segment);
        self.skip_segments(skip, SkipDirection::Reverse)?;
        self.pending_skip = Some(PendingSkip {
            expected: from - skip as i64,
            goal: segment,
            reverse: true,
            short,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learn_forward_converges() {
        let mut cal = PositioningCalibration::default();
        for _ in 0..20 {
            cal.learn_forward(5);
        }
        assert_eq!(cal.overshoot, 5);
        for _ in 0..40 {
            cal.learn_forward(-30);
        }
        assert_eq!(cal.overshoot, MIN_OVERSHOOT);
    }

    #[test]
    fn test_learn_reverse_raises_min_rewind() {
        let mut cal = PositioningCalibration::default();
        cal.learn_reverse(2, true, false);
        assert_eq!(cal.min_rewind, 3);
        assert_eq!(cal.rev_overshoot, 2);
        cal.learn_reverse(0, true, true);
        assert_eq!(cal.min_rewind, 3);
        assert_eq!(cal.rev_overshoot, 1);
    }

    #[test]
    fn test_logical_ends_swap_on_odd_tracks() {
        let status = QicStatus::from_byte(0x40 | 0x01);
        assert_eq!(logical_ends(0, status), (true, false));
        assert_eq!(logical_ends(1, status), (false, true));
    }

    #[test]
    fn test_track_start() {
        let geometry = TapeGeometry::new(100, 28);
        let mut location = Location::default();
        location.set_track_start(3, &geometry);
        assert_eq!(location.segment, 299);
        assert!(location.known && location.bot);
        location.set_track_end(3, &geometry);
        assert_eq!(location.segment, 399);
        assert!(location.eot);
    }
}
