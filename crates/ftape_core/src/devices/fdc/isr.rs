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

    devices::fdc::isr.rs

    Interrupt handler and the runner that keeps the tape streaming.
*/

//! Interrupt handler.
//!
//! Runs whenever the foreground pumps the event channel. It finishes transfers, decides
//! how far a cluster got, chains the next cluster or segment without involving the
//! foreground, and stops the tape when the ring runs dry or an error needs repositioning.

use crate::{
    buffer::{BufferStatus, RunnerStatus},
    device_types::{
        fdc::*,
        geometry::SectorId,
        qic117::QicCommand,
        sector_map::{SectorMap, ECC_SECTORS, SECTOR_SIZE},
    },
    devices::{
        fdc::{ErrorCause, FdcEvent, FdcHardware, FdcMode, FdcOperation},
        tape_drive::fold_cylinder,
    },
    session::{IoMode, TapeSession},
};

impl<H: FdcHardware> TapeSession<H> {
    pub fn fdc_isr(&mut self, event: FdcEvent) {
        if self.fdc.in_isr {
            log::warn!("fdc_isr(): re-entered on {:?}", event);
            return;
        }
        self.fdc.in_isr = true;

        let msr = self.hw.read_msr();
        let visible = if msr & FDC_STATUS_FDC_BUSY != 0 {
            self.isr_result_phase()
        }
        else {
            self.isr_status_change()
        };
        if visible {
            self.fdc.interrupt_seen = true;
        }
        self.fdc.in_isr = false;
    }

    /// The controller has a result for us.
    fn isr_result_phase(&mut self) -> bool {
        let mut result = [0u8; FDC_RESULT_LEN];
        if let Err(e) = self.fdc_result(&mut result) {
            log::error!("fdc_isr(): lost result phase in {:?}: {}", self.fdc.mode, e);
            self.fdc.mode = FdcMode::Idle;
            return true;
        }
        self.fdc.last_result = result;
        let cause = ErrorCause::decode(result[0], result[1], result[2]);

        match self.fdc.mode {
            FdcMode::ReadingData | FdcMode::WritingData => {
                self.isr_transfer_done(cause);
                true
            }
            FdcMode::ReadingId => {
                self.fdc.last_id = match cause {
                    ErrorCause::NoError => Some(SectorId {
                        cyl: result[3],
                        head: result[4],
                        sect: result[5],
                        size: result[6],
                    }),
                    _ => None,
                };
                self.fdc.mode = FdcMode::Idle;
                true
            }
            mode => {
                log::warn!("fdc_isr(): unexpected result {:02X?} in {:?}", result, mode);
                self.fdc.mode = FdcMode::Idle;
                true
            }
        }
    }

    /// No result pending: a seek finished, the controller came out of reset, or something
    /// we did not ask for happened.
    fn isr_status_change(&mut self) -> bool {
        match self.fdc.mode {
            FdcMode::Seeking | FdcMode::Recalibrating if self.fdc.hide_interrupt => {
                match self.fdc_sense_interrupt_status() {
                    Ok((_, pcn)) => self.fdc.current_cylinder = pcn,
                    Err(e) => log::warn!("fdc_isr(): sense after hidden seek failed: {}", e),
                }
                self.fdc.mode = FdcMode::Idle;
                self.fdc.hide_interrupt = false;
                self.fdc.seek_completed = true;
                false
            }
            FdcMode::Seeking | FdcMode::Recalibrating => {
                self.fdc.seek_completed = true;
                true
            }
            _ if self.fdc.resetting => true,
            _ if self.fdc.expected_stray > 0 => {
                self.fdc.expected_stray -= 1;
                match self.fdc_sense_interrupt_status() {
                    Ok((_, pcn)) => self.fdc.current_cylinder = pcn,
                    Err(e) => log::warn!("fdc_isr(): sense after tape command failed: {}", e),
                }
                false
            }
            _ if self.fdc.waiting => true,
            mode => {
                self.history.stray_interrupts += 1;
                let sensed = self.fdc_sense_interrupt_status();
                log::warn!("fdc_isr(): stray interrupt in {:?}: {:?}", mode, sensed);
                false
            }
        }
    }

    fn isr_transfer_done(&mut self, cause: ErrorCause) {
        let index = self.ring.head;
        let op = match self.fdc.mode {
            FdcMode::WritingData => FdcOperation::Write,
            _ => FdcOperation::Read,
        };
        self.fdc.mode = FdcMode::Idle;

        if self.runner == RunnerStatus::DoAbort {
            self.isr_abort(index);
            return;
        }
        if self.ring.slots[index].is_fake() {
            self.continue_xfer(index, op);
            return;
        }

        self.determine_progress(index, op, cause);
        match cause {
            ErrorCause::IdAm => self.history.id_am_errors += 1,
            ErrorCause::IdCrc => self.history.id_crc_errors += 1,
            ErrorCause::DataAm => self.history.data_am_errors += 1,
            ErrorCause::DataCrc => self.history.crc_errors += 1,
            ErrorCause::NoData => self.history.no_data_errors += 1,
            ErrorCause::Overrun => self.history.overrun_errors += 1,
            _ => {}
        }

        match cause {
            ErrorCause::NoError => self.continue_xfer(index, op),
            ErrorCause::WriteProtect | ErrorCause::Invalid | ErrorCause::ReadyChange => {
                log::error!(
                    "fdc_isr(): {} on segment {}, giving up",
                    cause,
                    self.ring.slots[index].segment_id
                );
                self.ring.slots[index].status = BufferStatus::Error;
                self.isr_tape_command(QicCommand::StopTape, false);
                self.runner = RunnerStatus::Aborting;
            }
            _ => {
                let slot = &self.ring.slots[index];
                log::debug!(
                    "fdc_isr(): {} in segment {} at sector {}, {} errors",
                    cause,
                    slot.segment_id,
                    slot.sector_offset,
                    slot.error_count()
                );
                if slot.error_count() <= 1 && cause != ErrorCause::NoData {
                    // One bad sector per segment is left to the codec.
                    self.continue_xfer(index, op);
                }
                else {
                    self.retry_sector(index);
                }
            }
        }
    }

    /// Work out how many sectors of the cluster made it from the DMA residue, record the
    /// failing sector, and step the slot past what is done.
    fn determine_progress(&mut self, index: usize, op: FdcOperation, cause: ErrorCause) {
        let residue = self.hw.dma_residue();
        let slot = &mut self.ring.slots[index];
        let (transferred, failing) = transfer_progress(
            cause,
            slot.sector_count,
            residue,
            self.config.quirks.crc_error_already_past,
        );

        if op == FdcOperation::Read {
            let bytes = transferred as usize * SECTOR_SIZE;
            let dest = slot.cluster_data_mut();
            let len = bytes.min(dest.len());
            self.hw.dma_collect(&mut dest[..len]);
        }

        let segment = slot.segment_id;
        slot.advance(transferred);
        if let Some(position) = failing {
            let failing = match position {
                FailingSector::LastMoved => slot.sector_offset - 1,
                FailingSector::AfterMoved => {
                    let failing = slot.sector_offset;
                    slot.skip_bad_sector();
                    failing
                }
            };
            if slot.retry < self.config.soft_retries {
                slot.soft_error_map.set(failing);
            }
            else {
                slot.hard_error_map.set(failing);
                slot.soft_error_map.clear(failing);
            }
        }

        if transferred > 0 {
            self.location.segment = segment as i64;
            self.location.sector = slot.sector_offset;
            self.location.known = true;
        }
    }

    /// Reposition and go over the failing part of the segment again.
    fn retry_sector(&mut self, index: usize) {
        let slot = &mut self.ring.slots[index];
        let resume = slot.soft_error_map.first_set().unwrap_or(slot.sector_offset);
        log::debug!(
            "retry_sector(): segment {} from sector {} (retry {})",
            slot.segment_id,
            resume,
            slot.retry + 1
        );
        slot.resume_at(resume);
        slot.retry += 1;
        slot.status = BufferStatus::Error;
        self.history.sector_retries += 1;

        self.isr_tape_command(QicCommand::MicroStepPause, true);
        self.drive.offtrack_suspect = true;
        self.location.known = false;
        self.runner = RunnerStatus::Aborting;
    }

    /// The current cluster is done. Start the next one, move on to the next segment, or
    /// stop the tape.
    fn continue_xfer(&mut self, index: usize, op: FdcOperation) {
        let mut index = index;
        loop {
            let slot = &mut self.ring.slots[index];
            if !slot.is_fake() && slot.calc_next_cluster() > 0 {
                break;
            }

            // Segment complete.
            slot.status = BufferStatus::Done;
            let segment = slot.segment_id;
            let next = slot.next_segment;
            self.location.segment = segment as i64;
            self.location.sector = 0;
            self.ring.advance_head();

            if next == 0 {
                log::trace!("continue_xfer(): segment {} done, nothing queued", segment);
                self.isr_tape_command(QicCommand::Pause, true);
                self.runner = RunnerStatus::Idle;
                return;
            }
            if next >= self.geometry.total_segments() {
                log::debug!("continue_xfer(): segment {} is the last on tape", segment);
                self.runner = RunnerStatus::EndOfTape;
                return;
            }
            if self.geometry.track_of(next) != self.geometry.track_of(segment) {
                // The drive runs on to the end of the track and stops by itself.
                log::trace!("continue_xfer(): end of track after segment {}", segment);
                self.runner = RunnerStatus::LogicalEot;
                return;
            }

            let next_index = self.ring.head;
            let next_status = self.ring.slots[next_index].status;
            let next_id = self.ring.slots[next_index].segment_id;
            match op {
                FdcOperation::Read | FdcOperation::ReadDeleted => {
                    if next_status != BufferStatus::Waiting {
                        log::trace!("continue_xfer(): ring full at segment {}", next);
                        self.isr_tape_command(QicCommand::Pause, true);
                        self.runner = RunnerStatus::BufferOverrun;
                        return;
                    }
                    self.setup_new_segment(next_index, next);
                    self.ring.slots[next_index].status = BufferStatus::Reading;
                }
                FdcOperation::Write | FdcOperation::WriteDeleted => match next_status {
                    BufferStatus::Waiting if next_id == next => {
                        self.ring.slots[next_index].status = BufferStatus::Writing;
                    }
                    BufferStatus::Waiting => {
                        log::debug!(
                            "continue_xfer(): queued segment {} does not follow {}",
                            next_id,
                            segment
                        );
                        self.isr_tape_command(QicCommand::Pause, true);
                        self.runner = RunnerStatus::Idle;
                        return;
                    }
                    _ => {
                        log::trace!("continue_xfer(): ring empty after segment {}", segment);
                        self.isr_tape_command(QicCommand::Pause, true);
                        self.runner = RunnerStatus::BufferUnderrun;
                        return;
                    }
                },
            }
            index = next_index;
        }

        if let Err(e) = self.setup_fdc_and_dma(index, op) {
            log::error!("continue_xfer(): could not start transfer: {}", e);
            self.ring.slots[index].status = BufferStatus::Error;
            self.isr_tape_command(QicCommand::StopTape, false);
            self.runner = RunnerStatus::Aborting;
        }
    }

    /// Prepare the slot at `index` for a pass over `segment`, taking the bad-sector map
    /// into account. Segments with no room for data past the parity blocks become fake
    /// slots that complete without touching the tape.
    pub fn setup_new_segment(&mut self, index: usize, segment: u32) {
        let mut map = self.bsm.get_bad_sector_entry(segment);
        if map.is_empty_segment() || map.good_count() as usize <= ECC_SECTORS {
            map = SectorMap::FAKE_SEGMENT;
        }
        let next = match self.io_mode {
            IoMode::Reading if !self.config.read_ahead => 0,
            _ => segment + 1,
        };
        let address = self.geometry.segment_address(segment);
        self.ring.slots[index].setup(segment, address, map, next);
        log::trace!("setup_new_segment(): slot {} segment {} bsm {}", index, segment, map);
    }

    /// Send a motion command from inside the handler. A hidden command's seek interrupt is
    /// swallowed here; otherwise the interrupt is expected as a stray and the foreground
    /// waits for the drive to come ready.
    pub fn isr_tape_command(&mut self, command: QicCommand, hidden: bool) {
        let target = fold_cylinder(self.fdc.current_cylinder, command.code());
        if hidden {
            self.fdc.mode = FdcMode::Seeking;
            self.fdc.hide_interrupt = true;
        }
        else {
            self.fdc.mode = FdcMode::Idle;
            self.fdc.expected_stray += 1;
        }
        log::trace!("isr_tape_command(): {} (hidden: {})", command, hidden);
        if let Err(e) = self.fdc_seek_nowait(target) {
            log::error!("isr_tape_command(): {} not sent: {}", command, e);
            self.fdc.mode = FdcMode::Idle;
            self.fdc.hide_interrupt = false;
            self.fdc.expected_stray = self.fdc.expected_stray.saturating_sub(if hidden { 0 } else { 1 });
            return;
        }
        self.drive.current_command = command;
        self.drive.pending_motion = Some(command);
        self.drive.tape_running = false;
        self.location.known = false;
    }

    fn isr_abort(&mut self, index: usize) {
        log::debug!("isr_abort(): stopping at segment {}", self.ring.slots[index].segment_id);
        let slot = &mut self.ring.slots[index];
        slot.status = match self.io_mode {
            IoMode::Writing => BufferStatus::Done,
            _ => BufferStatus::Waiting,
        };
        self.isr_tape_command(QicCommand::StopTape, false);
        self.runner = RunnerStatus::Aborting;
    }
}

/// Where the failing sector of an abnormal completion sits relative to the sectors that
/// were moved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FailingSector {
    /// The last sector moved. The controller flags a data CRC error only after the sector
    /// has gone through DMA.
    LastMoved,
    /// The sector following those moved.
    AfterMoved,
}

/// Sectors of a `count` sector cluster that completed, given the DMA `residue` in bytes,
/// and where the failing sector lies.
///
/// | cause                 | moved              | failing sector |
/// |-----------------------|--------------------|----------------|
/// | no error              | `count`            | none           |
/// | data CRC, quirk on    | `count - residue`  | last moved     |
/// | anything else         | `count - residue`  | after moved    |
///
/// With nothing moved there is no last sector, so a data CRC error falls back to the
/// general rule.
pub fn transfer_progress(cause: ErrorCause, count: u8, residue: usize, crc_already_past: bool) -> (u8, Option<FailingSector>) {
    let not_done = residue.div_ceil(SECTOR_SIZE).min(count as usize) as u8;
    let moved = count - not_done;
    match cause {
        ErrorCause::NoError => (count, None),
        ErrorCause::DataCrc if crc_already_past && moved > 0 => (moved, Some(FailingSector::LastMoved)),
        _ => (moved, Some(FailingSector::AfterMoved)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_completion_moves_everything() {
        assert_eq!(transfer_progress(ErrorCause::NoError, 29, 0, true), (29, None));
        // A clean completion with residue left only happens on a short cluster.
        assert_eq!(transfer_progress(ErrorCause::NoError, 4, 1024, true), (4, None));
    }

    #[test]
    fn test_crc_error_points_behind() {
        // Sectors 0 and 1 of a 3 sector cluster came through, the second with bad data.
        assert_eq!(
            transfer_progress(ErrorCause::DataCrc, 3, SECTOR_SIZE, true),
            (2, Some(FailingSector::LastMoved))
        );
        assert_eq!(
            transfer_progress(ErrorCause::DataCrc, 3, SECTOR_SIZE, false),
            (2, Some(FailingSector::AfterMoved))
        );
        assert_eq!(
            transfer_progress(ErrorCause::DataCrc, 3, 3 * SECTOR_SIZE, true),
            (0, Some(FailingSector::AfterMoved))
        );
    }

    #[test]
    fn test_other_errors_point_ahead() {
        for cause in [
            ErrorCause::IdAm,
            ErrorCause::IdCrc,
            ErrorCause::DataAm,
            ErrorCause::NoData,
            ErrorCause::Overrun,
        ] {
            assert_eq!(
                transfer_progress(cause, 10, 2 * SECTOR_SIZE, true),
                (8, Some(FailingSector::AfterMoved)),
                "{:?}",
                cause
            );
        }
    }

    #[test]
    fn test_partial_sector_residue_counts_as_not_done() {
        assert_eq!(
            transfer_progress(ErrorCause::Overrun, 5, SECTOR_SIZE + 1, true),
            (3, Some(FailingSector::AfterMoved))
        );
        // Residue larger than the cluster cannot make the count negative.
        assert_eq!(
            transfer_progress(ErrorCause::IdAm, 2, 10 * SECTOR_SIZE, true),
            (0, Some(FailingSector::AfterMoved))
        );
    }
}
