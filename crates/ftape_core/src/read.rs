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

    read.rs

    Segment reads.
*/

//! Segment reads.
//!
//! The foreground hands out segments from the tail of the ring while the interrupt side
//! fills slots ahead of it. Reads that cannot be satisfied from the ring restart the tape
//! at the requested segment.

use crate::{
    buffer::{BufferRing, BufferStatus, RunnerStatus},
    device_types::{
        qic117::QicCommand,
        sector_map::{ECC_SECTORS, SECTOR_SIZE},
    },
    devices::fdc::{ErrorCause, FdcHardware, FdcOperation},
    ecc::EccOutcome,
    error::{FdcError, TapeError},
    session::{IoMode, TapeSession},
};

/// A segment as handed to the caller.
#[derive(Clone, Debug, Default)]
pub struct SegmentRead {
    /// Payload after correction: one KiB per good sector, less the parity blocks.
    pub data: Vec<u8>,
    /// Sector of the file mark recorded in this segment, if any.
    pub file_mark: Option<u16>,
}

impl<H: FdcHardware> TapeSession<H> {
    /// Read and correct one segment.
    pub fn read_segment(&mut self, segment: u32) -> Result<SegmentRead, TapeError> {
        self.check_failed()?;
        if segment >= self.geometry.total_segments() {
            return Err(TapeError::EndOfTape(segment));
        }
        if self.io_mode == IoMode::Writing {
            self.flush_buffers()?;
        }
        if self.io_mode != IoMode::Reading {
            self.io_mode = IoMode::Reading;
            self.ring.zap_reads();
        }

        let result = self.read_segment_inner(segment);
        self.finish_operation(result)
    }

    /// Common error epilogue for the segment API. A cancel quiesces the engine before it is
    /// reported; fatal errors latch the session.
    pub(crate) fn finish_operation<T>(&mut self, result: Result<T, TapeError>) -> Result<T, TapeError> {
        match result {
            Err(e) if e.is_cancelled() => {
                log::debug!("finish_operation(): cancelled, stopping the tape");
                self.ignore_cancel = true;
                if let Err(e) = self.abort_operation() {
                    log::warn!("finish_operation(): abort after cancel failed: {}", e);
                }
                self.ignore_cancel = false;
                Err(TapeError::Cancelled)
            }
            Err(e) if e.is_fatal() => {
                log::error!("finish_operation(): {}", e);
                self.failed = true;
                Err(e)
            }
            other => other,
        }
    }

    fn read_segment_inner(&mut self, segment: u32) -> Result<SegmentRead, TapeError> {
        let mut ecc_tries = 0;
        loop {
            let tail = self.ring.tail;
            let status = self.ring.slots[tail].status;
            let matches = self.ring.slots[tail].segment_id == segment;
            match status {
                BufferStatus::Done if matches => match self.correct_and_copy(tail) {
                    Ok(read) => {
                        self.ring.slots[tail].status = BufferStatus::Waiting;
                        self.ring.advance_tail();
                        return Ok(read);
                    }
                    Err(TapeError::EccFailure(_)) if ecc_tries < self.config.ecc_retries => {
                        ecc_tries += 1;
                        log::warn!("read_segment(): ECC failed on segment {}, reading it again", segment);
                        self.abort_operation()?;
                    }
                    Err(e) => {
                        self.history.defects += 1;
                        self.ring.slots[tail].status = BufferStatus::Waiting;
                        self.ring.advance_tail();
                        return Err(e);
                    }
                },
                BufferStatus::Reading if matches => self.wait_for_transfer()?,
                BufferStatus::Error if matches => {
                    if let Err(e) = self.handle_segment_error(tail) {
                        self.abort_operation()?;
                        return Err(e);
                    }
                }
                BufferStatus::Waiting if !self.runner.is_active() => {
                    if self.runner != RunnerStatus::Idle {
                        log::trace!("read_segment(): runner {} before segment {}", self.runner, segment);
                    }
                    self.start_reading(segment)?;
                }
                BufferStatus::Waiting => self.wait_for_transfer()?,
                _ => {
                    log::debug!(
                        "read_segment(): slot holds segment {} ({:?}), want {}",
                        self.ring.slots[tail].segment_id,
                        status,
                        segment
                    );
                    self.abort_operation()?;
                }
            }
        }
    }

    /// Wait for the interrupt side to make progress. A transfer that never finishes is
    /// turned into a segment error so the usual retry path picks it up.
    pub(crate) fn wait_for_transfer(&mut self) -> Result<(), TapeError> {
        match self.fdc_interrupt_wait(self.config.interrupt_timeout()) {
            Ok(()) => Ok(()),
            Err(FdcError::InterruptTimeout) => {
                let head = self.ring.head;
                let slot = &mut self.ring.slots[head];
                log::warn!("wait_for_transfer(): segment {} timed out", slot.segment_id);
                self.fdc.mode = Default::default();
                if slot.status.owned_by_isr() {
                    slot.retry += 1;
                    slot.status = BufferStatus::Error;
                    self.runner = RunnerStatus::Aborting;
                }
                else {
                    self.runner = RunnerStatus::Idle;
                }
                self.drive.tape_running = true;
                self.location.known = false;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start the tape for a fresh read of `segment` into the tail slot.
    fn start_reading(&mut self, segment: u32) -> Result<(), TapeError> {
        let tail = self.ring.tail;
        self.ring.head = tail;
        self.setup_new_segment(tail, segment);
        if self.ring.slots[tail].is_fake() {
            // Nothing on tape worth reading.
            self.ring.slots[tail].status = BufferStatus::Done;
            self.ring.advance_head();
            return Ok(());
        }
        self.arm_transfer(tail, FdcOperation::Read)
    }

    /// Position the tape for the slot at `index` and start its first cluster.
    pub(crate) fn arm_transfer(&mut self, index: usize, op: FdcOperation) -> Result<(), TapeError> {
        if self.ring.slots[index].calc_next_cluster() == 0 {
            // Everything was transferred before the restart.
            self.ring.slots[index].status = BufferStatus::Done;
            self.ring.head = BufferRing::next_index(index);
            self.runner = RunnerStatus::Idle;
            return Ok(());
        }
        let segment = self.ring.slots[index].segment_id;
        let offset = self.ring.slots[index].sector_offset;
        self.start_tape(segment, offset)?;

        self.ring.head = index;
        self.ring.slots[index].status = match op {
            FdcOperation::Read | FdcOperation::ReadDeleted => BufferStatus::Reading,
            FdcOperation::Write | FdcOperation::WriteDeleted => BufferStatus::Writing,
        };
        self.runner = RunnerStatus::Running;
        if let Err(e) = self.setup_fdc_and_dma(index, op) {
            self.ring.slots[index].status = BufferStatus::Error;
            self.runner = RunnerStatus::Idle;
            return Err(e.into());
        }
        Ok(())
    }

    /// Recover from a failed pass over the slot at `index`: let the tape settle, then
    /// reposition and go over what is missing. Gives up after the configured number of
    /// passes.
    pub(crate) fn handle_segment_error(&mut self, index: usize) -> Result<(), TapeError> {
        if self.drive.tape_running {
            self.stop_tape()?;
        }
        else if self.drive.pending_motion.is_some() {
            self.ready_wait(QicCommand::Pause.info().timeout)?;
        }
        self.runner = RunnerStatus::Idle;

        let segment = self.ring.slots[index].segment_id;
        let retry = self.ring.slots[index].retry;
        let r = self.fdc.last_result;
        match ErrorCause::decode(r[0], r[1], r[2]) {
            ErrorCause::WriteProtect => {
                self.drive.write_protected = true;
                return Err(TapeError::WriteProtected);
            }
            ErrorCause::Invalid | ErrorCause::ReadyChange => {
                self.history.defects += 1;
                return Err(TapeError::MediaDefect(segment));
            }
            _ => {}
        }
        if retry > self.config.segment_retries {
            log::error!("handle_segment_error(): segment {} failed {} times", segment, retry);
            self.history.defects += 1;
            return Err(TapeError::MediaDefect(segment));
        }

        if self.config.rate_fallback_retry > 0 && retry == self.config.rate_fallback_retry {
            if let Some(slower) = self.drive.data_rate.slower() {
                log::warn!("handle_segment_error(): falling back to {}", slower);
                match self.set_data_rate(slower) {
                    Ok(()) => self.history.rate_fallbacks += 1,
                    Err(e) => log::warn!("handle_segment_error(): rate change failed: {}", e),
                }
            }
        }

        self.history.segment_retries += 1;
        log::debug!(
            "handle_segment_error(): segment {} retry {} from sector {}",
            segment,
            retry,
            self.ring.slots[index].sector_offset
        );
        let op = match self.io_mode {
            IoMode::Writing => FdcOperation::Write,
            _ => FdcOperation::Read,
        };
        self.arm_transfer(index, op)
    }

    /// Run the codec over a completed slot and copy out the payload.
    fn correct_and_copy(&mut self, index: usize) -> Result<SegmentRead, TapeError> {
        let segment = self.ring.slots[index].segment_id;
        let file_mark = self.file_mark_in(segment);

        let slot = &mut self.ring.slots[index];
        let blocks = slot.blocks();
        if slot.is_fake() || blocks <= ECC_SECTORS {
            return Ok(SegmentRead {
                data: Vec::new(),
                file_mark,
            });
        }

        let erasures = slot.erasures();
        match self.ecc.correct(&mut slot.data[..blocks * SECTOR_SIZE], blocks, erasures) {
            EccOutcome::Ok => {}
            EccOutcome::Corrected(map) => {
                log::debug!("correct_and_copy(): segment {} corrected blocks {}", segment, map);
                self.history.corrected += map.count();
            }
            EccOutcome::Failed => {
                log::warn!(
                    "correct_and_copy(): segment {} uncorrectable, erasures {}",
                    segment,
                    erasures
                );
                self.history.ecc_failures += 1;
                return Err(TapeError::EccFailure(segment));
            }
        }
        let len = (blocks - ECC_SECTORS) * SECTOR_SIZE;
        Ok(SegmentRead {
            data: slot.data[..len].to_vec(),
            file_mark,
        })
    }
}
