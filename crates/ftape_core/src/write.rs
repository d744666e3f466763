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

    write.rs

    Segment writes, flushing and aborts.
*/

//! Segment writes, flushing and aborts.
//!
//! Writes are queued at the tail of the ring with their parity already generated. The
//! interrupt side streams queued segments to tape from the head and pauses the tape when
//! it runs out of them.

use crate::{
    buffer::{BufferStatus, RunnerStatus},
    device_types::{
        qic117::QicCommand,
        sector_map::{ECC_SECTORS, SECTOR_SIZE},
    },
    devices::fdc::{FdcHardware, FdcMode, FdcOperation, INTERRUPT_POLL_SLICE},
    error::TapeError,
    session::{IoMode, TapeSession},
};

impl<H: FdcHardware> TapeSession<H> {
    /// Queue `data` for `segment`. Short data is padded with zeros; data beyond the
    /// segment's capacity is not taken. Returns the bytes taken. With `flush` set the call
    /// returns only once everything queued is on tape.
    pub fn write_segment(&mut self, segment: u32, data: &[u8], flush: bool) -> Result<usize, TapeError> {
        self.check_failed()?;
        if self.drive.write_protected {
            return Err(TapeError::WriteProtected);
        }
        if segment >= self.geometry.total_segments() {
            return Err(TapeError::EndOfTape(segment));
        }
        if self.io_mode != IoMode::Writing {
            if self.io_mode == IoMode::Reading {
                self.abort_operation()?;
            }
            self.io_mode = IoMode::Writing;
            self.ring.zap_writes();
        }
        if segment >= self.first_data_segment {
            let dropped = self.eof.clear_from(segment);
            if dropped > 0 {
                log::debug!("write_segment(): {} file marks at or after {} dropped", dropped, segment);
            }
        }

        let result = self.write_segment_inner(segment, data, flush);
        self.finish_operation(result)
    }

    fn write_segment_inner(&mut self, segment: u32, data: &[u8], flush: bool) -> Result<usize, TapeError> {
        loop {
            let head = self.ring.head;
            if self.ring.slots[head].status == BufferStatus::Error {
                self.retry_write(head)?;
                continue;
            }

            let tail = self.ring.tail;
            if self.ring.slots[tail].status == BufferStatus::Done {
                self.setup_new_segment(tail, segment);
                let taken = self.copy_and_gen_ecc(tail, data)?;
                self.ring.slots[tail].status = BufferStatus::Waiting;
                self.ring.advance_tail();
                log::trace!("write_segment(): segment {} queued in slot {}", segment, tail);

                if !self.runner.is_active() {
                    self.start_writing()?;
                }
                if flush {
                    self.flush_buffers()?;
                }
                return Ok(taken);
            }

            // Ring full.
            if self.runner.is_active() {
                self.wait_for_transfer()?;
            }
            else {
                self.start_writing()?;
            }
        }
    }

    fn retry_write(&mut self, index: usize) -> Result<(), TapeError> {
        if let Err(e) = self.handle_segment_error(index) {
            // Whatever is still queued cannot reach the tape in order.
            self.abort_operation()?;
            return Err(e);
        }
        Ok(())
    }

    /// Fill the slot's data blocks and generate its parity. Returns the bytes taken.
    fn copy_and_gen_ecc(&mut self, index: usize, data: &[u8]) -> Result<usize, TapeError> {
        let slot = &mut self.ring.slots[index];
        if slot.is_fake() {
            return Ok(0);
        }
        let blocks = slot.blocks();
        let capacity = (blocks - ECC_SECTORS) * SECTOR_SIZE;
        let taken = data.len().min(capacity);
        slot.data[..taken].copy_from_slice(&data[..taken]);
        slot.data[taken..capacity].fill(0);
        self.ecc.set_parity(&mut slot.data[..blocks * SECTOR_SIZE], blocks)?;
        Ok(taken)
    }

    /// Start the tape on the first queued segment. Fake segments at the head complete on
    /// the spot.
    pub(crate) fn start_writing(&mut self) -> Result<(), TapeError> {
        loop {
            let head = self.ring.head;
            let status = self.ring.slots[head].status;
            if status == BufferStatus::Waiting && self.ring.slots[head].is_fake() {
                log::trace!(
                    "start_writing(): segment {} has no room, skipped",
                    self.ring.slots[head].segment_id
                );
                self.ring.slots[head].status = BufferStatus::Done;
                self.ring.advance_head();
            }
            else if status == BufferStatus::Waiting {
                break;
            }
            else if self.ring.slots.iter().any(|s| s.status == BufferStatus::Waiting) {
                self.ring.advance_head();
            }
            else {
                return Ok(());
            }
        }
        self.arm_transfer(self.ring.head, FdcOperation::Write)
    }

    /// Wait until every queued segment is on tape, then stop the tape.
    pub fn flush_buffers(&mut self) -> Result<(), TapeError> {
        if self.io_mode != IoMode::Writing {
            return Ok(());
        }
        let result = self.flush_inner();
        self.finish_operation(result)
    }

    fn flush_inner(&mut self) -> Result<(), TapeError> {
        loop {
            let head = self.ring.head;
            if self.ring.slots[head].status == BufferStatus::Error {
                self.retry_write(head)?;
                continue;
            }
            if self.ring.slots.iter().all(|s| s.status == BufferStatus::Done) {
                break;
            }
            if self.runner.is_active() {
                self.wait_for_transfer()?;
            }
            else {
                self.start_writing()?;
            }
        }
        log::trace!("flush_buffers(): all segments written");
        self.dumb_stop()?;
        Ok(())
    }

    /// Stop whatever the interrupt side is doing and bring the tape to a halt. Queued
    /// segments are dropped.
    pub fn abort_operation(&mut self) -> Result<(), TapeError> {
        if self.runner == RunnerStatus::Running {
            self.runner = RunnerStatus::DoAbort;
            let start = self.hw.now_us();
            let limit = self.config.interrupt_timeout().as_micros() as u64;
            while self.runner == RunnerStatus::DoAbort {
                self.pump_events()?;
                if self.hw.now_us().saturating_sub(start) >= limit {
                    log::warn!("abort_operation(): transfer did not finish, resetting");
                    self.fdc.mode = FdcMode::Idle;
                    self.fdc_reset()?;
                    break;
                }
                self.hw.sleep(INTERRUPT_POLL_SLICE);
            }
        }
        let stopped = self.dumb_stop();
        if self.ring.any_owned_by_isr() {
            log::debug!("abort_operation(): reclaiming slots {:?}", self.ring.statuses());
        }
        match self.io_mode {
            IoMode::Writing => self.ring.zap_writes(),
            _ => self.ring.zap_reads(),
        }
        stopped
    }

    /// Stop the tape without regard for the ring.
    fn dumb_stop(&mut self) -> Result<(), TapeError> {
        let result = match self.runner {
            RunnerStatus::LogicalEot => self
                .ready_wait(QicCommand::LogicalForward.info().timeout)
                .map(|_| ()),
            _ => self.stop_tape(),
        };
        self.runner = RunnerStatus::Idle;
        self.fdc.mode = FdcMode::Idle;
        result.map_err(Into::into)
    }
}
