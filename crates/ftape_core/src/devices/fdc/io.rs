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

    devices::fdc::io.rs

    Byte level command and result transfer with the floppy disk controller.
*/

//! Controller register access: the command and result phases, seeks, reset and the
//! interrupt wait that drives the deferred interrupt handler.

use std::time::Duration;

use crossbeam_channel::TryRecvError;

use crate::{
    device_types::{fdc::*, qic117::DataRate, sector_map::SECTORS_PER_SEGMENT},
    devices::fdc::{FdcHardware, FdcMode, FdcOperation, FDC_BYTE_RETRIES, INTERRUPT_POLL_SLICE},
    error::FdcError,
    session::TapeSession,
};

/// A reset raises one interrupt per drive, each cleared by a Sense Interrupt Status.
const RESET_SENSE_COUNT: usize = 4;
const RESET_HOLD: Duration = Duration::from_micros(10);

const SPECIFY_STEP_RATE: u8 = 0x0f;
const SPECIFY_HEAD_UNLOAD: u8 = 0x0f;
const SPECIFY_HEAD_LOAD: u8 = 0x01;

const PERPENDICULAR_ON: u8 = 0x03;

impl<H: FdcHardware> TapeSession<H> {
    /// Spin on the main status register until `msr & mask == state`.
    fn fdc_wait(&mut self, mask: u8, state: u8, what: &'static str) -> Result<u8, FdcError> {
        let spins = self.calibration.spins_for(self.config.byte_timeout_us);
        let mut msr = 0;
        for _ in 0..spins {
            msr = self.hw.read_msr();
            if msr & mask == state {
                return Ok(msr);
            }
        }
        Err(FdcError::NotReady(what, msr))
    }

    fn fdc_write(&mut self, byte: u8) -> Result<(), FdcError> {
        self.fdc_wait(FDC_STATUS_MRQ | FDC_STATUS_DIO, FDC_STATUS_MRQ, "accept a byte")?;
        self.hw.write_data(byte);
        Ok(())
    }

    fn fdc_read(&mut self) -> Result<u8, FdcError> {
        self.fdc_wait(
            FDC_STATUS_MRQ | FDC_STATUS_DIO,
            FDC_STATUS_MRQ | FDC_STATUS_DIO,
            "offer a byte",
        )?;
        Ok(self.hw.read_data())
    }

    pub fn check_cancel(&self) -> Result<(), FdcError> {
        if !self.ignore_cancel && self.cancel.is_cancelled() {
            return Err(FdcError::Cancelled);
        }
        Ok(())
    }

    /// Send a complete command. A controller that refuses a byte is marked confused; it
    /// takes a reset before it is trusted with another command.
    pub fn fdc_command(&mut self, bytes: &[u8]) -> Result<(), FdcError> {
        if self.fdc.confused {
            return Err(FdcError::Confused);
        }
        self.fdc.log_cmd("fdc_command", &format!("{:02X?}", bytes));
        for (i, &byte) in bytes.iter().enumerate() {
            let mut sent = false;
            for attempt in 0..FDC_BYTE_RETRIES {
                match self.fdc_write(byte) {
                    Ok(()) => {
                        sent = true;
                        break;
                    }
                    Err(e) => log::trace!("fdc_command(): byte {} attempt {}: {}", i, attempt, e),
                }
            }
            if !sent {
                log::error!("fdc_command(): controller refused byte {} of {:02X?}", i, bytes);
                self.fdc.confused = true;
                self.fdc.dump_log();
                return Err(FdcError::CommandRejected(byte));
            }
        }
        Ok(())
    }

    /// One result byte, with the same retries as a command byte.
    fn fdc_result_byte(&mut self) -> Result<u8, FdcError> {
        let mut last_error = FdcError::NotReady("offer a byte", 0);
        for attempt in 0..FDC_BYTE_RETRIES {
            match self.fdc_read() {
                Ok(byte) => return Ok(byte),
                Err(e) => {
                    log::trace!("fdc_result_byte(): attempt {}: {}", attempt, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Collect the result phase into `buf`. A controller that goes idle early has cut the
    /// result short; one that stays busy without offering a byte is marked confused.
    pub fn fdc_result(&mut self, buf: &mut [u8]) -> Result<(), FdcError> {
        for i in 0..buf.len() {
            match self.fdc_result_byte() {
                Ok(byte) => buf[i] = byte,
                Err(e) => {
                    if self.hw.read_msr() & FDC_STATUS_FDC_BUSY == 0 {
                        log::warn!("fdc_result(): result phase ended after {} bytes", i);
                        return Err(FdcError::ShortResult(i, buf.len()));
                    }
                    log::error!("fdc_result(): controller never offered byte {} of {}", i, buf.len());
                    self.fdc.confused = true;
                    self.fdc.dump_log();
                    return Err(e);
                }
            }
        }
        self.fdc.log_cmd("fdc_result", &format!("{:02X?}", buf));
        Ok(())
    }

    pub fn fdc_issue_command(&mut self, command: &[u8], result: &mut [u8]) -> Result<(), FdcError> {
        self.fdc_command(command)?;
        self.fdc_result(result)
    }

    /// Returns `(st0, pcn)`. With no interrupt pending the controller answers with a
    /// single invalid-command byte and the cylinder is left as it was.
    pub fn fdc_sense_interrupt_status(&mut self) -> Result<(u8, u8), FdcError> {
        self.fdc_command(&[COMMAND_SENSE_INT_STATUS])?;
        let st0 = self.fdc_result_byte()?;
        if st0 & ST0_INT_CODE_MASK == ST0_INVALID_OPCODE {
            return Ok((st0, self.fdc.current_cylinder));
        }
        let pcn = self.fdc_result_byte()?;
        Ok((st0, pcn))
    }

    pub fn fdc_sense_drive_status(&mut self) -> Result<u8, FdcError> {
        let mut st3 = [0u8];
        let dhs = self.fdc.dhs(0);
        self.fdc_issue_command(&[COMMAND_SENSE_DRIVE_STATUS, dhs], &mut st3)?;
        Ok(st3[0])
    }

    /// Let interrupts for commands the handler issued on its own arrive before the
    /// foreground starts a seek that could be mistaken for them.
    fn fdc_settle(&mut self) -> Result<(), FdcError> {
        let start = self.hw.now_us();
        let limit = self.config.interrupt_timeout().as_micros() as u64;
        loop {
            self.pump_events()?;
            if !self.fdc.hide_interrupt && self.fdc.expected_stray == 0 {
                return Ok(());
            }
            if self.hw.now_us().saturating_sub(start) >= limit {
                log::warn!(
                    "fdc_settle(): gave up on {} expected interrupts (hidden: {})",
                    self.fdc.expected_stray,
                    self.fdc.hide_interrupt
                );
                self.fdc.hide_interrupt = false;
                self.fdc.expected_stray = 0;
                self.fdc.mode = FdcMode::Idle;
                return Ok(());
            }
            self.hw.sleep(INTERRUPT_POLL_SLICE);
        }
    }

    /// Seek and wait for it to finish. This is how QIC-117 commands are sent, so the pulse
    /// count has to be exact: a controller that ends up anywhere else is an error.
    pub fn fdc_seek(&mut self, cylinder: u8) -> Result<(), FdcError> {
        if self.fdc.confused {
            self.fdc_reset()?;
        }
        self.fdc_settle()?;
        self.fdc.mode = FdcMode::Seeking;
        self.fdc.seek_completed = false;
        let dhs = self.fdc.dhs(0);
        if let Err(e) = self.fdc_command(&[COMMAND_SEEK_HEAD, dhs, cylinder]) {
            self.fdc.mode = FdcMode::Idle;
            return Err(e);
        }
        let waited = self.fdc_interrupt_wait(self.config.interrupt_timeout());
        self.fdc.mode = FdcMode::Idle;
        waited?;

        let (st0, pcn) = self.fdc_sense_interrupt_status()?;
        self.fdc.current_cylinder = pcn;
        if st0 & ST0_SEEK_END == 0 || pcn != cylinder {
            log::warn!("fdc_seek(): wanted cylinder {}, got {} (st0 {:02X})", cylinder, pcn, st0);
            return Err(FdcError::SeekMismatch {
                target: cylinder,
                pcn,
                st0,
            });
        }
        Ok(())
    }

    /// Start a seek without waiting. Used by the interrupt handler, which sorts out the
    /// completion interrupt itself.
    pub fn fdc_seek_nowait(&mut self, cylinder: u8) -> Result<(), FdcError> {
        let dhs = self.fdc.dhs(0);
        self.fdc_command(&[COMMAND_SEEK_HEAD, dhs, cylinder])?;
        self.fdc.current_cylinder = cylinder;
        Ok(())
    }

    pub fn fdc_recalibrate(&mut self) -> Result<(), FdcError> {
        self.fdc_settle()?;
        self.fdc.mode = FdcMode::Recalibrating;
        let dhs = self.fdc.dhs(0);
        if let Err(e) = self.fdc_command(&[COMMAND_RECALIBRATE, dhs]) {
            self.fdc.mode = FdcMode::Idle;
            return Err(e);
        }
        let waited = self.fdc_interrupt_wait(self.config.interrupt_timeout());
        self.fdc.mode = FdcMode::Idle;
        waited?;
        let (st0, pcn) = self.fdc_sense_interrupt_status()?;
        log::trace!("fdc_recalibrate(): st0 {:02X} pcn {}", st0, pcn);
        self.fdc.current_cylinder = pcn;
        Ok(())
    }

    /// Pulse the reset line and bring the controller back to the configuration the driver
    /// expects.
    pub fn fdc_reset(&mut self) -> Result<(), FdcError> {
        if self.fdc.resetting {
            return Ok(());
        }
        self.fdc.resetting = true;
        let result = self.fdc_reset_inner();
        self.fdc.resetting = false;
        result
    }

    fn fdc_reset_inner(&mut self) -> Result<(), FdcError> {
        log::debug!("fdc_reset(): resetting controller");
        self.fdc.confused = false;
        self.fdc.mode = FdcMode::Idle;
        self.fdc.hide_interrupt = false;
        self.fdc.expected_stray = 0;

        let dor = self.fdc.dor | DOR_FDC_RESET;
        self.hw.write_dor(dor & !DOR_FDC_RESET);
        self.hw.sleep(RESET_HOLD);
        self.hw.write_dor(dor);
        self.fdc.dor = dor;

        match self.fdc_interrupt_wait(self.config.interrupt_timeout()) {
            Ok(()) => {}
            Err(FdcError::InterruptTimeout) => log::warn!("fdc_reset(): no interrupt after reset"),
            Err(e) => return Err(e),
        }
        for _ in 0..RESET_SENSE_COUNT {
            self.fdc_sense_interrupt_status()?;
        }

        self.fdc_specify()?;
        self.hw.write_dsr(dsr_byte(self.fdc.rate));
        if self.fdc.perpendicular {
            self.fdc.perpendicular = false;
            self.fdc_set_perpendicular(true)?;
        }
        self.fdc.current_cylinder = 0;
        Ok(())
    }

    pub fn fdc_specify(&mut self) -> Result<(), FdcError> {
        let srt_hut = StepRateHeadUnload::new()
            .with_step_rate(SPECIFY_STEP_RATE)
            .with_head_unload(SPECIFY_HEAD_UNLOAD)
            .into_bytes()[0];
        let hlt_nd = HeadLoadDma::new()
            .with_head_load(SPECIFY_HEAD_LOAD)
            .with_non_dma(false)
            .into_bytes()[0];
        self.fdc_command(&[COMMAND_SPECIFY, srt_hut, hlt_nd])
    }

    /// Tell a 765 from an 82077-class part. The older controller rejects VERSION, which
    /// reads back as a lone invalid-command status of 0x80.
    pub fn fdc_probe(&mut self) -> Result<u8, FdcError> {
        let mut version = [0u8];
        self.fdc_issue_command(&[COMMAND_VERSION], &mut version)?;
        self.fdc.version = if version[0] == FDC_VERSION_82077 {
            FDC_VERSION_82077
        }
        else {
            FDC_VERSION_765
        };
        log::info!(
            "fdc_probe(): {} controller (version {:02X})",
            if self.fdc.version == FDC_VERSION_82077 { "82077" } else { "765" },
            version[0]
        );
        Ok(self.fdc.version)
    }

    pub fn fdc_set_perpendicular(&mut self, on: bool) -> Result<(), FdcError> {
        if on == self.fdc.perpendicular {
            return Ok(());
        }
        if self.fdc.version < FDC_VERSION_82077 {
            if on {
                log::warn!("fdc_set_perpendicular(): controller has no perpendicular mode");
            }
            self.fdc.perpendicular = false;
            return Ok(());
        }
        self.fdc_command(&[COMMAND_PERPENDICULAR_MODE, if on { PERPENDICULAR_ON } else { 0 }])?;
        self.fdc.perpendicular = on;
        Ok(())
    }

    pub fn fdc_set_data_rate(&mut self, rate: DataRate) {
        log::trace!("fdc_set_data_rate(): {}", rate);
        self.fdc.rate = rate;
        self.hw.write_dsr(dsr_byte(rate));
    }

    /// Program DMA and issue the transfer for the cluster the slot at `index` is set up for.
    pub fn setup_fdc_and_dma(&mut self, index: usize, op: FdcOperation) -> Result<(), FdcError> {
        let perpendicular = self.drive.standard.needs_perpendicular();
        if perpendicular != self.fdc.perpendicular {
            self.fdc_set_perpendicular(perpendicular)?;
        }

        let slot = &self.ring.slots[index];
        let count = slot.sector_count;
        if count == 0 || slot.sector_offset as usize + count as usize > SECTORS_PER_SEGMENT {
            log::error!("setup_fdc_and_dma(): bad cluster {:?}", slot);
            return Err(FdcError::Confused);
        }
        let address = self.geometry.sector_address(slot.segment_id, slot.sector_offset);
        self.hw.dma_setup(op.dma_mode(), slot.cluster_data());

        let command = [
            op.opcode(),
            self.fdc.dhs(address.head),
            address.cyl,
            address.head,
            address.sect,
            SECTOR_SIZE_CODE_1K,
            address.sect + count - 1,
            FDC_GAP3_LEN,
            0xff,
        ];
        self.fdc.mode = match op {
            FdcOperation::Read | FdcOperation::ReadDeleted => FdcMode::ReadingData,
            FdcOperation::Write | FdcOperation::WriteDeleted => FdcMode::WritingData,
        };
        if let Err(e) = self.fdc_command(&command) {
            self.fdc.mode = FdcMode::Idle;
            return Err(e);
        }
        Ok(())
    }

    /// Service interrupts until one the foreground should see arrives. A timeout resets the
    /// controller, since nothing else will get it talking again.
    pub fn fdc_interrupt_wait(&mut self, timeout: Duration) -> Result<(), FdcError> {
        let start = self.hw.now_us();
        let limit = timeout.as_micros() as u64;
        self.fdc.interrupt_seen = false;
        self.fdc.waiting = true;
        let result = loop {
            if let Err(e) = self.pump_events() {
                break Err(e);
            }
            if self.fdc.interrupt_seen {
                break Ok(());
            }
            if let Err(e) = self.check_cancel() {
                break Err(e);
            }
            if self.hw.now_us().saturating_sub(start) >= limit {
                break Err(FdcError::InterruptTimeout);
            }
            self.hw.sleep(INTERRUPT_POLL_SLICE);
        };
        self.fdc.waiting = false;
        self.fdc.interrupt_seen = false;

        if let Err(FdcError::InterruptTimeout) = result {
            log::warn!("fdc_interrupt_wait(): no interrupt after {:?} in {:?}", timeout, self.fdc.mode);
            self.fdc.dump_log();
            if !self.fdc.resetting {
                self.fdc_reset()?;
            }
        }
        result
    }

    /// Run the interrupt handler for every event the controller has posted.
    pub fn pump_events(&mut self) -> Result<(), FdcError> {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.fdc_isr(event),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(FdcError::Disconnected),
            }
        }
    }
}
