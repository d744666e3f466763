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

    devices::tape_drive.rs

    QIC-117 drive commands, status reports and tape motion.
*/

//! QIC-117 command layer.
//!
//! Commands reach the drive as step pulses: the driver seeks the controller `n` cylinders
//! away from where it believes the head is, and the drive counts the pulses. Replies come
//! back bit-serially on the TRACK0 line, one `ReportNextBit` pulse per bit.

use std::time::Duration;

use crate::{
    device_types::{fdc::*, qic117::*},
    devices::{
        fdc::FdcHardware,
        vendors::{lookup_vendor, VendorInfo, WakeupMethod, UNKNOWN_VENDOR},
    },
    error::{FdcError, QicError},
    session::TapeSession,
};

/// Status polls before a command's precondition is declared unsatisfiable.
const PRECONDITION_TRIES: usize = 3;
const REPORT_RETRIES: usize = 3;
/// Longest a freshly inserted cartridge may take to load.
const LOAD_TIMEOUT: Duration = Duration::from_secs(60);
const MOTOR_SPINUP: Duration = Duration::from_millis(50);
/// Parameter pulses are offset so that a zero parameter is still a nonzero pulse train.
const PARAMETER_OFFSET: u8 = 2;
const SOFT_SELECT_CODE: u8 = 2;

/// Cylinder to seek to so that `pulses` steps are sent from `current`. Folding around the
/// current position keeps the target inside the controller's cylinder range.
pub fn fold_cylinder(current: u8, pulses: u8) -> u8 {
    if current > pulses {
        current - pulses
    }
    else {
        current + pulses
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SkipDirection {
    Forward,
    Reverse,
}

/// What the driver knows about the attached drive and cartridge.
#[derive(Clone, Debug)]
pub struct DriveState {
    pub wakeup: WakeupMethod,
    pub vendor_id: u16,
    pub vendor: Option<&'static VendorInfo>,
    pub rom_version: u8,
    pub standard: QicStandard,
    pub length: TapeLength,
    pub data_rate: DataRate,
    /// Whether the drive implements Select Rate. Probed on first use.
    pub rate_select: Option<bool>,
    pub track: Option<u32>,
    pub tape_running: bool,
    /// A retry left the head position in doubt; seek the track again before trusting it.
    pub offtrack_suspect: bool,
    pub write_protected: bool,
    pub last_status: QicStatus,
    pub current_command: QicCommand,
    /// Motion command whose non-interruptible window may still be open.
    pub pending_motion: Option<QicCommand>,
    /// Demote failures to trace level while probing.
    pub quiet: bool,
}

impl Default for DriveState {
    fn default() -> Self {
        DriveState {
            wakeup: WakeupMethod::None,
            vendor_id: UNKNOWN_VENDOR,
            vendor: None,
            rom_version: 0,
            standard: QicStandard::Qic80,
            length: TapeLength::Normal,
            data_rate: DataRate::default(),
            rate_select: None,
            track: None,
            tape_running: false,
            offtrack_suspect: false,
            write_protected: false,
            last_status: QicStatus::from_byte(0),
            current_command: QicCommand::NoCommand,
            pending_motion: None,
            quiet: false,
        }
    }
}

impl<H: FdcHardware> TapeSession<H> {
    fn send_pulses(&mut self, pulses: u8) -> Result<(), FdcError> {
        let target = fold_cylinder(self.fdc.current_cylinder, pulses);
        self.fdc_seek(target)
    }

    fn drive_note(&self, msg: &str) {
        if self.drive.quiet {
            log::trace!("{}", msg);
        }
        else {
            log::warn!("{}", msg);
        }
    }

    /// Issue a QIC-117 command once the drive is in a state that accepts it.
    pub fn ftape_command(&mut self, command: QicCommand) -> Result<(), QicError> {
        let info = command.info();
        if info.cmd_type != CommandType::Report {
            if let Some(motion) = self.drive.pending_motion {
                log::trace!("ftape_command(): {} waits for {} to complete", command, motion);
                self.ready_wait(motion.info().timeout)?;
            }
        }
        if info.mask != 0 {
            self.check_preconditions(command)?;
        }
        log::trace!("ftape_command(): {} ({} pulses)", command, command.code());
        self.send_pulses(command.code())?;
        self.drive.current_command = command;
        if info.cmd_type == CommandType::Motion && info.non_intr {
            self.drive.pending_motion = Some(command);
        }
        Ok(())
    }

    /// Send a parameter for the command just issued.
    pub fn ftape_parameter(&mut self, value: u8) -> Result<(), QicError> {
        log::trace!("ftape_parameter(): {}", value);
        self.send_pulses(value + PARAMETER_OFFSET)?;
        Ok(())
    }

    fn check_preconditions(&mut self, command: QicCommand) -> Result<(), QicError> {
        let info = command.info();
        let mut status = self.drive.last_status;
        for _ in 0..PRECONDITION_TRIES {
            status = self.report_drive_status()?;
            if status.matches(info.mask, info.state) {
                return Ok(());
            }
            if info.mask & QIC_STATUS_CARTRIDGE != 0 && !status.cartridge() {
                return Err(QicError::NoCartridge);
            }
            if status.error() {
                self.report_error()?;
            }
            else if !status.ready() {
                self.ready_wait(info.timeout)?;
            }
            else if info.mask & QIC_STATUS_REFERENCED != 0 && !status.referenced() {
                log::debug!("check_preconditions(): tape not referenced, seeking load point");
                self.seek_load_point()?;
            }
        }
        Err(QicError::Precondition {
            command,
            mask: info.mask,
            state: info.state,
            status: status.byte(),
        })
    }

    /// Run a report command and collect `bits` bits of reply, LSB first.
    pub fn report_operation(&mut self, command: QicCommand, bits: u32) -> Result<u32, QicError> {
        let mut last_error = QicError::NoAck(command);
        for attempt in 0..REPORT_RETRIES {
            match self.report_once(command, bits) {
                Ok(value) => return Ok(value),
                Err(e @ (QicError::NoAck(_) | QicError::NoStopBit(_))) => {
                    log::trace!("report_operation(): {} attempt {}: {}", command, attempt, e);
                    last_error = e;
                    self.hw.sleep(self.config.report_ack_delay());
                }
                Err(e) => return Err(e),
            }
        }
        self.drive_note(&format!("report_operation(): {} failed: {}", command, last_error));
        Err(last_error)
    }

    fn report_once(&mut self, command: QicCommand, bits: u32) -> Result<u32, QicError> {
        self.ftape_command(command)?;
        if self.fdc_sense_drive_status()? & ST3_TRACK0 == 0 {
            // Some drives are slow to raise the acknowledge.
            self.hw.sleep(self.config.report_ack_delay());
            if self.fdc_sense_drive_status()? & ST3_TRACK0 == 0 {
                return Err(QicError::NoAck(command));
            }
        }
        let mut value = 0u32;
        for bit in 0..bits {
            self.ftape_command(QicCommand::ReportNextBit)?;
            if self.fdc_sense_drive_status()? & ST3_TRACK0 != 0 {
                value |= 1 << bit;
            }
        }
        self.ftape_command(QicCommand::ReportNextBit)?;
        if self.fdc_sense_drive_status()? & ST3_TRACK0 == 0 {
            return Err(QicError::NoStopBit(command));
        }
        Ok(value)
    }

    pub fn report_drive_status(&mut self) -> Result<QicStatus, QicError> {
        let value = self.report_operation(QicCommand::ReportDriveStatus, 8)?;
        let status = QicStatus::from_byte(value as u8);
        log::trace!("report_drive_status(): {:02X}", status.byte());
        self.drive.last_status = status;
        self.drive.write_protected = status.write_protect();
        Ok(status)
    }

    /// Fetch and clear the drive's pending error. Returns `(code, command)`.
    pub fn report_error(&mut self) -> Result<(u8, u8), QicError> {
        let value = self.report_operation(QicCommand::ReportErrorCode, 16)?;
        let code = (value & 0xff) as u8;
        let command = (value >> 8) as u8;
        if code != 0 {
            self.drive_note(&format!(
                "report_error(): drive error {} ({}) after command {}",
                code,
                qic_error_name(code),
                command
            ));
        }
        Ok((code, command))
    }

    pub fn report_configuration(&mut self) -> Result<u8, QicError> {
        Ok(self.report_operation(QicCommand::ReportDriveConfiguration, 8)? as u8)
    }

    pub fn report_rom_version(&mut self) -> Result<u8, QicError> {
        Ok(self.report_operation(QicCommand::ReportRomVersion, 8)? as u8)
    }

    pub fn report_vendor_id(&mut self) -> Result<u16, QicError> {
        Ok(self.report_operation(QicCommand::ReportVendorId, 16)? as u16)
    }

    pub fn report_tape_status(&mut self) -> Result<u8, QicError> {
        Ok(self.report_operation(QicCommand::ReportTapeStatus, 8)? as u8)
    }

    /// Poll until the drive reports ready. The drive is only ready when it is not executing
    /// a motion command, so a ready drive also means a stopped tape.
    pub fn ready_wait(&mut self, timeout: Duration) -> Result<QicStatus, QicError> {
        let start = self.hw.now_us();
        let limit = timeout.as_micros() as u64;
        loop {
            self.check_cancel()?;
            match self.report_drive_status() {
                Ok(status) if status.ready() => {
                    self.drive.pending_motion = None;
                    self.drive.tape_running = false;
                    return Ok(status);
                }
                Ok(_) => {}
                Err(QicError::Fdc(e)) if matches!(e, FdcError::Cancelled | FdcError::Confused | FdcError::Disconnected) => {
                    return Err(QicError::Fdc(e));
                }
                Err(e) => {
                    log::debug!("ready_wait(): status report failed: {}", e);
                }
            }
            if self.hw.now_us().saturating_sub(start) >= limit {
                return Err(QicError::ReadyTimeout(timeout));
            }
            self.hw.sleep(self.config.ready_poll());
        }
    }

    pub fn wakeup_drive(&mut self, method: WakeupMethod) -> Result<(), QicError> {
        log::trace!("wakeup_drive(): {}", method);
        match method {
            WakeupMethod::None => Ok(()),
            WakeupMethod::Colorado => self.ftape_command(QicCommand::PhantomSelect),
            WakeupMethod::Mountain => {
                self.ftape_command(QicCommand::SoftSelect)?;
                self.ftape_parameter(SOFT_SELECT_CODE)
            }
            WakeupMethod::Insight => {
                self.fdc.dor |= DOR_MOTOR_FDD_A << self.fdc.drive;
                self.hw.write_dor(self.fdc.dor);
                self.hw.sleep(MOTOR_SPINUP);
                Ok(())
            }
        }
    }

    pub fn put_drive_to_sleep(&mut self, method: WakeupMethod) -> Result<(), QicError> {
        log::trace!("put_drive_to_sleep(): {}", method);
        match method {
            WakeupMethod::None => Ok(()),
            WakeupMethod::Colorado => self.ftape_command(QicCommand::PhantomDeselect),
            WakeupMethod::Mountain => self.ftape_command(QicCommand::SoftDeselect),
            WakeupMethod::Insight => {
                self.fdc.dor &= !(DOR_MOTOR_FDD_A << self.fdc.drive);
                self.hw.write_dor(self.fdc.dor);
                Ok(())
            }
        }
    }

    /// Find the wake-up method the drive answers to, then identify it.
    pub fn probe_drive(&mut self) -> Result<(), QicError> {
        let methods = match self.config.wakeup {
            Some(method) => vec![method],
            None => WakeupMethod::PROBE_ORDER.to_vec(),
        };

        self.drive.quiet = true;
        let mut found = None;
        for method in methods {
            match self.wakeup_drive(method).and_then(|_| self.report_drive_status()) {
                Ok(_) => {
                    found = Some(method);
                    break;
                }
                Err(QicError::Fdc(FdcError::Cancelled)) => {
                    self.drive.quiet = false;
                    return Err(FdcError::Cancelled.into());
                }
                Err(e) => {
                    log::trace!("probe_drive(): no answer to {}: {}", method, e);
                    let _ = self.put_drive_to_sleep(method);
                }
            }
        }
        self.drive.quiet = false;

        let method = found.ok_or(QicError::WakeupFailed)?;
        self.drive.wakeup = method;

        let vendor_id = match self.report_vendor_id() {
            Ok(id) => id,
            Err(QicError::Fdc(FdcError::Cancelled)) => return Err(FdcError::Cancelled.into()),
            Err(e) => {
                log::debug!("probe_drive(): no vendor id: {}", e);
                UNKNOWN_VENDOR
            }
        };
        self.drive.vendor_id = vendor_id;
        self.drive.vendor = lookup_vendor(vendor_id);
        match self.drive.vendor {
            Some(vendor) => {
                log::info!("probe_drive(): {} (vendor {:04X})", vendor.name, vendor_id);
                if vendor.wakeup != method {
                    log::warn!(
                        "probe_drive(): drive answered to {} but is listed with {}",
                        method,
                        vendor.wakeup
                    );
                }
            }
            None => log::info!("probe_drive(): unknown vendor {:04X}", vendor_id),
        }

        self.drive.rom_version = self.report_rom_version()?;
        log::info!(
            "probe_drive(): wake-up method {}, rom version {}",
            method,
            self.drive.rom_version
        );
        Ok(())
    }

    /// Check the cartridge and work out which standard and length it is.
    pub fn identify_tape(&mut self) -> Result<(), QicError> {
        let mut status = self.report_drive_status()?;
        if status.error() {
            self.report_error()?;
            status = self.report_drive_status()?;
        }
        if !status.cartridge() {
            return Err(QicError::NoCartridge);
        }
        if !status.ready() {
            status = self.ready_wait(LOAD_TIMEOUT)?;
        }
        if status.new_cartridge() {
            log::info!("identify_tape(): new cartridge");
        }

        let config = self.report_configuration()?;
        self.drive.data_rate = DataRate::from_config(config);

        self.drive.quiet = true;
        let reported = self.report_tape_status();
        self.drive.quiet = false;

        let format = match reported {
            Ok(value) => QicStandard::from_tape_status(value).map(|s| (s, TapeLength::from_tape_status(value))),
            Err(QicError::Fdc(FdcError::Cancelled)) => return Err(FdcError::Cancelled.into()),
            Err(e) => {
                log::trace!("identify_tape(): no tape status report: {}", e);
                None
            }
        };
        // Drives without the tape status report flag the attempt as an undefined command.
        if self.report_drive_status()?.error() {
            self.report_error()?;
        }

        let (standard, length) = format.unwrap_or_else(|| {
            let standard = if config & QIC_CONFIG_80 != 0 {
                QicStandard::Qic80
            }
            else {
                QicStandard::Qic40
            };
            let length = if config & QIC_CONFIG_LONG != 0 {
                TapeLength::Long
            }
            else {
                TapeLength::Normal
            };
            (standard, length)
        });
        self.drive.standard = standard;
        self.drive.length = length;
        self.drive.write_protected = status.write_protect();
        log::info!(
            "identify_tape(): {} {} cartridge at {}{}",
            standard,
            length,
            self.drive.data_rate,
            if status.write_protect() { ", write protected" } else { "" }
        );
        Ok(())
    }

    /// Ask the drive for `rate` and follow with the controller once the drive confirms it.
    pub fn set_data_rate(&mut self, rate: DataRate) -> Result<(), QicError> {
        if rate > DataRate::Rate500 && self.fdc.version < FDC_VERSION_82077 {
            log::debug!("set_data_rate(): controller cannot run at {}", rate);
            return Err(QicError::RateRejected(rate));
        }
        if self.drive.rate_select == Some(false) {
            if self.drive.data_rate != rate {
                return Err(QicError::RateRejected(rate));
            }
            self.fdc_set_data_rate(rate);
            return Ok(());
        }

        self.ftape_command(QicCommand::SelectRate)?;
        self.ftape_parameter(rate.qic_code())?;
        let status = self.ready_wait(QicCommand::SelectRate.info().timeout)?;
        if status.error() {
            let (code, _) = self.report_error()?;
            if code == QIC_ERR_UNDEFINED_COMMAND {
                log::info!("set_data_rate(): drive has a fixed rate of {}", self.drive.data_rate);
                self.drive.rate_select = Some(false);
                return self.set_data_rate(rate);
            }
            return Err(QicError::RateRejected(rate));
        }
        self.drive.rate_select = Some(true);

        let actual = DataRate::from_config(self.report_configuration()?);
        if actual != rate {
            log::warn!("set_data_rate(): asked for {}, drive runs at {}", rate, actual);
            self.drive.data_rate = actual;
            return Err(QicError::RateRejected(rate));
        }
        self.drive.data_rate = rate;
        self.fdc_set_data_rate(rate);
        log::debug!("set_data_rate(): {}", rate);
        Ok(())
    }

    /// Pick the fastest rate both the drive and the controller agree on, starting with the
    /// configured one.
    pub fn select_initial_rate(&mut self) -> Result<(), QicError> {
        let mut candidates = Vec::new();
        if let Some(rate) = self.config.data_rate {
            candidates.push(rate);
        }
        for &rate in self.drive.standard.rates() {
            if !candidates.contains(&rate) {
                candidates.push(rate);
            }
        }
        for rate in candidates {
            match self.set_data_rate(rate) {
                Ok(()) => {
                    log::info!("select_initial_rate(): running at {}", rate);
                    return Ok(());
                }
                Err(QicError::Fdc(FdcError::Cancelled)) => return Err(FdcError::Cancelled.into()),
                Err(e) => log::debug!("select_initial_rate(): {}: {}", rate, e),
            }
        }
        Err(QicError::RateRejected(self.drive.data_rate))
    }

    pub fn stop_tape(&mut self) -> Result<(), QicError> {
        if self.drive.tape_running || self.drive.pending_motion.is_some() {
            self.ftape_command(QicCommand::StopTape)?;
            self.ready_wait(QicCommand::StopTape.info().timeout)?;
            self.location.known = false;
        }
        self.drive.tape_running = false;
        Ok(())
    }

    /// Start the tape streaming towards the logical end of the current track.
    pub fn logical_forward(&mut self) -> Result<(), QicError> {
        self.ftape_command(QicCommand::LogicalForward)?;
        self.drive.tape_running = true;
        self.location.eot = false;
        Ok(())
    }

    /// Blind skip over `count` segments. Counts beyond one command's range go out in chunks.
    pub fn skip_segments(&mut self, count: u32, direction: SkipDirection) -> Result<(), QicError> {
        let command = match direction {
            SkipDirection::Forward => QicCommand::SkipForward,
            SkipDirection::Reverse => QicCommand::SkipReverse,
        };
        let mut left = count;
        while left > 0 {
            let chunk = left.min(QIC_MAX_SKIP);
            log::trace!("skip_segments(): {} {}", command, chunk);
            self.ftape_command(command)?;
            self.ftape_parameter((chunk & 0x0f) as u8)?;
            self.ftape_parameter(((chunk >> 4) & 0x0f) as u8)?;
            let status = self.ready_wait(command.info().timeout)?;
            left -= chunk;
            if status.at_bot() || status.at_eot() {
                break;
            }
        }
        self.history.fast_skips += 1;
        self.drive.tape_running = false;
        self.location.known = false;
        Ok(())
    }

    pub fn seek_head_to_track(&mut self, track: u32) -> Result<(), QicError> {
        if self.drive.tape_running {
            self.stop_tape()?;
        }
        log::debug!("seek_head_to_track(): {}", track);
        self.ftape_command(QicCommand::SeekHeadToTrack)?;
        self.ftape_parameter(track as u8)?;
        self.ready_wait(QicCommand::SeekHeadToTrack.info().timeout)?;
        self.drive.track = Some(track);
        self.drive.offtrack_suspect = false;
        self.location.track = Some(track);
        self.location.known = false;
        Ok(())
    }

    /// Run to the physical end that is the logical start of the current track.
    pub fn rewind_to_track_start(&mut self) -> Result<(), QicError> {
        let track = self.drive.track.unwrap_or(0);
        if self.drive.tape_running {
            self.stop_tape()?;
        }
        let command = if track % 2 == 0 {
            QicCommand::PhysicalReverse
        }
        else {
            QicCommand::PhysicalForward
        };
        self.ftape_command(command)?;
        let status = self.ready_wait(command.info().timeout)?;
        self.history.rewinds += 1;
        let at_start = if track % 2 == 0 { status.at_bot() } else { status.at_eot() };
        if at_start {
            self.location.set_track_start(track, &self.geometry);
        }
        else {
            log::warn!("rewind_to_track_start(): drive stopped away from the track start");
            self.location.known = false;
        }
        Ok(())
    }

    pub fn seek_load_point(&mut self) -> Result<(), QicError> {
        self.ftape_command(QicCommand::SeekLoadPoint)?;
        self.ready_wait(QicCommand::SeekLoadPoint.info().timeout)?;
        self.history.rewinds += 1;
        self.drive.track = Some(0);
        self.drive.offtrack_suspect = false;
        self.location.set_track_start(0, &self.geometry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_cylinder() {
        assert_eq!(fold_cylinder(0, 6), 6);
        assert_eq!(fold_cylinder(6, 6), 12);
        assert_eq!(fold_cylinder(12, 2), 10);
        assert_eq!(fold_cylinder(10, 47), 57);
        // Any sequence of commands stays within a small band around zero.
        let mut cyl = 0u8;
        for pulses in [47, 47, 33, 2, 2, 2, 26, 17, 17, 46] {
            cyl = fold_cylinder(cyl, pulses);
            assert!(cyl <= 2 * 47);
        }
    }
}
