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

    sim::drive.rs

    Simulated QIC-117 tape drive.
*/

//! QIC-117 drive model.
//!
//! The drive sees nothing but step pulse trains from the controller. A train is either a
//! command or, after a command that takes them, a parameter. Replies go out bit by bit on
//! the TRACK0 line. Tape position is tracked physically in segment units, with a short
//! leader at either end; odd tracks read from the far end back.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    device_types::{qic117::*, sector_map::SECTORS_PER_SEGMENT},
    devices::vendors::WakeupMethod,
    sim::{media::TapeMedia, SimConfig},
};

/// Tape past either end of the recorded area, in segments.
const LEADER: f64 = 0.5;
const END_EPSILON: f64 = 1e-6;
/// Bytes a sector takes up on tape once gaps and the ID field are counted.
const SECTOR_BYTES_ON_TAPE: f64 = 1100.0;
const SKIP_SPEEDUP: f64 = 10.0;
const SKIP_SETTLE_US: u64 = 200_000;
const STOP_COAST: f64 = 0.25;
const STOP_US: u64 = 100_000;
const PAUSE_BACKOFF: f64 = 2.5;
const PAUSE_BACKOFF_US: u64 = 300_000;
const TRACK_SEEK_US: u64 = 500_000;
/// Where the ID field sits within a sector's slot, as a fraction of the slot.
const ID_FIELD_OFFSET: f64 = 0.05;
const PARAMETER_OFFSET: u8 = 2;
const SOFT_SELECT_CODE: u8 = 2;

const QIC_ERR_ILLEGAL_TRACK: u8 = 7;
const QIC_ERR_NOT_REFERENCED: u8 = 19;

/// One stretch of linear tape motion.
#[derive(Copy, Clone, Debug)]
struct Leg {
    t0: u64,
    t1: u64,
    p0: f64,
    p1: f64,
    /// Moving at read speed, so sector IDs and data can be picked up.
    streaming: bool,
}

impl Leg {
    fn position_at(&self, now: u64) -> f64 {
        if now <= self.t0 || self.t1 <= self.t0 {
            return if now >= self.t1 { self.p1 } else { self.p0 };
        }
        if now >= self.t1 {
            return self.p1;
        }
        let frac = (now - self.t0) as f64 / (self.t1 - self.t0) as f64;
        self.p0 + (self.p1 - self.p0) * frac
    }

    fn contains(&self, now: u64) -> bool {
        self.t0 <= now && now < self.t1
    }
}

struct ReportShift {
    value: u32,
    left: u32,
}

struct PendingParameters {
    command: QicCommand,
    values: Vec<u8>,
    needed: usize,
}

pub struct QicTapeDrive {
    config: SimConfig,
    media: TapeMedia,
    rng: StdRng,
    awake: bool,
    track: u32,
    /// Where the tape rests when no motion is scheduled.
    rest: f64,
    legs: Vec<Leg>,
    referenced: bool,
    new_cartridge: bool,
    error: Option<(u8, u8)>,
    report: Option<ReportShift>,
    track0: bool,
    params: Option<PendingParameters>,
    rate: DataRate,
}

impl QicTapeDrive {
    pub fn new(config: &SimConfig, media: TapeMedia) -> Self {
        let mut drive = QicTapeDrive {
            config: config.clone(),
            media,
            rng: StdRng::seed_from_u64(config.seed),
            awake: config.wakeup == WakeupMethod::None,
            track: 0,
            rest: -LEADER,
            legs: Vec::new(),
            referenced: false,
            new_cartridge: true,
            error: Some((QIC_ERR_NEW_CARTRIDGE, 0)),
            report: None,
            track0: false,
            params: None,
            rate: DataRate::default(),
        };
        drive.media.write_protected |= config.write_protected;
        drive.rate = match config.initial_rate {
            Some(rate) => rate,
            None => drive.supported_rates().iter().copied().min().unwrap_or_default(),
        };
        drive
    }

    pub fn media(&self) -> &TapeMedia {
        &self.media
    }

    pub fn media_mut(&mut self) -> &mut TapeMedia {
        &mut self.media
    }

    pub fn into_media(self) -> TapeMedia {
        self.media
    }

    pub fn is_awake(&self) -> bool {
        self.awake
    }

    pub fn track(&self) -> u32 {
        self.track
    }

    pub fn rate(&self) -> DataRate {
        self.rate
    }

    pub fn is_referenced(&self) -> bool {
        self.referenced
    }

    /// Level of the TRACK0 line as the controller senses it.
    pub fn track0(&self) -> bool {
        self.awake && self.track0
    }

    pub fn needs_perpendicular(&self) -> bool {
        self.media.standard.needs_perpendicular()
    }

    fn supported_rates(&self) -> &[DataRate] {
        if self.config.rates.is_empty() {
            self.media.standard.rates()
        }
        else {
            &self.config.rates
        }
    }

    fn track_length(&self) -> f64 {
        self.media.geometry.segments_per_track as f64
    }

    /// Time for one segment to pass the head at read speed.
    pub fn segment_us(&self) -> f64 {
        SECTORS_PER_SEGMENT as f64 * SECTOR_BYTES_ON_TAPE * 8.0 * 1000.0 / self.rate.kbps() as f64
    }

    pub fn sector_us(&self) -> f64 {
        self.segment_us() / SECTORS_PER_SEGMENT as f64
    }

    fn logical(&self, p: f64) -> f64 {
        if self.track % 2 == 0 {
            p
        }
        else {
            self.track_length() - p
        }
    }

    fn physical(&self, x: f64) -> f64 {
        // The mapping is its own inverse.
        self.logical(x)
    }

    fn physical_at(&self, now: u64) -> f64 {
        let Some(first) = self.legs.first()
        else {
            return self.rest;
        };
        if now <= first.t0 {
            return first.p0;
        }
        for leg in &self.legs {
            if now < leg.t1 {
                return leg.position_at(now);
            }
        }
        self.legs.last().map(|leg| leg.p1).unwrap_or(self.rest)
    }

    /// Position along the current track in segments, counted from its logical start.
    pub fn logical_position(&self, now: u64) -> f64 {
        self.logical(self.physical_at(now))
    }

    pub fn motion_end(&self) -> u64 {
        self.legs.last().map(|leg| leg.t1).unwrap_or(0)
    }

    pub fn is_streaming(&self, now: u64) -> bool {
        self.legs.iter().any(|leg| leg.contains(now) && leg.streaming)
    }

    /// When the head reaches logical position `x` while streaming, if it does.
    pub fn time_to_reach(&self, x: f64, now: u64) -> Option<u64> {
        for leg in &self.legs {
            if !leg.streaming || leg.t1 <= now {
                continue;
            }
            let x0 = self.logical(leg.p0);
            let x1 = self.logical(leg.p1);
            if x1 <= x0 {
                continue;
            }
            let t_from = now.max(leg.t0);
            let x_from = self.logical(leg.position_at(t_from));
            if x < x_from - END_EPSILON || x > x1 + END_EPSILON {
                continue;
            }
            let frac = ((x - x0) / (x1 - x0)).clamp(0.0, 1.0);
            let t = leg.t0 as f64 + frac * (leg.t1 - leg.t0) as f64;
            return Some((t.ceil() as u64).max(now));
        }
        None
    }

    pub fn ready(&self, now: u64) -> bool {
        self.params.is_none() && now >= self.motion_end()
    }

    pub fn status(&self, now: u64) -> QicStatus {
        let p = self.physical_at(now);
        QicStatus::new()
            .with_ready(self.ready(now))
            .with_error(self.error.is_some())
            .with_cartridge(true)
            .with_write_protect(self.media.write_protected)
            .with_new_cartridge(self.new_cartridge)
            .with_referenced(self.referenced)
            .with_at_bot(p <= -LEADER + END_EPSILON)
            .with_at_eot(p >= self.track_length() + LEADER - END_EPSILON)
    }

    fn configuration(&self) -> u8 {
        let mut config = (self.rate.qic_code() << QIC_CONFIG_RATE_SHIFT) & QIC_CONFIG_RATE_MASK;
        if self.media.standard != QicStandard::Qic40 {
            config |= QIC_CONFIG_80;
        }
        if self.media.length != TapeLength::Normal {
            config |= QIC_CONFIG_LONG;
        }
        config
    }

    fn set_error(&mut self, code: u8, command: u8) {
        log::debug!("set_error(): drive error {} ({}) on command {}", code, qic_error_name(code), command);
        self.error = Some((code, command));
    }

    /// The motor enable line of the drive's unit. Drives woken this way follow it.
    pub fn set_motor_line(&mut self, on: bool) {
        if self.config.wakeup == WakeupMethod::Insight && self.awake != on {
            log::trace!("set_motor_line(): drive {}", if on { "selected" } else { "deselected" });
            self.awake = on;
            self.track0 = false;
            self.report = None;
        }
    }

    /// A complete pulse train arrived.
    pub fn pulses(&mut self, count: u8, now: u64) {
        if count == 0 {
            return;
        }
        if !self.awake {
            self.wakeup_pulses(count);
            return;
        }
        if let Some(mut pending) = self.params.take() {
            pending.values.push(count.saturating_sub(PARAMETER_OFFSET));
            if pending.values.len() < pending.needed {
                self.params = Some(pending);
            }
            else {
                self.execute_with_parameters(pending.command, &pending.values, now);
            }
            return;
        }

        let Some(command) = QicCommand::from_code(count)
        else {
            log::debug!("pulses(): undefined command {}", count);
            self.report = None;
            self.track0 = false;
            self.set_error(QIC_ERR_UNDEFINED_COMMAND, count);
            return;
        };
        if command != QicCommand::ReportNextBit {
            self.report = None;
            self.track0 = false;
        }
        log::trace!("pulses(): {}", command);
        self.execute(command, now);
    }

    /// Only the select sequence of the drive's own wake-up method gets through.
    fn wakeup_pulses(&mut self, count: u8) {
        match self.config.wakeup {
            WakeupMethod::Colorado if count == QicCommand::PhantomSelect.code() => {
                log::trace!("wakeup_pulses(): phantom select");
                self.awake = true;
            }
            WakeupMethod::Mountain => {
                if let Some(pending) = self.params.take() {
                    if pending.command == QicCommand::SoftSelect
                        && count.saturating_sub(PARAMETER_OFFSET) == SOFT_SELECT_CODE
                    {
                        log::trace!("wakeup_pulses(): soft select");
                        self.awake = true;
                    }
                }
                else if count == QicCommand::SoftSelect.code() {
                    self.params = Some(PendingParameters {
                        command: QicCommand::SoftSelect,
                        values: Vec::new(),
                        needed: 1,
                    });
                }
            }
            _ => {}
        }
    }

    fn start_report(&mut self, value: u32, bits: u32) {
        self.report = Some(ReportShift {
            value: value | (1 << bits),
            left: bits + 1,
        });
        self.track0 = true;
    }

    fn next_report_bit(&mut self) {
        let Some(report) = &mut self.report
        else {
            self.track0 = false;
            return;
        };
        self.track0 = report.value & 1 != 0;
        report.value >>= 1;
        report.left -= 1;
        if report.left == 0 {
            self.report = None;
        }
    }

    fn expect_parameters(&mut self, command: QicCommand, needed: usize) {
        self.params = Some(PendingParameters {
            command,
            values: Vec::with_capacity(needed),
            needed,
        });
    }

    fn execute(&mut self, command: QicCommand, now: u64) {
        use QicCommand::*;
        match command {
            ReportNextBit => self.next_report_bit(),
            ReportDriveStatus => {
                let status = self.status(now).byte();
                self.start_report(status as u32, 8);
            }
            ReportErrorCode => {
                let (code, cmd) = self.error.take().unwrap_or((0, 0));
                if code == QIC_ERR_NEW_CARTRIDGE {
                    self.new_cartridge = false;
                }
                self.start_report(code as u32 | (cmd as u32) << 8, 16);
            }
            ReportDriveConfiguration => {
                let config = self.configuration();
                self.start_report(config as u32, 8);
            }
            ReportRomVersion => self.start_report(self.config.rom_version as u32, 8),
            ReportVendorId => self.start_report(self.config.vendor_id as u32, 16),
            ReportTapeStatus => {
                if self.config.tape_status_report {
                    let status = self.media.standard.tape_status_code() | self.media.length.tape_status_code();
                    self.start_report(status as u32, 8);
                }
                else {
                    self.set_error(QIC_ERR_UNDEFINED_COMMAND, command.code());
                }
            }
            LogicalForward => self.logical_forward(now),
            PhysicalForward => {
                let end = self.track_length() + LEADER;
                self.fast_run(now, end);
            }
            PhysicalReverse => self.fast_run(now, -LEADER),
            SeekLoadPoint => self.seek_load_point(now),
            StopTape => self.stop(now, false),
            Pause | MicroStepPause => self.stop(now, true),
            SeekHeadToTrack => self.expect_parameters(command, 1),
            SkipForward | SkipReverse => self.expect_parameters(command, 2),
            SelectRate => {
                if !self.config.rate_select {
                    self.set_error(QIC_ERR_UNDEFINED_COMMAND, command.code());
                }
                self.expect_parameters(command, 1);
            }
            SoftSelect => self.expect_parameters(command, 1),
            SoftDeselect => {
                if self.config.wakeup == WakeupMethod::Mountain {
                    self.awake = false;
                }
            }
            PhantomDeselect => {
                if self.config.wakeup == WakeupMethod::Colorado {
                    self.awake = false;
                }
            }
            PhantomSelect | EnterPrimaryMode => {}
            NoCommand => self.set_error(QIC_ERR_UNDEFINED_COMMAND, 0),
        }
    }

    fn execute_with_parameters(&mut self, command: QicCommand, values: &[u8], now: u64) {
        match command {
            QicCommand::SeekHeadToTrack => {
                let track = values[0] as u32;
                if track >= self.media.geometry.tracks_per_tape {
                    self.set_error(QIC_ERR_ILLEGAL_TRACK, command.code());
                    return;
                }
                log::trace!("execute_with_parameters(): head to track {}", track);
                let p = self.physical_at(now);
                self.track = track;
                self.set_motion(now, vec![Leg {
                    t0: now,
                    t1: now + TRACK_SEEK_US,
                    p0: p,
                    p1: p,
                    streaming: false,
                }]);
            }
            QicCommand::SkipForward | QicCommand::SkipReverse => {
                let count = (values[0] & 0x0f) as u32 | ((values[1] & 0x0f) as u32) << 4;
                self.skip(now, command == QicCommand::SkipForward, count);
            }
            QicCommand::SelectRate => {
                if !self.config.rate_select {
                    return;
                }
                let rate = DataRate::from_qic_code(values[0]);
                if self.supported_rates().contains(&rate) {
                    log::trace!("execute_with_parameters(): rate {}", rate);
                    self.rate = rate;
                }
                else {
                    self.set_error(QIC_ERR_RATE_SELECT, command.code());
                }
            }
            // Soft select on a drive that is already awake.
            _ => {}
        }
    }

    fn set_motion(&mut self, now: u64, legs: Vec<Leg>) {
        self.rest = self.physical_at(now);
        self.legs = legs;
    }

    fn clamp_physical(&self, p: f64) -> f64 {
        p.clamp(-LEADER, self.track_length() + LEADER)
    }

    fn logical_forward(&mut self, now: u64) {
        if !self.referenced {
            self.set_error(QIC_ERR_NOT_REFERENCED, QicCommand::LogicalForward.code());
            return;
        }
        let p0 = self.physical_at(now);
        let p1 = self.physical(self.track_length() + LEADER);
        let duration = ((p1 - p0).abs() * self.segment_us()) as u64;
        self.set_motion(now, vec![Leg {
            t0: now,
            t1: now + duration,
            p0,
            p1,
            streaming: true,
        }]);
    }

    fn fast_run(&mut self, now: u64, target: f64) {
        let p0 = self.physical_at(now);
        let duration = ((target - p0).abs() * self.segment_us() / SKIP_SPEEDUP) as u64;
        self.set_motion(now, vec![Leg {
            t0: now,
            t1: now + duration,
            p0,
            p1: target,
            streaming: false,
        }]);
    }

    fn seek_load_point(&mut self, now: u64) {
        let p0 = self.physical_at(now);
        let duration = ((p0 + LEADER).abs() * self.segment_us() / SKIP_SPEEDUP) as u64 + TRACK_SEEK_US;
        self.track = 0;
        self.referenced = true;
        self.set_motion(now, vec![Leg {
            t0: now,
            t1: now + duration,
            p0,
            p1: -LEADER,
            streaming: false,
        }]);
    }

    /// Stop the tape. It coasts a little; a pause then backs it up so the next start has
    /// room to get up to speed.
    fn stop(&mut self, now: u64, pause: bool) {
        let p0 = self.physical_at(now);
        let direction = self
            .legs
            .iter()
            .find(|leg| leg.contains(now))
            .map(|leg| (leg.p1 - leg.p0).signum())
            .unwrap_or(0.0);
        if direction == 0.0 {
            self.set_motion(now, Vec::new());
            return;
        }
        let p1 = self.clamp_physical(p0 + direction * STOP_COAST);
        let mut legs = vec![Leg {
            t0: now,
            t1: now + STOP_US,
            p0,
            p1,
            streaming: false,
        }];
        if pause {
            legs.push(Leg {
                t0: now + STOP_US,
                t1: now + STOP_US + PAUSE_BACKOFF_US,
                p0: p1,
                p1: self.clamp_physical(p1 - direction * PAUSE_BACKOFF),
                streaming: false,
            });
        }
        self.set_motion(now, legs);
    }

    fn skip(&mut self, now: u64, forward: bool, count: u32) {
        if !self.referenced {
            let code = if forward { QicCommand::SkipForward } else { QicCommand::SkipReverse }.code();
            self.set_error(QIC_ERR_NOT_REFERENCED, code);
            return;
        }
        let base = self.logical_position(now).floor();
        let noise = match self.config.skip_noise as i32 {
            0 => 0,
            n => self.rng.gen_range(-n..=n),
        };
        let landing = if forward {
            base + (count as i32 + self.config.skip_bias + noise) as f64 + 0.5
        }
        else {
            if count < self.config.min_reverse {
                log::trace!("skip(): reverse skip of {} too short to move", count);
                return;
            }
            base - (count as i32 + self.config.reverse_bias + noise) as f64 + 0.5
        };
        let p0 = self.physical_at(now);
        let p1 = self.clamp_physical(self.physical(landing));
        let duration = ((p1 - p0).abs() * self.segment_us() / SKIP_SPEEDUP) as u64 + SKIP_SETTLE_US;
        log::trace!(
            "skip(): {} {} from {:.2} lands at {:.2}",
            if forward { "forward" } else { "reverse" },
            count,
            self.logical(p0),
            self.logical(p1)
        );
        self.set_motion(now, vec![Leg {
            t0: now,
            t1: now + duration,
            p0,
            p1,
            streaming: false,
        }]);
    }

    /// The next sector ID to pass the head from `now`: when it is read, and which segment
    /// and sector it belongs to.
    pub fn next_sector_id(&self, now: u64) -> Option<(u64, u32, u8)> {
        if !self.is_streaming(now) {
            return None;
        }
        let per_segment = SECTORS_PER_SEGMENT as f64;
        let x = self.logical_position(now);
        let index = (x * per_segment + 2.0 * ID_FIELD_OFFSET).ceil().max(0.0) as u64;
        let segments = self.media.geometry.segments_per_track as u64;
        if index >= segments * SECTORS_PER_SEGMENT as u64 {
            return None;
        }
        let at = self.time_to_reach((index as f64 + ID_FIELD_OFFSET) / per_segment, now)?;
        let segment = self.media.geometry.track_start(self.track) + (index / SECTORS_PER_SEGMENT as u64) as u32;
        Some((at, segment, (index % SECTORS_PER_SEGMENT as u64) as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive() -> QicTapeDrive {
        let media = TapeMedia::blank(QicStandard::Qic80, TapeLength::Normal);
        QicTapeDrive::new(&SimConfig::default(), media)
    }

    /// Send a report command and clock out `bits` bits plus the stop bit.
    fn report(drive: &mut QicTapeDrive, command: QicCommand, bits: u32, now: u64) -> u32 {
        drive.pulses(command.code(), now);
        assert!(drive.track0(), "no ack for {}", command);
        let mut value = 0;
        for bit in 0..bits {
            drive.pulses(QicCommand::ReportNextBit.code(), now);
            if drive.track0() {
                value |= 1 << bit;
            }
        }
        drive.pulses(QicCommand::ReportNextBit.code(), now);
        assert!(drive.track0(), "no stop bit for {}", command);
        value
    }

    #[test]
    fn test_new_cartridge_reports() {
        let mut drive = drive();
        let status = QicStatus::from_byte(report(&mut drive, QicCommand::ReportDriveStatus, 8, 0) as u8);
        assert!(status.ready() && status.cartridge() && status.error() && status.at_bot());
        assert!(!status.referenced());

        let error = report(&mut drive, QicCommand::ReportErrorCode, 16, 0);
        assert_eq!(error & 0xff, QIC_ERR_NEW_CARTRIDGE as u32);
        let status = QicStatus::from_byte(report(&mut drive, QicCommand::ReportDriveStatus, 8, 0) as u8);
        assert!(!status.error() && !status.new_cartridge());

        let tape = report(&mut drive, QicCommand::ReportTapeStatus, 8, 0) as u8;
        assert_eq!(QicStandard::from_tape_status(tape), Some(QicStandard::Qic80));
    }

    #[test]
    fn test_select_rate() {
        let mut drive = drive();
        assert_eq!(drive.rate(), DataRate::Rate250);
        drive.pulses(QicCommand::SelectRate.code(), 0);
        drive.pulses(DataRate::Rate1000.qic_code() + PARAMETER_OFFSET, 0);
        assert_eq!(drive.rate(), DataRate::Rate1000);
        let config = report(&mut drive, QicCommand::ReportDriveConfiguration, 8, 0) as u8;
        assert_eq!(DataRate::from_config(config), DataRate::Rate1000);
        assert!(config & QIC_CONFIG_80 != 0);

        drive.pulses(QicCommand::SelectRate.code(), 0);
        drive.pulses(DataRate::Rate2000.qic_code() + PARAMETER_OFFSET, 0);
        assert_eq!(drive.rate(), DataRate::Rate1000);
        assert!(drive.status(0).error());
    }

    #[test]
    fn test_streaming_and_stop() {
        let mut drive = drive();
        drive.pulses(QicCommand::LogicalForward.code(), 0);
        // Not referenced yet.
        assert!(drive.status(0).error());
        drive.pulses(QicCommand::SeekLoadPoint.code(), 0);
        let loaded = drive.motion_end();
        assert!(drive.status(loaded).ready() && drive.is_referenced());

        drive.pulses(QicCommand::LogicalForward.code(), loaded);
        assert!(!drive.ready(loaded));
        let at = drive.time_to_reach(3.0, loaded).unwrap();
        assert!((drive.logical_position(at) - 3.0).abs() < 0.01);
        assert!(drive.is_streaming(at));

        drive.pulses(QicCommand::Pause.code(), at);
        let stopped = drive.motion_end();
        assert!(drive.ready(stopped));
        let rest = drive.logical_position(stopped);
        assert!((rest - (3.0 + STOP_COAST - PAUSE_BACKOFF)).abs() < 0.01);
    }

    #[test]
    fn test_sleeping_drive_needs_its_select() {
        let config = SimConfig {
            wakeup: WakeupMethod::Colorado,
            ..Default::default()
        };
        let mut drive = QicTapeDrive::new(&config, TapeMedia::blank(QicStandard::Qic80, TapeLength::Normal));
        drive.pulses(QicCommand::ReportDriveStatus.code(), 0);
        assert!(!drive.track0());
        drive.pulses(QicCommand::PhantomSelect.code(), 0);
        drive.pulses(QicCommand::ReportDriveStatus.code(), 0);
        assert!(drive.track0());
        drive.pulses(QicCommand::PhantomDeselect.code(), 0);
        assert!(!drive.is_awake());
    }

    #[test]
    fn test_sector_ids_follow_the_tape() {
        let mut drive = drive();
        drive.pulses(QicCommand::SeekLoadPoint.code(), 0);
        let t = drive.motion_end();
        drive.pulses(QicCommand::LogicalForward.code(), t);
        let (at, segment, sector) = drive.next_sector_id(t).unwrap();
        assert_eq!((segment, sector), (0, 0));
        let (_, segment, sector) = drive.next_sector_id(at).unwrap();
        assert_eq!((segment, sector), (0, 1));
    }
}
