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

    sim::controller.rs

    Simulated floppy disk controller with a single DMA channel.
*/

//! A µPD765/82077-style floppy controller with a QIC-117 drive attached.
//!
//! Register behaviour follows the real part closely enough for the driver: commands are
//! collected byte by byte and dispatched when complete, seeks turn into step pulses for the
//! drive, and transfers run against the modelled tape motion. Interrupts are posted on a
//! channel at the virtual time they would fire.

use std::{collections::VecDeque, time::Duration};

use crossbeam_channel::{unbounded, Receiver, Sender};
use ftape_common::types::history_buffer::HistoryBuffer;
use strum_macros::Display;

use crate::{
    device_types::{
        fdc::*,
        geometry::SectorId,
        qic117::DataRate,
        sector_map::{SECTORS_PER_SEGMENT, SECTOR_SIZE},
    },
    devices::fdc::{DmaMode, FdcEvent, FdcHardware},
    sim::{drive::QicTapeDrive, media::TapeMedia, SimConfig},
};

const RESET_DELAY_US: u64 = 20;
/// How long the controller hunts for an ID address mark before giving up.
const NO_ID_TIMEOUT_US: u64 = 150_000;
const WRITE_PROTECT_DELAY_US: u64 = 100;
/// A sector this far behind the head counts as already gone.
const LATE_TOLERANCE: f64 = 0.25;
const CMD_LOG_LEN: usize = 64;

const SENSE_NO_INTERRUPT: u8 = ST0_INVALID_OPCODE;

type CommandDispatchFn = fn(&mut SimulatedFdc) -> Continuation;

pub enum Continuation {
    CommandComplete,
    ContinueAsOperation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IoMode {
    FromCpu,
    ToCpu,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display)]
pub enum Command {
    #[default]
    NoCommand,
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseInterrupt,
    ReadSectorId,
    Seek,
    Version,
    PerpendicularMode,
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// The sector's data fails its CRC on read.
    DataCrc,
    /// The sector's ID cannot be found, so neither reads nor writes reach it.
    MissingId,
}

/// A defect injected into the tape, active for the next `remaining` passes over the sector.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fault {
    pub segment: u32,
    pub sector: u8,
    pub kind: FaultKind,
    pub remaining: u32,
}

#[derive(Clone, Debug)]
struct Transfer {
    write: bool,
    segment: u32,
    first_sector: u8,
    /// Sectors that went through DMA.
    moved: usize,
    /// A moved sector whose data arrived damaged, as an index into the cluster.
    corrupt: Option<usize>,
    st0: u8,
    st1: u8,
    st2: u8,
    id: SectorId,
}

enum Operation {
    NoOperation,
    Transfer { at: u64, transfer: Transfer },
    ReadId { at: u64, st0: u8, st1: u8, id: SectorId },
}

impl Operation {
    fn at(&self) -> Option<u64> {
        match self {
            Operation::NoOperation => None,
            Operation::Transfer { at, .. } | Operation::ReadId { at, .. } => Some(*at),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct PendingSeek {
    at: u64,
    target: u8,
    pulses: u8,
    recalibrate: bool,
}

struct DmaChannel {
    mode: DmaMode,
    buf: Vec<u8>,
    residue: usize,
}

pub struct SimulatedFdc {
    config: SimConfig,
    drive: QicTapeDrive,
    events: Sender<FdcEvent>,
    now_us: u64,

    dor: u8,
    in_reset: bool,
    reset_at: Option<u64>,
    unit: u8,
    rate: DataRate,
    perpendicular: bool,
    pcn: u8,

    busy: bool,
    dio: IoMode,
    mrq: bool,
    receiving_command: bool,
    command: Command,
    command_fn: Option<CommandDispatchFn>,
    command_byte_n: u32,
    data_register_in: VecDeque<u8>,
    data_register_out: VecDeque<u8>,
    pending_sense: VecDeque<(u8, u8)>,

    seek: Option<PendingSeek>,
    operation: Operation,
    dma: DmaChannel,
    faults: Vec<Fault>,
    result_stalls: u32,
    cmd_log: HistoryBuffer<String>,
}

impl SimulatedFdc {
    pub fn new(config: SimConfig, media: TapeMedia) -> (Self, Receiver<FdcEvent>) {
        let (events, receiver) = unbounded();
        let drive = QicTapeDrive::new(&config, media);
        let fdc = SimulatedFdc {
            config,
            drive,
            events,
            now_us: 0,
            dor: DOR_FDC_RESET | DOR_DMA_ENABLED,
            in_reset: false,
            reset_at: None,
            unit: 0,
            rate: DataRate::default(),
            perpendicular: false,
            pcn: 0,
            busy: false,
            dio: IoMode::FromCpu,
            mrq: true,
            receiving_command: false,
            command: Command::NoCommand,
            command_fn: None,
            command_byte_n: 0,
            data_register_in: VecDeque::new(),
            data_register_out: VecDeque::new(),
            pending_sense: VecDeque::new(),
            seek: None,
            operation: Operation::NoOperation,
            dma: DmaChannel {
                mode: DmaMode::Read,
                buf: Vec::new(),
                residue: 0,
            },
            faults: Vec::new(),
            result_stalls: 0,
            cmd_log: HistoryBuffer::new(CMD_LOG_LEN),
        };
        (fdc, receiver)
    }

    pub fn drive(&self) -> &QicTapeDrive {
        &self.drive
    }

    pub fn media(&self) -> &TapeMedia {
        self.drive.media()
    }

    pub fn media_mut(&mut self) -> &mut TapeMedia {
        self.drive.media_mut()
    }

    pub fn into_media(self) -> TapeMedia {
        self.drive.into_media()
    }

    /// Last value written to the digital output register.
    pub fn dor(&self) -> u8 {
        self.dor
    }

    pub fn command_log(&self) -> &HistoryBuffer<String> {
        &self.cmd_log
    }

    /// Make the next `count` passes over a sector fail in the given way.
    pub fn inject_fault(&mut self, segment: u32, sector: u8, kind: FaultKind, count: u32) {
        self.faults.push(Fault {
            segment,
            sector,
            kind,
            remaining: count,
        });
    }

    pub fn inject_crc(&mut self, segment: u32, sector: u8, count: u32) {
        self.inject_fault(segment, sector, FaultKind::DataCrc, count);
    }

    /// Faults that have not been used up yet.
    /// Hold back the next result byte for `polls` status register reads. The controller
    /// stays busy meanwhile.
    pub fn stall_result(&mut self, polls: u32) {
        self.result_stalls = polls;
    }

    pub fn faults(&self) -> impl Iterator<Item = &Fault> {
        self.faults.iter().filter(|f| f.remaining > 0)
    }

    fn log_cmd(&mut self, func: &str, s: &str) {
        self.cmd_log.push(format!("{}: {}: {}", self.now_us, func, s));
        log::trace!("{}(): {}", func, s);
    }

    fn next_event_at(&self) -> Option<u64> {
        [self.reset_at, self.seek.map(|s| s.at), self.operation.at()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Fire every event due at or before `t`.
    fn run_until(&mut self, t: u64) {
        while let Some(at) = self.next_event_at().filter(|&at| at <= t) {
            self.now_us = self.now_us.max(at);
            if self.reset_at == Some(at) {
                self.finish_reset();
            }
            else if self.seek.map(|s| s.at) == Some(at) {
                self.finish_seek();
            }
            else {
                self.finish_operation();
            }
        }
    }

    fn post(&mut self, event: FdcEvent) {
        // A disconnected receiver means the session is gone; nothing left to tell.
        let _ = self.events.send(event);
    }

    fn finish_reset(&mut self) {
        self.reset_at = None;
        self.pending_sense.clear();
        for unit in 0..4u8 {
            self.pending_sense.push_back((ST0_READY_CHANGE | unit, 0));
        }
        self.pcn = 0;
        self.perpendicular = false;
        self.mrq = true;
        self.log_cmd("finish_reset", "controller out of reset");
        self.post(FdcEvent::Reset);
    }

    fn finish_seek(&mut self) {
        let Some(seek) = self.seek.take()
        else {
            return;
        };
        if !seek.recalibrate {
            self.drive.pulses(seek.pulses, seek.at);
        }
        self.pcn = seek.target;
        self.pending_sense.push_back((ST0_SEEK_END | self.unit, self.pcn));
        self.post(FdcEvent::SeekEnd);
    }

    fn finish_operation(&mut self) {
        let operation = std::mem::replace(&mut self.operation, Operation::NoOperation);
        match operation {
            Operation::NoOperation => return,
            Operation::Transfer { transfer, .. } => self.complete_transfer(transfer),
            Operation::ReadId { st0, st1, id, .. } => {
                self.data_register_out.extend([st0, st1, 0, id.cyl, id.head, id.sect, id.size]);
            }
        }
        self.send_data_register();
        self.post(FdcEvent::Result);
    }

    pub fn handle_status_register_read(&self) -> u8 {
        if self.in_reset {
            return 0;
        }
        let mut msr_byte = 0;
        if self.seek.is_some() {
            msr_byte |= 0x01 << self.unit;
        }
        if self.busy {
            msr_byte |= FDC_STATUS_FDC_BUSY;
        }
        if let IoMode::ToCpu = self.dio {
            msr_byte |= FDC_STATUS_DIO;
        }
        if self.mrq {
            msr_byte |= FDC_STATUS_MRQ;
        }
        msr_byte
    }

    pub fn handle_dor_write(&mut self, data: u8) {
        if data & DOR_FDC_RESET == 0 {
            if !self.in_reset {
                self.log_cmd("handle_dor_write", &format!("reset asserted: {:02X}", data));
            }
            self.in_reset = true;
            self.reset_at = None;
            self.seek = None;
            self.operation = Operation::NoOperation;
            self.busy = false;
            self.mrq = false;
            self.dio = IoMode::FromCpu;
            self.receiving_command = false;
            self.command = Command::NoCommand;
            self.command_fn = None;
            self.data_register_in.clear();
            self.data_register_out.clear();
            self.pending_sense.clear();
        }
        else if self.in_reset {
            self.log_cmd("handle_dor_write", &format!("reset released: {:02X}", data));
            self.in_reset = false;
            self.reset_at = Some(self.now_us + RESET_DELAY_US);
        }

        self.unit = data & DOR_DRIVE_SELECT_MASK;
        self.drive.set_motor_line(data & (DOR_MOTOR_FDD_A << self.unit) != 0);
        self.dor = data;
    }

    pub fn handle_data_register_read(&mut self) -> u8 {
        let mut out_byte = 0;
        if let Some(byte) = self.data_register_out.pop_front() {
            out_byte = byte;
            if self.data_register_out.is_empty() {
                self.busy = false;
                self.dio = IoMode::FromCpu;
            }
        }
        out_byte
    }

    fn set_command(&mut self, command: Command, n_bytes: u32, command_fn: CommandDispatchFn) {
        self.receiving_command = true;
        self.busy = true;
        self.command = command;
        self.command_fn = Some(command_fn);
        self.command_byte_n = n_bytes;
    }

    fn send_data_register(&mut self) {
        self.busy = true;
        self.dio = IoMode::ToCpu;
        self.mrq = true;
    }

    fn send_invalid(&mut self) {
        self.data_register_out.clear();
        self.data_register_out.push_back(ST0_INVALID_OPCODE);
        self.send_data_register();
    }

    pub fn handle_data_register_write(&mut self, data: u8) {
        if self.in_reset || !self.mrq || self.dio == IoMode::ToCpu {
            log::warn!("handle_data_register_write(): byte {:02X} while not accepting", data);
            return;
        }
        if !self.receiving_command {
            let command_byte = CommandByte::from_bytes([data]);
            match command_byte.command() {
                COMMAND_SPECIFY => self.set_command(Command::Specify, 2, SimulatedFdc::command_specify),
                COMMAND_SENSE_DRIVE_STATUS => {
                    self.set_command(Command::SenseDriveStatus, 1, SimulatedFdc::command_sense_drive_status)
                }
                COMMAND_WRITE_DATA => self.set_command(Command::WriteData, 8, SimulatedFdc::command_write_data),
                COMMAND_READ_DATA => self.set_command(Command::ReadData, 8, SimulatedFdc::command_read_data),
                COMMAND_RECALIBRATE => {
                    self.set_command(Command::Recalibrate, 1, SimulatedFdc::command_recalibrate)
                }
                COMMAND_READ_SECTOR_ID => {
                    self.set_command(Command::ReadSectorId, 1, SimulatedFdc::command_read_sector_id)
                }
                COMMAND_SEEK_HEAD => self.set_command(Command::Seek, 2, SimulatedFdc::command_seek_head),
                COMMAND_PERPENDICULAR_MODE if self.config.fdc_version == FDC_VERSION_82077 => {
                    self.set_command(Command::PerpendicularMode, 1, SimulatedFdc::command_perpendicular_mode)
                }
                COMMAND_SENSE_INT_STATUS => {
                    // No parameter bytes, so it executes right away.
                    self.command = Command::SenseInterrupt;
                    self.command_sense_interrupt();
                    self.command = Command::NoCommand;
                }
                COMMAND_VERSION => {
                    self.command = Command::Version;
                    self.command_version();
                    self.command = Command::NoCommand;
                }
                _ => {
                    self.log_cmd("handle_data_register_write", &format!("invalid command {:02X}", data));
                    self.command = Command::Invalid;
                    self.send_invalid();
                    self.command = Command::NoCommand;
                }
            }
            return;
        }

        if self.command_byte_n > 0 {
            self.data_register_in.push_back(data);
            self.command_byte_n -= 1;
            if self.command_byte_n == 0 {
                log::trace!("handle_data_register_write(): dispatching {}", self.command);
                let result = match self.command_fn {
                    Some(command_fn) => command_fn(self),
                    None => Continuation::CommandComplete,
                };
                // Seeks run in the background; only transfers keep the controller busy.
                let executing = matches!(result, Continuation::ContinueAsOperation)
                    && !matches!(self.operation, Operation::NoOperation);
                if !executing && self.data_register_out.is_empty() {
                    self.busy = false;
                }
                self.command = Command::NoCommand;
                self.command_fn = None;
                self.data_register_in.clear();
                self.receiving_command = false;
            }
        }
    }

    fn param(&self, n: usize) -> u8 {
        self.data_register_in.get(n).copied().unwrap_or(0)
    }

    fn st0(&self, head: u8) -> u8 {
        self.unit | ((head & 0x01) << 2)
    }

    fn command_specify(&mut self) -> Continuation {
        self.log_cmd(
            "command_specify",
            &format!("srt/hut {:02X} hlt/nd {:02X}", self.param(0), self.param(1)),
        );
        Continuation::CommandComplete
    }

    fn command_sense_drive_status(&mut self) -> Continuation {
        let dhs = DriveHeadSelect::from_bytes([self.param(0)]);
        let mut st3 = dhs.drive() | (dhs.head() << 2) | ST3_READY;
        if self.drive.track0() {
            st3 |= ST3_TRACK0;
        }
        if self.drive.media().write_protected {
            st3 |= ST3_WRITE_PROTECT;
        }
        self.data_register_out.push_back(st3);
        self.send_data_register();
        Continuation::CommandComplete
    }

    fn command_sense_interrupt(&mut self) {
        match self.pending_sense.pop_front() {
            Some((st0, pcn)) => {
                self.data_register_out.extend([st0, pcn]);
                self.send_data_register();
            }
            None => {
                self.data_register_out.push_back(SENSE_NO_INTERRUPT);
                self.send_data_register();
            }
        }
    }

    fn command_version(&mut self) {
        self.log_cmd("command_version", &format!("{:02X}", self.config.fdc_version));
        self.data_register_out.push_back(self.config.fdc_version);
        self.send_data_register();
    }

    fn command_perpendicular_mode(&mut self) -> Continuation {
        self.perpendicular = self.param(0) & 0x03 != 0;
        self.log_cmd("command_perpendicular_mode", &format!("{}", self.perpendicular));
        Continuation::CommandComplete
    }

    fn start_seek(&mut self, target: u8, recalibrate: bool) {
        if self.seek.is_some() {
            // The old seek's pulses are already out on the cable.
            self.finish_seek();
        }
        let pulses = self.pcn.abs_diff(target);
        let steps = if recalibrate { self.pcn as u64 } else { pulses as u64 };
        let at = self.now_us + (steps * self.config.step_us).max(1);
        self.seek = Some(PendingSeek {
            at,
            target,
            pulses,
            recalibrate,
        });
    }

    fn command_seek_head(&mut self) -> Continuation {
        let target = self.param(1);
        self.log_cmd("command_seek_head", &format!("{} -> {}", self.pcn, target));
        self.start_seek(target, false);
        Continuation::ContinueAsOperation
    }

    fn command_recalibrate(&mut self) -> Continuation {
        self.log_cmd("command_recalibrate", &format!("from {}", self.pcn));
        self.start_seek(0, true);
        Continuation::ContinueAsOperation
    }

    /// Reasons the controller would not find any ID on the tape right now.
    fn cannot_see_ids(&self) -> Option<&'static str> {
        if !self.drive.is_awake() {
            Some("drive not selected")
        }
        else if self.rate != self.drive.rate() {
            Some("data rate mismatch")
        }
        else if self.perpendicular != self.drive.needs_perpendicular() {
            Some("recording mode mismatch")
        }
        else {
            None
        }
    }

    fn command_read_sector_id(&mut self) -> Continuation {
        let head = DriveHeadSelect::from_bytes([self.param(0)]).head();
        let found = match self.cannot_see_ids() {
            Some(_) => None,
            None => self.drive.next_sector_id(self.now_us),
        };
        self.operation = match found {
            Some((at, segment, sector)) => {
                let id = self.drive.media().geometry.sector_id(segment, sector);
                Operation::ReadId {
                    at,
                    st0: self.st0(id.head),
                    st1: 0,
                    id,
                }
            }
            None => Operation::ReadId {
                at: self.now_us + NO_ID_TIMEOUT_US,
                st0: self.st0(head) | ST0_ABNORMAL_TERMINATION,
                st1: ST1_NO_ID,
                id: SectorId::default(),
            },
        };
        self.mrq = false;
        Continuation::ContinueAsOperation
    }

    fn command_read_data(&mut self) -> Continuation {
        self.plan_transfer(false)
    }

    fn command_write_data(&mut self) -> Continuation {
        self.plan_transfer(true)
    }

    /// Work out how far a transfer will get and when it ends, given where the tape is now
    /// and the faults waiting for it.
    fn plan_transfer(&mut self, write: bool) -> Continuation {
        let id = SectorId {
            cyl: self.param(1),
            head: self.param(2),
            sect: self.param(3),
            size: self.param(4),
        };
        let eot = self.param(5);
        let count = eot.saturating_sub(id.sect) as usize + 1;
        let st0 = self.st0(id.head);
        self.mrq = false;

        let geometry = self.drive.media().geometry;
        let mut transfer = Transfer {
            write,
            segment: 0,
            first_sector: 0,
            moved: 0,
            corrupt: None,
            st0: st0 | ST0_ABNORMAL_TERMINATION,
            st1: ST1_NO_ID,
            st2: 0,
            id,
        };
        let no_id_at = self.now_us + NO_ID_TIMEOUT_US;

        let Some((segment, first)) = geometry.segment_from_id(&id)
        else {
            self.log_cmd("plan_transfer", &format!("no such sector {:?}", id));
            self.operation = Operation::Transfer { at: no_id_at, transfer };
            return Continuation::ContinueAsOperation;
        };
        transfer.segment = segment;
        transfer.first_sector = first;
        let count = count.min(SECTORS_PER_SEGMENT - first as usize);
        self.log_cmd(
            "plan_transfer",
            &format!(
                "{} segment {} sectors {}..{}",
                if write { "write" } else { "read" },
                segment,
                first,
                first as usize + count
            ),
        );

        if let Some(why) = self.cannot_see_ids() {
            self.log_cmd("plan_transfer", why);
            self.operation = Operation::Transfer { at: no_id_at, transfer };
            return Continuation::ContinueAsOperation;
        }
        if geometry.track_of(segment) != self.drive.track() {
            self.log_cmd("plan_transfer", "segment is on another track");
            self.operation = Operation::Transfer { at: no_id_at, transfer };
            return Continuation::ContinueAsOperation;
        }
        if write && self.drive.media().write_protected {
            transfer.st1 = ST1_WRITE_PROTECT;
            self.operation = Operation::Transfer {
                at: self.now_us + WRITE_PROTECT_DELAY_US,
                transfer,
            };
            return Continuation::ContinueAsOperation;
        }

        let per_segment = SECTORS_PER_SEGMENT as f64;
        let base = (segment - geometry.track_start(self.drive.track())) as f64;
        let x_first = base + first as f64 / per_segment;
        let x_now = self.drive.logical_position(self.now_us);
        if self.drive.is_streaming(self.now_us) && x_first < x_now - LATE_TOLERANCE / per_segment {
            // The first sector has already gone by; the controller waits out a revolution
            // that never comes.
            transfer.st1 = ST1_NODATA;
            self.operation = Operation::Transfer {
                at: self.now_us + self.drive.sector_us().ceil() as u64,
                transfer,
            };
            return Continuation::ContinueAsOperation;
        }

        let mut failed = None;
        for k in 0..count {
            let sector = first + k as u8;
            let hit = self.faults.iter_mut().find(|f| {
                f.remaining > 0
                    && f.segment == segment
                    && f.sector == sector
                    && (f.kind == FaultKind::MissingId || !write)
            });
            if let Some(fault) = hit {
                fault.remaining -= 1;
                failed = Some((k, fault.kind));
                break;
            }
        }

        let end_index = match failed {
            Some((k, _)) => k + 1,
            None => count,
        };
        let x_end = base + (first as usize + end_index) as f64 / per_segment;
        let Some(at) = self.drive.time_to_reach(x_end, self.now_us)
        else {
            self.log_cmd("plan_transfer", "tape not streaming over the sectors");
            self.operation = Operation::Transfer { at: no_id_at, transfer };
            return Continuation::ContinueAsOperation;
        };

        let last = first + end_index as u8 - 1;
        transfer.id = geometry.sector_id(segment, last);
        match failed {
            None => {
                transfer.moved = count;
                transfer.st0 = st0;
                transfer.st1 = 0;
            }
            Some((k, FaultKind::DataCrc)) => {
                if self.config.crc_error_already_past {
                    transfer.moved = k + 1;
                    transfer.corrupt = Some(k);
                }
                else {
                    transfer.moved = k;
                }
                transfer.st1 = ST1_CRC_ERROR;
                transfer.st2 = ST2_DATA_CRC_ERROR;
            }
            Some((k, FaultKind::MissingId)) => {
                transfer.moved = k;
                transfer.st1 = ST1_NO_ID;
            }
        }
        self.operation = Operation::Transfer { at, transfer };
        Continuation::ContinueAsOperation
    }

    fn complete_transfer(&mut self, transfer: Transfer) {
        let moved_bytes = (transfer.moved * SECTOR_SIZE).min(self.dma.buf.len());
        let moved = moved_bytes / SECTOR_SIZE;
        if transfer.write {
            for k in 0..moved {
                let data = &self.dma.buf[k * SECTOR_SIZE..(k + 1) * SECTOR_SIZE];
                self.drive
                    .media_mut()
                    .write_sector(transfer.segment, transfer.first_sector + k as u8, data);
            }
        }
        else {
            for k in 0..moved {
                let sector = self.drive.media().sector(transfer.segment, transfer.first_sector + k as u8);
                self.dma.buf[k * SECTOR_SIZE..(k + 1) * SECTOR_SIZE].copy_from_slice(sector);
            }
            if let Some(k) = transfer.corrupt.filter(|&k| k < moved) {
                for byte in &mut self.dma.buf[k * SECTOR_SIZE..k * SECTOR_SIZE + 16] {
                    *byte ^= 0x5a;
                }
            }
        }
        self.dma.residue = self.dma.buf.len() - moved_bytes;
        self.log_cmd(
            "complete_transfer",
            &format!(
                "segment {} from {}: {} sectors, st {:02X} {:02X} {:02X}",
                transfer.segment, transfer.first_sector, moved, transfer.st0, transfer.st1, transfer.st2
            ),
        );
        let id = transfer.id;
        self.data_register_out.extend([
            transfer.st0,
            transfer.st1,
            transfer.st2,
            id.cyl,
            id.head,
            id.sect,
            id.size,
        ]);
    }
}

impl FdcHardware for SimulatedFdc {
    fn read_msr(&mut self) -> u8 {
        self.run_until(self.now_us);
        let msr = self.handle_status_register_read();
        if self.result_stalls > 0 && !self.data_register_out.is_empty() {
            self.result_stalls -= 1;
            return msr & !FDC_STATUS_MRQ;
        }
        msr
    }

    fn read_data(&mut self) -> u8 {
        self.handle_data_register_read()
    }

    fn write_data(&mut self, byte: u8) {
        self.handle_data_register_write(byte);
    }

    fn write_dor(&mut self, dor: u8) {
        self.handle_dor_write(dor);
    }

    fn write_dsr(&mut self, dsr: u8) {
        self.rate = rate_from_dsr(dsr);
        self.log_cmd("write_dsr", &format!("{}", self.rate));
    }

    fn dma_setup(&mut self, mode: DmaMode, data: &[u8]) {
        self.dma.mode = mode;
        self.dma.buf = match mode {
            DmaMode::Write => data.to_vec(),
            DmaMode::Read => vec![0; data.len()],
        };
        self.dma.residue = self.dma.buf.len();
    }

    fn dma_residue(&mut self) -> usize {
        self.dma.residue
    }

    fn dma_collect(&mut self, dest: &mut [u8]) -> usize {
        if self.dma.mode != DmaMode::Read {
            return 0;
        }
        let len = dest.len().min(self.dma.buf.len() - self.dma.residue);
        dest[..len].copy_from_slice(&self.dma.buf[..len]);
        len
    }

    fn sleep(&mut self, duration: Duration) {
        let target = self.now_us + duration.as_micros() as u64;
        match self.next_event_at() {
            Some(at) if at <= target => self.run_until(at),
            _ => self.now_us = target,
        }
    }

    fn now_us(&self) -> u64 {
        self.now_us
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_types::qic117::{QicStandard, TapeLength};

    fn fdc() -> (SimulatedFdc, Receiver<FdcEvent>) {
        let media = TapeMedia::blank(QicStandard::Qic80, TapeLength::Normal);
        SimulatedFdc::new(SimConfig::default(), media)
    }

    fn result(fdc: &mut SimulatedFdc) -> Vec<u8> {
        let mut out = Vec::new();
        while fdc.read_msr() & (FDC_STATUS_MRQ | FDC_STATUS_DIO) == FDC_STATUS_MRQ | FDC_STATUS_DIO {
            out.push(fdc.read_data());
        }
        out
    }

    #[test]
    fn test_reset_raises_four_senses() {
        let (mut fdc, events) = fdc();
        fdc.write_dor(DOR_DMA_ENABLED);
        assert_eq!(fdc.read_msr(), 0);
        fdc.write_dor(DOR_DMA_ENABLED | DOR_FDC_RESET);
        fdc.sleep(Duration::from_millis(10));
        assert_eq!(events.try_recv(), Ok(FdcEvent::Reset));
        assert_eq!(fdc.now_us(), RESET_DELAY_US);
        for unit in 0..4 {
            fdc.write_data(COMMAND_SENSE_INT_STATUS);
            assert_eq!(result(&mut fdc), vec![ST0_READY_CHANGE | unit, 0]);
        }
        fdc.write_data(COMMAND_SENSE_INT_STATUS);
        assert_eq!(result(&mut fdc), vec![SENSE_NO_INTERRUPT]);
    }

    #[test]
    fn test_version_and_invalid() {
        let (mut fdc, _events) = fdc();
        fdc.write_data(COMMAND_VERSION);
        assert_eq!(result(&mut fdc), vec![FDC_VERSION_82077]);
        fdc.write_data(0x1f);
        assert_eq!(result(&mut fdc), vec![ST0_INVALID_OPCODE]);
        assert_eq!(fdc.read_msr(), FDC_STATUS_MRQ);
    }

    #[test]
    fn test_seek_steps_the_drive() {
        let (mut fdc, events) = fdc();
        // Report Drive Status is six pulses.
        for byte in [COMMAND_SEEK_HEAD, 0, 6] {
            fdc.write_data(byte);
        }
        assert!(fdc.read_msr() & 0x01 != 0);
        fdc.sleep(Duration::from_millis(10));
        assert_eq!(events.try_recv(), Ok(FdcEvent::SeekEnd));
        assert_eq!(fdc.now_us(), 6 * SimConfig::default().step_us);

        fdc.write_data(COMMAND_SENSE_INT_STATUS);
        assert_eq!(result(&mut fdc), vec![ST0_SEEK_END, 6]);
        // The drive acknowledges the report on TRACK0.
        fdc.write_data(COMMAND_SENSE_DRIVE_STATUS);
        fdc.write_data(0);
        let st3 = result(&mut fdc);
        assert_eq!(st3.len(), 1);
        assert!(st3[0] & ST3_TRACK0 != 0);
    }

    #[test]
    fn test_read_id_needs_a_moving_tape() {
        let (mut fdc, events) = fdc();
        fdc.write_dsr(dsr_byte(fdc.drive().rate()));
        fdc.write_data(COMMAND_READ_SECTOR_ID | COMMAND_MFM_BIT);
        fdc.write_data(0);
        assert_eq!(fdc.read_msr(), FDC_STATUS_FDC_BUSY);
        fdc.sleep(Duration::from_secs(1));
        assert_eq!(events.try_recv(), Ok(FdcEvent::Result));
        assert_eq!(fdc.now_us(), NO_ID_TIMEOUT_US);
        let r = result(&mut fdc);
        assert_eq!(r.len(), FDC_RESULT_LEN);
        assert_eq!(r[0] & ST0_INT_CODE_MASK, ST0_ABNORMAL_TERMINATION);
        assert_eq!(r[1], ST1_NO_ID);
    }

    #[test]
    fn test_faults_are_used_up() {
        let (mut fdc, _events) = fdc();
        fdc.inject_crc(10, 4, 1);
        fdc.inject_fault(11, 0, FaultKind::MissingId, 2);
        assert_eq!(fdc.faults().count(), 2);
        fdc.faults.iter_mut().for_each(|f| f.remaining = f.remaining.saturating_sub(1));
        assert_eq!(fdc.faults().count(), 1);
    }
}
