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

    session.rs

    An open tape session: drive bring-up, header handling and file positioning.
*/

//! The tape session.
//!
//! One [TapeSession] owns everything the engine knows about one drive: the controller
//! state, the buffer ring, the runner, the current location and the maps loaded from the
//! header segment. Its methods are spread over the modules that implement each layer.

use crossbeam_channel::Receiver;

use crate::{
    bsm::BadSectorMap,
    buffer::{BufferRing, BufferStatus, RunnerStatus, NR_BUFFERS},
    calibrate::Calibration,
    cancel::CancelToken,
    config::SessionConfig,
    device_types::{
        geometry::TapeGeometry,
        sector_map::{SectorMap, ECC_SECTORS, SECTOR_SIZE},
    },
    devices::{
        fdc::{FdcEvent, FdcHardware, FdcState},
        tape_drive::DriveState,
    },
    ecc::{EccCodec, ReedSolomon},
    eof::FileMarkMap,
    error::{HeaderError, TapeError},
    header::{FmtVersion, FormatCode, HeaderSegment},
    history::HistoryRecord,
    positioning::{Location, PendingSkip, PositioningCalibration},
};

/// Segments searched for the first header copy.
const HEADER_SEARCH_LIMIT: u32 = 64;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IoMode {
    #[default]
    Idle,
    Reading,
    Writing,
}

pub struct TapeSession<H: FdcHardware> {
    pub(crate) hw: H,
    pub(crate) events: Receiver<FdcEvent>,
    pub(crate) config: SessionConfig,
    pub(crate) calibration: Calibration,
    pub(crate) cancel: CancelToken,
    /// Set while quiescing after a cancel, so the cleanup waits are not cancelled too.
    pub(crate) ignore_cancel: bool,
    pub(crate) fdc: FdcState,
    pub(crate) drive: DriveState,
    pub(crate) ring: BufferRing,
    pub(crate) runner: RunnerStatus,
    pub(crate) io_mode: IoMode,
    pub(crate) location: Location,
    pub(crate) positioning: PositioningCalibration,
    pub(crate) pending_skip: Option<PendingSkip>,
    pub(crate) history: HistoryRecord,
    pub(crate) geometry: TapeGeometry,
    pub(crate) header: Option<HeaderSegment>,
    /// The header segment as read, rewritten on close when the maps changed.
    pub(crate) header_image: Vec<u8>,
    pub(crate) bsm: BadSectorMap,
    pub(crate) eof: FileMarkMap,
    pub(crate) ecc: Box<dyn EccCodec>,
    pub(crate) first_data_segment: u32,
    pub(crate) last_data_segment: u32,
    /// Segment the next sequential read or write goes to.
    pub(crate) seg_pos: u32,
    pub(crate) sector_pos: u32,
    pub(crate) last_eof_query: u32,
    /// Latched on positioning failures; cleared only by reopening.
    pub(crate) failed: bool,
    closed: bool,
}

impl<H: FdcHardware> TapeSession<H> {
    pub fn open(hw: H, events: Receiver<FdcEvent>, config: SessionConfig) -> Result<Self, TapeError> {
        TapeSession::open_with(hw, events, config, CancelToken::new(), Box::new(ReedSolomon::new()))
    }

    /// Open with an external cancel token and a codec of the caller's choosing.
    pub fn open_with(
        mut hw: H,
        events: Receiver<FdcEvent>,
        config: SessionConfig,
        cancel: CancelToken,
        ecc: Box<dyn EccCodec>,
    ) -> Result<Self, TapeError> {
        let calibration = match config.spins_per_us {
            Some(spins) => Calibration::fixed(spins),
            None => Calibration::calibrate(|n| {
                for _ in 0..n {
                    std::hint::black_box(hw.read_msr());
                }
            }),
        };
        let geometry = TapeGeometry::default();
        let mut session = TapeSession {
            hw,
            events,
            fdc: FdcState::new(config.drive_select),
            config,
            calibration,
            cancel,
            ignore_cancel: false,
            drive: DriveState::default(),
            ring: BufferRing::default(),
            runner: RunnerStatus::Idle,
            io_mode: IoMode::Idle,
            location: Location::default(),
            positioning: PositioningCalibration::default(),
            pending_skip: None,
            history: HistoryRecord::default(),
            geometry,
            header: None,
            header_image: Vec::new(),
            bsm: BadSectorMap::empty(FormatCode::Normal, geometry.total_segments()),
            eof: FileMarkMap::new(FmtVersion::Legacy, false),
            ecc,
            first_data_segment: 0,
            last_data_segment: geometry.total_segments().saturating_sub(1),
            seg_pos: 0,
            sector_pos: 0,
            last_eof_query: 0,
            failed: false,
            closed: false,
        };
        session.init()?;
        Ok(session)
    }

    fn init(&mut self) -> Result<(), TapeError> {
        self.hw.write_dor(self.fdc.dor);
        self.fdc_reset()?;
        self.fdc_probe()?;
        self.fdc_recalibrate()?;

        self.probe_drive()?;
        self.identify_tape()?;
        self.geometry = TapeGeometry::for_standard(self.drive.standard, self.drive.length);
        self.last_data_segment = self.geometry.total_segments().saturating_sub(1);
        self.bsm = BadSectorMap::empty(FormatCode::Normal, self.geometry.total_segments());
        self.select_initial_rate()?;
        self.fdc_set_perpendicular(self.drive.standard.needs_perpendicular())?;

        self.read_header_segment()?;
        self.history.reset();

        let segments = self.geometry.total_segments();
        let stats = self.bsm.stats(segments);
        let usable: u64 = (self.first_data_segment..=self.last_data_segment)
            .map(|s| self.segment_capacity(s) as u64)
            .sum();
        log::info!(
            "open(): {} bad sectors, {} empty segments, {} segments with defects, {} KiB usable",
            stats.bad_sectors,
            stats.empty_segments,
            stats.segments_with_defects,
            usable / 1024
        );
        self.seg_pos = self.first_data_segment;
        Ok(())
    }

    /// Find the first header segment, then load the maps and geometry it describes.
    fn read_header_segment(&mut self) -> Result<(), TapeError> {
        let limit = HEADER_SEARCH_LIMIT.min(self.geometry.total_segments());
        let mut found = None;
        for segment in 0..limit {
            match self.read_segment(segment) {
                Ok(read) if HeaderSegment::is_header(&read.data) => {
                    found = Some((segment, read.data));
                    break;
                }
                Ok(_) => log::debug!("read_header_segment(): segment {} is not a header", segment),
                Err(e @ (TapeError::MediaDefect(_) | TapeError::EccFailure(_))) => {
                    // The other copy may still be readable.
                    log::warn!("read_header_segment(): segment {}: {}", segment, e);
                    self.failed = false;
                }
                Err(e) if e.is_cancelled() || e.is_fatal() => return Err(e),
                Err(e) => log::warn!("read_header_segment(): segment {}: {}", segment, e),
            }
        }
        self.abort_operation()?;

        let (segment, image) = found.ok_or(HeaderError::NotFound)?;
        let header = HeaderSegment::parse(&image)?;
        let geometry = header.geometry();
        let format = header.format_code();
        let (bsm, list_end) = BadSectorMap::extract(format, &image, geometry.total_segments())?;
        let eof = FileMarkMap::extract(header.fmt_version(), format.uses_list_encoding(), &image, list_end)?;

        log::info!(
            "read_header_segment(): header in segment {} (copy in {}), format {:?}, label \"{}\"",
            segment,
            header.alt_header_segment(),
            format,
            header.label()
        );
        log::info!(
            "read_header_segment(): {} segments per track, {} tracks, data in {}..={}, {} file marks",
            geometry.segments_per_track,
            geometry.tracks_per_tape,
            header.first_data_segment(),
            header.last_data_segment(),
            eof.len()
        );

        self.geometry = geometry;
        self.first_data_segment = header.first_data_segment();
        self.last_data_segment = header.last_data_segment();
        self.bsm = bsm;
        self.eof = eof;
        self.header = Some(header);
        self.header_image = image;
        Ok(())
    }

    /// Write both header copies back with the current maps.
    fn update_header_segments(&mut self) -> Result<(), TapeError> {
        let Some(mut header) = self.header.clone()
        else {
            return Ok(());
        };
        if self.eof.supported() {
            header.set_linux_label(FmtVersion::Current);
        }
        let mut image = std::mem::take(&mut self.header_image);
        header.write(&mut image)?;
        let list_end = self.bsm.encode(&mut image)?;
        self.eof.encode(&mut image, list_end)?;

        log::info!(
            "update_header_segments(): writing {} file marks to segments {} and {}",
            self.eof.len(),
            header.header_segment(),
            header.alt_header_segment()
        );
        let result = self
            .write_segment(header.header_segment(), &image, false)
            .and_then(|_| self.write_segment(header.alt_header_segment(), &image, true));
        self.header_image = image;
        self.header = Some(header);
        result?;
        self.eof.mark_clean();
        self.bsm.mark_clean();
        Ok(())
    }

    /// Flush pending writes, update the header if the maps changed, and put the drive to
    /// sleep. The session is unusable afterwards.
    pub fn close(&mut self) -> Result<(), TapeError> {
        if self.closed {
            return Ok(());
        }

        let mut result = Ok(());
        if self.io_mode == IoMode::Writing {
            result = self.flush_buffers();
        }
        if result.is_ok() && !self.failed && (self.eof.is_dirty() || self.bsm.is_dirty()) {
            result = self.update_header_segments();
        }
        let stopped = self.abort_operation();
        let slept = self.put_drive_to_sleep(self.drive.wakeup);
        self.history.log_summary();
        self.closed = true;

        result?;
        stopped?;
        slept?;
        Ok(())
    }

    /// Give back the hardware and the interrupt channel.
    pub fn into_parts(self) -> (H, Receiver<FdcEvent>) {
        (self.hw, self.events)
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn history(&self) -> &HistoryRecord {
        &self.history
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Status of each ring slot, by slot index.
    pub fn buffer_statuses(&self) -> [BufferStatus; NR_BUFFERS] {
        self.ring.statuses()
    }

    pub fn positioning(&self) -> &PositioningCalibration {
        &self.positioning
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn bad_sector_map(&mut self) -> &mut BadSectorMap {
        &mut self.bsm
    }

    pub fn file_marks(&self) -> &FileMarkMap {
        &self.eof
    }

    pub fn geometry(&self) -> &TapeGeometry {
        &self.geometry
    }

    pub fn drive_state(&self) -> &DriveState {
        &self.drive
    }

    pub fn runner_status(&self) -> RunnerStatus {
        self.runner
    }

    pub fn first_data_segment(&self) -> u32 {
        self.first_data_segment
    }

    pub fn last_data_segment(&self) -> u32 {
        self.last_data_segment
    }

    pub fn position(&self) -> u32 {
        self.seg_pos
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn check_failed(&self) -> Result<(), TapeError> {
        if self.failed || self.closed {
            return Err(TapeError::Failed);
        }
        Ok(())
    }

    /// Payload bytes `segment` can carry.
    pub fn segment_capacity(&mut self, segment: u32) -> usize {
        let map = self.bsm.get_bad_sector_entry(segment);
        if map.is_empty_segment() {
            return 0;
        }
        let good = map.good_count() as usize;
        good.saturating_sub(ECC_SECTORS) * SECTOR_SIZE
    }

    /// Sector (1-based) of the file mark in `segment`, if there is one.
    pub(crate) fn file_mark_in(&mut self, segment: u32) -> Option<u16> {
        if segment < self.last_eof_query {
            self.eof.reset_eof_list();
        }
        self.last_eof_query = segment;
        match self.eof.check_for_eof(segment) {
            0 => None,
            sector => Some(sector),
        }
    }

    pub fn seek_to_bot(&mut self) -> Result<(), TapeError> {
        self.check_failed()?;
        if self.io_mode == IoMode::Writing {
            self.flush_buffers()?;
        }
        self.abort_operation()?;
        self.seek_load_point()?;
        self.seg_pos = self.first_data_segment;
        self.sector_pos = 0;
        self.eof.reset_eof_list();
        self.last_eof_query = 0;
        Ok(())
    }

    /// Position after the last file mark, where new data would be appended.
    pub fn seek_to_eot(&mut self) -> Result<(), TapeError> {
        self.check_failed()?;
        self.seg_pos = match self.eof.last() {
            Some(mark) => mark.segment as u32 + 1,
            None => self.first_data_segment,
        };
        self.sector_pos = 0;
        Ok(())
    }

    /// Space over `count` file marks, forwards for positive counts. Forwards ends just
    /// past the mark; backwards ends on it.
    pub fn seek_to_file_mark(&mut self, count: i32) -> Result<(), TapeError> {
        self.check_failed()?;
        if count > 0 {
            match self.eof.find_forward(self.seg_pos, count as usize) {
                Some(mark) => {
                    self.seg_pos = mark.segment as u32 + 1;
                    self.sector_pos = 0;
                    Ok(())
                }
                None => {
                    self.seek_to_eot()?;
                    Err(TapeError::EndOfTape(self.seg_pos))
                }
            }
        }
        else if count < 0 {
            match self.eof.find_backward(self.seg_pos, count.unsigned_abs() as usize) {
                Some(mark) => {
                    self.seg_pos = mark.segment as u32;
                    self.sector_pos = 0;
                    Ok(())
                }
                None => {
                    self.seg_pos = self.first_data_segment;
                    self.sector_pos = 0;
                    Err(TapeError::BeginningOfTape)
                }
            }
        }
        else {
            Ok(())
        }
    }

    /// Record `count` file marks at the current position. The first lands in the current
    /// segment, each further one in the segment after.
    pub fn write_file_marks(&mut self, count: u32) -> Result<(), TapeError> {
        self.check_failed()?;
        if count == 0 {
            return Ok(());
        }
        if self.drive.write_protected {
            return Err(TapeError::WriteProtected);
        }
        if !self.eof.supported() {
            self.eof.enable();
        }
        let mut segment = self.seg_pos;
        let mut sector = self.sector_pos.max(1);
        for _ in 0..count {
            if segment > self.last_data_segment {
                return Err(TapeError::EndOfTape(segment));
            }
            self.eof.put_file_mark_in_map(segment as u16, sector as u16)?;
            log::debug!("write_file_marks(): mark at {}:{}", segment, sector);
            segment += 1;
            sector = 1;
        }
        self.seg_pos = segment;
        self.sector_pos = 0;
        Ok(())
    }

    pub fn set_position(&mut self, segment: u32) -> Result<(), TapeError> {
        if segment > self.last_data_segment + 1 {
            return Err(TapeError::EndOfTape(segment));
        }
        self.seg_pos = segment.max(self.first_data_segment);
        self.sector_pos = 0;
        Ok(())
    }

    /// Read the next segment that holds data. Segments with no usable sectors are passed
    /// over; a file mark segment ends the file.
    pub fn read_next(&mut self) -> Result<Vec<u8>, TapeError> {
        self.check_failed()?;
        loop {
            let segment = self.seg_pos;
            if segment > self.last_data_segment {
                return Err(TapeError::EndOfTape(segment));
            }
            let read = self.read_segment(segment)?;
            self.seg_pos += 1;
            if read.file_mark.is_some() {
                return Err(TapeError::EndOfFile(segment));
            }
            if !read.data.is_empty() {
                return Ok(read.data);
            }
        }
    }

    /// Write `data` to the next segment that can hold any. Returns the bytes taken.
    pub fn write_next(&mut self, data: &[u8]) -> Result<usize, TapeError> {
        self.check_failed()?;
        loop {
            let segment = self.seg_pos;
            if segment > self.last_data_segment {
                return Err(TapeError::EndOfTape(segment));
            }
            if self.segment_capacity(segment) == 0 {
                self.seg_pos += 1;
                continue;
            }
            let written = self.write_segment(segment, data, false)?;
            self.seg_pos += 1;
            return Ok(written);
        }
    }

    /// Bad sectors of `segment` as the engine will treat them.
    pub fn bad_sectors(&mut self, segment: u32) -> SectorMap {
        self.bsm.get_bad_sector_entry(segment)
    }
}
