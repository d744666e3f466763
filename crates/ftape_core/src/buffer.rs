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

    buffer.rs

    The DMA buffer ring shared between the segment API and the interrupt handler.
*/

//! Segment buffers and the ring they form.
//!
//! A slot belongs to the interrupt side while it is `Reading` or `Writing` and to the
//! segment API otherwise. `head` is the slot the interrupt side works on, `tail` the one
//! the segment API hands out or fills next.

use std::fmt;

use crate::device_types::{
    geometry::FloppyAddress,
    sector_map::{SectorMap, SECTORS_PER_SEGMENT, SECTOR_SIZE, SEGMENT_SIZE},
};

pub const NR_BUFFERS: usize = 3;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferStatus {
    #[default]
    Waiting,
    Reading,
    Writing,
    Done,
    Error,
}

impl BufferStatus {
    pub fn owned_by_isr(self) -> bool {
        matches!(self, BufferStatus::Reading | BufferStatus::Writing)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RunnerStatus {
    #[default]
    Idle,
    Running,
    DoAbort,
    Aborting,
    LogicalEot,
    EndOfTape,
    BufferOverrun,
    BufferUnderrun,
}

impl RunnerStatus {
    /// The tape may still be moving under the control of the interrupt side.
    pub fn is_active(self) -> bool {
        matches!(self, RunnerStatus::Running | RunnerStatus::DoAbort | RunnerStatus::Aborting)
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct SegmentBuffer {
    pub segment_id: u32,
    pub status: BufferStatus,
    /// Floppy address of sector 0 of the segment.
    pub address: FloppyAddress,
    /// Bad-sector map as stored on tape; FAKE for segments with no usable sector.
    pub bad_sector_map: SectorMap,
    /// First sector of the cluster in flight.
    pub sector_offset: u8,
    /// Length of the cluster in flight.
    pub sector_count: u8,
    /// Good sectors not yet transferred.
    pub remaining: u8,
    /// Byte offset in `data` that the cluster in flight maps to.
    pub data_offset: usize,
    pub soft_error_map: SectorMap,
    pub hard_error_map: SectorMap,
    pub retry: u32,
    /// Segment to chain into when this one completes. 0 stops the tape instead.
    pub next_segment: u32,
    /// Sectors already transferred before a restart; the transfer resumes after them.
    pub skip: u8,
    pub data: Box<[u8]>,
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        SegmentBuffer {
            segment_id: 0,
            status: BufferStatus::Waiting,
            address: FloppyAddress::default(),
            bad_sector_map: SectorMap::NONE,
            sector_offset: 0,
            sector_count: 0,
            remaining: 0,
            data_offset: 0,
            soft_error_map: SectorMap::NONE,
            hard_error_map: SectorMap::NONE,
            retry: 0,
            next_segment: 0,
            skip: 0,
            data: vec![0u8; SEGMENT_SIZE].into_boxed_slice(),
        }
    }
}

impl SegmentBuffer {
    /// Prepare the slot for a fresh pass over `segment_id`.
    pub fn setup(&mut self, segment_id: u32, address: FloppyAddress, bad_sector_map: SectorMap, next_segment: u32) {
        self.segment_id = segment_id;
        self.address = address;
        self.bad_sector_map = bad_sector_map;
        self.next_segment = next_segment;
        self.soft_error_map = SectorMap::NONE;
        self.hard_error_map = SectorMap::NONE;
        self.retry = 0;
        self.skip = 0;
        self.rewind();
    }

    /// Start over at sector 0, keeping the error maps.
    pub fn rewind(&mut self) {
        self.sector_offset = 0;
        self.sector_count = 0;
        self.data_offset = 0;
        self.remaining = self.usable().good_count() as u8;
    }

    /// Sectors that will never be transferred on this pass.
    fn usable(&self) -> SectorMap {
        self.bad_sector_map | self.hard_error_map
    }

    pub fn is_fake(&self) -> bool {
        self.bad_sector_map.is_fake_segment()
    }

    /// Number of 1 KiB blocks the segment carries on tape.
    pub fn blocks(&self) -> usize {
        self.bad_sector_map.good_count() as usize
    }

    /// Block index of physical `sector`.
    pub fn block_of(&self, sector: u8) -> usize {
        let below = SectorMap::range(0, sector);
        (below & !self.bad_sector_map).count() as usize
    }

    /// Position on the first sector not yet transferred and size the next contiguous run
    /// of good sectors. Returns the run length, 0 once the segment is exhausted.
    pub fn calc_next_cluster(&mut self) -> u8 {
        let skip = self.usable();
        let mut offset = self.sector_offset;
        while (offset as usize) < SECTORS_PER_SEGMENT && skip.is_set(offset) {
            offset += 1;
        }
        self.sector_offset = offset;
        self.data_offset = self.block_of(offset) * SECTOR_SIZE;
        let mut count = 0u8;
        while ((offset + count) as usize) < SECTORS_PER_SEGMENT && !skip.is_set(offset + count) {
            count += 1;
        }
        self.sector_count = count;
        count
    }

    /// Account for `count` sectors transferred from the start of the cluster. Sectors that
    /// failed on an earlier pass and came through this time are forgiven.
    pub fn advance(&mut self, count: u8) {
        let done = SectorMap::range(self.sector_offset, count);
        self.soft_error_map &= !done;
        self.sector_offset = self.sector_offset.saturating_add(count);
        self.sector_count = self.sector_count.saturating_sub(count);
        self.remaining = self.remaining.saturating_sub(count);
        self.data_offset = self.block_of(self.sector_offset.min(SECTORS_PER_SEGMENT as u8)) * SECTOR_SIZE;
    }

    /// Step over the sector at `sector_offset` without transferring it.
    pub fn skip_bad_sector(&mut self) {
        if (self.sector_offset as usize) < SECTORS_PER_SEGMENT {
            self.sector_offset += 1;
            self.sector_count = self.sector_count.saturating_sub(1);
            self.remaining = self.remaining.saturating_sub(1);
            self.data_offset = self.block_of(self.sector_offset) * SECTOR_SIZE;
        }
    }

    /// Restart the slot after a repositioning retry. Sectors before `resume` were read
    /// fine and are not fetched again.
    pub fn resume_at(&mut self, resume: u8) {
        self.rewind();
        let done = SectorMap::range(0, resume) & !self.usable();
        self.remaining = self.remaining.saturating_sub(done.count() as u8);
        self.sector_offset = resume.min(SECTORS_PER_SEGMENT as u8);
        self.skip = resume;
    }

    /// Sectors that failed on this pass, as block indices for the codec.
    pub fn erasures(&self) -> SectorMap {
        (self.soft_error_map | self.hard_error_map).compress(self.bad_sector_map)
    }

    pub fn error_count(&self) -> u32 {
        (self.soft_error_map | self.hard_error_map).count()
    }

    /// The slice the cluster in flight maps to.
    pub fn cluster_data(&self) -> &[u8] {
        let end = (self.data_offset + self.sector_count as usize * SECTOR_SIZE).min(self.data.len());
        &self.data[self.data_offset.min(end)..end]
    }

    pub fn cluster_data_mut(&mut self) -> &mut [u8] {
        let end = (self.data_offset + self.sector_count as usize * SECTOR_SIZE).min(self.data.len());
        let start = self.data_offset.min(end);
        &mut self.data[start..end]
    }
}

impl fmt::Debug for SegmentBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentBuffer")
            .field("segment_id", &self.segment_id)
            .field("status", &self.status)
            .field("bsm", &self.bad_sector_map)
            .field("offset", &self.sector_offset)
            .field("count", &self.sector_count)
            .field("remaining", &self.remaining)
            .field("soft", &self.soft_error_map)
            .field("hard", &self.hard_error_map)
            .field("next", &self.next_segment)
            .finish()
    }
}

pub struct BufferRing {
    pub slots: [SegmentBuffer; NR_BUFFERS],
    pub head: usize,
    pub tail: usize,
}

impl Default for BufferRing {
    fn default() -> Self {
        BufferRing {
            slots: Default::default(),
            head: 0,
            tail: 0,
        }
    }
}

impl BufferRing {
    pub fn next_index(index: usize) -> usize {
        (index + 1) % NR_BUFFERS
    }

    pub fn head(&self) -> &SegmentBuffer {
        &self.slots[self.head]
    }

    pub fn head_mut(&mut self) -> &mut SegmentBuffer {
        &mut self.slots[self.head]
    }

    pub fn tail(&self) -> &SegmentBuffer {
        &self.slots[self.tail]
    }

    pub fn tail_mut(&mut self) -> &mut SegmentBuffer {
        &mut self.slots[self.tail]
    }

    pub fn advance_head(&mut self) {
        self.head = Self::next_index(self.head);
    }

    pub fn advance_tail(&mut self) {
        self.tail = Self::next_index(self.tail);
    }

    /// Prepare every slot for reading.
    pub fn zap_reads(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.status = BufferStatus::Waiting;
        }
        self.head = 0;
        self.tail = 0;
    }

    /// Prepare every slot for writing; a `Done` write slot is free.
    pub fn zap_writes(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.status = BufferStatus::Done;
        }
        self.head = 0;
        self.tail = 0;
    }

    pub fn any_owned_by_isr(&self) -> bool {
        self.slots.iter().any(|s| s.status.owned_by_isr())
    }

    pub fn statuses(&self) -> [BufferStatus; NR_BUFFERS] {
        [self.slots[0].status, self.slots[1].status, self.slots[2].status]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn drain(buffer: &mut SegmentBuffer) -> (u32, Vec<u8>) {
        let mut total = 0u32;
        let mut clusters = Vec::new();
        loop {
            let n = buffer.calc_next_cluster();
            if n == 0 {
                break;
            }
            clusters.push(n);
            total += n as u32;
            buffer.advance(n);
        }
        (total, clusters)
    }

    #[test]
    fn test_clean_segment_is_one_cluster() {
        let mut buffer = SegmentBuffer::default();
        buffer.setup(10, FloppyAddress::default(), SectorMap::NONE, 11);
        assert_eq!(buffer.remaining, 32);
        assert_eq!(buffer.calc_next_cluster(), 32);
        buffer.advance(32);
        assert_eq!(buffer.remaining, 0);
        assert_eq!(buffer.calc_next_cluster(), 0);
        assert_eq!(buffer.calc_next_cluster(), 0);
    }

    #[test]
    fn test_clusters_around_bad_sectors() {
        let mut buffer = SegmentBuffer::default();
        buffer.setup(12, FloppyAddress::default(), SectorMap::from_sectors([3, 7]), 13);
        let (total, clusters) = drain(&mut buffer);
        assert_eq!(total, 30);
        assert_eq!(clusters, vec![3, 3, 24]);
    }

    #[test]
    fn test_data_offset_tracks_blocks() {
        let mut buffer = SegmentBuffer::default();
        buffer.setup(12, FloppyAddress::default(), SectorMap::from_sectors([3, 7]), 13);
        buffer.calc_next_cluster();
        buffer.advance(3);
        assert_eq!(buffer.calc_next_cluster(), 3);
        assert_eq!(buffer.sector_offset, 4);
        assert_eq!(buffer.data_offset, 3 * SECTOR_SIZE);
        // Sector 5 fails and is skipped; sector 6 still lands in block 5.
        buffer.advance(1);
        buffer.skip_bad_sector();
        assert_eq!(buffer.sector_offset, 6);
        assert_eq!(buffer.data_offset, 5 * SECTOR_SIZE);
    }

    #[test]
    fn test_hard_errors_are_skipped() {
        let mut buffer = SegmentBuffer::default();
        buffer.setup(5, FloppyAddress::default(), SectorMap::NONE, 0);
        buffer.hard_error_map.set(4);
        buffer.rewind();
        let (total, clusters) = drain(&mut buffer);
        assert_eq!(total, 31);
        assert_eq!(clusters, vec![4, 27]);
        assert_eq!(buffer.erasures(), SectorMap::from_sectors([4]));
    }

    #[test]
    fn test_fake_segment() {
        let mut buffer = SegmentBuffer::default();
        buffer.setup(30, FloppyAddress::default(), SectorMap::FAKE_SEGMENT, 31);
        assert!(buffer.is_fake());
        assert_eq!(buffer.calc_next_cluster(), 1);
        assert_eq!(buffer.sector_offset, 0);
    }

    #[test]
    fn test_resume_at() {
        let mut buffer = SegmentBuffer::default();
        buffer.setup(8, FloppyAddress::default(), SectorMap::from_sectors([1]), 9);
        buffer.resume_at(10);
        assert_eq!(buffer.remaining, 22);
        assert_eq!(buffer.calc_next_cluster(), 22);
        assert_eq!(buffer.data_offset, 9 * SECTOR_SIZE);
    }

    #[test]
    fn test_ring_zap() {
        let mut ring = BufferRing::default();
        ring.zap_writes();
        assert_eq!(ring.statuses(), [BufferStatus::Done; NR_BUFFERS]);
        ring.zap_reads();
        assert_eq!(ring.statuses(), [BufferStatus::Waiting; NR_BUFFERS]);
        ring.advance_tail();
        ring.advance_tail();
        ring.advance_tail();
        assert_eq!(ring.tail, 0);
    }

    proptest! {
        #[test]
        fn prop_clusters_cover_good_sectors(bsm in any::<u32>(), hard in any::<u32>()) {
            let bsm = SectorMap::new(bsm);
            let mut buffer = SegmentBuffer::default();
            buffer.setup(1, FloppyAddress::default(), bsm, 2);
            buffer.hard_error_map = SectorMap::new(hard) & !bsm;
            buffer.rewind();
            let expected = (bsm | buffer.hard_error_map).good_count();
            prop_assert_eq!(buffer.remaining as u32, expected);
            let (total, _) = drain(&mut buffer);
            prop_assert_eq!(total, expected);
            prop_assert_eq!(buffer.remaining, 0);
        }
    }
}
