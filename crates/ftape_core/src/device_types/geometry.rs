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

    device_types::geometry.rs

    Segment numbering and the floppy addresses segments are reached by.
*/

//! Tape geometry and the mapping between tape segments and floppy sector addresses.
//!
//! The floppy controller only knows cylinder/head/sector. A tape presents its segments as
//! runs of 32 sectors on an imaginary disk with `max_floppy_sector` sectors per track,
//! `max_floppy_track + 1` cylinders per head and `max_floppy_side + 1` heads.

use std::{collections::HashMap, fmt};

use lazy_static::lazy_static;

use crate::device_types::{
    qic117::{QicStandard, TapeLength},
    sector_map::SECTORS_PER_SEGMENT,
};

pub const FLOPPY_SECTORS_PER_TRACK: u8 = 128;
pub const FLOPPY_MAX_TRACK: u8 = 254;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TapeGeometry {
    pub segments_per_track: u32,
    pub tracks_per_tape: u32,
    pub max_floppy_side: u8,
    pub max_floppy_track: u8,
    pub max_floppy_sector: u8,
}

/// A controller-level address: the first sector of a segment, or any sector within one.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FloppyAddress {
    pub cyl: u8,
    pub head: u8,
    /// 1-based, as the controller expects.
    pub sect: u8,
}

impl fmt::Display for FloppyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[c:{} h:{} s:{}]", self.cyl, self.head, self.sect)
    }
}

/// The ID field returned by a Read ID command.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SectorId {
    pub cyl: u8,
    pub head: u8,
    pub sect: u8,
    pub size: u8,
}

lazy_static! {
    /// Segments per track and track count for each tape standard and cartridge length.
    pub static ref TAPE_FORMATS: HashMap<(QicStandard, TapeLength), (u32, u32)> = HashMap::from([
        ((QicStandard::Qic40, TapeLength::Normal), (68, 20)),
        ((QicStandard::Qic40, TapeLength::Long), (102, 20)),
        ((QicStandard::Qic40, TapeLength::ExtraLong), (254, 20)),
        ((QicStandard::Qic80, TapeLength::Normal), (100, 28)),
        ((QicStandard::Qic80, TapeLength::Long), (150, 28)),
        ((QicStandard::Qic80, TapeLength::ExtraLong), (365, 28)),
        ((QicStandard::Qic3010, TapeLength::Normal), (150, 40)),
        ((QicStandard::Qic3010, TapeLength::Long), (225, 40)),
        ((QicStandard::Qic3010, TapeLength::ExtraLong), (500, 40)),
        ((QicStandard::Qic3020, TapeLength::Normal), (150, 40)),
        ((QicStandard::Qic3020, TapeLength::Long), (225, 40)),
        ((QicStandard::Qic3020, TapeLength::ExtraLong), (500, 40)),
    ]);
}

impl TapeGeometry {
    pub fn new(segments_per_track: u32, tracks_per_tape: u32) -> Self {
        let mut geometry = TapeGeometry {
            segments_per_track,
            tracks_per_tape,
            max_floppy_side: 0,
            max_floppy_track: FLOPPY_MAX_TRACK,
            max_floppy_sector: FLOPPY_SECTORS_PER_TRACK,
        };
        let per_head = geometry.segments_per_head().max(1);
        let heads = geometry.total_segments().div_ceil(per_head).max(1);
        geometry.max_floppy_side = (heads - 1).min(u8::MAX as u32) as u8;
        geometry
    }

    pub fn for_standard(standard: QicStandard, length: TapeLength) -> Self {
        let (segments_per_track, tracks) = TAPE_FORMATS
            .get(&(standard, length))
            .copied()
            .unwrap_or((100, 28));
        TapeGeometry::new(segments_per_track, tracks)
    }

    pub fn segments_per_cylinder(&self) -> u32 {
        (self.max_floppy_sector as u32 / SECTORS_PER_SEGMENT as u32).max(1)
    }

    pub fn segments_per_head(&self) -> u32 {
        (self.max_floppy_track as u32 + 1) * self.segments_per_cylinder()
    }

    pub fn total_segments(&self) -> u32 {
        self.segments_per_track * self.tracks_per_tape
    }

    pub fn track_of(&self, segment: u32) -> u32 {
        segment / self.segments_per_track.max(1)
    }

    pub fn track_start(&self, track: u32) -> u32 {
        track * self.segments_per_track
    }

    pub fn track_end(&self, track: u32) -> u32 {
        self.track_start(track) + self.segments_per_track - 1
    }

    /// Address of the first sector of `segment`.
    pub fn segment_address(&self, segment: u32) -> FloppyAddress {
        let per_head = self.segments_per_head();
        let per_cyl = self.segments_per_cylinder();
        FloppyAddress {
            head: (segment / per_head) as u8,
            cyl: ((segment % per_head) / per_cyl) as u8,
            sect: ((segment % per_cyl) * SECTORS_PER_SEGMENT as u32 + 1) as u8,
        }
    }

    /// Address of `sector` (0-based) within `segment`.
    pub fn sector_address(&self, segment: u32, sector: u8) -> FloppyAddress {
        let mut address = self.segment_address(segment);
        address.sect += sector;
        address
    }

    /// Invert a Read ID result into `(segment, sector)`. Returns `None` for IDs that cannot
    /// belong to this tape.
    pub fn segment_from_id(&self, id: &SectorId) -> Option<(u32, u8)> {
        if id.sect == 0 || id.sect > self.max_floppy_sector || id.cyl > self.max_floppy_track {
            return None;
        }
        let sect = (id.sect - 1) as u32;
        let segment = id.head as u32 * self.segments_per_head()
            + id.cyl as u32 * self.segments_per_cylinder()
            + sect / SECTORS_PER_SEGMENT as u32;
        if segment >= self.total_segments() {
            return None;
        }
        Some((segment, (sect % SECTORS_PER_SEGMENT as u32) as u8))
    }

    pub fn sector_id(&self, segment: u32, sector: u8) -> SectorId {
        let address = self.sector_address(segment, sector);
        SectorId {
            cyl: address.cyl,
            head: address.head,
            sect: address.sect,
            size: 3,
        }
    }
}

impl Default for TapeGeometry {
    fn default() -> Self {
        TapeGeometry::for_standard(QicStandard::Qic80, TapeLength::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_address() {
        let geometry = TapeGeometry::new(100, 28);
        assert_eq!(geometry.segments_per_cylinder(), 4);
        assert_eq!(geometry.segments_per_head(), 1020);
        assert_eq!(geometry.max_floppy_side, 2);

        let a = geometry.segment_address(0);
        assert_eq!((a.cyl, a.head, a.sect), (0, 0, 1));
        let a = geometry.segment_address(5);
        assert_eq!((a.cyl, a.head, a.sect), (1, 0, 33));
        let a = geometry.segment_address(1021);
        assert_eq!((a.cyl, a.head, a.sect), (0, 1, 33));
    }

    #[test]
    fn test_id_inverse() {
        let geometry = TapeGeometry::new(150, 28);
        for segment in [0, 3, 4, 1019, 1020, 2047, 4199] {
            for sector in [0u8, 17, 31] {
                let id = geometry.sector_id(segment, sector);
                assert_eq!(geometry.segment_from_id(&id), Some((segment, sector)));
            }
        }
        let bogus = SectorId {
            cyl: 0,
            head: 9,
            sect: 1,
            size: 3,
        };
        assert_eq!(geometry.segment_from_id(&bogus), None);
    }

    #[test]
    fn test_tracks() {
        let geometry = TapeGeometry::for_standard(QicStandard::Qic80, TapeLength::Normal);
        assert_eq!(geometry.total_segments(), 2800);
        assert_eq!(geometry.track_of(199), 1);
        assert_eq!(geometry.track_start(2), 200);
        assert_eq!(geometry.track_end(2), 299);
    }
}
