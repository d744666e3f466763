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

    device_types::sector_map.rs

    Per-segment sector bitmaps.
*/

//! Per-segment sector bitmaps.
//!
//! Bit `n` of a [SectorMap] stands for sector `n` of a segment (0..32). The same
//! representation serves the bad-sector map, soft/hard error maps, and the erasure
//! set handed to the ECC codec. In the codec's case bits index *data blocks*, that is,
//! the sectors that remain after the bad ones are squeezed out; [SectorMap::compress]
//! and [SectorMap::expand] convert between the two views.

use std::{
    fmt,
    ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not},
};

pub const SECTORS_PER_SEGMENT: usize = 32;
pub const SECTOR_SIZE: usize = 1024;
pub const SEGMENT_SIZE: usize = SECTORS_PER_SEGMENT * SECTOR_SIZE;
pub const ECC_SECTORS: usize = 3;

#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct SectorMap(u32);

impl SectorMap {
    pub const NONE: SectorMap = SectorMap(0);
    /// Every sector is bad. The segment carries no data at all.
    pub const EMPTY_SEGMENT: SectorMap = SectorMap(0xffff_ffff);
    /// Substituted for [SectorMap::EMPTY_SEGMENT] in the transfer path so that the runner
    /// still has one sector to step over and keeps the tape moving.
    pub const FAKE_SEGMENT: SectorMap = SectorMap(0xffff_fffe);

    pub const fn new(bits: u32) -> Self {
        SectorMap(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn from_sectors<I: IntoIterator<Item = u8>>(sectors: I) -> Self {
        let mut map = SectorMap::NONE;
        for sector in sectors {
            map.set(sector);
        }
        map
    }

    /// Bits `start..start + len`, clipped to the segment.
    pub fn range(start: u8, len: u8) -> Self {
        let mut map = SectorMap::NONE;
        for sector in start..start.saturating_add(len) {
            map.set(sector);
        }
        map
    }

    #[inline]
    pub fn is_set(self, sector: u8) -> bool {
        (sector as usize) < SECTORS_PER_SEGMENT && self.0 & (1 << sector) != 0
    }

    #[inline]
    pub fn set(&mut self, sector: u8) {
        if (sector as usize) < SECTORS_PER_SEGMENT {
            self.0 |= 1 << sector;
        }
    }

    #[inline]
    pub fn clear(&mut self, sector: u8) {
        if (sector as usize) < SECTORS_PER_SEGMENT {
            self.0 &= !(1 << sector);
        }
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Number of sectors not marked in this map.
    pub fn good_count(self) -> u32 {
        SECTORS_PER_SEGMENT as u32 - self.count()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_empty_segment(self) -> bool {
        self == SectorMap::EMPTY_SEGMENT
    }

    pub fn is_fake_segment(self) -> bool {
        self == SectorMap::FAKE_SEGMENT
    }

    pub fn shift_right(self, n: u32) -> Self {
        if n >= 32 {
            SectorMap::NONE
        }
        else {
            SectorMap(self.0 >> n)
        }
    }

    pub fn first_set(self) -> Option<u8> {
        if self.0 == 0 {
            None
        }
        else {
            Some(self.0.trailing_zeros() as u8)
        }
    }

    pub fn iter(self) -> SetSectors {
        SetSectors(self.0)
    }

    /// Translate physical sector positions into data block indices, where `bad` lists the
    /// sectors that hold no block. Positions that fall on a bad sector are dropped.
    pub fn compress(self, bad: SectorMap) -> SectorMap {
        let mut out = SectorMap::NONE;
        let mut block = 0u8;
        for sector in 0..SECTORS_PER_SEGMENT as u8 {
            if bad.is_set(sector) {
                continue;
            }
            if self.is_set(sector) {
                out.set(block);
            }
            block += 1;
        }
        out
    }

    /// Inverse of [SectorMap::compress].
    pub fn expand(self, bad: SectorMap) -> SectorMap {
        let mut out = SectorMap::NONE;
        let mut block = 0u8;
        for sector in 0..SECTORS_PER_SEGMENT as u8 {
            if bad.is_set(sector) {
                continue;
            }
            if self.is_set(block) {
                out.set(sector);
            }
            block += 1;
        }
        out
    }

    /// Number of payload bytes a segment with this bad-sector map can carry once the
    /// parity sectors are taken out.
    pub fn data_capacity(self) -> usize {
        if self.is_empty_segment() || self.is_fake_segment() {
            return 0;
        }
        (self.good_count() as usize).saturating_sub(ECC_SECTORS) * SECTOR_SIZE
    }
}

pub struct SetSectors(u32);

impl Iterator for SetSectors {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.0 == 0 {
            return None;
        }
        let sector = self.0.trailing_zeros();
        self.0 &= self.0 - 1;
        Some(sector as u8)
    }
}

impl fmt::Debug for SectorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorMap({:#010x})", self.0)
    }
}

impl fmt::Display for SectorMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032b}", self.0)
    }
}

impl From<u32> for SectorMap {
    fn from(bits: u32) -> Self {
        SectorMap(bits)
    }
}

impl BitOr for SectorMap {
    type Output = SectorMap;
    fn bitor(self, rhs: SectorMap) -> SectorMap {
        SectorMap(self.0 | rhs.0)
    }
}

impl BitOrAssign for SectorMap {
    fn bitor_assign(&mut self, rhs: SectorMap) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SectorMap {
    type Output = SectorMap;
    fn bitand(self, rhs: SectorMap) -> SectorMap {
        SectorMap(self.0 & rhs.0)
    }
}

impl BitAndAssign for SectorMap {
    fn bitand_assign(&mut self, rhs: SectorMap) {
        self.0 &= rhs.0;
    }
}

impl Not for SectorMap {
    type Output = SectorMap;
    fn not(self) -> SectorMap {
        SectorMap(!self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_skips_bad_sectors() {
        let bad = SectorMap::from_sectors([1, 2]);
        let errors = SectorMap::from_sectors([0, 3, 5]);
        let blocks = errors.compress(bad);
        assert_eq!(blocks, SectorMap::from_sectors([0, 1, 3]));
        assert_eq!(blocks.expand(bad), errors);
    }

    #[test]
    fn test_compress_drops_positions_on_bad_sectors() {
        let bad = SectorMap::from_sectors([4]);
        let errors = SectorMap::from_sectors([4, 6]);
        assert_eq!(errors.compress(bad), SectorMap::from_sectors([5]));
    }

    #[test]
    fn test_iter_and_counts() {
        let map = SectorMap::from_sectors([31, 0, 7]);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![0, 7, 31]);
        assert_eq!(map.count(), 3);
        assert_eq!(map.good_count(), 29);
        assert_eq!(map.first_set(), Some(0));
        assert_eq!(SectorMap::NONE.first_set(), None);
    }

    #[test]
    fn test_shift_and_range() {
        let map = SectorMap::range(4, 3);
        assert_eq!(map.bits(), 0b111_0000);
        assert_eq!(map.shift_right(4).bits(), 0b111);
        assert!(map.shift_right(32).is_empty());
        assert!(!map.is_set(40));
    }

    #[test]
    fn test_data_capacity() {
        assert_eq!(SectorMap::NONE.data_capacity(), 29 * SECTOR_SIZE);
        assert_eq!(SectorMap::from_sectors([3, 9]).data_capacity(), 27 * SECTOR_SIZE);
        assert_eq!(SectorMap::EMPTY_SEGMENT.data_capacity(), 0);
        assert_eq!(SectorMap::FAKE_SEGMENT.data_capacity(), 0);
        assert_eq!(SectorMap::new(0x0fff_ffff).data_capacity(), 1 * SECTOR_SIZE);
        assert_eq!(SectorMap::new(0x1fff_ffff).data_capacity(), 0);
    }
}
