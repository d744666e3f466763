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

    bsm.rs

    Bad sector map: array and list encodings of the header segment.
*/

//! Bad-sector map.
//!
//! Two on-tape encodings exist. Array formats store one 32-bit mask per segment after the
//! failed-sector log. List formats store a sorted list of 3-byte absolute sector numbers
//! (1-based), where `0x800000` flags a segment that is unusable as a whole. The list is
//! looked up through a cursor that makes the usual front-to-back access pattern cheap.

use crate::{
    device_types::sector_map::{SectorMap, SECTORS_PER_SEGMENT},
    error::HeaderError,
    header::{FormatCode, BSM_ARRAY_OFFSET, BSM_LIST_OFFSET},
};

pub const BSM_EMPTY_FLAG: u32 = 0x80_0000;
const BSM_SECTOR_MASK: u32 = 0x7f_ffff;
const BSM_LIST_ENTRY_LEN: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
enum BsmEncoding {
    Array(Vec<u32>),
    List(Vec<u32>),
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BsmStats {
    pub bad_sectors: u32,
    pub empty_segments: u32,
    pub segments_with_defects: u32,
}

#[derive(Clone, Debug)]
pub struct BadSectorMap {
    encoding: BsmEncoding,
    last_reference: usize,
    dirty: bool,
}

fn entry_segment(entry: u32) -> u32 {
    ((entry & BSM_SECTOR_MASK).saturating_sub(1)) / SECTORS_PER_SEGMENT as u32
}

fn entry_sector(entry: u32) -> u8 {
    (((entry & BSM_SECTOR_MASK).saturating_sub(1)) % SECTORS_PER_SEGMENT as u32) as u8
}

fn make_entry(segment: u32, sector: u8) -> u32 {
    segment * SECTORS_PER_SEGMENT as u32 + sector as u32 + 1
}

/// Index of the first list entry whose segment is at or beyond `segment`, walking forward
/// from the cursor.
fn forward_seek_entry(entries: &[u32], cursor: &mut usize, segment: u32) -> usize {
    let mut i = (*cursor).min(entries.len());
    while i < entries.len() && entry_segment(entries[i]) < segment {
        i += 1;
    }
    *cursor = i;
    i
}

fn backwards_seek_entry(entries: &[u32], cursor: &mut usize, segment: u32) -> usize {
    let mut i = (*cursor).min(entries.len());
    while i > 0 && entry_segment(entries[i - 1]) >= segment {
        i -= 1;
    }
    *cursor = i;
    i
}

/// Sequential lookups only ever move the cursor a short way.
fn seek_entry(entries: &[u32], cursor: &mut usize, segment: u32) -> usize {
    if *cursor < entries.len() && entry_segment(entries[*cursor]) < segment {
        forward_seek_entry(entries, cursor, segment)
    }
    else {
        backwards_seek_entry(entries, cursor, segment)
    }
}

impl BadSectorMap {
    /// A map with no defects for a cartridge that has `segments` segments.
    pub fn empty(format: FormatCode, segments: u32) -> Self {
        let encoding = if format.uses_list_encoding() {
            BsmEncoding::List(Vec::new())
        }
        else {
            BsmEncoding::Array(vec![0; segments as usize])
        };
        BadSectorMap {
            encoding,
            last_reference: 0,
            dirty: false,
        }
    }

    /// Decode the map from a header segment. For list formats the returned offset is the
    /// first byte after the terminating entry, where the file-mark list begins.
    pub fn extract(format: FormatCode, header: &[u8], segments: u32) -> Result<(Self, usize), HeaderError> {
        if format.uses_list_encoding() {
            let mut entries = Vec::new();
            let mut offset = BSM_LIST_OFFSET;
            loop {
                let Some(bytes) = header.get(offset..offset + BSM_LIST_ENTRY_LEN)
                else {
                    return Err(HeaderError::Truncated {
                        need: offset + BSM_LIST_ENTRY_LEN,
                        have: header.len(),
                    });
                };
                offset += BSM_LIST_ENTRY_LEN;
                let entry = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]);
                if entry == 0 {
                    break;
                }
                if let Some(&prev) = entries.last() {
                    if entry & BSM_SECTOR_MASK <= prev & BSM_SECTOR_MASK {
                        log::warn!("extract(): unsorted bad sector list entry {:06X} after {:06X}", entry, prev);
                    }
                }
                entries.push(entry);
            }
            entries.sort_by_key(|e| e & BSM_SECTOR_MASK);
            entries.dedup_by_key(|e| *e & BSM_SECTOR_MASK);
            let map = BadSectorMap {
                encoding: BsmEncoding::List(entries),
                last_reference: 0,
                dirty: false,
            };
            Ok((map, offset))
        }
        else {
            let need = BSM_ARRAY_OFFSET + segments as usize * 4;
            if header.len() < need {
                return Err(HeaderError::Truncated {
                    need,
                    have: header.len(),
                });
            }
            let masks = header[BSM_ARRAY_OFFSET..need]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            let map = BadSectorMap {
                encoding: BsmEncoding::Array(masks),
                last_reference: 0,
                dirty: false,
            };
            Ok((map, BSM_ARRAY_OFFSET))
        }
    }

    /// Serialize into a header segment buffer. Returns the offset just past the encoded map.
    pub fn encode(&self, header: &mut [u8]) -> Result<usize, HeaderError> {
        match &self.encoding {
            BsmEncoding::Array(masks) => {
                let end = BSM_ARRAY_OFFSET + masks.len() * 4;
                if header.len() < end {
                    return Err(HeaderError::Overflow("bad sector map"));
                }
                for (chunk, mask) in header[BSM_ARRAY_OFFSET..end].chunks_exact_mut(4).zip(masks) {
                    chunk.copy_from_slice(&mask.to_le_bytes());
                }
                Ok(end)
            }
            BsmEncoding::List(entries) => {
                let end = BSM_LIST_OFFSET + (entries.len() + 1) * BSM_LIST_ENTRY_LEN;
                if header.len() < end {
                    return Err(HeaderError::Overflow("bad sector list"));
                }
                let mut offset = BSM_LIST_OFFSET;
                for entry in entries.iter().chain(std::iter::once(&0)) {
                    header[offset..offset + BSM_LIST_ENTRY_LEN].copy_from_slice(&entry.to_le_bytes()[..3]);
                    offset += BSM_LIST_ENTRY_LEN;
                }
                Ok(end)
            }
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.encoding, BsmEncoding::List(_))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn seek_entry(&mut self, segment: u32) -> usize {
        let BsmEncoding::List(entries) = &self.encoding
        else {
            return 0;
        };
        seek_entry(entries, &mut self.last_reference, segment)
    }

    pub fn get_bad_sector_entry(&mut self, segment: u32) -> SectorMap {
        if let BsmEncoding::Array(masks) = &self.encoding {
            return masks.get(segment as usize).copied().map(SectorMap::new).unwrap_or_default();
        }
        let start = self.seek_entry(segment);
        let BsmEncoding::List(entries) = &self.encoding
        else {
            return SectorMap::NONE;
        };
        let mut map = SectorMap::NONE;
        for &entry in entries[start..].iter().take_while(|&&e| entry_segment(e) == segment) {
            if entry & BSM_EMPTY_FLAG != 0 {
                return SectorMap::EMPTY_SEGMENT;
            }
            map.set(entry_sector(entry));
        }
        map
    }

    pub fn put_bad_sector_entry(&mut self, segment: u32, map: SectorMap) {
        if let BsmEncoding::Array(masks) = &mut self.encoding {
            if masks.len() <= segment as usize {
                masks.resize(segment as usize + 1, 0);
            }
            if masks[segment as usize] != map.bits() {
                masks[segment as usize] = map.bits();
                self.dirty = true;
            }
            return;
        }
        let start = self.seek_entry(segment);
        let BsmEncoding::List(entries) = &mut self.encoding
        else {
            return;
        };
        let end = start + entries[start..].iter().take_while(|&&e| entry_segment(e) == segment).count();
        let replacement: Vec<u32> = if map.is_empty_segment() {
            vec![BSM_EMPTY_FLAG | make_entry(segment, 0)]
        }
        else {
            map.iter().map(|sector| make_entry(segment, sector)).collect()
        };
        if entries[start..end] != replacement[..] {
            entries.splice(start..end, replacement);
            self.dirty = true;
        }
    }

    pub fn stats(&mut self, segments: u32) -> BsmStats {
        let mut stats = BsmStats::default();
        for segment in 0..segments {
            let map = self.get_bad_sector_entry(segment);
            if map.is_empty_segment() {
                stats.empty_segments += 1;
                stats.bad_sectors += SECTORS_PER_SEGMENT as u32;
            }
            else if !map.is_empty() {
                stats.segments_with_defects += 1;
                stats.bad_sectors += map.count();
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_types::sector_map::SECTOR_SIZE;
    use proptest::prelude::*;

    #[test]
    fn test_array_round_trip() {
        let mut map = BadSectorMap::empty(FormatCode::Normal, 2800);
        map.put_bad_sector_entry(10, SectorMap::from_sectors([1, 5]));
        map.put_bad_sector_entry(2799, SectorMap::EMPTY_SEGMENT);
        let mut header = vec![0u8; 29 * SECTOR_SIZE];
        assert_eq!(map.encode(&mut header).unwrap(), BSM_ARRAY_OFFSET + 2800 * 4);
        let (mut back, _) = BadSectorMap::extract(FormatCode::Normal, &header, 2800).unwrap();
        assert_eq!(back.get_bad_sector_entry(10), SectorMap::from_sectors([1, 5]));
        assert_eq!(back.get_bad_sector_entry(2799), SectorMap::EMPTY_SEGMENT);
        assert!(back.get_bad_sector_entry(11).is_empty());
    }

    #[test]
    fn test_list_layout() {
        let mut map = BadSectorMap::empty(FormatCode::Wide, 6000);
        map.put_bad_sector_entry(2, SectorMap::from_sectors([0]));
        map.put_bad_sector_entry(1, SectorMap::EMPTY_SEGMENT);
        let mut header = vec![0u8; 29 * SECTOR_SIZE];
        let end = map.encode(&mut header).unwrap();
        assert_eq!(end, BSM_LIST_OFFSET + 9);
        // segment 1 empty: 0x800000 | (32 + 1)
        assert_eq!(&header[256..259], &[33, 0, 0x80]);
        // segment 2 sector 0: 65
        assert_eq!(&header[259..262], &[65, 0, 0]);
        assert_eq!(&header[262..265], &[0, 0, 0]);
    }

    #[test]
    fn test_list_cursor_random_access() {
        let mut map = BadSectorMap::empty(FormatCode::Ft1100, 9000);
        for segment in (0..9000).step_by(7) {
            map.put_bad_sector_entry(segment, SectorMap::from_sectors([(segment % 32) as u8]));
        }
        for segment in [8995u32, 14, 15, 7000, 0, 8995] {
            let expected = if segment % 7 == 0 {
                SectorMap::from_sectors([(segment % 32) as u8])
            }
            else {
                SectorMap::NONE
            };
            assert_eq!(map.get_bad_sector_entry(segment), expected, "segment {}", segment);
        }
    }

    #[test]
    fn test_list_cursor_follows_sequential_reads() {
        let mut map = BadSectorMap::empty(FormatCode::Wide, 1000);
        for segment in (0..1000).step_by(10) {
            map.put_bad_sector_entry(segment, SectorMap::from_sectors([1, 2]));
        }
        for segment in 0..1000u32 {
            map.get_bad_sector_entry(segment);
            // Two entries per listed segment lie before this one.
            assert_eq!(map.last_reference, 2 * segment.div_ceil(10) as usize, "segment {}", segment);
        }
        assert_eq!(map.get_bad_sector_entry(500), SectorMap::from_sectors([1, 2]));
        assert_eq!(map.last_reference, 100);
        assert!(map.get_bad_sector_entry(501).is_empty());
        assert_eq!(map.last_reference, 102);
    }

    #[test]
    fn test_noop_edit_keeps_list() {
        let mut map = BadSectorMap::empty(FormatCode::Wide, 100);
        map.put_bad_sector_entry(5, SectorMap::from_sectors([3, 4]));
        map.mark_clean();
        map.put_bad_sector_entry(5, SectorMap::from_sectors([3, 4]));
        assert!(!map.is_dirty());
        map.put_bad_sector_entry(5, SectorMap::NONE);
        assert!(map.is_dirty());
        assert!(map.get_bad_sector_entry(5).is_empty());
    }

    #[test]
    fn test_stats() {
        let mut map = BadSectorMap::empty(FormatCode::Normal, 100);
        map.put_bad_sector_entry(3, SectorMap::from_sectors([1, 2, 3]));
        map.put_bad_sector_entry(4, SectorMap::EMPTY_SEGMENT);
        let stats = map.stats(100);
        assert_eq!(stats.bad_sectors, 35);
        assert_eq!(stats.empty_segments, 1);
        assert_eq!(stats.segments_with_defects, 1);
    }

    fn arb_map() -> impl Strategy<Value = SectorMap> {
        prop_oneof![
            4 => any::<u32>().prop_map(|bits| SectorMap::new(bits & 0x00ff_00ff)),
            1 => Just(SectorMap::EMPTY_SEGMENT),
            1 => Just(SectorMap::NONE),
        ]
    }

    proptest! {
        #[test]
        fn prop_map_survives_encoding(
            list in any::<bool>(),
            edits in proptest::collection::vec((0u32..300, arb_map()), 0..40),
        ) {
            let format = if list { FormatCode::Wide } else { FormatCode::Normal };
            let mut map = BadSectorMap::empty(format, 300);
            let mut model = vec![SectorMap::NONE; 300];
            for (segment, entry) in &edits {
                map.put_bad_sector_entry(*segment, *entry);
                model[*segment as usize] = *entry;
            }
            let mut header = vec![0u8; 29 * SECTOR_SIZE];
            map.encode(&mut header).unwrap();
            let (mut back, _) = BadSectorMap::extract(format, &header, 300).unwrap();
            for segment in 0..300u32 {
                prop_assert_eq!(back.get_bad_sector_entry(segment), model[segment as usize]);
            }
        }
    }
}
