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

    eof.rs

    File mark map kept in the failed sector log of the header segment.
*/

//! File-mark map.
//!
//! File marks live in the header segment region that older software used as a failed-sector
//! log. Array formats keep a mark count at [FILE_MARK_COUNT_OFFSET] and the entries at
//! [FAILED_SECTOR_LOG_OFFSET]. List formats append the entries, zero terminated, right
//! after the bad-sector list. Each entry is a little-endian segment and sector pair;
//! the first Linux label revision wrote them the other way round.

use crate::{
    error::{HeaderError, MapError},
    header::{FmtVersion, FAILED_SECTOR_LOG_OFFSET, FAILED_SECTOR_LOG_SIZE, FILE_MARK_COUNT_OFFSET},
};

const FILE_MARK_ENTRY_LEN: usize = 4;
pub const FILE_MARK_CAPACITY: usize = FAILED_SECTOR_LOG_SIZE / FILE_MARK_ENTRY_LEN;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileMark {
    pub segment: u16,
    /// 1-based offset of the mark within the segment.
    pub sector: u16,
}

impl FileMark {
    pub fn new(segment: u16, sector: u16) -> Self {
        FileMark { segment, sector }
    }
}

#[derive(Clone, Debug)]
pub struct FileMarkMap {
    marks: Vec<FileMark>,
    capacity: usize,
    last_reference: usize,
    version: FmtVersion,
    list_encoding: bool,
    dirty: bool,
}

impl FileMarkMap {
    pub fn new(version: FmtVersion, list_encoding: bool) -> Self {
        FileMarkMap {
            marks: Vec::new(),
            capacity: FILE_MARK_CAPACITY,
            last_reference: 0,
            version,
            list_encoding,
            dirty: false,
        }
    }

    /// Load the marks stored in `header`. `list_offset` is where the bad-sector list
    /// ended, and is ignored for array formats.
    pub fn extract(
        version: FmtVersion,
        list_encoding: bool,
        header: &[u8],
        list_offset: usize,
    ) -> Result<Self, HeaderError> {
        let mut map = FileMarkMap::new(version, list_encoding);
        if version == FmtVersion::Legacy {
            return Ok(map);
        }

        let decode = |bytes: &[u8]| {
            let a = u16::from_le_bytes([bytes[0], bytes[1]]);
            let b = u16::from_le_bytes([bytes[2], bytes[3]]);
            match version {
                FmtVersion::Swapped => FileMark::new(b, a),
                _ => FileMark::new(a, b),
            }
        };

        if list_encoding {
            let mut offset = list_offset;
            loop {
                let Some(bytes) = header.get(offset..offset + FILE_MARK_ENTRY_LEN)
                else {
                    return Err(HeaderError::Truncated {
                        need: offset + FILE_MARK_ENTRY_LEN,
                        have: header.len(),
                    });
                };
                if bytes.iter().all(|&b| b == 0) {
                    break;
                }
                if map.marks.len() == map.capacity {
                    log::warn!("extract(): file mark list exceeds {} entries, truncating", map.capacity);
                    break;
                }
                map.marks.push(decode(bytes));
                offset += FILE_MARK_ENTRY_LEN;
            }
        }
        else {
            if header.len() < FAILED_SECTOR_LOG_OFFSET + FAILED_SECTOR_LOG_SIZE {
                return Err(HeaderError::Truncated {
                    need: FAILED_SECTOR_LOG_OFFSET + FAILED_SECTOR_LOG_SIZE,
                    have: header.len(),
                });
            }
            let mut count =
                u16::from_le_bytes([header[FILE_MARK_COUNT_OFFSET], header[FILE_MARK_COUNT_OFFSET + 1]]) as usize;
            if count > map.capacity {
                log::warn!("extract(): file mark count {} exceeds {}, truncating", count, map.capacity);
                count = map.capacity;
            }
            let start = FAILED_SECTOR_LOG_OFFSET;
            map.marks = header[start..start + count * FILE_MARK_ENTRY_LEN]
                .chunks_exact(FILE_MARK_ENTRY_LEN)
                .map(decode)
                .collect();
        }

        map.marks.sort();
        map.marks.dedup();
        if version == FmtVersion::Swapped {
            log::debug!("extract(): converting {} swapped file marks", map.marks.len());
            map.version = FmtVersion::Current;
            map.dirty = true;
        }
        Ok(map)
    }

    /// Write the marks back in the current layout.
    pub fn encode(&self, header: &mut [u8], list_offset: usize) -> Result<(), HeaderError> {
        if self.version == FmtVersion::Legacy {
            return Ok(());
        }
        if self.list_encoding {
            let end = list_offset + (self.marks.len() + 1) * FILE_MARK_ENTRY_LEN;
            if header.len() < end {
                return Err(HeaderError::Overflow("file mark list"));
            }
            let mut offset = list_offset;
            for mark in self.marks.iter().chain(std::iter::once(&FileMark::default())) {
                header[offset..offset + 2].copy_from_slice(&mark.segment.to_le_bytes());
                header[offset + 2..offset + 4].copy_from_slice(&mark.sector.to_le_bytes());
                offset += FILE_MARK_ENTRY_LEN;
            }
        }
        else {
            if header.len() < FAILED_SECTOR_LOG_OFFSET + FAILED_SECTOR_LOG_SIZE {
                return Err(HeaderError::Overflow("file mark array"));
            }
            header[FILE_MARK_COUNT_OFFSET..FILE_MARK_COUNT_OFFSET + 2]
                .copy_from_slice(&(self.marks.len() as u16).to_le_bytes());
            let region = &mut header[FAILED_SECTOR_LOG_OFFSET..FAILED_SECTOR_LOG_OFFSET + FAILED_SECTOR_LOG_SIZE];
            region.fill(0);
            for (chunk, mark) in region.chunks_exact_mut(FILE_MARK_ENTRY_LEN).zip(&self.marks) {
                chunk[0..2].copy_from_slice(&mark.segment.to_le_bytes());
                chunk[2..4].copy_from_slice(&mark.sector.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn version(&self) -> FmtVersion {
        self.version
    }

    pub fn supported(&self) -> bool {
        self.version != FmtVersion::Legacy
    }

    /// Take over the failed-sector log for file marks. Anything the previous owner left there
    /// is discarded on the next header write.
    pub fn enable(&mut self) {
        if self.version != FmtVersion::Current {
            log::info!("enable(): upgrading file mark map from {:?}", self.version);
            self.version = FmtVersion::Current;
            self.marks.clear();
            self.last_reference = 0;
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileMark> {
        self.marks.iter()
    }

    pub fn reset_eof_list(&mut self) {
        self.last_reference = 0;
    }

    /// Sector offset (1-based) of the file mark in `segment`, or 0 when there is none.
    /// Only scans forward from the previous query.
    pub fn check_for_eof(&mut self, segment: u32) -> u16 {
        let mut i = self.last_reference;
        while i < self.marks.len() && (self.marks[i].segment as u32) < segment {
            i += 1;
        }
        self.last_reference = i;
        match self.marks.get(i) {
            Some(mark) if mark.segment as u32 == segment => mark.sector,
            _ => 0,
        }
    }

    pub fn put_file_mark_in_map(&mut self, segment: u16, sector: u16) -> Result<(), MapError> {
        if !self.supported() {
            return Err(MapError::FileMarksUnsupported);
        }
        let mark = FileMark::new(segment, sector);
        match self.marks.binary_search(&mark) {
            Ok(_) => Ok(()),
            Err(index) => {
                if self.marks.len() >= self.capacity {
                    return Err(MapError::FileMarksFull(self.capacity));
                }
                self.marks.insert(index, mark);
                if index < self.last_reference {
                    self.last_reference += 1;
                }
                self.dirty = true;
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, segment: u16, sector: u16) -> bool {
        match self.marks.binary_search(&FileMark::new(segment, sector)) {
            Ok(index) => {
                self.marks.remove(index);
                if index < self.last_reference {
                    self.last_reference -= 1;
                }
                self.dirty = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Drop every mark at or beyond `segment`. Returns how many were removed.
    pub fn clear_from(&mut self, segment: u32) -> usize {
        let keep = self.marks.partition_point(|m| (m.segment as u32) < segment);
        let removed = self.marks.len() - keep;
        if removed > 0 {
            self.marks.truncate(keep);
            self.last_reference = self.last_reference.min(keep);
            self.dirty = true;
        }
        removed
    }

    /// The `count`th mark (1-based) at or after `segment`.
    pub fn find_forward(&self, segment: u32, count: usize) -> Option<FileMark> {
        let start = self.marks.partition_point(|m| (m.segment as u32) < segment);
        count.checked_sub(1).and_then(|n| self.marks.get(start + n)).copied()
    }

    /// The `count`th mark (1-based) strictly before `segment`, walking backwards.
    pub fn find_backward(&self, segment: u32, count: usize) -> Option<FileMark> {
        let end = self.marks.partition_point(|m| (m.segment as u32) < segment);
        count.checked_sub(1).and_then(|n| end.checked_sub(n + 1)).map(|i| self.marks[i])
    }

    pub fn last(&self) -> Option<FileMark> {
        self.marks.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header() -> Vec<u8> {
        vec![0u8; 29 * 1024]
    }

    #[test]
    fn test_array_layout() {
        let mut map = FileMarkMap::new(FmtVersion::Current, false);
        map.put_file_mark_in_map(21, 1).unwrap();
        map.put_file_mark_in_map(20, 1).unwrap();
        let mut buf = header();
        map.encode(&mut buf, 0).unwrap();
        assert_eq!(&buf[144..146], &[2, 0]);
        assert_eq!(&buf[256..264], &[20, 0, 1, 0, 21, 0, 1, 0]);

        let back = FileMarkMap::extract(FmtVersion::Current, false, &buf, 0).unwrap();
        assert_eq!(back.iter().copied().collect::<Vec<_>>(), vec![
            FileMark::new(20, 1),
            FileMark::new(21, 1)
        ]);
    }

    #[test]
    fn test_swapped_entries_are_upgraded() {
        let mut buf = header();
        buf[144] = 1;
        // sector 3, segment 400
        buf[256..260].copy_from_slice(&[3, 0, 0x90, 0x01]);
        let map = FileMarkMap::extract(FmtVersion::Swapped, false, &buf, 0).unwrap();
        assert_eq!(map.last(), Some(FileMark::new(400, 3)));
        assert_eq!(map.version(), FmtVersion::Current);
        assert!(map.is_dirty());
    }

    #[test]
    fn test_list_layout() {
        let mut map = FileMarkMap::new(FmtVersion::Current, true);
        map.put_file_mark_in_map(7, 2).unwrap();
        let mut buf = header();
        map.encode(&mut buf, 262).unwrap();
        assert_eq!(&buf[262..270], &[7, 0, 2, 0, 0, 0, 0, 0]);
        let back = FileMarkMap::extract(FmtVersion::Current, true, &buf, 262).unwrap();
        assert_eq!(back.len(), 1);
    }

    #[test]
    fn test_legacy_rejects_marks() {
        let mut map = FileMarkMap::new(FmtVersion::Legacy, false);
        assert!(matches!(
            map.put_file_mark_in_map(5, 1),
            Err(MapError::FileMarksUnsupported)
        ));
        map.enable();
        map.put_file_mark_in_map(5, 1).unwrap();
        assert!(map.is_dirty());
    }

    #[test]
    fn test_find_and_clear() {
        let mut map = FileMarkMap::new(FmtVersion::Current, false);
        for segment in [10, 20, 30, 40] {
            map.put_file_mark_in_map(segment, 1).unwrap();
        }
        assert_eq!(map.find_forward(15, 1), Some(FileMark::new(20, 1)));
        assert_eq!(map.find_forward(15, 3), Some(FileMark::new(40, 1)));
        assert_eq!(map.find_forward(15, 4), None);
        assert_eq!(map.find_backward(30, 1), Some(FileMark::new(20, 1)));
        assert_eq!(map.find_backward(30, 3), None);
        assert_eq!(map.clear_from(25), 2);
        assert_eq!(map.last(), Some(FileMark::new(20, 1)));
    }

    #[test]
    fn test_check_for_eof_is_forward_only() {
        let mut map = FileMarkMap::new(FmtVersion::Current, false);
        map.put_file_mark_in_map(10, 4).unwrap();
        map.put_file_mark_in_map(12, 1).unwrap();
        assert_eq!(map.check_for_eof(10), 4);
        assert_eq!(map.check_for_eof(11), 0);
        assert_eq!(map.check_for_eof(12), 1);
        assert_eq!(map.check_for_eof(10), 0);
        map.reset_eof_list();
        assert_eq!(map.check_for_eof(10), 4);
    }

    proptest! {
        #[test]
        fn prop_marks_stay_sorted(inserts in proptest::collection::vec((0u16..500, 1u16..32), 0..60)) {
            let mut map = FileMarkMap::new(FmtVersion::Current, false);
            for (segment, sector) in &inserts {
                map.put_file_mark_in_map(*segment, *sector).unwrap();
            }
            let marks: Vec<_> = map.iter().copied().collect();
            prop_assert!(marks.windows(2).all(|w| w[0] < w[1]));

            // Increasing queries see every segment that carries a mark exactly once.
            let mut seen = Vec::new();
            for segment in 0..500u32 {
                if map.check_for_eof(segment) != 0 {
                    seen.push(segment as u16);
                }
            }
            let mut expected: Vec<u16> = marks.iter().map(|m| m.segment).collect();
            expected.dedup();
            prop_assert_eq!(seen, expected);
        }
    }
}
