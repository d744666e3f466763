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

    header.rs

    Header segment layout.
*/

//! Header segment layout.
//!
//! The first good segments of every formatted cartridge hold two identical copies of the
//! header: signature, format code, the header/data segment bounds, the floppy geometry the
//! tape pretends to have, a volume label, and (from byte 144 on) the bad-sector map and
//! the file-mark list.

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};

use crate::{
    device_types::{geometry::TapeGeometry, sector_map::SECTOR_SIZE},
    error::HeaderError,
};

pub const HEADER_SIGNATURE: u32 = 0xaa55_aa55;
pub const HEADER_LABEL_OFFSET: usize = 30;
pub const HEADER_LABEL_LEN: usize = 44;
pub const FILE_MARK_COUNT_OFFSET: usize = 144;
pub const FAILED_SECTOR_LOG_OFFSET: usize = 256;
pub const FAILED_SECTOR_LOG_SIZE: usize = 2 * SECTOR_SIZE - FAILED_SECTOR_LOG_OFFSET;
pub const BSM_LIST_OFFSET: usize = 256;
pub const BSM_ARRAY_OFFSET: usize = FAILED_SECTOR_LOG_OFFSET + FAILED_SECTOR_LOG_SIZE;
/// Bytes of the header that carry fixed fields; anything shorter cannot be a header.
pub const HEADER_MIN_LEN: usize = 2 * SECTOR_SIZE;

pub const LINUX_LABEL: &str = "Linux raw format V";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FormatCode {
    /// 205ft cartridges, array bad-sector map.
    Normal,
    /// 1100ft cartridges, list bad-sector map.
    Ft1100,
    /// Wide cartridges, list bad-sector map.
    Wide,
    /// 425ft cartridges, array bad-sector map.
    Ft425,
}

impl FormatCode {
    pub fn from_byte(byte: u8) -> Option<FormatCode> {
        match byte {
            2 => Some(FormatCode::Normal),
            3 => Some(FormatCode::Ft1100),
            4 => Some(FormatCode::Wide),
            5 => Some(FormatCode::Ft425),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            FormatCode::Normal => 2,
            FormatCode::Ft1100 => 3,
            FormatCode::Wide => 4,
            FormatCode::Ft425 => 5,
        }
    }

    pub fn uses_list_encoding(self) -> bool {
        matches!(self, FormatCode::Ft1100 | FormatCode::Wide)
    }
}

/// File-mark convention recorded in the label.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum FmtVersion {
    /// No Linux label: the failed-sector log holds someone else's data.
    #[default]
    Legacy,
    /// First Linux label revision, which stored mark fields in the wrong order.
    Swapped,
    Current,
}

impl FmtVersion {
    pub fn digit(self) -> u8 {
        match self {
            FmtVersion::Legacy => 0,
            FmtVersion::Swapped => 1,
            FmtVersion::Current => 2,
        }
    }

    pub fn from_label(label: &[u8]) -> FmtVersion {
        let prefix = LINUX_LABEL.as_bytes();
        if label.len() > prefix.len() && label.starts_with(prefix) {
            match label[prefix.len()] {
                b'1' => return FmtVersion::Swapped,
                b'2' => return FmtVersion::Current,
                _ => {}
            }
        }
        FmtVersion::Legacy
    }
}

#[binrw]
#[brw(little)]
#[derive(Clone, Debug)]
struct RawHeader {
    signature: u32,
    format_code: u8,
    reserved0: u8,
    header_segment: u16,
    alt_header_segment: u16,
    first_data_segment: u16,
    last_data_segment: u16,
    reserved1: [u8; 10],
    segments_per_track: u16,
    tracks_per_tape: u8,
    max_floppy_side: u8,
    max_floppy_track: u8,
    max_floppy_sector: u8,
    label: [u8; HEADER_LABEL_LEN],
}

#[derive(Clone, Debug)]
pub struct HeaderSegment {
    raw: RawHeader,
    format_code: FormatCode,
    fmt_version: FmtVersion,
}

impl HeaderSegment {
    pub fn new(
        format_code: FormatCode,
        geometry: &TapeGeometry,
        header_segment: u16,
        alt_header_segment: u16,
        last_data_segment: u16,
        label: &str,
    ) -> Self {
        let mut header = HeaderSegment {
            raw: RawHeader {
                signature: HEADER_SIGNATURE,
                format_code: format_code.byte(),
                reserved0: 0,
                header_segment,
                alt_header_segment,
                first_data_segment: alt_header_segment + 1,
                last_data_segment,
                reserved1: [0; 10],
                segments_per_track: geometry.segments_per_track as u16,
                tracks_per_tape: geometry.tracks_per_tape as u8,
                max_floppy_side: geometry.max_floppy_side,
                max_floppy_track: geometry.max_floppy_track,
                max_floppy_sector: geometry.max_floppy_sector,
                label: [0; HEADER_LABEL_LEN],
            },
            format_code,
            fmt_version: FmtVersion::Legacy,
        };
        header.set_label(label);
        header
    }

    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_MIN_LEN {
            return Err(HeaderError::Truncated {
                need: HEADER_MIN_LEN,
                have: buf.len(),
            });
        }
        let raw = RawHeader::read(&mut Cursor::new(buf))?;
        if raw.signature != HEADER_SIGNATURE {
            return Err(HeaderError::BadSignature(raw.signature));
        }
        let format_code = FormatCode::from_byte(raw.format_code).ok_or(HeaderError::UnknownFormat(raw.format_code))?;
        let fmt_version = FmtVersion::from_label(&raw.label);
        Ok(HeaderSegment {
            raw,
            format_code,
            fmt_version,
        })
    }

    /// Write the fixed fields into the start of `buf`, leaving the map regions untouched.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), HeaderError> {
        if buf.len() < HEADER_MIN_LEN {
            return Err(HeaderError::Truncated {
                need: HEADER_MIN_LEN,
                have: buf.len(),
            });
        }
        let mut cursor = Cursor::new(&mut buf[..]);
        self.raw.write(&mut cursor)?;
        Ok(())
    }

    pub fn format_code(&self) -> FormatCode {
        self.format_code
    }

    pub fn fmt_version(&self) -> FmtVersion {
        self.fmt_version
    }

    pub fn header_segment(&self) -> u32 {
        self.raw.header_segment as u32
    }

    pub fn alt_header_segment(&self) -> u32 {
        self.raw.alt_header_segment as u32
    }

    pub fn first_data_segment(&self) -> u32 {
        self.raw.first_data_segment as u32
    }

    pub fn last_data_segment(&self) -> u32 {
        self.raw.last_data_segment as u32
    }

    pub fn geometry(&self) -> TapeGeometry {
        TapeGeometry {
            segments_per_track: self.raw.segments_per_track as u32,
            tracks_per_tape: self.raw.tracks_per_tape as u32,
            max_floppy_side: self.raw.max_floppy_side,
            max_floppy_track: self.raw.max_floppy_track,
            max_floppy_sector: self.raw.max_floppy_sector,
        }
    }

    pub fn label(&self) -> String {
        let end = self.raw.label.iter().position(|&b| b == 0).unwrap_or(HEADER_LABEL_LEN);
        String::from_utf8_lossy(&self.raw.label[..end]).trim_end().to_string()
    }

    pub fn set_label(&mut self, label: &str) {
        self.raw.label = [0; HEADER_LABEL_LEN];
        let bytes = label.as_bytes();
        let n = bytes.len().min(HEADER_LABEL_LEN);
        self.raw.label[..n].copy_from_slice(&bytes[..n]);
        self.fmt_version = FmtVersion::from_label(&self.raw.label);
    }

    /// Stamp the Linux label for `version`, keeping whatever text followed an older stamp.
    pub fn set_linux_label(&mut self, version: FmtVersion) {
        let current = self.label();
        let rest = current
            .strip_prefix(LINUX_LABEL)
            .map(|s| s.get(1..).unwrap_or("").to_string())
            .unwrap_or_default();
        self.set_label(&format!("{}{}{}", LINUX_LABEL, version.digit(), rest));
    }

    pub fn is_header(buf: &[u8]) -> bool {
        buf.len() >= 4 && u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) == HEADER_SIGNATURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (HeaderSegment, Vec<u8>) {
        let geometry = TapeGeometry::new(100, 28);
        let header = HeaderSegment::new(FormatCode::Normal, &geometry, 0, 1, 2799, "Linux raw format V2");
        let mut buf = vec![0u8; 29 * SECTOR_SIZE];
        header.write(&mut buf).unwrap();
        (header, buf)
    }

    #[test]
    fn test_field_offsets() {
        let (_, buf) = sample();
        assert_eq!(&buf[0..4], &[0x55, 0xaa, 0x55, 0xaa]);
        assert_eq!(buf[4], 2);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 0);
        assert_eq!(u16::from_le_bytes([buf[8], buf[9]]), 1);
        assert_eq!(u16::from_le_bytes([buf[10], buf[11]]), 2);
        assert_eq!(u16::from_le_bytes([buf[12], buf[13]]), 2799);
        assert_eq!(u16::from_le_bytes([buf[24], buf[25]]), 100);
        assert_eq!(buf[26], 28);
        assert_eq!(buf[27], 2);
        assert_eq!(buf[28], 254);
        assert_eq!(buf[29], 128);
        assert_eq!(&buf[30..48], LINUX_LABEL.as_bytes());
    }

    #[test]
    fn test_parse_back() {
        let (header, buf) = sample();
        let parsed = HeaderSegment::parse(&buf).unwrap();
        assert_eq!(parsed.format_code(), FormatCode::Normal);
        assert_eq!(parsed.fmt_version(), FmtVersion::Current);
        assert_eq!(parsed.geometry(), header.geometry());
        assert_eq!(parsed.first_data_segment(), 2);
        assert_eq!(parsed.label(), "Linux raw format V2");
    }

    #[test]
    fn test_rejects_bad_input() {
        let (_, mut buf) = sample();
        assert!(matches!(
            HeaderSegment::parse(&buf[..100]),
            Err(HeaderError::Truncated { .. })
        ));
        buf[4] = 9;
        assert!(matches!(HeaderSegment::parse(&buf), Err(HeaderError::UnknownFormat(9))));
        buf[0] = 0;
        assert!(matches!(HeaderSegment::parse(&buf), Err(HeaderError::BadSignature(_))));
    }

    #[test]
    fn test_label_versions() {
        let geometry = TapeGeometry::new(100, 28);
        let mut header = HeaderSegment::new(FormatCode::Normal, &geometry, 0, 1, 2799, "DOS backup");
        assert_eq!(header.fmt_version(), FmtVersion::Legacy);
        header.set_label("Linux raw format V1 tape");
        assert_eq!(header.fmt_version(), FmtVersion::Swapped);
        header.set_linux_label(FmtVersion::Current);
        assert_eq!(header.fmt_version(), FmtVersion::Current);
        assert_eq!(header.label(), "Linux raw format V2 tape");
    }
}
