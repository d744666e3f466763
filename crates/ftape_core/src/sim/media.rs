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

    sim::media.rs

    Simulated cartridge contents.
*/

//! Cartridge contents for the simulated drive.
//!
//! Sectors are stored per segment in physical order and created on first write; a sector
//! never written reads back as zeros, which is a valid codeword for the segment code.

use std::collections::HashMap;

use crate::{
    bsm::BadSectorMap,
    device_types::{
        geometry::TapeGeometry,
        qic117::{QicStandard, TapeLength},
        sector_map::{SectorMap, ECC_SECTORS, SECTORS_PER_SEGMENT, SECTOR_SIZE, SEGMENT_SIZE},
    },
    ecc::{EccCodec, ReedSolomon},
    eof::FileMarkMap,
    error::HeaderError,
    header::{FmtVersion, FormatCode, HeaderSegment, LINUX_LABEL},
};

const HEADER_SEGMENT: u32 = 0;
const ALT_HEADER_SEGMENT: u32 = 1;

/// Header format code a formatter would pick for a cartridge.
pub fn format_code_for(standard: QicStandard, length: TapeLength) -> FormatCode {
    match (standard, length) {
        (QicStandard::Qic3010 | QicStandard::Qic3020, _) => FormatCode::Wide,
        (_, TapeLength::ExtraLong) => FormatCode::Ft1100,
        (_, TapeLength::Long) => FormatCode::Ft425,
        _ => FormatCode::Normal,
    }
}

pub struct TapeMedia {
    pub standard: QicStandard,
    pub length: TapeLength,
    pub geometry: TapeGeometry,
    pub write_protected: bool,
    segments: HashMap<u32, Box<[u8]>>,
}

impl TapeMedia {
    /// An unformatted cartridge.
    pub fn blank(standard: QicStandard, length: TapeLength) -> Self {
        TapeMedia {
            standard,
            length,
            geometry: TapeGeometry::for_standard(standard, length),
            write_protected: false,
            segments: HashMap::new(),
        }
    }

    /// A cartridge as a formatter leaves it: both header copies written, with `bad`
    /// recorded in the bad-sector map, and a Linux label so file marks can be kept.
    pub fn formatted(
        standard: QicStandard,
        length: TapeLength,
        bad: &[(u32, SectorMap)],
    ) -> Result<Self, HeaderError> {
        let mut media = TapeMedia::blank(standard, length);
        let format = format_code_for(standard, length);
        let total = media.geometry.total_segments();

        let mut bsm = BadSectorMap::empty(format, total);
        for &(segment, map) in bad {
            if segment > ALT_HEADER_SEGMENT && segment < total {
                bsm.put_bad_sector_entry(segment, map);
            }
        }

        let label = format!("{}{}", LINUX_LABEL, FmtVersion::Current.digit());
        let header = HeaderSegment::new(
            format,
            &media.geometry,
            HEADER_SEGMENT as u16,
            ALT_HEADER_SEGMENT as u16,
            (total - 1) as u16,
            &label,
        );
        let mut image = vec![0u8; (SECTORS_PER_SEGMENT - ECC_SECTORS) * SECTOR_SIZE];
        header.write(&mut image)?;
        let list_end = bsm.encode(&mut image)?;
        FileMarkMap::new(FmtVersion::Current, format.uses_list_encoding()).encode(&mut image, list_end)?;

        let mut segment = vec![0u8; SEGMENT_SIZE];
        segment[..image.len()].copy_from_slice(&image);
        ReedSolomon::new()
            .set_parity(&mut segment, SECTORS_PER_SEGMENT)
            .map_err(|_| HeaderError::Overflow("header parity"))?;
        for id in [HEADER_SEGMENT, ALT_HEADER_SEGMENT] {
            media.segments.insert(id, segment.clone().into_boxed_slice());
        }
        log::debug!(
            "formatted(): {} {} with {} segments, format {:?}",
            standard,
            length,
            total,
            format
        );
        Ok(media)
    }

    pub fn sector(&self, segment: u32, sector: u8) -> &[u8] {
        const ZEROS: [u8; SECTOR_SIZE] = [0; SECTOR_SIZE];
        let offset = sector as usize * SECTOR_SIZE;
        match self.segments.get(&segment) {
            Some(data) => &data[offset..offset + SECTOR_SIZE],
            None => &ZEROS,
        }
    }

    pub fn write_sector(&mut self, segment: u32, sector: u8, data: &[u8]) {
        let offset = sector as usize * SECTOR_SIZE;
        let stored = self
            .segments
            .entry(segment)
            .or_insert_with(|| vec![0u8; SEGMENT_SIZE].into_boxed_slice());
        let len = data.len().min(SECTOR_SIZE);
        stored[offset..offset + len].copy_from_slice(&data[..len]);
    }

    /// The data blocks of `segment` as written, skipping `bad` sectors and the parity.
    pub fn payload(&self, segment: u32, bad: SectorMap) -> Vec<u8> {
        let good: Vec<u8> = (0..SECTORS_PER_SEGMENT as u8).filter(|&s| !bad.is_set(s)).collect();
        let data_blocks = good.len().saturating_sub(ECC_SECTORS);
        good[..data_blocks]
            .iter()
            .flat_map(|&s| self.sector(segment, s).iter().copied())
            .collect()
    }

    pub fn is_written(&self, segment: u32) -> bool {
        self.segments.contains_key(&segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_header_parses() {
        let bad = [(12, SectorMap::from_sectors([3, 7]))];
        let media = TapeMedia::formatted(QicStandard::Qic80, TapeLength::Normal, &bad).unwrap();
        let image = media.payload(0, SectorMap::NONE);
        assert_eq!(image.len(), 29 * SECTOR_SIZE);
        let header = HeaderSegment::parse(&image).unwrap();
        assert_eq!(header.format_code(), FormatCode::Normal);
        assert_eq!(header.fmt_version(), FmtVersion::Current);
        assert_eq!(header.first_data_segment(), 2);
        assert_eq!(header.last_data_segment(), 2799);

        let (mut bsm, _) = BadSectorMap::extract(FormatCode::Normal, &image, 2800).unwrap();
        assert_eq!(bsm.get_bad_sector_entry(12), SectorMap::from_sectors([3, 7]));
        assert_eq!(bsm.get_bad_sector_entry(13), SectorMap::NONE);
    }

    #[test]
    fn test_unwritten_sectors_read_zero() {
        let mut media = TapeMedia::blank(QicStandard::Qic40, TapeLength::Normal);
        assert!(media.sector(5, 0).iter().all(|&b| b == 0));
        media.write_sector(5, 1, &[0xa5; SECTOR_SIZE]);
        assert!(media.is_written(5));
        assert_eq!(media.sector(5, 1)[0], 0xa5);
        assert_eq!(media.sector(5, 0)[0], 0);
    }
}
