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
*/

//! Error and recovery counters for an open session.

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoryRecord {
    pub id_am_errors: u32,
    pub id_crc_errors: u32,
    pub data_am_errors: u32,
    pub crc_errors: u32,
    pub no_data_errors: u32,
    pub overrun_errors: u32,
    /// Sectors re-read after a repositioning retry.
    pub sector_retries: u32,
    /// Segments that had to be started over.
    pub segment_retries: u32,
    pub rewinds: u32,
    pub fast_skips: u32,
    /// Blocks rebuilt by the codec.
    pub corrected: u32,
    pub ecc_failures: u32,
    /// Segments given up on.
    pub defects: u32,
    pub stray_interrupts: u32,
    pub rate_fallbacks: u32,
}

impl HistoryRecord {
    pub fn reset(&mut self) {
        *self = HistoryRecord::default();
    }

    pub fn total_errors(&self) -> u32 {
        self.id_am_errors
            + self.id_crc_errors
            + self.data_am_errors
            + self.crc_errors
            + self.no_data_errors
            + self.overrun_errors
    }

    pub fn log_summary(&self) {
        if *self == HistoryRecord::default() {
            log::info!("history: no errors");
            return;
        }
        log::info!(
            "history: id am {} | id crc {} | data am {} | data crc {} | no data {} | overrun {}",
            self.id_am_errors,
            self.id_crc_errors,
            self.data_am_errors,
            self.crc_errors,
            self.no_data_errors,
            self.overrun_errors
        );
        log::info!(
            "history: sector retries {}, segment retries {}, rewinds {}, fast skips {}",
            self.sector_retries,
            self.segment_retries,
            self.rewinds,
            self.fast_skips
        );
        log::info!(
            "history: corrected blocks {}, ecc failures {}, defects {}, stray interrupts {}, rate fallbacks {}",
            self.corrected,
            self.ecc_failures,
            self.defects,
            self.stray_interrupts,
            self.rate_fallbacks
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset() {
        let mut history = HistoryRecord {
            crc_errors: 2,
            no_data_errors: 1,
            ..Default::default()
        };
        assert_eq!(history.total_errors(), 3);
        history.reset();
        assert_eq!(history, HistoryRecord::default());
    }
}
