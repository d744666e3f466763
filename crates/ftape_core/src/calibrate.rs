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

    calibrate.rs

    Spin loop calibration for controller polling.
*/

//! Busy-wait calibration.
//!
//! Short controller waits are spin loops over status register reads. How many reads fit in
//! a microsecond is measured once when the session is created.

use std::time::{Duration, Instant};

const CALIBRATION_WINDOW: Duration = Duration::from_millis(2);
const MAX_CALIBRATION_SPINS: u32 = 1 << 24;

#[derive(Copy, Clone, Debug)]
pub struct Calibration {
    spins_per_us: u32,
}

impl Calibration {
    pub fn fixed(spins_per_us: u32) -> Self {
        Calibration {
            spins_per_us: spins_per_us.max(1),
        }
    }

    /// Time `busy_loop(n)` for doubling `n` until a run takes at least the calibration
    /// window, then derive the spin rate.
    pub fn calibrate<F: FnMut(u32)>(mut busy_loop: F) -> Self {
        let mut count = 1u32;
        loop {
            let start = Instant::now();
            busy_loop(count);
            let elapsed = start.elapsed();
            if elapsed >= CALIBRATION_WINDOW || count >= MAX_CALIBRATION_SPINS {
                let us = elapsed.as_micros().max(1) as u64;
                let rate = (count as u64 / us).clamp(1, u32::MAX as u64) as u32;
                log::debug!("calibrate(): {} spins in {:?}, {} spins/us", count, elapsed, rate);
                return Calibration::fixed(rate);
            }
            count = count.saturating_mul(2);
        }
    }

    pub fn spins_per_us(&self) -> u32 {
        self.spins_per_us
    }

    pub fn spins_for(&self, usecs: u32) -> u32 {
        usecs.saturating_mul(self.spins_per_us).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibrate_terminates() {
        let mut total = 0u64;
        let cal = Calibration::calibrate(|n| {
            for i in 0..n {
                total = total.wrapping_add(std::hint::black_box(i) as u64);
            }
        });
        assert!(cal.spins_per_us() >= 1);
        assert!(cal.spins_for(10) >= 10);
    }

    #[test]
    fn test_fixed() {
        let cal = Calibration::fixed(0);
        assert_eq!(cal.spins_per_us(), 1);
        assert_eq!(cal.spins_for(0), 1);
    }
}
