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

    ecc.rs

    Reed-Solomon segment code over GF(256).
*/

//! Reed-Solomon error correction for QIC segments.
//!
//! A segment with `n` usable sectors carries `n - 3` data blocks followed by 3 parity
//! blocks. Byte `k` of every block forms one codeword over GF(2^8) (field polynomial
//! 0x187), so a segment is 1024 interleaved codewords of length `n`. Block `i` has locator
//! `X_i = α^i` and every codeword satisfies
//!
//! ```text
//!     Σ c_i · X_i^(j-1) = 0      for j = 0, 1, 2
//! ```
//!
//! With the failing blocks known (erasures) up to three of them can be rebuilt. With none
//! known a single bad block can be located and fixed. Parity is generated by treating the
//! three parity positions as erasures of an otherwise complete codeword.

use lazy_static::lazy_static;

use crate::{
    device_types::sector_map::{SectorMap, ECC_SECTORS, SECTOR_SIZE},
    error::EccError,
};

const GF_POLY: u16 = 0x187;

lazy_static! {
    static ref GF: GaloisField = GaloisField::new();
}

struct GaloisField {
    exp: [u8; 512],
    log: [u8; 256],
}

impl GaloisField {
    fn new() -> Self {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= GF_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        GaloisField { exp, log }
    }

    #[inline]
    fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            0
        }
        else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    #[inline]
    fn inv(&self, a: u8) -> u8 {
        debug_assert!(a != 0);
        self.exp[255 - self.log[a as usize] as usize]
    }

    #[inline]
    fn div(&self, a: u8, b: u8) -> u8 {
        self.mul(a, self.inv(b))
    }

    /// α^e for any integer exponent.
    #[inline]
    fn alpha(&self, e: i32) -> u8 {
        self.exp[e.rem_euclid(255) as usize]
    }

    fn log_of(&self, a: u8) -> u8 {
        self.log[a as usize]
    }
}

/// Result of running the decoder over a segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EccOutcome {
    /// Every codeword checked clean.
    Ok,
    /// Data was repaired; the map lists the repaired blocks (block indices, not sectors).
    Corrected(SectorMap),
    /// More damage than the code can resolve.
    Failed,
}

/// The codec seam. The engine only needs to rebuild a segment in place and to generate
/// parity for one about to be written.
pub trait EccCodec: Send {
    /// `data` holds `blocks` consecutive 1 KiB blocks, parity last. `erasures` lists block
    /// indices already known to be bad.
    fn correct(&self, data: &mut [u8], blocks: usize, erasures: SectorMap) -> EccOutcome;

    /// Fill the last three blocks of `data` with parity over the preceding ones.
    fn set_parity(&self, data: &mut [u8], blocks: usize) -> Result<(), EccError>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ReedSolomon;

/// Solve the erasure system for a fixed set of positions. `inverse` maps the partial
/// syndromes of the known symbols to the erased values.
struct ErasureSolver {
    positions: Vec<usize>,
    inverse: [[u8; 3]; 3],
}

impl ErasureSolver {
    fn new(positions: Vec<usize>) -> Option<Self> {
        let k = positions.len();
        let mut m = [[0u8; 6]; 3];
        for (r, row) in m.iter_mut().enumerate().take(k) {
            for (c, &pos) in positions.iter().enumerate() {
                row[c] = GF.alpha(pos as i32 * (r as i32 - 1));
            }
            row[3 + r] = 1;
        }
        // Gauss-Jordan over GF(2^8) on the k x k system with the identity alongside.
        for col in 0..k {
            let pivot = (col..k).find(|&r| m[r][col] != 0)?;
            m.swap(col, pivot);
            let p = GF.inv(m[col][col]);
            for v in m[col].iter_mut() {
                *v = GF.mul(*v, p);
            }
            for r in 0..k {
                if r != col && m[r][col] != 0 {
                    let f = m[r][col];
                    for c in 0..6 {
                        let t = GF.mul(f, m[col][c]);
                        m[r][c] ^= t;
                    }
                }
            }
        }
        let mut inverse = [[0u8; 3]; 3];
        for r in 0..k {
            for c in 0..k {
                inverse[r][c] = m[r][3 + c];
            }
        }
        Some(ErasureSolver { positions, inverse })
    }

    fn solve(&self, partial: &[u8; 3]) -> [u8; 3] {
        let k = self.positions.len();
        let mut out = [0u8; 3];
        for (m, value) in out.iter_mut().enumerate().take(k) {
            let mut acc = 0u8;
            for r in 0..k {
                acc ^= GF.mul(self.inverse[m][r], partial[r]);
            }
            *value = acc;
        }
        out
    }
}

fn syndromes(data: &[u8], blocks: usize, column: usize, skip: &[usize]) -> [u8; 3] {
    let mut s = [0u8; 3];
    for i in 0..blocks {
        if skip.contains(&i) {
            continue;
        }
        let c = data[i * SECTOR_SIZE + column];
        if c == 0 {
            continue;
        }
        for (j, sj) in s.iter_mut().enumerate() {
            *sj ^= GF.mul(c, GF.alpha(i as i32 * (j as i32 - 1)));
        }
    }
    s
}

impl ReedSolomon {
    pub fn new() -> Self {
        ReedSolomon
    }

    fn correct_erasures(&self, data: &mut [u8], blocks: usize, erasures: SectorMap) -> EccOutcome {
        let positions: Vec<usize> = erasures.iter().map(|b| b as usize).collect();
        let k = positions.len();
        let Some(solver) = ErasureSolver::new(positions.clone())
        else {
            return EccOutcome::Failed;
        };
        for column in 0..SECTOR_SIZE {
            let s = syndromes(data, blocks, column, &positions);
            let values = solver.solve(&s);
            // Rows beyond the k used for solving must vanish once the erasures are filled in.
            for (j, &sj) in s.iter().enumerate().skip(k) {
                let mut check = sj;
                for (m, &pos) in positions.iter().enumerate() {
                    check ^= GF.mul(values[m], GF.alpha(pos as i32 * (j as i32 - 1)));
                }
                if check != 0 {
                    return EccOutcome::Failed;
                }
            }
            for (m, &pos) in positions.iter().enumerate() {
                data[pos * SECTOR_SIZE + column] = values[m];
            }
        }
        EccOutcome::Corrected(erasures)
    }

    fn correct_single(&self, data: &mut [u8], blocks: usize) -> EccOutcome {
        let mut fixed = SectorMap::NONE;
        let mut fixes: Vec<(usize, u8)> = Vec::new();
        for column in 0..SECTOR_SIZE {
            let s = syndromes(data, blocks, column, &[]);
            if s == [0, 0, 0] {
                continue;
            }
            // One error of value e at block p gives S0 = e·α^-p, S1 = e, S2 = e·α^p.
            if s[0] == 0 || s[1] == 0 || s[2] == 0 {
                return EccOutcome::Failed;
            }
            let x = GF.div(s[2], s[1]);
            if GF.div(s[1], s[0]) != x {
                return EccOutcome::Failed;
            }
            let pos = GF.log_of(x) as usize;
            if pos >= blocks {
                return EccOutcome::Failed;
            }
            if !fixed.is_empty() && !fixed.is_set(pos as u8) {
                // A second bad block without erasure information is beyond reach.
                return EccOutcome::Failed;
            }
            fixed.set(pos as u8);
            fixes.push((pos * SECTOR_SIZE + column, s[1]));
        }
        if fixed.is_empty() {
            return EccOutcome::Ok;
        }
        for (offset, e) in fixes {
            data[offset] ^= e;
        }
        EccOutcome::Corrected(fixed)
    }
}

impl EccCodec for ReedSolomon {
    fn correct(&self, data: &mut [u8], blocks: usize, erasures: SectorMap) -> EccOutcome {
        if blocks <= ECC_SECTORS || blocks > 32 || data.len() < blocks * SECTOR_SIZE {
            return EccOutcome::Failed;
        }
        let erasures = erasures & SectorMap::range(0, blocks as u8);
        match erasures.count() as usize {
            0 => self.correct_single(data, blocks),
            k if k <= ECC_SECTORS => self.correct_erasures(data, blocks, erasures),
            _ => EccOutcome::Failed,
        }
    }

    fn set_parity(&self, data: &mut [u8], blocks: usize) -> Result<(), EccError> {
        if blocks <= ECC_SECTORS || blocks > 32 {
            return Err(EccError::TooFewBlocks(blocks));
        }
        if data.len() < blocks * SECTOR_SIZE {
            return Err(EccError::ShortBuffer {
                need: blocks * SECTOR_SIZE,
                have: data.len(),
            });
        }
        let parity = SectorMap::range((blocks - ECC_SECTORS) as u8, ECC_SECTORS as u8);
        data[(blocks - ECC_SECTORS) * SECTOR_SIZE..blocks * SECTOR_SIZE].fill(0);
        match self.correct_erasures(data, blocks, parity) {
            EccOutcome::Failed => Err(EccError::TooFewBlocks(blocks)),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn encoded(blocks: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = vec![0u8; blocks * SECTOR_SIZE];
        rng.fill(&mut data[..(blocks - 3) * SECTOR_SIZE]);
        ReedSolomon.set_parity(&mut data, blocks).unwrap();
        data
    }

    #[test]
    fn test_field_is_primitive() {
        let mut seen = [false; 256];
        for e in 0..255 {
            let v = GF.alpha(e);
            assert!(!seen[v as usize]);
            seen[v as usize] = true;
        }
        assert_eq!(GF.alpha(255), 1);
        assert_eq!(GF.mul(GF.inv(0x53), 0x53), 1);
    }

    #[test]
    fn test_clean_segment_checks_ok() {
        let mut data = encoded(32, 1);
        assert_eq!(ReedSolomon.correct(&mut data, 32, SectorMap::NONE), EccOutcome::Ok);
    }

    #[test]
    fn test_three_erasures_rebuilt() {
        let original = encoded(29, 2);
        let mut data = original.clone();
        for block in [0usize, 13, 28] {
            data[block * SECTOR_SIZE..(block + 1) * SECTOR_SIZE].fill(0xa5);
        }
        let erasures = SectorMap::from_sectors([0, 13, 28]);
        assert_eq!(
            ReedSolomon.correct(&mut data, 29, erasures),
            EccOutcome::Corrected(erasures)
        );
        assert_eq!(data, original);
    }

    #[test]
    fn test_single_unknown_error_located() {
        let original = encoded(32, 3);
        let mut data = original.clone();
        data[7 * SECTOR_SIZE + 100] ^= 0x40;
        data[7 * SECTOR_SIZE + 900] ^= 0x01;
        assert_eq!(
            ReedSolomon.correct(&mut data, 32, SectorMap::NONE),
            EccOutcome::Corrected(SectorMap::from_sectors([7]))
        );
        assert_eq!(data, original);
    }

    #[test]
    fn test_erasure_plus_hidden_error_detected() {
        let mut data = encoded(32, 4);
        data[2 * SECTOR_SIZE] ^= 0xff;
        data[9 * SECTOR_SIZE] ^= 0x11;
        let outcome = ReedSolomon.correct(&mut data, 32, SectorMap::from_sectors([2]));
        assert_eq!(outcome, EccOutcome::Failed);
    }

    #[test]
    fn test_four_erasures_fail() {
        let mut data = encoded(32, 5);
        let erasures = SectorMap::from_sectors([1, 2, 3, 4]);
        assert_eq!(ReedSolomon.correct(&mut data, 32, erasures), EccOutcome::Failed);
    }

    #[test]
    fn test_parity_needs_data() {
        let mut data = vec![0u8; 3 * SECTOR_SIZE];
        assert!(ReedSolomon.set_parity(&mut data, 3).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]
        #[test]
        fn prop_erasures_up_to_three_recover(
            blocks in 4usize..=32,
            seed in any::<u64>(),
            picks in proptest::collection::btree_set(0usize..32, 0..=3),
        ) {
            let original = encoded(blocks, seed);
            let mut data = original.clone();
            let mut erasures = SectorMap::NONE;
            for &b in picks.iter().filter(|&&b| b < blocks) {
                data[b * SECTOR_SIZE..(b + 1) * SECTOR_SIZE].fill(0);
                erasures.set(b as u8);
            }
            let outcome = ReedSolomon.correct(&mut data, blocks, erasures);
            prop_assert_ne!(outcome, EccOutcome::Failed);
            prop_assert_eq!(data, original);
        }
    }
}
