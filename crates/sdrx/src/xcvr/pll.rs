// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! RF PLL programming and VCOCAP tuning.
//!
//! Frequency is realized as `f = (nint + nfrac/2^23) * f_ref / x`, where `x`
//! is the VCO division factor of the band the frequency falls into. After
//! writing the tuning words the VCO capacitance code is searched: a 6-step
//! bisection to reach the lock window, then two linear walks to find its
//! edges, settling on the midpoint.

use log::debug;

use super::{regs, PaSel, Xcvr};
use crate::error::{DeviceError, Result};
use crate::periph::PeriphDev;
use crate::state::{Direction, validate_frequency};

/// PLL reference frequency (Hz).
pub const PLL_REF_HZ: u64 = 38_400_000;

/// Fractional word width.
const FRAC_BITS: u32 = 23;

/// Low band / high band split for PA and LNA selection.
pub const BAND_SPLIT_HZ: u64 = 1_500_000_000;

/// One PLL band: `[low, high)` plus its band-select code. The VCO division
/// factor is derived from the low 3 bits of the code.
#[derive(Debug, Clone, Copy)]
pub struct Band {
    /// Inclusive low edge (Hz).
    pub low: u64,
    /// Exclusive high edge (Hz).
    pub high: u64,
    /// Band-select code written to the FREQSEL field.
    pub freqsel: u8,
}

/// The 16 contiguous PLL bands.
pub const BANDS: [Band; 16] = [
    Band { low: 232_500_000, high: 285_625_000, freqsel: 0x27 },
    Band { low: 285_625_000, high: 336_875_000, freqsel: 0x2f },
    Band { low: 336_875_000, high: 405_000_000, freqsel: 0x37 },
    Band { low: 405_000_000, high: 465_000_000, freqsel: 0x3f },
    Band { low: 465_000_000, high: 571_250_000, freqsel: 0x26 },
    Band { low: 571_250_000, high: 673_750_000, freqsel: 0x2e },
    Band { low: 673_750_000, high: 810_000_000, freqsel: 0x36 },
    Band { low: 810_000_000, high: 930_000_000, freqsel: 0x3e },
    Band { low: 930_000_000, high: 1_142_500_000, freqsel: 0x25 },
    Band { low: 1_142_500_000, high: 1_347_500_000, freqsel: 0x2d },
    Band { low: 1_347_500_000, high: 1_620_000_000, freqsel: 0x35 },
    Band { low: 1_620_000_000, high: 1_860_000_000, freqsel: 0x3d },
    Band { low: 1_860_000_000, high: 2_285_000_000, freqsel: 0x24 },
    Band { low: 2_285_000_000, high: 2_695_000_000, freqsel: 0x2c },
    Band { low: 2_695_000_000, high: 3_240_000_000, freqsel: 0x34 },
    Band { low: 3_240_000_000, high: 3_800_000_001, freqsel: 0x3c },
];

/// VCO division factor for a band-select code.
#[inline]
#[must_use]
pub const fn vco_x(freqsel: u8) -> u64 {
    1 << ((freqsel & 7) - 3)
}

/// Band index for a frequency.
pub fn band_for(hz: u64) -> Result<usize> {
    BANDS
        .iter()
        .position(|b| hz >= b.low && hz < b.high)
        .ok_or_else(|| DeviceError::out_of_range(format!("frequency {hz} Hz outside PLL bands")))
}

/// Compute (freqsel, nint, nfrac) for a frequency.
pub fn compute_tuning(hz: u64) -> Result<(u8, u32, u32)> {
    let band = BANDS[band_for(hz)?];
    let x = vco_x(band.freqsel);
    let temp = x * hz;
    let mut nint = (temp / PLL_REF_HZ) as u32;
    let rem = temp % PLL_REF_HZ;
    let mut nfrac = (((rem << FRAC_BITS) + PLL_REF_HZ / 2) / PLL_REF_HZ) as u32;
    if nfrac == 1 << FRAC_BITS {
        nint += 1;
        nfrac = 0;
    }
    Ok((band.freqsel, nint, nfrac))
}

/// Whether `hz` falls exactly on the PLL's fractional grid (no rounding in
/// the 23-bit word).
pub fn tuning_exact(hz: u64) -> Result<bool> {
    let band = BANDS[band_for(hz)?];
    let rem = (vco_x(band.freqsel) * hz) % PLL_REF_HZ;
    Ok((rem << FRAC_BITS) % PLL_REF_HZ == 0)
}

/// Invert [`compute_tuning`]: frequency realized by a word set.
#[must_use]
pub fn tuning_to_hz(freqsel: u8, nint: u32, nfrac: u32) -> u64 {
    let x = vco_x(freqsel);
    let num = (u128::from(nint) << FRAC_BITS | u128::from(nfrac)) * u128::from(PLL_REF_HZ);
    let den = u128::from(x) << FRAC_BITS;
    ((num + den / 2) / den) as u64
}

/// VTUNE comparator readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vtune {
    /// Inside the lock window.
    Normal,
    /// Tune voltage high: capacitance code too low.
    High,
    /// Tune voltage low: capacitance code too high.
    Low,
}

impl Xcvr {
    fn pll_base(dir: Direction) -> u8 {
        match dir {
            Direction::Tx => regs::PLL_TX_BASE,
            Direction::Rx => regs::PLL_RX_BASE,
        }
    }

    fn read_vtune(&self, base: u8) -> Result<Vtune> {
        let raw = self.bus().read_reg(PeriphDev::Xcvr, base + regs::PLL_VTUNE)?;
        match raw >> 6 {
            0 => Ok(Vtune::Normal),
            2 => Ok(Vtune::High),
            1 => Ok(Vtune::Low),
            _ => Err(DeviceError::hardware_io("VTUNE comparators both asserted")),
        }
    }

    fn write_vcocap(&self, base: u8, vcocap: u8) -> Result<()> {
        self.bus()
            .change_bits(PeriphDev::Xcvr, base + regs::PLL_VCOCAP, 0x3f, vcocap & 0x3f)
    }

    /// Tune VCOCAP for the PLL at `base`: 6-step bisection, then edge walks,
    /// settling on the window midpoint. Fails if no lock window exists.
    fn tune_vcocap(&self, base: u8) -> Result<u8> {
        let mut vcocap: i32 = 32;
        let mut step: i32 = 16;
        for _ in 0..6 {
            self.write_vcocap(base, vcocap as u8)?;
            match self.read_vtune(base)? {
                Vtune::Normal => break,
                Vtune::High => vcocap = (vcocap + step).min(63),
                Vtune::Low => vcocap = (vcocap - step).max(0),
            }
            step = (step / 2).max(1);
        }
        self.write_vcocap(base, vcocap as u8)?;
        if self.read_vtune(base)? != Vtune::Normal {
            return Err(DeviceError::failure(format!(
                "PLL at 0x{base:02x}: no VCOCAP lock near {vcocap}"
            )));
        }
        // Walk to the window edges; each walk is bounded by the code range.
        let mut low = vcocap;
        while low > 0 {
            self.write_vcocap(base, (low - 1) as u8)?;
            if self.read_vtune(base)? != Vtune::Normal {
                break;
            }
            low -= 1;
        }
        let mut high = vcocap;
        while high < 63 {
            self.write_vcocap(base, (high + 1) as u8)?;
            if self.read_vtune(base)? != Vtune::Normal {
                break;
            }
            high += 1;
        }
        let mid = (low + high) / 2;
        self.write_vcocap(base, mid as u8)?;
        if self.read_vtune(base)? != Vtune::Normal {
            return Err(DeviceError::failure(format!(
                "PLL at 0x{base:02x}: VCOCAP window [{low}, {high}] lost at midpoint {mid}"
            )));
        }
        debug!("pll 0x{base:02x}: vcocap window [{low}, {high}], using {mid}");
        Ok(mid as u8)
    }

    /// Tune one direction to `hz`: band select, N-integer/N-fractional,
    /// VCOCAP search, then PA/LNA selection by low/high band.
    pub fn set_frequency(&self, dir: Direction, hz: u64) -> Result<()> {
        validate_frequency(hz)?;
        let (freqsel, nint, nfrac) = compute_tuning(hz)?;
        let base = Self::pll_base(dir);
        let burst = [
            (nint >> 1) as u8,
            (((nint & 1) << 7) as u8) | ((nfrac >> 16) & 0x7f) as u8,
            (nfrac >> 8) as u8,
            nfrac as u8,
        ];
        self.bus()
            .write(PeriphDev::Xcvr, base + regs::PLL_NINT, &burst)?;
        self.bus().change_bits(
            PeriphDev::Xcvr,
            base + regs::PLL_FREQSEL,
            0xfc,
            freqsel << 2,
        )?;
        self.tune_vcocap(base)
            .map_err(|e| e.wrap(&format!("{} tune to {hz} Hz", dir.name())))?;
        match dir {
            Direction::Tx => self.pa_select(if hz < BAND_SPLIT_HZ {
                PaSel::Pa1
            } else {
                PaSel::Pa2
            })?,
            Direction::Rx => self.lna_select(Some(if hz < BAND_SPLIT_HZ { 1 } else { 2 }))?,
        }
        Ok(())
    }

    /// Read back the realized frequency (Hz).
    pub fn get_frequency(&self, dir: Direction) -> Result<u64> {
        let base = Self::pll_base(dir);
        let mut burst = [0u8; 4];
        self.bus()
            .read(PeriphDev::Xcvr, base + regs::PLL_NINT, &mut burst)?;
        let freqsel = (self
            .bus()
            .read_reg(PeriphDev::Xcvr, base + regs::PLL_FREQSEL)?
            >> 2)
            & 0x3f;
        let nint = (u32::from(burst[0]) << 1) | u32::from(burst[1] >> 7);
        let nfrac = (u32::from(burst[1] & 0x7f) << 16)
            | (u32::from(burst[2]) << 8)
            | u32::from(burst[3]);
        Ok(tuning_to_hz(freqsel, nint, nfrac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_contiguous() {
        for pair in BANDS.windows(2) {
            assert_eq!(pair[0].high, pair[1].low);
        }
        assert_eq!(BANDS[0].low, 232_500_000);
        assert!(BANDS[15].high > 3_800_000_000);
    }

    #[test]
    fn test_band_lookup() {
        assert_eq!(band_for(232_500_000).expect("low edge"), 0);
        assert_eq!(band_for(915_000_000).expect("915 MHz"), 7);
        assert_eq!(band_for(3_800_000_000).expect("high edge"), 15);
        assert!(band_for(100_000_000).is_err());
    }

    #[test]
    fn test_tuning_915mhz() {
        let (freqsel, nint, nfrac) = compute_tuning(915_000_000).expect("tuning");
        assert_eq!(freqsel, 0x3e);
        // x = 8: 8 * 915e6 / 38.4e6 = 190.625
        assert_eq!(nint, 190);
        let expected = (0.625f64 * f64::from(1u32 << 23)).round() as u32;
        assert_eq!(nfrac, expected);
    }

    #[test]
    fn test_tuning_roundtrip_within_quantum() {
        // One PLL quantum is f_ref / (x * 2^23), under 2 Hz in every band.
        for &hz in &[
            232_500_000u64,
            433_920_000,
            915_000_123,
            1_575_420_000,
            2_450_000_000,
            3_799_999_999,
        ] {
            let (freqsel, nint, nfrac) = compute_tuning(hz).expect("tuning");
            let back = tuning_to_hz(freqsel, nint, nfrac);
            let quantum = PLL_REF_HZ as f64 / (vco_x(freqsel) as f64 * f64::from(1u32 << 23));
            assert!(
                (back as i64 - hz as i64).unsigned_abs() as f64 <= quantum.ceil(),
                "{hz} -> {back}, quantum {quantum}"
            );
        }
    }
}
