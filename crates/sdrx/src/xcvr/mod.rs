// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Transceiver register model.
//!
//! Named operations over the transceiver IC: VGA gains, LPF mode and
//! bandwidth ladder, DC-offset registers, LNA/PA selection and the loopback
//! path switches. PLL programming and VCOCAP tuning live in [`pll`].
//!
//! All encodings are clamped on the way in and decoded symmetrically on the
//! way out; the DC-offset wire formats differ per direction (TX: biased
//! unsigned byte, RX: 7-bit sign+magnitude with an unrelated MSB that must
//! be preserved).

pub mod pll;

use std::sync::Arc;

use log::debug;

use crate::error::{DeviceError, Result};
use crate::periph::{gpio, PeriphBus, PeriphDev};
use crate::state::{Direction, LnaGain, LoopbackMode, LpfMode};

/// Transceiver register map.
pub mod regs {
    /// Chip revision, low nibble.
    pub const CHIP_REVISION: u8 = 0x04;
    /// Soft enables: bit 3 = TX path, bit 2 = RX path.
    pub const SOFT_ENABLE: u8 = 0x05;
    /// TX soft enable bit.
    pub const SOFT_ENABLE_TX: u8 = 1 << 3;
    /// RX soft enable bit.
    pub const SOFT_ENABLE_RX: u8 = 1 << 2;
    /// RF loopback switch: bits 2..0 select target LNA (0 = open).
    pub const LOOPBACK_RF: u8 = 0x08;
    /// Calibration clock enables.
    pub const CLK_EN: u8 = 0x09;
    /// Clock enable bit: LPF tuning module.
    pub const CLK_EN_LPF_TUNING: u8 = 1 << 1;
    /// Clock enable bit: TX LPF DC cal.
    pub const CLK_EN_TX_LPF: u8 = 1 << 5;
    /// Clock enable bit: RX LPF DC cal.
    pub const CLK_EN_RX_LPF: u8 = 1 << 3;
    /// Clock enable bit: RX VGA2 DC cal.
    pub const CLK_EN_RX_VGA2: u8 = 1 << 4;

    // DC calibration blocks share one layout at different bases.
    /// LPF tuning DC cal block base.
    pub const DCCAL_LPF_TUNING: u8 = 0x00;
    /// TX LPF DC cal block base.
    pub const DCCAL_TX_LPF: u8 = 0x30;
    /// RX LPF DC cal block base.
    pub const DCCAL_RX_LPF: u8 = 0x50;
    /// RX VGA2 DC cal block base.
    pub const DCCAL_RX_VGA2: u8 = 0x60;
    /// Offset: result register (6 bits).
    pub const DCCAL_REGVAL: u8 = 0x00;
    /// Offset: status; bit 1 set while calibration runs.
    pub const DCCAL_STATUS: u8 = 0x01;
    /// Busy bit in the status register.
    pub const DCCAL_STATUS_BUSY: u8 = 1 << 1;
    /// Offset: comparator count value.
    pub const DCCAL_CNTVAL: u8 = 0x02;
    /// Offset: control; bit 5 = start, bit 4 = load, bits 2..0 = submodule.
    pub const DCCAL_CTRL: u8 = 0x03;
    /// Start-calibration pulse bit.
    pub const DCCAL_CTRL_START: u8 = 1 << 5;
    /// Load-count pulse bit.
    pub const DCCAL_CTRL_LOAD: u8 = 1 << 4;
    /// Submodule address field.
    pub const DCCAL_CTRL_ADDR_MASK: u8 = 0x07;

    /// LPF bandwidth calibration control.
    pub const LPFCAL_CTRL: u8 = 0x06;
    /// LPFCAL enable bit.
    pub const LPFCAL_EN: u8 = 1 << 3;
    /// LPFCAL reset bit.
    pub const LPFCAL_RESET: u8 = 1 << 2;
    /// LPFCAL result readback, bits 3..0.
    pub const LPFCAL_RCCAL: u8 = 0x07;

    /// TX PLL block base.
    pub const PLL_TX_BASE: u8 = 0x10;
    /// RX PLL block base.
    pub const PLL_RX_BASE: u8 = 0x20;
    /// Offset: N-integer/N-fractional burst start (4 bytes).
    pub const PLL_NINT: u8 = 0x00;
    /// Offset: band select, bits 7..2.
    pub const PLL_FREQSEL: u8 = 0x05;
    /// Offset: VCO capacitance code, bits 5..0.
    pub const PLL_VCOCAP: u8 = 0x09;
    /// Offset: VTUNE readback, bits 7..6.
    pub const PLL_VTUNE: u8 = 0x0a;

    /// TX LPF control: bits 5..2 bandwidth code, bit 1 enable, bit 6 bypass.
    pub const TX_LPF_CTRL: u8 = 0x34;
    /// TX VGA1, bits 4..0, value = gain + 35.
    pub const TX_VGA1: u8 = 0x41;
    /// TX DC offset, I branch, biased unsigned.
    pub const TX_DC_I: u8 = 0x42;
    /// TX DC offset, Q branch, biased unsigned.
    pub const TX_DC_Q: u8 = 0x43;
    /// PA selection, bits 4..3: 0 off, 1 PA1, 2 PA2, 3 AUX.
    pub const TX_PA_SEL: u8 = 0x44;
    /// TX VGA2, bits 7..3.
    pub const TX_VGA2: u8 = 0x45;
    /// Baseband loopback switch: bits 3..0 path code (0 = open).
    pub const LOOPBACK_BB: u8 = 0x46;

    /// RX LPF control, same layout as TX.
    pub const RX_LPF_CTRL: u8 = 0x54;
    /// RX VGA2, bits 4..0.
    pub const RX_VGA2: u8 = 0x65;
    /// RX DC offset, I branch, sign+magnitude, MSB unrelated.
    pub const RX_DC_I: u8 = 0x71;
    /// RX DC offset, Q branch, sign+magnitude, MSB unrelated.
    pub const RX_DC_Q: u8 = 0x72;
    /// LNA control: bits 5..4 select (0 = none), bits 7..6 gain.
    pub const RX_LNA_CTRL: u8 = 0x75;
    /// RX VGA1, bits 4..0, value = gain - 5.
    pub const RX_VGA1: u8 = 0x76;
}

/// VGA gain ranges (dB), clamped on set.
pub const TX_VGA1_RANGE: (i32, i32) = (-35, -4);
/// See [`TX_VGA1_RANGE`].
pub const TX_VGA2_RANGE: (i32, i32) = (0, 25);
/// See [`TX_VGA1_RANGE`].
pub const RX_VGA1_RANGE: (i32, i32) = (5, 30);
/// See [`TX_VGA1_RANGE`].
pub const RX_VGA2_RANGE: (i32, i32) = (0, 30);

/// TX DC offset range.
pub const TX_DC_RANGE: (i32, i32) = (-128, 127);
/// RX DC offset range.
pub const RX_DC_RANGE: (i32, i32) = (-63, 63);

/// FPGA correction range (phase and gain alike).
pub const FPGA_CORR_RANGE: (i32, i32) = (-4096, 4096);

/// The 16 LPF bandwidths (Hz), ascending. The 4-bit hardware code is
/// `15 - index`.
pub const LPF_BANDWIDTHS: [u32; 16] = [
    1_500_000, 1_750_000, 2_500_000, 2_750_000, 3_000_000, 3_840_000, 5_000_000, 5_500_000,
    6_000_000, 7_680_000, 10_000_000, 11_000_000, 12_000_000, 14_000_000, 20_000_000, 28_000_000,
];

/// IQ branch selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqBranch {
    /// In-phase.
    I,
    /// Quadrature.
    Q,
}

/// FPGA correction kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrKind {
    /// IQ phase correction.
    Phase,
    /// IQ gain correction.
    Gain,
}

/// Power amplifier selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaSel {
    /// All amplifiers off.
    Off,
    /// Low-band amplifier.
    Pa1,
    /// High-band amplifier.
    Pa2,
    /// Auxiliary (loopback) amplifier.
    Aux,
}

fn clamp_range(what: &str, value: i32, range: (i32, i32)) -> i32 {
    let clamped = value.clamp(range.0, range.1);
    if clamped != value {
        debug!("{what}: {value} clamped to {clamped}");
    }
    clamped
}

/// Encode a DC offset for the wire. TX is a biased unsigned byte; RX is
/// sign+magnitude in the low 7 bits (bit 6 = negative).
#[must_use]
pub fn dc_encode(dir: Direction, value: i32) -> u8 {
    match dir {
        Direction::Tx => (value.clamp(TX_DC_RANGE.0, TX_DC_RANGE.1) + 128) as u8,
        Direction::Rx => {
            let v = value.clamp(RX_DC_RANGE.0, RX_DC_RANGE.1);
            (v.unsigned_abs() as u8 & 0x3f) | if v < 0 { 0x40 } else { 0 }
        }
    }
}

/// Decode a wire DC offset. The RX MSB is ignored.
#[must_use]
pub fn dc_decode(dir: Direction, raw: u8) -> i32 {
    match dir {
        Direction::Tx => i32::from(raw) - 128,
        Direction::Rx => {
            let mag = i32::from(raw & 0x3f);
            if raw & 0x40 != 0 {
                -mag
            } else {
                mag
            }
        }
    }
}

/// Quantize a bandwidth request onto the ladder: smallest entry at or above
/// `hz`, else the widest. Returns (index, Hz).
#[must_use]
pub fn quantize_bandwidth(hz: u32) -> (usize, u32) {
    for (idx, &bw) in LPF_BANDWIDTHS.iter().enumerate() {
        if bw >= hz {
            return (idx, bw);
        }
    }
    (LPF_BANDWIDTHS.len() - 1, LPF_BANDWIDTHS[15])
}

/// Named operations over the transceiver IC (and the GPIO correction
/// registers that belong to the same signal path).
pub struct Xcvr {
    bus: Arc<PeriphBus>,
}

impl Xcvr {
    /// Build the model over the peripheral bus.
    #[must_use]
    pub fn new(bus: Arc<PeriphBus>) -> Self {
        Self { bus }
    }

    /// Shared peripheral bus (used by calibration and the clock synth).
    #[must_use]
    pub fn bus(&self) -> &Arc<PeriphBus> {
        &self.bus
    }

    /// Chip revision nibble.
    pub fn chip_revision(&self) -> Result<u8> {
        Ok(self.bus.read_reg(PeriphDev::Xcvr, regs::CHIP_REVISION)? & 0x0f)
    }

    /// Soft-enable or disable one direction's signal path.
    pub fn set_soft_enable(&self, dir: Direction, on: bool) -> Result<()> {
        let bit = match dir {
            Direction::Tx => regs::SOFT_ENABLE_TX,
            Direction::Rx => regs::SOFT_ENABLE_RX,
        };
        if on {
            self.bus.set_bits(PeriphDev::Xcvr, regs::SOFT_ENABLE, bit)
        } else {
            self.bus.clear_bits(PeriphDev::Xcvr, regs::SOFT_ENABLE, bit)
        }
    }

    // ------------------------------------------------------------------
    // VGA
    // ------------------------------------------------------------------

    fn vga_reg(dir: Direction, stage: u8) -> Result<(u8, (i32, i32))> {
        match (dir, stage) {
            (Direction::Tx, 1) => Ok((regs::TX_VGA1, TX_VGA1_RANGE)),
            (Direction::Tx, 2) => Ok((regs::TX_VGA2, TX_VGA2_RANGE)),
            (Direction::Rx, 1) => Ok((regs::RX_VGA1, RX_VGA1_RANGE)),
            (Direction::Rx, 2) => Ok((regs::RX_VGA2, RX_VGA2_RANGE)),
            _ => Err(DeviceError::out_of_range(format!(
                "no VGA stage {stage} on {}",
                dir.name()
            ))),
        }
    }

    /// Set a VGA gain (dB), clamped to the stage range.
    pub fn set_vga(&self, dir: Direction, stage: u8, gain: i32) -> Result<()> {
        let (reg, range) = Self::vga_reg(dir, stage)?;
        let gain = clamp_range("vga gain", gain, range);
        match (dir, stage) {
            (Direction::Tx, 1) => {
                self.bus
                    .change_bits(PeriphDev::Xcvr, reg, 0x1f, (gain + 35) as u8)
            }
            (Direction::Tx, 2) => {
                self.bus
                    .change_bits(PeriphDev::Xcvr, reg, 0xf8, (gain as u8) << 3)
            }
            (Direction::Rx, 1) => {
                self.bus
                    .change_bits(PeriphDev::Xcvr, reg, 0x1f, (gain - 5) as u8)
            }
            (Direction::Rx, 2) => self.bus.change_bits(PeriphDev::Xcvr, reg, 0x1f, gain as u8),
            _ => unreachable!(),
        }
    }

    /// Read back a VGA gain (dB).
    pub fn get_vga(&self, dir: Direction, stage: u8) -> Result<i32> {
        let (reg, _) = Self::vga_reg(dir, stage)?;
        let raw = self.bus.read_reg(PeriphDev::Xcvr, reg)?;
        Ok(match (dir, stage) {
            (Direction::Tx, 1) => i32::from(raw & 0x1f) - 35,
            (Direction::Tx, 2) => i32::from(raw >> 3),
            (Direction::Rx, 1) => i32::from(raw & 0x1f) + 5,
            (Direction::Rx, 2) => i32::from(raw & 0x1f),
            _ => unreachable!(),
        })
    }

    // ------------------------------------------------------------------
    // LPF
    // ------------------------------------------------------------------

    fn lpf_reg(dir: Direction) -> u8 {
        match dir {
            Direction::Tx => regs::TX_LPF_CTRL,
            Direction::Rx => regs::RX_LPF_CTRL,
        }
    }

    /// Set the LPF mode.
    pub fn set_lpf(&self, dir: Direction, mode: LpfMode) -> Result<()> {
        let (enable, bypass) = match mode {
            LpfMode::Normal => (0x02, 0),
            LpfMode::Bypass => (0, 0x40),
            LpfMode::Disabled => (0, 0),
        };
        self.bus
            .change_bits(PeriphDev::Xcvr, Self::lpf_reg(dir), 0x42, enable | bypass)
    }

    /// Read back the LPF mode.
    pub fn get_lpf(&self, dir: Direction) -> Result<LpfMode> {
        let raw = self.bus.read_reg(PeriphDev::Xcvr, Self::lpf_reg(dir))?;
        Ok(if raw & 0x40 != 0 {
            LpfMode::Bypass
        } else if raw & 0x02 != 0 {
            LpfMode::Normal
        } else {
            LpfMode::Disabled
        })
    }

    /// Set the LPF bandwidth; returns the quantized value actually written.
    pub fn set_lpf_bandwidth(&self, dir: Direction, hz: u32) -> Result<u32> {
        let (index, actual) = quantize_bandwidth(hz);
        let code = (15 - index) as u8;
        self.bus
            .change_bits(PeriphDev::Xcvr, Self::lpf_reg(dir), 0x3c, code << 2)?;
        Ok(actual)
    }

    /// Read back the LPF bandwidth (Hz).
    pub fn get_lpf_bandwidth(&self, dir: Direction) -> Result<u32> {
        let raw = self.bus.read_reg(PeriphDev::Xcvr, Self::lpf_reg(dir))?;
        let code = usize::from((raw >> 2) & 0x0f);
        Ok(LPF_BANDWIDTHS[15 - code])
    }

    // ------------------------------------------------------------------
    // DC offset
    // ------------------------------------------------------------------

    fn dc_reg(dir: Direction, branch: IqBranch) -> u8 {
        match (dir, branch) {
            (Direction::Tx, IqBranch::I) => regs::TX_DC_I,
            (Direction::Tx, IqBranch::Q) => regs::TX_DC_Q,
            (Direction::Rx, IqBranch::I) => regs::RX_DC_I,
            (Direction::Rx, IqBranch::Q) => regs::RX_DC_Q,
        }
    }

    /// Program a DC offset register. RX writes preserve the unrelated MSB.
    pub fn set_dc_offset(&self, dir: Direction, branch: IqBranch, value: i32) -> Result<()> {
        let reg = Self::dc_reg(dir, branch);
        let encoded = dc_encode(dir, value);
        match dir {
            Direction::Tx => self.bus.write_reg(PeriphDev::Xcvr, reg, encoded),
            Direction::Rx => self.bus.change_bits(PeriphDev::Xcvr, reg, 0x7f, encoded),
        }
    }

    /// Read back a DC offset.
    pub fn get_dc_offset(&self, dir: Direction, branch: IqBranch) -> Result<i32> {
        let raw = self.bus.read_reg(PeriphDev::Xcvr, Self::dc_reg(dir, branch))?;
        Ok(dc_decode(dir, raw))
    }

    // ------------------------------------------------------------------
    // FPGA IQ corrections (GPIO block, same signal path)
    // ------------------------------------------------------------------

    fn corr_reg(dir: Direction, kind: CorrKind) -> u8 {
        match (dir, kind) {
            (Direction::Tx, CorrKind::Phase) => gpio::CORR_TX_PHASE,
            (Direction::Tx, CorrKind::Gain) => gpio::CORR_TX_GAIN,
            (Direction::Rx, CorrKind::Phase) => gpio::CORR_RX_PHASE,
            (Direction::Rx, CorrKind::Gain) => gpio::CORR_RX_GAIN,
        }
    }

    /// Program an FPGA IQ correction, clamped to [`FPGA_CORR_RANGE`].
    pub fn set_fpga_corr(&self, dir: Direction, kind: CorrKind, value: i32) -> Result<()> {
        let value = clamp_range("fpga correction", value, FPGA_CORR_RANGE) as i16;
        self.bus
            .write(PeriphDev::Gpio, Self::corr_reg(dir, kind), &value.to_le_bytes())
    }

    /// Read back an FPGA IQ correction.
    pub fn get_fpga_corr(&self, dir: Direction, kind: CorrKind) -> Result<i32> {
        let mut raw = [0u8; 2];
        self.bus
            .read(PeriphDev::Gpio, Self::corr_reg(dir, kind), &mut raw)?;
        Ok(i32::from(i16::from_le_bytes(raw)))
    }

    // ------------------------------------------------------------------
    // LNA / PA
    // ------------------------------------------------------------------

    /// Select an LNA (1..=3) or disconnect all (`None`).
    pub fn lna_select(&self, lna: Option<u8>) -> Result<()> {
        let sel = match lna {
            None => 0,
            Some(n @ 1..=3) => n,
            Some(n) => {
                return Err(DeviceError::out_of_range(format!("no LNA {n}")));
            }
        };
        self.bus
            .change_bits(PeriphDev::Xcvr, regs::RX_LNA_CTRL, 0x30, sel << 4)
    }

    /// Currently selected LNA.
    pub fn lna_selected(&self) -> Result<Option<u8>> {
        let raw = self.bus.read_reg(PeriphDev::Xcvr, regs::RX_LNA_CTRL)?;
        let sel = (raw >> 4) & 0x03;
        Ok(if sel == 0 { None } else { Some(sel) })
    }

    /// Set the LNA gain level.
    pub fn lna_gain_set(&self, gain: LnaGain) -> Result<()> {
        let code = match gain {
            LnaGain::Bypass => 0u8,
            LnaGain::Mid => 1,
            LnaGain::Max => 2,
        };
        self.bus
            .change_bits(PeriphDev::Xcvr, regs::RX_LNA_CTRL, 0xc0, code << 6)
    }

    /// Read back the LNA gain level.
    pub fn lna_gain_get(&self) -> Result<LnaGain> {
        let raw = self.bus.read_reg(PeriphDev::Xcvr, regs::RX_LNA_CTRL)?;
        Ok(match raw >> 6 {
            0 => LnaGain::Bypass,
            1 => LnaGain::Mid,
            _ => LnaGain::Max,
        })
    }

    /// Select a PA or switch all off.
    pub fn pa_select(&self, pa: PaSel) -> Result<()> {
        let code = match pa {
            PaSel::Off => 0u8,
            PaSel::Pa1 => 1,
            PaSel::Pa2 => 2,
            PaSel::Aux => 3,
        };
        self.bus
            .change_bits(PeriphDev::Xcvr, regs::TX_PA_SEL, 0x18, code << 3)
    }

    // ------------------------------------------------------------------
    // Loopback switches
    // ------------------------------------------------------------------

    /// Route a loopback path. The switches (and the amplifiers they feed)
    /// are always opened first, so every transition passes through the
    /// all-off configuration; the caller restores band amplifiers when
    /// returning to straight-through operation.
    pub fn loopback_path(&self, mode: LoopbackMode) -> Result<()> {
        // Tear down: amps off, both switch banks open.
        self.pa_select(PaSel::Off)?;
        self.lna_select(None)?;
        self.bus
            .clear_bits(PeriphDev::Xcvr, regs::LOOPBACK_RF, 0x07)?;
        self.bus
            .clear_bits(PeriphDev::Xcvr, regs::LOOPBACK_BB, 0x0f)?;
        match mode {
            LoopbackMode::None | LoopbackMode::Firmware => Ok(()),
            m if m.is_rf() => {
                let lna = m.rf_lna().unwrap_or(1);
                self.bus
                    .change_bits(PeriphDev::Xcvr, regs::LOOPBACK_RF, 0x07, lna)?;
                self.lna_select(Some(lna))?;
                self.pa_select(PaSel::Aux)
            }
            m => {
                let code = match m {
                    LoopbackMode::BbLpfToRxOut => 1u8,
                    LoopbackMode::BbLpfToVga2 => 2,
                    LoopbackMode::BbVga1ToVga2 => 3,
                    LoopbackMode::BbLpfToLpf => 4,
                    LoopbackMode::BbVga1ToLpf => 5,
                    _ => unreachable!(),
                };
                self.bus
                    .change_bits(PeriphDev::Xcvr, regs::LOOPBACK_BB, 0x0f, code)
            }
        }
    }

    // ------------------------------------------------------------------
    // Bulk register access (calibration backup/restore, `show` dumps)
    // ------------------------------------------------------------------

    /// Snapshot a register list.
    pub fn backup(&self, addrs: &[u8]) -> Result<Vec<(u8, u8)>> {
        addrs
            .iter()
            .map(|&a| Ok((a, self.bus.read_reg(PeriphDev::Xcvr, a)?)))
            .collect()
    }

    /// Restore a snapshot taken by [`Self::backup`].
    pub fn restore(&self, saved: &[(u8, u8)]) -> Result<()> {
        for &(addr, value) in saved {
            self.bus.write_reg(PeriphDev::Xcvr, addr, value)?;
        }
        Ok(())
    }

    /// Full register dump, 0x00..=0x7f.
    pub fn dump(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 0x80];
        self.bus.read(PeriphDev::Xcvr, 0, &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dc_roundtrip_tx() {
        for d in TX_DC_RANGE.0..=TX_DC_RANGE.1 {
            assert_eq!(dc_decode(Direction::Tx, dc_encode(Direction::Tx, d)), d);
        }
    }

    #[test]
    fn test_dc_roundtrip_rx() {
        for d in RX_DC_RANGE.0..=RX_DC_RANGE.1 {
            assert_eq!(dc_decode(Direction::Rx, dc_encode(Direction::Rx, d)), d);
        }
    }

    #[test]
    fn test_rx_dc_decode_ignores_msb() {
        let encoded = dc_encode(Direction::Rx, -20);
        assert_eq!(dc_decode(Direction::Rx, encoded | 0x80), -20);
    }

    #[test]
    fn test_bandwidth_ladder_ascending() {
        for pair in LPF_BANDWIDTHS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_quantize_bandwidth() {
        assert_eq!(quantize_bandwidth(1_500_000), (0, 1_500_000));
        assert_eq!(quantize_bandwidth(1_600_000), (1, 1_750_000));
        assert_eq!(quantize_bandwidth(27_999_999), (15, 28_000_000));
        // Over the top of the ladder: widest filter.
        assert_eq!(quantize_bandwidth(99_000_000), (15, 28_000_000));
    }
}
