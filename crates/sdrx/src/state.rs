// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Desired-state data model.
//!
//! [`DevState`] is the full set of knobs a caller may want realized on the
//! board: one [`DirState`] per direction plus the global flags. Three change
//! bit-sets (common, tx, rx) record which fields the reconciler must push;
//! applying a state clears bits as fields land, so a state with no bits set
//! is a no-op by construction.

use std::sync::Arc;

use crate::config::{MAX_FREQUENCY, MAX_SAMPLE_RATE, MIN_FREQUENCY, MIN_SAMPLE_RATE};
use crate::dsp::Cf32;
use crate::error::{DeviceError, Result};

/// Stream direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to antenna.
    Tx,
    /// Antenna to host.
    Rx,
}

impl Direction {
    /// Lowercase name used in logs and replies.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Tx => "tx",
            Self::Rx => "rx",
        }
    }

    /// The opposite direction.
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Tx => Self::Rx,
            Self::Rx => Self::Tx,
        }
    }
}

/// Low-pass filter modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LpfMode {
    /// Filter block powered down.
    Disabled,
    /// Signal routed around the filter.
    Bypass,
    /// Filtering active.
    #[default]
    Normal,
}

impl LpfMode {
    /// Lowercase name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Bypass => "bypass",
            Self::Normal => "normal",
        }
    }
}

/// Receive LNA gain, three levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LnaGain {
    /// Amplifier bypassed.
    Bypass,
    /// Mid gain.
    Mid,
    /// Maximum gain.
    #[default]
    Max,
}

/// Loopback routing. Any transition between two non-`None` modes passes
/// through `None` (amplifiers off, switches open) first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopbackMode {
    /// Straight-through operation.
    #[default]
    None,
    /// FPGA-level sample loopback, RF untouched.
    Firmware,
    /// Baseband: TX LPF output to RX output pins.
    BbLpfToRxOut,
    /// Baseband: TX LPF output to RX VGA2 input.
    BbLpfToVga2,
    /// Baseband: TX VGA1 output to RX VGA2 input.
    BbVga1ToVga2,
    /// Baseband: TX LPF output to RX LPF input.
    BbLpfToLpf,
    /// Baseband: TX VGA1 output to RX LPF input.
    BbVga1ToLpf,
    /// RF: PA output coupled back into LNA1.
    RfLna1,
    /// RF: PA output coupled back into LNA2.
    RfLna2,
    /// RF: PA output coupled back into LNA3.
    RfLna3,
}

impl LoopbackMode {
    /// Lowercase name used in control messages and logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Firmware => "firmware",
            Self::BbLpfToRxOut => "bb-lpf-rxout",
            Self::BbLpfToVga2 => "bb-lpf-vga2",
            Self::BbVga1ToVga2 => "bb-vga1-vga2",
            Self::BbLpfToLpf => "bb-lpf-lpf",
            Self::BbVga1ToLpf => "bb-vga1-lpf",
            Self::RfLna1 => "rf-lna1",
            Self::RfLna2 => "rf-lna2",
            Self::RfLna3 => "rf-lna3",
        }
    }

    /// Parse a control-message mode name.
    pub fn parse(name: &str) -> Result<Self> {
        let all = [
            Self::None,
            Self::Firmware,
            Self::BbLpfToRxOut,
            Self::BbLpfToVga2,
            Self::BbVga1ToVga2,
            Self::BbLpfToLpf,
            Self::BbVga1ToLpf,
            Self::RfLna1,
            Self::RfLna2,
            Self::RfLna3,
        ];
        all.into_iter()
            .find(|m| m.name() == name)
            .ok_or_else(|| DeviceError::parser(format!("unknown loopback mode '{name}'")))
    }

    /// True for the three RF paths.
    #[must_use]
    pub const fn is_rf(self) -> bool {
        matches!(self, Self::RfLna1 | Self::RfLna2 | Self::RfLna3)
    }

    /// True for the five baseband paths.
    #[must_use]
    pub const fn is_baseband(self) -> bool {
        matches!(
            self,
            Self::BbLpfToRxOut
                | Self::BbLpfToVga2
                | Self::BbVga1ToVga2
                | Self::BbLpfToLpf
                | Self::BbVga1ToLpf
        )
    }

    /// LNA index (1..=3) targeted by an RF path.
    #[must_use]
    pub const fn rf_lna(self) -> Option<u8> {
        match self {
            Self::RfLna1 => Some(1),
            Self::RfLna2 => Some(2),
            Self::RfLna3 => Some(3),
            _ => None,
        }
    }
}

/// Gain overrides applied while a loopback path is engaged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LoopbackParams {
    /// RX VGA1 override.
    pub rx_vga1: Option<i32>,
    /// RX VGA2 override.
    pub rx_vga2: Option<i32>,
    /// LNA gain override.
    pub lna_gain: Option<LnaGain>,
}

/// Transmit test pattern: replaces caller IQ when not `Off`.
#[derive(Debug, Clone, Default)]
pub enum TxPattern {
    /// Caller IQ passes through.
    #[default]
    Off,
    /// Unit-magnitude rotating tone, one turn per eight samples.
    Circle,
    /// All-zero samples.
    Zero,
    /// Arbitrary IQ vector, cycled.
    Vector(Arc<Vec<Cf32>>),
}

impl TxPattern {
    /// Whether a pattern overrides caller IQ.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl PartialEq for TxPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Off, Self::Off) | (Self::Circle, Self::Circle) | (Self::Zero, Self::Zero) => {
                true
            }
            (Self::Vector(a), Self::Vector(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ============================================================================
// Change bit-sets
// ============================================================================

/// Per-direction change bits.
pub mod dir_changed {
    /// RF on/off.
    pub const RF_ENABLED: u32 = 1 << 0;
    /// Center frequency.
    pub const FREQUENCY: u32 = 1 << 1;
    /// First VGA stage gain.
    pub const VGA1: u32 = 1 << 2;
    /// Second VGA stage gain.
    pub const VGA2: u32 = 1 << 3;
    /// LPF mode.
    pub const LPF_MODE: u32 = 1 << 4;
    /// LPF bandwidth.
    pub const LPF_BW: u32 = 1 << 5;
    /// Sample rate.
    pub const SAMPLE_RATE: u32 = 1 << 6;
    /// DC offset, I branch.
    pub const DC_I: u32 = 1 << 7;
    /// DC offset, Q branch.
    pub const DC_Q: u32 = 1 << 8;
    /// FPGA IQ phase correction.
    pub const FPGA_PHASE: u32 = 1 << 9;
    /// FPGA IQ gain correction.
    pub const FPGA_GAIN: u32 = 1 << 10;
    /// Stream timestamp seed.
    pub const TIMESTAMP: u32 = 1 << 11;
    /// TX I/Q power balance.
    pub const POWER_BALANCE: u32 = 1 << 12;

    /// Every per-direction bit.
    pub const ALL: u32 = (1 << 13) - 1;
}

/// Global change bits.
pub mod common_changed {
    /// Loopback mode + params.
    pub const LOOPBACK: u32 = 1 << 0;
    /// RX DC autocorrection flag.
    pub const RX_DC_AUTO: u32 = 1 << 1;
    /// TX pattern + gain.
    pub const TX_PATTERN: u32 = 1 << 2;
    /// Sentinel: stop at the first failed field instead of continuing.
    pub const ABORT_ON_FAIL: u32 = 1 << 31;

    /// Every real (non-sentinel) global bit.
    pub const ALL: u32 = LOOPBACK | RX_DC_AUTO | TX_PATTERN;
}

// ============================================================================
// DirState / DevState
// ============================================================================

/// Desired state of one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct DirState {
    /// RF front end on.
    pub rf_enabled: bool,
    /// Center frequency (Hz).
    pub frequency_hz: u64,
    /// First VGA stage gain (dB).
    pub vga1: i32,
    /// Second VGA stage gain (dB).
    pub vga2: i32,
    /// LPF mode.
    pub lpf_mode: LpfMode,
    /// LPF bandwidth (Hz), quantized to the 16-entry ladder.
    pub lpf_bw_hz: u32,
    /// DC offset, I branch (TX: [-128,127], RX: [-63,63]).
    pub dc_offset_i: i32,
    /// DC offset, Q branch.
    pub dc_offset_q: i32,
    /// FPGA phase correction, [-4096, 4096].
    pub fpga_corr_phase: i32,
    /// FPGA gain correction, [-4096, 4096].
    pub fpga_corr_gain: i32,
    /// TX I/Q power balance in (0, 2); unused on RX.
    pub power_balance: f64,
    /// Sample rate (Hz).
    pub sample_rate_hz: u32,
    /// 62-bit stream sample counter seed.
    pub timestamp: u64,
}

impl Default for DirState {
    fn default() -> Self {
        Self {
            rf_enabled: false,
            frequency_hz: 0,
            vga1: 0,
            vga2: 0,
            lpf_mode: LpfMode::Normal,
            lpf_bw_hz: 0,
            dc_offset_i: 0,
            dc_offset_q: 0,
            fpga_corr_phase: 0,
            fpga_corr_gain: 0,
            power_balance: 1.0,
            sample_rate_hz: 0,
            timestamp: 0,
        }
    }
}

/// Full desired device state plus change tracking.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevState {
    /// Transmit direction.
    pub tx: DirState,
    /// Receive direction.
    pub rx: DirState,
    /// Loopback routing.
    pub loopback: LoopbackMode,
    /// Gain overrides while loopback is engaged.
    pub loopback_params: LoopbackParams,
    /// Transmit pattern.
    pub tx_pattern: TxPattern,
    /// Pattern amplitude multiplier.
    pub tx_pattern_gain: f32,
    /// RX DC autocorrection enabled.
    pub rx_dc_auto: bool,
    /// Global change bits (see [`common_changed`]).
    pub changed_common: u32,
    /// TX change bits (see [`dir_changed`]).
    pub changed_tx: u32,
    /// RX change bits.
    pub changed_rx: u32,
}

impl DevState {
    /// Direction accessor.
    #[must_use]
    pub fn dir(&self, dir: Direction) -> &DirState {
        match dir {
            Direction::Tx => &self.tx,
            Direction::Rx => &self.rx,
        }
    }

    /// Mutable direction accessor.
    pub fn dir_mut(&mut self, dir: Direction) -> &mut DirState {
        match dir {
            Direction::Tx => &mut self.tx,
            Direction::Rx => &mut self.rx,
        }
    }

    /// Change bits for a direction.
    #[must_use]
    pub fn changed(&self, dir: Direction) -> u32 {
        match dir {
            Direction::Tx => self.changed_tx,
            Direction::Rx => self.changed_rx,
        }
    }

    /// Mutable change bits for a direction.
    pub fn changed_mut(&mut self, dir: Direction) -> &mut u32 {
        match dir {
            Direction::Tx => &mut self.changed_tx,
            Direction::Rx => &mut self.changed_rx,
        }
    }

    /// Mark every field changed (used for the initial full application).
    pub fn mark_all_changed(&mut self) {
        self.changed_tx = dir_changed::ALL;
        self.changed_rx = dir_changed::ALL;
        self.changed_common |= common_changed::ALL;
    }

    /// True when no change bit is set.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.changed_tx == 0
            && self.changed_rx == 0
            && self.changed_common & common_changed::ALL == 0
    }

    /// Whether abort-on-fail is requested.
    #[must_use]
    pub fn abort_on_fail(&self) -> bool {
        self.changed_common & common_changed::ABORT_ON_FAIL != 0
    }
}

// ============================================================================
// Validation helpers
// ============================================================================

/// Validate an RF frequency against the tunable range.
pub fn validate_frequency(hz: u64) -> Result<u64> {
    if (MIN_FREQUENCY..=MAX_FREQUENCY).contains(&hz) {
        Ok(hz)
    } else {
        Err(DeviceError::out_of_range(format!(
            "frequency {hz} Hz outside [{MIN_FREQUENCY}, {MAX_FREQUENCY}]"
        )))
    }
}

/// Validate a sample rate against the absolute range.
pub fn validate_sample_rate(hz: u32) -> Result<u32> {
    if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&hz) {
        Ok(hz)
    } else {
        Err(DeviceError::out_of_range(format!(
            "sample rate {hz} Hz outside [{MIN_SAMPLE_RATE}, {MAX_SAMPLE_RATE}]"
        )))
    }
}

/// Validate a TX power balance value, exclusive (0, 2).
pub fn validate_power_balance(balance: f64) -> Result<f64> {
    if balance > 0.0 && balance < 2.0 {
        Ok(balance)
    } else {
        Err(DeviceError::out_of_range(format!(
            "power balance {balance} outside (0, 2)"
        )))
    }
}

/// Per-channel TX scale factors for a power balance value:
/// I = min(1, balance), Q = min(1, 1/balance).
#[must_use]
pub fn balance_scales(balance: f64) -> (f32, f32) {
    let i = balance.min(1.0);
    let q = (1.0 / balance).min(1.0);
    (i as f32, q as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_scales() {
        let (i, q) = balance_scales(1.0);
        assert_eq!((i, q), (1.0, 1.0));
        let (i, q) = balance_scales(0.5);
        assert_eq!((i, q), (0.5, 1.0));
        let (i, q) = balance_scales(1.25);
        assert_eq!((i, q), (1.0, 0.8));
    }

    #[test]
    fn test_validation_ranges() {
        assert!(validate_frequency(915_000_000).is_ok());
        assert!(validate_frequency(100_000_000).is_err());
        assert!(validate_sample_rate(2_000_000).is_ok());
        assert!(validate_sample_rate(50_000).is_err());
        assert!(validate_power_balance(0.0).is_err());
        assert!(validate_power_balance(2.0).is_err());
        assert!(validate_power_balance(1.999).is_ok());
    }

    #[test]
    fn test_mark_all_and_clean() {
        let mut state = DevState::default();
        assert!(state.is_clean());
        state.mark_all_changed();
        assert!(!state.is_clean());
        assert_eq!(state.changed_tx, dir_changed::ALL);
        state.changed_tx = 0;
        state.changed_rx = 0;
        state.changed_common = common_changed::ABORT_ON_FAIL;
        // The sentinel alone does not make a state dirty.
        assert!(state.is_clean());
        assert!(state.abort_on_fail());
    }

    #[test]
    fn test_loopback_classification() {
        assert!(LoopbackMode::RfLna2.is_rf());
        assert_eq!(LoopbackMode::RfLna2.rf_lna(), Some(2));
        assert!(LoopbackMode::BbLpfToLpf.is_baseband());
        assert!(!LoopbackMode::None.is_rf());
        assert_eq!(
            LoopbackMode::parse("rf-lna1").expect("parse"),
            LoopbackMode::RfLna1
        );
        assert!(LoopbackMode::parse("sideways").is_err());
    }
}
