// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Amplifier pre-distortion.
//!
//! A TX power sweep under RF loopback measures the amplifier's complex
//! gain per step; from the droop at the top of the sweep a two-segment
//! model (flat, then linear in instantaneous power) is fitted for both
//! magnitude and phase. The inverse of that model fills a 4096-entry
//! complex table indexed by normalized instantaneous power (0..2), which
//! the TX path applies per sample when enabled.

use std::sync::Arc;

use log::{debug, info};

use super::baseband::{cal_sample_rate, tone_freqs, BbKind};
use super::{capture_pumped_rx, CalControl, RxPump};
use crate::device::Device;
use crate::dsp::{tone, Cf32, Cf64};
use crate::error::{DeviceError, Result};
use crate::state::Direction;
use crate::tx::PREDIST_TABLE_LEN;

/// Two-segment amplifier model in normalized instantaneous power (0..2).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmpModel {
    /// Power where magnitude compression starts.
    pub gain_exp_breakpoint: f64,
    /// Fractional magnitude droop per unit power past the breakpoint.
    pub gain_exp_slope: f64,
    /// Power where phase rotation starts.
    pub phase_exp_breakpoint: f64,
    /// Phase rotation (radians) per unit power past the breakpoint.
    pub phase_exp_slope: f64,
}

/// Build the inverse-distortion table from a fitted model.
#[must_use]
pub fn build_table(model: &AmpModel) -> Vec<Cf32> {
    (0..PREDIST_TABLE_LEN)
        .map(|idx| {
            let p = idx as f64 / (PREDIST_TABLE_LEN as f64 / 2.0);
            let droop = model.gain_exp_slope * (p - model.gain_exp_breakpoint).max(0.0);
            let phase = model.phase_exp_slope * (p - model.phase_exp_breakpoint).max(0.0);
            Cf64::exp_j(-phase).scale(1.0 + droop).narrow()
        })
        .collect()
}

/// Fit the model from sweep results: per-step normalized power and complex
/// gain. Magnitude uses the droop at the final (maximum-power) step; phase
/// uses the slope between the last two steps.
pub fn derive_model(powers: &[f64], gains: &[Cf64]) -> Result<AmpModel> {
    if powers.len() < 2 || powers.len() != gains.len() {
        return Err(DeviceError::failure(
            "amplifier sweep needs at least two usable steps",
        ));
    }
    let reference = gains[0].abs();
    if reference <= 0.0 {
        return Err(DeviceError::failure("amplifier sweep reference gain is zero"));
    }
    let last = powers.len() - 1;
    let p_max = powers[last];
    let p_prev = powers[last - 1];
    if p_max <= p_prev {
        return Err(DeviceError::failure("amplifier sweep powers not increasing"));
    }
    let droop_max = 1.0 - gains[last].abs() / reference;
    let gain_exp_breakpoint = p_prev;
    let gain_exp_slope = (droop_max / (p_max - p_prev)).max(0.0);
    let dphase = gains[last].div(gains[last - 1]).arg();
    Ok(AmpModel {
        gain_exp_breakpoint,
        gain_exp_slope,
        phase_exp_breakpoint: p_prev,
        phase_exp_slope: dphase / (p_max - p_prev),
    })
}

/// Run the power sweep and install the resulting table on the TX path.
/// `start_db..=stop_db` are TX VGA1 gains, walked in `step_db` steps while
/// the unit circle tone transmits under the already-routed loopback.
pub fn run_sweep(
    dev: &Arc<Device>,
    ctl: &CalControl,
    start_db: i32,
    stop_db: i32,
    step_db: i32,
) -> Result<AmpModel> {
    if step_db <= 0 || stop_db < start_db {
        return Err(DeviceError::out_of_range(format!(
            "amplifier sweep {start_db}..{stop_db} step {step_db}"
        )));
    }
    let applied = dev.applied_state();
    let rate = cal_sample_rate(applied.tx.sample_rate_hz.max(1));
    let capture_len = 2048usize;
    let (_, w_test) = tone_freqs(BbKind::DcOffset);
    let reference = tone(-w_test, capture_len);
    let mut pump = RxPump::default();
    let mut powers = Vec::new();
    let mut gains = Vec::new();
    let mut gain_db = start_db;
    while gain_db <= stop_db {
        ctl.check_abort()?;
        dev.set_vga(Direction::Tx, 1, gain_db)?;
        let ts = dev.tx.lock().stream_pos() + u64::from(rate) / 100;
        let capture = capture_pumped_rx(dev, &mut pump, ts, capture_len)?;
        // Mean complex gain of the step: projection onto the probe tone.
        let mut acc = Cf64::default();
        for (k, s) in capture.samples.iter().enumerate() {
            acc += reference[k] * s.widen();
        }
        let gain = acc.scale(1.0 / capture_len as f64);
        let power = 2.0 * 10f64.powf(f64::from(gain_db - stop_db) / 10.0);
        debug!(
            "amp sweep: vga1 {gain_db} dB -> |g| {:.4}, power {power:.4}",
            gain.abs()
        );
        powers.push(power);
        gains.push(gain);
        gain_db += step_db;
    }
    let model = derive_model(&powers, &gains)?;
    info!(
        "amp sweep: breakpoint {:.3}, slope {:.4}, phase slope {:.4}",
        model.gain_exp_breakpoint, model.gain_exp_slope, model.phase_exp_slope
    );
    dev.tx
        .lock()
        .set_predist(Some(Arc::new(build_table(&model))));
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_identity_without_compression() {
        let model = AmpModel {
            gain_exp_breakpoint: 2.0,
            gain_exp_slope: 0.0,
            phase_exp_breakpoint: 2.0,
            phase_exp_slope: 0.0,
        };
        let table = build_table(&model);
        assert_eq!(table.len(), PREDIST_TABLE_LEN);
        for entry in &table {
            assert!((entry.re - 1.0).abs() < 1e-6);
            assert!(entry.im.abs() < 1e-6);
        }
    }

    #[test]
    fn test_table_boosts_past_breakpoint() {
        let model = AmpModel {
            gain_exp_breakpoint: 1.0,
            gain_exp_slope: 0.1,
            phase_exp_breakpoint: 1.0,
            phase_exp_slope: -0.05,
        };
        let table = build_table(&model);
        let below = table[1000]; // p < 1
        let above = table[4095]; // p ~ 2
        assert!((below.re - 1.0).abs() < 1e-6);
        let mag_above = (above.re * above.re + above.im * above.im).sqrt();
        assert!((f64::from(mag_above) - 1.1).abs() < 1e-3);
        // Phase counter-rotates against the modeled rotation.
        assert!(above.im > 0.0);
    }

    #[test]
    fn test_derive_model_from_synthetic_sweep() {
        // Flat gain until the last step, which droops 10% and rotates.
        let powers = vec![0.5, 1.0, 2.0];
        let gains = vec![
            Cf64::new(2.0, 0.0),
            Cf64::new(2.0, 0.0),
            Cf64::exp_j(-0.1).scale(1.8),
        ];
        let model = derive_model(&powers, &gains).expect("model");
        assert!((model.gain_exp_breakpoint - 1.0).abs() < 1e-12);
        assert!((model.gain_exp_slope - 0.1).abs() < 1e-9);
        assert!((model.phase_exp_slope - (-0.1)).abs() < 1e-9);
    }

    #[test]
    fn test_derive_model_rejects_degenerate() {
        assert!(derive_model(&[1.0], &[Cf64::new(1.0, 0.0)]).is_err());
        assert!(derive_model(&[1.0, 1.0], &[Cf64::new(1.0, 0.0); 2]).is_err());
    }
}
