// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Baseband calibration: TX LO leakage and TX IQ imbalance.
//!
//! The receiver is parked a quarter sample rate away from the transmit
//! frequency under an RF loopback, so the two artifacts to null land on
//! distinct narrow-band tones:
//!
//! - **LO leakage** (DC offsets): RX tuned *below* TX; the leaked carrier
//!   appears a quarter rate up, the transmitted probe tone half a rate up -
//!   the reference tones differ by pi/2.
//! - **IQ imbalance** (FPGA phase/gain): RX tuned *above* TX; the probe's
//!   image lands opposite the probe itself - the references differ by pi.
//!
//! Per corrected pair the sweep walks one knob across its range with the
//! peer fixed, measuring correlation energy against the calibration tone
//! per point and keeping the minimum; then the peer is swept the same way.
//! Each pass halves the range around the best point (and doubles the
//! capture length for SNR); the pair converges in `loops` passes. A point
//! is only trusted when the probe tone actually dominates the capture
//! (`0.5 < test/total <= 1`); the pair is converged when `cal/test` drops
//! to one part in a thousand.

use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::Arc;

use log::{debug, info, warn};

use super::{capture_pumped_rx, CalControl, CalReport, RxPump};
use crate::device::Device;
use crate::dsp::{correlate_energy, tone, total_energy, Cf32, Cf64};
use crate::error::{DeviceError, ErrorKind, Result};
use crate::state::{Direction, LnaGain, LoopbackMode, LoopbackParams, TxPattern};
use crate::usb::UsbSpeed;
use crate::xcvr::pll::BAND_SPLIT_HZ;
use crate::xcvr::{quantize_bandwidth, CorrKind, IqBranch, FPGA_CORR_RANGE, LPF_BANDWIDTHS, TX_DC_RANGE};

/// Which artifact a round nulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BbKind {
    /// TX LO leakage via the DC offset registers.
    DcOffset,
    /// TX IQ imbalance via the FPGA phase/gain corrections.
    Imbalance,
}

/// Sweep parameters.
#[derive(Debug, Clone)]
pub struct BbParams {
    /// Range-halving passes per pair (default 2).
    pub loops: u32,
    /// Capture length of the first pass; doubled per pass.
    pub capture_samples: usize,
    /// Points per sweep (fixes the step from the range).
    pub points: i32,
    /// Tolerated bad measurements (probe tone missing or clipped capture).
    pub allowed_failures: u32,
    /// Capture magnitude limit before a read counts as clipped.
    pub sample_limit: f32,
    /// DC and imbalance rounds each run this many times.
    pub rounds: u32,
}

impl Default for BbParams {
    fn default() -> Self {
        Self {
            loops: 2,
            capture_samples: 1024,
            points: 128,
            allowed_failures: 8,
            sample_limit: 1.05,
            rounds: 2,
        }
    }
}

/// RX-side reference tone frequencies `(cal, test)` in radians/sample for a
/// round kind. Emitters use `+omega`, detectors the conjugate.
#[must_use]
pub fn tone_freqs(kind: BbKind) -> (f64, f64) {
    match kind {
        BbKind::DcOffset => (FRAC_PI_2, PI),
        BbKind::Imbalance => (-FRAC_PI_2, FRAC_PI_2),
    }
}

/// Required calibration sample rate: at least 4.001 MHz and the TX rate.
#[must_use]
pub fn cal_sample_rate(tx_rate: u32) -> u32 {
    tx_rate.max(4_001_000)
}

struct Detectors {
    cal: Vec<Cf64>,
    test: Vec<Cf64>,
}

impl Detectors {
    fn new(kind: BbKind, n: usize) -> Self {
        let (w_cal, w_test) = tone_freqs(kind);
        Self {
            cal: tone(-w_cal, n),
            test: tone(-w_test, n),
        }
    }
}

struct Measurement {
    cal: f64,
    test: f64,
    total: f64,
    clipped: usize,
}

struct BbRun<'a> {
    dev: &'a Arc<Device>,
    ctl: &'a CalControl,
    pump: RxPump,
    params: BbParams,
    latency_samples: u64,
    failures: u32,
}

impl BbRun<'_> {
    fn measure(&mut self, det: &Detectors, samples: usize) -> Result<Measurement> {
        self.ctl.check_abort()?;
        let tx_pos = self.dev.tx.lock().stream_pos();
        let ts = tx_pos + self.latency_samples;
        let capture = capture_pumped_rx(self.dev, &mut self.pump, ts, samples)?;
        let clipped = capture
            .samples
            .iter()
            .filter(|s| s.re.abs() > self.params.sample_limit || s.im.abs() > self.params.sample_limit)
            .count();
        Ok(Measurement {
            cal: correlate_energy(&det.cal, &capture.samples),
            test: correlate_energy(&det.test, &capture.samples),
            total: total_energy(&capture.samples),
            clipped,
        })
    }

    fn bump_failures(&mut self, what: &str) -> Result<()> {
        self.failures += 1;
        debug!("baseband cal: {what} ({}/{})", self.failures, self.params.allowed_failures);
        if self.failures > self.params.allowed_failures {
            Err(DeviceError::new(
                ErrorKind::Saturation,
                format!("baseband cal: too many bad captures ({what})"),
            ))
        } else {
            Ok(())
        }
    }

    /// Walk one knob across `center +/- range`, peer fixed. Returns the
    /// value with the lowest calibration-tone energy plus its measurement.
    fn sweep(
        &mut self,
        set: &dyn Fn(&Arc<Device>, i32) -> Result<()>,
        knob_range: (i32, i32),
        center: i32,
        range: i32,
        det: &Detectors,
        samples: usize,
    ) -> Result<(i32, f64, f64)> {
        let step = (2 * range / self.params.points).max(1);
        let lo = (center - range).max(knob_range.0);
        let hi = (center + range).min(knob_range.1);
        let mut best: Option<(i32, f64, f64)> = None;
        let mut value = lo;
        while value <= hi {
            set(self.dev, value)?;
            let m = self.measure(det, samples)?;
            if m.clipped > 0 {
                self.bump_failures("clipped capture")?;
                value += step;
                continue;
            }
            let ratio = if m.total > 0.0 { m.test / m.total } else { 0.0 };
            if !(ratio > 0.5 && ratio <= 1.0) {
                self.bump_failures("probe tone not captured")?;
                value += step;
                continue;
            }
            if best.map_or(true, |(_, cal, _)| m.cal < cal) {
                best = Some((value, m.cal, m.test));
            }
            value += step;
        }
        best.ok_or_else(|| {
            DeviceError::failure("baseband cal: sweep produced no usable measurement")
        })
    }

    /// Calibrate one corrected pair: alternate sweeps, halving the range
    /// and doubling the capture per pass.
    fn calibrate_pair(
        &mut self,
        kind: BbKind,
        set_a: &dyn Fn(&Arc<Device>, i32) -> Result<()>,
        set_b: &dyn Fn(&Arc<Device>, i32) -> Result<()>,
        knob_range: (i32, i32),
        start: (i32, i32),
    ) -> Result<(i32, i32, bool)> {
        let (mut a, mut b) = start;
        let mut range = knob_range.1.max(-knob_range.0);
        let mut samples = self.params.capture_samples;
        let mut cal_ok = false;
        for pass in 0..self.params.loops {
            let det = Detectors::new(kind, samples);
            set_b(self.dev, b)?;
            let (best_a, _, _) = self.sweep(set_a, knob_range, a, range, &det, samples)?;
            a = best_a;
            set_a(self.dev, a)?;
            let (best_b, cal, test) = self.sweep(set_b, knob_range, b, range, &det, samples)?;
            b = best_b;
            set_b(self.dev, b)?;
            if test > 0.0 && cal / test <= 0.001 {
                cal_ok = true;
            }
            debug!(
                "baseband cal pass {pass}: best ({a}, {b}), cal/test {:.2e}",
                if test > 0.0 { cal / test } else { f64::NAN }
            );
            range = (range / 2).max(1);
            samples *= 2;
        }
        Ok((a, b, cal_ok))
    }
}

/// Point the receiver for a round: quarter-rate offset (below for DC,
/// above for imbalance), RX filter one step above the TX filter, RF
/// loopback into the band LNA, probe tone on the TX pattern.
fn setup_round(dev: &Arc<Device>, kind: BbKind) -> Result<u32> {
    let applied = dev.applied_state();
    let tx_rate = applied.tx.sample_rate_hz;
    let tx_freq = applied.tx.frequency_hz;
    if tx_rate == 0 || tx_freq == 0 {
        return Err(DeviceError::failure(
            "baseband cal needs TX frequency and sample rate configured",
        ));
    }
    let rate = cal_sample_rate(tx_rate);
    let rx_freq = match kind {
        BbKind::DcOffset => tx_freq - u64::from(rate) / 4,
        BbKind::Imbalance => tx_freq + u64::from(rate) / 4,
    };
    dev.set_sample_rate(Direction::Rx, rate)?;
    dev.set_frequency(Direction::Rx, rx_freq)?;
    let (tx_idx, _) = quantize_bandwidth(applied.tx.lpf_bw_hz.max(LPF_BANDWIDTHS[0]));
    let rx_bw = LPF_BANDWIDTHS[(tx_idx + 1).min(LPF_BANDWIDTHS.len() - 1)];
    {
        let mut d = dev.delta();
        d.rx.lpf_bw_hz = rx_bw;
        d.changed_rx |= crate::state::dir_changed::LPF_BW;
        dev.set_state(&d)?;
    }
    let loopback = if tx_freq < BAND_SPLIT_HZ {
        LoopbackMode::RfLna1
    } else {
        LoopbackMode::RfLna2
    };
    dev.set_loopback(
        loopback,
        LoopbackParams {
            lna_gain: Some(LnaGain::Max),
            rx_vga1: Some(20),
            rx_vga2: Some(10),
        },
    )?;
    // Probe tone: lands on the test reference after the quarter-rate shift.
    let omega_b = match kind {
        BbKind::DcOffset => FRAC_PI_2,
        BbKind::Imbalance => PI,
    };
    let pattern: Vec<Cf32> = (0..64)
        .map(|k| Cf64::exp_j(omega_b * k as f64).scale(0.7).narrow())
        .collect();
    dev.set_tx_pattern(TxPattern::Vector(Arc::new(pattern)), 1.0)?;
    Ok(rate)
}

fn latency_samples(dev: &Device, rate: u32, include_tx: bool) -> u64 {
    let cfg = &dev.cfg;
    let (rx_us, tx_us) = match dev.speed() {
        UsbSpeed::Super => (cfg.rx_latency_super_us, cfg.tx_latency_super_us),
        UsbSpeed::High => (cfg.rx_latency_high_us, cfg.tx_latency_high_us),
    };
    let us = u64::from(rx_us) + if include_tx { u64::from(tx_us) } else { 0 };
    us * u64::from(rate) / 1_000_000
}

fn set_tx_dc_i(dev: &Arc<Device>, v: i32) -> Result<()> {
    dev.set_dc_offset(Direction::Tx, IqBranch::I, v)
}

fn set_tx_dc_q(dev: &Arc<Device>, v: i32) -> Result<()> {
    dev.set_dc_offset(Direction::Tx, IqBranch::Q, v)
}

fn set_tx_phase(dev: &Arc<Device>, v: i32) -> Result<()> {
    dev.set_fpga_corr(Direction::Tx, CorrKind::Phase, v)
}

fn set_tx_gain(dev: &Arc<Device>, v: i32) -> Result<()> {
    dev.set_fpga_corr(Direction::Tx, CorrKind::Gain, v)
}

/// One DC round and one imbalance round share this shell.
fn run_round(dev: &Arc<Device>, ctl: &CalControl, kind: BbKind, params: &BbParams) -> Result<(i32, i32, bool)> {
    let rate = setup_round(dev, kind)?;
    let mut run = BbRun {
        dev,
        ctl,
        pump: RxPump::default(),
        params: params.clone(),
        latency_samples: latency_samples(dev, rate, kind == BbKind::Imbalance),
        failures: 0,
    };
    let applied = dev.applied_state();
    match kind {
        BbKind::DcOffset => run.calibrate_pair(
            kind,
            &set_tx_dc_i,
            &set_tx_dc_q,
            TX_DC_RANGE,
            (applied.tx.dc_offset_i, applied.tx.dc_offset_q),
        ),
        BbKind::Imbalance => run.calibrate_pair(
            kind,
            &set_tx_phase,
            &set_tx_gain,
            FPGA_CORR_RANGE,
            (applied.tx.fpga_corr_phase, applied.tx.fpga_corr_gain),
        ),
    }
}

/// Full baseband calibration: loopback self-check, then the DC and
/// imbalance rounds. Results stay applied in the device state.
pub fn full_baseband_cal(dev: &Arc<Device>, ctl: &CalControl) -> Result<CalReport> {
    let params = BbParams::default();

    // Self-check the loopback path before trusting any sweep.
    setup_round(dev, BbKind::DcOffset)?;
    super::loopcheck::verify_loopback(dev, ctl)?;

    let mut report = CalReport::default();
    let mut dc_ok = false;
    for round in 0..params.rounds {
        ctl.check_stop()?;
        let (i, q, ok) = run_round(dev, ctl, BbKind::DcOffset, &params)?;
        report.tx_dc_i = i;
        report.tx_dc_q = q;
        dc_ok |= ok;
        info!("baseband cal: DC round {round} -> ({i}, {q}), converged {ok}");
    }
    if !dc_ok {
        return Err(DeviceError::new(
            ErrorKind::NotCalibrated,
            "LO leakage calibration did not converge",
        ));
    }
    let mut imb_ok = false;
    for round in 0..params.rounds {
        ctl.check_stop()?;
        let (phase, gain, ok) = run_round(dev, ctl, BbKind::Imbalance, &params)?;
        report.tx_phase = phase;
        report.tx_gain = gain;
        imb_ok |= ok;
        info!("baseband cal: imbalance round {round} -> ({phase}, {gain}), converged {ok}");
    }
    if !imb_ok {
        warn!("baseband cal: imbalance rounds did not reach convergence threshold");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_freq_relations() {
        let (cal, test) = tone_freqs(BbKind::DcOffset);
        assert!(((test - cal).abs() - FRAC_PI_2).abs() < 1e-12);
        let (cal, test) = tone_freqs(BbKind::Imbalance);
        assert!(((test - cal).abs() - PI).abs() < 1e-12);
    }

    #[test]
    fn test_cal_sample_rate_floor() {
        assert_eq!(cal_sample_rate(2_166_667), 4_001_000);
        assert_eq!(cal_sample_rate(10_000_000), 10_000_000);
    }

    #[test]
    fn test_scenario_pass_steps() {
        // Pass 1 covers the full DC range in steps of 2, pass 2 half the
        // range in steps of 1.
        let params = BbParams::default();
        let range1 = TX_DC_RANGE.1.max(-TX_DC_RANGE.0);
        assert_eq!((2 * range1 / params.points).max(1), 2);
        let range2 = range1 / 2;
        assert_eq!((2 * range2 / params.points).max(1), 1);
    }
}
