// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! VCTCXO clock discipline.
//!
//! The board's sample clock drifts with the VCTCXO; the discipliner measures
//! the realized sample rate against host wall time and trims the oscillator
//! through its bias DAC.
//!
//! One cycle (driven by the host's periodic tick):
//!
//! 1. A drift computed on the previous cycle, if any, is converted to DAC
//!    units ([`PPB_PER_UNIT`]), clamped to [`MAX_TRIM_UNITS`], written, and
//!    announced; the trims-left counter decrements.
//! 2. Otherwise, while active and past the resume point: with no reference
//!    pinning yet, one is taken (up to [`PIN_ATTEMPTS`] reads, keeping the
//!    lowest-delay pair); once the measurement interval has elapsed a second
//!    pinning yields `drift_ppb = 1e9 * (rate / configured_rate - 1)`.
//!    A pinning whose read delay exceeds the noise budget reschedules
//!    instead of acting.
//!
//! The measurement interval scales with the required accuracy:
//! `(system_accuracy + 2 * max(0, delay - known_delay)) * 1e9 / accuracy_ppb`.
//!
//! Counter convention: `trims_left == 0` is idle, `-1` runs until disabled.

use log::{debug, info, warn};

use crate::config::{DisciplineConfig, FREQ_OFFSET_RANGE};
use crate::error::Result;

/// DAC units per ppb of drift: one trim unit moves the clock ~92.77 ppb.
pub const PPB_PER_UNIT: f64 = 92.77;

/// Largest single correction, in DAC units.
pub const MAX_TRIM_UNITS: f64 = 12.0;

/// Reads attempted when taking a pinning.
pub const PIN_ATTEMPTS: u32 = 20;

/// Backoff after a failed or postponed measurement (us).
const POSTPONE_US: u64 = 1_000_000;

/// One (sample counter, host time) pairing with its measurement delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pinning {
    /// Device sample counter.
    pub samples: u64,
    /// Host time at the counter read (us).
    pub host_us: u64,
    /// Duration of the read itself (us).
    pub delay_us: u64,
}

/// Hardware access the discipliner needs; implemented by the device.
pub trait DisciplineIo {
    /// Read the device sample counter paired with host time.
    fn read_pinning(&self) -> Result<Pinning>;
    /// Write the trim DAC and announce the change.
    fn write_trim(&self, offset: f64, drift_ppb: f64) -> Result<()>;
}

/// Discipliner state block.
pub struct Discipliner {
    cfg: DisciplineConfig,
    /// Sample rate the drift is measured against (Hz).
    configured_rate: u32,
    /// Current VCTCXO trim value.
    freq_offset: f64,
    pin: Option<Pinning>,
    next_measure_us: u64,
    resume_at_us: u64,
    /// 0 = idle, -1 = run until disabled, n > 0 = n corrections left.
    trims_left: i32,
    pending_drift_ppb: Option<f64>,
    last_drift_ppb: Option<f64>,
}

impl Discipliner {
    /// New, idle discipliner.
    #[must_use]
    pub fn new(cfg: DisciplineConfig, freq_offset: f64) -> Self {
        Self {
            cfg,
            configured_rate: 0,
            freq_offset,
            pin: None,
            next_measure_us: 0,
            resume_at_us: 0,
            trims_left: 0,
            pending_drift_ppb: None,
            last_drift_ppb: None,
        }
    }

    /// Current trim value.
    #[must_use]
    pub fn freq_offset(&self) -> f64 {
        self.freq_offset
    }

    /// Set the trim value directly (operator `freqoffs` command); drops the
    /// reference pinning since the clock just moved.
    pub fn set_freq_offset(&mut self, offset: f64) {
        self.freq_offset = offset.clamp(FREQ_OFFSET_RANGE.0, FREQ_OFFSET_RANGE.1);
        self.pin = None;
    }

    /// Corrections remaining (0 idle, -1 unbounded).
    #[must_use]
    pub fn trims_left(&self) -> i32 {
        self.trims_left
    }

    /// Most recent measured drift.
    #[must_use]
    pub fn last_drift_ppb(&self) -> Option<f64> {
        self.last_drift_ppb
    }

    /// Whether the loop is running.
    #[must_use]
    pub fn active(&self) -> bool {
        self.trims_left != 0
    }

    /// Start disciplining: `count` corrections (`-1` = until disabled), with
    /// an optional system-accuracy override.
    pub fn start(&mut self, count: i32, system_accuracy_us: Option<u64>, now_us: u64) {
        if let Some(acc) = system_accuracy_us {
            self.cfg.system_accuracy_us = acc.clamp(50, 10_000);
        }
        self.trims_left = if count == 0 { -1 } else { count };
        self.pin = None;
        self.pending_drift_ppb = None;
        self.resume_at_us = now_us;
        info!(
            "discipline: started, count {}, system accuracy {} us",
            self.trims_left, self.cfg.system_accuracy_us
        );
    }

    /// Stop disciplining.
    pub fn stop(&mut self) {
        self.trims_left = 0;
        self.pin = None;
        self.pending_drift_ppb = None;
    }

    /// Update the rate the drift is measured against. A change invalidates
    /// the pinning and postpones the next measurement.
    pub fn set_configured_rate(&mut self, rate: u32, now_us: u64) {
        if rate != self.configured_rate {
            self.configured_rate = rate;
            self.postpone(now_us, true);
        }
    }

    /// Push activity out (config change, read failure, operator command).
    pub fn postpone(&mut self, now_us: u64, drop_pin: bool) {
        self.resume_at_us = now_us + POSTPONE_US;
        if drop_pin {
            self.pin = None;
        }
    }

    /// Queue a one-shot operator-supplied drift correction.
    pub fn force_drift(&mut self, drift_ppb: f64) {
        self.pending_drift_ppb = Some(drift_ppb);
        if self.trims_left == 0 {
            self.trims_left = 1;
        }
    }

    /// Measurement interval (us) so that the timing noise stays below the
    /// required accuracy: `noise / interval <= accuracy_ppb`.
    fn interval_us(&self, delay_us: u64) -> u64 {
        let extra = delay_us.saturating_sub(self.cfg.known_delay_us) * 2;
        (self.cfg.system_accuracy_us + extra) * 1_000_000_000 / self.cfg.accuracy_ppb.max(1)
    }

    /// Take one pinning: up to [`PIN_ATTEMPTS`] reads, stopping early below
    /// `best_delay`, otherwise keeping the lowest-delay pair.
    fn acquire_pinning(&self, io: &dyn DisciplineIo) -> Result<Pinning> {
        let mut best: Option<Pinning> = None;
        for _ in 0..PIN_ATTEMPTS {
            let pin = io.read_pinning()?;
            if pin.delay_us < self.cfg.best_delay_us {
                return Ok(pin);
            }
            if best.map_or(true, |b| pin.delay_us < b.delay_us) {
                best = Some(pin);
            }
        }
        Ok(best.expect("at least one pinning read"))
    }

    /// One discipline cycle. `now_us` comes from the host's tick source.
    pub fn tick(&mut self, io: &dyn DisciplineIo, now_us: u64) -> Result<()> {
        if let Some(drift) = self.pending_drift_ppb.take() {
            let units = (drift / PPB_PER_UNIT).clamp(-MAX_TRIM_UNITS, MAX_TRIM_UNITS);
            let new_offset = (self.freq_offset - units)
                .clamp(FREQ_OFFSET_RANGE.0, FREQ_OFFSET_RANGE.1);
            info!(
                "discipline: drift {drift:.1} ppb, trim {:.2} -> {new_offset:.2}",
                self.freq_offset
            );
            self.freq_offset = new_offset;
            io.write_trim(new_offset, drift)?;
            if self.trims_left > 0 {
                self.trims_left -= 1;
            }
            // The clock just moved; the old reference is void.
            self.pin = None;
            return Ok(());
        }
        if self.trims_left == 0 || now_us < self.resume_at_us || self.configured_rate == 0 {
            return Ok(());
        }
        let Some(reference) = self.pin else {
            let pin = match self.acquire_pinning(io) {
                Ok(p) => p,
                Err(err) => {
                    warn!("discipline: pinning failed ({err}), postponing");
                    self.postpone(now_us, true);
                    return Ok(());
                }
            };
            if pin.delay_us > self.cfg.max_delay_us {
                debug!(
                    "discipline: pinning delay {} us over budget, postponing",
                    pin.delay_us
                );
                self.postpone(now_us, false);
                return Ok(());
            }
            self.next_measure_us = pin.host_us + self.interval_us(pin.delay_us);
            self.pin = Some(pin);
            return Ok(());
        };
        if now_us < self.next_measure_us {
            return Ok(());
        }
        let pin = match self.acquire_pinning(io) {
            Ok(p) => p,
            Err(err) => {
                warn!("discipline: measurement failed ({err}), postponing");
                self.postpone(now_us, true);
                return Ok(());
            }
        };
        if pin.delay_us > self.cfg.max_delay_us {
            // Too noisy to act on; try again later without touching the
            // reference.
            self.next_measure_us = pin.host_us + self.interval_us(pin.delay_us) / 4;
            return Ok(());
        }
        let dt_us = pin.host_us.saturating_sub(reference.host_us);
        if dt_us == 0 {
            return Ok(());
        }
        let dsamples = pin.samples.wrapping_sub(reference.samples) as f64;
        let rate = dsamples * 1_000_000.0 / dt_us as f64;
        let drift_ppb = 1e9 * (rate / f64::from(self.configured_rate) - 1.0);
        debug!(
            "discipline: rate {rate:.3} Hz vs {} Hz -> {drift_ppb:.1} ppb",
            self.configured_rate
        );
        self.last_drift_ppb = Some(drift_ppb);
        self.pending_drift_ppb = Some(drift_ppb);
        self.next_measure_us = pin.host_us + self.interval_us(pin.delay_us);
        self.pin = Some(pin);
        Ok(())
    }

    /// State rendering for `show freqcal`.
    #[must_use]
    pub fn status(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("freqoffs".to_string(), format!("{:.2}", self.freq_offset)),
            ("trims_left".to_string(), self.trims_left.to_string()),
            (
                "system_accuracy".to_string(),
                self.cfg.system_accuracy_us.to_string(),
            ),
            ("accuracy_ppb".to_string(), self.cfg.accuracy_ppb.to_string()),
        ];
        if let Some(drift) = self.last_drift_ppb {
            out.push(("drift_ppb".to_string(), format!("{drift:.1}")));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use std::cell::RefCell;

    /// Synthetic clock: device counter runs at `rate * (1 + ppb/1e9)`.
    struct FakeIo {
        ppb: RefCell<f64>,
        now_us: RefCell<u64>,
        delay_us: u64,
        trims: RefCell<Vec<(f64, f64)>>,
        fail_reads: RefCell<bool>,
    }

    impl FakeIo {
        fn new(ppb: f64) -> Self {
            Self {
                ppb: RefCell::new(ppb),
                now_us: RefCell::new(1_000_000),
                delay_us: 100,
                trims: RefCell::new(Vec::new()),
                fail_reads: RefCell::new(false),
            }
        }

        fn advance(&self, us: u64) {
            *self.now_us.borrow_mut() += us;
        }
    }

    impl DisciplineIo for FakeIo {
        fn read_pinning(&self) -> Result<Pinning> {
            if *self.fail_reads.borrow() {
                return Err(DeviceError::timeout("read failed"));
            }
            let now = *self.now_us.borrow();
            let rate = 1_000_000.0 * (1.0 + *self.ppb.borrow() / 1e9);
            Ok(Pinning {
                samples: (now as f64 / 1e6 * rate).round() as u64,
                host_us: now,
                delay_us: self.delay_us,
            })
        }

        fn write_trim(&self, offset: f64, drift_ppb: f64) -> Result<()> {
            self.trims.borrow_mut().push((offset, drift_ppb));
            // Trimming cancels the simulated drift proportionally.
            let corrected = (drift_ppb / PPB_PER_UNIT).clamp(-MAX_TRIM_UNITS, MAX_TRIM_UNITS)
                * PPB_PER_UNIT;
            *self.ppb.borrow_mut() -= corrected;
            Ok(())
        }
    }

    /// Default interval is 1e10 us (300 us noise at 30 ppb); step well past
    /// it so every few ticks completes a measure-then-correct cycle.
    fn run_cycles(disc: &mut Discipliner, io: &FakeIo, cycles: u32) {
        for _ in 0..cycles {
            io.advance(6_000_000_000);
            disc.tick(io, *io.now_us.borrow()).expect("tick");
        }
    }

    #[test]
    fn test_positive_drift_lowers_trim() {
        let io = FakeIo::new(200.0);
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.set_configured_rate(1_000_000, 0);
        disc.start(-1, None, 0);
        run_cycles(&mut disc, &io, 30);
        let trims = io.trims.borrow();
        assert!(!trims.is_empty(), "expected at least one correction");
        let (offset, drift) = trims[0];
        assert!(drift > 150.0 && drift < 250.0, "measured {drift}");
        assert!(offset < 128.0);
    }

    #[test]
    fn test_converges_within_five_cycles() {
        let io = FakeIo::new(45.0);
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.set_configured_rate(1_000_000, 0);
        disc.start(-1, None, 0);
        let mut corrections = 0;
        for _ in 0..200 {
            io.advance(6_000_000_000);
            disc.tick(&io, *io.now_us.borrow()).expect("tick");
            let n = io.trims.borrow().len();
            if n > corrections {
                corrections = n;
                if corrections >= 5 {
                    break;
                }
            }
        }
        assert!(
            io.ppb.borrow().abs() <= DisciplineConfig::default().accuracy_ppb as f64,
            "residual drift {} ppb after {corrections} corrections",
            io.ppb.borrow()
        );
    }

    #[test]
    fn test_trims_left_counts_down() {
        let io = FakeIo::new(500.0);
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.set_configured_rate(1_000_000, 0);
        disc.start(2, None, 0);
        run_cycles(&mut disc, &io, 60);
        assert_eq!(disc.trims_left(), 0);
        assert_eq!(io.trims.borrow().len(), 2);
    }

    #[test]
    fn test_forced_drift_applies_once() {
        let io = FakeIo::new(0.0);
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.force_drift(92.77);
        disc.tick(&io, 0).expect("tick");
        let trims = io.trims.borrow();
        assert_eq!(trims.len(), 1);
        assert!((trims[0].0 - 127.0).abs() < 1e-9);
    }

    #[test]
    fn test_read_failure_postpones() {
        let io = FakeIo::new(100.0);
        *io.fail_reads.borrow_mut() = true;
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.set_configured_rate(1_000_000, 0);
        disc.start(-1, None, 0);
        io.advance(2_000_000);
        disc.tick(&io, *io.now_us.borrow()).expect("tick survives");
        assert!(io.trims.borrow().is_empty());
        assert!(disc.active());
    }

    #[test]
    fn test_converges_under_measurement_noise() {
        // Host-time jitter bounded by the configured system accuracy must
        // not keep the loop from settling inside the target band.
        struct NoisyIo {
            inner: FakeIo,
            rng: RefCell<fastrand::Rng>,
        }
        impl DisciplineIo for NoisyIo {
            fn read_pinning(&self) -> Result<Pinning> {
                let mut pin = self.inner.read_pinning()?;
                let noise = self.rng.borrow_mut().i64(-300..=300);
                pin.host_us = pin.host_us.saturating_add_signed(noise);
                Ok(pin)
            }
            fn write_trim(&self, offset: f64, drift_ppb: f64) -> Result<()> {
                self.inner.write_trim(offset, drift_ppb)
            }
        }
        let io = NoisyIo {
            inner: FakeIo::new(38.0),
            rng: RefCell::new(fastrand::Rng::with_seed(7)),
        };
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.set_configured_rate(1_000_000, 0);
        disc.start(-1, None, 0);
        for _ in 0..60 {
            io.inner.advance(6_000_000_000);
            disc.tick(&io, *io.inner.now_us.borrow()).expect("tick");
            if io.inner.trims.borrow().len() >= 5 {
                break;
            }
        }
        assert!(
            io.inner.ppb.borrow().abs() <= DisciplineConfig::default().accuracy_ppb as f64,
            "residual drift {} ppb",
            io.inner.ppb.borrow()
        );
    }

    #[test]
    fn test_clamp_to_max_units() {
        let io = FakeIo::new(5000.0);
        let mut disc = Discipliner::new(DisciplineConfig::default(), 128.0);
        disc.set_configured_rate(1_000_000, 0);
        disc.start(-1, None, 0);
        run_cycles(&mut disc, &io, 30);
        let trims = io.trims.borrow();
        assert!(!trims.is_empty());
        // 5000 ppb wants ~54 units; the first write moves exactly 12.
        assert!((trims[0].0 - (128.0 - MAX_TRIM_UNITS)).abs() < 1e-9);
    }
}
