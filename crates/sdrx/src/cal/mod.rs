// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Calibration orchestration.
//!
//! Two phases: the transceiver's on-chip auto-calibration ([`lms`]) and the
//! baseband calibration of TX LO leakage and IQ imbalance ([`baseband`]),
//! preceded by a loopback self-check ([`loopcheck`]). Amplifier
//! pre-distortion ([`predist`]) is a separate, operator-triggered sweep.
//!
//! Calibration is mutually exclusive with normal I/O: entering pauses the
//! streaming workers, leaving resumes them. The calibration thread owns its
//! working data; device state touched along the way (loopback, RX tuning,
//! TX pattern) is restored afterwards, while the calibration results
//! themselves (TX DC offsets, FPGA phase/gain) stay applied.

pub mod baseband;
pub mod lms;
pub mod loopcheck;
pub mod predist;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{info, warn};

use crate::device::Device;
use crate::dsp::Cf32;
use crate::error::{DeviceError, Result};
use crate::events::EventKind;
use crate::state::common_changed;

/// Cooperative calibration control shared with the control-message surface.
#[derive(Default)]
pub struct CalControl {
    running: AtomicBool,
    stop: AtomicBool,
    abort: AtomicBool,
}

impl CalControl {
    /// Fresh control block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a run started; fails when one is already in progress.
    pub fn begin(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(DeviceError::failure("calibration already running"));
        }
        self.stop.store(false, Ordering::Release);
        self.abort.store(false, Ordering::Release);
        Ok(())
    }

    /// Mark the run finished.
    pub fn end(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Whether a run is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request a stop: graceful between stages, or `abort` mid-stage.
    pub fn request_stop(&self, abort: bool) {
        self.stop.store(true, Ordering::Release);
        if abort {
            self.abort.store(true, Ordering::Release);
        }
    }

    /// Graceful-stop check between stages.
    pub fn check_stop(&self) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            Err(DeviceError::cancelled("calibration stopped"))
        } else {
            Ok(())
        }
    }

    /// Abort check inside stages (per measurement point).
    pub fn check_abort(&self) -> Result<()> {
        if self.abort.load(Ordering::Acquire) {
            Err(DeviceError::cancelled("calibration aborted"))
        } else {
            Ok(())
        }
    }
}

/// Results of a full calibration run.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalReport {
    /// TX DC offset, I branch.
    pub tx_dc_i: i32,
    /// TX DC offset, Q branch.
    pub tx_dc_q: i32,
    /// FPGA TX phase correction.
    pub tx_phase: i32,
    /// FPGA TX gain correction.
    pub tx_gain: i32,
}

impl CalReport {
    /// `key=value` parameters for the `Calibrated` notification.
    #[must_use]
    pub fn params(&self) -> Vec<(String, String)> {
        vec![
            ("txdci".into(), self.tx_dc_i.to_string()),
            ("txdcq".into(), self.tx_dc_q.to_string()),
            ("txfpgaphase".into(), self.tx_phase.to_string()),
            ("txfpgagain".into(), self.tx_gain.to_string()),
        ]
    }
}

impl Device {
    /// Full calibration on the calling thread: on-chip auto-cal, loopback
    /// check, baseband DC and imbalance rounds.
    pub fn calibrate(self: &Arc<Self>) -> Result<CalReport> {
        self.ensure_initialized()?;
        self.cal.begin()?;
        self.pause_streaming();
        let saved = self.applied_state();
        let result = self.calibrate_inner();
        // Restore what calibration moved, but keep its results: the saved
        // snapshot is replayed with the fresh TX corrections grafted in.
        let mut restore = saved;
        {
            let now = self.applied_state();
            restore.tx.dc_offset_i = now.tx.dc_offset_i;
            restore.tx.dc_offset_q = now.tx.dc_offset_q;
            restore.tx.fpga_corr_phase = now.tx.fpga_corr_phase;
            restore.tx.fpga_corr_gain = now.tx.fpga_corr_gain;
        }
        restore.mark_all_changed();
        restore.changed_common &= !common_changed::ABORT_ON_FAIL;
        if let Err(err) = self.set_state(&restore) {
            warn!("calibration: state restore incomplete: {err}");
        }
        self.resume_streaming();
        self.cal.end();
        match &result {
            Ok(report) => {
                info!(
                    "calibrated '{}': dc=({}, {}), corr=({}, {})",
                    self.serial, report.tx_dc_i, report.tx_dc_q, report.tx_phase, report.tx_gain
                );
                self.notify(EventKind::Calibrated, report.params());
            }
            Err(err) => {
                self.notify(
                    EventKind::Failure,
                    vec![("error".into(), format!("calibration: {err}"))],
                );
            }
        }
        result
    }

    fn calibrate_inner(self: &Arc<Self>) -> Result<CalReport> {
        let ctl = self.cal.clone();
        lms::lms_autocal(self, &ctl)?;
        ctl.check_stop()?;
        baseband::full_baseband_cal(self, &ctl)
    }

    /// Spawn [`Self::calibrate`] on its own thread.
    pub fn calibrate_async(self: &Arc<Self>) -> Result<()> {
        self.ensure_initialized()?;
        if self.cal.is_running() {
            return Err(DeviceError::failure("calibration already running"));
        }
        let dev = self.clone();
        thread::Builder::new()
            .name(format!("sdrx-cal-{}", self.serial))
            .spawn(move || {
                if let Err(err) = dev.calibrate() {
                    warn!("calibration thread: {err}");
                }
            })
            .map_err(|e| DeviceError::failure(format!("spawn calibration thread: {e}")))?;
        Ok(())
    }
}

/// Pump TX (pattern) and RX until a requested RX capture completes. The
/// streaming workers are paused during calibration, so the calibration
/// thread moves the data itself.
pub(crate) fn capture_pumped_rx(
    dev: &Arc<Device>,
    pump: &mut RxPump,
    ts: u64,
    samples: usize,
) -> Result<crate::capture::Capture> {
    let rx_done = dev.rx_capture.request(ts, samples)?;
    let deadline = std::time::Instant::now() + crate::capture::capture_timeout(samples) * 4;
    let silence = vec![Cf32::default(); 1024];
    let mut scratch = vec![Cf32::default(); 1024];
    loop {
        let t = dev.tx.lock().stream_pos();
        dev.sync_tx(t, &silence)?;
        let n = dev.sync_rx(pump.pos, &mut scratch)?;
        pump.pos += n as u64;
        match rx_done.try_recv() {
            Ok(result) => return result,
            Err(crossbeam::channel::TryRecvError::Empty) => {}
            Err(crossbeam::channel::TryRecvError::Disconnected) => {
                return Err(DeviceError::cancelled("capture abandoned"));
            }
        }
        if std::time::Instant::now() >= deadline {
            dev.rx_capture.cancel();
            return Err(DeviceError::timeout(format!(
                "calibration capture at {ts} ({samples} samples)"
            )));
        }
    }
}

/// Calibration-side RX pump position.
#[derive(Debug, Default)]
pub(crate) struct RxPump {
    /// Caller-timeline position handed to `sync_rx`.
    pub pos: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cal_control_exclusive() {
        let ctl = CalControl::new();
        ctl.begin().expect("first");
        assert!(ctl.begin().is_err());
        ctl.end();
        ctl.begin().expect("after end");
    }

    #[test]
    fn test_stop_and_abort_flags() {
        let ctl = CalControl::new();
        ctl.begin().expect("begin");
        assert!(ctl.check_stop().is_ok());
        ctl.request_stop(false);
        assert!(ctl.check_stop().is_err());
        assert!(ctl.check_abort().is_ok());
        ctl.request_stop(true);
        assert!(ctl.check_abort().is_err());
        // begin() clears both.
        ctl.end();
        ctl.begin().expect("again");
        assert!(ctl.check_stop().is_ok());
        assert!(ctl.check_abort().is_ok());
    }
}
