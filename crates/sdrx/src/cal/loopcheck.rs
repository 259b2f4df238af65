// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Loopback path self-check.
//!
//! Before the baseband sweeps can mean anything, the probe tone must
//! actually make it around the RF loopback. With the round already set up
//! (loopback routed, probe on the TX pattern), a handful of buffers are
//! captured and each must carry the probe as its dominant component:
//! `0.5 * total < test <= total`. A few bad buffers are tolerated; more
//! fail the path.

use std::sync::Arc;

use log::{debug, info};

use super::baseband::{tone_freqs, BbKind};
use super::{capture_pumped_rx, CalControl, RxPump};
use crate::device::Device;
use crate::dsp::{correlate_energy, tone, total_energy};
use crate::error::{DeviceError, Result};
use crate::frame::samples_per_buffer;

/// Buffers inspected.
const CHECK_BUFFERS: u32 = 8;

/// Bad buffers tolerated.
const ALLOWED_FAILURES: u32 = 2;

/// Verify the routed loopback path carries the probe tone. The round
/// (loopback, tuning, TX pattern) must already be set up.
pub fn verify_loopback(dev: &Arc<Device>, ctl: &CalControl) -> Result<()> {
    let spb = samples_per_buffer(dev.speed());
    let (_, w_test) = tone_freqs(BbKind::DcOffset);
    let detector = tone(-w_test, spb);
    let mut pump = RxPump::default();
    let mut failures = 0u32;
    for buffer in 0..CHECK_BUFFERS {
        ctl.check_abort()?;
        let ts = dev.tx.lock().stream_pos() + spb as u64;
        let capture = capture_pumped_rx(dev, &mut pump, ts, spb)?;
        let test = correlate_energy(&detector, &capture.samples);
        let total = total_energy(&capture.samples);
        let ok = total > 0.0 && test > 0.5 * total && test <= total;
        debug!("loopcheck buffer {buffer}: test/total {:.3}", test / total.max(1e-12));
        if !ok {
            failures += 1;
            if failures > ALLOWED_FAILURES {
                return Err(DeviceError::failure(format!(
                    "loopback verification failed ({failures} of {} buffers bad)",
                    buffer + 1
                )));
            }
        }
    }
    info!("loopcheck: path verified ({failures} bad buffers tolerated)");
    Ok(())
}
