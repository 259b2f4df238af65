// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Receive path.
//!
//! Pulls bulk frames, validates timestamps and reconciles the device stream
//! against the caller's timeline:
//!
//! - device ahead of the caller: leading zeros fill the difference;
//! - device behind by less than the configured past window: stale samples
//!   are discarded;
//! - behind by more: the read fails ("too much data in past"), or returns
//!   short if some data was already produced so the caller can correct its
//!   timestamps.
//!
//! Stream-side forward jumps up to [`RESYNC_JUMP_MAX`] samples (or matching
//! a previously stored resync candidate) are accepted quietly; larger jumps
//! record a candidate and follow the device.
//!
//! After each bulk read the path fixes endianness, feeds any pending
//! capture, optionally applies scripted alterations (tests), and runs the
//! running DC-offset autocorrection (see [`RxPath::autocorrect_dc`]).

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info};

use crate::capture::CaptureMailbox;
use crate::config::Tunables;
use crate::dsp::Cf32;
use crate::error::{DeviceError, Result};
use crate::frame::{parse_header, read_sample, BufLayout, HEADER_LEN};
use crate::state::Direction;
use crate::usb::{CancelToken, Endpoint, UsbBackend, BULK_TIMEOUT};
use crate::xcvr::{IqBranch, Xcvr, RX_DC_RANGE};

/// Forward stream jumps up to this many samples are accepted silently.
pub const RESYNC_JUMP_MAX: u64 = 1000;

/// Fixed RX sample scale (12-bit full scale to unit floats).
pub const RX_SCALE: f32 = 1.0 / 2048.0;

/// EMA damping divisor for the DC averages.
const DC_AVG_DAMPING: f64 = 1024.0;

/// Scripted alteration hook for tests: `(frame_ts, samples)`.
pub type AlterHook = Box<dyn FnMut(u64, &mut [(i16, i16)]) + Send>;

/// Counters surfaced by `show statistics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxStats {
    /// Samples delivered to callers.
    pub received_samples: u64,
    /// Zero samples inserted ahead of device data.
    pub padded_zeros: u64,
    /// Stale device samples discarded.
    pub discarded_past: u64,
    /// Accepted stream timestamp jumps.
    pub resyncs: u64,
    /// DC autocorrection register steps.
    pub dc_steps: u64,
}

struct RxFrame {
    ts: u64,
    iq: Vec<(i16, i16)>,
    consumed: usize,
}

impl RxFrame {
    fn remaining(&self) -> usize {
        self.iq.len() - self.consumed
    }
}

/// Receive path state. Owned by the device behind the RX serializer.
pub struct RxPath {
    usb: Arc<dyn UsbBackend>,
    cancel: CancelToken,
    capture: Arc<CaptureMailbox>,
    xcvr: Arc<Xcvr>,
    layout: BufLayout,
    queue: VecDeque<RxFrame>,
    cur: Option<RxFrame>,
    /// Expected timestamp of the next device sample.
    next_ts: u64,
    started: bool,
    resync_candidate: Option<u64>,
    sample_rate: u32,
    // Tunables snapshot.
    past_interval_ms: u32,
    dc_auto: bool,
    dc_showinfo: bool,
    // DC autocorrection state.
    dc_avg_i: f64,
    dc_avg_q: f64,
    dc_offset_i: i32,
    dc_offset_q: i32,
    rx_vga2: i32,
    dc_debug_count: i32,
    alter: Option<AlterHook>,
    stats: RxStats,
}

impl RxPath {
    /// Build a path over the transport.
    pub fn new(
        usb: Arc<dyn UsbBackend>,
        cancel: CancelToken,
        capture: Arc<CaptureMailbox>,
        xcvr: Arc<Xcvr>,
        layout: BufLayout,
    ) -> Self {
        Self {
            usb,
            cancel,
            capture,
            xcvr,
            layout,
            queue: VecDeque::new(),
            cur: None,
            next_ts: 0,
            started: false,
            resync_candidate: None,
            sample_rate: 0,
            past_interval_ms: crate::config::DEFAULT_RX_PAST_INTERVAL_MS,
            dc_auto: true,
            dc_showinfo: false,
            dc_avg_i: 0.0,
            dc_avg_q: 0.0,
            dc_offset_i: 0,
            dc_offset_q: 0,
            rx_vga2: 0,
            dc_debug_count: 0,
            alter: None,
            stats: RxStats::default(),
        }
    }

    /// Reallocate for a new layout; drops buffered frames.
    pub fn reconfigure(&mut self, layout: BufLayout, sample_rate: u32) {
        self.layout = layout;
        self.queue.clear();
        self.cur = None;
        self.started = false;
        self.sample_rate = sample_rate;
    }

    /// Pick up runtime tunables.
    pub fn refresh_tunables(&mut self, t: &Tunables) {
        self.past_interval_ms = t.rx_past_interval_ms;
        self.dc_auto = t.rx_dc_autocorrect;
        self.dc_showinfo = t.rx_dc_showinfo;
    }

    /// Disable DC autocorrection (sticky, after a manual offset write).
    pub fn disable_dc_auto(&mut self) {
        self.dc_auto = false;
    }

    /// Whether autocorrection is currently on.
    #[must_use]
    pub fn dc_auto(&self) -> bool {
        self.dc_auto
    }

    /// Mirror the applied RX DC offsets (reconciler keeps this current).
    pub fn set_dc_mirror(&mut self, branch: IqBranch, value: i32) {
        match branch {
            IqBranch::I => self.dc_offset_i = value,
            IqBranch::Q => self.dc_offset_q = value,
        }
    }

    /// Mirror the applied RX VGA2 gain (drives the DC threshold).
    pub fn set_vga2_mirror(&mut self, gain: i32) {
        self.rx_vga2 = gain;
    }

    /// Arm the DC min/max info printer for `n` read windows.
    pub fn set_dc_debug_count(&mut self, n: i32) {
        self.dc_debug_count = n;
    }

    /// Install a scripted data alteration (tests).
    pub fn set_alter_hook(&mut self, hook: Option<AlterHook>) {
        self.alter = hook;
    }

    /// Seed the stream timestamp (reconciler `timestamp` field).
    pub fn seed_timestamp(&mut self, ts: u64) {
        self.next_ts = ts;
        self.started = true;
        self.queue.clear();
        self.cur = None;
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> RxStats {
        self.stats
    }

    /// Expected timestamp of the next device sample.
    #[must_use]
    pub fn stream_pos(&self) -> u64 {
        self.next_ts
    }

    /// Current sample rate (Hz).
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn past_threshold_samples(&self) -> u64 {
        let by_rate =
            u64::from(self.past_interval_ms) * u64::from(self.sample_rate.max(1000)) / 1000;
        by_rate.max(self.layout.samples_per_buffer as u64)
    }

    /// One bulk read: parse, alter, capture, DC statistics, queue.
    fn fill_queue(&mut self) -> Result<()> {
        let flen = self.layout.frame_bytes();
        let mut raw = vec![0u8; flen * self.layout.num_buffers];
        let got = self
            .usb
            .bulk_in(Endpoint::RxSamples, &mut raw, BULK_TIMEOUT, &self.cancel)
            .map_err(|e| {
                let e = e.wrap("rx read");
                self.capture.fail(&e);
                e
            })?;
        if got == 0 || got % flen != 0 {
            let err = DeviceError::hardware_io(format!(
                "rx read: {got} bytes is not a whole number of frames"
            ));
            self.capture.fail(&err);
            return Err(err);
        }
        let spb = self.layout.samples_per_buffer;
        let mut sum_i = 0i64;
        let mut sum_q = 0i64;
        let mut min_i = i16::MAX;
        let mut max_i = i16::MIN;
        let mut total = 0usize;
        for chunk in raw[..got].chunks(flen) {
            let ts = parse_header(chunk)?;
            let body = &chunk[HEADER_LEN..];
            let mut iq: Vec<(i16, i16)> = (0..spb).map(|k| read_sample(body, k)).collect();
            if let Some(alter) = self.alter.as_mut() {
                alter(ts, &mut iq);
            }
            if self.capture.is_pending() {
                let scaled: Vec<Cf32> = iq
                    .iter()
                    .map(|&(i, q)| Cf32::new(f32::from(i) * RX_SCALE, f32::from(q) * RX_SCALE))
                    .collect();
                self.capture.offer_frame(ts, &scaled);
            }
            for &(i, q) in &iq {
                sum_i += i64::from(i);
                sum_q += i64::from(q);
                min_i = min_i.min(i);
                max_i = max_i.max(i);
            }
            total += iq.len();
            self.queue.push_back(RxFrame { ts, iq, consumed: 0 });
        }
        if total > 0 {
            self.update_dc(sum_i as f64 / total as f64, sum_q as f64 / total as f64)?;
            if self.dc_showinfo && self.dc_debug_count > 0 {
                self.dc_debug_count -= 1;
                info!(
                    "rx dc: avg I {:.1} Q {:.1}, window I [{min_i}, {max_i}]",
                    self.dc_avg_i, self.dc_avg_q
                );
            }
        }
        Ok(())
    }

    /// Running DC autocorrection: move the EMA, and when it exceeds the
    /// VGA2-derived threshold step the offset register one count toward
    /// zero. A manual offset write turns the loop off (reconciler calls
    /// [`Self::disable_dc_auto`]).
    fn update_dc(&mut self, mean_i: f64, mean_q: f64) -> Result<()> {
        self.dc_avg_i += (mean_i - self.dc_avg_i) / DC_AVG_DAMPING;
        self.dc_avg_q += (mean_q - self.dc_avg_q) / DC_AVG_DAMPING;
        if !self.dc_auto {
            return Ok(());
        }
        let threshold = 1.5 * f64::from(self.rx_vga2) + 10.0;
        for (avg, branch) in [(self.dc_avg_i, IqBranch::I), (self.dc_avg_q, IqBranch::Q)] {
            if avg.abs() <= threshold {
                continue;
            }
            let cur = match branch {
                IqBranch::I => self.dc_offset_i,
                IqBranch::Q => self.dc_offset_q,
            };
            let step = if avg > 0.0 { -1 } else { 1 };
            let new = (cur + step).clamp(RX_DC_RANGE.0, RX_DC_RANGE.1);
            if new == cur {
                continue;
            }
            self.xcvr.set_dc_offset(Direction::Rx, branch, new)?;
            self.set_dc_mirror(branch, new);
            self.stats.dc_steps += 1;
            debug!(
                "rx dc: avg {avg:.1} over threshold {threshold:.1}, offset {} -> {new}",
                cur
            );
        }
        Ok(())
    }

    /// Track stream continuity when a new frame becomes current.
    fn accept_frame(&mut self, f: RxFrame) {
        if self.started && f.ts != self.next_ts {
            if f.ts > self.next_ts {
                let jump = f.ts - self.next_ts;
                if jump <= RESYNC_JUMP_MAX || Some(f.ts) == self.resync_candidate {
                    info!("rx: stream jumped {} -> {} ({jump} samples)", self.next_ts, f.ts);
                    self.stats.resyncs += 1;
                    self.resync_candidate = None;
                } else {
                    debug!(
                        "rx: large jump {} -> {}, storing resync candidate",
                        self.next_ts, f.ts
                    );
                    self.resync_candidate = Some(f.ts + self.layout.samples_per_buffer as u64);
                }
            } else {
                debug!("rx: stream went backwards {} -> {}", self.next_ts, f.ts);
            }
        }
        self.next_ts = f.ts;
        self.started = true;
        self.cur = Some(f);
    }

    /// Read `out.len()` samples for caller timeline position `ts`. Returns
    /// the number of samples produced (short on a past-threshold stop with
    /// partial data).
    pub fn recv(&mut self, ts: u64, out: &mut [Cf32]) -> Result<usize> {
        let threshold = self.past_threshold_samples();
        let mut produced = 0usize;
        while produced < out.len() {
            if self.cur.as_ref().map_or(true, |f| f.remaining() == 0) {
                match self.queue.pop_front() {
                    Some(f) => {
                        self.accept_frame(f);
                    }
                    None => {
                        self.fill_queue()?;
                        continue;
                    }
                }
            }
            let want = ts + produced as u64;
            let cur = self.cur.as_mut().expect("current frame");
            let cur_ts = cur.ts + cur.consumed as u64;
            if cur_ts > want {
                // Device ahead: the caller's missing past is zeros.
                let gap = (cur_ts - want).min((out.len() - produced) as u64) as usize;
                out[produced..produced + gap].fill(Cf32::default());
                produced += gap;
                self.stats.padded_zeros += gap as u64;
                continue;
            }
            if want > cur_ts {
                let behind = want - cur_ts;
                if behind > threshold {
                    if produced > 0 {
                        break; // short read; caller corrects its timestamps
                    }
                    return Err(DeviceError::failure(format!(
                        "too much data in past ({behind} samples behind caller)"
                    )));
                }
                let skip = (behind as usize).min(cur.remaining());
                cur.consumed += skip;
                self.next_ts = cur.ts + cur.consumed as u64;
                self.stats.discarded_past += skip as u64;
                continue;
            }
            let n = cur.remaining().min(out.len() - produced);
            for k in 0..n {
                let (i, q) = cur.iq[cur.consumed + k];
                out[produced + k] = Cf32::new(f32::from(i) * RX_SCALE, f32::from(q) * RX_SCALE);
            }
            cur.consumed += n;
            produced += n;
            self.next_ts = cur.ts + cur.consumed as u64;
            self.stats.received_samples += n as u64;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::periph::PeriphBus;
    use crate::usb::mock::MockBoard;
    use crate::usb::UsbSpeed;

    fn path(board: &Arc<MockBoard>) -> RxPath {
        let usb: Arc<dyn UsbBackend> = board.clone();
        let bus = Arc::new(PeriphBus::new(usb.clone(), CancelToken::new(), Default::default()));
        let mut rx = RxPath::new(
            usb,
            CancelToken::new(),
            Arc::new(CaptureMailbox::new()),
            Arc::new(Xcvr::new(bus)),
            BufLayout::derive(UsbSpeed::High, 2048, 2),
        );
        rx.sample_rate = 1_000_000;
        rx
    }

    #[test]
    fn test_aligned_read() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        board.with_state(|st| st.rx_next_ts = 500);
        let mut rx = path(&board);
        let mut out = vec![Cf32::default(); 300];
        let n = rx.recv(500, &mut out).expect("recv");
        assert_eq!(n, 300);
    }

    #[test]
    fn test_leading_zeros_when_device_ahead() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        board.with_state(|st| st.rx_next_ts = 1000);
        board.set_rx_generator(Box::new(|_, _, n| vec![(100i16, 0i16); n]));
        let mut rx = path(&board);
        let mut out = vec![Cf32::default(); 1100];
        let n = rx.recv(900, &mut out).expect("recv");
        assert_eq!(n, 1100);
        // First 100 samples are zero padding, then device data.
        assert!(out[..100].iter().all(|s| s.re == 0.0));
        assert!((out[100].re - 100.0 * RX_SCALE).abs() < 1e-6);
    }

    #[test]
    fn test_discard_behind_caller() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut rx = path(&board);
        // Device starts at 0, caller asks at 300: up to one threshold of
        // stale data is discarded.
        let mut out = vec![Cf32::default(); 252];
        let n = rx.recv(300, &mut out).expect("recv");
        assert_eq!(n, 252);
        assert_eq!(rx.stats().discarded_past, 300);
    }

    #[test]
    fn test_too_much_past_fails() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut rx = path(&board);
        rx.past_interval_ms = 50;
        rx.sample_rate = 1_000_000; // threshold = 50_000 samples
        let mut out = vec![Cf32::default(); 10];
        let err = rx.recv(100_000, &mut out).expect_err("too far past");
        assert!(err.context.contains("too much data in past"));
    }

    #[test]
    fn test_stream_jump_accepted() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        board.with_state(|st| {
            st.rx_ts_script.extend([0u64, 252, 1000, 1252]);
            st.rx_next_ts = 1504;
        });
        let mut rx = path(&board);
        let mut out = vec![Cf32::default(); 252 * 2];
        let n = rx.recv(0, &mut out).expect("first");
        assert_eq!(n, 504);
        // Jump 504 -> 1000 is under the resync limit: accepted.
        let n = rx.recv(504, &mut out).expect("second");
        assert_eq!(n, 504);
        assert_eq!(rx.stats().resyncs, 1);
        assert_eq!(rx.stats().padded_zeros, 496);
    }

    #[test]
    fn test_dc_autocorrect_steps_toward_zero() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        board.set_rx_generator(Box::new(|_, _, n| vec![(400i16, -400i16); n]));
        let mut rx = path(&board);
        rx.set_vga2_mirror(10); // threshold = 25
        let mut out = vec![Cf32::default(); 252 * 64];
        // Enough reads for the EMA to clear the threshold and step.
        for k in 0..40 {
            let _ = rx.recv((k * out.len()) as u64, &mut out).expect("recv");
        }
        assert!(rx.stats().dc_steps > 0);
        assert!(rx.dc_offset_i < 0, "positive DC steps the offset down");
        assert!(rx.dc_offset_q > 0);
    }
}
