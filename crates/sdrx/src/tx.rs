// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Transmit path.
//!
//! Callers hand in float IQ with a host-side timestamp; the path energizes
//! to signed 12-bit integers (per-channel power-balance scale, optional
//! amplifier pre-distortion, clamp accounting), groups samples into
//! timestamped frames and submits batches of at least `tx_min_buffers`
//! frames per bulk transfer.
//!
//! Timestamp discipline: frames leave in strictly increasing order, each
//! exactly one frame of samples after the previous. A caller timestamp that
//! disagrees with the running stream position either gets the gap filled
//! with silence (small forward jumps within the configured window) or
//! resets the partial frame and restarts the stream at the new position
//! (logged, rate limited).
//!
//! Between frames the path checks the sync-set-state mailbox; a pending
//! request is surfaced to the device loop with the exact stream timestamp
//! at which the change takes effect.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::capture::CaptureMailbox;
use crate::config::Tunables;
use crate::dsp::Cf32;
use crate::error::{DeviceError, Result};
use crate::frame::{write_header, write_sample, BufLayout, HEADER_LEN};
use crate::state::{balance_scales, TxPattern};
use crate::sync::{SyncRequest, SyncStateMailbox};
use crate::usb::{CancelToken, Endpoint, UsbBackend, BULK_TIMEOUT};

/// Pre-distortion table size; indexed by instantaneous power >> 10.
pub const PREDIST_TABLE_LEN: usize = 4096;

/// Minimum spacing of timestamp-mismatch log lines.
const MISMATCH_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Counters surfaced by `show statistics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxStats {
    /// Samples accepted from callers (or generated by the pattern).
    pub sent_samples: u64,
    /// Sample components clamped at the energize ceiling.
    pub clamped: u64,
    /// Frames submitted to the device.
    pub submitted_frames: u64,
    /// Caller timestamp mismatches that reset the stream.
    pub ts_mismatches: u64,
    /// Silence samples inserted to bridge small forward gaps.
    pub silence_filled: u64,
}

/// Transmit path state. Owned by the device behind the TX serializer.
pub struct TxPath {
    usb: Arc<dyn UsbBackend>,
    cancel: CancelToken,
    capture: Arc<CaptureMailbox>,
    sync_state: Arc<SyncStateMailbox>,
    layout: BufLayout,
    pool: Vec<u8>,
    /// Complete frames waiting in the pool.
    filled_buffers: usize,
    /// Samples filled in the current frame.
    fill_pos: usize,
    /// Timestamp of the next sample to fill.
    next_ts: u64,
    started: bool,
    sample_rate: u32,
    // Scaling state, refreshed per send call.
    power_balance: f64,
    sample_max: i32,
    scale_i: f32,
    scale_q: f32,
    /// Software TX gain correction factor (FPGA images without the block).
    sw_gain_scale: f32,
    predist: Option<Arc<Vec<Cf32>>>,
    pattern: TxPattern,
    pattern_gain: f32,
    pattern_pos: usize,
    silence_window_samples: u64,
    warn_clamped_percent: f32,
    stats: TxStats,
    last_mismatch_log: Option<Instant>,
}

impl TxPath {
    /// Build a path over the transport.
    pub fn new(
        usb: Arc<dyn UsbBackend>,
        cancel: CancelToken,
        capture: Arc<CaptureMailbox>,
        sync_state: Arc<SyncStateMailbox>,
        layout: BufLayout,
    ) -> Self {
        Self {
            pool: vec![0u8; layout.pool_bytes()],
            usb,
            cancel,
            capture,
            sync_state,
            layout,
            filled_buffers: 0,
            fill_pos: 0,
            next_ts: 0,
            started: false,
            sample_rate: 0,
            power_balance: 1.0,
            sample_max: crate::config::DEFAULT_SAMPLE_ENERGIZE,
            scale_i: crate::config::DEFAULT_SAMPLE_ENERGIZE as f32,
            scale_q: crate::config::DEFAULT_SAMPLE_ENERGIZE as f32,
            sw_gain_scale: 1.0,
            predist: None,
            pattern: TxPattern::Off,
            pattern_gain: 1.0,
            pattern_pos: 0,
            silence_window_samples: 0,
            warn_clamped_percent: crate::config::DEFAULT_WARN_CLAMPED_PERCENT,
            stats: TxStats::default(),
            last_mismatch_log: None,
        }
    }

    /// Reallocate for a new buffer layout (sample-rate threshold crossing).
    /// Drops any buffered frames.
    pub fn reconfigure(&mut self, layout: BufLayout, sample_rate: u32) {
        self.layout = layout;
        self.pool = vec![0u8; layout.pool_bytes()];
        self.filled_buffers = 0;
        self.fill_pos = 0;
        self.started = false;
        self.sample_rate = sample_rate;
    }

    /// Pick up runtime tunables (energize ceiling, silence window, warn
    /// threshold). Called by the device once per send with a snapshot.
    pub fn refresh_tunables(&mut self, t: &Tunables) {
        self.sample_max = t.sample_max;
        self.warn_clamped_percent = t.warn_clamped_percent;
        self.silence_window_samples = if self.sample_rate == 0 {
            0
        } else {
            u64::from(t.silence_time_ms) * u64::from(self.sample_rate) / 1000
        };
    }

    /// Set the TX I/Q power balance.
    pub fn set_power_balance(&mut self, balance: f64) {
        self.power_balance = balance;
    }

    /// Current power balance.
    #[must_use]
    pub fn power_balance(&self) -> f64 {
        self.power_balance
    }

    /// Software TX gain correction scale.
    pub fn set_sw_gain_scale(&mut self, scale: f32) {
        self.sw_gain_scale = scale;
    }

    /// Install or remove the amplifier pre-distortion table.
    pub fn set_predist(&mut self, table: Option<Arc<Vec<Cf32>>>) {
        if let Some(t) = &table {
            debug_assert_eq!(t.len(), PREDIST_TABLE_LEN);
        }
        self.predist = table;
    }

    /// Whether pre-distortion is active.
    #[must_use]
    pub fn predist_active(&self) -> bool {
        self.predist.is_some()
    }

    /// Set the transmit pattern.
    pub fn set_pattern(&mut self, pattern: TxPattern, gain: f32) {
        self.pattern = pattern;
        self.pattern_gain = gain;
        self.pattern_pos = 0;
    }

    /// Seed the stream timestamp (reconciler `timestamp` field).
    pub fn seed_timestamp(&mut self, ts: u64) {
        self.next_ts = ts;
        self.started = true;
        self.fill_pos = 0;
        self.filled_buffers = 0;
    }

    /// Timestamp of the next sample the stream will carry.
    #[must_use]
    pub fn stream_pos(&self) -> u64 {
        self.next_ts
    }

    /// Counters.
    #[must_use]
    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Current sample rate (Hz).
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn frame_bytes(&self) -> usize {
        self.layout.frame_bytes()
    }

    fn spb(&self) -> usize {
        self.layout.samples_per_buffer
    }

    /// Reconcile the caller timestamp with the stream position.
    fn align_timestamp(&mut self, ts: u64) -> Result<()> {
        if !self.started {
            self.next_ts = ts;
            self.started = true;
            return Ok(());
        }
        if ts == self.next_ts {
            return Ok(());
        }
        if ts > self.next_ts {
            let gap = ts - self.next_ts;
            if self.silence_window_samples > 0 && gap <= self.silence_window_samples {
                self.stats.silence_filled += gap;
                for _ in 0..gap {
                    self.put_raw(0, 0);
                    if self.frame_boundary() {
                        self.flush_batch()?;
                    }
                }
                return Ok(());
            }
        }
        self.stats.ts_mismatches += 1;
        // Complete frames are still a contiguous run ending before the jump;
        // flush them so a later submission never mixes two timelines.
        self.force_flush()?;
        let now = Instant::now();
        if self
            .last_mismatch_log
            .map_or(true, |t| now.duration_since(t) >= MISMATCH_LOG_INTERVAL)
        {
            debug!(
                "tx: timestamps don't match (caller {ts}, stream {}), restarting",
                self.next_ts
            );
            self.last_mismatch_log = Some(now);
        }
        // Drop the partial frame; complete frames already carry consistent
        // headers and stay queued.
        self.fill_pos = 0;
        self.next_ts = ts;
        Ok(())
    }

    /// Write one energized sample pair into the current frame.
    fn put_raw(&mut self, i: i16, q: i16) {
        if self.fill_pos == 0 {
            let off = self.filled_buffers * self.frame_bytes();
            let ts = self.next_ts;
            write_header(&mut self.pool[off..off + HEADER_LEN], ts);
        }
        let off = self.filled_buffers * self.frame_bytes() + HEADER_LEN;
        let end = off + self.spb() * crate::frame::BYTES_PER_SAMPLE;
        let body = &mut self.pool[off..end];
        write_sample(body, self.fill_pos, i, q);
        self.fill_pos += 1;
        self.next_ts = (self.next_ts + 1) & crate::frame::TIMESTAMP_MASK;
    }

    /// Close out a completed frame; true when one just completed.
    fn frame_boundary(&mut self) -> bool {
        if self.fill_pos < self.spb() {
            return false;
        }
        // Completed frame: hand a copy to a pending capture before it can
        // be submitted.
        if self.capture.is_pending() {
            let off = self.filled_buffers * self.frame_bytes();
            let ts = self.next_ts - self.spb() as u64;
            let body = &self.pool[off + HEADER_LEN..off + self.frame_bytes()];
            let samples: Vec<Cf32> = (0..self.spb())
                .map(|k| {
                    let (i, q) = crate::frame::read_sample(body, k);
                    Cf32::new(f32::from(i) / 2048.0, f32::from(q) / 2048.0)
                })
                .collect();
            self.capture.offer_frame(ts, &samples);
        }
        self.fill_pos = 0;
        self.filled_buffers += 1;
        true
    }

    /// Submit queued frames regardless of the batch minimum.
    pub fn force_flush(&mut self) -> Result<()> {
        if self.filled_buffers == 0 {
            return Ok(());
        }
        let keep = self.layout.tx_min_buffers;
        self.layout.tx_min_buffers = 1;
        let result = self.flush_batch();
        self.layout.tx_min_buffers = keep;
        result
    }

    /// Submit the queued frames once the batch minimum is reached.
    fn flush_batch(&mut self) -> Result<()> {
        if self.filled_buffers < self.layout.tx_min_buffers
            && self.filled_buffers < self.layout.num_buffers
        {
            return Ok(());
        }
        let bytes = self.filled_buffers * self.frame_bytes();
        let sent = self
            .usb
            .bulk_out(Endpoint::TxSamples, &self.pool[..bytes], BULK_TIMEOUT, &self.cancel)
            .map_err(|e| {
                self.started = false; // the stream position is forfeit
                e.wrap("tx submit")
            })?;
        if sent != bytes {
            self.started = false;
            return Err(DeviceError::hardware_io(format!(
                "tx submit: short bulk write ({sent}/{bytes})"
            )));
        }
        self.stats.submitted_frames += self.filled_buffers as u64;
        self.filled_buffers = 0;
        Ok(())
    }

    fn pattern_sample(&mut self) -> Option<Cf32> {
        let s = match &self.pattern {
            TxPattern::Off => return None,
            TxPattern::Zero => Cf32::new(0.0, 0.0),
            TxPattern::Circle => {
                // One turn per eight samples.
                const CIRCLE: [(f32, f32); 8] = {
                    let r = std::f32::consts::FRAC_1_SQRT_2;
                    [
                        (1.0, 0.0),
                        (r, r),
                        (0.0, 1.0),
                        (-r, r),
                        (-1.0, 0.0),
                        (-r, -r),
                        (0.0, -1.0),
                        (r, -r),
                    ]
                };
                let (re, im) = CIRCLE[self.pattern_pos % 8];
                Cf32::new(re, im)
            }
            TxPattern::Vector(v) => {
                if v.is_empty() {
                    Cf32::new(0.0, 0.0)
                } else {
                    v[self.pattern_pos % v.len()]
                }
            }
        };
        self.pattern_pos += 1;
        Some(s * self.pattern_gain)
    }

    /// Feed samples into the stream. Consumes input up to the first frame
    /// boundary at which a sync-set-state request is pending, so the device
    /// loop can apply it at the right stream position. Returns the number
    /// of samples consumed plus the claimed request, if any.
    pub fn send_some(
        &mut self,
        ts: u64,
        iq: &[Cf32],
    ) -> Result<(usize, Option<SyncRequest>)> {
        self.align_timestamp(ts)?;
        let clamped_before = self.stats.clamped;
        let predist = self.predist.clone();
        let mut consumed = 0usize;
        for &sample in iq {
            let x = self.pattern_sample().unwrap_or(sample);
            let xi = x.re * self.scale_i_effective();
            let xq = x.im * self.scale_q_effective();
            let (mut i, mut q) = (xi.round() as i32, xq.round() as i32);
            if let Some(table) = &predist {
                let power = ((i * i + q * q) >> 10).min(PREDIST_TABLE_LEN as i32 - 1);
                let c = table[power as usize];
                let (fi, fq) = (i as f32, q as f32);
                i = (fi * c.re - fq * c.im).round() as i32;
                q = (fi * c.im + fq * c.re).round() as i32;
            }
            if i.abs() > self.sample_max {
                self.stats.clamped += 1;
                i = i.clamp(-self.sample_max, self.sample_max);
            }
            if q.abs() > self.sample_max {
                self.stats.clamped += 1;
                q = q.clamp(-self.sample_max, self.sample_max);
            }
            self.put_raw(i as i16, q as i16);
            self.stats.sent_samples += 1;
            consumed += 1;
            if self.frame_boundary() {
                self.flush_batch()?;
                if self.sync_state.is_pending() {
                    let req = self.sync_state.take();
                    self.warn_clamped(iq.len(), clamped_before);
                    return Ok((consumed, req));
                }
            }
        }
        self.warn_clamped(iq.len(), clamped_before);
        Ok((consumed, None))
    }

    /// Refresh the per-buffer scale factors from balance and ceiling.
    pub fn refresh_scales(&mut self) {
        let (bi, bq) = balance_scales(self.power_balance);
        self.scale_i = bi * self.sample_max as f32;
        self.scale_q = bq * self.sample_max as f32;
    }

    fn scale_i_effective(&self) -> f32 {
        self.scale_i * self.sw_gain_scale
    }

    fn scale_q_effective(&self) -> f32 {
        self.scale_q * self.sw_gain_scale
    }

    fn warn_clamped(&self, sent: usize, clamped_before: u64) {
        if sent == 0 || self.warn_clamped_percent <= 0.0 {
            return;
        }
        let clamped = self.stats.clamped - clamped_before;
        let percent = clamped as f32 * 100.0 / (sent as f32 * 2.0);
        if percent > self.warn_clamped_percent {
            warn!(
                "tx: {clamped} of {} sample components clamped ({percent:.1}% > {}%)",
                sent * 2,
                self.warn_clamped_percent
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::mock::MockBoard;
    use crate::usb::UsbSpeed;

    fn path(board: &Arc<MockBoard>) -> TxPath {
        let layout = BufLayout::derive(UsbSpeed::High, 2048, 2);
        TxPath::new(
            board.clone() as Arc<dyn UsbBackend>,
            CancelToken::new(),
            Arc::new(CaptureMailbox::new()),
            Arc::new(SyncStateMailbox::new()),
            layout,
        )
    }

    fn unit_samples(n: usize) -> Vec<Cf32> {
        vec![Cf32::new(0.5, -0.25); n]
    }

    #[test]
    fn test_frames_contiguous_timestamps() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut tx = path(&board);
        tx.refresh_scales();
        let (n, sync) = tx.send_some(1000, &unit_samples(252 * 4)).expect("send");
        assert_eq!(n, 252 * 4);
        assert!(sync.is_none());
        let frames = board.tx_frames();
        assert_eq!(frames.len(), 4);
        for (k, f) in frames.iter().enumerate() {
            assert_eq!(f.ts, 1000 + (k as u64) * 252);
        }
    }

    #[test]
    fn test_energize_scale_and_clamp() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut tx = path(&board);
        tx.refresh_scales();
        let mut iq = vec![Cf32::new(1.0, -1.0); 252];
        iq[0] = Cf32::new(2.0, 0.0); // clamps on I
        let _ = tx.send_some(0, &iq).expect("send");
        let frames = board.tx_frames();
        assert_eq!(frames.len(), 0); // below min batch of 2
        let _ = tx.send_some(252, &iq).expect("send");
        let frames = board.tx_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].iq[0], (2047, 0));
        assert_eq!(frames[0].iq[1], (2047, -2047));
        assert_eq!(tx.stats().clamped, 2);
        for f in &frames {
            for &(i, q) in &f.iq {
                assert!(i.abs() <= 2047 && q.abs() <= 2047);
            }
        }
    }

    #[test]
    fn test_timestamp_jump_resets_partial() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut tx = path(&board);
        tx.refresh_scales();
        // Half a frame, then a jump: the partial must never reach the wire.
        let _ = tx.send_some(0, &unit_samples(126)).expect("send");
        let _ = tx.send_some(5000, &unit_samples(252 * 2)).expect("send");
        let frames = board.tx_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].ts, 5000);
        assert_eq!(frames[1].ts, 5252);
        assert_eq!(tx.stats().ts_mismatches, 1);
    }

    #[test]
    fn test_power_balance_shapes_channels() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut tx = path(&board);
        tx.set_power_balance(0.5);
        tx.refresh_scales();
        let _ = tx.send_some(0, &vec![Cf32::new(1.0, 1.0); 504]).expect("send");
        let frames = board.tx_frames();
        let (i, q) = frames[0].iq[0];
        assert_eq!(i, (0.5f32 * 2047.0).round() as i16);
        assert_eq!(q, 2047);
    }

    #[test]
    fn test_pattern_overrides_caller_iq() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let mut tx = path(&board);
        tx.refresh_scales();
        tx.set_pattern(TxPattern::Zero, 1.0);
        let _ = tx.send_some(0, &unit_samples(504)).expect("send");
        for f in board.tx_frames() {
            assert!(f.iq.iter().all(|&(i, q)| i == 0 && q == 0));
        }
    }

    #[test]
    fn test_sync_request_surfaces_at_boundary() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let sync = Arc::new(SyncStateMailbox::new());
        let layout = BufLayout::derive(UsbSpeed::High, 2048, 2);
        let mut tx = TxPath::new(
            board.clone() as Arc<dyn UsbBackend>,
            CancelToken::new(),
            Arc::new(CaptureMailbox::new()),
            sync.clone(),
            layout,
        );
        tx.refresh_scales();
        let _rx = sync.deposit(crate::state::DevState::default()).expect("deposit");
        let (consumed, req) = tx.send_some(0, &unit_samples(252 * 3)).expect("send");
        // Stops at the first frame boundary with the request in hand.
        assert_eq!(consumed, 252);
        assert!(req.is_some());
        assert_eq!(tx.stream_pos(), 252);
    }
}
