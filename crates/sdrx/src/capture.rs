// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Sample capture mailbox.
//!
//! Debug and calibration callers request a window of the live stream:
//! `capture(direction, n, ts)`. The corresponding I/O path offers every
//! frame it moves; frames overlapping the window are copied in, possibly
//! across several frames, and the caller is woken when the buffer is full.
//! At most one capture per direction may be pending.
//!
//! A frame that starts past the current write position restarts the capture
//! at that frame's timestamp - captured data is always contiguous, never
//! zero-padded.

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::debug;
use parking_lot::Mutex;

use crate::dsp::Cf32;
use crate::error::{DeviceError, Result};

/// Completed capture: first captured timestamp plus the samples.
#[derive(Debug, Clone)]
pub struct Capture {
    /// Timestamp of `samples[0]`.
    pub ts: u64,
    /// Captured IQ, unit scale.
    pub samples: Vec<Cf32>,
}

struct PendingCapture {
    /// Requested window start.
    want_ts: u64,
    /// Timestamp of the next sample to capture (window start, then moving).
    cur_ts: u64,
    /// Timestamp of the first sample actually captured.
    first_ts: u64,
    buf: Vec<Cf32>,
    target: usize,
    reply: Sender<Result<Capture>>,
}

/// One-shot capture slot for one direction.
#[derive(Default)]
pub struct CaptureMailbox {
    slot: Mutex<Option<PendingCapture>>,
}

/// Capture wait budget: 20 ms per started thousand samples.
#[must_use]
pub fn capture_timeout(samples: usize) -> std::time::Duration {
    std::time::Duration::from_millis(20 * samples.div_ceil(1000) as u64)
}

impl CaptureMailbox {
    /// Empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capture of `samples` starting at `ts`. Fails with
    /// `Pending` while another capture is outstanding. Returns the channel
    /// the result arrives on.
    pub fn request(&self, ts: u64, samples: usize) -> Result<Receiver<Result<Capture>>> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(DeviceError::new(
                crate::error::ErrorKind::Pending,
                "duplicate capture",
            ));
        }
        let (reply, rx) = bounded(1);
        *slot = Some(PendingCapture {
            want_ts: ts,
            cur_ts: ts,
            first_ts: ts,
            buf: Vec::with_capacity(samples),
            target: samples,
            reply,
        });
        Ok(rx)
    }

    /// Blocking capture: register, wait for the I/O path, time out after
    /// [`capture_timeout`].
    pub fn capture(&self, ts: u64, samples: usize) -> Result<Capture> {
        let rx = self.request(ts, samples)?;
        match rx.recv_timeout(capture_timeout(samples)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.cancel();
                Err(DeviceError::timeout(format!(
                    "capture of {samples} samples at {ts} timed out"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(DeviceError::cancelled("capture abandoned"))
            }
        }
    }

    /// Abandon a pending capture (timeout or shutdown).
    pub fn cancel(&self) {
        self.slot.lock().take();
    }

    /// Whether a capture is pending.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Report a stream error to a pending requester.
    pub fn fail(&self, err: &DeviceError) {
        if let Some(pending) = self.slot.lock().take() {
            let _ = pending.reply.send(Err(err.clone()));
        }
    }

    /// Offer one frame of the live stream. Called by the I/O path with the
    /// frame timestamp and unit-scale samples.
    pub fn offer_frame(&self, frame_ts: u64, samples: &[Cf32]) {
        let mut slot = self.slot.lock();
        let Some(pending) = slot.as_mut() else {
            return;
        };
        let frame_end = frame_ts + samples.len() as u64;
        if frame_end <= pending.cur_ts {
            return; // entirely before the window position
        }
        if frame_ts > pending.cur_ts {
            // Stream jumped past the write position: restart here so the
            // captured data stays contiguous.
            if !pending.buf.is_empty() {
                debug!(
                    "capture: stream jumped {} -> {frame_ts}, restarting",
                    pending.cur_ts
                );
                pending.buf.clear();
            }
            pending.cur_ts = frame_ts;
            pending.first_ts = frame_ts;
        } else if pending.buf.is_empty() && pending.cur_ts == pending.want_ts {
            // First overlap may begin mid-frame.
            pending.first_ts = pending.cur_ts;
        }
        let from = (pending.cur_ts - frame_ts) as usize;
        let room = pending.target - pending.buf.len();
        let take = (samples.len() - from).min(room);
        pending.buf.extend_from_slice(&samples[from..from + take]);
        pending.cur_ts += take as u64;
        if pending.buf.len() == pending.target {
            let done = slot.take().expect("pending capture");
            let _ = done.reply.send(Ok(Capture {
                ts: done.first_ts,
                samples: done.buf,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(start: u64, n: usize) -> Vec<Cf32> {
        (0..n)
            .map(|k| Cf32::new((start + k as u64) as f32, 0.0))
            .collect()
    }

    #[test]
    fn test_capture_across_frames() {
        let mb = CaptureMailbox::new();
        let rx = mb.request(1000, 300).expect("request");
        // Frame starting before the window: only the overlap is taken.
        mb.offer_frame(900, &ramp(900, 252));
        assert!(mb.is_pending());
        mb.offer_frame(1152, &ramp(1152, 252));
        let capture = rx.try_recv().expect("complete").expect("ok");
        assert_eq!(capture.ts, 1000);
        assert_eq!(capture.samples.len(), 300);
        assert_eq!(capture.samples[0].re, 1000.0);
        assert_eq!(capture.samples[299].re, 1299.0);
    }

    #[test]
    fn test_duplicate_capture_rejected() {
        let mb = CaptureMailbox::new();
        let _rx = mb.request(0, 10).expect("first");
        assert!(mb.request(0, 10).is_err());
        mb.cancel();
        assert!(mb.request(0, 10).is_ok());
    }

    #[test]
    fn test_forward_jump_restarts() {
        let mb = CaptureMailbox::new();
        let rx = mb.request(1000, 400).expect("request");
        mb.offer_frame(900, &ramp(900, 252)); // captures 1000..1152
        // Device skips ahead: capture restarts at 1400, no zero gap.
        mb.offer_frame(1400, &ramp(1400, 252));
        mb.offer_frame(1652, &ramp(1652, 252));
        let capture = rx.try_recv().expect("complete").expect("ok");
        assert_eq!(capture.ts, 1400);
        assert_eq!(capture.samples[0].re, 1400.0);
        assert_eq!(capture.samples.len(), 400);
    }

    #[test]
    fn test_old_frames_ignored() {
        let mb = CaptureMailbox::new();
        let rx = mb.request(5000, 100).expect("request");
        mb.offer_frame(1000, &ramp(1000, 252));
        assert!(rx.try_recv().is_err());
        mb.offer_frame(4900, &ramp(4900, 252));
        let capture = rx.try_recv().expect("complete").expect("ok");
        assert_eq!(capture.ts, 5000);
    }

    #[test]
    fn test_fail_wakes_requester() {
        let mb = CaptureMailbox::new();
        let rx = mb.request(0, 10).expect("request");
        mb.fail(&DeviceError::hardware_io("stream died"));
        let result = rx.try_recv().expect("reply");
        assert!(result.is_err());
        assert!(!mb.is_pending());
    }

    #[test]
    fn test_timeout_budget() {
        assert_eq!(capture_timeout(1).as_millis(), 20);
        assert_eq!(capture_timeout(1000).as_millis(), 20);
        assert_eq!(capture_timeout(4000).as_millis(), 80);
        assert_eq!(capture_timeout(4001).as_millis(), 100);
    }
}
