// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Streaming worker threads and pause/resume coordination.
//!
//! Two owned threads keep the bulk pipes moving when no foreign caller is
//! driving them: the TX feeder transmits silence (or the active pattern)
//! at the stream position, the RX drainer consumes incoming frames (which
//! also feeds captures and the DC autocorrection).
//!
//! Pause/resume is a two-state gate observed at buffer boundaries only, so
//! timestamp coherence survives: a worker acknowledges the pause between
//! iterations, and on resume refreshes its running timestamp before
//! re-entering I/O. Calibration pauses both workers for its exclusive use
//! of the device and resumes them on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::device::Device;
use crate::dsp::Cf32;
use crate::error::Result;
use crate::usb::CancelToken;

/// Gate poll slice while paused or waiting for acknowledgement.
const GATE_SLICE: Duration = Duration::from_millis(50);

/// How long `pause` waits for workers to acknowledge.
const PAUSE_ACK_BUDGET: Duration = Duration::from_secs(5);

/// Worker chunk size (samples per send/recv call).
const WORKER_CHUNK: usize = 1024;

struct GateState {
    want_paused: bool,
    paused: usize,
}

/// Two-state pause gate with acknowledgement counting.
pub struct PauseGate {
    inner: Mutex<GateState>,
    cond: Condvar,
}

impl PauseGate {
    /// New gate, running.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(GateState {
                want_paused: false,
                paused: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Request pause and wait until `workers` threads have acknowledged.
    pub fn pause(&self, workers: usize) {
        let mut state = self.inner.lock();
        state.want_paused = true;
        let deadline = std::time::Instant::now() + PAUSE_ACK_BUDGET;
        while state.paused < workers {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                warn!(
                    "pause gate: only {}/{workers} workers acknowledged",
                    state.paused
                );
                break;
            }
        }
    }

    /// Release the gate.
    pub fn resume(&self) {
        let mut state = self.inner.lock();
        state.want_paused = false;
        self.cond.notify_all();
    }

    /// Worker-side check, called at iteration boundaries. Blocks while the
    /// gate is closed; returns true if the worker was actually paused (the
    /// caller then refreshes its running timestamp).
    pub fn checkpoint(&self, cancel: &CancelToken) -> bool {
        let mut state = self.inner.lock();
        if !state.want_paused {
            return false;
        }
        state.paused += 1;
        self.cond.notify_all();
        while state.want_paused && !cancel.is_cancelled() {
            self.cond.wait_for(&mut state, GATE_SLICE);
        }
        state.paused -= 1;
        self.cond.notify_all();
        true
    }

    /// Whether a pause is requested or in effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.lock().want_paused
    }
}

/// Owned streaming workers.
pub struct StreamWorkers {
    gate: Arc<PauseGate>,
    stop: Arc<AtomicBool>,
    tx_handle: Option<JoinHandle<()>>,
    rx_handle: Option<JoinHandle<()>>,
}

impl StreamWorkers {
    /// Spawn the TX feeder and RX drainer.
    pub fn spawn(dev: Arc<Device>) -> Self {
        let gate = PauseGate::new();
        let stop = Arc::new(AtomicBool::new(false));

        let tx_handle = {
            let dev = dev.clone();
            let gate = gate.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("sdrx-tx-{}", dev.serial()))
                .spawn(move || tx_worker(&dev, &gate, &stop))
                .expect("spawn tx worker")
        };
        let rx_handle = {
            let gate = gate.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("sdrx-rx-{}", dev.serial()))
                .spawn(move || rx_worker(&dev, &gate, &stop))
                .expect("spawn rx worker")
        };
        Self {
            gate,
            stop,
            tx_handle: Some(tx_handle),
            rx_handle: Some(rx_handle),
        }
    }

    /// Pause both workers (blocks until acknowledged).
    pub fn pause(&self) {
        self.gate.pause(2);
    }

    /// Resume both workers.
    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Stop and join.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        self.gate.resume();
        for handle in [self.tx_handle.take(), self.rx_handle.take()].into_iter().flatten() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamWorkers {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.gate.resume();
        for handle in [self.tx_handle.take(), self.rx_handle.take()].into_iter().flatten() {
            let _ = handle.join();
        }
    }
}

fn tx_worker(dev: &Arc<Device>, gate: &PauseGate, stop: &AtomicBool) {
    let silence = vec![Cf32::default(); WORKER_CHUNK];
    let mut ts: Option<u64> = None;
    while !stop.load(Ordering::Acquire) && !dev.cancel.is_cancelled() {
        if gate.checkpoint(&dev.cancel) {
            ts = None; // stream position is stale after a pause
            continue;
        }
        let t = ts.unwrap_or_else(|| dev.tx.lock().stream_pos());
        match dev.sync_tx(t, &silence) {
            Ok(()) => ts = Some(t + silence.len() as u64),
            Err(err) if err.is_fatal() => {
                error!("tx worker: {err}");
                break;
            }
            Err(err) => {
                debug!("tx worker: {err}, retrying");
                ts = None;
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn rx_worker(dev: &Arc<Device>, gate: &PauseGate, stop: &AtomicBool) {
    let mut buf = vec![Cf32::default(); WORKER_CHUNK];
    let mut ts: u64 = 0;
    while !stop.load(Ordering::Acquire) && !dev.cancel.is_cancelled() {
        if gate.checkpoint(&dev.cancel) {
            ts = 0; // re-align with the device stream on resume
            continue;
        }
        match dev.sync_rx(ts, &mut buf) {
            Ok(n) => ts += n as u64,
            Err(err) if err.is_fatal() => {
                error!("rx worker: {err}");
                break;
            }
            Err(err) => {
                debug!("rx worker: {err}, retrying");
                ts = 0;
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl Device {
    /// Spawn the streaming workers (idempotent).
    pub fn start_streaming(self: &Arc<Self>) -> Result<()> {
        self.ensure_initialized()?;
        let mut slot = self.workers.lock();
        if slot.is_none() {
            *slot = Some(StreamWorkers::spawn(self.clone()));
        }
        Ok(())
    }

    /// Stop and join the streaming workers.
    pub fn stop_streaming(self: &Arc<Self>) {
        if let Some(workers) = self.workers.lock().take() {
            workers.stop();
        }
    }

    /// Pause the streaming workers (calibration entry).
    pub(crate) fn pause_streaming(&self) {
        if let Some(workers) = self.workers.lock().as_ref() {
            workers.pause();
        }
    }

    /// Resume the streaming workers (calibration exit).
    pub(crate) fn resume_streaming(&self) {
        if let Some(workers) = self.workers.lock().as_ref() {
            workers.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_checkpoint_fast_path() {
        let gate = PauseGate::new();
        let cancel = CancelToken::new();
        assert!(!gate.checkpoint(&cancel));
    }

    #[test]
    fn test_pause_resume_roundtrip() {
        let gate = PauseGate::new();
        let cancel = CancelToken::new();
        let worker = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                let mut pauses = 0u32;
                for _ in 0..1000 {
                    if gate.checkpoint(&cancel) {
                        pauses += 1;
                    }
                    if pauses > 0 {
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                pauses
            })
        };
        gate.pause(1);
        assert!(gate.is_paused());
        gate.resume();
        assert_eq!(worker.join().expect("worker"), 1);
    }

    #[test]
    fn test_cancel_unblocks_paused_worker() {
        let gate = PauseGate::new();
        let cancel = CancelToken::new();
        let worker = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                // Busy-wait until the pause request lands, then checkpoint.
                while !gate.is_paused() {
                    thread::sleep(Duration::from_millis(1));
                }
                gate.checkpoint(&cancel)
            })
        };
        let pauser = {
            let gate = gate.clone();
            thread::spawn(move || gate.pause(1))
        };
        pauser.join().expect("pauser");
        cancel.cancel();
        assert!(worker.join().expect("worker"));
    }
}
