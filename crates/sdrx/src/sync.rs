// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Sync-set-state mailbox.
//!
//! A foreign thread hands the TX path a desired [`DevState`] and blocks; the
//! TX path picks the request up between frames, applies it, stamps the
//! transmit timestamp the change became effective at, and posts the result
//! back. Single-slot: a second producer fails with `Pending` instead of
//! queueing behind an unbounded backlog.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{DeviceError, ErrorKind, Result};
use crate::state::DevState;

/// Producer-side wait budget.
pub const SYNC_STATE_TIMEOUT: Duration = Duration::from_secs(12);

/// Outcome posted back to the producer.
#[derive(Debug, Clone)]
pub struct SyncReply {
    /// Result of the state application.
    pub result: std::result::Result<(), DeviceError>,
    /// TX timestamp at which the new state took effect.
    pub applied_ts: u64,
}

/// A pending request.
pub struct SyncRequest {
    /// Desired state.
    pub state: DevState,
    reply: Sender<SyncReply>,
}

impl SyncRequest {
    /// Post the outcome; the producer may already be gone (timeout), which
    /// is fine.
    pub fn complete(self, result: Result<()>, applied_ts: u64) {
        let _ = self.reply.send(SyncReply { result, applied_ts });
    }
}

/// Single-slot sync-set-state mailbox.
#[derive(Default)]
pub struct SyncStateMailbox {
    slot: Mutex<Option<SyncRequest>>,
}

impl SyncStateMailbox {
    /// Empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side: deposit `state` and wait for the TX path, bounded by
    /// `timeout`. A timeout abandons the request (it is withdrawn if still
    /// unclaimed).
    pub fn request(&self, state: DevState, timeout: Duration) -> Result<SyncReply> {
        let rx = self.deposit(state)?;
        self.wait(rx, timeout)
    }

    /// Deposit without waiting; returns the reply channel.
    pub fn deposit(&self, state: DevState) -> Result<Receiver<SyncReply>> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(DeviceError::new(
                ErrorKind::Pending,
                "sync state change already pending",
            ));
        }
        let (reply, rx) = bounded(1);
        *slot = Some(SyncRequest { state, reply });
        Ok(rx)
    }

    /// Wait on a deposited request.
    pub fn wait(&self, rx: Receiver<SyncReply>, timeout: Duration) -> Result<SyncReply> {
        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => {
                self.slot.lock().take();
                Err(DeviceError::timeout("sync state change not picked up"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(DeviceError::cancelled("sync state change abandoned"))
            }
        }
    }

    /// Consumer side: claim the pending request, if any.
    #[must_use]
    pub fn take(&self) -> Option<SyncRequest> {
        self.slot.lock().take()
    }

    /// Whether a request is waiting.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Shutdown: wake any producer with `Cancelled`.
    pub fn cancel(&self) {
        if let Some(req) = self.take() {
            req.complete(Err(DeviceError::cancelled("device closing")), 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_complete_roundtrip() {
        let mb = SyncStateMailbox::new();
        let rx = mb.deposit(DevState::default()).expect("deposit");
        let req = mb.take().expect("pending");
        req.complete(Ok(()), 12345);
        let reply = mb.wait(rx, Duration::from_millis(10)).expect("reply");
        assert!(reply.result.is_ok());
        assert_eq!(reply.applied_ts, 12345);
        assert!(!mb.is_pending());
    }

    #[test]
    fn test_single_slot() {
        let mb = SyncStateMailbox::new();
        let _rx = mb.deposit(DevState::default()).expect("first");
        let err = mb.deposit(DevState::default()).expect_err("second");
        assert_eq!(err.kind, ErrorKind::Pending);
    }

    #[test]
    fn test_timeout_withdraws() {
        let mb = SyncStateMailbox::new();
        let err = mb
            .request(DevState::default(), Duration::from_millis(5))
            .expect_err("nobody consuming");
        assert_eq!(err.kind, ErrorKind::Timeout);
        assert!(!mb.is_pending());
    }

    #[test]
    fn test_cancel_wakes_producer() {
        let mb = SyncStateMailbox::new();
        let rx = mb.deposit(DevState::default()).expect("deposit");
        mb.cancel();
        let reply = mb.wait(rx, Duration::from_millis(10)).expect("reply");
        assert_eq!(reply.result.expect_err("cancelled").kind, ErrorKind::Cancelled);
    }
}
