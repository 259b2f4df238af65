// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Egress notifications.
//!
//! The host engine registers an [`EventSink`]; the driver posts lifecycle
//! and calibration events through it. Every event carries the board
//! identity (serial, bus/address, speed class) plus event parameters as
//! `key=value` pairs, the format the host's message bus expects.

use std::sync::Arc;

use crate::usb::UsbSpeed;

/// Board identity attached to every notification.
#[derive(Debug, Clone)]
pub struct BoardId {
    /// Serial string.
    pub serial: String,
    /// USB bus number.
    pub bus: u8,
    /// USB device address.
    pub address: u8,
    /// Link speed class.
    pub speed: UsbSpeed,
}

/// Driver event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Device initialized and streaming-capable.
    Started,
    /// Device shut down.
    Stopped,
    /// A calibration run finished.
    Calibrated,
    /// The VCTCXO trim changed.
    FreqOffsetChanged,
    /// Initialization or a fatal runtime error failed the interface.
    Failure,
}

impl EventKind {
    /// Status value carried in the notification.
    #[must_use]
    pub const fn status(self) -> &'static str {
        match self {
            Self::Started => "start",
            Self::Stopped => "stop",
            Self::Calibrated => "calibrated",
            Self::FreqOffsetChanged => "freqoffs",
            Self::Failure => "failure",
        }
    }
}

/// One notification.
#[derive(Debug, Clone)]
pub struct DriverEvent {
    /// Kind.
    pub kind: EventKind,
    /// Board identity.
    pub board: BoardId,
    /// Event parameters (`RadioFrequencyOffset`, calibration results,
    /// error details).
    pub params: Vec<(String, String)>,
}

/// Notification sink contract (host control bus).
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block for long; the driver posts from
    /// worker threads.
    fn notify(&self, event: DriverEvent);
}

/// Sink that drops everything (default when the host registers none).
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: DriverEvent) {}
}

/// Sink that records events; test double.
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<DriverEvent>>,
}

impl RecordingSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of delivered events.
    #[must_use]
    pub fn events(&self) -> Vec<DriverEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: DriverEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.notify(DriverEvent {
            kind: EventKind::Started,
            board: BoardId {
                serial: "S1".into(),
                bus: 1,
                address: 2,
                speed: UsbSpeed::Super,
            },
            params: vec![("RadioFrequencyOffset".into(), "128".into())],
        });
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind.status(), "start");
    }
}
