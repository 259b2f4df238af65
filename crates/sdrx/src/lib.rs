// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! # sdrx - user-space SDR board driver
//!
//! Driver for an FPGA + transceiver-IC software-defined-radio board on a
//! USB bulk/control pipe, including its VCTCXO clock-discipline loop.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Host engine (embedder)                       |
//! |   config source | control bus | log sink | periodic tick source     |
//! +---------------------------------------------------------------------+
//! |                          Device facade                              |
//! |   sync_tx/sync_rx | set_state (reconciler) | capture | discipline   |
//! +---------------------------------------------------------------------+
//! |   TX path          RX path          Calibration       Discipliner   |
//! |   energize         ts reconcile     LMS autocal       drift -> DAC  |
//! |   frame batch      DC autocorrect   baseband sweeps                 |
//! +---------------------------------------------------------------------+
//! |   Transceiver model | Clock synth | Peripheral bus | Frame codec    |
//! +---------------------------------------------------------------------+
//! |                USB transport (rusb / emulated board)                |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sdrx::{Config, Device, Direction, MapEnv, NullSink};
//!
//! fn main() -> sdrx::Result<()> {
//!     let env = Arc::new(MapEnv::new().with("sharedpath", "/usr/share/radio"));
//!     let dev = Device::open(Config::default(), env, Arc::new(NullSink))?;
//!     dev.initialize()?;
//!     dev.set_sample_rate(Direction::Tx, 2_166_667)?;
//!     dev.set_sample_rate(Direction::Rx, 2_166_667)?;
//!     dev.set_frequency(Direction::Tx, 915_000_000)?;
//!     dev.enable_rf(Direction::Tx, true)?;
//!     Ok(())
//! }
//! ```
//!
//! Logging goes through the `log` facade; the embedding engine installs
//! whatever sink it uses. The driver never installs a logger itself.

/// Calibration: on-chip auto-cal, baseband sweeps, pre-distortion.
pub mod cal;
/// Sample capture mailbox for debug and calibration.
pub mod capture;
/// Sample clock synthesizer (fractional multisynth dividers).
pub mod clocksynth;
/// Driver configuration - single source of truth for every option.
pub mod config;
/// Ingress control-message surface (`key=value` operations).
pub mod control;
/// Device lifecycle and public entry points.
pub mod device;
/// VCTCXO clock discipline.
pub mod discipline;
/// Complex-arithmetic kit for the calibration DSP.
pub mod dsp;
/// Debug dumps and templated trace files.
pub mod dump;
/// Driver error taxonomy.
pub mod error;
/// Egress notifications to the host engine.
pub mod events;
/// Sample buffering and wire framing.
pub mod frame;
/// Peripheral access layer (packed command frames).
pub mod periph;
/// State reconciler (delta application with abort-on-fail).
pub(crate) mod reconcile;
/// Receive path.
pub mod rx;
/// Desired-state data model.
pub mod state;
/// Sync-set-state mailbox.
pub mod sync;
/// Transmit path.
pub mod tx;
/// USB transport abstraction, rusb backend and emulated board.
pub mod usb;
/// Streaming worker threads and pause/resume coordination.
pub mod workers;
/// Transceiver register model and PLL tuning.
pub mod xcvr;

pub use config::{Config, ConfigSource, Env, MapEnv, Tunables};
pub use device::{BoardInfo, Device};
pub use dsp::Cf32;
pub use error::{DeviceError, ErrorKind, Result, FATAL_ERROR_MASK};
pub use events::{BoardId, DriverEvent, EventKind, EventSink, NullSink, RecordingSink};
pub use state::{
    DevState, DirState, Direction, LnaGain, LoopbackMode, LoopbackParams, LpfMode, TxPattern,
};
pub use usb::{UsbBackend, UsbSpeed};
