// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Shared test scaffolding: an emulated board wired into an open device.

use std::sync::Arc;

use sdrx::config::MapEnv;
use sdrx::events::RecordingSink;
use sdrx::usb::mock::MockBoard;
use sdrx::{Config, Device, UsbSpeed};

/// Open (and optionally initialize) a device over a fresh emulated board.
#[allow(dead_code)]
pub fn open_device(
    speed: UsbSpeed,
    cfg: Config,
    initialize: bool,
) -> (Arc<MockBoard>, Arc<Device>, Arc<RecordingSink>) {
    let board = Arc::new(MockBoard::new(speed));
    let sink = RecordingSink::new();
    let dev = Device::open_with_backend(
        cfg,
        Arc::new(MapEnv::new()),
        sink.clone(),
        board.clone(),
    )
    .expect("open device");
    if initialize {
        dev.initialize().expect("initialize device");
    }
    (board, dev, sink)
}

/// Default high-speed device, initialized.
#[allow(dead_code)]
pub fn high_speed_device() -> (Arc<MockBoard>, Arc<Device>, Arc<RecordingSink>) {
    open_device(UsbSpeed::High, Config::default(), true)
}
