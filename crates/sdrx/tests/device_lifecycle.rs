// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Device lifecycle: cold open with FPGA load, initialization ordering,
//! notifications, shutdown.

mod common;

use std::sync::Arc;

use md5::{Digest, Md5};
use sdrx::config::MapEnv;
use sdrx::events::{EventKind, RecordingSink};
use sdrx::periph::gpio;
use sdrx::usb::mock::MockBoard;
use sdrx::{Config, Device, Direction, UsbSpeed};

use common::open_device;

#[test]
fn test_cold_open_loads_fpga_from_cal_cache_size() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("data")).expect("data dir");
    let image: Vec<u8> = (0..10_000u32).map(|v| v as u8).collect();
    std::fs::write(dir.path().join("data/hostedx40.rbf"), &image).expect("image");

    let board = Arc::new(MockBoard::new(UsbSpeed::High));
    board.set_fpga_unloaded();
    board.set_cal_records(&[("B", "40"), ("DAC.DAC_TRIM", "32768")]);
    let env = Arc::new(MapEnv::new().with("sharedpath", &dir.path().display().to_string()));
    let dev = Device::open_with_backend(
        Config::default(),
        env,
        RecordingSink::new(),
        board.clone(),
    )
    .expect("cold open");

    // The bitstream reached the board and was committed.
    board.with_state(|st| {
        assert!(st.fpga_loaded);
        assert_eq!(st.fpga_blob, image);
    });
    // MD5 and source path are recorded; initialize was not yet called.
    let info = dev.board_info();
    let expected: String = Md5::digest(&image)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    assert_eq!(info.fpga_md5.as_deref(), Some(expected.as_str()));
    assert!(info
        .fpga_path
        .expect("path recorded")
        .ends_with("data/hostedx40.rbf"));
    assert!(!dev.is_initialized());
}

#[test]
fn test_cold_open_fails_without_image() {
    let dir = tempfile::tempdir().expect("tempdir");
    let board = Arc::new(MockBoard::new(UsbSpeed::High));
    board.set_fpga_unloaded();
    let env = Arc::new(MapEnv::new().with("sharedpath", &dir.path().display().to_string()));
    let err = Device::open_with_backend(Config::default(), env, RecordingSink::new(), board)
        .expect_err("no image on disk");
    assert!(err.context.contains("hostedx40.rbf"));
}

#[test]
fn test_initialize_sets_dma_mode_by_speed() {
    let (board, _dev, _sink) = open_device(UsbSpeed::High, Config::default(), true);
    assert_eq!(board.gpio_reg(gpio::BOARD_CTRL) & gpio::CTRL_SMALL_DMA, 1);

    let (board, _dev, _sink) = open_device(UsbSpeed::Super, Config::default(), true);
    assert_eq!(board.gpio_reg(gpio::BOARD_CTRL) & gpio::CTRL_SMALL_DMA, 0);
}

#[test]
fn test_initialize_emits_started_with_offset() {
    let (_board, dev, sink) = open_device(UsbSpeed::High, Config::default(), true);
    let events = sink.events();
    let started = events
        .iter()
        .find(|e| e.kind == EventKind::Started)
        .expect("started event");
    assert_eq!(started.board.serial, dev.serial());
    assert!(started
        .params
        .iter()
        .any(|(k, v)| k == "RadioFrequencyOffset" && v == "128.00"));
}

#[test]
fn test_factory_trim_seeds_dac() {
    let board = Arc::new(MockBoard::new(UsbSpeed::High));
    board.set_cal_records(&[("B", "40"), ("DAC.DAC_TRIM", "33024")]); // 129.0
    let dev = Device::open_with_backend(
        Config::default(),
        Arc::new(MapEnv::new()),
        RecordingSink::new(),
        board.clone(),
    )
    .expect("open");
    dev.initialize().expect("initialize");
    assert_eq!(dev.freq_offset(), 129.0);
    assert_eq!(board.dac_history().last().copied(), Some(33024));
}

#[test]
fn test_vga_presets_applied_at_initialize() {
    let mut source = std::collections::HashMap::new();
    source.insert("tx_vga2".to_string(), "17".to_string());
    source.insert("rx_vga2".to_string(), "9".to_string());
    let cfg = Config::from_source(&source);
    let (_board, dev, _sink) = open_device(UsbSpeed::High, cfg, true);
    let applied = dev.applied_state();
    assert_eq!(applied.tx.vga2, 17);
    assert_eq!(applied.rx.vga2, 9);
}

#[test]
fn test_shutdown_disables_rf_and_notifies() {
    let (board, dev, sink) = open_device(UsbSpeed::High, Config::default(), true);
    dev.set_sample_rate(Direction::Tx, 2_000_000).expect("tx rate");
    dev.set_sample_rate(Direction::Rx, 2_000_000).expect("rx rate");
    dev.set_frequency(Direction::Tx, 915_000_000).expect("tune");
    dev.enable_rf(Direction::Tx, true).expect("rf on");
    board.with_state(|st| assert!(st.rf_tx_on));

    dev.shutdown();
    board.with_state(|st| {
        assert!(!st.rf_tx_on);
        assert!(!st.rf_rx_on);
    });
    assert!(!dev.is_initialized());
    assert!(sink.events().iter().any(|e| e.kind == EventKind::Stopped));
    // Streaming entry points now refuse.
    assert!(dev.sync_tx(0, &[]).is_err());
}

#[test]
fn test_set_freq_offset_notifies() {
    let (board, dev, sink) = open_device(UsbSpeed::High, Config::default(), true);
    dev.set_freq_offset(130.5).expect("trim");
    assert_eq!(board.dac_history().last().copied(), Some((130.5f64 * 256.0) as u16));
    assert!(sink.events().iter().any(|e| {
        e.kind == EventKind::FreqOffsetChanged
            && e.params
                .iter()
                .any(|(k, v)| k == "RadioFrequencyOffset" && v == "130.50")
    }));
}
