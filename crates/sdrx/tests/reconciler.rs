// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Reconciler behavior: idempotence, loopback safety, abort-on-fail,
//! preconditions.

mod common;

use sdrx::periph::PeriphDev;
use sdrx::state::{common_changed, dir_changed};
use sdrx::xcvr::{regs, IqBranch};
use sdrx::{Direction, ErrorKind, LnaGain, LoopbackMode, LoopbackParams};

use common::high_speed_device;

#[test]
fn test_set_state_idempotent() {
    let (board, dev, _sink) = high_speed_device();
    let mut desired = dev.delta();
    desired.tx.vga1 = -10;
    desired.tx.vga2 = 20;
    desired.rx.vga2 = 12;
    desired.changed_tx = dir_changed::VGA1 | dir_changed::VGA2;
    desired.changed_rx = dir_changed::VGA2;
    dev.set_state(&desired).expect("first application");
    assert!(!board.periph_writes().is_empty());

    board.clear_periph_writes();
    dev.set_state(&desired).expect("second application");
    assert!(
        board.periph_writes().is_empty(),
        "identical state must issue zero peripheral writes"
    );
}

#[test]
fn test_loopback_transition_passes_through_none() {
    let (board, dev, _sink) = high_speed_device();
    dev.set_loopback(LoopbackMode::RfLna1, LoopbackParams::default())
        .expect("enter rf loopback");

    board.clear_periph_writes();
    dev.set_loopback(
        LoopbackMode::BbLpfToVga2,
        LoopbackParams {
            lna_gain: Some(LnaGain::Mid),
            ..LoopbackParams::default()
        },
    )
    .expect("switch to baseband loopback");

    let writes: Vec<(u8, u8)> = board
        .periph_writes()
        .into_iter()
        .filter(|(dev, _, _)| *dev == PeriphDev::Xcvr)
        .map(|(_, addr, value)| (addr, value))
        .collect();
    // Teardown first: PA off, LNA deselected, both switch banks open...
    let pa_off = writes
        .iter()
        .position(|&(a, v)| a == regs::TX_PA_SEL && v & 0x18 == 0)
        .expect("PA switched off");
    let lna_off = writes
        .iter()
        .position(|&(a, v)| a == regs::RX_LNA_CTRL && v & 0x30 == 0)
        .expect("LNA deselected");
    let rf_open = writes
        .iter()
        .position(|&(a, v)| a == regs::LOOPBACK_RF && v & 0x07 == 0)
        .expect("RF switch opened");
    // ...then the new baseband route.
    let bb_routed = writes
        .iter()
        .position(|&(a, v)| a == regs::LOOPBACK_BB && v & 0x0f == 2)
        .expect("BB path routed");
    assert!(pa_off < bb_routed);
    assert!(lna_off < bb_routed);
    assert!(rf_open < bb_routed);
}

#[test]
fn test_abort_on_fail_stops_at_first_error() {
    let (_board, dev, _sink) = high_speed_device();
    let mut desired = dev.delta();
    desired.tx.power_balance = 5.0; // invalid, (0, 2) exclusive
    desired.tx.vga2 = 21; // applied after balance in field order
    desired.changed_tx = dir_changed::POWER_BALANCE | dir_changed::VGA2;
    desired.changed_common |= common_changed::ABORT_ON_FAIL;
    // Balance is ordered before the timestamp/RF tail but after VGA2, so
    // reorder the probe: use a field ordered later than the failing one.
    desired.tx.timestamp = 777;
    desired.changed_tx |= dir_changed::TIMESTAMP;

    let err = dev.set_state(&desired).expect_err("must abort");
    assert_eq!(err.kind, ErrorKind::OutOfRange);
    // The later-ordered timestamp seed must not have been applied.
    assert_ne!(dev.applied_state().tx.timestamp, 777);
}

#[test]
fn test_continue_on_fail_applies_remaining_fields() {
    let (_board, dev, _sink) = high_speed_device();
    let mut desired = dev.delta();
    desired.tx.power_balance = 5.0;
    desired.tx.timestamp = 888;
    desired.changed_tx = dir_changed::POWER_BALANCE | dir_changed::TIMESTAMP;

    let err = dev.set_state(&desired).expect_err("first error returned");
    assert_eq!(err.kind, ErrorKind::OutOfRange);
    assert_eq!(dev.applied_state().tx.timestamp, 888);
}

#[test]
fn test_rf_enable_requires_both_sample_rates() {
    let (_board, dev, _sink) = high_speed_device();
    dev.set_sample_rate(Direction::Tx, 2_000_000).expect("tx rate");
    let err = dev.enable_rf(Direction::Tx, true).expect_err("rx rate missing");
    assert!(err.context.contains("sample rates"));

    dev.set_sample_rate(Direction::Rx, 2_000_000).expect("rx rate");
    dev.enable_rf(Direction::Tx, true).expect("both rates set");
}

#[test]
fn test_sample_rate_ceiling_on_high_speed() {
    let (_board, dev, _sink) = high_speed_device();
    let err = dev
        .set_sample_rate(Direction::Rx, 10_000_000)
        .expect_err("over the high-speed ceiling");
    assert_eq!(err.kind, ErrorKind::InsufficientSpeed);
}

#[test]
fn test_manual_rx_dc_write_disables_autocorrection() {
    let (_board, dev, _sink) = high_speed_device();
    assert!(dev.applied_state().rx_dc_auto);
    dev.set_dc_offset(Direction::Rx, IqBranch::I, -5)
        .expect("manual offset");
    assert!(!dev.applied_state().rx_dc_auto, "manual write is sticky");
}

#[test]
fn test_dc_encoding_reaches_hardware() {
    let (board, dev, _sink) = high_speed_device();
    dev.set_dc_offset(Direction::Tx, IqBranch::I, -100)
        .expect("tx dc");
    assert_eq!(board.lms_reg(regs::TX_DC_I), 28); // -100 + 128
    dev.set_dc_offset(Direction::Rx, IqBranch::Q, -20)
        .expect("rx dc");
    assert_eq!(board.lms_reg(regs::RX_DC_Q) & 0x7f, 0x40 | 20);
}
