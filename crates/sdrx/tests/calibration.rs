// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Full calibration against a modeled RF loopback.
//!
//! The emulated board's RX generator synthesizes what the real loopback
//! would deliver: the transmitted probe tone plus a leakage tone whose
//! amplitude tracks the distance between the applied TX corrections and a
//! hidden ideal. The baseband sweeps must find that ideal.

mod common;

use sdrx::cal::baseband::{tone_freqs, BbKind};
use sdrx::dsp::Cf64;
use sdrx::xcvr::pll::tuning_to_hz;
use sdrx::xcvr::regs;
use sdrx::{Direction, LoopbackMode};

use common::high_speed_device;

/// Hidden board truth the calibration has to discover.
const IDEAL_DC_I: i32 = -23;
const IDEAL_DC_Q: i32 = 17;
const IDEAL_PHASE: i32 = 300;
const IDEAL_GAIN: i32 = -500;

/// Probe amplitude in 12-bit units.
const PROBE_AMP: f64 = 1200.0;

fn pll_freq(lms: &[u8; 128], base: usize) -> u64 {
    let freqsel = (lms[base + 5] >> 2) & 0x3f;
    let nint = (u32::from(lms[base]) << 1) | u32::from(lms[base + 1] >> 7);
    let nfrac = (u32::from(lms[base + 1] & 0x7f) << 16)
        | (u32::from(lms[base + 2]) << 8)
        | u32::from(lms[base + 3]);
    tuning_to_hz(freqsel, nint, nfrac)
}

#[test]
fn test_full_calibration_finds_board_truth() {
    let (board, dev, _sink) = high_speed_device();
    dev.set_sample_rate(Direction::Tx, 2_166_667).expect("tx rate");
    dev.set_sample_rate(Direction::Rx, 2_166_667).expect("rx rate");
    dev.set_frequency(Direction::Tx, 915_000_000).expect("tx tune");

    board.set_rx_generator(Box::new(|st, ts, n| {
        let tx_f = pll_freq(&st.lms, regs::PLL_TX_BASE as usize);
        let rx_f = pll_freq(&st.lms, regs::PLL_RX_BASE as usize);
        let kind = if rx_f < tx_f {
            BbKind::DcOffset
        } else {
            BbKind::Imbalance
        };
        let (w_cal, w_test) = tone_freqs(kind);
        let leak = match kind {
            BbKind::DcOffset => {
                let di = i32::from(st.lms[regs::TX_DC_I as usize]) - 128 - IDEAL_DC_I;
                let dq = i32::from(st.lms[regs::TX_DC_Q as usize]) - 128 - IDEAL_DC_Q;
                Cf64::new(f64::from(di) * 4.0, f64::from(dq) * 4.0)
            }
            BbKind::Imbalance => {
                let at = |a: u8| {
                    i32::from(i16::from_le_bytes([
                        st.gpio[a as usize],
                        st.gpio[a as usize + 1],
                    ]))
                };
                let dp = at(sdrx::periph::gpio::CORR_TX_PHASE) - IDEAL_PHASE;
                let dg = at(sdrx::periph::gpio::CORR_TX_GAIN) - IDEAL_GAIN;
                Cf64::new(f64::from(dp) / 16.0, f64::from(dg) / 16.0)
            }
        };
        (0..n)
            .map(|k| {
                let t = (ts + k as u64) as f64;
                let probe = Cf64::exp_j(w_test * t).scale(PROBE_AMP);
                let spur = Cf64::exp_j(w_cal * t) * leak;
                let s = probe + spur;
                (s.re.round() as i16, s.im.round() as i16)
            })
            .collect()
    }));

    let report = dev.calibrate().expect("calibration converges");

    assert_eq!(report.tx_dc_i, IDEAL_DC_I);
    assert_eq!(report.tx_dc_q, IDEAL_DC_Q);
    assert!(
        (report.tx_phase - IDEAL_PHASE).abs() <= 64,
        "phase {} vs {IDEAL_PHASE}",
        report.tx_phase
    );
    assert!(
        (report.tx_gain - IDEAL_GAIN).abs() <= 64,
        "gain {} vs {IDEAL_GAIN}",
        report.tx_gain
    );

    // Results live in the applied state; the calibration's temporary moves
    // (loopback, RX tuning, TX pattern) were restored.
    let applied = dev.applied_state();
    assert_eq!(applied.tx.dc_offset_i, IDEAL_DC_I);
    assert_eq!(applied.tx.dc_offset_q, IDEAL_DC_Q);
    assert_eq!(applied.loopback, LoopbackMode::None);
    assert!(!applied.tx_pattern.is_active());
    assert_eq!(applied.rx.sample_rate_hz, 2_166_667);
}

#[test]
fn test_calibration_aborts_on_dead_loopback() {
    let (board, dev, _sink) = high_speed_device();
    dev.set_sample_rate(Direction::Tx, 2_166_667).expect("tx rate");
    dev.set_sample_rate(Direction::Rx, 2_166_667).expect("rx rate");
    dev.set_frequency(Direction::Tx, 915_000_000).expect("tx tune");
    // No probe tone comes back: the self-check must fail the run.
    board.set_rx_generator(Box::new(|_, _, n| vec![(0i16, 0i16); n]));
    let err = dev.calibrate().expect_err("loopback dead");
    assert!(
        err.context.contains("loopback") || err.context.contains("bad captures"),
        "unexpected error: {err}"
    );
    // The device is usable again: workers resumed, state restored.
    assert_eq!(dev.applied_state().loopback, LoopbackMode::None);
    dev.sync_tx(0, &[sdrx::Cf32::new(0.1, 0.1); 64]).expect("tx after cal");
}
