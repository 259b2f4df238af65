// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! State reconciler.
//!
//! Applies a desired [`DevState`] to the hardware, field by field, in a
//! fixed order (sample rate before anything that depends on it, RF enable
//! last). Only fields whose change bit is set are considered, and a field
//! equal to the realized state is skipped without touching the bus - two
//! identical `set_state` calls in a row issue zero peripheral writes.
//!
//! Failure policy: with the abort-on-fail sentinel set, the first failing
//! field returns immediately; otherwise the first error is recorded, the
//! bit cleared, and the remaining fields still attempted. Change bits left
//! over after traversal indicate a programming error and are warned about.

use log::{debug, error, warn};

use crate::device::Device;
use crate::error::{DeviceError, ErrorKind, Result};
use crate::periph::{gpio, PeriphDev};
use crate::rx::RxPath;
use crate::state::{
    common_changed, dir_changed, validate_power_balance, validate_sample_rate, DevState,
    Direction, LnaGain, LoopbackMode,
};
use crate::frame::BufLayout;
use crate::tx::TxPath;
use crate::usb::{vendor, UsbSpeed, CTRL_TIMEOUT};
use crate::xcvr::pll::BAND_SPLIT_HZ;
use crate::xcvr::{CorrKind, IqBranch, PaSel};

/// Per-direction application order.
const DIR_ORDER: [u32; 13] = [
    dir_changed::SAMPLE_RATE,
    dir_changed::FREQUENCY,
    dir_changed::VGA1,
    dir_changed::VGA2,
    dir_changed::LPF_MODE,
    dir_changed::LPF_BW,
    dir_changed::DC_I,
    dir_changed::DC_Q,
    dir_changed::FPGA_PHASE,
    dir_changed::FPGA_GAIN,
    dir_changed::POWER_BALANCE,
    dir_changed::TIMESTAMP,
    dir_changed::RF_ENABLED,
];

/// Global application order.
const COMMON_ORDER: [u32; 3] = [
    common_changed::LOOPBACK,
    common_changed::RX_DC_AUTO,
    common_changed::TX_PATTERN,
];

/// Apply `desired` to the device. Caller holds the TX and RX serializers
/// (in that order).
pub(crate) fn apply_state(
    dev: &Device,
    tx: &mut TxPath,
    rx: &mut RxPath,
    desired: &DevState,
) -> Result<()> {
    let mut want = desired.clone();
    let abort = want.abort_on_fail();
    let mut first_err: Option<DeviceError> = None;
    let mut applied = dev.applied.lock();

    for dir in [Direction::Tx, Direction::Rx] {
        for &bit in &DIR_ORDER {
            if want.changed(dir) & bit == 0 {
                continue;
            }
            *want.changed_mut(dir) &= !bit;
            let result = apply_dir_field(dev, &mut applied, tx, rx, &want, dir, bit);
            if let Err(err) = result {
                if abort {
                    return Err(err);
                }
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    error!("set_state: {} field 0x{bit:x}: {err}", dir.name());
                }
            }
        }
    }
    for &bit in &COMMON_ORDER {
        if want.changed_common & bit == 0 {
            continue;
        }
        want.changed_common &= !bit;
        let result = apply_common_field(dev, &mut applied, tx, rx, &want, bit);
        if let Err(err) = result {
            if abort {
                return Err(err);
            }
            if first_err.is_none() {
                first_err = Some(err);
            } else {
                error!("set_state: common field 0x{bit:x}: {err}");
            }
        }
    }

    let leftover_common = want.changed_common & common_changed::ALL;
    if want.changed_tx != 0 || want.changed_rx != 0 || leftover_common != 0 {
        warn!(
            "set_state: unhandled change bits tx=0x{:x} rx=0x{:x} common=0x{:x}",
            want.changed_tx, want.changed_rx, leftover_common
        );
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_lines)]
fn apply_dir_field(
    dev: &Device,
    applied: &mut DevState,
    tx: &mut TxPath,
    rx: &mut RxPath,
    want: &DevState,
    dir: Direction,
    bit: u32,
) -> Result<()> {
    let desired = want.dir(dir);
    match bit {
        dir_changed::SAMPLE_RATE => {
            let rate = desired.sample_rate_hz;
            if rate == applied.dir(dir).sample_rate_hz {
                return Ok(());
            }
            validate_sample_rate(rate)?;
            let ceiling = match dev.speed {
                UsbSpeed::High => dev.cfg.max_samplerate_high,
                UsbSpeed::Super => dev.cfg.max_samplerate_super,
            };
            if rate > ceiling {
                return Err(DeviceError::new(
                    ErrorKind::InsufficientSpeed,
                    format!(
                        "sample rate {rate} Hz over the {} Hz {}-speed ceiling",
                        ceiling,
                        dev.speed.name()
                    ),
                ));
            }
            dev.synth.set_sample_rate(dir, rate)?;
            let back = dev.synth.get_sample_rate(dir)?;
            if back != f64::from(rate) {
                debug!(
                    "{} sample rate {rate} Hz realized as {back:.3} Hz (precision loss)",
                    dir.name()
                );
            }
            let buffering = dev.cfg.buffering_for_rate(rate);
            let layout = BufLayout::derive(
                dev.speed,
                buffering.total_samples,
                buffering.tx_min_buffers,
            );
            match dir {
                Direction::Tx => tx.reconfigure(layout, rate),
                Direction::Rx => rx.reconfigure(layout, rate),
            }
            applied.dir_mut(dir).sample_rate_hz = rate;
            Ok(())
        }
        dir_changed::FREQUENCY => {
            let hz = desired.frequency_hz;
            if hz == applied.dir(dir).frequency_hz {
                return Ok(());
            }
            dev.xcvr.set_frequency(dir, hz)?;
            applied.dir_mut(dir).frequency_hz = hz;
            Ok(())
        }
        dir_changed::VGA1 => {
            if desired.vga1 == applied.dir(dir).vga1 {
                return Ok(());
            }
            dev.xcvr.set_vga(dir, 1, desired.vga1)?;
            applied.dir_mut(dir).vga1 = desired.vga1;
            Ok(())
        }
        dir_changed::VGA2 => {
            if desired.vga2 == applied.dir(dir).vga2 {
                return Ok(());
            }
            dev.xcvr.set_vga(dir, 2, desired.vga2)?;
            if dir == Direction::Rx {
                rx.set_vga2_mirror(desired.vga2);
            }
            applied.dir_mut(dir).vga2 = desired.vga2;
            Ok(())
        }
        dir_changed::LPF_MODE => {
            if desired.lpf_mode == applied.dir(dir).lpf_mode {
                return Ok(());
            }
            dev.xcvr.set_lpf(dir, desired.lpf_mode)?;
            applied.dir_mut(dir).lpf_mode = desired.lpf_mode;
            Ok(())
        }
        dir_changed::LPF_BW => {
            if desired.lpf_bw_hz == applied.dir(dir).lpf_bw_hz {
                return Ok(());
            }
            let actual = dev.xcvr.set_lpf_bandwidth(dir, desired.lpf_bw_hz)?;
            applied.dir_mut(dir).lpf_bw_hz = actual;
            Ok(())
        }
        dir_changed::DC_I | dir_changed::DC_Q => {
            let (branch, value, current) = if bit == dir_changed::DC_I {
                (IqBranch::I, desired.dc_offset_i, applied.dir(dir).dc_offset_i)
            } else {
                (IqBranch::Q, desired.dc_offset_q, applied.dir(dir).dc_offset_q)
            };
            if value == current {
                return Ok(());
            }
            dev.xcvr.set_dc_offset(dir, branch, value)?;
            if dir == Direction::Rx {
                rx.set_dc_mirror(branch, value);
                // A manual RX offset write turns autocorrection off (sticky).
                if dev.tunables.load().rx_dc_autocorrect {
                    dev.tunables.rcu(|t| {
                        let mut t = (**t).clone();
                        t.rx_dc_autocorrect = false;
                        t
                    });
                    rx.disable_dc_auto();
                    applied.rx_dc_auto = false;
                    debug!("rx dc: manual offset write, autocorrection off");
                }
            }
            match branch {
                IqBranch::I => applied.dir_mut(dir).dc_offset_i = value,
                IqBranch::Q => applied.dir_mut(dir).dc_offset_q = value,
            }
            Ok(())
        }
        dir_changed::FPGA_PHASE => {
            if desired.fpga_corr_phase == applied.dir(dir).fpga_corr_phase {
                return Ok(());
            }
            dev.xcvr
                .set_fpga_corr(dir, CorrKind::Phase, desired.fpga_corr_phase)?;
            applied.dir_mut(dir).fpga_corr_phase = desired.fpga_corr_phase;
            Ok(())
        }
        dir_changed::FPGA_GAIN => {
            if desired.fpga_corr_gain == applied.dir(dir).fpga_corr_gain {
                return Ok(());
            }
            if dir == Direction::Tx && dev.cfg.tx_fpga_corr_gain_software {
                tx.set_sw_gain_scale(1.0 + desired.fpga_corr_gain as f32 / 4096.0);
            } else {
                dev.xcvr
                    .set_fpga_corr(dir, CorrKind::Gain, desired.fpga_corr_gain)?;
            }
            applied.dir_mut(dir).fpga_corr_gain = desired.fpga_corr_gain;
            Ok(())
        }
        dir_changed::POWER_BALANCE => {
            if dir == Direction::Rx {
                return Ok(()); // TX-only knob
            }
            if desired.power_balance == applied.tx.power_balance {
                return Ok(());
            }
            validate_power_balance(desired.power_balance)?;
            tx.set_power_balance(desired.power_balance);
            applied.tx.power_balance = desired.power_balance;
            Ok(())
        }
        dir_changed::TIMESTAMP => {
            match dir {
                Direction::Tx => tx.seed_timestamp(desired.timestamp),
                Direction::Rx => rx.seed_timestamp(desired.timestamp),
            }
            applied.dir_mut(dir).timestamp = desired.timestamp;
            Ok(())
        }
        dir_changed::RF_ENABLED => {
            let on = desired.rf_enabled;
            if on == applied.dir(dir).rf_enabled {
                return Ok(());
            }
            if on && (applied.tx.sample_rate_hz == 0 || applied.rx.sample_rate_hz == 0) {
                return Err(DeviceError::failure(
                    "both sample rates must be set before RF enable",
                ));
            }
            let request = match dir {
                Direction::Tx => vendor::RF_TX,
                Direction::Rx => vendor::RF_RX,
            };
            dev.xcvr.set_soft_enable(dir, on)?;
            dev.usb
                .vendor_out(request, u16::from(on), 0, &[], CTRL_TIMEOUT)?;
            applied.dir_mut(dir).rf_enabled = on;
            Ok(())
        }
        _ => Err(DeviceError::failure(format!(
            "unknown {} state bit 0x{bit:x}",
            dir.name()
        ))),
    }
}

fn apply_common_field(
    dev: &Device,
    applied: &mut DevState,
    tx: &mut TxPath,
    rx: &mut RxPath,
    want: &DevState,
    bit: u32,
) -> Result<()> {
    match bit {
        common_changed::LOOPBACK => {
            if want.loopback == applied.loopback && want.loopback_params == applied.loopback_params
            {
                return Ok(());
            }
            apply_loopback(dev, applied, want)?;
            applied.loopback = want.loopback;
            applied.loopback_params = want.loopback_params;
            Ok(())
        }
        common_changed::RX_DC_AUTO => {
            if want.rx_dc_auto == applied.rx_dc_auto {
                return Ok(());
            }
            dev.tunables.rcu(|t| {
                let mut t = (**t).clone();
                t.rx_dc_autocorrect = want.rx_dc_auto;
                t
            });
            if !want.rx_dc_auto {
                rx.disable_dc_auto();
            }
            applied.rx_dc_auto = want.rx_dc_auto;
            Ok(())
        }
        common_changed::TX_PATTERN => {
            if want.tx_pattern == applied.tx_pattern
                && want.tx_pattern_gain == applied.tx_pattern_gain
            {
                return Ok(());
            }
            tx.set_pattern(want.tx_pattern.clone(), want.tx_pattern_gain);
            applied.tx_pattern = want.tx_pattern.clone();
            applied.tx_pattern_gain = want.tx_pattern_gain;
            Ok(())
        }
        _ => Err(DeviceError::failure(format!(
            "unknown common state bit 0x{bit:x}"
        ))),
    }
}

/// Loopback routing. The path switch itself tears everything down first
/// (every transition passes through the all-off state); on return to
/// straight-through operation the band amplifiers and receive gains are
/// restored from the realized state.
fn apply_loopback(dev: &Device, applied: &DevState, want: &DevState) -> Result<()> {
    let mode = want.loopback;
    // Firmware sample loopback rides a GPIO bit; RF is left alone.
    dev.bus.change_bits(
        PeriphDev::Gpio,
        gpio::FW_LOOPBACK,
        0x01,
        u8::from(mode == LoopbackMode::Firmware),
    )?;
    dev.xcvr.loopback_path(mode)?;
    if mode == LoopbackMode::None {
        if applied.tx.rf_enabled && applied.tx.frequency_hz != 0 {
            dev.xcvr.pa_select(if applied.tx.frequency_hz < BAND_SPLIT_HZ {
                PaSel::Pa1
            } else {
                PaSel::Pa2
            })?;
        }
        if applied.rx.frequency_hz != 0 {
            dev.xcvr
                .lna_select(Some(if applied.rx.frequency_hz < BAND_SPLIT_HZ {
                    1
                } else {
                    2
                }))?;
        }
        dev.xcvr.lna_gain_set(LnaGain::Max)?;
        dev.xcvr.set_vga(Direction::Rx, 1, applied.rx.vga1)?;
        dev.xcvr.set_vga(Direction::Rx, 2, applied.rx.vga2)?;
    } else {
        let params = &want.loopback_params;
        if let Some(gain) = params.lna_gain {
            dev.xcvr.lna_gain_set(gain)?;
        }
        if let Some(v) = params.rx_vga1 {
            dev.xcvr.set_vga(Direction::Rx, 1, v)?;
        }
        if let Some(v) = params.rx_vga2 {
            dev.xcvr.set_vga(Direction::Rx, 2, v)?;
        }
    }
    Ok(())
}
