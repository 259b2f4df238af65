// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! On-chip DC auto-calibration.
//!
//! The transceiver carries one DC calibration engine per analog block, all
//! with the same register layout at different bases. The fixed submodule
//! order is: LPF tuning, LPF bandwidth (its own procedure), TX LPF I/Q,
//! RX LPF I/Q, then the five RX VGA2 stages.
//!
//! Engine procedure per submodule: select it in the control register, write
//! the comparator count, pulse LOAD, pulse START, poll the busy flag (up to
//! 30 x 1 ms), then read the result. A result of 31 on the first run gets
//! one retry; a result of 0 means the loop never converged and fails the
//! module. Touched registers are restored afterwards.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, info};

use super::CalControl;
use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::periph::PeriphDev;
use crate::xcvr::regs;

/// Busy-flag poll attempts (1 ms apart).
const DONE_POLLS: u32 = 30;

/// One auto-calibration module.
struct CalModule {
    name: &'static str,
    base: u8,
    submodules: u8,
    clk_bit: u8,
}

/// The ordered module list (LPF bandwidth runs separately in between).
const MODULES: [CalModule; 4] = [
    CalModule {
        name: "lpf_tuning",
        base: regs::DCCAL_LPF_TUNING,
        submodules: 1,
        clk_bit: regs::CLK_EN_LPF_TUNING,
    },
    CalModule {
        name: "tx_lpf",
        base: regs::DCCAL_TX_LPF,
        submodules: 2,
        clk_bit: regs::CLK_EN_TX_LPF,
    },
    CalModule {
        name: "rx_lpf",
        base: regs::DCCAL_RX_LPF,
        submodules: 2,
        clk_bit: regs::CLK_EN_RX_LPF,
    },
    CalModule {
        name: "rx_vga2",
        base: regs::DCCAL_RX_VGA2,
        submodules: 5,
        clk_bit: regs::CLK_EN_RX_VGA2,
    },
];

/// TX PLL words for the 320 MHz LPF calibration clock.
const LPFCAL_PLL_NINT: u32 = 133;
const LPFCAL_PLL_NFRAC: u32 = 2_796_203;

fn cal_one_submodule(dev: &Device, module: &CalModule, submodule: u8) -> Result<u8> {
    let bus = &dev.bus;
    let base = module.base;
    let select = submodule & regs::DCCAL_CTRL_ADDR_MASK;

    let run = |_attempt: u32| -> Result<u8> {
        bus.write_reg(PeriphDev::Xcvr, base + regs::DCCAL_CTRL, select)?;
        bus.write_reg(PeriphDev::Xcvr, base + regs::DCCAL_CNTVAL, 31)?;
        bus.write_reg(
            PeriphDev::Xcvr,
            base + regs::DCCAL_CTRL,
            select | regs::DCCAL_CTRL_LOAD,
        )?;
        bus.write_reg(PeriphDev::Xcvr, base + regs::DCCAL_CTRL, select)?;
        bus.write_reg(
            PeriphDev::Xcvr,
            base + regs::DCCAL_CTRL,
            select | regs::DCCAL_CTRL_START,
        )?;
        bus.write_reg(PeriphDev::Xcvr, base + regs::DCCAL_CTRL, select)?;
        let mut done = false;
        for _ in 0..DONE_POLLS {
            let status = bus.read_reg(PeriphDev::Xcvr, base + regs::DCCAL_STATUS)?;
            if status & regs::DCCAL_STATUS_BUSY == 0 {
                done = true;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if !done {
            return Err(DeviceError::timeout(format!(
                "{}[{submodule}]: calibration busy flag never cleared",
                module.name
            )));
        }
        Ok(bus.read_reg(PeriphDev::Xcvr, base + regs::DCCAL_REGVAL)? & 0x3f)
    };

    let mut value = run(0)?;
    if value == 31 {
        debug!("{}[{submodule}]: railed at 31, retrying", module.name);
        value = run(1)?;
    }
    if value == 0 {
        return Err(DeviceError::failure(format!(
            "{}[{submodule}]: DC calibration does not converge",
            module.name
        )));
    }
    debug!("{}[{submodule}]: DC word {value}", module.name);
    Ok(value)
}

fn cal_module(dev: &Device, module: &CalModule) -> Result<()> {
    let backup = dev.xcvr.backup(&[
        regs::CLK_EN,
        module.base + regs::DCCAL_CTRL,
        module.base + regs::DCCAL_CNTVAL,
    ])?;
    dev.bus
        .set_bits(PeriphDev::Xcvr, regs::CLK_EN, module.clk_bit)?;
    let result = (|| {
        for submodule in 0..module.submodules {
            cal_one_submodule(dev, module, submodule)?;
        }
        Ok(())
    })();
    dev.xcvr.restore(&backup)?;
    result
}

/// LPF bandwidth tuning: the TX PLL is parked at 320 MHz to clock the RC
/// calibrator, the result is latched into the calibration control field,
/// and the PLL words are restored.
fn cal_lpf_bandwidth(dev: &Device) -> Result<()> {
    let pll = regs::PLL_TX_BASE;
    let backup = dev.xcvr.backup(&[
        pll,
        pll + 1,
        pll + 2,
        pll + 3,
        regs::LPFCAL_CTRL,
        regs::CLK_EN,
    ])?;
    let result = (|| {
        dev.bus
            .set_bits(PeriphDev::Xcvr, regs::CLK_EN, regs::CLK_EN_LPF_TUNING)?;
        let burst = [
            (LPFCAL_PLL_NINT >> 1) as u8,
            (((LPFCAL_PLL_NINT & 1) << 7) as u8) | ((LPFCAL_PLL_NFRAC >> 16) & 0x7f) as u8,
            (LPFCAL_PLL_NFRAC >> 8) as u8,
            LPFCAL_PLL_NFRAC as u8,
        ];
        dev.bus.write(PeriphDev::Xcvr, pll + regs::PLL_NINT, &burst)?;
        dev.bus
            .set_bits(PeriphDev::Xcvr, regs::LPFCAL_CTRL, regs::LPFCAL_EN)?;
        dev.bus
            .set_bits(PeriphDev::Xcvr, regs::LPFCAL_CTRL, regs::LPFCAL_RESET)?;
        dev.bus
            .clear_bits(PeriphDev::Xcvr, regs::LPFCAL_CTRL, regs::LPFCAL_RESET)?;
        let rccal = dev.bus.read_reg(PeriphDev::Xcvr, regs::LPFCAL_RCCAL)? & 0x0f;
        debug!("lpf_bandwidth: RCCAL {rccal}");
        dev.bus
            .change_bits(PeriphDev::Xcvr, regs::LPFCAL_CTRL, 0x70, (rccal & 0x07) << 4)?;
        Ok(())
    })();
    dev.xcvr.restore(&backup)?;
    result
}

/// Run the complete on-chip auto-calibration sequence.
pub fn lms_autocal(dev: &Arc<Device>, ctl: &CalControl) -> Result<()> {
    info!("lms autocal: starting on '{}'", dev.serial());
    cal_module(dev, &MODULES[0])?;
    ctl.check_stop()?;
    cal_lpf_bandwidth(dev)?;
    for module in &MODULES[1..] {
        ctl.check_stop()?;
        cal_module(dev, module)?;
    }
    info!("lms autocal: complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::NullSink;
    use crate::usb::mock::MockBoard;
    use crate::usb::UsbSpeed;
    use crate::config::MapEnv;

    fn device(board: &Arc<MockBoard>) -> Arc<Device> {
        Device::open_with_backend(
            Config::default(),
            Arc::new(MapEnv::new()),
            Arc::new(NullSink),
            board.clone(),
        )
        .expect("open")
    }

    #[test]
    fn test_autocal_happy_path() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let dev = device(&board);
        let ctl = CalControl::new();
        ctl.begin().expect("begin");
        lms_autocal(&dev, &ctl).expect("autocal");
    }

    #[test]
    fn test_autocal_retry_on_31() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        board.with_state(|st| st.dccal_first_31 = true);
        let dev = device(&board);
        let ctl = CalControl::new();
        ctl.begin().expect("begin");
        lms_autocal(&dev, &ctl).expect("autocal with retries");
    }

    #[test]
    fn test_autocal_fails_on_zero() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        board.with_state(|st| st.dccal_fail = true);
        let dev = device(&board);
        let ctl = CalControl::new();
        ctl.begin().expect("begin");
        let err = lms_autocal(&dev, &ctl).expect_err("must fail");
        assert!(err.context.contains("does not converge"));
    }

    #[test]
    fn test_registers_restored() {
        let board = Arc::new(MockBoard::new(UsbSpeed::High));
        let dev = device(&board);
        let clk_before = board.lms_reg(regs::CLK_EN);
        let ctl = CalControl::new();
        ctl.begin().expect("begin");
        lms_autocal(&dev, &ctl).expect("autocal");
        assert_eq!(board.lms_reg(regs::CLK_EN), clk_before);
    }
}
