// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Ingress control-message surface.
//!
//! The host control bus delivers named operations with `key=value`
//! parameters; replies are `key=value` lists. Setter operations accept a
//! `value` parameter and reply with the value actually realized; without
//! `value` they act as getters. Operation failures propagate as
//! [`DeviceError`] with a formatted context - runtime failures outside
//! [`crate::error::FATAL_ERROR_MASK`] never disable streaming.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cal::predist::{build_table, AmpModel};
use crate::device::{monotonic_us, Device};
use crate::dump::{FileDumper, TemplateVars};
use crate::error::{DeviceError, Result};
use crate::periph::PeriphDev;
use crate::state::{Direction, LoopbackMode, LoopbackParams, TxPattern};
use crate::xcvr::{CorrKind, IqBranch};

/// `key=value` parameter / reply list.
pub type Params = Vec<(String, String)>;

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn require<'a>(params: &'a [(String, String)], name: &str) -> Result<&'a str> {
    param(params, name)
        .ok_or_else(|| DeviceError::missing_param(format!("parameter '{name}' required")))
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| DeviceError::parser(format!("parameter '{name}'='{raw}' unparseable")))
}

fn num_param<T: std::str::FromStr>(params: &[(String, String)], name: &str) -> Result<Option<T>> {
    match param(params, name) {
        None => Ok(None),
        Some(raw) => parse_num(name, raw).map(Some),
    }
}

fn required_num<T: std::str::FromStr>(params: &[(String, String)], name: &str) -> Result<T> {
    parse_num(name, require(params, name)?)
}

fn kv(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

/// Control-message dispatcher bound to one device.
pub struct ControlSurface {
    dev: Arc<Device>,
    /// Staged amplifier model for `gainexp`/`phaseexp`.
    amp: Mutex<AmpModel>,
}

impl ControlSurface {
    /// Bind to a device.
    #[must_use]
    pub fn new(dev: Arc<Device>) -> Self {
        Self {
            dev,
            amp: Mutex::new(AmpModel {
                gain_exp_breakpoint: 2.0,
                gain_exp_slope: 0.0,
                phase_exp_breakpoint: 2.0,
                phase_exp_slope: 0.0,
            }),
        }
    }

    /// Dispatch one operation.
    pub fn handle(&self, op: &str, params: &[(String, String)]) -> Result<Params> {
        match op {
            "txgain1" => self.gain(Direction::Tx, 1, params),
            "txgain2" => self.gain(Direction::Tx, 2, params),
            "rxgain1" => self.gain(Direction::Rx, 1, params),
            "rxgain2" => self.gain(Direction::Rx, 2, params),
            "txdci" => self.dc(Direction::Tx, IqBranch::I, params),
            "txdcq" => self.dc(Direction::Tx, IqBranch::Q, params),
            "rxdci" => self.dc(Direction::Rx, IqBranch::I, params),
            "rxdcq" => self.dc(Direction::Rx, IqBranch::Q, params),
            "txfpgaphase" => self.corr(Direction::Tx, CorrKind::Phase, params),
            "txfpgagain" => self.corr(Direction::Tx, CorrKind::Gain, params),
            "rxfpgaphase" => self.corr(Direction::Rx, CorrKind::Phase, params),
            "rxfpgagain" => self.corr(Direction::Rx, CorrKind::Gain, params),
            "txfreq" => self.freq(Direction::Tx, params),
            "rxfreq" => self.freq(Direction::Rx, params),
            "balance" => self.balance(params),
            "loopback" => self.loopback(params),
            "gainexp" => self.amp_exp(params, true),
            "phaseexp" => self.amp_exp(params, false),
            "lmswrite" => self.lms_write(params),
            "bufoutput" => self.buf_output(params),
            "rxdcoutput" => self.rx_dc_output(params),
            "txpattern" => self.tx_pattern(params),
            "show" => self.show(params),
            "freqoffs" => self.freq_offset(params),
            "freqcalstart" => self.freqcal_start(params),
            "freqcalstop" => self.freqcal_stop(),
            "calibrate" => {
                self.dev.calibrate_async()?;
                Ok(vec![kv("calibrating", 1)])
            }
            "cal_stop" => {
                self.dev.cal.request_stop(false);
                Ok(vec![kv("cal_stop", 1)])
            }
            "cal_abort" => {
                self.dev.cal.request_stop(true);
                Ok(vec![kv("cal_abort", 1)])
            }
            other => Err(DeviceError::not_supported(format!(
                "unknown operation '{other}'"
            ))),
        }
    }

    fn gain(&self, dir: Direction, stage: u8, params: &[(String, String)]) -> Result<Params> {
        if let Some(value) = num_param::<i32>(params, "value")? {
            self.dev.set_vga(dir, stage, value)?;
        }
        let current = self.dev.xcvr.get_vga(dir, stage)?;
        Ok(vec![kv(&format!("{}gain{stage}", dir.name()), current)])
    }

    fn dc(&self, dir: Direction, branch: IqBranch, params: &[(String, String)]) -> Result<Params> {
        if let Some(value) = num_param::<i32>(params, "value")? {
            self.dev.set_dc_offset(dir, branch, value)?;
        }
        let current = self.dev.xcvr.get_dc_offset(dir, branch)?;
        let key = format!(
            "{}dc{}",
            dir.name(),
            if branch == IqBranch::I { "i" } else { "q" }
        );
        Ok(vec![kv(&key, current)])
    }

    fn corr(&self, dir: Direction, kind: CorrKind, params: &[(String, String)]) -> Result<Params> {
        if let Some(value) = num_param::<i32>(params, "value")? {
            self.dev.set_fpga_corr(dir, kind, value)?;
        }
        let applied = self.dev.applied_state();
        let value = match kind {
            CorrKind::Phase => applied.dir(dir).fpga_corr_phase,
            CorrKind::Gain => applied.dir(dir).fpga_corr_gain,
        };
        let key = format!(
            "{}fpga{}",
            dir.name(),
            if kind == CorrKind::Phase { "phase" } else { "gain" }
        );
        Ok(vec![kv(&key, value)])
    }

    /// Tune and read back; a request off the PLL's fractional grid is
    /// reported as `NotExact` with the realized value in the context.
    fn freq(&self, dir: Direction, params: &[(String, String)]) -> Result<Params> {
        if let Some(hz) = num_param::<u64>(params, "value")? {
            self.dev.set_frequency(dir, hz)?;
            if !crate::xcvr::pll::tuning_exact(hz)? {
                let realized = self.dev.get_frequency(dir)?;
                return Err(DeviceError::not_exact(format!(
                    "{} frequency requested {hz} Hz, realized {realized} Hz",
                    dir.name()
                )));
            }
        }
        Ok(vec![kv(
            &format!("{}freq", dir.name()),
            self.dev.get_frequency(dir)?,
        )])
    }

    fn balance(&self, params: &[(String, String)]) -> Result<Params> {
        if let Some(value) = num_param::<f64>(params, "value")? {
            self.dev.set_power_balance(value)?;
        }
        Ok(vec![kv("balance", self.dev.applied_state().tx.power_balance)])
    }

    fn loopback(&self, params: &[(String, String)]) -> Result<Params> {
        if let Some(name) = param(params, "value") {
            let mode = LoopbackMode::parse(name)?;
            self.dev.set_loopback(mode, LoopbackParams::default())?;
        }
        Ok(vec![kv("loopback", self.dev.applied_state().loopback.name())])
    }

    /// Stage an amplifier-model parameter and rebuild the TX table. A zero
    /// slope with the default breakpoint disables pre-distortion.
    fn amp_exp(&self, params: &[(String, String)], gain: bool) -> Result<Params> {
        let breakpoint: f64 = required_num(params, "breakpoint")?;
        let slope: f64 = required_num(params, "slope")?;
        let mut model = self.amp.lock();
        if gain {
            model.gain_exp_breakpoint = breakpoint;
            model.gain_exp_slope = slope;
        } else {
            model.phase_exp_breakpoint = breakpoint;
            model.phase_exp_slope = slope;
        }
        let active = model.gain_exp_slope != 0.0 || model.phase_exp_slope != 0.0;
        let table = active.then(|| Arc::new(build_table(&model)));
        self.dev.tx.lock().set_predist(table);
        Ok(vec![kv(if gain { "gainexp" } else { "phaseexp" }, slope)])
    }

    fn lms_write(&self, params: &[(String, String)]) -> Result<Params> {
        let addr: u8 = required_num(params, "addr")?;
        let value: u8 = required_num(params, "value")?;
        self.dev.bus.write_reg(PeriphDev::Xcvr, addr, value)?;
        Ok(vec![kv("lmswrite", format!("0x{addr:02x}=0x{value:02x}"))])
    }

    fn buf_output(&self, params: &[(String, String)]) -> Result<Params> {
        let dir = match param(params, "direction").unwrap_or("rx") {
            "tx" => Direction::Tx,
            _ => Direction::Rx,
        };
        let mut dumps = self.dev.dumps.lock();
        let slot = match dir {
            Direction::Tx => &mut dumps.tx,
            Direction::Rx => &mut dumps.rx,
        };
        match param(params, "file") {
            Some(template) => {
                let vars = TemplateVars {
                    serial: self.dev.serial().to_string(),
                    fields: params.to_vec(),
                };
                *slot = Some(FileDumper::create(
                    template,
                    param(params, "header"),
                    &vars,
                )?);
                Ok(vec![kv("bufoutput", 1)])
            }
            None => {
                *slot = None;
                Ok(vec![kv("bufoutput", 0)])
            }
        }
    }

    fn rx_dc_output(&self, params: &[(String, String)]) -> Result<Params> {
        let count: i32 = num_param(params, "count")?.unwrap_or(10);
        self.dev.rx.lock().set_dc_debug_count(count);
        Ok(vec![kv("rxdcoutput", count)])
    }

    fn tx_pattern(&self, params: &[(String, String)]) -> Result<Params> {
        let gain: f32 = num_param(params, "gain")?.unwrap_or(1.0);
        let pattern = match require(params, "value")? {
            "off" | "none" => TxPattern::Off,
            "circle" => TxPattern::Circle,
            "zero" => TxPattern::Zero,
            other => {
                // Comma-separated I/Q floats: "i0,q0,i1,q1,...".
                let floats: std::result::Result<Vec<f32>, _> =
                    other.split(',').map(|v| v.trim().parse::<f32>()).collect();
                let floats = floats.map_err(|_| {
                    DeviceError::parser(format!("txpattern '{other}' is not a known pattern"))
                })?;
                if floats.len() < 2 || floats.len() % 2 != 0 {
                    return Err(DeviceError::parser("txpattern vector needs I/Q pairs"));
                }
                TxPattern::Vector(Arc::new(
                    floats
                        .chunks(2)
                        .map(|p| crate::dsp::Cf32::new(p[0], p[1]))
                        .collect(),
                ))
            }
        };
        self.dev.set_tx_pattern(pattern, gain)?;
        Ok(vec![kv("txpattern", 1)])
    }

    fn freq_offset(&self, params: &[(String, String)]) -> Result<Params> {
        if let Some(value) = num_param::<f64>(params, "value")? {
            self.dev.set_freq_offset(value)?;
        }
        Ok(vec![kv("RadioFrequencyOffset", format!("{:.2}", self.dev.freq_offset()))])
    }

    fn freqcal_start(&self, params: &[(String, String)]) -> Result<Params> {
        let count: i32 = num_param(params, "count")?.unwrap_or(-1);
        let accuracy: Option<u64> = num_param(params, "system_accuracy")?;
        self.dev
            .discipline
            .lock()
            .start(count, accuracy, monotonic_us());
        Ok(vec![kv("freqcalstart", count)])
    }

    fn freqcal_stop(&self) -> Result<Params> {
        self.dev.discipline.lock().stop();
        Ok(vec![kv("freqcalstop", 1)])
    }

    // ------------------------------------------------------------------
    // show
    // ------------------------------------------------------------------

    fn show(&self, params: &[(String, String)]) -> Result<Params> {
        match param(params, "value").unwrap_or("status") {
            "status" => Ok(self.show_status()),
            "boardstatus" => Ok(self.show_boardstatus()),
            "statistics" => Ok(self.show_statistics()),
            "timestamps" => Ok(self.show_timestamps()),
            "freqcal" => Ok(self.dev.discipline.lock().status()),
            "lms" => self.show_lms(),
            "loopback" => self.show_loopback(),
            "peripheral" => self.show_peripheral(),
            other => Err(DeviceError::parser(format!("unknown show view '{other}'"))),
        }
    }

    fn show_status(&self) -> Params {
        let s = self.dev.applied_state();
        let info = self.dev.board_info();
        vec![
            kv("serial", self.dev.serial()),
            kv("speed", self.dev.speed().name()),
            kv("initialized", u8::from(self.dev.is_initialized())),
            kv("firmware", info.fw_version),
            kv("txfreq", s.tx.frequency_hz),
            kv("rxfreq", s.rx.frequency_hz),
            kv("txrate", s.tx.sample_rate_hz),
            kv("rxrate", s.rx.sample_rate_hz),
            kv("txrf", u8::from(s.tx.rf_enabled)),
            kv("rxrf", u8::from(s.rx.rf_enabled)),
            kv("loopback", s.loopback.name()),
            kv("RadioFrequencyOffset", format!("{:.2}", self.dev.freq_offset())),
        ]
    }

    fn show_boardstatus(&self) -> Params {
        let info = self.dev.board_info();
        let (bus, address) = self.dev.usb.bus_address();
        let mut out = vec![
            kv("address", format!("{bus:03}/{address:03}")),
            kv("fpga_version", format!("0x{:08x}", info.fpga_version)),
            kv("chip_revision", info.chip_revision),
        ];
        if let Some(md5) = info.fpga_md5 {
            out.push(kv("fpga_md5", md5));
        }
        if let Some(path) = info.fpga_path {
            out.push(kv("fpga_file", path.display()));
        }
        out
    }

    fn show_statistics(&self) -> Params {
        let tx = self.dev.tx.lock().stats();
        let rx = self.dev.rx.lock().stats();
        vec![
            kv("tx_samples", tx.sent_samples),
            kv("tx_clamped", tx.clamped),
            kv("tx_frames", tx.submitted_frames),
            kv("tx_ts_mismatches", tx.ts_mismatches),
            kv("tx_silence_filled", tx.silence_filled),
            kv("rx_samples", rx.received_samples),
            kv("rx_padded", rx.padded_zeros),
            kv("rx_discarded", rx.discarded_past),
            kv("rx_resyncs", rx.resyncs),
            kv("rx_dc_steps", rx.dc_steps),
        ]
    }

    fn show_timestamps(&self) -> Params {
        vec![
            kv("tx_ts", self.dev.tx.lock().stream_pos()),
            kv("rx_ts", self.dev.rx.lock().stream_pos()),
        ]
    }

    fn show_lms(&self) -> Result<Params> {
        let dump = self.dev.xcvr.dump()?;
        Ok(dump
            .iter()
            .enumerate()
            .map(|(addr, value)| kv(&format!("0x{addr:02x}"), format!("0x{value:02x}")))
            .collect())
    }

    fn show_loopback(&self) -> Result<Params> {
        use crate::xcvr::regs;
        let rf = self.dev.bus.read_reg(PeriphDev::Xcvr, regs::LOOPBACK_RF)?;
        let bb = self.dev.bus.read_reg(PeriphDev::Xcvr, regs::LOOPBACK_BB)?;
        Ok(vec![
            kv("mode", self.dev.applied_state().loopback.name()),
            kv("rf_switch", format!("0x{rf:02x}")),
            kv("bb_switch", format!("0x{bb:02x}")),
        ])
    }

    fn show_peripheral(&self) -> Result<Params> {
        let mut regs = [0u8; 0x20];
        self.dev.bus.read(PeriphDev::Gpio, 0, &mut regs)?;
        Ok(regs
            .iter()
            .enumerate()
            .map(|(addr, value)| kv(&format!("gpio_0x{addr:02x}"), format!("0x{value:02x}")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MapEnv};
    use crate::error::ErrorKind;
    use crate::events::NullSink;
    use crate::usb::mock::MockBoard;
    use crate::usb::UsbSpeed;

    fn surface() -> (Arc<MockBoard>, ControlSurface) {
        let board = Arc::new(MockBoard::new(UsbSpeed::Super));
        let dev = Device::open_with_backend(
            Config::default(),
            Arc::new(MapEnv::new()),
            Arc::new(NullSink),
            board.clone(),
        )
        .expect("open");
        dev.initialize().expect("initialize");
        (board, ControlSurface::new(dev))
    }

    fn p(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_gain_set_and_get() {
        let (_board, ctl) = surface();
        let reply = ctl
            .handle("rxgain2", &p(&[("value", "12")]))
            .expect("set gain");
        assert_eq!(reply[0], ("rxgain2".to_string(), "12".to_string()));
        let reply = ctl.handle("rxgain2", &[]).expect("get gain");
        assert_eq!(reply[0].1, "12");
    }

    #[test]
    fn test_dc_roundtrip_via_ops() {
        let (_board, ctl) = surface();
        let reply = ctl
            .handle("rxdci", &p(&[("value", "-33")]))
            .expect("set dc");
        assert_eq!(reply[0].1, "-33");
    }

    #[test]
    fn test_missing_and_bad_params() {
        let (_board, ctl) = surface();
        let err = ctl.handle("lmswrite", &[]).expect_err("missing addr");
        assert_eq!(err.kind, ErrorKind::MissingParam);
        let err = ctl
            .handle("lmswrite", &p(&[("addr", "oops"), ("value", "1")]))
            .expect_err("bad addr");
        assert_eq!(err.kind, ErrorKind::Parser);
    }

    #[test]
    fn test_unknown_op() {
        let (_board, ctl) = surface();
        let err = ctl.handle("warpdrive", &[]).expect_err("unknown");
        assert_eq!(err.kind, ErrorKind::NotSupported);
    }

    #[test]
    fn test_show_status_keys() {
        let (_board, ctl) = surface();
        let reply = ctl.handle("show", &p(&[("value", "status")])).expect("show");
        assert!(reply.iter().any(|(k, _)| k == "serial"));
        assert!(reply.iter().any(|(k, _)| k == "RadioFrequencyOffset"));
    }

    #[test]
    fn test_freq_not_exact() {
        let (_board, ctl) = surface();
        // 915_000_123 is not on the PLL grid: the op reports NotExact.
        let err = ctl
            .handle("txfreq", &p(&[("value", "915000123")]))
            .expect_err("off-grid");
        assert_eq!(err.kind, ErrorKind::NotExact);
        assert!(err.context.contains("realized"));
        // On-grid request: 960 MHz * x=4 is a multiple of the reference.
        let reply = ctl
            .handle("txfreq", &p(&[("value", "960000000")]))
            .expect("on-grid");
        assert_eq!(reply[0].1, "960000000");
    }

    #[test]
    fn test_freqcal_start_stop() {
        let (_board, ctl) = surface();
        ctl.handle("freqcalstart", &p(&[("count", "5")])).expect("start");
        let reply = ctl.handle("show", &p(&[("value", "freqcal")])).expect("show");
        assert!(reply.iter().any(|(k, v)| k == "trims_left" && v == "5"));
        ctl.handle("freqcalstop", &[]).expect("stop");
        let reply = ctl.handle("show", &p(&[("value", "freqcal")])).expect("show");
        assert!(reply.iter().any(|(k, v)| k == "trims_left" && v == "0"));
    }

    #[test]
    fn test_txpattern_vector_parse() {
        let (_board, ctl) = surface();
        ctl.handle("txpattern", &p(&[("value", "1.0,0.0,0.0,1.0")]))
            .expect("vector");
        let err = ctl
            .handle("txpattern", &p(&[("value", "1.0,0.0,0.5")]))
            .expect_err("odd length");
        assert_eq!(err.kind, ErrorKind::Parser);
    }
}
