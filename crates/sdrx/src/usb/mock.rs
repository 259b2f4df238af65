// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Emulated board for tests and hardware-less bring-up.
//!
//! [`MockBoard`] implements [`UsbBackend`] over an in-memory model of the
//! four peripherals: register files plus the handful of behaviors the driver
//! actually probes - the PLL VTUNE comparators, the on-chip DC calibration
//! engines, the GPIO timestamp snapshot, FPGA programming and the vendor
//! commands. Every peripheral write is recorded in order, so tests can
//! assert on sequences (e.g. that loopback transitions open every switch
//! before routing a new path).
//!
//! RX sample content comes from an installable generator closure with full
//! access to the board state, which is how loopback calibration tests model
//! the RF path.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use super::{vendor, AltSetting, CancelToken, Endpoint, UsbBackend, UsbSpeed};
use crate::device::calcache::{encode_page, CAL_PAGE_LEN};
use crate::error::{DeviceError, Result};
use crate::frame::{
    frame_len, parse_header, read_sample, samples_per_buffer, write_header, write_sample,
    HEADER_LEN,
};
use crate::periph::{gpio, parse_cmd_frame, pack_cmd_frame, CmdFrame, PeriphDev, CMD_FRAME_LEN};
use crate::xcvr::regs;

/// One transmitted sample frame as seen by the board.
#[derive(Debug, Clone)]
pub struct TxFrame {
    /// Frame timestamp.
    pub ts: u64,
    /// IQ payload.
    pub iq: Vec<(i16, i16)>,
}

/// RX payload generator: `(board, frame_ts, samples)` to IQ pairs.
pub type RxGenerator = Box<dyn FnMut(&mut BoardState, u64, usize) -> Vec<(i16, i16)> + Send>;

/// Device sample-counter source for the GPIO timestamp snapshot.
pub type TimestampSource = Box<dyn FnMut() -> u64 + Send>;

/// Mutable board model. Public so RX generators installed by tests can read
/// the registers the driver has programmed.
pub struct BoardState {
    /// Current alternate setting.
    pub alt: AltSetting,
    /// GPIO block registers.
    pub gpio: [u8; 256],
    /// Transceiver registers.
    pub lms: [u8; 128],
    /// Clock synthesizer registers.
    pub synth: [u8; 256],
    /// VCTCXO DAC registers (16-bit word in 0..=1).
    pub dac_regs: [u8; 2],
    /// Every DAC word written, in order.
    pub dac_history: Vec<u16>,
    /// RX RF front end on.
    pub rf_rx_on: bool,
    /// TX RF front end on.
    pub rf_tx_on: bool,
    /// FPGA configured.
    pub fpga_loaded: bool,
    /// Accumulated bitstream while programming.
    pub fpga_blob: Vec<u8>,
    /// Programming in progress.
    pub programming: bool,
    /// Calibration cache page.
    pub cal_page: [u8; CAL_PAGE_LEN],
    /// Firmware version string.
    pub fw_version: String,
    /// Ordered log of peripheral writes.
    pub writes: Vec<(PeriphDev, u8, u8)>,
    /// Queued control responses.
    ctrl_responses: VecDeque<[u8; CMD_FRAME_LEN]>,
    /// Transmitted sample frames.
    pub tx_frames: Vec<TxFrame>,
    /// Next RX frame timestamp when the script is empty.
    pub rx_next_ts: u64,
    /// Scripted RX frame timestamps (consumed first).
    pub rx_ts_script: VecDeque<u64>,
    /// RX payload generator.
    rx_gen: Option<RxGenerator>,
    /// Device sample counter source.
    ts_source: Option<TimestampSource>,
    ts_counter: u64,
    /// DC cal engines report 31 on the first run of each submodule.
    pub dccal_first_31: bool,
    /// DC cal engines fail (result 0).
    pub dccal_fail: bool,
    /// Converged DC cal result.
    pub dccal_result: u8,
    dccal_seen: HashSet<(u8, u8)>,
}

impl BoardState {
    fn new() -> Self {
        let mut gpio = [0u8; 256];
        // FPGA image version 0.7.1 as a LE word.
        gpio[gpio::FPGA_VERSION as usize..gpio::FPGA_VERSION as usize + 4]
            .copy_from_slice(&0x0007_0001u32.to_le_bytes());
        Self {
            alt: AltSetting::Idle,
            gpio,
            lms: [0u8; 128],
            synth: [0u8; 256],
            dac_regs: [0u8; 2],
            dac_history: Vec::new(),
            rf_rx_on: false,
            rf_tx_on: false,
            fpga_loaded: true,
            fpga_blob: Vec::new(),
            programming: false,
            cal_page: encode_page(&[("B", "40"), ("DAC.DAC_TRIM", "32768")]),
            fw_version: "fw 2.1.0".to_string(),
            writes: Vec::new(),
            ctrl_responses: VecDeque::new(),
            tx_frames: Vec::new(),
            rx_next_ts: 0,
            rx_ts_script: VecDeque::new(),
            rx_gen: None,
            ts_source: None,
            ts_counter: 0,
            dccal_first_31: false,
            dccal_fail: false,
            dccal_result: 21,
            dccal_seen: HashSet::new(),
        }
    }

    fn pll_ideal_vcocap(&self, base: usize) -> i32 {
        let nint = (u32::from(self.lms[base]) << 1) | u32::from(self.lms[base + 1] >> 7);
        let nfrac = (u32::from(self.lms[base + 1] & 0x7f) << 16)
            | (u32::from(self.lms[base + 2]) << 8)
            | u32::from(self.lms[base + 3]);
        ((nint.wrapping_mul(7) + (nfrac >> 17)) % 40 + 12) as i32
    }

    fn read_lms(&mut self, addr: u8) -> u8 {
        for base in [regs::PLL_TX_BASE, regs::PLL_RX_BASE] {
            if addr == base + regs::PLL_VTUNE {
                let b = base as usize;
                let vcocap = i32::from(self.lms[b + regs::PLL_VCOCAP as usize] & 0x3f);
                let ideal = self.pll_ideal_vcocap(b);
                return if vcocap < ideal - 3 {
                    0x80 // high: capacitance code too low
                } else if vcocap > ideal + 3 {
                    0x40 // low
                } else {
                    0x00
                };
            }
        }
        self.lms[addr as usize]
    }

    fn write_lms(&mut self, addr: u8, value: u8) {
        self.lms[addr as usize] = value;
        // DC calibration engines: a START pulse converges immediately.
        for base in [
            regs::DCCAL_LPF_TUNING,
            regs::DCCAL_TX_LPF,
            regs::DCCAL_RX_LPF,
            regs::DCCAL_RX_VGA2,
        ] {
            if addr == base + regs::DCCAL_CTRL && value & regs::DCCAL_CTRL_START != 0 {
                let submodule = value & regs::DCCAL_CTRL_ADDR_MASK;
                let result = if self.dccal_fail {
                    0
                } else if self.dccal_first_31 && self.dccal_seen.insert((base, submodule)) {
                    31
                } else {
                    self.dccal_result
                };
                self.lms[(base + regs::DCCAL_REGVAL) as usize] = result;
                self.lms[(base + regs::DCCAL_STATUS) as usize] &= !regs::DCCAL_STATUS_BUSY;
            }
        }
        // LPF bandwidth calibration: reset pulse latches a result code.
        if addr == regs::LPFCAL_CTRL && value & regs::LPFCAL_RESET != 0 {
            self.lms[regs::LPFCAL_RCCAL as usize] = 0x05;
        }
    }

    fn device_timestamp(&mut self) -> u64 {
        if let Some(src) = self.ts_source.as_mut() {
            src()
        } else {
            self.ts_counter += 1;
            self.ts_counter
        }
    }

    fn handle_cmd(&mut self, cmd: CmdFrame) {
        if cmd.write {
            for &(addr, value) in &cmd.pairs {
                self.writes.push((cmd.dev, addr, value));
                match cmd.dev {
                    PeriphDev::Gpio => self.gpio[addr as usize] = value,
                    PeriphDev::Xcvr => self.write_lms(addr, value),
                    PeriphDev::ClockSynth => self.synth[addr as usize] = value,
                    PeriphDev::VctcxoDac => {
                        if (addr as usize) < self.dac_regs.len() {
                            self.dac_regs[addr as usize] = value;
                        }
                    }
                }
            }
            if cmd.dev == PeriphDev::VctcxoDac {
                self.dac_history.push(u16::from_le_bytes(self.dac_regs));
            }
            return;
        }
        // Read: snapshot the sample counter once per frame when touched.
        if cmd.dev == PeriphDev::Gpio
            && cmd
                .pairs
                .iter()
                .any(|&(a, _)| (gpio::TIMESTAMP..gpio::TIMESTAMP + 8).contains(&a))
        {
            let ts = self.device_timestamp();
            self.gpio[gpio::TIMESTAMP as usize..gpio::TIMESTAMP as usize + 8]
                .copy_from_slice(&ts.to_le_bytes());
        }
        let pairs: Vec<(u8, u8)> = cmd
            .pairs
            .iter()
            .map(|&(addr, _)| {
                let value = match cmd.dev {
                    PeriphDev::Gpio => self.gpio[addr as usize],
                    PeriphDev::Xcvr => self.read_lms(addr),
                    PeriphDev::ClockSynth => self.synth[addr as usize],
                    PeriphDev::VctcxoDac => {
                        *self.dac_regs.get(addr as usize).unwrap_or(&0)
                    }
                };
                (addr, value)
            })
            .collect();
        self.ctrl_responses
            .push_back(pack_cmd_frame(cmd.dev, false, &pairs));
    }
}

/// Emulated board.
pub struct MockBoard {
    speed: UsbSpeed,
    serial: String,
    state: Mutex<BoardState>,
}

impl MockBoard {
    /// New board at the given link speed, FPGA already configured.
    #[must_use]
    pub fn new(speed: UsbSpeed) -> Self {
        Self {
            speed,
            serial: "MOCK001".to_string(),
            state: Mutex::new(BoardState::new()),
        }
    }

    /// Run a closure against the board state (setup and assertions).
    pub fn with_state<R>(&self, f: impl FnOnce(&mut BoardState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Mark the FPGA unconfigured (cold-open scenarios).
    pub fn set_fpga_unloaded(&self) {
        self.state.lock().fpga_loaded = false;
    }

    /// Replace the calibration cache records.
    pub fn set_cal_records(&self, records: &[(&str, &str)]) {
        self.state.lock().cal_page = encode_page(records);
    }

    /// Install an RX payload generator.
    pub fn set_rx_generator(&self, gen: RxGenerator) {
        self.state.lock().rx_gen = Some(gen);
    }

    /// Install a device sample-counter source.
    pub fn set_timestamp_source(&self, src: TimestampSource) {
        self.state.lock().ts_source = Some(src);
    }

    /// Transmitted frames so far.
    #[must_use]
    pub fn tx_frames(&self) -> Vec<TxFrame> {
        self.state.lock().tx_frames.clone()
    }

    /// Ordered peripheral write log.
    #[must_use]
    pub fn periph_writes(&self) -> Vec<(PeriphDev, u8, u8)> {
        self.state.lock().writes.clone()
    }

    /// Clear the peripheral write log.
    pub fn clear_periph_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// DAC words written so far.
    #[must_use]
    pub fn dac_history(&self) -> Vec<u16> {
        self.state.lock().dac_history.clone()
    }

    /// One transceiver register.
    #[must_use]
    pub fn lms_reg(&self, addr: u8) -> u8 {
        self.state.lock().lms[addr as usize]
    }

    /// One GPIO register.
    #[must_use]
    pub fn gpio_reg(&self, addr: u8) -> u8 {
        self.state.lock().gpio[addr as usize]
    }
}

impl UsbBackend for MockBoard {
    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn serial(&self) -> String {
        self.serial.clone()
    }

    fn bus_address(&self) -> (u8, u8) {
        (1, 42)
    }

    fn set_alt_setting(&self, alt: AltSetting) -> Result<()> {
        self.state.lock().alt = alt;
        Ok(())
    }

    fn vendor_out(
        &self,
        request: u8,
        value: u16,
        _index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<()> {
        let mut st = self.state.lock();
        match request {
            vendor::BEGIN_FPGA_PROGRAM => {
                st.programming = true;
                st.fpga_loaded = false;
                st.fpga_blob.clear();
                Ok(())
            }
            vendor::RF_RX => {
                st.rf_rx_on = value != 0;
                Ok(())
            }
            vendor::RF_TX => {
                st.rf_tx_on = value != 0;
                Ok(())
            }
            other => Err(DeviceError::not_supported(format!(
                "vendor OUT request {other}"
            ))),
        }
    }

    fn vendor_in(
        &self,
        request: u8,
        _value: u16,
        _index: u16,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut st = self.state.lock();
        match request {
            vendor::QUERY_VERSION => {
                let bytes = st.fw_version.clone().into_bytes();
                let n = bytes.len().min(data.len());
                data[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            vendor::QUERY_FPGA_STATUS => {
                if st.programming && !st.fpga_blob.is_empty() {
                    st.programming = false;
                    st.fpga_loaded = true;
                }
                data[0] = u8::from(st.fpga_loaded);
                Ok(1)
            }
            vendor::READ_CAL_CACHE => {
                let n = st.cal_page.len().min(data.len());
                data[..n].copy_from_slice(&st.cal_page[..n]);
                Ok(n)
            }
            other => Err(DeviceError::not_supported(format!(
                "vendor IN request {other}"
            ))),
        }
    }

    fn bulk_out(
        &self,
        ep: Endpoint,
        data: &[u8],
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(DeviceError::cancelled("bulk out"));
        }
        let mut st = self.state.lock();
        match ep {
            Endpoint::TxCtrl => {
                if st.alt == AltSetting::Fpga && st.programming {
                    st.fpga_blob.extend_from_slice(data);
                    return Ok(data.len());
                }
                let cmd = parse_cmd_frame(data)?;
                st.handle_cmd(cmd);
                Ok(data.len())
            }
            Endpoint::TxSamples => {
                let flen = frame_len(self.speed);
                let spb = samples_per_buffer(self.speed);
                if data.len() % flen != 0 {
                    return Err(DeviceError::hardware_io(format!(
                        "sample transfer {} bytes is not a whole number of frames",
                        data.len()
                    )));
                }
                for chunk in data.chunks(flen) {
                    let ts = parse_header(chunk)?;
                    let body = &chunk[HEADER_LEN..];
                    let iq = (0..spb).map(|i| read_sample(body, i)).collect();
                    st.tx_frames.push(TxFrame { ts, iq });
                }
                // Long soak runs (calibration pumps) would grow the log
                // without bound; keep a recent window.
                if st.tx_frames.len() > 8192 {
                    let excess = st.tx_frames.len() - 8192;
                    st.tx_frames.drain(..excess);
                }
                Ok(data.len())
            }
            _ => Err(DeviceError::failure("bulk OUT on an IN endpoint")),
        }
    }

    fn bulk_in(
        &self,
        ep: Endpoint,
        data: &mut [u8],
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(DeviceError::cancelled("bulk in"));
        }
        let mut st = self.state.lock();
        match ep {
            Endpoint::RxCtrl => match st.ctrl_responses.pop_front() {
                Some(frame) => {
                    data[..CMD_FRAME_LEN].copy_from_slice(&frame);
                    Ok(CMD_FRAME_LEN)
                }
                None => Err(DeviceError::timeout("no pending control response")),
            },
            Endpoint::RxSamples => {
                let flen = frame_len(self.speed);
                let spb = samples_per_buffer(self.speed);
                let frames = data.len() / flen;
                if frames == 0 {
                    return Err(DeviceError::failure("RX buffer below one frame"));
                }
                let mut gen = st.rx_gen.take();
                for f in 0..frames {
                    let ts = st
                        .rx_ts_script
                        .pop_front()
                        .unwrap_or(st.rx_next_ts);
                    st.rx_next_ts = ts + spb as u64;
                    let chunk = &mut data[f * flen..(f + 1) * flen];
                    write_header(chunk, ts);
                    let iq = match gen.as_mut() {
                        Some(g) => g(&mut st, ts, spb),
                        None => vec![(0i16, 0i16); spb],
                    };
                    let body = &mut chunk[HEADER_LEN..];
                    for (i, &(iv, qv)) in iq.iter().enumerate().take(spb) {
                        write_sample(body, i, iv, qv);
                    }
                }
                st.rx_gen = gen;
                Ok(frames * flen)
            }
            _ => Err(DeviceError::failure("bulk IN on an OUT endpoint")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::BULK_TIMEOUT;

    fn write_reg(board: &MockBoard, dev: PeriphDev, addr: u8, value: u8) {
        let frame = pack_cmd_frame(dev, true, &[(addr, value)]);
        board
            .bulk_out(Endpoint::TxCtrl, &frame, BULK_TIMEOUT, &CancelToken::new())
            .expect("write");
    }

    fn read_reg(board: &MockBoard, dev: PeriphDev, addr: u8) -> u8 {
        let frame = pack_cmd_frame(dev, false, &[(addr, 0)]);
        let token = CancelToken::new();
        board
            .bulk_out(Endpoint::TxCtrl, &frame, BULK_TIMEOUT, &token)
            .expect("cmd");
        let mut resp = [0u8; CMD_FRAME_LEN];
        board
            .bulk_in(Endpoint::RxCtrl, &mut resp, BULK_TIMEOUT, &token)
            .expect("resp");
        parse_cmd_frame(&resp).expect("frame").pairs[0].1
    }

    #[test]
    fn test_vtune_tracks_vcocap() {
        let board = MockBoard::new(UsbSpeed::High);
        let base = regs::PLL_TX_BASE;
        // Program words so the ideal code is deterministic, then probe.
        write_reg(&board, PeriphDev::Xcvr, base, 95);
        let ideal = board.with_state(|st| st.pll_ideal_vcocap(base as usize));
        write_reg(&board, PeriphDev::Xcvr, base + regs::PLL_VCOCAP, ideal as u8);
        assert_eq!(read_reg(&board, PeriphDev::Xcvr, base + regs::PLL_VTUNE), 0);
        write_reg(&board, PeriphDev::Xcvr, base + regs::PLL_VCOCAP, 0);
        assert_eq!(
            read_reg(&board, PeriphDev::Xcvr, base + regs::PLL_VTUNE),
            0x80
        );
        write_reg(&board, PeriphDev::Xcvr, base + regs::PLL_VCOCAP, 63);
        assert_eq!(
            read_reg(&board, PeriphDev::Xcvr, base + regs::PLL_VTUNE),
            0x40
        );
    }

    #[test]
    fn test_dccal_engine() {
        let board = MockBoard::new(UsbSpeed::High);
        board.with_state(|st| st.dccal_first_31 = true);
        let base = regs::DCCAL_RX_LPF;
        write_reg(
            &board,
            PeriphDev::Xcvr,
            base + regs::DCCAL_CTRL,
            regs::DCCAL_CTRL_START,
        );
        assert_eq!(read_reg(&board, PeriphDev::Xcvr, base + regs::DCCAL_REGVAL), 31);
        write_reg(
            &board,
            PeriphDev::Xcvr,
            base + regs::DCCAL_CTRL,
            regs::DCCAL_CTRL_START,
        );
        assert_eq!(read_reg(&board, PeriphDev::Xcvr, base + regs::DCCAL_REGVAL), 21);
    }

    #[test]
    fn test_rx_stream_timestamps_advance() {
        let board = MockBoard::new(UsbSpeed::High);
        let flen = frame_len(UsbSpeed::High);
        let mut buf = vec![0u8; flen * 2];
        board
            .bulk_in(
                Endpoint::RxSamples,
                &mut buf,
                BULK_TIMEOUT,
                &CancelToken::new(),
            )
            .expect("rx");
        assert_eq!(parse_header(&buf[..flen]).expect("h0"), 0);
        assert_eq!(parse_header(&buf[flen..]).expect("h1"), 252);
    }
}
