// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Peripheral access layer.
//!
//! All four on-board peripherals are reached through one packed 16-byte
//! command frame carried on the control bulk pair (TX ctrl OUT, RX ctrl IN):
//!
//! ```text
//! +--------+-----------------+----------------------------------------+
//! | magic  | mode            | 7 x (addr, value) pairs                |
//! | 'N'    | dir|cnt|dev     | unused pairs zeroed                    |
//! | (1 B)  | (1 B)           | (14 B)                                 |
//! +--------+-----------------+----------------------------------------+
//!
//! mode: bit 6        = direction (1 = write)
//!       bits 5..3    = pair count (1..7)
//!       bits 2..0    = peripheral id
//! ```
//!
//! A write is one OUT transfer; a read is an OUT transfer followed by an IN
//! transfer returning the same frame with values filled in. Spans longer
//! than seven items are split into full frames plus a remainder, addresses
//! incrementing per item. One mutex serializes command/response pairs; the
//! layer never holds a direction mutex.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::config::{PeriphTrace, TraceLevel};
use crate::error::{DeviceError, Result};
use crate::usb::{CancelToken, Endpoint, UsbBackend};

/// FPGA GPIO block register map.
///
/// Multi-byte fields are little-endian across consecutive byte registers.
pub mod gpio {
    /// Board control; bit 0 selects small DMA transfers (high-speed links).
    pub const BOARD_CTRL: u8 = 0x00;
    /// Small-DMA-transfer bit in [`BOARD_CTRL`].
    pub const CTRL_SMALL_DMA: u8 = 0x01;
    /// Firmware sample loopback; bit 0 enables.
    pub const FW_LOOPBACK: u8 = 0x02;
    /// TX IQ phase correction, i16.
    pub const CORR_TX_PHASE: u8 = 0x04;
    /// TX IQ gain correction, i16.
    pub const CORR_TX_GAIN: u8 = 0x06;
    /// RX IQ phase correction, i16.
    pub const CORR_RX_PHASE: u8 = 0x08;
    /// RX IQ gain correction, i16.
    pub const CORR_RX_GAIN: u8 = 0x0a;
    /// FPGA image version, u32.
    pub const FPGA_VERSION: u8 = 0x0c;
    /// Free-running sample counter snapshot, u64.
    pub const TIMESTAMP: u8 = 0x10;
}

/// Command frame length on the wire.
pub const CMD_FRAME_LEN: usize = 16;

/// Frame magic.
pub const CMD_MAGIC: u8 = b'N';

/// Maximum (addr, value) pairs per frame.
pub const CMD_MAX_PAIRS: usize = 7;

/// Direction bit in the mode byte (set = write).
const MODE_DIR_WRITE: u8 = 0x40;
/// Pair count field in the mode byte.
const MODE_CNT_SHIFT: u8 = 3;
const MODE_CNT_MASK: u8 = 0x38;
/// Peripheral id field in the mode byte.
const MODE_DEV_MASK: u8 = 0x07;

/// Control command timeout per frame.
const CMD_TIMEOUT: Duration = Duration::from_millis(500);

/// On-board peripherals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PeriphDev {
    /// FPGA GPIO block (board control, correction registers, timestamps).
    Gpio = 0,
    /// RF transceiver IC.
    Xcvr = 1,
    /// VCTCXO trim DAC.
    VctcxoDac = 2,
    /// Sample clock synthesizer.
    ClockSynth = 3,
}

impl PeriphDev {
    /// Lowercase name used in traces and `show peripheral` output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gpio => "gpio",
            Self::Xcvr => "xcvr",
            Self::VctcxoDac => "dac",
            Self::ClockSynth => "synth",
        }
    }

    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Gpio),
            1 => Some(Self::Xcvr),
            2 => Some(Self::VctcxoDac),
            3 => Some(Self::ClockSynth),
            _ => None,
        }
    }
}

/// A decoded command frame (used by the wire codec and the board emulator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdFrame {
    /// Target peripheral.
    pub dev: PeriphDev,
    /// True for writes.
    pub write: bool,
    /// (address, value) pairs, 1..=7.
    pub pairs: Vec<(u8, u8)>,
}

/// Pack a command frame. `pairs` must hold 1..=7 entries.
#[must_use]
pub fn pack_cmd_frame(dev: PeriphDev, write: bool, pairs: &[(u8, u8)]) -> [u8; CMD_FRAME_LEN] {
    debug_assert!((1..=CMD_MAX_PAIRS).contains(&pairs.len()));
    let mut frame = [0u8; CMD_FRAME_LEN];
    frame[0] = CMD_MAGIC;
    frame[1] = (dev as u8)
        | ((pairs.len() as u8) << MODE_CNT_SHIFT)
        | if write { MODE_DIR_WRITE } else { 0 };
    for (i, &(addr, value)) in pairs.iter().enumerate() {
        frame[2 + 2 * i] = addr;
        frame[3 + 2 * i] = value;
    }
    frame
}

/// Parse a command frame (request or response).
pub fn parse_cmd_frame(buf: &[u8]) -> Result<CmdFrame> {
    if buf.len() < CMD_FRAME_LEN {
        return Err(DeviceError::hardware_io(format!(
            "peripheral frame truncated ({} bytes)",
            buf.len()
        )));
    }
    if buf[0] != CMD_MAGIC {
        return Err(DeviceError::hardware_io(format!(
            "peripheral frame bad magic 0x{:02x}",
            buf[0]
        )));
    }
    let mode = buf[1];
    let count = usize::from((mode & MODE_CNT_MASK) >> MODE_CNT_SHIFT);
    if !(1..=CMD_MAX_PAIRS).contains(&count) {
        return Err(DeviceError::hardware_io(format!(
            "peripheral frame bad pair count {count}"
        )));
    }
    let dev = PeriphDev::from_id(mode & MODE_DEV_MASK).ok_or_else(|| {
        DeviceError::hardware_io(format!("peripheral frame bad device id {}", mode & MODE_DEV_MASK))
    })?;
    let pairs = (0..count)
        .map(|i| (buf[2 + 2 * i], buf[3 + 2 * i]))
        .collect();
    Ok(CmdFrame {
        dev,
        write: mode & MODE_DIR_WRITE != 0,
        pairs,
    })
}

/// Serialized access to the four on-board peripherals.
pub struct PeriphBus {
    usb: Arc<dyn UsbBackend>,
    /// Serializes one command/response exchange; released between commands.
    lock: Mutex<()>,
    cancel: CancelToken,
    trace: [PeriphTrace; 4],
}

impl PeriphBus {
    /// Build the bus over a transport, with per-peripheral trace policies
    /// indexed by [`PeriphDev`].
    pub fn new(usb: Arc<dyn UsbBackend>, cancel: CancelToken, trace: [PeriphTrace; 4]) -> Self {
        Self {
            usb,
            lock: Mutex::new(()),
            cancel,
            trace,
        }
    }

    fn trace_pairs(&self, dev: PeriphDev, write: bool, pairs: &[(u8, u8)]) {
        let policy = &self.trace[dev as usize];
        let level = policy.effective();
        let wanted = match level {
            TraceLevel::Off => false,
            TraceLevel::Writes => write,
            TraceLevel::All => true,
        };
        if !wanted {
            return;
        }
        for &(addr, value) in pairs {
            if policy.tracks(addr) {
                debug!(
                    "{} {} [0x{addr:02x}] = 0x{value:02x}",
                    dev.name(),
                    if write { "write" } else { "read" },
                );
            }
        }
    }

    /// One command/response exchange under the control lock.
    fn exchange(&self, dev: PeriphDev, write: bool, pairs: &mut [(u8, u8)]) -> Result<()> {
        let frame = pack_cmd_frame(dev, write, pairs);
        #[cfg(feature = "usb-hexdump")]
        debug!("{} frame {frame:02x?}", dev.name());
        let _guard = self.lock.lock();
        let sent = self
            .usb
            .bulk_out(Endpoint::TxCtrl, &frame, CMD_TIMEOUT, &self.cancel)
            .map_err(|e| e.wrap(dev.name()))?;
        if sent != CMD_FRAME_LEN {
            return Err(DeviceError::hardware_io(format!(
                "{}: short command write ({sent}/{CMD_FRAME_LEN})",
                dev.name()
            )));
        }
        if write {
            return Ok(());
        }
        let mut resp = [0u8; CMD_FRAME_LEN];
        let got = self
            .usb
            .bulk_in(Endpoint::RxCtrl, &mut resp, CMD_TIMEOUT, &self.cancel)
            .map_err(|e| e.wrap(dev.name()))?;
        if got != CMD_FRAME_LEN {
            return Err(DeviceError::hardware_io(format!(
                "{}: short command response ({got}/{CMD_FRAME_LEN})",
                dev.name()
            )));
        }
        let parsed = parse_cmd_frame(&resp).map_err(|e| e.wrap(dev.name()))?;
        if parsed.dev != dev || parsed.pairs.len() != pairs.len() {
            return Err(DeviceError::hardware_io(format!(
                "{}: response frame mismatch",
                dev.name()
            )));
        }
        for (slot, got) in pairs.iter_mut().zip(parsed.pairs) {
            slot.1 = got.1;
        }
        Ok(())
    }

    /// Read `buf.len()` consecutive registers starting at `addr`.
    pub fn read(&self, dev: PeriphDev, addr: u8, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < buf.len() {
            let count = (buf.len() - offset).min(CMD_MAX_PAIRS);
            let mut pairs: Vec<(u8, u8)> = (0..count)
                .map(|i| (addr.wrapping_add((offset + i) as u8), 0))
                .collect();
            self.exchange(dev, false, &mut pairs)?;
            self.trace_pairs(dev, false, &pairs);
            for (i, &(_, value)) in pairs.iter().enumerate() {
                buf[offset + i] = value;
            }
            offset += count;
        }
        Ok(())
    }

    /// Write `data` to consecutive registers starting at `addr`.
    pub fn write(&self, dev: PeriphDev, addr: u8, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            let count = (data.len() - offset).min(CMD_MAX_PAIRS);
            let mut pairs: Vec<(u8, u8)> = (0..count)
                .map(|i| (addr.wrapping_add((offset + i) as u8), data[offset + i]))
                .collect();
            self.trace_pairs(dev, true, &pairs);
            self.exchange(dev, true, &mut pairs)?;
            offset += count;
        }
        Ok(())
    }

    /// Read one register.
    pub fn read_reg(&self, dev: PeriphDev, addr: u8) -> Result<u8> {
        let mut buf = [0u8];
        self.read(dev, addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Write one register.
    pub fn write_reg(&self, dev: PeriphDev, addr: u8, value: u8) -> Result<()> {
        self.write(dev, addr, &[value])
    }

    /// Read-modify-write: clear `reset_mask`, then set `set_mask`.
    pub fn change_bits(&self, dev: PeriphDev, addr: u8, reset_mask: u8, set_mask: u8) -> Result<()> {
        let old = self.read_reg(dev, addr)?;
        let new = (old & !reset_mask) | set_mask;
        if new != old {
            self.write_reg(dev, addr, new)?;
        }
        Ok(())
    }

    /// Set bits in a register.
    pub fn set_bits(&self, dev: PeriphDev, addr: u8, mask: u8) -> Result<()> {
        self.change_bits(dev, addr, 0, mask)
    }

    /// Clear bits in a register.
    pub fn clear_bits(&self, dev: PeriphDev, addr: u8, mask: u8) -> Result<()> {
        self.change_bits(dev, addr, mask, 0)
    }

    /// Write a 16-bit word to the trim DAC (registers 0 and 1, LE).
    pub fn write_dac(&self, word: u16) -> Result<()> {
        self.write(PeriphDev::VctcxoDac, 0, &word.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let frame = pack_cmd_frame(PeriphDev::Xcvr, true, &[(0x09, 0xc5), (0x0a, 0x01)]);
        assert_eq!(frame[0], CMD_MAGIC);
        assert_eq!(frame[1], 0x40 | (2 << 3) | 1);
        assert_eq!(&frame[2..6], &[0x09, 0xc5, 0x0a, 0x01]);
        assert!(frame[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_roundtrip() {
        let pairs = [(0x10u8, 0x7fu8), (0x11, 0x80), (0x12, 0x00)];
        let frame = pack_cmd_frame(PeriphDev::ClockSynth, false, &pairs);
        let parsed = parse_cmd_frame(&frame).expect("parse");
        assert_eq!(parsed.dev, PeriphDev::ClockSynth);
        assert!(!parsed.write);
        assert_eq!(parsed.pairs, pairs);
    }

    #[test]
    fn test_parse_rejects_bad_magic_and_count() {
        let mut frame = pack_cmd_frame(PeriphDev::Gpio, true, &[(0, 0)]);
        frame[0] = b'M';
        assert!(parse_cmd_frame(&frame).is_err());

        let mut frame = pack_cmd_frame(PeriphDev::Gpio, true, &[(0, 0)]);
        frame[1] &= !0x38; // count = 0
        assert!(parse_cmd_frame(&frame).is_err());
    }
}
