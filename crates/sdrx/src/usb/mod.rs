// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! USB transport abstraction.
//!
//! The board is a single USB device with one vendor interface carrying four
//! bulk endpoints plus vendor commands on endpoint 0:
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                         Host driver                          |
//! |   periph bus    TX path      RX path      FPGA loader        |
//! |      |             |            |              |             |
//! |      v             v            v              v             |
//! |  TX ctrl OUT   TX samples   RX samples     TX ctrl OUT       |
//! |  RX ctrl IN       OUT          IN         (alt = fpga)       |
//! +------+-------------+------------+--------------+-------------+
//!        |             |            |              |
//!        +------ vendor interface, alt in {idle, rf_link,
//!                 spi_flash, fpga} ------------------------------+
//! ```
//!
//! Everything above the wire is written against [`UsbBackend`], so the whole
//! driver runs identically over real hardware ([`device::UsbHandle`], rusb)
//! and over the emulated board ([`mock::MockBoard`]) used by the test suites.
//!
//! Bulk transfers take a [`CancelToken`]: backends must wake periodically
//! (the [`SYNC_SLICE`] event-loop slice) and abandon the transfer with
//! `Cancelled` once the token fires.

pub mod device;
pub mod mock;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// USB vendor id of the board.
pub const VENDOR_ID: u16 = 0x2cf0;

/// USB product id of the board.
pub const PRODUCT_ID: u16 = 0x5246;

/// Default control transfer timeout.
pub const CTRL_TIMEOUT: Duration = Duration::from_millis(500);

/// Default bulk transfer timeout.
pub const BULK_TIMEOUT: Duration = Duration::from_millis(500);

/// Event-loop slice for blocking waits; the cancel token is checked at this
/// period while a transfer is in flight.
pub const SYNC_SLICE: Duration = Duration::from_millis(50);

/// Alternate settings of the vendor interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AltSetting {
    /// Quiescent; no endpoint active.
    Idle = 0,
    /// Sample streaming and peripheral access.
    RfLink = 1,
    /// SPI flash access (firmware storage).
    SpiFlash = 2,
    /// FPGA bitstream programming.
    Fpga = 3,
}

/// Bulk endpoints. Values are wire endpoint addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Endpoint {
    /// IQ sample stream, host to board.
    TxSamples = 0x01,
    /// Peripheral command frames and FPGA bitstream, host to board.
    TxCtrl = 0x02,
    /// IQ sample stream, board to host.
    RxSamples = 0x81,
    /// Peripheral command responses, board to host.
    RxCtrl = 0x82,
}

impl Endpoint {
    /// Wire endpoint address.
    #[inline]
    #[must_use]
    pub const fn address(self) -> u8 {
        self as u8
    }

    /// True for IN (board to host) endpoints.
    #[inline]
    #[must_use]
    pub const fn is_in(self) -> bool {
        self.address() & 0x80 != 0
    }
}

/// Enumerated link speed class. Anything below high speed cannot carry the
/// sample stream and is rejected at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// USB 2.0 high speed (480 Mbit/s).
    High,
    /// USB 3.x super speed (5 Gbit/s or better).
    Super,
}

impl UsbSpeed {
    /// Lowercase name used in notifications and `show` output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Super => "super",
        }
    }
}

/// Vendor commands on control endpoint 0.
pub mod vendor {
    /// Query firmware version string.
    pub const QUERY_VERSION: u8 = 0;
    /// Query FPGA configuration status (also commits a finished load).
    pub const QUERY_FPGA_STATUS: u8 = 1;
    /// Begin FPGA programming; bitstream follows on TX ctrl.
    pub const BEGIN_FPGA_PROGRAM: u8 = 2;
    /// RX RF front end on/off (value = 1/0).
    pub const RF_RX: u8 = 4;
    /// TX RF front end on/off (value = 1/0).
    pub const RF_TX: u8 = 5;
    /// Read the 256-byte calibration cache page.
    pub const READ_CAL_CACHE: u8 = 110;
}

/// Cooperative cancellation flag shared between the device, its worker
/// threads and in-flight USB waits.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Transport contract the rest of the driver is written against.
///
/// Bulk operations block until completion, timeout or cancellation; short
/// completion is reported through the returned byte count and classified by
/// the caller (sample paths treat it as a hardware I/O error).
pub trait UsbBackend: Send + Sync {
    /// Link speed class.
    fn speed(&self) -> UsbSpeed;

    /// Board serial string.
    fn serial(&self) -> String;

    /// (bus, address) of the enumerated device.
    fn bus_address(&self) -> (u8, u8);

    /// Select an alternate setting on the vendor interface.
    fn set_alt_setting(&self, alt: AltSetting) -> Result<()>;

    /// Vendor control transfer, host to device.
    fn vendor_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()>;

    /// Vendor control transfer, device to host. Returns bytes received.
    fn vendor_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    /// Bulk OUT, blocking with cancellation. Returns bytes written.
    fn bulk_out(
        &self,
        ep: Endpoint,
        data: &[u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize>;

    /// Bulk IN, blocking with cancellation. Returns bytes received.
    fn bulk_in(
        &self,
        ep: Endpoint,
        data: &mut [u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_directions() {
        assert!(!Endpoint::TxSamples.is_in());
        assert!(!Endpoint::TxCtrl.is_in());
        assert!(Endpoint::RxSamples.is_in());
        assert!(Endpoint::RxCtrl.is_in());
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
