// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! rusb-backed USB transport.
//!
//! Control transfers use the synchronous rusb API. Bulk transfers are built
//! on one-shot asynchronous libusb transfers (`rusb::ffi`): submit, then
//! pump the event loop in [`SYNC_SLICE`] slices so the wait can observe the
//! [`CancelToken`] and the deadline between slices. A transfer abandoned by
//! cancellation or deadline is cancelled at the libusb level and the wait
//! does not return until libusb has released the buffer.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, warn};
use rusb::constants::LIBUSB_ENDPOINT_IN;
use rusb::ffi;
use rusb::ffi::constants::{
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_TIMED_OUT, LIBUSB_TRANSFER_TYPE_BULK,
};
use rusb::UsbContext;

use super::{AltSetting, CancelToken, Endpoint, UsbBackend, UsbSpeed, PRODUCT_ID, SYNC_SLICE, VENDOR_ID};
use crate::error::{map_usb_error, DeviceError, ErrorKind, Result};

/// USB interface number carrying the bulk endpoints.
const RF_INTERFACE: u8 = 0;

/// Open board over rusb.
pub struct UsbHandle {
    context: rusb::Context,
    handle: rusb::DeviceHandle<rusb::Context>,
    speed: UsbSpeed,
    serial: String,
    bus: u8,
    address: u8,
}

impl UsbHandle {
    /// Open the first board whose serial matches `filter` (empty filter
    /// matches any). Claims the RF interface.
    pub fn open(filter: &str) -> Result<Self> {
        let context = rusb::Context::new().map_err(map_usb_error)?;
        let devices = context.devices().map_err(map_usb_error)?;
        for dev in devices.iter() {
            let Ok(desc) = dev.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() != VENDOR_ID || desc.product_id() != PRODUCT_ID {
                continue;
            }
            let handle = match dev.open() {
                Ok(h) => h,
                Err(err) => {
                    warn!(
                        "usb: cannot open {:03}/{:03}: {err}",
                        dev.bus_number(),
                        dev.address()
                    );
                    continue;
                }
            };
            let serial = handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_default();
            if !filter.is_empty() && serial != filter {
                continue;
            }
            let speed = match dev.speed() {
                rusb::Speed::High => UsbSpeed::High,
                rusb::Speed::Super | rusb::Speed::SuperPlus => UsbSpeed::Super,
                other => {
                    return Err(DeviceError::new(
                        ErrorKind::InsufficientSpeed,
                        format!("board '{serial}' enumerated at {other:?}, need high or super"),
                    ))
                }
            };
            handle.claim_interface(RF_INTERFACE).map_err(map_usb_error)?;
            debug!(
                "usb: opened '{serial}' at {:03}/{:03} ({})",
                dev.bus_number(),
                dev.address(),
                speed.name()
            );
            return Ok(Self {
                bus: dev.bus_number(),
                address: dev.address(),
                context,
                handle,
                speed,
                serial,
            });
        }
        Err(DeviceError::hardware_gone(if filter.is_empty() {
            "no board found".to_string()
        } else {
            format!("no board with serial '{filter}'")
        }))
    }

    fn bulk_transfer(
        &self,
        ep: Endpoint,
        buf: *mut u8,
        len: usize,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let mut xfer = AsyncBulkTransfer::submit(
            self.context.as_raw(),
            self.handle.as_raw(),
            ep.address(),
            buf,
            len,
        )?;
        xfer.wait(timeout, cancel)
    }
}

impl UsbBackend for UsbHandle {
    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn serial(&self) -> String {
        self.serial.clone()
    }

    fn bus_address(&self) -> (u8, u8) {
        (self.bus, self.address)
    }

    fn set_alt_setting(&self, alt: AltSetting) -> Result<()> {
        self.handle
            .set_alternate_setting(RF_INTERFACE, alt as u8)
            .map_err(|e| map_usb_error(e).wrap("set alt setting"))
    }

    fn vendor_out(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let rt = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        let written = self
            .handle
            .write_control(rt, request, value, index, data, timeout)
            .map_err(map_usb_error)?;
        if written != data.len() {
            return Err(DeviceError::hardware_io(format!(
                "vendor request {request}: short control write ({written}/{})",
                data.len()
            )));
        }
        Ok(())
    }

    fn vendor_in(
        &self,
        request: u8,
        value: u16,
        index: u16,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let rt = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        self.handle
            .read_control(rt, request, value, index, data, timeout)
            .map_err(map_usb_error)
    }

    fn bulk_out(
        &self,
        ep: Endpoint,
        data: &[u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize> {
        debug_assert!(!ep.is_in());
        self.bulk_transfer(ep, data.as_ptr().cast_mut(), data.len(), timeout, cancel)
    }

    fn bulk_in(
        &self,
        ep: Endpoint,
        data: &mut [u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<usize> {
        debug_assert!(ep.address() & LIBUSB_ENDPOINT_IN != 0);
        self.bulk_transfer(ep, data.as_mut_ptr(), data.len(), timeout, cancel)
    }
}

// ============================================================================
// One-shot asynchronous bulk transfer
// ============================================================================

/// Completion flag shared with the libusb callback. Boxed so its address is
/// stable for the lifetime of the transfer.
struct TransferDone {
    done: AtomicBool,
}

extern "system" fn transfer_callback(xfer: *mut ffi::libusb_transfer) {
    // Runs inside libusb_handle_events on some driver thread. Only flips the
    // completion flag; status/actual_length are read by the waiter afterwards.
    unsafe {
        let state = (*xfer).user_data.cast::<TransferDone>();
        (*state).done.store(true, Ordering::Release);
    }
}

/// A submitted bulk transfer. `wait` must run to completion (it does so even
/// on cancellation and deadline) before the buffer may be reused; `Drop`
/// enforces this for the early-return paths.
struct AsyncBulkTransfer {
    xfer: NonNull<ffi::libusb_transfer>,
    state: Box<TransferDone>,
    ctx: *mut ffi::libusb_context,
    requested: usize,
    cancel_sent: bool,
}

impl AsyncBulkTransfer {
    fn submit(
        ctx: *mut ffi::libusb_context,
        handle: *mut ffi::libusb_device_handle,
        endpoint: u8,
        buf: *mut u8,
        len: usize,
    ) -> Result<Self> {
        let state = Box::new(TransferDone {
            done: AtomicBool::new(false),
        });
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        let Some(xfer) = NonNull::new(raw) else {
            return Err(DeviceError::failure("libusb_alloc_transfer failed"));
        };
        unsafe {
            let t = xfer.as_ptr();
            (*t).dev_handle = handle;
            (*t).endpoint = endpoint;
            (*t).transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            // Deadline handling is ours; libusb's own timeout stays off.
            (*t).timeout = 0;
            (*t).buffer = buf;
            (*t).length = len as i32;
            (*t).callback = transfer_callback;
            (*t).user_data = (&*state as *const TransferDone as *mut TransferDone).cast::<c_void>();
            (*t).flags = 0;
            (*t).num_iso_packets = 0;
            let rc = ffi::libusb_submit_transfer(t);
            if rc != 0 {
                ffi::libusb_free_transfer(t);
                return Err(DeviceError::hardware_io(format!(
                    "bulk submit on ep 0x{endpoint:02x}: libusb error {rc}"
                )));
            }
        }
        Ok(Self {
            xfer,
            state,
            ctx,
            requested: len,
            cancel_sent: false,
        })
    }

    fn request_cancel(&mut self) {
        if !self.cancel_sent {
            unsafe {
                ffi::libusb_cancel_transfer(self.xfer.as_ptr());
            }
            self.cancel_sent = true;
        }
    }

    fn pump_events(&self, slice: Duration) {
        let tv = libc::timeval {
            tv_sec: slice.as_secs() as libc::time_t,
            tv_usec: slice.subsec_micros() as libc::suseconds_t,
        };
        unsafe {
            ffi::libusb_handle_events_timeout(self.ctx, &tv);
        }
    }

    /// Block until the transfer completes. Cancellation and deadline both
    /// cancel at the libusb level and keep pumping until libusb confirms,
    /// then map to `Cancelled` / `Timeout` respectively.
    fn wait(&mut self, timeout: Duration, cancel: &CancelToken) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut timed_out = false;
        while !self.state.done.load(Ordering::Acquire) {
            if cancel.is_cancelled() {
                self.request_cancel();
            } else if Instant::now() >= deadline && !self.cancel_sent {
                timed_out = true;
                self.request_cancel();
            }
            self.pump_events(SYNC_SLICE.min(timeout.max(Duration::from_millis(1))));
        }
        let (status, actual) = unsafe {
            let t = self.xfer.as_ptr();
            ((*t).status, (*t).actual_length as usize)
        };
        match status {
            LIBUSB_TRANSFER_COMPLETED => Ok(actual),
            LIBUSB_TRANSFER_TIMED_OUT => Err(DeviceError::timeout(format!(
                "bulk transfer timed out after {timeout:?} ({actual}/{} bytes)",
                self.requested
            ))),
            LIBUSB_TRANSFER_CANCELLED => {
                if timed_out {
                    Err(DeviceError::timeout(format!(
                        "bulk transfer timed out after {timeout:?} ({actual}/{} bytes)",
                        self.requested
                    )))
                } else {
                    Err(DeviceError::cancelled("bulk transfer cancelled"))
                }
            }
            LIBUSB_TRANSFER_NO_DEVICE => {
                Err(DeviceError::hardware_gone("device gone during bulk transfer"))
            }
            other => Err(DeviceError::hardware_io(format!(
                "bulk transfer failed with libusb status {other}"
            ))),
        }
    }
}

impl Drop for AsyncBulkTransfer {
    fn drop(&mut self) {
        // Never free a transfer libusb still owns: cancel and pump until the
        // callback has fired, then release.
        if !self.state.done.load(Ordering::Acquire) {
            self.request_cancel();
            while !self.state.done.load(Ordering::Acquire) {
                self.pump_events(Duration::from_millis(10));
            }
        }
        unsafe {
            ffi::libusb_free_transfer(self.xfer.as_ptr());
        }
    }
}
