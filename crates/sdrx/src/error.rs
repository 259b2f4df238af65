// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Driver error taxonomy.
//!
//! Every fallible operation in the driver returns [`DeviceError`], a pair of
//! an [`ErrorKind`] and a human-readable context string. Kinds carry distinct
//! bit values so groups of errors can be selected by mask, most importantly
//! [`FATAL_ERROR_MASK`], the set of errors that tears the interface down
//! instead of being reported through a control reply.
//!
//! Low-level USB errors enter the taxonomy through exactly one place,
//! [`map_usb_error`], so the libusb-to-driver mapping never diverges between
//! call sites.

use std::fmt;

/// Error classification, one bit per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    /// No error (used in status reporting, never inside `Err`).
    None = 0,
    /// Asynchronous operation still in progress.
    Pending = 1 << 0,
    /// Operation cancelled by shutdown or explicit request.
    Cancelled = 1 << 1,
    /// Operation did not complete within its deadline.
    Timeout = 1 << 2,
    /// Device not opened/initialized yet.
    NotInitialized = 1 << 3,
    /// Operation requires a calibrated device.
    NotCalibrated = 1 << 4,
    /// Feature not supported by this board or firmware.
    NotSupported = 1 << 5,
    /// USB enumeration speed too low for the requested configuration.
    InsufficientSpeed = 1 << 6,
    /// Endpoint or peripheral selector out of range.
    InvalidPort = 1 << 7,
    /// Numeric argument outside its legal range.
    OutOfRange = 1 << 8,
    /// A set-then-get readback disagreed with the requested value.
    NotExact = 1 << 9,
    /// USB transfer failed or completed short.
    HardwareIo = 1 << 10,
    /// Device vanished (unplug) or never matched the filter.
    HardwareNotAvailable = 1 << 11,
    /// IQ clamp limit exceeded.
    Saturation = 1 << 12,
    /// Generic failure.
    Failure = 1 << 13,
    /// A mandatory parameter was absent.
    MissingParam = 1 << 14,
    /// A parameter was present but unparseable.
    Parser = 1 << 15,
}

/// Errors that tear the interface down rather than being reported and
/// survived. Everything else is recoverable at the operation level.
pub const FATAL_ERROR_MASK: u32 = ErrorKind::HardwareIo as u32
    | ErrorKind::HardwareNotAvailable as u32
    | ErrorKind::NotInitialized as u32;

impl ErrorKind {
    /// Bit value of this kind.
    #[inline]
    #[must_use]
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Whether this kind is in [`FATAL_ERROR_MASK`].
    #[inline]
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        self.bit() & FATAL_ERROR_MASK != 0
    }

    /// Short lowercase name used in control replies and notifications.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::None => "ok",
            Self::Pending => "pending",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::NotInitialized => "not-initialized",
            Self::NotCalibrated => "not-calibrated",
            Self::NotSupported => "not-supported",
            Self::InsufficientSpeed => "insufficient-speed",
            Self::InvalidPort => "invalid-port",
            Self::OutOfRange => "out-of-range",
            Self::NotExact => "not-exact",
            Self::HardwareIo => "hardware-io-error",
            Self::HardwareNotAvailable => "hardware-not-available",
            Self::Saturation => "saturation",
            Self::Failure => "failure",
            Self::MissingParam => "missing-parameter",
            Self::Parser => "parse-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Driver error: a kind plus human-readable context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError {
    /// Classification.
    pub kind: ErrorKind,
    /// Context string, e.g. `"FPGA load: bulk write ended short (1024/4096)"`.
    pub context: String,
}

impl DeviceError {
    /// Build an error from a kind and context.
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }

    /// Prefix the context with an outer operation name.
    #[must_use]
    pub fn wrap(mut self, prefix: &str) -> Self {
        self.context = format!("{prefix}: {}", self.context);
        self
    }

    /// Whether this error must tear the interface down.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{} (0x{:x})", self.kind, self.kind.bit())
        } else {
            write!(f, "{} ({}, 0x{:x})", self.context, self.kind, self.kind.bit())
        }
    }
}

impl std::error::Error for DeviceError {}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Shorthand constructors, one per commonly raised kind.
macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        #[doc = concat!("Build a `", stringify!($kind), "` error.")]
        pub fn $name(context: impl Into<String>) -> DeviceError {
            DeviceError::new(ErrorKind::$kind, context)
        }
    };
}

impl DeviceError {
    ctor!(cancelled, Cancelled);
    ctor!(timeout, Timeout);
    ctor!(not_initialized, NotInitialized);
    ctor!(not_supported, NotSupported);
    ctor!(out_of_range, OutOfRange);
    ctor!(not_exact, NotExact);
    ctor!(hardware_io, HardwareIo);
    ctor!(hardware_gone, HardwareNotAvailable);
    ctor!(failure, Failure);
    ctor!(missing_param, MissingParam);
    ctor!(parser, Parser);
}

/// Map a libusb error to the driver taxonomy.
///
/// The single conversion point for USB-layer errors; callers add their own
/// context via [`DeviceError::wrap`].
#[must_use]
pub fn map_usb_error(err: rusb::Error) -> DeviceError {
    let kind = match err {
        rusb::Error::Timeout => ErrorKind::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound => ErrorKind::HardwareNotAvailable,
        rusb::Error::Access | rusb::Error::Busy => ErrorKind::HardwareNotAvailable,
        rusb::Error::Interrupted => ErrorKind::Cancelled,
        rusb::Error::NotSupported => ErrorKind::NotSupported,
        rusb::Error::InvalidParam => ErrorKind::OutOfRange,
        _ => ErrorKind::HardwareIo,
    };
    DeviceError::new(kind, format!("usb: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bits_disjoint() {
        let kinds = [
            ErrorKind::Pending,
            ErrorKind::Cancelled,
            ErrorKind::Timeout,
            ErrorKind::NotInitialized,
            ErrorKind::NotCalibrated,
            ErrorKind::NotSupported,
            ErrorKind::InsufficientSpeed,
            ErrorKind::InvalidPort,
            ErrorKind::OutOfRange,
            ErrorKind::NotExact,
            ErrorKind::HardwareIo,
            ErrorKind::HardwareNotAvailable,
            ErrorKind::Saturation,
            ErrorKind::Failure,
            ErrorKind::MissingParam,
            ErrorKind::Parser,
        ];
        let mut seen = 0u32;
        for k in kinds {
            assert_eq!(seen & k.bit(), 0, "{k} overlaps another kind");
            seen |= k.bit();
        }
    }

    #[test]
    fn test_fatal_mask() {
        assert!(ErrorKind::HardwareIo.is_fatal());
        assert!(ErrorKind::HardwareNotAvailable.is_fatal());
        assert!(!ErrorKind::Timeout.is_fatal());
        assert!(!ErrorKind::OutOfRange.is_fatal());
    }

    #[test]
    fn test_wrap_prefixes_context() {
        let err = DeviceError::timeout("bulk read").wrap("rx path");
        assert_eq!(err.context, "rx path: bulk read");
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_usb_error_mapping() {
        assert_eq!(map_usb_error(rusb::Error::Timeout).kind, ErrorKind::Timeout);
        assert_eq!(
            map_usb_error(rusb::Error::NoDevice).kind,
            ErrorKind::HardwareNotAvailable
        );
        assert_eq!(map_usb_error(rusb::Error::Pipe).kind, ErrorKind::HardwareIo);
    }
}
