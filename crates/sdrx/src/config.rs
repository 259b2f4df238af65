// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Driver configuration - single source of truth.
//!
//! This module centralizes every option the driver consumes, their legal
//! ranges and their defaults. **Never hardcode these elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (ranges, defaults).
//! - **Level 2 (Startup)**: [`Config`], parsed once from the host's
//!   configuration source at `open()` time.
//! - **Level 3 (Runtime)**: [`Tunables`], the small knob block that control
//!   messages may change while streaming; published through `ArcSwap` so hot
//!   paths read a coherent snapshot without taking a lock.
//!
//! Out-of-range values are clamped, not rejected; every clamp is logged with
//! the option name so misconfigurations are visible but never fatal.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use log::{debug, warn};

// =======================================================================
// Sample rate limits
// =======================================================================

/// Absolute sample rate floor (Hz).
pub const MIN_SAMPLE_RATE: u32 = 80_000;

/// Absolute sample rate ceiling (Hz).
pub const MAX_SAMPLE_RATE: u32 = 40_000_000;

/// Default sample rate ceiling on a high-speed (USB 2.0) link.
///
/// The bulk pipe cannot sustain more without drops; raisable via the
/// `max_samplerate_high` option at the operator's risk.
pub const DEFAULT_MAX_SAMPLE_RATE_HIGH: u32 = 4_100_000;

// =======================================================================
// Tuning range
// =======================================================================

/// Lowest tunable RF frequency (Hz).
pub const MIN_FREQUENCY: u64 = 232_500_000;

/// Highest tunable RF frequency (Hz).
pub const MAX_FREQUENCY: u64 = 3_800_000_000;

// =======================================================================
// Buffering
// =======================================================================

/// Default total buffered samples per direction.
pub const DEFAULT_BUFFERED_SAMPLES: u32 = 2048;

/// Lower clamp for `buffered_samples`.
pub const MIN_BUFFERED_SAMPLES: u32 = 1024;

/// Upper clamp for `buffered_samples`.
pub const MAX_BUFFERED_SAMPLES: u32 = 16384;

/// Default minimum full buffers per TX bulk submission.
pub const DEFAULT_TX_MIN_BUFFERS: u32 = 2;

// =======================================================================
// Sample scaling
// =======================================================================

/// Default 12-bit energize ceiling: unit-magnitude floats map to +/-2047.
pub const DEFAULT_SAMPLE_ENERGIZE: i32 = 2047;

/// Default clamped-sample warning threshold (percent of a send call).
pub const DEFAULT_WARN_CLAMPED_PERCENT: f32 = 1.0;

// =======================================================================
// Timestamp tolerance
// =======================================================================

/// Default window of "data in the past" tolerated by the RX path (ms).
pub const DEFAULT_RX_PAST_INTERVAL_MS: u32 = 200;

/// Clamp range for `rx_ts_past_error_interval` (ms).
pub const RX_PAST_INTERVAL_RANGE_MS: (u32, u32) = (50, 10_000);

/// Default TX silence gap auto-fill window (ms); 0 disables.
pub const DEFAULT_SILENCE_TIME_MS: u32 = 0;

// =======================================================================
// VCTCXO trim
// =======================================================================

/// Default VCTCXO trim DAC midpoint.
pub const DEFAULT_FREQ_OFFSET: f64 = 128.0;

/// Legal VCTCXO trim range.
pub const FREQ_OFFSET_RANGE: (f64, f64) = (64.0, 192.0);

// =======================================================================
// Clock discipline
// =======================================================================

/// Default overall system timing accuracy (us).
pub const DEFAULT_SYSTEM_ACCURACY_US: u64 = 300;

/// Default target residual drift (ppb).
pub const DEFAULT_ACCURACY_PPB: u64 = 30;

/// Default "known good" measurement delay (us).
pub const DEFAULT_KNOWN_DELAY_US: u64 = 450;

/// Default delay below which a pinning is accepted immediately (us).
pub const DEFAULT_BEST_DELAY_US: u64 = 250;

/// Default delay above which a measurement is discarded outright (us).
pub const DEFAULT_MAX_DELAY_US: u64 = 750;

// =======================================================================
// Latency bounds (used by calibration capture timing)
// =======================================================================

/// Default RX latency on a super-speed link (us).
pub const DEFAULT_RX_LATENCY_SUPER_US: u32 = 3_000;

/// Default RX latency on a high-speed link (us).
pub const DEFAULT_RX_LATENCY_HIGH_US: u32 = 5_000;

/// Default TX latency on a super-speed link (us).
pub const DEFAULT_TX_LATENCY_SUPER_US: u32 = 4_000;

/// Default TX latency on a high-speed link (us).
pub const DEFAULT_TX_LATENCY_HIGH_US: u32 = 6_000;

// =======================================================================
// Source abstraction
// =======================================================================

/// Configuration source contract: the host engine hands the driver a flat
/// key/value view of its configuration section.
pub trait ConfigSource {
    /// Raw string value for `key`, if present.
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Environment contract: path-template variables such as `${sharedpath}`.
pub trait Env: Send + Sync {
    /// Value of a template variable, if defined.
    fn var(&self, name: &str) -> Option<String>;
}

/// [`Env`] backed by a fixed map; convenient default and test double.
#[derive(Debug, Default, Clone)]
pub struct MapEnv {
    vars: HashMap<String, String>,
}

impl MapEnv {
    /// Empty environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a template variable.
    #[must_use]
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_string(), value.to_string());
        self
    }
}

impl Env for MapEnv {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

// =======================================================================
// Parse + clamp helpers
// =======================================================================

/// Parse `key` from `src`, falling back to `default`, clamping to
/// `[min, max]`. Clamps and parse failures are logged with the option name.
pub fn clamp_opt<T>(src: &dyn ConfigSource, key: &str, default: T, min: T, max: T) -> T
where
    T: FromStr + PartialOrd + Copy + Display,
{
    let Some(raw) = src.get(key) else {
        return default;
    };
    let val = match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!("config: {key}='{raw}' unparseable, using {default}");
            return default;
        }
    };
    if val < min {
        warn!("config: {key}={val} below minimum, clamped to {min}");
        min
    } else if val > max {
        warn!("config: {key}={val} above maximum, clamped to {max}");
        max
    } else {
        val
    }
}

/// Parse a boolean option (`true/false/yes/no/on/off/1/0`).
pub fn bool_opt(src: &dyn ConfigSource, key: &str, default: bool) -> bool {
    let Some(raw) = src.get(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "enable" | "1" => true,
        "false" | "no" | "off" | "disable" | "0" => false,
        other => {
            warn!("config: {key}='{other}' is not a boolean, using {default}");
            default
        }
    }
}

// =======================================================================
// Buffering table
// =======================================================================

/// One row of the sample-rate to buffering mapping: at or above `min_rate`
/// use `total_samples` buffered samples and `tx_min_buffers` per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrateBufEntry {
    /// Row applies to sample rates >= this value (Hz).
    pub min_rate: u32,
    /// Total buffered samples per direction.
    pub total_samples: u32,
    /// Minimum full buffers per TX submission.
    pub tx_min_buffers: u32,
}

/// Parse `srate_buffered_samples`: comma-separated `rate/samples/txmin`
/// triples, e.g. `"1000000/2048/2,10000000/8192/4"`. Rows are sorted by
/// rate; malformed rows are dropped with a warning.
#[must_use]
pub fn parse_srate_table(raw: &str) -> Vec<SrateBufEntry> {
    let mut table = Vec::new();
    for row in raw.split(',').map(str::trim).filter(|r| !r.is_empty()) {
        let mut parts = row.split('/');
        let entry = (|| {
            let min_rate = parts.next()?.trim().parse().ok()?;
            let total_samples = parts.next()?.trim().parse().ok()?;
            let tx_min_buffers = parts.next()?.trim().parse().ok()?;
            Some(SrateBufEntry {
                min_rate,
                total_samples,
                tx_min_buffers,
            })
        })();
        match entry {
            Some(e) => table.push(e),
            None => warn!("config: srate_buffered_samples row '{row}' malformed, dropped"),
        }
    }
    table.sort_by_key(|e| e.min_rate);
    table
}

// =======================================================================
// Peripheral tracing policy
// =======================================================================

/// Trace verbosity for one on-board peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    /// No tracing.
    Off,
    /// Log writes only.
    Writes,
    /// Log reads and writes.
    All,
}

/// Per-peripheral tracing policy, configured via `<periph>_debug`,
/// `<periph>_trackaddr` and `<periph>_level`.
#[derive(Debug, Clone, Default)]
pub struct PeriphTrace {
    /// Master switch.
    pub enabled: bool,
    /// Addresses to trace; empty means all.
    pub track: Vec<u8>,
    /// Verbosity when enabled.
    pub level: Option<TraceLevel>,
}

impl PeriphTrace {
    /// Effective level: `Off` unless enabled.
    #[must_use]
    pub fn effective(&self) -> TraceLevel {
        if !self.enabled {
            return TraceLevel::Off;
        }
        self.level.unwrap_or(TraceLevel::Writes)
    }

    /// Whether `addr` is in the tracked set.
    #[must_use]
    pub fn tracks(&self, addr: u8) -> bool {
        self.track.is_empty() || self.track.contains(&addr)
    }
}

/// Parse a `trackaddr` list: comma-separated decimal/hex addresses and
/// `a-b` ranges, e.g. `"0x05,0x40-0x43,9"`.
#[must_use]
pub fn parse_trackaddr(raw: &str) -> Vec<u8> {
    fn addr(s: &str) -> Option<u8> {
        let s = s.trim();
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }
    let mut out = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some((lo, hi)) = item.split_once('-') {
            if let (Some(lo), Some(hi)) = (addr(lo), addr(hi)) {
                if lo <= hi {
                    out.extend(lo..=hi);
                    continue;
                }
            }
            warn!("config: trackaddr range '{item}' malformed, dropped");
        } else if let Some(a) = addr(item) {
            out.push(a);
        } else {
            warn!("config: trackaddr '{item}' malformed, dropped");
        }
    }
    out
}

fn periph_trace(src: &dyn ConfigSource, prefix: &str) -> PeriphTrace {
    let level = src.get(&format!("{prefix}_level")).map(|raw| {
        match raw.trim().parse::<u8>().unwrap_or(1) {
            0 => TraceLevel::Off,
            1 => TraceLevel::Writes,
            _ => TraceLevel::All,
        }
    });
    PeriphTrace {
        enabled: bool_opt(src, &format!("{prefix}_debug"), false),
        track: src
            .get(&format!("{prefix}_trackaddr"))
            .map(|raw| parse_trackaddr(&raw))
            .unwrap_or_default(),
        level,
    }
}

// =======================================================================
// Runtime tunables
// =======================================================================

/// Knobs that control messages may change while streaming. Published via
/// `ArcSwap<Tunables>` on the device; hot paths load one snapshot per
/// buffer, never mid-buffer.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Energize ceiling: unit floats map to +/- this 12-bit value.
    pub sample_max: i32,
    /// Warn when more than this percent of a send call clamps.
    pub warn_clamped_percent: f32,
    /// TX forward-gap auto-fill window (ms); 0 disables.
    pub silence_time_ms: u32,
    /// RX "data in the past" tolerance window (ms).
    pub rx_past_interval_ms: u32,
    /// Running RX DC offset autocorrection.
    pub rx_dc_autocorrect: bool,
    /// Print RX DC min/max/avg windows while a debug countdown is active.
    pub rx_dc_showinfo: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            sample_max: DEFAULT_SAMPLE_ENERGIZE,
            warn_clamped_percent: DEFAULT_WARN_CLAMPED_PERCENT,
            silence_time_ms: DEFAULT_SILENCE_TIME_MS,
            rx_past_interval_ms: DEFAULT_RX_PAST_INTERVAL_MS,
            rx_dc_autocorrect: true,
            rx_dc_showinfo: false,
        }
    }
}

// =======================================================================
// Config
// =======================================================================

/// Discipliner configuration block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisciplineConfig {
    /// Overall system timing accuracy (us).
    pub system_accuracy_us: u64,
    /// Target residual drift (ppb).
    pub accuracy_ppb: u64,
    /// Known good measurement delay (us).
    pub known_delay_us: u64,
    /// Delay below which a pinning is accepted immediately (us).
    pub best_delay_us: u64,
    /// Delay above which a measurement is discarded (us).
    pub max_delay_us: u64,
}

impl Default for DisciplineConfig {
    fn default() -> Self {
        Self {
            system_accuracy_us: DEFAULT_SYSTEM_ACCURACY_US,
            accuracy_ppb: DEFAULT_ACCURACY_PPB,
            known_delay_us: DEFAULT_KNOWN_DELAY_US,
            best_delay_us: DEFAULT_BEST_DELAY_US,
            max_delay_us: DEFAULT_MAX_DELAY_US,
        }
    }
}

/// Full startup configuration, parsed once at `open()`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device serial filter; empty matches the first board found.
    pub serial: String,
    /// Total buffered samples per direction.
    pub buffered_samples: u32,
    /// Minimum full buffers per TX bulk submission.
    pub tx_min_buffers: u32,
    /// Sample-rate-dependent buffering overrides, sorted by rate.
    pub srate_table: Vec<SrateBufEntry>,
    /// RX latency bound, super-speed link (us).
    pub rx_latency_super_us: u32,
    /// RX latency bound, high-speed link (us).
    pub rx_latency_high_us: u32,
    /// TX latency bound, super-speed link (us).
    pub tx_latency_super_us: u32,
    /// TX latency bound, high-speed link (us).
    pub tx_latency_high_us: u32,
    /// Sample rate ceiling on a super-speed link (Hz).
    pub max_samplerate_super: u32,
    /// Sample rate ceiling on a high-speed link (Hz).
    pub max_samplerate_high: u32,
    /// Initial VCTCXO trim; overridden by the cal-cache record when present.
    pub freq_offset: f64,
    /// Apply TX FPGA gain correction as a software IQ scale instead of a
    /// GPIO register (for FPGA images without the correction block).
    pub tx_fpga_corr_gain_software: bool,
    /// Discipliner parameters.
    pub discipline: DisciplineConfig,
    /// Startup VGA presets, applied through the reconciler at initialize.
    pub tx_vga1: Option<i32>,
    /// See `tx_vga1`.
    pub tx_vga2: Option<i32>,
    /// See `tx_vga1`.
    pub rx_vga1: Option<i32>,
    /// See `tx_vga1`.
    pub rx_vga2: Option<i32>,
    /// Initial runtime tunables.
    pub tunables: Tunables,
    /// GPIO block tracing.
    pub gpio_trace: PeriphTrace,
    /// Transceiver tracing.
    pub xcvr_trace: PeriphTrace,
    /// VCTCXO DAC tracing.
    pub dac_trace: PeriphTrace,
    /// Clock synthesizer tracing.
    pub synth_trace: PeriphTrace,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_source(&HashMap::new())
    }
}

impl Config {
    /// Parse a configuration from the host's key/value source. Unknown keys
    /// are ignored; out-of-range values clamp with a log line.
    pub fn from_source(src: &dyn ConfigSource) -> Self {
        let buffered_samples = clamp_opt(
            src,
            "buffered_samples",
            DEFAULT_BUFFERED_SAMPLES,
            MIN_BUFFERED_SAMPLES,
            MAX_BUFFERED_SAMPLES,
        );
        let cfg = Self {
            serial: src.get("serial").unwrap_or_default(),
            buffered_samples,
            tx_min_buffers: clamp_opt(src, "tx_min_buffers", DEFAULT_TX_MIN_BUFFERS, 1, 64),
            srate_table: src
                .get("srate_buffered_samples")
                .map(|raw| parse_srate_table(&raw))
                .unwrap_or_default(),
            rx_latency_super_us: clamp_opt(
                src,
                "rx_latency_super",
                DEFAULT_RX_LATENCY_SUPER_US,
                0,
                200_000,
            ),
            rx_latency_high_us: clamp_opt(
                src,
                "rx_latency_high",
                DEFAULT_RX_LATENCY_HIGH_US,
                0,
                200_000,
            ),
            tx_latency_super_us: clamp_opt(
                src,
                "tx_latency_super",
                DEFAULT_TX_LATENCY_SUPER_US,
                0,
                200_000,
            ),
            tx_latency_high_us: clamp_opt(
                src,
                "tx_latency_high",
                DEFAULT_TX_LATENCY_HIGH_US,
                0,
                200_000,
            ),
            max_samplerate_super: clamp_opt(
                src,
                "max_samplerate_super",
                MAX_SAMPLE_RATE,
                MIN_SAMPLE_RATE,
                MAX_SAMPLE_RATE,
            ),
            max_samplerate_high: clamp_opt(
                src,
                "max_samplerate_high",
                DEFAULT_MAX_SAMPLE_RATE_HIGH,
                MIN_SAMPLE_RATE,
                MAX_SAMPLE_RATE,
            ),
            freq_offset: clamp_opt(
                src,
                "RadioFrequencyOffset",
                DEFAULT_FREQ_OFFSET,
                FREQ_OFFSET_RANGE.0,
                FREQ_OFFSET_RANGE.1,
            ),
            tx_fpga_corr_gain_software: bool_opt(src, "tx_fpga_corr_gain_software", false),
            discipline: DisciplineConfig {
                system_accuracy_us: clamp_opt(
                    src,
                    "system_accuracy",
                    DEFAULT_SYSTEM_ACCURACY_US,
                    50,
                    10_000,
                ),
                accuracy_ppb: clamp_opt(src, "accuracy_ppb", DEFAULT_ACCURACY_PPB, 1, 1_000),
                known_delay_us: clamp_opt(
                    src,
                    "known_delay",
                    DEFAULT_KNOWN_DELAY_US,
                    50,
                    10_000,
                ),
                best_delay_us: clamp_opt(src, "best_delay", DEFAULT_BEST_DELAY_US, 50, 10_000),
                max_delay_us: clamp_opt(src, "max_delay", DEFAULT_MAX_DELAY_US, 100, 20_000),
            },
            tx_vga1: src.get("tx_vga1").and_then(|v| v.trim().parse().ok()),
            tx_vga2: src.get("tx_vga2").and_then(|v| v.trim().parse().ok()),
            rx_vga1: src.get("rx_vga1").and_then(|v| v.trim().parse().ok()),
            rx_vga2: src.get("rx_vga2").and_then(|v| v.trim().parse().ok()),
            tunables: Tunables {
                sample_max: clamp_opt(
                    src,
                    "sampleenergize",
                    DEFAULT_SAMPLE_ENERGIZE,
                    1,
                    DEFAULT_SAMPLE_ENERGIZE,
                ),
                warn_clamped_percent: clamp_opt(
                    src,
                    "warn_clamped",
                    DEFAULT_WARN_CLAMPED_PERCENT,
                    0.0,
                    100.0,
                ),
                silence_time_ms: clamp_opt(
                    src,
                    "silence_time",
                    DEFAULT_SILENCE_TIME_MS,
                    0,
                    60_000,
                ),
                rx_past_interval_ms: clamp_opt(
                    src,
                    "rx_ts_past_error_interval",
                    DEFAULT_RX_PAST_INTERVAL_MS,
                    RX_PAST_INTERVAL_RANGE_MS.0,
                    RX_PAST_INTERVAL_RANGE_MS.1,
                ),
                rx_dc_autocorrect: bool_opt(src, "rx_dc_autocorrect", true),
                rx_dc_showinfo: bool_opt(src, "rx_dc_showinfo", false),
            },
            gpio_trace: periph_trace(src, "gpio"),
            xcvr_trace: periph_trace(src, "xcvr"),
            dac_trace: periph_trace(src, "dac"),
            synth_trace: periph_trace(src, "synth"),
        };
        debug!(
            "config: buffered_samples={} tx_min_buffers={} freq_offset={}",
            cfg.buffered_samples, cfg.tx_min_buffers, cfg.freq_offset
        );
        cfg
    }

    /// Buffering parameters for `rate`: the last `srate_table` row at or
    /// below the rate, else the global defaults.
    #[must_use]
    pub fn buffering_for_rate(&self, rate: u32) -> SrateBufEntry {
        let mut entry = SrateBufEntry {
            min_rate: 0,
            total_samples: self.buffered_samples,
            tx_min_buffers: self.tx_min_buffers,
        };
        for row in &self.srate_table {
            if rate >= row.min_rate {
                entry = *row;
            } else {
                break;
            }
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.buffered_samples, DEFAULT_BUFFERED_SAMPLES);
        assert_eq!(cfg.tunables.sample_max, DEFAULT_SAMPLE_ENERGIZE);
        assert_eq!(cfg.freq_offset, DEFAULT_FREQ_OFFSET);
        assert!(cfg.tunables.rx_dc_autocorrect);
    }

    #[test]
    fn test_clamp_below_and_above() {
        let cfg = Config::from_source(&src(&[
            ("buffered_samples", "100"),
            ("RadioFrequencyOffset", "500"),
        ]));
        assert_eq!(cfg.buffered_samples, MIN_BUFFERED_SAMPLES);
        assert_eq!(cfg.freq_offset, FREQ_OFFSET_RANGE.1);
    }

    #[test]
    fn test_unparseable_falls_back() {
        let cfg = Config::from_source(&src(&[("buffered_samples", "lots")]));
        assert_eq!(cfg.buffered_samples, DEFAULT_BUFFERED_SAMPLES);
    }

    #[test]
    fn test_srate_table_parse_and_lookup() {
        let cfg = Config::from_source(&src(&[(
            "srate_buffered_samples",
            "10000000/8192/4, 1000000/2048/2, garbage",
        )]));
        assert_eq!(cfg.srate_table.len(), 2);
        assert_eq!(cfg.buffering_for_rate(500_000).total_samples, 2048);
        assert_eq!(cfg.buffering_for_rate(2_000_000).total_samples, 2048);
        let hi = cfg.buffering_for_rate(20_000_000);
        assert_eq!(hi.total_samples, 8192);
        assert_eq!(hi.tx_min_buffers, 4);
    }

    #[test]
    fn test_trackaddr_ranges() {
        let addrs = parse_trackaddr("0x05, 0x40-0x42, 9, junk");
        assert_eq!(addrs, vec![0x05, 0x40, 0x41, 0x42, 9]);
    }

    #[test]
    fn test_periph_trace_options() {
        let cfg = Config::from_source(&src(&[
            ("xcvr_debug", "yes"),
            ("xcvr_trackaddr", "0x09"),
            ("xcvr_level", "2"),
        ]));
        assert_eq!(cfg.xcvr_trace.effective(), TraceLevel::All);
        assert!(cfg.xcvr_trace.tracks(0x09));
        assert!(!cfg.xcvr_trace.tracks(0x0a));
        assert_eq!(cfg.gpio_trace.effective(), TraceLevel::Off);
    }

    #[test]
    fn test_bool_opt_variants() {
        let s = src(&[("a", "on"), ("b", "0"), ("c", "maybe")]);
        assert!(bool_opt(&s, "a", false));
        assert!(!bool_opt(&s, "b", true));
        assert!(bool_opt(&s, "c", true));
        assert!(!bool_opt(&s, "missing", false));
    }
}
