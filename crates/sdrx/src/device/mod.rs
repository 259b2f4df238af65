// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Device lifecycle and public entry points.
//!
//! One [`Device`] is one physical board. Lifecycle:
//!
//! ```text
//! open -> probe (firmware version, cal cache) -> FPGA check/load
//!      -> initialize (rf link, DMA mode, transceiver defaults, DAC trim,
//!         initial state) -> streaming / calibration -> shutdown
//! ```
//!
//! Locking: the TX serializer is always taken before the RX serializer;
//! operations touching both directions (reconciler, loopback) follow that
//! order. The peripheral bus serializes its own command exchanges and is a
//! leaf - it never takes a direction lock.

pub mod calcache;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use log::{debug, info, warn};
use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::capture::{Capture, CaptureMailbox};
use crate::cal::CalControl;
use crate::clocksynth::ClockSynth;
use crate::config::{Config, Env, Tunables, DEFAULT_FREQ_OFFSET, FREQ_OFFSET_RANGE};
use crate::discipline::{DisciplineIo, Discipliner, Pinning};
use crate::dsp::Cf32;
use crate::dump::DumpSet;
use crate::error::{DeviceError, Result};
use crate::events::{BoardId, DriverEvent, EventKind, EventSink};
use crate::frame::BufLayout;
use crate::periph::{gpio, PeriphBus, PeriphDev};
use crate::reconcile;
use crate::rx::RxPath;
use crate::state::{
    common_changed, dir_changed, DevState, Direction, LoopbackMode, LoopbackParams, TxPattern,
};
use crate::sync::{SyncReply, SyncStateMailbox, SYNC_STATE_TIMEOUT};
use crate::tx::TxPath;
use crate::usb::device::UsbHandle;
use crate::usb::{vendor, AltSetting, CancelToken, Endpoint, UsbBackend, UsbSpeed, BULK_TIMEOUT, CTRL_TIMEOUT};
use crate::workers::StreamWorkers;
use crate::xcvr::Xcvr;
use calcache::CalCache;

/// FPGA bitstream upload chunk.
const FPGA_CHUNK: usize = 4096;

/// Monotonic host clock in microseconds.
#[must_use]
pub(crate) fn monotonic_us() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Probed version info.
#[derive(Debug, Clone, Default)]
pub struct BoardInfo {
    /// Firmware version string.
    pub fw_version: String,
    /// FPGA image version word.
    pub fpga_version: u32,
    /// FPGA image MD5 (when loaded by this driver).
    pub fpga_md5: Option<String>,
    /// FPGA source file (when loaded by this driver).
    pub fpga_path: Option<PathBuf>,
    /// Transceiver chip revision.
    pub chip_revision: u8,
}

/// One physical board.
pub struct Device {
    pub(crate) usb: Arc<dyn UsbBackend>,
    pub(crate) bus: Arc<PeriphBus>,
    pub(crate) xcvr: Arc<Xcvr>,
    pub(crate) synth: ClockSynth,
    pub(crate) cfg: Config,
    pub(crate) tunables: ArcSwap<Tunables>,
    pub(crate) cancel: CancelToken,
    pub(crate) serial: String,
    pub(crate) speed: UsbSpeed,
    pub(crate) cal_cache: CalCache,
    pub(crate) info: Mutex<BoardInfo>,
    pub(crate) initialized: AtomicBool,
    closing: AtomicBool,
    /// Lock order: `tx` before `rx`, both before `applied`.
    pub(crate) tx: Mutex<TxPath>,
    pub(crate) rx: Mutex<RxPath>,
    pub(crate) applied: Mutex<DevState>,
    pub(crate) tx_capture: Arc<CaptureMailbox>,
    pub(crate) rx_capture: Arc<CaptureMailbox>,
    pub(crate) sync_state: Arc<SyncStateMailbox>,
    pub(crate) discipline: Mutex<Discipliner>,
    pub(crate) workers: Mutex<Option<StreamWorkers>>,
    pub(crate) cal: Arc<CalControl>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) dumps: Mutex<DumpSet>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").finish_non_exhaustive()
    }
}

impl Device {
    /// Open the first board matching the configured serial filter.
    pub fn open(
        cfg: Config,
        env: Arc<dyn Env>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>> {
        let usb = Arc::new(UsbHandle::open(&cfg.serial)?);
        Self::open_with_backend(cfg, env, events, usb)
    }

    /// Open over an injected transport (tests, emulated boards).
    pub fn open_with_backend(
        cfg: Config,
        env: Arc<dyn Env>,
        events: Arc<dyn EventSink>,
        usb: Arc<dyn UsbBackend>,
    ) -> Result<Arc<Self>> {
        let cancel = CancelToken::new();
        let serial = usb.serial();
        let speed = usb.speed();

        let mut fw_buf = [0u8; 64];
        let fw_version = match usb.vendor_in(vendor::QUERY_VERSION, 0, 0, &mut fw_buf, CTRL_TIMEOUT)
        {
            Ok(n) => String::from_utf8_lossy(&fw_buf[..n]).trim().to_string(),
            Err(err) => {
                warn!("open '{serial}': firmware version query failed: {err}");
                String::new()
            }
        };

        let mut page = [0u8; calcache::CAL_PAGE_LEN];
        let cal_cache = match usb.vendor_in(vendor::READ_CAL_CACHE, 0, 0, &mut page, CTRL_TIMEOUT) {
            Ok(_) => CalCache::parse(&page).unwrap_or_default(),
            Err(err) => {
                warn!("open '{serial}': calibration cache unavailable: {err}");
                CalCache::default()
            }
        };

        // FPGA check, auto-load when unconfigured.
        let mut status = [0u8; 4];
        usb.vendor_in(vendor::QUERY_FPGA_STATUS, 0, 0, &mut status, CTRL_TIMEOUT)
            .map_err(|e| e.wrap("FPGA status query"))?;
        let (fpga_md5, fpga_path) = if status[0] == 0 {
            let (md5, path) = load_fpga(&usb, &cancel, env.as_ref(), &cal_cache)?;
            (Some(md5), Some(path))
        } else {
            (None, None)
        };

        let freq_offset = resolve_freq_offset(&cfg, &cal_cache);

        let bus = Arc::new(PeriphBus::new(
            usb.clone(),
            cancel.clone(),
            [
                cfg.gpio_trace.clone(),
                cfg.xcvr_trace.clone(),
                cfg.dac_trace.clone(),
                cfg.synth_trace.clone(),
            ],
        ));
        let xcvr = Arc::new(Xcvr::new(bus.clone()));
        let synth = ClockSynth::new(bus.clone());

        let layout = BufLayout::derive(speed, cfg.buffered_samples, cfg.tx_min_buffers);
        let tx_capture = Arc::new(CaptureMailbox::new());
        let rx_capture = Arc::new(CaptureMailbox::new());
        let sync_state = Arc::new(SyncStateMailbox::new());
        let tx = TxPath::new(
            usb.clone(),
            cancel.clone(),
            tx_capture.clone(),
            sync_state.clone(),
            layout,
        );
        let rx = RxPath::new(
            usb.clone(),
            cancel.clone(),
            rx_capture.clone(),
            xcvr.clone(),
            layout,
        );

        info!(
            "opened board '{serial}' ({}), firmware '{fw_version}'",
            speed.name()
        );
        Ok(Arc::new(Self {
            usb,
            bus,
            xcvr,
            synth,
            tunables: ArcSwap::from_pointee(cfg.tunables.clone()),
            cancel,
            serial,
            speed,
            cal_cache,
            info: Mutex::new(BoardInfo {
                fw_version,
                fpga_md5,
                fpga_path,
                ..BoardInfo::default()
            }),
            initialized: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            applied: Mutex::new(DevState::default()),
            tx_capture,
            rx_capture,
            sync_state,
            discipline: Mutex::new(Discipliner::new(cfg.discipline.clone(), freq_offset)),
            workers: Mutex::new(None),
            cal: Arc::new(CalControl::new()),
            events,
            dumps: Mutex::new(DumpSet::default()),
            cfg,
        }))
    }

    /// Bring the board to streaming-capable state. A failure leaves the
    /// device closed (RF off, `initialized` false) and is announced.
    pub fn initialize(self: &Arc<Self>) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        match self.initialize_inner() {
            Ok(()) => {
                self.initialized.store(true, Ordering::Release);
                let offset = self.discipline.lock().freq_offset();
                self.notify(
                    EventKind::Started,
                    vec![
                        ("RadioFrequencyOffset".into(), format!("{offset:.2}")),
                        ("firmware".into(), self.info.lock().fw_version.clone()),
                    ],
                );
                Ok(())
            }
            Err(err) => {
                self.notify(
                    EventKind::Failure,
                    vec![("error".into(), err.to_string())],
                );
                Err(err)
            }
        }
    }

    fn initialize_inner(self: &Arc<Self>) -> Result<()> {
        self.usb.set_alt_setting(AltSetting::RfLink)?;
        // DMA transfer sizing is speed-dependent and owned here, so no later
        // code path can leave it unmanaged.
        match self.speed {
            UsbSpeed::High => {
                self.bus
                    .set_bits(PeriphDev::Gpio, gpio::BOARD_CTRL, gpio::CTRL_SMALL_DMA)?;
            }
            UsbSpeed::Super => {
                self.bus
                    .clear_bits(PeriphDev::Gpio, gpio::BOARD_CTRL, gpio::CTRL_SMALL_DMA)?;
            }
        }
        {
            let mut info = self.info.lock();
            let mut version = [0u8; 4];
            self.bus
                .read(PeriphDev::Gpio, gpio::FPGA_VERSION, &mut version)?;
            info.fpga_version = u32::from_le_bytes(version);
            info.chip_revision = self.xcvr.chip_revision()?;
            debug!(
                "initialize '{}': fpga version 0x{:08x}, chip revision {}",
                self.serial, info.fpga_version, info.chip_revision
            );
        }
        // Transceiver baseline: everything off until the reconciler enables
        // it deliberately.
        self.xcvr.set_soft_enable(Direction::Tx, false)?;
        self.xcvr.set_soft_enable(Direction::Rx, false)?;
        self.xcvr.loopback_path(LoopbackMode::None)?;
        // Seed the VCTCXO trim.
        let offset = self.discipline.lock().freq_offset();
        self.bus.write_dac(trim_word(offset))?;
        // Startup presets through the reconciler.
        let mut desired = self.delta();
        if let Some(v) = self.cfg.tx_vga1 {
            desired.tx.vga1 = v;
            desired.changed_tx |= dir_changed::VGA1;
        }
        if let Some(v) = self.cfg.tx_vga2 {
            desired.tx.vga2 = v;
            desired.changed_tx |= dir_changed::VGA2;
        }
        if let Some(v) = self.cfg.rx_vga1 {
            desired.rx.vga1 = v;
            desired.changed_rx |= dir_changed::VGA1;
        }
        if let Some(v) = self.cfg.rx_vga2 {
            desired.rx.vga2 = v;
            desired.changed_rx |= dir_changed::VGA2;
        }
        desired.rx_dc_auto = self.cfg.tunables.rx_dc_autocorrect;
        desired.changed_common |= common_changed::RX_DC_AUTO;
        self.set_state(&desired)
    }

    /// Orderly close: cancel I/O, stop workers, disable RF, park the link.
    pub fn shutdown(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.cal.request_stop(true);
        self.sync_state.cancel();
        self.tx_capture.cancel();
        self.rx_capture.cancel();
        if let Some(workers) = self.workers.lock().take() {
            workers.stop();
        }
        if self.initialized.swap(false, Ordering::AcqRel) {
            let _ = self
                .usb
                .vendor_out(vendor::RF_RX, 0, 0, &[], CTRL_TIMEOUT);
            let _ = self
                .usb
                .vendor_out(vendor::RF_TX, 0, 0, &[], CTRL_TIMEOUT);
            let _ = self.usb.set_alt_setting(AltSetting::Idle);
        }
        self.discipline.lock().stop();
        self.dumps.lock().close_all();
        self.notify(EventKind::Stopped, Vec::new());
        info!("closed board '{}'", self.serial);
    }

    /// Post a notification.
    pub(crate) fn notify(&self, kind: EventKind, params: Vec<(String, String)>) {
        self.events.notify(DriverEvent {
            kind,
            board: self.board_id(),
            params,
        });
    }

    /// Board identity.
    #[must_use]
    pub fn board_id(&self) -> BoardId {
        let (bus, address) = self.usb.bus_address();
        BoardId {
            serial: self.serial.clone(),
            bus,
            address,
            speed: self.speed,
        }
    }

    /// Probed versions.
    #[must_use]
    pub fn board_info(&self) -> BoardInfo {
        self.info.lock().clone()
    }

    /// Serial string.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Link speed class.
    #[must_use]
    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    /// Whether `initialize` has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DeviceError::not_initialized(format!(
                "board '{}' not initialized",
                self.serial
            )))
        }
    }

    // ------------------------------------------------------------------
    // Streaming entry points
    // ------------------------------------------------------------------

    /// Send float IQ at `ts`. Applies any sync-set-state request at the
    /// frame boundary it was picked up on.
    pub fn sync_tx(self: &Arc<Self>, ts: u64, iq: &[Cf32]) -> Result<()> {
        self.ensure_initialized()?;
        let tunables = self.tunables.load_full();
        let mut tx = self.tx.lock();
        tx.refresh_tunables(&tunables);
        tx.refresh_scales();
        let mut offset = 0usize;
        while offset < iq.len() {
            let (consumed, sync) = tx.send_some(ts + offset as u64, &iq[offset..])?;
            offset += consumed;
            if let Some(req) = sync {
                let applied_ts = tx.stream_pos();
                let mut state = req.state.clone();
                state.tx.timestamp = applied_ts;
                let result = {
                    let mut rx = self.rx.lock();
                    reconcile::apply_state(self, &mut tx, &mut rx, &state)
                };
                req.complete(result, applied_ts);
            }
        }
        Ok(())
    }

    /// Receive float IQ for caller position `ts`; returns samples produced
    /// (short on a past-threshold stop with partial data).
    pub fn sync_rx(self: &Arc<Self>, ts: u64, out: &mut [Cf32]) -> Result<usize> {
        self.ensure_initialized()?;
        let tunables = self.tunables.load_full();
        let mut rx = self.rx.lock();
        rx.refresh_tunables(&tunables);
        rx.recv(ts, out)
    }

    /// Blocking capture of the live stream in one direction. The stream
    /// must be pumped (workers or a foreign caller) while this waits.
    pub fn capture(self: &Arc<Self>, dir: Direction, ts: u64, samples: usize) -> Result<Capture> {
        self.ensure_initialized()?;
        let mailbox = match dir {
            Direction::Tx => &self.tx_capture,
            Direction::Rx => &self.rx_capture,
        };
        mailbox.capture(ts, samples)
    }

    /// Non-blocking capture registration; the result arrives on the
    /// returned channel while the caller keeps the stream pumped.
    pub fn capture_channel(
        self: &Arc<Self>,
        dir: Direction,
        ts: u64,
        samples: usize,
    ) -> Result<crossbeam::channel::Receiver<Result<Capture>>> {
        self.ensure_initialized()?;
        match dir {
            Direction::Tx => self.tx_capture.request(ts, samples),
            Direction::Rx => self.rx_capture.request(ts, samples),
        }
    }

    /// TX path counters.
    #[must_use]
    pub fn tx_stats(&self) -> crate::tx::TxStats {
        self.tx.lock().stats()
    }

    /// RX path counters.
    #[must_use]
    pub fn rx_stats(&self) -> crate::rx::RxStats {
        self.rx.lock().stats()
    }

    // ------------------------------------------------------------------
    // State application
    // ------------------------------------------------------------------

    /// Apply a desired state (only flagged fields are touched).
    pub fn set_state(self: &Arc<Self>, desired: &DevState) -> Result<()> {
        let mut tx = self.tx.lock();
        let mut rx = self.rx.lock();
        reconcile::apply_state(self, &mut tx, &mut rx, desired)
    }

    /// Foreign-thread state change applied at a TX frame boundary; blocks
    /// until the TX path picks it up (12 s budget).
    pub fn request_sync_state(self: &Arc<Self>, desired: DevState) -> Result<SyncReply> {
        self.ensure_initialized()?;
        self.sync_state.request(desired, SYNC_STATE_TIMEOUT)
    }

    /// Snapshot of the realized state.
    #[must_use]
    pub fn applied_state(&self) -> DevState {
        self.applied.lock().clone()
    }

    /// Fresh delta template: realized state with no change bits.
    #[must_use]
    pub fn delta(&self) -> DevState {
        let mut s = self.applied.lock().clone();
        s.changed_common = 0;
        s.changed_tx = 0;
        s.changed_rx = 0;
        s
    }

    // ------------------------------------------------------------------
    // Convenience setters (delta builders)
    // ------------------------------------------------------------------

    /// Tune one direction.
    pub fn set_frequency(self: &Arc<Self>, dir: Direction, hz: u64) -> Result<()> {
        let mut d = self.delta();
        d.dir_mut(dir).frequency_hz = hz;
        *d.changed_mut(dir) |= dir_changed::FREQUENCY;
        self.set_state(&d)
    }

    /// Realized frequency from hardware.
    pub fn get_frequency(&self, dir: Direction) -> Result<u64> {
        self.xcvr.get_frequency(dir)
    }

    /// Set one direction's sample rate.
    pub fn set_sample_rate(self: &Arc<Self>, dir: Direction, rate: u32) -> Result<()> {
        let mut d = self.delta();
        d.dir_mut(dir).sample_rate_hz = rate;
        *d.changed_mut(dir) |= dir_changed::SAMPLE_RATE;
        self.set_state(&d)
    }

    /// Realized sample rate from hardware.
    pub fn get_sample_rate(&self, dir: Direction) -> Result<f64> {
        self.synth.get_sample_rate(dir)
    }

    /// Set a VGA stage gain.
    pub fn set_vga(self: &Arc<Self>, dir: Direction, stage: u8, gain: i32) -> Result<()> {
        let mut d = self.delta();
        let bit = match stage {
            1 => dir_changed::VGA1,
            2 => dir_changed::VGA2,
            _ => {
                return Err(DeviceError::out_of_range(format!("no VGA stage {stage}")));
            }
        };
        match stage {
            1 => d.dir_mut(dir).vga1 = gain,
            _ => d.dir_mut(dir).vga2 = gain,
        }
        *d.changed_mut(dir) |= bit;
        self.set_state(&d)
    }

    /// Set a DC offset branch.
    pub fn set_dc_offset(
        self: &Arc<Self>,
        dir: Direction,
        branch: crate::xcvr::IqBranch,
        value: i32,
    ) -> Result<()> {
        let mut d = self.delta();
        let bit = match branch {
            crate::xcvr::IqBranch::I => {
                d.dir_mut(dir).dc_offset_i = value;
                dir_changed::DC_I
            }
            crate::xcvr::IqBranch::Q => {
                d.dir_mut(dir).dc_offset_q = value;
                dir_changed::DC_Q
            }
        };
        *d.changed_mut(dir) |= bit;
        self.set_state(&d)
    }

    /// Set an FPGA IQ correction.
    pub fn set_fpga_corr(
        self: &Arc<Self>,
        dir: Direction,
        kind: crate::xcvr::CorrKind,
        value: i32,
    ) -> Result<()> {
        let mut d = self.delta();
        let bit = match kind {
            crate::xcvr::CorrKind::Phase => {
                d.dir_mut(dir).fpga_corr_phase = value;
                dir_changed::FPGA_PHASE
            }
            crate::xcvr::CorrKind::Gain => {
                d.dir_mut(dir).fpga_corr_gain = value;
                dir_changed::FPGA_GAIN
            }
        };
        *d.changed_mut(dir) |= bit;
        self.set_state(&d)
    }

    /// Set the TX I/Q power balance.
    pub fn set_power_balance(self: &Arc<Self>, balance: f64) -> Result<()> {
        let mut d = self.delta();
        d.tx.power_balance = balance;
        d.changed_tx |= dir_changed::POWER_BALANCE;
        self.set_state(&d)
    }

    /// Route a loopback path.
    pub fn set_loopback(
        self: &Arc<Self>,
        mode: LoopbackMode,
        params: LoopbackParams,
    ) -> Result<()> {
        let mut d = self.delta();
        d.loopback = mode;
        d.loopback_params = params;
        d.changed_common |= common_changed::LOOPBACK;
        self.set_state(&d)
    }

    /// Set the transmit pattern.
    pub fn set_tx_pattern(self: &Arc<Self>, pattern: TxPattern, gain: f32) -> Result<()> {
        let mut d = self.delta();
        d.tx_pattern = pattern;
        d.tx_pattern_gain = gain;
        d.changed_common |= common_changed::TX_PATTERN;
        self.set_state(&d)
    }

    /// Enable or disable one direction's RF front end.
    pub fn enable_rf(self: &Arc<Self>, dir: Direction, on: bool) -> Result<()> {
        let mut d = self.delta();
        d.dir_mut(dir).rf_enabled = on;
        *d.changed_mut(dir) |= dir_changed::RF_ENABLED;
        self.set_state(&d)
    }

    // ------------------------------------------------------------------
    // Clock discipline
    // ------------------------------------------------------------------

    /// One discipline cycle; call from the host's periodic tick.
    pub fn discipline_tick(self: &Arc<Self>) -> Result<()> {
        self.ensure_initialized()?;
        let rate = self.applied.lock().rx.sample_rate_hz;
        let now = monotonic_us();
        let io = DeviceDisciplineIo { dev: self };
        let mut disc = self.discipline.lock();
        disc.set_configured_rate(rate, now);
        disc.tick(&io, now)
    }

    /// Current VCTCXO trim.
    #[must_use]
    pub fn freq_offset(&self) -> f64 {
        self.discipline.lock().freq_offset()
    }

    /// Operator trim write: program the DAC, update the discipliner and
    /// announce the change.
    pub fn set_freq_offset(self: &Arc<Self>, offset: f64) -> Result<()> {
        let offset = offset.clamp(FREQ_OFFSET_RANGE.0, FREQ_OFFSET_RANGE.1);
        self.bus.write_dac(trim_word(offset))?;
        let mut disc = self.discipline.lock();
        disc.set_freq_offset(offset);
        disc.postpone(monotonic_us(), true);
        drop(disc);
        self.notify(
            EventKind::FreqOffsetChanged,
            vec![("RadioFrequencyOffset".into(), format!("{offset:.2}"))],
        );
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // Best-effort teardown for handles dropped without shutdown(); the
        // Arc-based API normally goes through shutdown() explicitly.
        self.cancel.cancel();
        self.sync_state.cancel();
        self.tx_capture.cancel();
        self.rx_capture.cancel();
    }
}

/// Discipliner hardware access: GPIO sample-counter snapshot paired with
/// the monotonic clock, DAC writes announced through the event sink.
struct DeviceDisciplineIo<'a> {
    dev: &'a Arc<Device>,
}

impl DisciplineIo for DeviceDisciplineIo<'_> {
    fn read_pinning(&self) -> Result<Pinning> {
        let t0 = monotonic_us();
        let mut raw = [0u8; 8];
        self.dev.bus.read(PeriphDev::Gpio, gpio::TIMESTAMP, &mut raw)?;
        let t1 = monotonic_us();
        Ok(Pinning {
            samples: u64::from_le_bytes(raw),
            host_us: (t0 + t1) / 2,
            delay_us: t1.saturating_sub(t0),
        })
    }

    fn write_trim(&self, offset: f64, drift_ppb: f64) -> Result<()> {
        self.dev.bus.write_dac(trim_word(offset))?;
        self.dev.notify(
            EventKind::FreqOffsetChanged,
            vec![
                ("RadioFrequencyOffset".into(), format!("{offset:.2}")),
                ("drift_ppb".into(), format!("{drift_ppb:.1}")),
            ],
        );
        Ok(())
    }
}

/// VCTCXO trim value to DAC word (8.8 fixed point).
#[must_use]
pub(crate) fn trim_word(offset: f64) -> u16 {
    (offset * 256.0).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

fn resolve_freq_offset(cfg: &Config, cache: &CalCache) -> f64 {
    if (cfg.freq_offset - DEFAULT_FREQ_OFFSET).abs() > f64::EPSILON {
        return cfg.freq_offset;
    }
    if let Some(raw) = cache.field("DAC.DAC_TRIM") {
        if let Ok(word) = raw.trim().parse::<u16>() {
            let offset = f64::from(word) / 256.0;
            if (FREQ_OFFSET_RANGE.0..=FREQ_OFFSET_RANGE.1).contains(&offset) {
                debug!("using factory DAC trim {offset:.2}");
                return offset;
            }
        }
        warn!("calibration cache DAC.DAC_TRIM '{raw}' unusable, using default");
    }
    DEFAULT_FREQ_OFFSET
}

/// Load the FPGA bitstream named by calibration cache field "B".
fn load_fpga(
    usb: &Arc<dyn UsbBackend>,
    cancel: &CancelToken,
    env: &dyn Env,
    cache: &CalCache,
) -> Result<(String, PathBuf)> {
    let size = cache.field("B").unwrap_or("40");
    if size != "40" && size != "115" {
        return Err(DeviceError::not_supported(format!(
            "unknown FPGA size '{size}' in calibration cache"
        )));
    }
    let shared = env.var("sharedpath").ok_or_else(|| {
        DeviceError::failure("sharedpath not configured, cannot locate FPGA image")
    })?;
    let path = PathBuf::from(shared)
        .join("data")
        .join(format!("hostedx{size}.rbf"));
    let image = std::fs::read(&path).map_err(|e| {
        DeviceError::failure(format!("FPGA image {}: {e}", path.display()))
    })?;
    info!("loading FPGA from {} ({} bytes)", path.display(), image.len());

    usb.set_alt_setting(AltSetting::Fpga)?;
    usb.vendor_out(vendor::BEGIN_FPGA_PROGRAM, 0, 0, &[], CTRL_TIMEOUT)
        .map_err(|e| e.wrap("FPGA program start"))?;
    for chunk in image.chunks(FPGA_CHUNK) {
        let sent = usb
            .bulk_out(Endpoint::TxCtrl, chunk, BULK_TIMEOUT, cancel)
            .map_err(|e| e.wrap("FPGA upload"))?;
        if sent != chunk.len() {
            return Err(DeviceError::hardware_io(format!(
                "FPGA upload: short bulk write ({sent}/{})",
                chunk.len()
            )));
        }
    }
    let mut status = [0u8; 4];
    usb.vendor_in(vendor::QUERY_FPGA_STATUS, 0, 0, &mut status, CTRL_TIMEOUT)
        .map_err(|e| e.wrap("FPGA commit"))?;
    if status[0] == 0 {
        return Err(DeviceError::hardware_io("FPGA did not configure"));
    }
    usb.set_alt_setting(AltSetting::Idle)?;

    let digest = Md5::digest(&image);
    let md5 = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    Ok((md5, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_word() {
        assert_eq!(trim_word(128.0), 32768);
        assert_eq!(trim_word(64.0), 16384);
        assert_eq!(trim_word(127.676), (127.676f64 * 256.0).round() as u16);
    }

    #[test]
    fn test_resolve_freq_offset_precedence() {
        let cache = CalCache::parse(&calcache::encode_page(&[("DAC.DAC_TRIM", "33024")]))
            .expect("cache");
        // 33024 / 256 = 129.0
        let mut cfg = Config::default();
        assert_eq!(resolve_freq_offset(&cfg, &cache), 129.0);
        cfg.freq_offset = 140.0;
        assert_eq!(resolve_freq_offset(&cfg, &cache), 140.0);
        let empty = CalCache::default();
        assert_eq!(resolve_freq_offset(&Config::default(), &empty), DEFAULT_FREQ_OFFSET);
    }
}
