//! Driver facade: the object the host loads and talks to.
//!
//! Bridges upstream calls to the virtual or proxy backend, duplicates
//! every buffer switch into the byte rings, and owns the renderer thread
//! that plays the mirrored stream on the shared-mode endpoint.

pub mod api;
pub mod backend;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use lazy_static::lazy_static;
use log::{debug, warn};
use parking_lot::RwLock;

use self::api::{
    AsioDriver, BufferInfo, BufferSizes, ChannelInfo, ClockSource, DriverCallbacks,
    SamplePosition,
};
use self::backend::{DriverBackend, DriverLoader, ProxyBackend, VirtualBackend};
use crate::config::ShimConfig;
use crate::convert::SampleType;
use crate::error::{DriverError, DriverResult};
use crate::render::{RenderParams, Renderer};
use crate::ring::ByteRing;
use crate::RING_CAPACITY;

pub const DRIVER_NAME: &str = "LoopCast";
pub const DRIVER_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Pipeline statistics
// ---------------------------------------------------------------------------

/// Lock-free pipeline counters, shared by the producer and the renderer.
#[derive(Default)]
pub struct ShimStats {
    pub(crate) blocks_produced: AtomicU64,
    pub(crate) blocks_dropped: AtomicU64,
    pub(crate) underruns: AtomicU64,
    pub(crate) frames_rendered: AtomicU64,
}

impl ShimStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocks_produced: self.blocks_produced.load(Ordering::Relaxed),
            blocks_dropped: self.blocks_dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsSnapshot {
    /// Buffer-switch blocks copied into the rings.
    pub blocks_produced: u64,
    /// Blocks dropped because a ring was full (overruns).
    pub blocks_dropped: u64,
    /// Renderer passes that found less data than the endpoint needed.
    pub underruns: u64,
    pub frames_rendered: u64,
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Address of one half of a channel's double buffer. The pointee is owned
/// by the backend for the facade's lifetime; halves are only read between
/// the buffer switch naming them and the next one.
#[derive(Clone, Copy)]
struct RawHalf(*const u8);

unsafe impl Send for RawHalf {}
unsafe impl Sync for RawHalf {}

/// Fixed copy recipe, derived from the buffer set. For mono sources the
/// right halves alias the left ones so both rings receive the signal.
struct CopyPlan {
    left: [RawHalf; 2],
    right: [RawHalf; 2],
    bytes_per_block: usize,
}

/// State the buffer-switch path closes over. Written during buffer
/// creation, read-only once the stream runs.
struct ProducerCtx {
    host: DriverCallbacks,
    ring_left: Arc<ByteRing>,
    ring_right: Arc<ByteRing>,
    stats: Arc<ShimStats>,
    /// Half index already copied, to fold the two switch callback flavors
    /// into one push.
    last_index: AtomicI64,
    plan: OnceLock<CopyPlan>,
}

impl ProducerCtx {
    /// Runs on the upstream driver's real-time thread. Bounded by two ring
    /// pushes; no allocation, no locks, no logging, never fails.
    fn produce(&self, index: u32) {
        let idx = index as i64;
        if self.last_index.load(Ordering::Relaxed) == idx {
            return;
        }
        self.last_index.store(idx, Ordering::Relaxed);

        let Some(plan) = self.plan.get() else {
            return;
        };
        let half = index as usize & 1;
        let bytes = plan.bytes_per_block;

        if self.ring_left.available_write() < bytes {
            self.stats.blocks_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let left = unsafe { std::slice::from_raw_parts(plan.left[half].0, bytes) };
        let right = unsafe { std::slice::from_raw_parts(plan.right[half].0, bytes) };
        self.ring_left.push(left);
        self.ring_right.push(right);
        self.stats.blocks_produced.fetch_add(1, Ordering::Relaxed);
    }
}

/// The callbacks the facade registers with the backend: delegate to the
/// host's callback if installed, then run the producer. Each closure
/// closes over the shared producer context, so the backend's clock thread
/// needs no global lookup to reach it.
fn build_shim_callbacks(ctx: &Arc<ProducerCtx>) -> DriverCallbacks {
    let switch_ctx = ctx.clone();
    let time_ctx = ctx.clone();
    let rate_ctx = ctx.clone();
    let message_ctx = ctx.clone();

    DriverCallbacks {
        buffer_switch: Some(Box::new(move |index, direct| {
            if let Some(callback) = &switch_ctx.host.buffer_switch {
                callback(index, direct);
            }
            switch_ctx.produce(index);
        })),
        buffer_switch_time_info: Some(Box::new(move |time_info, index, direct| {
            let result = match &time_ctx.host.buffer_switch_time_info {
                Some(callback) => callback(time_info, index, direct),
                None => *time_info,
            };
            time_ctx.produce(index);
            result
        })),
        sample_rate_did_change: Some(Box::new(move |rate| {
            if let Some(callback) = &rate_ctx.host.sample_rate_did_change {
                callback(rate);
            }
        })),
        message: Some(Box::new(move |selector, value| {
            message_ctx
                .host
                .message
                .as_ref()
                .map(|callback| callback(selector, value))
                .unwrap_or(0)
        })),
    }
}

// ---------------------------------------------------------------------------
// Process-wide driver cell
// ---------------------------------------------------------------------------

static NEXT_DRIVER_TOKEN: AtomicU64 = AtomicU64::new(1);

struct ActiveDriver {
    token: u64,
    stats: Arc<ShimStats>,
}

lazy_static! {
    /// The live driver instance, for surfaces with no user-data slot
    /// (the configuration panel's stats query). `init` publishes; drop
    /// retracts only while still the current holder.
    static ref ACTIVE_DRIVER: RwLock<Option<ActiveDriver>> = RwLock::new(None);
}

/// Pipeline counters of the live driver, if one is initialized.
pub fn active_stats() -> Option<StatsSnapshot> {
    ACTIVE_DRIVER
        .read()
        .as_ref()
        .map(|active| active.stats.snapshot())
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

pub struct CastDriver {
    config: ShimConfig,
    loader: Option<DriverLoader>,
    backend: Option<Box<dyn DriverBackend>>,
    ring_left: Arc<ByteRing>,
    ring_right: Arc<ByteRing>,
    stats: Arc<ShimStats>,
    producer: Option<Arc<ProducerCtx>>,
    renderer: Renderer,
    sample_rate: f64,
    sample_type: SampleType,
    block_size: u32,
    token: u64,
}

impl CastDriver {
    /// Build from the INI next to the shim binary.
    pub fn new() -> Self {
        Self::with_config(ShimConfig::load())
    }

    pub fn with_config(config: ShimConfig) -> Self {
        Self::with_loader(config, None)
    }

    /// `loader` resolves a configured driver identifier to a live driver
    /// for Proxy mode; without one (or when it fails) the facade degrades
    /// to the virtual backend.
    pub fn with_loader(config: ShimConfig, loader: Option<DriverLoader>) -> Self {
        Self {
            config,
            loader,
            backend: None,
            ring_left: Arc::new(ByteRing::new(RING_CAPACITY)),
            ring_right: Arc::new(ByteRing::new(RING_CAPACITY)),
            stats: Arc::new(ShimStats::new()),
            producer: None,
            renderer: Renderer::new(),
            sample_rate: 48000.0,
            sample_type: SampleType::Float32Le,
            block_size: 0,
            token: NEXT_DRIVER_TOKEN.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    /// Block size of the current buffer set, 0 when none exists.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn select_backend(&mut self) -> Box<dyn DriverBackend> {
        if !self.config.wants_virtual() {
            if let Some(loader) = self.loader.as_mut() {
                if let Some(driver) = loader(&self.config.target_driver) {
                    debug!("proxy backend bound to {}", self.config.target_driver);
                    return Box::new(ProxyBackend::new(driver));
                }
            }
            warn!(
                "driver {:?} unavailable, falling back to virtual backend",
                self.config.target_driver
            );
        }
        Box::new(VirtualBackend::new(self.sample_rate, self.ring_right.clone()))
    }

    fn backend_mut(&mut self) -> DriverResult<&mut Box<dyn DriverBackend>> {
        self.backend.as_mut().ok_or(DriverError::NotPresent)
    }

    fn backend_ref(&self) -> DriverResult<&dyn DriverBackend> {
        match &self.backend {
            Some(backend) => Ok(backend.as_ref()),
            None => Err(DriverError::NotPresent),
        }
    }
}

impl Default for CastDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl AsioDriver for CastDriver {
    fn init(&mut self, sys_handle: usize) -> bool {
        if self.backend.is_none() {
            let backend = self.select_backend();
            self.backend = Some(backend);
        }

        let initialized = match self.backend.as_mut() {
            Some(backend) => backend.init(sys_handle).is_ok(),
            None => false,
        };
        if !initialized {
            warn!("backend init failed, degrading to virtual");
            let mut fallback =
                Box::new(VirtualBackend::new(self.sample_rate, self.ring_right.clone()));
            if fallback.init(sys_handle).is_err() {
                return false;
            }
            self.backend = Some(fallback);
        }

        if let Some(backend) = self.backend.as_ref() {
            if let Ok(rate) = backend.sample_rate() {
                self.sample_rate = rate;
            }
        }

        *ACTIVE_DRIVER.write() = Some(ActiveDriver {
            token: self.token,
            stats: self.stats.clone(),
        });
        debug!("driver initialized at {} Hz", self.sample_rate);
        true
    }

    fn driver_name(&self) -> String {
        DRIVER_NAME.to_string()
    }

    fn driver_version(&self) -> i32 {
        DRIVER_VERSION
    }

    fn error_message(&self) -> String {
        match &self.backend {
            Some(backend) => backend.error_message(),
            None => "backend not loaded".to_string(),
        }
    }

    fn channels(&self) -> DriverResult<(u32, u32)> {
        self.backend_ref()?.channels()
    }

    fn latencies(&self) -> DriverResult<(u32, u32)> {
        self.backend_ref()?.latencies()
    }

    fn buffer_size_info(&self) -> DriverResult<BufferSizes> {
        self.backend_ref()?.buffer_size_info()
    }

    fn can_sample_rate(&self, rate: f64) -> DriverResult<()> {
        self.backend_ref()?.can_sample_rate(rate)
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        self.backend_ref()?.sample_rate()
    }

    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()> {
        self.backend_mut()?.set_sample_rate(rate)?;
        self.sample_rate = rate;
        Ok(())
    }

    fn clock_sources(&self) -> DriverResult<Vec<ClockSource>> {
        self.backend_ref()?.clock_sources()
    }

    fn set_clock_source(&mut self, reference: i32) -> DriverResult<()> {
        self.backend_mut()?.set_clock_source(reference)
    }

    fn sample_position(&self) -> DriverResult<SamplePosition> {
        self.backend_ref()?.sample_position()
    }

    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<ChannelInfo> {
        self.backend_ref()?.channel_info(channel, is_input)
    }

    fn create_buffers(
        &mut self,
        infos: &mut [BufferInfo],
        buffer_size: u32,
        callbacks: DriverCallbacks,
    ) -> DriverResult<()> {
        let ctx = Arc::new(ProducerCtx {
            host: callbacks,
            ring_left: self.ring_left.clone(),
            ring_right: self.ring_right.clone(),
            stats: self.stats.clone(),
            last_index: AtomicI64::new(-1),
            plan: OnceLock::new(),
        });

        let shim_callbacks = build_shim_callbacks(&ctx);
        let Some(backend) = self.backend.as_mut() else {
            return Err(DriverError::NotPresent);
        };
        backend.create_buffers(infos, buffer_size, shim_callbacks)?;

        // The first two non-input channels become the mirrored pair.
        let mut left = None;
        let mut right = None;
        for (position, info) in infos.iter().enumerate() {
            if info.is_input {
                continue;
            }
            if left.is_none() {
                left = Some(position);
            } else {
                right = Some(position);
                break;
            }
        }

        if let Some(left_pos) = left {
            // Mono sources duplicate left into the right ring.
            let right_pos = right.unwrap_or(left_pos);
            let sample_type = backend
                .channel_info(infos[left_pos].channel, false)
                .map(|info| info.sample_type)
                .unwrap_or(SampleType::Int32Le);

            let left_halves = infos[left_pos].buffers;
            let right_halves = infos[right_pos].buffers;
            if left_halves.iter().chain(right_halves.iter()).all(|p| !p.is_null()) {
                let _ = ctx.plan.set(CopyPlan {
                    left: [
                        RawHalf(left_halves[0] as *const u8),
                        RawHalf(left_halves[1] as *const u8),
                    ],
                    right: [
                        RawHalf(right_halves[0] as *const u8),
                        RawHalf(right_halves[1] as *const u8),
                    ],
                    bytes_per_block: buffer_size as usize * sample_type.byte_width(),
                });
                debug!(
                    "mirroring outputs {}/{} as {:?}, block {}",
                    left_pos, right_pos, sample_type, buffer_size
                );
            } else {
                warn!("backend returned null buffer halves, mirror disabled");
            }
            self.sample_type = sample_type;
        } else {
            warn!("buffer set has no output channels, mirror disabled");
        }

        self.block_size = buffer_size;
        self.producer = Some(ctx);
        Ok(())
    }

    fn dispose_buffers(&mut self) -> DriverResult<()> {
        self.backend_mut()?.dispose_buffers()?;
        self.producer = None;
        self.block_size = 0;
        Ok(())
    }

    fn start(&mut self) -> DriverResult<()> {
        self.backend_ref()?;
        if self.producer.is_none() {
            warn!("starting with no buffer set, nothing will be mirrored");
        }

        self.renderer.start(RenderParams {
            ring_left: self.ring_left.clone(),
            ring_right: self.ring_right.clone(),
            device_id: self.config.endpoint_id.clone(),
            sample_type: self.sample_type,
            input_rate: self.sample_rate,
            preroll_frames: self.config.latency_mode.preroll_frames(),
            stats: self.stats.clone(),
        });

        let result = self.backend_mut()?.start();
        if result.is_err() {
            self.renderer.stop();
        }
        result
    }

    fn stop(&mut self) -> DriverResult<()> {
        let result = self.backend_mut()?.stop();
        self.renderer.stop();
        result
    }

    fn control_panel(&mut self) -> DriverResult<()> {
        self.backend_mut()?.control_panel()
    }

    fn future(&mut self, selector: i32) -> DriverResult<()> {
        self.backend_mut()?.future(selector)
    }

    fn output_ready(&self) -> DriverResult<()> {
        self.backend_ref()?.output_ready()
    }
}

impl Drop for CastDriver {
    fn drop(&mut self) {
        self.renderer.stop();
        if let Some(backend) = self.backend.as_mut() {
            let _ = backend.stop();
        }
        let mut active = ACTIVE_DRIVER.write();
        if active.as_ref().map(|current| current.token) == Some(self.token) {
            *active = None;
        }
    }
}
