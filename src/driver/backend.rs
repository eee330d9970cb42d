//! Driver backends: the virtual clock engine and the hardware proxy.
//!
//! The facade talks to either through [`DriverBackend`]. The virtual
//! backend synthesizes the buffer-switch cadence on its own thread; the
//! proxy backend relays every call to an already-resolved wrapped driver.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::api::{
    AsioDriver, BufferInfo, BufferSizes, ChannelInfo, ClockSource, DriverCallbacks,
    SamplePosition,
};
use crate::clock::PrecisionClock;
use crate::convert::SampleType;
use crate::error::{DriverError, DriverResult};
use crate::ring::ByteRing;
use crate::rt::{FallbackPriority, ProAudioGuard, TimerResolutionGuard};

/// Resolves a configured driver identifier to a live driver instance.
/// Loading a third-party driver in-process is host-platform work that
/// lives outside this crate; the facade only needs the resolved handle.
pub type DriverLoader = Box<dyn FnMut(&str) -> Option<Box<dyn AsioDriver>> + Send>;

/// Backend capability set behind the facade. Default bodies mirror what a
/// minimal hardware driver reports for the optional operations.
pub trait DriverBackend: Send {
    fn init(&mut self, sys_handle: usize) -> DriverResult<()>;
    fn start(&mut self) -> DriverResult<()>;
    fn stop(&mut self) -> DriverResult<()>;

    fn buffer_size_info(&self) -> DriverResult<BufferSizes>;
    fn sample_rate(&self) -> DriverResult<f64>;
    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()>;
    fn channels(&self) -> DriverResult<(u32, u32)>;
    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<ChannelInfo>;
    fn sample_position(&self) -> DriverResult<SamplePosition>;
    fn output_ready(&self) -> DriverResult<()>;

    fn latencies(&self) -> DriverResult<(u32, u32)>;
    fn can_sample_rate(&self, rate: f64) -> DriverResult<()>;
    fn future(&mut self, _selector: i32) -> DriverResult<()> {
        Err(DriverError::NotPresent)
    }

    fn create_buffers(
        &mut self,
        infos: &mut [BufferInfo],
        buffer_size: u32,
        callbacks: DriverCallbacks,
    ) -> DriverResult<()>;
    fn dispose_buffers(&mut self) -> DriverResult<()>;

    fn control_panel(&mut self) -> DriverResult<()> {
        Err(DriverError::NotPresent)
    }
    fn set_clock_source(&mut self, _reference: i32) -> DriverResult<()> {
        Err(DriverError::NotPresent)
    }
    fn clock_sources(&self) -> DriverResult<Vec<ClockSource>> {
        Ok(Vec::new())
    }
    fn error_message(&self) -> String {
        String::new()
    }
}

// ---------------------------------------------------------------------------
// Virtual backend
// ---------------------------------------------------------------------------

const SUPPORTED_RATES: [f64; 8] = [
    44100.0, 48000.0, 88200.0, 96000.0, 176400.0, 192000.0, 352800.0, 384000.0,
];

/// Drift-correction nudge applied to the clock period per tick.
const DRIFT_NUDGE: Duration = Duration::from_micros(10);

/// Double buffer for one virtual output channel. The host writes through
/// the raw half pointers handed out in `BufferInfo` while the clock thread
/// zeroes the upcoming half; that aliasing window is the driver ABI's
/// contract (a half is host-owned only between the switch that names it
/// and the next one).
struct ChannelBuffers {
    halves: [UnsafeCell<Box<[u8]>>; 2],
}

unsafe impl Send for ChannelBuffers {}
unsafe impl Sync for ChannelBuffers {}

impl ChannelBuffers {
    fn new(bytes: usize) -> Self {
        Self {
            halves: [
                UnsafeCell::new(vec![0u8; bytes].into_boxed_slice()),
                UnsafeCell::new(vec![0u8; bytes].into_boxed_slice()),
            ],
        }
    }

    fn half_ptr(&self, index: usize) -> *mut u8 {
        unsafe { (*self.halves[index].get()).as_mut_ptr() }
    }

    fn zero_half(&self, index: usize) {
        unsafe {
            let half = &mut *self.halves[index].get();
            std::ptr::write_bytes(half.as_mut_ptr(), 0, half.len());
        }
    }
}

/// Everything the clock thread touches, shared with the backend object.
struct ClockShared {
    callbacks: DriverCallbacks,
    buffers: Vec<Arc<ChannelBuffers>>,
    /// Feedback ring observed for drift correction.
    feedback_ring: Arc<ByteRing>,
    sample_position: AtomicI64,
    block_size: u32,
    /// f64 bits; the host may retune the rate while buffers exist.
    sample_rate_bits: AtomicU64,
}

/// Backend with no hardware behind it: a thread impersonates the device
/// clock, handing the host freshly zeroed buffer halves at the ideal
/// block cadence, nudged to track the renderer's true consumption rate.
pub struct VirtualBackend {
    sample_rate: f64,
    block_size: u32,
    shared: Option<Arc<ClockShared>>,
    feedback_ring: Arc<ByteRing>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    epoch: Instant,
}

impl VirtualBackend {
    pub fn new(sample_rate: f64, feedback_ring: Arc<ByteRing>) -> Self {
        Self {
            sample_rate,
            block_size: 0,
            shared: None,
            feedback_ring,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            epoch: Instant::now(),
        }
    }

    fn timestamp_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn clock_loop(shared: Arc<ClockShared>, running: Arc<AtomicBool>) {
        let _task = ProAudioGuard::promote(FallbackPriority::TimeCritical);
        let _resolution = TimerResolutionGuard::acquire();

        let capacity = shared.feedback_ring.capacity();
        let mut wakeup = PrecisionClock::now();
        let mut half = 0usize;

        while running.load(Ordering::SeqCst) {
            let rate = f64::from_bits(shared.sample_rate_bits.load(Ordering::Relaxed));
            let ideal = Duration::from_secs_f64(shared.block_size as f64 / rate);
            let fill = shared.feedback_ring.fill_size();
            let period = drift_adjusted_period(ideal, fill, capacity);

            // The clamp keeps the loop from replaying a backlog of ticks
            // after an OS stall.
            wakeup = (wakeup + period).max(PrecisionClock::now());
            PrecisionClock::wait_until(wakeup);

            for channel in &shared.buffers {
                channel.zero_half(half);
            }

            if let Some(switch) = &shared.callbacks.buffer_switch {
                switch(half as u32, true);
            }

            shared
                .sample_position
                .fetch_add(shared.block_size as i64, Ordering::Relaxed);
            half = 1 - half;
        }
    }
}

/// Proportional drift correction: outside the 10 %/90 % guard band the
/// period is nudged 10 µs toward equilibrium. The band is wide enough
/// that scheduling jitter cannot oscillate the correction.
fn drift_adjusted_period(ideal: Duration, fill: usize, capacity: usize) -> Duration {
    let fill = fill as f64;
    let capacity = capacity as f64;
    if fill > 0.9 * capacity {
        ideal + DRIFT_NUDGE
    } else if fill < 0.1 * capacity {
        ideal.saturating_sub(DRIFT_NUDGE)
    } else {
        ideal
    }
}

impl DriverBackend for VirtualBackend {
    fn init(&mut self, _sys_handle: usize) -> DriverResult<()> {
        Ok(())
    }

    fn start(&mut self) -> DriverResult<()> {
        let shared = self.shared.as_ref().ok_or(DriverError::NotPresent)?.clone();
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = self.running.clone();
        let thread = std::thread::Builder::new()
            .name("virtual-clock".to_string())
            .spawn(move || Self::clock_loop(shared, running))
            .map_err(|err| {
                warn!("failed to spawn virtual clock thread: {err}");
                self.running.store(false, Ordering::SeqCst);
                DriverError::NoMemory
            })?;
        self.thread = Some(thread);
        debug!(
            "virtual clock started: {} frames @ {} Hz",
            self.block_size, self.sample_rate
        );
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        Ok(())
    }

    fn buffer_size_info(&self) -> DriverResult<BufferSizes> {
        Ok(BufferSizes {
            min: 128,
            max: 2048,
            preferred: 256,
            granularity: -1,
        })
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        Ok(self.sample_rate)
    }

    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()> {
        if rate <= 0.0 {
            return Err(DriverError::InvalidParameter);
        }
        self.sample_rate = rate;
        if let Some(shared) = self.shared.as_ref() {
            shared
                .sample_rate_bits
                .store(rate.to_bits(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn channels(&self) -> DriverResult<(u32, u32)> {
        Ok((0, 2))
    }

    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<ChannelInfo> {
        if is_input || !(0..2).contains(&channel) {
            return Err(DriverError::InvalidParameter);
        }
        Ok(ChannelInfo {
            channel,
            is_input: false,
            is_active: true,
            sample_type: SampleType::Float32Le,
            name: format!("Virtual Out {}", channel + 1),
        })
    }

    fn sample_position(&self) -> DriverResult<SamplePosition> {
        let samples = self
            .shared
            .as_ref()
            .map(|shared| shared.sample_position.load(Ordering::Relaxed))
            .unwrap_or(0);
        Ok(SamplePosition {
            samples,
            timestamp_ns: self.timestamp_ns(),
        })
    }

    fn output_ready(&self) -> DriverResult<()> {
        Ok(())
    }

    fn latencies(&self) -> DriverResult<(u32, u32)> {
        Ok((0, self.block_size))
    }

    fn can_sample_rate(&self, rate: f64) -> DriverResult<()> {
        if SUPPORTED_RATES.contains(&rate) {
            Ok(())
        } else {
            Err(DriverError::NoClock)
        }
    }

    fn create_buffers(
        &mut self,
        infos: &mut [BufferInfo],
        buffer_size: u32,
        callbacks: DriverCallbacks,
    ) -> DriverResult<()> {
        if buffer_size == 0 {
            return Err(DriverError::InvalidParameter);
        }

        let bytes_per_half = buffer_size as usize * SampleType::Float32Le.byte_width();
        let mut buffers = vec![
            Arc::new(ChannelBuffers::new(bytes_per_half)),
            Arc::new(ChannelBuffers::new(bytes_per_half)),
        ];

        for info in infos.iter_mut() {
            if info.is_input {
                return Err(DriverError::InvalidMode);
            }
            let channel = info.channel;
            if !(0..2).contains(&channel) {
                return Err(DriverError::InvalidParameter);
            }
            let storage = &mut buffers[channel as usize];
            info.buffers = [storage.half_ptr(0), storage.half_ptr(1)];
        }

        self.block_size = buffer_size;
        self.shared = Some(Arc::new(ClockShared {
            callbacks,
            buffers,
            feedback_ring: self.feedback_ring.clone(),
            sample_position: AtomicI64::new(0),
            block_size: buffer_size,
            sample_rate_bits: AtomicU64::new(self.sample_rate.to_bits()),
        }));
        Ok(())
    }

    fn dispose_buffers(&mut self) -> DriverResult<()> {
        // A still-running clock thread holds pointers into the halves.
        let _ = self.stop();
        self.shared = None;
        self.block_size = 0;
        Ok(())
    }

    fn set_clock_source(&mut self, _reference: i32) -> DriverResult<()> {
        Ok(())
    }

    fn clock_sources(&self) -> DriverResult<Vec<ClockSource>> {
        Ok(vec![ClockSource {
            index: 0,
            is_current: true,
            name: "Internal Virtual Clock".to_string(),
        }])
    }
}

impl Drop for VirtualBackend {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

// ---------------------------------------------------------------------------
// Proxy backend
// ---------------------------------------------------------------------------

/// Thin forwarder around a resolved hardware driver. Every method relays
/// one-to-one; the wrapped driver is owned for the facade's lifetime.
pub struct ProxyBackend {
    inner: Box<dyn AsioDriver>,
}

impl ProxyBackend {
    pub fn new(inner: Box<dyn AsioDriver>) -> Self {
        Self { inner }
    }
}

impl DriverBackend for ProxyBackend {
    fn init(&mut self, sys_handle: usize) -> DriverResult<()> {
        if self.inner.init(sys_handle) {
            Ok(())
        } else {
            Err(DriverError::NotPresent)
        }
    }

    fn start(&mut self) -> DriverResult<()> {
        self.inner.start()
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.inner.stop()
    }

    fn buffer_size_info(&self) -> DriverResult<BufferSizes> {
        self.inner.buffer_size_info()
    }

    fn sample_rate(&self) -> DriverResult<f64> {
        self.inner.sample_rate()
    }

    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()> {
        self.inner.set_sample_rate(rate)
    }

    fn channels(&self) -> DriverResult<(u32, u32)> {
        self.inner.channels()
    }

    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<ChannelInfo> {
        self.inner.channel_info(channel, is_input)
    }

    fn sample_position(&self) -> DriverResult<SamplePosition> {
        self.inner.sample_position()
    }

    fn output_ready(&self) -> DriverResult<()> {
        self.inner.output_ready()
    }

    fn latencies(&self) -> DriverResult<(u32, u32)> {
        self.inner.latencies()
    }

    fn can_sample_rate(&self, rate: f64) -> DriverResult<()> {
        self.inner.can_sample_rate(rate)
    }

    fn future(&mut self, selector: i32) -> DriverResult<()> {
        self.inner.future(selector)
    }

    fn create_buffers(
        &mut self,
        infos: &mut [BufferInfo],
        buffer_size: u32,
        callbacks: DriverCallbacks,
    ) -> DriverResult<()> {
        self.inner.create_buffers(infos, buffer_size, callbacks)
    }

    fn dispose_buffers(&mut self) -> DriverResult<()> {
        self.inner.dispose_buffers()
    }

    fn control_panel(&mut self) -> DriverResult<()> {
        self.inner.control_panel()
    }

    fn set_clock_source(&mut self, reference: i32) -> DriverResult<()> {
        self.inner.set_clock_source(reference)
    }

    fn clock_sources(&self) -> DriverResult<Vec<ClockSource>> {
        self.inner.clock_sources()
    }

    fn error_message(&self) -> String {
        self.inner.error_message()
    }
}

impl Drop for ProxyBackend {
    fn drop(&mut self) {
        let _ = self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RING_CAPACITY;
    use parking_lot::Mutex;

    fn make_backend() -> (VirtualBackend, Arc<ByteRing>) {
        let ring = Arc::new(ByteRing::new(RING_CAPACITY));
        (VirtualBackend::new(48000.0, ring.clone()), ring)
    }

    #[test]
    fn advertises_two_float_outputs() {
        let (backend, _ring) = make_backend();
        assert_eq!(backend.channels().unwrap(), (0, 2));
        let info = backend.channel_info(1, false).unwrap();
        assert_eq!(info.sample_type, SampleType::Float32Le);
        assert_eq!(info.name, "Virtual Out 2");
        assert!(backend.channel_info(0, true).is_err());
        assert!(backend.channel_info(2, false).is_err());
    }

    #[test]
    fn rate_support_matches_standard_ladder() {
        let (backend, _ring) = make_backend();
        for rate in SUPPORTED_RATES {
            assert!(backend.can_sample_rate(rate).is_ok());
        }
        assert_eq!(backend.can_sample_rate(22050.0), Err(DriverError::NoClock));
    }

    #[test]
    fn create_buffers_hands_out_distinct_halves() {
        let (mut backend, _ring) = make_backend();
        let mut infos = [BufferInfo::output(0), BufferInfo::output(1)];
        backend
            .create_buffers(&mut infos, 256, DriverCallbacks::default())
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for info in &infos {
            for ptr in info.buffers {
                assert!(!ptr.is_null());
                assert!(seen.insert(ptr as usize));
            }
        }
        assert_eq!(backend.latencies().unwrap(), (0, 256));
    }

    #[test]
    fn input_buffer_request_is_rejected() {
        let (mut backend, _ring) = make_backend();
        let mut infos = [BufferInfo {
            is_input: true,
            channel: 0,
            buffers: [std::ptr::null_mut(); 2],
        }];
        assert_eq!(
            backend.create_buffers(&mut infos, 256, DriverCallbacks::default()),
            Err(DriverError::InvalidMode)
        );
    }

    #[test]
    fn drift_nudges_outside_guard_band() {
        let ideal = Duration::from_micros(5333);
        let capacity = 1 << 19;
        // Starved: run fast.
        assert_eq!(
            drift_adjusted_period(ideal, capacity / 20, capacity),
            ideal - Duration::from_micros(10)
        );
        // Overrun: slow down.
        assert_eq!(
            drift_adjusted_period(ideal, capacity - capacity / 20, capacity),
            ideal + Duration::from_micros(10)
        );
        // Inside the band: ideal.
        assert_eq!(drift_adjusted_period(ideal, capacity / 2, capacity), ideal);
    }

    #[test]
    fn drift_correction_converges_against_ideal_consumer() {
        // Numeric simulation: producer deposits one block per tick at the
        // adjusted period, consumer drains at exactly the ideal byte rate.
        let capacity = 1usize << 19;
        let block_bytes = 256 * 4;
        let ideal = Duration::from_secs_f64(256.0 / 48000.0);
        let byte_rate = 48000.0 * 4.0;

        let mut fill = 0f64;
        let mut in_band_streak = 0u32;
        for _ in 0..2_000_000 {
            let period = drift_adjusted_period(ideal, fill as usize, capacity);
            fill += block_bytes as f64;
            fill = (fill - byte_rate * period.as_secs_f64()).max(0.0);
            if fill >= 0.1 * capacity as f64 && fill <= 0.9 * capacity as f64 {
                in_band_streak += 1;
            } else {
                in_band_streak = 0;
            }
        }
        // Converged and stayed: a long unbroken tail inside the band.
        assert!(in_band_streak > 100_000, "streak {in_band_streak}, fill {fill}");
    }

    #[test]
    fn clock_loop_alternates_halves_and_advances_position() {
        let (mut backend, _ring) = make_backend();
        let mut infos = [BufferInfo::output(0), BufferInfo::output(1)];

        let switches: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let recorded = switches.clone();
        let callbacks = DriverCallbacks {
            buffer_switch: Some(Box::new(move |index, _direct| {
                recorded.lock().push(index);
            })),
            ..Default::default()
        };

        backend.create_buffers(&mut infos, 256, callbacks).unwrap();
        backend.start().unwrap();
        std::thread::sleep(Duration::from_millis(60));
        backend.stop().unwrap();

        let seen = switches.lock().clone();
        // 256 frames at 48 kHz is a 5.3 ms cadence; 60 ms must produce
        // several switches even on a loaded machine.
        assert!(seen.len() >= 4, "only {} switches", seen.len());
        for pair in seen.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }

        let position = backend.sample_position().unwrap();
        assert_eq!(position.samples, seen.len() as i64 * 256);
    }

    #[test]
    fn proxy_forwards_and_owns_inner_driver() {
        struct Recorder {
            started: Arc<AtomicBool>,
            stopped: Arc<AtomicBool>,
        }
        impl AsioDriver for Recorder {
            fn init(&mut self, _sys_handle: usize) -> bool {
                true
            }
            fn driver_name(&self) -> String {
                "recorder".into()
            }
            fn driver_version(&self) -> i32 {
                7
            }
            fn error_message(&self) -> String {
                "inner error".into()
            }
            fn channels(&self) -> DriverResult<(u32, u32)> {
                Ok((4, 8))
            }
            fn latencies(&self) -> DriverResult<(u32, u32)> {
                Ok((32, 64))
            }
            fn buffer_size_info(&self) -> DriverResult<BufferSizes> {
                Ok(BufferSizes {
                    min: 64,
                    max: 4096,
                    preferred: 512,
                    granularity: -1,
                })
            }
            fn can_sample_rate(&self, rate: f64) -> DriverResult<()> {
                if rate == 48000.0 {
                    Ok(())
                } else {
                    Err(DriverError::NoClock)
                }
            }
            fn sample_rate(&self) -> DriverResult<f64> {
                Ok(96000.0)
            }
            fn set_sample_rate(&mut self, _rate: f64) -> DriverResult<()> {
                Ok(())
            }
            fn clock_sources(&self) -> DriverResult<Vec<ClockSource>> {
                Ok(Vec::new())
            }
            fn set_clock_source(&mut self, _reference: i32) -> DriverResult<()> {
                Ok(())
            }
            fn sample_position(&self) -> DriverResult<SamplePosition> {
                Ok(SamplePosition::default())
            }
            fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<ChannelInfo> {
                Ok(ChannelInfo {
                    channel,
                    is_input,
                    is_active: false,
                    sample_type: SampleType::Int32Le,
                    name: "hw".into(),
                })
            }
            fn create_buffers(
                &mut self,
                _infos: &mut [BufferInfo],
                _buffer_size: u32,
                _callbacks: DriverCallbacks,
            ) -> DriverResult<()> {
                Ok(())
            }
            fn dispose_buffers(&mut self) -> DriverResult<()> {
                Ok(())
            }
            fn start(&mut self) -> DriverResult<()> {
                self.started.store(true, Ordering::SeqCst);
                Ok(())
            }
            fn stop(&mut self) -> DriverResult<()> {
                self.stopped.store(true, Ordering::SeqCst);
                Ok(())
            }
            fn control_panel(&mut self) -> DriverResult<()> {
                Ok(())
            }
            fn future(&mut self, _selector: i32) -> DriverResult<()> {
                Ok(())
            }
            fn output_ready(&self) -> DriverResult<()> {
                Ok(())
            }
        }

        let started = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let mut proxy = ProxyBackend::new(Box::new(Recorder {
            started: started.clone(),
            stopped: stopped.clone(),
        }));

        assert!(proxy.init(0).is_ok());
        assert_eq!(proxy.channels().unwrap(), (4, 8));
        assert_eq!(proxy.sample_rate().unwrap(), 96000.0);
        assert_eq!(proxy.error_message(), "inner error");
        proxy.start().unwrap();
        assert!(started.load(Ordering::SeqCst));

        // Dropping the proxy stops the wrapped driver.
        drop(proxy);
        assert!(stopped.load(Ordering::SeqCst));
    }
}
