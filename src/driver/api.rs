//! The pro-audio driver interface the shim implements upstream.
//!
//! This is the Rust shape of the host-facing driver ABI: the facade
//! implements [`AsioDriver`], and in Proxy mode the same trait abstracts
//! the wrapped hardware driver so every call can be relayed one-to-one.

use crate::convert::SampleType;
use crate::error::DriverResult;

/// Double-buffer descriptor for one channel, filled by the backend at
/// buffer creation. `buffers` holds the two half addresses; the host
/// writes the half named by each buffer-switch callback.
#[derive(Debug)]
pub struct BufferInfo {
    pub is_input: bool,
    pub channel: i32,
    pub buffers: [*mut u8; 2],
}

impl BufferInfo {
    pub fn output(channel: i32) -> Self {
        Self {
            is_input: false,
            channel,
            buffers: [std::ptr::null_mut(); 2],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub channel: i32,
    pub is_input: bool,
    pub is_active: bool,
    pub sample_type: SampleType,
    pub name: String,
}

/// Legal buffer sizes in frames. `granularity` of -1 means powers of two.
#[derive(Debug, Clone, Copy)]
pub struct BufferSizes {
    pub min: u32,
    pub max: u32,
    pub preferred: u32,
    pub granularity: i32,
}

#[derive(Debug, Clone)]
pub struct ClockSource {
    pub index: i32,
    pub is_current: bool,
    pub name: String,
}

/// Stream position at a point in time: frames elapsed plus the monotonic
/// system timestamp they were observed at.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplePosition {
    pub samples: i64,
    pub timestamp_ns: u64,
}

/// Timing snapshot handed to `buffer_switch_time_info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeInfo {
    pub sample_position: i64,
    pub system_time_ns: u64,
    pub sample_rate: f64,
}

pub type BufferSwitchFn = Box<dyn Fn(u32, bool) + Send + Sync>;
pub type BufferSwitchTimeInfoFn = Box<dyn Fn(&TimeInfo, u32, bool) -> TimeInfo + Send + Sync>;
pub type SampleRateChangeFn = Box<dyn Fn(f64) + Send + Sync>;
pub type MessageFn = Box<dyn Fn(i32, i32) -> i32 + Send + Sync>;

/// Callbacks registered at buffer creation. The callback signatures carry
/// no user pointer; instead each closure closes over whatever state its
/// registrant needs, so the backend can invoke them from its clock thread
/// without any global lookup.
#[derive(Default)]
pub struct DriverCallbacks {
    pub buffer_switch: Option<BufferSwitchFn>,
    pub buffer_switch_time_info: Option<BufferSwitchTimeInfoFn>,
    pub sample_rate_did_change: Option<SampleRateChangeFn>,
    pub message: Option<MessageFn>,
}

impl std::fmt::Debug for DriverCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCallbacks")
            .field("buffer_switch", &self.buffer_switch.is_some())
            .field("buffer_switch_time_info", &self.buffer_switch_time_info.is_some())
            .field("sample_rate_did_change", &self.sample_rate_did_change.is_some())
            .field("message", &self.message.is_some())
            .finish()
    }
}

/// The full upstream driver interface.
pub trait AsioDriver: Send {
    /// Returns true when the driver is usable. A false return leaves the
    /// driver inert; the host is expected to release it.
    fn init(&mut self, sys_handle: usize) -> bool;

    fn driver_name(&self) -> String;
    fn driver_version(&self) -> i32;
    fn error_message(&self) -> String;

    /// (input, output) channel counts.
    fn channels(&self) -> DriverResult<(u32, u32)>;
    /// (input, output) latency in frames.
    fn latencies(&self) -> DriverResult<(u32, u32)>;
    fn buffer_size_info(&self) -> DriverResult<BufferSizes>;
    fn can_sample_rate(&self, rate: f64) -> DriverResult<()>;
    fn sample_rate(&self) -> DriverResult<f64>;
    fn set_sample_rate(&mut self, rate: f64) -> DriverResult<()>;
    fn clock_sources(&self) -> DriverResult<Vec<ClockSource>>;
    fn set_clock_source(&mut self, reference: i32) -> DriverResult<()>;
    fn sample_position(&self) -> DriverResult<SamplePosition>;
    fn channel_info(&self, channel: i32, is_input: bool) -> DriverResult<ChannelInfo>;

    fn create_buffers(
        &mut self,
        infos: &mut [BufferInfo],
        buffer_size: u32,
        callbacks: DriverCallbacks,
    ) -> DriverResult<()>;
    fn dispose_buffers(&mut self) -> DriverResult<()>;

    fn start(&mut self) -> DriverResult<()>;
    fn stop(&mut self) -> DriverResult<()>;

    fn control_panel(&mut self) -> DriverResult<()>;
    fn future(&mut self, selector: i32) -> DriverResult<()>;
    fn output_ready(&self) -> DriverResult<()>;
}
