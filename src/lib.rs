//! LoopCast: a pro-audio driver shim with a shared-mode mirror output.
//!
//! The crate exposes an ASIO-style output driver to a host application and
//! mirrors everything the host plays onto a WASAPI shared-mode endpoint:
//!
//! - **Virtual mode** synthesizes the device clock on its own thread and
//!   hands the host freshly zeroed buffers to fill.
//! - **Proxy mode** relays every driver call to a real hardware driver and
//!   taps its output on the way through.
//!
//! Data path: the buffer-switch callback pushes raw interleaved sample
//! bytes into one lock-free ring per channel; the renderer thread pops,
//! converts to normalized float, resamples to the endpoint's mix rate, and
//! writes interleaved frames each time the endpoint's buffer event fires.
//! The producer and consumer run on independent clocks; the virtual clock
//! nudges its period against the ring fill level so the two never drift
//! apart audibly.

pub mod clock;
pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod render;
pub mod resample;
pub mod ring;
mod rt;

pub use config::{LatencyMode, ShimConfig};
pub use convert::SampleType;
pub use driver::api::{
    AsioDriver, BufferInfo, BufferSizes, ChannelInfo, ClockSource, DriverCallbacks,
    SamplePosition, TimeInfo,
};
pub use driver::backend::{DriverBackend, DriverLoader, ProxyBackend, VirtualBackend};
pub use driver::{
    active_stats, CastDriver, ShimStats, StatsSnapshot, DRIVER_NAME, DRIVER_VERSION,
};
pub use error::{DriverError, DriverResult, RenderError};
pub use render::{output_devices, AudioDevice, MixFormat, Renderer};
pub use resample::{Resampler, CLIP_LIMIT, HEADROOM_GAIN};
pub use ring::ByteRing;

/// Per-channel mirror ring capacity in bytes: a power of two holding about
/// two seconds of 32-bit samples at 48 kHz.
pub const RING_CAPACITY: usize = 1 << 19;
