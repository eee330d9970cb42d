//! Error types shared across the driver and renderer.

use thiserror::Error;

/// Status codes surfaced to the host through the driver interface.
/// These mirror the pro-audio driver ABI's error set one-to-one so the
/// facade can forward a wrapped driver's status unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("hardware input or output is not present or available")]
    NotPresent,
    #[error("hardware is malfunctioning")]
    HardwareMalfunction,
    #[error("invalid input parameter")]
    InvalidParameter,
    #[error("hardware is in a bad mode or used in a bad mode")]
    InvalidMode,
    #[error("sample clock or rate cannot be determined or is not present")]
    NoClock,
    #[error("sample position is not advancing")]
    NotAdvancing,
    #[error("not enough memory to complete the request")]
    NoMemory,
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Failures while bringing up the shared-mode output endpoint.
/// These never reach the host: the renderer logs them and abandons
/// playback while the upstream session keeps running.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no render endpoint available: {0}")]
    NoEndpoint(String),
    #[error("endpoint activation failed: {0}")]
    Activation(String),
    #[error("audio client initialization failed: {0}")]
    Initialization(String),
    #[error("endpoint stream error: {0}")]
    Stream(String),
    #[error("rendering is not supported on this platform")]
    Unsupported,
}
