//! Downstream half of the shim: shared-mode endpoint rendering.

pub mod endpoint;
pub mod renderer;

pub use endpoint::{output_devices, AudioDevice, MixFormat, RenderEndpoint};
pub use renderer::{RenderParams, Renderer};
