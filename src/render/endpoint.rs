//! Shared-mode render endpoint abstraction.
//!
//! The renderer loop is written against [`RenderEndpoint`] so the pacing,
//! pre-roll, and concealment logic is exercised without a soundcard; the
//! WASAPI implementation below is the production endpoint on Windows.

use crate::error::RenderError;

/// Negotiated endpoint output format. Shared-mode mix formats are
/// interleaved 32-bit float, so `block_align == channels * 4`.
#[derive(Debug, Clone, Copy)]
pub struct MixFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub block_align: u16,
}

/// A render endpoint visible to the configuration UI.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub id: String,
    pub name: String,
}

/// Event-driven shared-mode output endpoint.
pub trait RenderEndpoint {
    fn mix_format(&self) -> MixFormat;
    /// Total frames the endpoint buffer holds.
    fn buffer_frames(&self) -> u32;

    fn start(&mut self) -> Result<(), RenderError>;
    fn stop(&mut self);

    /// Block until the endpoint signals its buffer event. Returns false on
    /// timeout or when the device has stopped signaling.
    fn wait_event(&mut self, timeout_ms: u32) -> bool;

    /// Frames currently writable: buffer size minus the device padding.
    fn frames_available(&mut self) -> Result<u32, RenderError>;

    /// Hand `frames` interleaved frames to the device.
    fn write_frames(&mut self, data: &[u8], frames: usize) -> Result<(), RenderError>;
}

/// Enumerate active render endpoints.
#[cfg(windows)]
pub fn output_devices() -> Vec<AudioDevice> {
    use wasapi::{DeviceCollection, Direction};

    let mut devices = Vec::new();
    // Already-initialized COM on this thread is fine; other failures mean
    // no endpoints to report.
    let _ = wasapi::initialize_mta();

    let Ok(collection) = DeviceCollection::new(&Direction::Render) else {
        return devices;
    };
    let Ok(count) = collection.get_nbr_devices() else {
        return devices;
    };
    for index in 0..count {
        if let Ok(device) = collection.get_device_at_index(index) {
            if let (Ok(id), Ok(name)) = (device.get_id(), device.get_friendlyname()) {
                devices.push(AudioDevice { id, name });
            }
        }
    }
    devices
}

#[cfg(not(windows))]
pub fn output_devices() -> Vec<AudioDevice> {
    Vec::new()
}

#[cfg(windows)]
pub use windows_impl::WasapiEndpoint;

#[cfg(windows)]
mod windows_impl {
    use super::{MixFormat, RenderEndpoint};
    use crate::error::RenderError;
    use log::{debug, warn};
    use wasapi::{
        get_default_device, AudioClient, AudioRenderClient, Device, DeviceCollection, Direction,
        Handle, ShareMode,
    };

    /// Requested device period: 10 ms in 100 ns units.
    const REQUESTED_PERIOD_HNS: i64 = 100_000;

    /// WASAPI shared-mode event-driven render endpoint. Fields drop in
    /// reverse acquisition order.
    pub struct WasapiEndpoint {
        format: MixFormat,
        frames: u32,
        event: Handle,
        render: AudioRenderClient,
        client: AudioClient,
    }

    fn resolve_device(device_id: &str) -> Result<Device, RenderError> {
        if !device_id.is_empty() {
            if let Ok(collection) = DeviceCollection::new(&Direction::Render) {
                let count = collection.get_nbr_devices().unwrap_or(0);
                for index in 0..count {
                    if let Ok(device) = collection.get_device_at_index(index) {
                        if device.get_id().map(|id| id == device_id).unwrap_or(false) {
                            return Ok(device);
                        }
                    }
                }
            }
            warn!("endpoint {device_id:?} not found, falling back to default");
        }
        get_default_device(&Direction::Render)
            .map_err(|err| RenderError::NoEndpoint(err.to_string()))
    }

    impl WasapiEndpoint {
        /// Resolve the endpoint and bring up an event-driven shared-mode
        /// stream on the calling thread (which must stay the renderer
        /// thread; WASAPI interfaces are used from where they were made).
        pub fn open(device_id: &str) -> Result<Self, RenderError> {
            wasapi::initialize_mta()
                .map_err(|err| RenderError::Activation(err.to_string()))?;

            let device = resolve_device(device_id)?;
            let mut client = device
                .get_iaudioclient()
                .map_err(|err| RenderError::Activation(err.to_string()))?;

            let wave_format = client
                .get_mixformat()
                .map_err(|err| RenderError::Activation(err.to_string()))?;
            let format = MixFormat {
                sample_rate: wave_format.get_samplespersec() as u32,
                channels: wave_format.get_nchannels() as u16,
                block_align: wave_format.get_blockalign() as u16,
            };

            client
                .initialize_client(
                    &wave_format,
                    REQUESTED_PERIOD_HNS,
                    &Direction::Render,
                    &ShareMode::Shared,
                    false,
                )
                .map_err(|err| RenderError::Initialization(err.to_string()))?;

            let event = client
                .set_get_eventhandle()
                .map_err(|err| RenderError::Initialization(err.to_string()))?;
            let render = client
                .get_audiorenderclient()
                .map_err(|err| RenderError::Initialization(err.to_string()))?;
            let frames = client
                .get_bufferframecount()
                .map_err(|err| RenderError::Initialization(err.to_string()))?;

            debug!(
                "endpoint up: {} Hz, {} ch, {} frame buffer",
                format.sample_rate, format.channels, frames
            );

            Ok(Self {
                format,
                frames,
                event,
                render,
                client,
            })
        }
    }

    impl RenderEndpoint for WasapiEndpoint {
        fn mix_format(&self) -> MixFormat {
            self.format
        }

        fn buffer_frames(&self) -> u32 {
            self.frames
        }

        fn start(&mut self) -> Result<(), RenderError> {
            self.client
                .start_stream()
                .map_err(|err| RenderError::Stream(err.to_string()))
        }

        fn stop(&mut self) {
            if let Err(err) = self.client.stop_stream() {
                debug!("stop_stream: {err}");
            }
        }

        fn wait_event(&mut self, timeout_ms: u32) -> bool {
            self.event.wait_for_event(timeout_ms).is_ok()
        }

        fn frames_available(&mut self) -> Result<u32, RenderError> {
            self.client
                .get_available_space_in_frames()
                .map_err(|err| RenderError::Stream(err.to_string()))
        }

        fn write_frames(&mut self, data: &[u8], frames: usize) -> Result<(), RenderError> {
            self.render
                .write_to_device(
                    frames,
                    self.format.block_align as usize,
                    data,
                    None,
                )
                .map_err(|err| RenderError::Stream(err.to_string()))
        }
    }
}
