//! Renderer thread: drains the rings into the shared-mode endpoint.
//!
//! The endpoint's buffer event paces the loop. Each wake-up pops raw bytes
//! from both rings, converts them to float, resamples to the mix rate, and
//! interleaves into the endpoint buffer. The ring running dry is concealed
//! by holding the last written sample flat; a fatal setup error abandons
//! playback while the upstream session keeps running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, warn};

use super::endpoint::RenderEndpoint;
use crate::convert::{convert_to_float, SampleType};
use crate::driver::ShimStats;
use crate::resample::Resampler;
use crate::ring::ByteRing;
use crate::rt::{FallbackPriority, ProAudioGuard};

/// Event wait bound so cancellation is observed within a second even if
/// the endpoint stops signaling.
const EVENT_TIMEOUT_MS: u32 = 1000;

/// Everything the renderer thread needs, fixed at start.
pub struct RenderParams {
    pub ring_left: Arc<ByteRing>,
    pub ring_right: Arc<ByteRing>,
    /// Endpoint identifier; empty selects the system default.
    pub device_id: String,
    pub sample_type: SampleType,
    pub input_rate: f64,
    /// Minimum ring fill, in input frames, before non-silent output starts.
    pub preroll_frames: usize,
    pub stats: Arc<ShimStats>,
}

/// Owner of the render thread. `start` spawns, `stop` cancels and joins.
pub struct Renderer {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn start(&mut self, params: RenderParams) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let running = self.running.clone();
        match std::thread::Builder::new()
            .name("loopcast-render".to_string())
            .spawn(move || render_thread(params, running))
        {
            Ok(thread) => self.thread = Some(thread),
            Err(err) => {
                warn!("failed to spawn render thread: {err}");
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_thread(params: RenderParams, running: Arc<AtomicBool>) {
    let _task = ProAudioGuard::promote(FallbackPriority::Highest);

    #[cfg(windows)]
    {
        use super::endpoint::WasapiEndpoint;
        match WasapiEndpoint::open(&params.device_id) {
            Ok(mut endpoint) => run_render_loop(&mut endpoint, &params, &running),
            Err(err) => warn!("renderer setup failed, playback disabled: {err}"),
        }
    }
    #[cfg(not(windows))]
    {
        let _ = &params;
        warn!("no shared-mode render path on this platform, playback disabled");
    }

    running.store(false, Ordering::SeqCst);
}

/// The pacing loop, generic over the endpoint for testability.
pub(crate) fn run_render_loop<E: RenderEndpoint>(
    endpoint: &mut E,
    params: &RenderParams,
    running: &AtomicBool,
) {
    let format = endpoint.mix_format();
    let endpoint_frames = endpoint.buffer_frames() as usize;
    let channels = format.channels as usize;
    let block_align = format.block_align as usize;

    // Shared-mode mix formats are interleaved f32; anything else is a
    // format this renderer cannot express.
    if channels == 0 || endpoint_frames == 0 || block_align != channels * 4 {
        warn!(
            "unusable mix format ({} ch, block align {}), aborting renderer",
            channels, block_align
        );
        return;
    }

    let mut resampler_left = Resampler::new();
    let mut resampler_right = Resampler::new();
    if resampler_left
        .setup(params.input_rate, format.sample_rate as f64)
        .is_err()
        || resampler_right
            .setup(params.input_rate, format.sample_rate as f64)
            .is_err()
    {
        warn!("bad rate pair {} -> {}", params.input_rate, format.sample_rate);
        return;
    }
    let ratio = resampler_left.ratio();
    let unity = (ratio - 1.0).abs() < 1e-4;

    let sample_bytes = params.sample_type.byte_width();
    let max_samples = (endpoint_frames * 4).max(4096);

    let mut raw_left = vec![0u8; max_samples * sample_bytes];
    let mut raw_right = vec![0u8; max_samples * sample_bytes];
    let mut float_left = vec![0.0f32; max_samples];
    let mut float_right = vec![0.0f32; max_samples];
    let mut out_left = vec![0.0f32; max_samples];
    let mut out_right = vec![0.0f32; max_samples];
    let mut frame_bytes = vec![0u8; endpoint_frames * block_align];

    if let Err(err) = endpoint.start() {
        warn!("endpoint start failed: {err}");
        return;
    }
    debug!(
        "render loop running: {} -> {} Hz, pre-roll {} frames",
        params.input_rate, format.sample_rate, params.preroll_frames
    );

    let preroll_bytes = params.preroll_frames * sample_bytes;
    let mut preroll_done = false;

    while running.load(Ordering::SeqCst) {
        if !endpoint.wait_event(EVENT_TIMEOUT_MS) {
            break;
        }
        let Ok(available) = endpoint.frames_available() else {
            continue;
        };
        let frames_needed = (available as usize).min(endpoint_frames);
        if frames_needed == 0 {
            continue;
        }

        let out = &mut frame_bytes[..frames_needed * block_align];
        out.fill(0);

        // Hold silence until the producer has banked the pre-roll; only
        // after that does an empty ring count as an underrun.
        if !preroll_done {
            if params.ring_left.available_read() >= preroll_bytes {
                preroll_done = true;
            } else {
                if endpoint.write_frames(out, frames_needed).is_err() {
                    break;
                }
                continue;
            }
        }

        // Input demand for this pass. The +2 over-request keeps the cubic
        // interpolator's look-ahead fed; folding the cursor in keeps the
        // read rate locked to the actual conversion rate so the cursor
        // never walks out of the history window.
        let mut samples_to_read = if unity {
            frames_needed
        } else {
            let need = frames_needed as f64 * ratio + resampler_left.cursor();
            (need.ceil() as i64 + 2).max(0) as usize
        };
        let samples_available = params.ring_left.available_read() / sample_bytes;
        samples_to_read = samples_to_read.min(samples_available).min(max_samples);

        if samples_to_read > 0 {
            let byte_count = samples_to_read * sample_bytes;
            let popped_left = params.ring_left.pop(&mut raw_left[..byte_count]);
            let popped_right = params.ring_right.pop(&mut raw_right[..byte_count]);
            raw_left[popped_left..byte_count].fill(0);
            raw_right[popped_right..byte_count].fill(0);

            convert_to_float(
                &raw_left[..byte_count],
                params.sample_type,
                &mut float_left[..samples_to_read],
            );
            convert_to_float(
                &raw_right[..byte_count],
                params.sample_type,
                &mut float_right[..samples_to_read],
            );

            let budget = frames_needed.min(max_samples);
            let generated_left =
                resampler_left.process(&float_left[..samples_to_read], &mut out_left[..budget]);
            let generated_right =
                resampler_right.process(&float_right[..samples_to_read], &mut out_right[..budget]);

            let written = generated_left.min(frames_needed);
            for (i, chunk) in out.chunks_exact_mut(block_align).take(written).enumerate() {
                chunk[..4].copy_from_slice(&out_left[i].to_le_bytes());
                if channels > 1 && i < generated_right {
                    chunk[4..8].copy_from_slice(&out_right[i].to_le_bytes());
                }
            }

            if written < frames_needed {
                // Packet-loss concealment: hold the last written sample
                // flat instead of snapping to zero.
                params.stats.underruns.fetch_add(1, Ordering::Relaxed);
                let hold_left = if written > 0 { out_left[written - 1] } else { 0.0 };
                let hold_right = if generated_right > 0 {
                    out_right[generated_right.min(written).saturating_sub(1)]
                } else {
                    0.0
                };
                for chunk in out
                    .chunks_exact_mut(block_align)
                    .skip(written)
                    .take(frames_needed - written)
                {
                    chunk[..4].copy_from_slice(&hold_left.to_le_bytes());
                    if channels > 1 {
                        chunk[4..8].copy_from_slice(&hold_right.to_le_bytes());
                    }
                }
            }
        } else {
            params.stats.underruns.fetch_add(1, Ordering::Relaxed);
        }

        if endpoint.write_frames(out, frames_needed).is_err() {
            break;
        }
        params
            .stats
            .frames_rendered
            .fetch_add(frames_needed as u64, Ordering::Relaxed);
    }

    endpoint.stop();
    debug!("render loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use crate::render::endpoint::MixFormat;
    use crate::RING_CAPACITY;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Scripted endpoint: each entry in `events` is the writable frame
    /// count reported after that event; written frames are captured as
    /// decoded f32 pairs.
    struct FakeEndpoint {
        format: MixFormat,
        frames: u32,
        events: VecDeque<u32>,
        next_available: u32,
        wait_delay: Duration,
        written: Vec<(f32, f32)>,
        started: bool,
        stopped: bool,
    }

    impl FakeEndpoint {
        fn new(events: Vec<u32>) -> Self {
            Self {
                format: MixFormat {
                    sample_rate: 48000,
                    channels: 2,
                    block_align: 8,
                },
                frames: 2048,
                events: events.into(),
                next_available: 0,
                wait_delay: Duration::ZERO,
                written: Vec::new(),
                started: false,
                stopped: false,
            }
        }
    }

    impl RenderEndpoint for FakeEndpoint {
        fn mix_format(&self) -> MixFormat {
            self.format
        }

        fn buffer_frames(&self) -> u32 {
            self.frames
        }

        fn start(&mut self) -> Result<(), RenderError> {
            self.started = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.stopped = true;
        }

        fn wait_event(&mut self, _timeout_ms: u32) -> bool {
            if !self.wait_delay.is_zero() {
                std::thread::sleep(self.wait_delay);
            }
            match self.events.pop_front() {
                Some(available) => {
                    self.next_available = available;
                    true
                }
                None => false,
            }
        }

        fn frames_available(&mut self) -> Result<u32, RenderError> {
            Ok(self.next_available)
        }

        fn write_frames(&mut self, data: &[u8], frames: usize) -> Result<(), RenderError> {
            for frame in data.chunks_exact(self.format.block_align as usize).take(frames) {
                let left = f32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                let right = f32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
                self.written.push((left, right));
            }
            Ok(())
        }
    }

    fn make_params(
        sample_type: SampleType,
        input_rate: f64,
        preroll_frames: usize,
    ) -> (RenderParams, Arc<ByteRing>, Arc<ByteRing>, Arc<ShimStats>) {
        let ring_left = Arc::new(ByteRing::new(RING_CAPACITY));
        let ring_right = Arc::new(ByteRing::new(RING_CAPACITY));
        let stats = Arc::new(ShimStats::new());
        let params = RenderParams {
            ring_left: ring_left.clone(),
            ring_right: ring_right.clone(),
            device_id: String::new(),
            sample_type,
            input_rate,
            preroll_frames,
            stats: stats.clone(),
        };
        (params, ring_left, ring_right, stats)
    }

    fn push_f32(ring: &ByteRing, samples: &[f32]) {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert!(ring.push(&bytes));
    }

    #[test]
    fn preroll_emits_silence_without_consuming() {
        let (params, ring_left, ring_right, stats) =
            make_params(SampleType::Float32Le, 48000.0, 1024);
        push_f32(&ring_left, &[0.5; 100]);
        push_f32(&ring_right, &[0.5; 100]);

        let mut endpoint = FakeEndpoint::new(vec![256, 256, 256]);
        let running = AtomicBool::new(true);
        run_render_loop(&mut endpoint, &params, &running);

        assert_eq!(endpoint.written.len(), 768);
        assert!(endpoint.written.iter().all(|&(l, r)| l == 0.0 && r == 0.0));
        // The gate must not have popped anything.
        assert_eq!(ring_left.available_read(), 400);
        // Silence during pre-roll is not an underrun.
        assert_eq!(stats.snapshot().underruns, 0);
        assert!(endpoint.started && endpoint.stopped);
    }

    #[test]
    fn steady_unity_stream_passes_through() {
        let (params, ring_left, ring_right, stats) =
            make_params(SampleType::Float32Le, 48000.0, 64);
        push_f32(&ring_left, &vec![0.25f32; 2048]);
        push_f32(&ring_right, &vec![-0.25f32; 2048]);

        let mut endpoint = FakeEndpoint::new(vec![512, 512, 512]);
        let running = AtomicBool::new(true);
        run_render_loop(&mut endpoint, &params, &running);

        assert_eq!(endpoint.written.len(), 1536);
        for &(l, r) in &endpoint.written {
            assert_eq!(l, 0.25);
            assert_eq!(r, -0.25);
        }
        assert_eq!(stats.snapshot().underruns, 0);
        assert_eq!(stats.snapshot().frames_rendered, 1536);
        assert_eq!(ring_left.available_read(), (2048 - 1536) * 4);
    }

    #[test]
    fn underrun_holds_last_sample_flat() {
        let (params, ring_left, ring_right, stats) =
            make_params(SampleType::Float32Le, 48000.0, 0);
        // Only 10 samples banked, then the ring is dry.
        push_f32(&ring_left, &[0.5; 10]);
        push_f32(&ring_right, &[0.5; 10]);

        let mut endpoint = FakeEndpoint::new(vec![1024]);
        let running = AtomicBool::new(true);
        run_render_loop(&mut endpoint, &params, &running);

        assert_eq!(endpoint.written.len(), 1024);
        // Every frame carries the held value: no zero-click transition.
        for &(l, r) in &endpoint.written {
            assert_eq!(l, 0.5);
            assert_eq!(r, 0.5);
        }
        assert_eq!(stats.snapshot().underruns, 1);
    }

    #[test]
    fn empty_ring_renders_silence_and_counts_underrun() {
        let (params, _ring_left, _ring_right, stats) =
            make_params(SampleType::Float32Le, 48000.0, 0);

        let mut endpoint = FakeEndpoint::new(vec![256, 256]);
        let running = AtomicBool::new(true);
        run_render_loop(&mut endpoint, &params, &running);

        assert_eq!(endpoint.written.len(), 512);
        assert!(endpoint.written.iter().all(|&(l, r)| l == 0.0 && r == 0.0));
        assert_eq!(stats.snapshot().underruns, 2);
    }

    #[test]
    fn converts_int16_and_resamples_44k1_to_48k() {
        let (params, ring_left, ring_right, stats) =
            make_params(SampleType::Int16Le, 44100.0, 0);

        // One second of a 1 kHz sine as int16.
        let bytes: Vec<u8> = (0..44100)
            .flat_map(|i| {
                let t = i as f64 / 44100.0;
                let sample = (2.0 * std::f64::consts::PI * 1000.0 * t).sin();
                ((sample * 32767.0) as i16).to_le_bytes()
            })
            .collect();
        assert!(ring_left.push(&bytes));
        assert!(ring_right.push(&bytes));

        let mut endpoint = FakeEndpoint::new(vec![480; 100]);
        let running = AtomicBool::new(true);
        run_render_loop(&mut endpoint, &params, &running);

        let total = endpoint.written.len() as i64;
        assert!((total - 48000).abs() <= 2, "got {total} frames");

        let peak = endpoint
            .written
            .iter()
            .map(|&(l, _)| l.abs())
            .fold(0.0f32, f32::max);
        assert!(peak >= 0.95 * crate::resample::HEADROOM_GAIN, "peak {peak}");
        assert!(peak <= crate::resample::CLIP_LIMIT);
        // The very last pass may conceal the tail of the second.
        assert!(stats.snapshot().underruns <= 1);
    }

    #[test]
    fn sustained_surplus_does_not_starve_the_interpolator() {
        // A deep pre-rolled ring must keep producing full buffers pass
        // after pass; the cursor-aware read sizing keeps the stream locked.
        let (params, ring_left, ring_right, _stats) =
            make_params(SampleType::Float32Le, 44100.0, 0);
        push_f32(&ring_left, &vec![0.1f32; 40000]);
        push_f32(&ring_right, &vec![0.1f32; 40000]);

        let mut endpoint = FakeEndpoint::new(vec![480; 60]);
        let running = AtomicBool::new(true);
        run_render_loop(&mut endpoint, &params, &running);

        assert_eq!(endpoint.written.len(), 480 * 60);
        // All frames carry real signal; none collapsed to silence.
        assert!(endpoint.written.iter().all(|&(l, _)| (l - 0.098).abs() < 0.01));
    }

    #[test]
    fn cancellation_breaks_out_within_event_timeout() {
        let (params, _l, _r, _stats) = make_params(SampleType::Float32Le, 48000.0, 0);

        let mut endpoint = FakeEndpoint::new(vec![256; 10_000]);
        endpoint.wait_delay = Duration::from_millis(5);

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::spawn(move || {
            let mut endpoint = endpoint;
            run_render_loop(&mut endpoint, &params, &flag);
            endpoint.stopped
        });

        std::thread::sleep(Duration::from_millis(30));
        running.store(false, Ordering::SeqCst);

        let start = std::time::Instant::now();
        let stopped = handle.join().unwrap();
        assert!(stopped);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
