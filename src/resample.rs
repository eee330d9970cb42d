//! Streaming cubic-interpolation rate converter.
//!
//! One instance per channel, owned by the renderer thread. The converter is
//! causal and stateful: a fractional read cursor tracks overshoot across
//! block boundaries and a four-sample history supplies taps that fall
//! before the current input block, so splitting a stream into blocks of any
//! size produces bit-identical output.

use thiserror::Error;

/// Headroom applied to every interpolated sample. Cubic interpolation can
/// overshoot between input points; pulling the level down keeps the
/// overshoot inside the clip limit for full-scale material.
pub const HEADROOM_GAIN: f32 = 0.98;

/// Hard ceiling on interpolated output.
pub const CLIP_LIMIT: f32 = 1.5;

/// Ratios this close to 1.0 take the verbatim-copy fast path.
const UNITY_EPSILON: f64 = 1e-4;

#[derive(Debug, Error)]
#[error("sample rates must be positive")]
pub struct InvalidRate;

pub struct Resampler {
    /// Input samples consumed per output sample (in_rate / out_rate).
    ratio: f64,
    /// Fractional read position into the current input block. Reduced by
    /// the block length after each call so it stays near zero.
    cursor: f64,
    /// Last four input samples seen, oldest first.
    history: [f32; 4],
}

impl Default for Resampler {
    fn default() -> Self {
        Self {
            ratio: 1.0,
            cursor: 0.0,
            history: [0.0; 4],
        }
    }
}

impl Resampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure for a new rate pair and reset all streaming state.
    /// A non-positive output rate falls back to the input rate; if that
    /// leaves no usable rate the configuration is rejected.
    pub fn setup(&mut self, in_rate: f64, mut out_rate: f64) -> Result<(), InvalidRate> {
        if out_rate <= 0.0 {
            out_rate = in_rate;
        }
        if in_rate <= 0.0 || !in_rate.is_finite() || !out_rate.is_finite() {
            return Err(InvalidRate);
        }
        self.ratio = in_rate / out_rate;
        self.cursor = 0.0;
        self.history = [0.0; 4];
        Ok(())
    }

    #[inline]
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Current fractional read position relative to the next input block.
    /// Negative values re-read positions already held in history; callers
    /// sizing their input reads fold this in so the cursor stays bounded.
    #[inline]
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    /// Consume `input` and write at most `output.len()` resampled samples.
    /// Returns the number of output samples generated.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) -> usize {
        if input.is_empty() || output.is_empty() {
            return 0;
        }

        // Unity ratio: verbatim copy, history still refreshed so a later
        // rate change starts from real samples.
        if (self.ratio - 1.0).abs() < UNITY_EPSILON {
            let count = input.len().min(output.len());
            output[..count].copy_from_slice(&input[..count]);
            self.update_history(input);
            return count;
        }

        let in_count = input.len() as isize;
        let mut generated = 0;

        while generated < output.len() {
            let pos = self.cursor;
            let index = pos.floor() as isize;
            let frac = (pos - index as f64) as f32;

            if index < -4 || index >= in_count {
                break;
            }

            let y0 = self.tap(input, index - 1);
            let y1 = self.tap(input, index);

            // The interpolator needs one sample of look-ahead; without it
            // this block is exhausted.
            let idx2 = index + 1;
            let y2 = if idx2 >= 0 {
                if idx2 < in_count {
                    input[idx2 as usize]
                } else {
                    break;
                }
            } else {
                self.history[(4 + idx2) as usize]
            };

            // Two samples ahead may legitimately be missing at the block
            // tail; duplicating the edge keeps the curve flat there.
            let idx3 = index + 2;
            let y3 = if idx3 >= 0 {
                if idx3 < in_count {
                    input[idx3 as usize]
                } else {
                    y2
                }
            } else {
                self.history[(4 + idx3) as usize]
            };

            let sample = (cubic(y0, y1, y2, y3, frac) * HEADROOM_GAIN)
                .clamp(-CLIP_LIMIT, CLIP_LIMIT);
            output[generated] = sample;
            generated += 1;

            self.cursor += self.ratio;
        }

        // Carry the overshoot into the next block.
        self.cursor -= in_count as f64;
        self.update_history(input);

        generated
    }

    /// Tap at `k` relative to the current block, falling back to history
    /// for positions before the block start.
    #[inline]
    fn tap(&self, input: &[f32], k: isize) -> f32 {
        if k >= 0 {
            input[k as usize]
        } else {
            self.history[(4 + k).max(0) as usize]
        }
    }

    fn update_history(&mut self, input: &[f32]) {
        if input.len() >= 4 {
            self.history.copy_from_slice(&input[input.len() - 4..]);
        } else {
            for &sample in input {
                self.history.rotate_left(1);
                self.history[3] = sample;
            }
        }
    }
}

/// Catmull-Rom-style cubic through y1..y2 with tangents from y0/y3.
#[inline]
fn cubic(y0: f32, y1: f32, y2: f32, y3: f32, t: f32) -> f32 {
    let a0 = -0.5 * y0 + 1.5 * y1 - 1.5 * y2 + 0.5 * y3;
    let a1 = y0 - 2.5 * y1 + 2.0 * y2 - 0.5 * y3;
    let a2 = -0.5 * y0 + 0.5 * y2;
    let a3 = y1;
    ((a0 * t + a1) * t + a2) * t + a3
}
