//! Raw PCM to normalized 32-bit float conversion.
//!
//! The rings carry whatever byte format the upstream driver produces; the
//! renderer converts to float once, on its own thread, right before
//! resampling. All little-endian.

const INT32_TO_FLOAT: f32 = 4.656_612_9e-10; // 1 / 2^31
const INT24_TO_FLOAT: f32 = 1.192_092_9e-7; // 1 / 2^23
const INT16_TO_FLOAT: f32 = 3.051_757_8e-5; // 1 / 2^15

/// Sample format tag, determined once at buffer creation by querying the
/// upstream for output channel 0 and fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Int16Le,
    /// 24-bit packed, 3 bytes per sample.
    Int24Le,
    Int32Le,
    Float32Le,
    Float64Le,
    /// Format the renderer cannot decode. Blocks convert to silence.
    Unsupported,
}

impl SampleType {
    /// Bytes per sample on the wire.
    #[inline]
    pub fn byte_width(self) -> usize {
        match self {
            SampleType::Int16Le => 2,
            SampleType::Int24Le => 3,
            SampleType::Int32Le | SampleType::Float32Le | SampleType::Unsupported => 4,
            SampleType::Float64Le => 8,
        }
    }
}

/// Convert `output.len()` samples from `raw` into normalized floats.
///
/// Short or missing input zero-fills the remainder; an unsupported block
/// therefore degrades to silence instead of noise.
pub fn convert_to_float(raw: &[u8], sample_type: SampleType, output: &mut [f32]) {
    let width = sample_type.byte_width();
    let samples = (raw.len() / width).min(output.len());

    match sample_type {
        SampleType::Int16Le => {
            for (i, out) in output[..samples].iter_mut().enumerate() {
                let s = i16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
                *out = s as f32 * INT16_TO_FLOAT;
            }
        }
        SampleType::Int24Le => {
            for (i, out) in output[..samples].iter_mut().enumerate() {
                let off = i * 3;
                // Assemble into the upper 24 bits, then arithmetic-shift
                // down so the sign extends.
                let s = ((raw[off + 2] as i32) << 24)
                    | ((raw[off + 1] as i32) << 16)
                    | ((raw[off] as i32) << 8);
                *out = (s >> 8) as f32 * INT24_TO_FLOAT;
            }
        }
        SampleType::Int32Le => convert_int32(raw, &mut output[..samples]),
        SampleType::Float32Le => {
            for (i, out) in output[..samples].iter_mut().enumerate() {
                let off = i * 4;
                *out = f32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
            }
        }
        SampleType::Float64Le => {
            for (i, out) in output[..samples].iter_mut().enumerate() {
                let off = i * 8;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&raw[off..off + 8]);
                *out = f64::from_le_bytes(bytes) as f32;
            }
        }
        SampleType::Unsupported => {
            for out in output[..samples].iter_mut() {
                *out = 0.0;
            }
        }
    }

    for out in output[samples..].iter_mut() {
        *out = 0.0;
    }
}

/// Int32 is the common hardware format, so it gets an 8-wide unrolled
/// path the optimizer turns into SIMD. Matches the scalar tail exactly.
fn convert_int32(raw: &[u8], output: &mut [f32]) {
    let mut chunks = output.chunks_exact_mut(8);
    let mut offset = 0usize;
    for chunk in &mut chunks {
        for out in chunk.iter_mut() {
            let s = i32::from_le_bytes([
                raw[offset],
                raw[offset + 1],
                raw[offset + 2],
                raw[offset + 3],
            ]);
            *out = s as f32 * INT32_TO_FLOAT;
            offset += 4;
        }
    }
    for out in chunks.into_remainder() {
        let s = i32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ]);
        *out = s as f32 * INT32_TO_FLOAT;
        offset += 4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn int16_scaling() {
        let raw = [
            0x00, 0x00, // 0
            0xFF, 0x7F, // 32767
            0x00, 0x80, // -32768
        ];
        let mut out = [0.0f32; 3];
        convert_to_float(&raw, SampleType::Int16Le, &mut out);
        assert_eq!(out[0], 0.0);
        assert_relative_eq!(out[1], 32767.0 / 32768.0, epsilon = 1e-6);
        assert_relative_eq!(out[2], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn int24_sign_extension() {
        let raw = [
            0xFF, 0xFF, 0x7F, // 0x7FFFFF = 8388607
            0x00, 0x00, 0x80, // 0x800000 = -8388608
            0x01, 0x00, 0x00, // 1
        ];
        let mut out = [0.0f32; 3];
        convert_to_float(&raw, SampleType::Int24Le, &mut out);
        assert_relative_eq!(out[0], 8388607.0 / 8388608.0, epsilon = 1e-5);
        assert_relative_eq!(out[1], -1.0, epsilon = 1e-5);
        assert_relative_eq!(out[2], 1.0 / 8388608.0, epsilon = 1e-9);
    }

    #[test]
    fn int32_matches_scalar_reference_across_chunk_boundary() {
        // 19 samples: two full 8-wide chunks plus a 3-sample tail.
        let values: Vec<i32> = (0..19).map(|i| i * 113_377_991 - 900_000_000).collect();
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = vec![0.0f32; 19];
        convert_to_float(&raw, SampleType::Int32Le, &mut out);
        for (v, o) in values.iter().zip(out.iter()) {
            assert_relative_eq!(*o, *v as f32 * INT32_TO_FLOAT, epsilon = 1e-9);
        }
    }

    #[test]
    fn float32_is_verbatim() {
        let values = [0.25f32, -1.0, 0.999, 0.0];
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = [0.0f32; 4];
        convert_to_float(&raw, SampleType::Float32Le, &mut out);
        assert_eq!(out, values);
    }

    #[test]
    fn float64_narrows() {
        let values = [0.5f64, -0.125, 1.0];
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = [0.0f32; 3];
        convert_to_float(&raw, SampleType::Float64Le, &mut out);
        assert_eq!(out, [0.5f32, -0.125, 1.0]);
    }

    #[test]
    fn unsupported_format_is_silence() {
        let raw = [0xFFu8; 16];
        let mut out = [1.0f32; 4];
        convert_to_float(&raw, SampleType::Unsupported, &mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn short_input_zero_fills_tail() {
        let raw = 0x4000_0000i32.to_le_bytes();
        let mut out = [1.0f32; 4];
        convert_to_float(&raw, SampleType::Int32Le, &mut out);
        assert!(out[0] > 0.49 && out[0] < 0.51);
        assert_eq!(&out[1..], &[0.0, 0.0, 0.0]);
    }
}
