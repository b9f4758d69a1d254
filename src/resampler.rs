//! Stateful byte-stream resampler for 16-bit little-endian PCM.
//!
//! Unlike the sinc-based `rubato` resampler used elsewhere in nodes that
//! can afford fixed-size chunking, this contract is a raw `Write`/`Samples`
//! byte-stream converter with no frame-size assumption, so the
//! interpolation is hand-rolled rather than routed through `rubato`.

/// Interpolation kernel used to reconstruct samples at non-integer source
/// positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Linear,
    /// Cubic Hermite (Catmull-Rom); falls back to linear at the first/last
    /// sample where neighbours are unavailable.
    Cubic,
}

/// Converts a stream of 16-bit LE PCM samples from `source_rate` to
/// `target_rate`, carrying fractional phase and interpolation history
/// across `write` calls.
pub struct Resampler {
    source_rate: u32,
    target_rate: u32,
    mode: Interpolation,
    buffer: Vec<i16>,
    read_pos: f64,
    output: Vec<u8>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, mode: Interpolation) -> Self {
        Self {
            source_rate,
            target_rate,
            mode,
            buffer: Vec::new(),
            read_pos: 0.0,
            output: Vec::new(),
        }
    }

    /// Feeds raw PCM16LE bytes in. Returns the number of bytes accepted.
    /// Odd-length input is rejected: nothing is buffered and zero is
    /// returned.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.len() % 2 != 0 {
            return 0;
        }
        if data.is_empty() {
            return 0;
        }

        if self.source_rate == self.target_rate {
            self.output.extend_from_slice(data);
            return data.len();
        }

        let new_samples = data.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]));
        self.buffer.extend(new_samples);
        self.produce();
        data.len()
    }

    /// Returns all bytes converted since the last call and clears the
    /// internal output buffer. Does not clear interpolation state.
    pub fn samples(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    fn produce(&mut self) {
        let ratio = self.source_rate as f64 / self.target_rate as f64;
        let margin: usize = match self.mode {
            Interpolation::Linear => 1,
            Interpolation::Cubic => 2,
        };

        loop {
            let idx = self.read_pos.floor() as usize;
            if idx + margin >= self.buffer.len() {
                break;
            }
            let frac = self.read_pos - idx as f64;
            let sample = match self.mode {
                Interpolation::Linear => lerp(self.buffer[idx], self.buffer[idx + 1], frac),
                Interpolation::Cubic => {
                    if idx == 0 || idx + 2 >= self.buffer.len() {
                        lerp(self.buffer[idx], self.buffer[idx + 1], frac)
                    } else {
                        cubic_hermite(
                            self.buffer[idx - 1],
                            self.buffer[idx],
                            self.buffer[idx + 1],
                            self.buffer[idx + 2],
                            frac,
                        )
                    }
                }
            };
            self.output.extend_from_slice(&sample.to_le_bytes());
            self.read_pos += ratio;
        }

        // Trim consumed history, keeping one sample of lookback for cubic
        // continuity across write() boundaries.
        let keep_margin = if matches!(self.mode, Interpolation::Cubic) { 1 } else { 0 };
        let drop = (self.read_pos.floor() as usize).saturating_sub(keep_margin);
        if drop > 0 && drop <= self.buffer.len() {
            self.buffer.drain(0..drop);
            self.read_pos -= drop as f64;
        }
    }
}

fn lerp(a: i16, b: i16, t: f64) -> i16 {
    let v = a as f64 + (b as f64 - a as f64) * t;
    v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn cubic_hermite(p0: i16, p1: i16, p2: i16, p3: i16, t: f64) -> i16 {
    let (p0, p1, p2, p3) = (p0 as f64, p1 as f64, p2 as f64, p3 as f64);
    let t2 = t * t;
    let t3 = t2 * t;
    let a0 = -0.5 * p0 + 1.5 * p1 - 1.5 * p2 + 0.5 * p3;
    let a1 = p0 - 2.5 * p1 + 2.0 * p2 - 0.5 * p3;
    let a2 = -0.5 * p0 + 0.5 * p2;
    let a3 = p1;
    let v = a0 * t3 + a1 * t2 + a2 * t + a3;
    v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn equal_rates_are_pass_through() {
        let mut r = Resampler::new(16_000, 16_000, Interpolation::Linear);
        let input = pcm_bytes(&[1, 2, 3, 4]);
        assert_eq!(r.write(&input), input.len());
        assert_eq!(r.samples(), input);
    }

    #[test]
    fn odd_length_input_is_rejected() {
        let mut r = Resampler::new(16_000, 8_000, Interpolation::Linear);
        assert_eq!(r.write(&[1, 2, 3]), 0);
        assert!(r.samples().is_empty());
    }

    #[test]
    fn samples_drains_and_clears_output() {
        let mut r = Resampler::new(8_000, 16_000, Interpolation::Linear);
        r.write(&pcm_bytes(&[0, 100, 200, 300, 400, 500]));
        let first = r.samples();
        assert!(!first.is_empty());
        assert!(r.samples().is_empty());
    }

    #[test]
    fn upsampling_roughly_doubles_sample_count() {
        let mut r = Resampler::new(8_000, 16_000, Interpolation::Linear);
        let input: Vec<i16> = (0..200).map(|i| (i * 10) as i16).collect();
        r.write(&pcm_bytes(&input));
        let out = r.samples();
        let out_samples = out.len() / 2;
        // allow some slack for buffered lookahead not yet emitted
        assert!(out_samples > 350 && out_samples <= 400, "out_samples={out_samples}");
    }

    #[test]
    fn downsampling_roughly_halves_sample_count() {
        let mut r = Resampler::new(16_000, 8_000, Interpolation::Linear);
        let input: Vec<i16> = (0..400).map(|i| (i * 10) as i16).collect();
        r.write(&pcm_bytes(&input));
        let out = r.samples();
        let out_samples = out.len() / 2;
        assert!(out_samples > 180 && out_samples <= 200, "out_samples={out_samples}");
    }

    #[test]
    fn cubic_falls_back_to_linear_at_edges() {
        let mut linear = Resampler::new(8_000, 12_000, Interpolation::Linear);
        let mut cubic = Resampler::new(8_000, 12_000, Interpolation::Cubic);
        let input = pcm_bytes(&[0, 1000]);
        linear.write(&input);
        cubic.write(&input);
        // Too short to produce any output under either mode; this just
        // exercises that cubic doesn't panic on insufficient history.
        assert!(linear.samples().len() <= 2);
        assert!(cubic.samples().len() <= 2);
    }

    #[test]
    fn state_carries_across_write_calls() {
        let mut streaming = Resampler::new(8_000, 16_000, Interpolation::Linear);
        let input: Vec<i16> = (0..400).map(|i| (i * 5) as i16).collect();
        let bytes = pcm_bytes(&input);
        let mut total = 0usize;
        for chunk in bytes.chunks(20) {
            streaming.write(chunk);
            total += streaming.samples().len();
        }

        let mut bulk = Resampler::new(8_000, 16_000, Interpolation::Linear);
        bulk.write(&bytes);
        let bulk_total = bulk.samples().len();

        // chunked delivery should produce a comparable amount of output to
        // one bulk write (within interpolation-margin slack).
        assert!(
            (total as i64 - bulk_total as i64).unsigned_abs() < 8,
            "total={total} bulk_total={bulk_total}"
        );
    }
}
