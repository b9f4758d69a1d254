//! Packet model: the tagged union of media units flowing through a session.
//!
//! The source this crate is grounded on dispatches on an interface with
//! type assertions; here that becomes a sealed enum matched with `match`.

use std::fmt;

/// A single unit of media data moving through the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Audio(AudioPacket),
    Text(TextPacket),
    Close(ClosePacket),
}

/// Maximum allowed `AudioPacket::payload` size (see invariant 6).
pub const MAX_AUDIO_PAYLOAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioPacket {
    pub play_id: String,
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub is_first_packet: bool,
    pub is_end_packet: bool,
    pub is_synthesized: bool,
    pub is_silence: bool,
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TextPacket {
    pub play_id: String,
    pub text: String,
    pub sequence: u64,
    pub start_at: Option<std::time::SystemTime>,
    pub is_transcribed: bool,
    pub is_llm_generated: bool,
    pub is_partial: bool,
    pub is_end: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClosePacket {
    pub reason: String,
}

impl ClosePacket {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Packet {
    /// Wire bytes for this packet. Empty for `Close`.
    pub fn body(&self) -> &[u8] {
        match self {
            Packet::Audio(p) => &p.payload,
            Packet::Text(p) => p.text.as_bytes(),
            Packet::Close(_) => &[],
        }
    }

    /// Size in bytes used by the packet monitor for metrics accounting.
    /// Audio uses payload length, text uses UTF-8 byte length, close
    /// contributes zero (it is counted separately).
    pub fn size_bytes(&self) -> usize {
        match self {
            Packet::Audio(p) => p.payload.len(),
            Packet::Text(p) => p.text.len(),
            Packet::Close(_) => 0,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Packet::Audio(_))
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Packet::Text(_))
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Packet::Close(_))
    }

    pub fn as_audio(&self) -> Option<&AudioPacket> {
        match self {
            Packet::Audio(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextPacket> {
        match self {
            Packet::Text(p) => Some(p),
            _ => None,
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Audio(p) => write!(
                f,
                "AudioPacket{{play_id={}, seq={}, bytes={}, first={}, end={}, synthesized={}, silence={}}}",
                p.play_id,
                p.sequence,
                p.payload.len(),
                p.is_first_packet,
                p.is_end_packet,
                p.is_synthesized,
                p.is_silence
            ),
            Packet::Text(p) => write!(
                f,
                "TextPacket{{play_id={}, seq={}, len={}, partial={}, end={}}}",
                p.play_id,
                p.sequence,
                p.text.len(),
                p.is_partial,
                p.is_end
            ),
            Packet::Close(p) => write!(f, "ClosePacket{{reason={}}}", p.reason),
        }
    }
}

impl From<AudioPacket> for Packet {
    fn from(p: AudioPacket) -> Self {
        Packet::Audio(p)
    }
}

impl From<TextPacket> for Packet {
    fn from(p: TextPacket) -> Self {
        Packet::Text(p)
    }
}

impl From<ClosePacket> for Packet {
    fn from(p: ClosePacket) -> Self {
        Packet::Close(p)
    }
}
