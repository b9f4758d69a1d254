//! Session metrics: a single mutex-guarded block updated by the built-in
//! packet/state/error monitors and read back through a stable snapshot.

use std::time::{Duration, SystemTime};

use crate::packet::Packet;

#[derive(Debug, Default, Clone)]
struct Inner {
    packet_count: u64,
    total_bytes: u64,
    audio_packet_count: u64,
    text_packet_count: u64,
    close_packet_count: u64,
    audio_bytes: u64,
    synthesized_count: u64,
    silence_count: u64,
    first_packet_count: u64,
    end_packet_count: u64,
    transcribed_count: u64,
    llm_generated_count: u64,
    partial_text_count: u64,
    total_text_length: u64,
    error_count: u64,
    state_change_count: u64,
    processor_error_count: u64,
    min_packet_size: Option<u64>,
    max_packet_size: u64,
    size_sum: u64,
    size_samples: u64,
    first_packet_time: Option<SystemTime>,
    last_packet_time: Option<SystemTime>,
    total_processing_time: Duration,
    input_transport_count: u64,
    output_transport_count: u64,
    active_output_count: u64,
}

/// Monotonically-updated counters for one session's packet flow, kept
/// behind a single lock per the crate's shared-resource policy: every
/// update and every read takes the same mutex.
#[derive(Default)]
pub struct SessionMetrics {
    inner: parking_lot::Mutex<Inner>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked once per packet by the built-in packet-monitor processor.
    pub fn record_packet(&self, packet: &Packet) {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();

        inner.packet_count += 1;
        let size = packet.size_bytes() as u64;
        inner.total_bytes += size;

        inner.min_packet_size = Some(inner.min_packet_size.map_or(size, |m| m.min(size)));
        inner.max_packet_size = inner.max_packet_size.max(size);
        inner.size_sum += size;
        inner.size_samples += 1;

        if inner.first_packet_time.is_none() {
            inner.first_packet_time = Some(now);
        }
        inner.last_packet_time = Some(now);

        match packet {
            Packet::Audio(audio) => {
                inner.audio_packet_count += 1;
                inner.audio_bytes += audio.payload.len() as u64;
                if audio.is_synthesized {
                    inner.synthesized_count += 1;
                }
                if audio.is_silence {
                    inner.silence_count += 1;
                }
                if audio.is_first_packet {
                    inner.first_packet_count += 1;
                }
                if audio.is_end_packet {
                    inner.end_packet_count += 1;
                }
            }
            Packet::Text(text) => {
                inner.text_packet_count += 1;
                inner.total_text_length += text.text.len() as u64;
                if text.is_transcribed {
                    inner.transcribed_count += 1;
                }
                if text.is_llm_generated {
                    inner.llm_generated_count += 1;
                }
                if text.is_partial {
                    inner.partial_text_count += 1;
                }
            }
            Packet::Close(_) => {
                inner.close_packet_count += 1;
            }
        }
    }

    pub fn record_error(&self) {
        self.inner.lock().error_count += 1;
    }

    pub fn record_state_change(&self) {
        self.inner.lock().state_change_count += 1;
    }

    pub fn record_processor_error(&self) {
        self.inner.lock().processor_error_count += 1;
    }

    pub fn add_processing_time(&self, elapsed: Duration) {
        self.inner.lock().total_processing_time += elapsed;
    }

    pub fn set_transport_counts(&self, input: usize, output: usize) {
        let mut inner = self.inner.lock();
        inner.input_transport_count = input as u64;
        inner.output_transport_count = output as u64;
    }

    pub fn set_active_output_count(&self, active: usize) {
        self.inner.lock().active_output_count = active as u64;
    }

    /// `(packet_count, total_bytes)` -- the minimal surface named by the
    /// external interface alongside the full `get_all_metrics` map.
    pub fn get_metrics(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.packet_count, inner.total_bytes)
    }

    /// Full metrics snapshot as an open-ended JSON object, matching the
    /// key set named in the external interface.
    pub fn get_all_metrics(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let avg_packet_size = if inner.size_samples > 0 {
            inner.size_sum as f64 / inner.size_samples as f64
        } else {
            0.0
        };

        serde_json::json!({
            "packet_count": inner.packet_count,
            "total_bytes": inner.total_bytes,
            "audio_packet_count": inner.audio_packet_count,
            "text_packet_count": inner.text_packet_count,
            "close_packet_count": inner.close_packet_count,
            "audio_bytes": inner.audio_bytes,
            "synthesized_count": inner.synthesized_count,
            "silence_count": inner.silence_count,
            "first_packet_count": inner.first_packet_count,
            "end_packet_count": inner.end_packet_count,
            "transcribed_count": inner.transcribed_count,
            "llm_generated_count": inner.llm_generated_count,
            "partial_text_count": inner.partial_text_count,
            "total_text_length": inner.total_text_length,
            "error_count": inner.error_count,
            "state_change_count": inner.state_change_count,
            "processor_error_count": inner.processor_error_count,
            "min_packet_size": inner.min_packet_size.unwrap_or(0),
            "max_packet_size": inner.max_packet_size,
            "avg_packet_size": avg_packet_size,
            "first_packet_time": inner.first_packet_time.map(format_time),
            "last_packet_time": inner.last_packet_time.map(format_time),
            "total_processing_time": format!("{:?}", inner.total_processing_time),
            "input_transport_count": inner.input_transport_count,
            "output_transport_count": inner.output_transport_count,
            "active_output_count": inner.active_output_count,
        })
    }
}

fn format_time(t: SystemTime) -> String {
    match t.duration_since(std::time::UNIX_EPOCH) {
        Ok(d) => format!("{}.{:09}", d.as_secs(), d.subsec_nanos()),
        Err(_) => "0".to_string(),
    }
}
