//! Transport-agnostic real-time media session engine.
//!
//! A [`session::MediaSession`] wires together a [`codec`] registry, an
//! [`event_bus`], a [`processor`] pipeline, a [`router`] and a set of
//! [`transport`] managers into a single `Serve` loop: packets and state
//! changes flow from input transports through decode, processors and
//! routing, out to output transports, while metrics and errors are
//! tracked along the way.

pub mod codec;
pub mod error;
pub mod event_bus;
pub mod metrics;
pub mod packet;
pub mod processor;
pub mod resampler;
pub mod router;
pub mod session;
pub mod session_types;
pub mod task_runner;
pub mod transport;

pub use error::{Error, Result};
pub use packet::Packet;
pub use session::{MediaSession, SessionConfig};

/// Initializes `tracing` for a host that has not already installed its own
/// subscriber. Reads `RUST_LOG`, defaulting to `info` when unset.
///
/// Optional: a host embedding this crate alongside its own subscriber setup
/// should skip this and initialize `tracing` itself instead.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
