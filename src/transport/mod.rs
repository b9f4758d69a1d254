//! Transport abstraction: the capability a session consumes to move
//! packets in and out, plus the router-facing connector view of one.

pub mod manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::CodecConfig;
use crate::error::Result;
use crate::packet::Packet;
use crate::session_types::Direction;

pub use manager::{Filter, FilterOutcome, ManagerSink, TransportManager};

/// Outcome of one `Transport::next()` call.
pub enum NextOutcome {
    Packet(Packet),
    /// Graceful end of stream. The ingress loop demotes this to a
    /// `hangup` state, never an error.
    Eof,
}

/// The capability a transport implementation must provide. The session
/// only calls `next` from its ingress loop, `send` from its egress loop,
/// and `close` from cleanup -- it never mixes those roles.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Blocks until the next inbound packet, EOF, or an error.
    async fn next(&self) -> Result<NextOutcome>;

    /// Sends one packet out. Returns the number of bytes written.
    async fn send(&self, packet: &Packet) -> Result<usize>;

    /// The codec this transport speaks on the wire.
    fn codec(&self) -> CodecConfig;

    /// Called once when the transport is added to a session.
    fn attach(&self, session_id: &str);

    /// Releases any underlying resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Stable human-readable identity, used in logs.
    fn name(&self) -> String;
}

/// The router-facing view of a transport: identity, direction, and an
/// active flag that routing consults before selecting a destination.
pub struct TransportConnector {
    pub id: String,
    pub transport: Arc<dyn Transport>,
    pub direction: Direction,
    active: AtomicBool,
}

impl TransportConnector {
    pub fn new(id: impl Into<String>, transport: Arc<dyn Transport>, direction: Direction) -> Self {
        Self {
            id: id.into(),
            transport,
            direction,
            active: AtomicBool::new(true),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }
}
