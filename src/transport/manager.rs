//! Per-transport ingress/egress loops: decode-or-encode plus an ordered
//! filter chain, each direction running on its own task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::codec::CodecFn;
use crate::error::{Error, Result};
use crate::packet::{ClosePacket, Packet};
use crate::session_types::{states, Direction, StateChange};

use super::{NextOutcome, Transport};

/// What a filter does with the packet it was handed.
pub enum FilterOutcome {
    /// Pass the (possibly rewritten) packet on to the next filter or,
    /// if this was the last one, to the rest of the pipeline.
    Forward(Packet),
    /// Drop the packet; no error, nothing downstream sees it.
    Skip,
}

/// A per-manager pipeline stage consulted for every packet in order.
/// A filter error terminates the owning ingress/egress loop.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn apply(&self, packet: &Packet) -> Result<FilterOutcome>;
}

/// Callbacks a manager's loops use to report back to the owning session,
/// kept narrow so this module doesn't depend on the session type.
pub trait ManagerSink: Send + Sync {
    fn emit_packet(&self, packet: Packet);
    fn emit_state(&self, state: StateChange);
    fn cause_error(&self, err: Error);
}

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);
const DONE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Owns one transport's filter chain and, for output transports, its
/// bounded egress queue. Ingress and egress are mutually exclusive per
/// manager instance: an instance either drives `run_ingress` or
/// `run_egress`, never both, matching its `direction`.
pub struct TransportManager {
    pub id: String,
    pub transport: Arc<dyn Transport>,
    pub direction: Direction,
    filters: Vec<Arc<dyn Filter>>,
    decode: Option<CodecFn>,
    encode: Option<CodecFn>,
    egress_tx: mpsc::Sender<Packet>,
    egress_rx: AsyncMutex<Option<mpsc::Receiver<Packet>>>,
    done: Arc<AtomicBool>,
    /// Set by `stop()`/`cleanup()`. The manager owns its `egress_tx` for
    /// its whole lifetime, so a plain channel close never reaches a loop
    /// running on the same instance -- shutdown has to be signalled
    /// explicitly and raced against the blocking calls in each loop.
    stopped: Arc<AtomicBool>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl TransportManager {
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        direction: Direction,
        queue_size: usize,
    ) -> Self {
        let (egress_tx, egress_rx) = mpsc::channel(queue_size.max(1));
        Self {
            id: id.into(),
            transport,
            direction,
            filters: Vec::new(),
            decode: None,
            encode: None,
            egress_tx,
            egress_rx: AsyncMutex::new(Some(egress_rx)),
            done: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Signals both loops to exit at their next suspension point.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }

    pub fn with_filters(mut self, filters: Vec<Arc<dyn Filter>>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_decode(mut self, decode: Option<CodecFn>) -> Self {
        self.decode = decode;
        self
    }

    pub fn with_encode(mut self, encode: Option<CodecFn>) -> Self {
        self.encode = encode;
        self
    }

    /// Non-blocking enqueue onto this manager's egress queue. A full
    /// queue drops the packet with a warning; `try_send` itself is
    /// atomic, so this never races with `cleanup`'s queue close.
    pub fn put_packet(&self, packet: Packet) -> bool {
        match self.egress_tx.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(manager = %self.id, "egress queue full; dropping packet");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    async fn run_decode(&self, packet: Packet) -> std::result::Result<Vec<Packet>, Error> {
        match &self.decode {
            Some(decode) => decode(&packet),
            None => Ok(vec![packet]),
        }
    }

    async fn run_encode(&self, packet: Packet) -> std::result::Result<Vec<Packet>, Error> {
        match &self.encode {
            Some(encode) => encode(&packet),
            None => Ok(vec![packet]),
        }
    }

    /// Runs `packet` through the filter chain in order. `Ok(None)` means
    /// some filter skipped it; `Err` means a filter failed and the loop
    /// calling this must terminate.
    async fn run_filters(&self, mut packet: Packet) -> Result<Option<Packet>> {
        for filter in &self.filters {
            match filter.apply(&packet).await? {
                FilterOutcome::Forward(next) => packet = next,
                FilterOutcome::Skip => return Ok(None),
            }
        }
        Ok(Some(packet))
    }

    /// Input-side loop: `Transport::next` -> decode -> filters -> sink.
    /// EOF demotes to a `hangup` state, never an error.
    pub async fn run_ingress(self: Arc<Self>, sink: Arc<dyn ManagerSink>) {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                tracing::debug!(manager = %self.id, "ingress stopped");
                break;
            }

            let outcome = tokio::select! {
                outcome = self.transport.next() => outcome,
                _ = self.shutdown.notified() => break,
            };

            match outcome {
                Ok(NextOutcome::Eof) => {
                    tracing::info!(manager = %self.id, "ingress EOF; hanging up");
                    sink.emit_state(StateChange::new(states::HANGUP));
                    break;
                }
                Ok(NextOutcome::Packet(packet)) => {
                    let decoded = match self.run_decode(packet).await {
                        Ok(decoded) => decoded,
                        Err(err) => {
                            tracing::error!(manager = %self.id, error = %err, "decode failed; closing ingress");
                            sink.cause_error(err);
                            break;
                        }
                    };

                    let mut filter_failed = false;
                    for packet in decoded {
                        match self.run_filters(packet).await {
                            Ok(Some(packet)) => sink.emit_packet(packet),
                            Ok(None) => {}
                            Err(err) => {
                                tracing::error!(manager = %self.id, error = %err, "ingress filter failed; closing loop");
                                sink.cause_error(err);
                                filter_failed = true;
                                break;
                            }
                        }
                    }
                    if filter_failed {
                        break;
                    }
                }
                Err(err) => {
                    tracing::error!(manager = %self.id, error = %err, "ingress transport error");
                    sink.cause_error(err);
                    break;
                }
            }
        }
        self.done.store(true, Ordering::Release);
    }

    /// Output-side loop: dequeue -> filters -> encode -> `Transport::send`.
    pub async fn run_egress(self: Arc<Self>, sink: Arc<dyn ManagerSink>) {
        let mut rx = match self.egress_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                tracing::warn!(manager = %self.id, "run_egress called more than once");
                return;
            }
        };

        loop {
            if self.stopped.load(Ordering::Acquire) {
                tracing::debug!(manager = %self.id, "egress stopped");
                break;
            }

            let packet = tokio::select! {
                packet = rx.recv() => packet,
                _ = self.shutdown.notified() => break,
            };
            let Some(packet) = packet else {
                break;
            };

            let filtered = match self.run_filters(packet).await {
                Ok(Some(packet)) => packet,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(manager = %self.id, error = %err, "egress filter failed; closing loop");
                    sink.cause_error(err);
                    break;
                }
            };

            let encoded = match self.run_encode(filtered).await {
                Ok(encoded) => encoded,
                Err(err) => {
                    tracing::error!(manager = %self.id, error = %err, "encode failed; closing egress");
                    sink.cause_error(err);
                    break;
                }
            };

            for packet in encoded {
                if let Err(err) = self.transport.send(&packet).await {
                    tracing::error!(manager = %self.id, error = %err, "transport send failed");
                    sink.cause_error(err);
                }
            }
        }
        self.done.store(true, Ordering::Release);
    }

    /// Closes the transport, waits up to five seconds for the manager's
    /// loop to observe it and exit, then gives every filter a synthetic
    /// close signal so stateful filters can tear down deterministically.
    pub async fn cleanup(&self) {
        self.stop();
        if let Err(err) = self.transport.close().await {
            tracing::warn!(manager = %self.id, error = %err, "transport close failed during cleanup");
        }

        let deadline = tokio::time::Instant::now() + CLEANUP_TIMEOUT;
        while !self.done.load(Ordering::Acquire) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DONE_POLL_INTERVAL).await;
        }
        if !self.done.load(Ordering::Acquire) {
            tracing::warn!(manager = %self.id, "loop did not exit within cleanup timeout; abandoning");
        }

        let close_packet = Packet::Close(ClosePacket::new("transport cleanup"));
        for filter in &self.filters {
            let _ = filter.apply(&close_packet).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecConfig;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as TokioMutex;

    struct ScriptedTransport {
        packets: TokioMutex<Vec<Packet>>,
        sent: StdMutex<Vec<Packet>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn next(&self) -> Result<NextOutcome> {
            let mut packets = self.packets.lock().await;
            if packets.is_empty() {
                Ok(NextOutcome::Eof)
            } else {
                Ok(NextOutcome::Packet(packets.remove(0)))
            }
        }
        async fn send(&self, packet: &Packet) -> Result<usize> {
            self.sent.lock().unwrap().push(packet.clone());
            Ok(packet.size_bytes())
        }
        fn codec(&self) -> CodecConfig {
            CodecConfig::default()
        }
        fn attach(&self, _session_id: &str) {}
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> String {
            "scripted".into()
        }
    }

    struct RecordingSink {
        packets: StdMutex<Vec<Packet>>,
        states: StdMutex<Vec<StateChange>>,
        errors: StdMutex<Vec<Error>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                packets: StdMutex::new(Vec::new()),
                states: StdMutex::new(Vec::new()),
                errors: StdMutex::new(Vec::new()),
            }
        }
    }

    impl ManagerSink for RecordingSink {
        fn emit_packet(&self, packet: Packet) {
            self.packets.lock().unwrap().push(packet);
        }
        fn emit_state(&self, state: StateChange) {
            self.states.lock().unwrap().push(state);
        }
        fn cause_error(&self, err: Error) {
            self.errors.lock().unwrap().push(err);
        }
    }

    struct DropAudioFilter;

    #[async_trait]
    impl Filter for DropAudioFilter {
        async fn apply(&self, packet: &Packet) -> Result<FilterOutcome> {
            if packet.is_audio() {
                Ok(FilterOutcome::Skip)
            } else {
                Ok(FilterOutcome::Forward(packet.clone()))
            }
        }
    }

    #[tokio::test]
    async fn ingress_eof_emits_hangup() {
        let transport = Arc::new(ScriptedTransport {
            packets: TokioMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
        });
        let manager = Arc::new(TransportManager::new("in", transport, Direction::Rx, 8));
        let sink = Arc::new(RecordingSink::new());

        manager.clone().run_ingress(sink.clone()).await;

        assert_eq!(sink.states.lock().unwrap().len(), 1);
        assert_eq!(sink.states.lock().unwrap()[0].state, states::HANGUP);
        assert!(manager.done.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn ingress_filter_skip_drops_packet() {
        let transport = Arc::new(ScriptedTransport {
            packets: TokioMutex::new(vec![Packet::Audio(crate::packet::AudioPacket::default())]),
            sent: StdMutex::new(Vec::new()),
        });
        let manager = Arc::new(
            TransportManager::new("in", transport, Direction::Rx, 8)
                .with_filters(vec![Arc::new(DropAudioFilter)]),
        );
        let sink = Arc::new(RecordingSink::new());

        manager.run_ingress(sink.clone()).await;

        assert!(sink.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn egress_encodes_and_sends() {
        let transport = Arc::new(ScriptedTransport {
            packets: TokioMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
        });
        let manager = Arc::new(TransportManager::new("out", transport.clone(), Direction::Tx, 8));
        let sink = Arc::new(RecordingSink::new());

        manager.put_packet(Packet::Close(ClosePacket::new("bye")));
        let handle = tokio::spawn(manager.clone().run_egress(sink));
        // Give the loop a chance to drain the one queued packet, then
        // signal it to stop -- a manager owns its sender for its whole
        // lifetime, so nothing ever closes the channel on its own.
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.stop();
        handle.await.unwrap();

        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_delivers_synthetic_close_to_filters() {
        struct RecordingFilter(Arc<StdMutex<Vec<Packet>>>);

        #[async_trait]
        impl Filter for RecordingFilter {
            async fn apply(&self, packet: &Packet) -> Result<FilterOutcome> {
                self.0.lock().unwrap().push(packet.clone());
                Ok(FilterOutcome::Forward(packet.clone()))
            }
        }

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let transport = Arc::new(ScriptedTransport {
            packets: TokioMutex::new(Vec::new()),
            sent: StdMutex::new(Vec::new()),
        });
        let manager = TransportManager::new("out", transport, Direction::Tx, 8)
            .with_filters(vec![Arc::new(RecordingFilter(seen.clone()))]);
        manager.done.store(true, Ordering::Release);

        manager.cleanup().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(&seen[0], Packet::Close(p) if p.reason == "transport cleanup"));
    }
}
