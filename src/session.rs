//! The public session object: wires the event bus, processor registry,
//! router and transport managers together and drives the `Serve` lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::codec::{CodecConfig, CodecFn, CodecRegistry};
use crate::error::{Error, Result};
use crate::event_bus::{Event, EventBus, EventHandler, EventKind, EventPayload, DEFAULT_QUEUE_SIZE, DEFAULT_WORKERS};
use crate::packet::Packet;
use crate::processor::{MiddlewareProcessor, Priority, Processor, ProcessorContext, ProcessorRegistry};
use crate::router::Router;
use crate::metrics::SessionMetrics;
use crate::session_types::{states, Direction, StateChange};
use crate::task_runner::TaskRunner;
use crate::transport::{Filter, ManagerSink, Transport, TransportConnector, TransportManager};

pub type TraceFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type StateHandlerFn = Arc<dyn Fn(&StateChange) + Send + Sync>;
pub type ErrorHandlerFn = Arc<dyn Fn(&Error) + Send + Sync>;
pub type PostHookFn = Arc<dyn Fn() + Send + Sync>;
pub type MiddlewareFn = Arc<dyn Fn(&dyn ProcessorContext, &Event) -> Result<()> + Send + Sync>;

/// The core's own tunables. No file or env format is defined here; a
/// host loads its own configuration however it likes and hands the
/// result to [`MediaSession::new`].
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub event_bus_queue_size: usize,
    pub event_bus_workers: usize,
    pub egress_queue_size: usize,
    /// Stored as seconds rather than `Duration` to keep `Deserialize`
    /// trivial; `0` means unbounded.
    pub max_session_duration_secs: u64,
    pub sample_rate: u32,
}

impl SessionConfig {
    pub fn max_session_duration(&self) -> Duration {
        Duration::from_secs(self.max_session_duration_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_bus_queue_size: DEFAULT_QUEUE_SIZE,
            event_bus_workers: DEFAULT_WORKERS,
            egress_queue_size: 128,
            max_session_duration_secs: 600,
            sample_rate: 16_000,
        }
    }
}

/// The public object. Built via [`MediaSession::new`], configured through
/// its chainable methods, then driven to completion with a single
/// [`MediaSession::serve`] call.
pub struct MediaSession {
    id: parking_lot::RwLock<String>,
    config: SessionConfig,
    codecs: CodecRegistry,
    event_bus: Arc<EventBus>,
    processors: ProcessorRegistry,
    router: Router,
    metrics: Arc<SessionMetrics>,
    store: DashMap<String, serde_json::Value>,
    extra_metrics: DashMap<String, serde_json::Value>,
    input_managers: parking_lot::RwLock<Vec<Arc<TransportManager>>>,
    output_managers: parking_lot::RwLock<Vec<Arc<TransportManager>>>,
    output_connectors: parking_lot::RwLock<Vec<Arc<TransportConnector>>>,
    decode: parking_lot::RwLock<Option<CodecFn>>,
    encode: parking_lot::RwLock<Option<CodecFn>>,
    trace: parking_lot::RwLock<Option<TraceFn>>,
    state_handlers: parking_lot::RwLock<HashMap<String, Vec<StateHandlerFn>>>,
    error_handlers: parking_lot::RwLock<Vec<ErrorHandlerFn>>,
    post_hooks: parking_lot::RwLock<Vec<PostHookFn>>,
    running: AtomicBool,
    start_at: parking_lot::RwLock<Option<SystemTime>>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<tokio::sync::Notify>,
    task_runner: parking_lot::RwLock<Option<Arc<TaskRunner>>>,
}

impl MediaSession {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let event_bus = EventBus::new(config.event_bus_queue_size, config.event_bus_workers);
        let session = Arc::new(Self {
            id: parking_lot::RwLock::new(uuid::Uuid::new_v4().to_string()),
            config,
            codecs: CodecRegistry::with_builtins(),
            event_bus: event_bus.clone(),
            processors: ProcessorRegistry::new(),
            router: Router::default(),
            metrics: Arc::new(SessionMetrics::new()),
            store: DashMap::new(),
            extra_metrics: DashMap::new(),
            input_managers: parking_lot::RwLock::new(Vec::new()),
            output_managers: parking_lot::RwLock::new(Vec::new()),
            output_connectors: parking_lot::RwLock::new(Vec::new()),
            decode: parking_lot::RwLock::new(None),
            encode: parking_lot::RwLock::new(None),
            trace: parking_lot::RwLock::new(None),
            state_handlers: parking_lot::RwLock::new(HashMap::new()),
            error_handlers: parking_lot::RwLock::new(Vec::new()),
            post_hooks: parking_lot::RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
            start_at: parking_lot::RwLock::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(tokio::sync::Notify::new()),
            task_runner: parking_lot::RwLock::new(None),
        });
        event_bus.subscribe(
            EventKind::Lifecycle,
            Arc::new(DispatchHandler { session: Arc::downgrade(&session) }),
        );
        // Registered now, ahead of any processor the caller adds, so that
        // ties at `High` priority keep these first and the output router
        // (registered at `serve()` start, after every user processor) stays
        // last.
        session.processors.register(Arc::new(PacketValidatorProcessor));
        session.processors.register(Arc::new(PacketMonitorProcessor { metrics: session.metrics.clone() }));
        session.processors.register(Arc::new(StateMonitorProcessor { metrics: session.metrics.clone() }));
        session.processors.register(Arc::new(ErrorMonitorProcessor { metrics: session.metrics.clone() }));
        session
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(SessionConfig::default())
    }

    // -- chainable configuration -------------------------------------

    pub fn set_session_id(self: &Arc<Self>, id: impl Into<String>) -> &Arc<Self> {
        *self.id.write() = id.into();
        self
    }

    /// Links an external cancellation signal into this session: when
    /// `parent` fires, the session closes as if `close()` had been
    /// called directly.
    pub fn context(self: &Arc<Self>, parent: Arc<tokio::sync::Notify>) -> &Arc<Self> {
        let session = self.clone();
        tokio::spawn(async move {
            parent.notified().await;
            session.close();
        });
        self
    }

    pub fn trace(self: &Arc<Self>, f: TraceFn) -> &Arc<Self> {
        *self.trace.write() = Some(f);
        self
    }

    pub fn encode(self: &Arc<Self>, f: CodecFn) -> &Arc<Self> {
        *self.encode.write() = Some(f);
        self
    }

    pub fn decode(self: &Arc<Self>, f: CodecFn) -> &Arc<Self> {
        *self.decode.write() = Some(f);
        self
    }

    pub fn add_input_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        filters: Vec<Arc<dyn Filter>>,
    ) -> &Arc<Self> {
        transport.attach(&self.session_id());
        let decode = self.resolve_decode(&transport.codec());
        let id = format!("in-{}", uuid::Uuid::new_v4());
        let manager = Arc::new(
            TransportManager::new(id, transport, Direction::Rx, self.config.egress_queue_size)
                .with_filters(filters)
                .with_decode(decode),
        );
        self.input_managers.write().push(manager);
        self
    }

    pub fn add_output_transport(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        filters: Vec<Arc<dyn Filter>>,
    ) -> &Arc<Self> {
        transport.attach(&self.session_id());
        let encode = self.resolve_encode(&transport.codec());
        let id = format!("out-{}", uuid::Uuid::new_v4());
        let manager = Arc::new(
            TransportManager::new(id.clone(), transport.clone(), Direction::Tx, self.config.egress_queue_size)
                .with_filters(filters)
                .with_encode(encode),
        );
        self.output_managers.write().push(manager);
        self.output_connectors
            .write()
            .push(Arc::new(TransportConnector::new(id, transport, Direction::Tx)));
        self
    }

    pub fn register_processor(self: &Arc<Self>, processor: Arc<dyn Processor>) -> &Arc<Self> {
        self.processors.register(processor);
        self
    }

    /// Replaces the router's fallback strategy (`Broadcast` by default).
    pub fn with_routing_strategy(self: &Arc<Self>, strategy: crate::router::RoutingStrategy) -> &Arc<Self> {
        self.router.set_default_strategy(strategy);
        self
    }

    /// Adds a routing rule consulted ahead of the default strategy.
    pub fn add_routing_rule(self: &Arc<Self>, rule: crate::router::Rule) -> &Arc<Self> {
        self.router.add_rule(rule);
        self
    }

    /// Legacy adapter: wraps each function as a `Normal`-priority packet
    /// processor, matching the source this crate is grounded on.
    pub fn use_middleware(self: &Arc<Self>, funcs: Vec<MiddlewareFn>) -> &Arc<Self> {
        for (i, f) in funcs.into_iter().enumerate() {
            let name = format!("middleware-{i}");
            self.processors.register(Arc::new(MiddlewareProcessor::new(
                name,
                move |ctx: &dyn ProcessorContext, event: &Event| f(ctx, event),
            )));
        }
        self
    }

    pub fn on(self: &Arc<Self>, state: impl Into<String>, handlers: Vec<StateHandlerFn>) -> &Arc<Self> {
        self.state_handlers.write().entry(state.into()).or_default().extend(handlers);
        self
    }

    pub fn error(self: &Arc<Self>, handlers: Vec<ErrorHandlerFn>) -> &Arc<Self> {
        self.error_handlers.write().extend(handlers);
        self
    }

    pub fn post_hook(self: &Arc<Self>, hooks: Vec<PostHookFn>) -> &Arc<Self> {
        self.post_hooks.write().extend(hooks);
        self
    }

    /// Attaches the optional async task runner overlay; its lifecycle is
    /// thereafter driven by the session's `begin`/`end` states.
    pub fn with_task_runner(self: &Arc<Self>, runner: Arc<TaskRunner>) -> &Arc<Self> {
        *self.task_runner.write() = Some(runner);
        self
    }

    fn resolve_decode(&self, transport_codec: &CodecConfig) -> Option<CodecFn> {
        if let Some(f) = self.decode.read().clone() {
            return Some(f);
        }
        let pcm = CodecConfig { sample_rate: self.config.sample_rate, ..CodecConfig::default() };
        match self.codecs.create_decode(&transport_codec.codec, transport_codec, &pcm) {
            Ok(f) => Some(f),
            Err(err) => {
                tracing::warn!(codec = %transport_codec.codec, error = %err, "no decoder available; passing through");
                None
            }
        }
    }

    fn resolve_encode(&self, transport_codec: &CodecConfig) -> Option<CodecFn> {
        if let Some(f) = self.encode.read().clone() {
            return Some(f);
        }
        let pcm = CodecConfig { sample_rate: self.config.sample_rate, ..CodecConfig::default() };
        match self.codecs.create_encode(&transport_codec.codec, transport_codec, &pcm) {
            Ok(f) => Some(f),
            Err(err) => {
                tracing::warn!(codec = %transport_codec.codec, error = %err, "no encoder available; passing through");
                None
            }
        }
    }

    // -- key/value store -----------------------------------------------

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value) -> &Self {
        self.store.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.store.get(key).map(|v| v.clone())
    }

    pub fn get_string(&self, key: &str) -> String {
        self.store
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    /// Zero for a missing key, a negative number, or a non-numeric value.
    pub fn get_uint(&self, key: &str) -> u64 {
        match self.store.get(key).map(|v| v.clone()) {
            Some(serde_json::Value::Number(n)) => n.as_u64().or_else(|| n.as_i64().filter(|i| *i >= 0).map(|i| i as u64)).unwrap_or(0),
            _ => 0,
        }
    }

    pub fn delete(&self, key: &str) -> &Self {
        self.store.remove(key);
        self
    }

    // -- metrics ---------------------------------------------------------

    pub fn get_metrics(&self) -> (u64, u64) {
        self.metrics.get_metrics()
    }

    /// Names of every registered processor that would handle a packet
    /// event, in dispatch order. A diagnostic for third-party processor
    /// registration order, not used by the pipeline itself.
    pub fn packet_processor_order(&self) -> Vec<String> {
        let probe = Event::new(
            EventKind::Packet,
            self.session_id(),
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("probe"))),
        );
        self.processors.matching(&probe).iter().map(|p| p.name().to_string()).collect()
    }

    pub fn get_all_metrics(&self) -> serde_json::Value {
        let mut all = self.metrics.get_all_metrics();
        if let serde_json::Value::Object(map) = &mut all {
            for entry in self.extra_metrics.iter() {
                map.insert(entry.key().clone(), entry.value().clone());
            }
        }
        all
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start_at(&self) -> Option<SystemTime> {
        *self.start_at.read()
    }

    fn validate(&self) -> Result<()> {
        if self.input_managers.read().is_empty() {
            return Err(Error::Configuration("session requires at least one input transport".to_string()));
        }
        if self.output_managers.read().is_empty() {
            return Err(Error::Configuration("session requires at least one output transport".to_string()));
        }
        Ok(())
    }

    /// Registered last, after every processor the caller added via
    /// `register_processor`/`use_middleware`, so it runs after all of them
    /// regardless of its `Low` priority tiebreak.
    fn register_output_router(&self) {
        self.processors.register(Arc::new(OutputRouterProcessor));
    }

    fn trace_log(&self, message: &str) {
        if let Some(f) = &*self.trace.read() {
            f(message);
        }
    }

    /// Runs `event` through the processor registry, then through any
    /// state/error handlers and the task runner. Shared by the ordinary
    /// bus-driven path ([`DispatchHandler`]) and the terminal `end`
    /// state, which is delivered directly because by the time it fires
    /// the event bus has already been closed and would drop it.
    async fn process_event(&self, event: Event) {
        let measure_start = matches!(event.kind, EventKind::Packet).then(std::time::Instant::now);
        let outcomes = self.processors.dispatch(self, &event).await;
        for outcome in outcomes {
            if let Err(err) = outcome.result {
                self.metrics.record_processor_error();
                self.cause_error_internal(Error::Processor { name: outcome.processor_name, message: err.to_string() });
            }
        }
        if let Some(start) = measure_start {
            self.metrics.add_processing_time(start.elapsed());
        }

        match &event.payload {
            EventPayload::State(state) => {
                self.dispatch_state_handlers(state);
                let runner = self.task_runner.read().clone();
                if let Some(runner) = runner {
                    runner.handle_state(state).await;
                }
            }
            EventPayload::Error(err) => self.dispatch_error_handlers(err),
            _ => {}
        }
    }

    fn dispatch_state_handlers(&self, state: &StateChange) {
        let handlers = self.state_handlers.read();
        if let Some(list) = handlers.get(&state.state) {
            for handler in list {
                handler(state);
            }
        }
        if state.state != states::WILDCARD {
            if let Some(list) = handlers.get(states::WILDCARD) {
                for handler in list {
                    handler(state);
                }
            }
        }
    }

    fn dispatch_error_handlers(&self, err: &Arc<Error>) {
        for handler in self.error_handlers.read().iter() {
            handler(err);
        }
    }

    fn emit_packet_internal(&self, packet: Packet) {
        self.event_bus
            .publish(Event::new(EventKind::Packet, self.session_id(), EventPayload::Packet(packet)));
    }

    fn emit_state_internal(&self, state: StateChange) {
        tracing::info!(session_id = %self.session_id(), state = %state.state, "session state change");
        self.trace_log(&format!("state: {}", state.state));
        self.event_bus
            .publish(Event::new(EventKind::State, self.session_id(), EventPayload::State(state)));
    }

    fn cause_error_internal(&self, err: Error) {
        tracing::error!(session_id = %self.session_id(), error = %err, "session error");
        self.event_bus
            .publish(Event::new(EventKind::Error, self.session_id(), EventPayload::Error(Arc::new(err))));
    }

    fn send_to_output_internal(&self, packet: Packet) {
        let active: Vec<Arc<TransportConnector>> =
            self.output_connectors.read().iter().filter(|c| c.is_active()).cloned().collect();
        self.metrics.set_active_output_count(active.len());

        let selected = self.router.route(&packet, &active);
        let managers = self.output_managers.read();
        for connector in selected {
            match managers.iter().find(|m| m.id == connector.id) {
                Some(manager) => {
                    if !manager.put_packet(packet.clone()) {
                        tracing::warn!(connector = %connector.id, "output egress queue full; packet dropped");
                    }
                }
                None => tracing::warn!(connector = %connector.id, "no transport manager for selected connector"),
            }
        }
    }

    /// The single run call. Marks the session running, registers the
    /// output router (the built-in High-priority processors are already
    /// registered by [`MediaSession::new`]), arms the max-duration timer
    /// if configured, spawns every transport manager's loop, emits
    /// `begin`, then blocks until the session is closed before running
    /// cleanup.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        self.validate()?;
        self.running.store(true, Ordering::Release);
        *self.start_at.write() = Some(SystemTime::now());
        self.register_output_router();
        self.trace_log("serve: starting");

        if !self.config.max_session_duration().is_zero() {
            let session = self.clone();
            let duration = self.config.max_session_duration();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        tracing::info!(session_id = %session.session_id(), "max session duration elapsed");
                        session.emit_state_internal(StateChange::with_params(
                            states::HANGUP,
                            vec![serde_json::Value::String("timeout".to_string())],
                        ));
                        session.close();
                    }
                    _ = session.shutdown.notified() => {}
                }
            });
        }

        for manager in self.input_managers.read().iter().cloned().collect::<Vec<_>>() {
            let sink: Arc<dyn ManagerSink> = self.clone();
            let session = self.clone();
            tokio::spawn(async move {
                manager.run_ingress(sink).await;
                // losing an input transport ends the session, per the
                // lifecycle contract.
                session.close();
            });
        }
        for manager in self.output_managers.read().iter().cloned().collect::<Vec<_>>() {
            let sink: Arc<dyn ManagerSink> = self.clone();
            tokio::spawn(manager.run_egress(sink));
        }

        self.metrics
            .set_transport_counts(self.input_managers.read().len(), self.output_managers.read().len());

        self.emit_state_internal(StateChange::new(states::BEGIN));

        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Idempotent: flips the closed flag and wakes `serve`'s wait loop.
    /// Cleanup itself runs inside `serve`, not here.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_waiters();
    }

    async fn cleanup(&self) {
        self.trace_log("serve: cleanup");
        self.event_bus.close().await;

        let managers: Vec<Arc<TransportManager>> = self
            .input_managers
            .read()
            .iter()
            .cloned()
            .chain(self.output_managers.read().iter().cloned())
            .collect();
        futures::future::join_all(managers.iter().map(|m| m.cleanup())).await;

        // Delivered directly rather than through the bus: the bus is
        // already closed at this point and `publish` after close is a
        // silent no-op.
        self.process_event(Event::new(
            EventKind::State,
            self.session_id(),
            EventPayload::State(StateChange::new(states::END)),
        ))
        .await;

        for hook in self.post_hooks.read().iter() {
            hook();
        }
        self.running.store(false, Ordering::Release);
    }
}

impl ProcessorContext for MediaSession {
    fn session_id(&self) -> String {
        self.id.read().clone()
    }
    fn cause_error(&self, err: Error) {
        self.cause_error_internal(err);
    }
    fn emit_state(&self, state: StateChange) {
        self.emit_state_internal(state);
    }
    fn emit_packet(&self, packet: Packet) {
        self.emit_packet_internal(packet);
    }
    fn send_to_output(&self, packet: Packet) {
        self.send_to_output_internal(packet);
    }
    fn add_metric(&self, key: &str, value: serde_json::Value) {
        self.extra_metrics.insert(key.to_string(), value);
    }
}

impl ManagerSink for MediaSession {
    fn emit_packet(&self, packet: Packet) {
        self.emit_packet_internal(packet);
    }
    fn emit_state(&self, state: StateChange) {
        self.emit_state_internal(state);
    }
    fn cause_error(&self, err: Error) {
        self.cause_error_internal(err);
    }
}

/// Bridges the event bus to the processor registry and the session's
/// state/error handlers. Subscribed once, on `Lifecycle`, so it sees
/// every packet/state/error event in addition to lifecycle events
/// themselves (the bus treats `Lifecycle` as a wildcard destination).
struct DispatchHandler {
    session: Weak<MediaSession>,
}

#[async_trait]
impl EventHandler for DispatchHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        if let Some(session) = self.session.upgrade() {
            session.process_event(event.clone()).await;
        }
        Ok(())
    }
}

struct PacketValidatorProcessor;

#[async_trait]
impl Processor for PacketValidatorProcessor {
    fn name(&self) -> &str {
        "packet-validator"
    }
    fn priority(&self) -> Priority {
        Priority::High
    }
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Packet)
    }
    async fn process(&self, ctx: &dyn ProcessorContext, event: &Event) -> Result<()> {
        if let EventPayload::Packet(packet) = &event.payload {
            if let Some(err) = validate_packet(packet) {
                ctx.cause_error(err);
            }
        }
        Ok(())
    }
}

fn validate_packet(packet: &Packet) -> Option<Error> {
    match packet {
        Packet::Audio(audio) if audio.payload.len() > crate::packet::MAX_AUDIO_PAYLOAD_BYTES => Some(Error::Validation(format!(
            "audio payload {} bytes exceeds {} byte limit",
            audio.payload.len(),
            crate::packet::MAX_AUDIO_PAYLOAD_BYTES
        ))),
        Packet::Text(text) if text.text.is_empty() && !text.is_end => {
            Some(Error::Validation("empty text packet without is_end".to_string()))
        }
        _ => None,
    }
}

struct PacketMonitorProcessor {
    metrics: Arc<SessionMetrics>,
}

#[async_trait]
impl Processor for PacketMonitorProcessor {
    fn name(&self) -> &str {
        "packet-monitor"
    }
    fn priority(&self) -> Priority {
        Priority::High
    }
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Packet)
    }
    async fn process(&self, _ctx: &dyn ProcessorContext, event: &Event) -> Result<()> {
        if let EventPayload::Packet(packet) = &event.payload {
            self.metrics.record_packet(packet);
        }
        Ok(())
    }
}

struct StateMonitorProcessor {
    metrics: Arc<SessionMetrics>,
}

#[async_trait]
impl Processor for StateMonitorProcessor {
    fn name(&self) -> &str {
        "state-monitor"
    }
    fn priority(&self) -> Priority {
        Priority::High
    }
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::State)
    }
    async fn process(&self, _ctx: &dyn ProcessorContext, _event: &Event) -> Result<()> {
        self.metrics.record_state_change();
        Ok(())
    }
}

struct ErrorMonitorProcessor {
    metrics: Arc<SessionMetrics>,
}

#[async_trait]
impl Processor for ErrorMonitorProcessor {
    fn name(&self) -> &str {
        "error-monitor"
    }
    fn priority(&self) -> Priority {
        Priority::High
    }
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Error)
    }
    async fn process(&self, _ctx: &dyn ProcessorContext, _event: &Event) -> Result<()> {
        self.metrics.record_error();
        Ok(())
    }
}

/// Registered last, at `Low` priority, so user processors see every
/// packet before it is routed to the outputs.
struct OutputRouterProcessor;

#[async_trait]
impl Processor for OutputRouterProcessor {
    fn name(&self) -> &str {
        "output-router"
    }
    fn priority(&self) -> Priority {
        Priority::Low
    }
    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.kind, EventKind::Packet)
    }
    async fn process(&self, ctx: &dyn ProcessorContext, event: &Event) -> Result<()> {
        if let EventPayload::Packet(packet) = &event.payload {
            ctx.send_to_output(packet.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::NextOutcome;

    #[tokio::test]
    async fn validate_rejects_missing_transports() {
        let session = MediaSession::with_defaults();
        assert!(session.validate().is_err());
    }

    #[tokio::test]
    async fn kv_store_uint_edge_cases() {
        let session = MediaSession::with_defaults();
        session.set("count", serde_json::json!(5));
        assert_eq!(session.get_uint("count"), 5);
        session.set("neg", serde_json::json!(-3));
        assert_eq!(session.get_uint("neg"), 0);
        assert_eq!(session.get_uint("missing"), 0);
        session.set("name", serde_json::json!("hi"));
        assert_eq!(session.get_string("name"), "hi");
        session.delete("name");
        assert!(session.get("name").is_none());
    }

    #[tokio::test]
    async fn wildcard_state_handler_receives_every_state() {
        let session = MediaSession::with_defaults();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        session.on(
            states::WILDCARD,
            vec![Arc::new(move |s: &StateChange| seen2.lock().push(s.state.clone())) as StateHandlerFn],
        );
        session
            .process_event(Event::new(
                EventKind::State,
                "s",
                EventPayload::State(StateChange::new(states::BEGIN)),
            ))
            .await;
        assert_eq!(*seen.lock(), vec![states::BEGIN.to_string()]);
    }

    struct OneShotInput(tokio::sync::Mutex<Option<Packet>>);

    #[async_trait]
    impl Transport for OneShotInput {
        async fn next(&self) -> Result<NextOutcome> {
            match self.0.lock().await.take() {
                Some(p) => Ok(NextOutcome::Packet(p)),
                None => Ok(NextOutcome::Eof),
            }
        }
        async fn send(&self, _packet: &Packet) -> Result<usize> {
            Ok(0)
        }
        fn codec(&self) -> CodecConfig {
            CodecConfig::default()
        }
        fn attach(&self, _session_id: &str) {}
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> String {
            "oneshot-in".into()
        }
    }

    struct RecordingOutput(std::sync::Mutex<Vec<Packet>>);

    #[async_trait]
    impl Transport for RecordingOutput {
        async fn next(&self) -> Result<NextOutcome> {
            Ok(NextOutcome::Eof)
        }
        async fn send(&self, packet: &Packet) -> Result<usize> {
            self.0.lock().unwrap().push(packet.clone());
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
            "recording-out".into()
        }
    }

    #[tokio::test]
    async fn loopback_packet_flows_from_input_to_output() {
        let packet = Packet::Audio(crate::packet::AudioPacket {
            payload: vec![1, 2, 3, 4],
            ..Default::default()
        });
        let input = Arc::new(OneShotInput(tokio::sync::Mutex::new(Some(packet))));
        let output = Arc::new(RecordingOutput(std::sync::Mutex::new(Vec::new())));

        let session = MediaSession::with_defaults();
        session.add_input_transport(input, Vec::new());
        session.add_output_transport(output.clone(), Vec::new());

        let serve_session = session.clone();
        let handle = tokio::spawn(async move { serve_session.serve().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.close();
        handle.await.unwrap().unwrap();

        let sent = output.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].as_audio().unwrap().payload, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn oversize_audio_is_reported_but_not_dropped_from_pipeline() {
        let big = Packet::Audio(crate::packet::AudioPacket {
            payload: vec![0u8; crate::packet::MAX_AUDIO_PAYLOAD_BYTES + 1],
            ..Default::default()
        });
        let input = Arc::new(OneShotInput(tokio::sync::Mutex::new(Some(big))));
        let output = Arc::new(RecordingOutput(std::sync::Mutex::new(Vec::new())));

        let session = MediaSession::with_defaults();
        session.add_input_transport(input, Vec::new());
        session.add_output_transport(output.clone(), Vec::new());

        let errors = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        session.error(vec![Arc::new(move |e: &Error| errors2.lock().push(e.to_string())) as ErrorHandlerFn]);

        let serve_session = session.clone();
        let handle = tokio::spawn(async move { serve_session.serve().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.close();
        handle.await.unwrap().unwrap();

        // the validator reports the error but does not short-circuit
        // the pipeline: the oversize packet still reaches the output.
        assert_eq!(output.0.lock().unwrap().len(), 1);
        assert!(!errors.lock().is_empty());
    }
}
