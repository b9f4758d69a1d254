//! Priority-ordered processor registry.
//!
//! A processor is registered once and re-consulted for every event its
//! `can_handle` predicate accepts. Higher priority processors run first;
//! equal priorities preserve registration order (a stable sort keyed on
//! descending priority, re-applied after every insert, gives exactly this).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::event_bus::Event;
use crate::packet::Packet;
use crate::session_types::StateChange;

/// Dispatch priority. Higher values dispatch first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low = 0,
    Normal = 50,
    High = 100,
}

/// The capabilities a processor is handed alongside the event it is
/// processing: a narrow view onto the owning session.
pub trait ProcessorContext: Send + Sync {
    fn session_id(&self) -> String;
    /// Reports an error: published as an error event and passed to any
    /// direct error callbacks.
    fn cause_error(&self, err: Error);
    /// Publishes a state event.
    fn emit_state(&self, state: StateChange);
    /// Publishes a packet event as if it had arrived from a transport.
    fn emit_packet(&self, packet: Packet);
    /// Hands a packet directly to the output router, bypassing the event
    /// bus (used by processors that want to inject synthesized output).
    fn send_to_output(&self, packet: Packet);
    /// Records a named metric value (available via `get_all_metrics`'s
    /// open-ended extension point).
    fn add_metric(&self, key: &str, value: serde_json::Value);
    /// Re-injects a packet at the top of the pipeline, as `emit_packet`
    /// does; kept as a distinct name to match the processor capability
    /// contract (`InjectPacket`).
    fn inject_packet(&self, packet: Packet) {
        self.emit_packet(packet);
    }
}

/// A pluggable handler invoked by the session in priority order for
/// matching events.
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> Priority;
    fn can_handle(&self, event: &Event) -> bool;
    async fn process(&self, ctx: &dyn ProcessorContext, event: &Event) -> Result<()>;
}

/// Wraps a plain packet-processing closure as a `Normal`-priority
/// processor, matching the legacy `UseMiddleware` adapter in the source
/// this crate is grounded on.
pub struct MiddlewareProcessor<F> {
    name: String,
    func: F,
}

impl<F> MiddlewareProcessor<F>
where
    F: Fn(&dyn ProcessorContext, &Event) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self { name: name.into(), func }
    }
}

#[async_trait]
impl<F> Processor for MiddlewareProcessor<F>
where
    F: Fn(&dyn ProcessorContext, &Event) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    fn can_handle(&self, event: &Event) -> bool {
        matches!(event.kind, crate::event_bus::EventKind::Packet)
    }

    async fn process(&self, ctx: &dyn ProcessorContext, event: &Event) -> Result<()> {
        (self.func)(ctx, event)
    }
}

/// One entry's outcome from a registry dispatch pass, used by the session
/// to account `processor_error_count` and surface errors via `CauseError`.
pub struct ProcessorOutcome {
    pub processor_name: String,
    pub result: Result<()>,
}

/// Priority-ordered list of processors, re-sorted (stably) on every insert.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: parking_lot::RwLock<Vec<Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor`, keeping the list sorted by descending
    /// priority with registration order preserved among equal priorities.
    pub fn register(&self, processor: Arc<dyn Processor>) {
        let mut processors = self.processors.write();
        processors.push(processor);
        processors.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn len(&self) -> usize {
        self.processors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.read().is_empty()
    }

    /// Returns every processor whose `can_handle` accepts `event`, already
    /// in dispatch order.
    pub fn matching(&self, event: &Event) -> Vec<Arc<dyn Processor>> {
        self.processors
            .read()
            .iter()
            .filter(|p| p.can_handle(event))
            .cloned()
            .collect()
    }

    /// Dispatches `event` to every matching processor in priority order,
    /// invoking each to completion before moving to the next (a single
    /// worker never interleaves two processors on the same event).
    pub async fn dispatch(&self, ctx: &dyn ProcessorContext, event: &Event) -> Vec<ProcessorOutcome> {
        let matching = self.matching(event);
        let mut outcomes = Vec::with_capacity(matching.len());
        for processor in matching {
            let result = processor.process(ctx, event).await;
            outcomes.push(ProcessorOutcome {
                processor_name: processor.name().to_string(),
                result,
            });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{EventKind, EventPayload};
    use std::sync::Mutex as StdMutex;

    struct NoopContext;
    impl ProcessorContext for NoopContext {
        fn session_id(&self) -> String {
            "test".to_string()
        }
        fn cause_error(&self, _err: Error) {}
        fn emit_state(&self, _state: StateChange) {}
        fn emit_packet(&self, _packet: Packet) {}
        fn send_to_output(&self, _packet: Packet) {}
        fn add_metric(&self, _key: &str, _value: serde_json::Value) {}
    }

    struct LoggingProcessor {
        name: String,
        priority: Priority,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Processor for LoggingProcessor {
        fn name(&self) -> &str {
            &self.name
        }
        fn priority(&self) -> Priority {
            self.priority
        }
        fn can_handle(&self, event: &Event) -> bool {
            matches!(event.kind, EventKind::Packet)
        }
        async fn process(&self, _ctx: &dyn ProcessorContext, _event: &Event) -> Result<()> {
            self.log.lock().unwrap().push(self.name.clone());
            Ok(())
        }
    }

    fn packet_event() -> Event {
        Event::new(
            EventKind::Packet,
            "s1",
            EventPayload::Packet(Packet::Close(crate::packet::ClosePacket::new("x"))),
        )
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let registry = ProcessorRegistry::new();
        registry.register(Arc::new(LoggingProcessor {
            name: "low".into(),
            priority: Priority::Low,
            log: log.clone(),
        }));
        registry.register(Arc::new(LoggingProcessor {
            name: "high".into(),
            priority: Priority::High,
            log: log.clone(),
        }));
        registry.register(Arc::new(LoggingProcessor {
            name: "normal".into(),
            priority: Priority::Normal,
            log: log.clone(),
        }));

        registry.dispatch(&NoopContext, &packet_event()).await;
        assert_eq!(*log.lock().unwrap(), vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_preserves_registration_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let registry = ProcessorRegistry::new();
        registry.register(Arc::new(LoggingProcessor {
            name: "first".into(),
            priority: Priority::Normal,
            log: log.clone(),
        }));
        registry.register(Arc::new(LoggingProcessor {
            name: "second".into(),
            priority: Priority::Normal,
            log: log.clone(),
        }));

        registry.dispatch(&NoopContext, &packet_event()).await;
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn non_matching_processor_is_skipped() {
        struct StateOnly;
        #[async_trait]
        impl Processor for StateOnly {
            fn name(&self) -> &str {
                "state-only"
            }
            fn priority(&self) -> Priority {
                Priority::High
            }
            fn can_handle(&self, event: &Event) -> bool {
                matches!(event.kind, EventKind::State)
            }
            async fn process(&self, _ctx: &dyn ProcessorContext, _event: &Event) -> Result<()> {
                panic!("should not be called");
            }
        }

        let registry = ProcessorRegistry::new();
        registry.register(Arc::new(StateOnly));
        let outcomes = registry.dispatch(&NoopContext, &packet_event()).await;
        assert!(outcomes.is_empty());
    }
}
