//! Output connector selection: a rules list plus a default strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::packet::Packet;
use crate::transport::TransportConnector;

/// How a matching rule (or the router's default) picks destinations from
/// the set of currently-active output connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    /// Every active connector.
    Broadcast,
    /// One connector, advancing a shared index on every call.
    RoundRobin,
    /// The first connector in the available list.
    FirstAvailable,
}

/// A condition over a packet; the first rule whose condition matches wins.
pub type RuleCondition = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;

pub struct Rule {
    pub condition: RuleCondition,
    pub strategy: RoutingStrategy,
}

impl Rule {
    pub fn new(condition: RuleCondition, strategy: RoutingStrategy) -> Self {
        Self { condition, strategy }
    }
}

/// Selects output connectors for each outgoing packet. Rules are
/// consulted in registration order; the first match supplies the
/// strategy. Falls back to `default_strategy` when nothing matches.
pub struct Router {
    rules: parking_lot::RwLock<Vec<Rule>>,
    default_strategy: parking_lot::RwLock<RoutingStrategy>,
    round_robin_index: AtomicUsize,
}

impl Router {
    pub fn new(default_strategy: RoutingStrategy) -> Self {
        Self {
            rules: parking_lot::RwLock::new(Vec::new()),
            default_strategy: parking_lot::RwLock::new(default_strategy),
            round_robin_index: AtomicUsize::new(0),
        }
    }

    pub fn add_rule(&self, rule: Rule) {
        self.rules.write().push(rule);
    }

    /// Replaces the fallback strategy used when no rule matches.
    pub fn set_default_strategy(&self, strategy: RoutingStrategy) {
        *self.default_strategy.write() = strategy;
    }

    /// Picks destinations for `packet` out of `available` (already
    /// filtered down to active connectors by the caller).
    pub fn route(&self, packet: &Packet, available: &[Arc<TransportConnector>]) -> Vec<Arc<TransportConnector>> {
        let strategy = self
            .rules
            .read()
            .iter()
            .find(|rule| (rule.condition)(packet))
            .map(|rule| rule.strategy)
            .unwrap_or(*self.default_strategy.read());

        self.apply(strategy, available)
    }

    fn apply(&self, strategy: RoutingStrategy, available: &[Arc<TransportConnector>]) -> Vec<Arc<TransportConnector>> {
        match strategy {
            RoutingStrategy::Broadcast => available.to_vec(),
            RoutingStrategy::FirstAvailable => available.first().cloned().into_iter().collect(),
            RoutingStrategy::RoundRobin => {
                if available.is_empty() {
                    return Vec::new();
                }
                let idx = self.round_robin_index.fetch_add(1, Ordering::SeqCst) % available.len();
                vec![available[idx].clone()]
            }
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RoutingStrategy::Broadcast)
    }
}
