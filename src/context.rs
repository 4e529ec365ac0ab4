//! Process-wide dependency container (§9: "realized as a single owned
//! `Context{metrics, db, clock}` constructed once in `main` and passed via
//! `Arc` to every operation," explicitly rejecting a `lazy_static`/
//! `OnceCell` global singleton).

use crate::config::CollectorConfig;
use crate::connector::Connector;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Abstraction over "now," so tests can freeze time without sleeping.
/// Mirrors the reference backend's preference for an injected clock over
/// scattered `Utc::now()` calls in business logic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// One entry per `source_name` in the loaded config (§4.C7's "connector
/// registry, one per source_name").
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    pub fn register(&mut self, source_name: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(source_name.into(), connector);
    }

    pub fn get(&self, source_name: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.get(source_name).cloned()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide singleton, held behind `Arc` and shared by the
/// scheduler, orchestrator, and signal monitor.
pub struct Context {
    pub db: Storage,
    pub connectors: ConnectorRegistry,
    pub collectors: Vec<CollectorConfig>,
    pub clock: Box<dyn Clock>,
}

impl Context {
    pub fn new(
        db: Storage,
        connectors: ConnectorRegistry,
        collectors: Vec<CollectorConfig>,
    ) -> Self {
        Self {
            db,
            connectors,
            collectors,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::mock::MockConnector;

    #[test]
    fn registry_looks_up_by_source_name() {
        let mut registry = ConnectorRegistry::new();
        registry.register("binance", Arc::new(MockConnector::new("binance")));
        assert!(registry.get("binance").is_some());
        assert!(registry.get("coinbase").is_none());
    }

    #[test]
    fn fixed_clock_is_stable() {
        let ts = Utc::now();
        let clock = FixedClock(ts);
        assert_eq!(clock.now(), ts);
        assert_eq!(clock.now(), ts);
    }
}
