//! Scoped counters and timers.
//!
//! [`StatsReceiver`] is the interface an export backend must satisfy.
//! [`StatsRecorder`] keeps everything in memory; it backs the periodic
//! report in the server and the assertions in tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Sink for scoped statistics.
pub trait StatsReceiver: Send + Sync {
    fn counter(&self, name: &str) -> Box<dyn Counter>;
    fn timer(&self, name: &str) -> Box<dyn Timer>;
    /// A receiver whose names are prefixed with `scope.`.
    fn scope(&self, scope: &str) -> Arc<dyn StatsReceiver>;
}

pub trait Counter: Send {
    fn add(&self, delta: i64);

    fn incr(&self) {
        self.add(1);
    }
}

pub trait Timer: Send {
    fn add(&self, elapsed: Duration);
}

/// Join a scope and a name with a dot. An empty scope leaves the name as is.
pub fn scoped_name(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

#[derive(Debug, Default)]
struct Values {
    counters: BTreeMap<String, i64>,
    timers: BTreeMap<String, Duration>,
}

/// Point-in-time copy of everything recorded.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub counters: BTreeMap<String, i64>,
    pub timers: BTreeMap<String, Duration>,
}

/// In-memory [`StatsReceiver`]. Clones and scopes share the same storage.
#[derive(Debug, Clone, Default)]
pub struct StatsRecorder {
    scope: String,
    values: Arc<Mutex<Values>>,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a fully qualified counter, 0 if never touched.
    pub fn counter_value(&self, name: &str) -> i64 {
        self.lock().counters.get(name).copied().unwrap_or(0)
    }

    /// Accumulated time of a fully qualified timer.
    pub fn timer_value(&self, name: &str) -> Duration {
        self.lock().timers.get(name).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let values = self.lock();
        StatsSnapshot {
            counters: values.counters.clone(),
            timers: values.timers.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Values> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StatsReceiver for StatsRecorder {
    fn counter(&self, name: &str) -> Box<dyn Counter> {
        Box::new(RecordedCounter {
            name: scoped_name(&self.scope, name),
            values: self.values.clone(),
        })
    }

    fn timer(&self, name: &str) -> Box<dyn Timer> {
        Box::new(RecordedTimer {
            name: scoped_name(&self.scope, name),
            values: self.values.clone(),
        })
    }

    fn scope(&self, scope: &str) -> Arc<dyn StatsReceiver> {
        Arc::new(StatsRecorder {
            scope: scoped_name(&self.scope, scope),
            values: self.values.clone(),
        })
    }
}

struct RecordedCounter {
    name: String,
    values: Arc<Mutex<Values>>,
}

impl Counter for RecordedCounter {
    fn add(&self, delta: i64) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        *values.counters.entry(self.name.clone()).or_insert(0) += delta;
    }
}

struct RecordedTimer {
    name: String,
    values: Arc<Mutex<Values>>,
}

impl Timer for RecordedTimer {
    fn add(&self, elapsed: Duration) {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        *values.timers.entry(self.name.clone()).or_default() += elapsed;
    }
}
