//! Process-wide counter registry.
//!
//! Counters are aggregated per logical label (step id, provider name,
//! retry label). Increments are cheap and never affect control flow;
//! snapshots have no read side effects. The registry is one of the two
//! process-wide singletons (the other is the identity hasher configuration).

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

fn counters() -> &'static Mutex<BTreeMap<String, f64>> {
    static COUNTERS: OnceLock<Mutex<BTreeMap<String, f64>>> = OnceLock::new();
    COUNTERS.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Add `value` to the named counter, creating it at zero if absent.
pub fn inc(name: &str, value: f64) {
    let mut guard = counters().lock().expect("telemetry registry poisoned");
    *guard.entry(name.to_string()).or_insert(0.0) += value;
}

/// Set the named counter to an absolute value.
pub fn set_value(name: &str, value: f64) {
    let mut guard = counters().lock().expect("telemetry registry poisoned");
    guard.insert(name.to_string(), value);
}

/// Copy of all counters, sorted by name for deterministic serialization.
pub fn snapshot() -> BTreeMap<String, f64> {
    counters()
        .lock()
        .expect("telemetry registry poisoned")
        .clone()
}

/// Clear all counters. Called at the start of each run.
pub fn reset() {
    counters()
        .lock()
        .expect("telemetry registry poisoned")
        .clear();
}
