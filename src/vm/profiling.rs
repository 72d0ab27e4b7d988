//=====================================================
// File: vm/profiling.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Lightweight execution statistics for one run
// Objective: Count dispatched instructions, calls per function and garbage
//            collections, and time the run as a whole
//=====================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Coarse timing and counters for a single `Vm::run`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunProfile {
    #[serde(skip)]
    start: Option<Instant>,
    pub total_duration: Option<Duration>,
    pub steps: u64,
    pub collections: usize,
    pub objects_freed: usize,
    pub hot_functions: HotFunctionTable,
}

impl RunProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        *self = Self {
            start: Some(Instant::now()),
            ..Self::default()
        };
    }

    pub fn end(&mut self) {
        if let Some(started) = self.start.take() {
            self.total_duration = Some(started.elapsed());
        }
    }

    pub fn record_function(&mut self, name: &str) -> u64 {
        self.hot_functions.record_call(name)
    }

    pub fn record_collection(&mut self, freed: usize) {
        self.collections += 1;
        self.objects_freed += freed;
    }
}

/// Call counts per function name.
#[derive(Clone, Debug, Serialize)]
pub struct HotFunctionTable {
    pub threshold: u64,
    hits: HashMap<String, u64>,
}

impl HotFunctionTable {
    pub const DEFAULT_HOT_THRESHOLD: u64 = 50;

    pub fn new() -> Self {
        Self {
            threshold: Self::DEFAULT_HOT_THRESHOLD,
            hits: HashMap::new(),
        }
    }

    pub fn record_call(&mut self, name: &str) -> u64 {
        let counter = self.hits.entry(name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn calls(&self, name: &str) -> u64 {
        self.hits.get(name).copied().unwrap_or(0)
    }

    pub fn is_hot(&self, name: &str) -> bool {
        self.calls(name) >= self.threshold.max(1)
    }

    /// Functions ordered by call count, most called first.
    pub fn ranked(&self) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> = self.hits.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked
    }
}

impl Default for HotFunctionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_threshold() {
        let mut table = HotFunctionTable::new();
        table.threshold = 2;
        table.record_call("fib");
        assert!(!table.is_hot("fib"));
        table.record_call("fib");
        table.record_call("main");
        assert!(table.is_hot("fib"));
        assert_eq!(table.ranked()[0], ("fib", 2));
    }

    #[test]
    fn begin_resets_counters() {
        let mut profile = RunProfile::new();
        profile.steps = 10;
        profile.record_collection(3);
        profile.begin();
        assert_eq!((profile.steps, profile.collections), (0, 0));
        profile.end();
        assert!(profile.total_duration.is_some());
    }
}
