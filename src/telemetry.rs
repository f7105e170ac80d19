use std::collections::BTreeMap;

/// Namespaced counter and gauge registry. The agent folds its own counters
/// and those of the serializer and spill queue into one registry so the
/// periodic snapshot log line has everything in one place.
#[derive(Debug)]
pub struct MetricsRegistry {
    namespace: String,
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: BTreeMap::new(),
            gauges: BTreeMap::new(),
        }
    }

    pub fn inc_counter(&mut self, name: impl Into<String>, delta: u64) -> u64 {
        let key = self.qualify(name.into());
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_gauge(&mut self, name: impl Into<String>, value: u64) {
        let key = self.qualify(name.into());
        self.gauges.insert(key, value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(&self.qualify(name.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
        }
    }

    fn qualify(&self, name: String) -> String {
        let namespace = if self.namespace.ends_with('.') {
            self.namespace.clone()
        } else {
            format!("{}.", self.namespace)
        };
        if name.starts_with(&namespace) {
            name
        } else {
            format!("{}{}", namespace, name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Single-line `key=value` rendering for the periodic snapshot log.
    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.counters.len() + self.gauges.len());
        for (key, value) in self.counters.iter().chain(self.gauges.iter()) {
            parts.push(format!("{key}={value}"));
        }
        parts.join(" ")
    }
}
