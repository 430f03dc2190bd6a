// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Metrics sink adapter with a Prometheus text-format implementation

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Label set for one series, as `(name, value)` pairs.
pub type Labels<'a> = &'a [(&'a str, &'a str)];

/// Sink for counters, gauges, and histograms. Implementations must be safe
/// for concurrent accumulation.
pub trait MetricsSink: Send + Sync + 'static {
    fn inc_counter(&self, name: &'static str, labels: Labels<'_>, value: u64);
    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);
    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64);

    /// Exposition text for pull-based scraping. `None` when the sink has
    /// no pull surface (push-only or discarding sinks).
    fn render(&self) -> Option<String> {
        None
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn inc_counter(&self, _name: &'static str, _labels: Labels<'_>, _value: u64) {}
    fn set_gauge(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
    fn observe(&self, _name: &'static str, _labels: Labels<'_>, _value: f64) {}
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: &'static str,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &'static str, labels: Labels<'_>) -> Self {
        Self {
            name,
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.to_string();
        }
        let rendered: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
            .collect();
        format!("{}{{{}}}", self.name, rendered.join(","))
    }
}

#[derive(Debug, Default)]
struct HistogramSeries {
    buckets: Vec<(f64, u64)>,
    sum: f64,
    count: u64,
}

const DEFAULT_BUCKETS: [f64; 10] = [0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

#[derive(Debug, Default)]
struct Registry {
    counters: BTreeMap<SeriesKey, u64>,
    gauges: BTreeMap<SeriesKey, f64>,
    histograms: BTreeMap<SeriesKey, HistogramSeries>,
}

/// Accumulating sink that renders the Prometheus text exposition format.
#[derive(Default)]
pub struct PrometheusSink {
    registry: Mutex<Registry>,
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value, for assertions.
    pub fn counter_value(&self, name: &'static str, labels: Labels<'_>) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.registry.lock().counters.get(&key).copied().unwrap_or(0)
    }

    /// Current gauge value, for assertions.
    pub fn gauge_value(&self, name: &'static str, labels: Labels<'_>) -> Option<f64> {
        let key = SeriesKey::new(name, labels);
        self.registry.lock().gauges.get(&key).copied()
    }

    /// Histogram observation count, for assertions.
    pub fn histogram_count(&self, name: &'static str, labels: Labels<'_>) -> u64 {
        let key = SeriesKey::new(name, labels);
        self.registry.lock().histograms.get(&key).map(|h| h.count).unwrap_or(0)
    }
}

fn render_labels(key: &SeriesKey) -> String {
    if key.labels.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = key
        .labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('"', "\\\"")))
        .collect();
    format!("{{{}}}", rendered.join(","))
}

impl MetricsSink for PrometheusSink {
    fn inc_counter(&self, name: &'static str, labels: Labels<'_>, value: u64) {
        let key = SeriesKey::new(name, labels);
        *self.registry.lock().counters.entry(key).or_insert(0) += value;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let key = SeriesKey::new(name, labels);
        self.registry.lock().gauges.insert(key, value);
    }

    fn observe(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        let key = SeriesKey::new(name, labels);
        let mut registry = self.registry.lock();
        let histogram = registry.histograms.entry(key).or_insert_with(|| HistogramSeries {
            buckets: DEFAULT_BUCKETS.iter().map(|le| (*le, 0)).collect(),
            sum: 0.0,
            count: 0,
        });
        for (le, count) in histogram.buckets.iter_mut() {
            if value <= *le {
                *count += 1;
                break;
            }
        }
        histogram.sum += value;
        histogram.count += 1;
    }

    /// Render all series in exposition format.
    fn render(&self) -> Option<String> {
        let registry = self.registry.lock();
        let mut out = String::new();
        for (key, value) in &registry.counters {
            out.push_str(&format!("{} {}\n", key.render(), value));
        }
        for (key, value) in &registry.gauges {
            out.push_str(&format!("{} {}\n", key.render(), value));
        }
        for (key, histogram) in &registry.histograms {
            let mut cumulative = 0;
            for (le, count) in &histogram.buckets {
                cumulative += count;
                let mut bucket_key = key.clone();
                bucket_key.labels.push(("le".to_string(), le.to_string()));
                out.push_str(&format!("{}_bucket{} {}\n", key.name, render_labels(&bucket_key),
                    cumulative));
            }
            out.push_str(&format!("{}_sum{} {}\n", key.name, render_labels(key), histogram.sum));
            out.push_str(&format!("{}_count{} {}\n", key.name, render_labels(key),
                histogram.count));
        }
        Some(out)
    }
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
