//! Statistics collectors.
//!
//! The core reports events through the [`StatsSink`] trait; the sink is
//! optional and queries pay nothing when none is installed. A process-wide
//! [`Registry`] backed implementation is provided for the CLI.

// std
use std::collections::BTreeMap;
use std::fmt::Write as _;
// others
use lazy_static::lazy_static;
use parking_lot::Mutex;

/// Receiver for statistics events. All methods must be cheap and thread-safe.
pub trait StatsSink: Send + Sync {
    /// Adds to a scalar counter.
    fn counter_add(&self, name: &'static str, value: u64);
    /// Records `count` occurrences of `category` under an event counter.
    fn event(&self, name: &'static str, labels: &'static [&'static str], category: usize, count: u64);
    /// Increments the histogram bucket holding `value`.
    fn histogram(&self, name: &'static str, value: u64);
}

#[derive(Debug, Default, Clone)]
struct EventCounter {
    labels: Vec<&'static str>,
    counts: Vec<u64>,
}

#[derive(Debug, Default, Clone)]
struct Histogram {
    /// power-of-two buckets; bucket i holds values in [2^i, 2^(i+1))
    buckets: Vec<u64>,
    total: u64,
}

impl Histogram {
    fn record(&mut self, value: u64) {
        let bucket = (64 - value.leading_zeros()) as usize;
        if self.buckets.len() <= bucket {
            self.buckets.resize(bucket + 1, 0);
        }
        self.buckets[bucket] = self.buckets[bucket].saturating_add(1);
        self.total = self.total.saturating_add(value);
    }
}

#[derive(Default)]
struct RegistryInner {
    counters: BTreeMap<&'static str, u64>,
    events: BTreeMap<&'static str, EventCounter>,
    histograms: BTreeMap<&'static str, Histogram>,
}

/// A process-wide statistics registry. Counters saturate instead of wrapping.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

lazy_static! {
    static ref GLOBAL_REGISTRY: Registry = Registry::default();
}

impl Registry {
    pub fn global() -> &'static Registry {
        &GLOBAL_REGISTRY
    }

    pub fn reset(&self) {
        *self.inner.lock() = RegistryInner::default();
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        *self.inner.lock().counters.get(name).unwrap_or(&0)
    }

    pub fn event_total(&self, name: &str) -> u64 {
        self.inner
            .lock()
            .events
            .get(name)
            .map(|e| e.counts.iter().fold(0_u64, |a, c| a.saturating_add(*c)))
            .unwrap_or(0)
    }

    /// Renders all collectors as a human-readable report.
    pub fn report(&self) -> String {
        let inner = self.inner.lock();
        let mut out = String::new();
        for (name, v) in &inner.counters {
            let _ = writeln!(out, "  {:<40} {:>12}", name, v);
        }
        for (name, e) in &inner.events {
            let _ = write!(out, "  {:<40}", name);
            for (label, count) in e.labels.iter().zip(e.counts.iter()) {
                let _ = write!(out, " {}: {}", label, count);
            }
            let _ = writeln!(out);
        }
        for (name, h) in &inner.histograms {
            let _ = write!(out, "  {:<40} total {:>12} |", name, h.total);
            for (i, b) in h.buckets.iter().enumerate() {
                if *b > 0 {
                    let _ = write!(out, " <2^{}: {}", i, b);
                }
            }
            let _ = writeln!(out);
        }
        out
    }
}

impl StatsSink for Registry {
    fn counter_add(&self, name: &'static str, value: u64) {
        let mut inner = self.inner.lock();
        let c = inner.counters.entry(name).or_insert(0);
        *c = c.saturating_add(value);
    }

    fn event(
        &self,
        name: &'static str,
        labels: &'static [&'static str],
        category: usize,
        count: u64,
    ) {
        let mut inner = self.inner.lock();
        let e = inner.events.entry(name).or_insert_with(|| EventCounter {
            labels: labels.to_vec(),
            counts: vec![0; labels.len()],
        });
        if category < e.counts.len() {
            e.counts[category] = e.counts[category].saturating_add(count);
        }
    }

    fn histogram(&self, name: &'static str, value: u64) {
        let mut inner = self.inner.lock();
        inner.histograms.entry(name).or_default().record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_saturate() {
        let r = Registry::default();
        r.counter_add("c", u64::max_value() - 1);
        r.counter_add("c", 10);
        assert_eq!(r.counter_value("c"), u64::max_value());
    }

    #[test]
    fn events_and_histograms_accumulate() {
        let r = Registry::default();
        static LABELS: [&str; 3] = ["hit", "miss", "esc"];
        r.event("casts", &LABELS, 0, 2);
        r.event("casts", &LABELS, 1, 1);
        assert_eq!(r.event_total("casts"), 3);
        r.histogram("tris", 5);
        r.histogram("tris", 100);
        let report = r.report();
        assert!(report.contains("casts"));
        assert!(report.contains("tris"));
    }
}
