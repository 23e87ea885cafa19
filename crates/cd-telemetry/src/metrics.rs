use ahash::AHashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const BATCHES_DISPATCHED: &str = "cadence_batches_dispatched_total";
pub const BATCHES_LANDED: &str = "cadence_batches_landed_total";
pub const BATCHES_DESYNCED: &str = "cadence_batches_desynced_total";
pub const BATCHES_UNPLACED: &str = "cadence_batches_unplaced_total";
pub const OPS_DISPATCHED: &str = "cadence_ops_dispatched_total";
pub const OPS_REJECTED: &str = "cadence_ops_rejected_total";
pub const CYCLES: &str = "cadence_cycles_total";
pub const OUTSTANDING_BATCHES: &str = "cadence_outstanding_batches";
pub const INCOME_PER_SEC: &str = "cadence_income_per_second";
pub const CYCLE_DURATION: &str = "cadence_cycle_duration_seconds";

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Cumulative-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum stored as bits
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        for (i, boundary) in self.buckets.iter().enumerate() {
            if value <= *boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

fn cycle_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type CounterKey = (String, Vec<(String, String)>);

/// Process-wide counters, gauges and histograms.
///
/// The engine loop is single-threaded, but the collector is shared with
/// whatever exports it, so values live behind atomics.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<CounterKey, AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicU64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

fn counter_key(name: &str, labels: &[(&str, &str)]) -> CounterKey {
    let mut pairs: Vec<(String, String)> = labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    pairs.sort();
    (name.to_string(), pairs)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector with the cycle-duration histogram pre-registered.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        collector
            .histograms
            .write()
            .expect("metrics lock poisoned")
            .insert(
                CYCLE_DURATION.to_string(),
                Histogram::new(cycle_duration_buckets()),
            );
        collector
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        if amount == 0 {
            return;
        }
        let key = counter_key(name, labels);
        {
            let map = self.counters.read().expect("metrics lock poisoned");
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().expect("metrics lock poisoned");
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = counter_key(name, labels);
        self.counters
            .read()
            .expect("metrics lock poisoned")
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn set_gauge(&self, name: &str, value: f64) {
        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            if let Some(g) = map.get(name) {
                g.store(value.to_bits(), Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().expect("metrics lock poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> f64 {
        self.gauges
            .read()
            .expect("metrics lock poisoned")
            .get(name)
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        let mut map = self.histograms.write().expect("metrics lock poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(cycle_duration_buckets()))
            .observe(value);
    }

    /// Export all metrics in Prometheus text exposition format, sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().expect("metrics lock poisoned");
            let mut entries: Vec<(&CounterKey, u64)> = map
                .iter()
                .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut last_name: Option<&str> = None;
            for ((name, labels), value) in entries {
                if last_name != Some(name.as_str()) {
                    let _ = writeln!(out, "# TYPE {name} counter");
                    last_name = Some(name.as_str());
                }
                let _ = writeln!(out, "{name}{} {value}", render_labels(labels));
            }
        }

        {
            let map = self.gauges.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let value = f64::from_bits(map[name].load(Ordering::Relaxed));
                let _ = writeln!(out, "# TYPE {name} gauge");
                let _ = writeln!(out, "{name} {value}");
            }
        }

        {
            let map = self.histograms.read().expect("metrics lock poisoned");
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                let _ = writeln!(out, "# TYPE {name} histogram");
                for (i, boundary) in h.buckets.iter().enumerate() {
                    let count = h.counts[i].load(Ordering::Relaxed);
                    let _ = writeln!(out, "{name}_bucket{{le=\"{boundary}\"}} {count}");
                }
                let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", h.count());
                let _ = writeln!(out, "{name}_sum {}", h.sum());
                let _ = writeln!(out, "{name}_count {}", h.count());
            }
        }

        out
    }
}

fn render_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect();
    format!("{{{}}}", inner.join(","))
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// Returns the process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter(BATCHES_LANDED, &[("target", "alpha")]);
        m.increment_counter(BATCHES_LANDED, &[("target", "alpha")]);
        m.increment_counter(BATCHES_LANDED, &[("target", "beta")]);

        assert_eq!(m.get_counter(BATCHES_LANDED, &[("target", "alpha")]), 2);
        assert_eq!(m.get_counter(BATCHES_LANDED, &[("target", "beta")]), 1);
        assert_eq!(m.get_counter(BATCHES_LANDED, &[]), 0);
    }

    #[test]
    fn gauges_hold_floats() {
        let m = MetricsCollector::new();
        m.set_gauge(INCOME_PER_SEC, 12.5);
        assert_eq!(m.get_gauge(INCOME_PER_SEC), 12.5);
        m.set_gauge(INCOME_PER_SEC, 3.0);
        assert_eq!(m.get_gauge(INCOME_PER_SEC), 3.0);
    }

    #[test]
    fn histogram_tracks_sum_and_count() {
        let m = MetricsCollector::with_defaults();
        m.record_histogram(CYCLE_DURATION, 0.002);
        m.record_histogram(CYCLE_DURATION, 0.2);

        let text = m.export_prometheus();
        assert!(text.contains("# TYPE cadence_cycle_duration_seconds histogram"));
        assert!(text.contains("cadence_cycle_duration_seconds_count 2"));
        assert!(text.contains("cadence_cycle_duration_seconds_bucket{le=\"0.005\"} 1"));
    }

    #[test]
    fn prometheus_export_groups_counter_families() {
        let m = MetricsCollector::new();
        m.increment_counter(OPS_REJECTED, &[("kind", "extract")]);
        m.increment_counter(OPS_REJECTED, &[("kind", "restore")]);

        let text = m.export_prometheus();
        assert_eq!(text.matches("# TYPE cadence_ops_rejected_total counter").count(), 1);
        assert!(text.contains("cadence_ops_rejected_total{kind=\"extract\"} 1"));
    }
}
