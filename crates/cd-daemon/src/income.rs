//! Realized income: an append-only window of samples and the exponentially
//! smoothed rate derived from it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use cd_core::config::IncomeConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum IncomeLogError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IncomeSample {
    pub timestamp: DateTime<Utc>,
    pub amount: f64,
}

/// Sliding window of income samples.
///
/// The smoothed rate is a pure function of the samples in the window, so a
/// tracker rebuilt from its serialized form reports exactly the same rate.
#[derive(Debug, Clone)]
pub struct IncomeTracker {
    samples: VecDeque<IncomeSample>,
    window: Duration,
    max_samples: usize,
    smoothing_secs: f64,
}

impl IncomeTracker {
    pub fn new(config: &IncomeConfig) -> Self {
        Self {
            samples: VecDeque::new(),
            window: Duration::seconds(config.window_secs as i64),
            max_samples: config.max_samples,
            smoothing_secs: config.smoothing_secs,
        }
    }

    /// Pick up window settings from a re-read config.
    pub fn apply_config(&mut self, config: &IncomeConfig) {
        self.window = Duration::seconds(config.window_secs as i64);
        self.max_samples = config.max_samples;
        self.smoothing_secs = config.smoothing_secs;
        self.trim_len();
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>, amount: f64) {
        self.samples.push_back(IncomeSample { timestamp, amount });
        let horizon = timestamp - self.window;
        while self
            .samples
            .front()
            .is_some_and(|s| s.timestamp < horizon)
        {
            self.samples.pop_front();
        }
        self.trim_len();
    }

    fn trim_len(&mut self) {
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &IncomeSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Income per second, smoothed with time constant `smoothing_secs`.
    ///
    /// Samples sharing a timestamp are summed first. Each gap between
    /// consecutive timestamps then yields an instantaneous rate
    /// `amount / gap`, and the first rate seeds the average.
    pub fn smoothed_rate(&self) -> f64 {
        let mut grouped: Vec<(DateTime<Utc>, f64)> = Vec::with_capacity(self.samples.len());
        for sample in &self.samples {
            match grouped.last_mut() {
                Some((ts, amount)) if *ts == sample.timestamp => *amount += sample.amount,
                _ => grouped.push((sample.timestamp, sample.amount)),
            }
        }

        let mut rate: Option<f64> = None;
        for pair in grouped.windows(2) {
            let (prev, _) = pair[0];
            let (ts, amount) = pair[1];
            let gap = (ts - prev).num_milliseconds() as f64 / 1000.0;
            if gap <= 0.0 {
                continue;
            }
            let instant = amount / gap;
            rate = Some(match rate {
                None => instant,
                Some(r) => {
                    let alpha = 1.0 - (-gap / self.smoothing_secs).exp();
                    r + alpha * (instant - r)
                }
            });
        }

        rate.unwrap_or(0.0)
    }

    pub fn serialize(&self) -> Result<String, IncomeLogError> {
        let samples: Vec<&IncomeSample> = self.samples.iter().collect();
        Ok(serde_json::to_string(&samples)?)
    }

    pub fn load(text: &str, config: &IncomeConfig) -> Result<Self, IncomeLogError> {
        let samples: Vec<IncomeSample> = serde_json::from_str(text)?;
        let mut tracker = Self::new(config);
        tracker.samples = samples.into();
        tracker.trim_len();
        Ok(tracker)
    }
}

// ---------------------------------------------------------------------------
// IncomeLog
// ---------------------------------------------------------------------------

/// The one file the income window is persisted to. Read once at startup,
/// rewritten wholesale after every cycle.
#[derive(Debug, Clone)]
pub struct IncomeLog {
    path: PathBuf,
}

impl IncomeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the tracker, or an empty one when no log exists yet.
    pub fn load(&self, config: &IncomeConfig) -> Result<IncomeTracker, IncomeLogError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no income log yet");
            return Ok(IncomeTracker::new(config));
        }
        let text = std::fs::read_to_string(&self.path)?;
        let tracker = IncomeTracker::load(&text, config)?;
        info!(path = %self.path.display(), samples = tracker.len(), "income log loaded");
        Ok(tracker)
    }

    pub fn save(&self, tracker: &IncomeTracker) -> Result<(), IncomeLogError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, tracker.serialize()?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> IncomeConfig {
        IncomeConfig {
            window_secs: 3_600,
            max_samples: 500,
            smoothing_secs: 30.0,
            ..IncomeConfig::default()
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn empty_and_single_sample_rate_is_zero() {
        let mut tracker = IncomeTracker::new(&config());
        assert_eq!(tracker.smoothed_rate(), 0.0);
        tracker.record(start(), 100.0);
        assert_eq!(tracker.smoothed_rate(), 0.0);
    }

    #[test]
    fn constant_stream_converges_to_amount_over_period() {
        let mut tracker = IncomeTracker::new(&config());
        // a burst first, then a steady 50 every 5s
        tracker.record(start(), 0.0);
        tracker.record(start() + Duration::seconds(1), 400.0);
        for i in 1..=200 {
            tracker.record(start() + Duration::seconds(1 + 5 * i), 50.0);
        }
        let rate = tracker.smoothed_rate();
        assert!((rate - 10.0).abs() < 0.01, "rate {rate} should approach 10/s");
    }

    #[test]
    fn same_timestamp_samples_are_summed() {
        let mut tracker = IncomeTracker::new(&config());
        tracker.record(start(), 0.0);
        tracker.record(start() + Duration::seconds(2), 10.0);
        tracker.record(start() + Duration::seconds(2), 10.0);
        tracker.record(start() + Duration::seconds(4), 20.0);
        assert!((tracker.smoothed_rate() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn window_and_length_are_bounded() {
        let mut cfg = config();
        cfg.window_secs = 60;
        cfg.max_samples = 5;
        let mut tracker = IncomeTracker::new(&cfg);
        for i in 0..10 {
            tracker.record(start() + Duration::seconds(i * 30), 1.0);
        }
        assert!(tracker.len() <= 3, "only samples within 60s survive");
        assert!(tracker
            .samples()
            .all(|s| s.timestamp >= start() + Duration::seconds(270) - Duration::seconds(60)));
    }

    #[test]
    fn serialize_then_load_keeps_rate() {
        let mut tracker = IncomeTracker::new(&config());
        for (i, amount) in [5.0, 80.0, 12.0, 40.0, 7.5].iter().enumerate() {
            tracker.record(start() + Duration::seconds(3 * i as i64), *amount);
        }
        let text = tracker.serialize().expect("serialize");
        let loaded = IncomeTracker::load(&text, &config()).expect("load");
        assert_eq!(loaded.len(), tracker.len());
        assert_eq!(loaded.smoothed_rate(), tracker.smoothed_rate());
    }

    #[test]
    fn log_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = IncomeLog::new(dir.path().join("nested").join("income.json"));

        let empty = log.load(&config()).expect("missing log is empty");
        assert!(empty.is_empty());

        let mut tracker = IncomeTracker::new(&config());
        tracker.record(start(), 1.0);
        tracker.record(start() + Duration::seconds(4), 8.0);
        log.save(&tracker).expect("save");

        let back = log.load(&config()).expect("load");
        assert_eq!(back.smoothed_rate(), 2.0);
    }
}
