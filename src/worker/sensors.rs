//! Environmental readings kept by a worker agent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

pub const DEFAULT_READING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub gas_resistance: f64,
    pub air_quality_index: f64,
}

impl SensorReading {
    /// Builds a reading, deriving the air quality index from gas resistance.
    pub fn new(
        timestamp: DateTime<Utc>,
        temperature: f64,
        humidity: f64,
        pressure: f64,
        gas_resistance: f64,
    ) -> Self {
        Self {
            timestamp,
            temperature,
            humidity,
            pressure,
            gas_resistance,
            air_quality_index: air_quality_index(gas_resistance),
        }
    }
}

/// Coarse 1 (excellent) to 5 (very poor) index from gas resistance in ohms.
pub fn air_quality_index(gas_resistance: f64) -> f64 {
    if gas_resistance > 50_000.0 {
        1.0
    } else if gas_resistance > 20_000.0 {
        2.0
    } else if gas_resistance > 10_000.0 {
        3.0
    } else if gas_resistance > 5_000.0 {
        4.0
    } else {
        5.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorAverages {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub air_quality_index: f64,
}

/// Summary of recent readings handed to the task executor as context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSummary {
    pub window_minutes: i64,
    pub sample_count: usize,
    pub averages: SensorAverages,
    pub latest: SensorReading,
}

/// Source of readings for `/sensor_data` and execution context.
pub trait SensorFeed: Send + Sync {
    /// Newest `limit` readings, oldest first.
    fn recent(&self, limit: usize) -> Vec<SensorReading>;

    fn count(&self) -> usize;

    fn summary(&self, window: Duration, now: DateTime<Utc>) -> Option<SensorSummary>;
}

/// Bounded in-memory feed. The oldest reading is dropped once full.
#[derive(Debug)]
pub struct RecordedSensorFeed {
    readings: Mutex<VecDeque<SensorReading>>,
    capacity: usize,
}

impl Default for RecordedSensorFeed {
    fn default() -> Self {
        Self::new(DEFAULT_READING_CAPACITY)
    }
}

impl RecordedSensorFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            readings: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_READING_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, reading: SensorReading) {
        let mut readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        if readings.len() == self.capacity {
            readings.pop_front();
        }
        readings.push_back(reading);
    }
}

impl SensorFeed for RecordedSensorFeed {
    fn recent(&self, limit: usize) -> Vec<SensorReading> {
        let readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        let skip = readings.len().saturating_sub(limit);
        readings.iter().skip(skip).copied().collect()
    }

    fn count(&self) -> usize {
        self.readings.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn summary(&self, window: Duration, now: DateTime<Utc>) -> Option<SensorSummary> {
        let readings = self.readings.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = now - window;
        let recent: Vec<&SensorReading> = readings.iter().filter(|r| r.timestamp > cutoff).collect();
        let latest = **recent.last()?;

        let n = recent.len() as f64;
        let mean = |f: fn(&SensorReading) -> f64| recent.iter().map(|r| f(r)).sum::<f64>() / n;
        Some(SensorSummary {
            window_minutes: window.num_minutes(),
            sample_count: recent.len(),
            averages: SensorAverages {
                temperature: mean(|r| r.temperature),
                humidity: mean(|r| r.humidity),
                pressure: mean(|r| r.pressure),
                air_quality_index: mean(|r| r.air_quality_index),
            },
            latest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(at: DateTime<Utc>, temperature: f64) -> SensorReading {
        SensorReading::new(at, temperature, 40.0, 1013.0, 30_000.0)
    }

    #[test]
    fn air_quality_index_steps_down_with_resistance() {
        assert_eq!(air_quality_index(60_000.0), 1.0);
        assert_eq!(air_quality_index(25_000.0), 2.0);
        assert_eq!(air_quality_index(15_000.0), 3.0);
        assert_eq!(air_quality_index(6_000.0), 4.0);
        assert_eq!(air_quality_index(1_000.0), 5.0);
    }

    #[test]
    fn feed_is_bounded_and_keeps_newest() {
        let feed = RecordedSensorFeed::new(3);
        let now = Utc::now();
        for i in 0..5 {
            feed.record(reading(now, i as f64));
        }

        assert_eq!(feed.count(), 3);
        let temps: Vec<f64> = feed.recent(10).iter().map(|r| r.temperature).collect();
        assert_eq!(temps, vec![2.0, 3.0, 4.0]);
        assert_eq!(feed.recent(1)[0].temperature, 4.0);
    }

    #[test]
    fn summary_ignores_readings_outside_window() {
        let feed = RecordedSensorFeed::default();
        let now = Utc::now();
        feed.record(reading(now - Duration::minutes(30), 100.0));
        feed.record(reading(now - Duration::minutes(2), 20.0));
        feed.record(reading(now - Duration::minutes(1), 22.0));

        let summary = feed.summary(Duration::minutes(10), now).unwrap();
        assert_eq!(summary.sample_count, 2);
        assert_eq!(summary.averages.temperature, 21.0);
        assert_eq!(summary.latest.temperature, 22.0);
        assert_eq!(summary.averages.air_quality_index, 2.0);
    }

    #[test]
    fn summary_of_empty_feed_is_none() {
        let feed = RecordedSensorFeed::default();
        assert!(feed.summary(Duration::minutes(10), Utc::now()).is_none());
    }
}
