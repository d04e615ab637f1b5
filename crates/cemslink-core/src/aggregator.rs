//! Window accumulation and averaging of sensor readings.
//!
//! Sources append [`Reading`]s into the current [`SampleWindow`]; at each
//! dispatch boundary the orchestrator calls [`SampleAggregator::flush`],
//! which swaps the window out under the lock and computes per-parameter
//! means outside it.
//!
//! Window invariant: every reading counted in a flush was captured in
//! `[window_start, flush_end)`. Readings captured before the current window
//! started arrive too late to be counted and are dropped (and counted in
//! [`SampleAggregator::late_readings`]); readings captured at or after the
//! flush boundary are carried into the next window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::source::Reading;

/// Decimal places kept in averaged values.
pub const AVERAGE_DECIMALS: i32 = 2;

/// Mean of one parameter over one window.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedValue {
    /// Arithmetic mean rounded to [`AVERAGE_DECIMALS`], half away from zero.
    pub value: f64,
    /// Unit of the most recent reading in the window.
    pub unit: String,
    /// Number of readings that contributed.
    pub samples: usize,
}

/// Per-parameter averages produced by one flush, ordered by parameter name.
///
/// A parameter with no readings in the window is absent, never carried
/// forward from an earlier window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AveragedSet {
    values: BTreeMap<String, AveragedValue>,
}

impl AveragedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, parameter: impl Into<String>, value: AveragedValue) {
        self.values.insert(parameter.into(), value);
    }

    pub fn get(&self, parameter: &str) -> Option<&AveragedValue> {
        self.values.get(parameter)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AveragedValue)> {
        self.values.iter()
    }

    /// Total readings across all parameters.
    pub fn total_samples(&self) -> usize {
        self.values.values().map(|v| v.samples).sum()
    }
}

impl FromIterator<(String, AveragedValue)> for AveragedSet {
    fn from_iter<I: IntoIterator<Item = (String, AveragedValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Readings collected since the last flush.
#[derive(Debug)]
struct SampleWindow {
    start: DateTime<Utc>,
    readings: HashMap<String, Vec<Reading>>,
}

/// Thread-safe accumulator of readings between dispatch boundaries.
pub struct SampleAggregator {
    window: Mutex<SampleWindow>,
    late_readings: AtomicU64,
}

impl SampleAggregator {
    /// Create an aggregator whose first window opens at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            window: Mutex::new(SampleWindow {
                start,
                readings: HashMap::new(),
            }),
            late_readings: AtomicU64::new(0),
        }
    }

    /// Append one reading to the current window.
    ///
    /// Returns `false` if the reading was captured before the window opened
    /// and was therefore dropped.
    pub fn add_reading(&self, reading: Reading) -> bool {
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        if reading.captured_at < window.start {
            drop(window);
            self.late_readings.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "dropping late reading for {} captured at {}",
                reading.parameter,
                reading.captured_at
            );
            return false;
        }
        window
            .readings
            .entry(reading.parameter.clone())
            .or_default()
            .push(reading);
        true
    }

    /// Append a batch of readings, returning how many were accepted.
    pub fn add_readings(&self, readings: impl IntoIterator<Item = Reading>) -> usize {
        readings
            .into_iter()
            .filter(|r| r.value.is_finite())
            .map(|r| self.add_reading(r))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Close the current window at `end` and return its averages.
    ///
    /// The lock is held only to swap the window out; averaging happens on the
    /// detached snapshot. Readings captured at or after `end` are returned to
    /// the new window.
    pub fn flush(&self, end: DateTime<Utc>) -> AveragedSet {
        let snapshot = {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            if end > window.start {
                window.start = end;
            }
            std::mem::take(&mut window.readings)
        };

        let mut averaged = AveragedSet::new();
        let mut carried: Vec<Reading> = Vec::new();

        for (parameter, readings) in snapshot {
            let (inside, after): (Vec<Reading>, Vec<Reading>) =
                readings.into_iter().partition(|r| r.captured_at < end);
            carried.extend(after);

            let Some(last) = inside.last() else {
                continue;
            };
            let sum: f64 = inside.iter().map(|r| r.value).sum();
            let mean = sum / inside.len() as f64;
            averaged.insert(
                parameter,
                AveragedValue {
                    value: round_half_away_from_zero(mean, AVERAGE_DECIMALS),
                    unit: last.unit.clone(),
                    samples: inside.len(),
                },
            );
        }

        if !carried.is_empty() {
            let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
            for reading in carried {
                window
                    .readings
                    .entry(reading.parameter.clone())
                    .or_default()
                    .push(reading);
            }
        }

        averaged
    }

    /// Readings per parameter waiting in the current window.
    pub fn pending_counts(&self) -> BTreeMap<String, usize> {
        let window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window
            .readings
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect()
    }

    /// Start of the current window.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.window.lock().unwrap_or_else(|e| e.into_inner()).start
    }

    /// Readings dropped because they were captured before their window opened.
    pub fn late_readings(&self) -> u64 {
        self.late_readings.load(Ordering::Relaxed)
    }
}

/// Round to `decimals` places, halves away from zero.
///
/// Values whose binary representation lands within float noise of a half
/// step (e.g. `2.675`, stored as `2.67499999…`) are treated as the half step,
/// so the result matches decimal rounding of the printed value.
pub fn round_half_away_from_zero(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    let nudged = if (scaled.abs().fract() - 0.5).abs() < 1e-9 {
        scaled.trunc() + 0.5 * scaled.signum()
    } else {
        scaled
    };
    nudged.round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_225_600 + secs, 0).unwrap()
    }

    fn reading(param: &str, value: f64, at: i64) -> Reading {
        Reading::new(param, value, "mg/Nm3", t(at))
    }

    #[test]
    fn test_flush_averages_readings() {
        let agg = SampleAggregator::new(t(0));
        for (i, v) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            assert!(agg.add_reading(reading("pm10", v, i as i64)));
        }
        let set = agg.flush(t(60));
        let pm10 = set.get("pm10").unwrap();
        assert_eq!(pm10.value, 20.00);
        assert_eq!(pm10.samples, 3);
        assert_eq!(pm10.unit, "mg/Nm3");
    }

    #[test]
    fn test_flush_empty_window_yields_empty_set() {
        let agg = SampleAggregator::new(t(0));
        assert!(agg.flush(t(60)).is_empty());
    }

    #[test]
    fn test_flush_clears_window_without_carry_forward() {
        let agg = SampleAggregator::new(t(0));
        agg.add_reading(reading("so2", 4.0, 1));
        agg.add_reading(reading("nox", 9.0, 2));
        let first = agg.flush(t(60));
        assert_eq!(first.len(), 2);

        agg.add_reading(reading("so2", 6.0, 61));
        let second = agg.flush(t(120));
        assert_eq!(second.len(), 1);
        assert!(second.get("nox").is_none(), "nox must not carry forward");
        assert_eq!(second.get("so2").unwrap().value, 6.0);
    }

    #[test]
    fn test_late_reading_is_dropped() {
        let agg = SampleAggregator::new(t(0));
        agg.flush(t(60));
        assert!(!agg.add_reading(reading("ph", 7.0, 59)));
        assert_eq!(agg.late_readings(), 1);
        assert!(agg.pending_counts().is_empty());
    }

    #[test]
    fn test_reading_after_boundary_carries_into_next_window() {
        let agg = SampleAggregator::new(t(0));
        agg.add_reading(reading("ph", 7.0, 30));
        agg.add_reading(reading("ph", 9.0, 61));
        let first = agg.flush(t(60));
        assert_eq!(first.get("ph").unwrap().samples, 1);
        assert_eq!(first.get("ph").unwrap().value, 7.0);
        assert_eq!(agg.pending_counts().get("ph"), Some(&1));
        assert_eq!(agg.window_start(), t(60));

        let second = agg.flush(t(120));
        assert_eq!(second.get("ph").unwrap().value, 9.0);
    }

    #[test]
    fn test_window_start_never_moves_backwards() {
        let agg = SampleAggregator::new(t(120));
        agg.flush(t(60));
        assert_eq!(agg.window_start(), t(120));
    }

    #[test]
    fn test_non_finite_values_are_ignored() {
        let agg = SampleAggregator::new(t(0));
        let accepted = agg.add_readings(vec![
            reading("ph", f64::NAN, 1),
            reading("ph", 7.5, 2),
            reading("ph", f64::INFINITY, 3),
        ]);
        assert_eq!(accepted, 1);
        assert_eq!(agg.flush(t(60)).get("ph").unwrap().value, 7.5);
    }

    #[test]
    fn test_round_half_away_from_zero() {
        assert_eq!(round_half_away_from_zero(1.005, 2), 1.01);
        assert_eq!(round_half_away_from_zero(2.675, 2), 2.68);
        assert_eq!(round_half_away_from_zero(-2.675, 2), -2.68);
        assert_eq!(round_half_away_from_zero(0.125, 2), 0.13);
        assert_eq!(round_half_away_from_zero(3.14159, 2), 3.14);
        assert_eq!(round_half_away_from_zero(-0.004, 2), 0.0);
        assert_eq!(round_half_away_from_zero(20.0, 2), 20.0);
    }

    #[test]
    fn test_mean_is_rounded() {
        let agg = SampleAggregator::new(t(0));
        agg.add_reading(reading("co", 1.0, 1));
        agg.add_reading(reading("co", 2.0, 2));
        agg.add_reading(reading("co", 2.0, 3));
        assert_eq!(agg.flush(t(60)).get("co").unwrap().value, 1.67);
    }

    #[test]
    fn test_concurrent_add_and_flush_loses_nothing() {
        let agg = Arc::new(SampleAggregator::new(t(0)));
        let writers: Vec<_> = (0..4)
            .map(|w| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        agg.add_reading(Reading::new(
                            format!("p{w}"),
                            1.0,
                            "u",
                            t(1) + Duration::milliseconds(i),
                        ));
                    }
                })
            })
            .collect();

        // Boundaries far in the future: every reading lands in some flush.
        let mut counted = 0usize;
        for k in 0..20 {
            counted += agg.flush(t(10_000 + k)).total_samples();
        }
        for w in writers {
            w.join().unwrap();
        }
        counted += agg.flush(t(20_000)).total_samples();
        assert_eq!(counted, 4 * 500);
    }
}
