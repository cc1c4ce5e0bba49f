//! Counter time series with trailing-window rate averages.
//!
//! Controller counters are cumulative totals since the controller last
//! booted, so the average rate over any window is fully determined by the
//! two samples at its ends. Interior samples are kept only so windows of
//! different lengths can be answered from the same buffer.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Errors returned by [`RateSeries`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    /// A rate needs two points.
    #[error("need at least two samples to compute a rate, have {have}")]
    InsufficientData { have: usize },

    #[error("sample index {index} out of range for series of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// The new sample is not later than the newest one already stored.
    #[error("sample timestamp does not advance past the newest sample")]
    OutOfOrder,
}

/// One counter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub value: u64,
    pub timestamp: Instant,
}

/// Result of [`RateSeries::average`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Average {
    /// Units per second between the two end samples.
    pub rate: f64,
    /// Time actually covered. Differs from the requested span because
    /// samples only exist at the polling cadence.
    pub span: Duration,
    /// The newer end sample is lower than the older one, i.e. the counter
    /// was reset (controller reboot or wrap) inside the window. `rate` is
    /// still the absolute difference and should be treated as approximate.
    pub counter_reset: bool,
}

/// Ordered, optionally bounded sequence of counter samples.
#[derive(Debug, Clone)]
pub struct RateSeries {
    samples: VecDeque<Sample>,
    capacity: Option<usize>,
}

impl RateSeries {
    /// Create an empty series. `None` means unbounded.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.unwrap_or(0)),
            capacity,
        }
    }

    /// Record `value` at the current instant.
    pub fn append(&mut self, value: u64) -> Result<(), SeriesError> {
        self.append_at(value, Instant::now())
    }

    /// Record `value` at `timestamp`, evicting the oldest samples if the
    /// series is over capacity.
    pub fn append_at(&mut self, value: u64, timestamp: Instant) -> Result<(), SeriesError> {
        if let Some(newest) = self.samples.back() {
            if timestamp <= newest.timestamp {
                return Err(SeriesError::OutOfOrder);
            }
        }

        self.samples.push_back(Sample { value, timestamp });

        if let Some(capacity) = self.capacity {
            while self.samples.len() > capacity {
                self.samples.pop_front();
            }
        }

        Ok(())
    }

    /// Average rate over roughly the last `span`.
    ///
    /// The older end of the window is the sample whose timestamp is closest
    /// to `newest - span`. A span shorter than the sampling interval falls
    /// back to the two newest samples rather than dividing by zero.
    pub fn average(&self, span: Duration) -> Result<Average, SeriesError> {
        let len = self.samples.len();
        if len < 2 {
            return Err(SeriesError::InsufficientData { have: len });
        }

        let last_index = len - 1;
        let last = self.samples[last_index];

        let mut first_index = match last.timestamp.checked_sub(span) {
            Some(target) => self.closest_index(target),
            None => 0,
        };
        if first_index == last_index {
            first_index = last_index - 1;
        }
        let first = self.samples[first_index];

        let elapsed = last.timestamp - first.timestamp;
        let delta = last.value.abs_diff(first.value);

        Ok(Average {
            rate: delta as f64 / elapsed.as_secs_f64(),
            span: elapsed,
            counter_reset: last.value < first.value,
        })
    }

    /// Binary search for the sample nearest to `target`. Requires at least
    /// two samples.
    fn closest_index(&self, target: Instant) -> usize {
        let mut min_index = 0;
        let mut max_index = self.samples.len() - 1;

        // Narrow down to the two samples bracketing the target
        while max_index - min_index > 1 {
            let mid = (min_index + max_index) / 2;
            let t = self.samples[mid].timestamp;
            if t < target {
                min_index = mid;
            } else if t > target {
                max_index = mid;
            } else {
                return mid;
            }
        }

        let below = target.saturating_duration_since(self.samples[min_index].timestamp);
        let above = self.samples[max_index]
            .timestamp
            .saturating_duration_since(target);
        if below < above {
            min_index
        } else {
            max_index
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Sample at `index`, oldest first.
    pub fn get(&self, index: usize) -> Result<Sample, SeriesError> {
        self.samples
            .get(index)
            .copied()
            .ok_or(SeriesError::IndexOutOfRange {
                index,
                len: self.samples.len(),
            })
    }

    /// Newest sample, if any.
    pub fn latest(&self) -> Option<Sample> {
        self.samples.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    /// Drop every sample.
    pub fn flush(&mut self) {
        self.samples.clear();
    }
}

impl Default for RateSeries {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Series with one sample every `step` seconds, value growing by
    /// `per_step` each time.
    fn uniform(count: usize, step: u64, per_step: u64, capacity: Option<usize>) -> (RateSeries, Instant) {
        let start = Instant::now();
        let mut series = RateSeries::new(capacity);
        for i in 0..count as u64 {
            series
                .append_at(1000 + i * per_step, start + Duration::from_secs(i * step))
                .unwrap();
        }
        (series, start)
    }

    #[test]
    fn empty_and_single_sample_have_no_rate() {
        let mut series = RateSeries::new(Some(10));
        assert_eq!(
            series.average(Duration::from_secs(5)),
            Err(SeriesError::InsufficientData { have: 0 })
        );

        series.append(42).unwrap();
        assert_eq!(
            series.average(Duration::from_secs(5)),
            Err(SeriesError::InsufficientData { have: 1 })
        );
    }

    #[test]
    fn constant_rate_over_any_span() {
        // 50 units every 2s = 25/s
        let (series, _) = uniform(30, 2, 50, None);
        for span in [2, 4, 7, 10, 33, 58] {
            let avg = series.average(Duration::from_secs(span)).unwrap();
            assert!((avg.rate - 25.0).abs() < 1e-9, "span {span}: {}", avg.rate);
            assert!(!avg.counter_reset);
        }
    }

    #[test]
    fn picks_the_sample_closest_to_the_window_start() {
        let start = Instant::now();
        let mut series = RateSeries::new(None);
        // Irregular spacing and rate so the chosen endpoint matters
        let points = [(0u64, 0u64), (3, 30), (4, 70), (9, 90), (12, 300), (20, 1000)];
        for (t, v) in points {
            series.append_at(v, start + Duration::from_secs(t)).unwrap();
        }

        for span in [1u64, 5, 8, 10, 15, 17, 20] {
            let target = 20i64 - span as i64;
            let (t_k, v_k) = points
                .iter()
                .copied()
                .min_by_key(|(t, _)| ((*t as i64 - target).abs(), std::cmp::Reverse(*t)))
                .unwrap();
            let expected = if t_k == 20 {
                // Same index as the newest sample, so it steps back one
                (1000 - 300) as f64 / 8.0
            } else {
                (1000 - v_k) as f64 / (20 - t_k) as f64
            };
            let avg = series.average(Duration::from_secs(span)).unwrap();
            assert!(
                (avg.rate - expected).abs() < 1e-9,
                "span {span}: got {} expected {expected}",
                avg.rate
            );
        }
    }

    #[test]
    fn span_shorter_than_interval_uses_last_two_samples() {
        let (series, _) = uniform(5, 2, 10, None);
        let avg = series.average(Duration::from_millis(10)).unwrap();
        assert_eq!(avg.span, Duration::from_secs(2));
        assert!((avg.rate - 5.0).abs() < 1e-9);

        let avg = series.average(Duration::ZERO).unwrap();
        assert_eq!(avg.span, Duration::from_secs(2));
    }

    #[test]
    fn reports_actual_span_covered() {
        // Samples every 2s, 5s requested: closest start is 4s or 6s back
        let (series, _) = uniform(10, 2, 1, None);
        let avg = series.average(Duration::from_secs(5)).unwrap();
        assert!(avg.span == Duration::from_secs(4) || avg.span == Duration::from_secs(6));

        // Longer than the whole series clamps to the oldest sample
        let avg = series.average(Duration::from_secs(3600)).unwrap();
        assert_eq!(avg.span, Duration::from_secs(18));
    }

    #[test]
    fn counter_reset_is_flagged_and_rate_stays_positive() {
        let start = Instant::now();
        let mut series = RateSeries::new(None);
        series.append_at(5000, start).unwrap();
        series.append_at(1000, start + Duration::from_secs(4)).unwrap();

        let avg = series.average(Duration::from_secs(4)).unwrap();
        assert!(avg.counter_reset);
        assert!((avg.rate - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn capacity_keeps_most_recent_in_order() {
        let (series, _) = uniform(505, 1, 1, Some(500));
        assert_eq!(series.len(), 500);
        assert_eq!(series.get(0).unwrap().value, 1005);
        assert_eq!(series.get(499).unwrap().value, 1504);

        let values: Vec<u64> = series.iter().map(|s| s.value).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn oldest_sample_evicted_first() {
        let (mut series, start) = uniform(3, 1, 1, Some(3));
        series.append_at(9999, start + Duration::from_secs(10)).unwrap();
        let values: Vec<u64> = series.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![1001, 1002, 9999]);
    }

    #[test]
    fn get_out_of_range() {
        let (series, _) = uniform(3, 1, 1, None);
        assert_eq!(
            series.get(3),
            Err(SeriesError::IndexOutOfRange { index: 3, len: 3 })
        );
    }

    #[test]
    fn rejects_non_advancing_timestamps() {
        let (mut series, start) = uniform(2, 1, 1, None);
        assert_eq!(series.append_at(5, start), Err(SeriesError::OutOfOrder));
        assert_eq!(
            series.append_at(5, start + Duration::from_secs(1)),
            Err(SeriesError::OutOfOrder)
        );
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn flush_clears() {
        let (mut series, _) = uniform(4, 1, 1, Some(10));
        series.flush();
        assert!(series.is_empty());
        assert_eq!(series.capacity(), Some(10));
        series.append(1).unwrap();
        assert_eq!(series.len(), 1);
    }
}
