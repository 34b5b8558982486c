use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, VecDeque};

use crate::state::TrackKey;

pub const WINDOW_CAPACITY: usize = 5;

/// The most recent DROP timestamps for one key, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropWindow {
    samples: VecDeque<DateTime<Utc>>,
}

impl DropWindow {
    /// Keeps only the newest `WINDOW_CAPACITY` samples.
    pub fn from_samples(samples: impl IntoIterator<Item = DateTime<Utc>>) -> Self {
        let mut window = Self::default();
        for at in samples {
            window.push(at);
        }
        window
    }

    pub fn push(&mut self, at: DateTime<Utc>) {
        if self.samples.len() == WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(at);
    }

    pub fn samples(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.samples.iter()
    }

    /// Full window whose samples all fall within `max_span`.
    pub fn is_burst(&self, max_span: Duration) -> bool {
        if self.samples.len() < WINDOW_CAPACITY {
            return false;
        }
        // log lines are not guaranteed to be in timestamp order
        let (Some(oldest), Some(newest)) = (self.samples.iter().min(), self.samples.iter().max())
        else {
            return false;
        };
        *newest - *oldest <= max_span
    }
}

#[derive(Debug, Clone)]
pub struct DropRateDetector {
    max_span: Duration,
}

impl DropRateDetector {
    pub fn new(max_span: Duration) -> Self {
        Self { max_span }
    }

    /// Records a DROP for `key` and reports whether its window now
    /// constitutes a burst. Callers skip keys that are already blocked.
    pub fn observe(
        &self,
        windows: &mut BTreeMap<TrackKey, DropWindow>,
        key: TrackKey,
        at: DateTime<Utc>,
    ) -> bool {
        let window = windows.entry(key).or_default();
        window.push(at);
        window.is_burst(self.max_span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> TrackKey {
        TrackKey::new(100, "45.142.193.117".parse().unwrap())
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 22, 18, 0, 0).unwrap()
    }

    fn feed(minutes: &[i64]) -> Vec<bool> {
        let detector = DropRateDetector::new(Duration::minutes(5));
        let mut windows = BTreeMap::new();
        minutes
            .iter()
            .map(|m| detector.observe(&mut windows, key(), base() + Duration::minutes(*m)))
            .collect()
    }

    #[test]
    fn five_drops_within_five_minutes_fire() {
        assert_eq!(
            feed(&[0, 1, 2, 3, 4]),
            vec![false, false, false, false, true]
        );
    }

    #[test]
    fn span_of_exactly_five_minutes_fires() {
        assert_eq!(feed(&[0, 1, 2, 3, 5]).last(), Some(&true));
    }

    #[test]
    fn slow_drops_do_not_fire() {
        assert!(feed(&[0, 2, 4, 6, 8]).iter().all(|fired| !fired));
    }

    #[test]
    fn sliding_window_fires_once_old_samples_age_out() {
        // the 6th sample evicts minute 0, leaving minutes 6 through 10
        let fired = feed(&[0, 6, 7, 8, 9, 10]);
        assert_eq!(fired, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn window_never_exceeds_capacity() {
        let window = DropWindow::from_samples((0..12).map(|m| base() + Duration::minutes(m)));
        assert_eq!(window.samples().count(), WINDOW_CAPACITY);
        assert_eq!(
            window.samples().next(),
            Some(&(base() + Duration::minutes(7)))
        );
    }

    #[test]
    fn out_of_order_samples_use_true_span() {
        let window = DropWindow::from_samples(
            [9, 0, 1, 2, 3].map(|m| base() + Duration::minutes(m)),
        );
        assert!(!window.is_burst(Duration::minutes(5)));
    }
}
