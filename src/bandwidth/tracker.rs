//! Time-bucketed usage history for one network context.
//!
//! Usage is recorded into second, minute, hour, day and month buckets at the
//! same time. A lookback query is answered from the finest granularity that
//! still retains the whole window, so short windows are exact and long ones
//! are conservative (a partially covered coarse bucket counts in full).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a rule or tracker counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthMetric {
    /// Bytes transferred.
    Data,
    /// Requests started.
    Requests,
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const MONTH: u64 = 30 * DAY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl Granularity {
    fn for_window(window: u64) -> Self {
        if window <= 5 * MINUTE {
            Granularity::Second
        } else if window <= 3 * HOUR {
            Granularity::Minute
        } else if window <= 7 * DAY {
            Granularity::Hour
        } else if window <= 365 * DAY {
            Granularity::Day
        } else {
            Granularity::Month
        }
    }

    fn secs(self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => MINUTE,
            Granularity::Hour => HOUR,
            Granularity::Day => DAY,
            Granularity::Month => MONTH,
        }
    }

    fn retention(self) -> Option<u64> {
        match self {
            Granularity::Second => Some(10 * MINUTE),
            Granularity::Minute => Some(DAY),
            Granularity::Hour => Some(8 * DAY),
            Granularity::Day => Some(400 * DAY),
            Granularity::Month => None,
        }
    }

    fn bucket(self, now: u64) -> u64 {
        now - now % self.secs()
    }

    /// Seconds after `key` at which a bucket stops counting towards a window of
    /// `window` seconds.
    fn expiry(self, key: u64, window: u64) -> u64 {
        match self {
            Granularity::Second => key + window,
            coarse => key + coarse.secs() + window,
        }
    }

    fn in_window(self, key: u64, since: u64) -> bool {
        match self {
            Granularity::Second => key > since,
            coarse => key + coarse.secs() > since,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct Counters {
    seconds: BTreeMap<u64, u64>,
    minutes: BTreeMap<u64, u64>,
    hours: BTreeMap<u64, u64>,
    days: BTreeMap<u64, u64>,
    months: BTreeMap<u64, u64>,
    total: u64,
}

impl Counters {
    fn map(&self, granularity: Granularity) -> &BTreeMap<u64, u64> {
        match granularity {
            Granularity::Second => &self.seconds,
            Granularity::Minute => &self.minutes,
            Granularity::Hour => &self.hours,
            Granularity::Day => &self.days,
            Granularity::Month => &self.months,
        }
    }

    fn map_mut(&mut self, granularity: Granularity) -> &mut BTreeMap<u64, u64> {
        match granularity {
            Granularity::Second => &mut self.seconds,
            Granularity::Minute => &mut self.minutes,
            Granularity::Hour => &mut self.hours,
            Granularity::Day => &mut self.days,
            Granularity::Month => &mut self.months,
        }
    }

    fn add(&mut self, now: u64, amount: u64) {
        for granularity in ALL_GRANULARITIES {
            let bucket = self
                .map_mut(granularity)
                .entry(granularity.bucket(now))
                .or_insert(0);
            *bucket = bucket.saturating_add(amount);
        }
        self.total = self.total.saturating_add(amount);
    }

    fn prune(&mut self, now: u64) {
        for granularity in ALL_GRANULARITIES {
            if let Some(retention) = granularity.retention() {
                let cutoff = now.saturating_sub(retention);
                let map = self.map_mut(granularity);
                *map = map.split_off(&cutoff);
            }
        }
    }

    fn in_window(&self, window: u64, now: u64) -> (Granularity, Vec<(u64, u64)>) {
        let granularity = Granularity::for_window(window);
        let since = now.saturating_sub(window);
        let buckets = self
            .map(granularity)
            .iter()
            .filter(|(key, _)| granularity.in_window(**key, since))
            .map(|(key, value)| (*key, *value))
            .collect();
        (granularity, buckets)
    }

    fn usage(&self, window: Option<u64>, now: u64) -> u64 {
        match window {
            None => self.total,
            Some(0) => 0,
            Some(window) => self
                .in_window(window, now)
                .1
                .iter()
                .fold(0u64, |sum, (_, value)| sum.saturating_add(*value)),
        }
    }
}

const ALL_GRANULARITIES: [Granularity; 5] = [
    Granularity::Second,
    Granularity::Minute,
    Granularity::Hour,
    Granularity::Day,
    Granularity::Month,
];

/// Request and byte usage history for one context.
///
/// The tracker holds no clock of its own; callers pass the current unix time,
/// which keeps it serializable and lets the manager drive it from any
/// [`Clock`](crate::clock::Clock).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthTracker {
    data: Counters,
    requests: Counters,
}

impl BandwidthTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, metric: BandwidthMetric) -> &Counters {
        match metric {
            BandwidthMetric::Data => &self.data,
            BandwidthMetric::Requests => &self.requests,
        }
    }

    /// Records one started request.
    pub fn report_request_used(&mut self, now: u64) {
        self.requests.add(now, 1);
        self.requests.prune(now);
    }

    /// Records `bytes` transferred.
    pub fn report_data_used(&mut self, now: u64, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.data.add(now, bytes);
        self.data.prune(now);
    }

    /// Usage over the last `window` seconds, or all-time when `window` is `None`.
    #[must_use]
    pub fn usage(&self, metric: BandwidthMetric, window: Option<u64>, now: u64) -> u64 {
        self.counters(metric).usage(window, now)
    }

    /// Seconds until usage over `window` drops below `max`.
    ///
    /// Returns 0 when there is already headroom.
    #[must_use]
    pub fn waiting_estimate(
        &self,
        metric: BandwidthMetric,
        window: u64,
        max: u64,
        now: u64,
    ) -> u64 {
        let (granularity, buckets) = self.counters(metric).in_window(window, now);
        let usage = buckets
            .iter()
            .fold(0u64, |sum, (_, value)| sum.saturating_add(*value));
        if usage < max {
            return 0;
        }

        let mut remaining = usage;
        for (key, value) in buckets {
            remaining = remaining.saturating_sub(value);
            if remaining < max {
                return granularity.expiry(key, window).saturating_sub(now).max(1);
            }
        }
        window.max(1)
    }

    /// All-time request count.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.requests.total
    }

    /// All-time byte count.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.data.total
    }

    /// Whether nothing has ever been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.total == 0 && self.data.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000;

    #[test]
    fn test_usage_counts_within_second_window() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_request_used(T0);
        tracker.report_request_used(T0 + 10);

        assert_eq!(tracker.usage(BandwidthMetric::Requests, Some(60), T0 + 10), 2);
        assert_eq!(tracker.usage(BandwidthMetric::Requests, Some(60), T0 + 60), 1);
        assert_eq!(tracker.usage(BandwidthMetric::Requests, Some(60), T0 + 70), 0);
        assert_eq!(tracker.usage(BandwidthMetric::Requests, None, T0 + 70), 2);
    }

    #[test]
    fn test_usage_current_second() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_data_used(T0, 500);
        tracker.report_data_used(T0 + 1, 200);

        assert_eq!(tracker.usage(BandwidthMetric::Data, Some(1), T0 + 1), 200);
    }

    #[test]
    fn test_zero_bytes_not_recorded() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_data_used(T0, 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_long_windows_use_coarse_buckets() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_data_used(T0, 1_000);
        tracker.report_data_used(T0 + 2 * HOUR, 1_000);

        assert_eq!(tracker.usage(BandwidthMetric::Data, Some(DAY), T0 + 3 * HOUR), 2_000);
        assert_eq!(
            tracker.usage(BandwidthMetric::Data, Some(30 * DAY), T0 + 3 * HOUR),
            2_000
        );
        assert_eq!(tracker.usage(BandwidthMetric::Data, Some(DAY), T0 + 3 * DAY), 0);
        assert_eq!(tracker.total_bytes(), 2_000);
    }

    #[test]
    fn test_second_buckets_are_pruned() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_request_used(T0);
        tracker.report_request_used(T0 + HOUR);

        assert_eq!(tracker.requests.seconds.len(), 1);
        assert_eq!(tracker.total_requests(), 2);
    }

    #[test]
    fn test_waiting_estimate_second_window() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_request_used(T0);
        tracker.report_request_used(T0 + 20);

        // max 2 per 60s: oldest request leaves the window at T0 + 60
        assert_eq!(
            tracker.waiting_estimate(BandwidthMetric::Requests, 60, 2, T0 + 30),
            30
        );
        assert_eq!(
            tracker.waiting_estimate(BandwidthMetric::Requests, 60, 3, T0 + 30),
            0
        );
    }

    #[test]
    fn test_waiting_estimate_needs_several_buckets() {
        let mut tracker = BandwidthTracker::new();
        for offset in 0..5 {
            tracker.report_request_used(T0 + offset);
        }
        // max 2 per 60s: usage must fall to 1, so the fourth request must leave
        assert_eq!(
            tracker.waiting_estimate(BandwidthMetric::Requests, 60, 2, T0 + 10),
            53
        );
    }

    #[test]
    fn test_tracker_serde_keeps_usage() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_request_used(T0);
        tracker.report_data_used(T0, 4096);

        let json = serde_json::to_string(&tracker).unwrap_or_default();
        let restored: BandwidthTracker = serde_json::from_str(&json).unwrap_or_default();
        assert_eq!(restored, tracker);
        assert_eq!(restored.usage(BandwidthMetric::Data, Some(60), T0), 4096);
    }
}
