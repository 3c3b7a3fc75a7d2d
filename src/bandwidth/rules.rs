//! Bandwidth rules: limit statements evaluated against a tracker.

use serde::{Deserialize, Serialize};

use super::tracker::{BandwidthMetric, BandwidthTracker};
use crate::context::ContextType;
use crate::units::{bytes_to_string, duration_to_string};

/// Data rules with a window up to this long are re-checked while a body streams.
pub const CONTINUE_DOWNLOAD_WINDOW_SECS: u64 = 15;

/// One limit: at most `max` of `metric` over `window_secs` (all-time when `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthRule {
    pub metric: BandwidthMetric,
    pub window_secs: Option<u64>,
    pub max: u64,
}

impl BandwidthRule {
    /// Request-count rule.
    #[must_use]
    pub fn requests(window_secs: Option<u64>, max: u64) -> Self {
        Self {
            metric: BandwidthMetric::Requests,
            window_secs,
            max,
        }
    }

    /// Byte-count rule.
    #[must_use]
    pub fn data(window_secs: Option<u64>, max: u64) -> Self {
        Self {
            metric: BandwidthMetric::Data,
            window_secs,
            max,
        }
    }

    fn usage(&self, tracker: &BandwidthTracker, now: u64) -> u64 {
        tracker.usage(self.metric, self.window_secs, now)
    }

    fn amount_string(&self, amount: u64) -> String {
        match self.metric {
            BandwidthMetric::Data => bytes_to_string(amount),
            BandwidthMetric::Requests => format!("{amount} rqs"),
        }
    }

    fn window_string(&self) -> String {
        match self.window_secs {
            None => "all time".to_string(),
            Some(secs) => format!("per {}", duration_to_string(secs)),
        }
    }
}

/// Ordered rule list. A request is allowed only if every rule allows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthRules {
    rules: Vec<BandwidthRule>,
}

impl BandwidthRules {
    /// Creates an empty rule set, which never blocks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a rule.
    pub fn add_rule(&mut self, rule: BandwidthRule) {
        self.rules.push(rule);
    }

    /// Builder form of [`add_rule`](Self::add_rule).
    #[must_use]
    pub fn with_rule(mut self, rule: BandwidthRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// The rules in order.
    #[must_use]
    pub fn rules(&self) -> &[BandwidthRule] {
        &self.rules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Built-in defaults for a context type.
    #[must_use]
    pub fn default_for(context_type: ContextType) -> Self {
        const MB: u64 = 1024 * 1024;
        match context_type {
            ContextType::Global => Self::new().with_rule(BandwidthRule::requests(Some(1), 5)),
            ContextType::Domain => Self::new()
                .with_rule(BandwidthRule::requests(Some(1), 1))
                .with_rule(BandwidthRule::data(Some(60), 50 * MB)),
            ContextType::Subscription => {
                Self::new().with_rule(BandwidthRule::data(Some(86_400), 256 * MB))
            }
            ContextType::HydrusService
            | ContextType::DownloaderPage
            | ContextType::WatcherPage
            | ContextType::Ephemeral => Self::new(),
        }
    }

    /// Whether a new request may start: every rule must have headroom.
    #[must_use]
    pub fn can_start_request(&self, tracker: &BandwidthTracker, now: u64) -> bool {
        self.rules
            .iter()
            .all(|rule| rule.usage(tracker, now) < rule.max)
    }

    /// Whether a running download may read more: short data rules must not be exceeded.
    #[must_use]
    pub fn can_continue_download(&self, tracker: &BandwidthTracker, now: u64) -> bool {
        self.rules
            .iter()
            .filter(|rule| {
                rule.metric == BandwidthMetric::Data
                    && rule
                        .window_secs
                        .is_some_and(|w| w <= CONTINUE_DOWNLOAD_WINDOW_SECS)
            })
            .all(|rule| rule.usage(tracker, now) <= rule.max)
    }

    /// Whether the expected work fits under every rule with a window of at least
    /// `threshold_secs`.
    #[must_use]
    pub fn can_do_work(
        &self,
        tracker: &BandwidthTracker,
        expected_requests: u64,
        expected_bytes: u64,
        threshold_secs: u64,
        now: u64,
    ) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.window_secs.is_none_or(|w| w >= threshold_secs))
            .all(|rule| {
                let expected = match rule.metric {
                    BandwidthMetric::Data => expected_bytes,
                    BandwidthMetric::Requests => expected_requests,
                };
                rule.usage(tracker, now).saturating_add(expected) <= rule.max
            })
    }

    /// Longest wait among saturated windowed rules, in seconds.
    #[must_use]
    pub fn waiting_estimate(&self, tracker: &BandwidthTracker, now: u64) -> u64 {
        self.rules
            .iter()
            .filter_map(|rule| {
                let window = rule.window_secs?;
                Some(tracker.waiting_estimate(rule.metric, window, rule.max, now))
            })
            .max()
            .unwrap_or(0)
    }

    /// One line per rule, e.g. `"3 rqs/5 rqs per 1 second"`, with the
    /// `(usage, max)` pair for a gauge.
    #[must_use]
    pub fn bandwidth_strings_and_gauge_tuples(
        &self,
        tracker: &BandwidthTracker,
        now: u64,
    ) -> Vec<(String, (u64, u64))> {
        self.rules
            .iter()
            .map(|rule| {
                let usage = rule.usage(tracker, now);
                let text = format!(
                    "{}/{} {}",
                    rule.amount_string(usage),
                    rule.amount_string(rule.max),
                    rule.window_string()
                );
                (text, (usage.min(rule.max), rule.max))
            })
            .collect()
    }
}
