//! Hierarchical bandwidth admission control.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::error::BandwidthError;
use super::politeness::{GalleryQueryType, PolitenessTokens};
use super::rules::BandwidthRules;
use super::tracker::BandwidthTracker;
use crate::clock::Clock;
use crate::config::PolitenessDelays;
use crate::context::{ContextType, NetworkContext};

/// Page and ephemeral trackers idle this long are dropped by [`BandwidthManager::maintain`].
const TRANSIENT_TRACKER_IDLE_SECS: u64 = 3_600;

#[derive(Debug, Default)]
struct State {
    rules: HashMap<NetworkContext, BandwidthRules>,
    trackers: HashMap<NetworkContext, BandwidthTracker>,
    dirty: bool,
}

impl State {
    fn rules_for(&self, context: &NetworkContext) -> Option<&BandwidthRules> {
        self.rules
            .get(context)
            .or_else(|| self.rules.get(&context.default_context()))
    }

    fn tracker_mut(&mut self, context: &NetworkContext) -> &mut BandwidthTracker {
        self.trackers.entry(context.clone()).or_default()
    }

    /// Evaluates `check` for every context that has rules. Contexts without a
    /// tracker are checked against an empty history.
    fn all_permit(
        &self,
        contexts: &[NetworkContext],
        check: impl Fn(&BandwidthRules, &BandwidthTracker) -> bool,
    ) -> bool {
        let empty = BandwidthTracker::new();
        contexts.iter().all(|context| match self.rules_for(context) {
            Some(rules) => check(rules, self.trackers.get(context).unwrap_or(&empty)),
            None => true,
        })
    }

    fn report_request(&mut self, contexts: &[NetworkContext], now: u64) {
        for context in contexts {
            self.tracker_mut(context).report_request_used(now);
        }
        self.dirty = true;
    }
}

/// Owns per-context rules and trackers and answers admission questions.
///
/// All maps sit behind one lock, so [`try_to_start_request`] is a single
/// atomic check-and-report across every context it is given.
///
/// [`try_to_start_request`]: BandwidthManager::try_to_start_request
#[derive(Debug)]
pub struct BandwidthManager {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    politeness: PolitenessTokens,
}

impl BandwidthManager {
    /// Creates a manager with the built-in default rules for every context type.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let manager = Self::unrestricted(clock);
        {
            let mut state = manager.lock();
            for context_type in ContextType::ALL {
                let rules = BandwidthRules::default_for(context_type);
                state
                    .rules
                    .insert(NetworkContext::default_for(context_type), rules);
            }
            state.dirty = false;
        }
        manager
    }

    /// Creates a manager with no rules at all. Usage is still tracked.
    #[must_use]
    pub fn unrestricted(clock: Arc<dyn Clock>) -> Self {
        let mut state = State::default();
        state
            .trackers
            .insert(NetworkContext::global(), BandwidthTracker::new());
        Self {
            politeness: PolitenessTokens::new(clock.clone(), PolitenessDelays::default()),
            clock,
            state: Mutex::new(state),
        }
    }

    /// Replaces the gallery politeness delays.
    #[must_use]
    pub fn with_politeness_delays(mut self, delays: PolitenessDelays) -> Self {
        self.politeness = PolitenessTokens::new(self.clock.clone(), delays);
        self
    }

    /// The clock this manager measures windows with.
    #[must_use]
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves counters consistent enough to keep going.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether every context has headroom for one more request.
    #[must_use]
    pub fn can_start_request(&self, contexts: &[NetworkContext]) -> bool {
        let now = self.clock.now();
        self.lock()
            .all_permit(contexts, |rules, tracker| rules.can_start_request(tracker, now))
    }

    /// Checks for headroom and, if there is some, reports the request, all
    /// under one lock.
    #[instrument(skip_all, fields(contexts = contexts.len()))]
    pub fn try_to_start_request(&self, contexts: &[NetworkContext]) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        if !state.all_permit(contexts, |rules, tracker| rules.can_start_request(tracker, now)) {
            return false;
        }
        state.report_request(contexts, now);
        true
    }

    /// Whether a running download may keep reading.
    #[must_use]
    pub fn can_continue_download(&self, contexts: &[NetworkContext]) -> bool {
        let now = self.clock.now();
        self.lock().all_permit(contexts, |rules, tracker| {
            rules.can_continue_download(tracker, now)
        })
    }

    /// Speculative check for planned work. Reserves nothing.
    #[must_use]
    pub fn can_do_work(
        &self,
        contexts: &[NetworkContext],
        expected_requests: u64,
        expected_bytes: u64,
        threshold: Duration,
    ) -> bool {
        let now = self.clock.now();
        let threshold = threshold.as_secs();
        self.lock().all_permit(contexts, |rules, tracker| {
            rules.can_do_work(tracker, expected_requests, expected_bytes, threshold, now)
        })
    }

    /// Records one request against every context.
    pub fn report_request_used(&self, contexts: &[NetworkContext]) {
        let now = self.clock.now();
        self.lock().report_request(contexts, now);
    }

    /// Records `bytes` against every context.
    pub fn report_data_used(&self, contexts: &[NetworkContext], bytes: u64) {
        if bytes == 0 {
            return;
        }
        let now = self.clock.now();
        let mut state = self.lock();
        for context in contexts {
            state.tracker_mut(context).report_data_used(now, bytes);
        }
        state.dirty = true;
    }

    /// The most constraining context and how long it predicts a wait to be.
    ///
    /// Returns `(Duration::ZERO, None)` when nothing is saturated or only
    /// all-time rules block.
    #[must_use]
    pub fn waiting_estimate_and_context(
        &self,
        contexts: &[NetworkContext],
    ) -> (Duration, Option<NetworkContext>) {
        let now = self.clock.now();
        let state = self.lock();
        let empty = BandwidthTracker::new();
        contexts
            .iter()
            .filter_map(|context| {
                let rules = state.rules_for(context)?;
                let tracker = state.trackers.get(context).unwrap_or(&empty);
                let estimate = rules.waiting_estimate(tracker, now);
                (estimate > 0).then(|| (estimate, context.clone()))
            })
            .max_by_key(|(estimate, _)| *estimate)
            .map_or((Duration::ZERO, None), |(estimate, context)| {
                (Duration::from_secs(estimate), Some(context))
            })
    }

    /// See [`PolitenessTokens::try_consume`].
    pub fn try_to_consume_a_gallery_token(
        &self,
        domain: &str,
        query_type: GalleryQueryType,
    ) -> (bool, u64) {
        self.politeness.try_consume(domain, query_type)
    }

    /// See [`PolitenessTokens::record_server_backoff`].
    pub fn record_server_backoff(&self, domain: &str, delay: Duration) {
        self.politeness.record_server_backoff(domain, delay);
    }

    /// The politeness token store.
    #[must_use]
    pub fn politeness(&self) -> &PolitenessTokens {
        &self.politeness
    }

    /// Sets the rules for a context. Setting a default context changes the
    /// fallback for its whole type.
    #[instrument(skip(self, rules), fields(%context))]
    pub fn set_rules(&self, context: NetworkContext, rules: BandwidthRules) {
        debug!(rules = rules.rules().len(), "setting bandwidth rules");
        let mut state = self.lock();
        state.rules.insert(context, rules);
        state.dirty = true;
    }

    /// Removes a context's specific rules so it falls back to its type default.
    ///
    /// # Errors
    ///
    /// Default contexts and Global cannot lose their rules.
    pub fn delete_rules(&self, context: &NetworkContext) -> Result<(), BandwidthError> {
        if context.is_default() || context.is_global() {
            return Err(BandwidthError::protected_context(context));
        }
        let mut state = self.lock();
        if state.rules.remove(context).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    /// The rules that apply to `context`: its own, else its type default.
    #[must_use]
    pub fn rules(&self, context: &NetworkContext) -> BandwidthRules {
        self.lock().rules_for(context).cloned().unwrap_or_default()
    }

    /// Whether `context` has rules of its own.
    #[must_use]
    pub fn has_specific_rules(&self, context: &NetworkContext) -> bool {
        self.lock().rules.contains_key(context)
    }

    /// Forgets usage history. The global tracker is reset rather than removed.
    #[instrument(skip_all, fields(contexts = contexts.len()))]
    pub fn delete_history(&self, contexts: &[NetworkContext]) {
        let mut state = self.lock();
        for context in contexts {
            if context.is_global() {
                state.trackers.insert(context.clone(), BandwidthTracker::new());
            } else {
                state.trackers.remove(context);
            }
        }
        state.dirty = true;
    }

    /// Every web domain context with its tracker.
    #[must_use]
    pub fn domains_and_trackers(&self) -> Vec<(NetworkContext, BandwidthTracker)> {
        let mut out: Vec<_> = self
            .lock()
            .trackers
            .iter()
            .filter(|(context, _)| context.context_type() == ContextType::Domain)
            .map(|(context, tracker)| (context.clone(), tracker.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Every tracked context, optionally only those with any recorded usage.
    #[must_use]
    pub fn contexts_and_trackers(
        &self,
        history_only: bool,
    ) -> Vec<(NetworkContext, BandwidthTracker)> {
        let mut out: Vec<_> = self
            .lock()
            .trackers
            .iter()
            .filter(|(_, tracker)| !history_only || !tracker.is_empty())
            .map(|(context, tracker)| (context.clone(), tracker.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Usage strings and gauge values for each rule applying to `context`.
    #[must_use]
    pub fn bandwidth_strings_and_gauge_tuples(
        &self,
        context: &NetworkContext,
    ) -> Vec<(String, (u64, u64))> {
        let now = self.clock.now();
        let state = self.lock();
        let empty = BandwidthTracker::new();
        let tracker = state.trackers.get(context).unwrap_or(&empty);
        state
            .rules_for(context)
            .map(|rules| rules.bandwidth_strings_and_gauge_tuples(tracker, now))
            .unwrap_or_default()
    }

    /// Drops trackers of short-lived contexts (pages, ephemeral) that have
    /// been idle for an hour and have no rules of their own.
    #[instrument(skip(self))]
    pub fn maintain(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        let State {
            rules, trackers, ..
        } = &mut *state;
        let before = trackers.len();
        trackers.retain(|context, tracker| {
            let transient = matches!(
                context.context_type(),
                ContextType::Ephemeral | ContextType::DownloaderPage | ContextType::WatcherPage
            );
            let idle = tracker.usage(
                super::BandwidthMetric::Requests,
                Some(TRANSIENT_TRACKER_IDLE_SECS),
                now,
            ) == 0;
            !(transient && idle && !rules.contains_key(context))
        });
        let dropped = before - trackers.len();
        if dropped > 0 {
            debug!(dropped, "dropped idle transient trackers");
        }
    }

    /// Whether anything changed since the last [`mark_clean`](Self::mark_clean).
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn mark_clean(&self) {
        self.lock().dirty = false;
    }

    /// Flags the state as unsaved, e.g. after a failed write.
    pub fn mark_dirty(&self) {
        self.lock().dirty = true;
    }

    /// Trackers that may be written to disk.
    #[must_use]
    pub fn persistent_trackers(&self) -> Vec<(NetworkContext, BandwidthTracker)> {
        self.contexts_and_trackers(false)
            .into_iter()
            .filter(|(context, _)| !context.is_ephemeral())
            .collect()
    }

    /// Rule sets that may be written to disk.
    #[must_use]
    pub fn persistent_rules(&self) -> Vec<(NetworkContext, BandwidthRules)> {
        let mut out: Vec<_> = self
            .lock()
            .rules
            .iter()
            .filter(|(context, _)| !context.is_ephemeral())
            .map(|(context, rules)| (context.clone(), rules.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Installs loaded state. Ephemeral contexts are refused.
    pub fn load_state(
        &self,
        trackers: Vec<(NetworkContext, BandwidthTracker)>,
        rules: Vec<(NetworkContext, BandwidthRules)>,
    ) {
        let mut state = self.lock();
        for (context, tracker) in trackers {
            if context.is_ephemeral() {
                warn!(%context, "ignoring persisted ephemeral tracker");
                continue;
            }
            state.trackers.insert(context, tracker);
        }
        for (context, rule_set) in rules {
            if context.is_ephemeral() {
                warn!(%context, "ignoring persisted ephemeral rules");
                continue;
            }
            state.rules.insert(context, rule_set);
        }
        state.dirty = false;
    }
}
