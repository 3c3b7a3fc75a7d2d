//! Per-domain gallery politeness tokens.
//!
//! Independent of the bandwidth rules: each `(domain, query class)` pair may
//! be consumed once per configured delay. Callers that are refused get the
//! unix time at which the next token becomes available. Domains are keyed by
//! their registrable domain, so `www.example.com` and `example.com` share
//! tokens.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::PolitenessDelays;
use crate::domain::second_level_domain;

/// Server backoffs at least this long are logged as warnings.
const LONG_BACKOFF_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// The class of gallery query a token gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GalleryQueryType {
    DownloaderPage,
    Subscription,
    Watcher,
}

impl GalleryQueryType {
    pub const ALL: [GalleryQueryType; 3] = [
        GalleryQueryType::DownloaderPage,
        GalleryQueryType::Subscription,
        GalleryQueryType::Watcher,
    ];
}

#[derive(Debug, Default)]
struct TokenState {
    /// Unix time the last token was handed out; `None` until the first.
    last_consumed: Mutex<Option<u64>>,
}

/// Keyed cooldown store for gallery queries.
///
/// Designed to be shared behind an `Arc`: the map is a `DashMap` and each key
/// carries its own lock, so different domains never contend.
#[derive(Debug)]
pub struct PolitenessTokens {
    clock: Arc<dyn Clock>,
    delays: PolitenessDelays,
    tokens: DashMap<(String, GalleryQueryType), Arc<TokenState>>,
}

impl PolitenessTokens {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, delays: PolitenessDelays) -> Self {
        Self {
            clock,
            delays,
            tokens: DashMap::new(),
        }
    }

    /// The configured delay for a query class.
    #[must_use]
    pub fn delay_for(&self, query_type: GalleryQueryType) -> Duration {
        self.delays.delay_for(query_type)
    }

    fn state(&self, domain: &str, query_type: GalleryQueryType) -> Arc<TokenState> {
        self.tokens
            .entry((second_level_domain(domain), query_type))
            .or_default()
            .clone()
    }

    /// Consumes a token if one is available.
    ///
    /// Returns `(true, 0)` on success, otherwise `(false, next_allowed_unix_time)`.
    #[instrument(skip(self))]
    pub fn try_consume(&self, domain: &str, query_type: GalleryQueryType) -> (bool, u64) {
        let delay = self.delay_for(query_type).as_secs();
        let state = self.state(domain, query_type);
        let now = self.clock.now();

        let mut last = state
            .last_consumed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(last_consumed) = *last {
            let next_allowed = last_consumed.saturating_add(delay);
            if now < next_allowed {
                debug!(next_allowed, "gallery token not yet available");
                return (false, next_allowed);
            }
        } else {
            debug!("first gallery token for domain");
        }

        *last = Some(now);
        (true, 0)
    }

    /// Pushes every query class for `domain` out by a server-mandated delay.
    #[instrument(skip(self), fields(delay_secs = delay.as_secs()))]
    pub fn record_server_backoff(&self, domain: &str, delay: Duration) {
        if delay >= LONG_BACKOFF_WARNING_THRESHOLD {
            warn!(
                domain,
                delay_secs = delay.as_secs(),
                "long server backoff - site may be under heavy load"
            );
        }
        let now = self.clock.now();
        for query_type in GalleryQueryType::ALL {
            let own_delay = self.delay_for(query_type).as_secs();
            // next_allowed = last + own_delay, so shift last to land on now + delay
            let target_last = (now + delay.as_secs()).saturating_sub(own_delay);
            let state = self.state(domain, query_type);
            let mut last = state
                .last_consumed
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_none_or(|l| l < target_last) {
                *last = Some(target_last);
            }
        }
        debug!(domain, "recorded server backoff");
    }
}
