//! Bandwidth accounting and admission control.
//!
//! Usage is recorded per [`NetworkContext`](crate::context::NetworkContext) in a
//! [`BandwidthTracker`]; [`BandwidthRules`] state the limits; the
//! [`BandwidthManager`] resolves which rules apply to which context and answers
//! "may this request start?" for a whole set of contexts at once.

mod error;
mod manager;
pub mod politeness;
mod rules;
mod tracker;

pub use error::BandwidthError;
pub use manager::BandwidthManager;
pub use politeness::{GalleryQueryType, PolitenessTokens};
pub use rules::{BandwidthRule, BandwidthRules, CONTINUE_DOWNLOAD_WINDOW_SECS};
pub use tracker::{BandwidthMetric, BandwidthTracker};
