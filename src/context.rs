//! Network contexts: the scopes bandwidth rules, trackers and sessions are keyed by.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of scope a [`NetworkContext`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    /// Everything the process does.
    Global,
    /// One web domain.
    Domain,
    /// One remote repository/service, identified by its service key.
    HydrusService,
    /// One subscription.
    Subscription,
    /// One downloader page.
    DownloaderPage,
    /// One thread watcher page.
    WatcherPage,
    /// Temporary, UI-scoped. Never persisted.
    Ephemeral,
}

impl ContextType {
    /// All context types, in display order.
    pub const ALL: [ContextType; 7] = [
        ContextType::Global,
        ContextType::Domain,
        ContextType::HydrusService,
        ContextType::Subscription,
        ContextType::DownloaderPage,
        ContextType::WatcherPage,
        ContextType::Ephemeral,
    ];

    /// Human-readable name of the type.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ContextType::Global => "global",
            ContextType::Domain => "web domain",
            ContextType::HydrusService => "repository",
            ContextType::Subscription => "subscription",
            ContextType::DownloaderPage => "downloader page",
            ContextType::WatcherPage => "watcher page",
            ContextType::Ephemeral => "ephemeral",
        }
    }
}

impl FromStr for ContextType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(ContextType::Global),
            "domain" => Ok(ContextType::Domain),
            "hydrus_service" | "service" => Ok(ContextType::HydrusService),
            "subscription" => Ok(ContextType::Subscription),
            "downloader_page" => Ok(ContextType::DownloaderPage),
            "watcher_page" => Ok(ContextType::WatcherPage),
            "ephemeral" => Ok(ContextType::Ephemeral),
            other => Err(format!("unknown context type: {other}")),
        }
    }
}

/// A scope key: a type plus optional data (domain name, service key, page id).
///
/// A context with `data == None` is the *default* context for its type and
/// holds that type's default rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkContext {
    #[serde(rename = "type")]
    context_type: ContextType,
    data: Option<String>,
}

impl NetworkContext {
    /// Creates a context.
    #[must_use]
    pub fn new(context_type: ContextType, data: Option<String>) -> Self {
        Self { context_type, data }
    }

    /// The process-wide context.
    #[must_use]
    pub fn global() -> Self {
        Self::new(ContextType::Global, None)
    }

    /// A web domain context. The domain is lowercased.
    #[must_use]
    pub fn domain(domain: impl Into<String>) -> Self {
        Self::new(ContextType::Domain, Some(domain.into().to_ascii_lowercase()))
    }

    /// A remote service context keyed by the service key.
    #[must_use]
    pub fn hydrus_service(service_key: impl Into<String>) -> Self {
        Self::new(ContextType::HydrusService, Some(service_key.into()))
    }

    /// A subscription context.
    #[must_use]
    pub fn subscription(name: impl Into<String>) -> Self {
        Self::new(ContextType::Subscription, Some(name.into()))
    }

    /// A downloader page context.
    #[must_use]
    pub fn downloader_page(page_key: impl Into<String>) -> Self {
        Self::new(ContextType::DownloaderPage, Some(page_key.into()))
    }

    /// A watcher page context.
    #[must_use]
    pub fn watcher_page(page_key: impl Into<String>) -> Self {
        Self::new(ContextType::WatcherPage, Some(page_key.into()))
    }

    /// A temporary context.
    #[must_use]
    pub fn ephemeral(key: impl Into<String>) -> Self {
        Self::new(ContextType::Ephemeral, Some(key.into()))
    }

    /// The default context for `context_type`.
    #[must_use]
    pub fn default_for(context_type: ContextType) -> Self {
        Self::new(context_type, None)
    }

    /// Returns the context type.
    #[must_use]
    pub fn context_type(&self) -> ContextType {
        self.context_type
    }

    /// Returns the context data, if any.
    #[must_use]
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Whether this is the default context of its type.
    ///
    /// Global has no data either way; it counts as a real context, not a default.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.data.is_none() && self.context_type != ContextType::Global
    }

    /// Whether this context must never be written to disk.
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.context_type == ContextType::Ephemeral
    }

    /// Whether this is the global context.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.context_type == ContextType::Global
    }

    /// The default context this one falls back to for rules.
    #[must_use]
    pub fn default_context(&self) -> Self {
        Self::default_for(self.context_type)
    }
}

impl fmt::Display for NetworkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.context_type, &self.data) {
            (ContextType::Global, _) => f.write_str("global"),
            (t, None) => write!(f, "default {}", t.label()),
            (t, Some(data)) => write!(f, "{}: {data}", t.label()),
        }
    }
}
