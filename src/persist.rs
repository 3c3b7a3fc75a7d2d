//! Saving and restoring bandwidth and session state.
//!
//! State is stored per `(kind, context)` with a format version. On load,
//! rows whose context no longer parses (a context type that was removed),
//! whose version is unknown, or whose blob is corrupt are skipped with a
//! warning so one bad row never blocks the rest.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bandwidth::{BandwidthManager, BandwidthRules, BandwidthTracker};
use crate::context::NetworkContext;
use crate::db::{Database, DbError};
use crate::session::{SessionError, SessionManager};

/// Format version written with every row.
pub const STATE_VERSION: i64 = 1;

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Query(#[from] sqlx::Error),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error("failed to serialize {kind} for {context}: {source}")]
    Serialize {
        kind: &'static str,
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// What a stored row holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    BandwidthTracker,
    BandwidthRules,
    Session,
}

impl StateKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BandwidthTracker => "bandwidth_tracker",
            Self::BandwidthRules => "bandwidth_rules",
            Self::Session => "session",
        }
    }
}

/// One stored row, context still in its serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRow {
    pub context: String,
    pub version: i64,
    pub blob: String,
}

/// Storage seam for persisted network state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replaces every row of `kind` with `rows`.
    async fn replace_all(&self, kind: StateKind, rows: Vec<StateRow>) -> Result<(), StoreError>;

    /// Reads every row of `kind`.
    async fn load_all(&self, kind: StateKind) -> Result<Vec<StateRow>, StoreError>;
}

/// [`StateStore`] backed by the `network_state` table.
#[derive(Debug, Clone)]
pub struct SqliteStateStore {
    db: Database,
}

impl SqliteStateStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    #[instrument(skip(self, rows), fields(kind = kind.as_str(), rows = rows.len()))]
    async fn replace_all(&self, kind: StateKind, rows: Vec<StateRow>) -> Result<(), StoreError> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(r"DELETE FROM network_state WHERE kind = ?")
            .bind(kind.as_str())
            .execute(&mut *tx)
            .await?;
        for row in rows {
            sqlx::query(
                r"INSERT INTO network_state (kind, context, version, blob, updated_at)
                  VALUES (?, ?, ?, ?, datetime('now'))",
            )
            .bind(kind.as_str())
            .bind(row.context)
            .bind(row.version)
            .bind(row.blob)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(kind = kind.as_str()))]
    async fn load_all(&self, kind: StateKind) -> Result<Vec<StateRow>, StoreError> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r"SELECT context, version, blob FROM network_state WHERE kind = ? ORDER BY context",
        )
        .bind(kind.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(context, version, blob)| StateRow {
                context,
                version,
                blob,
            })
            .collect())
    }
}

fn encode<T: Serialize>(
    kind: StateKind,
    context: &NetworkContext,
    value: &T,
) -> Result<StateRow, StoreError> {
    let wrap = |source| StoreError::Serialize {
        kind: kind.as_str(),
        context: context.to_string(),
        source,
    };
    Ok(StateRow {
        context: serde_json::to_string(context).map_err(wrap)?,
        version: STATE_VERSION,
        blob: serde_json::to_string(value).map_err(wrap)?,
    })
}

/// Parses a row's context, checking its version. `None` means skip.
fn decode_context(kind: StateKind, row: &StateRow) -> Option<NetworkContext> {
    if row.version != STATE_VERSION {
        warn!(
            kind = kind.as_str(),
            context = %row.context,
            version = row.version,
            "skipping state row with unknown version"
        );
        return None;
    }
    match serde_json::from_str(&row.context) {
        Ok(context) => Some(context),
        Err(e) => {
            warn!(
                kind = kind.as_str(),
                context = %row.context,
                error = %e,
                "skipping state row with unknown context"
            );
            None
        }
    }
}

fn decode_rows<T: DeserializeOwned>(
    kind: StateKind,
    rows: &[StateRow],
) -> Vec<(NetworkContext, T)> {
    rows.iter()
        .filter_map(|row| {
            let context = decode_context(kind, row)?;
            match serde_json::from_str(&row.blob) {
                Ok(value) => Some((context, value)),
                Err(e) => {
                    warn!(kind = kind.as_str(), %context, error = %e, "skipping corrupt state row");
                    None
                }
            }
        })
        .collect()
}

/// Writes trackers and rules if anything changed since the last save.
///
/// # Errors
///
/// Fails if serialization or the store fails; the manager stays dirty.
#[instrument(skip_all)]
pub async fn save_bandwidth(
    store: &dyn StateStore,
    manager: &BandwidthManager,
) -> Result<(), StoreError> {
    if !manager.is_dirty() {
        debug!("bandwidth state clean, nothing to save");
        return Ok(());
    }
    // clear before the snapshot; changes made during the write re-dirty it
    manager.mark_clean();
    let result = write_bandwidth(store, manager).await;
    if result.is_err() {
        manager.mark_dirty();
    }
    result
}

async fn write_bandwidth(
    store: &dyn StateStore,
    manager: &BandwidthManager,
) -> Result<(), StoreError> {
    let trackers = manager
        .persistent_trackers()
        .iter()
        .map(|(context, tracker)| encode(StateKind::BandwidthTracker, context, tracker))
        .collect::<Result<Vec<_>, _>>()?;
    let rules = manager
        .persistent_rules()
        .iter()
        .map(|(context, rules)| encode(StateKind::BandwidthRules, context, rules))
        .collect::<Result<Vec<_>, _>>()?;
    let (tracker_count, rule_count) = (trackers.len(), rules.len());

    store
        .replace_all(StateKind::BandwidthTracker, trackers)
        .await?;
    store.replace_all(StateKind::BandwidthRules, rules).await?;
    info!(trackers = tracker_count, rules = rule_count, "saved bandwidth state");
    Ok(())
}

/// Restores trackers and rules into `manager`. Returns how many rows loaded.
///
/// # Errors
///
/// Fails only if the store itself fails; bad rows are skipped.
#[instrument(skip_all)]
pub async fn load_bandwidth(
    store: &dyn StateStore,
    manager: &BandwidthManager,
) -> Result<usize, StoreError> {
    let trackers: Vec<(NetworkContext, BandwidthTracker)> = decode_rows(
        StateKind::BandwidthTracker,
        &store.load_all(StateKind::BandwidthTracker).await?,
    );
    let rules: Vec<(NetworkContext, BandwidthRules)> = decode_rows(
        StateKind::BandwidthRules,
        &store.load_all(StateKind::BandwidthRules).await?,
    );
    let loaded = trackers.len() + rules.len();
    manager.load_state(trackers, rules);
    info!(rows = loaded, "loaded bandwidth state");
    Ok(loaded)
}

/// Writes every non-ephemeral session if any changed since the last save.
///
/// # Errors
///
/// Fails if a cookie jar cannot be serialized or the store fails.
#[instrument(skip_all)]
pub async fn save_sessions(
    store: &dyn StateStore,
    sessions: &SessionManager,
) -> Result<(), StoreError> {
    if !sessions.is_dirty() {
        debug!("sessions clean, nothing to save");
        return Ok(());
    }
    sessions.mark_clean();
    let result = write_sessions(store, sessions).await;
    if result.is_err() {
        sessions.mark_dirty();
    }
    result
}

async fn write_sessions(
    store: &dyn StateStore,
    sessions: &SessionManager,
) -> Result<(), StoreError> {
    let rows = sessions
        .persistent_sessions()?
        .into_iter()
        .map(|(context, json)| {
            let mut row = encode(StateKind::Session, &context, &())?;
            row.blob = json;
            Ok(row)
        })
        .collect::<Result<Vec<_>, StoreError>>()?;
    let count = rows.len();
    store.replace_all(StateKind::Session, rows).await?;
    info!(sessions = count, "saved sessions");
    Ok(())
}

/// Restores sessions, dropping their session-only cookies. Returns how many
/// loaded.
///
/// # Errors
///
/// Fails only if the store itself fails; bad rows are skipped.
#[instrument(skip_all)]
pub async fn load_sessions(
    store: &dyn StateStore,
    sessions: &SessionManager,
) -> Result<usize, StoreError> {
    let mut loaded = 0;
    for row in store.load_all(StateKind::Session).await? {
        let Some(context) = decode_context(StateKind::Session, &row) else {
            continue;
        };
        match sessions.load_session(context, &row.blob) {
            Ok(()) => loaded += 1,
            Err(e) => warn!(error = %e, "skipping corrupt session"),
        }
    }
    sessions.mark_clean();
    info!(sessions = loaded, "loaded sessions");
    Ok(loaded)
}
