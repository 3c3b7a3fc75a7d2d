//! Bandwidth and session state survive closing and reopening the database.

use std::sync::Arc;
use std::time::Duration;

use netjob_core::bandwidth::{BandwidthManager, BandwidthRule, BandwidthRules};
use netjob_core::clock::ManualClock;
use netjob_core::context::NetworkContext;
use netjob_core::domain::DefaultDomainNormalizer;
use netjob_core::persist::{load_bandwidth, load_sessions, save_bandwidth, save_sessions};
use netjob_core::{Database, SessionManager, SqliteStateStore};
use tempfile::TempDir;
use url::Url;

const T0: u64 = 1_700_000_000;

async fn open(dir: &TempDir) -> SqliteStateStore {
    SqliteStateStore::new(Database::new(&dir.path().join("state.db")).await.unwrap())
}

fn sessions(clock: Arc<ManualClock>) -> SessionManager {
    SessionManager::new(
        clock,
        Arc::new(DefaultDomainNormalizer),
        Duration::from_secs(3600),
    )
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T0));
    let domain = NetworkContext::domain("example.com");
    let url = Url::parse("https://example.com/").unwrap();

    {
        let store = open(&dir).await;
        let manager = BandwidthManager::new(clock.clone());
        for _ in 0..3 {
            manager.report_request_used(&[NetworkContext::global(), domain.clone()]);
        }
        manager.report_data_used(&[NetworkContext::global(), domain.clone()], 4096);
        manager.set_rules(
            domain.clone(),
            BandwidthRules::new().with_rule(BandwidthRule::requests(Some(60), 10)),
        );
        save_bandwidth(&store, &manager).await.unwrap();

        let sessions = sessions(clock.clone());
        sessions
            .get_session(&domain)
            .add_cookie("remember=yes; Max-Age=86400", &url);
        save_sessions(&store, &sessions).await.unwrap();
        drop(store);
    }

    let store = open(&dir).await;
    assert!(store.database().is_wal_enabled().await.unwrap());

    let manager = BandwidthManager::new(clock.clone());
    assert!(load_bandwidth(&store, &manager).await.unwrap() >= 3);
    let (_, tracker) = manager
        .contexts_and_trackers(true)
        .into_iter()
        .find(|(context, _)| *context == domain)
        .unwrap();
    assert_eq!(tracker.total_requests(), 3);
    assert_eq!(tracker.total_bytes(), 4096);
    assert_eq!(
        manager.rules(&domain),
        BandwidthRules::new().with_rule(BandwidthRule::requests(Some(60), 10))
    );
    assert!(!manager.is_dirty());

    let sessions = sessions(clock);
    assert_eq!(load_sessions(&store, &sessions).await.unwrap(), 1);
    assert!(sessions.get_session(&domain).has_cookie(&url, "remember"));
}

#[tokio::test]
async fn test_clean_state_is_not_rewritten() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;
    let manager = BandwidthManager::new(Arc::new(ManualClock::new(T0)));
    manager.report_request_used(&[NetworkContext::global()]);
    save_bandwidth(&store, &manager).await.unwrap();

    // a second manager that never changed must not wipe the saved rows
    let untouched = BandwidthManager::new(Arc::new(ManualClock::new(T0)));
    untouched.mark_clean();
    save_bandwidth(&store, &untouched).await.unwrap();

    let restored = BandwidthManager::new(Arc::new(ManualClock::new(T0)));
    load_bandwidth(&store, &restored).await.unwrap();
    assert!(
        restored
            .contexts_and_trackers(true)
            .iter()
            .any(|(context, tracker)| context.is_global() && tracker.total_requests() == 1)
    );
}
