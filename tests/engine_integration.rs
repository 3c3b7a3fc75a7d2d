//! Integration tests for the network engine against a mock HTTP server.
//!
//! Each test runs a real engine (coordinator, worker pool, connection pool,
//! sessions) with unrestricted bandwidth so admission never delays requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use netjob_core::bandwidth::BandwidthManager;
use netjob_core::clock::SystemClock;
use netjob_core::config::NetworkConfig;
use netjob_core::context::NetworkContext;
use netjob_core::network::{
    EngineHandle, JobKind, JobState, LoginPolicy, LoginProcess, NetworkEngine, NetworkError,
    NetworkJob, NetworkServices,
};
use reqwest::Method;
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[macro_use]
mod support;

fn test_config() -> NetworkConfig {
    NetworkConfig {
        engine_tick_ms: 20,
        request_timeout_secs: 5,
        login_poll_secs: 1,
        ..NetworkConfig::default()
    }
}

fn start_engine(config: NetworkConfig) -> NetworkEngine {
    let services = NetworkServices::new(config)
        .unwrap()
        .with_bandwidth(Arc::new(BandwidthManager::unrestricted(Arc::new(
            SystemClock,
        ))));
    NetworkEngine::start(services)
}

fn get(server: &MockServer, route: &str) -> Arc<NetworkJob> {
    Arc::new(NetworkJob::web_get(&format!("{}{route}", server.uri())).unwrap())
}

async fn run(engine: &NetworkEngine, job: &Arc<NetworkJob>) -> JobState {
    engine.add_job(Arc::clone(job));
    tokio::time::timeout(Duration::from_secs(20), job.wait_until_done())
        .await
        .expect("job did not finish in time")
}

#[tokio::test]
async fn test_job_downloads_body_into_memory() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello world"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let job = get(&server, "/hello");
    assert_eq!(run(&engine, &job).await, JobState::Done);

    assert_eq!(job.content().unwrap().as_ref(), b"hello world");
    let status = job.status();
    assert_eq!(status.text, "done!");
    assert_eq!(status.bytes_read, 11);
    assert_eq!(status.bytes_expected, Some(11));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_job_streams_to_destination_file() {
    let server = require_mock_server!();
    let body = vec![7u8; 200_000];
    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let destination = dir.path().join("big.bin");
    let engine = start_engine(test_config());
    let job = Arc::new(
        NetworkJob::web_get(&format!("{}/big.bin", server.uri()))
            .unwrap()
            .with_destination(&destination),
    );
    assert_eq!(run(&engine, &job).await, JobState::Done);

    assert!(job.content().is_none());
    assert_eq!(std::fs::read(&destination).unwrap(), body);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_not_found_errors_with_status_text() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let job = get(&server, "/missing");
    assert_eq!(run(&engine, &job).await, JobState::Errored);
    assert_eq!(job.status().text, "404 - Not Found");
    assert_eq!(job.error().unwrap().status(), Some(404));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_redirect_chain_resolves() {
    let server = require_mock_server!();
    Mock::given(path("/a"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/b"))
        .mount(&server)
        .await;
    Mock::given(path("/b"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/c"))
        .mount(&server)
        .await;
    Mock::given(path("/c"))
        .respond_with(ResponseTemplate::new(200).set_body_string("final"))
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let job = get(&server, "/a");
    assert_eq!(run(&engine, &job).await, JobState::Done);
    assert_eq!(job.final_url().unwrap().path(), "/c");
    assert_eq!(job.content().unwrap().as_ref(), b"final");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_redirect_loop_is_detected() {
    let server = require_mock_server!();
    Mock::given(path("/a"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/b"))
        .mount(&server)
        .await;
    Mock::given(path("/b"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/a"))
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let job = get(&server, "/a");
    assert_eq!(run(&engine, &job).await, JobState::Errored);
    assert!(matches!(
        job.error().as_deref(),
        Some(NetworkError::RedirectLoop { .. })
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_too_many_redirects() {
    let server = require_mock_server!();
    for hop in 0..4 {
        Mock::given(path(format!("/hop{hop}")))
            .respond_with(
                ResponseTemplate::new(307).insert_header("location", format!("/hop{}", hop + 1)),
            )
            .mount(&server)
            .await;
    }

    let engine = start_engine(NetworkConfig {
        max_redirects: 2,
        ..test_config()
    });
    let job = get(&server, "/hop0");
    assert_eq!(run(&engine, &job).await, JobState::Errored);
    assert!(matches!(
        job.error().as_deref(),
        Some(NetworkError::TooManyRedirects { max: 2, .. })
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_post_timeout_is_not_retried() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/submit"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .expect(1)
        .mount(&server)
        .await;

    let engine = start_engine(NetworkConfig {
        request_timeout_secs: 1,
        ..test_config()
    });
    let url = Url::parse(&format!("{}/submit", server.uri())).unwrap();
    let job = Arc::new(NetworkJob::new(JobKind::Web, Method::POST, url).with_body("payload"));
    assert_eq!(run(&engine, &job).await, JobState::Errored);
    assert!(job.error().unwrap().is_transient());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_get_timeout_is_retried_on_fresh_connections() {
    let server = require_mock_server!();
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let engine = start_engine(NetworkConfig {
        request_timeout_secs: 1,
        ..test_config()
    });
    let job = get(&server, "/slow");
    assert_eq!(run(&engine, &job).await, JobState::Errored);
    assert!(job.error().unwrap().is_transient());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cookies_from_one_job_reach_the_next() {
    let server = require_mock_server!();
    Mock::given(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=abc; Path=/"))
        .mount(&server)
        .await;
    Mock::given(path("/private"))
        .and(header("cookie", "sid=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("secret"))
        .mount(&server)
        .await;
    Mock::given(path("/private"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    assert_eq!(run(&engine, &get(&server, "/login")).await, JobState::Done);
    let private = get(&server, "/private");
    assert_eq!(run(&engine, &private).await, JobState::Done);
    assert_eq!(private.content().unwrap().as_ref(), b"secret");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_max_jobs_bounds_concurrent_downloads() {
    let server = require_mock_server!();
    Mock::given(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("ok")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let engine = start_engine(NetworkConfig {
        max_jobs: 2,
        ..test_config()
    });
    let jobs: Vec<_> = (0..6).map(|_| get(&server, "/slow")).collect();
    for job in &jobs {
        engine.add_job(Arc::clone(job));
    }

    let mut peak = 0;
    while !jobs.iter().all(|job| job.is_done()) {
        let downloading = jobs
            .iter()
            .filter(|job| job.state() == JobState::Downloading)
            .count();
        peak = peak.max(downloading);
        assert!(engine.status_counts().downloading <= 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(peak <= 2, "peak concurrency was {peak}");
    assert!(jobs.iter().all(|job| job.state() == JobState::Done));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_interrupts_download() {
    let server = require_mock_server!();
    Mock::given(path("/stall"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let job = get(&server, "/stall");
    engine.add_job(Arc::clone(&job));
    while job.state() != JobState::Downloading {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let started = Instant::now();
    job.cancel();
    let state = tokio::time::timeout(Duration::from_secs(2), job.wait_until_done())
        .await
        .unwrap();
    assert_eq!(state, JobState::Cancelled);
    assert_eq!(job.status().text, "cancelled!");
    assert!(started.elapsed() < Duration::from_secs(2));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_after_is_waited_out() {
    let server = require_mock_server!();
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(path("/busy"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ready"))
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let started = Instant::now();
    let job = get(&server, "/busy");
    assert_eq!(run(&engine, &job).await, JobState::Done);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(job.content().unwrap().as_ref(), b"ready");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_service_version_mismatch_is_fatal() {
    let server = require_mock_server!();
    Mock::given(path("/api"))
        .respond_with(ResponseTemplate::new(200).insert_header("server", "hydrus client api/21"))
        .expect(1)
        .mount(&server)
        .await;

    let engine = start_engine(test_config());
    let url = Url::parse(&format!("{}/api", server.uri())).unwrap();
    let job = Arc::new(NetworkJob::new(
        JobKind::Service {
            service_key: "local".to_string(),
            service_type_name: "hydrus client api".to_string(),
            network_version: 20,
        },
        Method::GET,
        url,
    ));
    assert_eq!(run(&engine, &job).await, JobState::Errored);
    let error = job.error().unwrap();
    assert!(matches!(*error, NetworkError::VersionMismatch(_)));
    assert!(error.to_string().contains("Your client is outdated"));
    engine.shutdown().await;
}

/// Requires a login for every job until the session holds an `auth` cookie.
#[derive(Debug)]
struct CookieLogin {
    login_url: String,
    logged_in: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct CookieLoginProcess {
    login_url: String,
    context: NetworkContext,
    logged_in: Arc<AtomicBool>,
}

#[async_trait]
impl LoginProcess for CookieLoginProcess {
    async fn start(&mut self, engine: EngineHandle) -> Result<(), NetworkError> {
        let url = Url::parse(&self.login_url).map_err(|_| NetworkError::invalid_url(&self.login_url))?;
        let job = Arc::new(NetworkJob::new(JobKind::Login, Method::POST, url.clone()));
        engine.add_job(Arc::clone(&job));
        if job.wait_until_done().await != JobState::Done {
            return Err(NetworkError::login_failed(&self.context, job.status().text));
        }
        let session = engine.services().sessions.get_session(&self.context);
        if !session.has_cookie(&url, "auth") {
            return Err(NetworkError::login_failed(&self.context, "no auth cookie"));
        }
        self.logged_in.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl LoginPolicy for CookieLogin {
    fn needs_login(&self, _context: &NetworkContext, _url: &str) -> bool {
        !self.logged_in.load(Ordering::SeqCst)
    }

    fn can_login(&self, _context: &NetworkContext) -> Result<(), String> {
        Ok(())
    }

    fn generate_login_process(&self, context: &NetworkContext) -> Box<dyn LoginProcess> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::new(CookieLoginProcess {
            login_url: self.login_url.clone(),
            context: context.clone(),
            logged_in: Arc::clone(&self.logged_in),
        })
    }
}

#[tokio::test]
async fn test_jobs_wait_for_single_login() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "auth=1; Path=/"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(path("/members"))
        .and(header("cookie", "auth=1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
        .mount(&server)
        .await;

    let attempts = Arc::new(AtomicUsize::new(0));
    let policy = CookieLogin {
        login_url: format!("{}/login", server.uri()),
        logged_in: Arc::new(AtomicBool::new(false)),
        attempts: Arc::clone(&attempts),
    };
    let services = NetworkServices::new(test_config())
        .unwrap()
        .with_bandwidth(Arc::new(BandwidthManager::unrestricted(Arc::new(
            SystemClock,
        ))))
        .with_login_policy(Arc::new(policy));
    let engine = NetworkEngine::start(services);

    let jobs: Vec<_> = (0..3).map(|_| get(&server, "/members")).collect();
    for job in &jobs {
        assert_eq!(run(&engine, job).await, JobState::Done);
        assert_eq!(job.content().unwrap().as_ref(), b"welcome");
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    engine.shutdown().await;
}
