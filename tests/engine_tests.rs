//! End-to-end engine tests against mock HTTP servers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crawlcore::config::RunConfig;
use crawlcore::engine::Engine;
use crawlcore::host_key;
use crawlcore::metrics::Metrics;
use crawlcore::storage::{MemoryStore, RunId, RunStatus, Store};
use crawlcore::telemetry::Telemetry;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(seed: &str) -> RunConfig {
    RunConfig {
        seed_url: seed.to_string(),
        max_depth: 2,
        max_pages: 10,
        time_budget_secs: 30,
        max_links_per_page: 100,
        global_concurrency: 8,
        per_host_concurrency: 2,
        user_agent: "crawlcore-test/0.1".to_string(),
        respect_robots: true,
        robots_ttl_secs: 300,
        request_timeout_secs: 5,
        header_timeout_secs: 5,
        tls_handshake_timeout_secs: 5,
        idle_conn_timeout_secs: 30,
        max_body_bytes: 1 << 20,
        retry_max: 2,
        retry_base_delay_ms: 10,
        circuit_trip_count: 5,
        circuit_reset_secs: 30,
    }
}

async fn start_engine(cfg: RunConfig) -> (Arc<Engine>, Arc<MemoryStore>, Arc<Telemetry>, RunId) {
    let store = Arc::new(MemoryStore::new());
    let telemetry = Telemetry::new();
    let metrics = Metrics::new();
    let run_id = store.create_run(cfg.clone()).await.unwrap();
    let engine = Engine::new(
        run_id,
        cfg.clone(),
        store.clone(),
        telemetry.clone(),
        metrics,
    )
    .unwrap();
    engine.start(&cfg.seed_url);
    (engine, store, telemetry, run_id)
}

async fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

fn server_host(server: &MockServer) -> String {
    host_key(&Url::parse(&server.uri()).unwrap())
}

fn html(body: impl Into<String>) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html")
        .set_body_string(body.into())
}

async fn page_requests(server: &MockServer, page_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == page_path)
        .count()
}

#[tokio::test]
async fn crawl_records_pages_and_cross_host_edges() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><body><a href="/b">B</a><a href="{}/">C</a></body></html>"#,
            server_b.uri()
        )))
        .mount(&server_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(html("<html><body>leaf</body></html>"))
        .mount(&server_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html("<html><body>other host</body></html>"))
        .mount(&server_b)
        .await;

    let cfg = test_config(&format!("{}/", server_a.uri()));
    let (engine, store, telemetry, run_id) = start_engine(cfg).await;
    let mut frames = telemetry.subscribe();

    assert!(
        wait_for(Duration::from_secs(10), || {
            store
                .pages_for_run(run_id)
                .iter()
                .filter(|p| p.is_success())
                .count()
                == 3
        })
        .await,
        "expected three fetched pages"
    );

    // The stream is live while the run is.
    let frame = tokio::time::timeout(Duration::from_secs(2), frames.next_frame())
        .await
        .expect("frame within two intervals");
    assert!(frame.is_some());

    engine.stop();
    engine.done().await;

    assert_eq!(engine.pages_fetched(), 3);
    let host_a = server_host(&server_a);
    let host_b = server_host(&server_b);
    assert!(store.edge_count(run_id, &host_a, &host_b) >= 1);

    let pages = store.pages_for_run(run_id);
    let urls: Vec<&str> = pages.iter().map(|p| p.url.as_str()).collect();
    assert!(urls.iter().any(|u| u.ends_with("/b")));
    assert!(pages.iter().all(|p| p.depth <= 2));
}

#[tokio::test]
async fn transient_errors_retry_to_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html("<html><body>finally</body></html>"))
        .mount(&server)
        .await;

    let cfg = test_config(&format!("{}/", server.uri()));
    let (engine, store, _telemetry, run_id) = start_engine(cfg).await;

    assert!(
        wait_for(Duration::from_secs(10), || {
            store
                .pages_for_run(run_id)
                .iter()
                .filter(|p| p.is_success())
                .count()
                == 1
        })
        .await,
        "expected the retried fetch to succeed"
    );

    let status_errors: Vec<_> = store
        .errors_for_run(run_id)
        .into_iter()
        .filter(|e| e.class == "status")
        .collect();
    assert_eq!(status_errors.len(), 2);
    assert!(status_errors.iter().all(|e| e.url == status_errors[0].url));

    // A green result snapped the breaker back shut.
    let host = server_host(&server);
    let state = engine.scheduler().host_state(&host).unwrap();
    assert_eq!(state.circuit_state(), crawlcore::CircuitState::Closed);

    engine.stop();
    engine.done().await;
    assert_eq!(engine.pages_fetched(), 1);
}

#[tokio::test]
async fn breaker_opens_then_admits_one_probe() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut cfg = test_config(&format!("{}/", server.uri()));
    cfg.circuit_trip_count = 2;
    cfg.circuit_reset_secs = 2;
    let (engine, _store, _telemetry, _run_id) = start_engine(cfg).await;

    // Two failing attempts land quickly, tripping the breaker.
    let deadline = Instant::now() + Duration::from_secs(5);
    while page_requests(&server, "/").await < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(page_requests(&server, "/").await, 2);

    let host = server_host(&server);
    assert!(
        wait_for(Duration::from_secs(2), || {
            engine
                .scheduler()
                .host_state(&host)
                .map(|s| s.circuit_state() == crawlcore::CircuitState::Open)
                .unwrap_or(false)
        })
        .await
    );

    // Within the reset window nothing is dispatched for the host.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(page_requests(&server, "/").await, 2);

    // After the window a single probe goes out (and fails terminally).
    let deadline = Instant::now() + Duration::from_secs(5);
    while page_requests(&server, "/").await < 3 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(page_requests(&server, "/").await, 3);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(page_requests(&server, "/").await, 3);

    engine.stop();
    engine.done().await;
}

#[tokio::test]
async fn robots_denied_paths_are_never_fetched() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /private"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(
            r#"<html><body><a href="/private">secret</a><a href="/public">open</a></body></html>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/public"))
        .respond_with(html("<html><body>fine</body></html>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/private"))
        .respond_with(html("<html><body>should never be served</body></html>"))
        .mount(&server)
        .await;

    let cfg = test_config(&format!("{}/", server.uri()));
    let (engine, store, _telemetry, run_id) = start_engine(cfg).await;

    assert!(
        wait_for(Duration::from_secs(10), || {
            let pages = store.pages_for_run(run_id);
            let fetched = pages.iter().filter(|p| p.is_success()).count();
            let denied = pages
                .iter()
                .filter(|p| p.error_class.as_deref() == Some("robots_denied"))
                .count();
            fetched == 2 && denied == 1
        })
        .await,
        "expected two fetched pages and one robots drop"
    );
    engine.stop();
    engine.done().await;

    assert_eq!(page_requests(&server, "/private").await, 0);

    let pages = store.pages_for_run(run_id);
    let denied = pages
        .iter()
        .find(|p| p.error_class.as_deref() == Some("robots_denied"))
        .unwrap();
    assert!(denied.url.ends_with("/private"));
    assert!(denied.status_code.is_none());
}

#[tokio::test]
async fn oversized_bodies_record_size_limit_and_no_children() {
    let server = MockServer::start().await;
    let big = format!(
        r#"<html><body><a href="/child">c</a>{}</body></html>"#,
        "x".repeat(4096)
    );
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(big))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/child"))
        .respond_with(html("<html><body>child</body></html>"))
        .mount(&server)
        .await;

    let mut cfg = test_config(&format!("{}/", server.uri()));
    cfg.max_body_bytes = 1024;
    let (engine, store, _telemetry, run_id) = start_engine(cfg).await;

    assert!(
        wait_for(Duration::from_secs(10), || {
            !store.pages_for_run(run_id).is_empty()
        })
        .await
    );
    engine.stop();
    engine.done().await;

    let pages = store.pages_for_run(run_id);
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].error_class.as_deref(), Some("size_limit"));
    assert!(pages[0].size_bytes > 1024);
    assert_eq!(engine.pages_fetched(), 0);
    assert_eq!(page_requests(&server, "/child").await, 0);
}

#[tokio::test]
async fn max_pages_stops_the_run() {
    let server = MockServer::start().await;
    let links: String = (0..50)
        .map(|i| format!(r#"<a href="/p{i}">l</a>"#))
        .collect();
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!("<html><body>{links}</body></html>")))
        .mount(&server)
        .await;

    let mut cfg = test_config(&format!("{}/", server.uri()));
    cfg.max_pages = 1;
    let (engine, store, _telemetry, run_id) = start_engine(cfg).await;

    tokio::time::timeout(Duration::from_secs(10), engine.done())
        .await
        .expect("run should stop itself at the page limit");

    assert_eq!(engine.pages_fetched(), 1);
    let pages = store.pages_for_run(run_id);
    assert_eq!(pages.iter().filter(|p| p.is_success()).count(), 1);
    assert!(pages[0].error_class.is_none());

    let mut stop_recorded = false;
    for _ in 0..100 {
        let run = store.get_run(run_id).await.unwrap();
        if run.status == RunStatus::Stopped && run.stop_reason.as_deref() == Some("max_pages") {
            stop_recorded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(stop_recorded, "run row should record the max_pages stop");

    // Only the seed was ever fetched.
    let non_robots: usize = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() != "/robots.txt")
        .count();
    assert_eq!(non_robots, 1);
}

#[tokio::test]
async fn redirects_keep_depth_and_emit_edges() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("{}/land", server_b.uri()).as_str()),
        )
        .mount(&server_a)
        .await;
    Mock::given(method("GET"))
        .and(path("/land"))
        .respond_with(html("<html><body>landed</body></html>"))
        .mount(&server_b)
        .await;

    let mut cfg = test_config(&format!("{}/", server_a.uri()));
    cfg.max_depth = 1;
    let (engine, store, _telemetry, run_id) = start_engine(cfg).await;

    assert!(
        wait_for(Duration::from_secs(10), || {
            store
                .pages_for_run(run_id)
                .iter()
                .filter(|p| p.is_success())
                .count()
                == 2
        })
        .await,
        "expected the redirect source and target to both be recorded"
    );
    engine.stop();
    engine.done().await;

    let pages = store.pages_for_run(run_id);
    let redirect = pages.iter().find(|p| p.status_code == Some(302)).unwrap();
    assert_eq!(redirect.depth, 0);
    let landed = pages.iter().find(|p| p.url.ends_with("/land")).unwrap();
    // Redirects do not increment depth.
    assert_eq!(landed.depth, 0);
    assert_eq!(landed.status_code, Some(200));

    let host_a = server_host(&server_a);
    let host_b = server_host(&server_b);
    assert!(store.edge_count(run_id, &host_a, &host_b) >= 1);
}
