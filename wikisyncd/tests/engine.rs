use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use wikisyncd::config::EngineConfig;
use wikisyncd::sync::engine::{EngineError, RunPhase, SyncEngine};
use wikisyncd::sync::governor::{ResourceProbe, ResourceThresholds};
use wikisyncd::sync::paths::Layout;
use wikisyncd::sync::state::{FailureKind, RunOutcome};
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FILE: &str = "pages.xml.bz2";
const ARTIFACT: &str = "pages.xml";
const SQL_FILE: &str = "page.sql.gz";
const DUMP_PATH: &str = "/enwiki/latest/enwiki-latest-pages.xml.bz2";
const SQL_PATH: &str = "/enwiki/latest/enwiki-latest-page.sql.gz";
const SUMS_PATH: &str = "/enwiki/latest/enwiki-latest-md5sums.txt";

struct FakeProbe {
    free_disk: u64,
}

impl ResourceProbe for FakeProbe {
    fn free_disk_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.free_disk)
    }

    fn available_memory_bytes(&self) -> u64 {
        8 << 30
    }

    fn cpu_percent(&self) -> f32 {
        5.0
    }
}

/// Free disk is plentiful for the first `healthy_reads` reads, then exhausted.
struct ShrinkingDisk {
    reads: AtomicU32,
    healthy_reads: u32,
}

impl ResourceProbe for ShrinkingDisk {
    fn free_disk_bytes(&self, _path: &Path) -> io::Result<u64> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(if read < self.healthy_reads { 1 << 40 } else { 0 })
    }

    fn available_memory_bytes(&self) -> u64 {
        8 << 30
    }

    fn cpu_percent(&self) -> f32 {
        5.0
    }
}

fn compress(text: &str) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

fn md5_hex(body: &[u8]) -> String {
    format!("{:x}", md5::compute(body))
}

async fn mount_sums(server: &MockServer, entries: &[(&str, String)]) {
    let listing: String = entries
        .iter()
        .map(|(file, digest)| format!("{digest}  enwiki-20240601-{file}\n"))
        .collect();
    Mock::given(method("GET"))
        .and(path(SUMS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing))
        .mount(server)
        .await;
}

/// HEAD advertises `size` bytes whatever the GET later serves.
async fn mount_head(server: &MockServer, dump_path: &str, size: usize, etag: &str) {
    Mock::given(method("HEAD"))
        .and(path(dump_path))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; size])
                .insert_header("etag", etag)
                .insert_header("last-modified", "Sat, 01 Jun 2024 10:00:00 GMT"),
        )
        .mount(server)
        .await;
}

async fn mount_get(server: &MockServer, dump_path: &str, body: &[u8], expected_gets: u64) {
    Mock::given(method("GET"))
        .and(path(dump_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .expect(expected_gets)
        .mount(server)
        .await;
}

/// Serves one dump revision. `listed_digest` overrides the md5sums entry.
async fn publish(server: &MockServer, body: &[u8], etag: &str, listed_digest: Option<&str>) {
    let digest = listed_digest
        .map(str::to_string)
        .unwrap_or_else(|| md5_hex(body));
    mount_sums(server, &[(FILE, digest)]).await;
    mount_head(server, DUMP_PATH, body.len(), etag).await;
}

async fn serve_body(server: &MockServer, body: &[u8], expected_gets: u64) {
    mount_get(server, DUMP_PATH, body, expected_gets).await;
}

fn config(root: &Path, server: &MockServer) -> EngineConfig {
    let mut config = EngineConfig::with_defaults(root);
    config.base_url = server.uri();
    config.files = vec![FILE.to_string()];
    config.retry_attempts = 2;
    config.retry_delay = Duration::from_millis(10);
    config.timeout = Duration::from_secs(5);
    config.thresholds = ResourceThresholds {
        min_free_disk_bytes: 1 << 20,
        min_available_memory_bytes: 1 << 20,
        max_cpu_percent: 95.0,
    };
    config
}

async fn open(config: EngineConfig, free_disk: u64) -> SyncEngine {
    SyncEngine::open_with_probe(
        config,
        Arc::new(FakeProbe { free_disk }),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

fn latest_text(root: &Path) -> String {
    std::fs::read_to_string(Layout::new(root).latest_link(ARTIFACT)).unwrap()
}

#[tokio::test]
async fn first_sync_promotes_and_second_skips() {
    let server = MockServer::start().await;
    let body = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &body, "\"v1\"", None).await;
    serve_body(&server, &body, 1).await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1 << 40).await;

    let first = engine.sync().await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Succeeded);
    assert_eq!(first.files_planned, 1);
    assert_eq!(first.files_transferred, 1);
    assert_eq!(first.bytes_transferred, body.len() as i64);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v1</mediawiki>");

    let second = engine.sync().await.unwrap();
    assert_eq!(second.outcome, RunOutcome::Succeeded);
    assert_eq!(second.files_planned, 0);
    assert_eq!(second.files_transferred, 0);
    assert_eq!(engine.store().list_versions(FILE).await.unwrap().len(), 1);
    assert_eq!(engine.phase(), RunPhase::Idle);

    let last = engine.state().last_run().await.unwrap().unwrap();
    assert_eq!(last.id, second.id);
}

#[tokio::test]
async fn low_disk_skips_without_contacting_the_mirror() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1024).await;

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::SkippedInsufficientResources);
    assert!(run.error.unwrap().contains("disk"));
    assert!(engine.state().latest_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn digest_mismatch_keeps_previous_latest() {
    let server = MockServer::start().await;
    let v1 = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &v1, "\"v1\"", None).await;
    serve_body(&server, &v1, 1).await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1 << 40).await;
    assert_eq!(engine.sync().await.unwrap().outcome, RunOutcome::Succeeded);

    server.reset().await;
    let v2 = compress("<mediawiki>v2</mediawiki>");
    publish(&server, &v2, "\"v2\"", Some("00000000000000000000000000000000")).await;
    serve_body(&server, &v2, 1).await;

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::PartialFailure);
    assert_eq!(run.files_failed, 1);
    assert_eq!(run.failures[0].kind, FailureKind::IntegrityMismatch);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v1</mediawiki>");
    assert_eq!(engine.store().list_versions(FILE).await.unwrap().len(), 1);
    assert!(!Layout::new(dir.path()).partial_path(FILE).exists());
}

#[tokio::test]
async fn retention_prunes_superseded_versions_after_sync() {
    let server = MockServer::start().await;
    let v1 = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &v1, "\"v1\"", None).await;
    serve_body(&server, &v1, 1).await;

    let dir = tempdir().unwrap();
    let mut config = config(dir.path(), &server);
    config.retention.keep_versions = 0;
    let engine = open(config, 1 << 40).await;
    engine.sync().await.unwrap();

    server.reset().await;
    let v2 = compress("<mediawiki>v2</mediawiki>");
    publish(&server, &v2, "\"v2\"", None).await;
    serve_body(&server, &v2, 1).await;

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Succeeded);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v2</mediawiki>");
    let versions = engine.store().list_versions(FILE).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].is_latest);
}

#[tokio::test]
async fn status_reports_latest_files_as_json() {
    let server = MockServer::start().await;
    let body = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &body, "\"v1\"", None).await;
    serve_body(&server, &body, 1).await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1 << 40).await;
    engine.sync().await.unwrap();

    let status = serde_json::to_value(engine.status().await.unwrap()).unwrap();
    assert_eq!(status["phase"], "idle");
    assert_eq!(status["last_run"]["outcome"], "succeeded");
    assert_eq!(status["files"][0]["name"], FILE);
    assert_eq!(status["files"][0]["artifact_name"], ARTIFACT);
    assert_eq!(
        status["disk_usage"]["latest"],
        "<mediawiki>v1</mediawiki>".len() as u64
    );
}

#[tokio::test]
async fn second_engine_on_same_root_is_locked_out() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let _engine = open(config(dir.path(), &server), 1 << 40).await;

    let err = SyncEngine::open_with_probe(
        config(dir.path(), &server),
        Arc::new(FakeProbe { free_disk: 1 << 40 }),
        CancellationToken::new(),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, EngineError::Locked(_)));
}

#[tokio::test]
async fn cancelled_engine_records_cancelled_run() {
    let server = MockServer::start().await;
    let body = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &body, "\"v1\"", None).await;
    serve_body(&server, &body, 0).await;

    let dir = tempdir().unwrap();
    let shutdown = CancellationToken::new();
    let engine = SyncEngine::open_with_probe(
        config(dir.path(), &server),
        Arc::new(FakeProbe { free_disk: 1 << 40 }),
        shutdown.clone(),
    )
    .await
    .unwrap();
    shutdown.cancel();

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Cancelled);
    assert_eq!(run.files_deferred, 1);
    assert!(engine.state().latest_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn interrupted_transfer_fails_after_retries_while_other_file_promotes() {
    let server = MockServer::start().await;
    let pages = compress("<mediawiki>v1</mediawiki>");
    let sql = vec![7u8; 1000];
    mount_sums(&server, &[(FILE, md5_hex(&pages)), (SQL_FILE, md5_hex(&sql))]).await;
    mount_head(&server, DUMP_PATH, pages.len(), "\"p1\"").await;
    mount_head(&server, SQL_PATH, sql.len(), "\"s1\"").await;
    mount_get(&server, DUMP_PATH, &pages, 1).await;
    mount_get(&server, SQL_PATH, &sql[..400], 2).await;

    let dir = tempdir().unwrap();
    let mut config = config(dir.path(), &server);
    config.files = vec![FILE.to_string(), SQL_FILE.to_string()];
    let engine = open(config, 1 << 40).await;

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::PartialFailure);
    assert_eq!(run.files_planned, 2);
    assert_eq!(run.files_transferred, 1);
    assert_eq!(run.files_failed, 1);
    assert_eq!(run.failures[0].name, SQL_FILE);
    assert_eq!(run.failures[0].kind, FailureKind::TransferInterrupted);
    assert_eq!(run.bytes_transferred, (pages.len() + 800) as i64);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v1</mediawiki>");
}

#[tokio::test]
async fn corrupt_archive_does_not_block_other_files() {
    let server = MockServer::start().await;
    let pages = compress("<mediawiki>v1</mediawiki>");
    let garbage = b"INSERT INTO page VALUES (1);".to_vec();
    mount_sums(&server, &[(FILE, md5_hex(&pages)), (SQL_FILE, md5_hex(&garbage))]).await;
    mount_head(&server, DUMP_PATH, pages.len(), "\"p1\"").await;
    mount_head(&server, SQL_PATH, garbage.len(), "\"s1\"").await;
    mount_get(&server, DUMP_PATH, &pages, 1).await;
    mount_get(&server, SQL_PATH, &garbage, 1).await;

    let dir = tempdir().unwrap();
    let mut config = config(dir.path(), &server);
    config.files = vec![FILE.to_string(), SQL_FILE.to_string()];
    let engine = open(config, 1 << 40).await;

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::PartialFailure);
    assert_eq!(run.files_transferred, 1);
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].name, SQL_FILE);
    assert_eq!(run.failures[0].kind, FailureKind::UnpackCorrupt);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v1</mediawiki>");
    let layout = Layout::new(dir.path());
    assert!(!layout.latest_link("page.sql").exists());
    assert!(engine.store().list_versions(SQL_FILE).await.unwrap().is_empty());
}

#[tokio::test]
async fn disk_shortage_during_transfer_defers_the_file() {
    let server = MockServer::start().await;
    let body = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &body, "\"v1\"", None).await;
    serve_body(&server, &body, 1).await;

    let dir = tempdir().unwrap();
    let mut config = config(dir.path(), &server);
    config.governor_check_bytes = 1;
    // One read for the run gate, one for the per-file gate.
    let probe = ShrinkingDisk {
        reads: AtomicU32::new(0),
        healthy_reads: 2,
    };
    let engine = SyncEngine::open_with_probe(config, Arc::new(probe), CancellationToken::new())
        .await
        .unwrap();

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::PartialFailure);
    assert_eq!(run.files_deferred, 1);
    assert_eq!(run.files_failed, 0);
    assert_eq!(run.failures[0].kind, FailureKind::TransferAborted);
    assert!(engine.state().latest_records().await.unwrap().is_empty());
    assert!(Layout::new(dir.path()).partial_path(FILE).exists());
}

#[tokio::test]
async fn unavailable_catalog_fails_run_and_keeps_latest() {
    let server = MockServer::start().await;
    let body = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &body, "\"v1\"", None).await;
    serve_body(&server, &body, 1).await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1 << 40).await;
    engine.sync().await.unwrap();

    server.reset().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let run = engine.sync().await.unwrap();
    assert_eq!(run.outcome, RunOutcome::Failed);
    assert!(run.error.is_some());
    assert_eq!(engine.phase(), RunPhase::Idle);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v1</mediawiki>");
    let last = engine.state().last_run().await.unwrap().unwrap();
    assert_eq!(last.outcome, RunOutcome::Failed);
    // Two catalog attempts, each starting with the checksum listing.
    let listing_requests = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == SUMS_PATH)
        .count();
    assert_eq!(listing_requests, 2);
}

#[tokio::test]
async fn concurrent_sync_is_rejected_while_a_run_is_active() {
    let server = MockServer::start().await;
    let body = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &body, "\"v1\"", None).await;
    Mock::given(method("GET"))
        .and(path(DUMP_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1 << 40).await;
    let mut phase = engine.subscribe_phase();

    let (first, second) = tokio::join!(engine.sync(), async {
        phase
            .wait_for(|phase| *phase == RunPhase::Transferring)
            .await
            .unwrap();
        engine.sync().await
    });

    assert!(matches!(second, Err(EngineError::RunInProgress)));
    assert_eq!(first.unwrap().outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn status_during_a_run_shows_only_promoted_versions() {
    let server = MockServer::start().await;
    let v1 = compress("<mediawiki>v1</mediawiki>");
    publish(&server, &v1, "\"v1\"", None).await;
    serve_body(&server, &v1, 1).await;

    let dir = tempdir().unwrap();
    let engine = open(config(dir.path(), &server), 1 << 40).await;
    let first = engine.sync().await.unwrap();
    assert_eq!(first.outcome, RunOutcome::Succeeded);
    let promoted = engine.state().latest_records().await.unwrap()[0].0.version_id;

    server.reset().await;
    let v2 = compress("<mediawiki>v2</mediawiki>");
    publish(&server, &v2, "\"v2\"", None).await;
    Mock::given(method("GET"))
        .and(path(DUMP_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(v2.clone())
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let mut phase = engine.subscribe_phase();
    let (run, (status, during)) = tokio::join!(engine.sync(), async {
        phase
            .wait_for(|phase| *phase == RunPhase::Transferring)
            .await
            .unwrap();
        (engine.status().await.unwrap(), latest_text(dir.path()))
    });

    assert_eq!(status.phase, Some(RunPhase::Transferring));
    assert_eq!(status.files.len(), 1);
    assert_eq!(status.files[0].version_id, promoted);
    assert_eq!(during, "<mediawiki>v1</mediawiki>");
    assert_eq!(run.unwrap().outcome, RunOutcome::Succeeded);
    assert_eq!(latest_text(dir.path()), "<mediawiki>v2</mediawiki>");
}
