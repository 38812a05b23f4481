//! Integration tests for cf-origin-rewrite
//!
//! Covers:
//! - Deploying domain and path-scoped workers end to end
//! - Destroy and read phases against durable state
//! - Session finalization on engine failure
//! - Forwarding to an upstream (redirects, error statuses)
//! - Serving deployed workers through the edge host
//! - The `infra` binary's configuration failures

use async_trait::async_trait;
use cf_origin_rewrite::config::{self, Environment, ExplicitOptions, GeneralOptions};
use cf_origin_rewrite::{
    Credentials, DeployedWorker, DeploymentConfig, EdgeForwarder, EdgeHost, EngineError, HostConfig,
    LocalEngine, Orchestrator, Outcome, Phase, ProvisioningEngine, ProxySpec, RouteBinding,
    SessionKey, SqliteStateStore, StateMode, StateStore, WorkerRegistry,
};
use parking_lot::Mutex;
use std::process::Command;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// Counter for unique port allocation
static PORT_COUNTER: AtomicU16 = AtomicU16::new(19400);

fn get_unique_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn deployment(phase: Phase, from_route: &str, to_route: &str) -> DeploymentConfig {
    let env: Environment = [
        ("CLOUDFLARE_ACCOUNT_ID", "acct"),
        ("CLOUDFLARE_API_TOKEN", "token"),
        ("SECRET_ALCHEMY_PASSPHRASE", "0123456789abcdef0123456789abcdef"),
        ("FROM_ROUTE", from_route),
        ("TO_ROUTE", to_route),
    ]
    .into_iter()
    .collect();

    let general = GeneralOptions {
        phase,
        ..Default::default()
    };

    config::resolve(general, &[&ExplicitOptions::default(), &env]).unwrap()
}

/// Durable orchestrator over on-disk state and platform databases
fn setup_orchestrator(dir: &std::path::Path) -> (Orchestrator, Arc<WorkerRegistry>, Arc<SqliteStateStore>) {
    let registry = Arc::new(WorkerRegistry::open(dir.join("platform.db")).unwrap());
    let store = Arc::new(SqliteStateStore::open(dir.join("state.db")).unwrap());
    let orchestrator = Orchestrator::new(
        Arc::new(LocalEngine::new(registry.clone())),
        StateMode::Durable(store.clone()),
    );
    (orchestrator, registry, store)
}

/// Engine double that records calls and can be told to fail
#[derive(Default)]
struct RecordingEngine {
    applied: Mutex<Vec<ProxySpec>>,
    deleted: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl ProvisioningEngine for RecordingEngine {
    async fn apply(
        &self,
        credentials: &Credentials,
        spec: &ProxySpec,
    ) -> Result<DeployedWorker, EngineError> {
        if self.fail {
            return Err(EngineError::Rejected {
                resource: spec.name.clone(),
                reason: "quota exceeded".to_string(),
            });
        }
        self.applied.lock().push(spec.clone());
        Ok(DeployedWorker {
            id: "worker-1".to_string(),
            account_id: credentials.account_id.clone(),
            spec: spec.clone(),
            created_at: "now".to_string(),
            updated_at: "now".to_string(),
        })
    }

    async fn delete(&self, _credentials: &Credentials, name: &str) -> Result<bool, EngineError> {
        self.deleted.lock().push(name.to_string());
        Ok(true)
    }
}

#[tokio::test]
async fn test_up_domain_proxy() {
    let dir = tempdir().unwrap();
    let (orchestrator, registry, store) = setup_orchestrator(dir.path());

    let config = deployment(Phase::Up, "api.example.com", "https://origin.example.com");
    let outcome = orchestrator.run(&config).await.unwrap();

    let worker = match outcome {
        Outcome::Deployed { url, worker } => {
            assert_eq!(url, "api.example.com");
            worker
        }
        other => panic!("unexpected outcome {:?}", other),
    };

    assert_eq!(worker.spec.name, "cf-origin-rewrite-dev");
    assert_eq!(worker.spec.binding.domains(), vec!["api.example.com"]);
    assert!(worker.spec.binding.routes().is_empty());
    assert_eq!(worker.spec.from_route(), Some("api.example.com"));
    assert_eq!(worker.spec.to_route(), Some("https://origin.example.com"));

    assert_eq!(registry.list().unwrap(), vec![worker.clone()]);
    let key = SessionKey::new("cf-origin-rewrite", "dev");
    assert_eq!(store.resources(&key).unwrap(), vec![worker]);
}

#[tokio::test]
async fn test_up_path_scoped_route() {
    let dir = tempdir().unwrap();
    let (orchestrator, _registry, _store) = setup_orchestrator(dir.path());

    let config = deployment(Phase::Up, "example.com/api/*", "https://origin.example.com");
    match orchestrator.run(&config).await.unwrap() {
        Outcome::Deployed { worker, .. } => {
            assert_eq!(worker.spec.binding, RouteBinding::Route("example.com/api/*".to_string()));
            assert!(worker.spec.binding.domains().is_empty());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_up_twice_supersedes() {
    let dir = tempdir().unwrap();
    let (orchestrator, registry, _store) = setup_orchestrator(dir.path());

    orchestrator
        .run(&deployment(Phase::Up, "api.example.com", "https://one.example.com"))
        .await
        .unwrap();
    orchestrator
        .run(&deployment(Phase::Up, "api.example.com", "https://two.example.com"))
        .await
        .unwrap();

    let workers = registry.list().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].spec.to_route(), Some("https://two.example.com"));
}

#[tokio::test]
async fn test_destroy_never_applies() {
    let store = Arc::new(SqliteStateStore::in_memory().unwrap());
    let engine = Arc::new(RecordingEngine::default());
    let orchestrator = Orchestrator::new(engine.clone(), StateMode::Durable(store.clone()));

    orchestrator
        .run(&deployment(Phase::Up, "api.example.com", "https://origin.example.com"))
        .await
        .unwrap();
    assert_eq!(engine.applied.lock().len(), 1);

    let outcome = orchestrator
        .run(&deployment(Phase::Destroy, "api.example.com", "https://origin.example.com"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Outcome::Destroyed {
            removed: vec!["cf-origin-rewrite-dev".to_string()]
        }
    );
    assert_eq!(engine.applied.lock().len(), 1);
    assert_eq!(*engine.deleted.lock(), vec!["cf-origin-rewrite-dev".to_string()]);

    // Nothing left to tear down
    let outcome = orchestrator
        .run(&deployment(Phase::Destroy, "api.example.com", "https://origin.example.com"))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Destroyed { removed: vec![] });
    assert_eq!(engine.deleted.lock().len(), 1);
}

#[tokio::test]
async fn test_read_does_not_mutate() {
    let store = Arc::new(SqliteStateStore::in_memory().unwrap());
    let engine = Arc::new(RecordingEngine::default());
    let orchestrator = Orchestrator::new(engine.clone(), StateMode::Durable(store.clone()));

    let outcome = orchestrator
        .run(&deployment(Phase::Read, "api.example.com", "https://origin.example.com"))
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::State { workers: vec![] });
    assert!(engine.applied.lock().is_empty());
    assert!(engine.deleted.lock().is_empty());
    // A read never enrolls the passphrase
    let key = SessionKey::new("cf-origin-rewrite", "dev");
    assert!(store.verifier(&key).unwrap().is_none());
}

#[tokio::test]
async fn test_failed_up_still_finalizes() {
    let store = Arc::new(SqliteStateStore::in_memory().unwrap());
    let engine = Arc::new(RecordingEngine {
        fail: true,
        ..Default::default()
    });
    let orchestrator = Orchestrator::new(engine, StateMode::Durable(store.clone()));

    let err = orchestrator
        .run(&deployment(Phase::Up, "api.example.com", "https://origin.example.com"))
        .await
        .unwrap_err();

    assert_eq!(err.phase, Phase::Up);
    assert!(err.to_string().contains("quota exceeded"));

    let key = SessionKey::new("cf-origin-rewrite", "dev");
    assert!(store.verifier(&key).unwrap().is_some());
    assert!(store.resources(&key).unwrap().is_empty());
}

#[tokio::test]
async fn test_wrong_passphrase_fails_phase() {
    let dir = tempdir().unwrap();
    let (orchestrator, registry, _store) = setup_orchestrator(dir.path());

    orchestrator
        .run(&deployment(Phase::Up, "api.example.com", "https://origin.example.com"))
        .await
        .unwrap();

    let mut intruder = deployment(Phase::Destroy, "api.example.com", "https://origin.example.com");
    intruder.passphrase = "guess".to_string();

    let err = orchestrator.run(&intruder).await.unwrap_err();
    assert!(matches!(err.source, EngineError::PassphraseMismatch(_)));
    assert_eq!(registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_forwarder_returns_upstream_response() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-origin", "yes")
                .set_body_string("ORIGIN_BODY"),
        )
        .mount(&upstream)
        .await;

    let forwarder = EdgeForwarder::with_routes("api.example.com", format!("{}/", upstream.uri())).unwrap();
    let response = forwarder.fetch().await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body.as_ref(), b"ORIGIN_BODY");
    assert_eq!(response.headers.get("x-origin").unwrap(), "yes");
}

#[tokio::test]
async fn test_forwarder_follows_redirects() {
    let upstream = MockServer::start().await;
    let location = format!("{}/final", upstream.uri());
    Mock::given(method("GET"))
        .and(path("/start"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", location.as_str()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/final"))
        .respond_with(ResponseTemplate::new(200).set_body_string("LANDED"))
        .mount(&upstream)
        .await;

    let forwarder = EdgeForwarder::with_routes("api.example.com", format!("{}/start", upstream.uri())).unwrap();
    let response = forwarder.fetch().await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.body.as_ref(), b"LANDED");
}

#[tokio::test]
async fn test_forwarder_passes_upstream_errors_through() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).set_body_string("DOWN"))
        .mount(&upstream)
        .await;

    let forwarder = EdgeForwarder::with_routes("api.example.com", upstream.uri()).unwrap();
    let response = forwarder.fetch().await.unwrap();

    assert_eq!(response.status.as_u16(), 503);
    assert_eq!(response.body.as_ref(), b"DOWN");
}

#[tokio::test]
async fn test_edge_host_serves_deployed_worker() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("FROM_ORIGIN"))
        .mount(&upstream)
        .await;

    let dir = tempdir().unwrap();
    let (orchestrator, registry, _store) = setup_orchestrator(dir.path());
    orchestrator
        .run(&deployment(Phase::Up, "api.example.com", &format!("{}/", upstream.uri())))
        .await
        .unwrap();

    let port = get_unique_port();
    let host = Arc::new(EdgeHost::new(HostConfig { port }, registry));
    tokio::spawn(async move {
        let _ = host.run().await;
    });

    // Wait for server to start
    sleep(Duration::from_millis(200)).await;

    let client = reqwest::Client::new();

    // Inbound path and method do not matter
    let response = client
        .post(format!("http://127.0.0.1:{}/some/path?q=1", port))
        .header("Host", "api.example.com")
        .body("ignored")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "FROM_ORIGIN");

    let response = client
        .get(format!("http://127.0.0.1:{}/", port))
        .header("Host", "unknown.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    let response = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_edge_host_unreachable_origin_502() {
    let dir = tempdir().unwrap();
    let (orchestrator, registry, _store) = setup_orchestrator(dir.path());

    // No server running on this port
    let dead_port = get_unique_port();
    orchestrator
        .run(&deployment(
            Phase::Up,
            "example.com/api/*",
            &format!("http://127.0.0.1:{}/", dead_port),
        ))
        .await
        .unwrap();

    let port = get_unique_port();
    let host = Arc::new(EdgeHost::new(HostConfig { port }, registry));
    tokio::spawn(async move {
        let _ = host.run().await;
    });

    sleep(Duration::from_millis(200)).await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}/api/users", port))
        .header("Host", "example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 502);

    // Outside the route pattern
    let response = client
        .get(format!("http://127.0.0.1:{}/other", port))
        .header("Host", "example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[test]
fn test_cli_missing_account_id_exits_1() {
    let dir = tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_infra"))
        .current_dir(dir.path())
        .env_clear()
        .env("CLOUDFLARE_API_TOKEN", "token")
        .env("SECRET_ALCHEMY_PASSPHRASE", "secret")
        .env("FROM_ROUTE", "api.example.com")
        .env("TO_ROUTE", "https://origin.example.com")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("CLOUDFLARE_ACCOUNT_ID is not set. Provide with --cloudflare-account-id or in .env file"));

    // Nothing was provisioned
    assert!(!dir.path().join("data").exists());
}

#[test]
fn test_cli_reads_dotenv_and_flags() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(".env"),
        "CLOUDFLARE_ACCOUNT_ID=acct\nCLOUDFLARE_API_TOKEN=token\nSECRET_ALCHEMY_PASSPHRASE=secret\nTO_ROUTE=https://origin.example.com\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_infra"))
        .current_dir(dir.path())
        .env_clear()
        .args(["--from-route", "api.example.com", "--stage", "prod", "--quiet"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let registry = WorkerRegistry::open(dir.path().join("data").join("platform.db")).unwrap();
    let worker = registry.get("cf-origin-rewrite-prod").unwrap().unwrap();
    assert_eq!(worker.spec.from_route(), Some("api.example.com"));
}

#[test]
fn test_cli_missing_passphrase_suggests_one() {
    let dir = tempdir().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_infra"))
        .current_dir(dir.path())
        .env_clear()
        .args([
            "--cloudflare-account-id",
            "acct",
            "--cloudflare-api-token",
            "token",
            "--from-route",
            "api.example.com",
            "--to-route",
            "https://origin.example.com",
        ])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("SECRET_ALCHEMY_PASSPHRASE is not set"));

    let stdout = String::from_utf8_lossy(&output.stdout);
    let suggestion = stdout
        .lines()
        .find_map(|line| line.strip_prefix("SECRET_ALCHEMY_PASSPHRASE=\""))
        .and_then(|rest| rest.strip_suffix('"'))
        .unwrap();
    assert_eq!(suggestion.len(), 32);
    assert!(suggestion.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
}

#[test]
fn test_cli_malformed_dotenv_reports_error() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(".env"),
        "CLOUDFLARE_ACCOUNT_ID=acct\nthis line is broken\nCLOUDFLARE_API_TOKEN=token\nSECRET_ALCHEMY_PASSPHRASE=secret\nFROM_ROUTE=api.example.com\nTO_ROUTE=https://origin.example.com\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_infra"))
        .current_dir(dir.path())
        .env_clear()
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load"), "{}", stderr);
    assert!(stderr.contains(".env"), "{}", stderr);
    assert!(!stderr.contains("is not set"), "{}", stderr);

    // No suggestion for a passphrase that is sitting in .env
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("SECRET_ALCHEMY_PASSPHRASE="));
    assert!(!dir.path().join("data").exists());
}

#[test]
fn test_cli_dotenv_sets_state_path() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join(".env"),
        "STATE_DB_PATH=custom/state.db\nCLOUDFLARE_ACCOUNT_ID=acct\nCLOUDFLARE_API_TOKEN=token\nSECRET_ALCHEMY_PASSPHRASE=secret\nFROM_ROUTE=api.example.com\nTO_ROUTE=https://origin.example.com\n",
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_infra"))
        .current_dir(dir.path())
        .env_clear()
        .arg("--quiet")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(dir.path().join("custom").join("state.db").exists());
    assert!(!dir.path().join("data").join("state.db").exists());
}
