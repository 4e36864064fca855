use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterlab::adapters::{AdapterError, HTTP_PORT};
use clusterlab::cluster::{Addressing, ClusterOptions};
use clusterlab::consul::ConsulCluster;
use clusterlab::harness::{AgentCommand, Endpoint, Harness, HarnessError, HarnessFuture, Scheme};
use clusterlab::health::{HealthError, HealthOptions, PollContext};
use clusterlab::nomad::NomadCluster;
use clusterlab::runner::{Runner, StartFuture};
use clusterlab::vault::VaultCluster;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

type Log = Arc<Mutex<Vec<String>>>;

/// Every agent it starts answers at the same mock API server, or nowhere
/// when `api_address` is `None`.
struct MockRunner {
    api_address: Option<String>,
    log: Log,
}

struct MockHarness {
    name: String,
    api_address: Option<String>,
    log: Log,
}

impl Runner for MockRunner {
    fn agent_dir(&self, host_dir: &Path) -> PathBuf {
        host_dir.to_path_buf()
    }

    fn start<'a>(&'a self, cmd: &'a AgentCommand) -> StartFuture<'a> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("start {}", cmd.name));
            Ok(Arc::new(MockHarness {
                name: cmd.name.clone(),
                api_address: self.api_address.clone(),
                log: self.log.clone(),
            }) as Arc<dyn Harness>)
        })
    }
}

impl Harness for MockHarness {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self, name: &str, _local: bool) -> Result<Endpoint, HarnessError> {
        let address = self
            .api_address
            .clone()
            .ok_or_else(|| HarnessError::NotListening {
                agent: self.name.clone(),
                port: name.to_string(),
            })?;
        Ok(Endpoint {
            name: name.to_string(),
            scheme: Scheme::Http,
            address,
            ca_file: None,
        })
    }

    fn wait(&self) -> HarnessFuture<'_, ()> {
        Box::pin(std::future::pending())
    }

    fn stop(&self) -> HarnessFuture<'_, ()> {
        Box::pin(async move {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        })
    }
}

fn options(work_dir: &Path, base_port: u16, timeout: Duration) -> ClusterOptions {
    let mut options = ClusterOptions::new("test", work_dir.to_path_buf());
    options.addressing = Addressing::LocalPorts { base_port };
    options.timeout = timeout;
    options.health = HealthOptions {
        interval: Duration::from_millis(20),
    };
    options
}

async fn status_server(leader: &str, peers: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/status/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(leader)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/status/peers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(peers))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn consul_cluster_converges_on_planned_peers() {
    let tmp = tempfile::tempdir().unwrap();
    let server = status_server(
        "127.0.0.1:24001",
        json!(["127.0.0.1:24021", "127.0.0.1:24001", "127.0.0.1:24011"]),
    )
    .await;
    let log = Log::default();
    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: log.clone(),
    };

    let consul = ConsulCluster::new(options(tmp.path(), 24000, Duration::from_secs(5)));
    let cluster = consul
        .start(&PollContext::background(), &runner)
        .await
        .unwrap();

    assert_eq!(cluster.leader, "127.0.0.1:24001");
    assert_eq!(cluster.servers.len(), 3);
    assert!(cluster.clients.is_empty());
    let endpoints = cluster.endpoints(HTTP_PORT, true).unwrap();
    assert_eq!(endpoints.len(), 3);
    assert_eq!(endpoints[0].base_url(), format!("http://{}", server.address()));

    cluster.stop().await.unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "start consul-0",
            "start consul-1",
            "start consul-2",
            "stop consul-0",
            "stop consul-1",
            "stop consul-2",
        ]
    );
}

#[tokio::test]
async fn nomad_cluster_with_missing_peer_times_out_and_stops_agents() {
    let tmp = tempfile::tempdir().unwrap();
    let server = status_server(
        "127.0.0.1:24101",
        json!(["127.0.0.1:24101", "127.0.0.1:24111"]),
    )
    .await;
    let log = Log::default();
    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: log.clone(),
    };

    let mut opts = options(tmp.path(), 24100, Duration::from_millis(300));
    opts.clients = 1;
    let nomad = NomadCluster::new(opts);
    let err = match nomad.start(&PollContext::background(), &runner).await {
        Ok(_) => panic!("expected the health check to time out"),
        Err(err) => err,
    };

    let health = err.downcast_ref::<HealthError>().expect("health error");
    assert_eq!(
        health.expected_peers,
        Some(vec![
            "127.0.0.1:24101".to_string(),
            "127.0.0.1:24111".to_string(),
            "127.0.0.1:24121".to_string(),
        ])
    );
    assert!(health.rounds > 1);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 8, "{log:?}");
    assert!(log.contains(&"stop nomad-client-0".to_string()));
    assert!(log.iter().filter(|l| l.starts_with("stop ")).count() == 4);
}

#[tokio::test]
async fn cancelled_context_aborts_bring_up() {
    let tmp = tempfile::tempdir().unwrap();
    let server = status_server("", json!([])).await;
    let log = Log::default();
    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: log.clone(),
    };

    let ctx = PollContext::background();
    let cancel = ctx.cancel_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let consul = ConsulCluster::new(options(tmp.path(), 24000, Duration::from_secs(30)));
    let started = std::time::Instant::now();
    let err = match consul.start(&ctx, &runner).await {
        Ok(_) => panic!("expected cancellation"),
        Err(err) => err,
    };

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().contains("context cancelled"), "{err}");
    assert_eq!(
        log.lock().unwrap().iter().filter(|l| l.starts_with("stop ")).count(),
        3
    );
}

#[tokio::test]
async fn vault_cluster_is_initialised_unsealed_and_converged() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["aa"],
            "keys_base64": ["qg=="],
            "root_token": "hvs.root",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Vault is not initialized"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "initialized": true,
            "sealed": false,
        })))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ha_enabled": true,
            "is_self": false,
            "leader_address": "http://127.0.0.1:24200",
        })))
        .mount(&server)
        .await;

    let log = Log::default();
    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: log.clone(),
    };

    let vault = VaultCluster::new(options(tmp.path(), 24200, Duration::from_secs(5)));
    let cluster = vault
        .start(&PollContext::background(), &runner)
        .await
        .unwrap();

    assert_eq!(cluster.leader, "http://127.0.0.1:24200");
    let credentials = cluster.vault.clone().unwrap();
    assert_eq!(credentials.root_token, "hvs.root");
    assert_eq!(credentials.unseal_key, "qg==");
    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_api_fails_setup_and_stops_agents() {
    let tmp = tempfile::tempdir().unwrap();
    let log = Log::default();
    let runner = MockRunner {
        api_address: None,
        log: log.clone(),
    };

    let consul = ConsulCluster::new(options(tmp.path(), 24000, Duration::from_secs(30)));
    let started = std::time::Instant::now();
    let err = match consul.start(&PollContext::background(), &runner).await {
        Ok(_) => panic!("expected adapter setup to fail"),
        Err(err) => err,
    };

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(
        matches!(
            err.downcast_ref::<AdapterError>(),
            Some(AdapterError::Endpoint(HarnessError::NotListening { .. }))
        ),
        "{err:?}"
    );
    assert!(err.downcast_ref::<HealthError>().is_none());
    assert_eq!(
        log.lock().unwrap().iter().filter(|l| l.starts_with("stop ")).count(),
        3
    );
}

async fn vault_unseal_and_leader(server: &MockServer, leader: &str) {
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "initialized": true,
            "sealed": false,
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/leader"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ha_enabled": true,
            "is_self": false,
            "leader_address": leader,
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn slow_vault_init_is_waited_for_not_repeated() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "initialized": false,
            "sealed": true,
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "keys": ["aa"],
                    "keys_base64": ["qg=="],
                    "root_token": "hvs.root",
                }))
                .set_delay(Duration::from_millis(2500)),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "errors": ["Vault is already initialized"] })),
        )
        .expect(0)
        .mount(&server)
        .await;
    vault_unseal_and_leader(&server, "http://127.0.0.1:24200").await;

    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: Log::default(),
    };
    let vault = VaultCluster::new(options(tmp.path(), 24200, Duration::from_secs(10)));
    let cluster = vault
        .start(&PollContext::background(), &runner)
        .await
        .unwrap();

    assert_eq!(cluster.vault.clone().unwrap().root_token, "hvs.root");
    cluster.stop().await.unwrap();
}

#[tokio::test]
async fn already_initialised_vault_fails_fast() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/seal-status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "initialized": true,
            "sealed": true,
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(400))
        .expect(0)
        .mount(&server)
        .await;

    let log = Log::default();
    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: log.clone(),
    };
    let vault = VaultCluster::new(options(tmp.path(), 24200, Duration::from_secs(30)));
    let started = std::time::Instant::now();
    let err = match vault.start(&PollContext::background(), &runner).await {
        Ok(_) => panic!("expected init to be refused"),
        Err(err) => err,
    };

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(err.to_string().contains("already initialised"), "{err}");
    assert_eq!(
        log.lock().unwrap().iter().filter(|l| l.starts_with("stop ")).count(),
        3
    );
}

#[tokio::test]
async fn vault_timeout_reports_raft_configuration() {
    let tmp = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["aa"],
            "keys_base64": ["qg=="],
            "root_token": "hvs.root",
        })))
        .mount(&server)
        .await;
    vault_unseal_and_leader(&server, "").await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/storage/raft/configuration"))
        .and(header("X-Vault-Token", "hvs.root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "config": { "servers": [{ "address": "127.0.0.1:24201" }] } },
        })))
        .expect(3)
        .mount(&server)
        .await;

    let runner = MockRunner {
        api_address: Some(server.address().to_string()),
        log: Log::default(),
    };
    let vault = VaultCluster::new(options(tmp.path(), 24200, Duration::from_millis(500)));
    let err = match vault.start(&PollContext::background(), &runner).await {
        Ok(_) => panic!("expected the leader check to time out"),
        Err(err) => err,
    };

    let health = err.downcast_ref::<HealthError>().expect("health error");
    assert!(health.leaders.is_empty(), "{health}");
}
