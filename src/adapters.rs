//! HTTP status API shims for Consul, Nomad and Vault.

use std::{fmt, fs, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    harness::{Endpoint, Harness, HarnessError, Scheme},
    health::{ApiError, ApiFuture, LeaderApi, LeaderPeersApi},
};

/// Port name every builder uses for the agent's HTTP API.
pub const HTTP_PORT: &str = "http";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Initialising integrated storage writes the first raft entries; it can
/// take far longer than a status query.
pub const VAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum AdapterError {
    Endpoint(HarnessError),
    TlsIncomplete { endpoint: String, message: String },
    Client { message: String },
}

impl fmt::Display for AdapterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint(err) => write!(f, "resolve api endpoint: {err}"),
            Self::TlsIncomplete { endpoint, message } => {
                write!(f, "tls material incomplete for {endpoint}: {message}")
            }
            Self::Client { message } => write!(f, "build http client: {message}"),
        }
    }
}

impl std::error::Error for AdapterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Endpoint(err) => Some(err),
            _ => None,
        }
    }
}

impl From<HarnessError> for AdapterError {
    fn from(value: HarnessError) -> Self {
        Self::Endpoint(value)
    }
}

/// A small JSON client bound to one agent's API endpoint.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(endpoint: &Endpoint) -> Result<Self, AdapterError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);

        if endpoint.scheme == Scheme::Https {
            let tls_err = |message: String| AdapterError::TlsIncomplete {
                endpoint: endpoint.base_url(),
                message,
            };
            let ca_file = endpoint
                .ca_file
                .as_ref()
                .ok_or_else(|| tls_err("no CA file".to_string()))?;
            let pem = fs::read(ca_file)
                .map_err(|e| tls_err(format!("read {}: {e}", ca_file.display())))?;
            let ca = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| tls_err(format!("parse {}: {e}", ca_file.display())))?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(ca);
        }

        let client = builder.build().map_err(|e| AdapterError::Client {
            message: e.to_string(),
        })?;
        Ok(Self {
            base_url: endpoint.base_url(),
            client,
        })
    }

    /// Builds a client for the harness's `port` as seen from this machine.
    pub fn from_harness(harness: &dyn Harness, port: &str) -> Result<Self, AdapterError> {
        let endpoint = harness.endpoint(port, true)?;
        Self::new(&endpoint)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<T, ApiError> {
        let mut req = self.client.get(self.url(path));
        if let Some(token) = token {
            req = req.header("X-Vault-Token", token);
        }
        decode(req.send().await.map_err(transport)?).await
    }

    pub async fn put_json<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, ApiError> {
        let resp = self
            .client
            .put(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    /// Like [`ApiClient::put_json`], with `timeout` replacing the client's
    /// request timeout.
    pub async fn put_json_within<Req: Serialize + ?Sized, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp, ApiError> {
        let resp = self
            .client
            .put(self.url(path))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }
}

fn transport(err: reqwest::Error) -> ApiError {
    ApiError::Transport {
        message: err.to_string(),
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            body: body.trim().to_string(),
        });
    }
    let bytes = resp.bytes().await.map_err(transport)?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode {
        message: e.to_string(),
    })
}

/// `/v1/status/leader` and `/v1/status/peers`, served identically by
/// Consul and Nomad.
async fn status_leader(client: &ApiClient) -> Result<String, ApiError> {
    client.get_json::<String>("/v1/status/leader", None).await
}

async fn status_peers(client: &ApiClient) -> Result<Vec<String>, ApiError> {
    client.get_json::<Vec<String>>("/v1/status/peers", None).await
}

#[derive(Debug, Clone)]
pub struct ConsulApi {
    client: ApiClient,
}

impl ConsulApi {
    pub fn new(endpoint: &Endpoint) -> Result<Self, AdapterError> {
        Ok(Self {
            client: ApiClient::new(endpoint)?,
        })
    }

    pub fn from_harness(harness: &dyn Harness, port: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            client: ApiClient::from_harness(harness, port)?,
        })
    }
}

impl LeaderApi for ConsulApi {
    fn leader(&self) -> ApiFuture<'_, String> {
        Box::pin(status_leader(&self.client))
    }
}

impl LeaderPeersApi for ConsulApi {
    fn peers(&self) -> ApiFuture<'_, Vec<String>> {
        Box::pin(status_peers(&self.client))
    }
}

#[derive(Debug, Clone)]
pub struct NomadApi {
    client: ApiClient,
}

impl NomadApi {
    pub fn new(endpoint: &Endpoint) -> Result<Self, AdapterError> {
        Ok(Self {
            client: ApiClient::new(endpoint)?,
        })
    }

    pub fn from_harness(harness: &dyn Harness, port: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            client: ApiClient::from_harness(harness, port)?,
        })
    }
}

impl LeaderApi for NomadApi {
    fn leader(&self) -> ApiFuture<'_, String> {
        Box::pin(status_leader(&self.client))
    }
}

impl LeaderPeersApi for NomadApi {
    fn peers(&self) -> ApiFuture<'_, Vec<String>> {
        Box::pin(status_peers(&self.client))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct VaultLeaderResponse {
    #[serde(default)]
    leader_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VaultInit {
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VaultSealStatus {
    pub initialized: bool,
    pub sealed: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RaftConfigurationResponse {
    data: RaftConfigurationData,
}

#[derive(Debug, Clone, Deserialize)]
struct RaftConfigurationData {
    config: RaftConfiguration,
}

#[derive(Debug, Clone, Deserialize)]
struct RaftConfiguration {
    servers: Vec<RaftServer>,
}

#[derive(Debug, Clone, Deserialize)]
struct RaftServer {
    address: String,
}

#[derive(Debug, Clone)]
pub struct VaultApi {
    client: ApiClient,
}

impl VaultApi {
    pub fn new(endpoint: &Endpoint) -> Result<Self, AdapterError> {
        Ok(Self {
            client: ApiClient::new(endpoint)?,
        })
    }

    pub fn from_harness(harness: &dyn Harness, port: &str) -> Result<Self, AdapterError> {
        Ok(Self {
            client: ApiClient::from_harness(harness, port)?,
        })
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    pub async fn seal_status(&self) -> Result<VaultSealStatus, ApiError> {
        self.client.get_json("/v1/sys/seal-status", None).await
    }

    pub async fn init(&self, shares: u8, threshold: u8) -> Result<VaultInit, ApiError> {
        let body = serde_json::json!({
            "secret_shares": shares,
            "secret_threshold": threshold,
        });
        self.client
            .put_json_within("/v1/sys/init", &body, VAULT_INIT_TIMEOUT)
            .await
    }

    pub async fn unseal(&self, key: &str) -> Result<VaultSealStatus, ApiError> {
        let body = serde_json::json!({ "key": key });
        self.client.put_json("/v1/sys/unseal", &body).await
    }

    /// Cluster addresses of the integrated-storage voters.
    pub async fn raft_peers(&self, token: &str) -> Result<Vec<String>, ApiError> {
        let resp: RaftConfigurationResponse = self
            .client
            .get_json("/v1/sys/storage/raft/configuration", Some(token))
            .await?;
        Ok(resp
            .data
            .config
            .servers
            .into_iter()
            .map(|s| s.address)
            .collect())
    }
}

impl LeaderApi for VaultApi {
    fn leader(&self) -> ApiFuture<'_, String> {
        Box::pin(async move {
            let resp: VaultLeaderResponse = self.client.get_json("/v1/sys/leader", None).await?;
            Ok(resp.leader_address)
        })
    }
}

/// Builds one peer-aware adapter per harness, in harness order.
pub fn leader_peers_apis<A, F>(
    harnesses: &[Arc<dyn Harness>],
    port: &str,
    build: F,
) -> Result<Vec<Arc<dyn LeaderPeersApi>>, AdapterError>
where
    A: LeaderPeersApi + 'static,
    F: Fn(&dyn Harness, &str) -> Result<A, AdapterError>,
{
    harnesses
        .iter()
        .map(|h| build(h.as_ref(), port).map(|api| Arc::new(api) as Arc<dyn LeaderPeersApi>))
        .collect()
}
