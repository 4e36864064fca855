use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, anyhow, bail};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{
    adapters::{HTTP_PORT, VaultApi},
    cluster::{
        ClusterOptions, NodeDirs, NodePlan, PortSpec, RunningCluster, Topology, VaultCredentials,
        node_dirs, plan_nodes, write_node_tls,
    },
    harness::{AgentCommand, ConfigFile, Product, host_port},
    health::{ApiError, LeaderApi, PollContext, leaders_healthy_with_options},
    runner::Runner,
    tls::{self, ClusterCa},
};

pub const CLUSTER_PORT: &str = "cluster";

pub const PORTS: &[PortSpec] = &[
    PortSpec {
        name: HTTP_PORT,
        default: 8200,
        offset: 0,
    },
    PortSpec {
        name: CLUSTER_PORT,
        default: 8201,
        offset: 1,
    },
];

const CONFIG_FILE: &str = "config/vault.json";

pub const KEY_SHARES: u8 = 1;
pub const KEY_THRESHOLD: u8 = 1;

/// Vault servers on integrated raft storage. Vault has no client agents.
#[derive(Debug, Clone)]
pub struct VaultCluster {
    pub options: ClusterOptions,
}

impl VaultCluster {
    pub fn new(options: ClusterOptions) -> Self {
        Self { options }
    }

    pub fn plan(&self) -> anyhow::Result<Topology> {
        if self.options.clients > 0 {
            bail!("vault clusters have no client agents");
        }
        plan_nodes(
            Product::Vault,
            PORTS,
            &self.options.addressing,
            self.options.servers,
            0,
        )
    }

    fn scheme(&self) -> &'static str {
        if self.options.tls { "https" } else { "http" }
    }

    pub fn api_addr(&self, plan: &NodePlan) -> anyhow::Result<String> {
        Ok(format!("{}://{}", self.scheme(), plan.address(HTTP_PORT)?))
    }

    pub fn commands(
        &self,
        runner: &dyn Runner,
        topology: &Topology,
    ) -> anyhow::Result<Vec<AgentCommand>> {
        let api_addrs = topology
            .servers
            .iter()
            .map(|plan| -> anyhow::Result<(String, String)> {
                Ok((plan.name.clone(), self.api_addr(plan)?))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        topology
            .servers
            .iter()
            .map(|plan| {
                let dirs = node_dirs(runner, &self.options, plan);
                let join: Vec<String> = api_addrs
                    .iter()
                    .filter(|(name, _)| *name != plan.name)
                    .map(|(_, addr)| addr.clone())
                    .collect();
                self.agent_command(plan, &dirs, &join)
            })
            .collect()
    }

    pub fn agent_command(
        &self,
        plan: &NodePlan,
        dirs: &NodeDirs,
        join: &[String],
    ) -> anyhow::Result<AgentCommand> {
        let config = self.agent_config(plan, &dirs.agent, join)?;
        Ok(AgentCommand {
            name: plan.name.clone(),
            product: Product::Vault,
            version: self.options.version.clone(),
            args: vec![
                "server".to_string(),
                "-config".to_string(),
                dirs.agent.join(CONFIG_FILE).display().to_string(),
            ],
            env: Default::default(),
            files: vec![ConfigFile {
                path: PathBuf::from(CONFIG_FILE),
                contents: serde_json::to_string_pretty(&config)?,
            }],
            ports: plan.ports.clone(),
            ip: plan.static_ip,
            host_dir: dirs.host.clone(),
            agent_dir: dirs.agent.clone(),
            tls: self.options.tls,
        })
    }

    /// Server configuration. `join` holds the API addresses of the other
    /// servers.
    pub fn agent_config(
        &self,
        plan: &NodePlan,
        dir: &Path,
        join: &[String],
    ) -> anyhow::Result<Value> {
        let tls_dir = dir.join(tls::TLS_DIR);
        let bind = plan.bind_ip();

        let retry_join: Vec<Value> = join
            .iter()
            .map(|addr| {
                if self.options.tls {
                    json!({
                        "leader_api_addr": addr,
                        "leader_ca_cert_file": tls_dir.join(tls::CA_FILE),
                    })
                } else {
                    json!({ "leader_api_addr": addr })
                }
            })
            .collect();

        let mut listener = json!({
            "address": host_port(bind, plan.port(HTTP_PORT)?),
            "cluster_address": host_port(bind, plan.port(CLUSTER_PORT)?),
        });
        if self.options.tls {
            listener["tls_cert_file"] = json!(tls_dir.join(tls::CERT_FILE));
            listener["tls_key_file"] = json!(tls_dir.join(tls::KEY_FILE));
        } else {
            listener["tls_disable"] = json!(true);
        }

        Ok(json!({
            "storage": {
                "raft": {
                    "path": dir.join("data"),
                    "node_id": plan.name,
                    "retry_join": retry_join,
                },
            },
            "listener": { "tcp": listener },
            "api_addr": self.api_addr(plan)?,
            "cluster_addr": format!("https://{}", plan.address(CLUSTER_PORT)?),
            "disable_mlock": true,
            "ui": false,
            "log_level": "info",
        }))
    }

    /// Starts the servers, initialises and unseals them, then waits for all
    /// of them to report the same active node.
    pub async fn start(
        &self,
        ctx: &PollContext,
        runner: &dyn Runner,
    ) -> anyhow::Result<RunningCluster> {
        self.options.validate()?;
        let topology = self.plan()?;

        if self.options.tls {
            let ca = ClusterCa::generate("clusterlab vault")?;
            for plan in topology.nodes() {
                write_node_tls(&ca, plan, &self.options.node_dir(plan), &[])?;
            }
        }

        let servers = self.commands(runner, &topology)?;
        let mut cluster = RunningCluster::launch(Product::Vault, runner, &servers, &[]).await?;

        let ctx = ctx.with_timeout(self.options.timeout);
        let converged = async {
            let apis = cluster
                .servers
                .iter()
                .map(|h| VaultApi::from_harness(h.as_ref(), HTTP_PORT).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()
                .context("build vault adapters")?;

            let credentials = self.bootstrap(&ctx, &apis).await?;
            let leader_apis: Vec<Arc<dyn LeaderApi>> = apis
                .iter()
                .map(|api| api.clone() as Arc<dyn LeaderApi>)
                .collect();
            let health = &self.options.health;
            let leader = match leaders_healthy_with_options(&ctx, &leader_apis, health).await {
                Ok(leader) => leader,
                Err(err) => {
                    log_raft_configuration(&apis, &credentials.root_token).await;
                    return Err(anyhow::Error::from(err));
                }
            };
            anyhow::Ok((leader, credentials))
        }
        .await;

        match converged {
            Ok((leader, credentials)) => {
                info!(leader = %leader, servers = self.options.servers, "vault cluster ready");
                cluster.leader = leader;
                cluster.vault = Some(credentials);
                Ok(cluster)
            }
            Err(err) => Err(cluster.abort(err).await),
        }
    }

    /// Initialises the first server and unseals every server, first server
    /// first. Each step retries until it succeeds or `ctx` ends.
    pub async fn bootstrap(
        &self,
        ctx: &PollContext,
        apis: &[Arc<VaultApi>],
    ) -> anyhow::Result<VaultCredentials> {
        let first = apis.first().context("no vault servers")?;

        // Init succeeds once per cluster; the keys are never returned again.
        let init = loop {
            if let Ok(status) = first.seal_status().await
                && status.initialized
            {
                bail!(
                    "vault at {} is already initialised; its unseal key is unknown",
                    first.base_url()
                );
            }
            match first.init(KEY_SHARES, KEY_THRESHOLD).await {
                Ok(init) => break init,
                Err(ApiError::Status { status, body })
                    if (400..500).contains(&status) && body.contains("already initialized") =>
                {
                    bail!(
                        "vault at {} is already initialised; its unseal key is unknown",
                        first.base_url()
                    );
                }
                Err(err) => {
                    debug!(api = %first.base_url(), error = %err, "vault init not possible yet");
                    ctx.sleep(self.options.health.interval)
                        .await
                        .map_err(|cause| anyhow!("initialise vault: {cause}: last error: {err}"))?;
                }
            }
        };
        let unseal_key = init
            .keys_base64
            .first()
            .cloned()
            .context("vault init returned no unseal keys")?;
        info!(api = %first.base_url(), "vault initialised");

        for api in apis {
            loop {
                if let Ok(status) = api.seal_status().await
                    && !status.sealed
                {
                    break;
                }
                let err = match api.unseal(&unseal_key).await {
                    Ok(status) if !status.sealed => break,
                    Ok(_) => "still sealed".to_string(),
                    Err(err) => err.to_string(),
                };
                debug!(api = %api.base_url(), error = %err, "vault not unsealed yet");
                ctx.sleep(self.options.health.interval).await.map_err(|cause| {
                    anyhow!("unseal {}: {cause}: last error: {err}", api.base_url())
                })?;
            }
            info!(api = %api.base_url(), "vault unsealed");
        }

        Ok(VaultCredentials {
            root_token: init.root_token,
            unseal_key,
        })
    }
}

/// Logs each server's view of the raft voters after a failed check.
async fn log_raft_configuration(apis: &[Arc<VaultApi>], token: &str) {
    for api in apis {
        match api.raft_peers(token).await {
            Ok(voters) => warn!(api = %api.base_url(), voters = ?voters, "raft configuration"),
            Err(err) => {
                warn!(api = %api.base_url(), error = %err, "raft configuration unavailable")
            }
        }
    }
}
