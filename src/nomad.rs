use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    adapters::{HTTP_PORT, NomadApi, leader_peers_apis},
    cluster::{
        ClusterOptions, NodeDirs, NodePlan, PortSpec, RunningCluster, Topology, node_dirs,
        plan_nodes, write_node_tls,
    },
    harness::{AgentCommand, ConfigFile, Product, host_port},
    health::{PollContext, leader_peers_healthy_with_options},
    runner::Runner,
    tls::{self, ClusterCa},
};

pub const RPC_PORT: &str = "rpc";
pub const SERF_PORT: &str = "serf";

pub const PORTS: &[PortSpec] = &[
    PortSpec {
        name: HTTP_PORT,
        default: 4646,
        offset: 0,
    },
    PortSpec {
        name: RPC_PORT,
        default: 4647,
        offset: 1,
    },
    PortSpec {
        name: SERF_PORT,
        default: 4648,
        offset: 2,
    },
];

const CONFIG_FILE: &str = "config/nomad.json";

#[derive(Debug, Clone)]
pub struct NomadCluster {
    pub options: ClusterOptions,
    pub region: String,
    pub datacenter: String,
}

/// Where a node finds the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinAddresses {
    /// Servers' serf addresses, for servers.
    pub serf: Vec<String>,
    /// Servers' RPC addresses, for clients.
    pub rpc: Vec<String>,
}

impl NomadCluster {
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            region: "global".to_string(),
            datacenter: "dc1".to_string(),
        }
    }

    pub fn plan(&self) -> anyhow::Result<Topology> {
        plan_nodes(
            Product::Nomad,
            PORTS,
            &self.options.addressing,
            self.options.servers,
            self.options.clients,
        )
    }

    pub fn expected_peers(topology: &Topology) -> anyhow::Result<Vec<String>> {
        topology.server_addresses(RPC_PORT)
    }

    pub fn commands(
        &self,
        runner: &dyn Runner,
        topology: &Topology,
    ) -> anyhow::Result<(Vec<AgentCommand>, Vec<AgentCommand>)> {
        let join = JoinAddresses {
            serf: topology.server_addresses(SERF_PORT)?,
            rpc: topology.server_addresses(RPC_PORT)?,
        };
        let build = |plan: &NodePlan| {
            let dirs = node_dirs(runner, &self.options, plan);
            self.agent_command(plan, &dirs, &join)
        };
        let servers = topology.servers.iter().map(build).collect::<Result<_, _>>()?;
        let clients = topology.clients.iter().map(build).collect::<Result<_, _>>()?;
        Ok((servers, clients))
    }

    pub fn agent_command(
        &self,
        plan: &NodePlan,
        dirs: &NodeDirs,
        join: &JoinAddresses,
    ) -> anyhow::Result<AgentCommand> {
        let config = self.agent_config(plan, &dirs.agent, join)?;
        Ok(AgentCommand {
            name: plan.name.clone(),
            product: Product::Nomad,
            version: self.options.version.clone(),
            args: vec![
                "agent".to_string(),
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

    pub fn agent_config(
        &self,
        plan: &NodePlan,
        dir: &Path,
        join: &JoinAddresses,
    ) -> anyhow::Result<Value> {
        let http = plan.port(HTTP_PORT)?;
        let rpc = plan.port(RPC_PORT)?;
        let serf = plan.port(SERF_PORT)?;
        let ip = plan.ip();

        let mut config = json!({
            "name": plan.name,
            "region": self.region,
            "datacenter": self.datacenter,
            "data_dir": dir.join("data"),
            "bind_addr": plan.bind_ip(),
            "ports": {
                "http": http,
                "rpc": rpc,
                "serf": serf,
            },
            "advertise": {
                "http": host_port(ip, http),
                "rpc": host_port(ip, rpc),
                "serf": host_port(ip, serf),
            },
            "log_level": "INFO",
            "disable_update_check": true,
        });

        if plan.server {
            config["server"] = json!({
                "enabled": true,
                "bootstrap_expect": self.options.servers,
                "server_join": { "retry_join": join.serf },
            });
            config["client"] = json!({ "enabled": false });
        } else {
            config["client"] = json!({
                "enabled": true,
                "servers": join.rpc,
            });
        }

        if self.options.tls {
            let tls_dir = dir.join(tls::TLS_DIR);
            config["tls"] = json!({
                "http": true,
                "rpc": true,
                "ca_file": tls_dir.join(tls::CA_FILE),
                "cert_file": tls_dir.join(tls::CERT_FILE),
                "key_file": tls_dir.join(tls::KEY_FILE),
                "verify_server_hostname": true,
                "verify_https_client": false,
            });
        }
        Ok(config)
    }

    fn tls_names(&self, plan: &NodePlan) -> Vec<String> {
        let role = if plan.server { "server" } else { "client" };
        vec![format!("{role}.{}.nomad", self.region)]
    }

    pub async fn start(
        &self,
        ctx: &PollContext,
        runner: &dyn Runner,
    ) -> anyhow::Result<RunningCluster> {
        self.options.validate()?;
        let topology = self.plan()?;
        let expected = Self::expected_peers(&topology)?;

        if self.options.tls {
            let ca = ClusterCa::generate("clusterlab nomad")?;
            for plan in topology.nodes() {
                write_node_tls(
                    &ca,
                    plan,
                    &self.options.node_dir(plan),
                    &self.tls_names(plan),
                )?;
            }
        }

        let (servers, clients) = self.commands(runner, &topology)?;
        let mut cluster = RunningCluster::launch(Product::Nomad, runner, &servers, &clients).await?;

        let ctx = ctx.with_timeout(self.options.timeout);
        let converged = async {
            let apis = leader_peers_apis(&cluster.servers, HTTP_PORT, NomadApi::from_harness)
                .context("build nomad adapters")?;
            let leader =
                leader_peers_healthy_with_options(&ctx, &apis, &expected, &self.options.health)
                    .await?;
            anyhow::Ok(leader)
        }
        .await;

        match converged {
            Ok(leader) => {
                info!(
                    leader = %leader,
                    servers = self.options.servers,
                    clients = self.options.clients,
                    "nomad cluster ready"
                );
                cluster.leader = leader;
                Ok(cluster)
            }
            Err(err) => Err(cluster.abort(err).await),
        }
    }
}
