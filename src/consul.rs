use std::path::PathBuf;

use anyhow::Context as _;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    adapters::{ConsulApi, HTTP_PORT, leader_peers_apis},
    cluster::{
        ClusterOptions, NodeDirs, NodePlan, PortSpec, RunningCluster, Topology, node_dirs,
        plan_nodes, write_node_tls,
    },
    harness::{AgentCommand, ConfigFile, Product},
    health::{PollContext, leader_peers_healthy_with_options},
    runner::Runner,
    tls::{self, ClusterCa},
};

pub const SERVER_PORT: &str = "server";
pub const SERF_LAN_PORT: &str = "serf_lan";
pub const SERF_WAN_PORT: &str = "serf_wan";
pub const GRPC_PORT: &str = "grpc";

pub const PORTS: &[PortSpec] = &[
    PortSpec {
        name: HTTP_PORT,
        default: 8500,
        offset: 0,
    },
    PortSpec {
        name: SERVER_PORT,
        default: 8300,
        offset: 1,
    },
    PortSpec {
        name: SERF_LAN_PORT,
        default: 8301,
        offset: 2,
    },
    PortSpec {
        name: SERF_WAN_PORT,
        default: 8302,
        offset: 3,
    },
    PortSpec {
        name: GRPC_PORT,
        default: 8502,
        offset: 4,
    },
];

const CONFIG_FILE: &str = "config/consul.json";

#[derive(Debug, Clone)]
pub struct ConsulCluster {
    pub options: ClusterOptions,
    pub datacenter: String,
}

impl ConsulCluster {
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            datacenter: "dc1".to_string(),
        }
    }

    pub fn plan(&self) -> anyhow::Result<Topology> {
        plan_nodes(
            Product::Consul,
            PORTS,
            &self.options.addressing,
            self.options.servers,
            self.options.clients,
        )
    }

    /// Raft peers a healthy cluster reports: every server's RPC address.
    pub fn expected_peers(topology: &Topology) -> anyhow::Result<Vec<String>> {
        topology.server_addresses(SERVER_PORT)
    }

    /// Server and client commands, in plan order.
    pub fn commands(
        &self,
        runner: &dyn Runner,
        topology: &Topology,
    ) -> anyhow::Result<(Vec<AgentCommand>, Vec<AgentCommand>)> {
        let join = topology.server_addresses(SERF_LAN_PORT)?;
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
        join: &[String],
    ) -> anyhow::Result<AgentCommand> {
        let config = self.agent_config(plan, &dirs.agent, join)?;
        Ok(AgentCommand {
            name: plan.name.clone(),
            product: Product::Consul,
            version: self.options.version.clone(),
            args: vec![
                "agent".to_string(),
                "-config-dir".to_string(),
                dirs.agent.join("config").display().to_string(),
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

    /// Agent configuration; `dir` is the node directory as the agent sees it.
    pub fn agent_config(
        &self,
        plan: &NodePlan,
        dir: &std::path::Path,
        join: &[String],
    ) -> anyhow::Result<Value> {
        let http = plan.port(HTTP_PORT)?;
        let mut ports = json!({
            "server": plan.port(SERVER_PORT)?,
            "serf_lan": plan.port(SERF_LAN_PORT)?,
            "serf_wan": plan.port(SERF_WAN_PORT)?,
            "grpc": plan.port(GRPC_PORT)?,
            "grpc_tls": -1,
            "dns": -1,
        });
        if self.options.tls {
            ports["https"] = json!(http);
            ports["http"] = json!(-1);
        } else {
            ports["http"] = json!(http);
        }

        let mut config = json!({
            "node_name": plan.name,
            "datacenter": self.datacenter,
            "data_dir": dir.join("data"),
            "server": plan.server,
            "bind_addr": plan.bind_ip(),
            "advertise_addr": plan.ip(),
            "client_addr": plan.bind_ip(),
            "ports": ports,
            "retry_join": join,
            "log_level": "INFO",
            "disable_update_check": true,
        });
        if plan.server {
            config["bootstrap_expect"] = json!(self.options.servers);
        }
        if self.options.tls {
            let tls_dir = dir.join(tls::TLS_DIR);
            config["tls"] = json!({
                "defaults": {
                    "ca_file": tls_dir.join(tls::CA_FILE),
                    "cert_file": tls_dir.join(tls::CERT_FILE),
                    "key_file": tls_dir.join(tls::KEY_FILE),
                    "verify_incoming": false,
                    "verify_outgoing": true,
                },
                "internal_rpc": {
                    "verify_server_hostname": false,
                },
            });
        }
        Ok(config)
    }

    /// Starts the cluster and waits until every server agrees on one leader
    /// and on the planned peer set. Any failure stops what was started.
    pub async fn start(
        &self,
        ctx: &PollContext,
        runner: &dyn Runner,
    ) -> anyhow::Result<RunningCluster> {
        self.options.validate()?;
        let topology = self.plan()?;
        let expected = Self::expected_peers(&topology)?;

        if self.options.tls {
            let ca = ClusterCa::generate("clusterlab consul")?;
            let server_name = format!("server.{}.consul", self.datacenter);
            for plan in topology.nodes() {
                write_node_tls(
                    &ca,
                    plan,
                    &self.options.node_dir(plan),
                    std::slice::from_ref(&server_name),
                )?;
            }
        }

        let (servers, clients) = self.commands(runner, &topology)?;
        let mut cluster =
            RunningCluster::launch(Product::Consul, runner, &servers, &clients).await?;

        let ctx = ctx.with_timeout(self.options.timeout);
        let converged = async {
            let apis = leader_peers_apis(&cluster.servers, HTTP_PORT, ConsulApi::from_harness)
                .context("build consul adapters")?;
            let leader =
                leader_peers_healthy_with_options(&ctx, &apis, &expected, &self.options.health)
                    .await?;
            anyhow::Ok(leader)
        }
        .await;

        match converged {
            Ok(leader) => {
                info!(leader = %leader, servers = self.options.servers, "consul cluster ready");
                cluster.leader = leader;
                Ok(cluster)
            }
            Err(err) => Err(cluster.abort(err).await),
        }
    }
}
