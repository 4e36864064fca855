//! Node planning and the start/stop sequencing shared by every product.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context as _, bail};
use futures_util::future::select_all;
use tracing::{info, warn};

use crate::{
    harness::{AgentCommand, Endpoint, Harness, HarnessError, LOCALHOST, Product, host_port},
    health::HealthOptions,
    runner::Runner,
    tls::{self, ClusterCa},
};

/// Gap between consecutive nodes' port blocks in [`Addressing::LocalPorts`].
pub const PORT_STRIDE: u16 = 10;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    /// Every node on 127.0.0.1 with its own block of ports.
    LocalPorts { base_port: u16 },
    /// Node *i* on `<subnet_prefix>.<first_host + i>` with default ports.
    StaticIps {
        subnet_prefix: String,
        first_host: u8,
    },
}

/// A named port: its product default and its offset inside a local block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub name: &'static str,
    pub default: u16,
    pub offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlan {
    pub name: String,
    pub server: bool,
    /// `Some` only with [`Addressing::StaticIps`].
    pub static_ip: Option<IpAddr>,
    pub ports: BTreeMap<String, u16>,
}

impl NodePlan {
    pub fn ip(&self) -> IpAddr {
        self.static_ip.unwrap_or(LOCALHOST)
    }

    /// Address agents bind listeners to: the node address for local
    /// processes, every interface inside a container.
    pub fn bind_ip(&self) -> IpAddr {
        match self.static_ip {
            Some(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            None => LOCALHOST,
        }
    }

    pub fn port(&self, name: &str) -> anyhow::Result<u16> {
        self.ports
            .get(name)
            .copied()
            .with_context(|| format!("{}: no port named {name}", self.name))
    }

    /// `ip:port` of a named port as other agents reach it.
    pub fn address(&self, port: &str) -> anyhow::Result<String> {
        Ok(host_port(self.ip(), self.port(port)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub servers: Vec<NodePlan>,
    pub clients: Vec<NodePlan>,
}

impl Topology {
    pub fn nodes(&self) -> impl Iterator<Item = &NodePlan> {
        self.servers.iter().chain(self.clients.iter())
    }

    /// `ip:port` of `port` on every server, in plan order.
    pub fn server_addresses(&self, port: &str) -> anyhow::Result<Vec<String>> {
        self.servers.iter().map(|s| s.address(port)).collect()
    }
}

/// Plans `servers` then `clients` nodes. Indices run across both groups so
/// no two nodes share ports or addresses.
pub fn plan_nodes(
    product: Product,
    ports: &[PortSpec],
    addressing: &Addressing,
    servers: usize,
    clients: usize,
) -> anyhow::Result<Topology> {
    let mut topology = Topology {
        servers: Vec::with_capacity(servers),
        clients: Vec::with_capacity(clients),
    };
    for index in 0..servers + clients {
        let server = index < servers;
        let name = if server {
            format!("{product}-{index}")
        } else {
            format!("{product}-client-{}", index - servers)
        };
        let plan = plan_node(name, server, index, ports, addressing)?;
        if server {
            topology.servers.push(plan);
        } else {
            topology.clients.push(plan);
        }
    }
    Ok(topology)
}

fn plan_node(
    name: String,
    server: bool,
    index: usize,
    ports: &[PortSpec],
    addressing: &Addressing,
) -> anyhow::Result<NodePlan> {
    match addressing {
        Addressing::LocalPorts { base_port } => {
            let block = u16::try_from(index)
                .ok()
                .and_then(|i| i.checked_mul(PORT_STRIDE))
                .and_then(|off| base_port.checked_add(off))
                .with_context(|| format!("{name}: port block past 65535"))?;
            let mut planned = BTreeMap::new();
            for spec in ports {
                let port = block
                    .checked_add(spec.offset)
                    .with_context(|| format!("{name}: port {} past 65535", spec.name))?;
                planned.insert(spec.name.to_string(), port);
            }
            Ok(NodePlan {
                name,
                server,
                static_ip: None,
                ports: planned,
            })
        }
        Addressing::StaticIps {
            subnet_prefix,
            first_host,
        } => {
            let host = usize::from(*first_host) + index;
            if host > 254 {
                bail!("{name}: host number {host} does not fit in {subnet_prefix}.0/24");
            }
            let ip: IpAddr = format!("{subnet_prefix}.{host}")
                .parse()
                .with_context(|| format!("{name}: invalid subnet prefix {subnet_prefix:?}"))?;
            Ok(NodePlan {
                name,
                server,
                static_ip: Some(ip),
                ports: ports
                    .iter()
                    .map(|spec| (spec.name.to_string(), spec.default))
                    .collect(),
            })
        }
    }
}

/// Knobs shared by every product's cluster.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub version: String,
    pub servers: usize,
    pub clients: usize,
    pub addressing: Addressing,
    /// Parent of every node directory.
    pub work_dir: PathBuf,
    pub tls: bool,
    /// Upper bound for the whole bring-up, convergence included.
    pub timeout: Duration,
    pub health: HealthOptions,
}

impl ClusterOptions {
    pub fn new(version: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            version: version.into(),
            servers: 3,
            clients: 0,
            addressing: Addressing::LocalPorts { base_port: 24000 },
            work_dir,
            tls: false,
            timeout: DEFAULT_TIMEOUT,
            health: HealthOptions::default(),
        }
    }

    pub fn node_dir(&self, plan: &NodePlan) -> PathBuf {
        self.work_dir.join(&plan.name)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.servers == 0 {
            bail!("a cluster needs at least one server");
        }
        Ok(())
    }
}

/// Node directory paths: on this machine, and as the agent sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDirs {
    pub host: PathBuf,
    pub agent: PathBuf,
}

pub fn node_dirs(runner: &dyn Runner, options: &ClusterOptions, plan: &NodePlan) -> NodeDirs {
    let host = options.node_dir(plan);
    let agent = runner.agent_dir(&host);
    NodeDirs { host, agent }
}

/// Issues and writes a node certificate valid for `localhost`, the node's
/// addresses and any product-specific `dns_names`.
pub fn write_node_tls(
    ca: &ClusterCa,
    plan: &NodePlan,
    host_dir: &Path,
    dns_names: &[String],
) -> anyhow::Result<()> {
    let mut names = vec!["localhost".to_string(), plan.name.clone()];
    names.extend(dns_names.iter().cloned());
    let mut ips = vec![LOCALHOST];
    if let Some(ip) = plan.static_ip {
        ips.push(ip);
    }
    let leaf = ca
        .issue(&plan.name, &names, &ips)
        .with_context(|| format!("issue certificate for {}", plan.name))?;
    tls::write_tls_files(host_dir, ca, &leaf)
        .with_context(|| format!("write tls files for {}", plan.name))?;
    Ok(())
}

/// Starts commands in order. If one fails, the agents already running are
/// stopped, newest first, and the start error is returned.
pub async fn start_agents(
    runner: &dyn Runner,
    commands: &[AgentCommand],
) -> anyhow::Result<Vec<Arc<dyn Harness>>> {
    let mut started: Vec<Arc<dyn Harness>> = Vec::with_capacity(commands.len());
    for cmd in commands {
        match runner.start(cmd).await {
            Ok(harness) => started.push(harness),
            Err(err) => {
                warn!(
                    agent = %cmd.name,
                    started = started.len(),
                    error = %err,
                    "agent failed to start; stopping the rest"
                );
                started.reverse();
                let _ = stop_all(&started).await;
                return Err(err.context(format!("start {}", cmd.name)));
            }
        }
    }
    Ok(started)
}

/// Stops every harness, in order, and reports the first failure.
pub async fn stop_all(harnesses: &[Arc<dyn Harness>]) -> Result<(), HarnessError> {
    let mut first_err = None;
    for harness in harnesses {
        if let Err(err) = harness.stop().await {
            warn!(agent = %harness.name(), error = %err, "stop failed");
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultCredentials {
    pub root_token: String,
    pub unseal_key: String,
}

/// A converged cluster. Dropping it does not stop the agents; call
/// [`RunningCluster::stop`].
pub struct RunningCluster {
    pub product: Product,
    pub leader: String,
    pub servers: Vec<Arc<dyn Harness>>,
    pub clients: Vec<Arc<dyn Harness>>,
    pub vault: Option<VaultCredentials>,
}

impl RunningCluster {
    /// Starts servers, then clients. Clients failing to start also stops the
    /// servers. The returned cluster has no leader yet.
    pub async fn launch(
        product: Product,
        runner: &dyn Runner,
        servers: &[AgentCommand],
        clients: &[AgentCommand],
    ) -> anyhow::Result<Self> {
        let server_harnesses = start_agents(runner, servers).await?;
        let client_harnesses = match start_agents(runner, clients).await {
            Ok(started) => started,
            Err(err) => {
                let mut started = server_harnesses;
                started.reverse();
                let _ = stop_all(&started).await;
                return Err(err);
            }
        };
        info!(
            product = %product,
            servers = server_harnesses.len(),
            clients = client_harnesses.len(),
            "agents started"
        );
        Ok(Self {
            product,
            leader: String::new(),
            servers: server_harnesses,
            clients: client_harnesses,
            vault: None,
        })
    }

    /// Stops the cluster after a failed bring-up and hands back `err`.
    pub async fn abort(self, err: anyhow::Error) -> anyhow::Error {
        warn!(product = %self.product, error = %err, "bring-up failed; stopping agents");
        if let Err(stop_err) = self.stop().await {
            warn!(product = %self.product, error = %stop_err, "cleanup after failed bring-up");
        }
        err
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<dyn Harness>> {
        self.servers.iter().chain(self.clients.iter())
    }

    /// The `port` endpoint of every agent, servers first.
    pub fn endpoints(&self, port: &str, local: bool) -> Result<Vec<Endpoint>, HarnessError> {
        self.agents().map(|h| h.endpoint(port, local)).collect()
    }

    /// Resolves when the first agent exits, with its name and outcome.
    pub async fn wait_any(&self) -> (String, Result<(), HarnessError>) {
        let agents: Vec<_> = self.agents().collect();
        if agents.is_empty() {
            return (String::new(), Ok(()));
        }
        let waits = agents.iter().map(|h| h.wait());
        let (outcome, index, _) = select_all(waits).await;
        (agents[index].name().to_string(), outcome)
    }

    /// Stops clients then servers, attempting all of them.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let clients = stop_all(&self.clients).await;
        let servers = stop_all(&self.servers).await;
        clients.and(servers).context("stop cluster")?;
        info!(product = %self.product, "cluster stopped");
        Ok(())
    }
}
