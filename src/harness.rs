use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    pin::Pin,
};

use crate::tls;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Product {
    Consul,
    Nomad,
    Vault,
}

impl Product {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consul => "consul",
            Self::Nomad => "nomad",
            Self::Vault => "vault",
        }
    }

    /// Release used when none is asked for.
    pub fn default_version(self) -> &'static str {
        match self {
            Self::Consul => "1.20.1",
            Self::Nomad => "1.9.3",
            Self::Vault => "1.18.2",
        }
    }

    pub fn default_image(self, version: &str) -> String {
        format!("hashicorp/{}:{version}", self.as_str())
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// Relative to the node directory.
    pub path: PathBuf,
    pub contents: String,
}

/// Everything a runner needs to launch one agent.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub name: String,
    pub product: Product,
    pub version: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub files: Vec<ConfigFile>,
    pub ports: BTreeMap<String, u16>,
    /// Static address inside a container network; `None` for local processes.
    pub ip: Option<IpAddr>,
    /// Node directory on the machine running clusterlab.
    pub host_dir: PathBuf,
    /// The same directory as the agent sees it.
    pub agent_dir: PathBuf,
    pub tls: bool,
}

impl AgentCommand {
    pub fn port(&self, name: &str) -> Result<u16, HarnessError> {
        self.ports
            .get(name)
            .copied()
            .ok_or_else(|| HarnessError::UnknownPort {
                agent: self.name.clone(),
                port: name.to_string(),
            })
    }

    pub fn ca_file(&self, local: bool) -> Option<PathBuf> {
        if !self.tls {
            return None;
        }
        let dir = if local { &self.host_dir } else { &self.agent_dir };
        Some(dir.join(tls::TLS_DIR).join(tls::CA_FILE))
    }

    /// Endpoint on `host`, which must already be the right view (local or remote).
    pub fn endpoint_at(
        &self,
        name: &str,
        host: IpAddr,
        port: u16,
        local: bool,
    ) -> Endpoint {
        Endpoint {
            scheme: if self.tls { Scheme::Https } else { Scheme::Http },
            address: host_port(host, port),
            ca_file: self.ca_file(local),
            name: name.to_string(),
        }
    }
}

pub fn host_port(host: IpAddr, port: u16) -> String {
    match host {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub scheme: Scheme,
    /// `host:port`
    pub address: String,
    pub ca_file: Option<PathBuf>,
}

impl Endpoint {
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.address)
    }
}

pub type HarnessFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HarnessError>> + Send + 'a>>;

/// A running agent, as a process or a container.
pub trait Harness: Send + Sync {
    fn name(&self) -> &str;

    /// Looks up a named port. `local` selects the view from the machine
    /// running clusterlab rather than from inside the agents' network.
    fn endpoint(&self, name: &str, local: bool) -> Result<Endpoint, HarnessError>;

    /// Resolves when the agent exits; an unclean exit is an error.
    fn wait(&self) -> HarnessFuture<'_, ()>;

    fn stop(&self) -> HarnessFuture<'_, ()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    UnknownPort { agent: String, port: String },
    NotListening { agent: String, port: String },
    Exited { agent: String, status: String },
    Io { agent: String, message: String },
    Docker { agent: String, message: String },
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPort { agent, port } => write!(f, "{agent}: no port named {port}"),
            Self::NotListening { agent, port } => {
                write!(f, "{agent}: port {port} is not published yet")
            }
            Self::Exited { agent, status } => write!(f, "{agent} exited: {status}"),
            Self::Io { agent, message } => write!(f, "{agent}: {message}"),
            Self::Docker { agent, message } => write!(f, "{agent}: docker: {message}"),
        }
    }
}

impl std::error::Error for HarnessError {}
