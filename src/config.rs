use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use crate::{
    cluster::{Addressing, ClusterOptions},
    harness::Product,
};

/// First host number handed out on a Docker subnet; lower ones are left to
/// the bridge gateway.
pub const FIRST_CONTAINER_HOST: u8 = 10;

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Agents are child processes on this machine.
    Exec,
    /// Agents are containers on a dedicated bridge network.
    Docker,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "clusterlab",
    about = "Ephemeral local Consul, Nomad and Vault clusters",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Start a Consul cluster and wait for Ctrl-C.
    Consul,

    /// Start a Nomad cluster and wait for Ctrl-C.
    Nomad,

    /// Start a Vault cluster on integrated storage and wait for Ctrl-C.
    Vault,
}

impl Command {
    pub fn product(self) -> Product {
        match self {
            Self::Consul => Product::Consul,
            Self::Nomad => Product::Nomad,
            Self::Vault => Product::Vault,
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_MODE",
        value_name = "MODE",
        default_value = "exec",
        value_enum
    )]
    pub mode: RunMode,

    /// Parent of the node directories (default: a fresh temp dir).
    #[arg(long, global = true, env = "CLUSTERLAB_WORK_DIR", value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_SERVERS",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u8).range(1..=7)
    )]
    pub servers: u8,

    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_CLIENTS",
        value_name = "N",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=16)
    )]
    pub clients: u8,

    /// First port of the local port blocks (exec mode).
    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_BASE_PORT",
        value_name = "PORT",
        default_value_t = 24000,
        value_parser = clap::value_parser!(u16).range(1024..=64000)
    )]
    pub base_port: u16,

    #[arg(
        long = "timeout-secs",
        global = true,
        env = "CLUSTERLAB_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub timeout_secs: u64,

    #[arg(long, global = true, env = "CLUSTERLAB_TLS")]
    pub tls: bool,

    /// Product release (default: a known-good release per product).
    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_PRODUCT_VERSION",
        value_name = "VERSION"
    )]
    pub product_version: Option<String>,

    /// Directory holding the product binaries (default: `$PATH`).
    #[arg(long, global = true, env = "CLUSTERLAB_BIN_DIR", value_name = "DIR")]
    pub bin_dir: Option<PathBuf>,

    /// Fetch binaries from the release site into --cache-dir.
    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_DOWNLOAD",
        conflicts_with = "bin_dir"
    )]
    pub download: bool,

    #[arg(long, global = true, env = "CLUSTERLAB_CACHE_DIR", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Docker network name (default: derived from the run id).
    #[arg(long, global = true, env = "CLUSTERLAB_DOCKER_NETWORK", value_name = "NAME")]
    pub docker_network: Option<String>,

    /// First three octets of the Docker network's /24.
    #[arg(
        long,
        global = true,
        env = "CLUSTERLAB_DOCKER_SUBNET",
        value_name = "PREFIX",
        default_value = "10.77.0"
    )]
    pub docker_subnet: String,

    /// Container image override.
    #[arg(long, global = true, env = "CLUSTERLAB_IMAGE", value_name = "IMAGE")]
    pub image: Option<String>,
}

impl Config {
    pub fn version(&self, product: Product) -> String {
        self.product_version
            .clone()
            .unwrap_or_else(|| product.default_version().to_string())
    }

    pub fn addressing(&self) -> Addressing {
        match self.mode {
            RunMode::Exec => Addressing::LocalPorts {
                base_port: self.base_port,
            },
            RunMode::Docker => Addressing::StaticIps {
                subnet_prefix: self.docker_subnet.clone(),
                first_host: FIRST_CONTAINER_HOST,
            },
        }
    }

    pub fn work_dir(&self, run_id: &str) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("clusterlab-{run_id}")))
    }

    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => std::env::var_os("HOME")
                .map(|home| PathBuf::from(home).join(".cache"))
                .unwrap_or_else(std::env::temp_dir)
                .join("clusterlab"),
        }
    }

    pub fn docker_network(&self, run_id: &str) -> String {
        self.docker_network
            .clone()
            .unwrap_or_else(|| format!("clusterlab-{run_id}"))
    }

    pub fn cluster_options(&self, product: Product, work_dir: PathBuf) -> ClusterOptions {
        let mut options = ClusterOptions::new(self.version(product), work_dir);
        options.servers = usize::from(self.servers);
        options.clients = usize::from(self.clients);
        options.addressing = self.addressing();
        options.tls = self.tls;
        options.timeout = Duration::from_secs(self.timeout_secs);
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_plan_three_local_servers() {
        let cli = Cli::try_parse_from(["clusterlab", "consul"]).unwrap();
        assert_eq!(cli.command, Command::Consul);

        let options = cli
            .config
            .cluster_options(Product::Consul, PathBuf::from("/tmp/x"));
        assert_eq!(options.servers, 3);
        assert_eq!(options.clients, 0);
        assert_eq!(options.version, "1.20.1");
        assert_eq!(options.addressing, Addressing::LocalPorts { base_port: 24000 });
        assert_eq!(options.timeout, Duration::from_secs(60));
    }

    #[test]
    fn docker_mode_uses_static_ips() {
        let cli = Cli::try_parse_from([
            "clusterlab",
            "nomad",
            "--mode",
            "docker",
            "--docker-subnet",
            "10.88.1",
            "--clients",
            "2",
            "--product-version",
            "1.8.0",
        ])
        .unwrap();

        let options = cli
            .config
            .cluster_options(Product::Nomad, PathBuf::from("/tmp/x"));
        assert_eq!(
            options.addressing,
            Addressing::StaticIps {
                subnet_prefix: "10.88.1".to_string(),
                first_host: FIRST_CONTAINER_HOST,
            }
        );
        assert_eq!(options.clients, 2);
        assert_eq!(options.version, "1.8.0");
        assert_eq!(cli.config.docker_network("abc"), "clusterlab-abc");
    }

    #[test]
    fn server_count_is_bounded() {
        assert!(Cli::try_parse_from(["clusterlab", "vault", "--servers", "0"]).is_err());
        assert!(Cli::try_parse_from(["clusterlab", "vault", "--servers", "8"]).is_err());
        assert!(Cli::try_parse_from(["clusterlab", "vault", "--servers", "5"]).is_ok());
    }

    #[test]
    fn download_conflicts_with_bin_dir() {
        assert!(
            Cli::try_parse_from(["clusterlab", "consul", "--download", "--bin-dir", "/opt"])
                .is_err()
        );
    }
}
