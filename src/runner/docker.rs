use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context as _, anyhow};
use tokio::process::Command;
use tracing::{info, warn};

use super::{Runner, StartFuture, write_agent_files};
use crate::harness::{
    AgentCommand, Endpoint, Harness, HarnessError, HarnessFuture, LOCALHOST, Product,
};

/// Mount point of the node directory inside every container.
pub const CONTAINER_DIR: &str = "/clusterlab";

const DOCKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs agents as containers on a user-defined bridge network.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker: String,
    network: String,
    images: BTreeMap<Product, String>,
}

impl DockerRunner {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            docker: "docker".to_string(),
            network: network.into(),
            images: BTreeMap::new(),
        }
    }

    pub fn with_image(mut self, product: Product, image: impl Into<String>) -> Self {
        self.images.insert(product, image.into());
        self
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn image_for(&self, cmd: &AgentCommand) -> String {
        self.images
            .get(&cmd.product)
            .cloned()
            .unwrap_or_else(|| cmd.product.default_image(&cmd.version))
    }

    /// Creates the bridge network; `subnet_prefix` is the first three
    /// octets, e.g. `10.77.0`.
    pub async fn create_network(&self, subnet_prefix: &str) -> anyhow::Result<()> {
        let subnet = format!("{subnet_prefix}.0/24");
        docker(
            &self.docker,
            &["network", "create", "--subnet", &subnet, &self.network],
        )
        .await
        .map_err(|details| anyhow!("create network {}: {details}", self.network))?;
        info!(network = %self.network, subnet = %subnet, "docker network created");
        Ok(())
    }

    pub async fn remove_network(&self) -> anyhow::Result<()> {
        docker(&self.docker, &["network", "rm", &self.network])
            .await
            .map_err(|details| anyhow!("remove network {}: {details}", self.network))?;
        info!(network = %self.network, "docker network removed");
        Ok(())
    }

    pub fn container_name(&self, cmd: &AgentCommand) -> String {
        format!("{}-{}", self.network, cmd.name)
    }

    /// Arguments for `docker run`, without the program name.
    pub fn run_args(&self, cmd: &AgentCommand) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.container_name(cmd),
            "--hostname".to_string(),
            cmd.name.clone(),
            "--network".to_string(),
            self.network.clone(),
        ];
        if let Some(ip) = cmd.ip {
            args.push("--ip".to_string());
            args.push(ip.to_string());
        }
        args.push("-v".to_string());
        args.push(format!("{}:{CONTAINER_DIR}", cmd.host_dir.display()));
        args.push("-w".to_string());
        args.push(CONTAINER_DIR.to_string());
        for (key, value) in &cmd.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for port in cmd.ports.values() {
            args.push("-p".to_string());
            args.push(format!("127.0.0.1::{port}"));
        }
        args.push("--entrypoint".to_string());
        args.push(cmd.product.as_str().to_string());
        args.push(self.image_for(cmd));
        args.extend(cmd.args.iter().cloned());
        args
    }
}

impl Runner for DockerRunner {
    fn agent_dir(&self, _host_dir: &Path) -> PathBuf {
        PathBuf::from(CONTAINER_DIR)
    }

    fn start<'a>(&'a self, cmd: &'a AgentCommand) -> StartFuture<'a> {
        Box::pin(async move {
            write_agent_files(cmd)?;
            let container = self.container_name(cmd);
            let args = self.run_args(cmd);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            docker(&self.docker, &args)
                .await
                .map_err(|details| anyhow!("docker run {container}: {details}"))?;
            info!(
                agent = %cmd.name,
                container = %container,
                image = %self.image_for(cmd),
                "container started"
            );

            let published = match published_ports(&self.docker, &container, cmd).await {
                Ok(published) => published,
                Err(err) => {
                    let _ = docker(&self.docker, &["rm", "-f", &container]).await;
                    return Err(err);
                }
            };

            Ok(Arc::new(DockerHarness {
                docker: self.docker.clone(),
                cmd: cmd.clone(),
                container,
                published,
            }) as Arc<dyn Harness>)
        })
    }
}

async fn published_ports(
    program: &str,
    container: &str,
    cmd: &AgentCommand,
) -> anyhow::Result<BTreeMap<String, u16>> {
    let mut published = BTreeMap::new();
    for (name, port) in &cmd.ports {
        let spec = format!("{port}/tcp");
        let out = docker(program, &["port", container, &spec])
            .await
            .map_err(|details| anyhow!("docker port {container} {spec}: {details}"))?;
        let host_port = parse_published_port(&out)
            .with_context(|| format!("parse docker port output {out:?}"))?;
        published.insert(name.clone(), host_port);
    }
    Ok(published)
}

/// First `host:port` line of `docker port` output.
pub fn parse_published_port(output: &str) -> Option<u16> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (_, port) = line.rsplit_once(':')?;
    port.parse().ok()
}

async fn docker(program: &str, args: &[&str]) -> Result<String, String> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let out = match tokio::time::timeout(DOCKER_COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(out)) => out,
        Ok(Err(err)) => return Err(format!("spawn {program}: {err}")),
        Err(_) => return Err(format!("timeout running {program}")),
    };
    if out.status.success() {
        return Ok(String::from_utf8_lossy(&out.stdout).trim().to_string());
    }
    Err(format!(
        "{program} exited with {}: {}",
        out.status,
        String::from_utf8_lossy(&out.stderr).trim()
    ))
}

pub struct DockerHarness {
    docker: String,
    cmd: AgentCommand,
    container: String,
    published: BTreeMap<String, u16>,
}

impl DockerHarness {
    fn docker_err(&self, message: String) -> HarnessError {
        HarnessError::Docker {
            agent: self.cmd.name.clone(),
            message,
        }
    }
}

impl Harness for DockerHarness {
    fn name(&self) -> &str {
        &self.cmd.name
    }

    fn endpoint(&self, name: &str, local: bool) -> Result<Endpoint, HarnessError> {
        let port = self.cmd.port(name)?;
        if local {
            let host_port =
                self.published
                    .get(name)
                    .copied()
                    .ok_or_else(|| HarnessError::NotListening {
                        agent: self.cmd.name.clone(),
                        port: name.to_string(),
                    })?;
            return Ok(self.cmd.endpoint_at(name, LOCALHOST, host_port, true));
        }
        let ip = self.cmd.ip.ok_or_else(|| HarnessError::NotListening {
            agent: self.cmd.name.clone(),
            port: name.to_string(),
        })?;
        Ok(self.cmd.endpoint_at(name, ip, port, false))
    }

    fn wait(&self) -> HarnessFuture<'_, ()> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.docker);
            cmd.args(["wait", self.container.as_str()]);
            cmd.stdin(Stdio::null());
            cmd.stderr(Stdio::null());
            cmd.kill_on_drop(true);
            let out = cmd
                .output()
                .await
                .map_err(|e| self.docker_err(format!("docker wait: {e}")))?;
            if !out.status.success() {
                return Err(self.docker_err(format!("docker wait exited with {}", out.status)));
            }
            let code = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if code == "0" {
                Ok(())
            } else {
                Err(HarnessError::Exited {
                    agent: self.cmd.name.clone(),
                    status: format!("exit code {code}"),
                })
            }
        })
    }

    fn stop(&self) -> HarnessFuture<'_, ()> {
        Box::pin(async move {
            if let Err(details) = docker(&self.docker, &["stop", "-t", "5", &self.container]).await
            {
                warn!(agent = %self.cmd.name, details = %details, "docker stop failed");
            }
            docker(&self.docker, &["rm", "-f", &self.container])
                .await
                .map_err(|details| self.docker_err(format!("rm: {details}")))?;
            info!(agent = %self.cmd.name, container = %self.container, "container removed");
            Ok(())
        })
    }
}
