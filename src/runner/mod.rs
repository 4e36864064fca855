//! Process hosts: turn an [`AgentCommand`] into a running [`Harness`].

pub mod docker;
pub mod exec;

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use anyhow::Context as _;

use crate::{
    harness::{AgentCommand, Harness},
    tls,
    util::{ensure_dir, write_string_atomic},
};

pub use docker::{DockerHarness, DockerRunner};
pub use exec::{ExecHarness, ExecRunner};

pub type StartFuture<'a> =
    Pin<Box<dyn Future<Output = anyhow::Result<Arc<dyn Harness>>> + Send + 'a>>;

pub trait Runner: Send + Sync {
    /// Where a node directory on this machine shows up for the agent.
    fn agent_dir(&self, host_dir: &Path) -> PathBuf;

    fn start<'a>(&'a self, cmd: &'a AgentCommand) -> StartFuture<'a>;
}

/// Materialises the command's config files under its host directory.
/// TLS agents also need their certificates in place already.
pub fn write_agent_files(cmd: &AgentCommand) -> anyhow::Result<()> {
    ensure_dir(&cmd.host_dir)
        .with_context(|| format!("create node dir {}", cmd.host_dir.display()))?;
    for file in &cmd.files {
        let path = cmd.host_dir.join(&file.path);
        write_string_atomic(&path, &file.contents)
            .with_context(|| format!("write {}", path.display()))?;
    }
    if cmd.tls {
        tls::ensure_tls_files(&cmd.host_dir).with_context(|| format!("start {}", cmd.name))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::harness::{ConfigFile, Product};

    #[test]
    fn agent_files_land_under_node_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let cmd = AgentCommand {
            name: "nomad-0".to_string(),
            product: Product::Nomad,
            version: "1.9.3".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            files: vec![ConfigFile {
                path: PathBuf::from("config/nomad.json"),
                contents: "{}".to_string(),
            }],
            ports: BTreeMap::new(),
            ip: None,
            host_dir: tmp.path().join("nomad-0"),
            agent_dir: tmp.path().join("nomad-0"),
            tls: false,
        };

        write_agent_files(&cmd).unwrap();

        let written =
            std::fs::read_to_string(tmp.path().join("nomad-0/config/nomad.json")).unwrap();
        assert_eq!(written, "{}");
    }
}
