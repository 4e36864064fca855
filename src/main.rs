use std::{path::Path, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use clusterlab::{
    adapters::HTTP_PORT,
    binaries::{BinaryLocator, PathLocator, ReleaseCache},
    cluster::{ClusterOptions, RunningCluster},
    config::{Cli, Config, RunMode},
    consul::ConsulCluster,
    harness::Product,
    health::PollContext,
    nomad::NomadCluster,
    runner::{DockerRunner, ExecRunner, Runner},
    vault::VaultCluster,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    run(cli.command.product(), cli.config).await
}

async fn run(product: Product, config: Config) -> Result<()> {
    let run_id = clusterlab::id::new_run_id();
    let work_dir = config.work_dir(&run_id);
    let options = config.cluster_options(product, work_dir.clone());
    info!(
        product = %product,
        version = %options.version,
        run_id = %run_id,
        work_dir = %work_dir.display(),
        "starting cluster"
    );

    // Ctrl-C cancels bring-up as well as ending a running cluster.
    let ctx = PollContext::background();
    let cancel = ctx.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match config.mode {
        RunMode::Exec => {
            let runner = ExecRunner::new(locator(&config)?);
            serve(product, options, &ctx, &runner).await
        }
        RunMode::Docker => {
            let mut runner = DockerRunner::new(config.docker_network(&run_id));
            if let Some(image) = &config.image {
                runner = runner.with_image(product, image.clone());
            }
            runner.create_network(&config.docker_subnet).await?;
            let result = serve(product, options, &ctx, &runner).await;
            if let Err(err) = runner.remove_network().await {
                warn!(network = %runner.network(), error = %err, "leaving docker network behind");
            }
            result
        }
    }
}

fn locator(config: &Config) -> Result<Arc<dyn BinaryLocator>> {
    if config.download {
        let cache = ReleaseCache::new(config.cache_dir()).context("set up release cache")?;
        return Ok(Arc::new(cache));
    }
    Ok(Arc::new(PathLocator::new(config.bin_dir.clone())))
}

async fn serve(
    product: Product,
    options: ClusterOptions,
    ctx: &PollContext,
    runner: &dyn Runner,
) -> Result<()> {
    let work_dir = options.work_dir.clone();
    let cluster = match product {
        Product::Consul => ConsulCluster::new(options).start(ctx, runner).await,
        Product::Nomad => NomadCluster::new(options).start(ctx, runner).await,
        Product::Vault => VaultCluster::new(options).start(ctx, runner).await,
    }
    .with_context(|| format!("bring up {product} cluster"))?;

    if let Err(err) = print_cluster(&cluster, &work_dir) {
        warn!(error = %err, "could not list endpoints");
    }

    tokio::select! {
        cause = ctx.done() => info!(cause = %cause, "shutting down"),
        (agent, outcome) = cluster.wait_any() => match outcome {
            Ok(()) => warn!(agent = %agent, "agent exited; shutting down"),
            Err(err) => warn!(agent = %agent, error = %err, "agent failed; shutting down"),
        },
    }

    cluster.stop().await
}

fn print_cluster(cluster: &RunningCluster, work_dir: &Path) -> Result<()> {
    println!("{} cluster is up (node dirs under {})", cluster.product, work_dir.display());
    let endpoints = cluster.endpoints(HTTP_PORT, true)?;
    for (agent, endpoint) in cluster.agents().zip(&endpoints) {
        println!("  {:<20} {}", agent.name(), endpoint.base_url());
        if let Some(ca) = &endpoint.ca_file {
            println!("  {:<20} ca: {}", "", ca.display());
        }
    }
    println!("leader: {}", cluster.leader);
    if let Some(vault) = &cluster.vault {
        println!("root token: {}", vault.root_token);
        println!("unseal key: {}", vault.unseal_key);
    }
    println!("press Ctrl-C to stop");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}
