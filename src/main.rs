//! image-collector entry point.

use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use image_collector::backends::{
    DockerCli, RegistryAuth, RegistryDiscovery, RegistryEndpoint, ScriptExtractor,
};
use image_collector::harvest::IterationDriver;
use image_collector::{logging, CollectorArgs, CollectorConfig, CollectorError, TokioSleeper};

async fn run() -> Result<(), CollectorError> {
    let config = CollectorConfig::from_args(CollectorArgs::parse())?;
    config.create_dirs()?;
    config.check_scripts_dir()?;
    let _guard = logging::init(&config.log_file)?;

    info!(
        registry = %config.registry,
        state_dir = %config.state_dir.display(),
        batch_size = config.batch_size,
        remove_thresh = config.retention_threshold,
        poll_secs = config.poll_interval.as_secs(),
        "Starting image collector"
    );

    let docker = DockerCli::new(&config.docker_bin, &config.docker);
    let discovery = RegistryDiscovery::new(
        RegistryEndpoint::parse(&config.registry),
        RegistryAuth::from_env(),
    );
    let extractor = ScriptExtractor::new(docker.clone(), &config.scripts_dir);

    let mut driver = IterationDriver::start(
        &config,
        Arc::new(discovery),
        Arc::new(docker),
        Arc::new(extractor),
        Arc::new(TokioSleeper),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing current iteration");
            let _ = shutdown_tx.send(true);
        } else {
            // Without a signal handler the loop runs until killed.
            std::future::pending::<()>().await;
        }
    });

    driver.run(shutdown_rx).await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Collector failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
