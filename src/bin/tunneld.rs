use anyhow::Context;
use std::sync::Arc;
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tunneld::cli::{Cli, Command};
use tunneld::config::Config;
use tunneld::defaults;
use tunneld::host::{ConnectionHost, HostOptions};
use tunneld::session::memory::MemorySessionManager;
use tunneld::transport::PemCertificateProvider;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::from_args();
    let config_path = match cli.config {
        Some(path) => path,
        None => defaults::config_path()?,
    };
    let config = Config::load(&config_path)
        .await
        .with_context(|| format!("Could not load configuration from {}", config_path.display()))?;

    match cli.command {
        Command::ShowConfig(_) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Run(_) => run(config).await,
    }
}

async fn run(config: Config) -> Result<(), anyhow::Error> {
    let mut certificates = PemCertificateProvider::new();
    for listener in &config.tcp_listeners {
        certificates.add_identity(
            listener.address,
            &listener.certificate,
            &listener.private_key,
        );
    }

    let session_manager = Arc::new(MemorySessionManager::new());
    let host = ConnectionHost::new(
        HostOptions::from(&config),
        session_manager.clone(),
        Arc::new(certificates),
    );

    host.start(&config.tcp_end_points(), &config.udp_end_points())
        .await?;
    session_manager.set_udp_port(host.udp_end_points().first().map(|endpoint| endpoint.port()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    host.dispose().await;
    Ok(())
}
