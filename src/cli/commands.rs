use crate::cli::{Commands, ConfigOverrides};
use crate::config::Config;
use crate::gateway::Gateway;
use crate::k8s::K8sClient;
use crate::server;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Serve { addr, overrides } => handle_serve(addr, overrides).await,
        Commands::Stdio { overrides } => handle_stdio(overrides).await,
        Commands::Targets { json, overrides } => handle_targets(json, overrides).await,
    }
}

async fn build(overrides: &ConfigOverrides) -> Result<Gateway> {
    let mut config = Config::from_env();
    overrides.apply(&mut config);

    let client = K8sClient::try_default().await?;
    Gateway::new(config, Arc::new(client))
}

/// Cancelled on Ctrl+C
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
        trigger.cancel();
    });
    token
}

async fn handle_serve(addr: SocketAddr, overrides: ConfigOverrides) -> Result<()> {
    let gateway = build(&overrides).await?;
    let shutdown = shutdown_token();

    info!("orb8-gateway serving on {}", addr);
    server::serve(addr, gateway.server_state(), shutdown).await
}

async fn handle_stdio(overrides: ConfigOverrides) -> Result<()> {
    let gateway = build(&overrides).await?;
    let shutdown = shutdown_token();

    info!("orb8-gateway serving stdio");
    server::run_stdio(&gateway.dispatcher, &shutdown).await
}

async fn handle_targets(json: bool, overrides: ConfigOverrides) -> Result<()> {
    let gateway = build(&overrides).await?;
    let config = &gateway.config;
    let targets = gateway.aggregator.directory().snapshot().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&targets)?);
        return Ok(());
    }

    if targets.is_empty() {
        println!(
            "No agents found in namespace {} matching {}",
            config.namespace,
            config.agent_selector()
        );
        return Ok(());
    }

    println!("{:<32} {:<40} {:<6} ENDPOINT", "NODE", "POD", "READY");
    for target in &targets {
        let endpoint = gateway.aggregator.endpoint(target);
        println!(
            "{:<32} {:<40} {:<6} {}",
            target.node_name,
            target.pod_name,
            target.ready,
            endpoint.as_deref().unwrap_or("-")
        );
    }

    let ready = targets.iter().filter(|t| t.ready).count();
    println!("\n{} agents, {} ready", targets.len(), ready);
    Ok(())
}
