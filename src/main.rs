//! Host-resident telemetry agent entrypoint: parses the environment and a
//! handful of CLI flags, bootstraps the agent, then drives the connection
//! posture state machine until asked to stop (spec section 6).

use std::time::Duration;

use hostpulse_agent::agent::Agent;
use hostpulse_agent::config::AgentConfig;
use hostpulse_agent::connection::ConnectionManager;
use tokio_util::sync::CancellationToken;

fn arg_flag(name: &str) -> bool {
    std::env::args().any(|a| a == name)
}

fn env_or(name: &str, prefixed: &str) -> String {
    std::env::var(prefixed).or_else(|_| std::env::var(name)).unwrap_or_default()
}

/// `health` subcommand (spec section 6 "noted for completeness"): dials the
/// configured listen address with a 4s timeout and exits 0/1.
async fn run_health_check(cfg: &AgentConfig) -> i32 {
    let addr = cfg.listen.trim_start_matches(':');
    let target = if addr.contains(':') { addr.to_string() } else { format!("127.0.0.1:{addr}") };
    match tokio::time::timeout(Duration::from_secs(4), tokio::net::TcpStream::connect(&target)).await {
        Ok(Ok(_)) => 0,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    if arg_flag("--version") || arg_flag("-V") {
        println!("hostpulse-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = AgentConfig::from_env();

    if std::env::args().nth(1).as_deref() == Some("health") {
        std::process::exit(run_health_check(&cfg).await);
    }

    let agent = std::sync::Arc::new(Agent::bootstrap(cfg, env!("CARGO_PKG_VERSION").to_string()));

    let hub_url = env_or("HUB_URL", "BESZEL_AGENT_HUB_URL");
    let token = env_or("TOKEN", "BESZEL_AGENT_TOKEN");
    let authorized_keys = env_or("KEY", "BESZEL_AGENT_KEY");

    let connection = std::sync::Arc::new(ConnectionManager::new(agent.clone(), hub_url, token, authorized_keys));

    let cancel = CancellationToken::new();

    let posture_handle = tokio::spawn({
        let connection = connection.clone();
        let cancel = cancel.clone();
        async move { connection.run(cancel).await }
    });
    let pull_handle = tokio::spawn({
        let connection = connection.clone();
        let cancel = cancel.clone();
        async move { connection.run_config_pull_loop(cancel).await }
    });

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested, cancelling outstanding work");
    cancel.cancel();

    let _ = posture_handle.await;
    let _ = pull_handle.await;
    Ok(())
}

// Unit tests for CLI parsing and listen-address handling live in
// tests/cli_args.rs and hostpulse_agent::connection::server.
