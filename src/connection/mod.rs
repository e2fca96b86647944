//! Connection posture state machine (spec section 4.6): `disconnected`,
//! `serving`, `pushing`, `backoff`. Exactly one posture is active at a
//! time; a restart-requiring config change tears the current posture down
//! and re-evaluates from `disconnected`.

pub mod auth;
pub mod client;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::config::AgentConfig;
use client::{pull_config, run_pushing, BackoffIndex, PushError};
use server::{ensure_self_signed_cert, serve, parse_listen_address, ServerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posture {
    Disconnected,
    Serving,
    Pushing,
    Backoff,
}

/// Decide the posture implied by a config snapshot (spec section 4.6 entry
/// triggers): a hub URL + token means `pushing`; otherwise a configured
/// `listen` means `serving`.
fn posture_for(cfg: &AgentConfig, hub_url: &str, token: &str) -> Posture {
    if !hub_url.is_empty() && !token.is_empty() {
        Posture::Pushing
    } else if !cfg.listen.is_empty() {
        Posture::Serving
    } else {
        Posture::Disconnected
    }
}

pub struct ConnectionManager {
    agent: Arc<Agent>,
    hub_url: String,
    token: String,
    authorized_keys_raw: String,
    restart: Arc<Notify>,
}

impl ConnectionManager {
    pub fn new(agent: Arc<Agent>, hub_url: String, token: String, authorized_keys_raw: String) -> Self {
        Self { agent, hub_url, token, authorized_keys_raw, restart: Arc::new(Notify::new()) }
    }

    /// Handle the config reconciler asking for a posture teardown
    /// (`serving|pushing → disconnected`, spec section 4.6).
    pub fn signal_restart(&self) {
        self.restart.notify_waiters();
    }

    /// Drives the posture state machine until `cancel` fires. One loop
    /// iteration picks a posture from the current config, runs it until it
    /// either errs (pushing) or a restart is signalled (serving/pushing),
    /// then re-evaluates.
    pub async fn run(&self, cancel: CancellationToken) {
        let backoff = BackoffIndex::new();

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let cfg = self.agent.config.current();
            match posture_for(&cfg, &self.hub_url, &self.token) {
                Posture::Pushing => {
                    info!("entering pushing posture");
                    let outcome = tokio::select! {
                        r = run_pushing(&self.hub_url, &self.token, &self.agent.identity, &self.authorized_keys_raw, &self.agent.sampler, "hub", env!("CARGO_PKG_VERSION"), &cancel) => r,
                        _ = self.restart.notified() => {
                            info!("pushing posture torn down by config restart");
                            continue;
                        }
                    };

                    match outcome {
                        Ok(()) => {
                            backoff.reset();
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!(error = %e, delay_secs = delay.as_secs(), "pushing failed, entering backoff");
                            if matches!(e, PushError::AuthRejected) {
                                warn!("hub rejected our public key");
                            }
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => return,
                            }
                        }
                    }
                }
                Posture::Serving => {
                    info!("entering serving posture");
                    let listen = parse_listen_address(&cfg.listen, cfg.network.as_deref());
                    let cert = ensure_self_signed_cert(&cfg.data_dir);
                    let (cert_path, key_path) = match cert {
                        Ok(paths) => paths,
                        Err(e) => {
                            warn!(error = %e, "failed to prepare TLS material, retrying in 5s");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            continue;
                        }
                    };
                    let state = ServerState { sampler: self.agent.sampler.clone(), authorized_keys_raw: self.authorized_keys_raw.clone().into() };

                    tokio::select! {
                        r = serve(listen, cert_path, key_path, state) => {
                            match r {
                                Ok(()) => {}
                                Err(e) if e.is_fatal() => {
                                    // spec section 6 "Exit codes" / section 7 "Fatal": a
                                    // permanent listener-bind failure never clears on its
                                    // own, so exit and let an init system restart us.
                                    error!(error = %e, "listener bind failed permanently, exiting");
                                    std::process::exit(1);
                                }
                                Err(e) => {
                                    warn!(error = %e, "listener exited, retrying in 5s");
                                    tokio::time::sleep(Duration::from_secs(5)).await;
                                }
                            }
                        }
                        _ = self.restart.notified() => {
                            info!("serving posture torn down by config restart");
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
                Posture::Disconnected => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
                Posture::Backoff => unreachable!("Backoff is an internal sub-state of the pushing arm, never chosen by posture_for"),
            }
        }
    }

    /// Spec section 4.7 "Pull": only meaningful when a hub URL is
    /// configured; runs independently of the current posture on a fixed
    /// cadence.
    pub async fn run_config_pull_loop(&self, cancel: CancellationToken) {
        if self.hub_url.is_empty() {
            return;
        }
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                _ = cancel.cancelled() => return,
            }
            if let Some(update) = pull_config(&self.hub_url, &self.token).await {
                let force_restart = update.force_restart;
                let result = self.agent.config.apply(update);
                if force_restart || matches!(result, crate::config::ApplyResult::AppliedRestart) {
                    self.signal_restart();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(listen: &str) -> AgentConfig {
        let mut c = AgentConfig::default();
        c.listen = listen.to_string();
        c
    }

    #[test]
    fn hub_url_and_token_selects_pushing() {
        assert_eq!(posture_for(&cfg(":45876"), "https://hub.example", "tok"), Posture::Pushing);
    }

    #[test]
    fn listen_without_hub_selects_serving() {
        assert_eq!(posture_for(&cfg(":45876"), "", ""), Posture::Serving);
    }

    #[test]
    fn neither_selects_disconnected() {
        assert_eq!(posture_for(&cfg(""), "", ""), Posture::Disconnected);
    }
}
