//! Outbound `pushing` posture (spec section 4.6): a `tokio-tungstenite`
//! reconnect loop with the spec's exact backoff/decorrelation timings, plus
//! the `ConfigReconciler` pull path (spec section 4.7), which reuses the
//! same `hyper`-based HTTP client style as `containers::client`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::Rng;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigUpdateRequest;
use crate::connection::auth;
use crate::sampler::Sampler;

const PUSH_SLEEP_MIN: Duration = Duration::from_secs(15);
const PUSH_SLEEP_MAX: Duration = Duration::from_secs(45);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("hub rejected our key")]
    AuthRejected,
}

/// One pushing-mode cycle: connect, authenticate, write snapshots until the
/// socket errs or is asked to stop. Returns only on error or cooperative
/// cancellation; the caller (`ConnectionManager`) owns the backoff index.
pub async fn run_pushing(
    hub_url: &str,
    token: &str,
    identity: &SigningKey,
    server_key_allowlist_raw: &str,
    sampler: &Sampler,
    caller_id: &str,
    agent_version: &str,
    cancel: &CancellationToken,
) -> Result<(), PushError> {
    let server_keys = auth::parse_authorized_keys(server_key_allowlist_raw);
    let channel = format!("agent-v{agent_version}");
    let signature = auth::sign_hex(identity, channel.as_bytes());
    let pubkey = auth::encode_public_key(&identity.verifying_key());

    let url = format!("{}/agent/{}?pubkey={}&sig={}", hub_url.trim_end_matches('/'), channel, pubkey, signature);
    let mut request = url.into_client_request().map_err(|e| PushError::Dial(e.to_string()))?;
    request.headers_mut().insert("Authorization", format!("Bearer {token}").parse().map_err(|_| PushError::Dial("invalid token".into()))?);

    let connect = tokio_tungstenite::connect_async(request);
    let (mut ws, response) = tokio::time::timeout(DIAL_TIMEOUT, connect).await.map_err(|_| PushError::Dial("timeout".into()))?.map_err(|e| PushError::Dial(e.to_string()))?;

    if response.status() == StatusCode::UNAUTHORIZED || response.status() == StatusCode::FORBIDDEN {
        return Err(PushError::AuthRejected);
    }
    // Pinned server key check: if the hub returned its own signature header,
    // verify it against the allowlist before trusting anything it sends.
    if !server_keys.is_empty() {
        if let Some(server_sig) = response.headers().get("x-agent-server-sig").and_then(|v| v.to_str().ok()) {
            if !auth::verify_any(&server_keys, channel.as_bytes(), server_sig) {
                return Err(PushError::AuthRejected);
            }
        }
    }

    info!(channel, "pushing channel established");

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let snapshot = sampler.sample(caller_id).await;
        let payload = match serde_json::to_string(&snapshot) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to encode snapshot, skipping this push");
                continue;
            }
        };

        if let Err(e) = ws.send(Message::Text(payload.into())).await {
            return Err(PushError::Transport(e.to_string()));
        }

        // Drain any config push the hub sent back without blocking the loop.
        while let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_millis(1), ws.next()).await {
            if let Message::Text(text) = msg {
                debug!("received inbound message on push channel: {} bytes", text.len());
            }
        }

        let sleep_secs = rand::thread_rng().gen_range(PUSH_SLEEP_MIN.as_secs()..=PUSH_SLEEP_MAX.as_secs());
        let sleep = Duration::from_secs(sleep_secs);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = cancel.cancelled() => return Ok(()),
        }
    }
}

/// Backoff index tracker: `pushing → backoff` waits `2·k` seconds, `k`
/// strictly increasing until a successful `pushing → pushing` transition
/// resets it (spec section 4.6).
pub struct BackoffIndex(AtomicU32);

impl BackoffIndex {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn next_delay(&self) -> Duration {
        let k = self.0.fetch_add(1, Ordering::Relaxed) + 1;
        Duration::from_secs(2 * k as u64)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

impl Default for BackoffIndex {
    fn default() -> Self {
        Self::new()
    }
}

type HttpsClient = Client<hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>, Full<bytes::Bytes>>;

/// Restricted TLS client config for the config-pull HTTP client (spec
/// section 4.6 "Cryptographic posture"): the same hub-compatible
/// cipher-suite allowlist as the inbound server side, built by hand since
/// `HttpsConnectorBuilder::with_webpki_roots` has no way to pass a
/// non-default `CryptoProvider` through.
fn restricted_tls_client_config() -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: auth::restricted_cipher_suites(),
        ..rustls::crypto::ring::default_provider()
    });
    let roots = rustls::RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.into() };
    rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("restricted cipher suites support the default TLS protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn https_client() -> HttpsClient {
    let https = hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(restricted_tls_client_config()).https_or_http().enable_http1().build();
    Client::builder(TokioExecutor::new()).build(https)
}

/// `GET {hubUrl}/api/beszel/agent-config` with bearer token (spec section
/// 4.7 "Pull"). Returns `None` on any transport/decode failure; callers
/// treat that the same as "no update this cycle".
pub async fn pull_config(hub_url: &str, token: &str) -> Option<ConfigUpdateRequest> {
    let uri: hyper::Uri = format!("{}/api/beszel/agent-config", hub_url.trim_end_matches('/')).parse().ok()?;
    let req = Request::builder().method("GET").uri(uri).header("Authorization", format!("Bearer {token}")).body(Full::new(bytes::Bytes::new())).ok()?;

    let client = https_client();
    let resp = match tokio::time::timeout(PULL_TIMEOUT, client.request(req)).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => {
            warn!(error = %e, "config pull transport error");
            return None;
        }
        Err(_) => {
            warn!("config pull timed out");
            return None;
        }
    };

    if !resp.status().is_success() {
        warn!(status = %resp.status(), "config pull non-success status");
        return None;
    }

    let body = resp.into_body().collect().await.ok()?.to_bytes();
    match serde_json::from_slice::<ConfigUpdateRequest>(&body) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "config pull decode error");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_index_doubles_each_step() {
        let b = BackoffIndex::new();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(4));
        assert_eq!(b.next_delay(), Duration::from_secs(6));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }
}
