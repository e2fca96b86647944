//! Inbound `serving` posture (spec section 4.6): an `axum-server` listener
//! (TCP or Unix socket, TLS via `rustls`) that accepts one session per
//! connection, writes one newline-framed JSON snapshot, and closes with an
//! explicit success/failure signal — the WebSocket-close-code analogue of
//! the spec's exit codes 0/1.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use rcgen::CertifiedKey;
use serde::Deserialize;
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::connection::auth;
use crate::sampler::Sampler;

#[derive(Clone)]
pub struct ServerState {
    pub sampler: Arc<Sampler>,
    pub authorized_keys_raw: Arc<str>,
}

#[derive(Deserialize)]
pub struct SessionAuth {
    #[serde(default)]
    pubkey: String,
    #[serde(default)]
    sig: String,
    #[serde(default)]
    id: Option<String>,
}

/// Listen-address parsing (spec section 6): `/`-prefixed is a Unix socket,
/// `:`-containing is a TCP address as-is, else a bare port prefixed `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenTarget {
    Unix(PathBuf),
    Tcp(String),
}

pub fn parse_listen_address(value: &str, network_override: Option<&str>) -> ListenTarget {
    if let Some(net) = network_override {
        if net.eq_ignore_ascii_case("unix") {
            return ListenTarget::Unix(PathBuf::from(value));
        }
        if net.eq_ignore_ascii_case("tcp") {
            return ListenTarget::Tcp(normalize_tcp(value));
        }
    }
    if value.starts_with('/') {
        return ListenTarget::Unix(PathBuf::from(value));
    }
    ListenTarget::Tcp(normalize_tcp(value))
}

fn normalize_tcp(value: &str) -> String {
    if value.contains(':') {
        value.to_string()
    } else {
        format!(":{value}")
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Errors `serve` can return, split so the caller can tell a permanent
/// listener-bind failure (spec section 6/7: fatal, exit code 1) apart from
/// an accept-loop error that's worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl ServeError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServeError::Bind(_))
    }
}

/// Build a `rustls::ServerConfig` restricted to the hub-compatible cipher
/// suite allowlist (spec section 4.6 "Cryptographic posture"), loading the
/// cert/key PEM ourselves via `rustls-pemfile` since `RustlsConfig::from_pem_file`
/// has no way to pass a non-default `CryptoProvider` through.
fn restricted_tls_server_config(cert_path: &std::path::Path, key_path: &std::path::Path) -> anyhow::Result<rustls::ServerConfig> {
    let mut cert_reader = std::io::BufReader::new(std::fs::File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;

    let mut key_reader = std::io::BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    let provider = Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: auth::restricted_cipher_suites(),
        ..rustls::crypto::ring::default_provider()
    });

    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("restricted cipher suites reject default TLS protocol versions: {e}"))?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(config)
}

async fn ws_handler(ws: WebSocketUpgrade, Query(auth_params): Query<SessionAuth>, State(state): State<ServerState>) -> impl IntoResponse {
    let allowed = auth::parse_authorized_keys(&state.authorized_keys_raw);
    if !allowed.is_empty() {
        let session_id = auth_params.id.clone().unwrap_or_else(|| "session".to_string());
        if !auth::verify_any(&allowed, session_id.as_bytes(), &auth_params.sig) {
            warn!("rejecting inbound session: signature did not match any authorized key");
            return axum::http::StatusCode::UNAUTHORIZED.into_response();
        }
    }
    let _ = auth_params.pubkey;

    ws.on_upgrade(move |socket| handle_session(socket, state, auth_params.id.unwrap_or_else(|| "session".to_string())))
}

async fn handle_session(mut socket: WebSocket, state: ServerState, session_id: String) {
    let snapshot = state.sampler.sample(&session_id).await;
    match serde_json::to_string(&snapshot) {
        Ok(mut line) => {
            line.push('\n');
            if socket.send(Message::Text(line)).await.is_ok() {
                let _ = socket.send(Message::Close(Some(CloseFrame { code: 1000, reason: "ok".into() }))).await;
            }
        }
        Err(e) => {
            warn!(error = %e, session_id, "snapshot encode failed, closing with error code");
            let _ = socket.send(Message::Close(Some(CloseFrame { code: 1011, reason: "encode error".into() }))).await;
        }
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new().route("/ws", get(ws_handler)).route("/healthz", get(healthz)).with_state(state)
}

/// Self-signed certificate generation via `rcgen` (spec section 6 TLS
/// posture), persisted under `dataDir/tls` so restarts reuse the same
/// identity instead of minting a new one every boot.
pub fn ensure_self_signed_cert(data_dir: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
    let dir = PathBuf::from(data_dir).join("tls");
    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");
    if cert_path.exists() && key_path.exists() {
        return Ok((cert_path, key_path));
    }
    std::fs::create_dir_all(&dir)?;

    let hostname = hostname::get().ok().and_then(|s| s.into_string().ok()).unwrap_or_else(|| "localhost".to_string());
    let subject_alt_names = vec![hostname, "localhost".to_string()];
    let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(subject_alt_names).map_err(|e| anyhow::anyhow!(e))?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;
    info!(cert = %cert_path.display(), "generated self-signed TLS certificate");
    Ok((cert_path, key_path))
}

/// Bind and serve until the listener errors or the process is asked to
/// stop. Unix-socket listeners remove a stale socket file before binding
/// (spec section 6). The initial bind is kept separate from the accept
/// loop so a permanent bind failure (`EADDRINUSE`, permission denied on a
/// privileged port) can be classified `ServeError::Bind` and treated as
/// fatal by the caller (spec section 6/7).
pub async fn serve(target: ListenTarget, cert_path: PathBuf, key_path: PathBuf, state: ServerState) -> Result<(), ServeError> {
    let app = router(state);
    let server_config = restricted_tls_server_config(&cert_path, &key_path)?;
    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(server_config);

    match target {
        ListenTarget::Tcp(addr) => {
            let socket_addr: SocketAddr = addr
                .trim_start_matches(':')
                .parse()
                .or_else(|_| format!("0.0.0.0{addr}").parse())
                .map_err(|e: std::net::AddrParseError| ServeError::Runtime(anyhow::anyhow!("invalid listen address {addr}: {e}")))?;
            let std_listener = std::net::TcpListener::bind(socket_addr).map_err(ServeError::Bind)?;
            std_listener.set_nonblocking(true).map_err(ServeError::Bind)?;
            info!(%socket_addr, "serving inbound sessions");
            axum_server::from_tcp_rustls(std_listener, tls_config).serve(app.into_make_service()).await.map_err(|e| ServeError::Runtime(e.into()))?;
        }
        ListenTarget::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(&path).map_err(ServeError::Bind)?;
            }
            let listener = UnixListener::bind(&path).map_err(ServeError::Bind)?;
            info!(path = %path.display(), "serving inbound sessions over unix socket");
            // axum-server has no first-class Unix+TLS acceptor; TLS over a
            // local socket adds no confidentiality over a filesystem-permission-
            // guarded path, so the unix posture serves plaintext HTTP.
            axum::serve(listener, app.into_make_service()).await.map_err(|e| ServeError::Runtime(e.into()))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_address_slash_prefix_is_unix_socket() {
        assert_eq!(parse_listen_address("/run/agent.sock", None), ListenTarget::Unix(PathBuf::from("/run/agent.sock")));
    }

    #[test]
    fn listen_address_with_colon_is_tcp_verbatim() {
        assert_eq!(parse_listen_address("0.0.0.0:9999", None), ListenTarget::Tcp("0.0.0.0:9999".to_string()));
    }

    #[test]
    fn bare_port_gets_colon_prefix() {
        assert_eq!(parse_listen_address("45876", None), ListenTarget::Tcp(":45876".to_string()));
    }

    #[test]
    fn network_override_wins_over_shape_inference() {
        assert_eq!(parse_listen_address("45876", Some("unix")), ListenTarget::Unix(PathBuf::from("45876")));
    }
}
