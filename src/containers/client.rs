//! Unix-domain-socket HTTP client for the container daemon (spec section
//! 4.3 "HTTP client policy").

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use serde::de::DeserializeOwned;

/// Fixed UA string: works around a known daemon bug that rejects requests
/// with an empty User-Agent (spec section 4.3 / 6).
const USER_AGENT: &str = "Docker-Client/24.0.0 (linux)";
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2_100);

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("daemon returned status {0}")]
    Status(StatusCode),
    #[error("decode error: {0}")]
    Decode(String),
}

type PooledClient = Client<UnixConnector, Full<Bytes>>;

fn new_pooled_client() -> PooledClient {
    Client::builder(TokioExecutor::new())
        // Short idle timeout: pairs with the explicit reset on timeout below
        // to avoid handing a stale connection back to a daemon that just
        // timed out on us (spec section 4.3).
        .pool_idle_timeout(Duration::from_secs(5))
        .pool_max_idle_per_host(4)
        .build(UnixConnector::default())
}

pub struct DaemonClient {
    socket_path: PathBuf,
    client: Mutex<PooledClient>,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self::with_timeout(socket_path, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(socket_path: PathBuf, timeout: Duration) -> Self {
        Self { socket_path, client: Mutex::new(new_pooled_client()), timeout }
    }

    pub fn is_podman(&self) -> bool {
        self.socket_path.to_string_lossy().contains("podman")
    }

    async fn get(&self, path_and_query: &str) -> Result<Bytes, DaemonError> {
        let uri: hyper::Uri = UnixUri::new(&self.socket_path, path_and_query).into();
        let req = Request::builder()
            .method("GET")
            .uri(uri)
            .header("User-Agent", USER_AGENT)
            .body(Full::new(Bytes::new()))
            .map_err(|e| DaemonError::Transport(e.to_string()))?;

        let client = self.client.lock().expect("daemon client lock poisoned").clone();
        let resp = match tokio::time::timeout(self.timeout, client.request(req)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return Err(DaemonError::Transport(e.to_string())),
            Err(_) => {
                // Idle-connection closer: drop the pooled client so the next
                // request opens fresh rather than reusing a connection the
                // daemon may have wedged.
                *self.client.lock().expect("daemon client lock poisoned") = new_pooled_client();
                return Err(DaemonError::Timeout);
            }
        };

        if !resp.status().is_success() {
            return Err(DaemonError::Status(resp.status()));
        }

        let body = resp.into_body().collect().await.map_err(|e| DaemonError::Transport(e.to_string()))?.to_bytes();
        Ok(body)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T, DaemonError> {
        let body = self.get(path_and_query).await?;
        serde_json::from_slice(&body).map_err(|e| DaemonError::Decode(e.to_string()))
    }
}

/// Try `/var/run/docker.sock`, then `/run/user/<uid>/podman/podman.sock`;
/// first existing wins. `DOCKER_HOST` overrides; an empty value disables
/// the manager entirely (spec section 4.3 "Socket selection").
pub fn select_socket(docker_host_env: Option<&str>, uid: u32) -> Option<PathBuf> {
    if let Some(host) = docker_host_env {
        if host.is_empty() {
            return None;
        }
        let path = host.strip_prefix("unix://").unwrap_or(host);
        return Some(PathBuf::from(path));
    }

    let docker = PathBuf::from("/var/run/docker.sock");
    if docker.exists() {
        return Some(docker);
    }
    let podman = PathBuf::from(format!("/run/user/{uid}/podman/podman.sock"));
    if podman.exists() {
        return Some(podman);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_docker_host_disables_manager() {
        assert!(select_socket(Some(""), 1000).is_none());
    }

    #[test]
    fn docker_host_override_strips_unix_scheme() {
        let p = select_socket(Some("unix:///tmp/custom.sock"), 1000).unwrap();
        assert_eq!(p, PathBuf::from("/tmp/custom.sock"));
    }

    #[test]
    fn podman_detected_by_socket_path() {
        let client = DaemonClient::new(PathBuf::from("/run/user/1000/podman/podman.sock"));
        assert!(client.is_podman());
        let client2 = DaemonClient::new(PathBuf::from("/var/run/docker.sock"));
        assert!(!client2.is_podman());
    }
}
