//! Ed25519 identity persistence, authorized-keys-style allowlist parsing,
//! and the TLS cipher-suite allowlist (spec section 4.6 "Authentication" /
//! "Cryptographic posture").

use std::path::{Path, PathBuf};

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::warn;

pub fn identity_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join("id_ed25519")
}

/// Load the agent's persisted Ed25519 identity, or generate and persist a
/// fresh one (spec section 6 "Persisted state": `dataDir/id_ed25519`,
/// private key PEM, PKCS#8).
pub fn load_or_generate_identity(data_dir: &str) -> SigningKey {
    let path = identity_path(data_dir);
    if let Ok(pem) = std::fs::read_to_string(&path) {
        if let Ok(key) = SigningKey::from_pkcs8_pem(&pem) {
            return key;
        }
        warn!(path = %path.display(), "id_ed25519 present but unparseable, regenerating");
    }

    let key = SigningKey::generate(&mut OsRng);
    if let Err(e) = persist_identity(&path, &key) {
        warn!(error = %e, path = %path.display(), "failed to persist generated identity, continuing in-memory only");
    }
    key
}

fn persist_identity(path: &Path, key: &SigningKey) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pem = key.to_pkcs8_pem(Default::default()).map_err(std::io::Error::other)?;
    std::fs::write(path, pem.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Parse an authorized-keys-style allowlist: one hex-encoded 32-byte
/// Ed25519 public key per non-empty, non-`#`-prefixed line; an optional
/// trailing comment after whitespace is ignored (spec section 6 `KEY` env
/// var, "authorized-keys format").
pub fn parse_authorized_keys(raw: &str) -> Vec<VerifyingKey> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let key_field = line.split_whitespace().next()?;
            let bytes = hex::decode(key_field).ok()?;
            let arr: [u8; 32] = bytes.try_into().ok()?;
            VerifyingKey::from_bytes(&arr).ok()
        })
        .collect()
}

pub fn encode_public_key(key: &VerifyingKey) -> String {
    hex::encode(key.as_bytes())
}

/// Sign `message` with the agent's identity, hex-encoded for transport in
/// a header or query parameter.
pub fn sign_hex(key: &SigningKey, message: &[u8]) -> String {
    hex::encode(key.sign(message).to_bytes())
}

/// Verify a hex-encoded signature against any key in an allowlist.
pub fn verify_any(allowlist: &[VerifyingKey], message: &[u8], signature_hex: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(signature_hex) else { return false };
    let Ok(sig_bytes): Result<[u8; 64], _> = sig_bytes.try_into() else { return false };
    let signature = Signature::from_bytes(&sig_bytes);
    allowlist.iter().any(|key| key.verify(message, &signature).is_ok())
}

/// Restricted TLS cipher-suite set, mirrored from the hub side to ensure
/// interop (spec section 4.6 "Cryptographic posture"). TLS 1.3-only
/// AEAD suites; PTY is never granted (not applicable to this transport,
/// no shell is ever exposed). Consumed by both
/// `connection::server::restricted_tls_server_config` (inbound) and
/// `connection::client::restricted_tls_client_config` (outbound config pull)
/// so both TLS directions share one allowlist.
pub fn restricted_cipher_suites() -> Vec<rustls::SupportedCipherSuite> {
    vec![
        rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        rustls::crypto::ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_sign_and_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let allow = vec![key.verifying_key()];
        let sig = sign_hex(&key, b"channel-name");
        assert!(verify_any(&allow, b"channel-name", &sig));
        assert!(!verify_any(&allow, b"other-message", &sig));
    }

    #[test]
    fn parses_authorized_keys_with_comments_and_blank_lines() {
        let key = SigningKey::generate(&mut OsRng);
        let hex_key = encode_public_key(&key.verifying_key());
        let raw = format!("# comment\n\n{hex_key} hub-1\nnotahexkey garbage\n");
        let parsed = parse_authorized_keys(&raw);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], key.verifying_key());
    }

    #[test]
    fn unknown_key_fails_verification() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let allow = vec![other.verifying_key()];
        let sig = sign_hex(&key, b"msg");
        assert!(!verify_any(&allow, b"msg", &sig));
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let first = load_or_generate_identity(&data_dir);
        let second = load_or_generate_identity(&data_dir);
        assert_eq!(first.verifying_key(), second.verifying_key());
    }
}
