//! TLS certificate generation for the `serving` posture (spec section 4.6
//! / 6): exercised directly against the library rather than by spawning
//! the agent binary, since certificate material now lives under the
//! agent's `dataDir`, not an XDG config path.

use hostpulse_agent::connection::server::ensure_self_signed_cert;

#[test]
fn generates_self_signed_cert_and_key_under_data_dir() {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let data_dir = tmpdir.path().to_string_lossy().to_string();

    let (cert_path, key_path) = ensure_self_signed_cert(&data_dir).expect("cert generation");

    assert!(cert_path.exists(), "cert not found at {}", cert_path.display());
    assert!(key_path.exists(), "key not found at {}", key_path.display());
    assert!(std::fs::metadata(&cert_path).unwrap().len() > 0, "cert is empty");
    assert!(std::fs::metadata(&key_path).unwrap().len() > 0, "key is empty");
    assert_eq!(cert_path, tmpdir.path().join("tls").join("cert.pem"));
}

#[test]
fn reuses_existing_cert_across_calls() {
    let tmpdir = tempfile::tempdir().expect("tempdir");
    let data_dir = tmpdir.path().to_string_lossy().to_string();

    let (cert_path, _) = ensure_self_signed_cert(&data_dir).expect("first generation");
    let first = std::fs::read(&cert_path).unwrap();

    let (cert_path2, _) = ensure_self_signed_cert(&data_dir).expect("second call");
    let second = std::fs::read(&cert_path2).unwrap();

    assert_eq!(first, second, "a restart should reuse the persisted identity, not mint a new one");
}
