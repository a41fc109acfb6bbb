//! On-disk key store.
//!
//! Four files under the storage directory: the PEM certificate chains and
//! the encrypted, TPM-exported key blobs. Either all four are present and
//! loadable or the store counts as unprovisioned.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const AKCHAIN_FILE: &str = "akchain.pem";
pub const IKCHAIN_FILE: &str = "ikchain.pem";
pub const AK_BLOB_FILE: &str = "ak_encrypted.json";
pub const IK_BLOB_FILE: &str = "ik_encrypted.json";

/// A TPM-exported key: the public area and the parent-encrypted private
/// blob. Only the TPM that created it can load it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBlob {
    #[serde(with = "attestation_report::encoding::b64_bytes")]
    pub public: Vec<u8>,
    #[serde(with = "attestation_report::encoding::b64_bytes")]
    pub private: Vec<u8>,
}

/// Both certificate chain files are present.
pub fn chains_present(dir: &Path) -> bool {
    dir.join(AKCHAIN_FILE).is_file() && dir.join(IKCHAIN_FILE).is_file()
}

/// Create the storage directory with mode 0755 if missing.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        fs_err::create_dir_all(dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;
        set_mode(dir, 0o755)?;
    }
    Ok(())
}

pub fn save_chain(dir: &Path, file: &str, chain_der: &[Vec<u8>]) -> Result<()> {
    let mut bundle = String::new();
    for der in chain_der {
        bundle.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())));
    }
    let path = dir.join(file);
    fs_err::write(&path, bundle.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    set_mode(&path, 0o644)?;
    Ok(())
}

/// Load a PEM chain preserving order (leaf first).
pub fn load_chain(dir: &Path, file: &str) -> Result<Vec<Vec<u8>>> {
    let path = dir.join(file);
    let data = fs_err::read(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let pems = pem::parse_many(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let chain: Vec<Vec<u8>> = pems.into_iter().map(|p| p.into_contents()).collect();
    debug!("loaded chain of length {} from {file}", chain.len());
    Ok(chain)
}

pub fn save_blob(dir: &Path, file: &str, blob: &KeyBlob) -> Result<()> {
    let path = dir.join(file);
    let data = serde_json::to_vec_pretty(blob).context("failed to serialize key blob")?;
    fs_err::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
    set_mode(&path, 0o644)?;
    Ok(())
}

pub fn load_blob(dir: &Path, file: &str) -> Result<KeyBlob> {
    let path = dir.join(file);
    let data = fs_err::read(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs_err::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_roundtrip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let chain = vec![b"leaf".to_vec(), b"intermediate".to_vec(), b"root".to_vec()];
        save_chain(dir.path(), AKCHAIN_FILE, &chain).unwrap();
        let loaded = load_chain(dir.path(), AKCHAIN_FILE).unwrap();
        assert_eq!(loaded, chain);
    }

    #[test]
    fn blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let blob = KeyBlob {
            public: vec![1, 2, 3],
            private: vec![4, 5, 6],
        };
        save_blob(dir.path(), AK_BLOB_FILE, &blob).unwrap();
        let loaded = load_blob(dir.path(), AK_BLOB_FILE).unwrap();
        assert_eq!(loaded.public, blob.public);
        assert_eq!(loaded.private, blob.private);
    }

    #[test]
    fn missing_chain_file_means_unprovisioned() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!chains_present(dir.path()));

        save_chain(dir.path(), AKCHAIN_FILE, &[b"leaf".to_vec()]).unwrap();
        assert!(!chains_present(dir.path()));

        save_chain(dir.path(), IKCHAIN_FILE, &[b"leaf".to_vec()]).unwrap();
        assert!(chains_present(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn files_written_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        save_chain(dir.path(), IKCHAIN_FILE, &[b"leaf".to_vec()]).unwrap();
        let mode = fs_err::metadata(dir.path().join(IKCHAIN_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
