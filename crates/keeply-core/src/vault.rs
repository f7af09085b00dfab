//! Blob vault (C7): a content-addressed store of AES-GCM encrypted file
//! bodies under `<dest>/.keeply/storage/`. Deduplication is free: existence
//! plus atomic rename is the synchronization primitive, so two workers
//! racing to `put` the same hash are both safe.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::crypto;
use crate::error::{KeeplyError, Result};
use crate::fsutil;
use crate::store::MetadataStore;

const PASSWORD_VERIFIER_KEY: &str = "password_verifier";

pub struct BlobVault {
    storage_dir: PathBuf,
}

impl BlobVault {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        BlobVault { storage_dir: storage_dir.into() }
    }

    /// `<storage>/<hash[0:2]>/<hash[2:]>.blob`.
    pub fn path_for(&self, hex_hash: &str) -> PathBuf {
        let split = hex_hash.len().min(2);
        let (prefix, rest) = hex_hash.split_at(split);
        self.storage_dir.join(prefix).join(format!("{rest}.blob"))
    }

    pub fn exists(&self, hex_hash: &str) -> bool {
        self.path_for(hex_hash).exists()
    }

    /// Hashes `source_path`'s bytes with SHA-256; if a blob for that hash
    /// already exists, this is a no-op (content is assumed immutable).
    /// Otherwise encrypts into `<hash>.blob.tmp` and atomically renames.
    pub fn put_file(&self, source_path: &Path, passphrase: &str) -> Result<String> {
        let bytes = fs::read(source_path).map_err(|e| KeeplyError::io(source_path, e))?;
        let hash = sha256_hex(&bytes);
        let dest = self.path_for(&hash);
        if dest.exists() {
            return Ok(hash);
        }
        let envelope = crypto::encrypt_bytes(&bytes, passphrase)?;
        fsutil::atomic_write(&dest, &envelope)?;
        Ok(hash)
    }

    /// Decrypts the blob for `hex_hash` into `dest_path`, re-hashing the
    /// plaintext to verify it still matches its content-address.
    pub fn get_to_file(&self, hex_hash: &str, dest_path: &Path, passphrase: &str) -> Result<()> {
        let path = self.path_for(hex_hash);
        let envelope = fs::read(&path).map_err(|e| KeeplyError::io(&path, e))?;
        let plaintext = crypto::decrypt_bytes(&envelope, passphrase)?;

        let recomputed = sha256_hex(&plaintext);
        if recomputed != hex_hash {
            return Err(KeeplyError::BadFormat(format!(
                "blob {hex_hash} decrypted to content hashing to {recomputed}"
            )));
        }

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| KeeplyError::io(parent, e))?;
        }
        let part_path = part_path_for(dest_path);
        fs::write(&part_path, &plaintext).map_err(|e| KeeplyError::io(&part_path, e))?;
        fs::rename(&part_path, dest_path).map_err(|e| KeeplyError::io(dest_path, e))?;
        Ok(())
    }

    /// Attempts to decrypt any one existing blob with `passphrase`. An empty
    /// vault has nothing to verify against and is accepted. On success,
    /// caches a fingerprint of the password (never the password itself) in
    /// `backup_settings` so subsequent calls can short-circuit.
    pub fn verify_password(&self, passphrase: &str, store: &MetadataStore) -> Result<bool> {
        let fingerprint = passphrase_fingerprint(passphrase);
        if let Some(cached) = store.get_setting(PASSWORD_VERIFIER_KEY)? {
            return Ok(cached == fingerprint);
        }
        let ok = match self.sample_blob()? {
            Some(path) => {
                let envelope = fs::read(&path).map_err(|e| KeeplyError::io(&path, e))?;
                crypto::decrypt_bytes(&envelope, passphrase).is_ok()
            }
            None => true,
        };
        if ok {
            store.set_setting(PASSWORD_VERIFIER_KEY, &fingerprint)?;
        }
        Ok(ok)
    }

    fn sample_blob(&self) -> Result<Option<PathBuf>> {
        if !self.storage_dir.exists() {
            return Ok(None);
        }
        for shard in fs::read_dir(&self.storage_dir).map_err(|e| KeeplyError::io(&self.storage_dir, e))? {
            let shard = shard.map_err(|e| KeeplyError::io(&self.storage_dir, e))?;
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            for entry in fs::read_dir(shard.path()).map_err(|e| KeeplyError::io(shard.path(), e))? {
                let entry = entry.map_err(|e| KeeplyError::io(shard.path(), e))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("blob") {
                    return Ok(Some(path));
                }
            }
        }
        Ok(None)
    }

    /// Removes stray `.tmp` files left by an aborted `put_file`, best
    /// effort. Called on cancellation.
    pub fn cleanup_incomplete(&self) {
        let Ok(shards) = fs::read_dir(&self.storage_dir) else { return };
        for shard in shards.flatten() {
            let Ok(entries) = fs::read_dir(shard.path()) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }
}

fn part_path_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn passphrase_fingerprint(passphrase: &str) -> String {
    sha256_hex(passphrase.as_bytes())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips_content() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, b"foo").unwrap();

        let vault = BlobVault::new(dir.path().join("storage"));
        let hash = vault.put_file(&source, "pw").unwrap();
        assert!(vault.exists(&hash));

        let dest = dir.path().join("restored.txt");
        vault.get_to_file(&hash, &dest, "pw").unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"foo");
    }

    #[test]
    fn putting_same_content_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, b"same bytes").unwrap();

        let vault = BlobVault::new(dir.path().join("storage"));
        let hash1 = vault.put_file(&source, "pw").unwrap();
        let hash2 = vault.put_file(&source, "pw").unwrap();
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn get_with_wrong_password_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("a.txt");
        fs::write(&source, b"secret contents").unwrap();

        let vault = BlobVault::new(dir.path().join("storage"));
        let hash = vault.put_file(&source, "right").unwrap();

        let dest = dir.path().join("out.txt");
        let err = vault.get_to_file(&hash, &dest, "wrong").unwrap_err();
        assert!(matches!(err, KeeplyError::BadPassphrase));
    }
}
