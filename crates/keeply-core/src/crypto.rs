//! File-envelope crypto (C2): AES-256-GCM with a PBKDF2-derived key, wrapped
//! in a fixed `MAGIC || VERSION || SALT || NONCE || CIPHERTEXT` header.
//!
//! The header format carries exactly one salt and one nonce per file, so
//! encryption is a single AEAD operation over the full plaintext rather than
//! a chunked stream cipher. The plaintext is still *read* in bounded chunks
//! (`READ_CHUNK`) to avoid depending on `Read::read_to_end` sizing
//! heuristics; this is streaming at the I/O layer, not at the AEAD layer.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::error::{KeeplyError, Result};
use crate::fsutil;

pub const MAGIC: &[u8; 9] = b"KEEPLYENC";
pub const VERSION: u8 = 1;
pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const PBKDF2_ITERATIONS: u32 = 250_000;
const KEY_LEN: usize = 32;
const READ_CHUNK: usize = 64 * 1024;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

/// First 16 bytes of the plain-store detector, per the external-interfaces
/// on-disk format note (`"SQLite format 3"` followed by a NUL).
pub const SQLITE_MAGIC_PREFIX: &[u8] = b"SQLite format 3\0";

fn derive_key(passphrase: &str, salt: &[u8; SALT_LEN]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn read_all(mut reader: impl Read, path: &Path) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf).map_err(|e| KeeplyError::io(path, e))?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Encrypts `plaintext` under `passphrase`, returning the full envelope.
pub fn encrypt_bytes(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let salt: [u8; SALT_LEN] = rand::random();
    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| KeeplyError::BadFormat("invalid key length".into()))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| KeeplyError::BadFormat("encryption failure".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts an envelope produced by [`encrypt_bytes`].
pub fn decrypt_bytes(envelope: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    if envelope.len() < HEADER_LEN {
        return Err(KeeplyError::BadFormat("envelope truncated".into()));
    }
    let (magic, rest) = envelope.split_at(MAGIC.len());
    if magic != MAGIC {
        return Err(KeeplyError::BadFormat("magic mismatch".into()));
    }
    let (version, rest) = rest.split_at(1);
    if version[0] != VERSION {
        return Err(KeeplyError::BadFormat(format!(
            "unsupported envelope version {}",
            version[0]
        )));
    }
    let (salt, rest) = rest.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let salt: [u8; SALT_LEN] = salt.try_into().expect("split_at guarantees length");
    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| KeeplyError::BadFormat("invalid key length".into()))?;
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| KeeplyError::BadPassphrase)
}

/// Encrypts the file at `plaintext_path` into `cipher_path`. No-op if the
/// plaintext is absent (matches the contract of a best-effort checkpoint).
pub fn encrypt(plaintext_path: &Path, cipher_path: &Path, passphrase: &str) -> Result<()> {
    if !plaintext_path.exists() {
        return Ok(());
    }
    let mut f = File::open(plaintext_path).map_err(|e| KeeplyError::io(plaintext_path, e))?;
    let plaintext = read_all(&mut f, plaintext_path)?;
    let envelope = encrypt_bytes(&plaintext, passphrase)?;
    fsutil::atomic_write(cipher_path, &envelope)
}

/// Decrypts `cipher_path` into `plaintext_path`.
pub fn decrypt(cipher_path: &Path, plaintext_path: &Path, passphrase: &str) -> Result<()> {
    let mut f = File::open(cipher_path).map_err(|e| KeeplyError::io(cipher_path, e))?;
    let envelope = read_all(&mut f, cipher_path)?;
    let plaintext = decrypt_bytes(&envelope, passphrase)?;

    if let Some(parent) = plaintext_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KeeplyError::io(parent, e))?;
    }
    let mut out = File::create(plaintext_path).map_err(|e| KeeplyError::io(plaintext_path, e))?;
    out.write_all(&plaintext)
        .map_err(|e| KeeplyError::io(plaintext_path, e))?;
    out.sync_all().map_err(|e| KeeplyError::io(plaintext_path, e))
}

fn header_sniff(path: &Path, len: usize) -> Result<Vec<u8>> {
    let mut f = File::open(path).map_err(|e| KeeplyError::io(path, e))?;
    let mut buf = vec![0u8; len];
    let n = f.read(&mut buf).map_err(|e| KeeplyError::io(path, e))?;
    buf.truncate(n);
    Ok(buf)
}

/// True if `path` begins with the envelope magic.
pub fn looks_encrypted(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let header = header_sniff(path, MAGIC.len())?;
    Ok(header == MAGIC)
}

/// True if `path` begins with the embedded store's plaintext magic.
pub fn looks_plain_sqlite(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let header = header_sniff(path, SQLITE_MAGIC_PREFIX.len())?;
    Ok(header == SQLITE_MAGIC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let plaintext = b"hello keeply".to_vec();
        let envelope = encrypt_bytes(&plaintext, "correct horse").unwrap();
        let decrypted = decrypt_bytes(&envelope, "correct horse").unwrap();
        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let envelope = encrypt_bytes(b"secret", "right").unwrap();
        let err = decrypt_bytes(&envelope, "wrong").unwrap_err();
        assert!(matches!(err, KeeplyError::BadPassphrase));
    }

    #[test]
    fn truncated_envelope_is_bad_format() {
        let err = decrypt_bytes(&[1, 2, 3], "pw").unwrap_err();
        assert!(matches!(err, KeeplyError::BadFormat(_)));
    }

    #[test]
    fn wrong_magic_is_bad_format() {
        let mut envelope = encrypt_bytes(b"x", "pw").unwrap();
        envelope[0] = b'X';
        let err = decrypt_bytes(&envelope, "pw").unwrap_err();
        assert!(matches!(err, KeeplyError::BadFormat(_)));
    }

    proptest::proptest! {
        /// `decrypt(encrypt(x, pw), pw) = x` for any byte sequence x and any
        /// non-empty passphrase pw.
        #[test]
        fn round_trip_holds_for_any_bytes(plaintext: Vec<u8>, passphrase in "\\PC+") {
            let envelope = encrypt_bytes(&plaintext, &passphrase).unwrap();
            let decrypted = decrypt_bytes(&envelope, &passphrase).unwrap();
            proptest::prop_assert_eq!(plaintext, decrypted);
        }

        /// `decrypt(encrypt(x, pw), pw')` fails with `BadPassphrase` for pw' != pw.
        #[test]
        fn wrong_passphrase_always_fails(plaintext: Vec<u8>, passphrase in "\\PC+", suffix in "\\PC+") {
            let wrong = format!("{passphrase}{suffix}");
            proptest::prop_assume!(wrong != passphrase);
            let envelope = encrypt_bytes(&plaintext, &passphrase).unwrap();
            let err = decrypt_bytes(&envelope, &wrong).unwrap_err();
            proptest::prop_assert!(matches!(err, KeeplyError::BadPassphrase));
        }
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.bin");
        let cipher = dir.path().join("cipher.enc");
        let restored = dir.path().join("restored.bin");
        std::fs::write(&plain, b"file contents").unwrap();

        encrypt(&plain, &cipher, "pw").unwrap();
        assert!(looks_encrypted(&cipher).unwrap());

        decrypt(&cipher, &restored, "pw").unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), b"file contents");
    }
}
