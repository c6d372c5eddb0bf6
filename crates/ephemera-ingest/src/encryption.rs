//! Password encryption at rest: Argon2id key derivation, AES-256-CTR stream cipher.
//!
//! On-disk layout of an encrypted artifact:
//!
//! ```text
//! magic "EPHC" | version u8 | m_cost u32 | t_cost u32 | p_cost u32 | salt [16] | iv [16] | key check [32] | ciphertext
//! ```
//!
//! Integers are little endian. The key check is an HKDF-SHA256 expansion of the
//! derived key; it lets decryption reject a wrong password instead of returning
//! garbage. Callers holding an Argon2 PHC hash of the password verify it first.

use std::fs::OpenOptions;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KdfConfig;
use crate::error::{IngestError, IngestResult};
use crate::store::PartialFile;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Header magic.
pub const MAGIC: [u8; 4] = *b"EPHC";
/// Header format version.
pub const FORMAT_VERSION: u8 = 1;
/// Salt length in bytes.
pub const SALT_LEN: usize = 16;
/// IV length in bytes.
pub const IV_LEN: usize = 16;
/// Key-check length in bytes.
pub const CHECK_LEN: usize = 32;
/// Derived key length in bytes.
pub const KEY_LEN: usize = 32;
/// Total header length in bytes.
pub const HEADER_LEN: usize = 4 + 1 + 12 + SALT_LEN + IV_LEN + CHECK_LEN;

/// Largest Argon2 memory cost accepted from a header, in KiB (1 GiB).
pub const MAX_HEADER_MEMORY_KIB: u32 = 1024 * 1024;
/// Largest Argon2 pass count accepted from a header.
pub const MAX_HEADER_ITERATIONS: u32 = 64;
/// Largest Argon2 lane count accepted from a header.
pub const MAX_HEADER_PARALLELISM: u32 = 64;

const CHUNK_LEN: usize = 64 * 1024;
const KEY_CHECK_INFO: &[u8] = b"ephemera-key-check";

/// 256-bit key derived from a password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; KEY_LEN]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// Parsed artifact header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    /// Argon2 parameters the key was derived with.
    pub kdf: KdfConfig,
    /// Key-derivation salt.
    pub salt: [u8; SALT_LEN],
    /// CTR initialization vector.
    pub iv: [u8; IV_LEN],
    /// HKDF expansion of the key.
    pub key_check: [u8; CHECK_LEN],
}

impl EncryptionHeader {
    /// Serialize to the on-disk layout.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4] = FORMAT_VERSION;
        out[5..9].copy_from_slice(&self.kdf.memory_kib.to_le_bytes());
        out[9..13].copy_from_slice(&self.kdf.iterations.to_le_bytes());
        out[13..17].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        let mut at = 17;
        out[at..at + SALT_LEN].copy_from_slice(&self.salt);
        at += SALT_LEN;
        out[at..at + IV_LEN].copy_from_slice(&self.iv);
        at += IV_LEN;
        out[at..at + CHECK_LEN].copy_from_slice(&self.key_check);
        out
    }

    /// Parse the on-disk layout.
    pub fn parse(buf: &[u8]) -> IngestResult<Self> {
        if buf.len() < HEADER_LEN || buf[0..4] != MAGIC {
            return Err(IngestError::Encryption("not an encrypted artifact".into()));
        }
        if buf[4] != FORMAT_VERSION {
            return Err(IngestError::Encryption(format!(
                "unsupported format version {}",
                buf[4]
            )));
        }
        let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let kdf = KdfConfig {
            memory_kib: word(5),
            iterations: word(9),
            parallelism: word(13),
        };
        if kdf.memory_kib > MAX_HEADER_MEMORY_KIB
            || kdf.iterations > MAX_HEADER_ITERATIONS
            || kdf.parallelism > MAX_HEADER_PARALLELISM
        {
            return Err(IngestError::Encryption(format!(
                "header key-derivation costs out of range: m={} t={} p={}",
                kdf.memory_kib, kdf.iterations, kdf.parallelism
            )));
        }
        let mut header = EncryptionHeader {
            kdf,
            salt: [0u8; SALT_LEN],
            iv: [0u8; IV_LEN],
            key_check: [0u8; CHECK_LEN],
        };
        let mut at = 17;
        header.salt.copy_from_slice(&buf[at..at + SALT_LEN]);
        at += SALT_LEN;
        header.iv.copy_from_slice(&buf[at..at + IV_LEN]);
        at += IV_LEN;
        header.key_check.copy_from_slice(&buf[at..at + CHECK_LEN]);
        Ok(header)
    }
}

fn argon2(kdf: &KdfConfig) -> IngestResult<Argon2<'static>> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
        .map_err(|e| IngestError::Encryption(format!("argon2 parameters: {e}")))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Derive the file key from a password and salt. CPU and memory heavy.
pub fn derive_key(password: &[u8], salt: &[u8], kdf: &KdfConfig) -> IngestResult<EncryptionKey> {
    let mut key = EncryptionKey([0u8; KEY_LEN]);
    argon2(kdf)?
        .hash_password_into(password, salt, &mut key.0)
        .map_err(|e| IngestError::Encryption(format!("key derivation: {e}")))?;
    Ok(key)
}

/// HKDF-SHA256 expansion of the key stored in the header.
pub fn key_check(key: &EncryptionKey) -> IngestResult<[u8; CHECK_LEN]> {
    let hk = Hkdf::<Sha256>::new(None, &key.0);
    let mut okm = [0u8; CHECK_LEN];
    hk.expand(KEY_CHECK_INFO, &mut okm)
        .map_err(|e| IngestError::Encryption(format!("key check: {e}")))?;
    Ok(okm)
}

/// Argon2id PHC string for later password verification.
pub fn hash_password(password: &str, kdf: &KdfConfig) -> IngestResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    argon2(kdf)?
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| IngestError::Encryption(format!("password hash: {e}")))
}

/// Check a password against a PHC string produced by [`hash_password`].
pub fn verify_password(password: &str, phc: &str) -> IngestResult<bool> {
    let parsed = PasswordHash::new(phc)
        .map_err(|e| IngestError::Encryption(format!("stored password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

/// Whether `path` starts with the encrypted-artifact magic.
pub fn is_encrypted(path: &Path) -> std::io::Result<bool> {
    let mut head = [0u8; 4];
    let mut file = std::fs::File::open(path)?;
    match file.read_exact(&mut head) {
        Ok(()) => Ok(head == MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".sealing");
    path.with_file_name(name)
}

/// Encrypt the file at `path` in place. Returns the encrypted size on disk.
pub fn encrypt_file(path: &Path, password: &str, kdf: &KdfConfig) -> IngestResult<u64> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let key = derive_key(password.as_bytes(), &salt, kdf)?;
    let header = EncryptionHeader {
        kdf: *kdf,
        salt,
        iv,
        key_check: key_check(&key)?,
    };
    let mut cipher = Aes256Ctr::new_from_slices(&key.0, &iv)
        .map_err(|e| IngestError::Encryption(format!("cipher init: {e}")))?;

    let staging = staging_path(path);
    let mut input = std::fs::File::open(path)?;
    let output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)?;
    let guard = PartialFile::new(staging.clone());

    let mut writer = BufWriter::new(output);
    writer.write_all(&header.to_bytes())?;
    let mut buf = Zeroizing::new(vec![0u8; CHUNK_LEN]);
    let mut total: u64 = 0;
    loop {
        let n = input.read(&mut buf[..])?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    let output = writer.into_inner().map_err(|e| e.into_error())?;
    output.sync_all()?;
    drop(output);
    drop(input);

    // The ingest may have been abandoned and the plaintext removed meanwhile.
    if !path.exists() {
        return Err(IngestError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "artifact removed while sealing",
        )));
    }
    std::fs::rename(&staging, path)?;
    guard.commit();
    debug!(path = %path.display(), plaintext = total, "artifact encrypted");
    Ok(HEADER_LEN as u64 + total)
}

/// Decrypt the file at `path` into `out`. Returns the plaintext length.
///
/// Fails with `AuthenticationFailed` when the password does not reproduce the
/// header's key check.
pub fn decrypt_to_writer<W: Write>(path: &Path, password: &str, out: &mut W) -> IngestResult<u64> {
    let mut input = std::fs::File::open(path)?;
    let mut raw = [0u8; HEADER_LEN];
    input.read_exact(&mut raw).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => IngestError::Encryption("not an encrypted artifact".into()),
        _ => IngestError::Io(e),
    })?;
    let header = EncryptionHeader::parse(&raw)?;

    let key = derive_key(password.as_bytes(), &header.salt, &header.kdf)?;
    let check = key_check(&key)?;
    if !bool::from(check[..].ct_eq(&header.key_check[..])) {
        return Err(IngestError::AuthenticationFailed);
    }
    let mut cipher = Aes256Ctr::new_from_slices(&key.0, &header.iv)
        .map_err(|e| IngestError::Encryption(format!("cipher init: {e}")))?;

    let mut buf = Zeroizing::new(vec![0u8; CHUNK_LEN]);
    let mut total: u64 = 0;
    loop {
        let n = input.read(&mut buf[..])?;
        if n == 0 {
            break;
        }
        cipher.apply_keystream(&mut buf[..n]);
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    out.flush()?;
    Ok(total)
}

/// Decrypt the file at `path` into memory.
pub fn decrypt_file(path: &Path, password: &str) -> IngestResult<Vec<u8>> {
    let mut plaintext = Vec::new();
    decrypt_to_writer(path, password, &mut plaintext)?;
    Ok(plaintext)
}

/// Result of sealing an artifact with a password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedArtifact {
    /// PHC string for password verification.
    pub password_hash: String,
    /// Size on disk including the header.
    pub stored_size: u64,
}

/// Async front end that keeps Argon2 and the cipher off the request threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptionCodec {
    kdf: KdfConfig,
}

impl EncryptionCodec {
    /// Codec using the given Argon2 costs for new artifacts.
    pub fn new(kdf: KdfConfig) -> Self {
        Self { kdf }
    }

    /// Encrypt `path` in place with `password`. With no password the file is left untouched.
    pub async fn seal(&self, path: &Path, password: Option<&str>) -> IngestResult<Option<SealedArtifact>> {
        let Some(password) = password else {
            return Ok(None);
        };
        let path = path.to_path_buf();
        let password = Zeroizing::new(password.to_string());
        let kdf = self.kdf;
        run_blocking(move || {
            let password_hash = hash_password(&password, &kdf)?;
            let stored_size = encrypt_file(&path, &password, &kdf)?;
            Ok(Some(SealedArtifact {
                password_hash,
                stored_size,
            }))
        })
        .await
    }

    /// Read an artifact back.
    ///
    /// Unprotected artifacts (`password_hash` is `None`) are returned as stored.
    /// Protected ones need a password, which is verified against the hash before
    /// any decryption is attempted.
    pub async fn open(
        &self,
        path: &Path,
        password_hash: Option<&str>,
        password: Option<&str>,
    ) -> IngestResult<Vec<u8>> {
        let Some(password_hash) = password_hash else {
            return Ok(tokio::fs::read(path).await?);
        };
        let Some(password) = password else {
            return Err(IngestError::AuthenticationRequired);
        };
        let path = path.to_path_buf();
        let hash = password_hash.to_string();
        let password = Zeroizing::new(password.to_string());
        run_blocking(move || {
            if !verify_password(&password, &hash)? {
                return Err(IngestError::AuthenticationFailed);
            }
            decrypt_file(&path, &password)
        })
        .await
    }

    /// Decrypt using only the header's key check, for tooling without the stored hash.
    pub async fn decrypt(&self, path: &Path, password: &str) -> IngestResult<Vec<u8>> {
        let path = path.to_path_buf();
        let password = Zeroizing::new(password.to_string());
        run_blocking(move || decrypt_file(&path, &password)).await
    }
}

async fn run_blocking<T, F>(f: F) -> IngestResult<T>
where
    F: FnOnce() -> IngestResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::Encryption(format!("crypto worker failed: {e}")))?
}
