use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::TakoError;

const MAGIC: &[u8; 4] = b"TAKO";
const FORMAT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

// Argon2id parameters are part of the format; changing them bumps the
// version byte.
const KDF_TIME_COST: u32 = 3;
const KDF_MEM_KIB: u32 = 64 * 1024;
const KDF_PARALLELISM: u32 = 4;

pub const MIN_PASSPHRASE_LEN: usize = 8;

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let params = Params::new(KDF_MEM_KIB, KDF_TIME_COST, KDF_PARALLELISM, Some(32))
        .map_err(|e| TakoError::Config(format!("bad KDF params: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| TakoError::Config(format!("key derivation failed: {}", e)))?;
    Ok(key)
}

fn seal(key: &[u8; 32], header: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TakoError::Config(format!("cipher init failed: {}", e)))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| TakoError::Config("encryption failed".into()))?;

    let mut out = Vec::with_capacity(header.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(header);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TakoError::DecryptFormat(format!("cipher init failed: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TakoError::DecryptAuth.into())
}

/// Seal `plaintext` with a passphrase. Output layout:
/// `magic(4) || version(1) || salt(16) || nonce(12) || ciphertext+tag`.
pub fn seal_with_passphrase(plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let key = derive_key(passphrase, &salt)?;

    let mut header = Vec::with_capacity(4 + 1 + SALT_LEN);
    header.extend_from_slice(MAGIC);
    header.push(FORMAT_VERSION);
    header.extend_from_slice(&salt);

    seal(&key, &header, plaintext)
}

/// Open a passphrase-sealed payload. Header mismatch is `DecryptFormat`,
/// a bad passphrase is `DecryptAuth`.
pub fn open_with_passphrase(data: &[u8], passphrase: &str) -> Result<Vec<u8>> {
    let min = 4 + 1 + SALT_LEN + NONCE_LEN;
    if data.len() < min {
        return Err(TakoError::DecryptFormat(format!(
            "payload too short ({} bytes, need at least {})",
            data.len(),
            min
        ))
        .into());
    }
    if &data[..4] != MAGIC {
        return Err(TakoError::DecryptFormat("bad magic, not a tako bundle".into()).into());
    }
    if data[4] != FORMAT_VERSION {
        return Err(TakoError::DecryptFormat(format!(
            "unsupported bundle version {}",
            data[4]
        ))
        .into());
    }

    let salt = &data[5..5 + SALT_LEN];
    let nonce = &data[5 + SALT_LEN..5 + SALT_LEN + NONCE_LEN];
    let ciphertext = &data[5 + SALT_LEN + NONCE_LEN..];

    let key = derive_key(passphrase, salt)?;
    open(&key, nonce, ciphertext)
}

/// Per-project random key for local state files (swarm tokens, cached
/// artifacts). No KDF; layout `magic(4) || version(1) || nonce(12) || ct`.
pub struct ProjectKey([u8; 32]);

impl ProjectKey {
    pub fn key_path(tako_dir: &Path) -> PathBuf {
        tako_dir.join(".key")
    }

    /// Load `.tako/.key`, generating it (0600) on first use.
    pub fn load_or_generate(tako_dir: &Path) -> Result<Self> {
        let path = Self::key_path(tako_dir);
        if path.exists() {
            let bytes = fs::read(&path)
                .with_context(|| format!("Failed to read key file: {}", path.display()))?;
            let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                TakoError::DecryptFormat(format!(
                    "key file {} has wrong length {}",
                    path.display(),
                    bytes.len()
                ))
            })?;
            return Ok(Self(key));
        }

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        fs::create_dir_all(tako_dir)
            .with_context(|| format!("Failed to create {}", tako_dir.display()))?;
        fs::write(&path, key)
            .with_context(|| format!("Failed to write key file: {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
                .context("Failed to set key file permissions")?;
        }

        Ok(Self(key))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut header = Vec::with_capacity(5);
        header.extend_from_slice(MAGIC);
        header.push(FORMAT_VERSION);
        seal(&self.0, &header, plaintext)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        let min = 4 + 1 + NONCE_LEN;
        if data.len() < min || &data[..4] != MAGIC || data[4] != FORMAT_VERSION {
            return Err(TakoError::DecryptFormat("not a tako key-file payload".into()).into());
        }
        let nonce = &data[5..5 + NONCE_LEN];
        open(&self.0, nonce, &data[5 + NONCE_LEN..])
    }
}

/// The operator's environment-related files, packaged for transport to or
/// from the manager host.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EncryptedBundle {
    /// Relative file path -> base64 file content.
    pub files: BTreeMap<String, String>,
}

impl EncryptedBundle {
    pub fn insert(&mut self, path: &str, content: &[u8]) {
        self.files.insert(path.to_string(), BASE64.encode(content));
    }

    pub fn get(&self, path: &str) -> Result<Vec<u8>> {
        let encoded = self
            .files
            .get(path)
            .ok_or_else(|| TakoError::DecryptFormat(format!("bundle has no file {}", path)))?;
        BASE64
            .decode(encoded)
            .map_err(|e| TakoError::DecryptFormat(format!("bad base64 in bundle: {}", e)).into())
    }

    pub fn seal(&self, passphrase: &str) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self).context("Failed to serialize bundle")?;
        seal_with_passphrase(&json, passphrase)
    }

    pub fn unseal(data: &[u8], passphrase: &str) -> Result<Self> {
        let json = open_with_passphrase(data, passphrase)?;
        serde_json::from_slice(&json)
            .map_err(|e| TakoError::DecryptFormat(format!("bad bundle JSON: {}", e)).into())
    }
}

/// Obtain the state passphrase: `TAKO_STATE_PASSPHRASE` if set, otherwise an
/// interactive no-echo prompt. With `confirm` the passphrase is read twice
/// and must match. At least 8 characters.
pub fn obtain_passphrase(confirm: bool) -> Result<String> {
    if let Ok(pass) = std::env::var("TAKO_STATE_PASSPHRASE") {
        if pass.len() < MIN_PASSPHRASE_LEN {
            return Err(TakoError::Config(format!(
                "TAKO_STATE_PASSPHRASE must be at least {} characters",
                MIN_PASSPHRASE_LEN
            ))
            .into());
        }
        return Ok(pass);
    }

    if crate::runtime::non_interactive() {
        return Err(TakoError::Config(
            "no TAKO_STATE_PASSPHRASE set and prompts are suppressed".into(),
        )
        .into());
    }

    let mut prompt = dialoguer::Password::new().with_prompt("Passphrase");
    if confirm {
        prompt = prompt.with_confirmation("Confirm passphrase", "Passphrases do not match");
    }
    let pass = prompt.interact().context("Failed to read passphrase")?;

    if pass.len() < MIN_PASSPHRASE_LEN {
        return Err(TakoError::Config(format!(
            "passphrase must be at least {} characters",
            MIN_PASSPHRASE_LEN
        ))
        .into());
    }
    Ok(pass)
}
