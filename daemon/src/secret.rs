use anyhow::{Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

const LOCAL_SECRET_LEN: usize = 64;
const SALT_LEN: usize = 16;

pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Writes `contents` to `path`, readable by the owner only.
pub fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// One-time secret shared with same-host companions through a 0600 file.
/// Regenerated on every agent start.
#[derive(Clone)]
pub struct LocalSecret(String);

impl LocalSecret {
    pub fn generate(path: &Path) -> Result<Self> {
        let secret = random_alphanumeric(LOCAL_SECRET_LEN);
        write_private_file(path, secret.as_bytes())?;
        Ok(Self(secret))
    }

    /// Reads the secret a running agent published.
    pub fn read(path: &Path) -> Result<Self> {
        let secret = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read local secret {}", path.display()))?;
        Ok(Self(secret.trim().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }
}

impl std::fmt::Debug for LocalSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalSecret(..)")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The operator password, stored as hex(SHA-256(salt + password)).
/// An empty hash means no password is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PasswordHash {
    pub salt: String,
    pub hash: String,
}

impl PasswordHash {
    pub fn new(salt: String, hash: String) -> Self {
        Self { salt, hash }
    }

    /// Hashes `password` under a fresh salt; an empty password clears both.
    pub fn for_password(password: &str) -> Self {
        if password.is_empty() {
            return Self::default();
        }
        let salt = random_alphanumeric(SALT_LEN);
        let hash = hash_password(&salt, password);
        Self { salt, hash }
    }

    pub fn is_set(&self) -> bool {
        !self.hash.is_empty()
    }

    pub fn verify(&self, password: &str) -> bool {
        if !self.is_set() {
            return true;
        }
        constant_time_eq(hash_password(&self.salt, password).as_bytes(), self.hash.as_bytes())
    }
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}
