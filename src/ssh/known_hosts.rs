use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};

/// Host-key verification policy. Tofu records a host's key on first sight
/// and rejects changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HostKeyMode {
    Tofu,
    Strict,
    Ask,
    Insecure,
}

impl Default for HostKeyMode {
    fn default() -> Self {
        HostKeyMode::Tofu
    }
}

impl FromStr for HostKeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tofu" => Ok(HostKeyMode::Tofu),
            "strict" => Ok(HostKeyMode::Strict),
            "ask" => Ok(HostKeyMode::Ask),
            "insecure" => Ok(HostKeyMode::Insecure),
            other => Err(format!(
                "invalid host key mode '{}' (tofu, strict, ask, insecure)",
                other
            )),
        }
    }
}

impl fmt::Display for HostKeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostKeyMode::Tofu => "tofu",
            HostKeyMode::Strict => "strict",
            HostKeyMode::Ask => "ask",
            HostKeyMode::Insecure => "insecure",
        };
        f.write_str(s)
    }
}

/// Outcome of checking a presented key against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStatus {
    /// Matches the pinned key.
    Known,
    /// Never seen this host before.
    Unknown,
    /// Pinned key differs from the presented one.
    Mismatch { expected: String },
}

/// Line-oriented pin store at `~/.tako/known_hosts`:
/// `host:port algo base64key` per entry.
pub struct KnownHostsStore {
    path: PathBuf,
}

impl KnownHostsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_store() -> Result<Self> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(Self::new(home.join(".tako").join("known_hosts")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_key(host: &str, port: u16) -> String {
        format!("{}:{}", host, port)
    }

    pub fn check(&self, host: &str, port: u16, algo: &str, key_b64: &str) -> Result<KeyStatus> {
        if !self.path.exists() {
            return Ok(KeyStatus::Unknown);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let wanted = Self::entry_key(host, port);
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(entry), Some(entry_algo), Some(entry_key)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if entry != wanted {
                continue;
            }
            if entry_algo == algo && entry_key == key_b64 {
                return Ok(KeyStatus::Known);
            }
            return Ok(KeyStatus::Mismatch {
                expected: format!("{} {}", entry_algo, entry_key),
            });
        }
        Ok(KeyStatus::Unknown)
    }

    /// Pin a key, replacing any previous entry for the same host:port.
    pub fn record(&self, host: &str, port: u16, algo: &str, key_b64: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let wanted = Self::entry_key(host, port);
        let mut lines: Vec<String> = if self.path.exists() {
            std::fs::read_to_string(&self.path)?
                .lines()
                .filter(|l| l.split_whitespace().next() != Some(wanted.as_str()))
                .map(String::from)
                .collect()
        } else {
            Vec::new()
        };
        lines.push(format!("{} {} {}", wanted, algo, key_b64));

        std::fs::write(&self.path, lines.join("\n") + "\n")
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KnownHostsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnownHostsStore::new(dir.path().join("known_hosts"));
        (dir, store)
    }

    #[test]
    fn first_sight_is_unknown_then_pinned() {
        let (_dir, store) = store();
        assert_eq!(
            store.check("h1", 22, "ssh-ed25519", "AAAA").unwrap(),
            KeyStatus::Unknown
        );
        store.record("h1", 22, "ssh-ed25519", "AAAA").unwrap();
        assert_eq!(
            store.check("h1", 22, "ssh-ed25519", "AAAA").unwrap(),
            KeyStatus::Known
        );
    }

    #[test]
    fn changed_key_is_a_mismatch() {
        let (_dir, store) = store();
        store.record("h1", 22, "ssh-ed25519", "AAAA").unwrap();
        let status = store.check("h1", 22, "ssh-ed25519", "BBBB").unwrap();
        assert_eq!(
            status,
            KeyStatus::Mismatch {
                expected: "ssh-ed25519 AAAA".into()
            }
        );
    }

    #[test]
    fn entries_are_scoped_by_port() {
        let (_dir, store) = store();
        store.record("h1", 22, "ssh-ed25519", "AAAA").unwrap();
        assert_eq!(
            store.check("h1", 2222, "ssh-ed25519", "AAAA").unwrap(),
            KeyStatus::Unknown
        );
    }

    #[test]
    fn record_replaces_previous_pin() {
        let (_dir, store) = store();
        store.record("h1", 22, "ssh-ed25519", "AAAA").unwrap();
        store.record("h1", 22, "ssh-ed25519", "BBBB").unwrap();
        assert_eq!(
            store.check("h1", 22, "ssh-ed25519", "BBBB").unwrap(),
            KeyStatus::Known
        );
        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
