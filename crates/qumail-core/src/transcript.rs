//! Encrypted local outbox of sent packets.
//!
//! File layout:
//!   [ magic (8 bytes) | nonce (24 bytes) | XChaCha20-Poly1305(JSON entries) ]
//!
//! The sealing key comes from a [`TranscriptKeySource`]; the default one keeps
//! it in the OS keyring of the current user, so a transcript copied to another
//! account or machine cannot be opened there.
//!
//! Read and write failures are handled asymmetrically:
//! - `load_all` fails open. A missing, foreign, corrupted or undecryptable
//!   store reads as empty so it can never block the application.
//! - `append` fails closed. Any error writing the store reaches the caller.

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::crypto::{decrypt, encrypt, generate_key, generate_nonce, NONCE_LEN};
use crate::packet::SecurePacket;
use crate::secure_storage;

const MAGIC_LEN: usize = 8;
pub const TRANSCRIPT_MAGIC: &[u8; MAGIC_LEN] = b"QMOUT01\0";
const HEADER_LEN: usize = MAGIC_LEN + NONCE_LEN;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub timestamp: DateTime<Utc>,
    pub recipient: String,
    pub subject: String,
    pub ciphertext: String,
    pub key_id: String,
}

impl TranscriptEntry {
    pub fn for_packet(recipient: &str, subject: &str, packet: &SecurePacket) -> Self {
        Self {
            timestamp: Utc::now(),
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            ciphertext: packet.ciphertext.clone(),
            key_id: packet.key_id.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript write failed: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("transcript key unavailable: {0}")]
    KeyUnavailable(String),
    #[error("transcript sealing failed: {0}")]
    Seal(String),
    #[error("transcript serialisation failed: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Supplies the user-scoped key that seals the transcript at rest.
pub trait TranscriptKeySource: Send + Sync {
    /// The key if one already exists; `None` means nothing was ever sealed.
    fn existing_key(&self) -> anyhow::Result<Option<Zeroizing<Vec<u8>>>>;
    /// The key to seal with, created on first use.
    fn key_for_write(&self) -> anyhow::Result<Zeroizing<Vec<u8>>>;
}

/// Key held in the current user's OS keyring.
pub struct KeyringKeySource {
    account: String,
}

impl KeyringKeySource {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    pub fn for_current_user() -> Self {
        let account = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "default".to_string());
        Self::new(account)
    }
}

impl TranscriptKeySource for KeyringKeySource {
    fn existing_key(&self) -> anyhow::Result<Option<Zeroizing<Vec<u8>>>> {
        secure_storage::get_outbox_key(&self.account)
    }

    fn key_for_write(&self) -> anyhow::Result<Zeroizing<Vec<u8>>> {
        if let Some(key) = self.existing_key()? {
            return Ok(key);
        }
        let key = generate_key();
        secure_storage::store_outbox_key(&self.account, key.as_ref())?;
        info!("created outbox key in user keyring");
        Ok(Zeroizing::new(key.to_vec()))
    }
}

/// Key that exists only in this process. A transcript sealed with it is
/// unreadable after restart, which suits session-only history and tests.
pub struct EphemeralKeySource {
    key: Zeroizing<Vec<u8>>,
}

impl EphemeralKeySource {
    pub fn new() -> Self {
        Self {
            key: Zeroizing::new(generate_key().to_vec()),
        }
    }
}

impl Default for EphemeralKeySource {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptKeySource for EphemeralKeySource {
    fn existing_key(&self) -> anyhow::Result<Option<Zeroizing<Vec<u8>>>> {
        Ok(Some(self.key.clone()))
    }

    fn key_for_write(&self) -> anyhow::Result<Zeroizing<Vec<u8>>> {
        Ok(self.key.clone())
    }
}

pub struct SecureTranscript {
    path: PathBuf,
    keys: Arc<dyn TranscriptKeySource>,
    // Held across every load-modify-store so concurrent appends cannot drop entries.
    writer: Mutex<()>,
}

impl SecureTranscript {
    pub fn new(path: impl Into<PathBuf>, keys: Arc<dyn TranscriptKeySource>) -> Self {
        Self {
            path: path.into(),
            keys,
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: TranscriptEntry) -> Result<(), TranscriptError> {
        let _writer = self.writer.lock();
        let key = self
            .keys
            .key_for_write()
            .map_err(|e| TranscriptError::KeyUnavailable(e.to_string()))?;

        let mut entries = if self.path.exists() {
            self.read_with_key(&key).unwrap_or_else(|err| {
                warn!(error = %err, path = %self.path.display(), "existing transcript unreadable; starting a new one");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        entries.push(entry);

        let plaintext = Zeroizing::new(serde_json::to_vec(&entries)?);
        let nonce = generate_nonce();
        let sealed =
            encrypt(&key, &nonce, &plaintext).map_err(|e| TranscriptError::Seal(e.to_string()))?;
        self.write_atomic(&nonce, &sealed)?;
        info!(entries = entries.len(), "transcript entry appended");
        Ok(())
    }

    /// Entries in append order. Never fails: see the module docs.
    pub fn load_all(&self) -> Vec<TranscriptEntry> {
        match self.try_load() {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, path = %self.path.display(), "transcript unreadable; showing empty history");
                Vec::new()
            }
        }
    }

    /// Delete the whole store. Only meant for session start.
    pub fn clear(&self) -> Result<(), TranscriptError> {
        let _writer = self.writer.lock();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "transcript cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TranscriptError::Persistence(e)),
        }
    }

    fn try_load(&self) -> anyhow::Result<Vec<TranscriptEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let key = self
            .keys
            .existing_key()?
            .ok_or_else(|| anyhow!("no transcript key for this user"))?;
        self.read_with_key(&key)
    }

    fn read_with_key(&self, key: &[u8]) -> anyhow::Result<Vec<TranscriptEntry>> {
        let raw = fs::read(&self.path).context("read transcript")?;
        if raw.len() < HEADER_LEN {
            return Err(anyhow!("transcript truncated"));
        }
        let (header, sealed) = raw.split_at(HEADER_LEN);
        if &header[..MAGIC_LEN] != TRANSCRIPT_MAGIC {
            return Err(anyhow!("invalid transcript magic"));
        }
        let nonce: [u8; NONCE_LEN] = header[MAGIC_LEN..]
            .try_into()
            .map_err(|_| anyhow!("invalid transcript nonce"))?;
        let plaintext = decrypt(key, &nonce, sealed).context("open transcript")?;
        let entries: Vec<TranscriptEntry> =
            serde_json::from_slice(&plaintext).context("parse transcript")?;
        Ok(entries)
    }

    fn write_atomic(&self, nonce: &[u8; NONCE_LEN], sealed: &[u8]) -> Result<(), TranscriptError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        // NamedTempFile is created 0600 on unix and renamed over the old store.
        let mut staging = NamedTempFile::new_in(&dir)?;
        staging.write_all(TRANSCRIPT_MAGIC)?;
        staging.write_all(nonce)?;
        staging.write_all(sealed)?;
        staging.as_file().sync_all()?;
        staging
            .persist(&self.path)
            .map_err(|e| TranscriptError::Persistence(e.error))?;
        Ok(())
    }
}
