//! Persistent fallback cache for session-ready payloads.
//!
//! The authorization window writes one entry per session id when it completes.
//! The multiplexer reads entries on a timer as a backup for a dropped window
//! message, and deletes the entry once the payload has been applied. Entries
//! are write-once: a second write for the same session is refused.
//!
//! Each entry is a JSON file `<session_id>.json` in the cache directory.
//!
//! The coordinator keeps its own record, `<session_id>.pending`, naming the
//! platform and mode a session was issued for. Entries carry only what the
//! window knows, so a result is resumable only when that record exists.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{ConnectableResource, ExternalIdentity, Platform};
use crate::session::SessionMode;

const ENTRY_EXTENSION: &str = "json";
const PENDING_EXTENSION: &str = "pending";
const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FallbackEntry {
    pub session_id: String,
    pub written_at: DateTime<Utc>,
    #[serde(default, alias = "pages")]
    pub resources: Vec<ConnectableResource>,
    #[serde(default, alias = "user")]
    pub external_identity: Option<ExternalIdentity>,
    /// Provider error reported to the window instead of a result.
    #[serde(default)]
    pub error: Option<String>,
}

impl FallbackEntry {
    pub fn ready(
        session_id: impl Into<String>,
        resources: Vec<ConnectableResource>,
        external_identity: Option<ExternalIdentity>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            written_at: Utc::now(),
            resources,
            external_identity,
            error: None,
        }
    }

    pub fn denied(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            written_at: Utc::now(),
            resources: Vec::new(),
            external_identity: None,
            error: Some(error.into()),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.written_at).to_std().unwrap_or_default()
    }
}

/// What a coordinator issued a session for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingSession {
    pub session_id: String,
    pub platform: Platform,
    #[serde(default)]
    pub mode: SessionMode,
    pub issued_at: DateTime<Utc>,
}

impl PendingSession {
    pub fn new(session_id: impl Into<String>, platform: Platform, mode: SessionMode) -> Self {
        Self {
            session_id: session_id.into(),
            platform,
            mode,
            issued_at: Utc::now(),
        }
    }
}

/// Directory-backed fallback cache.
#[derive(Debug, Clone)]
pub struct FallbackCache {
    dir: PathBuf,
}

impl FallbackCache {
    /// Open (creating if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create fallback directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session ids are opaque; only a conservative character set becomes a file name.
    fn path_for(&self, session_id: &str) -> Option<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id.len() <= MAX_KEY_LEN
            && !session_id.starts_with('.')
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        valid.then(|| self.dir.join(format!("{}.{}", session_id, ENTRY_EXTENSION)))
    }

    /// Write an entry once. Returns `false` if an entry for the session already exists.
    pub fn write(&self, entry: &FallbackEntry) -> Result<bool> {
        let path = self
            .path_for(&entry.session_id)
            .with_context(|| format!("Invalid fallback key: {:?}", entry.session_id))?;
        let body = serde_json::to_vec(entry).context("Failed to serialize fallback entry")?;

        // Stage under a unique name, then link into place so readers never see a partial file
        // and a concurrent writer cannot replace an existing entry.
        let staging = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&staging, body)
            .with_context(|| format!("Failed to stage fallback entry: {}", staging.display()))?;
        let linked = std::fs::hard_link(&staging, &path);
        let _ = std::fs::remove_file(&staging);

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to write fallback entry: {}", path.display())),
        }
    }

    /// Read the entry for a session. Unparseable entries read as absent.
    pub fn read(&self, session_id: &str) -> Result<Option<FallbackEntry>> {
        let Some(path) = self.path_for(session_id) else {
            return Ok(None);
        };
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read fallback entry: {}", path.display()));
            }
        };
        match serde_json::from_slice::<FallbackEntry>(&bytes) {
            Ok(entry) if entry.session_id == session_id => Ok(Some(entry)),
            Ok(_) | Err(_) => {
                tracing::debug!(session_id, "ignoring malformed fallback entry");
                Ok(None)
            }
        }
    }

    /// Delete the entry and the pending record for a session. Returns whether
    /// an entry existed.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let Some(path) = self.path_for(session_id) else {
            return Ok(false);
        };
        remove_if_present(&path.with_extension(PENDING_EXTENSION))?;
        remove_if_present(&path)
    }

    /// Record the platform and mode a session was issued for. Replaces any
    /// earlier record for the same id.
    pub fn record_pending(&self, pending: &PendingSession) -> Result<()> {
        let path = self
            .path_for(&pending.session_id)
            .with_context(|| format!("Invalid fallback key: {:?}", pending.session_id))?
            .with_extension(PENDING_EXTENSION);
        let body = serde_json::to_vec(pending).context("Failed to serialize pending session")?;

        let staging = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        std::fs::write(&staging, body)
            .with_context(|| format!("Failed to stage pending session: {}", staging.display()))?;
        if let Err(e) = std::fs::rename(&staging, &path) {
            let _ = std::fs::remove_file(&staging);
            return Err(e).with_context(|| format!("Failed to record pending session: {}", path.display()));
        }
        Ok(())
    }

    /// The pending record for a session. Unparseable records read as absent.
    pub fn pending(&self, session_id: &str) -> Result<Option<PendingSession>> {
        let Some(path) = self.path_for(session_id) else {
            return Ok(None);
        };
        let path = path.with_extension(PENDING_EXTENSION);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read pending session: {}", path.display()));
            }
        };
        Ok(serde_json::from_slice::<PendingSession>(&bytes)
            .ok()
            .filter(|pending| pending.session_id == session_id))
    }

    fn entries(&self) -> Result<Vec<FallbackEntry>> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to list fallback directory"),
        };

        let entries = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION))
            .filter_map(|path| std::fs::read(&path).ok())
            .filter_map(|bytes| serde_json::from_slice::<FallbackEntry>(&bytes).ok())
            .collect();
        Ok(entries)
    }

    /// The newest entry younger than `max_age` whose session was issued for
    /// `platform`. Entries without a pending record are skipped.
    pub fn most_recent_for(
        &self,
        platform: Platform,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<(FallbackEntry, PendingSession)>> {
        let mut candidates: Vec<FallbackEntry> = self
            .entries()?
            .into_iter()
            .filter(|entry| entry.written_at <= now && entry.age(now) < max_age)
            .collect();
        candidates.sort_by(|a, b| b.written_at.cmp(&a.written_at));

        for entry in candidates {
            match self.pending(&entry.session_id)? {
                Some(pending) if pending.platform == platform => return Ok(Some((entry, pending))),
                Some(pending) => {
                    tracing::debug!(session_id = %entry.session_id, platform = %pending.platform, "fallback entry belongs to another platform");
                }
                None => {
                    tracing::debug!(session_id = %entry.session_id, "fallback entry has no pending record");
                }
            }
        }
        Ok(None)
    }

    /// Remove entries older than `max_age`. Returns how many were removed.
    pub fn purge_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for entry in self.entries()? {
            if entry.age(now) >= max_age && self.delete(&entry.session_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove pending records older than `max_age` that never received an
    /// entry. `max_age` should outlive the session timeout so records of
    /// sessions still open elsewhere survive.
    pub fn purge_pending_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for pending in self.pending_records()? {
            let age = (now - pending.issued_at).to_std().unwrap_or_default();
            let Some(path) = self.path_for(&pending.session_id) else {
                continue;
            };
            if age >= max_age
                && self.read(&pending.session_id)?.is_none()
                && remove_if_present(&path.with_extension(PENDING_EXTENSION))?
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn pending_records(&self) -> Result<Vec<PendingSession>> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("Failed to list fallback directory"),
        };

        Ok(read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(PENDING_EXTENSION))
            .filter_map(|path| std::fs::read(&path).ok())
            .filter_map(|bytes| serde_json::from_slice::<PendingSession>(&bytes).ok())
            .collect())
    }
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to delete fallback file: {}", path.display())),
    }
}
