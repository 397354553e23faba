//! Security event notifications.
//!
//! The store reports what it does to an [`AuditSink`] and never waits on or
//! inspects the result. Sinks must not fail the operation that emitted the
//! event; [`JsonlAuditLog`] logs its own write errors and carries on.

use crate::error::Result;
use crate::keys::KeySource;
use crate::lock::LockGuard;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const CHAIN_START: &str = "CHAIN_START";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum AuditEvent {
    EncryptionInit {
        algorithm: String,
        key_source: Option<KeySource>,
        pq_enabled: bool,
    },
    EncryptionDisabled {
        reason: String,
    },
    MachineKeyInUse,
    PqKeysGenerated {
        path: PathBuf,
    },
    PqKeysLoaded {
        path: PathBuf,
    },
    PqKeysMigrated {
        path: PathBuf,
    },
    PqKeysReset {
        path: PathBuf,
    },
    PqUnavailable {
        reason: String,
    },
    DecryptionFailed {
        path: PathBuf,
        error: String,
    },
    FormatMigrated {
        path: PathBuf,
        from: String,
        to: String,
    },
    PlaintextFallback {
        path: PathBuf,
    },
    StaleLockReclaimed {
        path: PathBuf,
        pid: u32,
        hostname: String,
        age_ms: u64,
    },
}

impl AuditEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AuditEvent::EncryptionInit { .. } => "encryption_init",
            AuditEvent::EncryptionDisabled { .. } => "encryption_disabled",
            AuditEvent::MachineKeyInUse => "machine_key_in_use",
            AuditEvent::PqKeysGenerated { .. } => "pq_keys_generated",
            AuditEvent::PqKeysLoaded { .. } => "pq_keys_loaded",
            AuditEvent::PqKeysMigrated { .. } => "pq_keys_migrated",
            AuditEvent::PqKeysReset { .. } => "pq_keys_reset",
            AuditEvent::PqUnavailable { .. } => "pq_unavailable",
            AuditEvent::DecryptionFailed { .. } => "decryption_failed",
            AuditEvent::FormatMigrated { .. } => "format_migrated",
            AuditEvent::PlaintextFallback { .. } => "plaintext_fallback",
            AuditEvent::StaleLockReclaimed { .. } => "stale_lock_reclaimed",
        }
    }

    pub fn severity(&self) -> EventSeverity {
        match self {
            AuditEvent::DecryptionFailed { .. } => EventSeverity::Error,
            AuditEvent::EncryptionDisabled { .. }
            | AuditEvent::MachineKeyInUse
            | AuditEvent::PqKeysReset { .. }
            | AuditEvent::PqUnavailable { .. }
            | AuditEvent::PlaintextFallback { .. }
            | AuditEvent::StaleLockReclaimed { .. } => EventSeverity::Warn,
            _ => EventSeverity::Info,
        }
    }

    fn data(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("event");
        }
        value
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Emits each event as a `tracing` record at its severity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        let data = event.data();
        match event.severity() {
            EventSeverity::Info => info!(target: "strongbox::audit", event = event.event_type(), %data),
            EventSeverity::Warn => warn!(target: "strongbox::audit", event = event.event_type(), %data),
            EventSeverity::Error => error!(target: "strongbox::audit", event = event.event_type(), %data),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(AuditEvent::event_type).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub severity: EventSeverity,
    pub data: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct LogState {
    last_seq: u64,
    last_hash: String,
}

/// Append-only JSON-lines audit trail. Each entry commits to its
/// predecessor's hash, so edits and deletions inside the file are detectable.
/// Only safe for one writer process per file.
pub struct JsonlAuditLog {
    path: PathBuf,
    inner: Mutex<LogState>,
}

impl JsonlAuditLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (last_seq, last_hash) = match Self::read_entries(&path)?.last() {
            Some(entry) => (entry.seq, entry.hash.clone()),
            None => (0, CHAIN_START.to_string()),
        };
        Ok(Self {
            path,
            inner: Mutex::new(LogState {
                last_seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &AuditEvent) -> Result<AuditEntry> {
        let mut state = self.inner.lock();
        let seq = state.last_seq + 1;
        let mut value = serde_json::json!({
            "seq": seq,
            "timestamp": Utc::now(),
            "event_type": event.event_type(),
            "severity": event.severity(),
            "data": event.data(),
            "prev_hash": state.last_hash,
        });
        let hash = compute_hash(&value);
        value["hash"] = serde_json::Value::String(hash.clone());
        let entry: AuditEntry = serde_json::from_value(value)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>> {
        Self::read_entries(&self.path)
    }

    /// Sequence number of the first entry whose hash or back-link does not
    /// match, or `None` if the chain is intact.
    pub fn verify_chain(&self) -> Result<Option<u64>> {
        let mut prev = CHAIN_START.to_string();
        for entry in self.entries()? {
            let mut value = serde_json::to_value(&entry)?;
            if let Some(obj) = value.as_object_mut() {
                obj.remove("hash");
            }
            if entry.prev_hash != prev || compute_hash(&value) != entry.hash {
                return Ok(Some(entry.seq));
            }
            prev = entry.hash;
        }
        Ok(None)
    }

    fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
        if !path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.append(event) {
            warn!(path = %self.path.display(), event = event.event_type(), "audit append failed: {e}");
        }
    }
}

/// Report a stale lock that `guard` had to reclaim on its way in.
pub(crate) fn note_reclaimed(guard: &LockGuard, sink: &dyn AuditSink) {
    if let Some(record) = guard.reclaimed() {
        sink.record(&AuditEvent::StaleLockReclaimed {
            path: guard.resource().to_path_buf(),
            pid: record.pid,
            hostname: record.hostname.clone(),
            age_ms: record.age().as_millis() as u64,
        });
    }
}

fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry_without_hash.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
