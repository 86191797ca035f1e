//! Hash-chained JSON Lines log.
//!
//! Each line is one [`AuditEvent`]. With chaining on, `hash_prev` carries the
//! previous line's `hash_self`, and `hash_self` is the SHA-256 of the event's
//! canonical JSON with `hash_self` blanked. Rewriting any line invalidates it
//! and every line after it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// UUID v5 namespace for event ids.
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e74_2d61_7564_6974_2d65_7665_6e74_2d31);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    /// Process lifetime that wrote the event.
    pub session_id: Uuid,
    /// Position in the log, zero-based, continuous across sessions.
    pub seq: u64,
    pub ts_utc: DateTime<Utc>,
    pub topic: String,
    pub event_type: String,
    pub payload: Value,
    pub hash_prev: Option<String>,
    pub hash_self: Option<String>,
}

impl AuditEvent {
    /// Digest over everything but `hash_self`.
    pub fn chain_hash(&self) -> Result<String> {
        let unsealed = AuditEvent {
            hash_self: None,
            ..self.clone()
        };
        let canonical = serde_json::to_string(&serde_json::to_value(&unsealed)?)
            .context("serialize audit event")?;
        Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

/// Non-empty lines of a log with their 1-based line numbers, parsed.
fn parse_lines(content: &str) -> impl Iterator<Item = Result<(usize, AuditEvent)>> + '_ {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line.trim())
                .map(|ev| (i + 1, ev))
                .with_context(|| format!("parse audit event at line {}", i + 1))
        })
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only writer. Reopening an existing log resumes its chain head and
/// sequence so a restart extends the chain.
pub struct AuditWriter {
    path: PathBuf,
    hash_chain: bool,
    head: Option<String>,
    seq: u64,
    session_id: Uuid,
}

impl AuditWriter {
    /// Creates missing parent directories. The file itself appears on the
    /// first append.
    pub fn open(path: impl AsRef<Path>, hash_chain: bool, session_id: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
        }

        let mut head = None;
        let mut seq = 0;
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("read audit log {}", path.display()))?;
            for parsed in parse_lines(&content) {
                let (_, ev) = parsed?;
                head = ev.hash_self;
                seq += 1;
            }
        }

        Ok(Self {
            path,
            hash_chain,
            head,
            seq,
            session_id,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn append(&mut self, topic: &str, event_type: &str, payload: Value) -> Result<AuditEvent> {
        let id_seed = format!(
            "{}|{}|{}",
            self.head.as_deref().unwrap_or("-"),
            self.seq,
            serde_json::to_string(&payload).context("serialize payload")?
        );

        let mut ev = AuditEvent {
            event_id: Uuid::new_v5(&EVENT_ID_NAMESPACE, id_seed.as_bytes()),
            session_id: self.session_id,
            seq: self.seq,
            ts_utc: Utc::now(),
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            payload,
            hash_prev: None,
            hash_self: None,
        };
        if self.hash_chain {
            ev.hash_prev = self.head.clone();
            ev.hash_self = Some(ev.chain_hash()?);
        }

        let mut line = serde_json::to_string(&serde_json::to_value(&ev)?)
            .context("serialize audit event")?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
            .with_context(|| format!("append to audit log {}", self.path.display()))?;

        // Only advance once the line is on disk.
        if self.hash_chain {
            self.head = ev.hash_self.clone();
        }
        self.seq += 1;
        Ok(ev)
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Valid { lines: usize },
    /// `line` is the 1-based line number in the file.
    Broken { line: usize, reason: String },
}

pub fn verify_hash_chain(path: impl AsRef<Path>) -> Result<VerifyResult> {
    let path = path.as_ref();
    let content =
        fs::read_to_string(path).with_context(|| format!("read audit log {}", path.display()))?;
    verify_hash_chain_str(&content)
}

/// Unparseable lines are an error rather than a broken chain.
pub fn verify_hash_chain_str(content: &str) -> Result<VerifyResult> {
    let mut expected_prev: Option<String> = None;
    let mut lines = 0;

    for parsed in parse_lines(content) {
        let (line, ev) = parsed?;
        lines += 1;

        if ev.hash_prev != expected_prev {
            return Ok(VerifyResult::Broken {
                line,
                reason: format!(
                    "hash_prev is {:?}, previous event sealed {:?}",
                    ev.hash_prev, expected_prev
                ),
            });
        }
        if let Some(claimed) = &ev.hash_self {
            let actual = ev.chain_hash()?;
            if *claimed != actual {
                return Ok(VerifyResult::Broken {
                    line,
                    reason: format!("hash_self is {claimed}, content hashes to {actual}"),
                });
            }
        }
        expected_prev = ev.hash_self;
    }

    Ok(VerifyResult::Valid { lines })
}
