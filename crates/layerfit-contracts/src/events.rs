//! Session journal: one JSON line per session transition, numbered in
//! append order so a reader can tell what happened and in which order.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::layers::SlotPosition;
use crate::session::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotChange {
    Replaced,
    Removed,
}

/// One row of a detection pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedSlot {
    pub slot: String,
    pub position: SlotPosition,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAttempt {
    pub model: String,
    pub provider: String,
    pub accepted: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionRecord {
    StatusChanged {
        from: Status,
        to: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SlotChanged {
        position: SlotPosition,
        change: SlotChange,
    },
    GarmentsDetected {
        found: usize,
        slots: Vec<DetectedSlot>,
    },
    OutfitComposed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        layers: Vec<SlotPosition>,
        attempts: Vec<ModelAttempt>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Restored {
        status: Status,
    },
    Reset,
}

impl SessionRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionRecord::StatusChanged { .. } => "status_changed",
            SessionRecord::SlotChanged { .. } => "slot_changed",
            SessionRecord::GarmentsDetected { .. } => "garments_detected",
            SessionRecord::OutfitComposed { .. } => "outfit_composed",
            SessionRecord::Restored { .. } => "restored",
            SessionRecord::Reset => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub session_key: String,
    pub ts: String,
    #[serde(flatten)]
    pub record: SessionRecord,
}

/// Append-only `events.jsonl` for one session. Sequence numbers continue
/// from whatever the file already holds.
#[derive(Debug)]
pub struct SessionJournal {
    path: PathBuf,
    session_key: String,
    next_seq: Mutex<u64>,
}

impl SessionJournal {
    pub fn open(path: impl Into<PathBuf>, session_key: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let next_seq = read_journal(&path)?
            .last()
            .map(|entry| entry.seq + 1)
            .unwrap_or(0);
        Ok(Self {
            path,
            session_key: session_key.into(),
            next_seq: Mutex::new(next_seq),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn append(&self, record: SessionRecord) -> Result<JournalEntry> {
        let mut next_seq = self
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("journal lock poisoned"))?;
        let entry = JournalEntry {
            seq: *next_seq,
            session_key: self.session_key.clone(),
            ts: now_utc_iso(),
            record,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        *next_seq += 1;
        Ok(entry)
    }
}

/// Entries in file order. A missing file is an empty journal; lines that
/// do not parse are skipped.
pub fn read_journal(path: &Path) -> Result<Vec<JournalEntry>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(anyhow::Error::new(err).context(format!("failed to read {}", path.display())))
        }
    };
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<JournalEntry>(line) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(error = %err, "journal line skipped");
                None
            }
        })
        .collect())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
