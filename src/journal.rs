//! Append-only JSON-lines journal of signal candidates and zone
//! lifecycle events.
//!
//! Each record is one self-delimited JSON object with a stable schema,
//! flushed on write so a crash loses at most the record being written.

use crate::error::EngineError;
use crate::events::{ConfirmedSignal, SignalCandidate};
use crate::zones::ZoneUpdate;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JournalRecord<'a> {
    SignalCandidate(&'a SignalCandidate),
    Signal(&'a ConfirmedSignal),
    ZoneUpdate(&'a ZoneUpdate),
}

pub struct Journal {
    writer: BufWriter<File>,
    path: String,
    records_written: u64,
}

impl Journal {
    /// Open (or create) the journal for appending.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                EngineError::Init(format!("cannot open journal {}: {e}", path.display()))
            })?;
        info!(path = %path.display(), "journal opened");
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.display().to_string(),
            records_written: 0,
        })
    }

    /// Append one record. I/O failures surface to the caller, which
    /// counts them without stopping the pipeline.
    pub fn append(&mut self, record: &JournalRecord<'_>) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.records_written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Side, SignalType};
    use serde_json::json;
    use uuid::Uuid;

    fn candidate() -> SignalCandidate {
        SignalCandidate {
            id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            signal_type: SignalType::Absorption,
            side: Side::Buy,
            price_ticks: 8628,
            confidence: 0.8,
            ts_ms: 1_000,
            payload: json!({ "absorptionRatio": 1.7 }),
        }
    }

    #[test]
    fn test_records_are_self_delimited_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let mut journal = Journal::open(&path).unwrap();

        let cand = candidate();
        journal.append(&JournalRecord::SignalCandidate(&cand)).unwrap();
        journal.append(&JournalRecord::SignalCandidate(&cand)).unwrap();
        assert_eq!(journal.records_written(), 2);

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(v["kind"], "signalCandidate");
            assert_eq!(v["signalType"], "absorption");
            assert_eq!(v["priceTicks"], 8628);
        }
    }

    #[test]
    fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .append(&JournalRecord::SignalCandidate(&candidate()))
                .unwrap();
        }
        {
            let mut journal = Journal::open(&path).unwrap();
            journal
                .append(&JournalRecord::SignalCandidate(&candidate()))
                .unwrap();
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
