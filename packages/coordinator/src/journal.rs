//! Write-ahead journal for accepted relay submissions
//!
//! Between "relay accepted the lock" and "COMMITTED record persisted" the only
//! trace of the transfer is in memory. The coordinator writes one JSON file per
//! intent hash before the store write and deletes it afterwards, so a crash or a
//! store outage in between is replayed on the next start.

use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::types::NewTransfer;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub intent_hash: String,
    pub record: NewTransfer,
    /// Human amount, kept for the notification replayed on recovery
    pub display_amount: String,
    pub destination_label: String,
}

pub struct RecoveryJournal {
    dir: PathBuf,
}

impl RecoveryJournal {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .wrap_err_with(|| format!("Failed to create journal directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, intent_hash: &str) -> PathBuf {
        let name = intent_hash.trim_start_matches("0x");
        self.dir.join(format!("{}.json", name))
    }

    /// Durably record an entry (write to a temp file, then rename).
    pub async fn record(&self, entry: &JournalEntry) -> Result<()> {
        let path = self.path_for(&entry.intent_hash);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(entry)?;
        fs::write(&tmp, body)
            .await
            .wrap_err_with(|| format!("Failed to write journal entry {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .wrap_err_with(|| format!("Failed to commit journal entry {}", path.display()))?;
        debug!(intent_hash = %entry.intent_hash, "Journal entry recorded");
        Ok(())
    }

    pub async fn remove(&self, intent_hash: &str) -> Result<()> {
        let path = self.path_for(intent_hash);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrap_err_with(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Every entry still on disk. Unreadable files are skipped with a warning.
    pub async fn pending(&self) -> Result<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read(&path).await?;
            match serde_json::from_slice::<JournalEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable journal entry"),
            }
        }
        entries.sort_by(|a, b| a.intent_hash.cmp(&b.intent_hash));
        Ok(entries)
    }
}
