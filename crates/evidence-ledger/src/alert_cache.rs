//! JSONL alert cache used while the primary store is unreachable.
//!
//! - Append-only: every write is a full alert snapshot on its own line
//! - The latest snapshot per `alertId` wins on load
//! - Size-based rotation to `.1`, `.2`, ... (max [`MAX_ROTATIONS`])
//!
//! Records here are not hash-chained and are never authoritative evidence.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::LedgerResult;
use crate::types::Alert;

/// Cache size before rotation (16 MB).
pub const MAX_CACHE_SIZE: u64 = 16 * 1024 * 1024;

/// Rotated files kept on disk.
pub const MAX_ROTATIONS: u32 = 5;

struct CacheFile {
    file: File,
    current_size: u64,
}

pub struct AlertCache {
    path: PathBuf,
    max_size: u64,
    inner: Mutex<CacheFile>,
}

impl AlertCache {
    /// Open or create the cache file.
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        Self::with_max_size(path, MAX_CACHE_SIZE)
    }

    pub fn with_max_size(path: impl AsRef<Path>, max_size: u64) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_size,
            inner: Mutex::new(CacheFile { file, current_size }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one alert snapshot.
    pub fn append(&self, alert: &Alert) -> LedgerResult<()> {
        let line = serde_json::to_string(alert)?;
        let mut inner = self.inner.lock();
        if inner.current_size >= self.max_size {
            self.rotate(&mut inner)?;
        }
        writeln!(inner.file, "{line}")?;
        inner.file.flush()?;
        inner.current_size += line.len() as u64 + 1;
        Ok(())
    }

    /// Latest snapshot of every cached alert, in first-seen order.
    /// Unparseable lines are skipped.
    pub fn load(&self) -> LedgerResult<Vec<Alert>> {
        let _inner = self.inner.lock();
        let mut order: Vec<String> = Vec::new();
        let mut latest: HashMap<String, Alert> = HashMap::new();

        let mut files: Vec<PathBuf> = (1..=MAX_ROTATIONS)
            .rev()
            .map(|i| rotation_path(&self.path, i))
            .collect();
        files.push(self.path.clone());

        for path in files.iter().filter(|p| p.exists()) {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Alert>(&line) {
                    Ok(alert) => {
                        if !latest.contains_key(&alert.alert_id) {
                            order.push(alert.alert_id.clone());
                        }
                        latest.insert(alert.alert_id.clone(), alert);
                    }
                    Err(e) => tracing::warn!(
                        "skipping corrupt alert cache line in {}: {e}",
                        path.display()
                    ),
                }
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|id| latest.remove(&id))
            .collect())
    }

    /// Latest snapshot of one alert.
    pub fn get(&self, alert_id: &str) -> LedgerResult<Option<Alert>> {
        Ok(self.load()?.into_iter().find(|a| a.alert_id == alert_id))
    }

    /// Shift `cache.jsonl` → `.1` → `.2` ... and reopen a fresh file.
    fn rotate(&self, inner: &mut CacheFile) -> LedgerResult<()> {
        inner.file.flush()?;
        let oldest = rotation_path(&self.path, MAX_ROTATIONS);
        if oldest.exists() {
            let _ = std::fs::remove_file(&oldest);
        }
        for i in (1..MAX_ROTATIONS).rev() {
            let from = rotation_path(&self.path, i);
            if from.exists() {
                let _ = std::fs::rename(&from, rotation_path(&self.path, i + 1));
            }
        }
        std::fs::rename(&self.path, rotation_path(&self.path, 1))?;

        inner.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        inner.current_size = 0;
        tracing::debug!("rotated alert cache {}", self.path.display());
        Ok(())
    }
}

/// `alerts.jsonl.1`, `alerts.jsonl.2`, ...
fn rotation_path(base: &Path, index: u32) -> PathBuf {
    let name = format!(
        "{}.{index}",
        base.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("alerts.jsonl")
    );
    base.with_file_name(name)
}
