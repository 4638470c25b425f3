use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::errors::AppResult;

const JOURNAL_FILE_NAME: &str = "geocode-journal.jsonl";
const BATCH_SIZE: usize = 16;

/// Append-only JSONL log of run events, rotated by size.
#[derive(Clone)]
pub struct RunJournal {
    queue: Arc<Mutex<Vec<JournalEntry>>>,
    path: PathBuf,
    max_file_bytes: u64,
    max_file_count: usize,
}

impl RunJournal {
    pub fn new<P: AsRef<Path>>(data_dir: P, config: &AppConfig) -> AppResult<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(JOURNAL_FILE_NAME);
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            path,
            max_file_bytes: config.journal_max_bytes.max(1),
            max_file_count: config.journal_max_files.max(1),
        })
    }

    pub fn record(&self, event: impl Into<String>, payload: serde_json::Value) -> AppResult<()> {
        let mut queue = self.queue.lock();
        queue.push(JournalEntry {
            event: event.into(),
            timestamp: Utc::now(),
            payload,
        });
        if queue.len() >= BATCH_SIZE {
            self.persist_locked(&mut queue)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        let mut queue = self.queue.lock();
        self.persist_locked(&mut queue)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_locked(&self, queue: &mut Vec<JournalEntry>) -> AppResult<()> {
        if queue.is_empty() {
            return Ok(());
        }

        let mut lines = Vec::with_capacity(queue.len());
        let mut incoming = 0_u64;
        for entry in queue.iter() {
            let line = serde_json::to_vec(entry)?;
            incoming += (line.len() + 1) as u64;
            lines.push(line);
        }

        self.rotate_if_needed(incoming)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in &lines {
            file.write_all(line)?;
            file.write_all(b"\n")?;
        }
        file.flush()?;
        queue.clear();
        Ok(())
    }

    fn rotate_if_needed(&self, incoming: u64) -> AppResult<()> {
        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current == 0 || current + incoming <= self.max_file_bytes {
            return Ok(());
        }

        if self.max_file_count > 1 {
            let rotated = self.parent().join(format!(
                "{}-{}.jsonl",
                self.stem(),
                Utc::now().format("%Y%m%d%H%M%S%3f")
            ));
            fs::rename(&self.path, rotated)?;
            self.prune_rotations()?;
        }

        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    fn prune_rotations(&self) -> AppResult<()> {
        let prefix = format!("{}-", self.stem());
        let mut rotations = fs::read_dir(self.parent())?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                    Some((name, entry.path()))
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();

        // timestamped names sort chronologically
        rotations.sort_by(|a, b| a.0.cmp(&b.0));
        let allowed = self.max_file_count.saturating_sub(1);
        if rotations.len() > allowed {
            let excess = rotations.len() - allowed;
            for (_, path) in rotations.into_iter().take(excess) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(())
    }

    fn parent(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "geocode-journal".into())
    }
}

#[derive(Debug, Serialize)]
struct JournalEntry {
    event: String,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
}
