use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::journal::RunJournal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Geocode,
    Refine,
    Quota,
    Persistence,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub stage: Stage,
    pub row: Option<usize>,
    pub message: String,
}

/// User-facing channel for non-fatal problems raised during a run.
///
/// Every entry is also logged through `tracing` and, when a journal is
/// attached, appended to it.
#[derive(Clone, Default)]
pub struct Diagnostics {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
    current_row: Arc<Mutex<Option<usize>>>,
    journal: Option<RunJournal>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: RunJournal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn journal(&self) -> Option<&RunJournal> {
        self.journal.as_ref()
    }

    pub fn begin_row(&self, index: usize) {
        *self.current_row.lock() = Some(index);
    }

    pub fn end_row(&self) {
        *self.current_row.lock() = None;
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.push(Severity::Warning, stage, message.into());
    }

    pub fn error(&self, stage: Stage, message: impl Into<String>) {
        self.push(Severity::Error, stage, message.into());
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.severity == severity)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Writes an arbitrary run event to the journal, if one is attached.
    pub fn journal_event(&self, event: &str, payload: serde_json::Value) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.record(event, payload) {
                warn!(?err, event, "failed to queue journal event");
            }
        }
    }

    pub fn flush(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.flush() {
                warn!(?err, "failed to flush run journal");
            }
        }
    }

    fn push(&self, severity: Severity, stage: Stage, message: String) {
        let row = *self.current_row.lock();
        match severity {
            Severity::Warning => warn!(?stage, ?row, "{message}"),
            Severity::Error => error!(?stage, ?row, "{message}"),
        }

        let entry = Diagnostic {
            timestamp: Utc::now(),
            severity,
            stage,
            row,
            message,
        };
        self.journal_event(
            "diagnostic",
            json!({
                "severity": entry.severity,
                "stage": entry.stage,
                "row": entry.row,
                "message": entry.message,
            }),
        );
        self.entries.lock().push(entry);
    }
}
