//! Append-only cycle journal with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) so a cycle's
//! progress can be inspected with ordinary tools and replayed into a
//! [`CycleSummary`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::domain::{CycleSummary, Event, EventType};

/// File-based journal for one cycle, using JSONL format
pub struct EventStore {
    /// Directory holding every file of the cycle
    cycle_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Serializes appends from concurrent workers
    write_lock: Mutex<()>,
}

impl EventStore {
    /// Create or open the journal in a cycle directory
    pub async fn open(cycle_dir: &Path) -> Result<Self> {
        fs::create_dir_all(cycle_dir)
            .await
            .with_context(|| format!("Failed to create cycle directory: {}", cycle_dir.display()))?;

        Ok(Self {
            cycle_dir: cycle_dir.to_path_buf(),
            events_path: cycle_dir.join("events.jsonl"),
            write_lock: Mutex::new(()),
        })
    }

    /// Open the journal for a named cycle under the configured runs directory
    pub async fn for_cycle(suite: &str, cycle: &str) -> Result<Self> {
        let dir = Self::cycle_directory(suite, cycle)?;
        Self::open(&dir).await
    }

    /// `<runs_dir>/<suite>/<cycle>`
    pub fn cycle_directory(suite: &str, cycle: &str) -> Result<PathBuf> {
        Ok(crate::config::runs_dir()?.join(suite).join(cycle))
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    pub fn cycle_dir(&self) -> &Path {
        &self.cycle_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Reconstruct the cycle's summary; `None` if it never started
    pub async fn summary(&self) -> Result<Option<CycleSummary>> {
        let events = self.replay().await?;
        Ok(CycleSummary::from_events(&events))
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Remove the journal file. Used by an explicit reset.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&self.events_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to remove events file: {}", self.events_path.display())
            }),
        }
    }

    /// List cycle names recorded for a suite
    pub async fn list_cycles(suite: &str) -> Result<Vec<String>> {
        let suite_dir = crate::config::runs_dir()?.join(suite);

        if !suite_dir.exists() {
            return Ok(Vec::new());
        }

        let mut cycles = Vec::new();
        let mut entries = fs::read_dir(&suite_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    cycles.push(name.to_string());
                }
            }
        }

        cycles.sort();
        Ok(cycles)
    }
}
