//! Per-run event log.
//!
//! Layout of one run directory:
//!
//! ```text
//! <runs>/<run-id>/events.jsonl      one JSON event per line, append only
//! <runs>/<run-id>/logs/<stage>.log  rendered output lines of each stage
//! ```
//!
//! Appends are deduplicated by idempotency key, so re-recording a step
//! that already reached the log leaves the history unchanged.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::pipeline::check_name;
use crate::adapters::LogSink;
use crate::domain::{Event, LogLine};

const EVENTS_FILE: &str = "events.jsonl";
const LOGS_DIR: &str = "logs";

pub struct EventStore {
    run_id: Uuid,
    events_path: PathBuf,
    logs_dir: PathBuf,
    /// Idempotency keys already in the log; also serializes appends
    seen: Mutex<HashSet<String>>,
}

impl EventStore {
    /// Open (creating if needed) the log of `run_id` under `runs_dir`
    pub async fn open_in(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());
        let logs_dir = run_dir.join(LOGS_DIR);
        fs::create_dir_all(&logs_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        let events_path = run_dir.join(EVENTS_FILE);
        let seen = read_events(&events_path)
            .await?
            .into_iter()
            .map(|e| e.idempotency_key)
            .collect();

        Ok(Self {
            run_id,
            events_path,
            logs_dir,
            seen: Mutex::new(seen),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn log_path(&self, stage: &str) -> Result<PathBuf> {
        check_name("Stage", stage)?;
        Ok(self.logs_dir.join(format!("{}.log", stage)))
    }

    /// Append an event. Returns `false` if its idempotency key was already recorded.
    pub async fn append(&self, event: &Event) -> Result<bool> {
        let mut seen = self.seen.lock().await;
        if seen.contains(&event.idempotency_key) {
            debug!(run_id = %self.run_id, key = %event.idempotency_key, "Duplicate event skipped");
            return Ok(false);
        }

        let mut line = serde_json::to_string(event).context("Failed to serialize event")?;
        line.push('\n');
        append_to(&self.events_path, &line).await?;

        seen.insert(event.idempotency_key.clone());
        Ok(true)
    }

    /// All events in append order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        read_events(&self.events_path).await
    }

    pub async fn find_events<F>(&self, predicate: F) -> Result<Vec<Event>>
    where
        F: Fn(&Event) -> bool,
    {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(predicate).collect())
    }

    pub async fn append_log(&self, stage: &str, lines: &[LogLine]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let text: String = lines.iter().map(|l| l.render() + "\n").collect();
        append_to(&self.log_path(stage)?, &text).await
    }

    /// A stage's log, or `None` if the stage never wrote one
    pub async fn read_log(&self, stage: &str) -> Result<Option<String>> {
        let path = self.log_path(stage)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read log: {}", path.display())),
        }
    }

    /// Ids of every run directory under `runs_dir`
    pub async fn list_runs_in(runs_dir: &Path) -> Result<Vec<Uuid>> {
        let mut entries = match fs::read_dir(runs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to list runs: {}", runs_dir.display())),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_str().and_then(|n| Uuid::parse_str(n).ok());
            if let Some(id) = id {
                if entry.path().join(EVENTS_FILE).exists() {
                    runs.push(id);
                }
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl LogSink for EventStore {
    async fn write(&self, stage: &str, lines: &[LogLine]) -> Result<()> {
        self.append_log(stage, lines).await
    }
}

async fn append_to(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.write_all(text.as_bytes())
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    file.flush().await?;
    Ok(())
}

async fn read_events(path: &Path) -> Result<Vec<Event>> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Corrupt event at {}:{}", path.display(), i + 1))
        })
        .collect()
}

/// Idempotency key of a step within a run: `<run>:<scope>:<hash of input>`
pub fn generate_idempotency_key(run_id: Uuid, scope: &str, input: &str) -> String {
    format!("{}:{}:{}", run_id, scope, hash_input(input))
}

/// First 16 hex chars of the SHA-256 of `input`
pub fn hash_input(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventType;
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, TempDir, Uuid) {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        (store, temp_dir, run_id)
    }

    fn event(run_id: Uuid, stage: Option<&str>, event_type: EventType, key: &str) -> Event {
        Event::new(
            run_id,
            stage.map(str::to_string),
            event_type,
            key.to_string(),
            format!("{:?}", event_type),
        )
    }

    #[tokio::test]
    async fn test_append_and_replay_in_order() {
        let (store, _temp, run_id) = create_test_store().await;

        store
            .append(&event(run_id, None, EventType::RunStarted, "start"))
            .await
            .unwrap();
        store
            .append(&event(run_id, Some("build"), EventType::StageStarted, "build:1"))
            .await
            .unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].stage.as_deref(), Some("build"));

        let stages = store.find_events(|e| e.stage.is_some()).await.unwrap();
        assert_eq!(stages.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_is_not_appended() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp.path(), run_id).await.unwrap();

        assert!(store
            .append(&event(run_id, None, EventType::RunSucceeded, "complete"))
            .await
            .unwrap());
        assert!(!store
            .append(&event(run_id, None, EventType::RunFailed, "complete"))
            .await
            .unwrap());

        // Keys survive reopening
        let reopened = EventStore::open_in(temp.path(), run_id).await.unwrap();
        assert!(!reopened
            .append(&event(run_id, None, EventType::RunFailed, "complete"))
            .await
            .unwrap());

        let events = reopened.replay().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::RunSucceeded);
    }

    #[tokio::test]
    async fn test_stage_logs_through_sink() {
        let (store, _temp, _run_id) = create_test_store().await;
        assert!(store.read_log("build").await.unwrap().is_none());

        let sink: &dyn LogSink = &store;
        sink.write("build", &[LogLine::system("attempt 1"), LogLine::system("done")])
            .await
            .unwrap();

        let log = store.read_log("build").await.unwrap().unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("[sys] attempt 1"));
    }

    #[tokio::test]
    async fn test_stage_log_cannot_leave_the_run_dir() {
        let root = TempDir::new().unwrap();
        let runs = root.path().join("runs");
        let store = EventStore::open_in(&runs, Uuid::new_v4()).await.unwrap();

        let escaped = store
            .append_log("../../../escaped_stage", &[LogLine::system("out")])
            .await;
        assert!(escaped.is_err());
        assert!(!root.path().join("escaped_stage.log").exists());
        assert!(store.read_log("../../../escaped_stage").await.is_err());
    }

    #[tokio::test]
    async fn test_list_runs_ignores_other_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        store
            .append(&event(run_id, None, EventType::RunCreated, "created"))
            .await
            .unwrap();
        std::fs::create_dir_all(temp_dir.path().join("scratch")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join(Uuid::new_v4().to_string())).unwrap();

        let runs = EventStore::list_runs_in(temp_dir.path()).await.unwrap();
        assert_eq!(runs, vec![run_id]);
    }

    #[test]
    fn test_idempotency_key_format() {
        let run_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = generate_idempotency_key(run_id, "build", "attempt-1");

        assert!(key.starts_with("550e8400-e29b-41d4-a716-446655440000:build:"));
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 16);
        assert_eq!(key, generate_idempotency_key(run_id, "build", "attempt-1"));
    }
}
