use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use taxflow_core::{EventBus, WorkflowEvent};

/// JSONL execution logger.
///
/// Subscribes to the EventBus at construction and appends every workflow
/// event to `{log_dir}/{execution_id}.jsonl`, one JSON object per line.
/// Each file is closed when its execution finishes.
pub struct RunLogger {
    log_dir: PathBuf,
    rx: broadcast::Receiver<WorkflowEvent>,
    files: HashMap<String, BufWriter<tokio::fs::File>>,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a WorkflowEvent,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, event_bus: &EventBus) -> Self {
        Self {
            log_dir,
            rx: event_bus.subscribe(),
            files: HashMap::new(),
        }
    }

    pub fn log_path(log_dir: &Path, execution_id: &str) -> PathBuf {
        log_dir.join(format!("{}.jsonl", execution_id))
    }

    /// Run until cancelled or the bus closes. Events already queued at
    /// cancellation are still written.
    pub async fn run(mut self, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, path = %self.log_dir.display(), "Failed to create log directory");
            return;
        }
        info!(path = %self.log_dir.display(), "RunLogger started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    loop {
                        match self.rx.try_recv() {
                            Ok(event) => self.write(&event).await,
                            Err(TryRecvError::Lagged(n)) => debug!(skipped = n, "RunLogger lagged"),
                            Err(_) => break,
                        }
                    }
                    debug!("RunLogger cancelled");
                    break;
                }
                result = self.rx.recv() => match result {
                    Ok(event) => self.write(&event).await,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                }
            }
        }

        for (_, mut writer) in self.files.drain() {
            writer.flush().await.ok();
        }
    }

    async fn write(&mut self, event: &WorkflowEvent) {
        let Some(execution_id) = event.execution_id().map(|id| id.0.clone()) else {
            return;
        };

        if !self.files.contains_key(&execution_id) {
            let path = Self::log_path(&self.log_dir, &execution_id);
            match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
            {
                Ok(file) => {
                    debug!(path = %path.display(), "Opened execution log");
                    self.files.insert(execution_id.clone(), BufWriter::new(file));
                }
                Err(e) => {
                    error!(error = %e, path = %path.display(), "Failed to open log file");
                    return;
                }
            }
        }

        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        let Ok(json) = serde_json::to_string(&entry) else {
            return;
        };

        let finished = matches!(event, WorkflowEvent::ExecutionFinished { .. });
        if let Some(writer) = self.files.get_mut(&execution_id) {
            let line = format!("{}\n", json);
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                error!(error = %e, "Failed to write log entry");
            }
            // Flush after each entry so a crash keeps every written line
            if let Err(e) = writer.flush().await {
                error!(error = %e, "Failed to flush log");
            }
        }
        if finished {
            self.files.remove(&execution_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxflow_core::execution::{ExecutionId, ExecutionStatus};

    #[test]
    fn test_entry_flattens_event() {
        let event = WorkflowEvent::StageStarted {
            execution_id: ExecutionId::from_string("e1"),
            stage_id: "extract".into(),
            attempt: 2,
        };
        let entry = LogEntry {
            timestamp: "2026-10-01T12:00:00Z".to_string(),
            event: &event,
        };
        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["event"], "stage_started");
        assert_eq!(json["execution_id"], "e1");
        assert_eq!(json["attempt"], 2);
        assert_eq!(json["timestamp"], "2026-10-01T12:00:00Z");
    }

    #[tokio::test]
    async fn test_writes_one_file_per_execution() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(64);
        let logger = RunLogger::new(dir.path().to_path_buf(), &bus);
        let cancel = CancellationToken::new();

        let e1 = ExecutionId::from_string("e1");
        let e2 = ExecutionId::from_string("e2");
        bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: e1.clone(),
            workflow_id: "wf".into(),
        });
        bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: e2.clone(),
            workflow_id: "wf".into(),
        });
        bus.publish(WorkflowEvent::TriggerFired {
            workflow_id: "wf".into(),
            trigger_id: "nightly".into(),
        });
        bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: e1,
            status: ExecutionStatus::Completed,
            performance_score: 100.0,
        });

        cancel.cancel();
        logger.run(cancel).await;

        let e1_log = std::fs::read_to_string(RunLogger::log_path(dir.path(), "e1")).unwrap();
        let lines: Vec<&str> = e1_log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("execution_started"));
        assert!(lines[1].contains("execution_finished"));

        let e2_log = std::fs::read_to_string(RunLogger::log_path(dir.path(), "e2")).unwrap();
        assert_eq!(e2_log.lines().count(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
