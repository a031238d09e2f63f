use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lattice_core::event::EventBus;
use lattice_core::types::{JobId, PipelineEvent};

/// JSONL run logger.
///
/// Subscribes to the event bus and writes structured entries as JSONL (one
/// JSON object per line). Append-only and crash-resilient: even if the
/// process dies mid-run, all previously written lines are intact. Telemetry
/// is best-effort — a write failure stops the logger, never the pipeline.
pub struct RunLogger {
    log_dir: PathBuf,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    job_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{job_id}/{timestamp}.jsonl`.
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    /// Run the logger as a background task.
    ///
    /// Subscribes to the event bus and writes JSONL until cancellation or the
    /// job's RunCompleted event.
    pub async fn run(self, event_bus: Arc<EventBus>, job_id: JobId, cancel: CancellationToken) {
        let job_dir = self.log_dir.join(&job_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&job_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = job_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut rx = event_bus.subscribe();
        let job = job_id.0.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let entry = match event_to_entry(&job, &event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                // Flush after each entry for crash resilience
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(&event, PipelineEvent::RunCompleted { job_id, .. } if job_id.0 == job) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        let _ = writer.flush().await;
    }
}

fn event_to_entry(job: &str, event: &PipelineEvent) -> Option<LogEntry> {
    let entry = |job_id: &JobId, event_type: &str, step: Option<String>, detail: Option<serde_json::Value>| {
        if job_id.0 != job {
            return None;
        }
        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            job_id: job_id.0.clone(),
            event_type: event_type.to_string(),
            step,
            detail,
        })
    };

    match event {
        PipelineEvent::RunStarted { job_id } => entry(job_id, "run_started", None, None),
        PipelineEvent::StepStarted { job_id, step } => {
            entry(job_id, "step_started", Some(step.clone()), None)
        }
        PipelineEvent::StepCompleted {
            job_id,
            step,
            elapsed_ms,
            cached,
        } => entry(
            job_id,
            "step_completed",
            Some(step.clone()),
            Some(serde_json::json!({ "elapsed_ms": elapsed_ms, "cached": cached })),
        ),
        PipelineEvent::StepFailed { job_id, step, error } => entry(
            job_id,
            "step_failed",
            Some(step.clone()),
            Some(serde_json::json!({ "error": error })),
        ),
        PipelineEvent::RouteChosen {
            job_id,
            source,
            label,
        } => entry(
            job_id,
            "route_chosen",
            Some(source.clone()),
            Some(serde_json::json!({ "label": label })),
        ),
        PipelineEvent::GateWaiting {
            job_id,
            gate,
            options,
        } => entry(
            job_id,
            "gate_waiting",
            Some(gate.clone()),
            Some(serde_json::json!({ "options": options })),
        ),
        PipelineEvent::GateSatisfied { job_id, gate, value } => entry(
            job_id,
            "gate_satisfied",
            Some(gate.clone()),
            Some(serde_json::json!({ "value": value })),
        ),
        PipelineEvent::RunCompleted { job_id, elapsed_ms } => entry(
            job_id,
            "run_completed",
            None,
            Some(serde_json::json!({ "elapsed_ms": elapsed_ms })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_jsonl_until_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let job_id = JobId::from_str("job-log");
        let cancel = CancellationToken::new();

        let logger = RunLogger::new(dir.path().to_path_buf());
        let task = tokio::spawn(logger.run(bus.clone(), job_id.clone(), cancel));

        // Give the logger a moment to subscribe.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        bus.publish(PipelineEvent::RunStarted {
            job_id: job_id.clone(),
        });
        bus.publish(PipelineEvent::StepCompleted {
            job_id: job_id.clone(),
            step: "slr".into(),
            elapsed_ms: 12,
            cached: false,
        });
        // An event for another job must be skipped.
        bus.publish(PipelineEvent::RunStarted {
            job_id: JobId::from_str("other"),
        });
        bus.publish(PipelineEvent::RunCompleted {
            job_id: job_id.clone(),
            elapsed_ms: 99,
        });

        task.await.unwrap();

        let job_dir = dir.path().join("job-log");
        let file = std::fs::read_dir(&job_dir).unwrap().next().unwrap().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event_type"], "run_started");
        let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["event_type"], "run_completed");
    }

    #[tokio::test]
    async fn cancellation_stops_the_logger() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let cancel = CancellationToken::new();

        let logger = RunLogger::new(dir.path().to_path_buf());
        let task = tokio::spawn(logger.run(bus, JobId::from_str("j"), cancel.clone()));

        cancel.cancel();
        task.await.unwrap();
    }
}
