//! Alert egress - mirrors recorded alerts to a JSONL file
//!
//! The recorder hands alerts to a bounded channel; a dedicated writer task
//! owns the file and appends one JSON object per line. The store remains
//! the source of truth, so a full channel drops the mirror copy rather than
//! stalling evaluation.

use crate::domain::AlertEvent;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Cheap handle used by the recorder; clone freely
#[derive(Clone)]
pub struct AlertEgress {
    tx: mpsc::Sender<AlertEvent>,
    last_full_warn: Arc<Mutex<Option<Instant>>>,
}

impl AlertEgress {
    /// Queue an alert for the writer. Never blocks; returns false when the
    /// alert was not queued.
    pub fn send(&self, alert: &AlertEvent) -> bool {
        match self.tx.try_send(alert.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                let mut last = self.last_full_warn.lock();
                if last.map_or(true, |at| at.elapsed() > Duration::from_secs(1)) {
                    warn!(alert_id = %alert.alert_id, "alert_egress_full: mirror copy dropped");
                    *last = Some(Instant::now());
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                warn!(alert_id = %alert.alert_id, "alert_egress_closed");
                false
            }
        }
    }
}

/// Writer task that owns the egress file
pub struct AlertEgressWriter {
    file_path: PathBuf,
    rx: mpsc::Receiver<AlertEvent>,
    file: Option<File>,
}

impl AlertEgressWriter {
    /// Append alerts until every `AlertEgress` handle is dropped
    pub async fn run(mut self) {
        info!(file_path = %self.file_path.display(), "alert_egress_started");

        while let Some(alert) = self.rx.recv().await {
            let line = match serde_json::to_string(&alert) {
                Ok(json) => json + "\n",
                Err(e) => {
                    error!(alert_id = %alert.alert_id, error = %e, "alert_egress_serialize_failed");
                    continue;
                }
            };

            if let Err(e) = self.append(line.as_bytes()).await {
                error!(alert_id = %alert.alert_id, error = %e, "alert_egress_failed");
                // Reopen on the next alert
                self.file = None;
            } else {
                debug!(alert_id = %alert.alert_id, bytes = %line.len(), "alert_egress_written");
            }
        }

        info!(file_path = %self.file_path.display(), "alert_egress_stopped");
    }

    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.file.is_none() {
            self.file = Some(open_append(&self.file_path).await?);
        }
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(bytes).await?;
                file.flush().await
            }
            None => Ok(()),
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Create the egress handle and its writer task (to be spawned)
pub fn create_alert_egress(
    file_path: impl Into<PathBuf>,
    buffer_size: usize,
) -> (AlertEgress, AlertEgressWriter) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let egress = AlertEgress { tx, last_full_warn: Default::default() };
    let writer = AlertEgressWriter { file_path: file_path.into(), rx, file: None };
    (egress, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceId, TransitionKind, ZoneId};
    use chrono::Utc;
    use tempfile::tempdir;

    fn alert(kind: TransitionKind) -> AlertEvent {
        AlertEvent {
            alert_id: uuid::Uuid::now_v7().to_string(),
            device_id: DeviceId(7),
            zone_id: ZoneId(1),
            kind,
            description: "Device entered zone: Office.".to_string(),
            position_at: Utc::now(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_writer_appends_lines_and_creates_dirs() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("nested").join("dir").join("alerts.jsonl");
        let (egress, writer) = create_alert_egress(&file_path, 8);
        let handle = tokio::spawn(writer.run());

        let entered = alert(TransitionKind::Entered);
        assert!(egress.send(&entered));
        assert!(egress.send(&alert(TransitionKind::Exited)));
        drop(egress);
        handle.await.unwrap();

        let content = std::fs::read_to_string(&file_path).unwrap();
        assert!(content.ends_with('\n'));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["alert_id"], entered.alert_id);
        assert_eq!(first["kind"], "ZONE_ENTRY");
        let second: AlertEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.kind, TransitionKind::Exited);
    }

    #[tokio::test]
    async fn test_full_channel_drops_mirror_copy() {
        let dir = tempdir().unwrap();
        let (egress, _writer) = create_alert_egress(dir.path().join("alerts.jsonl"), 1);

        assert!(egress.send(&alert(TransitionKind::Entered)));
        assert!(!egress.send(&alert(TransitionKind::Entered)));
    }

    #[tokio::test]
    async fn test_closed_writer() {
        let dir = tempdir().unwrap();
        let (egress, writer) = create_alert_egress(dir.path().join("alerts.jsonl"), 4);
        drop(writer);
        assert!(!egress.send(&alert(TransitionKind::Exited)));
    }
}
