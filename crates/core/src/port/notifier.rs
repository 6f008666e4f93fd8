// Notifier Port
// Fire-and-forget outbound notifications; implementations log their own failures

use async_trait::async_trait;
use serde::Serialize;

use crate::domain::{BatchId, BatchStatus, JobId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    BatchFinished {
        batch_id: BatchId,
        name: String,
        status: BatchStatus,
        total: u32,
        completed: u32,
        failed: u32,
        duration_ms: i64,
    },
    JobFailed {
        job_id: JobId,
        batch_id: Option<BatchId>,
        target: String,
        message: String,
    },
}

impl Notification {
    /// Plain-text rendering for chat webhooks
    pub fn text(&self) -> String {
        match self {
            Notification::BatchFinished {
                batch_id,
                name,
                status,
                total,
                completed,
                failed,
                duration_ms,
            } => format!(
                "Batch '{}' ({}) {}: {}/{} completed, {} failed in {}s",
                name,
                batch_id,
                status,
                completed,
                total,
                failed,
                duration_ms / 1000
            ),
            Notification::JobFailed {
                job_id,
                target,
                message,
                ..
            } => format!("Scan {} of {} failed: {}", job_id, target, message),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// Used when no notification channel is configured
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) {}
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }

        pub fn batch_finished_count(&self) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|n| matches!(n, Notification::BatchFinished { .. }))
                .count()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) {
            self.sent.lock().unwrap().push(notification.clone());
        }
    }
}
