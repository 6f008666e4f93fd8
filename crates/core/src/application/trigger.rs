// Schedule Trigger
// Periodically publishes due scheduled requests and sweeps open batches

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::application::dispatcher::constants::DEFAULT_TRIGGER_INTERVAL;
use crate::application::dispatcher::ShutdownToken;
use crate::application::publisher::SchedulingPublisher;
use crate::application::reconciler::BatchReconciler;
use crate::port::TimeProvider;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerTick {
    pub batches_published: usize,
    pub batches_reconciled: u32,
}

pub struct ScheduleTrigger {
    publisher: Arc<SchedulingPublisher>,
    reconciler: Option<Arc<BatchReconciler>>,
    time_provider: Arc<dyn TimeProvider>,
    interval: Duration,
}

impl ScheduleTrigger {
    pub fn new(publisher: Arc<SchedulingPublisher>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            publisher,
            reconciler: None,
            time_provider,
            interval: DEFAULT_TRIGGER_INTERVAL,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Arc<BatchReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until shutdown (background task). The first tick fires immediately.
    pub async fn run(self, mut shutdown: ShutdownToken) {
        info!(interval_secs = self.interval.as_secs(), "Schedule trigger started");

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.wait() => {
                    info!("Schedule trigger stopped");
                    return;
                }
            }
        }
    }

    /// One pass; failures are logged and retried on the next tick
    pub async fn run_once(&self) -> TriggerTick {
        let mut result = TriggerTick::default();
        let today = self.time_provider.today();

        match self.publisher.publish_due(today).await {
            Ok(reports) => result.batches_published = reports.len(),
            Err(e) => error!(error = %e, "Failed to publish due schedules"),
        }

        if let Some(reconciler) = &self.reconciler {
            match reconciler.sweep().await {
                Ok(report) => result.batches_reconciled = report.batches_finished,
                Err(e) => error!(error = %e, "Batch reconciliation failed"),
            }
        }
        result
    }
}
