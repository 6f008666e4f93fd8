// System probe implementation
// reason: sysinfo for cross-platform memory and CPU readings
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use tracing::debug;

use scanfleet_core::port::system_probe::{SystemMetrics, SystemProbe};

/// System probe implementation using sysinfo
///
/// Only memory and CPU are refreshed per call; a full refresh walks every
/// process on the host.
pub struct SystemProbeImpl {
    system: Arc<Mutex<System>>,
}

impl SystemProbeImpl {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SystemProbeImpl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SystemProbeImpl {
    async fn get_metrics(&self) -> SystemMetrics {
        let mut sys = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        sys.refresh_memory();
        sys.refresh_cpu();

        let metrics = SystemMetrics {
            cpu_usage_percent: sys.global_cpu_info().cpu_usage(),
            memory_used_mb: sys.used_memory() / 1024 / 1024,
            memory_total_mb: sys.total_memory() / 1024 / 1024,
        };

        debug!(
            cpu = %metrics.cpu_usage_percent,
            mem_used_mb = %metrics.memory_used_mb,
            mem_total_mb = %metrics.memory_total_mb,
            "System metrics collected"
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_metrics() {
        let probe = SystemProbeImpl::new();
        let metrics = probe.get_metrics().await;

        assert!(metrics.cpu_usage_percent >= 0.0);
        assert!(metrics.memory_total_mb > 0);
        assert!(metrics.memory_percent() <= 100.0);
    }
}
