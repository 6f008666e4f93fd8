// System resource monitoring port
use async_trait::async_trait;

/// System resource metrics
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

impl SystemMetrics {
    pub fn memory_percent(&self) -> f32 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        self.memory_used_mb as f32 * 100.0 / self.memory_total_mb as f32
    }
}

/// System probe port, used by the dispatcher to hold back admission under memory pressure
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn get_metrics(&self) -> SystemMetrics;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Mock SystemProbe for testing
    pub struct MockSystemProbe {
        metrics: Mutex<SystemMetrics>,
    }

    impl MockSystemProbe {
        pub fn new(memory_percent: u64) -> Self {
            Self {
                metrics: Mutex::new(SystemMetrics {
                    cpu_usage_percent: 10.0,
                    memory_used_mb: memory_percent * 10,
                    memory_total_mb: 1000,
                }),
            }
        }

        pub fn set_memory_percent(&self, memory_percent: u64) {
            self.metrics.lock().unwrap().memory_used_mb = memory_percent * 10;
        }
    }

    #[async_trait]
    impl SystemProbe for MockSystemProbe {
        async fn get_metrics(&self) -> SystemMetrics {
            self.metrics.lock().unwrap().clone()
        }
    }
}
