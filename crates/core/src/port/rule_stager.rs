// Rule Stager Port
//
// Materializes a job's rule artifacts into a private local directory for the
// scan executor, and removes that directory afterwards.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::{JobId, Rule};
use crate::error::Result;

/// Rule files staged for one job
#[derive(Debug, Clone)]
pub struct StagedRules {
    pub job_id: JobId,
    pub root: PathBuf,
    pub paths: Vec<PathBuf>,
}

#[async_trait]
pub trait RuleStager: Send + Sync {
    async fn stage(&self, job_id: &str, rules: &[Rule]) -> Result<StagedRules>;

    /// Delete everything staged for the job
    async fn release(&self, staged: StagedRules) -> Result<()>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Stager that tracks which job directories are still live
    #[derive(Default)]
    pub struct RecordingStager {
        live: Mutex<HashSet<JobId>>,
        staged_total: Mutex<usize>,
        fail_stage: AtomicBool,
    }

    impl RecordingStager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_stage(&self, fail: bool) {
            self.fail_stage.store(fail, Ordering::SeqCst);
        }

        /// Job ids staged but not yet released
        pub fn live(&self) -> usize {
            self.live.lock().unwrap().len()
        }

        pub fn staged_total(&self) -> usize {
            *self.staged_total.lock().unwrap()
        }
    }

    #[async_trait]
    impl RuleStager for RecordingStager {
        async fn stage(&self, job_id: &str, rules: &[Rule]) -> Result<StagedRules> {
            if self.fail_stage.load(Ordering::SeqCst) {
                return Err(AppError::NotFound("rule artifact missing".to_string()));
            }
            let root = PathBuf::from("/staging").join(job_id);
            let paths = rules
                .iter()
                .map(|rule| root.join(format!("{}.yaml", rule.id)))
                .collect();
            self.live.lock().unwrap().insert(job_id.to_string());
            *self.staged_total.lock().unwrap() += 1;
            Ok(StagedRules {
                job_id: job_id.to_string(),
                root,
                paths,
            })
        }

        async fn release(&self, staged: StagedRules) -> Result<()> {
            self.live.lock().unwrap().remove(&staged.job_id);
            Ok(())
        }
    }
}
