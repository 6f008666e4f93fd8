// Batch Domain Model
//
// A batch groups N jobs submitted together. Outcomes are merged as sets keyed
// by job id, so the last reported outcome per job wins and redelivery never
// double-counts.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::error::{DomainError, Result};
use super::job::JobId;

/// Batch ID (UUID v4, canonical string form)
pub type BatchId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InProgress => "in-progress",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "in-progress" => Ok(BatchStatus::InProgress),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(DomainError::UnknownStatus(other.to_string())),
        }
    }
}

/// What applying one job outcome did to a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeEffect {
    /// Nothing to persist (already terminal, or same outcome already recorded)
    Unchanged,
    /// Sets changed, batch still running
    Recorded,
    /// This outcome made the batch terminal
    Finished(BatchStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub name: String,
    pub total: u32,
    pub completed: BTreeSet<JobId>,
    pub failed: BTreeSet<JobId>,
    pub status: BatchStatus,
    pub created_at: i64, // epoch ms
    pub duration_ms: Option<i64>,

    /// Compare-and-swap token, bumped by the store on every successful write
    pub version: i64,
}

impl Batch {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        total: u32,
        created_at: i64,
    ) -> Result<Self> {
        if total == 0 {
            return Err(DomainError::ValidationError(
                "batch must contain at least one job".to_string(),
            ));
        }
        Ok(Self {
            id: id.into(),
            name: name.into(),
            total,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            status: BatchStatus::Pending,
            created_at,
            duration_ms: None,
            version: 0,
        })
    }

    pub fn processed(&self) -> u32 {
        (self.completed.len() + self.failed.len()) as u32
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merge one terminal job outcome.
    ///
    /// The job id is removed from both sets and inserted into the one matching
    /// `success`. Once `processed >= total` the status is fixed to `completed`
    /// (at least one success) or `failed`, and the duration is computed from
    /// `created_at`. A terminal batch is never modified again.
    pub fn apply_outcome(&mut self, job_id: &str, success: bool, now_millis: i64) -> OutcomeEffect {
        if self.is_terminal() {
            return OutcomeEffect::Unchanged;
        }

        let (target, other) = if success {
            (&mut self.completed, &mut self.failed)
        } else {
            (&mut self.failed, &mut self.completed)
        };
        let moved = other.remove(job_id);
        let inserted = target.insert(job_id.to_string());
        let changed = moved || inserted;

        if self.processed() >= self.total {
            let status = if self.completed.is_empty() {
                BatchStatus::Failed
            } else {
                BatchStatus::Completed
            };
            self.status = status;
            self.duration_ms = Some((now_millis - self.created_at).max(0));
            return OutcomeEffect::Finished(status);
        }

        if !changed {
            return OutcomeEffect::Unchanged;
        }
        self.status = BatchStatus::InProgress;
        OutcomeEffect::Recorded
    }

    /// Count `slots` jobs that never got a job row as failed.
    ///
    /// Each slot is recorded under a fixed placeholder id (`missing-0`,
    /// `missing-1`, ...), so repeating the call with the same count changes
    /// nothing.
    pub fn abandon_missing(&mut self, slots: u32, now_millis: i64) -> OutcomeEffect {
        let mut effect = OutcomeEffect::Unchanged;
        for slot in 0..slots {
            match self.apply_outcome(&missing_slot_id(slot), false, now_millis) {
                OutcomeEffect::Unchanged => {}
                finished @ OutcomeEffect::Finished(_) => return finished,
                OutcomeEffect::Recorded => effect = OutcomeEffect::Recorded,
            }
        }
        effect
    }
}

fn missing_slot_id(slot: u32) -> JobId {
    format!("missing-{}", slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(total: u32) -> Batch {
        Batch::new("b-1", "Scheduled Scan", total, 1_000).unwrap()
    }

    #[test]
    fn test_zero_total_rejected() {
        tokio_test::assert_err!(Batch::new("b", "empty", 0, 0));
    }

    #[test]
    fn test_mixed_outcomes_complete_batch() {
        let mut b = batch(3);
        assert_eq!(b.apply_outcome("a", true, 2_000), OutcomeEffect::Recorded);
        assert_eq!(b.status, BatchStatus::InProgress);
        assert_eq!(b.apply_outcome("b", false, 3_000), OutcomeEffect::Recorded);
        assert_eq!(
            b.apply_outcome("c", true, 4_000),
            OutcomeEffect::Finished(BatchStatus::Completed)
        );

        assert_eq!(b.completed, BTreeSet::from(["a".to_string(), "c".to_string()]));
        assert_eq!(b.failed, BTreeSet::from(["b".to_string()]));
        assert_eq!(b.duration_ms, Some(3_000));
    }

    #[test]
    fn test_all_failed_marks_batch_failed() {
        let mut b = batch(2);
        b.apply_outcome("a", false, 2_000);
        assert_eq!(
            b.apply_outcome("b", false, 2_500),
            OutcomeEffect::Finished(BatchStatus::Failed)
        );
    }

    #[test]
    fn test_duplicate_outcome_is_idempotent() {
        let mut b = batch(3);
        b.apply_outcome("a", true, 2_000);
        assert_eq!(b.apply_outcome("a", true, 2_100), OutcomeEffect::Unchanged);
        assert_eq!(b.processed(), 1);
    }

    #[test]
    fn test_changed_outcome_moves_between_sets() {
        let mut b = batch(3);
        b.apply_outcome("a", false, 2_000);
        assert_eq!(b.apply_outcome("a", true, 2_100), OutcomeEffect::Recorded);
        assert!(b.completed.contains("a"));
        assert!(!b.failed.contains("a"));
        assert_eq!(b.processed(), 1);
    }

    #[test]
    fn test_missing_slots_close_batch() {
        let mut b = batch(3);
        b.apply_outcome("a", false, 2_000);
        b.apply_outcome("b", true, 2_000);

        assert_eq!(
            b.abandon_missing(1, 5_000),
            OutcomeEffect::Finished(BatchStatus::Completed)
        );
        assert!(b.failed.contains("missing-0"));
        assert_eq!(b.duration_ms, Some(4_000));
    }

    #[test]
    fn test_missing_slots_are_idempotent() {
        let mut b = batch(4);
        assert_eq!(b.abandon_missing(2, 2_000), OutcomeEffect::Recorded);
        assert_eq!(b.abandon_missing(2, 3_000), OutcomeEffect::Unchanged);
        assert_eq!(b.processed(), 2);
        assert_eq!(b.abandon_missing(0, 3_000), OutcomeEffect::Unchanged);
    }

    #[test]
    fn test_terminal_batch_is_immutable() {
        let mut b = batch(1);
        b.apply_outcome("a", true, 2_000);
        let snapshot = b.clone();

        assert_eq!(b.apply_outcome("a", false, 9_000), OutcomeEffect::Unchanged);
        assert_eq!(b, snapshot);
    }
}
