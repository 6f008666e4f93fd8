// Domain Layer - Scan jobs, batches and the wire message between them

pub mod batch;
pub mod error;
pub mod finding;
pub mod job;
pub mod message;
pub mod schedule;

// Re-exports
pub use batch::{Batch, BatchId, BatchStatus, OutcomeEffect};
pub use error::DomainError;
pub use finding::{Finding, Rule, RuleId};
pub use job::{ErrorDetail, Job, JobId, JobStatus, RuleSelection, Target, TargetId};
pub use message::JobMessage;
pub use schedule::{ScheduleId, ScheduledRequest, TargetSelector};
