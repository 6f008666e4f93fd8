// Job Message: the JSON payload carried by the queue
//
// {batch_id, job_id, target_id, target, rule_ids[], scan_all}

use serde::{Deserialize, Deserializer, Serialize};

use super::batch::BatchId;
use super::error::{DomainError, Result};
use super::finding::RuleId;
use super::job::{Job, JobId, RuleSelection, Target, TargetId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub batch_id: Option<BatchId>,
    pub job_id: JobId,
    pub target_id: TargetId,
    pub target: String,
    #[serde(default)]
    pub rule_ids: Vec<RuleId>,
    #[serde(default)]
    pub scan_all: bool,
}

impl JobMessage {
    /// Project a persisted job onto the wire
    pub fn from_job(job: &Job) -> Self {
        Self {
            batch_id: job.batch_id.clone(),
            job_id: job.id.clone(),
            target_id: job.target.id.clone(),
            target: job.target.host.clone(),
            rule_ids: job.rules.rule_ids().to_vec(),
            scan_all: job.rules.is_all(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode and validate a message body.
    ///
    /// Every error returned here is permanent: the body can never be processed.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let message: JobMessage = serde_json::from_slice(body)
            .map_err(|e| DomainError::MalformedMessage(e.to_string()))?;

        if message.job_id.trim().is_empty() {
            return Err(DomainError::MalformedMessage("job_id is empty".to_string()));
        }
        if message.target.trim().is_empty() {
            return Err(DomainError::MalformedMessage("target is empty".to_string()));
        }
        if !message.scan_all && message.rule_ids.is_empty() {
            return Err(DomainError::MalformedMessage(
                "no rules selected and scan_all is false".to_string(),
            ));
        }
        Ok(message)
    }

    pub fn rule_selection(&self) -> RuleSelection {
        if self.scan_all {
            RuleSelection::All
        } else {
            RuleSelection::Explicit(self.rule_ids.clone())
        }
    }

    pub fn target(&self) -> Target {
        Target::new(self.target_id.clone(), self.target.clone())
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}
