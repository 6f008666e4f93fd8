// Findings and rule artifacts

use serde::{Deserialize, Serialize};

/// Rule ID (catalog identity of a rule artifact)
pub type RuleId = String;

/// A scanning rule stored as an artifact in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub name: String,
    /// Object store locator of the rule file
    pub locator: String,
}

/// A single result emitted by the scan executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: RuleId,
    pub host: String,
    pub matched_at: Option<String>,
    pub severity: Option<String>,
    /// Executor's native record, kept verbatim
    pub raw: serde_json::Value,
}
