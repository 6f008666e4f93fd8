// Scheduled Request Domain Model

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::job::{RuleSelection, TargetId};

/// Schedule ID
pub type ScheduleId = String;

/// Which targets a batch covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSelector {
    All,
    Explicit(Vec<TargetId>),
}

/// A deferred batch: expanded into one batch + N jobs on its trigger date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRequest {
    pub id: ScheduleId,
    pub name: Option<String>,
    pub targets: TargetSelector,
    pub rules: RuleSelection,
    pub trigger_date: NaiveDate,
    pub created_at: i64, // epoch ms
}

impl ScheduledRequest {
    /// Due once the trigger date has arrived (missed days still fire)
    pub fn is_due(&self, today: NaiveDate) -> bool {
        self.trigger_date <= today
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_due() {
        let request = ScheduledRequest {
            id: "s-1".into(),
            name: None,
            targets: TargetSelector::All,
            rules: RuleSelection::All,
            trigger_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            created_at: 0,
        };

        assert!(!request.is_due(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()));
        assert!(request.is_due(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()));
        assert!(request.is_due(NaiveDate::from_ymd_opt(2026, 3, 11).unwrap()));
    }
}
