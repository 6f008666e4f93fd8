//! Deferred batches: persistence, expansion on the trigger date, deletion

mod common;

use std::collections::BTreeSet;

use chrono::{Days, NaiveDate};
use common::Fleet;
use scanfleet_core::domain::{JobMessage, JobStatus, RuleSelection, ScheduledRequest, TargetSelector};
use scanfleet_core::port::{JobStore, QueueTransport, ScheduleStore};

fn schedule(id: &str, targets: TargetSelector, trigger_date: NaiveDate) -> ScheduledRequest {
    ScheduledRequest {
        id: id.to_string(),
        name: Some(format!("weekly {}", id)),
        targets,
        rules: RuleSelection::Explicit(vec!["cve-1".into()]),
        trigger_date,
        created_at: 0,
    }
}

#[tokio::test]
async fn test_due_schedule_expands_into_batch() {
    let fleet = Fleet::new().await;
    let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

    fleet
        .store
        .create_schedule(&schedule("overdue", TargetSelector::All, today - Days::new(2)))
        .await
        .unwrap();
    fleet
        .store
        .create_schedule(&schedule(
            "future",
            TargetSelector::Explicit(vec!["t-a".into()]),
            today + Days::new(1),
        ))
        .await
        .unwrap();

    let reports = fleet.publisher.publish_due(today).await.unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    // Every catalog target
    assert_eq!(report.total, 4);
    assert_eq!(report.published, 4);
    assert!(report.failed_targets.is_empty());

    let remaining: Vec<String> = fleet
        .store
        .list_schedules()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(remaining, vec!["future".to_string()]);

    let batch = fleet.store.find_batch(&report.batch_id).await.unwrap().unwrap();
    assert_eq!(batch.name, "weekly overdue");
    assert_eq!(batch.total, 4);

    let jobs = fleet.store.find_jobs_by_batch(&report.batch_id).await.unwrap();
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
    let job_ids: BTreeSet<String> = jobs.into_iter().map(|j| j.id).collect();

    let mut delivered = BTreeSet::new();
    while let Some(delivery) = fleet.transport.receive().await.unwrap() {
        let message = JobMessage::decode(&delivery.body).unwrap();
        assert_eq!(message.batch_id.as_deref(), Some(report.batch_id.as_str()));
        assert_eq!(message.rule_ids, vec!["cve-1".to_string()]);
        delivered.insert(message.job_id);
        fleet.transport.acknowledge(&delivery.tag).await.unwrap();
    }
    assert_eq!(delivered, job_ids);

    // Nothing left to fire today
    assert!(fleet.publisher.publish_due(today).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_with_unknown_targets_reports_them() {
    let fleet = Fleet::new().await;
    let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

    fleet
        .store
        .create_schedule(&schedule(
            "partial",
            TargetSelector::Explicit(vec!["t-a".into(), "t-missing".into()]),
            today,
        ))
        .await
        .unwrap();

    let reports = fleet.publisher.publish_due(today).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].total, 1);
    assert_eq!(reports[0].failed_targets, vec!["t-missing".to_string()]);
    assert!(fleet.store.list_schedules().await.unwrap().is_empty());
}
