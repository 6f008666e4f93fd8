// SQLite ScheduleStore, TargetCatalog and RuleCatalog

use async_trait::async_trait;
use chrono::NaiveDate;
use scanfleet_core::domain::{
    Rule, RuleId, RuleSelection, ScheduledRequest, Target, TargetId, TargetSelector,
};
use scanfleet_core::error::{AppError, Result};
use scanfleet_core::port::{RuleCatalog, ScheduleStore, TargetCatalog};
use sqlx::{QueryBuilder, Sqlite};

use crate::job_store::SqliteScanStore;
use crate::sql_error::map_sqlx_error;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[async_trait]
impl ScheduleStore for SqliteScanStore {
    async fn create_schedule(&self, request: &ScheduledRequest) -> Result<()> {
        let target_ids = match &request.targets {
            TargetSelector::All => None,
            TargetSelector::Explicit(ids) => Some(serde_json::to_string(ids)?),
        };
        let rule_ids = match &request.rules {
            RuleSelection::All => None,
            RuleSelection::Explicit(ids) => Some(serde_json::to_string(ids)?),
        };

        sqlx::query(
            r#"
            INSERT INTO schedules (id, name, target_ids, rule_ids, trigger_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(&request.name)
        .bind(target_ids)
        .bind(rule_ids)
        .bind(request.trigger_date.format(DATE_FORMAT).to_string())
        .bind(request.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduledRequest>> {
        let rows: Vec<ScheduleRow> =
            sqlx::query_as("SELECT * FROM schedules ORDER BY trigger_date ASC, created_at ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        rows.into_iter().map(ScheduleRow::into_request).collect()
    }

    async fn due_schedules(&self, today: NaiveDate) -> Result<Vec<ScheduledRequest>> {
        // ISO dates compare correctly as text
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT * FROM schedules
            WHERE trigger_date <= ?
            ORDER BY trigger_date ASC, created_at ASC
            "#,
        )
        .bind(today.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(ScheduleRow::into_request).collect()
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    name: Option<String>,
    target_ids: Option<String>, // JSON array, NULL = all
    rule_ids: Option<String>,   // JSON array, NULL = all
    trigger_date: String,
    created_at: i64,
}

impl ScheduleRow {
    fn into_request(self) -> Result<ScheduledRequest> {
        let targets = match self.target_ids {
            None => TargetSelector::All,
            Some(json) => TargetSelector::Explicit(serde_json::from_str(&json)?),
        };
        let rules = match self.rule_ids {
            None => RuleSelection::All,
            Some(json) => RuleSelection::from_parts(serde_json::from_str(&json)?, false)?,
        };
        let trigger_date = NaiveDate::parse_from_str(&self.trigger_date, DATE_FORMAT)
            .map_err(|e| AppError::Internal(format!("bad trigger_date {}: {}", self.trigger_date, e)))?;

        Ok(ScheduledRequest {
            id: self.id,
            name: self.name,
            targets,
            rules,
            trigger_date,
            created_at: self.created_at,
        })
    }
}

/// `SELECT ... WHERE id IN (...)` for a dynamic id list
fn select_in<'a>(select: &str, ids: &'a [String]) -> QueryBuilder<'a, Sqlite> {
    let mut builder = QueryBuilder::new(select);
    builder.push(" WHERE id IN (");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(") ORDER BY id ASC");
    builder
}

#[async_trait]
impl TargetCatalog for SqliteScanStore {
    async fn find_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<(String, String)> = select_in("SELECT id, host FROM targets", ids)
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(|(id, host)| Target::new(id, host)).collect())
    }

    async fn all_targets(&self) -> Result<Vec<Target>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, host FROM targets ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(|(id, host)| Target::new(id, host)).collect())
    }

    async fn upsert_target(&self, target: &Target) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO targets (id, host) VALUES (?, ?)
            ON CONFLICT(id) DO UPDATE SET host = excluded.host
            "#,
        )
        .bind(&target.id)
        .bind(&target.host)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[async_trait]
impl RuleCatalog for SqliteScanStore {
    async fn find_rules(&self, ids: &[RuleId]) -> Result<Vec<Rule>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows: Vec<RuleRow> = select_in("SELECT id, name, locator FROM rules", ids)
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Rule::from).collect())
    }

    async fn all_rules(&self) -> Result<Vec<Rule>> {
        let rows: Vec<RuleRow> = sqlx::query_as("SELECT id, name, locator FROM rules ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(Rule::from).collect())
    }

    async fn upsert_rule(&self, rule: &Rule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rules (id, name, locator) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name, locator = excluded.locator
            "#,
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(&rule.locator)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: String,
    name: String,
    locator: String,
}

impl From<RuleRow> for Rule {
    fn from(row: RuleRow) -> Self {
        Rule {
            id: row.id,
            name: row.name,
            locator: row.locator,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn setup_test_db() -> SqliteScanStore {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteScanStore::new(pool)
    }

    fn date(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_schedule_round_trip_and_due() {
        let store = setup_test_db().await;
        let explicit = ScheduledRequest {
            id: "s-1".into(),
            name: Some("weekly".into()),
            targets: TargetSelector::Explicit(vec!["t-1".into(), "t-2".into()]),
            rules: RuleSelection::Explicit(vec!["cve-1".into()]),
            trigger_date: date(3, 9),
            created_at: 10,
        };
        let wildcard = ScheduledRequest {
            id: "s-2".into(),
            name: None,
            targets: TargetSelector::All,
            rules: RuleSelection::All,
            trigger_date: date(3, 12),
            created_at: 20,
        };
        store.create_schedule(&explicit).await.unwrap();
        store.create_schedule(&wildcard).await.unwrap();

        assert_eq!(store.list_schedules().await.unwrap(), vec![explicit.clone(), wildcard.clone()]);
        assert_eq!(store.due_schedules(date(3, 10)).await.unwrap(), vec![explicit]);
        assert_eq!(store.due_schedules(date(3, 12)).await.unwrap().len(), 2);

        assert!(store.delete_schedule("s-1").await.unwrap());
        assert!(!store.delete_schedule("s-1").await.unwrap());
        assert_eq!(store.list_schedules().await.unwrap(), vec![wildcard]);
    }

    #[tokio::test]
    async fn test_duplicate_schedule_conflicts() {
        let store = setup_test_db().await;
        let request = ScheduledRequest {
            id: "s-1".into(),
            name: None,
            targets: TargetSelector::All,
            rules: RuleSelection::All,
            trigger_date: date(1, 1),
            created_at: 0,
        };
        store.create_schedule(&request).await.unwrap();
        assert!(matches!(
            store.create_schedule(&request).await.unwrap_err(),
            AppError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_target_catalog() {
        let store = setup_test_db().await;
        store.upsert_target(&Target::new("t-1", "a.example.com")).await.unwrap();
        store.upsert_target(&Target::new("t-2", "b.example.com")).await.unwrap();
        store.upsert_target(&Target::new("t-1", "a2.example.com")).await.unwrap();

        let found = store
            .find_targets(&["t-1".to_string(), "t-404".to_string()])
            .await
            .unwrap();
        assert_eq!(found, vec![Target::new("t-1", "a2.example.com")]);
        assert_eq!(store.all_targets().await.unwrap().len(), 2);
        assert!(store.find_targets(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rule_catalog() {
        let store = setup_test_db().await;
        for id in ["cve-1", "cve-2", "cve-3"] {
            store
                .upsert_rule(&Rule {
                    id: id.into(),
                    name: id.to_uppercase(),
                    locator: format!("file:///rules/{}.yaml", id),
                })
                .await
                .unwrap();
        }

        let found = store
            .find_rules(&["cve-3".to_string(), "cve-1".to_string()])
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["cve-1", "cve-3"]);
        assert_eq!(store.all_rules().await.unwrap().len(), 3);
    }
}
