// Schedule Store Port

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::ScheduledRequest;
use crate::error::Result;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule(&self, request: &ScheduledRequest) -> Result<()>;

    async fn list_schedules(&self) -> Result<Vec<ScheduledRequest>>;

    /// Requests whose trigger date is on or before `today`
    async fn due_schedules(&self, today: NaiveDate) -> Result<Vec<ScheduledRequest>>;

    /// Returns false if the request did not exist
    async fn delete_schedule(&self, id: &str) -> Result<bool>;
}
