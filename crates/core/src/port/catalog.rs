// Target and rule catalogs (administrative data the publisher and dispatcher resolve against)

use async_trait::async_trait;

use crate::domain::{Rule, RuleId, Target, TargetId};
use crate::error::Result;

#[async_trait]
pub trait TargetCatalog: Send + Sync {
    /// Known targets among `ids`; unknown ids are simply absent from the result
    async fn find_targets(&self, ids: &[TargetId]) -> Result<Vec<Target>>;

    async fn all_targets(&self) -> Result<Vec<Target>>;

    async fn upsert_target(&self, target: &Target) -> Result<()>;
}

#[async_trait]
pub trait RuleCatalog: Send + Sync {
    /// Known rules among `ids`; unknown ids are simply absent from the result
    async fn find_rules(&self, ids: &[RuleId]) -> Result<Vec<Rule>>;

    async fn all_rules(&self) -> Result<Vec<Rule>>;

    async fn upsert_rule(&self, rule: &Rule) -> Result<()>;
}
