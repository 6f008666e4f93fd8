// Filesystem rule stager
// Copies a job's rule artifacts into `{staging_root}/{job_id}/` for the scanner
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use scanfleet_core::domain::Rule;
use scanfleet_core::error::{AppError, Result};
use scanfleet_core::port::{ObjectStore, RuleStager, StagedRules};

/// Extension used when a locator does not carry one
const DEFAULT_RULE_EXTENSION: &str = "yaml";

pub struct FsRuleStager {
    objects: Arc<dyn ObjectStore>,
    root: PathBuf,
}

impl FsRuleStager {
    pub fn new(objects: Arc<dyn ObjectStore>, root: impl Into<PathBuf>) -> Self {
        Self {
            objects,
            root: root.into(),
        }
    }

    /// Remove job directories left behind by a previous process.
    /// Call once at startup, before any job is staged.
    pub async fn purge_stale(&self) -> Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(root = %self.root.display(), removed = removed, "Purged stale staging directories");
        }
        Ok(removed)
    }

    fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        if !is_safe_component(job_id) {
            return Err(AppError::Validation(format!("unusable job id for staging: {}", job_id)));
        }
        Ok(self.root.join(job_id))
    }

    async fn fetch_all(&self, dir: &Path, rules: &[Rule]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(rules.len());
        for rule in rules {
            let bytes = self.objects.get(&rule.locator).await?;
            let path = dir.join(file_name(rule));
            tokio::fs::write(&path, bytes).await?;
            paths.push(path);
        }
        Ok(paths)
    }
}

#[async_trait]
impl RuleStager for FsRuleStager {
    async fn stage(&self, job_id: &str, rules: &[Rule]) -> Result<StagedRules> {
        let dir = self.job_dir(job_id)?;

        // A redelivered job may find its previous directory
        remove_if_exists(&dir).await?;
        tokio::fs::create_dir_all(&dir).await?;

        match self.fetch_all(&dir, rules).await {
            Ok(paths) => {
                debug!(job_id = %job_id, rules = paths.len(), dir = %dir.display(), "Rules staged");
                Ok(StagedRules {
                    job_id: job_id.to_string(),
                    root: dir,
                    paths,
                })
            }
            Err(e) => {
                if let Err(cleanup) = remove_if_exists(&dir).await {
                    warn!(job_id = %job_id, error = %cleanup, "Failed to clean up partial staging");
                }
                Err(e)
            }
        }
    }

    async fn release(&self, staged: StagedRules) -> Result<()> {
        remove_if_exists(&staged.root).await?;
        debug!(job_id = %staged.job_id, "Staged rules released");
        Ok(())
    }
}

async fn remove_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_safe_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains(['/', '\\'])
}

/// `{rule_id}.{ext}` with the extension taken from the locator
fn file_name(rule: &Rule) -> String {
    let stem: String = rule
        .id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let ext = Path::new(&rule.locator)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(DEFAULT_RULE_EXTENSION);
    format!("{}.{}", stem, ext)
}
