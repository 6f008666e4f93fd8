//! Shared fixture: every adapter wired against a throwaway directory.
//!
//! The scanner is a shell script standing in for the real binary. It reads the
//! target from `-u` and behaves by hostname: `down*` fails as unreachable,
//! `slow*` hangs, anything else emits one JSONL finding per run.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scanfleet_core::application::{
    BatchAggregator, Dispatcher, DispatcherConfig, DispatcherDeps, ExecutorAdapter,
    ReconnectingTransport, RunMode, SchedulingPublisher,
};
use scanfleet_core::domain::{Rule, Target};
use scanfleet_core::port::id_provider::UuidProvider;
use scanfleet_core::port::notifier::mocks::RecordingNotifier;
use scanfleet_core::port::time_provider::SystemTimeProvider;
use scanfleet_core::port::{ObjectStore, RuleCatalog, TargetCatalog};
use scanfleet_infra_sqlite::{create_pool, run_migrations, SqliteQueueConnector, SqliteScanStore};
use scanfleet_infra_system::{CommandScanExecutor, FsObjectStore, FsRuleStager};
use tempfile::TempDir;

const SCANNER_SCRIPT: &str = r#"
host=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-u" ]; then host="$2"; fi
  shift
done
case "$host" in
  down*) echo "[FTL] Could not connect to $host: connection refused" >&2; exit 1 ;;
  slow*) exec sleep 30 ;;
esac
echo "{\"template-id\":\"cve-1\",\"host\":\"$host\",\"matched-at\":\"https://$host/login\",\"info\":{\"severity\":\"high\"}}"
"#;

pub struct Fleet {
    pub dir: TempDir,
    pub store: Arc<SqliteScanStore>,
    pub connector: Arc<SqliteQueueConnector>,
    pub transport: Arc<ReconnectingTransport>,
    pub objects: Arc<FsObjectStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub publisher: SchedulingPublisher,
    script: PathBuf,
}

impl Fleet {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("scanfleet.db").display());
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let clock = Arc::new(SystemTimeProvider);
        let store = Arc::new(SqliteScanStore::new(pool.clone()));
        let connector = Arc::new(
            SqliteQueueConnector::new(pool, clock.clone())
                .with_visibility_timeout(Duration::from_secs(600)),
        );
        let transport = Arc::new(
            ReconnectingTransport::connect(connector.clone())
                .await
                .unwrap()
                .with_reconnect_policy(2, Duration::from_millis(10)),
        );
        let objects = Arc::new(FsObjectStore::new(dir.path().join("objects")));

        let publisher = SchedulingPublisher::new(
            store.clone(),
            store.clone(),
            store.clone(),
            transport.clone(),
            Arc::new(UuidProvider),
            clock,
        );

        let script = dir.path().join("scanner.sh");
        std::fs::write(&script, SCANNER_SCRIPT).unwrap();

        let fleet = Self {
            dir,
            store,
            connector,
            transport,
            objects,
            notifier: Arc::new(RecordingNotifier::new()),
            publisher,
            script,
        };
        fleet.seed_catalog().await;
        fleet
    }

    async fn seed_catalog(&self) {
        for (id, host) in [
            ("t-a", "a.example.com"),
            ("t-b", "down.example.com"),
            ("t-c", "c.example.com"),
            ("t-slow", "slow.example.com"),
        ] {
            self.store.upsert_target(&Target::new(id, host)).await.unwrap();
        }

        let locator = self
            .objects
            .put("rules/cve-1.yaml", b"id: cve-1\ninfo:\n  severity: high\n".to_vec())
            .await
            .unwrap();
        self.store
            .upsert_rule(&Rule {
                id: "cve-1".to_string(),
                name: "CVE-1 probe".to_string(),
                locator,
            })
            .await
            .unwrap();
    }

    pub fn aggregator(&self) -> Arc<BatchAggregator> {
        Arc::new(
            BatchAggregator::new(
                self.store.clone(),
                self.notifier.clone(),
                Arc::new(SystemTimeProvider),
            )
            .with_retry(200, Duration::from_millis(1)),
        )
    }

    /// Drain-mode dispatcher running the stub scanner
    pub fn dispatcher(&self, deadline: Duration) -> Dispatcher {
        let clock = Arc::new(SystemTimeProvider);
        let executor = CommandScanExecutor::new("/bin/sh")
            .with_extra_args(vec![self.script.display().to_string()])
            .with_termination_grace(Duration::from_secs(1));
        let adapter = ExecutorAdapter::new(Arc::new(executor), self.objects.clone(), clock.clone())
            .with_deadline(deadline)
            .with_termination_grace(Duration::from_secs(1));
        let stager = FsRuleStager::new(self.objects.clone(), self.dir.path().join("staging"));

        Dispatcher::new(
            DispatcherDeps {
                transport: self.transport.clone(),
                store: self.store.clone(),
                rules: self.store.clone(),
                stager: Arc::new(stager),
                adapter: Arc::new(adapter),
                aggregator: self.aggregator(),
                notifier: self.notifier.clone(),
                time_provider: clock,
                probe: None,
            },
            DispatcherConfig {
                max_concurrent_scans: 3,
                mode: RunMode::Drain,
                ..DispatcherConfig::default()
            },
        )
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.dir.path().join("staging")
    }
}
