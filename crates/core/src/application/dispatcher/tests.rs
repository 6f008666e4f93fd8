use super::*;
use crate::application::transport::ReconnectingTransport;
use crate::domain::{Batch, BatchStatus, Target};
use crate::port::job_store::mocks::InMemoryStore;
use crate::port::notifier::mocks::RecordingNotifier;
use crate::port::object_store::mocks::InMemoryObjectStore;
use crate::port::queue::mocks::InMemoryBroker;
use crate::port::rule_stager::mocks::RecordingStager;
use crate::port::scan_executor::mocks::{MockScanExecutor, ScanBehavior};
use crate::port::system_probe::mocks::MockSystemProbe;
use crate::port::time_provider::mocks::ManualClock;

struct Harness {
    broker: Arc<InMemoryBroker>,
    store: Arc<InMemoryStore>,
    stager: Arc<RecordingStager>,
    notifier: Arc<RecordingNotifier>,
    objects: Arc<InMemoryObjectStore>,
    executor: Arc<MockScanExecutor>,
    transport: Arc<ReconnectingTransport>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new(executor: MockScanExecutor) -> Self {
        let broker = InMemoryBroker::new();
        let transport = ReconnectingTransport::connect(Arc::new(Arc::clone(&broker)))
            .await
            .unwrap()
            .with_reconnect_policy(2, Duration::from_millis(1));
        let store = Arc::new(InMemoryStore::new());
        for id in ["cve-1", "cve-2"] {
            store
                .upsert_rule(&Rule {
                    id: id.to_string(),
                    name: id.to_uppercase(),
                    locator: format!("mem://rules/{}.yaml", id),
                })
                .await
                .unwrap();
        }
        Self {
            broker,
            store,
            stager: Arc::new(RecordingStager::new()),
            notifier: Arc::new(RecordingNotifier::new()),
            objects: Arc::new(InMemoryObjectStore::new()),
            executor: Arc::new(executor),
            transport: Arc::new(transport),
            clock: Arc::new(ManualClock::new(1_000)),
        }
    }

    fn dispatcher(&self, config: DispatcherConfig, deadline: Duration) -> Dispatcher {
        self.dispatcher_with_probe(config, deadline, None)
    }

    fn dispatcher_with_probe(
        &self,
        config: DispatcherConfig,
        deadline: Duration,
        probe: Option<Arc<dyn SystemProbe>>,
    ) -> Dispatcher {
        let adapter = ExecutorAdapter::new(
            self.executor.clone(),
            self.objects.clone(),
            self.clock.clone(),
        )
        .with_deadline(deadline)
        .with_termination_grace(Duration::from_millis(50));
        let aggregator = BatchAggregator::new(
            self.store.clone(),
            self.notifier.clone(),
            self.clock.clone(),
        )
        .with_retry(64, Duration::from_millis(1));

        Dispatcher::new(
            DispatcherDeps {
                transport: self.transport.clone(),
                store: self.store.clone(),
                rules: self.store.clone(),
                stager: self.stager.clone(),
                adapter: Arc::new(adapter),
                aggregator: Arc::new(aggregator),
                notifier: self.notifier.clone(),
                time_provider: self.clock.clone(),
                probe,
            },
            config,
        )
    }

    async fn enqueue(&self, job_id: &str, batch_id: Option<&str>, host: &str, rules: RuleSelection) {
        let job = Job::new(
            job_id,
            batch_id.map(str::to_string),
            Target::new(format!("t-{}", job_id), host),
            rules,
            1_000,
        );
        self.store.create_job(&job).await.unwrap();
        self.transport
            .publish(&JobMessage::from_job(&job))
            .await
            .unwrap();
    }

    async fn job(&self, id: &str) -> Job {
        self.store.find_job(id).await.unwrap().unwrap()
    }
}

fn drain_config() -> DispatcherConfig {
    DispatcherConfig {
        mode: RunMode::Drain,
        ..DispatcherConfig::default()
    }
}

fn never_shutdown() -> (ShutdownSender, ShutdownToken) {
    shutdown_channel()
}

#[tokio::test]
async fn test_three_job_batch_end_to_end() {
    let h = Harness::new(
        MockScanExecutor::new(ScanBehavior::Findings(2))
            .with_target("b.example.com", ScanBehavior::FailAfter(0, "connection refused".into())),
    )
    .await;
    h.store
        .create_batch(&Batch::new("batch-1", "nightly", 3, 1_000).unwrap())
        .await
        .unwrap();
    h.enqueue("A", Some("batch-1"), "a.example.com", RuleSelection::All).await;
    h.enqueue("B", Some("batch-1"), "b.example.com", RuleSelection::All).await;
    h.enqueue("C", Some("batch-1"), "c.example.com", RuleSelection::Explicit(vec!["cve-2".into()]))
        .await;

    let (_tx, token) = never_shutdown();
    let summary = h
        .dispatcher(drain_config(), Duration::from_secs(5))
        .run(token)
        .await
        .unwrap();

    assert_eq!(summary.received, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let a = h.job("A").await;
    assert_eq!(a.status, JobStatus::Completed);
    assert_eq!(a.result_refs.len(), 2);
    let b = h.job("B").await;
    assert_eq!(b.status, JobStatus::Failed);
    assert_eq!(b.error.as_ref().unwrap().context, "Target unreachable");

    let batch = h.store.find_batch("batch-1").await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed.len(), 2);
    assert_eq!(batch.failed.len(), 1);
    assert_eq!(h.notifier.batch_finished_count(), 1);

    // C only had its explicit rule staged
    let c_request = h
        .executor
        .requests()
        .into_iter()
        .find(|r| r.job_id == "C")
        .unwrap();
    assert_eq!(c_request.rule_paths.len(), 1);

    assert_eq!(h.broker.acked().len(), 3);
    assert_eq!(h.broker.unacked_len(), 0);
    assert_eq!(h.stager.live(), 0);
    println!("✅ Batch of three settled: 2 completed, 1 failed, notified once");
}

#[tokio::test]
async fn test_malformed_and_unknown_messages_are_dropped() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::Findings(1))).await;
    h.broker.push_raw(&b"{not json"[..]);
    h.broker.push_raw(
        &br#"{"batch_id":"","job_id":"ghost","target_id":"t","target":"x.example.com","scan_all":true}"#[..],
    );

    let (_tx, token) = never_shutdown();
    let summary = h
        .dispatcher(drain_config(), Duration::from_secs(5))
        .run(token)
        .await
        .unwrap();

    assert_eq!(summary.malformed, 2);
    assert_eq!(h.broker.acked().len(), 2);
    assert_eq!(h.executor.call_count(), 0);
    assert_eq!(h.store.job_count(), 0);
}

#[tokio::test]
async fn test_deadline_records_timeout_failure() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::HangAfter(1))).await;
    h.enqueue("slow", None, "slow.example.com", RuleSelection::All).await;

    let (_tx, token) = never_shutdown();
    let summary = h
        .dispatcher(drain_config(), Duration::from_millis(30))
        .run(token)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    let job = h.job("slow").await;
    assert_eq!(job.status, JobStatus::Failed);
    let detail = job.error.unwrap();
    assert!(detail.timed_out);
    assert_eq!(detail.findings_collected, 1);
    assert_eq!(h.broker.acked().len(), 1);
    assert_eq!(h.stager.live(), 0);
}

#[tokio::test]
async fn test_executor_panic_fails_only_that_job() {
    let h = Harness::new(
        MockScanExecutor::new(ScanBehavior::Findings(1))
            .with_target("boom.example.com", ScanBehavior::Panic("scanner exploded".into())),
    )
    .await;
    h.enqueue("bad", None, "boom.example.com", RuleSelection::All).await;
    h.enqueue("good", None, "fine.example.com", RuleSelection::All).await;

    let (_tx, token) = never_shutdown();
    let summary = h
        .dispatcher(drain_config(), Duration::from_secs(5))
        .run(token)
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    let bad = h.job("bad").await;
    let detail = bad.error.unwrap();
    assert_eq!(detail.context, "Scan executor crashed");
    assert!(detail.message.contains("scanner exploded"));
    assert_eq!(h.job("good").await.status, JobStatus::Completed);
    assert_eq!(h.stager.live(), 0);
    println!("✅ Panicking scan isolated");
}

#[tokio::test]
async fn test_missing_rules_fail_the_job() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::Findings(1))).await;
    h.enqueue(
        "j-1",
        None,
        "a.example.com",
        RuleSelection::Explicit(vec!["cve-404".into()]),
    )
    .await;

    let (_tx, token) = never_shutdown();
    h.dispatcher(drain_config(), Duration::from_secs(5))
        .run(token)
        .await
        .unwrap();

    let job = h.job("j-1").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.unwrap().context, "Failed to load rules");
    assert_eq!(h.executor.call_count(), 0);
    assert_eq!(h.broker.acked().len(), 1);
}

#[tokio::test]
async fn test_redelivered_terminal_job_is_not_rerun() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::Findings(1))).await;
    h.store
        .create_batch(&Batch::new("batch-1", "adhoc", 1, 1_000).unwrap())
        .await
        .unwrap();
    h.enqueue("done", Some("batch-1"), "a.example.com", RuleSelection::All).await;
    h.store.set_job_running("done", 1_000).await.unwrap();
    h.store
        .complete_job("done", &["mem://results/done.json".to_string()], 10)
        .await
        .unwrap();

    let (_tx, token) = never_shutdown();
    let summary = h
        .dispatcher(drain_config(), Duration::from_secs(5))
        .run(token)
        .await
        .unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(h.executor.call_count(), 0);
    let batch = h.store.find_batch("batch-1").await.unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(h.broker.acked().len(), 1);
}

#[tokio::test]
async fn test_retry_policy_requeues_until_budget_spent() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::FailAfter(
        0,
        "no route to host".into(),
    )))
    .await;
    h.enqueue("flaky", None, "a.example.com", RuleSelection::All).await;

    let config = DispatcherConfig {
        max_concurrent_scans: 1,
        retry: JobRetryPolicy::enabled(2, 1),
        ..drain_config()
    };
    let (_tx, token) = never_shutdown();
    let summary = h
        .dispatcher(config, Duration::from_secs(5))
        .run(token)
        .await
        .unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(h.executor.call_count(), 2);
    let job = h.job("flaky").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 2);
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_shutdown_requeues_in_flight_job() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::HangAfter(0))).await;
    h.enqueue("long", None, "a.example.com", RuleSelection::All).await;

    let config = DispatcherConfig {
        mode: RunMode::Poll,
        poll_interval: Duration::from_millis(10),
        shutdown_grace: Duration::from_millis(50),
        ..DispatcherConfig::default()
    };
    let dispatcher = h.dispatcher(config, Duration::from_secs(60));
    let (tx, token) = shutdown_channel();

    let executor = h.executor.clone();
    let trigger = tokio::spawn(async move {
        while executor.call_count() == 0 {
            sleep(Duration::from_millis(5)).await;
        }
        tx.shutdown();
    });

    let summary = dispatcher.run(token).await.unwrap();
    trigger.await.unwrap();

    assert_eq!(summary.requeued, 1);
    assert_eq!(h.broker.requeued(), 1);
    assert_eq!(h.broker.ready_len(), 1);
    assert!(h.broker.acked().is_empty());
    assert_eq!(h.job("long").await.status, JobStatus::InProgress);
    assert_eq!(h.stager.live(), 0);
    println!("✅ Interrupted job returned to queue");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_requeues_in_flight_job_across_threads() {
    for round in 0..30 {
        let h = Harness::new(MockScanExecutor::new(ScanBehavior::HangAfter(0))).await;
        h.enqueue("long", Some("b-1"), "a.example.com", RuleSelection::All).await;
        h.store
            .create_batch(&Batch::new("b-1", "nightly", 1, 1_000).unwrap())
            .await
            .unwrap();

        let config = DispatcherConfig {
            mode: RunMode::Poll,
            poll_interval: Duration::from_millis(5),
            shutdown_grace: Duration::from_millis(10),
            ..DispatcherConfig::default()
        };
        let dispatcher = h.dispatcher(config, Duration::from_secs(60));
        let (tx, token) = shutdown_channel();

        let executor = h.executor.clone();
        let trigger = tokio::spawn(async move {
            while executor.call_count() == 0 {
                sleep(Duration::from_millis(1)).await;
            }
            tx.shutdown();
        });

        let summary = dispatcher.run(token).await.unwrap();
        trigger.await.unwrap();

        assert_eq!(summary.requeued, 1, "round {}", round);
        assert_eq!(summary.failed, 0, "round {}", round);
        assert!(h.broker.acked().is_empty(), "round {}", round);
        assert_eq!(h.broker.ready_len(), 1, "round {}", round);
        let job = h.job("long").await;
        assert_eq!(job.status, JobStatus::InProgress, "round {}", round);
        assert!(job.error.is_none(), "round {}", round);
        let batch = h.store.find_batch("b-1").await.unwrap().unwrap();
        assert_eq!(batch.processed(), 0, "round {}", round);
        assert!(h.notifier.sent().is_empty(), "round {}", round);
    }
}

#[tokio::test]
async fn test_unrecordable_outcome_is_requeued() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::Findings(1))).await;
    h.store.fail_terminal_writes(true);
    h.enqueue("j-1", None, "a.example.com", RuleSelection::All).await;

    let config = DispatcherConfig {
        mode: RunMode::Poll,
        max_concurrent_scans: 1,
        ..DispatcherConfig::default()
    };
    let dispatcher = h.dispatcher(config, Duration::from_secs(5));
    let (tx, token) = shutdown_channel();

    let broker = h.broker.clone();
    let trigger = tokio::spawn(async move {
        while broker.requeued() == 0 {
            sleep(Duration::from_millis(10)).await;
        }
        tx.shutdown();
    });

    let summary = tokio::time::timeout(Duration::from_secs(10), dispatcher.run(token))
        .await
        .unwrap()
        .unwrap();
    trigger.await.unwrap();

    assert!(summary.requeued >= 1);
    assert!(h.broker.acked().is_empty());
    assert!(!h.job("j-1").await.status.is_terminal());
}

#[tokio::test]
async fn test_memory_pressure_holds_back_admission() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::Findings(1))).await;
    h.enqueue("j-1", None, "a.example.com", RuleSelection::All).await;

    let probe = Arc::new(MockSystemProbe::new(95));
    let dispatcher = h.dispatcher_with_probe(
        DispatcherConfig {
            mode: RunMode::Poll,
            ..DispatcherConfig::default()
        },
        Duration::from_secs(5),
        Some(probe),
    );
    let (tx, token) = shutdown_channel();
    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        tx.shutdown();
    });

    let summary = dispatcher.run(token).await.unwrap();

    assert_eq!(summary.received, 0);
    assert_eq!(h.broker.ready_len(), 1);
    assert_eq!(h.executor.call_count(), 0);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let h = Harness::new(MockScanExecutor::new(ScanBehavior::Slow(
        Duration::from_millis(20),
        0,
    )))
    .await;
    for i in 0..6 {
        h.enqueue(&format!("j-{}", i), None, "a.example.com", RuleSelection::All)
            .await;
    }

    let config = DispatcherConfig {
        max_concurrent_scans: 2,
        ..drain_config()
    };
    let (_tx, token) = never_shutdown();
    let dispatcher = h.dispatcher(config, Duration::from_secs(5));

    let broker = h.broker.clone();
    let watcher = tokio::spawn(async move {
        let mut peak = 0;
        for _ in 0..40 {
            peak = peak.max(broker.unacked_len());
            sleep(Duration::from_millis(2)).await;
        }
        peak
    });

    let summary = dispatcher.run(token).await.unwrap();
    let peak = watcher.await.unwrap();

    assert_eq!(summary.succeeded, 6);
    assert!(peak <= 2, "peak in-flight {}", peak);
}
