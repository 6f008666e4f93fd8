// Scanfleet Infrastructure - System Adapters
// Implements: ScanExecutor, ObjectStore, RuleStager, Notifier, SystemProbe

pub mod object_store;
pub mod rule_stager;
pub mod scan_executor;
pub mod system_probe_impl;
pub mod webhook_notifier;

pub use object_store::FsObjectStore;
pub use rule_stager::FsRuleStager;
pub use scan_executor::{CommandScanExecutor, DEFAULT_ENV_ALLOWLIST};
pub use system_probe_impl::SystemProbeImpl;
pub use webhook_notifier::WebhookNotifier;
