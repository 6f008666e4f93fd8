// Panic isolation for scan tasks
use tokio::task::JoinError;
use tracing::error;

/// Describe why a spawned scan task did not return.
///
/// Extracts the panic payload when the task panicked.
pub fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "scan task was cancelled".to_string();
    }

    let payload = err.into_panic();
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    error!(panic_msg = %msg, "Scan task panicked");
    format!("executor panicked: {}", msg)
}
