//! Scanfleet CLI - Command-line client for the scanfleet daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9527";

#[derive(Parser)]
#[command(name = "scanfleet")]
#[command(about = "Scanfleet scan orchestration CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "SCANFLEET_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,
}

/// Target and rule selection shared by scan and schedule commands
#[derive(clap::Args)]
struct Selection {
    /// Rule IDs, comma separated
    #[arg(short, long, value_delimiter = ',')]
    rules: Vec<String>,

    /// Run the scanner's full rule set (overrides --rules)
    #[arg(long)]
    all_rules: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish scans
    #[command(subcommand)]
    Scan(ScanCommand),

    /// Manage deferred batches
    #[command(subcommand)]
    Schedule(ScheduleCommand),

    /// Inspect jobs
    #[command(subcommand)]
    Job(JobCommand),

    /// Inspect batches
    #[command(subcommand)]
    Batch(BatchCommand),

    /// Register or update a scan target
    Target {
        id: String,
        host: String,
    },

    /// Register or update a rule artifact
    Rule {
        id: String,
        name: String,
        /// Object store locator of the rule file
        locator: String,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum ScanCommand {
    /// Fan out one batch across targets
    Batch {
        /// Batch label
        #[arg(short, long)]
        name: Option<String>,

        /// Target IDs, comma separated (default: every registered target)
        #[arg(short, long, value_delimiter = ',')]
        targets: Vec<String>,

        #[command(flatten)]
        selection: Selection,
    },

    /// Scan a single target outside any batch
    Single {
        target_id: String,

        #[command(flatten)]
        selection: Selection,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Defer a batch until a date
    Create {
        /// Trigger date (YYYY-MM-DD)
        date: String,

        #[arg(short, long)]
        name: Option<String>,

        #[arg(short, long, value_delimiter = ',')]
        targets: Vec<String>,

        #[command(flatten)]
        selection: Selection,
    },

    /// List pending schedules
    List,

    /// Delete a schedule before it fires
    Delete { schedule_id: String },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Show one job
    Get { job_id: String },

    /// List recent jobs
    List {
        /// pending, in-progress, completed or failed
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        batch: Option<String>,

        #[arg(short = 'n', long, default_value = "50")]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum BatchCommand {
    /// Show one batch
    Get {
        batch_id: String,

        /// Include the batch's jobs
        #[arg(long)]
        jobs: bool,
    },

    /// List recent batches
    List {
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    method: String,
    params: Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Tabled)]
struct JobRow {
    id: String,
    target: String,
    status: String,
    attempts: String,
    duration_ms: String,
    error: String,
}

impl JobRow {
    fn from_value(job: &Value) -> Self {
        Self {
            id: text(&job["id"]),
            target: text(&job["target"]["host"]),
            status: text(&job["status"]),
            attempts: text(&job["attempts"]),
            duration_ms: text(&job["duration_ms"]),
            error: text(&job["error"]["message"]),
        }
    }
}

#[derive(Tabled)]
struct BatchRow {
    id: String,
    name: String,
    status: String,
    progress: String,
    failed: String,
    duration_ms: String,
}

impl BatchRow {
    fn from_value(batch: &Value) -> Self {
        let completed = set_len(&batch["completed"]);
        let failed = set_len(&batch["failed"]);
        Self {
            id: text(&batch["id"]),
            name: text(&batch["name"]),
            status: text(&batch["status"]),
            progress: format!("{}/{}", completed + failed, text(&batch["total"])),
            failed: failed.to_string(),
            duration_ms: text(&batch["duration_ms"]),
        }
    }
}

#[derive(Tabled)]
struct ScheduleRow {
    id: String,
    name: String,
    trigger_date: String,
    targets: String,
    rules: String,
}

impl ScheduleRow {
    fn from_value(schedule: &Value) -> Self {
        Self {
            id: text(&schedule["id"]),
            name: text(&schedule["name"]),
            trigger_date: text(&schedule["trigger_date"]),
            targets: selection(&schedule["targets"]),
            rules: selection(&schedule["rules"]),
        }
    }
}

/// Display a JSON scalar; null renders as "-"
fn text(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn set_len(value: &Value) -> usize {
    value.as_array().map(Vec::len).unwrap_or(0)
}

/// `"all"` or `{"explicit": [..]}`
fn selection(value: &Value) -> String {
    match value.get("explicit").and_then(Value::as_array) {
        Some(ids) => ids.iter().map(text).collect::<Vec<_>>().join(","),
        None => text(value),
    }
}

fn selection_params(targets: Option<Vec<String>>, selection: &Selection) -> Value {
    let mut params = json!({
        "rule_ids": selection.rules,
        "scan_all": selection.all_rules,
    });
    if let Some(targets) = targets.filter(|t| !t.is_empty()) {
        params["target_ids"] = json!(targets);
    }
    params
}

async fn call_rpc(url: &str, method: &str, params: Value) -> Result<Value> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        method: method.to_string(),
        params,
        id: 1,
    };

    let client = reqwest::Client::new();
    let response: JsonRpcResponse = client
        .post(url)
        .json(&request)
        .send()
        .await
        .context("Failed to connect to daemon")?
        .json()
        .await
        .context("Failed to parse response")?;

    if let Some(error) = response.error {
        anyhow::bail!("RPC error ({}): {}", error.code, error.message);
    }

    response
        .result
        .ok_or_else(|| anyhow::anyhow!("No result in response"))
}

fn print_publish_report(result: &Value) {
    let failed: Vec<String> = result["failed_targets"]
        .as_array()
        .map(|ids| ids.iter().map(text).collect())
        .unwrap_or_default();

    let headline = format!(
        "✓ Batch {} published ({}/{} jobs)",
        text(&result["batch_id"]),
        text(&result["published"]),
        text(&result["total"])
    );
    if failed.is_empty() {
        println!("{}", headline.green().bold());
    } else {
        println!("{}", headline.yellow().bold());
        println!("  {} {}", "Failed targets:".bold(), failed.join(", ").red());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let url = cli.rpc_url.as_str();

    match cli.command {
        Commands::Scan(ScanCommand::Batch {
            name,
            targets,
            selection,
        }) => {
            let mut params = selection_params(Some(targets), &selection);
            if let Some(name) = name {
                params["name"] = json!(name);
            }
            let result = call_rpc(url, "scan.batch.v1", params).await?;
            print_publish_report(&result);
        }

        Commands::Scan(ScanCommand::Single {
            target_id,
            selection,
        }) => {
            let mut params = selection_params(None, &selection);
            params["target_id"] = json!(target_id);
            let result = call_rpc(url, "scan.single.v1", params).await?;
            println!(
                "{}",
                format!("✓ Job {} published", text(&result["job_id"]))
                    .green()
                    .bold()
            );
        }

        Commands::Schedule(ScheduleCommand::Create {
            date,
            name,
            targets,
            selection,
        }) => {
            let mut params = selection_params(Some(targets), &selection);
            params["trigger_date"] = json!(date);
            if let Some(name) = name {
                params["name"] = json!(name);
            }
            let result = call_rpc(url, "schedule.create.v1", params).await?;
            println!(
                "{}",
                format!(
                    "✓ Schedule {} fires on {}",
                    text(&result["schedule_id"]),
                    text(&result["trigger_date"])
                )
                .green()
                .bold()
            );
        }

        Commands::Schedule(ScheduleCommand::List) => {
            let result = call_rpc(url, "schedule.list.v1", json!({})).await?;
            let rows: Vec<ScheduleRow> = result["schedules"]
                .as_array()
                .map(|items| items.iter().map(ScheduleRow::from_value).collect())
                .unwrap_or_default();
            if rows.is_empty() {
                println!("{}", "No pending schedules".yellow());
            } else {
                println!("{}", Table::new(rows));
            }
        }

        Commands::Schedule(ScheduleCommand::Delete { schedule_id }) => {
            call_rpc(url, "schedule.delete.v1", json!({ "schedule_id": schedule_id })).await?;
            println!("{}", format!("✓ Schedule {} deleted", schedule_id).green().bold());
        }

        Commands::Job(JobCommand::Get { job_id }) => {
            let job = call_rpc(url, "job.get.v1", json!({ "job_id": job_id })).await?;
            println!("{}", Table::new(vec![JobRow::from_value(&job)]));

            if let Some(refs) = job["result_refs"].as_array().filter(|r| !r.is_empty()) {
                println!("{}", "Results:".cyan().bold());
                for r in refs {
                    println!("  {}", text(r));
                }
            }
            if !job["error"].is_null() {
                println!("{} {}", "Context:".bold(), text(&job["error"]["context"]));
            }
        }

        Commands::Job(JobCommand::List {
            status,
            batch,
            limit,
        }) => {
            let mut params = json!({ "limit": limit });
            if let Some(status) = status {
                params["status"] = json!(status);
            }
            if let Some(batch) = batch {
                params["batch_id"] = json!(batch);
            }
            let result = call_rpc(url, "job.list.v1", params).await?;
            let rows: Vec<JobRow> = result["jobs"]
                .as_array()
                .map(|items| items.iter().map(JobRow::from_value).collect())
                .unwrap_or_default();
            println!("{}", Table::new(rows));
        }

        Commands::Batch(BatchCommand::Get { batch_id, jobs }) => {
            let result = call_rpc(
                url,
                "batch.get.v1",
                json!({ "batch_id": batch_id, "include_jobs": jobs }),
            )
            .await?;
            println!("{}", Table::new(vec![BatchRow::from_value(&result["batch"])]));

            if let Some(items) = result["jobs"].as_array() {
                let rows: Vec<JobRow> = items.iter().map(JobRow::from_value).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Batch(BatchCommand::List { limit }) => {
            let result = call_rpc(url, "batch.list.v1", json!({ "limit": limit })).await?;
            let rows: Vec<BatchRow> = result["batches"]
                .as_array()
                .map(|items| items.iter().map(BatchRow::from_value).collect())
                .unwrap_or_default();
            println!("{}", Table::new(rows));
        }

        Commands::Target { id, host } => {
            call_rpc(url, "target.upsert.v1", json!({ "id": id, "host": host })).await?;
            println!("{}", format!("✓ Target {} saved", id).green().bold());
        }

        Commands::Rule { id, name, locator } => {
            call_rpc(
                url,
                "rule.upsert.v1",
                json!({ "id": id, "name": name, "locator": locator }),
            )
            .await?;
            println!("{}", format!("✓ Rule {} saved", id).green().bold());
        }

        Commands::Status => {
            println!("{}", "System Status".cyan().bold());
            println!();

            match call_rpc(url, "stats.v1", json!({})).await {
                Ok(stats) => {
                    let jobs = &stats["jobs"];
                    println!("  {} {}", "RPC URL:".bold(), url);
                    println!("  {} {}", "Status:".bold(), "ONLINE".green());
                    println!();
                    println!("  {} {}", "Pending:".bold(), jobs["pending"]);
                    println!("  {} {}", "In progress:".bold(), jobs["in_progress"]);
                    println!("  {} {}", "Completed:".bold(), jobs["completed"]);
                    println!("  {} {}", "Failed:".bold(), jobs["failed"]);
                    println!();
                    println!("  {} {}", "Open batches:".bold(), stats["open_batches"]);
                    println!("  {} {}", "Schedules:".bold(), stats["pending_schedules"]);
                    println!("  {} {} seconds", "Uptime:".bold(), stats["uptime_seconds"]);
                }
                Err(e) => {
                    println!("  {} {}", "Status:".bold(), "ERROR".red());
                    println!("  {} {}", "Error:".bold(), e);
                }
            }
        }
    }

    Ok(())
}
