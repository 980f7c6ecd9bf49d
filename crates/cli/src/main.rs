//! Eventjobs CLI - command-line client for the job daemon

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabled::{Table, Tabled};

const DEFAULT_RPC_URL: &str = "http://127.0.0.1:9527";

#[derive(Parser)]
#[command(name = "eventjobs")]
#[command(about = "Eventjobs job engine CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// RPC server URL
    #[arg(long, env = "EVENTJOBS_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Add {
        /// Job topic (e.g., import/csv)
        topic: String,

        /// Unique job name
        #[arg(short, long)]
        name: Option<String>,

        /// Properties as a JSON object
        #[arg(short, long)]
        properties: Option<String>,
    },

    /// Show one job
    Get {
        job_id: String,
    },

    /// List jobs
    Find {
        /// ALL, ACTIVE, QUEUED, HISTORY, CANCELLED, SUCCEEDED, STOPPED, GIVEN_UP, ERROR, DROPPED
        #[arg(short = 't', long = "type", default_value = "ALL")]
        query_type: String,

        #[arg(long)]
        topic: Option<String>,

        /// Below one means unlimited
        #[arg(short, long, default_value = "100")]
        limit: i64,

        /// Property template as a JSON object; repeat to OR templates
        #[arg(long = "template")]
        templates: Vec<String>,
    },

    /// Remove a job
    Remove {
        job_id: String,

        /// Also remove a running job
        #[arg(long)]
        force: bool,
    },

    /// Stop a running or waiting job
    Stop {
        job_id: String,
    },

    /// Resubmit a finished job
    Retry {
        job_id: String,
    },

    /// Show engine statistics
    Status,

    /// Show live queues
    Queues,

    /// Show the cluster view
    Topology,
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
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize, Tabled)]
struct JobRow {
    job_id: String,
    topic: String,
    state: String,
    #[tabled(display_with = "display_option")]
    queue: Option<String>,
    retry_count: i32,
    #[tabled(display_with = "display_option")]
    target_instance: Option<String>,
}

#[derive(Deserialize, Tabled)]
struct QueueRow {
    name: String,
    queue_type: String,
    running: bool,
    suspended: bool,
    outdated: bool,
    waiting: usize,
    processing: usize,
}

#[derive(Tabled)]
struct InstanceRow {
    instance_id: String,
    topics: String,
}

fn display_option(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "-".to_string())
}

fn parse_object(raw: &str, what: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("Invalid JSON {}", what))?;
    if !value.is_object() {
        anyhow::bail!("{} must be a JSON object", what);
    }
    Ok(value)
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
        match error.data {
            Some(data) => anyhow::bail!("RPC error ({}): {} {}", error.code, error.message, data),
            None => anyhow::bail!("RPC error ({}): {}", error.code, error.message),
        }
    }

    response
        .result
        .ok_or_else(|| anyhow::anyhow!("No result in response"))
}

fn print_jobs(jobs: Vec<JobRow>) {
    if jobs.is_empty() {
        println!("{}", "No jobs".yellow());
    } else {
        println!("{}", Table::new(jobs));
    }
}

fn print_job_detail(job: &Value) {
    println!("{}", serde_json::to_string_pretty(job).unwrap_or_else(|_| job.to_string()));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let url = cli.rpc_url.as_str();

    match cli.command {
        Commands::Add {
            topic,
            name,
            properties,
        } => {
            let properties = properties
                .as_deref()
                .map(|raw| parse_object(raw, "properties"))
                .transpose()?;
            let params = json!({
                "topic": topic,
                "name": name,
                "properties": properties,
            });

            let result = call_rpc(url, "jobs.add.v1", params).await?;
            match result.get("job").filter(|job| !job.is_null()) {
                Some(job) => {
                    println!("{}", "✓ Job added".green().bold());
                    println!();
                    print_jobs(vec![serde_json::from_value(job.clone())?]);
                }
                None => println!("{}", "Job dropped by its queue".yellow()),
            }
        }

        Commands::Get { job_id } => {
            let job = call_rpc(url, "jobs.get.v1", json!({ "job_id": job_id })).await?;
            print_job_detail(&job);
        }

        Commands::Find {
            query_type,
            topic,
            limit,
            templates,
        } => {
            let templates = templates
                .iter()
                .map(|raw| parse_object(raw, "template"))
                .collect::<Result<Vec<_>>>()?;
            let params = json!({
                "query_type": query_type.to_uppercase(),
                "topic": topic,
                "limit": limit,
                "templates": templates,
            });

            let result = call_rpc(url, "jobs.find.v1", params).await?;
            let jobs: Vec<JobRow> = serde_json::from_value(result["jobs"].clone())?;
            print_jobs(jobs);
        }

        Commands::Remove { job_id, force } => {
            let result = call_rpc(
                url,
                "jobs.remove.v1",
                json!({ "job_id": job_id, "force": force }),
            )
            .await?;
            if result["removed"].as_bool().unwrap_or(false) {
                println!("{}", format!("✓ Job {} removed", job_id).green().bold());
            } else {
                println!(
                    "{}",
                    format!("✗ Job {} is running; use --force", job_id).red()
                );
            }
        }

        Commands::Stop { job_id } => {
            call_rpc(url, "jobs.stop.v1", json!({ "job_id": job_id })).await?;
            println!("{}", format!("✓ Stop requested for job {}", job_id).green().bold());
        }

        Commands::Retry { job_id } => {
            let job = call_rpc(url, "jobs.retry.v1", json!({ "job_id": job_id })).await?;
            println!("{}", "✓ Job resubmitted".green().bold());
            println!();
            print_jobs(vec![serde_json::from_value(job)?]);
        }

        Commands::Status => {
            println!("{}", "System Status".cyan().bold());
            println!();

            match call_rpc(url, "admin.stats.v1", json!({})).await {
                Ok(stats) => {
                    let totals = &stats["statistics"];
                    println!("  {} {}", "RPC URL:".bold(), url);
                    println!("  {} {}", "Status:".bold(), "ONLINE".green());
                    println!();
                    println!("  {} {}", "Queued:".bold(), totals["queued_jobs"]);
                    println!("  {} {}", "Active:".bold(), totals["active_jobs"]);
                    println!("  {} {}", "Finished:".bold(), totals["finished_jobs"]);
                    println!("  {} {}", "Failed:".bold(), totals["failed_jobs"]);
                    println!("  {} {}", "Cancelled:".bold(), totals["cancelled_jobs"]);
                    println!();
                    println!(
                        "  {} {} ms",
                        "Avg waiting:".bold(),
                        stats["average_waiting_time_ms"]
                    );
                    println!(
                        "  {} {} ms",
                        "Avg processing:".bold(),
                        stats["average_processing_time_ms"]
                    );
                    println!("  {} {} seconds", "Uptime:".bold(), stats["uptime_seconds"]);
                }
                Err(e) => {
                    println!("  {} {}", "Status:".bold(), "ERROR".red());
                    println!("  {} {}", "Error:".bold(), e);
                }
            }
        }

        Commands::Queues => {
            let result = call_rpc(url, "admin.queues.v1", json!({})).await?;
            let queues: Vec<QueueRow> = serde_json::from_value(result["queues"].clone())?;
            if queues.is_empty() {
                println!("{}", "No live queues".yellow());
            } else {
                println!("{}", Table::new(queues));
            }
        }

        Commands::Topology => {
            let result = call_rpc(url, "admin.topology.v1", json!({})).await?;
            let leader = result["leader"].as_bool().unwrap_or(false);
            let active = result["active"].as_bool().unwrap_or(false);
            println!(
                "  {} {}",
                "Instance:".bold(),
                result["instance_id"].as_str().unwrap_or("?")
            );
            println!(
                "  {} {}",
                "Processing:".bold(),
                if active { "ACTIVE".green() } else { "STOPPED".red() }
            );
            println!("  {} {}", "Leader:".bold(), leader);
            println!();

            let instances: Vec<InstanceRow> = result["instances"]
                .as_object()
                .map(|map| {
                    map.iter()
                        .map(|(id, topics)| InstanceRow {
                            instance_id: id.clone(),
                            topics: serde_json::from_value::<Vec<String>>(topics.clone())
                                .map(|t| t.join(", "))
                                .unwrap_or_default(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            println!("{}", Table::new(instances));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_find() {
        let cli = Cli::try_parse_from([
            "eventjobs",
            "find",
            "--type",
            "queued",
            "--template",
            r#"{"n": 1}"#,
            "--template",
            r#"{">n": 5}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Find {
                query_type,
                limit,
                templates,
                ..
            } => {
                assert_eq!(query_type, "queued");
                assert_eq!(limit, 100);
                assert_eq!(templates.len(), 2);
            }
            _ => panic!("expected find"),
        }
    }

    #[test]
    fn test_parse_object_requires_object() {
        assert!(parse_object(r#"{"a": 1}"#, "properties").is_ok());
        assert!(parse_object("[1]", "properties").is_err());
        assert!(parse_object("not json", "properties").is_err());
    }

    #[test]
    fn test_job_row_from_rpc_payload() {
        let row: JobRow = serde_json::from_value(json!({
            "job_id": "j1",
            "topic": "a/b",
            "name": null,
            "state": "QUEUED",
            "queue": null,
            "target_instance": "local",
            "retry_count": 0,
            "max_retries": 10,
            "created_at": 1,
            "properties": {}
        }))
        .unwrap();
        let table = Table::new(vec![row]).to_string();
        assert!(table.contains("QUEUED"));
        assert!(table.contains("local"));
    }
}
