use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use std::sync::Arc;

use bridge_server::alerts::{AlertService, AlertSink};
use bridge_server::api::RetryPolicy;
use bridge_server::config::Config;
use bridge_server::github::GitHubClient;
use bridge_server::graph::GraphClient;
use bridge_server::retry_queue::RetryProcessor;
use bridge_server::store::Store;
use bridge_server::subscription::{SubscriptionManager, SubscriptionState};

/// Operational tasks for the GitHub issue email bridge, meant to be run
/// from cron or a systemd timer.
#[derive(Parser, Debug)]
#[command(name = "bridge")]
#[command(about = "GitHub issue email bridge maintenance tasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one pass over the durable retry queue
    RetryWorker(RetryWorkerArgs),
    /// Create, renew, or report the Graph mailbox subscription
    Subscription(SubscriptionArgs),
}

#[derive(Parser, Debug)]
struct RetryWorkerArgs {
    /// Max number of jobs to process in this pass (default: configured batch size)
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Parser, Debug)]
struct SubscriptionArgs {
    /// ensure = create/renew as needed; status = report and exit non-zero when not healthy
    #[arg(long, default_value = "ensure", value_parser = ["ensure", "status"])]
    mode: String,
}

fn graph_client(config: &Config) -> GraphClient {
    GraphClient::new(
        config.graph_tenant_id.clone(),
        config.graph_client_id.clone(),
        config.graph_client_secret.clone(),
        RetryPolicy::new(
            config.api_retry_max_attempts,
            config.api_retry_base_delay_seconds,
            config.api_retry_max_delay_seconds,
        ),
    )
}

/// Exits 0 on a clean pass, 2 when anything was dead-lettered.
async fn run_retry_worker(args: RetryWorkerArgs) -> Result<ExitCode> {
    let config = Config::from_env()?;
    let store = Arc::new(Store::new(&config.database_path)?);

    let graph = Arc::new(graph_client(&config));
    let github = Arc::new(GitHubClient::new(
        config.github_token.clone(),
        RetryPolicy::new(
            config.api_retry_max_attempts,
            config.api_retry_base_delay_seconds,
            config.api_retry_max_delay_seconds,
        ),
    ));
    let alerts: Arc<dyn AlertSink> = Arc::new(AlertService::new(&config, graph.clone()));

    let processor = RetryProcessor::new(
        config.retry_queue_base_delay_seconds,
        config.retry_queue_max_delay_seconds,
        config.retry_worker_batch_size,
        store,
        graph,
        github,
        alerts,
    );

    let summary = processor.process_due_jobs(args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.dead_letter > 0 {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

/// `status` exits 1 when the subscription is not healthy so a timer unit
/// can surface the failure.
async fn run_subscription(args: SubscriptionArgs) -> Result<ExitCode> {
    let config = Config::from_env()?;
    let manager = SubscriptionManager::new(&config, Arc::new(graph_client(&config)));

    let report = match args.mode.as_str() {
        "status" => manager.status().await?,
        _ => manager.ensure().await?,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if args.mode == "status" && report.state != SubscriptionState::Healthy {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::INFO)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::RetryWorker(args) => run_retry_worker(args).await,
        Commands::Subscription(args) => run_subscription(args).await,
    }
}
