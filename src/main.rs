use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::net::SocketAddr;

use runwatch::core::{JobSnapshot, Orchestrator};
use runwatch::rpc::RpcClient;
use runwatch::{config::AppConfig, context::AppContext, logging};

#[derive(Parser)]
#[command(name = "runwatch")]
#[command(about = "Tracks remote playbook runs and their per-host progress", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Daemon RPC address (defaults to the configured rpc_bind)
    #[arg(long, global = true)]
    rpc: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tracking daemon
    Daemon(DaemonArgs),
    /// Show daemon health
    Status,
    /// List tracked jobs
    Jobs,
    /// Start a playbook run
    Run(RunArgs),
    /// Request cancellation of a job
    Cancel { id: String },
    /// Print a job's combined output
    Output {
        id: String,
        /// Stop polling the job afterwards
        #[arg(long)]
        collapse: bool,
    },
    /// Remove a job's card
    Dismiss { id: String },
    /// Forget all tracked jobs
    Clear,
}

#[derive(Args, Serialize)]
struct DaemonArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    service_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    rpc_bind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    data_directory: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    auto_poll: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    json_logs: Option<bool>,
}

#[derive(Args)]
struct RunArgs {
    playbook: String,

    /// Target host; repeat for several
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,

    /// Start one per-host run for each target after the master run
    #[arg(long)]
    fan_out: bool,

    /// Extra variable as key=value; values are parsed as JSON when possible
    #[arg(long = "var")]
    vars: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Daemon(args) => AppConfig::new(Some(args))?,
        _ => AppConfig::new(None::<&DaemonArgs>)?,
    };

    let command = match cli.command {
        Commands::Daemon(_) => {
            logging::init(logging::LogConfig::from(&config));
            let ctx = AppContext::new(config).context("Failed to build execution service client")?;
            return Orchestrator::new(ctx)
                .start()
                .await
                .context("Daemon exited with an error");
        }
        command => command,
    };

    let addr = match cli.rpc {
        Some(addr) => addr,
        None => config
            .rpc_bind
            .parse()
            .with_context(|| format!("Invalid rpc_bind address: {}", config.rpc_bind))?,
    };
    run_command(command, &RpcClient::new(addr)).await
}

async fn run_command(command: Commands, client: &RpcClient) -> Result<()> {
    match command {
        Commands::Daemon(_) => bail!("daemon is not a client command"),
        Commands::Status => {
            let status: Value = client.call("daemon.status", None).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Jobs => {
            let jobs: Vec<JobSnapshot> = client.call("jobs.list", None).await?;
            if jobs.is_empty() {
                println!("No tracked jobs");
            }
            for job in &jobs {
                print_job(job);
            }
        }
        Commands::Run(args) => {
            let params = json!({
                "playbook": args.playbook,
                "hosts": args.hosts,
                "extra_vars": parse_vars(&args.vars)?,
                "fan_out": args.fan_out,
            });
            let job: JobSnapshot = client.call("jobs.start", Some(params)).await?;
            print_job(&job);
        }
        Commands::Cancel { id } => {
            let _: Value = client.call("jobs.cancel", Some(json!({ "id": id }))).await?;
            println!("Cancel requested for {id}");
        }
        Commands::Output { id, collapse } => {
            let job: JobSnapshot = client.call("output.expand", Some(json!({ "id": id }))).await?;
            print_job(&job);
            match &job.combined_output {
                Some(output) => println!("{output}"),
                None => println!("(no output yet)"),
            }
            if collapse {
                let _: Value = client.call("output.collapse", Some(json!({ "id": id }))).await?;
            }
        }
        Commands::Dismiss { id } => {
            let _: Value = client.call("jobs.dismiss", Some(json!({ "id": id }))).await?;
            println!("Dismissed {id}");
        }
        Commands::Clear => {
            let _: Value = client.call("jobs.clear", None).await?;
            println!("Cleared all tracked jobs");
        }
    }
    Ok(())
}

fn parse_vars(vars: &[String]) -> Result<Map<String, Value>> {
    let mut map = Map::new();
    for var in vars {
        let Some((key, raw)) = var.split_once('=') else {
            bail!("--var expects key=value, got {var:?}");
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn print_job(job: &JobSnapshot) {
    println!(
        "{:<38} {:<10} {:>3}%  {} [{}]",
        job.id,
        job.status,
        job.progress,
        job.label,
        job.targets.join(", ")
    );
    for child in &job.children {
        println!(
            "  └ {:<34} {:<10} {:>3}%  {}",
            child.id, child.status, child.progress, child.target
        );
    }
}
