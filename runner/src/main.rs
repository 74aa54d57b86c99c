// Job runner binary entry point
// Spawned once per job run: runs the job command and reports over the back-channel

use anyhow::{Context, Result};
use clap::Parser;
use common::backchannel::BackChannelClient;
use common::executor::launcher::{ENV_BACKCHANNEL_URL, ENV_CORRELATION_ID, ENV_WORKDIR};
use common::executor::RunMetadata;
use common::telemetry;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

const PROGRESS_PREFIX: &str = "##progress[percent=";

#[derive(Debug, Parser)]
#[command(name = "runner", about = "Runs one job run and reports its progress")]
struct Args {
    /// Correlation id of the job run
    #[arg(long, env = ENV_CORRELATION_ID)]
    correlation_id: Uuid,

    /// Base URL of the back-channel
    #[arg(long, env = ENV_BACKCHANNEL_URL)]
    backchannel: String,

    /// Run directory holding metadata.json
    #[arg(long, env = ENV_WORKDIR)]
    workdir: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_logging(&args.log_level, false)?;

    let exit_code = run(args).await?;
    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<i32> {
    let metadata = RunMetadata::load(&args.workdir)
        .await
        .context("Failed to read run metadata")?;
    let client = BackChannelClient::new(&args.backchannel, args.correlation_id)
        .context("Invalid back-channel address")?;

    info!(
        correlation_id = %args.correlation_id,
        job_run_id = metadata.job_run_id,
        unique_name = %metadata.unique_name,
        "Job run starting"
    );
    if let Err(e) = client.started().await {
        warn!(error = %e, "Failed to report start");
    }

    let mut child = shell_command(&metadata.job_type)
        .current_dir(&args.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("Failed to start job command '{}'", metadata.job_type))?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.context("Failed to read job output")? {
            println!("{}", line);
            if let Some(percent) = parse_progress(&line) {
                if let Err(e) = client.progress(percent).await {
                    warn!(error = %e, percent = percent, "Failed to report progress");
                }
            }
        }
    }

    let status = child.wait().await.context("Failed to wait for job command")?;
    let exit_code = status.code().unwrap_or(-1);

    if let Err(e) = client.ended(exit_code).await {
        warn!(error = %e, "Failed to report end");
    }
    info!(exit_code = exit_code, "Job run finished");
    Ok(exit_code)
}

#[cfg(unix)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(not(unix))]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

/// Parse a `##progress[percent=N]` marker line
fn parse_progress(line: &str) -> Option<f64> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let value = rest.strip_suffix(']')?;
    let percent: f64 = value.trim().parse().ok()?;
    percent.is_finite().then_some(percent)
}
