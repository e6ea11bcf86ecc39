use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use framegate::config::GateConfig;
use framegate::gate::{Gate, GateSnapshot, Mode};

/// Inspect and operate a configured gate.
#[derive(Debug, Parser)]
#[command(name = "framegate", version, about)]
struct Cli {
    /// Gate configuration file (YAML)
    #[arg(short, long, env = "FRAMEGATE_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the frames and the window sum
    Status,
    /// Add to the current frame
    Hit {
        #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
        amount: i64,
        /// Wait for capacity instead of failing
        #[arg(short, long)]
        wait: bool,
        /// Give up waiting after this many milliseconds
        #[arg(long, requires = "wait")]
        timeout_ms: Option<u64>,
    },
    /// Fail if a limit has been reached
    Check,
    /// Reset every frame to zero
    Clear,
    /// Write the gate state to a file
    Snapshot {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Replace the gate state from a snapshot file
    Restore {
        #[arg(short, long)]
        from: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    let config = GateConfig::from_file(&cli.config)?;
    info!(gate = %config.name, config = %cli.config.display(), "Configuration loaded");
    let gate = Gate::from_config(&config).await?;

    match cli.command {
        Command::Status => {
            let frames = gate.state().await?;
            let sum: i64 = frames.iter().map(|f| f.value).sum();
            println!(
                "{} ({} backend) sum={} frame_limit={} window_limit={}",
                gate.name(),
                gate.backend_kind(),
                sum,
                gate.limits().frame,
                gate.limits().window
            );
            for frame in frames {
                println!("{}  {}", frame.bucket_start.to_rfc3339(), frame.value);
            }
        }
        Command::Hit {
            amount,
            wait,
            timeout_ms,
        } => {
            let admission = match (wait, timeout_ms) {
                (true, Some(ms)) => gate.acquire_timeout(amount, Duration::from_millis(ms)).await?,
                (true, None) => gate.attempt(amount, Mode::Block).await?,
                (false, _) => gate.attempt(amount, Mode::FailFast).await?,
            };
            println!(
                "admitted frame={} window={}",
                admission.frame_value, admission.window_sum
            );
        }
        Command::Check => {
            let admission = gate.check_limits().await?;
            println!(
                "ok frame={} window={}",
                admission.frame_value, admission.window_sum
            );
        }
        Command::Clear => {
            gate.clear().await?;
            println!("cleared {}", gate.name());
        }
        Command::Snapshot { out } => {
            gate.snapshot().await?.to_file(&out)?;
            println!("wrote {}", out.display());
        }
        Command::Restore { from } => {
            let snapshot = GateSnapshot::from_file(&from)?;
            gate.restore(&snapshot).await?;
            println!("restored {} from {}", gate.name(), from.display());
        }
    }

    Ok(())
}
