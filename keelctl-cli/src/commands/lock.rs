//! `keelctl lock`: run a command while holding a lease.

use std::process::{ExitCode, ExitStatus};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use keelctl_core::CoreConfig;
use keelctl_lock::{Acquired, Caches};
use tracing::{info, warn};

/// Exit code when another owner holds the lock.
const EXIT_CONTENDED: u8 = 75;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
pub struct LockArgs {
    #[command(subcommand)]
    pub command: LockCommands,
}

#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Run a command under a lease; exits 75 if the lock is held elsewhere
    Run(RunArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Lock key (the configured key prefix is prepended)
    key: String,

    /// Lease TTL in milliseconds (clamped to 5000..=600000)
    #[arg(long, value_name = "MS")]
    ttl_ms: Option<u64>,

    /// Do not renew the lease while the command runs
    #[arg(long)]
    no_renew: bool,

    /// Command to run; a single argument is split like a shell would
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

pub async fn run_lock(args: LockArgs, config: CoreConfig) -> Result<ExitCode> {
    match args.command {
        LockCommands::Run(run) => run_under_lease(run, config).await,
    }
}

fn command_argv(command: &[String]) -> Result<Vec<String>> {
    let argv = match command {
        [single] => shlex::split(single).ok_or_else(|| anyhow!("Unbalanced quotes in command"))?,
        many => many.to_vec(),
    };
    if argv.is_empty() {
        return Err(anyhow!("No command given"));
    }
    Ok(argv)
}

fn exit_code(status: ExitStatus) -> ExitCode {
    status
        .code()
        .and_then(|c| u8::try_from(c).ok())
        .map(ExitCode::from)
        .unwrap_or(ExitCode::FAILURE)
}

async fn run_under_lease(args: RunArgs, config: CoreConfig) -> Result<ExitCode> {
    let argv = command_argv(&args.command)?;
    let caches = Caches::new(config);
    let lock = caches
        .lease_lock()
        .await
        .context("Failed to connect to the lock cache")?;

    let mut options = lock.defaults().clone();
    if let Some(ms) = args.ttl_ms {
        options = options.ttl(Duration::from_millis(ms));
    }
    if args.no_renew {
        options = options.auto_renew(false);
    }

    let run = lock.safe_run(&args.key, &options, |lease| async move {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| anyhow!("No command given"))?;
        info!(key = %lease.store_key(), program = %program, "running under lease");
        let status = tokio::process::Command::new(program)
            .args(rest)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", program))?;
        if lease.is_lost() {
            warn!(key = %lease.store_key(), "lease was lost while the command ran");
        }
        Ok::<_, anyhow::Error>(status)
    });

    tokio::select! {
        outcome = run => match outcome? {
            Acquired::Ran(status) => Ok(exit_code(status)),
            Acquired::NotAcquired => {
                eprintln!("lock '{}' is held by another owner", args.key);
                Ok(ExitCode::from(EXIT_CONTENDED))
            }
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, releasing leases");
            let released = lock.shutdown().await;
            info!(released, "shutdown complete");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
    }
}
