//! keelctl CLI - operational front end for the keelctl resource core
//!
//! - `ping`: liveness of configured databases and caches
//! - `compile`: show the SQL a JSON query descriptor compiles to
//! - `lock run`: run a command while holding a distributed lease
//! - `completions`: shell completion scripts

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keelctl_core::CoreConfig;
use tracing::debug;

mod commands;
mod tracing_setup;

use tracing_setup::TracingConfig;

#[derive(Parser, Debug)]
#[command(
    name = "keelctl",
    author,
    version,
    about = "Resilient database and lease-lock toolkit",
    long_about = "Inspect and exercise the keelctl resource core: check database and cache \
                  connectivity, compile query descriptors to SQL, and run commands under a \
                  distributed lease."
)]
struct Cli {
    /// Config file (default: ~/.keelctl/config.toml)
    #[arg(long, global = true, env = "KEELCTL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    debug: bool,

    /// Log every statement with parameters substituted
    #[arg(long, global = true)]
    debug_sql: bool,

    /// Export traces over OTLP (requires the telemetry feature)
    #[arg(long, global = true)]
    otel: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that databases and caches answer
    Ping(commands::ping::PingArgs),
    /// Compile a JSON query descriptor to SQL
    Compile(commands::compile::CompileArgs),
    /// Distributed lease lock operations
    Lock(commands::lock::LockArgs),
    /// Generate shell completion scripts
    Completions(CompletionsArgs),
}

#[derive(Parser, Debug)]
struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    shell: Shell,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
#[allow(clippy::enum_variant_names)] // PowerShell is a proper noun, not a suffix
enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

fn load_config(path: Option<&Path>, debug_sql: bool) -> Result<CoreConfig> {
    let mut config = CoreConfig::load(path).context("Failed to load configuration")?;
    if debug_sql {
        config.debug_sql = true;
    }
    debug!(
        databases = config.database.len(),
        caches = config.cache.len(),
        "configuration loaded"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    tracing_setup::init(&TracingConfig {
        debug: cli.debug,
        debug_sql: cli.debug_sql,
        otel: cli.otel,
    })
    .ok();

    let code = match cli.command {
        Commands::Ping(args) => {
            let config = load_config(cli.config.as_deref(), cli.debug_sql)?;
            commands::run_ping(args, config).await?
        }
        Commands::Compile(args) => commands::run_compile(args)?,
        Commands::Lock(args) => {
            let config = load_config(cli.config.as_deref(), cli.debug_sql)?;
            commands::run_lock(args, config).await?
        }
        Commands::Completions(args) => run_completions(args),
    };

    tracing_setup::shutdown_otel();
    Ok(code)
}

fn run_completions(args: CompletionsArgs) -> ExitCode {
    use clap::CommandFactory;
    use clap_complete::{generate, Shell as CompletionShell};
    use std::io;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    let shell = match args.shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    };

    generate(shell, &mut cmd, bin_name, &mut io::stdout());
    ExitCode::SUCCESS
}
