//! ddnpoll - synchronized performance poller for storage controllers.
//!
//! `run` starts the supervisor, which launches this same binary once per
//! controller with the `worker` subcommand.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use ddnpoll::config::Config;
use ddnpoll::hosts;
use ddnpoll::supervisor::{Supervisor, SupervisorConfig};
use ddnpoll::worker::{PipeLink, Worker};

/// Poll storage controller couplets on a shared clock and store their rates
#[derive(Parser, Debug)]
#[command(name = "ddnpoll")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, default_value = "ddnpoll.toml")]
    config: PathBuf,

    /// Logging verbosity (trace, debug, info, warn, error) or a full filter directive
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervisor and one worker per configured host
    Run,

    /// Poll a single host, driven by wake messages on stdin
    #[command(hide = true)]
    Worker {
        /// Controller host to poll
        #[arg(long)]
        host: String,
    },

    /// Print the expanded host list, from the argument or the config file
    Hosts {
        /// Host expression such as `sfa[1-4][a,b]`
        expression: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout belongs to the wake link in worker processes
    let filter = match EnvFilter::try_new(&cli.log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Error: invalid log level '{}': {}", cli.log_level, e);
            return ExitCode::FAILURE;
        }
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = match &cli.command {
        Command::Run => run(&cli),
        Command::Worker { host } => worker(&cli, host),
        Command::Hosts { expression } => print_hosts(&cli, expression.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let config_path = cli
        .config
        .canonicalize()
        .with_context(|| format!("resolving {}", cli.config.display()))?;
    let settings = SupervisorConfig::from_config(&config, &config_path)?
        .worker_args([
            "--config".into(),
            config_path.into_os_string(),
            "--log-level".into(),
            cli.log_level.clone().into(),
        ]);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        hosts = settings.hosts().len(),
        "starting ddnpoll"
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        let supervisor = Supervisor::start(settings).context("starting workers")?;
        wait_for_shutdown().await?;
        supervisor.stop().await.context("stopping workers")?;
        tracing::info!("ddnpoll stopped");
        Ok(())
    })
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for SIGINT")?;
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        tracing::info!("received Ctrl-C, shutting down");
    }
    Ok(())
}

fn worker(cli: &Cli, host: &str) -> Result<()> {
    let span = tracing::info_span!("worker", host);
    let _entered = span.enter();

    let config = load_config(cli)?;
    let mut worker =
        Worker::connect(host, &config).with_context(|| format!("initializing worker for {host}"))?;
    let mut link = PipeLink::stdio();
    worker.run(&mut link).with_context(|| format!("polling {host}"))?;
    Ok(())
}

fn print_hosts(cli: &Cli, expression: Option<&str>) -> Result<()> {
    let hosts = match expression {
        Some(expression) => hosts::parse_host_list(expression)?,
        None => load_config(cli)?.hosts()?,
    };
    for host in hosts {
        println!("{}", host);
    }
    Ok(())
}
