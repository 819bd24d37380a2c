use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::Parser;
use inferlane_config::{ConfigSource, InferlaneConfig};
use inferlane_core::{
    ChangeCoalescer, ExecutionContext, IgnoreRules, Priority, RequestEventPayload, RequestId,
    Scheduler, SubmitOptions, WorkUnit,
};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the newline-separated changed paths.
const CHANGED_PATHS_ENV: &str = "INFERLANE_CHANGED_PATHS";

#[derive(Parser, Debug)]
#[command(
    name = "inferlane-watch",
    about = "Re-run a command whenever a directory settles after changes"
)]
struct Cli {
    /// Directory to watch recursively
    root: PathBuf,
    /// Shell command run once per coalesced batch of changes
    #[arg(long, short = 'c')]
    command: String,
    /// Config file (TOML or JSON); otherwise the environment and default files are used
    #[arg(long)]
    config: Option<PathBuf>,
    /// Quiet period before a batch is flushed, e.g. "500ms" or "2s"
    #[arg(long, value_parser = humantime::parse_duration)]
    debounce: Option<Duration>,
    /// Deadline for each command run, e.g. "90s" or "5m"
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    /// Extra ignore patterns (`*.ext`, `*suffix`, `dir/sub`, or a bare name)
    #[arg(long = "ignore")]
    ignore: Vec<String>,
    /// Category attached to every submitted run
    #[arg(long, default_value = "reindex")]
    category: String,
}

/// One run of the user command for a batch of changed paths.
#[derive(Debug)]
struct ShellJob {
    command: Arc<str>,
    root: PathBuf,
    paths: Vec<PathBuf>,
}

#[async_trait]
impl WorkUnit for ShellJob {
    async fn execute(&self, ctx: ExecutionContext) -> Result<()> {
        let changed = self
            .paths
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(self.command.as_ref())
            .current_dir(&self.root)
            .env(CHANGED_PATHS_ENV, changed)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.command))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for command")?;
                if !status.success() {
                    bail!("`{}` exited with {status}", self.command);
                }
                Ok(())
            }
            _ = ctx.cancelled() => {
                info!(request = %ctx.request_id(), "run superseded or cancelled; killing command");
                if let Err(err) = child.kill().await {
                    warn!(error = %err, "failed to kill command");
                }
                Ok(())
            }
        }
    }
}

fn load_config(cli: &Cli) -> Result<InferlaneConfig> {
    let (mut config, source) = match &cli.config {
        Some(path) => (
            InferlaneConfig::load_from_file(path)?,
            ConfigSource::File(path.clone()),
        ),
        None => InferlaneConfig::load_from_env()?,
    };

    match &source {
        ConfigSource::Default => info!("using default configuration"),
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration loaded from file")
        }
        ConfigSource::EnvInline => info!("configuration loaded from inline environment json"),
    }

    if let Some(debounce) = cli.debounce {
        config.watch.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
    }
    if let Some(timeout) = cli.timeout {
        config.scheduler.processor.request_timeout_ms =
            u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }
    if !cli.ignore.is_empty() {
        let extra = IgnoreRules::from_patterns(&cli.ignore);
        let rules = &mut config.watch.ignore;
        rules.names.extend(extra.names);
        rules.extensions.extend(extra.extensions);
        rules.suffixes.extend(extra.suffixes);
        rules.paths.extend(extra.paths);
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,inferlane::queue=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("cannot watch {}", cli.root.display()))?;

    let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
    let coalescer = ChangeCoalescer::new(config.watch.clone());

    let mut events = scheduler.subscribe();
    let event_log = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let id = event
                .request_id
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            match event.payload {
                RequestEventPayload::Completed { latency_ms } => {
                    info!(request = %id, latency_ms, "command finished")
                }
                RequestEventPayload::Failed { latency_ms, error } => {
                    warn!(request = %id, latency_ms, %error, "command failed")
                }
                RequestEventPayload::ConcurrencyAdjusted { from, to, .. } => {
                    info!(from, to, "concurrency adjusted")
                }
                _ => {}
            }
        }
    });

    let command: Arc<str> = Arc::from(cli.command.as_str());
    let previous: Arc<Mutex<Option<RequestId>>> = Arc::default();
    {
        let scheduler = Arc::clone(&scheduler);
        let root = root.clone();
        let category = cli.category.clone();
        coalescer.on_change(move |paths| {
            let mut previous = previous.lock().unwrap_or_else(PoisonError::into_inner);
            let job = ShellJob {
                command: Arc::clone(&command),
                root: root.clone(),
                paths: paths.to_vec(),
            };
            let options = SubmitOptions::new()
                .priority(Priority::LOW)
                .category(category.clone())
                .supersedes(previous.take())
                .metadata("paths", paths.len());
            match scheduler.submit(job, options) {
                Ok(id) => {
                    info!(request = %id, paths = paths.len(), "changes settled; command queued");
                    *previous = Some(id);
                }
                Err(err) => warn!(error = %err, "could not queue command"),
            }
        });
    }

    coalescer.start_watching(&root)?;
    info!(root = %root.display(), command = %cli.command, "waiting for changes (Ctrl-C to exit)");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutting down");

    coalescer.stop().await;
    scheduler.stop().await;
    event_log.abort();

    let status = scheduler.status();
    info!(
        processed = status.processed,
        errors = status.errors,
        avg_latency_ms = status.avg_latency.as_millis() as u64,
        "final status"
    );
    Ok(())
}
