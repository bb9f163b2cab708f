//! Reconciler daemon
//!
//! Main entry point for `reconcilerd`.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use reconciler::config::{validate_config_result, DaemonConfig};
use reconciler::daemon::{Collaborators, EventLoop, NoopImagePoller};
use reconciler::git::{GitCredentials, GitMirror};
use reconciler::server::ControlServer;
use reconciler::sync::{LogApplier, TagSync};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Reconciler - keep a cluster in sync with a git repository
#[derive(Parser, Debug)]
#[command(name = "reconcilerd")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/reconciler/config.yaml)
    #[arg(short, long, env = "RECONCILER_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// Write a configuration file for a repository
    Init {
        /// Clone URL of the configuration repository
        url: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration and exit
    Check,
}

/// Flags that take precedence over the config file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Clone URL of the configuration repository
    #[arg(long, env = "RECONCILER_GIT_URL", global = true)]
    git_url: Option<String>,

    /// Branch holding the desired state
    #[arg(long, env = "RECONCILER_GIT_BRANCH", global = true)]
    git_branch: Option<String>,

    /// Tag marking the last synced revision
    #[arg(long, env = "RECONCILER_SYNC_TAG", global = true)]
    sync_tag: Option<String>,

    /// Local directory for the mirror
    #[arg(long, env = "RECONCILER_MIRROR_PATH", global = true)]
    mirror_path: Option<PathBuf>,

    /// Seconds between periodic syncs
    #[arg(long, env = "RECONCILER_SYNC_INTERVAL", global = true)]
    sync_interval: Option<u64>,

    /// Seconds between image polls
    #[arg(long, env = "RECONCILER_POLL_INTERVAL", global = true)]
    poll_interval: Option<u64>,

    /// Only sync commits with valid signatures
    #[arg(long, env = "RECONCILER_VERIFY_SIGNATURES", global = true)]
    verify_signatures: bool,

    /// GPG key used to sign the sync tag
    #[arg(long, env = "RECONCILER_SIGNING_KEY", global = true)]
    signing_key: Option<String>,

    /// Address for the HTTP control surface
    #[arg(long, env = "RECONCILER_LISTEN", global = true)]
    listen: Option<String>,
}

impl Overrides {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(ref url) = self.git_url {
            config.git.url = url.clone();
        }
        if let Some(ref branch) = self.git_branch {
            config.git.branch = branch.clone();
        }
        if let Some(ref tag) = self.sync_tag {
            config.git.sync_tag = tag.clone();
        }
        if let Some(ref path) = self.mirror_path {
            config.git.path = path.clone();
        }
        if let Some(secs) = self.sync_interval {
            config.event_loop.sync_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.poll_interval {
            config.event_loop.poll_interval = Duration::from_secs(secs);
        }
        if self.verify_signatures {
            config.git.verify_signatures = true;
        }
        if let Some(ref key) = self.signing_key {
            config.git.signing_key = Some(key.clone());
        }
        if let Some(ref listen) = self.listen {
            config.server.listen = listen.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = reconciler::logging::init(reconciler::logging::DEFAULT_FILTER) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { ref url, force }) => init_config(&cli, url, force),
        Some(Commands::Check) => {
            let config = load_config(&cli)?;
            validate_config_result(&config)?;
            println!("Configuration OK: {}", config.git.url);
            Ok(())
        }
        Some(Commands::Run) | None => {
            let config = load_config(&cli)?;
            validate_config_result(&config)?;
            run(config).await
        }
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(DaemonConfig::default_path)
}

fn init_config(cli: &Cli, url: &str, force: bool) -> anyhow::Result<()> {
    let path = config_path(cli);
    if path.exists() && !force {
        bail!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = DaemonConfig::new(url);
    cli.overrides.apply(&mut config);
    validate_config_result(&config)?;
    config.save(&path)?;

    println!("Wrote {}", path.display());
    Ok(())
}

/// Load the config file, or build one from flags when there is none
fn load_config(cli: &Cli) -> anyhow::Result<DaemonConfig> {
    let path = config_path(cli);

    let mut config = if path.exists() {
        DaemonConfig::load(&path)?
    } else if let Some(ref url) = cli.overrides.git_url {
        tracing::info!(path = %path.display(), "No config file; using flags and defaults");
        DaemonConfig::new(url.clone())
    } else {
        bail!(
            "No configuration found at {}. Run 'reconcilerd init <url>' or pass --git-url.",
            path.display()
        );
    };

    cli.overrides.apply(&mut config);
    Ok(config)
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let (mirror, refreshed) = GitMirror::new(&config.git, GitCredentials::from_env());
    let refresher = mirror.spawn_refresh_loop(config.git.refresh_interval);

    // Applying manifests to a cluster is not wired in yet; syncs only log
    let syncer = TagSync::new(
        config.git.sync_tag.clone(),
        Arc::new(mirror.clone()),
        Arc::new(LogApplier),
    );

    let (_job_queue, ready) = jobs::queue();
    let event_loop = EventLoop::new(
        config.event_loop.clone(),
        config.git.clone(),
        Collaborators {
            repo: Arc::new(mirror),
            refreshed,
            syncer: Arc::new(syncer),
            poller: Arc::new(NoopImagePoller),
            jobs: ready,
        },
    );

    let server = ControlServer::new(event_loop.handle());
    let listen = config.server.listen.clone();
    let (server_stop_tx, server_stop_rx) = oneshot::channel::<()>();
    let mut server_task = tokio::spawn(async move {
        server
            .run(&listen, async {
                let _ = server_stop_rx.await;
            })
            .await
    });

    let (stop_tx, stop_rx) = oneshot::channel();
    let loop_task = tokio::spawn(event_loop.run(stop_rx));

    tracing::info!(
        url = %config.git.url,
        branch = %config.git.branch,
        listen = %config.server.listen,
        "Reconciler started"
    );

    let server_result = tokio::select! {
        res = shutdown_signal() => {
            res?;
            None
        }
        res = &mut server_task => Some(res),
    };

    tracing::info!("Shutting down");
    let _ = stop_tx.send(());
    loop_task.await.context("Event loop task failed")?;
    refresher.abort();

    match server_result {
        Some(res) => {
            res.context("Control server task failed")??;
            bail!("Control server exited unexpectedly");
        }
        None => {
            let _ = server_stop_tx.send(());
            server_task.await.context("Control server task failed")??;
        }
    }

    tracing::info!("Reconciler stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT
#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for Ctrl-C
#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Received Ctrl-C");
    Ok(())
}
