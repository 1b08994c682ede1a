use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use miette::{miette, Context, IntoDiagnostic, Result};
use smtp_filter::audit::{AuditLog, FsAuditLog};
use smtp_filter::config::{Cfg, CfgLog, LogFormat};
use smtp_filter::provider::RuleProvider;
use smtp_filter::rules::{SNIPPET_LEN, VERBOSE_SNIPPET_LEN};
use smtp_filter::server::{drain, Server};
use smtp_filter::session::SessionContext;
use smtp_filter::{daemon, replay};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "smtp-filter", version, about = "Pre-queue SMTP content filter")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "/etc/smtp-filter/config.toml")]
    config: Utf8PathBuf,

    /// Stay in the foreground instead of daemonizing
    #[arg(short = 'd', long)]
    foreground: bool,

    /// Log longer excerpts of matched text
    #[arg(short, long)]
    verbose: bool,

    /// Decode and classify a captured message, then exit
    #[arg(short, long, value_name = "FILE")]
    file: Option<Utf8PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Fail on the terminal, not after detaching from it.
    let cfg = Cfg::load(&cli.config)?;

    if cli.file.is_none() && !cli.foreground {
        daemon::daemonize().wrap_err("daemonizing")?;
    }

    setup_logging(&cfg.log)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?
        .block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let provider = Arc::new(RuleProvider::load(&cli.config).await?);
    let audit: Arc<dyn AuditLog> = Arc::new(FsAuditLog::new(&provider.config().audit.dir));
    let snippet_len = if cli.verbose {
        VERBOSE_SNIPPET_LEN
    } else {
        SNIPPET_LEN
    };

    if let Some(file) = &cli.file {
        let snapshot = provider.snapshot();
        let verdict = replay::replay_file(file, &snapshot, audit.as_ref(), snippet_len).await?;
        println!("{}", verdict);
        return Ok(());
    }

    info!("smtp-filter {} started", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let ctx = Arc::new(SessionContext {
        provider: provider.clone(),
        audit,
        snippet_len,
    });
    let server = Server::bind(ctx).await?;
    let sessions = server.sessions();

    let watcher = {
        let provider = provider.clone();
        let cancel = cancel.clone();
        let interval = provider.config().reload_interval();
        tokio::spawn(async move { provider.watch(interval, cancel).await })
    };
    let listener = tokio::spawn(server.run(cancel.clone()));

    shutdown_signal().await?;
    info!("shutdown requested");
    cancel.cancel();

    listener.await.into_diagnostic()?;
    watcher.await.into_diagnostic()?;
    drain(&sessions, SHUTDOWN_GRACE).await;

    info!("smtp-filter terminated");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).into_diagnostic()?;
    let mut interrupt = signal(SignalKind::interrupt()).into_diagnostic()?;
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.into_diagnostic()
}

/// Stdout in the configured format, plus an optional plain log file.
/// `RUST_LOG` takes precedence over the configured level.
fn setup_logging(log: &CfgLog) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let (plain, json) = match log.format {
        LogFormat::Fmt => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    let file = match &log.file {
        Some(path) => {
            let path = Utf8Path::new(path);
            let (dir, name) = match (path.parent(), path.file_name()) {
                (Some(dir), Some(name)) => (dir, name),
                _ => return Err(miette!("invalid log file path {}", path)),
            };
            std::fs::create_dir_all(dir)
                .into_diagnostic()
                .wrap_err_with(|| format!("creating log directory {}", dir))?;
            let appender = tracing_appender::rolling::never(dir, name);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(plain)
        .with(json)
        .with(file)
        .try_init()
        .into_diagnostic()
}
