use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_bridge::accounts::AccountRegistry;
use mail_bridge::channels::{
    ChatChannel, ImapConnector, LettreMailer, MailboxConnector, MatrixChannel, PollScheduler,
};
use mail_bridge::commands::{Dispatcher, RoomQueues};
use mail_bridge::compose::ComposeSessions;
use mail_bridge::config::{BridgeConfig, DataDir, SchedulerConfig};
use mail_bridge::error::ConfigError;
use mail_bridge::notifier::Notifier;
use mail_bridge::pipeline::MailPipeline;
use mail_bridge::store::{Database, LibSqlBackend};

/// Buffered chat events between the sync loop and the dispatcher.
const EVENT_BUFFER: usize = 256;

/// Stderr output filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file under `<data>/logs/`.
fn init_tracing(data: &DataDir) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(data.log_dir()).context("creating log directory")?;
    let file = tracing_appender::rolling::daily(data.log_dir(), "bridge.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("Warning: a rustls crypto provider was already installed");
    }

    let data = DataDir::from_env().context("preparing data directory")?;
    let _log_guard = init_tracing(&data)?;

    eprintln!("📬 Mail Bridge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", data.root().display());

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = data.database_file();
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&db_path).await.unwrap_or_else(
        |e| {
            eprintln!("Error: Failed to open database at {}: {}", db_path.display(), e);
            std::process::exit(1);
        },
    ));

    // ── Config ───────────────────────────────────────────────────────────
    let config = match BridgeConfig::load(&data) {
        Ok(config) => Arc::new(config),
        Err(ConfigError::DefaultWritten(path)) => {
            eprintln!("No config found. A default one was written to {path}");
            eprintln!("   Fill in your Matrix credentials and restart.");
            return Ok(());
        }
        Err(e) => return Err(e).context("loading config"),
    };
    let temp_dir = data.temp_dir();
    std::fs::create_dir_all(&temp_dir).context("creating temp directory")?;

    // ── Matrix ───────────────────────────────────────────────────────────
    let matrix = Arc::new(
        MatrixChannel::login(
            &config.matrix_server,
            &config.matrix_user_id,
            &config.matrix_user_password,
        )
        .await
        .context("logging into Matrix")?,
    );
    let chat: Arc<dyn ChatChannel> = matrix.clone();
    eprintln!("   Matrix: {} on {}", matrix.user_id(), config.matrix_server);

    // ── Bridge core ──────────────────────────────────────────────────────
    let connector: Arc<dyn MailboxConnector> = Arc::new(ImapConnector::default());
    let pipeline = Arc::new(MailPipeline::new(
        Arc::clone(&db),
        Notifier::new(Arc::clone(&chat)),
    ));
    let scheduler = PollScheduler::new(
        Arc::clone(&connector),
        pipeline,
        SchedulerConfig::default(),
    );
    let registry = AccountRegistry::new(
        Arc::clone(&db),
        scheduler.clone(),
        temp_dir.clone(),
        config.default_mail_check_interval,
        config.html_default,
    );
    let compose = ComposeSessions::new(
        Arc::clone(&db),
        Arc::clone(&chat),
        Arc::new(LettreMailer),
        temp_dir,
        config.markdown_enabled_by_default,
    );

    // Sessions from a previous run cannot be continued.
    match compose.discard_all().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(attachments = n, "Discarded leftover compose sessions"),
        Err(e) => tracing::error!(code = 1, error = %e, "Could not discard compose sessions"),
    }

    let pollers = registry.resume_all().await.context("loading inbound accounts")?;
    eprintln!("   Mailboxes: {pollers} polled\n");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&chat),
        connector,
        registry,
        compose,
        Arc::clone(&config),
    ));

    // ── Event loop ───────────────────────────────────────────────────────
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = Arc::clone(&matrix).run(Arc::clone(&db), tx, shutdown_rx);
    let mut queues = RoomQueues::new(dispatcher);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => queues.route(event),
                None => {
                    tracing::warn!("Matrix sync loop ended");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    shutdown_tx.send_replace(true);
    if let Err(e) = sync.await {
        tracing::warn!(error = %e, "Sync task did not finish cleanly");
    }
    queues.drain().await;
    scheduler.shutdown().await;
    Ok(())
}
