//! Gateway service entry point.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Args;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{
    Layout,
    config::{ConfigProvider, FileConfig},
    daemon::logging::LogSink,
    gateway::{GatewayState, RequestHandler, TranslationClient},
    paths::resolve_root,
    web::http::{self, HttpState, ShutdownReason},
};

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Address to listen on; defaults to 127.0.0.1 and the configured port.
    #[arg(long, value_name = "ADDR", conflicts_with = "port")]
    pub bind: Option<SocketAddr>,
    /// Port to listen on, overriding the configured one.
    #[arg(long)]
    pub port: Option<u16>,
    /// Start with an empty status log instead of appending to it.
    #[arg(long)]
    pub fresh_log: bool,
}

pub async fn run(root: Option<PathBuf>, args: ServeArgs) -> Result<()> {
    let layout = Layout::new(resolve_root(root)?);
    layout.ensure()?;
    let _tracing_guard = init_tracing(&layout)?;
    debug!(root = %layout.root().display(), "resolved workspace root");

    if let Err(err) = run_impl(layout, &args).await {
        error!(error = ?err, "gateway terminated with error");
        return Err(err);
    }
    info!("gateway exited cleanly");
    Ok(())
}

async fn run_impl(layout: Layout, args: &ServeArgs) -> Result<()> {
    if layout.write_default_settings()? {
        info!(path = %layout.config_path().display(), "wrote default gateway settings");
    }
    let config = Arc::new(FileConfig::load(layout.config_path())?);
    let settings = config.snapshot();

    let (log, log_writer) = LogSink::spawn_file(layout.status_log_path(), args.fresh_log).await?;

    let state = Arc::new(GatewayState::new());
    if let Some(path) = settings.active_glossary_path() {
        match state.glossary.load(path) {
            Ok(count) => log.info(format!("Glossary loaded: {count} terms from {}", path.display())),
            Err(err) => log.warn(format!("Failed to load glossary: {err}")),
        }
        match state.rewrite.load_beside(path) {
            Ok(()) => {
                let (pre, post) = state.rewrite.counts();
                log.info(format!("Rewrite rules loaded: {pre} pre, {post} post"));
            }
            Err(err) => log.warn(format!("Failed to load rewrite rules: {err}")),
        }
        state.note_glossary_mode(true);
    }

    let handler =
        RequestHandler::new(config.clone(), state.clone(), TranslationClient::new(), log.clone());
    let addr = args.bind.unwrap_or_else(|| {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), args.port.unwrap_or(settings.port))
    });
    let server = http::spawn_http_server(HttpState::new(handler), addr)
        .await
        .with_context(|| format!("failed to start gateway on {addr}"))?;

    log.info(format!("Server started at http://{}/", server.addr()));
    info!(
        addr = %server.addr(),
        model = %settings.model,
        retry = ?settings.retry.mode,
        glossary = settings.glossary_enabled,
        "gateway ready"
    );

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("received Ctrl+C, shutting down gateway"),
            Err(err) => warn!(error = ?err, "failed to listen for Ctrl+C"),
        },
        reason = server.stopping() => {
            info!(?reason, "HTTP server requested shutdown");
        }
    }

    let reason = server.shutdown().await;
    let totals = state.usage.totals();
    info!(
        requests = totals.requests,
        prompt_tokens = totals.prompt_tokens,
        completion_tokens = totals.completion_tokens,
        total_tokens = totals.total_tokens,
        "token usage for this session"
    );
    log.info(format!(
        "Server stopped. Tokens used: {} prompt, {} completion, {} total",
        totals.prompt_tokens, totals.completion_tokens, totals.total_tokens
    ));
    if reason == ShutdownReason::UpstreamExhausted {
        warn!("gateway stopped after upstream retries were exhausted");
        log.warn("Server stopped: upstream retries were exhausted");
    }
    log_writer.shutdown().await;
    Ok(())
}

fn init_tracing(layout: &Layout) -> Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    let log_dir = layout.tracing_log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create gateway log directory {}", log_dir.display()))?;
    let file_appender = rolling::hourly(log_dir, "gateway.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .json()
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
