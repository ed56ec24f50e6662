use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use clap::Parser;
use llm_translate_gateway_stub::{StubReply, StubUpstream};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(author, version, about = "Scripted chat-completion upstream for llm-translate-gateway")]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: SocketAddr,

    /// Fixed reply text; without it the last user message is echoed back.
    #[arg(long, conflicts_with = "fail_with")]
    reply: Option<String>,

    /// Answer every call with this HTTP status.
    #[arg(long, value_name = "STATUS")]
    fail_with: Option<u16>,

    /// Delay before each answer, in milliseconds.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Sets the log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let mut reply = match (cli.reply, cli.fail_with) {
        (_, Some(status)) => StubReply::Fail(status),
        (Some(text), None) => StubReply::Text(text),
        (None, None) => StubReply::Echo,
    };
    if cli.delay_ms > 0 {
        reply = StubReply::slow(Duration::from_millis(cli.delay_ms), reply);
    }

    let stub = StubUpstream::new();
    stub.set_fallback(reply);
    let server = stub.spawn_on(cli.bind).await?;
    info!("point the gateway's base_url at {}", server.base_url());

    if let Err(err) = signal::ctrl_c().await {
        warn!(error = ?err, "failed to listen for Ctrl+C");
    }
    info!(requests = stub.request_count(), "stub upstream shutting down");
    Ok(())
}
