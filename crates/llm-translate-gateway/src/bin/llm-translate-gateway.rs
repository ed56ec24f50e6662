use std::{path::PathBuf, process, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use llm_translate_gateway::{
    Layout,
    daemon::{
        logging::{self, LogEntry, LogLevel},
        serve::{self, ServeArgs},
    },
    gateway::{
        ChatMessage, TranslationClient,
        keys::{mask_key, parse_keys},
    },
    resolve_root,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_TEXT: &str = "Hello";

#[derive(Parser, Debug)]
#[command(
    name = "llm-translate-gateway",
    version,
    about = "Local translation endpoint backed by an OpenAI-compatible chat API"
)]
struct Cli {
    /// Workspace root (defaults to LLM_GATEWAY_ROOT or ~/.llm-translate-gateway).
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the workspace and a default gateway.toml.
    Init,

    /// Run the translation gateway until Ctrl+C.
    Serve(ServeArgs),

    /// Send a short probe through every configured API key.
    Check,

    /// List the models offered by the configured upstream.
    Models,

    /// Print recent status log lines.
    Logs(LogsArgs),
}

#[derive(Args, Debug)]
struct LogsArgs {
    /// Number of lines to show.
    #[arg(long, short = 'n', default_value_t = 20)]
    tail: usize,
    /// Print raw JSON records.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => serve::run(cli.root, args).await,
        Command::Init => handle_init(&resolve_layout(cli.root)?),
        Command::Check => handle_check(&resolve_layout(cli.root)?).await,
        Command::Models => handle_models(&resolve_layout(cli.root)?).await,
        Command::Logs(args) => handle_logs(&resolve_layout(cli.root)?, args),
    }
}

fn resolve_layout(root_override: Option<PathBuf>) -> Result<Layout> {
    Ok(Layout::new(resolve_root(root_override)?))
}

fn handle_init(layout: &Layout) -> Result<()> {
    layout.ensure()?;
    if layout.write_default_settings()? {
        println!("Initialised workspace at {}", layout.root().display());
        println!("Edit {} to set the upstream URL and API keys.", layout.config_path().display());
    } else {
        println!(
            "Workspace at {} is already initialised ({})",
            layout.root().display(),
            layout.config_path().display()
        );
    }
    Ok(())
}

async fn handle_check(layout: &Layout) -> Result<()> {
    let settings = layout.load_settings()?;
    let keys = parse_keys(&settings.api_keys);
    if keys.is_empty() {
        bail!("no API keys configured in {}", layout.config_path().display());
    }

    println!("Checking {} key(s) against {} ({})", keys.len(), settings.base_url, settings.model);
    let client = TranslationClient::new();
    let messages = [ChatMessage::user(PROBE_TEXT)];
    let mut failed = 0usize;
    for key in &keys {
        let result = client
            .translate(
                &settings.base_url,
                key,
                &settings.model,
                &messages,
                settings.temperature,
                PROBE_TIMEOUT,
            )
            .await;
        match result {
            Ok(_) => println!("  [ok]   {}", mask_key(key)),
            Err(err) => {
                failed += 1;
                println!("  [fail] {}: {} ({err})", mask_key(key), err.kind());
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} keys failed the check", keys.len());
    }
    println!("All keys are usable.");
    Ok(())
}

async fn handle_models(layout: &Layout) -> Result<()> {
    let settings = layout.load_settings()?;
    let Some(key) = parse_keys(&settings.api_keys).first().map(|key| key.to_string()) else {
        bail!("no API keys configured in {}", layout.config_path().display());
    };

    let models = TranslationClient::new()
        .list_models(&settings.base_url, &key, PROBE_TIMEOUT)
        .await?;
    if models.is_empty() {
        println!("The upstream reported no models.");
    }
    for model in models {
        let marker = if model == settings.model { "*" } else { " " };
        println!("{marker} {model}");
    }
    Ok(())
}

fn handle_logs(layout: &Layout, args: LogsArgs) -> Result<()> {
    let path = layout.status_log_path();
    let entries = logging::read_tail(&path, args.tail)?;
    if entries.is_empty() {
        println!("No status log entries in {}", path.display());
        return Ok(());
    }
    for entry in &entries {
        print_log_entry(entry, args.json);
    }
    Ok(())
}

fn print_log_entry(entry: &LogEntry, as_json: bool) {
    if as_json {
        match serde_json::to_string(entry) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("error: {err}"),
        }
        return;
    }
    println!("{} [{}] {}", entry.timestamp, format_level(entry.level), entry.message);
}

fn format_level(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "INFO",
        LogLevel::Warn => "WARN",
        LogLevel::Error => "ERROR",
    }
}
