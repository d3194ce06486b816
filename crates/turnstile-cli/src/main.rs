use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use turnstile_core::{
    Attachment, InMemorySessionStore, Orchestrator, OrchestratorConfig, OrchestratorHandle,
    ProviderAdapter, Role, SessionStore, ToolRegistry, UiEvent,
};
use turnstile_providers::{AnthropicAdapter, OpenAiAdapter, OpenRouterAdapter};

mod attachments;
mod config;
mod render;
mod store;
mod tools;

use config::{Config, ProviderKind, ResolvedProvider};
use render::{Flow, Renderer};
use store::JsonFileSessionStore;

/// Log level for tracing output
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Most verbose: raw SSE payloads and every chunk
    Trace,
    /// Requests, state changes, tool execution details
    Debug,
    /// Session and turn lifecycle
    Info,
    /// Quiet: only warnings and errors
    Warn,
    /// Minimal: only errors
    Error,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(name = "turnstile")]
#[command(author, version, about = "Streaming LLM completions with tool calls", long_about = None)]
pub struct Cli {
    /// Prompt to send; without one, prompts are read from stdin line by line
    pub prompt: Option<String>,

    /// Provider to use (a [providers.NAME] entry; overrides default_provider)
    #[arg(short, long, global = true)]
    pub provider: Option<String>,

    /// Model to use (overrides the provider's default_model)
    #[arg(short, long)]
    pub model: Option<String>,

    /// System prompt (overrides [completion] system_prompt)
    #[arg(short, long)]
    pub system: Option<String>,

    /// Configuration file (default: <config dir>/turnstile/config.toml)
    #[arg(long, env = "TURNSTILE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Session to resume and append to (default: [session] id, else a new one)
    #[arg(long, global = true)]
    pub session: Option<String>,

    /// Attach a file (image or text) to the first prompt
    #[arg(short, long = "attach")]
    pub attachments: Vec<PathBuf>,

    /// Do not offer tools to the model
    #[arg(long)]
    pub no_tools: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, value_enum, default_value = "warn")]
    pub log_level: LogLevel,

    /// Write logs to file (JSON-lines format) instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the models the provider offers
    Models,
    /// Print the stored turns of a session
    History,
    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter()));

    if let Some(log_path) = &cli.log_file {
        let file = std::fs::File::create(log_path)
            .with_context(|| format!("Failed to create log file: {:?}", log_path))?;
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::sync::Mutex::new(file)))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Some(Commands::Models) => list_models(&cli, &config).await,
        Some(Commands::History) => show_history(&cli, &config).await,
        Some(Commands::Config) => show_config(&config),
        None => run_session(&cli, &config).await,
    }
}

fn create_adapter(provider: &ResolvedProvider) -> Arc<dyn ProviderAdapter> {
    match provider.kind {
        ProviderKind::Anthropic => {
            let mut adapter = AnthropicAdapter::new(&provider.api_key);
            if let Some(model) = &provider.model {
                adapter = adapter.with_default_model(model);
            }
            if let Some(url) = &provider.base_url {
                adapter = adapter.with_base_url(url);
            }
            Arc::new(adapter)
        }
        ProviderKind::OpenRouter => {
            let mut adapter = OpenRouterAdapter::new(&provider.api_key).with_app_title("turnstile");
            if let Some(model) = &provider.model {
                adapter = adapter.with_default_model(model);
            }
            if let Some(url) = &provider.base_url {
                adapter = adapter.with_base_url(url);
            }
            Arc::new(adapter)
        }
        ProviderKind::OpenAi => {
            let mut adapter = OpenAiAdapter::new(&provider.api_key);
            if let Some(model) = &provider.model {
                adapter = adapter.with_default_model(model);
            }
            if let Some(url) = &provider.base_url {
                adapter = adapter.with_base_url(url);
            }
            Arc::new(adapter)
        }
    }
}

/// Session id: CLI > config > a fresh timestamped id.
fn session_id(cli: &Cli, config: &Config) -> String {
    cli.session
        .clone()
        .or_else(|| config.session.id.clone())
        .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d-%H%M%S").to_string())
}

async fn run_session(cli: &Cli, config: &Config) -> Result<ExitCode> {
    let provider = config.resolve_provider(cli.provider.as_deref(), cli.model.as_deref())?;
    let adapter = create_adapter(&provider);
    let settings = config.completion_settings(&provider, cli.system.as_deref());

    let store_dir = config.store_dir()?;
    let store: Arc<dyn SessionStore> = Arc::new(JsonFileSessionStore::new(&store_dir));
    let tools = if cli.no_tools {
        ToolRegistry::new()
    } else {
        tools::default_registry()
    };

    let session = session_id(cli, config);
    let (ui_tx, mut ui_rx) = mpsc::channel(256);
    let (mut orchestrator, events) = Orchestrator::new(
        OrchestratorConfig::new(&session),
        adapter,
        store,
        Arc::new(tools),
        settings,
        ui_tx,
    );
    let restored = orchestrator
        .restore()
        .await
        .with_context(|| format!("Failed to load session '{session}'"))?;
    tracing::info!(
        session = %session,
        provider = %provider.name,
        model = ?provider.model,
        restored,
        store = %store_dir.display(),
        "Session started"
    );

    let handle = orchestrator.handle();
    let task = tokio::spawn(orchestrator.run(events));
    let mut renderer = Renderer::new(std::io::stdout(), std::io::stderr());

    let mut attachments = cli
        .attachments
        .iter()
        .map(|path| attachments::load_attachment(path))
        .collect::<Result<Vec<Attachment>>>()?;

    if let Some(prompt) = &cli.prompt {
        handle.submit(prompt.as_str(), attachments).await?;
        drive_turn(&handle, &mut ui_rx, &mut renderer).await?;
    } else {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            eprint!("> ");
            let line = tokio::select! {
                line = lines.next_line() => line.context("Failed to read stdin")?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else { break };
            let prompt = line.trim();
            if prompt.is_empty() {
                continue;
            }
            if prompt == "/exit" || prompt == "/quit" {
                break;
            }
            handle
                .submit(prompt, std::mem::take(&mut attachments))
                .await?;
            drive_turn(&handle, &mut ui_rx, &mut renderer).await?;
        }
    }

    handle.shutdown().await?;
    task.await.context("Orchestrator task failed")?;

    eprintln!("Session: {session}");
    Ok(if renderer.errors() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Render events until the turn in flight ends; Ctrl-C cancels it.
async fn drive_turn<O: std::io::Write, E: std::io::Write>(
    handle: &OrchestratorHandle,
    ui_rx: &mut mpsc::Receiver<UiEvent>,
    renderer: &mut Renderer<O, E>,
) -> Result<()> {
    loop {
        tokio::select! {
            event = ui_rx.recv() => {
                let event = event.context("Orchestrator stopped unexpectedly")?;
                if renderer.handle(event)? == Flow::Done {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling turn");
                handle.cancel().await?;
            }
        }
    }
}

async fn list_models(cli: &Cli, config: &Config) -> Result<ExitCode> {
    let provider = config.resolve_provider(cli.provider.as_deref(), cli.model.as_deref())?;
    let (ui_tx, mut ui_rx) = mpsc::channel(16);
    let (orchestrator, events) = Orchestrator::new(
        OrchestratorConfig::new("models"),
        create_adapter(&provider),
        Arc::new(InMemorySessionStore::new()),
        Arc::new(ToolRegistry::new()),
        config.completion_settings(&provider, None),
        ui_tx,
    );
    let handle = orchestrator.handle();
    let task = tokio::spawn(orchestrator.run(events));

    let mut renderer = Renderer::new(std::io::stdout(), std::io::stderr());
    handle.list_models().await?;
    drive_turn(&handle, &mut ui_rx, &mut renderer).await?;

    handle.shutdown().await?;
    task.await.context("Orchestrator task failed")?;
    Ok(if renderer.errors() > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn show_history(cli: &Cli, config: &Config) -> Result<ExitCode> {
    let session = cli
        .session
        .clone()
        .or_else(|| config.session.id.clone())
        .context("No session given; pass --session ID")?;
    let store = JsonFileSessionStore::new(config.store_dir()?);
    let turns = store
        .load_session_messages(&session)
        .await
        .with_context(|| format!("Failed to load session '{session}'"))?;

    if turns.is_empty() {
        println!("Session '{session}' has no stored turns.");
        return Ok(ExitCode::SUCCESS);
    }

    for turn in &turns {
        let label = match turn.role {
            Role::System => "system",
            Role::User => "you",
            Role::Assistant => turn.model.as_deref().unwrap_or("assistant"),
            Role::Tool => "tool",
        };
        println!("[{label}]");
        for attachment in &turn.attachments {
            println!("  (attached {} {})", attachment.name, attachment.mime_type);
        }
        if !turn.content.is_empty() {
            println!("{}", turn.content);
        }
        for call in &turn.tool_calls {
            println!(
                "  -> {}({}) = {}",
                call.name,
                call.arguments,
                call.result.as_deref().unwrap_or("<no result>")
            );
        }
        println!();
    }
    Ok(ExitCode::SUCCESS)
}

fn show_config(config: &Config) -> Result<ExitCode> {
    let mut shown = config.clone();
    for entry in shown.providers.values_mut() {
        if entry.api_key.is_some() {
            entry.api_key = Some("********".to_string());
        }
    }
    println!("# {}", Config::config_path()?.display());
    println!("{}", toml::to_string_pretty(&shown).context("Failed to render configuration")?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(kind: ProviderKind) -> ResolvedProvider {
        ResolvedProvider {
            name: "test".into(),
            kind,
            api_key: "k".into(),
            base_url: None,
            model: Some("m".into()),
            parameters: Default::default(),
        }
    }

    #[test]
    fn test_create_adapter_by_kind() {
        assert_eq!(create_adapter(&resolved(ProviderKind::OpenAi)).name(), "openai");
        assert_eq!(create_adapter(&resolved(ProviderKind::Anthropic)).name(), "anthropic");
        assert_eq!(create_adapter(&resolved(ProviderKind::OpenRouter)).name(), "openrouter");
        assert_eq!(create_adapter(&resolved(ProviderKind::OpenAi)).default_model(), Some("m"));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "turnstile",
            "--provider",
            "claude",
            "--session",
            "work",
            "-a",
            "a.png",
            "What is this?",
        ])
        .unwrap();
        assert_eq!(cli.prompt.as_deref(), Some("What is this?"));
        assert_eq!(cli.provider.as_deref(), Some("claude"));
        assert_eq!(cli.attachments, vec![PathBuf::from("a.png")]);
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from(["turnstile", "history", "--session", "work"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::History)));
        assert_eq!(cli.session.as_deref(), Some("work"));
    }

    #[test]
    fn test_session_id_precedence() {
        let mut config = Config::default();
        config.session.id = Some("configured".into());

        let cli = Cli::try_parse_from(["turnstile", "--session", "cli"]).unwrap();
        assert_eq!(session_id(&cli, &config), "cli");

        let cli = Cli::try_parse_from(["turnstile"]).unwrap();
        assert_eq!(session_id(&cli, &config), "configured");
        assert_eq!(session_id(&cli, &Config::default()).len(), "20260101-000000".len());
    }

    #[tokio::test]
    async fn test_drive_turn_runs_to_idle() {
        use turnstile_core::testing::{MockToolExecutor, RecordingStore, Script, ScriptedAdapter};
        use turnstile_core::{CompletionSettings, NormalizedChunk};

        let adapter = ScriptedAdapter::new().with_script(Script::chunks(vec![
            NormalizedChunk::content(0, "Hi"),
            NormalizedChunk::content(1, " there"),
            NormalizedChunk::terminal(2),
        ]));
        let store = Arc::new(RecordingStore::new());
        let (ui_tx, mut ui_rx) = mpsc::channel(64);
        let (orchestrator, events) = Orchestrator::new(
            OrchestratorConfig::new("s"),
            Arc::new(adapter),
            store.clone(),
            Arc::new(MockToolExecutor::new()),
            CompletionSettings::default(),
            ui_tx,
        );
        let handle = orchestrator.handle();
        let task = tokio::spawn(orchestrator.run(events));

        let mut renderer = Renderer::new(Vec::new(), Vec::new());
        handle.submit("hello", Vec::new()).await.unwrap();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            drive_turn(&handle, &mut ui_rx, &mut renderer),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(renderer.errors(), 0);
        assert_eq!(store.write_count(), 1);
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }
}
