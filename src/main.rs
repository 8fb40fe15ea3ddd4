use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use tokio_stream::StreamExt;

use grok_core::agent::{
    AgentLoop, AgentLoopConfig, CancellationFlag, ConfirmationHandler, Orchestrator,
    StreamingChunk,
};
use grok_core::llm::{OpenAiConfig, OpenAiProvider};
use grok_core::metrics::metrics_collector;
use grok_core::planner::{Planner, WorkspaceScanner};
use grok_core::tools::{FallbackEngine, ToolRegistry};
use grok_core::Settings;

#[derive(Parser)]
#[command(name = "grok")]
#[command(author, version, about = "Grok - autonomous AI coding agent", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Working directory for file operations (default: current directory)
    #[arg(long, global = true)]
    cwd: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat session (default)
    Chat,

    /// Process a single prompt and exit
    Prompt {
        /// The request to process
        text: String,
    },

    /// Print aggregated tool metrics for this process and exit
    Metrics,
}

/// Prompts on stdin before executing high-risk plans
struct TerminalConfirmation;

#[async_trait::async_trait]
impl ConfirmationHandler for TerminalConfirmation {
    async fn confirm(&self, _preview: &str) -> bool {
        print!("{} ", "Execute this plan? [y/N]".yellow().bold());
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "grok_core=debug" } else { "grok_core=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(working_dir: std::path::PathBuf) -> Result<Arc<Orchestrator>> {
    let settings = Settings::load(&working_dir)?;

    let api_key = settings
        .api_key
        .clone()
        .or_else(|| std::env::var("GROK_API_KEY").ok())
        .unwrap_or_default();
    if api_key.is_empty() {
        anyhow::bail!(
            "No API key configured. Set GROK_API_KEY or add \"apiKey\" to ~/.grok/user-settings.json"
        );
    }

    let mut llm_config = OpenAiConfig::new(
        settings.base_url_or_default(),
        api_key,
        settings.model_or_default(),
    )
    .with_timeouts(settings.request_timeout(), settings.stream_timeout());
    if let Some(max_tokens) = settings.max_tokens {
        llm_config = llm_config.with_max_tokens(max_tokens);
    }
    if let Some(temperature) = settings.temperature {
        llm_config = llm_config.with_temperature(temperature);
    }

    let llm = Arc::new(OpenAiProvider::new(llm_config));
    let registry = Arc::new(ToolRegistry::with_defaults(working_dir.clone()));
    let planner = Planner::new(
        Arc::new(WorkspaceScanner::new(working_dir.clone())),
        working_dir,
    );
    let fallback = Arc::new(FallbackEngine::with_defaults());

    // Settings knobs that shape the loop itself
    let mut loop_config = AgentLoopConfig::default();
    if let Some(max_concurrent) = settings.max_concurrent_tools {
        loop_config.max_concurrent_tool_calls = max_concurrent;
    }
    if settings.parallel_tool_calls == Some(false) {
        loop_config.max_concurrent_tool_calls = 1;
    }
    let agent_loop =
        AgentLoop::new(llm.clone(), registry.clone(), fallback.clone()).with_config(loop_config);

    Ok(Arc::new(
        Orchestrator::new(llm, registry, planner, fallback)
            .with_agent_loop(agent_loop)
            .with_confirmation_handler(Arc::new(TerminalConfirmation)),
    ))
}

async fn stream_request(orchestrator: &Arc<Orchestrator>, request: String) {
    let cancel = CancellationFlag::new();

    // Ctrl+C cancels the in-flight request instead of killing the process
    let cancel_for_signal = cancel.clone();
    let previous = ctrlc::set_handler(move || {
        cancel_for_signal.cancel();
    });
    if let Err(e) = previous {
        tracing::debug!("Ctrl+C handler unavailable: {}", e);
    }

    let mut stream = orchestrator.process_user_message_stream(request, cancel);
    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamingChunk::Content { content } => {
                print!("{}", content);
                let _ = std::io::stdout().flush();
            }
            StreamingChunk::TokenCount { token_count } => {
                eprintln!("{}", format!("[context ~{} tokens]", token_count).dimmed());
            }
            StreamingChunk::ToolCalls { tool_calls } => {
                for call in &tool_calls {
                    eprintln!("{}", format!("-> {} {}", call.name, call.arguments).cyan());
                }
            }
            StreamingChunk::ToolResult { tool_call, tool_result } => {
                let marker = if tool_result.success { "ok".green() } else { "failed".red() };
                eprintln!("{}", format!("<- {} {}", tool_call.name, marker).dimmed());
            }
            StreamingChunk::Done => break,
        }
    }
    println!();
}

async fn run_chat(orchestrator: Arc<Orchestrator>) -> Result<()> {
    println!("{}", "grok - type a request, or 'exit' to quit".bold());
    let stdin = std::io::stdin();
    loop {
        print!("{} ", ">".blue().bold());
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let request = line.trim().to_string();
        if request.is_empty() {
            continue;
        }
        if request == "exit" || request == "quit" {
            break;
        }
        stream_request(&orchestrator, request).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let working_dir = match &cli.cwd {
        Some(dir) => std::path::PathBuf::from(dir),
        None => std::env::current_dir()?,
    };

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let orchestrator = build_orchestrator(working_dir)?;
            run_chat(orchestrator).await?;
        }
        Commands::Prompt { text } => {
            let orchestrator = build_orchestrator(working_dir)?;
            stream_request(&orchestrator, text).await;
        }
        Commands::Metrics => {
            metrics_collector().print_summary();
            println!(
                "Metrics log: {}",
                metrics_collector().log_path().display()
            );
        }
    }

    Ok(())
}
