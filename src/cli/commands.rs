//! CLI command definitions for convoforge.
//!
//! `run` pushes a JSONL file of conversations through the LLM processor with
//! rate limiting and checkpoint/resume; `config` prints the resolved settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::{config, ConfigContext, ConfigOverrides, Settings};
use crate::task::processors::llm::{DEFAULT_SYSTEM_PROMPT, DEFAULT_USER_TEMPLATE};
use crate::task::{run_task, LlmProcessor, TaskOverrides};
use crate::types::Conversation;

/// Name under which the CLI registers its configuration context.
const CLI_CONTEXT_NAME: &str = "cli";

/// Concurrent, rate-limited, checkpointed LLM processing of conversation datasets.
#[derive(Parser)]
#[command(name = "convoforge")]
#[command(about = "Run LLM processors over conversation datasets with checkpoint/resume")]
#[command(version)]
#[command(
    long_about = "convoforge runs an OpenAI-compatible chat model over a JSONL file of conversations.\n\nCompleted items are recorded in a checkpoint log so an interrupted run can be restarted without repeating work.\n\nExample usage:\n  convoforge run --input data.jsonl --output out.jsonl --checkpoint run.ckpt --workers 8 --rate-limit 5"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate an assistant reply for every conversation in a JSONL file.
    Run(RunArgs),

    /// Print the resolved settings as YAML.
    Config(ConfigArgs),
}

/// Arguments for `convoforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Input JSONL file, one conversation per line.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Output JSONL file; processed conversations are appended.
    #[arg(short, long)]
    pub output: PathBuf,

    /// Checkpoint log recording completed conversations.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Number of concurrent workers.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum requests per second (0 disables limiting).
    #[arg(short, long)]
    pub rate_limit: Option<f64>,

    /// Write results as they complete instead of in input order.
    #[arg(long)]
    pub unordered: bool,

    /// Stop at the first failed conversation.
    #[arg(long)]
    pub fail_fast: bool,

    /// Retries per conversation after a failed call.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Model name (defaults to api.model).
    #[arg(short, long)]
    pub model: Option<String>,

    /// System prompt sent with every request.
    #[arg(long, default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system_prompt: String,

    /// User prompt template; ${content} is the last user message.
    #[arg(long, default_value = DEFAULT_USER_TEMPLATE)]
    pub template: String,

    /// Sampling temperature.
    #[arg(long, default_value = "0.7")]
    pub temperature: f64,

    /// Log progress periodically.
    #[arg(long)]
    pub progress: bool,

    /// Settings file (YAML or JSON); environment variables are used otherwise.
    #[arg(short, long, env = "CONVOFORGE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Arguments for `convoforge config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Settings file (YAML or JSON); environment variables are used otherwise.
    #[arg(short, long, env = "CONVOFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the API key instead of masking it.
    #[arg(long)]
    pub show_secrets: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Config(args) => config_command(args),
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Settings::from_env().context("Failed to load settings from environment"),
    }
}

fn task_overrides(args: &RunArgs) -> TaskOverrides {
    let mut overrides = TaskOverrides::new();
    if let Some(workers) = args.workers {
        overrides = overrides.with_max_workers(workers);
    }
    if let Some(rate) = args.rate_limit {
        overrides = overrides.with_rate_limit(rate);
    }
    if args.unordered {
        overrides = overrides.with_ordered_results(false);
    }
    if args.fail_fast {
        overrides = overrides.with_ignore_errors(false);
    }
    if let Some(retries) = args.retries {
        overrides = overrides.with_max_retries(retries);
    }
    if let Some(path) = &args.checkpoint {
        overrides = overrides.with_checkpoint_path(path);
    }
    if args.progress {
        overrides = overrides.with_show_progress(true);
    }
    overrides
}

fn read_conversations(path: &Path) -> anyhow::Result<Vec<Conversation>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read input file {}", path.display()))?;

    let mut conversations = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let conversation: Conversation = serde_json::from_str(line)
            .with_context(|| format!("Invalid conversation on line {}", line_no + 1))?;
        conversations.push(conversation);
    }
    Ok(conversations)
}

async fn run_command(args: RunArgs) -> anyhow::Result<()> {
    let settings = load_settings(args.config.as_deref())?;
    config().register(Arc::new(ConfigContext::new(settings, CLI_CONTEXT_NAME)));

    let mut api_overrides = ConfigOverrides::new();
    if let Some(model) = &args.model {
        api_overrides = api_overrides.set("api.model", model.as_str());
    }

    config()
        .switch(CLI_CONTEXT_NAME, &api_overrides, process_file(&args))
        .await?
}

async fn process_file(args: &RunArgs) -> anyhow::Result<()> {
    let conversations = read_conversations(&args.input)?;
    let total = conversations.len();
    info!(input = %args.input.display(), conversations = total, "Loaded input");

    let processor = LlmProcessor::new()
        .with_system_prompt(&args.system_prompt)
        .with_template(&args.template)
        .with_temperature(args.temperature);

    let mut outputs = run_task(conversations, Arc::new(processor), &task_overrides(args))?;

    if let Some(parent) = args.output.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.output)
        .await
        .with_context(|| format!("Failed to open output file {}", args.output.display()))?;

    let mut written = 0usize;
    while let Some(output) = outputs.next().await {
        let conversation = output?;
        let mut line = serde_json::to_string(&conversation)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        written += 1;
    }
    file.flush().await?;

    if written < total {
        warn!(
            written,
            total,
            "Some conversations were not written (failed, filtered, or already checkpointed)"
        );
    }
    info!(output = %args.output.display(), written, "Run complete");
    Ok(())
}

fn config_command(args: ConfigArgs) -> anyhow::Result<()> {
    let mut settings = load_settings(args.config.as_deref())?;
    if !args.show_secrets && !settings.api.openai_api_key.is_empty() {
        settings.api.openai_api_key = "********".to_string();
    }
    print!("{}", serde_yaml::to_string(&settings)?);
    Ok(())
}
