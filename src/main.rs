use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pr_review_agent::{
    agents::{
        AgentRegistry, AgentTaskExecutor, ConfiguredModelResolver, ContinuationHandler, ContinueOptions,
        ReviewEvent, ReviewEventBus, ReviewOrchestrator, SynthesisStage,
    },
    config::{Config, SessionPaths},
    error::ReviewError,
    git::{self, DiffSource},
    llm::{LLMInterface, LLMProviderFactory, Model},
    reports::{JsonFormatter, MarkdownFormatter, ReportFormatter, StdoutSink},
    types::ReviewRequest,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_FILE: &str = "pr-review.yml";
const PROGRESS_GRACE: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "pr-review")]
#[command(about = "Multi-agent code review with a synthesized, resumable report")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Repository directory (defaults to current directory)
    #[arg(short = 'C', long, default_value = ".", global = true)]
    directory: PathBuf,

    /// Log level, used when RUST_LOG is unset
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Markdown,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Review the current change with every selected agent
    Review {
        /// Comma-separated agent ids, in report order
        #[arg(short, long, value_delimiter = ',')]
        agents: Vec<String>,

        /// Model to use instead of the configured default
        #[arg(short, long)]
        model: Option<String>,

        /// Extra context passed to every agent
        #[arg(long)]
        context: Option<String>,

        /// Review the branch against this base ref
        #[arg(long, conflicts_with_all = ["staged", "diff_file"])]
        base: Option<String>,

        /// Review staged changes only
        #[arg(long, conflicts_with = "diff_file")]
        staged: bool,

        /// Read the diff from a file ('-' for stdin)
        #[arg(long)]
        diff_file: Option<PathBuf>,

        /// Save the individual agent reports to this directory
        #[arg(long)]
        save_reports: Option<PathBuf>,

        /// Format for saved agent reports
        #[arg(long, value_enum, default_value = "markdown")]
        format: ReportFormat,
    },

    /// Ask a follow-up question about the last review
    Continue {
        /// The follow-up message
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,

        /// Model to use instead of the one the review ran with
        #[arg(short, long)]
        model: Option<String>,
    },

    /// List the available review agents
    Agents,

    /// Health check of the system
    HealthCheck,

    /// Initialize configuration file
    Init {
        /// Configuration file path
        #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
        config_file: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&cli.log_level) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("Starting pr-review");

    if let Commands::Init { config_file, force } = &cli.command {
        return init_config(config_file, *force).await;
    }

    let config = load_config(cli.config.as_deref(), &cli.directory).await?;

    match cli.command {
        Commands::Review {
            agents,
            model,
            context,
            base,
            staged,
            diff_file,
            save_reports,
            format,
        } => {
            let source = match (diff_file, base, staged) {
                (Some(path), _, _) => DiffSource::File(path),
                (None, Some(base), _) => DiffSource::Base(base),
                (None, None, true) => DiffSource::Staged,
                (None, None, false) => DiffSource::WorkingTree,
            };
            let options = ReviewOptions {
                agents,
                model,
                context,
                save_reports: save_reports.map(|dir| (dir, format)),
            };
            review(&cli.directory, source, options, config).await
        }
        Commands::Continue { message, model } => continue_review(message.join(" "), model, config).await,
        Commands::Agents => list_agents(&config),
        Commands::HealthCheck => health_check(&config).await,
        Commands::Init { .. } => Ok(()),
    }
}

/// Initialize tracing with the specified log level; output goes to stderr
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to create env filter")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}

/// Defaults, then the config file, then environment overrides
async fn load_config(config_path: Option<&Path>, directory: &Path) -> Result<Config> {
    let mut config = Config::default();

    let path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(directory.join(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    if let Some(path) = path {
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
            config.merge_with(Config::load_from_file(&path).await?);
        } else {
            warn!("Configuration file not found: {:?}. Using defaults.", path);
        }
    }

    config.merge_with(Config::load_from_env()?);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn create_llm(config: &Config) -> Result<Arc<dyn LLMInterface>> {
    LLMProviderFactory::create(config.llm.clone())
        .map_err(|e| ReviewError::NoModelAvailable(e.to_string()).into())
}

/// Print progress events to stderr until the bus closes
fn spawn_progress<F>(events: &ReviewEventBus, print: F) -> JoinHandle<()>
where
    F: Fn(&ReviewEvent) + Send + 'static,
{
    let mut receiver = events.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => print(&event),
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} progress events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Let the printer drain events already published, then stop it.
async fn stop_progress(mut progress: JoinHandle<()>) {
    let _ = tokio::time::timeout(PROGRESS_GRACE, &mut progress).await;
    progress.abort();
}

struct ReviewOptions {
    agents: Vec<String>,
    model: Option<String>,
    context: Option<String>,
    save_reports: Option<(PathBuf, ReportFormat)>,
}

async fn review(directory: &Path, source: DiffSource, options: ReviewOptions, config: Config) -> Result<()> {
    let diff = git::collect_diff(directory, &source).await?;

    let llm = create_llm(&config)?;
    let registry = AgentRegistry::builtin().with_custom(config.agents.clone())?;
    let resolver = Arc::new(ConfiguredModelResolver::new(config.llm.clone()));
    let paths = SessionPaths::resolve(&config.session)?;
    let events = Arc::new(ReviewEventBus::new());

    let executor = AgentTaskExecutor::new(Arc::clone(&llm))
        .with_tool_limits(config.tools.clone())
        .with_sampling(config.llm.temperature, config.llm.max_tokens);
    let synthesis = SynthesisStage::new(Arc::clone(&llm), paths)
        .with_keep_sessions(config.session.keep_sessions)
        .with_sampling(config.llm.temperature, config.llm.max_tokens);

    let mut orchestrator = ReviewOrchestrator::new(llm, registry, resolver, synthesis.paths().clone())
        .with_executor(executor)
        .with_synthesis(synthesis)
        .with_events(Arc::clone(&events))
        .with_max_diff_tokens(config.review.max_diff_tokens);

    if let Some((dir, format)) = options.save_reports {
        let formatter: Arc<dyn ReportFormatter> = match format {
            ReportFormat::Markdown => Arc::new(MarkdownFormatter),
            ReportFormat::Json => Arc::new(JsonFormatter),
        };
        orchestrator = orchestrator.save_reports(dir, formatter);
    }

    let agents = if options.agents.is_empty() {
        config.review.default_agents.clone()
    } else {
        options.agents
    };
    let mut request = ReviewRequest::new(diff, directory).with_agents(agents);
    if let Some(model) = options.model {
        request = request.with_model(model);
    }
    if let Some(context) = options.context.or(config.review.extra_context.clone()) {
        request = request.with_extra_context(context);
    }

    let progress = spawn_progress(&events, |event| eprintln!("» {}", event));
    let outcome = orchestrator.run_review(&request, Arc::new(StdoutSink::new())).await;
    drop(orchestrator);
    drop(events);

    // Detached sibling agents keep the bus open after a failure.
    let outcome = match outcome {
        Ok(outcome) => {
            let _ = progress.await;
            outcome
        }
        Err(e) => {
            stop_progress(progress).await;
            return Err(e.into());
        }
    };
    if let Some(path) = &outcome.saved_reports {
        eprintln!("Agent reports saved to {}", path.display());
    }
    info!(
        "Review completed with {} reports; continue with `pr-review continue`",
        outcome.reports.len()
    );
    Ok(())
}

async fn continue_review(message: String, model: Option<String>, config: Config) -> Result<()> {
    let llm = create_llm(&config)?;
    let paths = SessionPaths::resolve(&config.session)?;

    let handler = ContinuationHandler::new(llm, &paths.last_session);
    let options = ContinueOptions {
        model: model.as_deref().map(Model::from_selector),
        tool_limits: Some(config.tools.clone()),
    };

    handler
        .continue_session(&message, options, Arc::new(StdoutSink::new()))
        .await?;
    Ok(())
}

fn list_agents(config: &Config) -> Result<()> {
    let registry = AgentRegistry::builtin().with_custom(config.agents.clone())?;
    let width = registry
        .descriptors()
        .iter()
        .map(|a| a.id.len())
        .max()
        .unwrap_or(0);

    for agent in registry.descriptors() {
        println!("{:width$}  {} - {}", agent.id, agent.display_name, agent.description, width = width);
    }
    Ok(())
}

/// Perform health check of the system
async fn health_check(config: &Config) -> Result<()> {
    info!("Performing system health check");
    let mut healthy = true;

    let provider = match create_llm(config) {
        Ok(llm) => match llm.health_check().await {
            Ok(true) => "ok".to_string(),
            Ok(false) => {
                healthy = false;
                "unreachable".to_string()
            }
            Err(e) => {
                healthy = false;
                format!("error: {}", e)
            }
        },
        Err(e) => {
            healthy = false;
            format!("error: {}", e)
        }
    };
    println!("  provider ({}): {}", config.llm.provider, provider);

    let paths = SessionPaths::resolve(&config.session)?;
    let cache = match check_writable(&paths.sessions_dir).await {
        Ok(()) => "writable".to_string(),
        Err(e) => {
            healthy = false;
            format!("error: {}", e)
        }
    };
    println!("  cache ({}): {}", paths.sessions_dir.display(), cache);

    let last = if paths.last_session.exists() { "present" } else { "none" };
    println!("  last session ({}): {}", paths.last_session.display(), last);

    if healthy {
        println!("System Status: Healthy");
        Ok(())
    } else {
        anyhow::bail!("System Status: Unhealthy")
    }
}

async fn check_writable(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let marker = dir.join(".write-check");
    tokio::fs::write(&marker, b"ok").await?;
    tokio::fs::remove_file(&marker).await?;
    Ok(())
}

/// Initialize configuration file
async fn init_config(config_file: &Path, force: bool) -> Result<()> {
    info!("Initializing configuration file: {:?}", config_file);

    if config_file.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_file.display()
        );
    }

    tokio::fs::write(config_file, Config::default_yaml()?)
        .await
        .with_context(|| format!("Failed to write configuration file: {:?}", config_file))?;

    println!("Configuration file created: {}", config_file.display());
    println!("Edit this file to customize providers, agents and session storage.");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_failure_notice_printed_while_bus_stays_open() {
        let events = Arc::new(ReviewEventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let printed = Arc::clone(&seen);
        let progress = spawn_progress(&events, move |event| printed.lock().unwrap().push(event.to_string()));

        events
            .publish(ReviewEvent::AgentFailed {
                agent_id: "bug".to_string(),
                error: "timeout".to_string(),
            })
            .await;
        stop_progress(progress).await;

        assert_eq!(*seen.lock().unwrap(), vec!["bug failed: timeout"]);
    }
}
