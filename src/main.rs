//! Gantry CLI entrypoint.
//!
//! This is the main entrypoint for the gantry command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use gantry::cli::{Cli, Commands, OutputFormatter, StateCommands};
use gantry::config::{ConfigParser, ConfigValidator, InfraConfig, find_config_file};
use gantry::engine::{Engine, open_state_store};
use gantry::error::{Result, exit_code};
use gantry::graph::DependencyGraph;
use gantry::schema::SchemaRegistry;

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(exit_code::OTHER);
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli, &formatter)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{}", formatter.error(&e.to_string()));
            if e.is_retryable() {
                eprintln!("{}", formatter.warning("This error is transient; running the command again may succeed."));
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point. Returns the process exit code.
async fn run(cli: Cli, formatter: &OutputFormatter) -> Result<u8> {
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, formatter).await,
        Commands::Apply { yes, parallelism } => {
            cmd_apply(config_path, yes, parallelism, formatter).await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, formatter).await,
        Commands::Drift => cmd_drift(config_path, formatter).await,
        Commands::State { command } => cmd_state(config_path, command, formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config, _) = load_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;

    let registry = SchemaRegistry::with_overrides(&config.schemas);
    let graph = DependencyGraph::build(&config, &registry)?;

    emit(&formatter.format_validation(&config, &graph, &result, show_warnings))?;
    Ok(exit_code::SUCCESS)
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let engine = load_engine(config_path).await?;
    let plan = engine.plan().await?;
    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(exit_code::SUCCESS)
}

/// Apply the configuration.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let mut engine = load_engine(config_path).await?;
    if let Some(parallelism) = parallelism {
        engine = engine.with_parallelism(parallelism);
    }

    let plan = engine.plan().await?;
    if plan.is_empty() {
        emit(&formatter.format_plan(&plan, false))?;
        return Ok(exit_code::SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false))?;
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(exit_code::SUCCESS);
    }

    let summary = engine.apply(stop_on_interrupt()).await?;
    emit(&formatter.format_summary(&summary))?;
    Ok(summary.exit_code())
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let engine = load_engine(config_path).await?;

    let plan = engine.destroy_plan().await?;
    if plan.is_empty() {
        emit(&formatter.success("Nothing to destroy."))?;
        return Ok(exit_code::SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false))?;
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(exit_code::SUCCESS);
    }

    let summary = engine.destroy(stop_on_interrupt()).await?;
    emit(&formatter.format_summary(&summary))?;
    Ok(summary.exit_code())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let engine = load_engine(config_path).await?;
    let report = engine.check_drift().await?;
    emit(&formatter.format_drift(&report))?;
    Ok(exit_code::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config, base_dir) = load_config(config_path)?;
    let store = open_state_store(&config.state, &base_dir).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                emit(&formatter.format_state(&state))?;
            } else {
                emit(&formatter.warning("No state found."))?;
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.get_lock_info().await? {
                    warn!(holder = %lock.holder, halted = ?lock.halted, "Force-releasing state lock");
                    store.release_lock(&lock.lock_id).await?;
                    emit(&formatter.success("State forcefully unlocked."))?;
                } else {
                    emit(&formatter.warning("State is not locked."))?;
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.success("State unlocked."))?;
            } else {
                emit(&formatter.error("Please provide --lock-id or use --force"))?;
                return Ok(exit_code::OTHER);
            }
        }
    }

    Ok(exit_code::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads and validates the configuration.
///
/// Returns the configuration and the directory it was loaded from.
fn load_config(config_path: Option<&PathBuf>) -> Result<(InfraConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    ConfigValidator::new().validate(&config)?;

    Ok((config, base_dir))
}

/// Loads the configuration and builds the engine it describes.
async fn load_engine(config_path: Option<&PathBuf>) -> Result<Engine> {
    let (config, base_dir) = load_config(config_path)?;
    let engine = Engine::from_config(config, &base_dir).await?;
    debug!(?engine, "Engine ready");
    Ok(engine)
}

/// Returns a stop signal that flips on Ctrl-C.
fn stop_on_interrupt() -> watch::Receiver<bool> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            stop_tx.send_replace(true);
        }
    });
    stop_rx
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    let confirmed = input.trim().eq_ignore_ascii_case(expected);
    info!(confirmed, "Confirmation answered");
    Ok(confirmed)
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", text.trim_end())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry::cli::OutputFormat;

    #[test]
    fn test_explicit_config_path_is_used() {
        let path = PathBuf::from("infra/gantry.yaml");
        assert_eq!(resolve_config_path(Some(&path)).unwrap(), path);
    }

    #[test]
    fn test_load_config_validates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gantry.yaml");
        std::fs::write(&path, "project:\n  name: Bad_Name\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert_eq!(err.exit_code(), exit_code::CONFIG_ERROR);
    }

    #[test]
    fn test_formatter_matches_output_flag() {
        assert!(OutputFormatter::new(OutputFormat::Json).is_json());
        assert!(!OutputFormatter::new(OutputFormat::Text).is_json());
    }
}
