//! checkplan CLI - run, resume and inspect test sessions.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use checkplan::config::{self, Config};
use checkplan::execution::{ExecutionContext, LocalController};
use checkplan::orchestrator::{InFlightPolicy, Orchestrator};
use checkplan::provider::{Provider, load_catalogue};
use checkplan::qualifier::SelectionSource;
use checkplan::report::ConsoleReporter;
use checkplan::session::{
    SessionDocument, SessionError, SessionMetadata, SessionRepository, SessionState,
    SessionStorage,
};
use checkplan::unit::UnitCatalogue;

#[derive(Parser)]
#[command(name = "checkplan")]
#[command(about = "Resumable test-job orchestration", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "checkplan.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session and run it
    Run {
        /// Test plan to run (overrides the configured selection)
        #[arg(long)]
        test_plan: Option<String>,

        /// Whitelist file to run (overrides the configured selection)
        #[arg(long, conflicts_with = "test_plan")]
        whitelist: Option<PathBuf>,

        /// Session title
        #[arg(long)]
        title: Option<String>,
    },

    /// Resume a stored session
    Resume {
        /// Session id
        session: String,

        /// Outcome for the job that was running when the session stopped
        /// (pass, fail, skip or rerun)
        #[arg(long)]
        in_flight: Option<InFlightPolicy>,
    },

    /// List units, test plans or stored sessions
    List {
        #[arg(value_enum)]
        what: ListTarget,
    },

    /// Validate the configuration and every provider's units
    Validate,

    /// Delete a stored session
    Remove {
        /// Session id
        session: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ListTarget {
    Units,
    Plans,
    Sessions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            test_plan,
            whitelist,
            title,
        } => run_session(&cli.config, test_plan, whitelist, title, cli.verbose).await,
        Commands::Resume { session, in_flight } => {
            resume_session(&cli.config, &session, in_flight, cli.verbose).await
        }
        Commands::List { what } => list(&cli.config, what),
        Commands::Validate => validate(&cli.config),
        Commands::Remove { session } => remove_session(&cli.config, &session),
    }
}

/// Loads the config file; a missing default file gives the default config.
fn load(config_path: &Path) -> Result<(Config, PathBuf)> {
    let config = if config_path.exists() {
        config::load_config(config_path)?
    } else {
        warn!("{} not found; using defaults", config_path.display());
        Config::default()
    };
    Ok((config, base_dir(config_path)))
}

/// Relative paths in the config are resolved against its directory.
fn base_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn catalogue(config: &Config, base_dir: &Path) -> Result<(Vec<Provider>, UnitCatalogue)> {
    let providers = config.providers(base_dir);
    let (catalogue, problems) = load_catalogue(&providers)?;
    for problem in &problems {
        warn!("{}", problem);
    }
    info!(
        "Loaded {} units from {} providers",
        catalogue.len(),
        providers.len()
    );
    Ok((providers, catalogue))
}

fn repository(config: &Config) -> Result<SessionRepository> {
    let storage_dir = config
        .session
        .storage_dir()
        .context("Invalid session storage directory")?;
    Ok(SessionRepository::new(storage_dir))
}

fn selection(
    config: &Config,
    base_dir: &Path,
    test_plan: Option<String>,
    whitelist: Option<PathBuf>,
) -> Result<SelectionSource> {
    if let Some(id) = test_plan.or_else(|| config.selection.test_plan.clone()) {
        return Ok(SelectionSource::TestPlan { id });
    }
    let Some(path) = whitelist.or_else(|| {
        config
            .selection
            .whitelist
            .as_ref()
            .map(|p| base_dir.join(p))
    }) else {
        bail!("Nothing selected; pass --test-plan or --whitelist, or set [selection] in the config");
    };
    let include = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read whitelist: {}", path.display()))?;
    let exclude = match &config.selection.exclude {
        Some(p) => {
            let p = base_dir.join(p);
            std::fs::read_to_string(&p)
                .with_context(|| format!("Failed to read exclude list: {}", p.display()))?
        }
        None => String::new(),
    };
    let namespace = config
        .selection
        .namespace
        .clone()
        .or_else(|| config.providers.first().map(|p| p.namespace.clone()))
        .unwrap_or_default();
    Ok(SelectionSource::Whitelist {
        namespace,
        include,
        exclude,
    })
}

fn controller(config: &Config) -> LocalController {
    let controller = LocalController::new()
        .with_shell(&config.execution.shell)
        .with_launcher(&config.execution.sudo);
    match config.execution.job_timeout_secs {
        Some(secs) => controller.with_timeout(Duration::from_secs(secs)),
        None => controller,
    }
}

async fn execute(
    config: &Config,
    providers: &[Provider],
    session: SessionState,
    storage: SessionStorage,
    in_flight: Option<Option<InFlightPolicy>>,
    verbose: bool,
) -> Result<()> {
    let ctx = ExecutionContext::for_session(&storage)
        .with_providers(providers)
        .with_site_environment(config.environment.clone());
    let mut orchestrator = Orchestrator::new(
        session,
        storage,
        controller(config),
        ConsoleReporter::new(verbose),
        ctx,
    );

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current job");
            token.cancel();
        }
    });

    if let Some(policy) = in_flight {
        orchestrator.settle_in_flight(policy).await?;
    }
    let summary = orchestrator.run().await?;
    std::process::exit(summary.exit_code());
}

async fn run_session(
    config_path: &Path,
    test_plan: Option<String>,
    whitelist: Option<PathBuf>,
    title: Option<String>,
    verbose: bool,
) -> Result<()> {
    let (config, base_dir) = load(config_path)?;
    let (providers, catalogue) = catalogue(&config, &base_dir)?;
    let source = selection(&config, &base_dir, test_plan, whitelist)?;

    let title = title.or_else(|| config.session.title.clone());
    let mut session = SessionState::new(catalogue, SessionMetadata::new(title))
        .with_max_passes(config.session.max_resolution_passes);
    session.select(source)?;

    let storage = repository(&config)?.create()?;
    info!("Created session {}", storage.id());

    execute(&config, &providers, session, storage, None, verbose).await
}

async fn resume_session(
    config_path: &Path,
    id: &str,
    in_flight: Option<InFlightPolicy>,
    verbose: bool,
) -> Result<()> {
    let (config, base_dir) = load(config_path)?;
    let (providers, catalogue) = catalogue(&config, &base_dir)?;
    let storage = repository(&config)?.open(id)?;

    let session = match SessionState::load(&storage, catalogue) {
        Ok(Some(session)) => session,
        Ok(None) => bail!("Session {} has no checkpoint", id),
        Err(SessionError::Resume(e)) => {
            eprintln!("Session {} cannot be resumed: {}", id, e);
            eprintln!("Start a new session with `checkplan run` instead.");
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }
    .with_max_passes(config.session.max_resolution_passes);

    execute(
        &config,
        &providers,
        session,
        storage,
        Some(in_flight),
        verbose,
    )
    .await
}

fn list(config_path: &Path, what: ListTarget) -> Result<()> {
    let (config, base_dir) = load(config_path)?;
    match what {
        ListTarget::Units => {
            let (_, catalogue) = catalogue(&config, &base_dir)?;
            for unit in catalogue.iter() {
                println!("{:<10} {}", unit.kind(), unit.id());
            }
        }
        ListTarget::Plans => {
            let (_, catalogue) = catalogue(&config, &base_dir)?;
            for plan in catalogue.test_plans() {
                println!("{}  {}", plan.id, plan.name.as_deref().unwrap_or(""));
            }
        }
        ListTarget::Sessions => {
            for storage in repository(&config)?.list()? {
                match storage.load_checkpoint()? {
                    Some(data) => match SessionDocument::decode(&data) {
                        Ok(document) => {
                            let metadata = &document.session.metadata;
                            let flags: Vec<&str> =
                                metadata.flags.iter().map(String::as_str).collect();
                            println!(
                                "{}  {}  {}  [{}]",
                                storage.id(),
                                metadata.created_at.format("%Y-%m-%d %H:%M"),
                                metadata.title.as_deref().unwrap_or("-"),
                                flags.join(", ")
                            );
                        }
                        Err(e) => println!("{}  (unreadable: {})", storage.id(), e),
                    },
                    None => println!("{}  (no checkpoint)", storage.id()),
                }
            }
        }
    }
    Ok(())
}

fn validate(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)?;
    let providers = config.providers(&base_dir(config_path));
    let (catalogue, problems) = load_catalogue(&providers)?;

    println!("Configuration is valid!");
    println!();
    println!("Providers: {}", providers.len());
    for provider in &providers {
        println!("  {} ({})", provider.namespace(), provider.units_dir().display());
    }
    println!("Units: {}", catalogue.len());

    if problems.is_empty() {
        return Ok(());
    }
    println!();
    println!("Problems:");
    for problem in &problems {
        println!("  {}", problem);
    }
    std::process::exit(1);
}

fn remove_session(config_path: &Path, id: &str) -> Result<()> {
    let (config, _) = load(config_path)?;
    repository(&config)?.remove(id)?;
    println!("Removed session {}", id);
    Ok(())
}
