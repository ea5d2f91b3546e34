use std::io::{BufRead, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio_postgres::NoTls;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use upkeep::{
    AlwaysConfirm, Config, Confirm, DATABASE_UPDATED, PgDatabase, RunRecord, Runner, Status,
    UpgradeUnit, mask_password,
};

/// Idempotent data-reconciliation units for relational databases.
#[derive(Parser, Debug)]
#[command(name = "upkeep", version)]
struct Cli {
    /// Database connection URL (defaults to DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Treat the schema as being at its current version, enabling units
    /// that require it
    #[arg(long, global = true)]
    assume_schema_current: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available units
    List,
    /// Report which units have something to do
    Check {
        /// Units to check (default: all runnable units)
        ids: Vec<String>,
    },
    /// Apply units that have something to do
    Run {
        /// Apply without asking for confirmation
        #[arg(long, short)]
        yes: bool,
        /// Units to run (default: all runnable units)
        ids: Vec<String>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Upkeep(#[from] upkeep::Error),

    #[error("invalid database URL: {0}")]
    Url(#[source] tokio_postgres::Error),

    #[error("failed to build connection pool: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    #[error("failed to connect: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("upkeep=info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let mut config = Config::from_env()?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    debug!(?config, "loaded configuration");

    let mut runner = Runner::new(upkeep::unit::build_all(&config));
    if cli.assume_schema_current {
        runner = runner.assume_satisfied(DATABASE_UPDATED);
    }

    match cli.command {
        Commands::List => {
            list(&runner);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { ids } => {
            let ids = select(&runner, ids);
            let plan = runner.plan(&ids)?;
            let conn = connect(&config).await?;
            let db = PgDatabase::new(conn);

            for unit in plan {
                let marker = if unit.necessary(&db).await? {
                    "needed".yellow().to_string()
                } else {
                    "no action needed".green().to_string()
                };
                println!("{:<40} {marker}", unit.id());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { yes, ids } => {
            let ids = select(&runner, ids);
            let plan = runner.plan(&ids)?;
            let conn = connect(&config).await?;
            let db = PgDatabase::new(conn);

            let progress = |line: &str| println!("  {line}");
            let records = if yes {
                runner.run(&db, &plan, &AlwaysConfirm, &progress).await
            } else {
                runner.run(&db, &plan, &Prompt, &progress).await
            };

            print_records(&records);
            let failed = records
                .iter()
                .any(|r| matches!(r.status, Status::Failed(_)));
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

fn list(runner: &Runner) {
    for unit in runner.units() {
        println!("{}", unit.id().bold());
        println!("  {}", unit.title());
        if !unit.description().is_empty() {
            println!("  {}", unit.description().dimmed());
        }
        if !unit.prerequisites().is_empty() {
            println!("  requires: {}", unit.prerequisites().join(", "));
        }
    }
}

/// With no ids given, every unit whose prerequisites can be met.
fn select(runner: &Runner, ids: Vec<String>) -> Vec<String> {
    if !ids.is_empty() {
        return ids;
    }
    runner
        .units()
        .filter(|unit| match runner.unmet_prerequisite(*unit) {
            Some(missing) => {
                eprintln!(
                    "{} skipping {}: requires {missing} (pass --assume-schema-current)",
                    "note:".cyan(),
                    unit.id()
                );
                false
            }
            None => true,
        })
        .map(|unit| unit.id().to_string())
        .collect()
}

async fn connect(config: &Config) -> Result<deadpool_postgres::Object, CliError> {
    let url = config.require_database_url()?;
    info!(database = %mask_password(url), "connecting");

    let pg_config: tokio_postgres::Config = url.parse().map_err(CliError::Url)?;
    let manager = deadpool_postgres::Manager::new(pg_config, NoTls);
    let pool = deadpool_postgres::Pool::builder(manager).max_size(1).build()?;
    Ok(pool.get().await?)
}

/// Asks on the terminal before each unit is applied.
struct Prompt;

impl Confirm for Prompt {
    fn confirm(&self, unit: &dyn UpgradeUnit) -> bool {
        println!("{}", unit.title().bold());
        if !unit.description().is_empty() {
            println!("{}", unit.description());
        }
        print!("Apply {}? [y/N] ", unit.id());
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes"),
            Err(_) => false,
        }
    }
}

fn print_records(records: &[RunRecord]) {
    println!();
    for record in records {
        let status = match &record.status {
            Status::Applied(_) => record.status.green().to_string(),
            Status::Failed(_) => record.status.red().to_string(),
            Status::Declined | Status::Blocked => record.status.yellow().to_string(),
            Status::NotNecessary => record.status.dimmed().to_string(),
        };
        println!("{:<40} {status}", record.id);
    }
}
