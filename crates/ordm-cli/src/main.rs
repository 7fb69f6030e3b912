use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ordm_config::load_layered_yaml;
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "ordm")]
#[command(about = "Ordinals allocation & settlement engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> overrides...)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Stuck-transaction detection and resolution
    Stuck {
        #[command(subcommand)]
        cmd: StuckCmd,
    },

    /// Phase maintenance
    Phase {
        #[command(subcommand)]
        cmd: PhaseCmd,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum StuckCmd {
    /// Run one detector sweep now and print its counters.
    Sweep {
        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,
    },

    /// List open stuck records.
    List,

    /// Apply an operator action to an open stuck record.
    Resolve {
        #[arg(long)]
        stuck_id: String,

        /// mark-resolved | abandon | rbf | cpfp
        #[arg(long)]
        action: String,

        /// Required for rbf/cpfp (sat/vB)
        #[arg(long)]
        target_fee_rate: Option<f64>,

        #[arg(long = "config")]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PhaseCmd {
    /// Rebuild a phase's minted counters from reveal-broadcast mints.
    Recount {
        #[arg(long)]
        phase_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    // stdout carries key=value results; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = ordm_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = ordm_db::status(&pool).await?;
                    println!("db_ok={} has_ledger_tables={}", s.ok, s.has_ledger_tables);
                }
                DbCmd::Migrate => {
                    ordm_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Stuck { cmd } => match cmd {
            StuckCmd::Sweep { config_paths } => {
                let cfg = commands::load_engine_config(&config_paths)?;
                let engine = commands::engine_from_env(&cfg).await?;
                commands::stuck::sweep_once(&engine).await?;
            }
            StuckCmd::List => {
                let cfg = commands::load_engine_config(&[])?;
                let engine = commands::engine_from_env(&cfg).await?;
                commands::stuck::list_open(&engine).await?;
            }
            StuckCmd::Resolve {
                stuck_id,
                action,
                target_fee_rate,
                config_paths,
            } => {
                let stuck_id = Uuid::parse_str(&stuck_id).context("invalid --stuck-id")?;
                let action = commands::parse_action(&action, target_fee_rate)?;
                let cfg = commands::load_engine_config(&config_paths)?;
                let engine = commands::engine_from_env(&cfg).await?;
                commands::stuck::resolve(&engine, stuck_id, &action).await?;
            }
        },

        Commands::Phase { cmd } => match cmd {
            PhaseCmd::Recount { phase_id } => {
                let phase_id = Uuid::parse_str(&phase_id).context("invalid --phase-id")?;
                let engine = commands::engine_from_env(&commands::load_engine_config(&[])?).await?;
                let counts = engine.recount_phase(phase_id).await?;
                println!(
                    "phase_id={} minted_count={} entries_updated={}",
                    counts.phase_id, counts.minted_count, counts.entries_updated
                );
            }
        },
    }

    Ok(())
}
