use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cgtw-admin")]
#[command(about = "CG telemetry writer admin CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database schema commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Parse a config file and report the resolved values (no connections made).
    ConfigCheck {
        /// Path to the YAML config file.
        path: String,
    },

    /// Run one retention sweep against the configured database and exit.
    Cleanup {
        /// Path to the YAML config file.
        #[arg(long, default_value = "config.yml")]
        config: String,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    /// Report whether the pool is reachable and migrations are up to date.
    Status,
    /// Apply pending migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = cgtw_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = cgtw_db::status(&pool).await?;
                    println!("db_ok={} has_history_table={}", s.ok, s.has_history_table);
                }
                DbCmd::Migrate => {
                    cgtw_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::ConfigCheck { path } => {
            let cfg = cgtw_config::load_config(&path)?;
            println!("mqtt_host={}", cfg.mqtt.host);
            println!("mqtt_port={}", cfg.mqtt.port);
            println!("postgres_dbname={}", cfg.postgres.dbname);
            println!("ingest_worker_count={}", cfg.ingest.worker_count);
            println!("retention_cleanup_interval_hours={}", cfg.retention.cleanup_interval_hours);
        }

        Commands::Cleanup { config } => {
            let cfg = cgtw_config::load_config(&config)?;
            let pool = cgtw_db::connect(&cfg.postgres).await?;
            cgtw_db::migrate(&pool).await?;
            let counts = cgtw_retention::cleanup_once(&pool, &cfg.retention).await?;
            println!(
                "deleted_gps_raw={} deleted_history={} deleted_events={}",
                counts.gps_raw, counts.history, counts.events
            );
        }
    }

    Ok(())
}
