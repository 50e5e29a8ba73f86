use anyhow::Result;
use buildsdb_sync::{list_groups, open_existing_store, set_groups_enabled, GroupFilter, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "buildsdb")]
#[command(about = "Package build-farm status database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch build data from the build servers and import it
    Fetch,
    /// List known master builds
    #[command(alias = "show-masterbuilds")]
    ShowGroups {
        #[arg(value_enum)]
        filter: Option<FilterArg>,
    },
    /// Enable master builds whose name contains any pattern (tier1/tier2 accepted)
    #[command(alias = "enable-masterbuilds")]
    EnableGroups {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
    /// Disable master builds whose name contains any pattern (tier1/tier2 accepted)
    #[command(alias = "disable-masterbuilds")]
    DisableGroups {
        #[arg(required = true)]
        patterns: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FilterArg {
    Enabled,
    Disabled,
}

impl From<FilterArg> for GroupFilter {
    fn from(value: FilterArg) -> Self {
        match value {
            FilterArg::Enabled => GroupFilter::Enabled,
            FilterArg::Disabled => GroupFilter::Disabled,
        }
    }
}

async fn toggle_groups(config: &SyncConfig, operation: &str, patterns: &[String], enabled: bool) -> Result<()> {
    let pool = open_existing_store(&config.database_path, operation).await?;
    let changed = set_groups_enabled(&pool, patterns, enabled).await?;
    pool.close().await;
    info!(changed, "{operation} done");
    println!("{operation}: {changed} master build(s) updated");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Fetch) {
        Commands::Fetch => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} servers={} groups={} builds={} written={} waived={} failed={}",
                summary.run_id,
                summary.servers,
                summary.groups,
                summary.builds_seen,
                summary.builds_written,
                summary.builds_waived,
                summary.failures.len()
            );
            for failure in &summary.failures {
                eprintln!("not imported: {failure}");
            }
        }
        Commands::ShowGroups { filter } => {
            let pool = open_existing_store(&config.database_path, "show-groups").await?;
            let filter = filter.map(GroupFilter::from).unwrap_or_default();
            let groups = list_groups(&pool, filter).await?;
            pool.close().await;
            for group in groups {
                println!(
                    "{:<40} {:<8} {}",
                    group.name,
                    if group.enabled { "enabled" } else { "disabled" },
                    group.server
                );
            }
        }
        Commands::EnableGroups { patterns } => {
            toggle_groups(&config, "enable-groups", &patterns, true).await?;
        }
        Commands::DisableGroups { patterns } => {
            toggle_groups(&config, "disable-groups", &patterns, false).await?;
        }
    }

    Ok(())
}
