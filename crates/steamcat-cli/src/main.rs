mod ids;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use steamcat_adapters::{AppIdLookup, DetailLookup, FullLookup, Lookup, ReviewLookup};
use steamcat_core::{AppId, CheckpointRecord};
use steamcat_storage::Pacer;
use steamcat_sync::{BatchConfig, ResumableRunner, SyncConfig};
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "steamcat")]
#[command(about = "Resumable Steam catalog + review harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve game titles to Steam app ids.
    Appids {
        /// Titles, one per line.
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Aggregate review scores per app id.
    Reviews {
        #[command(flatten)]
        ids: AppIdSource,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Catalog details per app id.
    Details {
        #[command(flatten)]
        ids: AppIdSource,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Reviews and details per app id in one pass.
    Full {
        #[command(flatten)]
        ids: AppIdSource,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Print the app id for each title without checkpointing.
    Lookup {
        #[arg(required = true)]
        titles: Vec<String>,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Checkpoint CSV; resumed if it already exists.
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    workers: Option<usize>,
}

impl RunArgs {
    fn output_or(&self, default: &str) -> PathBuf {
        self.output.clone().unwrap_or_else(|| PathBuf::from(default))
    }

    fn batch_config(&self, defaults: BatchConfig) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            workers: self.workers.unwrap_or(defaults.workers),
        }
    }
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct AppIdSource {
    /// App ids, one per line.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Resolved ids from an `appids` checkpoint.
    #[arg(long)]
    from_appids: Option<PathBuf>,
}

impl AppIdSource {
    async fn load(&self) -> Result<Vec<AppId>> {
        match (&self.input, &self.from_appids) {
            (Some(path), _) => ids::read_app_ids(path),
            (None, Some(path)) => ids::app_ids_from_checkpoint(path).await,
            (None, None) => anyhow::bail!("either --input or --from-appids is required"),
        }
    }
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))
}

async fn run_checkpointed<L: Lookup + 'static>(
    lookup: L,
    ids: Vec<<L::Record as CheckpointRecord>::Key>,
    output: PathBuf,
    config: BatchConfig,
) -> Result<()> {
    let runner = ResumableRunner::builder(config)
        .fetcher(Arc::new(lookup))
        .output(&output)
        .build()?;
    let outcome = runner
        .run(ids)
        .await
        .with_context(|| format!("running into {}", output.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.summary).context("encoding run summary")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let client = config.steam_client()?;

    match cli.command {
        Commands::Appids { input, run } => {
            let titles = ids::read_lines(&input)?;
            run_checkpointed(
                AppIdLookup::new(client),
                titles,
                run.output_or("steam_appids.csv"),
                run.batch_config(BatchConfig::APP_IDS),
            )
            .await?;
        }
        Commands::Reviews { ids, run } => {
            run_checkpointed(
                ReviewLookup::new(client),
                ids.load().await?,
                run.output_or("steam_reviews.csv"),
                run.batch_config(BatchConfig::REVIEWS),
            )
            .await?;
        }
        Commands::Details { ids, run } => {
            run_checkpointed(
                DetailLookup::new(client, Pacer::new(config.detail_pacing())),
                ids.load().await?,
                run.output_or("steam_details.csv"),
                run.batch_config(BatchConfig::DETAILS),
            )
            .await?;
        }
        Commands::Full { ids, run } => {
            run_checkpointed(
                FullLookup::new(client, Pacer::new(config.detail_pacing())),
                ids.load().await?,
                run.output_or("steam_full.csv"),
                run.batch_config(BatchConfig::FULL),
            )
            .await?;
        }
        Commands::Lookup { titles } => {
            for (title, appid) in client.lookup_app_ids(&titles).await {
                match appid {
                    Some(appid) => println!("{title}\t{appid}"),
                    None => println!("{title}\t-"),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_variant_defaults() {
        let cli = Cli::parse_from([
            "steamcat",
            "details",
            "--from-appids",
            "appids.csv",
            "--workers",
            "4",
        ]);
        let Commands::Details { ids, run } = cli.command else {
            panic!("expected details subcommand");
        };
        assert_eq!(ids.from_appids, Some(PathBuf::from("appids.csv")));
        assert!(ids.input.is_none());
        assert_eq!(
            run.batch_config(BatchConfig::DETAILS),
            BatchConfig {
                batch_size: 100,
                workers: 4
            }
        );
        assert_eq!(run.output_or("steam_details.csv"), PathBuf::from("steam_details.csv"));
    }

    #[test]
    fn review_ids_require_exactly_one_source() {
        assert!(Cli::try_parse_from(["steamcat", "reviews"]).is_err());
        assert!(Cli::try_parse_from([
            "steamcat",
            "reviews",
            "--input",
            "ids.txt",
            "--from-appids",
            "appids.csv"
        ])
        .is_err());
    }
}
