use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use custrecon_sync::{ExtractConfig, ExtractionPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "custrecon-cli")]
#[command(about = "Extract unique customers from order documents into a customer index")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan the source index once and upsert one document per customer.
    Extract(ExtractArgs),
}

#[derive(Debug, Default, Args)]
struct ExtractArgs {
    /// Index holding the order documents.
    #[arg(long)]
    source_index: Option<String>,
    /// Index receiving one document per customer.
    #[arg(long)]
    destination_index: Option<String>,
    #[arg(long)]
    page_size: Option<usize>,
    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json: bool,
}

impl ExtractArgs {
    fn apply(&self, mut config: ExtractConfig) -> ExtractConfig {
        if let Some(index) = &self.source_index {
            config.source_index = index.clone();
        }
        if let Some(index) = &self.destination_index {
            config.destination_index = index.clone();
        }
        if let Some(page_size) = self.page_size {
            config.page_size = page_size.max(1);
        }
        config
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli
        .command
        .unwrap_or_else(|| Commands::Extract(ExtractArgs::default()))
    {
        Commands::Extract(args) => {
            let config = args.apply(ExtractConfig::from_env());
            info!(store = ?config.store, "loaded extraction config");

            let pipeline = ExtractionPipeline::from_config(config)
                .context("building extraction pipeline")?;
            let summary = pipeline.run_once().await.context("customer extraction failed")?;

            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("serializing run summary")?
                );
            } else {
                println!(
                    "extract complete: run_id={} customers={} pages={} scanned={} rejected={} duplicates={}",
                    summary.run_id,
                    summary.processed,
                    summary.pages,
                    summary.documents_scanned,
                    summary.rejected,
                    summary.duplicates
                );
            }
        }
    }

    Ok(())
}
