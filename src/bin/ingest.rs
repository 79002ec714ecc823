use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use carcrawl::embedder::EmbeddingArgs;
use carcrawl::orchestrator::http_client;
use carcrawl::store::StoreArgs;
use carcrawl::{
    ControlArgs, EmbeddingIndexer, FetchOrchestrator, IngestPipeline, MemoryStore, VehicleStore,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "carcrawl-ingest",
    about = "Scrape vehicle marketplaces, embed the listings and upsert them into pgvector"
)]
struct IngestCli {
    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    controls: ControlArgs,

    /// Only fill in missing embeddings for stored rows, then exit
    #[arg(long)]
    reembed: bool,

    /// Rows fetched per re-embedding batch
    #[arg(long, env = "CARCRAWL_REEMBED_BATCH", default_value_t = 50)]
    reembed_batch: usize,

    /// Deactivate listings not refreshed for this many hours after each cycle
    #[arg(long, env = "CARCRAWL_DEACTIVATE_AFTER_HOURS")]
    deactivate_after_hours: Option<u32>,

    /// Repeat the cycle every N minutes instead of exiting after one
    #[arg(long, env = "CARCRAWL_EVERY_MINS")]
    every_mins: Option<u64>,

    /// Keep results in memory instead of Postgres. Embeds only when an OpenAI key is set;
    /// listings whose embedding fails are kept without one
    #[arg(long)]
    dry_run: bool,

    /// Store listings whose embedding failed without a vector, for a later --reembed
    #[arg(long, env = "CARCRAWL_STORE_UNEMBEDDED")]
    store_unembedded: bool,

    /// Skip creating the extension, table and indexes
    #[arg(long, env = "CARCRAWL_SKIP_PREPARE")]
    skip_prepare: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = IngestCli::parse();
    init_logging(cli.verbose);

    let store: Arc<dyn VehicleStore> = if cli.dry_run {
        info!("dry run: listings stay in memory");
        Arc::new(MemoryStore::new())
    } else {
        let prepare = (!cli.skip_prepare).then_some(cli.embedding.embedding_dims);
        Arc::new(cli.store.connect(prepare).await?)
    };
    let embedder = cli.embedding.build_embedder()?;
    let indexer = EmbeddingIndexer::new(embedder, store.clone(), cli.embedding.timeout())
        .with_unembedded_writes(cli.dry_run || cli.store_unembedded);

    if cli.reembed {
        anyhow::ensure!(
            cli.embedding.api_key().is_some(),
            "--reembed needs --openai-api-key (or OPENAI_API_KEY)"
        );
        let report = indexer.reembed_missing(cli.reembed_batch).await?;
        println!(
            "Re-embedded {} row{} ({} failed).",
            report.embedded,
            if report.embedded == 1 { "" } else { "s" },
            report.failed
        );
        return Ok(());
    }

    let controls = cli.controls.build_controls();
    let client =
        http_client(controls.page_timeout()).context("failed to build marketplace HTTP client")?;
    let mut pipeline = IngestPipeline::new(
        FetchOrchestrator::for_live_sources(client, controls),
        indexer,
    );
    if let Some(hours) = cli.deactivate_after_hours {
        pipeline =
            pipeline.with_deactivation(store.clone(), chrono::Duration::hours(hours.into()));
    }

    let Some(minutes) = cli.every_mins else {
        let report = pipeline.run().await?;
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to render ingest report")?
        );
        return Ok(());
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(minutes.max(1) * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match pipeline.run().await {
            Ok(report) => info!(
                stored = report.index.stored(),
                deactivated = report.deactivated,
                "scheduled cycle finished"
            ),
            Err(err) => error!(error = %err, "scheduled cycle aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_needs_no_api_key() {
        let cli =
            IngestCli::try_parse_from(["carcrawl-ingest", "--dry-run", "--openai-api-key", ""])
                .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.embedding.api_key(), None);
        assert!(cli.embedding.build_embedder().is_ok());
    }
}
