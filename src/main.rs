use std::sync::Arc;

use crawlcore::cli::{Cli, Commands};
use crawlcore::config::{CrawlerDefaults, RunConfig};
use crawlcore::metrics::Metrics;
use crawlcore::run_manager::RunManager;
use crawlcore::storage::{MemoryStore, Store};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Crawl {
            seed,
            max_depth,
            max_pages,
            time_budget,
            max_links_per_page,
            global_concurrency,
            per_host_concurrency,
            user_agent,
            ignore_robots,
            frames,
        } => {
            let store = Arc::new(MemoryStore::new());
            let metrics = Metrics::new();
            let manager = RunManager::new(
                store.clone(),
                CrawlerDefaults::default(),
                Arc::clone(&metrics),
            );

            let cfg = RunConfig {
                seed_url: seed,
                max_depth,
                max_pages,
                time_budget_secs: time_budget,
                max_links_per_page,
                global_concurrency,
                per_host_concurrency,
                user_agent,
                respect_robots: !ignore_robots,
                ..Default::default()
            };

            let run_id = manager.create_run(cfg).await?;
            manager.start_run(run_id).await?;
            tracing::info!(%run_id, "crawl started");

            let engine = manager
                .engine_for(run_id)
                .ok_or("engine missing after start")?;
            let mut subscription = manager
                .telemetry_for(run_id)
                .ok_or("telemetry missing after start")?
                .subscribe();

            loop {
                tokio::select! {
                    _ = engine.done() => break,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("interrupt, stopping run");
                        engine.stop();
                    }
                    frame = subscription.next_frame() => {
                        if frames {
                            if let Some(frame) = frame {
                                println!("{}", serde_json::to_string(&frame)?);
                            }
                        }
                    }
                }
            }

            let summary = store.get_run_summary(run_id).await?;
            let run = store.get_run(run_id).await?;
            tracing::info!(
                pages_fetched = summary.pages_fetched,
                pages_failed = summary.pages_failed,
                unique_hosts = summary.unique_hosts,
                total_bytes = summary.total_bytes,
                stop_reason = run.stop_reason.as_deref().unwrap_or("unknown"),
                "crawl finished"
            );
        }
    }
    Ok(())
}
