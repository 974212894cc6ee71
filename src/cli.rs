use clap::{Parser, Subcommand};

/// crawl engine cli
#[derive(Parser)]
#[command(name = "crawlcore")]
#[command(about = "A bounded, polite, observable web crawl engine")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a single crawl against the in-memory store
    Crawl {
        /// Seed URL to start from
        #[arg(short, long)]
        seed: String,

        /// Maximum link depth (0 = unlimited)
        #[arg(long, default_value = "3")]
        max_depth: u32,

        /// Stop after this many fetched pages (0 = unlimited)
        #[arg(long, default_value = "200")]
        max_pages: u64,

        /// Wall-clock budget in seconds (0 = unlimited)
        #[arg(long, default_value = "60")]
        time_budget: u64,

        /// Links extracted per page (0 = unlimited)
        #[arg(long, default_value = "200")]
        max_links_per_page: usize,

        /// Concurrent fetches across all hosts
        #[arg(short, long, default_value = "32")]
        global_concurrency: usize,

        /// Concurrent fetches per host
        #[arg(long, default_value = "2")]
        per_host_concurrency: usize,

        /// User-Agent header
        #[arg(long, default_value = "crawlcore/0.1")]
        user_agent: String,

        /// Skip robots.txt checks
        #[arg(long)]
        ignore_robots: bool,

        /// Print one telemetry frame per line as JSON
        #[arg(long)]
        frames: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
