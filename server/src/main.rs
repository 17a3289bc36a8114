use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::filter::EnvFilter;
use url::Url;

use cirrus_server::buffers::MAX_BUFFER_WAIT;
use cirrus_server::coldtier::ColdTier;
use cirrus_server::{daemon, DedupEngine};

/// One cirrus storage server, serving a single cloud of the cluster.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TCP port to listen on.
    port: u16,

    /// Data root; the dedup index, recipe files and share containers are
    /// kept in DedupDB/, RecipeFiles/ and ShareContainers/ underneath.
    #[arg(long, default_value = "./meta")]
    root: PathBuf,

    /// A global log level to use when printing logs. `RUST_LOG` takes
    /// priority when set.
    #[arg(long)]
    log_level: Option<Level>,

    /// Object-store URL sealed recipe files are migrated to. Without it,
    /// recipe files stay local forever.
    #[arg(long, env = "CIRRUS_RECIPE_BACKEND")]
    recipe_backend: Option<Url>,

    /// Object-store URL sealed share containers are migrated to.
    #[arg(long, env = "CIRRUS_CONTAINER_BACKEND")]
    container_backend: Option<Url>,

    /// Local cache budget, in bytes, for each cold tier.
    #[arg(long, default_value_t = 1 << 30)]
    cache_size: u64,
}

fn cold_tier(
    url: &Url,
    cache_dir: PathBuf,
    cache_size: u64,
) -> anyhow::Result<Arc<ColdTier>> {
    std::fs::create_dir_all(&cache_dir)?;
    let (backend, base) = object_store::parse_url(url)?;
    Ok(ColdTier::new(cache_dir, cache_size, Arc::from(backend), base))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    let recipe_tier = cli
        .recipe_backend
        .as_ref()
        .map(|url| cold_tier(url, cli.root.join("RecipeFiles"), cli.cache_size))
        .transpose()?;
    let container_tier = cli
        .container_backend
        .as_ref()
        .map(|url| cold_tier(url, cli.root.join("ShareContainers"), cli.cache_size))
        .transpose()?;

    let engine = Arc::new(DedupEngine::open_with(
        &cli.root,
        MAX_BUFFER_WAIT,
        recipe_tier,
        container_tier,
    )?);

    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    info!(port = cli.port, root = %cli.root.display(), "cirrus-server listening");

    // Periodically flush user buffers that went idle, so data of
    // disconnected clients reaches disk without waiting for new traffic.
    let flusher = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let engine = engine.clone();
                let _ = tokio::task::spawn_blocking(move || engine.flush_idle()).await;
            }
        })
    };

    tokio::select! {
        r = daemon::serve(listener, engine.clone()) => r?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    flusher.abort();
    let engine = engine.clone();
    tokio::task::spawn_blocking(move || engine.flush_all()).await??;
    Ok(())
}
