use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::Level;
use tracing_subscriber::filter::EnvFilter;

use cirrus_client::config::{ClientConfig, ClusterConfig};
use cirrus_client::{download, upload};
use cirrus_dispersal::crypto::CryptoSuite;

/// The cirrus client: disperse files across the cluster's clouds and
/// restore them from any k of them.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Numeric user identity; deduplication and file ownership are scoped
    /// by it.
    #[arg(long, short = 'u')]
    user: u32,

    /// Cluster config file, one <host>:<port> per cloud in order.
    #[arg(long, default_value = "./config")]
    config: PathBuf,

    /// Crypto strength: high = SHA-256/AES-256, low = MD5/AES-128.
    #[arg(long, value_enum, default_value_t = Security::High)]
    security: Security,

    /// A global log level to use when printing logs. `RUST_LOG` takes
    /// priority when set.
    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Security {
    High,
    Low,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, encode and upload a file.
    Upload {
        path: PathBuf,

        /// Run the chunk and encode stages only; nothing is uploaded.
        #[arg(long)]
        encode_only: bool,
    },
    /// Download and reassemble a file.
    Download {
        path: PathBuf,

        /// Where to write the reassembled bytes.
        #[arg(long, short = 'o', default_value = "./decoded_copy")]
        output: PathBuf,

        /// File version: 0 is the newest, -1 the one before, and so on.
        #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
        version: i32,
    },
    /// Upload a file and immediately download it again.
    Both {
        path: PathBuf,

        #[arg(long, short = 'o', default_value = "./decoded_copy")]
        output: PathBuf,
    },
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

    let mut config = ClientConfig {
        suite: match cli.security {
            Security::High => CryptoSuite::High,
            Security::Low => CryptoSuite::Low,
        },
        ..ClientConfig::default()
    };
    let cluster = ClusterConfig::load(&cli.config)?;

    match cli.command {
        Commands::Upload { path, encode_only } => {
            config.encode_only = encode_only;
            upload::upload_file(&config, &cluster, cli.user, &path).await?;
        }
        Commands::Download {
            path,
            output,
            version,
        } => {
            download::download_file(&config, &cluster, cli.user, &path, version, &output).await?;
        }
        Commands::Both { path, output } => {
            upload::upload_file(&config, &cluster, cli.user, &path).await?;
            download::download_file(&config, &cluster, cli.user, &path, 0, &output).await?;
        }
    }
    Ok(())
}
