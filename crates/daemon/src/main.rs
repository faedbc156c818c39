use clap::Parser;
use scratchfs_daemon::{Config, Daemon};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[clap(name = "scratchfsd", about = "scratchfs chunk data daemon")]
struct Opt {
    #[clap(short = 'c', long = "config", help = "Config file path")]
    config_file: Option<PathBuf>,

    #[clap(short = 'l', long = "listen", env = "SCRATCHFS_LISTEN_ADDR", help = "Listen address (overrides config)")]
    listen_addr: Option<String>,

    #[clap(short = 'r', long = "root", env = "SCRATCHFS_ROOT_PATH", help = "Chunk data root (overrides config)")]
    root_path: Option<String>,

    #[clap(long = "host-id", env = "SCRATCHFS_HOST_ID", help = "This daemon's id (overrides config)")]
    host_id: Option<u32>,

    #[clap(long = "host-count", env = "SCRATCHFS_HOST_COUNT", help = "Cluster size (overrides config)")]
    host_count: Option<u32>,

    #[clap(long = "chunk-size", env = "SCRATCHFS_CHUNK_SIZE", help = "Chunk size in bytes (overrides config)")]
    chunk_size: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with({
            let is_terminal = std::io::stdout().is_terminal();
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_ansi(false)
                .with_level(is_terminal)
                .with_target(is_terminal)
        })
        .init();

    let opt = Opt::parse();

    let mut cfg: Config = match opt.config_file {
        Some(config_file) => ::config::Config::builder()
            .add_source(::config::File::from(config_file).required(true))
            .add_source(::config::Environment::with_prefix("SCRATCHFS"))
            .build()?
            .try_deserialize()?,
        None => ::config::Config::builder()
            .add_source(::config::Environment::with_prefix("SCRATCHFS"))
            .build()?
            .try_deserialize()
            .unwrap_or_default(),
    };

    // CLI overrides
    if let Some(listen_addr) = opt.listen_addr {
        cfg.listen_addr = listen_addr;
    }
    if let Some(root_path) = opt.root_path {
        cfg.root_path = root_path;
    }
    if let Some(host_id) = opt.host_id {
        cfg.host_id = host_id;
    }
    if let Some(host_count) = opt.host_count {
        cfg.host_count = host_count;
    }
    if let Some(chunk_size) = opt.chunk_size {
        cfg.chunk_size = chunk_size;
    }

    tracing::info!(
        listen = %cfg.listen_addr,
        root = %cfg.root_path,
        host_id = cfg.host_id,
        host_count = cfg.host_count,
        chunk_size = cfg.chunk_size,
        "starting scratchfs daemon"
    );

    let daemon = Daemon::bind(&cfg).await?;
    daemon.run().await?;
    Ok(())
}
