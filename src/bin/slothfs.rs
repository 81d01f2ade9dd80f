//! The serving process: mounts the multi-workspace filesystem.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use slothfs::cache::{Cache, Options as CacheOptions};
use slothfs::fs::{self, fuse::FuseDaemon, MultiFsOptions, SlothFs};
use slothfs::gitiles;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Cache root directory.
    #[arg(long, env = "SLOTHFS_CACHE")]
    cache: Option<PathBuf>,

    /// Directory holding workspace manifests and clone.json.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a cURL-style cookie jar.
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// URL of the Gitiles service.
    #[arg(long, default_value = "https://android.googlesource.com")]
    gitiles_url: String,

    /// User-Agent to report to Gitiles.
    #[arg(long, default_value = "slothfs")]
    gitiles_agent: String,

    /// Maximum sustained QPS to send to Gitiles.
    #[arg(long, default_value_t = 4.0)]
    gitiles_qps: f64,

    /// Log FUSE traffic.
    #[arg(long)]
    debug: bool,

    /// Number of FUSE serving threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Where to mount the filesystem.
    mountpoint: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new(default_level)),
            ),
        )
        .init();

    let cache_dir = match cli.cache {
        Some(dir) => dir,
        None => home_cache_dir()?,
    };
    let cache = Cache::new(
        &cache_dir,
        CacheOptions {
            fetch_frequency: Some(std::time::Duration::from_secs(12 * 3600)),
        },
    )?;

    let client = gitiles::Client::new(gitiles::Options {
        address: cli.gitiles_url,
        sustained_qps: cli.gitiles_qps,
        burst_qps: 0,
        cookie_jar: cli.cookies,
        user_agent: cli.gitiles_agent,
        debug: cli.debug,
    })?;

    let mut options = MultiFsOptions {
        manifest_dir: cli.config.clone(),
        ..Default::default()
    };
    if let Some(config_dir) = &cli.config {
        let clone_json = config_dir.join("clone.json");
        if clone_json.exists() {
            let contents = std::fs::read(&clone_json)?;
            let (repo, file) = fs::read_config(&contents)?;
            options.repo_clone_rules = repo;
            options.file_clone_rules = file;
        }
    }

    let root = SlothFs::new(cache, client, options);
    root.configure_workspaces().await?;

    let daemon = FuseDaemon::new(root, &cli.mountpoint, cli.threads, false)?;
    info!(mountpoint = %cli.mountpoint.display(), "serving");

    // Unmounts cleanly on ctrl-c; otherwise serve until unmounted from
    // outside.
    let served = {
        let daemon = daemon.clone();
        tokio::task::spawn_blocking(move || daemon.wait())
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            daemon.unmount()?;
        }
        res = served => {
            res?;
        }
    }

    Ok(())
}

fn home_cache_dir() -> Result<PathBuf, std::io::Error> {
    let home = std::env::var_os("HOME").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "HOME is not set; pass --cache")
    })?;
    Ok(PathBuf::from(home).join(".cache").join("slothfs"))
}
