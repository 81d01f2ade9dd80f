//! Overlays a writable checkout with a symlink forest into a mounted
//! workspace, touching changed files so incremental builds notice.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use clap::Parser;
use filetime::FileTime;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use slothfs::gitiles;
use slothfs::populate;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a workspace inside the slothfs mount.
    #[arg(long)]
    ro: Option<PathBuf>,

    /// Sync the checkout to the latest manifest version.
    #[arg(long)]
    sync: bool,

    /// The slothfs mount point for --sync. Autodetected if empty.
    #[arg(long)]
    mount: Option<PathBuf>,

    /// Branch to use for --sync.
    #[arg(long, default_value = "master")]
    sync_branch: String,

    /// Repository holding the manifest, for --sync.
    #[arg(long, default_value = "platform/manifest")]
    sync_repo: String,

    /// URL of the Gitiles service.
    #[arg(long, default_value = "https://android.googlesource.com")]
    gitiles_url: String,

    /// User-Agent to report to Gitiles.
    #[arg(long, default_value = "slothfs")]
    gitiles_agent: String,

    /// Maximum sustained QPS to send to Gitiles.
    #[arg(long, default_value_t = 4.0)]
    gitiles_qps: f64,

    /// Path to a cURL-style cookie jar.
    #[arg(long)]
    cookies: Option<PathBuf>,

    /// The writable checkout to populate. Defaults to the current directory.
    dir: Option<PathBuf>,
}

/// Fetches the current manifest and configures a fresh workspace for it
/// through the config/ symlink protocol. Returns the workspace path.
async fn sync_manifest(cli: &Cli, mount: &Path) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    let client = gitiles::Client::new(gitiles::Options {
        address: cli.gitiles_url.clone(),
        sustained_qps: cli.gitiles_qps,
        burst_qps: 0,
        cookie_jar: cli.cookies.clone(),
        user_agent: cli.gitiles_agent.clone(),
        debug: false,
    })?;

    let mut mf = populate::fetch_manifest(&client, &cli.sync_repo, &cli.sync_branch).await?;
    mf.filter();
    populate::deref_manifest(&client, &mut mf).await?;

    let xml = mf.marshal_xml()?;
    let tmp = tempfile::NamedTempFile::new()?;
    std::fs::write(tmp.path(), &xml)?;

    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let name = format!("S{}", secs);

    info!(workspace = %name, "fetched manifest; configuring workspace");
    std::os::unix::fs::symlink(tmp.path(), mount.join("config").join(&name))?;

    Ok(mount.join(name))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .init();

    let cli = Cli::parse();
    let dir = cli.dir.clone().unwrap_or_else(|| PathBuf::from("."));

    let ro = if cli.sync {
        let mount = match &cli.mount {
            Some(m) => m.clone(),
            None => populate::find_slothfs_mount()
                .ok_or("could not autodetect mount point; pass --mount")?,
        };
        sync_manifest(&cli, &mount).await?
    } else {
        cli.ro
            .clone()
            .ok_or("no readonly checkout given; specify --ro DIR or --sync")?
    };

    info!(ro = %ro.display(), "creating symlinks");
    let (added, changed) = populate::checkout(&ro, &dir).await?;

    if changed.is_empty() {
        info!(
            added = added.len(),
            "no files were changed; assuming fresh checkout"
        );
        return Ok(());
    }

    let now = FileTime::from_system_time(SystemTime::now());
    let mut touched = 0usize;
    for path in added.iter().chain(changed.iter()) {
        match filetime::set_file_mtime(path, now) {
            Ok(()) => touched += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Broken symlinks into the workspace are expected; anything
                // else is a real error.
                let meta = std::fs::symlink_metadata(path);
                if !matches!(&meta, Ok(m) if m.file_type().is_symlink()) {
                    return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>);
                }
            }
            Err(e) => return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
        }
    }
    info!(touched, "touched files");

    Ok(())
}
