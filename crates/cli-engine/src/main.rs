use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use engine::{
    AdminState, CompatOverride, EngineConfig, FfmpegCodec, MediaCapabilities, MediaStore,
    MediaVfs, OpenRequest, RequestingApp, VideoCodec,
};
use humansize::{format_size, DECIMAL};
use log::{info, warn};
use walkdir::WalkDir;

/// Media file extensions the scan considers
const MEDIA_EXTENSIONS: &[&str] = &["mp4", "m4v", "mov", "3gp"];

/// Seamless transcode engine: diagnostic scan and policy dry-run
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan the eligible roots and report every transcode candidate
    Scan,
    /// Dry-run the policy decision for one file and one requesting app
    Decide {
        /// File to evaluate
        path: PathBuf,

        /// UID of the requesting app
        #[arg(long, default_value_t = 10_000)]
        uid: u32,

        /// Package name of the requesting app
        #[arg(long, default_value = "com.example.app")]
        package: String,

        /// App declares HEVC support in its manifest
        #[arg(long)]
        manifest_hevc: bool,

        /// Request carries the accept-original-format directive
        #[arg(long)]
        accept_original: bool,

        /// Leave seamless transcoding disabled for the app
        #[arg(long)]
        not_enabled: bool,

        /// Apply a force-original compatibility override to the package
        #[arg(long, conflicts_with = "force_transcode")]
        force_original: bool,

        /// Apply a force-transcode compatibility override to the package
        #[arg(long, conflicts_with = "force_original")]
        force_transcode: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger - use RUST_LOG env var or default to info level
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .init();

    let args = Args::parse();

    let cfg = EngineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command {
        Command::Scan => scan(&cfg),
        Command::Decide {
            path,
            uid,
            package,
            manifest_hevc,
            accept_original,
            not_enabled,
            force_original,
            force_transcode,
        } => {
            let admin = AdminState::new();
            if !not_enabled {
                admin.set_seamless_enabled(true);
                admin.enable_for_uid(uid);
            }
            if force_original {
                admin.set_compat_override(&package, CompatOverride::ForceOriginal);
            }
            if force_transcode {
                admin.set_compat_override(&package, CompatOverride::ForceTranscode);
            }

            let vfs = build_vfs(&cfg, admin)?;
            vfs.stage(&path)
                .with_context(|| format!("Failed to stage {}", path.display()))?;

            let mut app = RequestingApp::new(uid, &package);
            if manifest_hevc {
                app = app.with_manifest(MediaCapabilities::none().with_video(VideoCodec::Hevc));
            }
            let request = if accept_original {
                OpenRequest::accepting_original(true)
            } else {
                OpenRequest::default()
            };

            let decision = vfs.decide(&path, &app, &request)?;
            println!("{}: {:?}", path.display(), decision.action);
            for reason in &decision.reasons {
                println!("  - {reason}");
            }
            Ok(())
        }
    }
}

fn build_vfs(cfg: &EngineConfig, admin: AdminState) -> Result<MediaVfs> {
    let codec = Arc::new(FfmpegCodec::new(&cfg.ffmpeg_bin, cfg.chunk_bytes));
    MediaVfs::new(cfg, Arc::new(MediaStore::new()), codec, admin)
        .context("Failed to initialize the transcode engine")
}

fn scan(cfg: &EngineConfig) -> Result<()> {
    // Scan decisions assume a legacy app with transcoding enabled, which is
    // the case the eligible roots exist for
    let admin = AdminState::new();
    admin.set_seamless_enabled(true);
    admin.enable_for_package("com.example.legacy");
    let vfs = build_vfs(cfg, admin)?;
    let app = RequestingApp::new(10_000, "com.example.legacy");

    let mut candidates = 0;
    let mut passthrough = 0;

    for root in &cfg.eligible_roots {
        if !root.exists() {
            warn!("Eligible root does not exist: {}", root.display());
            continue;
        }
        info!("Scanning directory: {}", root.display());

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let ext = path
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.to_lowercase());
            match ext {
                Some(ext) if MEDIA_EXTENSIONS.contains(&ext.as_str()) => {}
                _ => continue,
            }

            if let Err(e) = vfs.stage(path) {
                warn!("Failed to stage {}: {}", path.display(), e);
                continue;
            }
            let decision = vfs.decide(path, &app, &OpenRequest::default())?;
            let size = vfs.len(path).unwrap_or(0);
            if decision.is_transcode() {
                candidates += 1;
                println!(
                    "TRANSCODE  {} ({})",
                    path.display(),
                    format_size(size, DECIMAL)
                );
            } else {
                passthrough += 1;
                println!(
                    "PASSTHROUGH {} ({}): {}",
                    path.display(),
                    format_size(size, DECIMAL),
                    decision.reasons.join("; ")
                );
            }
        }
    }

    info!("Scan complete: {} transcode candidates, {} passthrough", candidates, passthrough);
    Ok(())
}
