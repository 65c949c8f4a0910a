//! Gazer - real-time head tracking with asynchronous identity resolution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gazer_reid::{Session, SimilarityStore, VectorStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod replay;
mod server;
mod wire;

use config::FileConfig;

/// Gazer - tracks heads across frames and resolves who they are.
///
/// Identities are kept in an embedded database so names survive restarts.
/// Configuration is read from ~/.gazer/config.yaml when present.
#[derive(Parser)]
#[command(name = "gazer")]
#[command(about = "Head tracking and identity resolution")]
#[command(version)]
pub struct Cli {
    /// Config file (default is ~/.gazer/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve(ServeArgs),
    /// Replay a JSON-lines detection log
    Replay(ReplayArgs),
}

/// Overrides shared by every subcommand.
#[derive(Args)]
pub struct StoreArgs {
    /// Identity database file (in-memory when unset)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Directory for representative face images
    #[arg(long)]
    pub image_dir: Option<PathBuf>,

    /// Similarity a match must exceed
    #[arg(long)]
    pub threshold: Option<f32>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Listen address (e.g. :8080 or 127.0.0.1:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// JSON-lines file, one frame per line
    pub file: PathBuf,

    /// How long to wait for pending resolutions after the last frame
    #[arg(long, default_value_t = 2000)]
    pub settle_ms: u64,

    /// Print summaries as JSON lines
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub store: StoreArgs,
}

impl StoreArgs {
    fn apply(&self, cfg: &mut FileConfig) {
        if let Some(db) = &self.db {
            cfg.db_path = Some(db.clone());
        }
        if let Some(dir) = &self.image_dir {
            cfg.reid.image_dir = Some(dir.clone());
        }
        if let Some(t) = self.threshold {
            cfg.reid.similarity_threshold = t;
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn open_session(cfg: &FileConfig) -> Result<Session> {
    let store: Arc<dyn SimilarityStore> = match &cfg.db_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let store = VectorStore::open_redb(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            info!(path = %path.display(), identities = store.count()?, "identity store opened");
            Arc::new(store)
        }
        None => Arc::new(VectorStore::in_memory()),
    };
    Ok(Session::builder()
        .config(cfg.reid.clone())
        .store(store)
        .build()?)
}

async fn run_serve(mut cfg: FileConfig, args: &ServeArgs) -> Result<()> {
    args.store.apply(&mut cfg);
    if let Some(listen) = &args.listen {
        cfg.listen = Some(listen.clone());
    }
    let session = Arc::new(open_session(&cfg)?);
    server::serve(cfg.listen_addr(), session).await
}

async fn run_replay(mut cfg: FileConfig, args: &ReplayArgs) -> Result<()> {
    args.store.apply(&mut cfg);
    let frames = replay::read_frames(&args.file)?;
    let session = open_session(&cfg)?;

    replay::run(&session, frames, |i, summary| {
        if args.json {
            match serde_json::to_string(summary) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(frame = i, error = %e, "encode summary"),
            }
        } else {
            println!("{}", replay::format_summary(i, summary));
        }
    })?;

    if !replay::settle(&session, Duration::from_millis(args.settle_ms)).await? {
        tracing::warn!("resolutions still pending after {}ms", args.settle_ms);
    }

    let identities = session.list_identities()?;
    if args.json {
        println!("{}", serde_json::to_string(&identities)?);
    } else {
        println!("\n{} identities:", identities.len());
        for id in &identities {
            match id.merged_into {
                Some(target) => println!("  {:>4}  {} -> {}", id.reid.get(), id.name, target),
                None => println!("  {:>4}  {}", id.reid.get(), id.name),
            }
        }
    }

    session.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cfg = FileConfig::resolve(cli.config.as_deref())?;
    match &cli.command {
        Commands::Serve(args) => run_serve(cfg, args).await,
        Commands::Replay(args) => run_replay(cfg, args).await,
    }
}
