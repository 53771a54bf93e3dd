use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cover_cache::config::{self, CliConfig, FileConfig};
use cover_cache::{ImageCache, ImageRequest, Language};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_language(s: &str) -> Result<Language> {
    Language::from_str(s)
        .ok_or_else(|| anyhow::anyhow!("unsupported language: {s} (try e.g. english, german)"))
}

#[derive(Parser, Debug)]
#[clap(version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH")))]
struct CliArgs {
    /// Root directory of the artwork cache.
    #[clap(long, value_parser = parse_path)]
    pub cache_root: Option<PathBuf>,

    /// Path to a TOML config file; values there override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Timeout in seconds for each image request.
    #[clap(long, default_value_t = 30)]
    pub request_timeout_sec: u64,

    /// Maximum simultaneous downloads across all hosts.
    #[clap(long, default_value_t = 4)]
    pub max_parallel_downloads: usize,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch (or resolve from cache) the artwork for one catalog item.
    Fetch {
        /// Catalog item identifier.
        item_id: String,

        /// Candidate URL; repeat in preference order, primary CDN first.
        #[clap(long = "url", required = true)]
        urls: Vec<String>,

        #[clap(long, default_value = "english", value_parser = parse_language)]
        language: Language,

        /// Display name recorded alongside failures for diagnostics.
        #[clap(long)]
        display_name: Option<String>,
    },

    /// Delete cached artwork files. The failure ledger is kept.
    Clear {
        /// Only this language; all languages when omitted.
        #[clap(long, value_parser = parse_language)]
        language: Option<Language>,
    },

    /// Drop failure records past the retention window.
    Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        cache_root: cli_args.cache_root.clone(),
        request_timeout_secs: cli_args.request_timeout_sec,
        max_parallel_downloads: cli_args.max_parallel_downloads,
    };
    let config = config::resolve(&cli_config, file_config)?;
    let cache = ImageCache::new(config)?;

    match cli_args.command {
        Command::Fetch {
            item_id,
            urls,
            language,
            display_name,
        } => {
            let mut candidates = Vec::with_capacity(urls.len());
            for raw in &urls {
                let url =
                    Url::parse(raw).with_context(|| format!("invalid candidate url: {raw}"))?;
                candidates.push(url);
            }
            if candidates.is_empty() {
                bail!("at least one --url is required");
            }

            cache.set_progress_callback(Box::new(|completed, total| {
                info!("progress: {completed}/{total}");
            }));

            let mut request = ImageRequest::new(item_id.clone(), candidates, language);
            if let Some(name) = display_name {
                request = request.with_display_name(name);
            }
            let outcome = cache.get_image(request).await;
            match outcome.path {
                Some(path) => {
                    let source = if outcome.downloaded {
                        "downloaded"
                    } else {
                        "cached"
                    };
                    println!("{} ({source})", path.display());
                }
                None => {
                    println!("no artwork available for {item_id}/{language}");
                    std::process::exit(1);
                }
            }
        }
        Command::Clear { language } => {
            cache.clear_cache(language)?;
        }
        Command::Prune => {
            let removed = cache.run_maintenance()?;
            println!("pruned {removed} failure records");
        }
    }

    Ok(())
}
