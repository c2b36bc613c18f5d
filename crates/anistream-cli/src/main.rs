//! Anistream CLI - Anime stream resolver and headless player
//!
//! Features:
//! - Endpoint liveness probing
//! - Search, episode and server listing
//! - Stream descriptor resolution with provider fallback
//! - Skip-time lookup
//! - Headless playback sessions
//! - Watch history, bookmarks and settings

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use output::OutputFormat;

/// Anistream CLI - Anime streaming toolkit
#[derive(Parser)]
#[command(name = "anistream")]
#[command(version)]
#[command(about = "Resolve and play anime streams from the terminal", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Path to a JSON config file
    #[arg(short, long, global = true, env = "ANISTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Output format (text, json, table)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every configured endpoint and report latencies
    Probe,

    /// Search every provider for an anime
    Search {
        /// Search query
        query: String,

        /// Result page
        #[arg(short, long, default_value = "1")]
        page: u32,
    },

    /// List the episodes of an anime
    Episodes {
        /// Provider-specific anime id
        anime_id: String,

        /// Provider (zoro, gogoanime)
        #[arg(short, long, default_value = "zoro")]
        provider: String,
    },

    /// List CDN servers offered for an episode
    Servers {
        /// Provider-specific episode id
        episode_id: String,

        #[arg(short, long, default_value = "zoro")]
        provider: String,
    },

    /// Resolve the stream descriptor of an episode
    Resolve {
        /// Provider-specific anime id
        anime_id: String,

        /// Episode number
        episode: u32,

        #[arg(short, long, default_value = "zoro")]
        provider: String,

        /// CDN server to request
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Look up opening/ending skip times
    SkipTimes {
        /// MyAnimeList id
        mal_id: u64,

        /// Episode number
        episode: u32,
    },

    /// Play an episode headlessly, printing player state as it changes
    Watch {
        /// Provider-specific anime id
        anime_id: String,

        /// Episode number (defaults to the last one watched, else 1)
        episode: Option<u32>,

        #[arg(short, long, default_value = "zoro")]
        provider: String,

        #[arg(short, long)]
        server: Option<String>,

        /// Pin a quality label (e.g. 720p)
        #[arg(short, long)]
        quality: Option<String>,

        /// Stop after this many seconds (0 = until the episode ends)
        #[arg(short, long, default_value = "0")]
        duration: u64,

        /// Keep playing following episodes
        #[arg(long)]
        follow: bool,
    },

    /// Show watch history
    History,

    /// Toggle or list bookmarks
    Bookmark {
        /// Anime id to toggle; lists bookmarks when omitted
        anime_id: Option<String>,
    },

    /// Show or change player settings
    Settings {
        #[arg(long)]
        auto_skip_intro: Option<bool>,

        #[arg(long)]
        auto_skip_outro: Option<bool>,

        #[arg(long)]
        auto_play: Option<bool>,

        #[arg(long)]
        auto_next: Option<bool>,

        #[arg(long)]
        default_quality: Option<String>,

        #[arg(long)]
        volume: Option<f64>,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);
    anistream_core::init();

    let config = anistream_core::Config::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    let format = OutputFormat::from(cli.format.as_str());
    let app = commands::App::new(config, format)?;

    match cli.command {
        Commands::Probe => app.probe().await?,
        Commands::Search { query, page } => app.search(&query, page).await?,
        Commands::Episodes { anime_id, provider } => {
            app.episodes(&anime_id, provider.parse()?).await?;
        }
        Commands::Servers { episode_id, provider } => {
            app.servers(&episode_id, provider.parse()?).await?;
        }
        Commands::Resolve { anime_id, episode, provider, server } => {
            app.resolve(&anime_id, episode, provider.parse()?, server).await?;
        }
        Commands::SkipTimes { mal_id, episode } => app.skip_times(mal_id, episode).await?,
        Commands::Watch { anime_id, episode, provider, server, quality, duration, follow } => {
            let options = commands::WatchOptions {
                episode,
                provider: provider.parse()?,
                server,
                quality,
                duration,
                follow,
            };
            app.watch(&anime_id, options).await?;
        }
        Commands::History => app.history()?,
        Commands::Bookmark { anime_id } => app.bookmark(anime_id.as_deref())?,
        Commands::Settings {
            auto_skip_intro,
            auto_skip_outro,
            auto_play,
            auto_next,
            default_quality,
            volume,
        } => {
            let patch = anistream_core::SettingsPatch {
                auto_skip_intro,
                auto_skip_outro,
                auto_play,
                auto_next,
                default_quality,
                volume,
            };
            app.settings(patch)?;
        }
    }

    Ok(())
}
