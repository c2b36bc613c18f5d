//! CLI command implementations

use crate::output::{clock, print_rows, print_value, OutputFormat};
use anistream_core::{
    scheduler::TimerKind, Config, HlsEngineFactory, HttpTransport, MediaSink, PlaybackController,
    PlayerSnapshot, PlayerState, ProgressStore, Provider, ResolutionRequest, SettingsPatch,
    SkipAffordance, SkipTimesKey, SourceLoader, SourceResolver, Transport, WatchSession,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tabled::Tabled;
use tracing::{debug, info};

/// Shared state for every command
pub struct App {
    config: Config,
    format: OutputFormat,
    transport: Arc<dyn Transport>,
    resolver: Arc<SourceResolver>,
    store: ProgressStore,
}

impl App {
    pub fn new(config: Config, format: OutputFormat) -> anyhow::Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        let resolver = Arc::new(SourceResolver::from_config(
            transport.clone(),
            config.upstream.clone(),
        ));
        let store = ProgressStore::open(&config.resolved_data_dir()?)?;
        Ok(Self {
            config,
            format,
            transport,
            resolver,
            store,
        })
    }

    /// Probe endpoints and report each candidate
    pub async fn probe(&self) -> anyhow::Result<()> {
        let selected = self.resolver.pool().select_endpoint().await;

        #[derive(Serialize, Tabled)]
        struct Row {
            address: String,
            latency_ms: String,
            status: String,
        }

        let rows: Vec<Row> = self
            .resolver
            .pool()
            .candidates()
            .into_iter()
            .map(|c| Row {
                address: c.address.to_string(),
                latency_ms: c.latency_ms().map_or("-".to_string(), |ms| ms.to_string()),
                status: c.last_error.clone().unwrap_or_else(|| "ok".to_string()),
            })
            .collect();

        print_rows(&rows, self.format, |r| {
            format!("{:<40} {:>6} ms  {}", r.address, r.latency_ms, r.status)
        })?;

        match selected {
            Ok(best) => {
                if self.format == OutputFormat::Text {
                    println!("\nSelected: {}", best);
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn search(&self, query: &str, page: u32) -> anyhow::Result<()> {
        let results = self.resolver.search(query, page).await?;

        #[derive(Serialize, Tabled)]
        struct Row {
            id: String,
            title: String,
            provider: String,
        }

        let rows: Vec<Row> = results
            .into_iter()
            .map(|r| Row {
                id: r.id,
                title: r.title,
                provider: r.provider.to_string(),
            })
            .collect();

        if rows.is_empty() && self.format == OutputFormat::Text {
            println!("No results for \"{}\"", query);
            return Ok(());
        }
        print_rows(&rows, self.format, |r| format!("{:<40} {} [{}]", r.id, r.title, r.provider))
    }

    pub async fn episodes(&self, anime_id: &str, provider: Provider) -> anyhow::Result<()> {
        let anime = self.resolver.anime_info(anime_id, provider).await?;

        #[derive(Serialize, Tabled)]
        struct Row {
            number: u32,
            id: String,
            title: String,
        }

        if self.format == OutputFormat::Text {
            println!("{} ({} episodes)", anime.title, anime.episode_count());
        }
        let rows: Vec<Row> = anime
            .episodes
            .iter()
            .map(|e| Row {
                number: e.number,
                id: e.id.clone(),
                title: e.title.clone().unwrap_or_default(),
            })
            .collect();
        print_rows(&rows, self.format, |r| format!("{:>4}  {:<40} {}", r.number, r.id, r.title))
    }

    pub async fn servers(&self, episode_id: &str, provider: Provider) -> anyhow::Result<()> {
        let servers = self.resolver.servers(episode_id, provider).await;
        print_value(&servers, self.format, |s| s.join("\n"))
    }

    /// Resolve an episode's descriptor, with skip times merged in
    pub async fn resolve(
        &self,
        anime_id: &str,
        episode: u32,
        provider: Provider,
        server: Option<String>,
    ) -> anyhow::Result<()> {
        let selection = self.resolver.resolve_episode(anime_id, episode, provider).await?;
        let loader = SourceLoader::new(self.resolver.clone());
        let skip_key = selection.anime.mal_id.map(|catalog_id| SkipTimesKey {
            catalog_id,
            episode_number: episode,
        });
        let request = ResolutionRequest::new(selection.episode.id.clone(), provider, server);
        let descriptor = loader.load(&request, skip_key).await?;

        print_value(&descriptor, self.format, |d| {
            let mut lines = vec![format!(
                "{} #{} via {}",
                selection.anime.title,
                episode,
                d.provider.map_or("?".to_string(), |p| p.to_string())
            )];
            lines.push("Sources:".to_string());
            for source in &d.sources {
                let kind = if source.is_m3u8 { "hls" } else { "file" };
                lines.push(format!("  {:<8} {:<5} {}", source.quality, kind, source.url));
            }
            if !d.subtitles.is_empty() {
                lines.push("Subtitles:".to_string());
                for track in &d.subtitles {
                    lines.push(format!("  {:<12} {}", track.label, track.url));
                }
            }
            if !d.skip_segments.is_empty() {
                lines.push("Skip segments:".to_string());
                for s in &d.skip_segments {
                    lines.push(format!(
                        "  {:<9} {} - {}",
                        s.kind.to_string(),
                        clock(s.start_seconds),
                        clock(s.end_seconds)
                    ));
                }
            }
            lines.push(format!("Servers: {}", d.servers.join(", ")));
            lines.join("\n")
        })
    }

    pub async fn skip_times(&self, mal_id: u64, episode: u32) -> anyhow::Result<()> {
        let segments = self.resolver.skip_times(mal_id, episode).await;

        #[derive(Serialize, Tabled)]
        struct Row {
            kind: String,
            start: String,
            end: String,
        }

        let rows: Vec<Row> = segments
            .iter()
            .map(|s| Row {
                kind: s.kind.to_string(),
                start: clock(s.start_seconds),
                end: clock(s.end_seconds),
            })
            .collect();
        if rows.is_empty() && self.format == OutputFormat::Text {
            println!("No skip times found");
            return Ok(());
        }
        print_rows(&rows, self.format, |r| format!("{:<9} {} - {}", r.kind, r.start, r.end))
    }

    /// Headless playback: resolves, mounts and drives a session, printing
    /// whatever changes in the player snapshot.
    pub async fn watch(&self, anime_id: &str, options: WatchOptions) -> anyhow::Result<()> {
        let episode = options
            .episode
            .or_else(|| self.store.get(anime_id).map(|p| p.episode))
            .unwrap_or(1);

        let factory = HlsEngineFactory::new(self.transport.clone())
            .with_request_timeout(self.config.upstream.request_timeout());
        let controller = PlaybackController::new(
            self.config.playback.clone(),
            Arc::new(factory),
            MediaSink::new(),
            self.store.clone(),
        );
        let loader = Arc::new(SourceLoader::new(self.resolver.clone()));
        let mut session = WatchSession::new(loader, controller, options.provider);

        session.open(anime_id, episode, options.server.clone()).await?;
        info!(anime = anime_id, episode, "Playback started");

        let deadline = (options.duration > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_secs(options.duration));
        let result = self.drive(&mut session, &options, deadline).await;

        // Close on error too; closing writes the final position
        session.close();
        result
    }

    async fn drive(
        &self,
        session: &mut WatchSession,
        options: &WatchOptions,
        deadline: Option<tokio::time::Instant>,
    ) -> anyhow::Result<()> {
        let mut quality_pending = options.quality.clone();
        let mut last = PlayerSnapshot::default();

        loop {
            let snapshot = session.controller().snapshot();
            self.report(&last, &snapshot)?;

            if let Some(label) = quality_pending.as_deref() {
                if snapshot.qualities.len() > 1 {
                    if !session.controller_mut().request_quality_change(label) {
                        println!("Quality {} not available", label);
                    }
                    quality_pending = None;
                }
            }

            match snapshot.state {
                PlayerState::Error => break,
                PlayerState::Ended if !session.controller().is_scheduled(TimerKind::AutoAdvance) => {
                    let ended = session.controller().session_id();
                    if options.follow {
                        session.controller_mut().request_next_episode();
                        session.handle_requests().await?;
                    }
                    if session.controller().session_id() == ended {
                        break;
                    }
                }
                _ => {}
            }
            last = snapshot;

            tokio::select! {
                result = session.step() => result?,
                _ = tokio::signal::ctrl_c() => {
                    debug!("Interrupted");
                    break;
                }
                _ = sleep_until(deadline) => break,
            }
        }

        Ok(())
    }

    fn report(&self, last: &PlayerSnapshot, now: &PlayerSnapshot) -> anyhow::Result<()> {
        if self.format == OutputFormat::Json {
            if last != now {
                println!("{}", serde_json::to_string(now)?);
            }
            return Ok(());
        }

        let at = clock(now.position);
        if now.episode_number != last.episode_number {
            if let (Some(anime), Some(ep)) = (&now.anime_id, now.episode_number) {
                println!("== {} episode {} ({})", anime, ep, now.server.as_deref().unwrap_or("default server"));
            }
        }
        if now.state != last.state {
            println!("[{}] {}", at, now.state);
        }
        if now.active_level != last.active_level {
            if let Some(level) = &now.active_level {
                println!("[{}] quality {} ({})", at, level, now.quality);
            }
        }
        if now.skip != last.skip && now.skip != SkipAffordance::None {
            println!("[{}] skip {:?} available (press S)", at, now.skip);
        }
        if now.notification != last.notification {
            if let Some(text) = &now.notification {
                println!("[{}] {}", at, text);
            }
        }
        if now.last_checkpoint != last.last_checkpoint {
            if let Some(position) = now.last_checkpoint {
                println!("[{}] progress saved at {}", at, clock(position));
            }
        }
        if now.error != last.error {
            if let Some(error) = &now.error {
                println!("[{}] {}", at, error);
            }
        }
        Ok(())
    }

    pub fn history(&self) -> anyhow::Result<()> {
        #[derive(Serialize, Tabled)]
        struct Row {
            anime: String,
            episode: u32,
            position: String,
            watched: String,
        }

        let rows: Vec<Row> = self
            .store
            .history()
            .into_iter()
            .map(|(anime, p)| Row {
                anime,
                episode: p.episode,
                position: clock(p.progress),
                watched: p.timestamp.format("%Y-%m-%d %H:%M").to_string(),
            })
            .collect();
        if rows.is_empty() && self.format == OutputFormat::Text {
            println!("Nothing watched yet");
            return Ok(());
        }
        print_rows(&rows, self.format, |r| {
            format!("{:<40} ep {:>3} at {:>6}  {}", r.anime, r.episode, r.position, r.watched)
        })
    }

    pub fn bookmark(&self, anime_id: Option<&str>) -> anyhow::Result<()> {
        match anime_id {
            Some(id) => {
                let added = self.store.toggle_bookmark(id)?;
                print_value(&added, self.format, |added| {
                    if *added {
                        format!("Bookmarked {}", id)
                    } else {
                        format!("Removed bookmark {}", id)
                    }
                })
            }
            None => {
                let bookmarks = self.store.bookmarks();
                print_value(&bookmarks, self.format, |b| b.join("\n"))
            }
        }
    }

    pub fn settings(&self, patch: SettingsPatch) -> anyhow::Result<()> {
        let settings = if patch == SettingsPatch::default() {
            self.store.settings()
        } else {
            self.store.update_settings(patch)?
        };
        print_value(&settings, self.format, |s| {
            format!(
                "auto skip intro: {}\nauto skip outro: {}\nauto play:       {}\nauto next:       {}\ndefault quality: {}\nvolume:          {:.2}",
                s.auto_skip_intro, s.auto_skip_outro, s.auto_play, s.auto_next, s.default_quality, s.volume
            )
        })
    }
}

/// Options for `watch`
pub struct WatchOptions {
    pub episode: Option<u32>,
    pub provider: Provider,
    pub server: Option<String>,
    pub quality: Option<String>,
    pub duration: u64,
    pub follow: bool,
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
