//! Watch session - ties resolution to playback
//!
//! Resolves an episode, walks the CDN server chain until a descriptor loads,
//! mounts it into the [`PlaybackController`] and answers the controller's
//! navigation and server-change requests with fresh mounts.

use crate::{
    config::UpstreamConfig,
    controller::{ControllerRequest, PlaybackController, PlayerSnapshot, SessionContext},
    fallback::FallbackChain,
    loader::{SkipTimesKey, SourceLoader},
    types::*,
    Error, Result,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// One viewer watching one anime
pub struct WatchSession {
    loader: Arc<SourceLoader>,
    controller: PlaybackController,
    config: UpstreamConfig,
    provider: Provider,
    /// Catalog entry of the anime being watched
    anime: Option<AnimeInfo>,
}

impl WatchSession {
    pub fn new(loader: Arc<SourceLoader>, controller: PlaybackController, provider: Provider) -> Self {
        let config = loader.resolver().config().clone();
        Self {
            loader,
            controller,
            config,
            provider,
            anime: None,
        }
    }

    pub fn controller(&self) -> &PlaybackController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut PlaybackController {
        &mut self.controller
    }

    pub fn anime(&self) -> Option<&AnimeInfo> {
        self.anime.as_ref()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerSnapshot> {
        self.controller.subscribe()
    }

    /// Resolve an episode of an anime and start playing it
    #[instrument(skip(self))]
    pub async fn open(
        &mut self,
        anime_id: &str,
        episode_number: u32,
        server: Option<String>,
    ) -> Result<SessionId> {
        let selection = self
            .loader
            .resolver()
            .resolve_episode(anime_id, episode_number, self.provider)
            .await?;
        info!(
            anime = %selection.anime.title,
            episode = selection.episode.number,
            episodes = selection.anime.episode_count(),
            "Opening episode"
        );
        self.anime = Some(selection.anime);
        self.play_episode(selection.episode, server).await
    }

    /// Move to another episode of the open anime
    pub async fn navigate(&mut self, navigation: Navigation) -> Result<SessionId> {
        let anime = self.anime.as_ref().ok_or_else(|| {
            Error::InvalidConfig("no anime is open".to_string())
        })?;
        let target = navigation.episode();
        let episode = anime
            .find_episode(target)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound {
                provider: self.provider.to_string(),
                episode_id: format!("{} #{}", anime.id, target),
            })?;
        info!(episode = target, "Navigating");
        self.play_episode(episode, None).await
    }

    /// Remount the current episode on another server
    pub async fn change_server(&mut self, server: String) -> Result<SessionId> {
        let Some(context) = self.controller.context().cloned() else {
            return Err(Error::InvalidConfig("nothing is playing".to_string()));
        };
        let episode = Episode {
            id: context.episode_id,
            number: context.episode_number,
            title: None,
        };
        let position = self.controller.position();
        self.load_and_mount(episode, Some(server), Some(position)).await
    }

    async fn play_episode(&mut self, episode: Episode, server: Option<String>) -> Result<SessionId> {
        self.load_and_mount(episode, server, None).await
    }

    /// Walk the server chain until a descriptor loads, then mount it
    async fn load_and_mount(
        &mut self,
        episode: Episode,
        server: Option<String>,
        position: Option<f64>,
    ) -> Result<SessionId> {
        let Some(anime) = self.anime.as_ref() else {
            return Err(Error::InvalidConfig("no anime is open".to_string()));
        };
        let skip_key = anime.mal_id.map(|catalog_id| SkipTimesKey {
            catalog_id,
            episode_number: episode.number,
        });
        let context = SessionContext::new(anime.id.clone(), episode.id.clone(), episode.number)
            .with_total_episodes(Some(anime.episode_count()).filter(|n| *n > 0));

        let first = server
            .or_else(|| self.config.default_servers.first().cloned())
            .unwrap_or_default();
        let mut chain = FallbackChain::starting_at(first, &self.config.default_servers);

        let descriptor = loop {
            let Some(server) = chain.current().cloned() else {
                return Err(Error::SourceUnavailable {
                    errors: chain.into_errors(),
                });
            };
            let requested = (!server.is_empty()).then(|| server.clone());
            let request = ResolutionRequest::new(episode.id.clone(), self.provider, requested);

            match self.loader.load(&request, skip_key).await {
                Ok(descriptor) => break descriptor,
                Err(e @ (Error::Cancelled | Error::AllEndpointsUnreachable { .. })) => return Err(e),
                Err(e) => {
                    let error = Error::ServerFetchFailed {
                        server: server.clone(),
                        message: e.to_string(),
                    };
                    warn!(error = %error, "Server failed");
                    if chain.fail(e).is_some() {
                        tokio::time::sleep(self.config.server_retry_delay()).await;
                    }
                }
            }
        };

        self.controller.mount(descriptor, context, position)
    }

    /// Handle the next engine event or timer, then act on whatever the
    /// controller asked for.
    pub async fn step(&mut self) -> Result<()> {
        self.controller.process_next().await;
        self.handle_requests().await
    }

    /// Act on pending controller requests
    pub async fn handle_requests(&mut self) -> Result<()> {
        for request in self.controller.take_requests() {
            match request {
                ControllerRequest::Navigate(navigation) => {
                    self.navigate(navigation).await?;
                }
                ControllerRequest::ChangeServer(server) => {
                    self.change_server(server).await?;
                }
            }
        }
        Ok(())
    }

    /// Stop playback and cancel anything in flight
    pub fn close(&mut self) {
        self.loader.cancel();
        self.controller.close();
    }
}
