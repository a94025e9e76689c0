#![forbid(unsafe_code)]

//! Download orchestration.
//!
//! `start_download` does the synchronous part of the lifecycle (resolve,
//! metadata, create-or-get) and returns the episode immediately; the audio
//! fetch runs in a spawned task that walks the row through
//! `downloading → downloaded | error`. An in-flight set keyed by episode id
//! guarantees at most one background task per episode.

use std::{collections::HashSet, fmt, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use chrono::Utc;
use parking_lot::Mutex;

use crate::episodes::{Episode, EpisodeStatus, EpisodeStore, MediaFields, NewEpisode};
use crate::extractor::{DownloadedAudio, MediaExtractor};
use crate::resolver;

/// Failures of the synchronous half of a download request. The split matters
/// to the HTTP layer: the first two are the client's fault, the last is ours.
#[derive(Debug)]
pub enum DownloadError {
    /// The URL matched no supported YouTube shape.
    InvalidUrl,
    /// Metadata extraction failed; no episode row was created.
    Extraction(anyhow::Error),
    /// The episode store rejected the write.
    Storage(anyhow::Error),
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl => write!(f, "could not extract a video id from the URL"),
            Self::Extraction(err) => write!(f, "metadata extraction failed: {err:#}"),
            Self::Storage(err) => write!(f, "storage failure: {err:#}"),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Drives the episode lifecycle. All storage writes go through the
/// `EpisodeStore`; the extractor is only ever touched from blocking tasks.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    store: EpisodeStore,
    extractor: Arc<dyn MediaExtractor>,
    downloads_dir: PathBuf,
    audio_format: String,
    download_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl DownloadOrchestrator {
    pub fn new(
        store: EpisodeStore,
        extractor: Arc<dyn MediaExtractor>,
        downloads_dir: PathBuf,
        audio_format: String,
        download_timeout: Duration,
    ) -> Self {
        Self {
            store,
            extractor,
            downloads_dir,
            audio_format,
            download_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &EpisodeStore {
        &self.store
    }

    /// Accepts a download request: resolve the video id, pull metadata,
    /// create or return the episode row, then kick off the background fetch.
    /// Returns as soon as the row exists; callers poll the status endpoints
    /// for progress.
    pub async fn start_download(&self, url: &str) -> Result<Episode, DownloadError> {
        let video_id = resolver::resolve_video_id(url).ok_or(DownloadError::InvalidUrl)?;

        let extractor = self.extractor.clone();
        let metadata_url = url.to_owned();
        let metadata =
            tokio::task::spawn_blocking(move || extractor.fetch_metadata(&metadata_url))
                .await
                .map_err(|err| DownloadError::Extraction(anyhow!(err)))?
                .map_err(DownloadError::Extraction)?;

        let new_episode = NewEpisode {
            url: url.to_owned(),
            video_id,
            title: metadata.title,
            subtitle: metadata.subtitle,
            summary: metadata.summary,
            author: metadata.author,
            keywords: metadata.keywords,
            tags: None,
            image_url: metadata.image_url,
            published_at: metadata.published_at,
            explicit: false,
            position: 0,
            media_duration: metadata.duration_secs,
        };
        let episode = self
            .store
            .create_episode(&new_episode)
            .await
            .map_err(DownloadError::Storage)?;

        self.spawn_fetch(&episode);
        Ok(episode)
    }

    pub fn is_in_flight(&self, episode_id: &str) -> bool {
        self.in_flight.lock().contains(episode_id)
    }

    /// Spawns the background fetch unless the episode is already past
    /// `pending` or another task owns it. Duplicate requests for an episode
    /// currently downloading fall through here without a second task.
    fn spawn_fetch(&self, episode: &Episode) {
        if episode.status != EpisodeStatus::Pending {
            return;
        }
        if !self.in_flight.lock().insert(episode.id.clone()) {
            return;
        }

        let this = self.clone();
        let episode_id = episode.id.clone();
        let url = episode.url.clone();
        let video_id = episode.video_id.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run_fetch(&episode_id, &url, &video_id).await {
                // Storage failures here have no caller left to report to.
                eprintln!("download task for {video_id} failed: {err:#}");
            }
            this.in_flight.lock().remove(&episode_id);
        });
    }

    async fn run_fetch(&self, episode_id: &str, url: &str, video_id: &str) -> Result<()> {
        self.store
            .update_status(
                episode_id,
                EpisodeStatus::Downloading,
                MediaFields::default(),
                None,
            )
            .await?;

        match self.fetch_audio(url, video_id).await {
            Ok(audio) => {
                let media = MediaFields {
                    media_url: Some(audio.path.to_string_lossy().into_owned()),
                    media_size: Some(audio.size),
                    media_duration: None,
                    media_length: Some(audio.size),
                };
                self.store
                    .update_status(episode_id, EpisodeStatus::Downloaded, media, None)
                    .await?;
            }
            Err(err) => {
                eprintln!("audio fetch for {video_id} failed: {err:#}");
                self.store
                    .update_status(
                        episode_id,
                        EpisodeStatus::Error,
                        MediaFields::default(),
                        Some(&format!("{err:#}")),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Runs the blocking extractor call with a timeout. On timeout we stop
    /// waiting and fail the episode; the blocking task itself runs to
    /// completion in the background since it cannot be cancelled.
    async fn fetch_audio(&self, url: &str, video_id: &str) -> Result<DownloadedAudio> {
        let extractor = self.extractor.clone();
        let url = url.to_owned();
        let video_id = video_id.to_owned();
        let dest_dir = self.downloads_dir.clone();
        let format = self.audio_format.clone();

        let task = tokio::task::spawn_blocking(move || {
            extractor.download_audio(&url, &video_id, &dest_dir, &format)
        });

        match tokio::time::timeout(self.download_timeout, task).await {
            Err(_) => Err(anyhow!(
                "download timed out after {}s",
                self.download_timeout.as_secs()
            )),
            Ok(Err(join_err)) => Err(anyhow!(join_err).context("download task aborted")),
            Ok(Ok(result)) => result,
        }
    }

    /// Marks episodes stuck in `downloading` longer than `threshold` as
    /// failed. Run at startup to recover rows orphaned by a crash; episodes
    /// with a live background task are left alone.
    pub async fn reconcile_stale(&self, threshold: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - threshold;
        let stale = self.store.list_stale_downloading(cutoff).await?;

        let mut reconciled = 0;
        for episode in stale {
            if self.is_in_flight(&episode.id) {
                continue;
            }
            self.store
                .update_status(
                    &episode.id,
                    EpisodeStatus::Error,
                    MediaFields::default(),
                    Some("download stalled and was marked failed during reconciliation"),
                )
                .await?;
            reconciled += 1;
        }
        Ok(reconciled)
    }
}
