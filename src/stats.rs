#![forbid(unsafe_code)]

//! Access statistics derived from the episode rows.
//!
//! Stats are a read-only projection: the counters live on the episodes table
//! and are bumped by the audio route. Every episode appears here, including
//! ones never streamed, so the page total matches the library size.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::episodes::{Episode, EpisodeStore};

/// Per-file access counters, shaped for the stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct FileAccessStats {
    pub filename: String,
    pub video_id: String,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
}

/// One page of stats plus the paging echo the client needs to continue.
#[derive(Debug, Clone, Serialize)]
pub struct StatsPage {
    pub data: Vec<FileAccessStats>,
    pub total: i64,
    pub skip: i64,
    pub limit: i64,
}

/// Read side of the access counters.
#[derive(Clone)]
pub struct StatsService {
    store: EpisodeStore,
    audio_format: String,
}

impl StatsService {
    pub fn new(store: EpisodeStore, audio_format: String) -> Self {
        Self {
            store,
            audio_format,
        }
    }

    /// Pages through all episodes, most accessed first. `total` counts the
    /// whole library, not the page.
    pub async fn page(&self, skip: i64, limit: i64) -> Result<StatsPage> {
        let episodes = self.store.list_by_access(limit, skip).await?;
        let total = self.store.count_all().await?;
        let data = episodes
            .into_iter()
            .map(|episode| self.project(&episode))
            .collect();
        Ok(StatsPage {
            data,
            total,
            skip,
            limit,
        })
    }

    pub async fn for_video(&self, video_id: &str) -> Result<Option<FileAccessStats>> {
        Ok(self
            .store
            .get_by_video_id(video_id)
            .await?
            .map(|episode| self.project(&episode)))
    }

    fn project(&self, episode: &Episode) -> FileAccessStats {
        FileAccessStats {
            filename: format!("{}.{}", episode.video_id, self.audio_format),
            video_id: episode.video_id.clone(),
            count: episode.count,
            last_accessed: episode.last_accessed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodes::NewEpisode;
    use tempfile::tempdir;

    async fn create_service() -> Result<(tempfile::TempDir, StatsService, EpisodeStore)> {
        let dir = tempdir()?;
        let store = EpisodeStore::open(&dir.path().join("data/test.db")).await?;
        let service = StatsService::new(store.clone(), "m4a".into());
        Ok((dir, service, store))
    }

    async fn seed(store: &EpisodeStore, video_id: &str, accesses: usize) -> Result<()> {
        let episode = store
            .create_episode(&NewEpisode {
                url: format!("https://www.youtube.com/watch?v={video_id}"),
                video_id: video_id.to_owned(),
                title: format!("Episode {video_id}"),
                ..Default::default()
            })
            .await?;
        for _ in 0..accesses {
            store.increment_access(&episode.id).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn page_orders_by_count_and_includes_untouched_rows() -> Result<()> {
        let (_dir, service, store) = create_service().await?;
        seed(&store, "three", 3).await?;
        seed(&store, "zero", 0).await?;
        seed(&store, "five", 5).await?;

        let page = service.page(0, 10).await?;
        assert_eq!(page.total, 3);
        assert_eq!(page.skip, 0);
        assert_eq!(page.limit, 10);

        let order: Vec<(&str, i64)> = page
            .data
            .iter()
            .map(|stats| (stats.video_id.as_str(), stats.count))
            .collect();
        assert_eq!(order, vec![("five", 5), ("three", 3), ("zero", 0)]);

        assert_eq!(page.data[0].filename, "five.m4a");
        assert!(page.data[0].last_accessed.is_some());
        assert!(page.data[2].last_accessed.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn total_stays_global_across_pages() -> Result<()> {
        let (_dir, service, store) = create_service().await?;
        for (video_id, accesses) in [("a", 4), ("b", 3), ("c", 2), ("d", 1)] {
            seed(&store, video_id, accesses).await?;
        }

        let first = service.page(0, 2).await?;
        let second = service.page(2, 2).await?;

        assert_eq!(first.total, 4);
        assert_eq!(second.total, 4);
        assert_eq!(first.data.len(), 2);
        assert_eq!(second.data.len(), 2);

        let ids: Vec<&str> = first
            .data
            .iter()
            .chain(second.data.iter())
            .map(|stats| stats.video_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        Ok(())
    }

    #[tokio::test]
    async fn for_video_finds_one_or_none() -> Result<()> {
        let (_dir, service, store) = create_service().await?;
        seed(&store, "known", 2).await?;

        let stats = service.for_video("known").await?.unwrap();
        assert_eq!(stats.filename, "known.m4a");
        assert_eq!(stats.count, 2);

        assert!(service.for_video("missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn empty_library_yields_an_empty_page() -> Result<()> {
        let (_dir, service, _store) = create_service().await?;
        let page = service.page(0, 25).await?;
        assert!(page.data.is_empty());
        assert_eq!(page.total, 0);
        Ok(())
    }
}
