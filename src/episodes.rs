#![forbid(unsafe_code)]

//! Episode persistence for tubecast.
//!
//! The `episodes` table is the single source of truth for download jobs and
//! the podcast metadata derived from them. Every write goes through
//! `EpisodeStore`; the orchestrator and the HTTP layer never touch SQL
//! directly.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, Value, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a download job.
///
/// Legal transitions: `pending → downloading`, `pending → error`,
/// `downloading → downloaded` and `downloading → error`. `downloaded` and
/// `error` are terminal; there is no automatic retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Downloading,
    Downloaded,
    Error,
}

impl EpisodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "downloaded" => Some(Self::Downloaded),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Downloaded | Self::Error)
    }

    /// Transition table for the download state machine.
    pub fn can_transition_to(self, next: EpisodeStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Downloading)
                | (Self::Pending, Self::Error)
                | (Self::Downloading, Self::Downloaded)
                | (Self::Downloading, Self::Error)
        )
    }
}

/// One row of the `episodes` table.
#[derive(Debug, Clone, Serialize)]
pub struct Episode {
    pub id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: EpisodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub video_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub position: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub explicit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Metadata captured at creation time. The row starts in `pending` with a
/// freshly generated id and a zeroed access counter.
#[derive(Debug, Clone, Default)]
pub struct NewEpisode {
    pub url: String,
    pub video_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub keywords: Option<String>,
    pub tags: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub explicit: bool,
    pub position: i64,
    pub media_duration: Option<i64>,
}

/// Media columns set alongside a status change. Absent fields keep their
/// stored value.
#[derive(Debug, Clone, Default)]
pub struct MediaFields {
    pub media_url: Option<String>,
    pub media_size: Option<i64>,
    pub media_duration: Option<i64>,
    pub media_length: Option<i64>,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    // `PRAGMA journal_mode` returns a row, which libsql rejects in
    // `execute_batch`, so it has to go through `query`.
    conn.query("PRAGMA journal_mode=WAL", ()).await?;
    conn.execute_batch(
        r#"
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS episodes (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            tags TEXT,
            count INTEGER NOT NULL DEFAULT 0,
            last_accessed_at TEXT,
            video_id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            subtitle TEXT,
            summary TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            image_url TEXT,
            published_at TEXT,
            explicit INTEGER NOT NULL DEFAULT 0,
            media_url TEXT,
            media_size INTEGER,
            author TEXT,
            keywords TEXT,
            media_duration INTEGER,
            media_length INTEGER,
            last_error TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_episodes_video_id ON episodes(video_id);
        CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);
        CREATE INDEX IF NOT EXISTS idx_episodes_created_at ON episodes(created_at);
        "#,
    )
    .await?;
    Ok(())
}

const EPISODE_COLUMNS: &str = r#"
    id, url, created_at, updated_at, status, tags, count, last_accessed_at,
    video_id, title, subtitle, summary, position, image_url, published_at,
    explicit, media_url, media_size, author, keywords, media_duration,
    media_length, last_error
"#;

/// Sole reader/writer of episode rows.
#[derive(Clone)]
pub struct EpisodeStore {
    conn: Connection,
}

impl EpisodeStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the
    /// episodes schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening episode DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Creates an episode for `data.video_id`, or returns the existing row
    /// unchanged when one is already present. The conflict clause makes the
    /// dedupe atomic even under concurrent requests for the same video.
    pub async fn create_episode(&self, data: &NewEpisode) -> Result<Episode> {
        let id = Uuid::new_v4().to_string();
        let now = format_timestamp(Utc::now());

        self.conn
            .execute(
                r#"
                INSERT INTO episodes (
                    id, url, created_at, updated_at, status, tags, count,
                    video_id, title, subtitle, summary, position, image_url,
                    published_at, explicit, author, keywords, media_duration
                ) VALUES (
                    ?1, ?2, ?3, ?3, 'pending', ?4, 0,
                    ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15
                )
                ON CONFLICT(video_id) DO NOTHING
                "#,
                params![
                    id.as_str(),
                    data.url.as_str(),
                    now.as_str(),
                    data.tags.as_deref(),
                    data.video_id.as_str(),
                    data.title.as_str(),
                    data.subtitle.as_deref(),
                    data.summary.as_deref(),
                    data.position,
                    data.image_url.as_deref(),
                    data.published_at.map(format_timestamp),
                    data.explicit as i64,
                    data.author.as_deref(),
                    data.keywords.as_deref(),
                    data.media_duration,
                ],
            )
            .await
            .context("inserting episode")?;

        self.get_by_video_id(&data.video_id)
            .await?
            .context("episode row missing right after insert")
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Episode>> {
        self.fetch_one("id", id).await
    }

    pub async fn get_by_video_id(&self, video_id: &str) -> Result<Option<Episode>> {
        self.fetch_one("video_id", video_id).await
    }

    /// Lists episodes newest-first. `offset` is stateless so pagination can
    /// restart anywhere.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Episode>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM episodes
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?1 OFFSET ?2
                "#
            ))
            .await?;
        let mut rows = stmt.query(params![limit, offset]).await?;
        collect_episodes(&mut rows).await
    }

    pub async fn list_by_status(
        &self,
        status: EpisodeStatus,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Episode>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM episodes
                WHERE status = ?1
                ORDER BY created_at DESC, rowid DESC
                LIMIT ?2 OFFSET ?3
                "#
            ))
            .await?;
        let mut rows = stmt.query(params![status.as_str(), limit, offset]).await?;
        collect_episodes(&mut rows).await
    }

    /// Applies a guarded status transition. Media fields land in the same
    /// UPDATE as the status so a `downloaded` row can never be observed
    /// without its media columns. `last_error` is recorded on `error` and
    /// cleared on `downloaded`.
    ///
    /// Returns `Ok(None)` when the episode does not exist and fails when the
    /// transition is not in the state-machine table.
    pub async fn update_status(
        &self,
        id: &str,
        status: EpisodeStatus,
        media: MediaFields,
        error_message: Option<&str>,
    ) -> Result<Option<Episode>> {
        let tx = self.conn.transaction().await?;

        let mut rows = tx
            .query("SELECT status FROM episodes WHERE id = ?1", params![id])
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let stored: String = row.get(0)?;
        let current = EpisodeStatus::parse(&stored)
            .with_context(|| format!("episode {id} has unknown status {stored:?}"))?;

        if !current.can_transition_to(status) {
            bail!(
                "illegal status transition {} -> {} for episode {id}",
                current.as_str(),
                status.as_str()
            );
        }
        if status == EpisodeStatus::Downloaded && media.media_url.is_none() {
            bail!("transition to downloaded requires media_url for episode {id}");
        }

        // Built dynamically so absent media fields keep their stored value.
        let mut assignments = vec!["status = ?".to_string(), "updated_at = ?".to_string()];
        let mut values: Vec<Value> = vec![
            Value::from(status.as_str()),
            Value::from(format_timestamp(Utc::now())),
        ];

        if let Some(media_url) = media.media_url {
            assignments.push("media_url = ?".into());
            values.push(Value::from(media_url));
        }
        if let Some(media_size) = media.media_size {
            assignments.push("media_size = ?".into());
            values.push(Value::from(media_size));
        }
        if let Some(media_duration) = media.media_duration {
            assignments.push("media_duration = ?".into());
            values.push(Value::from(media_duration));
        }
        if let Some(media_length) = media.media_length {
            assignments.push("media_length = ?".into());
            values.push(Value::from(media_length));
        }
        match status {
            EpisodeStatus::Error => {
                assignments.push("last_error = ?".into());
                values.push(match error_message {
                    Some(message) => Value::from(message),
                    None => Value::Null,
                });
            }
            EpisodeStatus::Downloaded => {
                assignments.push("last_error = NULL".into());
            }
            _ => {}
        }
        values.push(Value::from(id));

        tx.execute(
            &format!(
                "UPDATE episodes SET {} WHERE id = ?",
                assignments.join(", ")
            ),
            values,
        )
        .await?;
        tx.commit().await?;

        self.get_by_id(id).await
    }

    /// Bumps the access counter. The arithmetic happens inside SQLite, so
    /// concurrent increments on the same row are never lost.
    pub async fn increment_access(&self, id: &str) -> Result<Option<Episode>> {
        let now = format_timestamp(Utc::now());
        let affected = self
            .conn
            .execute(
                r#"
                UPDATE episodes
                SET count = count + 1,
                    last_accessed_at = ?1,
                    updated_at = ?1
                WHERE id = ?2
                "#,
                params![now.as_str(), id],
            )
            .await?;
        if affected == 0 {
            return Ok(None);
        }
        self.get_by_id(id).await
    }

    /// Lists episodes for the stats view: most accessed first, then most
    /// recently accessed (never-accessed rows last), then newest.
    pub async fn list_by_access(&self, limit: i64, offset: i64) -> Result<Vec<Episode>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM episodes
                ORDER BY count DESC,
                         last_accessed_at IS NULL,
                         last_accessed_at DESC,
                         created_at DESC,
                         rowid DESC
                LIMIT ?1 OFFSET ?2
                "#
            ))
            .await?;
        let mut rows = stmt.query(params![limit, offset]).await?;
        collect_episodes(&mut rows).await
    }

    pub async fn count_all(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM episodes", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }

    pub async fn count_with_access(&self) -> Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM episodes WHERE count > 0", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }

    /// Episodes sitting in `downloading` whose last write predates `cutoff`.
    /// Used by the orchestrator to park rows orphaned by a crash or a hung
    /// extractor.
    pub async fn list_stale_downloading(&self, cutoff: DateTime<Utc>) -> Result<Vec<Episode>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                r#"
                SELECT {EPISODE_COLUMNS}
                FROM episodes
                WHERE status = 'downloading' AND updated_at < ?1
                ORDER BY updated_at ASC
                "#
            ))
            .await?;
        let mut rows = stmt.query(params![format_timestamp(cutoff)]).await?;
        collect_episodes(&mut rows).await
    }

    async fn fetch_one(&self, column: &str, value: &str) -> Result<Option<Episode>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EPISODE_COLUMNS} FROM episodes WHERE {column} = ?1"
            ))
            .await?;
        let mut rows = stmt.query([value]).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_episode(&row)?)),
            None => Ok(None),
        }
    }
}

async fn collect_episodes(rows: &mut libsql::Rows) -> Result<Vec<Episode>> {
    let mut episodes = Vec::new();
    while let Some(row) = rows.next().await? {
        episodes.push(row_to_episode(&row)?);
    }
    Ok(episodes)
}

/// RFC 3339 with fixed microsecond width so the TEXT columns sort
/// chronologically.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("parsing stored timestamp {raw:?}"))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Converts a SQL row into an `Episode`. Column order must match
/// `EPISODE_COLUMNS`.
fn row_to_episode(row: &Row) -> Result<Episode> {
    let status_raw: String = row.get(4)?;
    let status = EpisodeStatus::parse(&status_raw)
        .with_context(|| format!("unknown stored status {status_raw:?}"))?;

    Ok(Episode {
        id: row.get(0)?,
        url: row.get(1)?,
        created_at: parse_timestamp(&row.get::<String>(2)?)?,
        updated_at: parse_timestamp(&row.get::<String>(3)?)?,
        status,
        tags: row.get(5)?,
        count: row.get(6)?,
        last_accessed_at: parse_optional_timestamp(row.get(7)?)?,
        video_id: row.get(8)?,
        title: row.get(9)?,
        subtitle: row.get(10)?,
        summary: row.get(11)?,
        position: row.get(12)?,
        image_url: row.get(13)?,
        published_at: parse_optional_timestamp(row.get(14)?)?,
        explicit: row.get::<i64>(15).map(|value| value != 0)?,
        media_url: row.get(16)?,
        media_size: row.get(17)?,
        author: row.get(18)?,
        keywords: row.get(19)?,
        media_duration: row.get(20)?,
        media_length: row.get(21)?,
        last_error: row.get(22)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn sample_episode(video_id: &str) -> NewEpisode {
        NewEpisode {
            url: format!("https://www.youtube.com/watch?v={video_id}"),
            video_id: video_id.to_owned(),
            title: format!("Episode {video_id}"),
            subtitle: Some("short blurb".into()),
            summary: Some("full description".into()),
            author: Some("Channel".into()),
            keywords: Some("tech, audio".into()),
            tags: None,
            image_url: Some("https://img.example/thumb.jpg".into()),
            published_at: Some("2024-01-01T00:00:00Z".parse().unwrap()),
            explicit: false,
            position: 0,
            media_duration: Some(120),
        }
    }

    async fn create_store() -> Result<(tempfile::TempDir, EpisodeStore)> {
        let dir = tempdir()?;
        let store = EpisodeStore::open(&dir.path().join("data/test.db")).await?;
        Ok((dir, store))
    }

    /// Walks an episode to `downloaded` through the legal transitions.
    async fn complete_download(store: &EpisodeStore, id: &str) -> Result<Episode> {
        store
            .update_status(id, EpisodeStatus::Downloading, MediaFields::default(), None)
            .await?;
        let media = MediaFields {
            media_url: Some("/audio/file.m4a".into()),
            media_size: Some(1024),
            media_duration: Some(120),
            media_length: Some(1024),
        };
        store
            .update_status(id, EpisodeStatus::Downloaded, media, None)
            .await?
            .context("episode vanished")
    }

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("data/test.db");
        let _store = EpisodeStore::open(&path).await?;
        assert!(path.exists(), "database file should be created");

        let db = Builder::new_local(&path).build().await?;
        let conn = db.connect()?;
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='episodes'",
                params![],
            )
            .await?;
        assert!(rows.next().await?.is_some());

        for index in [
            "idx_episodes_video_id",
            "idx_episodes_status",
            "idx_episodes_created_at",
        ] {
            let mut rows = conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='index' AND name=?1",
                    [index],
                )
                .await?;
            assert!(rows.next().await?.is_some(), "missing index {index}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn create_starts_pending_with_zero_count() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let episode = store.create_episode(&sample_episode("abc123")).await?;
        assert_eq!(episode.status, EpisodeStatus::Pending);
        assert_eq!(episode.count, 0);
        assert!(episode.last_accessed_at.is_none());
        assert!(episode.media_url.is_none());
        assert_eq!(episode.created_at, episode.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn create_is_idempotent_per_video_id() -> Result<()> {
        let (_dir, store) = create_store().await?;

        let first = store.create_episode(&sample_episode("dup")).await?;
        let mut again = sample_episode("dup");
        again.title = "different title".into();
        let second = store.create_episode(&again).await?;

        assert_eq!(first.id, second.id);
        assert_eq!(second.title, first.title, "existing row returned unchanged");
        assert_eq!(store.count_all().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn get_by_id_and_video_id_agree() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let created = store.create_episode(&sample_episode("xyz")).await?;

        let by_id = store.get_by_id(&created.id).await?.unwrap();
        let by_video = store.get_by_video_id("xyz").await?.unwrap();
        assert_eq!(by_id.id, by_video.id);
        assert_eq!(by_id.video_id, "xyz");

        assert!(store.get_by_id("ghost").await?.is_none());
        assert!(store.get_by_video_id("ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_paginates_without_gaps_or_overlap() -> Result<()> {
        let (_dir, store) = create_store().await?;
        for video_id in ["a", "b", "c", "d"] {
            store.create_episode(&sample_episode(video_id)).await?;
        }

        let full: Vec<String> = store
            .list(4, 0)
            .await?
            .into_iter()
            .map(|episode| episode.id)
            .collect();
        let first: Vec<String> = store
            .list(2, 0)
            .await?
            .into_iter()
            .map(|episode| episode.id)
            .collect();
        let second: Vec<String> = store
            .list(2, 2)
            .await?
            .into_iter()
            .map(|episode| episode.id)
            .collect();

        assert_eq!(full.len(), 4);
        assert_eq!(first, full[..2].to_vec());
        assert_eq!(second, full[2..].to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn list_returns_newest_first() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.create_episode(&sample_episode("older")).await?;
        store.create_episode(&sample_episode("newer")).await?;

        let listed = store.list(10, 0).await?;
        assert_eq!(listed[0].video_id, "newer");
        assert_eq!(listed[1].video_id, "older");
        Ok(())
    }

    #[tokio::test]
    async fn list_by_status_filters() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let done = store.create_episode(&sample_episode("done")).await?;
        store.create_episode(&sample_episode("still-pending")).await?;
        complete_download(&store, &done.id).await?;

        let downloaded = store
            .list_by_status(EpisodeStatus::Downloaded, 10, 0)
            .await?;
        assert_eq!(downloaded.len(), 1);
        assert_eq!(downloaded[0].video_id, "done");

        let pending = store.list_by_status(EpisodeStatus::Pending, 10, 0).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].video_id, "still-pending");
        Ok(())
    }

    #[tokio::test]
    async fn update_status_rejects_illegal_transitions() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let episode = store.create_episode(&sample_episode("strict")).await?;

        // pending cannot jump straight to downloaded.
        let err = store
            .update_status(
                &episode.id,
                EpisodeStatus::Downloaded,
                MediaFields {
                    media_url: Some("/audio/x.m4a".into()),
                    ..MediaFields::default()
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal status transition"));

        // Terminal states never move again.
        complete_download(&store, &episode.id).await?;
        let err = store
            .update_status(
                &episode.id,
                EpisodeStatus::Pending,
                MediaFields::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("illegal status transition"));
        Ok(())
    }

    #[tokio::test]
    async fn update_status_missing_episode_returns_none() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let result = store
            .update_status("ghost", EpisodeStatus::Downloading, MediaFields::default(), None)
            .await?;
        assert!(result.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn downloaded_requires_media_url() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let episode = store.create_episode(&sample_episode("incomplete")).await?;
        store
            .update_status(&episode.id, EpisodeStatus::Downloading, MediaFields::default(), None)
            .await?;

        let err = store
            .update_status(&episode.id, EpisodeStatus::Downloaded, MediaFields::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires media_url"));
        Ok(())
    }

    #[tokio::test]
    async fn downloaded_lands_with_media_fields_in_one_read() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let episode = store.create_episode(&sample_episode("complete")).await?;
        complete_download(&store, &episode.id).await?;

        let fetched = store.get_by_id(&episode.id).await?.unwrap();
        assert_eq!(fetched.status, EpisodeStatus::Downloaded);
        assert_eq!(fetched.media_url.as_deref(), Some("/audio/file.m4a"));
        assert_eq!(fetched.media_size, Some(1024));
        assert!(fetched.last_error.is_none());
        assert!(fetched.updated_at > fetched.created_at);
        Ok(())
    }

    #[tokio::test]
    async fn error_records_message_and_keeps_metadata() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let episode = store.create_episode(&sample_episode("broken")).await?;
        store
            .update_status(&episode.id, EpisodeStatus::Downloading, MediaFields::default(), None)
            .await?;
        store
            .update_status(
                &episode.id,
                EpisodeStatus::Error,
                MediaFields::default(),
                Some("network unreachable"),
            )
            .await?;

        let fetched = store.get_by_id(&episode.id).await?.unwrap();
        assert_eq!(fetched.status, EpisodeStatus::Error);
        assert_eq!(fetched.last_error.as_deref(), Some("network unreachable"));
        assert_eq!(fetched.title, "Episode broken");
        assert!(fetched.media_url.is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_increments_are_never_lost() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let episode = store.create_episode(&sample_episode("hot")).await?;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            let id = episode.id.clone();
            handles.push(tokio::spawn(async move {
                store.increment_access(&id).await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let fetched = store.get_by_id(&episode.id).await?.unwrap();
        assert_eq!(fetched.count, 10);
        assert!(fetched.last_accessed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn increment_missing_episode_returns_none() -> Result<()> {
        let (_dir, store) = create_store().await?;
        assert!(store.increment_access("ghost").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn list_by_access_orders_by_count_then_recency() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let five = store.create_episode(&sample_episode("five")).await?;
        store.create_episode(&sample_episode("zero")).await?;
        let three = store.create_episode(&sample_episode("three")).await?;

        for _ in 0..5 {
            store.increment_access(&five.id).await?;
        }
        for _ in 0..3 {
            store.increment_access(&three.id).await?;
        }

        let ordered: Vec<String> = store
            .list_by_access(10, 0)
            .await?
            .into_iter()
            .map(|episode| episode.video_id)
            .collect();
        assert_eq!(ordered, vec!["five", "three", "zero"]);
        Ok(())
    }

    #[tokio::test]
    async fn counts_distinguish_accessed_rows() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let touched = store.create_episode(&sample_episode("touched")).await?;
        store.create_episode(&sample_episode("untouched")).await?;
        store.increment_access(&touched.id).await?;

        assert_eq!(store.count_all().await?, 2);
        assert_eq!(store.count_with_access().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn stale_downloading_rows_are_found() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let stuck = store.create_episode(&sample_episode("stuck")).await?;
        store
            .update_status(&stuck.id, EpisodeStatus::Downloading, MediaFields::default(), None)
            .await?;
        store.create_episode(&sample_episode("fresh")).await?;

        let future = Utc::now() + Duration::hours(1);
        let stale = store.list_stale_downloading(future).await?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].video_id, "stuck");

        let past = Utc::now() - Duration::hours(1);
        assert!(store.list_stale_downloading(past).await?.is_empty());
        Ok(())
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        use EpisodeStatus::*;
        assert!(Pending.can_transition_to(Downloading));
        assert!(Pending.can_transition_to(Error));
        assert!(Downloading.can_transition_to(Downloaded));
        assert!(Downloading.can_transition_to(Error));

        assert!(!Pending.can_transition_to(Downloaded));
        assert!(!Downloaded.can_transition_to(Pending));
        assert!(!Downloaded.can_transition_to(Downloading));
        assert!(!Error.can_transition_to(Downloading));
        assert!(!Error.can_transition_to(Pending));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            EpisodeStatus::Pending,
            EpisodeStatus::Downloading,
            EpisodeStatus::Downloaded,
            EpisodeStatus::Error,
        ] {
            assert_eq!(EpisodeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EpisodeStatus::parse("queued"), None);
    }
}
