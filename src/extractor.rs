#![forbid(unsafe_code)]

//! Media extraction seam.
//!
//! Everything that touches YouTube goes through the `MediaExtractor` trait so
//! the orchestrator and the tests never depend on the network. The production
//! implementation shells out to `yt-dlp`: `--dump-single-json` for metadata
//! and a plain audio-format download for the bytes. Calls block, so they are
//! always driven through `spawn_blocking`.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

/// Descriptive metadata for one video, normalized for the episode row.
#[derive(Debug, Clone, Default)]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub summary: Option<String>,
    pub author: Option<String>,
    pub keywords: Option<String>,
    pub image_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

/// Result of a completed audio fetch.
#[derive(Debug, Clone)]
pub struct DownloadedAudio {
    pub path: PathBuf,
    pub size: i64,
}

/// Narrow interface to the third-party extraction engine. Implementations
/// are blocking; callers wrap them in `tokio::task::spawn_blocking`.
pub trait MediaExtractor: Send + Sync {
    /// Resolves a URL to descriptive metadata without downloading anything.
    fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata>;

    /// Fetches the audio track into `dest_dir` as `{video_id}.{format}`.
    fn download_audio(
        &self,
        url: &str,
        video_id: &str,
        dest_dir: &Path,
        format: &str,
    ) -> Result<DownloadedAudio>;
}

/// Subset of yt-dlp's `--dump-single-json` payload we actually read.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    channel: Option<String>,
    uploader: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailInfo>,
    upload_date: Option<String>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailInfo {
    url: Option<String>,
    height: Option<i64>,
}

/// Production extractor backed by the `yt-dlp` binary.
pub struct YtDlpExtractor;

impl YtDlpExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn yt_dlp_command() -> Command {
    if let Ok(path) = std::env::var("TUBECAST_YTDLP_BIN") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Command::new(trimmed);
        }
    }
    Command::new("yt-dlp")
}

impl MediaExtractor for YtDlpExtractor {
    fn fetch_metadata(&self, url: &str) -> Result<VideoMetadata> {
        let output = yt_dlp_command()
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg(url)
            .output()
            .context("launching yt-dlp for metadata")?;
        if !output.status.success() {
            bail!(
                "yt-dlp metadata fetch failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let info: VideoInfo =
            serde_json::from_slice(&output.stdout).context("parsing yt-dlp metadata JSON")?;
        metadata_from_info(info)
    }

    fn download_audio(
        &self,
        url: &str,
        video_id: &str,
        dest_dir: &Path,
        format: &str,
    ) -> Result<DownloadedAudio> {
        std::fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating downloads directory {}", dest_dir.display()))?;

        let status = yt_dlp_command()
            .arg("--format")
            .arg(format!("{format}/bestaudio/best"))
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--paths")
            .arg(dest_dir)
            .arg("--output")
            .arg(format!("{video_id}.%(ext)s"))
            .arg(url)
            .status()
            .context("launching yt-dlp for audio download")?;
        if !status.success() {
            bail!("yt-dlp audio download exited with {status}");
        }

        let path = dest_dir.join(format!("{video_id}.{format}"));
        let size = std::fs::metadata(&path)
            .with_context(|| format!("downloaded file missing at {}", path.display()))?
            .len() as i64;
        if size == 0 {
            bail!("downloaded file {} is empty", path.display());
        }

        Ok(DownloadedAudio { path, size })
    }
}

/// Normalizes the raw yt-dlp payload into episode metadata: best thumbnail
/// by height, tags joined into keywords, description trimmed to a subtitle.
fn metadata_from_info(info: VideoInfo) -> Result<VideoMetadata> {
    let video_id = info
        .id
        .filter(|id| !id.is_empty())
        .context("yt-dlp payload carries no video id")?;
    let title = info
        .title
        .filter(|title| !title.is_empty())
        .context("yt-dlp payload carries no title")?;

    let subtitle = info.description.as_deref().map(short_subtitle);
    let keywords = if info.tags.is_empty() {
        None
    } else {
        Some(info.tags.join(", "))
    };
    let image_url = best_thumbnail(&info.thumbnails).or(info.thumbnail);
    let published_at = info.upload_date.as_deref().and_then(parse_upload_date);

    Ok(VideoMetadata {
        video_id,
        title,
        subtitle,
        summary: info.description,
        author: info.channel.or(info.uploader),
        keywords,
        image_url,
        published_at,
        duration_secs: info.duration.map(|secs| secs as i64),
    })
}

/// First hundred characters of the description, with an ellipsis when cut.
fn short_subtitle(description: &str) -> String {
    let prefix: String = description.chars().take(100).collect();
    if prefix.len() < description.len() {
        format!("{prefix}...")
    } else {
        prefix
    }
}

fn best_thumbnail(thumbnails: &[ThumbnailInfo]) -> Option<String> {
    thumbnails
        .iter()
        .max_by_key(|thumb| thumb.height.unwrap_or(0))
        .and_then(|thumb| thumb.url.clone())
}

/// yt-dlp reports upload dates as bare `YYYYMMDD`.
fn parse_upload_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
