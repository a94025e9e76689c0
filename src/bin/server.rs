#![forbid(unsafe_code)]

//! HTTP server for the tubecast podcast backend.
//!
//! Accepts YouTube video URLs, hands them to the download orchestrator and
//! serves the resulting audio files plus their metadata, access statistics
//! and the feed-level channel settings. Downloads run in background tasks;
//! every request returns promptly.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;

use tubecast::channel::{Channel, ChannelStore, ChannelUpdate};
use tubecast::config::{RuntimeOverrides, resolve_runtime_settings};
use tubecast::downloads::{DownloadError, DownloadOrchestrator};
use tubecast::episodes::{Episode, EpisodeStatus, EpisodeStore};
use tubecast::extractor::YtDlpExtractor;
use tubecast::security::ensure_not_root;
use tubecast::stats::{FileAccessStats, StatsPage, StatsService};

const DEFAULT_LIST_LIMIT: i64 = 50;
const DEFAULT_STATS_LIMIT: i64 = 100;
const MAX_PAGE_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
struct ServerArgs {
    database_path: PathBuf,
    downloads_path: PathBuf,
    audio_format: String,
    port: u16,
    listen_host: IpAddr,
    download_timeout: Duration,
}

impl ServerArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--database-path=") {
                overrides.database_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--downloads-path=") {
                overrides.downloads_path = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--audio-format=") {
                overrides.audio_format = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                overrides.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--database-path" => {
                    overrides.database_path = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                "--downloads-path" => {
                    overrides.downloads_path = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                "--audio-format" => {
                    overrides.audio_format = Some(next_value(&mut args, &arg)?);
                }
                "--port" => {
                    overrides.port = Some(parse_port_arg(&next_value(&mut args, &arg)?)?);
                }
                "--host" => {
                    overrides.host = Some(next_value(&mut args, &arg)?);
                }
                "--env" => {
                    overrides.env_path = Some(PathBuf::from(next_value(&mut args, &arg)?));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        let settings = resolve_runtime_settings(overrides)?;
        let listen_host = parse_host_arg(&settings.host)?;

        Ok(Self {
            database_path: settings.database_path,
            downloads_path: settings.downloads_path,
            audio_format: settings.audio_format,
            port: settings.port,
            listen_host,
            download_timeout: Duration::from_secs(settings.download_timeout_secs),
        })
    }
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next().ok_or_else(|| anyhow!("{flag} requires a value"))
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBECAST_HOST")
}

/// Shared state injected into every Axum handler.
#[derive(Clone)]
struct AppState {
    store: EpisodeStore,
    channel: ChannelStore,
    stats: StatsService,
    orchestrator: DownloadOrchestrator,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn storage_error(err: anyhow::Error) -> ApiError {
    eprintln!("storage failure: {err:#}");
    ApiError::internal("storage failure")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse()?;

    ensure_not_root("server")?;

    std::fs::create_dir_all(&args.downloads_path).with_context(|| {
        format!(
            "creating downloads directory {}",
            args.downloads_path.display()
        )
    })?;

    let store = EpisodeStore::open(&args.database_path)
        .await
        .context("opening episode store")?;
    let channel = ChannelStore::open(&args.database_path)
        .await
        .context("opening channel store")?;
    let orchestrator = DownloadOrchestrator::new(
        store.clone(),
        Arc::new(YtDlpExtractor::new()),
        args.downloads_path.clone(),
        args.audio_format.clone(),
        args.download_timeout,
    );

    // Recover episodes orphaned in `downloading` by an earlier crash.
    let stale_after = chrono::Duration::seconds(args.download_timeout.as_secs() as i64);
    let reconciled = orchestrator.reconcile_stale(stale_after).await?;
    if reconciled > 0 {
        println!("marked {reconciled} stalled download(s) as failed");
    }

    let state = AppState {
        stats: StatsService::new(store.clone(), args.audio_format.clone()),
        store,
        channel,
        orchestrator,
    };

    let app = Router::new()
        .route("/api/download", post(request_download))
        .route("/api/status/{video_id}", get(get_status))
        .route("/api/downloads", get(list_downloads))
        .route("/audio/files", get(list_audio_files))
        .route("/audio/{video_id}", get(stream_audio))
        .route("/stats", get(stats_page))
        .route("/stats/{video_id}", get(stats_for_video))
        .route("/channel", get(get_channel).put(put_channel))
        .with_state(state);

    let addr = SocketAddr::new(args.listen_host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("tubecast listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only affects graceful shutdown; the process still dies on Ctrl+C.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

#[derive(Deserialize)]
struct DownloadQuery {
    url: Option<String>,
}

async fn request_download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Json<Episode>> {
    let url = query
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing url query parameter"))?;

    match state.orchestrator.start_download(url).await {
        Ok(episode) => Ok(Json(episode)),
        Err(DownloadError::InvalidUrl) => Err(ApiError::bad_request(
            "could not extract a video id from the URL",
        )),
        Err(err @ DownloadError::Extraction(_)) => Err(ApiError::bad_request(err.to_string())),
        Err(DownloadError::Storage(err)) => Err(storage_error(err)),
    }
}

async fn get_status(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<Episode>> {
    let episode = state
        .store
        .get_by_video_id(&video_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::not_found("episode not found"))?;
    Ok(Json(episode))
}

#[derive(Deserialize)]
struct ListQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    status: Option<String>,
}

async fn list_downloads(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Episode>>> {
    let limit = clamp_limit(query.limit, DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let episodes = match query.status.as_deref() {
        None => state.store.list(limit, offset).await,
        Some(raw) => {
            let status = EpisodeStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status filter {raw:?}")))?;
            state.store.list_by_status(status, limit, offset).await
        }
    }
    .map_err(storage_error)?;
    Ok(Json(episodes))
}

#[derive(Deserialize)]
struct PageQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_audio_files(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<Vec<Episode>>> {
    let limit = clamp_limit(query.limit, DEFAULT_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    let episodes = state
        .store
        .list_by_status(EpisodeStatus::Downloaded, limit, offset)
        .await
        .map_err(storage_error)?;
    Ok(Json(episodes))
}

/// Serves the audio bytes for one episode and bumps its access counter.
/// Range requests get 206 responses so podcast clients can resume and seek.
async fn stream_audio(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let episode = state
        .store
        .get_by_video_id(&video_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::not_found("episode not found"))?;

    if episode.status != EpisodeStatus::Downloaded {
        return Err(ApiError::not_found("audio not available"));
    }
    let media_url = episode
        .media_url
        .as_deref()
        .ok_or_else(|| ApiError::not_found("audio not available"))?;

    let response = stream_audio_file(PathBuf::from(media_url), Some(&headers)).await?;

    if let Err(err) = state.store.increment_access(&episode.id).await {
        // Serving the bytes beats losing the request over a counter write.
        eprintln!("failed to record access for {video_id}: {err:#}");
    }

    Ok(response)
}

#[derive(Deserialize)]
struct StatsQuery {
    skip: Option<i64>,
    limit: Option<i64>,
}

async fn stats_page(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<StatsPage>> {
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = clamp_limit(query.limit, DEFAULT_STATS_LIMIT);
    let page = state.stats.page(skip, limit).await.map_err(storage_error)?;
    Ok(Json(page))
}

async fn stats_for_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Json<FileAccessStats>> {
    let stats = state
        .stats
        .for_video(&video_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::not_found("episode not found"))?;
    Ok(Json(stats))
}

async fn get_channel(State(state): State<AppState>) -> ApiResult<Json<Channel>> {
    let channel = state
        .channel
        .get()
        .await
        .map_err(storage_error)?
        .ok_or_else(|| ApiError::not_found("channel not configured"))?;
    Ok(Json(channel))
}

async fn put_channel(
    State(state): State<AppState>,
    Json(payload): Json<ChannelUpdate>,
) -> ApiResult<Json<Channel>> {
    if payload.name.trim().is_empty() {
        return Err(ApiError::bad_request("channel name must not be empty"));
    }
    if payload.description.trim().is_empty() {
        return Err(ApiError::bad_request(
            "channel description must not be empty",
        ));
    }
    let channel = state
        .channel
        .upsert(&payload)
        .await
        .map_err(storage_error)?;
    Ok(Json(channel))
}

fn clamp_limit(requested: Option<i64>, default: i64) -> i64 {
    requested.unwrap_or(default).clamp(1, MAX_PAGE_LIMIT)
}

async fn stream_audio_file(path: PathBuf, headers: Option<&HeaderMap>) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let mime = MimeGuess::from_path(&path).first();
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_byte_range(value, size));

    let mut response = if let Some((start, end)) = range {
        if start >= size {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes */{}", size).parse().unwrap(),
            );
            response
        } else {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|_| ApiError::not_found("file not found"))?;
            let stream = ReaderStream::new(file.take(length));
            let mut response = Body::from_stream(stream).into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, size).parse().unwrap(),
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length.to_string().parse().unwrap());
            response
        }
    } else {
        Body::from_stream(ReaderStream::new(file)).into_response()
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
    if let Some(mime) = mime
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

fn parse_byte_range(value: &header::HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: "-N" means last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        let start = size.saturating_sub(suffix_len);
        return Some((start, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
