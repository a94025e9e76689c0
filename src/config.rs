#![forbid(unsafe_code)]

//! Runtime configuration for the tubecast binaries.
//!
//! Values come from three layers, highest precedence first: explicit
//! overrides (CLI flags), process environment variables, then a `.env` file.
//! Anything still unset falls back to a documented default so a bare
//! `cargo run` works out of the box.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATABASE_PATH: &str = "./data/tubecast.db";
pub const DEFAULT_DOWNLOADS_PATH: &str = "./downloads";
pub const DEFAULT_AUDIO_FORMAT: &str = "m4a";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// Fully resolved settings used by the server at runtime.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub database_path: PathBuf,
    pub downloads_path: PathBuf,
    pub audio_format: String,
    pub port: u16,
    pub host: String,
    pub download_timeout_secs: u64,
}

/// Per-field overrides, typically filled in from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub database_path: Option<PathBuf>,
    pub downloads_path: Option<PathBuf>,
    pub audio_format: Option<String>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub download_timeout_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_settings() -> Result<RuntimeSettings> {
    resolve_runtime_settings(RuntimeOverrides::default())
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings_with_overrides(&file_vars, env_var_string, overrides)
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Result<RuntimeSettings> {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let database_path = overrides
        .database_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DATABASE_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string());
    let downloads_path = overrides
        .downloads_path
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("DOWNLOADS_PATH", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_DOWNLOADS_PATH.to_string());
    let audio_format = overrides
        .audio_format
        .and_then(non_blank)
        .or_else(|| lookup_value("AUDIO_FORMAT", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_AUDIO_FORMAT.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("TUBECAST_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("TUBECAST_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let download_timeout_secs = overrides
        .download_timeout_secs
        .or_else(|| {
            lookup_value("DOWNLOAD_TIMEOUT_SECS", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u64>().ok())
        })
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECS);

    Ok(RuntimeSettings {
        database_path: PathBuf::from(database_path),
        downloads_path: PathBuf::from(downloads_path),
        audio_format,
        port,
        host,
        download_timeout_secs,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
