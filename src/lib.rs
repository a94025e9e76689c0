#![forbid(unsafe_code)]

//! Shared library for the tubecast binaries.
//!
//! The actual HTTP surface lives in `src/bin/server.rs`; everything here is
//! reusable plumbing: configuration, the episode/channel stores, the media
//! extractor seam and the download orchestrator.

pub mod channel;
pub mod config;
pub mod downloads;
pub mod episodes;
pub mod extractor;
pub mod resolver;
pub mod security;
pub mod stats;
