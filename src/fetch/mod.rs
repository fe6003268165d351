//! Fetcher: one request to the realtime position feed per run.
//!
//! No retries here. A failed fetch fails the run and the caller's cadence
//! decides when to try again.

mod basic;
mod client;

pub use basic::BasicClient;
pub use client::HttpClient;

use bytes::Bytes;
use reqwest::Url;
use tracing::{debug, info};

use crate::config::FeedConfig;
use crate::error::{PipelineError, Result};
use crate::parser::{FeedSnapshot, parse_feed};
use crate::vocab::resolve_line;

/// Builds `{base}/{key}/json/realtimePosition/{start}/{end}/{line}`.
///
/// Segments are percent-encoded, so line names in Hangul are safe.
pub fn feed_url(config: &FeedConfig) -> Result<Url> {
    let mut url = Url::parse(&config.base_url)
        .map_err(|e| PipelineError::Config(format!("bad feed base URL: {e}")))?;

    let start = config.page_start.to_string();
    let end = config.page_end.to_string();
    url.path_segments_mut()
        .map_err(|_| PipelineError::Config("feed base URL cannot take a path".into()))?
        .pop_if_empty()
        .extend([
            config.api_key.as_str(),
            "json",
            "realtimePosition",
            start.as_str(),
            end.as_str(),
            resolve_line(&config.line),
        ]);

    Ok(url)
}

/// GETs `url` and returns the body, treating non-2xx answers as unavailable.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: Url) -> Result<Bytes> {
    let req = reqwest::Request::new(reqwest::Method::GET, url);

    let resp = client
        .execute(req)
        .await
        .map_err(|e| PipelineError::UpstreamUnavailable(e.without_url().to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(PipelineError::UpstreamUnavailable(format!(
            "feed returned HTTP {status}"
        )));
    }

    resp.bytes()
        .await
        .map_err(|e| PipelineError::UpstreamUnavailable(e.without_url().to_string()))
}

/// Fetches and decodes the configured line's positions.
#[tracing::instrument(skip_all, fields(line = %config.line))]
pub async fn fetch_positions<C: HttpClient + ?Sized>(
    client: &C,
    config: &FeedConfig,
) -> Result<FeedSnapshot> {
    let url = feed_url(config)?;

    let fetch_start = std::time::Instant::now();
    let bytes = fetch_bytes(client, url).await?;
    debug!(
        bytes = bytes.len(),
        elapsed_ms = fetch_start.elapsed().as_millis() as u64,
        "Feed bytes received, parsing"
    );

    let snapshot = parse_feed(&bytes)?;
    info!(
        positions = snapshot.positions.len(),
        feed_status = %snapshot.status.status,
        feed_code = %snapshot.status.code,
        "Feed fetched"
    );
    Ok(snapshot)
}
