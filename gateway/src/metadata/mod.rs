//! Metadata Center client.
//!
//! The Metadata Center is a best-effort out-of-band service tracking per-host
//! load and KV-cache placement. Writes are fire-and-forget through a bounded
//! task queue and never block the request path; reads are synchronous with a
//! hard deadline. Every fault here degrades to "no signal" — nothing from
//! this subsystem is ever surfaced to the client.

mod client;
mod queue;

use std::{collections::HashMap, env, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub use client::HttpMetadataCenter;
pub use queue::{Task, TaskQueue};

/// Cache locations returned per query.
pub const DEFAULT_TOP_K: usize = 10;

/// Header carrying the trace correlator on every Metadata Center request.
pub const TRACE_ID_HEADER: &str = "TraceId";

pub const LOAD_STATS_PATH: &str = "/v1/load/stats";
pub const LOAD_PROMPT_PATH: &str = "/v1/load/prompt";
pub const CACHE_QUERY_PATH: &str = "/v1/cache/query";
pub const CACHE_SAVE_PATH: &str = "/v1/cache/save";

/// Load statistics for one backend endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Outstanding requests queued on the endpoint.
    pub queued_reqs: i32,
    /// Total prompt bytes currently in flight; negative values from the
    /// remote are clamped to zero.
    pub prompt_length: usize,
    /// Requests in the prefill phase.
    pub prefill_reqs: i32,
}

/// Cache placement for a prompt fingerprint: `length` is the number of
/// fingerprint chunks matched from the front of the queried hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KVCacheLocation {
    pub ip: String,
    pub length: usize,
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata center disabled")]
    Disabled,

    #[error("async task queue is full")]
    QueueFull,

    #[error("async task queue is closed")]
    QueueClosed,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status code {status}, body: {body}")]
    Status { status: u16, body: String },

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// The full Metadata Center surface: asynchronous load-stat and cache-index
/// writes plus deadlined synchronous queries.
///
/// Write methods enqueue and return immediately; the enqueue order of a
/// request's `add_request` / `delete_request` pair is preserved FIFO, but the
/// remote may still observe reordering and must be idempotent against it.
#[async_trait]
pub trait MetadataCenter: Send + Sync + fmt::Debug {
    /// Record a dispatched request against `(cluster, ip)`. Returns
    /// [`MetadataError::QueueFull`] without blocking when saturated.
    fn add_request(
        &self,
        trace_id: &str,
        request_id: &str,
        cluster: &str,
        ip: &str,
        prompt_length: usize,
    ) -> MetadataResult<()>;

    /// Remove a completed request's load record.
    fn delete_request(&self, trace_id: &str, request_id: &str) -> MetadataResult<()>;

    /// Drop the prompt-length contribution once prefill is presumed done.
    fn delete_request_prompt(&self, trace_id: &str, request_id: &str) -> MetadataResult<()>;

    /// Fetch load statistics for every live endpoint of `cluster`.
    async fn query_load(
        &self,
        trace_id: &str,
        cluster: &str,
    ) -> MetadataResult<HashMap<String, EndpointStats>>;

    /// Fetch the top-K cache placements for a prompt fingerprint.
    async fn query_kvcache(
        &self,
        trace_id: &str,
        cluster: &str,
        prompt_hash: &[u64],
        top_k: usize,
    ) -> MetadataResult<Vec<KVCacheLocation>>;

    /// Record where a prompt's KV cache now lives.
    fn save_kvcache(
        &self,
        trace_id: &str,
        cluster: &str,
        ip: &str,
        prompt_hash: &[u64],
    ) -> MetadataResult<()>;

    fn is_enabled(&self) -> bool;

    fn is_cache_enabled(&self) -> bool;
}

/// Substitute used when the subsystem is disabled: writes succeed trivially,
/// reads report [`MetadataError::Disabled`] and the pipeline degrades to
/// unscored selection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetadataCenter;

#[async_trait]
impl MetadataCenter for NoopMetadataCenter {
    fn add_request(&self, _: &str, _: &str, _: &str, _: &str, _: usize) -> MetadataResult<()> {
        Ok(())
    }

    fn delete_request(&self, _: &str, _: &str) -> MetadataResult<()> {
        Ok(())
    }

    fn delete_request_prompt(&self, _: &str, _: &str) -> MetadataResult<()> {
        Ok(())
    }

    async fn query_load(
        &self,
        _: &str,
        _: &str,
    ) -> MetadataResult<HashMap<String, EndpointStats>> {
        Err(MetadataError::Disabled)
    }

    async fn query_kvcache(
        &self,
        _: &str,
        _: &str,
        _: &[u64],
        _: usize,
    ) -> MetadataResult<Vec<KVCacheLocation>> {
        Err(MetadataError::Disabled)
    }

    fn save_kvcache(&self, _: &str, _: &str, _: &str, _: &[u64]) -> MetadataResult<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn is_cache_enabled(&self) -> bool {
        false
    }
}

/// Environment variable names.
pub const ENV_HOST: &str = "METADATA_CENTER_HOST";
pub const ENV_PORT: &str = "METADATA_CENTER_PORT";
pub const ENV_CLIENT_TIMEOUT: &str = "METADATA_CENTER_CLIENT_TIMEOUT";
pub const ENV_CLIENT_KEEPALIVE: &str = "METADATA_CENTER_CLIENT_KEEPALIVE";
pub const ENV_CLIENT_MAX_IDLE_CONNS: &str = "METADATA_CENTER_CLIENT_MAX_IDLE_CONNS";
pub const ENV_FETCH_METRIC_TIMEOUT: &str = "METADATA_CENTER_FETCH_METRIC_TIMEOUT";
pub const ENV_FETCH_CACHE_TIMEOUT: &str = "METADATA_CENTER_FETCH_CACHE_TIMEOUT";
pub const ENV_UPDATE_STATS_TIMEOUT: &str = "METADATA_CENTER_UPDATE_STATS_TIMEOUT";
pub const ENV_QUEUE_SIZE: &str = "METADATA_CENTER_QUEUE_SIZE";
pub const ENV_WORKER_COUNT: &str = "METADATA_CENTER_WORKER_COUNT";
pub const ENV_MAX_FAILOVER_RETRY: &str = "METADATA_CENTER_MAX_FAILOVER_RETRY";

/// Connection and queue settings, normally resolved once from environment.
#[derive(Debug, Clone)]
pub struct MetadataSettings {
    pub host: String,
    pub port: u16,
    pub client_timeout: Duration,
    pub keep_alive: Duration,
    pub max_idle_conns: usize,
    pub fetch_metric_timeout: Duration,
    pub fetch_cache_timeout: Duration,
    pub update_stats_timeout: Duration,
    pub queue_size: usize,
    pub worker_count: usize,
    pub failover_retry: u32,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            client_timeout: Duration::from_millis(100),
            keep_alive: Duration::from_secs(10),
            max_idle_conns: 1024,
            fetch_metric_timeout: Duration::from_millis(100),
            fetch_cache_timeout: Duration::from_millis(100),
            update_stats_timeout: Duration::from_millis(100),
            queue_size: 1000,
            worker_count: 100,
            failover_retry: 1,
        }
    }
}

impl MetadataSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string(ENV_HOST, &defaults.host),
            port: env_parse(ENV_PORT, defaults.port),
            client_timeout: env_duration(ENV_CLIENT_TIMEOUT, defaults.client_timeout),
            keep_alive: env_duration(ENV_CLIENT_KEEPALIVE, defaults.keep_alive),
            max_idle_conns: env_parse(ENV_CLIENT_MAX_IDLE_CONNS, defaults.max_idle_conns),
            fetch_metric_timeout: env_duration(
                ENV_FETCH_METRIC_TIMEOUT,
                defaults.fetch_metric_timeout,
            ),
            fetch_cache_timeout: env_duration(
                ENV_FETCH_CACHE_TIMEOUT,
                defaults.fetch_cache_timeout,
            ),
            update_stats_timeout: env_duration(
                ENV_UPDATE_STATS_TIMEOUT,
                defaults.update_stats_timeout,
            ),
            queue_size: env_parse(ENV_QUEUE_SIZE, defaults.queue_size),
            worker_count: env_parse(ENV_WORKER_COUNT, defaults.worker_count),
            failover_retry: env_parse(ENV_MAX_FAILOVER_RETRY, defaults.failover_retry),
        }
    }
}

/// Build the process-wide Metadata Center handle from the environment.
///
/// An unset or empty `METADATA_CENTER_HOST` disables the subsystem. Must be
/// called within a tokio runtime (the enabled variant spawns queue workers).
pub fn center_from_env() -> MetadataResult<Arc<dyn MetadataCenter>> {
    if env_string(ENV_HOST, "").is_empty() {
        return Ok(Arc::new(NoopMetadataCenter));
    }
    Ok(Arc::new(HttpMetadataCenter::new(
        MetadataSettings::from_env(),
    )?))
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Accept `100ms` / `5s` style values; a bare integer means milliseconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.trim().parse().ok().map(Duration::from_secs);
    }
    value.parse().ok().map(Duration::from_millis)
}
