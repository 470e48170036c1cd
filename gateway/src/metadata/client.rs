//! HTTP implementation of the Metadata Center client.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{
    queue::{Task, TaskQueue},
    EndpointStats, KVCacheLocation, MetadataCenter, MetadataError, MetadataResult,
    MetadataSettings, CACHE_QUERY_PATH, CACHE_SAVE_PATH, LOAD_PROMPT_PATH, LOAD_STATS_PATH,
    TRACE_ID_HEADER,
};

/// Idle connections are recycled after this long regardless of keep-alive.
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared connection pool plus base URL; used by both the synchronous query
/// path and the async queue workers.
#[derive(Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    base_url: String,
}

impl Transport {
    pub(crate) fn new(settings: &MetadataSettings) -> MetadataResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(settings.client_timeout)
            .tcp_keepalive(settings.keep_alive)
            .pool_max_idle_per_host(settings.max_idle_conns)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("http://{}:{}", settings.host, settings.port),
        })
    }

    /// Issue one request under a hard deadline and return the body on 200.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, &str)]>,
        body: Option<Bytes>,
        trace_id: &str,
        timeout: Duration,
    ) -> MetadataResult<Bytes> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, url)
            .timeout(timeout)
            .header(TRACE_ID_HEADER, trace_id);

        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(MetadataError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(bytes)
    }
}

// Wire bodies.

#[derive(Debug, Serialize)]
struct AddRequestBody<'a> {
    request_id: &'a str,
    cluster: &'a str,
    ip: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    prompt_length: usize,
    timestamp: i64,
}

fn is_zero(v: &usize) -> bool {
    *v == 0
}

#[derive(Debug, Serialize)]
struct DeleteRequestBody<'a> {
    request_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CacheQueryBody<'a> {
    cluster: &'a str,
    prompt_hash: &'a [u64],
    topk: usize,
}

#[derive(Debug, Serialize)]
struct CacheSaveBody<'a> {
    cluster: &'a str,
    prompt_hash: &'a [u64],
    ip: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoadStatsResponse {
    #[serde(default)]
    data: Vec<EngineStatsWire>,
}

#[derive(Debug, Deserialize)]
struct EngineStatsWire {
    ip: String,
    #[serde(default)]
    queued_req_num: i32,
    #[serde(default)]
    prompt_length: i64,
    #[serde(default)]
    #[allow(dead_code)]
    updated_time: i64,
}

#[derive(Debug, Default, Deserialize)]
struct CacheQueryResponse {
    #[serde(default)]
    data: CacheQueryData,
}

#[derive(Debug, Default, Deserialize)]
struct CacheQueryData {
    #[serde(default)]
    locations: Vec<LocationWire>,
}

#[derive(Debug, Deserialize)]
struct LocationWire {
    ip: String,
    #[serde(default)]
    length: i64,
}

/// Metadata Center client over HTTP with a bounded async write queue.
#[derive(Debug)]
pub struct HttpMetadataCenter {
    transport: Arc<Transport>,
    queue: TaskQueue,
    settings: MetadataSettings,
}

impl HttpMetadataCenter {
    /// Must be called within a tokio runtime: queue workers are spawned here.
    pub fn new(settings: MetadataSettings) -> MetadataResult<Self> {
        let transport = Arc::new(Transport::new(&settings)?);
        let queue = TaskQueue::start(
            settings.queue_size,
            settings.worker_count,
            settings.update_stats_timeout,
            Arc::clone(&transport),
        );

        info!(
            host = %settings.host,
            port = settings.port,
            "metadata center client initialized"
        );

        Ok(Self {
            transport,
            queue,
            settings,
        })
    }

    /// Close the write queue; workers drain pending tasks and exit.
    pub fn shutdown(&self) {
        self.queue.close();
    }

    fn dispatch(
        &self,
        hash_key: &str,
        method: Method,
        path: &'static str,
        body: Vec<u8>,
        trace_id: &str,
    ) -> MetadataResult<()> {
        self.queue.dispatch(Task {
            hash_key: hash_key.to_string(),
            method,
            path,
            body: Bytes::from(body),
            trace_id: trace_id.to_string(),
            timeout: None,
        })
    }
}

#[async_trait]
impl MetadataCenter for HttpMetadataCenter {
    fn add_request(
        &self,
        trace_id: &str,
        request_id: &str,
        cluster: &str,
        ip: &str,
        prompt_length: usize,
    ) -> MetadataResult<()> {
        let body = serde_json::to_vec(&AddRequestBody {
            request_id,
            cluster,
            ip,
            prompt_length,
            timestamp: now_nanos(),
        })?;

        self.dispatch(cluster, Method::POST, LOAD_STATS_PATH, body, trace_id)?;
        debug!(trace_id, request_id, cluster, ip, prompt_length, "add request stats");
        Ok(())
    }

    fn delete_request(&self, trace_id: &str, request_id: &str) -> MetadataResult<()> {
        let body = serde_json::to_vec(&DeleteRequestBody { request_id })?;
        self.dispatch("", Method::DELETE, LOAD_STATS_PATH, body, trace_id)?;
        debug!(trace_id, request_id, "delete request stats");
        Ok(())
    }

    fn delete_request_prompt(&self, trace_id: &str, request_id: &str) -> MetadataResult<()> {
        let body = serde_json::to_vec(&DeleteRequestBody { request_id })?;
        self.dispatch("", Method::DELETE, LOAD_PROMPT_PATH, body, trace_id)?;
        debug!(trace_id, request_id, "delete prompt length");
        Ok(())
    }

    async fn query_load(
        &self,
        trace_id: &str,
        cluster: &str,
    ) -> MetadataResult<HashMap<String, EndpointStats>> {
        let body = self
            .transport
            .send(
                Method::GET,
                LOAD_STATS_PATH,
                Some(&[("cluster", cluster)]),
                None,
                trace_id,
                self.settings.fetch_metric_timeout,
            )
            .await?;

        let response: LoadStatsResponse = serde_json::from_slice(&body)?;
        let mut stats = HashMap::with_capacity(response.data.len());
        for engine in response.data {
            let prompt_length = if engine.prompt_length < 0 {
                error!(
                    ip = %engine.ip,
                    prompt_length = engine.prompt_length,
                    "query load returned negative prompt length"
                );
                0
            } else {
                engine.prompt_length as usize
            };

            stats.insert(
                engine.ip,
                EndpointStats {
                    queued_reqs: engine.queued_req_num,
                    prompt_length,
                    prefill_reqs: 0,
                },
            );
        }

        Ok(stats)
    }

    async fn query_kvcache(
        &self,
        trace_id: &str,
        cluster: &str,
        prompt_hash: &[u64],
        top_k: usize,
    ) -> MetadataResult<Vec<KVCacheLocation>> {
        let body = serde_json::to_vec(&CacheQueryBody {
            cluster,
            prompt_hash,
            topk: top_k,
        })?;

        let response = self
            .transport
            .send(
                Method::POST,
                CACHE_QUERY_PATH,
                None,
                Some(Bytes::from(body)),
                trace_id,
                self.settings.fetch_cache_timeout,
            )
            .await?;

        let response: CacheQueryResponse = serde_json::from_slice(&response)?;
        let locations = response
            .data
            .locations
            .into_iter()
            .map(|loc| KVCacheLocation {
                ip: loc.ip,
                length: loc.length.max(0) as usize,
            })
            .collect();

        Ok(locations)
    }

    fn save_kvcache(
        &self,
        trace_id: &str,
        cluster: &str,
        ip: &str,
        prompt_hash: &[u64],
    ) -> MetadataResult<()> {
        let body = serde_json::to_vec(&CacheSaveBody {
            cluster,
            prompt_hash,
            ip,
        })?;

        self.dispatch(cluster, Method::POST, CACHE_SAVE_PATH, body, trace_id)?;
        debug!(trace_id, cluster, ip, "save kv cache");
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn is_cache_enabled(&self) -> bool {
        true
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
