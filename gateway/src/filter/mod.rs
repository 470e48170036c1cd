//! The LLM proxy filter: per-request state machine tying routing, host
//! selection, and Metadata Center bookkeeping to the proxy host callbacks.
//!
//! The proxy host drives one [`LlmProxyFilter`] per request through
//! `decode_headers` → `decode_request` → `encode_headers` →
//! (`encode_data`* | `encode_response`) → `on_log`, invoking callbacks
//! sequentially per request while many requests run in parallel. Each
//! callback returns a [`FilterAction`] telling the host how to proceed.
//!
//! The response head is handed back on every encode callback as a mutable
//! [`ResponseHead`]; mutations are honored until the host flushes the head
//! downstream, which allows a mid-stream transcode failure to rewrite the
//! status before any bytes left the proxy.

mod state;

use std::{env, sync::Arc, time::Duration};

use bytes::Bytes;
use gateway_protocols::error::{
    format_gateway_response, ErrCode, ERR_BAD_REQUEST, ERR_INFERENCE_SERVER, ERR_NOT_FOUND,
};
use http::{
    header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE},
    HeaderMap, StatusCode,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use state::{LifecyclePhase, RequestState};
use state::{estimate_ttft, now_micros, LoadAccounting};

use crate::{
    config::{ConfigError, FilterConfig, LbConfig, RouteTable},
    core::HostProvider,
    hash::PromptHasher,
    metadata::MetadataCenter,
    policies::{choose_host, PolicyRegistry, SelectionInput},
    transcoder::{Transcoder, TranscoderRegistry},
};

/// Filter name under which the plugin registers with the proxy host.
pub const FILTER_NAME: &str = "llm-proxy";

pub const X_UPSTREAM_HOST: HeaderName = HeaderName::from_static("x-upstream-host");
pub const X_LLM_PROXY_VIA: HeaderName = HeaderName::from_static("x-llm-proxy-via");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_TRACE_ID: HeaderName = HeaderName::from_static("x-trace-id");
const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

const CONTENT_TYPE_JSON: HeaderValue = HeaderValue::from_static("application/json");
const CONTENT_TYPE_EVENT_STREAM: HeaderValue =
    HeaderValue::from_static("text/event-stream;charset=UTF-8");

/// Delete-prompt fallback fires at 1.2x the estimated TTFT.
const PROMPT_TIMER_NUMER: u64 = 12;
const PROMPT_TIMER_DENOM: u64 = 10;

/// Verb returned to the proxy host from each callback.
#[derive(Debug)]
pub enum FilterAction {
    /// Proceed with the (possibly mutated) message.
    Continue,
    /// Buffer the entire body before calling back.
    WaitAllData,
    /// Deliver data chunk-by-chunk as it arrives.
    WaitData,
    /// Short-circuit with a locally generated response.
    LocalResponse(LocalResponse),
}

#[derive(Debug)]
pub struct LocalResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Response status line and headers, mutable until the host flushes them.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

/// Process-scoped filter state: validated routing table plus the injected
/// service handles. One factory serves every request.
#[derive(Debug)]
pub struct FilterFactory {
    table: Arc<RouteTable>,
    metadata: Arc<dyn MetadataCenter>,
    policies: Arc<PolicyRegistry>,
    transcoders: Arc<TranscoderRegistry>,
    hosts: Arc<dyn HostProvider>,
    hasher: PromptHasher,
    via_hostname: Option<String>,
}

impl FilterFactory {
    /// Validate the configuration and assemble the shared state. A rule-set
    /// violation is fatal: the plugin refuses to activate.
    pub fn new(
        config: FilterConfig,
        metadata: Arc<dyn MetadataCenter>,
        hosts: Arc<dyn HostProvider>,
    ) -> Result<Self, ConfigError> {
        let table = Arc::new(config.build()?);
        let policies = Arc::new(PolicyRegistry::with_defaults(Arc::clone(&metadata)));

        info!(
            protocol = table.protocol(),
            algorithm = table.algorithm(),
            "llm proxy filter config parsed"
        );

        Ok(Self {
            table,
            metadata,
            policies,
            transcoders: Arc::new(TranscoderRegistry::with_defaults()),
            hosts,
            hasher: PromptHasher::default(),
            via_hostname: env::var("HOSTNAME").ok().filter(|v| !v.is_empty()),
        })
    }

    /// Swap in a custom policy registry (seeded policies in tests, extra
    /// algorithms in embedders).
    pub fn with_policy_registry(mut self, policies: PolicyRegistry) -> Self {
        self.policies = Arc::new(policies);
        self
    }

    pub fn with_via_hostname(mut self, hostname: Option<String>) -> Self {
        self.via_hostname = hostname;
        self
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Create the filter instance serving one request.
    pub fn new_filter(&self) -> LlmProxyFilter {
        LlmProxyFilter {
            table: Arc::clone(&self.table),
            metadata: Arc::clone(&self.metadata),
            policies: Arc::clone(&self.policies),
            transcoders: Arc::clone(&self.transcoders),
            hosts: Arc::clone(&self.hosts),
            hasher: self.hasher,
            via_hostname: self.via_hostname.clone(),
            state: RequestState::default(),
            lb: LbConfig::default(),
            load_aware: false,
            cache_aware: false,
            transcoder: None,
            accounting: None,
            prompt_timer: None,
            drop_resp_data: false,
        }
    }
}

/// Per-request filter instance.
pub struct LlmProxyFilter {
    table: Arc<RouteTable>,
    metadata: Arc<dyn MetadataCenter>,
    policies: Arc<PolicyRegistry>,
    transcoders: Arc<TranscoderRegistry>,
    hosts: Arc<dyn HostProvider>,
    hasher: PromptHasher,
    via_hostname: Option<String>,

    state: RequestState,
    lb: LbConfig,
    load_aware: bool,
    cache_aware: bool,
    transcoder: Option<Box<dyn Transcoder>>,
    accounting: Option<Arc<LoadAccounting>>,
    prompt_timer: Option<JoinHandle<()>>,
    drop_resp_data: bool,
}

impl LlmProxyFilter {
    pub fn state(&self) -> &RequestState {
        &self.state
    }

    /// Request headers arrived. A request without a body cannot carry a
    /// chat payload.
    pub fn decode_headers(&mut self, _headers: &HeaderMap, end_stream: bool) -> FilterAction {
        if end_stream {
            return self.bad_request("no request body");
        }
        self.state.phase = LifecyclePhase::ReceivingBody;
        FilterAction::WaitAllData
    }

    /// Full request available: parse, route, select a host, and dispatch.
    pub async fn decode_request(
        &mut self,
        headers: &mut HeaderMap,
        body: &[u8],
    ) -> FilterAction {
        self.state.trace_id = trace_id_from(headers);

        let protocol = self.table.protocol().to_string();
        let Some(factory) = self.transcoders.get(&protocol) else {
            return self.bad_request(&format!("transcoder not found for protocol {protocol}"));
        };
        let mut transcoder = factory(Arc::clone(&self.table));

        let data = match transcoder.parse_request(headers, body) {
            Ok(data) => data,
            Err(err) => return self.bad_request(&err.to_string()),
        };

        self.state.model_name = data.model_name.clone();
        self.state.cluster = data.cluster.clone();
        self.state.backend = data.backend;
        self.state.prompt_length = data.prompt.len();

        debug!(
            trace_id = %self.state.trace_id,
            model = %self.state.model_name,
            cluster = %self.state.cluster,
            backend = %self.state.backend,
            "request resolved"
        );

        self.lb = self.resolve_lb_config();
        self.load_aware = self.lb.load_aware_enable;
        self.cache_aware = self.lb.cache_aware_enable;

        if self.cache_aware && !data.prompt.is_empty() {
            self.state.prompt_hash = self.hasher.fingerprint(&data.prompt);
            debug!(
                trace_id = %self.state.trace_id,
                prompt_length = self.state.prompt_length,
                hash_count = self.state.prompt_hash.len(),
                "prompt hash computed"
            );
        }

        let hosts = self.hosts.cluster_hosts(&self.state.cluster);
        if hosts.is_empty() {
            let message = format!("no hosts in cluster {}", self.state.cluster);
            return self.no_upstream(&message);
        }

        let input = SelectionInput {
            trace_id: self.state.trace_id.clone(),
            cluster: self.state.cluster.clone(),
            model_name: self.state.model_name.clone(),
            selector: data.selector,
            prompt_hash: self.state.prompt_hash.clone(),
            load_aware: self.load_aware,
            cache_aware: self.cache_aware,
            candidate_percent: self.lb.candidate_percent,
            request_load_weight: self.lb.request_load_weight,
            prefill_load_weight: self.lb.prefill_load_weight,
            cache_ratio_weight: self.lb.cache_ratio_weight,
        };

        let chosen = choose_host(&self.policies, self.table.algorithm(), &hosts, &input).await;
        let Some(host) = chosen else {
            let message = format!("failed to choose host from cluster {}", self.state.cluster);
            return self.no_upstream(&message);
        };

        self.state.server_ip = host.ip().to_string();
        info!(
            trace_id = %self.state.trace_id,
            backend = %self.state.server_ip,
            cluster = %self.state.cluster,
            "selected backend"
        );

        // A LoRA adapter from the matched rule replaces the proxy-side model
        // name for the upstream request.
        let proxy_model = data
            .lora_id
            .clone()
            .unwrap_or_else(|| self.state.model_name.clone());
        let request_ctx =
            match transcoder.encode_request(&proxy_model, data.backend, headers, body) {
                Ok(ctx) => ctx,
                Err(err) => return self.bad_request(&err.to_string()),
            };
        self.state.is_stream = request_ctx.is_stream;
        self.transcoder = Some(transcoder);

        self.dispatch_add_request();
        self.state.send_finish_ts = now_micros();

        if let Ok(value) = HeaderValue::from_str(&host.address()) {
            headers.insert(X_UPSTREAM_HOST, value);
        }

        self.state.phase = LifecyclePhase::Dispatched;
        FilterAction::Continue
    }

    /// Upstream response headers arrived.
    pub fn encode_headers(&mut self, head: &mut ResponseHead, end_stream: bool) -> FilterAction {
        if let Some(hostname) = &self.via_hostname {
            if let Ok(value) = HeaderValue::from_str(hostname) {
                head.headers.append(X_LLM_PROXY_VIA, value);
            }
        }

        if head.status.as_u16() >= 400 {
            info!(
                trace_id = %self.state.trace_id,
                status = head.status.as_u16(),
                "error response from upstream"
            );
            self.state.phase = LifecyclePhase::AwaitingFullResponse;
            return FilterAction::WaitAllData;
        }

        self.dispatch_save_kvcache();

        if let Some(transcoder) = self.transcoder.as_mut() {
            if let Err(err) = transcoder.decode_headers(&head.headers) {
                return self.bad_response(&err.to_string());
            }
        }

        if end_stream {
            return self.bad_response("no response data");
        }

        if self.state.is_stream {
            head.headers.insert(CONTENT_TYPE, CONTENT_TYPE_EVENT_STREAM);
            head.headers
                .insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
            self.state.phase = LifecyclePhase::Streaming;
            FilterAction::WaitData
        } else {
            head.headers.insert(CONTENT_TYPE, CONTENT_TYPE_JSON);
            self.state.phase = LifecyclePhase::AwaitingFullResponse;
            FilterAction::WaitAllData
        }
    }

    /// One streaming response chunk.
    pub fn encode_data(
        &mut self,
        head: &mut ResponseHead,
        buffer: &mut Vec<u8>,
        end_stream: bool,
    ) -> FilterAction {
        self.record_token_time();
        let action = self.process_response_data(head, buffer);
        if end_stream && self.state.phase == LifecyclePhase::StreamingAfterFirstToken {
            self.state.phase = LifecyclePhase::Complete;
        }
        action
    }

    /// Complete non-stream response body.
    pub fn encode_response(
        &mut self,
        head: &mut ResponseHead,
        buffer: &mut Vec<u8>,
    ) -> FilterAction {
        self.delete_prompt_length();

        if head.status.as_u16() >= 400 {
            warn!(
                trace_id = %self.state.trace_id,
                status = head.status.as_u16(),
                body = %String::from_utf8_lossy(buffer),
                "passing through upstream error response"
            );
            self.state.phase = LifecyclePhase::Complete;
            return FilterAction::Continue;
        }

        let action = self.process_response_data(head, buffer);
        if self.state.phase != LifecyclePhase::Failed {
            self.state.phase = LifecyclePhase::Complete;
        }
        action
    }

    /// Request teardown: fire the pending delete-request and emit the
    /// completion record.
    pub fn on_log(&mut self) {
        self.cancel_prompt_timer();
        if let Some(accounting) = &self.accounting {
            accounting.delete_request();
        }

        let ttft = self.state.ttft();
        let log_items = self.transcoder.as_ref().map(|t| t.log_items());
        info!(
            trace_id = %self.state.trace_id,
            model = %self.state.model_name,
            backend = %self.state.server_ip,
            ttft_ms = ttft.as_millis() as u64,
            input_tokens = log_items.map(|l| l.input_tokens).unwrap_or(0),
            output_tokens = log_items.map(|l| l.output_tokens).unwrap_or(0),
            "request completed"
        );
        self.state.phase = LifecyclePhase::Terminated;
    }

    // Internal transitions.

    fn resolve_lb_config(&self) -> LbConfig {
        match self.table.lb_config(&self.state.model_name) {
            Some(config) => config.clone(),
            // Without a per-model mapping the awareness flags follow the
            // Metadata Center's enabled-ness.
            None => LbConfig {
                load_aware_enable: self.metadata.is_enabled(),
                cache_aware_enable: self.metadata.is_cache_enabled(),
                ..LbConfig::default()
            },
        }
    }

    fn unique_id(&mut self) -> String {
        if self.state.unique_id.is_empty() {
            self.state.unique_id = Uuid::new_v4().to_string();
        }
        self.state.unique_id.clone()
    }

    fn dispatch_add_request(&mut self) {
        if !self.load_aware {
            return;
        }

        let request_id = self.unique_id();
        let accounting = Arc::new(LoadAccounting::new(
            Arc::clone(&self.metadata),
            self.state.trace_id.clone(),
            request_id.clone(),
        ));

        let dispatched = self.metadata.add_request(
            &self.state.trace_id,
            &request_id,
            &self.state.cluster,
            &self.state.server_ip,
            self.state.prompt_length,
        );
        if let Err(err) = dispatched {
            error!(
                trace_id = %self.state.trace_id,
                error = %err,
                "add request failed"
            );
            self.accounting = Some(accounting);
            return;
        }

        accounting.record_increase();
        debug!(
            trace_id = %self.state.trace_id,
            cluster = %self.state.cluster,
            ip = %self.state.server_ip,
            prompt_length = self.state.prompt_length,
            "add request"
        );

        // Non-stream responses deliver no first-token signal, so a timer
        // drops the prompt length once prefill has presumably finished.
        if !self.state.is_stream {
            let delay_ms = estimate_ttft(&self.state.model_name, self.state.prompt_length)
                * PROMPT_TIMER_NUMER
                / PROMPT_TIMER_DENOM;
            let timer_accounting = Arc::clone(&accounting);
            self.prompt_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                timer_accounting.delete_prompt();
            }));
        }

        self.accounting = Some(accounting);
    }

    fn dispatch_save_kvcache(&mut self) {
        if !self.cache_aware || self.state.prompt_hash.is_empty() {
            return;
        }

        if let Err(err) = self.metadata.save_kvcache(
            &self.state.trace_id,
            &self.state.cluster,
            &self.state.server_ip,
            &self.state.prompt_hash,
        ) {
            error!(
                trace_id = %self.state.trace_id,
                error = %err,
                "save kv cache failed"
            );
        }
        debug!(
            trace_id = %self.state.trace_id,
            cluster = %self.state.cluster,
            ip = %self.state.server_ip,
            "save kv cache"
        );
    }

    fn delete_prompt_length(&mut self) {
        self.cancel_prompt_timer();
        if let Some(accounting) = &self.accounting {
            accounting.delete_prompt();
        }
    }

    fn cancel_prompt_timer(&mut self) {
        if let Some(timer) = self.prompt_timer.take() {
            timer.abort();
        }
    }

    fn record_token_time(&mut self) {
        let now = now_micros();
        if self.state.first_token_ts == 0 {
            self.state.first_token_ts = now;
            self.delete_prompt_length();
            if self.state.phase == LifecyclePhase::Streaming {
                self.state.phase = LifecyclePhase::StreamingAfterFirstToken;
            }
        }
        self.state.last_token_ts = now;
    }

    fn process_response_data(
        &mut self,
        head: &mut ResponseHead,
        buffer: &mut Vec<u8>,
    ) -> FilterAction {
        if self.drop_resp_data {
            buffer.clear();
            return FilterAction::Continue;
        }
        let Some(transcoder) = self.transcoder.as_mut() else {
            return FilterAction::Continue;
        };

        match transcoder.transcode_response(buffer) {
            Ok(output) => {
                if !self.state.is_stream {
                    set_content_length(&mut head.headers, output.len());
                }
                if output.as_ref() != buffer.as_slice() {
                    buffer.clear();
                    buffer.extend_from_slice(&output);
                }
                FilterAction::Continue
            }
            Err(err) => {
                warn!(
                    trace_id = %self.state.trace_id,
                    error = %err,
                    "response transcoding error"
                );
                if self.state.is_stream {
                    // Rewrite the status if the head has not been flushed
                    // yet and discard the rest of the stream.
                    head.status = StatusCode::BAD_REQUEST;
                    self.state.is_stream = false;
                    self.drop_resp_data = true;
                    buffer.clear();
                    set_content_length(&mut head.headers, 0);
                    return FilterAction::Continue;
                }
                buffer.clear();
                self.bad_response(&err.to_string())
            }
        }
    }

    // Local error responses.

    fn bad_request(&mut self, message: &str) -> FilterAction {
        info!(trace_id = %self.state.trace_id, reason = message, "bad request");
        self.local_response(&ERR_BAD_REQUEST, message)
    }

    fn no_upstream(&mut self, message: &str) -> FilterAction {
        info!(trace_id = %self.state.trace_id, reason = message, "no upstream");
        self.local_response(&ERR_NOT_FOUND, message)
    }

    fn bad_response(&mut self, message: &str) -> FilterAction {
        info!(trace_id = %self.state.trace_id, reason = message, "bad response");
        self.local_response(&ERR_INFERENCE_SERVER, message)
    }

    fn local_response(&mut self, code: &ErrCode, message: &str) -> FilterAction {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, CONTENT_TYPE_JSON);

        self.state.phase = LifecyclePhase::Failed;
        FilterAction::LocalResponse(LocalResponse {
            status: StatusCode::from_u16(code.code).unwrap_or(StatusCode::BAD_REQUEST),
            headers,
            body: format_gateway_response(code, &self.state.trace_id, message),
        })
    }
}

impl Drop for LlmProxyFilter {
    fn drop(&mut self) {
        self.cancel_prompt_timer();
    }
}

/// Trace correlator: `x-request-id` wins over `x-trace-id`; a fresh UUIDv4
/// is generated when neither is present.
fn trace_id_from(headers: &HeaderMap) -> String {
    for name in ["x-request-id", "x-trace-id"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    Uuid::new_v4().to_string()
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(CONTENT_LENGTH, value);
    }
}
