//! Request/response protocol transcoding.
//!
//! A transcoder parses the client payload into routing inputs, encodes the
//! upstream request for the selected backend, and frames the response on the
//! way back. Implementations are looked up by protocol tag in a
//! [`TranscoderRegistry`] populated at filter-factory construction.

pub mod openai;

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use gateway_protocols::chat::LlmLogItems;
use http::HeaderMap;
use thiserror::Error;

use crate::config::{Backend, RouteTable};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("failed to parse request: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("model is empty")]
    MissingModel,

    #[error("messages is empty")]
    EmptyMessages,

    #[error("model {0} not found in mapping rules")]
    UnmappedModel(String),

    #[error("no matching rule found for model {0}")]
    NoMatchingRule(String),

    #[error("no response data")]
    EmptyResponse,

    #[error("stream error: {0}")]
    Stream(String),
}

/// Routing inputs extracted from a parsed request.
#[derive(Debug, Clone, Default)]
pub struct RequestData {
    pub model_name: String,
    pub scene_name: String,
    pub cluster: String,
    pub backend: Backend,
    pub route_name: String,
    pub lora_id: Option<String>,
    pub selector: HashMap<String, String>,
    /// Concatenated text content, fed to the prompt fingerprinter.
    pub prompt: Bytes,
    pub is_vl_model: bool,
}

/// Outcome of encoding the upstream request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestContext {
    pub is_stream: bool,
}

pub trait Transcoder: Send {
    /// Parse and validate the client payload, resolving it against the
    /// routing table.
    fn parse_request(
        &mut self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<RequestData, TranscodeError>;

    /// Encode the request for the backend protocol. All supported backends
    /// accept the OpenAI shape, so the body passes through unchanged and
    /// only the stream flag is extracted.
    fn encode_request(
        &mut self,
        model_name: &str,
        backend: Backend,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<RequestContext, TranscodeError>;

    /// Inspect upstream response headers before framing begins.
    fn decode_headers(&mut self, headers: &HeaderMap) -> Result<(), TranscodeError>;

    /// Transcode one response buffer: the complete body for non-stream
    /// responses, one data chunk for streams.
    fn transcode_response(&mut self, data: &[u8]) -> Result<Bytes, TranscodeError>;

    /// Accounting accumulated while transcoding, surfaced at request end.
    fn log_items(&self) -> &LlmLogItems;
}

pub type TranscoderFactory = fn(Arc<RouteTable>) -> Box<dyn Transcoder>;

/// Transcoder factories keyed by input protocol tag.
#[derive(Debug, Default)]
pub struct TranscoderRegistry {
    factories: HashMap<&'static str, TranscoderFactory>,
}

impl TranscoderRegistry {
    pub const OPENAI: &'static str = "openai";

    pub fn with_defaults() -> Self {
        let mut registry = Self::default();
        registry.register(Self::OPENAI, openai::new_transcoder);
        registry
    }

    pub fn register(&mut self, protocol: &'static str, factory: TranscoderFactory) {
        self.factories.insert(protocol, factory);
    }

    pub fn get(&self, protocol: &str) -> Option<TranscoderFactory> {
        self.factories.get(protocol).copied()
    }
}
