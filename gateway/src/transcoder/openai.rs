//! OpenAI chat-completion transcoder.
//!
//! All four backend engines expose OpenAI-compatible HTTP endpoints, so the
//! request body forwards unchanged; this transcoder's work is validation,
//! routing-rule resolution, prompt extraction, and response framing
//! (non-stream JSON bodies and SSE streams).

use bytes::{Bytes, BytesMut};
use gateway_protocols::chat::{
    ChatCompletionRequest, LlmLogItems, MessageContent, UsageEnvelope, PART_TYPE_IMAGE_URL,
    PART_TYPE_TEXT,
};
use http::HeaderMap;
use memchr::memmem;
use std::sync::Arc;
use tracing::debug;

use super::{RequestContext, RequestData, TranscodeError, Transcoder};
use crate::config::{Backend, RouteTable};

pub const SSE_DATA_PREFIX: &[u8] = b"data: ";
pub const SSE_DONE_MARKER: &[u8] = b"[DONE]";
pub const SSE_FRAME_END: &[u8] = b"\n\n";

const ERROR_FIELD: &[u8] = b"\"error\"";

pub fn new_transcoder(table: Arc<RouteTable>) -> Box<dyn Transcoder> {
    Box::new(OpenAiTranscoder::new(table))
}

pub struct OpenAiTranscoder {
    table: Arc<RouteTable>,
    request: ChatCompletionRequest,
    backend: Backend,
    is_stream: bool,
    log_items: LlmLogItems,
}

impl OpenAiTranscoder {
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self {
            table,
            request: ChatCompletionRequest::default(),
            backend: Backend::default(),
            is_stream: false,
            log_items: LlmLogItems::default(),
        }
    }

    /// Concatenate text content across messages and detect image parts.
    fn extract_prompt(&self) -> (Bytes, bool) {
        let mut prompt = BytesMut::new();
        let mut is_vl_model = false;

        for message in &self.request.messages {
            match &message.content {
                Some(MessageContent::Text(text)) => prompt.extend_from_slice(text.as_bytes()),
                Some(MessageContent::Parts(parts)) => {
                    for part in parts {
                        if part.part_type == PART_TYPE_TEXT {
                            if let Some(text) = &part.text {
                                prompt.extend_from_slice(text.as_bytes());
                            }
                        } else if part.part_type == PART_TYPE_IMAGE_URL {
                            is_vl_model = true;
                        }
                    }
                }
                None => {}
            }
        }

        (prompt.freeze(), is_vl_model)
    }

    fn transcode_non_stream(&mut self, data: &[u8]) -> Result<Bytes, TranscodeError> {
        // Upstream error payloads pass through untouched.
        if memmem::find(data, ERROR_FIELD).is_none() {
            if let Ok(envelope) = serde_json::from_slice::<UsageEnvelope>(data) {
                if let Some(usage) = envelope.usage {
                    self.log_items.input_tokens = usage.prompt_tokens;
                    self.log_items.output_tokens = usage.completion_tokens;
                }
            }
        }

        Ok(Bytes::copy_from_slice(data))
    }

    fn transcode_stream(&mut self, data: &[u8]) -> Result<Bytes, TranscodeError> {
        // A bare JSON object in stream mode is the engine reporting an error
        // instead of SSE frames.
        if data.first() == Some(&b'{') && memmem::find(data, ERROR_FIELD).is_some() {
            return Err(TranscodeError::Stream(
                String::from_utf8_lossy(data).into_owned(),
            ));
        }

        Ok(Bytes::copy_from_slice(data))
    }
}

impl Transcoder for OpenAiTranscoder {
    fn parse_request(
        &mut self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<RequestData, TranscodeError> {
        self.request = serde_json::from_slice(body)?;

        if self.request.messages.is_empty() {
            return Err(TranscodeError::EmptyMessages);
        }
        if self.request.model.is_empty() {
            return Err(TranscodeError::MissingModel);
        }

        let mut data = RequestData {
            model_name: self.request.model.clone(),
            ..RequestData::default()
        };

        if self.table.has_mappings() {
            let mapping = self
                .table
                .mapping(&self.request.model)
                .ok_or_else(|| TranscodeError::UnmappedModel(self.request.model.clone()))?;
            let rule = mapping
                .resolve(headers)
                .ok_or_else(|| TranscodeError::NoMatchingRule(self.request.model.clone()))?;

            data.scene_name = rule.scene_name.clone();
            data.cluster = rule.cluster.clone();
            data.backend = rule.backend;
            data.route_name = rule.route_name.clone();
            data.lora_id = rule.lora_id.clone();
            data.selector = rule.selector.clone();
        }

        let (prompt, is_vl_model) = self.extract_prompt();
        data.prompt = prompt;
        data.is_vl_model = is_vl_model;

        self.log_items.model_name = data.model_name.clone();
        debug!(
            model = %data.model_name,
            cluster = %data.cluster,
            backend = %data.backend,
            "openai request parsed"
        );

        Ok(data)
    }

    fn encode_request(
        &mut self,
        _model_name: &str,
        backend: Backend,
        _headers: &HeaderMap,
        _body: &[u8],
    ) -> Result<RequestContext, TranscodeError> {
        self.is_stream = self.request.stream;
        self.backend = backend;

        // vLLM, SGLang, TensorRT, and Triton all take the original body.
        Ok(RequestContext {
            is_stream: self.is_stream,
        })
    }

    fn decode_headers(&mut self, _headers: &HeaderMap) -> Result<(), TranscodeError> {
        Ok(())
    }

    fn transcode_response(&mut self, data: &[u8]) -> Result<Bytes, TranscodeError> {
        if self.is_stream {
            self.transcode_stream(data)
        } else {
            self.transcode_non_stream(data)
        }
    }

    fn log_items(&self) -> &LlmLogItems {
        &self.log_items
    }
}
