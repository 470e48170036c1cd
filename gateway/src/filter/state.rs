//! Per-request lifecycle state and host-affinity accounting.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{debug, error};

use crate::{config::Backend, metadata::MetadataCenter};

/// Where a request currently sits in the filter state machine. Each proxy
/// callback is a transition input; terminal side effects key off the phase
/// reached when the log hook fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    ReceivingHeaders,
    ReceivingBody,
    Dispatched,
    Streaming,
    StreamingAfterFirstToken,
    AwaitingFullResponse,
    Complete,
    Failed,
    Terminated,
}

/// Mutable per-request bookkeeping. Single-owner: only the request's filter
/// instance touches it; the one-shot deletion guards shared with the timer
/// task live in [`LoadAccounting`] instead.
#[derive(Debug)]
pub struct RequestState {
    pub phase: LifecyclePhase,
    pub trace_id: String,
    pub unique_id: String,
    pub model_name: String,
    pub cluster: String,
    pub backend: Backend,
    pub server_ip: String,
    pub is_stream: bool,
    pub prompt_length: usize,
    pub prompt_hash: Vec<u64>,
    /// Microsecond wall-clock timestamps; zero means unset.
    pub send_finish_ts: i64,
    pub first_token_ts: i64,
    pub last_token_ts: i64,
}

impl Default for RequestState {
    fn default() -> Self {
        Self {
            phase: LifecyclePhase::ReceivingHeaders,
            trace_id: String::new(),
            unique_id: String::new(),
            model_name: String::new(),
            cluster: String::new(),
            backend: Backend::default(),
            server_ip: String::new(),
            is_stream: false,
            prompt_length: 0,
            prompt_hash: Vec::new(),
            send_finish_ts: 0,
            first_token_ts: 0,
            last_token_ts: 0,
        }
    }
}

impl RequestState {
    /// Time to first token. Zero when either timestamp is unset or the
    /// clocks disagree about ordering.
    pub fn ttft(&self) -> Duration {
        if self.first_token_ts <= 0 || self.send_finish_ts <= 0 {
            return Duration::ZERO;
        }
        if self.first_token_ts < self.send_finish_ts {
            return Duration::ZERO;
        }
        Duration::from_micros((self.first_token_ts - self.send_finish_ts) as u64)
    }
}

/// One-shot load-stat deletions for a dispatched request.
///
/// Shared between the filter and the scheduled delete-prompt timer; whichever
/// path runs first wins, the other no-ops on the guard flag. The guard is
/// only latched when the enqueue succeeded, so a dropped task leaves the
/// deletion retryable by a later path.
#[derive(Debug)]
pub(crate) struct LoadAccounting {
    metadata: Arc<dyn MetadataCenter>,
    trace_id: String,
    request_id: String,
    increase_recorded: AtomicBool,
    prompt_deleted: AtomicBool,
}

impl LoadAccounting {
    pub(crate) fn new(
        metadata: Arc<dyn MetadataCenter>,
        trace_id: String,
        request_id: String,
    ) -> Self {
        Self {
            metadata,
            trace_id,
            request_id,
            increase_recorded: AtomicBool::new(false),
            prompt_deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn record_increase(&self) {
        self.increase_recorded.store(true, Ordering::Release);
    }

    pub(crate) fn is_increase_recorded(&self) -> bool {
        self.increase_recorded.load(Ordering::Acquire)
    }

    /// Drop the prompt-length contribution; first caller wins.
    pub(crate) fn delete_prompt(&self) {
        if !self.is_increase_recorded() {
            return;
        }
        if self
            .prompt_deleted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Err(err) = self
            .metadata
            .delete_request_prompt(&self.trace_id, &self.request_id)
        {
            error!(
                trace_id = %self.trace_id,
                error = %err,
                "delete prompt length failed"
            );
            self.prompt_deleted.store(false, Ordering::Release);
            return;
        }
        debug!(trace_id = %self.trace_id, "delete prompt length");
    }

    /// Remove the request's load record at stream end; fires at most once.
    pub(crate) fn delete_request(&self) {
        if !self.increase_recorded.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Err(err) = self.metadata.delete_request(&self.trace_id, &self.request_id) {
            error!(
                trace_id = %self.trace_id,
                error = %err,
                "delete request failed"
            );
        }
        debug!(trace_id = %self.trace_id, "delete request");
    }
}

/// Linear placeholder model for expected time to first token, used to time
/// the delete-prompt fallback for non-stream responses.
/// TODO: feed observed TTFT history per model instead of a fixed slope.
pub(crate) fn estimate_ttft(_model_name: &str, prompt_length: usize) -> u64 {
    let base_ms = 100;
    let length_factor = (prompt_length / 1000) as u64;
    base_ms + length_factor * 50
}

pub(crate) fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
