//! Multi-signal host scoring.
//!
//! Merges per-host load statistics and KV-cache hit lengths into one score:
//!
//! ```text
//! score = cache_w * cache_hit_rate - eff_request_w * request_load - prefill_w * prefill_load
//! ```
//!
//! Signals are normalized into `[0, 1]` before weighting so the score stays
//! well-defined across heterogeneous ranges. The request-load weight scales
//! with the observed queue-depth spread: under uniform load the request
//! signal is muted, under spread it dominates.

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{core::Host, metadata::EndpointStats};

/// Queue-depth spread never drops below this, keeping uniform-load
/// request_load at zero for every host.
const MIN_QUEUE_DELTA: f64 = 2.0;

/// Prompt volume below this normalizes against it; prefill time is
/// negligible for shorter prompts.
const MIN_MAX_PROMPT_LENGTH: usize = 1024;

/// Queue-depth spread per unit of extra request weight.
const QUEUE_DELTA_PER_WEIGHT_STEP: f64 = 5.0;

#[derive(Debug, Clone, Copy)]
pub struct ScoreWeights {
    pub cache_ratio: f64,
    pub request_load: f64,
    pub prefill_load: f64,
}

/// One host with its merged signals and final score.
#[derive(Debug, Clone)]
pub struct ScoredHost {
    pub host: Arc<dyn Host>,
    pub stats: EndpointStats,
    pub cache_hit_len: usize,
    pub request_load: f64,
    pub prefill_load: f64,
    pub cache_hit_rate: f64,
    pub score: f64,
}

impl fmt::Display for ScoredHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={}, score={:.3}, reqLoad={:.3}, prefillLoad={:.3}, cacheHit={:.3}, queuedReqs={}, promptLen={}",
            self.host.ip(),
            self.score,
            self.request_load,
            self.prefill_load,
            self.cache_hit_rate,
            self.stats.queued_reqs,
            self.stats.prompt_length
        )
    }
}

/// Score every host and return them sorted by descending score.
///
/// Hosts absent from `load_stats` score with zeroed statistics; hosts absent
/// from `cache_hits` score with a zero cache-hit rate. Sorting is stable, so
/// equal scores keep input order (final tie-breaking is the caller's random
/// pick within the candidate slice).
pub fn score_hosts(
    hosts: &[Arc<dyn Host>],
    load_stats: &HashMap<String, EndpointStats>,
    cache_hits: Option<&HashMap<String, usize>>,
    weights: ScoreWeights,
    prompt_hash_len: usize,
) -> Vec<ScoredHost> {
    let mut max_queue: f64 = 0.0;
    let mut min_queue = f64::MAX;
    let mut max_prompt_length = MIN_MAX_PROMPT_LENGTH;

    let stats_of = |host: &Arc<dyn Host>| -> EndpointStats {
        load_stats.get(host.ip()).copied().unwrap_or_default()
    };

    for host in hosts {
        let stats = stats_of(host);
        let queued = f64::from(stats.queued_reqs);
        max_queue = max_queue.max(queued);
        min_queue = min_queue.min(queued);
        max_prompt_length = max_prompt_length.max(stats.prompt_length);
    }
    if min_queue == f64::MAX {
        min_queue = 0.0;
    }

    let delta = (max_queue - min_queue).max(MIN_QUEUE_DELTA);
    let effective_request_weight =
        weights.request_load * (delta / QUEUE_DELTA_PER_WEIGHT_STEP).ceil();

    let mut scored = Vec::with_capacity(hosts.len());
    for host in hosts {
        let stats = stats_of(host);
        let cache_hit_len = cache_hits
            .and_then(|hits| hits.get(host.ip()).copied())
            .unwrap_or(0);
        let cache_hit_rate = if prompt_hash_len == 0 {
            0.0
        } else {
            cache_hit_len as f64 / prompt_hash_len as f64
        };

        let request_load = (f64::from(stats.queued_reqs) - min_queue) / delta;
        let prefill_load = stats.prompt_length as f64 / max_prompt_length as f64;

        let score = weights.cache_ratio * cache_hit_rate
            - effective_request_weight * request_load
            - weights.prefill_load * prefill_load;

        scored.push(ScoredHost {
            host: Arc::clone(host),
            stats,
            cache_hit_len,
            request_load,
            prefill_load,
            cache_hit_rate,
            score,
        });
    }

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}
