//! Inference-aware load balancing.
//!
//! Blends queue depth, in-flight prompt volume, and KV-cache hit length into
//! a per-host score, keeps the top slice of candidates, and picks uniformly
//! at random within it. Every Metadata Center fault degrades the selection
//! rather than failing the request.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, info};

use super::{
    candidate_count,
    scoring::{score_hosts, ScoreWeights},
    LoadBalancingPolicy, SelectionInput, INFERENCE_LB,
};
use crate::{
    core::Host,
    metadata::{MetadataCenter, DEFAULT_TOP_K},
};

#[derive(Debug)]
pub struct InferenceLbPolicy {
    metadata: Arc<dyn MetadataCenter>,
    rng: Mutex<StdRng>,
}

impl InferenceLbPolicy {
    pub fn new(metadata: Arc<dyn MetadataCenter>) -> Self {
        Self {
            metadata,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic variant for tests: candidate tie-breaks come from a
    /// seeded generator.
    pub fn with_rng_seed(metadata: Arc<dyn MetadataCenter>, seed: u64) -> Self {
        Self {
            metadata,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Score the hosts and keep the top candidate slice.
    ///
    /// A load-stats failure returns the full list unscored; a cache failure
    /// only drops the cache term.
    async fn candidates_by_stats(
        &self,
        hosts: &[Arc<dyn Host>],
        input: &SelectionInput,
    ) -> Vec<Arc<dyn Host>> {
        let load_stats = match self
            .metadata
            .query_load(&input.trace_id, &input.cluster)
            .await
        {
            Ok(stats) => stats,
            Err(err) => {
                error!(
                    trace_id = %input.trace_id,
                    cluster = %input.cluster,
                    error = %err,
                    "failed to get endpoint stats"
                );
                return hosts.to_vec();
            }
        };

        let cache_hits = self.cache_hits(input).await;

        let weights = ScoreWeights {
            cache_ratio: f64::from(input.cache_ratio_weight),
            request_load: f64::from(input.request_load_weight),
            prefill_load: f64::from(input.prefill_load_weight),
        };
        let scored = score_hosts(
            hosts,
            &load_stats,
            cache_hits.as_ref(),
            weights,
            input.prompt_hash.len(),
        );

        let cand_num = candidate_count(hosts.len(), input.candidate_percent);
        for (i, stat) in scored.iter().enumerate().take(cand_num + 5) {
            info!(
                trace_id = %input.trace_id,
                cluster = %input.cluster,
                rank = i,
                "candidate: {stat}"
            );
        }

        scored
            .into_iter()
            .take(cand_num)
            .map(|s| s.host)
            .collect()
    }

    /// `ip -> matched fingerprint chunks`, or `None` when the cache signal
    /// is unavailable.
    async fn cache_hits(&self, input: &SelectionInput) -> Option<HashMap<String, usize>> {
        if !input.cache_aware || input.prompt_hash.is_empty() {
            return None;
        }

        match self
            .metadata
            .query_kvcache(
                &input.trace_id,
                &input.cluster,
                &input.prompt_hash,
                DEFAULT_TOP_K,
            )
            .await
        {
            Ok(locations) => Some(
                locations
                    .into_iter()
                    .map(|loc| (loc.ip, loc.length))
                    .collect(),
            ),
            Err(err) => {
                info!(
                    trace_id = %input.trace_id,
                    cluster = %input.cluster,
                    error = %err,
                    "failed to get cache stats"
                );
                None
            }
        }
    }

    fn pick_random(&self, hosts: &[Arc<dyn Host>], input: &SelectionInput) -> Option<Arc<dyn Host>> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.rng.lock().random_range(0..hosts.len());
        let host = &hosts[index];
        info!(
            trace_id = %input.trace_id,
            cluster = %input.cluster,
            chosen = index + 1,
            of = hosts.len(),
            address = %host.address(),
            "chose host"
        );
        Some(Arc::clone(host))
    }
}

#[async_trait]
impl LoadBalancingPolicy for InferenceLbPolicy {
    async fn select_host(
        &self,
        hosts: &[Arc<dyn Host>],
        input: &SelectionInput,
    ) -> Option<Arc<dyn Host>> {
        if !input.load_aware {
            debug!(trace_id = %input.trace_id, "load awareness disabled, choosing randomly");
            return self.pick_random(hosts, input);
        }

        let candidates = self.candidates_by_stats(hosts, input).await;
        self.pick_random(&candidates, input)
    }

    fn name(&self) -> &'static str {
        INFERENCE_LB
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::StaticHost,
        metadata::{EndpointStats, KVCacheLocation, MetadataError, MetadataResult, NoopMetadataCenter},
    };

    #[derive(Debug, Default)]
    struct FixedMetadata {
        load: HashMap<String, EndpointStats>,
        cache: Vec<KVCacheLocation>,
        fail_load: bool,
        fail_cache: bool,
    }

    #[async_trait]
    impl MetadataCenter for FixedMetadata {
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
            if self.fail_load {
                return Err(MetadataError::Disabled);
            }
            Ok(self.load.clone())
        }

        async fn query_kvcache(
            &self,
            _: &str,
            _: &str,
            _: &[u64],
            _: usize,
        ) -> MetadataResult<Vec<KVCacheLocation>> {
            if self.fail_cache {
                return Err(MetadataError::Disabled);
            }
            Ok(self.cache.clone())
        }

        fn save_kvcache(&self, _: &str, _: &str, _: &str, _: &[u64]) -> MetadataResult<()> {
            Ok(())
        }

        fn is_enabled(&self) -> bool {
            true
        }

        fn is_cache_enabled(&self) -> bool {
            true
        }
    }

    fn hosts(ips: &[&str]) -> Vec<Arc<dyn Host>> {
        ips.iter()
            .map(|ip| Arc::new(StaticHost::new(*ip, 8000)) as _)
            .collect()
    }

    fn load_aware_input() -> SelectionInput {
        SelectionInput {
            trace_id: "t".to_string(),
            cluster: "c1".to_string(),
            load_aware: true,
            candidate_percent: 50,
            request_load_weight: 1,
            prefill_load_weight: 3,
            cache_ratio_weight: 2,
            ..SelectionInput::default()
        }
    }

    #[tokio::test]
    async fn clear_winner_is_selected() {
        let metadata = Arc::new(FixedMetadata {
            load: HashMap::from([
                (
                    "10.0.0.1".to_string(),
                    EndpointStats {
                        queued_reqs: 10,
                        prompt_length: 8000,
                        prefill_reqs: 0,
                    },
                ),
                (
                    "10.0.0.2".to_string(),
                    EndpointStats {
                        queued_reqs: 1,
                        prompt_length: 100,
                        prefill_reqs: 0,
                    },
                ),
            ]),
            ..FixedMetadata::default()
        });

        let policy = InferenceLbPolicy::with_rng_seed(metadata, 42);
        // candidate_percent 50 of 2 hosts keeps exactly the best one.
        let chosen = policy
            .select_host(&hosts(&["10.0.0.1", "10.0.0.2"]), &load_aware_input())
            .await
            .unwrap();
        assert_eq!(chosen.ip(), "10.0.0.2");
    }

    #[tokio::test]
    async fn cache_prefix_hit_wins_under_equal_load() {
        let metadata = Arc::new(FixedMetadata {
            cache: vec![
                KVCacheLocation {
                    ip: "10.0.0.1".to_string(),
                    length: 3,
                },
                KVCacheLocation {
                    ip: "10.0.0.2".to_string(),
                    length: 1,
                },
            ],
            ..FixedMetadata::default()
        });

        let policy = InferenceLbPolicy::with_rng_seed(metadata, 7);
        let input = SelectionInput {
            cache_aware: true,
            prompt_hash: vec![1, 2, 3],
            ..load_aware_input()
        };
        let chosen = policy
            .select_host(&hosts(&["10.0.0.1", "10.0.0.2"]), &input)
            .await
            .unwrap();
        assert_eq!(chosen.ip(), "10.0.0.1");
    }

    #[tokio::test]
    async fn load_query_failure_degrades_to_unscored_pick() {
        let metadata = Arc::new(FixedMetadata {
            fail_load: true,
            ..FixedMetadata::default()
        });
        let policy = InferenceLbPolicy::with_rng_seed(metadata, 1);
        let all = hosts(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let chosen = policy.select_host(&all, &load_aware_input()).await.unwrap();
        assert!(all.iter().any(|h| h.ip() == chosen.ip()));
    }

    #[tokio::test]
    async fn cache_query_failure_only_drops_cache_term() {
        let metadata = Arc::new(FixedMetadata {
            load: HashMap::from([
                (
                    "10.0.0.1".to_string(),
                    EndpointStats {
                        queued_reqs: 20,
                        prompt_length: 0,
                        prefill_reqs: 0,
                    },
                ),
                ("10.0.0.2".to_string(), EndpointStats::default()),
            ]),
            fail_cache: true,
            ..FixedMetadata::default()
        });

        let policy = InferenceLbPolicy::with_rng_seed(metadata, 3);
        let input = SelectionInput {
            cache_aware: true,
            prompt_hash: vec![1, 2],
            ..load_aware_input()
        };
        let chosen = policy
            .select_host(&hosts(&["10.0.0.1", "10.0.0.2"]), &input)
            .await
            .unwrap();
        assert_eq!(chosen.ip(), "10.0.0.2");
    }

    #[tokio::test]
    async fn load_awareness_off_short_circuits_metadata() {
        let policy = InferenceLbPolicy::with_rng_seed(Arc::new(NoopMetadataCenter), 9);
        let all = hosts(&["10.0.0.1"]);
        let input = SelectionInput::default();
        let chosen = policy.select_host(&all, &input).await.unwrap();
        assert_eq!(chosen.ip(), "10.0.0.1");
    }

    #[tokio::test]
    async fn candidate_percent_zero_keeps_only_the_best() {
        let metadata = Arc::new(FixedMetadata {
            load: HashMap::from([
                (
                    "10.0.0.1".to_string(),
                    EndpointStats {
                        queued_reqs: 50,
                        prompt_length: 0,
                        prefill_reqs: 0,
                    },
                ),
                ("10.0.0.2".to_string(), EndpointStats::default()),
                (
                    "10.0.0.3".to_string(),
                    EndpointStats {
                        queued_reqs: 50,
                        prompt_length: 0,
                        prefill_reqs: 0,
                    },
                ),
            ]),
            ..FixedMetadata::default()
        });

        let policy = InferenceLbPolicy::with_rng_seed(metadata, 11);
        let input = SelectionInput {
            candidate_percent: 0,
            ..load_aware_input()
        };
        // Repeated selections always land on the sole candidate.
        for _ in 0..8 {
            let chosen = policy
                .select_host(&hosts(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]), &input)
                .await
                .unwrap();
            assert_eq!(chosen.ip(), "10.0.0.2");
        }
    }
}
