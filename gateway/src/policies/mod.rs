//! Load-balancing policies.
//!
//! A policy picks one host out of a cluster's (optionally subset-filtered)
//! member list. Policies are looked up by string tag in a [`PolicyRegistry`];
//! an unknown tag falls back to the inference-aware balancer.

mod inference;
mod random;
mod round_robin;
pub mod scoring;

use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use tracing::{debug, warn};

pub use inference::InferenceLbPolicy;
pub use random::RandomPolicy;
pub use round_robin::RoundRobinPolicy;

use crate::{core::Host, metadata::MetadataCenter};

pub const INFERENCE_LB: &str = "inference_lb";
pub const RANDOM: &str = "random";
pub const ROUND_ROBIN: &str = "round_robin";

/// Everything a policy needs to know about the request being placed.
///
/// Carried by value so the selection path stays free of dynamic lookups: the
/// weights and flags are resolved from configuration before selection runs.
#[derive(Debug, Clone, Default)]
pub struct SelectionInput {
    pub trace_id: String,
    pub cluster: String,
    pub model_name: String,
    /// Subset label selector from the matched routing rule.
    pub selector: HashMap<String, String>,
    /// Chunked prompt fingerprint; empty when cache-awareness is off.
    pub prompt_hash: Vec<u64>,
    pub load_aware: bool,
    pub cache_aware: bool,
    pub candidate_percent: u32,
    pub request_load_weight: u32,
    pub prefill_load_weight: u32,
    pub cache_ratio_weight: u32,
}

#[async_trait]
pub trait LoadBalancingPolicy: Send + Sync + fmt::Debug {
    /// Select a host from `hosts`. Returns `None` only when `hosts` is empty
    /// or every candidate is ruled out.
    async fn select_host(
        &self,
        hosts: &[Arc<dyn Host>],
        input: &SelectionInput,
    ) -> Option<Arc<dyn Host>>;

    fn name(&self) -> &'static str;
}

/// Registry of policies keyed by algorithm tag.
#[derive(Debug)]
pub struct PolicyRegistry {
    policies: HashMap<&'static str, Arc<dyn LoadBalancingPolicy>>,
    fallback: Arc<dyn LoadBalancingPolicy>,
}

impl PolicyRegistry {
    /// Registry with the three built-in policies; the inference balancer is
    /// both the `inference_lb` entry and the unknown-tag fallback.
    pub fn with_defaults(metadata: Arc<dyn MetadataCenter>) -> Self {
        let inference: Arc<dyn LoadBalancingPolicy> =
            Arc::new(InferenceLbPolicy::new(metadata));
        let mut policies: HashMap<&'static str, Arc<dyn LoadBalancingPolicy>> = HashMap::new();
        policies.insert(INFERENCE_LB, Arc::clone(&inference));
        policies.insert(RANDOM, Arc::new(RandomPolicy::new()));
        policies.insert(ROUND_ROBIN, Arc::new(RoundRobinPolicy::new()));

        Self {
            policies,
            fallback: inference,
        }
    }

    pub fn register(&mut self, tag: &'static str, policy: Arc<dyn LoadBalancingPolicy>) {
        self.policies.insert(tag, policy);
    }

    /// Replace a registered policy and, when it was the fallback, the
    /// fallback too. Used by tests to inject seeded policies.
    pub fn replace(&mut self, tag: &'static str, policy: Arc<dyn LoadBalancingPolicy>) {
        if tag == INFERENCE_LB {
            self.fallback = Arc::clone(&policy);
        }
        self.policies.insert(tag, policy);
    }

    pub fn get(&self, tag: &str) -> Arc<dyn LoadBalancingPolicy> {
        match self.policies.get(tag) {
            Some(policy) => Arc::clone(policy),
            None => Arc::clone(&self.fallback),
        }
    }
}

/// Retain hosts whose labels superset-match the selector.
pub fn filter_hosts_by_selector(
    hosts: &[Arc<dyn Host>],
    selector: &HashMap<String, String>,
) -> Vec<Arc<dyn Host>> {
    hosts
        .iter()
        .filter(|host| {
            let labels = host.labels();
            selector
                .iter()
                .all(|(k, v)| labels.get(k).is_some_and(|l| l == v))
        })
        .cloned()
        .collect()
}

/// Main selection entry: subset filtering followed by policy dispatch.
pub async fn choose_host(
    registry: &PolicyRegistry,
    tag: &str,
    hosts: &[Arc<dyn Host>],
    input: &SelectionInput,
) -> Option<Arc<dyn Host>> {
    let filtered;
    let candidates = if input.selector.is_empty() {
        hosts
    } else {
        filtered = filter_hosts_by_selector(hosts, &input.selector);
        debug!(
            trace_id = %input.trace_id,
            selector = ?input.selector,
            count = filtered.len(),
            "filtered hosts by selector"
        );
        &filtered[..]
    };

    if candidates.is_empty() {
        warn!(
            trace_id = %input.trace_id,
            cluster = %input.cluster,
            "no candidate hosts after filtering"
        );
        return None;
    }

    registry.get(tag).select_host(candidates, input).await
}

/// Number of hosts kept in the top-scored candidate slice.
pub(crate) fn candidate_count(total: usize, percent: u32) -> usize {
    (total * percent as usize / 100).clamp(1, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::StaticHost, metadata::NoopMetadataCenter};

    fn hosts(n: usize) -> Vec<Arc<dyn Host>> {
        (0..n)
            .map(|i| Arc::new(StaticHost::new(format!("10.0.0.{}", i + 1), 8000)) as _)
            .collect()
    }

    #[test]
    fn candidate_count_boundaries() {
        assert_eq!(candidate_count(20, 0), 1);
        assert_eq!(candidate_count(20, 5), 1);
        assert_eq!(candidate_count(20, 50), 10);
        assert_eq!(candidate_count(20, 100), 20);
        assert_eq!(candidate_count(20, 250), 20);
        assert_eq!(candidate_count(1, 5), 1);
    }

    #[test]
    fn selector_superset_match() {
        let gold: Arc<dyn Host> = Arc::new(
            StaticHost::new("10.0.0.1", 8000)
                .with_label("tier", "gold")
                .with_label("zone", "a"),
        );
        let silver: Arc<dyn Host> =
            Arc::new(StaticHost::new("10.0.0.2", 8000).with_label("tier", "silver"));
        let all = vec![gold, silver];

        let selector = HashMap::from([("tier".to_string(), "gold".to_string())]);
        let matched = filter_hosts_by_selector(&all, &selector);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].ip(), "10.0.0.1");

        let impossible = HashMap::from([("tier".to_string(), "bronze".to_string())]);
        assert!(filter_hosts_by_selector(&all, &impossible).is_empty());
    }

    #[tokio::test]
    async fn unknown_tag_falls_back_to_inference_lb() {
        let registry = PolicyRegistry::with_defaults(Arc::new(NoopMetadataCenter));
        assert_eq!(registry.get("bogus").name(), INFERENCE_LB);
        assert_eq!(registry.get(ROUND_ROBIN).name(), ROUND_ROBIN);
    }

    #[tokio::test]
    async fn choose_host_returns_none_on_subset_miss() {
        let registry = PolicyRegistry::with_defaults(Arc::new(NoopMetadataCenter));
        let input = SelectionInput {
            selector: HashMap::from([("tier".to_string(), "gold".to_string())]),
            ..SelectionInput::default()
        };
        let chosen = choose_host(&registry, INFERENCE_LB, &hosts(3), &input).await;
        assert!(chosen.is_none());
    }

    #[tokio::test]
    async fn choose_host_returns_a_member() {
        let registry = PolicyRegistry::with_defaults(Arc::new(NoopMetadataCenter));
        let all = hosts(4);
        let chosen = choose_host(&registry, RANDOM, &all, &SelectionInput::default())
            .await
            .unwrap();
        assert!(all.iter().any(|h| h.ip() == chosen.ip()));
    }
}
