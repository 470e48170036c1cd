//! Round-robin selection.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;

use super::{LoadBalancingPolicy, SelectionInput, ROUND_ROBIN};
use crate::core::Host;

#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LoadBalancingPolicy for RoundRobinPolicy {
    async fn select_host(
        &self,
        hosts: &[Arc<dyn Host>],
        _input: &SelectionInput,
    ) -> Option<Arc<dyn Host>> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(Arc::clone(&hosts[index]))
    }

    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }
}
