//! Uniform random selection.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{LoadBalancingPolicy, SelectionInput, RANDOM};
use crate::core::Host;

#[derive(Debug)]
pub struct RandomPolicy {
    rng: Mutex<StdRng>,
}

impl RandomPolicy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_rng_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancingPolicy for RandomPolicy {
    async fn select_host(
        &self,
        hosts: &[Arc<dyn Host>],
        _input: &SelectionInput,
    ) -> Option<Arc<dyn Host>> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.rng.lock().random_range(0..hosts.len());
        Some(Arc::clone(&hosts[index]))
    }

    fn name(&self) -> &'static str {
        RANDOM
    }
}
