use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::ConsistencyStrategy;
use crate::error::StoreError;
use crate::ratelimit::window::Window;
use crate::store::{Admission, CounterKey, WindowCounterStore};

/// Admits through the authoritative store for each key.
pub struct ConsistentStrategy {
    authority: Arc<dyn WindowCounterStore>,
}

impl ConsistentStrategy {
    pub fn new(authority: Arc<dyn WindowCounterStore>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl ConsistencyStrategy for ConsistentStrategy {
    fn name(&self) -> &'static str {
        "consistent"
    }

    async fn admit(
        &self,
        key: &CounterKey,
        window: &Window,
        cost: u64,
        limit: u64,
    ) -> Result<Admission, StoreError> {
        let admission = if cost == 0 {
            let count = self.authority.get(key).await?;
            Admission::evaluate(count, 0, limit)
        } else {
            self.authority.admit(key, window.reset(), cost, limit).await?
        };

        trace!(
            key = %key,
            current = admission.current,
            admitted = admission.admitted,
            "Consistent admission"
        );
        Ok(admission)
    }
}
