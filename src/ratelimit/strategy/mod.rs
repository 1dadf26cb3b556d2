//! Consistency strategies for counting admissions.
//!
//! Both strategies answer the same question, whether `cost` more units fit
//! under `limit` in a window, with different guarantees:
//!
//! - [`FastStrategy`] decides from a node-local view and propagates increments
//!   to the shared store in the background. Across nodes the admitted total may
//!   exceed the limit by what other nodes admitted within one propagation delay.
//! - [`ConsistentStrategy`] decides at the key's authoritative store, so the
//!   admitted total never exceeds the limit.

mod consistent;
mod fast;

use async_trait::async_trait;

use super::window::Window;
use crate::error::StoreError;
use crate::store::{Admission, CounterKey};

pub use consistent::ConsistentStrategy;
pub use fast::{FastSettings, FastStrategy};

/// Counts an admission attempt against a window counter.
#[async_trait]
pub trait ConsistencyStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Attempt to admit `cost` units for `key` within `window`.
    ///
    /// All-or-nothing: when the attempt does not fit, nothing is counted and
    /// `current` reports the total the attempt would have produced.
    async fn admit(
        &self,
        key: &CounterKey,
        window: &Window,
        cost: u64,
        limit: u64,
    ) -> Result<Admission, StoreError>;
}
