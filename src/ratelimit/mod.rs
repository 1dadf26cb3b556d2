//! Rate limiting logic and state management.

mod backend;
mod limiter;
mod noop;
mod request;
pub mod strategy;
mod window;

pub use backend::RatelimitBackend;
pub use limiter::{LimiterSettings, RateLimiter, UnavailablePolicy};
pub use noop::NoopRateLimiter;
pub use request::{Consistency, RatelimitRequest, RatelimitResponse};
pub use strategy::{ConsistencyStrategy, ConsistentStrategy, FastSettings, FastStrategy};
pub use window::Window;
