//! Resilience layer protecting the pipeline from a flaky text-generation
//! service: retry with backoff, a circuit breaker per service and a pool of
//! client handles per endpoint.
//!
//! Nothing in here knows about tasks, roles or workflows.

pub mod breaker;
pub mod pool;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use pool::{CallOutcome, ConnectionPool, PoolConfig, PoolStats, PooledConnection, SweepReport, SweeperHandle};
pub use retry::RetryPolicy;
