pub mod breaker;
pub mod guarded;
pub mod http;
pub mod retry;

pub use breaker::{circuit_key, CircuitBreakerRegistry};
pub use guarded::GuardedInvoker;
pub use http::JsonRpcInvoker;
pub use retry::{calculate_backoff, is_retryable, RetryPolicy, RetryingInvoker};
