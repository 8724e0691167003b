pub mod keyed_lock;
pub mod retry;

pub use keyed_lock::{KeyedGuard, KeyedLocks};
pub use retry::{retry_with_backoff, retry_on_transient, RetryConfig, RetryResult, IsTransient};
