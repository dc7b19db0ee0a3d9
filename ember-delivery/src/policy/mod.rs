//! Policy abstractions for delivery operations.
//!
//! Policies are plain data plus pure functions, kept apart from the
//! processor so they can be tested without a store or a clock.
//!
//! - [`RetryPolicy`]: backoff schedule and the per-error failure action

pub mod retry;

pub use retry::{FailureAction, RetryPolicy};
