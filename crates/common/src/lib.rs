//! Shared building blocks for the tlsmux proxy.
//!
//! - [`buffer_pool`]: fixed-size relay buffers with per-thread reuse
//! - [`backoff`]: exponential backoff for transient accept failures

pub mod backoff;
pub mod buffer_pool;

pub use backoff::Backoff;
pub use buffer_pool::{BufferPool, PoolStats, PooledBuffer};
