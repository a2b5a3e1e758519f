//! Concrete [`crate::provider::Provider`] implementations.
//!
//! Both shipped implementations speak a generic chat-completions-style JSON protocol over a
//! shared, pooled `reqwest::Client` (one client per provider instance, reused across calls —
//! the same connection-reuse motivation as the teacher's HTTP client pool, without resorting
//! to a process-global singleton, which the orchestrator's configuration model forbids).

mod http;

pub mod deep;
pub mod fast;

pub use deep::DeepProvider;
pub use fast::FastProvider;
