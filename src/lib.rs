//! An AI-driven penetration-testing orchestrator.
//!
//! A [`ScanController`](scan_controller::ScanController) owns a [`Toolbox`](toolbox::Toolbox)
//! of external security tools, a pair of fast/deep [`Provider`](provider::Provider)s, and a
//! [`ScanStore`](store::ScanStore). Each scan is driven by its own [`AgentLoop`](agent_loop::AgentLoop),
//! which alternates between asking a [`HybridRouter`](router::HybridRouter) which model tier
//! to use and dispatching function calls through the [`ToolExecutionEngine`](engine::ToolExecutionEngine).
//! Progress is published as an ordered, replayable stream of [`Event`](event::Event)s.

pub mod agent_loop;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod findings;
pub mod provider;
pub mod providers;
pub mod router;
pub mod scan;
pub mod scan_controller;
pub mod store;
pub mod toolbox;

pub use agent_loop::{AgentLoop, LoopOutcome};
pub use config::Configuration;
pub use error::{OrchestratorError, ProviderErrorKind, ToolErrorKind};
pub use event::{Event, EventBus, EventKind, Subscription};
pub use provider::{Mode, Provider};
pub use scan::{Scan, ScanRequest, ScanStatus};
pub use scan_controller::ScanController;
pub use store::ScanStore;
pub use toolbox::{ToolDescriptor, Toolbox};

/// Initializes the crate's `log`/`env_logger` backend. Safe to call more than once; only
/// the first call takes effect.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
