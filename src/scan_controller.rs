//! Scan Controller (§4.8): the entry point external transport calls into. Creates scan
//! records, starts the agent loop, and exposes subscribe/cancel.

use crate::agent_loop::AgentLoop;
use crate::config::Configuration;
use crate::engine::sanitize::validate_target;
use crate::engine::ToolExecutionEngine;
use crate::error::OrchestratorError;
use crate::event::{EventBus, Subscription};
use crate::provider::Provider;
use crate::scan::{Scan, ScanRequest, ScanStatus};
use crate::store::ScanStore;
use crate::toolbox::Toolbox;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// The cancellation handle the controller keeps per in-flight scan. Mirrors
/// `engine::ExecutionContext` but at scan granularity rather than per-tool-execution.
#[derive(Clone)]
struct ScanCancellation {
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<Notify>,
}

impl ScanCancellation {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

pub struct ScanController {
    store: Arc<dyn ScanStore>,
    bus: Arc<EventBus>,
    toolbox: Arc<Toolbox>,
    engine: Arc<ToolExecutionEngine>,
    fast: Arc<dyn Provider>,
    deep: Arc<dyn Provider>,
    parsers: HashMap<String, Arc<dyn crate::engine::parsers::Parser>>,
    config: Configuration,
    cancellations: Mutex<HashMap<String, ScanCancellation>>,
}

impl ScanController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ScanStore>,
        bus: Arc<EventBus>,
        toolbox: Arc<Toolbox>,
        engine: Arc<ToolExecutionEngine>,
        fast: Arc<dyn Provider>,
        deep: Arc<dyn Provider>,
        config: Configuration,
    ) -> Self {
        Self {
            store,
            bus,
            toolbox,
            engine,
            fast,
            deep,
            parsers: HashMap::new(),
            config,
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_parser(mut self, tool_name: impl Into<String>, parser: Arc<dyn crate::engine::parsers::Parser>) -> Self {
        self.parsers.insert(tool_name.into(), parser);
        self
    }

    /// `CreateScan(request) -> scan_id`. Validates the target synchronously; on
    /// `InvalidTarget` no scan record is ever persisted (§7 propagation policy).
    pub async fn create_scan(&self, request: ScanRequest) -> Result<String, OrchestratorError> {
        validate_target(&request.target, false)?;
        let scan_id = uuid::Uuid::new_v4().to_string();
        let scan = Scan::new(scan_id.clone(), &request);
        self.store.put_scan(scan).await?;
        Ok(scan_id)
    }

    /// Builds a fresh `AgentLoop` sharing this controller's collaborators and drives the
    /// scan to a terminal state. Returns the loop's outcome; callers typically spawn this
    /// on a task rather than awaiting it directly.
    pub async fn run(&self, scan_id: &str) -> Result<crate::agent_loop::LoopOutcome, OrchestratorError> {
        let mut scan = self
            .store
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| OrchestratorError::validation(format!("unknown scan '{scan_id}'")))?;

        let cancellation = ScanCancellation::new();
        self.cancellations.lock().unwrap().insert(scan_id.to_string(), cancellation.clone());

        let mut agent_loop = AgentLoop::new(
            Arc::clone(&self.toolbox),
            Arc::clone(&self.engine),
            Arc::clone(&self.fast),
            Arc::clone(&self.deep),
            Arc::clone(&self.bus),
            Arc::clone(&self.store),
            self.config.clone(),
        );
        for (name, parser) in &self.parsers {
            agent_loop = agent_loop.with_parser(name.clone(), Arc::clone(parser));
        }

        let exec_ctx = crate::engine::ExecutionContext::new(self.config.max_scan_duration);
        let watcher_ctx = exec_ctx.clone();
        let watcher_cancellation = cancellation.clone();
        let watch: JoinHandle<()> = tokio::spawn(async move {
            watcher_cancellation.notify.notified().await;
            watcher_ctx.cancel();
        });

        let outcome = agent_loop.run(&mut scan, exec_ctx).await;
        watch.abort();
        self.cancellations.lock().unwrap().remove(scan_id);
        outcome
    }

    /// `Cancel(scan_id)`. Idempotent: cancelling an already-terminal or unknown scan is a
    /// no-op that still returns the current status.
    pub async fn cancel(&self, scan_id: &str) -> Result<ScanStatus, OrchestratorError> {
        if let Some(cancellation) = self.cancellations.lock().unwrap().get(scan_id) {
            cancellation.cancel();
        }
        let scan = self
            .store
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| OrchestratorError::validation(format!("unknown scan '{scan_id}'")))?;
        Ok(scan.status)
    }

    pub fn subscribe(&self, scan_id: &str, resume_from: Option<u64>) -> Subscription {
        self.bus.subscribe(scan_id, resume_from)
    }

    pub async fn get_scan(&self, scan_id: &str) -> Result<Option<Scan>, OrchestratorError> {
        self.store.get_scan(scan_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::provider::{FunctionSchema, Message, ProviderConfig, ProviderResponse, TokenUsage};
    use crate::scan::ScanProfile;
    use crate::store::InMemoryScanStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoCompletionProvider;

    #[async_trait]
    impl Provider for EchoCompletionProvider {
        async fn complete(
            &self,
            _messages: &[Message],
            _functions: &[FunctionSchema],
            _config: &ProviderConfig,
        ) -> Result<ProviderResponse, OrchestratorError> {
            Ok(ProviderResponse::TextOnly {
                text: "all clear. ASSESSMENT_COMPLETE".to_string(),
                usage: TokenUsage { input_tokens: 5, output_tokens: 5 },
            })
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    fn controller() -> ScanController {
        let bus = Arc::new(EventBus::new(64));
        let engine = Arc::new(ToolExecutionEngine::new(2, Duration::from_millis(200), Arc::clone(&bus)));
        ScanController::new(
            InMemoryScanStore::new(),
            bus,
            Arc::new(Toolbox::new()),
            engine,
            Arc::new(EchoCompletionProvider),
            Arc::new(EchoCompletionProvider),
            Configuration::default().with_max_iterations(2),
        )
    }

    #[tokio::test]
    async fn create_scan_rejects_invalid_target_without_persisting() {
        let controller = controller();
        let request = ScanRequest {
            target: "127.0.0.1".to_string(),
            objective: None,
            profile: ScanProfile::Quick,
            enable_ai: true,
            tools: None,
        };
        let err = controller.create_scan(request).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidTarget");
    }

    #[tokio::test]
    async fn create_scan_then_run_reaches_completed() {
        let controller = controller();
        let request = ScanRequest {
            target: "example.test".to_string(),
            objective: None,
            profile: ScanProfile::Quick,
            enable_ai: true,
            tools: None,
        };
        let scan_id = controller.create_scan(request).await.unwrap();
        let outcome = controller.run(&scan_id).await.unwrap();
        assert_eq!(outcome.status, ScanStatus::Completed);

        let scan = controller.get_scan(&scan_id).await.unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_on_unknown_scan_is_an_error_not_a_panic() {
        let controller = controller();
        let result = controller.cancel("does-not-exist").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn subscribe_before_run_observes_scan_started_event() {
        let controller = controller();
        let request = ScanRequest {
            target: "example.test".to_string(),
            objective: None,
            profile: ScanProfile::Quick,
            enable_ai: true,
            tools: None,
        };
        let scan_id = controller.create_scan(request).await.unwrap();
        let mut sub = controller.subscribe(&scan_id, None);
        controller.run(&scan_id).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::ScanStarted { .. }));
    }
}
