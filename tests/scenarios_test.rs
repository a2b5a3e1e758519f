//! End-to-end scenarios driving `ScanController` through the public API with a scripted
//! `Provider` and a real (shell-script) subprocess tool.

use async_trait::async_trait;
use reconloop::config::Configuration;
use reconloop::engine::parsers::JsonLinesParser;
use reconloop::engine::ToolExecutionEngine;
use reconloop::error::{OrchestratorError, ProviderErrorKind};
use reconloop::event::{EventKind, OutputStream};
use reconloop::provider::{FunctionSchema, Message, Mode, Provider, ProviderConfig, ProviderResponse, TokenUsage};
use reconloop::scan::{ScanProfile, ScanRequest};
use reconloop::store::InMemoryScanStore;
use reconloop::toolbox::schema::{ArgumentSpec, ArgumentType};
use reconloop::toolbox::{ToolDescriptor, Toolbox};
use reconloop::EventBus;
use reconloop::ScanController;
use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const COMPLETION_SENTINEL: &str = "ASSESSMENT_COMPLETE";

struct ScriptedProvider {
    script: Mutex<Vec<ProviderResponse>>,
}

impl ScriptedProvider {
    fn new(script: Vec<ProviderResponse>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script) })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _functions: &[FunctionSchema],
        _config: &ProviderConfig,
    ) -> Result<ProviderResponse, OrchestratorError> {
        let mut script = self.script.lock().unwrap();
        if script.is_empty() {
            Ok(ProviderResponse::TextOnly {
                text: format!("nothing further to do. {COMPLETION_SENTINEL}"),
                usage: TokenUsage::default(),
            })
        } else {
            Ok(script.remove(0))
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct FailingProvider(ProviderErrorKind, &'static str);

#[async_trait]
impl Provider for FailingProvider {
    async fn complete(
        &self,
        _messages: &[Message],
        _functions: &[FunctionSchema],
        _config: &ProviderConfig,
    ) -> Result<ProviderResponse, OrchestratorError> {
        Err(OrchestratorError::provider(self.0.clone(), self.1))
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

fn write_script(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn toolbox_with(binary: &std::path::Path) -> Arc<Toolbox> {
    let mut tb = Toolbox::new();
    tb.register(
        ToolDescriptor::new("port_scanner", binary.to_string_lossy().to_string())
            .with_description("scans ports and subdomains")
            .with_argument(ArgumentSpec::new("target", ArgumentType::String).required())
            .with_timeout(Duration::from_secs(10)),
    );
    Arc::new(tb)
}

fn request() -> ScanRequest {
    ScanRequest {
        target: "example.test".to_string(),
        objective: None,
        profile: ScanProfile::Quick,
        enable_ai: true,
        tools: None,
    }
}

fn controller(
    toolbox: Arc<Toolbox>,
    fast: Arc<dyn Provider>,
    deep: Arc<dyn Provider>,
    config: Configuration,
) -> ScanController {
    let bus = Arc::new(EventBus::new(256));
    let engine = Arc::new(ToolExecutionEngine::new(4, Duration::from_millis(200), Arc::clone(&bus)));
    ScanController::new(InMemoryScanStore::new(), bus, toolbox, engine, fast, deep, config)
        .with_parser("port_scanner", Arc::new(JsonLinesParser))
}

#[tokio::test]
async fn s1_simple_target_with_no_findings_completes_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "port_scanner.sh", "true");

    let fast = ScriptedProvider::new(vec![ProviderResponse::FunctionCall {
        name: "port_scanner".to_string(),
        arguments_json: r#"{"target":"example.test"}"#.to_string(),
        usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
    }]);
    let deep = ScriptedProvider::new(vec![]);

    let controller = controller(toolbox_with(&script), fast, deep, Configuration::default().with_max_iterations(5));
    let scan_id = controller.create_scan(request()).await.unwrap();
    let mut sub = controller.subscribe(&scan_id, None);
    let outcome = controller.run(&scan_id).await.unwrap();
    assert_eq!(outcome.status, reconloop::ScanStatus::Completed);

    let mut saw_started = false;
    let mut saw_fast = false;
    let mut saw_tool_call = false;
    let mut saw_zero_findings_completion = false;
    while let Some(event) = sub.try_recv() {
        match event.kind {
            EventKind::ScanStarted { .. } => saw_started = true,
            EventKind::ModelSelected { mode, .. } if mode == Mode::Fast => saw_fast = true,
            EventKind::ToolCall { ref tool, .. } if tool == "port_scanner" => saw_tool_call = true,
            EventKind::ToolCompleted { finding_count: 0, .. } => {}
            EventKind::ScanCompleted { ref counts_by_severity, .. } => {
                saw_zero_findings_completion = counts_by_severity.values().all(|&v| v == 0) || counts_by_severity.is_empty();
            }
            _ => {}
        }
    }
    assert!(saw_started);
    assert!(saw_fast);
    assert!(saw_tool_call);
    assert!(saw_zero_findings_completion);
}

#[tokio::test]
async fn s2_high_subdomain_volume_escalates_to_deep() {
    let dir = tempfile::tempdir().unwrap();
    let mut lines = String::new();
    for i in 0..150 {
        lines.push_str(&format!(
            "echo '{{\"title\":\"subdomain sub{i}.example.test\",\"affected_target\":\"sub{i}.example.test\",\"severity\":\"low\"}}'\n"
        ));
    }
    let script = write_script(&dir, "subdomain_finder.sh", &lines);

    let fast = ScriptedProvider::new(vec![ProviderResponse::FunctionCall {
        name: "port_scanner".to_string(),
        arguments_json: r#"{"target":"example.test"}"#.to_string(),
        usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
    }]);
    let deep = ScriptedProvider::new(vec![]);

    let controller = controller(toolbox_with(&script), fast, deep, Configuration::default().with_max_iterations(5));
    let scan_id = controller.create_scan(request()).await.unwrap();
    let mut sub = controller.subscribe(&scan_id, None);
    controller.run(&scan_id).await.unwrap();

    let mut seen_tool_call = false;
    let mut escalated_with_subdomain_reason = false;
    while let Some(event) = sub.try_recv() {
        match event.kind {
            EventKind::ToolCall { .. } => seen_tool_call = true,
            EventKind::ModelSelected { mode, ref reason } if seen_tool_call && mode == Mode::Deep => {
                if reason.contains("subdomain") {
                    escalated_with_subdomain_reason = true;
                }
            }
            _ => {}
        }
    }
    assert!(escalated_with_subdomain_reason);
}

#[tokio::test]
async fn s3_duplicate_tool_call_is_refused_after_two_executions() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "port_scanner.sh", "true");

    let call = ProviderResponse::FunctionCall {
        name: "port_scanner".to_string(),
        arguments_json: r#"{"target":"example.test"}"#.to_string(),
        usage: TokenUsage { input_tokens: 5, output_tokens: 5 },
    };
    let fast = ScriptedProvider::new(vec![call.clone(), call.clone(), call]);
    let deep = ScriptedProvider::new(vec![]);

    let controller = controller(toolbox_with(&script), fast, deep, Configuration::default().with_max_iterations(6));
    let scan_id = controller.create_scan(request()).await.unwrap();
    let mut sub = controller.subscribe(&scan_id, None);
    let outcome = controller.run(&scan_id).await.unwrap();
    assert_eq!(outcome.status, reconloop::ScanStatus::Completed);

    let mut tool_calls = 0;
    let mut saw_duplicate_error = false;
    while let Some(event) = sub.try_recv() {
        match event.kind {
            EventKind::ToolCall { .. } => tool_calls += 1,
            EventKind::Error { ref kind, ref message, recoverable } => {
                if kind == "ValidationError" && recoverable && message.contains("duplicate_tool_call") {
                    saw_duplicate_error = true;
                }
            }
            _ => {}
        }
    }
    assert_eq!(tool_calls, 2);
    assert!(saw_duplicate_error);
}

#[tokio::test]
async fn s4_provider_auth_failure_fails_scan_without_any_tool_call() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "port_scanner.sh", "true");

    let fast: Arc<dyn Provider> = Arc::new(FailingProvider(ProviderErrorKind::InvalidCredential, "bad key"));
    let deep: Arc<dyn Provider> = Arc::new(FailingProvider(ProviderErrorKind::InvalidCredential, "bad key"));

    let controller = controller(toolbox_with(&script), fast, deep, Configuration::default());
    let scan_id = controller.create_scan(request()).await.unwrap();
    let mut sub = controller.subscribe(&scan_id, None);
    let outcome = controller.run(&scan_id).await.unwrap();
    assert_eq!(outcome.status, reconloop::ScanStatus::Failed);

    let mut saw_tool_call = false;
    let mut scan_failed_kind = None;
    while let Some(event) = sub.try_recv() {
        match event.kind {
            EventKind::ToolCall { .. } => saw_tool_call = true,
            EventKind::ScanFailed { kind, .. } => scan_failed_kind = Some(kind),
            _ => {}
        }
    }
    assert!(!saw_tool_call);
    assert_eq!(scan_failed_kind.as_deref(), Some("ProviderError"));
}

#[tokio::test]
async fn s5_cancellation_mid_tool_reaches_cancelled_terminal_state() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        &dir,
        "slow_scanner.sh",
        "echo '{\"title\":\"probe\",\"affected_target\":\"example.test\"}'\nsleep 5\n",
    );

    let fast = ScriptedProvider::new(vec![ProviderResponse::FunctionCall {
        name: "port_scanner".to_string(),
        arguments_json: r#"{"target":"example.test"}"#.to_string(),
        usage: TokenUsage { input_tokens: 5, output_tokens: 5 },
    }]);
    let deep = ScriptedProvider::new(vec![]);

    let controller = Arc::new(controller(
        toolbox_with(&script),
        fast,
        deep,
        Configuration::default().with_max_iterations(5),
    ));
    let scan_id = controller.create_scan(request()).await.unwrap();
    let mut sub = controller.subscribe(&scan_id, None);

    let run_controller = Arc::clone(&controller);
    let run_scan_id = scan_id.clone();
    let handle = tokio::spawn(async move { run_controller.run(&run_scan_id).await });

    loop {
        match sub.recv().await {
            Some(event) => {
                if matches!(event.kind, EventKind::ToolOutput { stream: OutputStream::Stdout, .. }) {
                    break;
                }
            }
            None => break,
        }
    }
    controller.cancel(&scan_id).await.unwrap();

    let outcome = handle.await.unwrap().unwrap();
    assert_eq!(outcome.status, reconloop::ScanStatus::Cancelled);

    let mut saw_cancelled_event = false;
    while let Some(event) = sub.try_recv() {
        if matches!(event.kind, EventKind::ScanCancelled {}) {
            saw_cancelled_event = true;
        }
    }
    assert!(saw_cancelled_event);
}

#[tokio::test]
async fn s6_malformed_function_arguments_recover_on_retry() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(&dir, "port_scanner.sh", "true");

    let fast = ScriptedProvider::new(vec![
        ProviderResponse::FunctionCall {
            name: "port_scanner".to_string(),
            arguments_json: "{target: ".to_string(),
            usage: TokenUsage { input_tokens: 5, output_tokens: 5 },
        },
        ProviderResponse::FunctionCall {
            name: "port_scanner".to_string(),
            arguments_json: r#"{"target":"example.test"}"#.to_string(),
            usage: TokenUsage { input_tokens: 5, output_tokens: 5 },
        },
    ]);
    let deep = ScriptedProvider::new(vec![]);

    let controller = controller(toolbox_with(&script), fast, deep, Configuration::default().with_max_iterations(6));
    let scan_id = controller.create_scan(request()).await.unwrap();
    let mut sub = controller.subscribe(&scan_id, None);
    let outcome = controller.run(&scan_id).await.unwrap();
    assert_eq!(outcome.status, reconloop::ScanStatus::Completed);

    let mut saw_malformed_error = false;
    let mut saw_recovered_tool_call = false;
    while let Some(event) = sub.try_recv() {
        match event.kind {
            EventKind::Error { ref kind, recoverable, .. } if kind == "ProviderError" && recoverable => {
                saw_malformed_error = true;
            }
            EventKind::ToolCall { .. } if saw_malformed_error => saw_recovered_tool_call = true,
            _ => {}
        }
    }
    assert!(saw_malformed_error);
    assert!(saw_recovered_tool_call);
}
