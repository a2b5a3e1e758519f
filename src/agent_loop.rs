//! The Agent Loop (§4.6): a bounded ReAct-style state machine that drives one scan from its
//! objective to a terminal state, dispatching between the Hybrid Router, the Toolbox, and
//! the Tool Execution Engine.

use crate::config::Configuration;
use crate::engine::parsers::Parser;
use crate::engine::{ExecutionContext, ToolExecutionEngine};
use crate::error::{OrchestratorError, ProviderErrorKind, ToolErrorKind};
use crate::event::{EventBus, EventKind};
use crate::findings::{Finding, Normalizer};
use crate::provider::{Message, Mode, Provider, ProviderConfig, ProviderResponse, Role};
use crate::router::{HybridRouter, QueryIntentTag, RoutingContext, TargetComplexity};
use crate::scan::{Scan, ScanStatus};
use crate::store::{AgentStepRecord, ScanStore};
use crate::toolbox::schema::ValidatedArgs;
use crate::toolbox::Toolbox;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FAST_COST_PER_1K_TOKENS: f64 = 0.0005;
const DEEP_COST_PER_1K_TOKENS: f64 = 0.005;
const MAX_FIXUP_RETRIES: u8 = 2;
const MAX_TOOL_EXECUTIONS_PER_KEY: u8 = 2;
const MAX_CONSECUTIVE_EMPTY: u8 = 3;
const COMPLETION_SENTINEL: &str = "ASSESSMENT_COMPLETE";
const FINAL_ANSWER_FUNCTION: &str = "final_answer";

/// One recorded tool invocation within an `AgentStep` (§3).
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub validated_arguments: ValidatedArgs,
}

/// One recorded tool outcome within an `AgentStep` (§3).
#[derive(Debug, Clone)]
pub struct ToolResultRecord {
    pub raw_output: String,
    pub parsed_findings: Vec<Finding>,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub truncated: bool,
}

/// One iteration of the agent loop (§3 AgentStep).
#[derive(Debug, Clone)]
pub struct AgentStep {
    pub scan_id: String,
    pub index: u32,
    pub model_used: Mode,
    pub reasoning: String,
    pub tool_call: Option<ToolCallRecord>,
    pub tool_result: Option<ToolResultRecord>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub estimated_cost: f64,
}

/// What the loop produced once it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub status: ScanStatus,
    pub findings: Vec<Finding>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub reason: Option<String>,
}

fn cost_for(mode: Mode, tokens: u32) -> f64 {
    let rate = match mode {
        Mode::Fast => FAST_COST_PER_1K_TOKENS,
        Mode::Deep => DEEP_COST_PER_1K_TOKENS,
    };
    (tokens as f64 / 1000.0) * rate
}

/// A stable key for the duplicate-tool-call bound (§4.6 invariant 2, property 4): the tool
/// name plus its validated arguments serialized in sorted-key order.
fn normalized_call_key(tool_name: &str, args: &ValidatedArgs) -> String {
    let mut pairs: Vec<(String, String)> = args
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::to_string(v).unwrap_or_default()))
        .collect();
    pairs.sort();
    let joined = pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
    format!("{tool_name}?{joined}")
}

/// Drives one scan. Built once per scan by the Scan Controller, which owns the scan's
/// `ExecutionContext` and cancellation.
pub struct AgentLoop {
    toolbox: Arc<Toolbox>,
    engine: Arc<ToolExecutionEngine>,
    parsers: HashMap<String, Arc<dyn Parser>>,
    fast: Arc<dyn Provider>,
    deep: Arc<dyn Provider>,
    router: HybridRouter,
    bus: Arc<EventBus>,
    store: Arc<dyn ScanStore>,
    config: Configuration,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        toolbox: Arc<Toolbox>,
        engine: Arc<ToolExecutionEngine>,
        fast: Arc<dyn Provider>,
        deep: Arc<dyn Provider>,
        bus: Arc<EventBus>,
        store: Arc<dyn ScanStore>,
        config: Configuration,
    ) -> Self {
        let router = HybridRouter::new(config.finding_threshold, config.subdomain_threshold);
        Self {
            toolbox,
            engine,
            parsers: HashMap::new(),
            fast,
            deep,
            router,
            bus,
            store,
            config,
        }
    }

    pub fn with_parser(mut self, tool_name: impl Into<String>, parser: Arc<dyn Parser>) -> Self {
        self.parsers.insert(tool_name.into(), parser);
        self
    }

    fn provider_for(&self, mode: Mode) -> &Arc<dyn Provider> {
        match mode {
            Mode::Fast => &self.fast,
            Mode::Deep => &self.deep,
        }
    }

    fn system_prompt(&self, scan: &Scan) -> Message {
        let objective = scan.objective.as_deref().unwrap_or("perform a general security assessment");
        let tool_names = self.toolbox.names().join(", ");
        Message {
            role: Role::System,
            content: format!(
                "You are assessing target '{}'. Objective: {}. Available tools: [{}]. \
                 Call a tool via function-calling, or respond with text. When the assessment \
                 is complete, include the phrase {} in your response or call `{}`.",
                scan.target, objective, tool_names, COMPLETION_SENTINEL, FINAL_ANSWER_FUNCTION
            ),
        }
    }

    /// Run the scan to completion. Mutates `scan` in place to reflect its final status.
    pub async fn run(&self, scan: &mut Scan, ctx: ExecutionContext) -> Result<LoopOutcome, OrchestratorError> {
        scan.transition(ScanStatus::Running).map_err(OrchestratorError::validation)?;
        self.bus.publish(
            &scan.id,
            EventKind::ScanStarted {
                target: scan.target.clone(),
                profile: format!("{:?}", scan.profile).to_lowercase(),
            },
            None,
        );

        let mut messages = vec![self.system_prompt(scan)];
        let mut normalizer = Normalizer::new();
        let mut findings: Vec<Finding> = Vec::new();
        let mut finding_count_by_severity: HashMap<String, u32> = HashMap::new();
        let mut subdomain_count: u32 = 0;
        let mut total_tokens: u64 = 0;
        let mut total_cost: f64 = 0.0;
        let mut exec_counts: HashMap<String, u8> = HashMap::new();
        let mut already_run_tools: Vec<String> = Vec::new();
        let mut consecutive_empty: u8 = 0;
        let mut last_mode: Option<Mode> = None;
        let mut forced_next_mode: Option<Mode> = None;
        let mut budget_exhausted = false;
        let mut reasoning_log: Vec<String> = Vec::new();
        let mut pending_chain_hint: Option<String> = None;
        let mut consecutive_malformed_args: u8 = 0;
        let started_at = Instant::now();

        let mut final_reason: Option<String> = None;
        let mut final_status = ScanStatus::Completed;
        let mut final_error_kind: Option<String> = None;

        for iteration in 1..=self.config.max_iterations {
            if ctx.is_cancelled() {
                final_status = ScanStatus::Cancelled;
                final_reason = Some("cancelled".to_string());
                break;
            }
            if started_at.elapsed() > self.config.max_scan_duration {
                final_status = ScanStatus::Failed;
                final_reason = Some("timeout".to_string());
                break;
            }

            let mut routing_ctx = RoutingContext::new(TargetComplexity::Low);
            routing_ctx.subdomain_count = subdomain_count;
            routing_ctx.finding_count = findings.len() as u32;
            routing_ctx.max_finding_severity = findings.iter().map(|f| f.severity).max();
            if budget_exhausted {
                routing_ctx.forced_mode = Some(Mode::Fast);
            } else if let Some(forced) = forced_next_mode.take() {
                routing_ctx.forced_mode = Some(forced);
            }
            if subdomain_count >= self.config.subdomain_threshold {
                routing_ctx.query_intent_tags.insert(QueryIntentTag::Tactical);
            }

            let decision = self.router.route(&routing_ctx);
            self.bus.publish(
                &scan.id,
                EventKind::ModelSelected {
                    mode: decision.mode,
                    reason: decision.reason.clone(),
                },
                Some(decision.mode),
            );
            if let Some(prior) = last_mode {
                if prior != decision.mode {
                    self.bus.publish(
                        &scan.id,
                        EventKind::Escalation {
                            from_mode: prior,
                            to_mode: decision.mode,
                            reason: decision.reason.clone(),
                        },
                        Some(decision.mode),
                    );
                }
            }
            last_mode = Some(decision.mode);

            if let Some(hint) = pending_chain_hint.take() {
                messages.push(Message {
                    role: Role::User,
                    content: format!("Suggested next tool based on recent findings: {hint}"),
                });
            }

            let provider = self.provider_for(decision.mode);
            let schemas = self.toolbox.describe();
            let response = provider.complete(&messages, &schemas, &ProviderConfig::default()).await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    self.bus.publish(
                        &scan.id,
                        EventKind::Error {
                            kind: e.kind().to_string(),
                            message: e.to_string(),
                            recoverable: e.recoverable(),
                        },
                        Some(decision.mode),
                    );
                    if !e.recoverable() {
                        final_status = ScanStatus::Failed;
                        final_error_kind = Some(e.kind().to_string());
                        final_reason = Some(e.to_string());
                        break;
                    }
                    continue;
                }
            };

            match response {
                ProviderResponse::Empty => {
                    consecutive_empty += 1;
                    if consecutive_empty >= MAX_CONSECUTIVE_EMPTY {
                        final_status = ScanStatus::Failed;
                        final_reason = Some("three consecutive empty provider responses".to_string());
                        break;
                    }
                }
                ProviderResponse::TextOnly { text, usage } => {
                    consecutive_empty = 0;
                    total_tokens += usage.total() as u64;
                    total_cost += cost_for(decision.mode, usage.total());
                    reasoning_log.push(text.clone());
                    messages.push(Message {
                        role: Role::Assistant,
                        content: text.clone(),
                    });

                    let step = AgentStep {
                        scan_id: scan.id.clone(),
                        index: iteration,
                        model_used: decision.mode,
                        reasoning: text.clone(),
                        tool_call: None,
                        tool_result: None,
                        tokens_in: usage.input_tokens,
                        tokens_out: usage.output_tokens,
                        estimated_cost: cost_for(decision.mode, usage.total()),
                    };
                    self.persist_step(&step).await?;

                    if text.contains(COMPLETION_SENTINEL) {
                        final_reason = Some(text);
                        break;
                    }

                    self.bus.publish(
                        &scan.id,
                        EventKind::AgentReasoning { text, mode: decision.mode },
                        Some(decision.mode),
                    );
                }
                ProviderResponse::FunctionCall { name, arguments_json, usage } => {
                    consecutive_empty = 0;
                    total_tokens += usage.total() as u64;
                    total_cost += cost_for(decision.mode, usage.total());

                    if name == FINAL_ANSWER_FUNCTION {
                        final_reason = Some(arguments_json);
                        break;
                    }

                    match self
                        .dispatch_tool_call(
                            scan,
                            &ctx,
                            iteration,
                            decision.mode,
                            &name,
                            &arguments_json,
                            &mut messages,
                            &mut exec_counts,
                            &mut normalizer,
                        )
                        .await?
                    {
                        DispatchOutcome::Executed { new_findings, chain_hint } => {
                            consecutive_malformed_args = 0;
                            for f in &new_findings {
                                *finding_count_by_severity.entry(f.severity.as_str().to_string()).or_insert(0) += 1;
                                if f.title.to_lowercase().contains("subdomain") {
                                    subdomain_count += 1;
                                }
                                self.store.upsert_finding(f.clone()).await?;
                                self.bus.publish(
                                    &scan.id,
                                    EventKind::Finding {
                                        id: f.id.clone(),
                                        severity: f.severity.as_str().to_string(),
                                        title: f.title.clone(),
                                        affected_target: f.affected_target.clone(),
                                        tool_source: f.tool_source.clone(),
                                        cve: f.cve.clone(),
                                    },
                                    Some(decision.mode),
                                );
                            }
                            findings.extend(new_findings);
                            if !already_run_tools.contains(&name) {
                                already_run_tools.push(name.clone());
                            }
                            pending_chain_hint = chain_hint;
                        }
                        DispatchOutcome::Refused | DispatchOutcome::Skipped => {}
                        DispatchOutcome::MalformedArgs => {
                            consecutive_malformed_args += 1;
                            if consecutive_malformed_args > MAX_FIXUP_RETRIES {
                                final_status = ScanStatus::Failed;
                                final_error_kind = Some("ValidationError".to_string());
                                final_reason = Some("exhausted fix-up retries for malformed tool arguments".to_string());
                                break;
                            }
                        }
                    }
                }
            }

            if !budget_exhausted {
                if let Some(cap) = self.config.budget_usd {
                    if total_cost > cap {
                        budget_exhausted = true;
                    }
                }
            }
        }

        if final_reason.is_none() && final_status == ScanStatus::Completed {
            final_reason = Some(format!("max_iterations_reached ({})", self.config.max_iterations));
        }

        if final_status != ScanStatus::Cancelled && final_status != ScanStatus::Failed {
            let summary_mode = if budget_exhausted { Mode::Fast } else { Mode::Deep };
            let summary_provider = self.provider_for(summary_mode);
            messages.push(Message {
                role: Role::User,
                content: "Summarize the assessment findings and conclude.".to_string(),
            });
            if let Ok(ProviderResponse::TextOnly { text, usage }) =
                summary_provider.complete(&messages, &[], &ProviderConfig::default()).await
            {
                total_tokens += usage.total() as u64;
                total_cost += cost_for(summary_mode, usage.total());
                final_reason = Some(text);
            }
        }

        match final_status {
            ScanStatus::Cancelled => {
                scan.transition(ScanStatus::Cancelled).map_err(OrchestratorError::validation)?;
                self.bus.publish(&scan.id, EventKind::ScanCancelled {}, None);
            }
            ScanStatus::Failed => {
                scan.transition(ScanStatus::Failed).map_err(OrchestratorError::validation)?;
                scan.error_message = final_reason.clone();
                self.bus.publish(
                    &scan.id,
                    EventKind::ScanFailed {
                        kind: final_error_kind.clone().unwrap_or_else(|| "AgentLoop".to_string()),
                        message: final_reason.clone().unwrap_or_default(),
                    },
                    None,
                );
            }
            _ => {
                scan.transition(ScanStatus::Completed).map_err(OrchestratorError::validation)?;
                self.bus.publish(
                    &scan.id,
                    EventKind::ScanCompleted {
                        summary: final_reason.clone().unwrap_or_default(),
                        counts_by_severity: finding_count_by_severity,
                        total_cost,
                        total_tokens,
                    },
                    None,
                );
            }
        }
        self.store.finalize_scan(scan.clone()).await?;

        Ok(LoopOutcome {
            status: scan.status,
            findings,
            total_cost,
            total_tokens,
            reason: final_reason,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool_call(
        &self,
        scan: &mut Scan,
        ctx: &ExecutionContext,
        iteration: u32,
        mode: Mode,
        tool_name: &str,
        arguments_json: &str,
        messages: &mut Vec<Message>,
        exec_counts: &mut HashMap<String, u8>,
        normalizer: &mut Normalizer,
    ) -> Result<DispatchOutcome, OrchestratorError> {
        // A single parse-and-validate attempt. A failure here doesn't retry in place (the
        // string that failed to parse won't parse differently on a second look); instead it
        // publishes one `error` event, appends a corrective message, and hands back to the
        // main loop so the *next* provider call gets a chance to send corrected arguments.
        // `MAX_FIXUP_RETRIES` bounds how many such corrections the loop tolerates in a row
        // (tracked by the caller) before giving up on the scan.
        let parsed: serde_json::Value = match serde_json::from_str(arguments_json) {
            Ok(v) => v,
            Err(e) => {
                self.bus.publish(
                    &scan.id,
                    EventKind::Error {
                        kind: "ProviderError".to_string(),
                        message: format!("malformed function arguments: {e}"),
                        recoverable: true,
                    },
                    Some(mode),
                );
                messages.push(Message {
                    role: Role::User,
                    content: format!("Your last function call had invalid JSON arguments: {e}. Please resend valid JSON."),
                });
                return Ok(DispatchOutcome::MalformedArgs);
            }
        };

        let (raw_args, validated) = match self.toolbox.validate(tool_name, &parsed) {
            Ok(validated) => (parsed, validated),
            Err(e) => {
                self.bus.publish(
                    &scan.id,
                    EventKind::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        recoverable: true,
                    },
                    Some(mode),
                );
                messages.push(Message {
                    role: Role::User,
                    content: format!("Argument validation failed: {e}. Please correct and resend."),
                });
                return Ok(DispatchOutcome::MalformedArgs);
            }
        };

        let call_key = normalized_call_key(tool_name, &validated);
        let count = exec_counts.entry(call_key).or_insert(0);
        if *count >= MAX_TOOL_EXECUTIONS_PER_KEY {
            self.bus.publish(
                &scan.id,
                EventKind::Error {
                    kind: "ValidationError".to_string(),
                    message: format!("duplicate_tool_call: '{tool_name}' already executed twice with these arguments"),
                    recoverable: true,
                },
                Some(mode),
            );
            return Ok(DispatchOutcome::Refused);
        }
        *count += 1;

        let descriptor = self
            .toolbox
            .get(tool_name)
            .ok_or_else(|| OrchestratorError::validation(format!("unknown tool '{tool_name}'")))?;

        self.bus.publish(
            &scan.id,
            EventKind::ToolCall {
                tool: tool_name.to_string(),
                arguments: raw_args.clone(),
            },
            Some(mode),
        );
        scan.current_tool = Some(tool_name.to_string());

        let exec_ctx = ctx.child(descriptor.default_timeout);
        let exec_result = self.engine.execute(&exec_ctx, &scan.id, descriptor, &validated).await;
        scan.current_tool = None;

        let tool_result = match exec_result {
            Ok(result) => result,
            Err(e) => {
                self.bus.publish(
                    &scan.id,
                    EventKind::Error {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                        recoverable: e.recoverable(),
                    },
                    Some(mode),
                );
                // A cancellation observed mid-tool isn't itself fatal: the loop's next
                // iteration checks `ctx.is_cancelled()` and unwinds to `scan_cancelled`
                // cleanly, rather than surfacing this as a loop-level failure.
                if e.recoverable() || matches!(e, OrchestratorError::Tool { kind: ToolErrorKind::Cancelled, .. }) {
                    return Ok(DispatchOutcome::Skipped);
                }
                return Err(e);
            }
        };

        let raw_findings = match self.parsers.get(tool_name) {
            Some(parser) => parser.parse(&tool_result.raw_output, "")?,
            None => Vec::new(),
        };

        let mut new_findings = Vec::new();
        for raw in &raw_findings {
            if let Some(finding) = normalizer.normalize(
                &scan.id,
                iteration,
                tool_name,
                raw,
                &descriptor.severity_map,
                || uuid::Uuid::new_v4().to_string(),
            ) {
                new_findings.push(finding);
            }
        }

        self.bus.publish(
            &scan.id,
            EventKind::ToolCompleted {
                tool: tool_name.to_string(),
                duration_ms: tool_result.duration_ms,
                finding_count: new_findings.len() as u32,
                exit_code: tool_result.exit_code,
                truncated: tool_result.truncated,
            },
            Some(mode),
        );

        let chain_kinds: Vec<&'static str> = if new_findings.is_empty() {
            Vec::new()
        } else {
            descriptor.chain_outputs.clone()
        };
        let chain_hint = if chain_kinds.is_empty() {
            None
        } else {
            let candidates = self.toolbox.chain_hint(&chain_kinds, &[tool_name]);
            candidates.first().cloned()
        };

        let step = AgentStep {
            scan_id: scan.id.clone(),
            index: iteration,
            model_used: mode,
            reasoning: format!("invoked {tool_name}"),
            tool_call: Some(ToolCallRecord {
                tool_name: tool_name.to_string(),
                arguments: raw_args,
                validated_arguments: validated,
            }),
            tool_result: Some(ToolResultRecord {
                raw_output: tool_result.raw_output,
                parsed_findings: new_findings.clone(),
                exit_code: tool_result.exit_code,
                duration_ms: tool_result.duration_ms,
                truncated: tool_result.truncated,
            }),
            tokens_in: 0,
            tokens_out: 0,
            estimated_cost: 0.0,
        };
        self.persist_step(&step).await?;

        Ok(DispatchOutcome::Executed { new_findings, chain_hint })
    }

    async fn persist_step(&self, step: &AgentStep) -> Result<(), OrchestratorError> {
        self.store
            .append_step(AgentStepRecord {
                scan_id: step.scan_id.clone(),
                index: step.index,
                model_used: step.model_used.to_string(),
                reasoning: step.reasoning.clone(),
                tool_name: step.tool_call.as_ref().map(|c| c.tool_name.clone()),
                tokens_in: step.tokens_in,
                tokens_out: step.tokens_out,
                estimated_cost: step.estimated_cost,
            })
            .await
    }
}

enum DispatchOutcome {
    Executed {
        new_findings: Vec<Finding>,
        chain_hint: Option<String>,
    },
    Refused,
    Skipped,
    MalformedArgs,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parsers::JsonLinesParser;
    use crate::findings::Severity;
    use crate::provider::TokenUsage;
    use crate::scan::{ScanProfile, ScanRequest};
    use crate::store::InMemoryScanStore;
    use crate::toolbox::schema::{ArgumentSpec, ArgumentType};
    use crate::toolbox::ToolDescriptor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedProvider {
        script: Mutex<Vec<ProviderResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: Vec<ProviderResponse>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn complete(
            &self,
            _messages: &[Message],
            _functions: &[crate::provider::FunctionSchema],
            _config: &ProviderConfig,
        ) -> Result<ProviderResponse, OrchestratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    fn toolbox_with_echo() -> Arc<Toolbox> {
        let mut tb = Toolbox::new();
        tb.register(
            ToolDescriptor::new("port_scanner", "/bin/echo")
                .with_description("scans ports")
                .with_argument(ArgumentSpec::new("target", ArgumentType::String).required()),
        );
        Arc::new(tb)
    }

    fn base_scan() -> Scan {
        Scan::new(
            "scan-1",
            &ScanRequest {
                target: "example.test".into(),
                objective: None,
                profile: ScanProfile::Quick,
                enable_ai: true,
                tools: None,
            },
        )
    }

    #[tokio::test]
    async fn loop_completes_when_provider_emits_completion_sentinel() {
        let bus = Arc::new(EventBus::new(64));
        let engine = Arc::new(ToolExecutionEngine::new(2, Duration::from_millis(200), Arc::clone(&bus)));
        let store = InMemoryScanStore::new();
        let fast = Arc::new(ScriptedProvider::new(vec![ProviderResponse::TextOnly {
            text: format!("scan looks clean. {COMPLETION_SENTINEL}"),
            usage: TokenUsage { input_tokens: 10, output_tokens: 5 },
        }]));
        let deep = Arc::new(ScriptedProvider::new(vec![]));

        let agent_loop = AgentLoop::new(
            toolbox_with_echo(),
            engine,
            fast,
            deep,
            bus,
            store,
            Configuration::default().with_max_iterations(3),
        )
        .with_parser("port_scanner", Arc::new(JsonLinesParser));

        let mut scan = base_scan();
        let ctx = ExecutionContext::new(Duration::from_secs(5));
        let outcome = agent_loop.run(&mut scan, ctx).await.unwrap();

        assert_eq!(outcome.status, ScanStatus::Completed);
        assert_eq!(scan.status, ScanStatus::Completed);
    }

    #[tokio::test]
    async fn duplicate_tool_call_beyond_two_is_refused() {
        let bus = Arc::new(EventBus::new(64));
        let engine = Arc::new(ToolExecutionEngine::new(2, Duration::from_millis(200), Arc::clone(&bus)));
        let store = InMemoryScanStore::new();

        let call = ProviderResponse::FunctionCall {
            name: "port_scanner".to_string(),
            arguments_json: r#"{"target":"example.test"}"#.to_string(),
            usage: TokenUsage { input_tokens: 5, output_tokens: 5 },
        };
        let fast = Arc::new(ScriptedProvider::new(vec![call.clone(), call.clone(), call]));
        let deep = Arc::new(ScriptedProvider::new(vec![]));

        let agent_loop = AgentLoop::new(
            toolbox_with_echo(),
            engine,
            fast,
            deep,
            Arc::clone(&bus),
            store,
            Configuration::default().with_max_iterations(5),
        )
        .with_parser("port_scanner", Arc::new(JsonLinesParser));

        let mut scan = base_scan();
        let ctx = ExecutionContext::new(Duration::from_secs(5));
        let mut sub = bus.subscribe(&scan.id, None);
        let _ = agent_loop.run(&mut scan, ctx).await.unwrap();

        let mut tool_calls = 0;
        let mut saw_duplicate_error = false;
        while let Some(event) = sub.try_recv() {
            match event.kind {
                EventKind::ToolCall { .. } => tool_calls += 1,
                EventKind::Error { ref message, .. } if message.contains("duplicate_tool_call") => {
                    saw_duplicate_error = true;
                }
                _ => {}
            }
        }
        assert_eq!(tool_calls, 2);
        assert!(saw_duplicate_error);
    }

    #[tokio::test]
    async fn irrecoverable_provider_error_fails_the_scan() {
        let bus = Arc::new(EventBus::new(64));
        let engine = Arc::new(ToolExecutionEngine::new(2, Duration::from_millis(200), Arc::clone(&bus)));
        let store = InMemoryScanStore::new();

        struct FailingProvider;
        #[async_trait]
        impl Provider for FailingProvider {
            async fn complete(
                &self,
                _messages: &[Message],
                _functions: &[crate::provider::FunctionSchema],
                _config: &ProviderConfig,
            ) -> Result<ProviderResponse, OrchestratorError> {
                Err(OrchestratorError::provider(ProviderErrorKind::InvalidCredential, "bad key"))
            }
            fn model_name(&self) -> &str {
                "failing"
            }
        }

        let agent_loop = AgentLoop::new(
            toolbox_with_echo(),
            engine,
            Arc::new(FailingProvider),
            Arc::new(FailingProvider),
            bus,
            store,
            Configuration::default(),
        );

        let mut scan = base_scan();
        let ctx = ExecutionContext::new(Duration::from_secs(5));
        let outcome = agent_loop.run(&mut scan, ctx).await.unwrap();
        assert_eq!(outcome.status, ScanStatus::Failed);
    }

    #[test]
    fn normalized_call_key_is_order_independent_over_arguments() {
        let mut a = ValidatedArgs::new();
        a.insert("b".to_string(), crate::toolbox::schema::ArgumentValue::String("2".into()));
        a.insert("a".to_string(), crate::toolbox::schema::ArgumentValue::String("1".into()));
        let mut b = ValidatedArgs::new();
        b.insert("a".to_string(), crate::toolbox::schema::ArgumentValue::String("1".into()));
        b.insert("b".to_string(), crate::toolbox::schema::ArgumentValue::String("2".into()));
        assert_eq!(normalized_call_key("tool", &a), normalized_call_key("tool", &b));
    }
}
