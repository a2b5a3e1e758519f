//! Toolbox & Argument Schema (§4.2): the authoritative catalog of tools usable by the
//! agent loop, rendered as a registry of typed records rather than a name-indexed
//! reflection table, per the redesign note in §9.

pub mod schema;

use crate::error::OrchestratorError;
use crate::findings::Severity;
use crate::provider::FunctionSchema;
use schema::{coerce, ArgumentSpec, ArgumentType, ValidatedArgs};
use std::collections::HashMap;
use std::time::Duration;

/// Finding "kinds" used to drive chaining, e.g. `"live_host"`, `"subdomain"`, `"tls_endpoint"`.
pub type FindingKind = &'static str;

/// Static registry entry for one tool (§3 ToolDescriptor). Built once at startup and never
/// mutated afterward.
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub argument_schema: Vec<ArgumentSpec>,
    pub chain_outputs: Vec<FindingKind>,
    pub chain_inputs: Vec<FindingKind>,
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    pub severity_map: HashMap<String, Severity>,
    /// Whether targets in private/loopback/link-local ranges are permitted for this tool.
    pub allow_private: bool,
    /// Exit codes that count as success even though non-zero (e.g. grep-like tools).
    pub success_exit_codes: Vec<i32>,
    /// argv template: the binary name invoked as a subprocess.
    pub binary: String,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, binary: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            argument_schema: Vec::new(),
            chain_outputs: Vec::new(),
            chain_inputs: Vec::new(),
            default_timeout: Duration::from_secs(120),
            max_output_bytes: 2 * 1024 * 1024,
            severity_map: HashMap::new(),
            allow_private: false,
            success_exit_codes: vec![0],
            binary: binary.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_argument(mut self, spec: ArgumentSpec) -> Self {
        self.argument_schema.push(spec);
        self
    }

    pub fn with_chain_outputs(mut self, kinds: Vec<FindingKind>) -> Self {
        self.chain_outputs = kinds;
        self
    }

    pub fn with_chain_inputs(mut self, kinds: Vec<FindingKind>) -> Self {
        self.chain_inputs = kinds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn with_severity_map(mut self, map: HashMap<String, Severity>) -> Self {
        self.severity_map = map;
        self
    }

    pub fn allow_private_targets(mut self) -> Self {
        self.allow_private = true;
        self
    }

    pub fn with_success_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.success_exit_codes = codes;
        self
    }

    fn to_function_schema(&self) -> FunctionSchema {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .argument_schema
            .iter()
            .map(|spec| {
                let type_str = match spec.arg_type {
                    ArgumentType::String => "string",
                    ArgumentType::Number => "number",
                    ArgumentType::Integer => "integer",
                    ArgumentType::Boolean => "boolean",
                    ArgumentType::List => "array",
                };
                (
                    spec.name.clone(),
                    serde_json::json!({ "type": type_str, "description": spec.description }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .argument_schema
            .iter()
            .filter(|s| s.required)
            .map(|s| s.name.as_str())
            .collect();
        FunctionSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }
}

/// The Toolbox: a typed, data-driven registry (not reflection) of every tool the agent may
/// call, plus the pure chain-hint function over produced finding kinds.
pub struct Toolbox {
    descriptors: HashMap<String, ToolDescriptor>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self {
            descriptors: HashMap::new(),
        }
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.descriptors.keys().map(String::as_str).collect()
    }

    /// `Describe() -> list of function schemas suitable for an LLM function-calling API`.
    pub fn describe(&self) -> Vec<FunctionSchema> {
        self.descriptors.values().map(ToolDescriptor::to_function_schema).collect()
    }

    /// `Validate(tool_name, raw_args) -> validated_args | ValidationError`.
    ///
    /// Unknown keys are dropped silently to tolerate LLM over-reach; missing required keys
    /// are errors; type coercion is bounded (see [`schema::coerce`]).
    pub fn validate(
        &self,
        tool_name: &str,
        raw_args: &serde_json::Value,
    ) -> Result<ValidatedArgs, OrchestratorError> {
        let descriptor = self
            .descriptors
            .get(tool_name)
            .ok_or_else(|| OrchestratorError::validation(format!("unknown tool '{tool_name}'")))?;

        let raw_map = raw_args
            .as_object()
            .ok_or_else(|| OrchestratorError::validation("tool arguments must be a JSON object"))?;

        let mut validated = ValidatedArgs::new();
        for spec in &descriptor.argument_schema {
            match raw_map.get(&spec.name) {
                Some(value) => {
                    let coerced = coerce(value, spec.arg_type).ok_or_else(|| {
                        OrchestratorError::validation(format!(
                            "argument '{}' for tool '{}' has the wrong type",
                            spec.name, tool_name
                        ))
                    })?;
                    validated.insert(spec.name.clone(), coerced);
                }
                None => {
                    if spec.required {
                        return Err(OrchestratorError::validation(format!(
                            "missing required argument '{}' for tool '{}'",
                            spec.name, tool_name
                        )));
                    }
                    if let Some(default) = &spec.default {
                        validated.insert(spec.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(validated)
    }

    /// `ChainHint(produced_findings) -> ordered set of candidate tool_names`.
    ///
    /// A pure function over which tools can consume the kinds of findings just produced.
    /// Deterministic order: registry iteration order, deduplicated, excluding `exclude`.
    pub fn chain_hint(&self, produced_kinds: &[FindingKind], already_run: &[&str]) -> Vec<String> {
        let mut candidates = Vec::new();
        for descriptor in self.descriptors.values() {
            if already_run.contains(&descriptor.name.as_str()) {
                continue;
            }
            if descriptor
                .chain_inputs
                .iter()
                .any(|input| produced_kinds.contains(input))
                && !candidates.contains(&descriptor.name)
            {
                candidates.push(descriptor.name.clone());
            }
        }
        candidates.sort();
        candidates
    }
}

impl Default for Toolbox {
    fn default() -> Self {
        Self::new()
    }
}

fn severity_map(pairs: &[(&str, Severity)]) -> HashMap<String, Severity> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

impl Toolbox {
    /// The minimum tool set required of every deployment (§4.2): a network port scanner, a
    /// subdomain enumerator, an HTTP probe, a template-based vulnerability scanner, a
    /// web-technology fingerprinter, a TLS scanner, a web-fuzzer, and a SQL-injection probe.
    /// Binaries are named after their real-world counterpart; a deployment swaps them out
    /// via [`ToolDescriptor::new`] if it wraps a different implementation.
    pub fn builtin() -> Self {
        let mut tb = Self::new();

        tb.register(
            ToolDescriptor::new("port_scanner", "nmap")
                .with_description("TCP/UDP port scan of a target host, reporting open services")
                .with_argument(ArgumentSpec::new("target", ArgumentType::String).required().with_description("hostname, IP, or CIDR to scan"))
                .with_argument(ArgumentSpec::new("ports", ArgumentType::List).with_description("comma-separated port list or ranges"))
                .with_chain_outputs(vec!["live_host"])
                .with_timeout(Duration::from_secs(180)),
        );

        tb.register(
            ToolDescriptor::new("subdomain_enumerator", "subfinder")
                .with_description("Passive and active subdomain enumeration for a target domain")
                .with_argument(ArgumentSpec::new("target", ArgumentType::String).required().with_description("apex domain to enumerate"))
                .with_chain_outputs(vec!["subdomain"])
                .with_timeout(Duration::from_secs(120)),
        );

        tb.register(
            ToolDescriptor::new("http_probe", "httpx")
                .with_description("Probe discovered hosts for live HTTP(S) services and basic metadata")
                .with_argument(ArgumentSpec::new("hosts", ArgumentType::List).required().with_description("hosts or subdomains to probe"))
                .with_chain_inputs(vec!["live_host", "subdomain"])
                .with_chain_outputs(vec!["web_endpoint", "tls_endpoint"])
                .with_timeout(Duration::from_secs(120)),
        );

        tb.register(
            ToolDescriptor::new("template_vuln_scanner", "nuclei")
                .with_description("Template-based vulnerability scan against live web endpoints")
                .with_argument(ArgumentSpec::new("targets", ArgumentType::List).required().with_description("web endpoints to scan"))
                .with_argument(ArgumentSpec::new("templates", ArgumentType::String).with_description("template tag or path filter"))
                .with_chain_inputs(vec!["web_endpoint", "web_tech"])
                .with_severity_map(severity_map(&[
                    ("info", Severity::Info),
                    ("low", Severity::Low),
                    ("medium", Severity::Medium),
                    ("high", Severity::High),
                    ("critical", Severity::Critical),
                ]))
                .with_timeout(Duration::from_secs(300)),
        );

        tb.register(
            ToolDescriptor::new("web_tech_fingerprinter", "whatweb")
                .with_description("Identify frameworks, servers, and libraries behind a web endpoint")
                .with_argument(ArgumentSpec::new("url", ArgumentType::String).required().with_description("web endpoint to fingerprint"))
                .with_chain_inputs(vec!["web_endpoint"])
                .with_chain_outputs(vec!["web_tech"])
                .with_timeout(Duration::from_secs(60)),
        );

        tb.register(
            ToolDescriptor::new("tls_scanner", "sslscan")
                .with_description("Enumerate TLS protocol versions, cipher suites, and certificate issues")
                .with_argument(ArgumentSpec::new("host", ArgumentType::String).required().with_description("host to scan"))
                .with_argument(
                    ArgumentSpec::new("port", ArgumentType::Integer)
                        .with_description("TLS port")
                        .with_bounds(1.0, 65535.0)
                        .with_default(crate::toolbox::schema::ArgumentValue::Integer(443)),
                )
                .with_chain_inputs(vec!["tls_endpoint"])
                .with_severity_map(severity_map(&[
                    ("weak_cipher", Severity::Medium),
                    ("expired_certificate", Severity::High),
                    ("protocol_downgrade", Severity::Critical),
                ]))
                .with_timeout(Duration::from_secs(60)),
        );

        tb.register(
            ToolDescriptor::new("web_fuzzer", "ffuf")
                .with_description("Discover hidden paths and parameters on a web endpoint by fuzzing")
                .with_argument(ArgumentSpec::new("url", ArgumentType::String).required().with_description("endpoint containing a FUZZ keyword"))
                .with_argument(ArgumentSpec::new("wordlist", ArgumentType::String).with_description("wordlist path override"))
                .with_chain_inputs(vec!["web_endpoint"])
                .with_chain_outputs(vec!["fuzzed_path"])
                .with_timeout(Duration::from_secs(300)),
        );

        tb.register(
            ToolDescriptor::new("sqli_probe", "sqlmap")
                .with_description("Probe a web endpoint or parameter for SQL-injection vulnerabilities")
                .with_argument(ArgumentSpec::new("url", ArgumentType::String).required().with_description("endpoint or parameterized URL to test"))
                .with_chain_inputs(vec!["fuzzed_path", "web_endpoint"])
                .with_severity_map(severity_map(&[
                    ("potential", Severity::Medium),
                    ("confirmed", Severity::Critical),
                ]))
                .with_timeout(Duration::from_secs(300)),
        );

        tb
    }
}
