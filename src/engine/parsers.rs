//! Per-tool output parsers (§4.1 "Parsing").
//!
//! The engine delegates tool-output parsing to a `Parser` supplied by the descriptor.
//! Parsers produce raw finding dictionaries keyed by tool-native field names; severity,
//! title, and affected-target normalization happen downstream in the Finding Normalizer.

use crate::error::{OrchestratorError, ToolErrorKind};
use crate::findings::RawFinding;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// A per-tool output parser. Implementations are plain functions wrapped behind this trait
/// so descriptors can carry one as data (`Box<dyn Parser>`), matching the data-driven
/// dispatch idiom used for tool dispatch itself.
pub trait Parser: Send + Sync {
    fn parse(&self, stdout: &str, stderr: &str) -> Result<Vec<RawFinding>, OrchestratorError>;
}

/// Parses one JSON object per non-empty stdout line (a common shape for scanners with a
/// `-json`/`-jsonl` output mode, e.g. template-based vulnerability scanners).
pub struct JsonLinesParser;

impl Parser for JsonLinesParser {
    fn parse(&self, stdout: &str, _stderr: &str) -> Result<Vec<RawFinding>, OrchestratorError> {
        let mut findings = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| OrchestratorError::tool(ToolErrorKind::ParseFailed, e.to_string()))?;
            if let serde_json::Value::Object(map) = value {
                findings.push(map.into_iter().collect());
            }
        }
        Ok(findings)
    }
}

/// Parses stdout one line at a time against a regex with named capture groups matching the
/// normalized finding fields (`title`, `affected_target`, `severity`, ...). Lines that don't
/// match are ignored rather than treated as a parse failure, since most line-oriented
/// scanners interleave banners and progress output with actual findings.
pub struct RegexLineParser {
    pattern: Regex,
    tool_source: String,
}

impl RegexLineParser {
    pub fn new(tool_source: impl Into<String>, pattern: &str) -> Result<Self, OrchestratorError> {
        let pattern = Regex::new(pattern)
            .map_err(|e| OrchestratorError::validation(format!("invalid parser pattern: {e}")))?;
        Ok(Self {
            pattern,
            tool_source: tool_source.into(),
        })
    }
}

impl Parser for RegexLineParser {
    fn parse(&self, stdout: &str, _stderr: &str) -> Result<Vec<RawFinding>, OrchestratorError> {
        let mut findings = Vec::new();
        for line in stdout.lines() {
            let Some(captures) = self.pattern.captures(line) else {
                continue;
            };
            let mut finding = RawFinding::new();
            for name in self.pattern.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    finding.insert(name.to_string(), serde_json::Value::String(m.as_str().to_string()));
                }
            }
            if !finding.is_empty() {
                finding
                    .entry("tool_source".to_string())
                    .or_insert_with(|| serde_json::Value::String(self.tool_source.clone()));
                findings.push(finding);
            }
        }
        Ok(findings)
    }
}

/// One `Parser` per tool in [`crate::toolbox::Toolbox::builtin`], keyed by tool name. Every
/// builtin tool is assumed to be run in its JSON-lines output mode (`-json`/`-jsonl`, the
/// common shape across modern scanners); a deployment wrapping a tool without one would
/// register its own `RegexLineParser` instead.
pub fn builtin_parsers() -> HashMap<String, Arc<dyn Parser>> {
    let names = [
        "port_scanner",
        "subdomain_enumerator",
        "http_probe",
        "template_vuln_scanner",
        "web_tech_fingerprinter",
        "tls_scanner",
        "web_fuzzer",
        "sqli_probe",
    ];
    names
        .into_iter()
        .map(|name| (name.to_string(), Arc::new(JsonLinesParser) as Arc<dyn Parser>))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_parsers_covers_every_builtin_tool_name() {
        let parsers = builtin_parsers();
        for name in crate::toolbox::Toolbox::builtin().names() {
            assert!(parsers.contains_key(name), "missing parser for '{name}'");
        }
    }

    #[test]
    fn json_lines_parser_reads_one_object_per_line() {
        let parser = JsonLinesParser;
        let stdout = "{\"title\":\"open port\",\"severity\":\"low\"}\n{\"title\":\"tls weak cipher\",\"severity\":\"medium\"}\n";
        let findings = parser.parse(stdout, "").unwrap();
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].get("title").unwrap(), "open port");
    }

    #[test]
    fn json_lines_parser_skips_blank_lines() {
        let parser = JsonLinesParser;
        let stdout = "\n{\"title\":\"x\"}\n\n";
        assert_eq!(parser.parse(stdout, "").unwrap().len(), 1);
    }

    #[test]
    fn json_lines_parser_surfaces_parse_failures() {
        let parser = JsonLinesParser;
        let err = parser.parse("not json at all {", "").unwrap_err();
        assert_eq!(err.kind(), "ToolError");
    }

    #[test]
    fn regex_line_parser_extracts_named_captures() {
        let parser = RegexLineParser::new(
            "port_scanner",
            r"open port (?P<affected_target>\d+)/tcp on (?P<title>\S+)",
        )
        .unwrap();
        let stdout = "open port 22/tcp on 10.0.0.1\nnoise that should be ignored\n";
        let findings = parser.parse(stdout, "").unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].get("affected_target").unwrap(), "22");
        assert_eq!(findings[0].get("tool_source").unwrap(), "port_scanner");
    }

    #[test]
    fn regex_line_parser_ignores_non_matching_lines() {
        let parser = RegexLineParser::new("probe", r"^MATCH:(?P<title>.+)$").unwrap();
        assert!(parser.parse("nothing here", "").unwrap().is_empty());
    }
}
