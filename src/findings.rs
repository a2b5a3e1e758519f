//! Normalized findings and the Finding Normalizer (§3 Finding, §4.3).

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Total order `info < low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

/// A raw finding dictionary produced by a tool-specific `Parser`, keyed by tool-native
/// field names, not yet mapped onto the normalized schema.
pub type RawFinding = HashMap<String, serde_json::Value>;

/// A single normalized observation about the target (§3 Finding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub scan_id: String,
    pub step_index: u32,
    pub tool_source: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: String,
    pub affected_target: String,
    pub cve: Option<String>,
    pub cvss_score: Option<f32>,
    pub remediation: Option<String>,
    pub fingerprint: String,
}

fn cve_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^CVE-\d{4}-\d+$").expect("valid CVE regex"))
}

/// `stable_hash(tool_source || "\x00" || title || "\x00" || affected_target)` per §4.3.
pub fn fingerprint(tool_source: &str, title: &str, affected_target: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_source.as_bytes());
    hasher.update([0u8]);
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(affected_target.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Normalize an `affected_target` string: hostnames lowercased, URLs stripped of default
/// ports and trailing slashes, IPs canonicalized by a round-trip through `std::net`.
pub fn normalize_target(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Ok(ip) = trimmed.parse::<std::net::IpAddr>() {
        return ip.to_string();
    }
    if let Some(rest) = trimmed.strip_prefix("https://").or_else(|| trimmed.strip_prefix("http://")) {
        let scheme = if trimmed.starts_with("https") { "https" } else { "http" };
        let default_port = if scheme == "https" { ":443" } else { ":80" };
        let without_port = rest.strip_suffix(default_port).unwrap_or(rest);
        let without_slash = without_port.trim_end_matches('/');
        return format!("{}://{}", scheme, without_slash.to_lowercase());
    }
    trimmed.to_lowercase()
}

fn validate_cve(raw: &str) -> Option<String> {
    if cve_pattern().is_match(raw) {
        Some(raw.to_string())
    } else {
        None
    }
}

/// Deduplicates findings within one scan by fingerprint; the earlier record always wins.
pub struct Normalizer {
    seen: HashMap<String, ()>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        Self { seen: HashMap::new() }
    }

    /// Turn one raw finding dictionary into a normalized `Finding`, applying the
    /// descriptor's severity map and the CVE syntax check. Returns `None` when the
    /// fingerprint already exists in this scan (the earlier record stands).
    #[allow(clippy::too_many_arguments)]
    pub fn normalize(
        &mut self,
        scan_id: &str,
        step_index: u32,
        tool_source: &str,
        raw: &RawFinding,
        severity_map: &HashMap<String, Severity>,
        next_id: impl FnOnce() -> String,
    ) -> Option<Finding> {
        let title = raw
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("untitled finding")
            .to_string();
        let affected_target = normalize_target(raw.get("affected_target").and_then(|v| v.as_str()).unwrap_or(""));
        let raw_severity = raw.get("severity").and_then(|v| v.as_str()).unwrap_or("");
        let severity = severity_map.get(raw_severity).copied().unwrap_or_default();

        let fp = fingerprint(tool_source, &title, &affected_target);
        if self.seen.contains_key(&fp) {
            return None;
        }
        self.seen.insert(fp.clone(), ());

        let cve = raw.get("cve").and_then(|v| v.as_str()).and_then(validate_cve);
        let cvss_score = raw.get("cvss_score").and_then(|v| v.as_f64()).map(|n| n as f32);
        let description = raw.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let evidence = raw.get("evidence").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let remediation = raw.get("remediation").and_then(|v| v.as_str()).map(str::to_string);

        Some(Finding {
            id: next_id(),
            scan_id: scan_id.to_string(),
            step_index,
            tool_source: tool_source.to_string(),
            severity,
            title,
            description,
            evidence,
            affected_target,
            cve,
            cvss_score,
            remediation,
            fingerprint: fp,
        })
    }
}
