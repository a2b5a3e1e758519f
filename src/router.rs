//! Hybrid Intelligence Router (§4.5): chooses `fast` vs `deep` per agent-loop iteration and
//! carries conversational context across a switch. The policy itself is a pure function of
//! a `RoutingContext` and the current prompt fingerprint — no I/O, no hidden state — so it
//! is trivially reusable by the scan controller for forecasting and by tests for property 10
//! (router purity).

use crate::findings::Severity;
use crate::provider::{Mode, TokenUsage};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Rough target-complexity bucket fed in by the scan controller (derived from target type,
/// subdomain fan-out, or an explicit profile).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetComplexity {
    Low,
    Medium,
    High,
}

/// Intent tags the agent loop or the prompt builder can attach to a step to bias routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryIntentTag {
    Plan,
    Prioritize,
    Summarize,
    Tactical,
}

/// The router's per-decision input (§3).
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub subdomain_count: u32,
    pub finding_count: u32,
    pub target_complexity: TargetComplexity,
    pub query_intent_tags: HashSet<QueryIntentTag>,
    pub forced_mode: Option<Mode>,
    /// The highest severity observed among findings so far. Not listed in §3's field set
    /// verbatim, but routing rule 3 depends on it, so it travels alongside the context
    /// rather than being re-derived by the router from a findings store it doesn't own.
    pub max_finding_severity: Option<Severity>,
}

impl RoutingContext {
    pub fn new(target_complexity: TargetComplexity) -> Self {
        Self {
            subdomain_count: 0,
            finding_count: 0,
            target_complexity,
            query_intent_tags: HashSet::new(),
            forced_mode: None,
            max_finding_severity: None,
        }
    }
}

/// The router's output: the chosen mode plus a human-readable reason, surfaced verbatim in
/// `model_selected`/`escalation` events.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub mode: Mode,
    pub reason: String,
}

/// Summary prepended to the new model's prompt on a fast/deep switch, so continuity
/// survives without replaying the full transcript (§4.5 "Context handoff").
#[derive(Debug, Clone)]
pub struct HandoffContext {
    pub running_objective: String,
    pub recent_reasoning: Vec<String>,
    pub discovered_targets: Vec<String>,
    pub counts_by_severity: HashMap<String, u32>,
}

pub fn build_handoff(
    running_objective: &str,
    all_reasoning: &[String],
    discovered_targets: &[String],
    counts_by_severity: &HashMap<String, u32>,
) -> HandoffContext {
    let recent_reasoning = all_reasoning
        .iter()
        .rev()
        .take(3)
        .rev()
        .cloned()
        .collect();
    HandoffContext {
        running_objective: running_objective.to_string(),
        recent_reasoning,
        discovered_targets: discovered_targets.to_vec(),
        counts_by_severity: counts_by_severity.clone(),
    }
}

/// A deterministic hash of a prompt's content, used as half of the response cache key.
pub fn prompt_fingerprint(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A digest of the current findings set, folded into the cache key so that a step whose
/// prompt now embeds newly discovered findings always misses cache (§9 Open Question,
/// decision: cache key includes a findings-set digest).
pub fn findings_digest(fingerprints: &[String]) -> String {
    let mut sorted = fingerprints.to_vec();
    sorted.sort();
    let mut hasher = Sha256::new();
    for fp in &sorted {
        hasher.update(fp.as_bytes());
        hasher.update(b"\0");
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    prompt_fingerprint: String,
    mode: Mode,
    findings_digest: String,
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub text: Option<String>,
    pub function_call: Option<(String, String)>,
    pub usage: TokenUsage,
}

struct CacheEntry {
    value: CachedResponse,
    inserted_at: Instant,
}

/// Bounded LRU + TTL cache of `(prompt_fingerprint, mode, findings_digest) -> response`.
/// Shared per-process, serialized by key (§5: "access is serialized by key; writes use
/// last-writer-wins").
pub struct ResponseCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<CacheKey, CacheEntry>,
    order: VecDeque<CacheKey>,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&mut self, prompt: &str, mode: Mode, fingerprints: &[String]) -> Option<CachedResponse> {
        let key = CacheKey {
            prompt_fingerprint: prompt_fingerprint(prompt),
            mode,
            findings_digest: findings_digest(fingerprints),
        };
        let expired = match self.entries.get(&key) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(&key);
            self.order.retain(|k| k != &key);
            return None;
        }
        self.entries.get(&key).map(|e| e.value.clone())
    }

    pub fn put(&mut self, prompt: &str, mode: Mode, fingerprints: &[String], value: CachedResponse) {
        let key = CacheKey {
            prompt_fingerprint: prompt_fingerprint(prompt),
            mode,
            findings_digest: findings_digest(fingerprints),
        };
        if !self.entries.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Configurable thresholds the router is constructed with, lifted from `Configuration`
/// rather than read from any global.
pub struct HybridRouter {
    finding_threshold: u32,
    subdomain_threshold: u32,
}

impl HybridRouter {
    pub fn new(finding_threshold: u32, subdomain_threshold: u32) -> Self {
        Self {
            finding_threshold,
            subdomain_threshold,
        }
    }

    /// The deterministic policy from §4.5, evaluated top to bottom; the first matching rule
    /// wins.
    pub fn route(&self, ctx: &RoutingContext) -> RoutingDecision {
        if let Some(mode) = ctx.forced_mode {
            return RoutingDecision {
                mode,
                reason: "forced mode override".to_string(),
            };
        }

        if ctx.finding_count >= self.finding_threshold
            && ctx.max_finding_severity.map(|s| s >= Severity::High).unwrap_or(false)
        {
            return RoutingDecision {
                mode: Mode::Deep,
                reason: format!(
                    "finding_count {} >= threshold {} with a high-or-above severity finding",
                    ctx.finding_count, self.finding_threshold
                ),
            };
        }

        if ctx.subdomain_count >= self.subdomain_threshold || ctx.target_complexity == TargetComplexity::High {
            return RoutingDecision {
                mode: Mode::Deep,
                reason: format!(
                    "subdomain_count {} >= threshold {} or target_complexity=high",
                    ctx.subdomain_count, self.subdomain_threshold
                ),
            };
        }

        if ctx.query_intent_tags.contains(&QueryIntentTag::Plan)
            || ctx.query_intent_tags.contains(&QueryIntentTag::Prioritize)
        {
            return RoutingDecision {
                mode: Mode::Deep,
                reason: "query intent requests planning or prioritization".to_string(),
            };
        }

        RoutingDecision {
            mode: Mode::Fast,
            reason: "no escalation condition met".to_string(),
        }
    }

    /// The dedicated rule for the final, model-declared-completion summarization step
    /// (§4.5 rule 2), kept separate from `route` since it isn't a function of
    /// `RoutingContext` at all — it always escalates.
    pub fn route_completion_summary(&self) -> RoutingDecision {
        RoutingDecision {
            mode: Mode::Deep,
            reason: "scan-completion summarization always uses the deep model".to_string(),
        }
    }
}
