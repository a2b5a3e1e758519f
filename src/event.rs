//! Event Bus & Ordering (§4.7).
//!
//! Redesigned away from the teacher's callback-based `EventHandler` trait per the §9
//! design note on coroutine/event-loop streaming: there are no callbacks here. Each scan
//! owns one append-only event log guarded by a `Mutex`, plus a bounded `mpsc` channel per
//! live subscriber. `Subscribe` replays the retained log from a resume point and then
//! attaches to the live fan-out; a subscriber that falls behind has its sender's channel
//! fill up, which is treated as backpressure rather than blocking the publisher. Dropped
//! receivers prune themselves from the subscriber list on the next publish — the bus never
//! holds a strong handle a subscriber would need to free explicitly.

use crate::provider::Mode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One element of the event stream for a scan (§3 Event).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub scan_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub model: Option<Mode>,
}

/// The twelve `kind` values defined in §6, each carrying its kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    ScanStarted { target: String, profile: String },
    ModelSelected { mode: Mode, reason: String },
    AgentReasoning { text: String, mode: Mode },
    ToolCall { tool: String, arguments: serde_json::Value },
    ToolOutput { tool: String, line: String, stream: OutputStream },
    ToolCompleted {
        tool: String,
        duration_ms: u64,
        finding_count: u32,
        exit_code: i32,
        truncated: bool,
    },
    Finding {
        id: String,
        severity: String,
        title: String,
        affected_target: String,
        tool_source: String,
        cve: Option<String>,
    },
    Escalation { from_mode: Mode, to_mode: Mode, reason: String },
    Error { kind: String, message: String, recoverable: bool },
    ScanCompleted {
        summary: String,
        counts_by_severity: HashMap<String, u32>,
        total_cost: f64,
        total_tokens: u64,
    },
    ScanFailed { kind: String, message: String },
    ScanCancelled {},
    StreamOverflow {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl EventKind {
    /// Whether this event kind ends a scan's stream (§6: "exactly one terminal event").
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::ScanCompleted { .. } | EventKind::ScanFailed { .. } | EventKind::ScanCancelled {}
        )
    }
}

struct ScanStream {
    log: Vec<Event>,
    sequence: AtomicU64,
    subscribers: Vec<(mpsc::Sender<Event>, Arc<AtomicBool>)>,
    terminal_at: Option<DateTime<Utc>>,
}

impl ScanStream {
    fn new() -> Self {
        Self {
            log: Vec::new(),
            sequence: AtomicU64::new(0),
            subscribers: Vec::new(),
            terminal_at: None,
        }
    }
}

/// A live handle to one scan's event stream. Replays the catch-up log first, then yields
/// the live tail. Ends with a synthesized `stream_overflow` event if the bus dropped this
/// subscriber for lagging too far behind.
pub struct Subscription {
    catchup: std::collections::VecDeque<Event>,
    receiver: mpsc::Receiver<Event>,
    overflowed: Arc<AtomicBool>,
    overflow_emitted: bool,
    scan_id: String,
}

impl Subscription {
    /// Non-blocking drain, for callers (tests, synchronous inspection) that don't want to
    /// await the live tail.
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.catchup.pop_front() {
            return Some(event);
        }
        self.receiver.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.catchup.pop_front() {
            return Some(event);
        }
        match self.receiver.recv().await {
            Some(event) => Some(event),
            None => {
                if self.overflowed.load(Ordering::SeqCst) && !self.overflow_emitted {
                    self.overflow_emitted = true;
                    Some(Event {
                        scan_id: self.scan_id.clone(),
                        sequence: u64::MAX,
                        timestamp: Utc::now(),
                        kind: EventKind::StreamOverflow {},
                        model: None,
                    })
                } else {
                    None
                }
            }
        }
    }
}

/// Delivers a totally-ordered, lossless, per-scan event stream to zero or more subscribers.
pub struct EventBus {
    scans: Mutex<HashMap<String, ScanStream>>,
    max_lag: usize,
}

impl EventBus {
    pub fn new(max_lag: usize) -> Self {
        Self {
            scans: Mutex::new(HashMap::new()),
            max_lag,
        }
    }

    /// Assign the next `sequence` for `scan_id` and push the event to the retained log and
    /// every live subscriber.
    pub fn publish(&self, scan_id: &str, kind: EventKind, model: Option<Mode>) -> Event {
        let mut scans = self.scans.lock().expect("event bus mutex poisoned");
        let stream = scans.entry(scan_id.to_string()).or_insert_with(ScanStream::new);
        let sequence = stream.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = Event {
            scan_id: scan_id.to_string(),
            sequence,
            timestamp: Utc::now(),
            kind,
            model,
        };
        stream.log.push(event.clone());
        if event.kind.is_terminal() {
            stream.terminal_at = Some(event.timestamp);
        }

        stream.subscribers.retain(|(sender, overflowed)| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                overflowed.store(true, Ordering::SeqCst);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        event
    }

    /// `Subscribe(scan_id) -> ordered stream`. `resume_from` replays starting at that
    /// sequence (inclusive); `None` replays from `sequence=1`.
    pub fn subscribe(&self, scan_id: &str, resume_from: Option<u64>) -> Subscription {
        let mut scans = self.scans.lock().expect("event bus mutex poisoned");
        let stream = scans.entry(scan_id.to_string()).or_insert_with(ScanStream::new);

        let resume_from = resume_from.unwrap_or(1);
        let catchup: std::collections::VecDeque<Event> = stream
            .log
            .iter()
            .filter(|e| e.sequence >= resume_from)
            .cloned()
            .collect();

        let (tx, rx) = mpsc::channel(self.max_lag.max(1));
        let overflowed = Arc::new(AtomicBool::new(false));
        stream.subscribers.push((tx, Arc::clone(&overflowed)));

        Subscription {
            catchup,
            receiver: rx,
            overflowed,
            overflow_emitted: false,
            scan_id: scan_id.to_string(),
        }
    }

    /// Drop retained state for scans whose terminal event is older than `retention`,
    /// relative to `now`. Called periodically by the scan controller's housekeeping, never
    /// by the bus itself (no background tasks are spawned here).
    pub fn evict_expired(&self, now: DateTime<Utc>, retention: chrono::Duration) {
        let mut scans = self.scans.lock().expect("event bus mutex poisoned");
        scans.retain(|_, stream| match stream.terminal_at {
            Some(terminal_at) => now.signed_duration_since(terminal_at) < retention,
            None => true,
        });
    }
}
