//! Scan record and its lifecycle states (§3 Scan, §6 "Scan creation request").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `pending → running → (completed|failed|cancelled)`, monotonic: once a terminal state is
/// entered, neither `status` nor `completed_at` ever changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition (§3 invariant: terminal
    /// states are monotonic, no reverse transition is observable — property 5).
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        use ScanStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (a, b) if a == &b => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanProfile {
    Quick,
    Normal,
    Aggressive,
}

impl Default for ScanProfile {
    fn default() -> Self {
        ScanProfile::Normal
    }
}

/// The transport-boundary request shape (§6).
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    pub target: String,
    pub objective: Option<String>,
    #[serde(default)]
    pub profile: ScanProfile,
    #[serde(default = "default_true")]
    pub enable_ai: bool,
    pub tools: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// The top-level unit of work (§3 Scan).
#[derive(Debug, Clone, Serialize)]
pub struct Scan {
    pub id: String,
    pub target: String,
    pub objective: Option<String>,
    pub profile: ScanProfile,
    pub status: ScanStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_tool: Option<String>,
    pub error_message: Option<String>,
}

impl Scan {
    pub fn new(id: impl Into<String>, request: &ScanRequest) -> Self {
        Self {
            id: id.into(),
            target: request.target.clone(),
            objective: request.objective.clone(),
            profile: request.profile,
            status: ScanStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            current_tool: None,
            error_message: None,
        }
    }

    /// Applies a status transition, enforcing monotonicity and the `current_tool`
    /// invariant (only non-null while `running`).
    pub fn transition(&mut self, next: ScanStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!("illegal scan transition {:?} -> {:?}", self.status, next));
        }
        match next {
            ScanStatus::Running => self.started_at = Some(Utc::now()),
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
                self.current_tool = None;
            }
            ScanStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ScanRequest {
        ScanRequest {
            target: "example.test".to_string(),
            objective: None,
            profile: ScanProfile::Quick,
            enable_ai: true,
            tools: None,
        }
    }

    #[test]
    fn new_scan_starts_pending_with_no_timestamps() {
        let scan = Scan::new("scan-1", &request());
        assert_eq!(scan.status, ScanStatus::Pending);
        assert!(scan.started_at.is_none());
        assert!(scan.completed_at.is_none());
    }

    #[test]
    fn pending_to_running_sets_started_at() {
        let mut scan = Scan::new("scan-1", &request());
        scan.transition(ScanStatus::Running).unwrap();
        assert_eq!(scan.status, ScanStatus::Running);
        assert!(scan.started_at.is_some());
    }

    #[test]
    fn terminal_transition_is_final_and_clears_current_tool() {
        let mut scan = Scan::new("scan-1", &request());
        scan.transition(ScanStatus::Running).unwrap();
        scan.current_tool = Some("port_scanner".to_string());
        scan.transition(ScanStatus::Completed).unwrap();
        assert!(scan.current_tool.is_none());
        assert!(scan.completed_at.is_some());

        let err = scan.transition(ScanStatus::Running);
        assert!(err.is_err());
    }

    #[test]
    fn pending_cannot_jump_directly_to_completed() {
        let mut scan = Scan::new("scan-1", &request());
        assert!(scan.transition(ScanStatus::Completed).is_err());
    }
}
