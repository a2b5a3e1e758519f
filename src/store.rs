//! Storage collaborator contract (§4.8) and one in-memory reference implementation.
//!
//! The real store is an external collaborator (a relational database, per §1's scope note);
//! this crate ships only enough of one to drive the agent loop and the test suite without a
//! database, matching the teacher's `Arc<RwLock<HashMap<...>>>` registry idiom
//! (`tool_protocols.rs::CustomToolProtocol`).

use crate::error::OrchestratorError;
use crate::findings::Finding;
use crate::scan::Scan;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// One recorded iteration of the agent loop, persisted alongside its scan (§3 AgentStep).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentStepRecord {
    pub scan_id: String,
    pub index: u32,
    pub model_used: String,
    pub reasoning: String,
    pub tool_name: Option<String>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub estimated_cost: f64,
}

/// The persistence operations the Scan Controller depends on (§4.8). The core never
/// assumes a specific backing store.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn put_scan(&self, scan: Scan) -> Result<(), OrchestratorError>;
    async fn get_scan(&self, scan_id: &str) -> Result<Option<Scan>, OrchestratorError>;
    async fn append_step(&self, step: AgentStepRecord) -> Result<(), OrchestratorError>;
    async fn upsert_finding(&self, finding: Finding) -> Result<(), OrchestratorError>;
    async fn finalize_scan(&self, scan: Scan) -> Result<(), OrchestratorError>;
    async fn list_findings(&self, scan_id: &str) -> Result<Vec<Finding>, OrchestratorError>;
}

#[derive(Default)]
struct Inner {
    scans: HashMap<String, Scan>,
    steps: HashMap<String, Vec<AgentStepRecord>>,
    findings: HashMap<String, Vec<Finding>>,
}

/// An `Arc<RwLock<HashMap<...>>>`-backed store sufficient to run scans end-to-end in tests
/// and in embedders that don't need durability.
pub struct InMemoryScanStore {
    inner: RwLock<Inner>,
}

impl InMemoryScanStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
        })
    }
}

impl Default for InMemoryScanStore {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

#[async_trait]
impl ScanStore for InMemoryScanStore {
    async fn put_scan(&self, scan: Scan) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().map_err(|_| OrchestratorError::StorageError("store poisoned".into()))?;
        inner.scans.insert(scan.id.clone(), scan);
        Ok(())
    }

    async fn get_scan(&self, scan_id: &str) -> Result<Option<Scan>, OrchestratorError> {
        let inner = self.inner.read().map_err(|_| OrchestratorError::StorageError("store poisoned".into()))?;
        Ok(inner.scans.get(scan_id).cloned())
    }

    async fn append_step(&self, step: AgentStepRecord) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().map_err(|_| OrchestratorError::StorageError("store poisoned".into()))?;
        inner.steps.entry(step.scan_id.clone()).or_default().push(step);
        Ok(())
    }

    async fn upsert_finding(&self, finding: Finding) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().map_err(|_| OrchestratorError::StorageError("store poisoned".into()))?;
        let bucket = inner.findings.entry(finding.scan_id.clone()).or_default();
        if let Some(existing) = bucket.iter_mut().find(|f| f.fingerprint == finding.fingerprint) {
            *existing = finding;
        } else {
            bucket.push(finding);
        }
        Ok(())
    }

    async fn finalize_scan(&self, scan: Scan) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.write().map_err(|_| OrchestratorError::StorageError("store poisoned".into()))?;
        inner.scans.insert(scan.id.clone(), scan);
        Ok(())
    }

    async fn list_findings(&self, scan_id: &str) -> Result<Vec<Finding>, OrchestratorError> {
        let inner = self.inner.read().map_err(|_| OrchestratorError::StorageError("store poisoned".into()))?;
        Ok(inner.findings.get(scan_id).cloned().unwrap_or_default())
    }
}
