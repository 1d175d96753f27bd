//! Persistence of suspended workflow executions.
//!
//! The only execution state ever persisted is a [`ScheduledStep`]: which
//! execution waits on which step of which resource, and from when. Nodes
//! compete for due records through [`WorkflowStateStore::claim`] and
//! [`WorkflowStateStore::claim_due`], which move a record from `Pending` to
//! `Claimed` atomically so that one node at most runs a given trigger.
//!
//! Writes made while running a claimed record are fenced on the claim:
//! [`WorkflowStateStore::reschedule`], [`WorkflowStateStore::complete`] and
//! [`WorkflowStateStore::release`] only apply while the record still exists
//! and is claimed by the calling node. A record removed mid-run (cancelled)
//! or taken over after [`WorkflowStateStore::reclaim_stale`] is left alone.

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use warden_core::{EntityId, StorageError, Timestamp, WardenError, WardenResult};

use crate::context::ExecutionState;

/// Whether a node is currently running a scheduled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Claimed { node: String, at: Timestamp },
}

/// A step waiting to run at `scheduled_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledStep {
    pub execution_id: String,
    pub workflow_id: String,
    pub resource_id: EntityId,
    pub step_id: String,
    pub scheduled_at: Timestamp,
    pub status: ClaimStatus,
}

impl ScheduledStep {
    /// A pending record that resumes `state` at `step_id`.
    pub fn pending(state: &ExecutionState, step_id: impl Into<String>, scheduled_at: Timestamp) -> Self {
        Self {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            resource_id: state.resource_id.clone(),
            step_id: step_id.into(),
            scheduled_at,
            status: ClaimStatus::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ClaimStatus::Pending
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.scheduled_at <= now
    }

    /// The execution this record resumes, positioned on its step.
    pub fn execution_state(&self) -> ExecutionState {
        ExecutionState {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            resource_id: self.resource_id.clone(),
            step_id: Some(self.step_id.clone()),
        }
    }

    pub fn is_claimed_by(&self, node: &str) -> bool {
        matches!(&self.status, ClaimStatus::Claimed { node: owner, .. } if owner == node)
    }

    fn claimed_by(&self, node: &str, at: Timestamp) -> Self {
        Self {
            status: ClaimStatus::Claimed {
                node: node.to_string(),
                at,
            },
            ..self.clone()
        }
    }

    fn claimed_before(&self, cutoff: Timestamp) -> bool {
        matches!(&self.status, ClaimStatus::Claimed { at, .. } if *at < cutoff)
    }
}

/// Cluster-shared store of scheduled steps, keyed by execution id.
#[async_trait]
pub trait WorkflowStateStore: Send + Sync {
    /// Insert or replace the record for `step.execution_id`.
    async fn schedule(&self, step: ScheduledStep) -> WardenResult<()>;

    /// Replace the record for `step.execution_id` only while `node` holds
    /// its claim. Returns `false` if the record is gone or claimed elsewhere.
    async fn reschedule(&self, step: ScheduledStep, node: &str) -> WardenResult<bool>;

    /// Remove the record only while `node` holds its claim.
    async fn complete(&self, execution_id: &str, node: &str) -> WardenResult<bool>;

    async fn get(&self, execution_id: &str) -> WardenResult<Option<ScheduledStep>>;

    /// Claim one record for `node` regardless of its due time.
    ///
    /// Returns `None` if the record is gone or already claimed.
    async fn claim(&self, execution_id: &str, node: &str) -> WardenResult<Option<ScheduledStep>>;

    /// Claim up to `limit` pending records due at `now`, oldest first.
    async fn claim_due(
        &self,
        now: Timestamp,
        limit: usize,
        node: &str,
    ) -> WardenResult<Vec<ScheduledStep>>;

    /// Return a record claimed by `node` to `Pending` without changing its
    /// position.
    async fn release(&self, execution_id: &str, node: &str) -> WardenResult<bool>;

    async fn remove(&self, execution_id: &str) -> WardenResult<bool>;

    /// Remove every record of `resource_id`, returning how many.
    async fn remove_by_resource(&self, resource_id: &str) -> WardenResult<usize>;

    /// Release claims taken before `older_than`, returning how many.
    async fn reclaim_stale(&self, older_than: Timestamp) -> WardenResult<usize>;

    async fn list(&self) -> WardenResult<Vec<ScheduledStep>>;
}

fn oldest_first(records: &mut [ScheduledStep]) {
    records.sort_by(|a, b| {
        a.scheduled_at
            .cmp(&b.scheduled_at)
            .then_with(|| a.execution_id.cmp(&b.execution_id))
    });
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

fn poisoned<T>(_: T) -> StorageError {
    StorageError::LockPoisoned
}

/// Single-process [`WorkflowStateStore`].
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStateStore {
    records: RwLock<HashMap<String, ScheduledStep>>,
}

impl InMemoryWorkflowStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl WorkflowStateStore for InMemoryWorkflowStateStore {
    async fn schedule(&self, step: ScheduledStep) -> WardenResult<()> {
        self.records
            .write()
            .map_err(poisoned)?
            .insert(step.execution_id.clone(), step);
        Ok(())
    }

    async fn reschedule(&self, step: ScheduledStep, node: &str) -> WardenResult<bool> {
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(&step.execution_id) {
            Some(record) if record.is_claimed_by(node) => {
                *record = step;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, execution_id: &str, node: &str) -> WardenResult<bool> {
        let mut records = self.records.write().map_err(poisoned)?;
        if !records.get(execution_id).is_some_and(|r| r.is_claimed_by(node)) {
            return Ok(false);
        }
        records.remove(execution_id);
        Ok(true)
    }

    async fn get(&self, execution_id: &str) -> WardenResult<Option<ScheduledStep>> {
        Ok(self.records.read().map_err(poisoned)?.get(execution_id).cloned())
    }

    async fn claim(&self, execution_id: &str, node: &str) -> WardenResult<Option<ScheduledStep>> {
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(execution_id) {
            Some(record) if record.is_pending() => {
                *record = record.claimed_by(node, Utc::now());
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn claim_due(
        &self,
        now: Timestamp,
        limit: usize,
        node: &str,
    ) -> WardenResult<Vec<ScheduledStep>> {
        let mut records = self.records.write().map_err(poisoned)?;
        let mut due: Vec<_> = records
            .values()
            .filter(|r| r.is_pending() && r.is_due(now))
            .cloned()
            .collect();
        oldest_first(&mut due);
        due.truncate(limit);

        let claimed_at = Utc::now();
        let mut claimed = Vec::with_capacity(due.len());
        for record in due {
            let record = record.claimed_by(node, claimed_at);
            records.insert(record.execution_id.clone(), record.clone());
            claimed.push(record);
        }
        Ok(claimed)
    }

    async fn release(&self, execution_id: &str, node: &str) -> WardenResult<bool> {
        let mut records = self.records.write().map_err(poisoned)?;
        match records.get_mut(execution_id) {
            Some(record) if record.is_claimed_by(node) => {
                record.status = ClaimStatus::Pending;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, execution_id: &str) -> WardenResult<bool> {
        Ok(self
            .records
            .write()
            .map_err(poisoned)?
            .remove(execution_id)
            .is_some())
    }

    async fn remove_by_resource(&self, resource_id: &str) -> WardenResult<usize> {
        let mut records = self.records.write().map_err(poisoned)?;
        let before = records.len();
        records.retain(|_, r| r.resource_id != resource_id);
        Ok(before - records.len())
    }

    async fn reclaim_stale(&self, older_than: Timestamp) -> WardenResult<usize> {
        let mut records = self.records.write().map_err(poisoned)?;
        let mut reclaimed = 0;
        for record in records.values_mut() {
            if record.claimed_before(older_than) {
                record.status = ClaimStatus::Pending;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn list(&self) -> WardenResult<Vec<ScheduledStep>> {
        let mut all: Vec<_> = self.records.read().map_err(poisoned)?.values().cloned().collect();
        oldest_first(&mut all);
        Ok(all)
    }
}

// ============================================================================
// LMDB STORE
// ============================================================================

/// Error type for LMDB state store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStateError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStateError> for WardenError {
    fn from(e: LmdbStateError) -> Self {
        match e {
            LmdbStateError::Serialization(reason) => {
                WardenError::Storage(StorageError::Serialization { reason })
            }
            other => WardenError::Storage(StorageError::TransactionFailed {
                reason: other.to_string(),
            }),
        }
    }
}

const SCHEDULED_STEPS_DB: &str = "scheduled_steps";

fn txn_err(e: heed::Error) -> LmdbStateError {
    LmdbStateError::Transaction(e.to_string())
}

fn encode(step: &ScheduledStep) -> Result<Vec<u8>, LmdbStateError> {
    serde_json::to_vec(step).map_err(|e| LmdbStateError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<ScheduledStep, LmdbStateError> {
    serde_json::from_slice(bytes).map_err(|e| LmdbStateError::Serialization(e.to_string()))
}

/// LMDB-backed [`WorkflowStateStore`].
///
/// Records are JSON values keyed by execution id. Every mutation, and in
/// particular every claim, is a single LMDB write transaction; LMDB admits
/// one writer at a time, so two claimers of the same record can never both
/// observe it as `Pending`.
pub struct LmdbWorkflowStateStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbWorkflowStateStore {
    /// Open (or create) the store in directory `path`.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStateError> {
        std::fs::create_dir_all(&path)?;

        let map_size = max_size_mb
            .checked_mul(1024 * 1024)
            .ok_or_else(|| LmdbStateError::EnvOpen(format!("map size of {max_size_mb} MB overflows")))?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStateError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some(SCHEDULED_STEPS_DB))
            .map_err(|e| LmdbStateError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::info!(path = %path.as_ref().display(), max_size_mb, "Opened workflow state store");
        Ok(Self { env, db })
    }

    fn read_all(&self) -> Result<Vec<ScheduledStep>, LmdbStateError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut records = Vec::new();
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let (_, value) = item.map_err(txn_err)?;
            records.push(decode(value)?);
        }
        Ok(records)
    }

    /// Run `write` against the current record of `execution_id` in one write
    /// transaction, provided `node` still holds its claim.
    fn with_claim(
        &self,
        execution_id: &str,
        node: &str,
        write: impl FnOnce(&mut RwTxn<'_>, ScheduledStep) -> Result<(), LmdbStateError>,
    ) -> Result<bool, LmdbStateError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let current = match self.db.get(&wtxn, execution_id.as_bytes()).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Ok(false),
        };
        if !current.is_claimed_by(node) {
            return Ok(false);
        }
        write(&mut wtxn, current)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }

    /// Rewrite every record matching `select` with `update` in one write
    /// transaction, returning the rewritten records.
    fn update_where(
        &self,
        select: impl Fn(&ScheduledStep) -> bool,
        limit: usize,
        update: impl Fn(&ScheduledStep) -> ScheduledStep,
    ) -> Result<Vec<ScheduledStep>, LmdbStateError> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let mut selected = Vec::new();
        for item in self.db.iter(&wtxn).map_err(txn_err)? {
            let (_, value) = item.map_err(txn_err)?;
            let record = decode(value)?;
            if select(&record) {
                selected.push(record);
            }
        }
        oldest_first(&mut selected);
        selected.truncate(limit);

        let mut updated = Vec::with_capacity(selected.len());
        for record in &selected {
            let record = update(record);
            self.db
                .put(&mut wtxn, record.execution_id.as_bytes(), &encode(&record)?)
                .map_err(txn_err)?;
            updated.push(record);
        }

        wtxn.commit().map_err(txn_err)?;
        Ok(updated)
    }
}

#[async_trait]
impl WorkflowStateStore for LmdbWorkflowStateStore {
    async fn schedule(&self, step: ScheduledStep) -> WardenResult<()> {
        let bytes = encode(&step)?;
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, step.execution_id.as_bytes(), &bytes)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn reschedule(&self, step: ScheduledStep, node: &str) -> WardenResult<bool> {
        let bytes = encode(&step)?;
        let key = step.execution_id.as_bytes();
        Ok(self.with_claim(&step.execution_id, node, |wtxn, _| {
            self.db.put(wtxn, key, &bytes).map_err(txn_err)
        })?)
    }

    async fn complete(&self, execution_id: &str, node: &str) -> WardenResult<bool> {
        Ok(self.with_claim(execution_id, node, |wtxn, _| {
            self.db
                .delete(wtxn, execution_id.as_bytes())
                .map(|_| ())
                .map_err(txn_err)
        })?)
    }

    async fn get(&self, execution_id: &str) -> WardenResult<Option<ScheduledStep>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        match self.db.get(&rtxn, execution_id.as_bytes()).map_err(txn_err)? {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    async fn claim(&self, execution_id: &str, node: &str) -> WardenResult<Option<ScheduledStep>> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let current = match self.db.get(&wtxn, execution_id.as_bytes()).map_err(txn_err)? {
            Some(bytes) => decode(bytes)?,
            None => return Ok(None),
        };
        if !current.is_pending() {
            return Ok(None);
        }

        let claimed = current.claimed_by(node, Utc::now());
        self.db
            .put(&mut wtxn, execution_id.as_bytes(), &encode(&claimed)?)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(Some(claimed))
    }

    async fn claim_due(
        &self,
        now: Timestamp,
        limit: usize,
        node: &str,
    ) -> WardenResult<Vec<ScheduledStep>> {
        let claimed_at = Utc::now();
        Ok(self.update_where(
            |r| r.is_pending() && r.is_due(now),
            limit,
            |r| r.claimed_by(node, claimed_at),
        )?)
    }

    async fn release(&self, execution_id: &str, node: &str) -> WardenResult<bool> {
        Ok(self.with_claim(execution_id, node, |wtxn, current| {
            let released = ScheduledStep {
                status: ClaimStatus::Pending,
                ..current
            };
            self.db
                .put(wtxn, execution_id.as_bytes(), &encode(&released)?)
                .map_err(txn_err)
        })?)
    }

    async fn remove(&self, execution_id: &str) -> WardenResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let removed = self
            .db
            .delete(&mut wtxn, execution_id.as_bytes())
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(removed)
    }

    async fn remove_by_resource(&self, resource_id: &str) -> WardenResult<usize> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let mut keys = Vec::new();
        for item in self.db.iter(&wtxn).map_err(txn_err)? {
            let (key, value) = item.map_err(txn_err)?;
            if decode(value)?.resource_id == resource_id {
                keys.push(key.to_vec());
            }
        }
        for key in &keys {
            self.db.delete(&mut wtxn, key).map_err(txn_err)?;
        }

        wtxn.commit().map_err(txn_err)?;
        Ok(keys.len())
    }

    async fn reclaim_stale(&self, older_than: Timestamp) -> WardenResult<usize> {
        let reclaimed = self.update_where(
            |r| r.claimed_before(older_than),
            usize::MAX,
            |r| ScheduledStep {
                status: ClaimStatus::Pending,
                ..r.clone()
            },
        )?;
        Ok(reclaimed.len())
    }

    async fn list(&self) -> WardenResult<Vec<ScheduledStep>> {
        let mut all = self.read_all()?;
        oldest_first(&mut all);
        Ok(all)
    }
}

impl std::fmt::Debug for LmdbWorkflowStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbWorkflowStateStore")
            .field("path", &self.env.path())
            .finish()
    }
}
