//! Approval request / resolve lifecycle and one-shot approval tokens.
//!
//! Callers create an approval record bound to the hash of the exact action
//! payload, then block on `wait_for_decision` until an operator resolves it
//! or the timeout elapses. An allow resolution issues an opaque single-use
//! token; consuming the token re-checks the bind hash computed from the
//! action about to execute, so one token can never authorize two different
//! payloads.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::canonical::hash_canonical;
use crate::error::KernelError;

/// Default lifetime of an issued approval token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(120);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    #[serde(rename = "allow-once")]
    AllowOnce,
    #[serde(rename = "allow-always")]
    AllowAlways,
    #[serde(rename = "deny")]
    Deny,
}

impl ApprovalDecision {
    pub fn allows(&self) -> bool {
        matches!(self, ApprovalDecision::AllowOnce | ApprovalDecision::AllowAlways)
    }
}

/// A pending or resolved approval request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    /// The full action payload the approval is bound to.
    pub request: Value,
    /// SHA-256 over the canonical JSON of `request`.
    pub bind_hash: String,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    /// Token minted at resolution. Held for the original requester only;
    /// never serialized into listings.
    #[serde(skip)]
    pub issued_token: Option<String>,
}

impl ApprovalRecord {
    fn is_pending(&self, now: i64) -> bool {
        self.decision.is_none() && self.expires_at_ms > now
    }
}

/// Broadcast payload for `exec.approval.resolved`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedEvent {
    pub id: String,
    pub decision: ApprovalDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    bind_hash: String,
    expires_at_ms: i64,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

/// Compute the bind hash for an approval request payload.
pub fn bind_hash(request: &Value) -> String {
    hash_canonical(request)
}

pub struct ApprovalManager {
    records: Mutex<HashMap<String, ApprovalRecord>>,
    tokens: Mutex<HashMap<String, IssuedToken>>,
    token_ttl: Duration,
    /// Resolution broadcast. Lagging subscribers drop events; resolution
    /// never blocks on them.
    tx: broadcast::Sender<ResolvedEvent>,
}

impl ApprovalManager {
    pub fn new(token_ttl: Duration) -> Self {
        let (tx, _) = broadcast::channel(256);
        ApprovalManager {
            records: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            token_ttl,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResolvedEvent> {
        self.tx.subscribe()
    }

    /// Create a pending approval record for `request`.
    ///
    /// Refuses when `explicit_id` names a record that is still pending.
    pub fn create(
        &self,
        request: Value,
        timeout: Duration,
        explicit_id: Option<String>,
    ) -> Result<ApprovalRecord, KernelError> {
        let now = now_ms();
        let mut records = self.records.lock().expect("approval lock poisoned");
        sweep_records(&mut records, now);

        let id = match explicit_id {
            Some(id) => {
                if records.get(&id).map(|r| r.is_pending(now)).unwrap_or(false) {
                    return Err(KernelError::invalid(format!(
                        "invalid:approval_id_already_pending:{id}"
                    )));
                }
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let record = ApprovalRecord {
            id: id.clone(),
            bind_hash: bind_hash(&request),
            request,
            created_at_ms: now,
            expires_at_ms: now + timeout.as_millis() as i64,
            decision: None,
            resolved_at_ms: None,
            resolved_by: None,
            issued_token: None,
        };
        records.insert(id, record.clone());
        Ok(record)
    }

    /// Resolve a pending approval. Returns the issued token (for allow
    /// decisions) or `None` for deny. A second resolve for the same id is a
    /// no-op reported as `Err`.
    pub fn resolve(
        &self,
        id: &str,
        decision: ApprovalDecision,
        resolved_by: impl Into<String>,
    ) -> Result<Option<String>, KernelError> {
        let now = now_ms();
        // Two short critical sections, never holding both maps at once.
        let bind = {
            let mut records = self.records.lock().expect("approval lock poisoned");
            let record = records
                .get_mut(id)
                .ok_or_else(|| KernelError::invalid(format!("invalid:approval_not_found:{id}")))?;
            if !record.is_pending(now) {
                return Err(KernelError::invalid(format!(
                    "invalid:approval_already_resolved:{id}"
                )));
            }
            record.decision = Some(decision);
            record.resolved_at_ms = Some(now);
            record.resolved_by = Some(resolved_by.into());
            record.bind_hash.clone()
        };

        let token = if decision.allows() {
            let token = self.issue_token(&bind);
            let mut records = self.records.lock().expect("approval lock poisoned");
            if let Some(record) = records.get_mut(id) {
                record.issued_token = Some(token.clone());
            }
            Some(token)
        } else {
            None
        };

        // Best-effort notify; a wedged subscriber must not block resolution.
        let _ = self.tx.send(ResolvedEvent {
            id: id.to_string(),
            decision,
            approval_token: token.clone(),
        });
        Ok(token)
    }

    /// Suspend until the record is resolved or `timeout` elapses.
    /// `None` means timeout (or waiter cancellation).
    pub async fn wait_for_decision(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Option<ApprovalDecision> {
        let mut rx = self.tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            {
                let records = self.records.lock().expect("approval lock poisoned");
                match records.get(id) {
                    Some(record) => {
                        if let Some(decision) = record.decision {
                            // For allows, wait until the token is attached so
                            // the requester never observes a half-resolved
                            // record.
                            if !decision.allows() || record.issued_token.is_some() {
                                return Some(decision);
                            }
                        }
                    }
                    None => return None,
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(event)) if event.id == id => {
                    // Loop re-reads the record for the authoritative state.
                }
                Ok(Ok(_)) => {}
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    // Channel gone or deadline hit — report what we have.
                    let records = self.records.lock().expect("approval lock poisoned");
                    return records.get(id).and_then(|r| r.decision);
                }
            }
        }
    }

    /// Look up a record by id.
    pub fn get(&self, id: &str) -> Option<ApprovalRecord> {
        self.records
            .lock()
            .expect("approval lock poisoned")
            .get(id)
            .cloned()
    }

    /// All records still awaiting a decision.
    pub fn pending(&self) -> Vec<ApprovalRecord> {
        let now = now_ms();
        let mut records = self.records.lock().expect("approval lock poisoned");
        sweep_records(&mut records, now);
        let mut pending: Vec<ApprovalRecord> = records
            .values()
            .filter(|r| r.is_pending(now))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at_ms);
        pending
    }

    /// Mint a fresh single-use token bound to `bind_hash`.
    pub fn issue_token(&self, bind_hash: &str) -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        let now = now_ms();
        sweep_tokens(&mut tokens, now);
        tokens.insert(
            token.clone(),
            IssuedToken {
                bind_hash: bind_hash.to_string(),
                expires_at_ms: now + self.token_ttl.as_millis() as i64,
            },
        );
        token
    }

    /// Atomically consume `token` if it is live and bound to
    /// `expected_bind_hash`. A mismatched hash leaves the token in place.
    pub fn consume_token(&self, token: &str, expected_bind_hash: &str) -> bool {
        let mut tokens = self.tokens.lock().expect("token lock poisoned");
        let now = now_ms();
        sweep_tokens(&mut tokens, now);
        match tokens.get(token) {
            Some(issued)
                if issued.expires_at_ms > now && issued.bind_hash == expected_bind_hash =>
            {
                tokens.remove(token);
                true
            }
            _ => false,
        }
    }

    /// Count of live pending records, for status surfaces.
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

fn sweep_records(records: &mut HashMap<String, ApprovalRecord>, now: i64) {
    // Resolved records stay queryable; expired unresolved ones are garbage.
    records.retain(|_, r| r.decision.is_some() || r.expires_at_ms > now);
}

fn sweep_tokens(tokens: &mut HashMap<String, IssuedToken>, now: i64) {
    tokens.retain(|_, t| t.expires_at_ms > now);
}
