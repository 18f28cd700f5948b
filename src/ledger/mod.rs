//! Hash-chained audit ledger.
//!
//! One append-only JSONL file per session key. Each line is an envelope
//! `{prevHash, hash, payload}` with `hash = SHA256(prevHash ||
//! canonicalJSON(payload))`; the genesis `prevHash` is the literal string
//! `"GENESIS"`. A `.last` sidecar holds only the tip hash for fast tail
//! reads and is rebuildable by scanning the ledger, so losing or corrupting
//! it never corrupts the chain.

pub mod redact;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::canonical::chain_hash;
use crate::policy::gate::Decision;
use crate::policy::proposal::Proposal;

pub const GENESIS: &str = "GENESIS";

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// The durable wire form of one ledger line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    pub hash: String,
    pub payload: Value,
}

/// Chain verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("broken link at entry {index}")]
    BrokenLink { index: usize },
    #[error("hash mismatch at entry {index}")]
    HashMismatch { index: usize },
}

/// Verify link and hash integrity of a parsed chain.
pub fn verify_chain(envelopes: &[Envelope]) -> Result<(), ChainError> {
    let mut prev = GENESIS.to_string();
    for (index, env) in envelopes.iter().enumerate() {
        if env.prev_hash != prev {
            return Err(ChainError::BrokenLink { index });
        }
        if chain_hash(&env.prev_hash, &env.payload) != env.hash {
            return Err(ChainError::HashMismatch { index });
        }
        prev = env.hash.clone();
    }
    Ok(())
}

// ─── Entry payloads ───────────────────────────────────────────────────────────

/// Builders for the payload shapes the kernel writes. Everything is
/// camelCase for `jq` querying.
pub mod entries {
    use super::*;

    fn base(kind: &str, proposal_id: &str) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), json!(kind));
        map.insert("timestampMs".to_string(), json!(Utc::now().timestamp_millis()));
        map.insert("proposalId".to_string(), json!(proposal_id));
        map
    }

    pub fn proposal(p: &Proposal) -> Value {
        let mut map = base("proposal", &p.id);
        map.insert("proposal".to_string(), serde_json::to_value(p).unwrap_or(Value::Null));
        Value::Object(map)
    }

    pub fn decision(proposal_id: &str, d: &Decision) -> Value {
        let mut map = base("decision", proposal_id);
        map.insert("verdict".to_string(), json!(d.verdict.as_str()));
        map.insert("risk".to_string(), json!(d.risk.as_str()));
        map.insert("reasons".to_string(), json!(d.reasons));
        map.insert("capsGranted".to_string(), json!(d.caps_granted));
        Value::Object(map)
    }

    pub fn result(proposal_id: &str, status: &str, summary: &str, duration_ms: u64) -> Value {
        let mut map = base("result", proposal_id);
        map.insert("status".to_string(), json!(status));
        map.insert("summary".to_string(), json!(summary));
        map.insert("durationMs".to_string(), json!(duration_ms));
        Value::Object(map)
    }

    pub fn error(proposal_id: &str, message: &str, duration_ms: u64) -> Value {
        let mut map = base("error", proposal_id);
        map.insert("message".to_string(), json!(message));
        map.insert("durationMs".to_string(), json!(duration_ms));
        Value::Object(map)
    }

    pub fn memory_write(proposal_id: &str, target: &str, bytes: usize) -> Value {
        let mut map = base("memory_write", proposal_id);
        map.insert("target".to_string(), json!(target));
        map.insert("bytes".to_string(), json!(bytes));
        Value::Object(map)
    }

    pub fn artifact(proposal_id: &str, name: &str, sha256: &str) -> Value {
        let mut map = base("artifact", proposal_id);
        map.insert("name".to_string(), json!(name));
        map.insert("sha256".to_string(), json!(sha256));
        Value::Object(map)
    }
}

// ─── Ledger ───────────────────────────────────────────────────────────────────

struct FileState {
    path: PathBuf,
    sidecar: PathBuf,
    /// In-memory tip, authoritative once the first append happened.
    tip: Option<String>,
}

/// Append-only, hash-chained ledger rooted at one directory.
///
/// Appends to the same session serialize on a per-file mutex; different
/// sessions append in parallel.
pub struct Ledger {
    root: PathBuf,
    files: Mutex<HashMap<String, Arc<tokio::sync::Mutex<FileState>>>>,
}

impl Ledger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Ledger {
            root: root.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk path for a session key.
    pub fn path_for(&self, session_key: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", safe_key(session_key)))
    }

    fn handle(&self, session_key: &str) -> Arc<tokio::sync::Mutex<FileState>> {
        let mut files = self.files.lock().expect("ledger map lock poisoned");
        files
            .entry(safe_key(session_key))
            .or_insert_with(|| {
                let path = self.path_for(session_key);
                let sidecar = sidecar_path(&path);
                Arc::new(tokio::sync::Mutex::new(FileState {
                    path,
                    sidecar,
                    tip: None,
                }))
            })
            .clone()
    }

    /// Redact and append one payload, returning the written envelope.
    pub async fn append(&self, session_key: &str, payload: &Value) -> Result<Envelope> {
        let handle = self.handle(session_key);
        let mut state = handle.lock().await;

        let payload = redact::redact(payload);
        let prev_hash = match state.tip.clone() {
            Some(tip) => tip,
            None => resolve_tip(&state.path, &state.sidecar).await?,
        };
        let hash = chain_hash(&prev_hash, &payload);
        let envelope = Envelope {
            prev_hash,
            hash: hash.clone(),
            payload,
        };

        let line = serde_json::to_string(&envelope)? + "\n";
        if let Some(parent) = state.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&state.path)
            .await
            .with_context(|| format!("open ledger {}", state.path.display()))?;
        file.write_all(line.as_bytes()).await?;

        // Sidecar update is best-effort; the chain itself is authoritative.
        if let Err(e) = tokio::fs::write(&state.sidecar, format!("{hash}\n")).await {
            warn!(err = %e, path = %state.sidecar.display(), "sidecar write failed");
        }
        state.tip = Some(hash);
        Ok(envelope)
    }

    /// Parse every envelope in a session's ledger. Missing file → empty.
    pub async fn read_all(&self, session_key: &str) -> Result<Vec<Envelope>> {
        let path = self.path_for(session_key);
        read_envelopes(&path).await
    }

    /// Verify the full chain for a session.
    pub async fn verify(&self, session_key: &str) -> Result<usize> {
        let envelopes = self.read_all(session_key).await?;
        verify_chain(&envelopes).map_err(|e| anyhow::anyhow!(e))?;
        Ok(envelopes.len())
    }

    /// The last `limit` envelopes for a session.
    pub async fn tail(&self, session_key: &str, limit: usize) -> Result<Vec<Envelope>> {
        let mut envelopes = self.read_all(session_key).await?;
        let skip = envelopes.len().saturating_sub(limit);
        Ok(envelopes.split_off(skip))
    }

    /// Rewrite the sidecar from the actual ledger tail.
    pub async fn rebuild_sidecar(&self, session_key: &str) -> Result<Option<String>> {
        let handle = self.handle(session_key);
        let state = handle.lock().await;
        let tip = scan_tail(&state.path).await?;
        match &tip {
            Some(hash) => tokio::fs::write(&state.sidecar, format!("{hash}\n")).await?,
            None => {
                let _ = tokio::fs::remove_file(&state.sidecar).await;
            }
        }
        Ok(tip)
    }
}

/// Path segments sanitized to `[A-Za-z0-9._-]`; anything else becomes `_`.
pub fn safe_key(session_key: &str) -> String {
    let mut out: String = session_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".last");
    PathBuf::from(os)
}

/// Tip resolution order: sidecar if it holds a plausible hash, else a full
/// tail scan, else genesis.
async fn resolve_tip(path: &Path, sidecar: &Path) -> Result<String> {
    if let Ok(contents) = tokio::fs::read_to_string(sidecar).await {
        let candidate = contents.trim();
        if is_hex_hash(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Ok(scan_tail(path).await?.unwrap_or_else(|| GENESIS.to_string()))
}

fn is_hex_hash(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Last envelope hash in the file, skipping unparseable lines.
async fn scan_tail(path: &Path) -> Result<Option<String>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut tip = None;
    for line in contents.lines() {
        if let Ok(env) = serde_json::from_str::<Envelope>(line) {
            tip = Some(env.hash);
        }
    }
    Ok(tip)
}

async fn read_envelopes(path: &Path) -> Result<Vec<Envelope>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut envelopes = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let env: Envelope = serde_json::from_str(line)
            .with_context(|| format!("ledger {} line {}", path.display(), i + 1))?;
        envelopes.push(env);
    }
    Ok(envelopes)
}
