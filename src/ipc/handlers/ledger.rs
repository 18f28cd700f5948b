//! `ledger.*` — operator queries over the audit chain.

use crate::error::KernelError;
use crate::Kernel;
use serde_json::{json, Value};

fn session_key(params: &Value) -> Result<&str, KernelError> {
    params
        .get("sessionKey")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| KernelError::invalid("invalid:params:session_key_missing"))
}

/// `ledger.verify` — recompute the full hash chain for a session.
///
/// Params: `{ "sessionKey": string }`
/// Returns: `{ "ok": bool, "entries": N, "error"?: string }`
pub async fn verify(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let key = session_key(&params)?;
    match ctx.ledger.verify(key).await {
        Ok(entries) => Ok(json!({ "ok": true, "entries": entries })),
        Err(e) => Ok(json!({ "ok": false, "error": e.to_string() })),
    }
}

/// `ledger.tail` — the last N envelopes for a session.
///
/// Params: `{ "sessionKey": string, "limit"?: number }`
pub async fn tail(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let key = session_key(&params)?;
    let limit = params
        .get("limit")
        .and_then(Value::as_u64)
        .unwrap_or(50)
        .min(200) as usize;
    let envelopes = ctx
        .ledger
        .tail(key, limit)
        .await
        .map_err(KernelError::Unavailable)?;
    let count = envelopes.len();
    Ok(json!({ "entries": envelopes, "count": count }))
}
