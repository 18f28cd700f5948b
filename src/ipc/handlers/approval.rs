//! RPC handlers for the approval workflow.
//!
//! Exposes:
//!   `exec.approval.request`       — create + await an exec approval
//!   `exec.approval.resolve`       — resolve a pending approval
//!   `capability.approval.request` — create + await a capability approval
//!   `approval.list`               — list pending approval records

use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::error::KernelError;
use crate::policy::approval::ApprovalDecision;
use crate::shell;
use crate::Kernel;

fn sv<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

fn required<'a>(v: &'a Value, key: &str) -> Result<&'a str, KernelError> {
    sv(v, key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| KernelError::Invalid {
            reasons: vec![format!("invalid:params:missing_field:{key}")],
        })
}

fn wait_timeout(params: &Value, ctx: &Kernel) -> Duration {
    params
        .get("timeoutMs")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(ctx.config.approval_timeout)
}

/// Create a record, notify operators, await the decision, and shape the
/// common response.
async fn request_and_wait(
    request: Value,
    timeout: Duration,
    ctx: &Kernel,
) -> Result<Value, KernelError> {
    let record = ctx.approvals.create(request, timeout, None)?;
    ctx.broadcaster
        .approval_requested(serde_json::to_value(&record).unwrap_or(Value::Null));

    let decision = ctx.approvals.wait_for_decision(&record.id, timeout).await;
    let resolved = ctx.approvals.get(&record.id);
    let token = resolved.as_ref().and_then(|r| r.issued_token.clone());

    Ok(json!({
        "id": record.id,
        "decision": decision,
        "approvalToken": token,
        "createdAtMs": record.created_at_ms,
        "expiresAtMs": record.expires_at_ms,
    }))
}

/// `exec.approval.request` — approval for one shell execution.
///
/// Params: `{ command, commandArgv?, commandEnv?, cwd?, sessionKey,
///            agentId?, timeoutMs? }`
///
/// Field normalization (argv derivation, env key order) happens here,
/// before the payload is hashed into the bind.
pub async fn exec_request(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let command = required(&params, "command")?;
    let session_key = required(&params, "sessionKey")?;

    let argv: Vec<String> = match params.get("commandArgv").and_then(Value::as_array) {
        Some(given) => given
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        None => shell::split(command).unwrap_or_default(),
    };

    // Env map keys sort via the canonical encoding; values must be strings.
    let env: Map<String, Value> = params
        .get("commandEnv")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter(|(_, v)| v.is_string())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    let request = json!({
        "kind": "exec",
        "command": command,
        "commandArgv": argv,
        "commandEnv": env,
        "cwd": sv(&params, "cwd"),
        "sessionKey": session_key,
        "agentId": sv(&params, "agentId"),
    });

    request_and_wait(request, wait_timeout(&params, ctx), ctx).await
}

/// `capability.approval.request` — approval bound to
/// `{capability, subject, payloadHash, agentId, sessionKey}`.
pub async fn capability_request(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let capability = required(&params, "capability")?;
    let subject = required(&params, "subject")?;
    let payload_hash = required(&params, "payloadHash")?;
    let session_key = required(&params, "sessionKey")?;

    // Exact bind shape the enforcement front recomputes at consume time.
    let request = json!({
        "capability": capability,
        "subject": subject,
        "payloadHash": payload_hash,
        "agentId": sv(&params, "agentId"),
        "sessionKey": session_key,
    });

    request_and_wait(request, wait_timeout(&params, ctx), ctx).await
}

/// `exec.approval.resolve` — resolve a pending approval.
///
/// Params: `{ id, decision: "allow-once" | "allow-always" | "deny" }`
/// Writes to the approvals table are break-glass gated.
pub async fn resolve(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    if !ctx.env.allow_policy_mutation {
        return Err(KernelError::denied_with_break_glass(
            vec!["approval_mutation_disabled".to_string()],
            "WARDEN_ALLOW_POLICY_MUTATION",
        ));
    }

    let id = required(&params, "id")?;
    let decision_str = required(&params, "decision")?;
    let decision: ApprovalDecision = serde_json::from_value(json!(decision_str))
        .map_err(|_| KernelError::invalid(format!("invalid:params:decision:{decision_str}")))?;

    ctx.approvals.resolve(id, decision, "rpc-operator")?;
    // Notify WS clients without leaking the token; only the requester gets
    // that, through its own pending request.
    ctx.broadcaster
        .approval_resolved(json!({ "id": id, "decision": decision }));

    Ok(json!({ "ok": true, "id": id, "decision": decision }))
}

/// `approval.list` — records still awaiting a decision.
pub async fn list(_params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let pending = ctx.approvals.pending();
    let count = pending.len();
    Ok(json!({ "approvals": pending, "count": count }))
}
