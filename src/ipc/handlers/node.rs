//! `node.*` — the RPC face of the enforcement front.

use crate::error::KernelError;
use crate::nodes::front::{CallerContext, InvokeRequest};
use crate::Kernel;
use serde_json::{json, Value};

fn sv<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str)
}

/// `node.invoke` — enforce and forward one node command.
///
/// Params: `{ nodeId, command, params?, timeoutMs?, idempotencyKey,
///            sessionKey?, agentId?, clientId?, deviceId? }`
/// Returns: `{ ok, payload, outputTruncated? }`
pub async fn invoke(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let node_id = sv(&params, "nodeId")
        .ok_or_else(|| KernelError::invalid("invalid:params:node_id_missing"))?
        .to_string();
    let command = sv(&params, "command")
        .ok_or_else(|| KernelError::invalid("invalid:params:command_missing"))?
        .to_string();
    let idempotency_key = sv(&params, "idempotencyKey")
        .ok_or_else(|| KernelError::invalid("invalid:params:idempotency_key_missing"))?
        .to_string();
    let timeout_ms = params.get("timeoutMs").and_then(Value::as_u64);
    let command_params = params.get("params").cloned().unwrap_or_else(|| json!({}));

    // Caller identity rides at the top level, never inside the forwarded
    // params. Admin scope cannot be claimed over the wire.
    let caller = CallerContext {
        session_key: sv(&params, "sessionKey").map(str::to_string),
        agent_id: sv(&params, "agentId").map(str::to_string),
        client_id: sv(&params, "clientId").map(str::to_string),
        device_id: sv(&params, "deviceId").map(str::to_string),
        admin: false,
    };

    let req = InvokeRequest {
        node_id,
        command,
        params: command_params,
        timeout_ms,
        idempotency_key,
    };

    let response = ctx.front.invoke(req, &caller).await?;
    serde_json::to_value(&response).map_err(|e| KernelError::Unavailable(e.into()))
}

/// `node.list` — connected node ids.
pub async fn list(_params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    Ok(json!({ "nodes": ctx.nodes.list() }))
}
