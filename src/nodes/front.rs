//! Enforcement front for inbound node commands.
//!
//! Every `node.invoke` runs the same discipline: strip caller bypass
//! fields, resolve the per-command capability policy, dedupe dangerous
//! retries by idempotency key, rate-limit, check scopes / break-glass env /
//! exposure, consume approval tokens, re-validate `system.run`, bound
//! concurrency, clamp budgets, forward, cap the response, and append the
//! outcome to the dangerous ledger.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::canonical::{hash_canonical, sha256_hex};
use crate::config::KernelEnv;
use crate::error::KernelError;
use crate::ledger::Ledger;
use crate::limiter::{rate_limit_key, ActionLimiter, Admission};
use crate::nodes::budget::{
    ExecBudget, DEFAULT_DANGEROUS_BUDGET, DEFAULT_EXEC_BUDGET, MAX_RESPONSE_BYTES,
};
use crate::nodes::{Exposure, NodeRegistry};
use crate::policy::approval::{bind_hash, ApprovalManager};
use crate::shell;

/// Name of the dangerous-ledger chain.
const DANGEROUS_CHAIN: &str = "node-commands";

// ─── Per-command capability policy ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandPolicy {
    pub dangerous: bool,
    pub admin_scope: bool,
    pub require_session_key: bool,
    pub require_safe_exposure: bool,
    /// Env var that must be set before the command is available at all.
    pub break_glass: Option<&'static str>,
    /// Capability label for commands that demand a consumed approval token.
    pub approval_capability: Option<&'static str>,
}

/// Resolve the enforcement profile for a node command.
pub fn command_policy(command: &str) -> CommandPolicy {
    match command {
        "system.run" => CommandPolicy {
            dangerous: true,
            admin_scope: false,
            require_session_key: true,
            require_safe_exposure: true,
            break_glass: Some("WARDEN_ALLOW_NODE_EXEC"),
            approval_capability: Some("node:system.run"),
        },
        "browser.proxy" => CommandPolicy {
            dangerous: true,
            require_session_key: true,
            require_safe_exposure: true,
            break_glass: Some("WARDEN_ALLOW_BROWSER_PROXY"),
            ..Default::default()
        },
        cmd if cmd.starts_with("admin.") => CommandPolicy {
            admin_scope: true,
            require_session_key: true,
            ..Default::default()
        },
        _ => CommandPolicy::default(),
    }
}

// ─── Request / response ───────────────────────────────────────────────────────

/// Decoded `node.invoke` parameters.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub node_id: String,
    pub command: String,
    pub params: Value,
    pub timeout_ms: Option<u64>,
    pub idempotency_key: String,
}

/// Connection-level caller identity, never taken from request params.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
    pub client_id: Option<String>,
    pub device_id: Option<String>,
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    pub ok: bool,
    pub payload: Value,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub output_truncated: bool,
}

#[derive(Clone)]
struct IdemState {
    payload_hash: String,
    response: Option<InvokeResponse>,
}

// ─── Front ────────────────────────────────────────────────────────────────────

pub struct NodeFront {
    registry: Arc<NodeRegistry>,
    limiter: Arc<ActionLimiter>,
    approvals: Arc<ApprovalManager>,
    dangerous_ledger: Arc<Ledger>,
    env: KernelEnv,
    exposure: Exposure,
    workspace_root: PathBuf,
    idempotency: Mutex<HashMap<String, IdemState>>,
}

impl NodeFront {
    pub fn new(
        registry: Arc<NodeRegistry>,
        limiter: Arc<ActionLimiter>,
        approvals: Arc<ApprovalManager>,
        dangerous_ledger: Arc<Ledger>,
        env: KernelEnv,
        exposure: Exposure,
        workspace_root: PathBuf,
    ) -> Self {
        NodeFront {
            registry,
            limiter,
            approvals,
            dangerous_ledger,
            env,
            exposure,
            workspace_root,
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    /// Enforce and forward one node command.
    pub async fn invoke(
        &self,
        req: InvokeRequest,
        caller: &CallerContext,
    ) -> Result<InvokeResponse, KernelError> {
        let policy = command_policy(&req.command);

        // 1. Bypass fields are always caller-controlled lies; the approval
        // token is the only one with a legitimate reading, and it is
        // extracted, never forwarded.
        let (params, approval_token) = strip_bypass_fields(req.params.clone());

        // 2. Unknown node fails fast, before any state is touched.
        let session = self
            .registry
            .get(&req.node_id)
            .ok_or_else(|| KernelError::NodeNotConnected {
                node_id: req.node_id.clone(),
            })?;

        let rate_key = rate_limit_key(
            caller.session_key.as_deref(),
            caller.client_id.as_deref(),
            caller.device_id.as_deref(),
            &req.command,
        );
        let now = Utc::now().timestamp_millis();

        let payload_hash = hash_canonical(&json!({
            "nodeId": req.node_id,
            "command": req.command,
            "params": params,
        }));

        // 4. Dangerous retries dedupe on (rate key, idempotency key).
        let dedupe_key = format!("node-danger:{rate_key}:{}", req.idempotency_key);
        if policy.dangerous {
            let prior_state = {
                let cache = self.idempotency.lock().expect("idempotency lock poisoned");
                cache.get(&dedupe_key).map(|prior| (prior.payload_hash.clone(), prior.response.clone()))
            };
            if let Some((prior_payload_hash, prior_response)) = prior_state {
                if prior_payload_hash != payload_hash {
                    self.record_denied(&req, caller, &payload_hash, "idempotency_key_reused")
                        .await;
                    return Err(KernelError::denied(vec![
                        "idempotency key reused with different payload".to_string(),
                    ]));
                }
                match prior_response {
                    Some(resp) => return Ok(resp),
                    None => {
                        return Err(KernelError::resource("idempotent_invocation_pending"));
                    }
                }
            }
        }

        // 5. Rate limit, scopes, break-glass, session key, exposure.
        match self.limiter.check_and_consume(&rate_key, now) {
            Admission::Allowed => {}
            refused @ (Admission::RateLimited | Admission::Blocked) => {
                self.record_denied(&req, caller, &payload_hash, refused.token())
                    .await;
                return Err(KernelError::resource(refused.token()));
            }
        }

        if let Err(e) = self.check_gates(&policy, &req, caller) {
            self.limiter.note_denial(&rate_key, now);
            self.record_denied(&req, caller, &payload_hash, &e.reasons().join(","))
                .await;
            return Err(e);
        }

        // 6. Approval-required commands must present a live token bound to
        // exactly this action.
        if let Some(capability) = policy.approval_capability {
            let expected = bind_hash(&json!({
                "capability": capability,
                "subject": req.node_id,
                "payloadHash": payload_hash,
                "agentId": caller.agent_id,
                "sessionKey": caller.session_key,
            }));
            let consumed = approval_token
                .as_deref()
                .map(|t| self.approvals.consume_token(t, &expected))
                .unwrap_or(false);
            if !consumed {
                self.limiter.note_denial(&rate_key, now);
                self.record_denied(&req, caller, &payload_hash, "approval_token_invalid")
                    .await;
                let reason = if approval_token.is_none() {
                    "approval_token_missing"
                } else {
                    "approval_token_invalid"
                };
                return Err(KernelError::denied(vec![reason.to_string()]));
            }
        }

        // 7. system.run gets re-validated with the same shell parser the
        // gate uses.
        let params = if req.command == "system.run" {
            match self.validate_system_run(params) {
                Ok(p) => p,
                Err(e) => {
                    self.limiter.note_denial(&rate_key, now);
                    self.record_denied(&req, caller, &payload_hash, &e.reasons().join(","))
                        .await;
                    return Err(e);
                }
            }
        } else {
            params
        };

        // 8. Concurrency and global slots, RAII-released on every exit path.
        let (_concurrency, _slot) = if policy.dangerous {
            let c = self.limiter.acquire_concurrency(&rate_key)?;
            let s = self.limiter.acquire_dangerous_slot()?;
            (Some(c), Some(s))
        } else {
            (None, None)
        };

        // Mark the idempotent invocation as in flight.
        if policy.dangerous {
            self.idempotency
                .lock()
                .expect("idempotency lock poisoned")
                .insert(
                    dedupe_key.clone(),
                    IdemState {
                        payload_hash: payload_hash.clone(),
                        response: None,
                    },
                );
        }

        // 9. Budget clamp.
        let budget: ExecBudget = if policy.dangerous {
            DEFAULT_DANGEROUS_BUDGET
        } else {
            DEFAULT_EXEC_BUDGET
        };
        let timeout = budget.clamp_timeout(req.timeout_ms);
        let mut forwarded = params;
        if let Value::Object(map) = &mut forwarded {
            map.insert("budget".to_string(), budget.to_value());
        }

        // 10. Forward and cap the response.
        let outcome = tokio::time::timeout(
            timeout,
            session.transport.forward(&req.command, forwarded, timeout),
        )
        .await;

        let result = match outcome {
            Ok(Ok(payload)) => Ok(cap_payload(payload)),
            Ok(Err(e)) => Err(KernelError::Unavailable(e)),
            Err(_) => Err(KernelError::resource("node_invoke_timeout")),
        };

        // 11. Dangerous ledger + idempotency cache update.
        match &result {
            Ok(resp) => {
                self.limiter.note_success(&rate_key, now);
                if policy.dangerous {
                    self.idempotency
                        .lock()
                        .expect("idempotency lock poisoned")
                        .insert(
                            dedupe_key,
                            IdemState {
                                payload_hash: payload_hash.clone(),
                                response: Some(resp.clone()),
                            },
                        );
                    self.record_outcome(&req, caller, &payload_hash, "allowed", "success")
                        .await;
                }
            }
            Err(_) => {
                if policy.dangerous {
                    // A failed invocation releases its idempotency slot so a
                    // retry with the same key can run.
                    self.idempotency
                        .lock()
                        .expect("idempotency lock poisoned")
                        .remove(&dedupe_key);
                    self.record_outcome(&req, caller, &payload_hash, "allowed", "failure")
                        .await;
                }
            }
        }

        result
    }

    /// Scope, break-glass, session-key, and exposure checks.
    fn check_gates(
        &self,
        policy: &CommandPolicy,
        req: &InvokeRequest,
        caller: &CallerContext,
    ) -> Result<(), KernelError> {
        if policy.dangerous && self.env.safe_mode {
            return Err(KernelError::denied(vec![format!(
                "node_command_disabled_safe_mode:{}",
                req.command
            )]));
        }
        if policy.admin_scope && !caller.admin {
            return Err(KernelError::denied(vec![format!(
                "admin_scope_required:{}",
                req.command
            )]));
        }
        if let Some(var) = policy.break_glass {
            if !self.env.break_glass_set(var) {
                return Err(KernelError::denied_with_break_glass(
                    vec![format!("node_command_disabled:{}", req.command)],
                    var,
                ));
            }
        }
        if policy.require_session_key && caller.session_key.is_none() {
            return Err(KernelError::denied(vec![format!(
                "session_key_required:{}",
                req.command
            )]));
        }
        if policy.require_safe_exposure
            && !self.exposure.is_safe()
            && !self.env.allow_dangerous_exposed
        {
            return Err(KernelError::denied_with_break_glass(
                vec![format!("unsafe_exposure:{}", req.command)],
                "WARDEN_ALLOW_DANGEROUS_EXPOSED",
            ));
        }
        Ok(())
    }

    /// `system.run` re-validation: shell shape, env allowlist, cwd
    /// containment.
    fn validate_system_run(&self, params: Value) -> Result<Value, KernelError> {
        let map = params
            .as_object()
            .ok_or_else(|| KernelError::invalid("invalid:args:not_object"))?;

        let command = map
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| KernelError::invalid("invalid:args:command_missing"))?;

        if shell::has_metacharacter_abuse(command) {
            return Err(KernelError::denied(vec![
                "node_exec_shell_metacharacters".to_string(),
            ]));
        }
        let argv = shell::split(command)
            .ok_or_else(|| KernelError::invalid("invalid:args:command_unparseable"))?;
        if argv.is_empty() {
            return Err(KernelError::invalid("invalid:args:command_empty"));
        }
        if shell::is_dash_c_invocation(&argv) {
            return Err(KernelError::denied(vec![
                "node_exec_dash_c_forbidden".to_string(),
            ]));
        }

        if let Some(env_value) = map.get("env") {
            let env_map: BTreeMap<String, String> = env_value
                .as_object()
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            if !self.env.allow_arbitrary_env {
                if let Err(bad) = shell::check_env_allowlist(&env_map) {
                    return Err(KernelError::denied(vec![format!(
                        "node_exec_env_not_allowlisted:{}",
                        bad.join(",")
                    )]));
                }
            }
        }

        let mut out = map.clone();
        if let Some(cwd) = map.get("cwd").and_then(Value::as_str) {
            let resolved = shell::contain_cwd(&self.workspace_root, std::path::Path::new(cwd))
                .map_err(|e| KernelError::denied(vec![format!("node_exec_cwd_rejected:{e}")]))?;
            out.insert(
                "cwd".to_string(),
                Value::String(resolved.to_string_lossy().into_owned()),
            );
        }
        Ok(Value::Object(out))
    }

    async fn record_denied(
        &self,
        req: &InvokeRequest,
        caller: &CallerContext,
        payload_hash: &str,
        reason: &str,
    ) {
        self.record(req, caller, payload_hash, "denied", "failure", Some(reason))
            .await;
    }

    async fn record_outcome(
        &self,
        req: &InvokeRequest,
        caller: &CallerContext,
        payload_hash: &str,
        decision: &str,
        result: &str,
    ) {
        self.record(req, caller, payload_hash, decision, result, None).await;
    }

    async fn record(
        &self,
        req: &InvokeRequest,
        caller: &CallerContext,
        payload_hash: &str,
        decision: &str,
        result: &str,
        reason: Option<&str>,
    ) {
        // Only dangerous commands are enriched into the dangerous ledger.
        if !command_policy(&req.command).dangerous {
            return;
        }
        let mut payload = Map::new();
        payload.insert("type".to_string(), json!("node_invoke"));
        payload.insert("timestampMs".to_string(), json!(Utc::now().timestamp_millis()));
        payload.insert("nodeId".to_string(), json!(req.node_id));
        payload.insert("command".to_string(), json!(req.command));
        payload.insert("payloadHash".to_string(), json!(payload_hash));
        payload.insert("idempotencyKey".to_string(), json!(req.idempotency_key));
        payload.insert("decision".to_string(), json!(decision));
        payload.insert("result".to_string(), json!(result));
        payload.insert(
            "sessionKeyHash".to_string(),
            json!(caller
                .session_key
                .as_deref()
                .map(|k| sha256_hex(k.as_bytes()))),
        );
        if let Some(reason) = reason {
            payload.insert("reason".to_string(), json!(reason));
        }
        if let Err(e) = self
            .dangerous_ledger
            .append(DANGEROUS_CHAIN, &Value::Object(payload))
            .await
        {
            warn!(err = %e, "dangerous ledger append failed");
        } else {
            info!(
                command = %req.command,
                node = %req.node_id,
                decision,
                result,
                "dangerous command recorded"
            );
        }
    }
}

/// Remove caller-supplied bypass fields, returning the cleaned params and
/// the extracted approval token (if any).
fn strip_bypass_fields(params: Value) -> (Value, Option<String>) {
    match params {
        Value::Object(mut map) => {
            map.remove("approved");
            map.remove("approvalDecision");
            let token = map
                .remove("approvalToken")
                .and_then(|v| v.as_str().map(str::to_string));
            (Value::Object(map), token)
        }
        other => (other, None),
    }
}

/// Hard-cap a node response payload to [`MAX_RESPONSE_BYTES`].
fn cap_payload(payload: Value) -> InvokeResponse {
    let serialized = payload.to_string();
    if serialized.len() <= MAX_RESPONSE_BYTES {
        return InvokeResponse {
            ok: true,
            payload,
            output_truncated: false,
        };
    }
    let mut cut = MAX_RESPONSE_BYTES;
    while !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    InvokeResponse {
        ok: true,
        payload: Value::String(serialized[..cut].to_string()),
        output_truncated: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_fields_are_stripped() {
        let (params, token) = strip_bypass_fields(json!({
            "path": "/x",
            "approved": true,
            "approvalDecision": "allow-once",
            "approvalToken": "tok-1",
        }));
        let obj = params.as_object().unwrap();
        assert!(!obj.contains_key("approved"));
        assert!(!obj.contains_key("approvalDecision"));
        assert!(!obj.contains_key("approvalToken"));
        assert_eq!(obj["path"], "/x");
        assert_eq!(token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn command_policies_resolve() {
        assert!(command_policy("system.run").dangerous);
        assert!(command_policy("system.run").approval_capability.is_some());
        assert!(command_policy("browser.proxy").dangerous);
        assert!(command_policy("admin.reload").admin_scope);
        assert!(!command_policy("status.ping").dangerous);
    }

    #[test]
    fn small_payloads_pass_uncapped() {
        let resp = cap_payload(json!({"out": "hello"}));
        assert!(!resp.output_truncated);
        assert_eq!(resp.payload["out"], "hello");
    }

    #[test]
    fn oversized_payloads_are_truncated_and_flagged() {
        let big = "x".repeat(MAX_RESPONSE_BYTES + 10);
        let resp = cap_payload(json!({"out": big}));
        assert!(resp.output_truncated);
        let s = resp.payload.as_str().unwrap();
        assert!(s.len() <= MAX_RESPONSE_BYTES);
    }
}
