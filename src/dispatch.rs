//! Dispatcher — the one point where a tool callback is gated.
//!
//! Every invocation runs normalize → gate → ledger → tool with the
//! arguments frozen at decision time. Tools the dispatcher has already
//! wrapped are refused a second pass, so two layers of gating can never
//! hide each other.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::KernelEnv;
use crate::error::KernelError;
use crate::feedback::FeedbackTracker;
use crate::ledger::{entries, Ledger};
use crate::policy::document::{Policy, RiskLevel};
use crate::policy::gate::{Gate, Verdict};
use crate::policy::proposal::{Proposal, Provenance};
use crate::policy::store::PolicyStore;

/// Progress callback handed to executing tools.
pub type UpdateFn = Arc<dyn Fn(Value) + Send + Sync>;

/// A no-op update sink.
pub fn null_update() -> UpdateFn {
    Arc::new(|_| {})
}

// ─── Tool trait ───────────────────────────────────────────────────────────────

/// An executable tool. The dispatcher never looks inside; it hands over
/// frozen arguments and awaits the outcome.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// True for adapters that already route through a dispatcher.
    fn kernel_wrapped(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        call_id: &str,
        args: Arc<Value>,
        signal: CancellationToken,
        on_update: UpdateFn,
    ) -> anyhow::Result<Value>;
}

// ─── Dispatch metadata ────────────────────────────────────────────────────────

/// Caller identity and constraints for one dispatch.
#[derive(Clone)]
pub struct DispatchMeta {
    pub actor: String,
    pub session_key: String,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
    /// Whether the caller runs inside the sandbox boundary.
    pub sandboxed: bool,
    pub capabilities_required: Vec<String>,
    pub declared_risk: Option<RiskLevel>,
    pub provenance: Option<Provenance>,
    /// Caller-supplied constraints; intersected with the installed policy,
    /// never widening it.
    pub constraints: Option<Policy>,
}

impl DispatchMeta {
    pub fn new(actor: impl Into<String>, session_key: impl Into<String>) -> Self {
        DispatchMeta {
            actor: actor.into(),
            session_key: session_key.into(),
            session_id: None,
            agent_id: None,
            sandboxed: true,
            capabilities_required: Vec::new(),
            declared_risk: None,
            provenance: None,
            constraints: None,
        }
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

pub struct Dispatcher {
    store: Arc<PolicyStore>,
    gate: Arc<Gate>,
    ledger: Arc<Ledger>,
    feedback: Arc<FeedbackTracker>,
    env: KernelEnv,
}

impl Dispatcher {
    pub fn new(
        store: Arc<PolicyStore>,
        gate: Arc<Gate>,
        ledger: Arc<Ledger>,
        feedback: Arc<FeedbackTracker>,
        env: KernelEnv,
    ) -> Self {
        Dispatcher {
            store,
            gate,
            ledger,
            feedback,
            env,
        }
    }

    /// Gate and execute one tool invocation.
    pub async fn dispatch(
        &self,
        tool: &dyn Tool,
        args: Value,
        call_id: &str,
        meta: &DispatchMeta,
        signal: CancellationToken,
        on_update: UpdateFn,
    ) -> Result<Value, KernelError> {
        // A kernel-wrapped tool going through the gate again means two
        // layers of gating are hiding each other. Refuse loudly.
        if tool.kernel_wrapped() {
            error!(tool = %tool.name(), "kernel-wrapped tool passed to dispatch");
            return Err(KernelError::Integrity(format!(
                "tool '{}' is already kernel-wrapped",
                tool.name()
            )));
        }

        let active = self.store.active_for_dispatch()?;
        let policy: Policy = match &meta.constraints {
            Some(constraints) => active.policy.intersect(constraints),
            None => (*active.policy).clone(),
        };

        let mut provenance = meta.provenance.clone().unwrap_or_default();
        provenance.policy_sha256 = Some(active.sha256.clone());

        let proposal = Proposal::new(&meta.actor, &meta.session_key, tool.name(), args)
            .with_agent(meta.agent_id.clone())
            .with_capabilities(meta.capabilities_required.clone())
            .with_declared_risk(meta.declared_risk)
            .with_provenance(Some(provenance));

        // Proposal and decision entries are load-bearing: failing to record
        // them aborts the invocation before anything runs.
        self.ledger
            .append(&meta.session_key, &entries::proposal(&proposal))
            .await
            .map_err(KernelError::Unavailable)?;

        let decision = self.gate.evaluate(&policy, &proposal, meta.sandboxed);
        if !self.gate.verify_stamp(&decision) {
            error!(proposal = %proposal.id, "decision failed integrity check");
            return Err(KernelError::Integrity(
                "decision missing integrity stamp".to_string(),
            ));
        }

        self.ledger
            .append(&meta.session_key, &entries::decision(&proposal.id, &decision))
            .await
            .map_err(KernelError::Unavailable)?;

        if decision.verdict != Verdict::Allow {
            let summary = decision.reasons.join(",");
            info!(
                tool = %tool.name(),
                verdict = decision.verdict.as_str(),
                reasons = %summary,
                "dispatch denied"
            );
            if let Err(e) = self
                .ledger
                .append(
                    &meta.session_key,
                    &entries::result(&proposal.id, "error", &summary, 0),
                )
                .await
            {
                warn!(err = %e, "denied-result ledger write failed");
            }
            return Err(KernelError::denied(decision.reasons));
        }

        // Freeze: the tool sees exactly what was gated, nothing later.
        let frozen: Arc<Value> = decision
            .normalized_args
            .clone()
            .unwrap_or_else(|| Arc::new(Value::Null));

        let started = Instant::now();
        match tool.execute(call_id, frozen, signal, on_update).await {
            Ok(result) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                let summary = if self.env.ledger_capture_output {
                    truncate_summary(&result)
                } else {
                    "omitted".to_string()
                };
                // The tool did run; a failed result write is a warning, not
                // a failure of the invocation.
                if let Err(e) = self
                    .ledger
                    .append(
                        &meta.session_key,
                        &entries::result(&proposal.id, "ok", &summary, duration_ms),
                    )
                    .await
                {
                    warn!(err = %e, "result ledger write failed after execution");
                }
                self.feedback.record(tool.name(), true);
                Ok(result)
            }
            Err(e) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                if let Err(le) = self
                    .ledger
                    .append(
                        &meta.session_key,
                        &entries::error(&proposal.id, &e.to_string(), duration_ms),
                    )
                    .await
                {
                    warn!(err = %le, "error ledger write failed");
                }
                self.feedback.record(tool.name(), false);
                Err(KernelError::Unavailable(e))
            }
        }
    }
}

fn truncate_summary(result: &Value) -> String {
    let full = match result {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    full.chars().take(280).collect()
}

// ─── Kernel wrap ──────────────────────────────────────────────────────────────

/// A tool adapter that routes every call through the dispatcher. Handing a
/// `GatedTool` back to `dispatch` trips the anti-double-wrap check.
pub struct GatedTool {
    inner: Arc<dyn Tool>,
    dispatcher: Arc<Dispatcher>,
    meta: DispatchMeta,
}

impl GatedTool {
    pub fn new(inner: Arc<dyn Tool>, dispatcher: Arc<Dispatcher>, meta: DispatchMeta) -> Self {
        GatedTool {
            inner,
            dispatcher,
            meta,
        }
    }
}

#[async_trait]
impl Tool for GatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kernel_wrapped(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        call_id: &str,
        args: Arc<Value>,
        signal: CancellationToken,
        on_update: UpdateFn,
    ) -> anyhow::Result<Value> {
        self.dispatcher
            .dispatch(
                self.inner.as_ref(),
                (*args).clone(),
                call_id,
                &self.meta,
                signal,
                on_update,
            )
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }
}
