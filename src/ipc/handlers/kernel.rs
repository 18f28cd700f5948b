//! `kernel.*` — liveness and status surfaces.

use crate::error::KernelError;
use crate::Kernel;
use serde_json::{json, Value};

/// `kernel.ping` — trivial liveness probe.
pub async fn ping(_params: Value, _ctx: &Kernel) -> Result<Value, KernelError> {
    Ok(json!({ "pong": true }))
}

/// `kernel.status` — uptime, active policy, limiter occupancy, pending
/// approvals.
pub async fn status(_params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let active = ctx.policy_store.active();
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": ctx.started_at.elapsed().as_secs(),
        "policy": active.as_ref().map(|a| json!({
            "sha256": a.sha256,
            "signed": a.signed,
            "loadedAt": a.loaded_at.to_rfc3339(),
        })),
        "pendingApprovals": ctx.approvals.pending_count(),
        "connectedNodes": ctx.nodes.len(),
        "availableDangerousSlots": ctx.limiter.available_dangerous_slots(),
        "trackedRateKeys": ctx.limiter.tracked_keys(),
    }))
}
