//! RPC method routing.
//!
//! Handlers share one signature: `(params, kernel) -> Result<Value,
//! KernelError>`. Everything protocol-level (framing, auth, rate limits)
//! lives in `ipc`; handlers only decode params and call into the kernel.

pub mod approval;
pub mod kernel;
pub mod ledger;
pub mod node;
pub mod policy;

use serde_json::Value;

use super::HandlerError;
use crate::Kernel;

pub(crate) async fn dispatch(
    method: &str,
    params: Value,
    ctx: &Kernel,
) -> Result<Value, HandlerError> {
    let result = match method {
        "kernel.ping" => kernel::ping(params, ctx).await,
        "kernel.status" => kernel::status(params, ctx).await,
        // ─── Policy ──────────────────────────────────────────────────────────
        "policy.reload" => policy::reload(params, ctx).await,
        "policy.current" => policy::current(params, ctx).await,
        // ─── Node enforcement front ──────────────────────────────────────────
        "node.invoke" => node::invoke(params, ctx).await,
        "node.list" => node::list(params, ctx).await,
        // ─── Approvals ───────────────────────────────────────────────────────
        "exec.approval.request" => approval::exec_request(params, ctx).await,
        "exec.approval.resolve" => approval::resolve(params, ctx).await,
        "capability.approval.request" => approval::capability_request(params, ctx).await,
        "approval.list" => approval::list(params, ctx).await,
        // ─── Ledger ──────────────────────────────────────────────────────────
        "ledger.verify" => ledger::verify(params, ctx).await,
        "ledger.tail" => ledger::tail(params, ctx).await,
        other => return Err(HandlerError::UnknownMethod(other.to_string())),
    };
    result.map_err(HandlerError::Kernel)
}
