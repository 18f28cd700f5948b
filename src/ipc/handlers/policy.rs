//! `policy.*` — reload and inspection.

use crate::error::KernelError;
use crate::Kernel;
use serde_json::{json, Value};
use std::path::PathBuf;

/// `policy.reload` — re-read the policy from disk.
///
/// Params: `{ "path"?: string }` — defaults to the configured policy path.
/// A failed reload leaves the previous policy active and reports why.
pub async fn reload(params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    let param_path = params
        .get("path")
        .and_then(Value::as_str)
        .map(PathBuf::from);
    let path = param_path.or_else(|| ctx.env.policy_path.clone());

    match ctx.policy_store.load_configured(path.as_deref()) {
        Ok(active) => Ok(json!({
            "ok": true,
            "sha256": active.sha256,
            "signed": active.signed,
        })),
        Err(e) => Err(KernelError::Invalid {
            reasons: vec![e.token().to_string()],
        }),
    }
}

/// `policy.current` — fingerprint of the active policy.
pub async fn current(_params: Value, ctx: &Kernel) -> Result<Value, KernelError> {
    match ctx.policy_store.active() {
        Some(active) => Ok(json!({
            "sha256": active.sha256,
            "signed": active.signed,
            "loadedAt": active.loaded_at.to_rfc3339(),
            "source": active.source.as_ref().map(|p| p.display().to_string()),
        })),
        None => Ok(json!({ "sha256": null })),
    }
}
