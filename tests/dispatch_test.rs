//! Integration tests for the dispatch pipeline.
//!
//! Covers:
//! 1. Allowed tool → proposal / decision / result envelopes, chain intact
//! 2. Denied tool → result carries the denial reasons
//! 3. Kernel-wrapped tools are refused a second gating pass
//! 4. Tool errors land as `error` entries and feed the tracker
//! 5. Cancellation still writes the error entry
//! 6. Result summaries are omitted unless capture is opted in

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use wardend::config::{KernelConfig, KernelEnv};
use wardend::dispatch::{null_update, DispatchMeta, GatedTool, Tool, UpdateFn};
use wardend::error::{ErrorCode, KernelError};
use wardend::ledger::verify_chain;
use wardend::nodes::Exposure;
use wardend::policy::{Policy, PolicyMode, ToolRule};
use wardend::Kernel;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn kernel_with_policy(policy: Policy) -> (tempfile::TempDir, Arc<Kernel>) {
    let dir = tempfile::tempdir().unwrap();
    let config = KernelConfig::new(
        None,
        Some(dir.path().join("data")),
        None,
        Some(dir.path().to_path_buf()),
    );
    let kernel = Kernel::new(config, KernelEnv::default(), Exposure::Loopback, String::new());
    kernel.policy_store.install_unsigned(policy);
    (dir, kernel)
}

fn read_policy() -> Policy {
    let mut p = Policy::default();
    p.allow_tools.insert("read".into());
    p.granted_capabilities.insert("fs:read:workspace".into());
    p.tool_rules.insert(
        "read".into(),
        ToolRule {
            capabilities_required: vec!["fs:read:workspace".into()],
            ..Default::default()
        },
    );
    p
}

struct StaticTool {
    name: &'static str,
    response: Value,
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        _call_id: &str,
        _args: Arc<Value>,
        _signal: CancellationToken,
        _on_update: UpdateFn,
    ) -> anyhow::Result<Value> {
        Ok(self.response.clone())
    }
}

struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "read"
    }

    async fn execute(
        &self,
        _call_id: &str,
        _args: Arc<Value>,
        _signal: CancellationToken,
        _on_update: UpdateFn,
    ) -> anyhow::Result<Value> {
        anyhow::bail!("disk on fire")
    }
}

/// Completes only when cancelled.
struct BlockingTool;

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &str {
        "read"
    }

    async fn execute(
        &self,
        _call_id: &str,
        _args: Arc<Value>,
        signal: CancellationToken,
        _on_update: UpdateFn,
    ) -> anyhow::Result<Value> {
        signal.cancelled().await;
        anyhow::bail!("cancelled")
    }
}

// ─── Test 1: allowed read writes a clean three-envelope chain ─────────────────

#[tokio::test]
async fn allowed_read_writes_three_chained_envelopes() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let tool = StaticTool {
        name: "read",
        response: json!({"content": "hello"}),
    };
    let meta = DispatchMeta::new("agent-1", "sess-1");

    let out = kernel
        .dispatcher
        .dispatch(
            &tool,
            json!({"path": "README.md"}),
            "call-1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .expect("dispatch allowed");
    assert_eq!(out["content"], "hello");

    let envelopes = kernel.ledger.read_all("sess-1").await.unwrap();
    assert_eq!(envelopes.len(), 3);
    verify_chain(&envelopes).expect("chain intact");

    assert_eq!(envelopes[0].payload["type"], "proposal");
    assert_eq!(envelopes[1].payload["type"], "decision");
    assert_eq!(envelopes[1].payload["verdict"], "allow");
    assert_eq!(
        envelopes[1].payload["capsGranted"],
        json!(["fs:read:workspace"])
    );
    assert_eq!(envelopes[2].payload["type"], "result");
    assert_eq!(envelopes[2].payload["status"], "ok");

    // Same proposal id across all three.
    let id = envelopes[0].payload["proposalId"].as_str().unwrap();
    assert_eq!(envelopes[1].payload["proposalId"], id);
    assert_eq!(envelopes[2].payload["proposalId"], id);

    // Provenance pins the policy fingerprint.
    assert_eq!(
        envelopes[0].payload["proposal"]["provenance"]["policySha256"],
        json!(kernel.policy_store.sha256().unwrap())
    );
}

// ─── Test 2: denial records reasons in the result entry ───────────────────────

#[tokio::test]
async fn denied_tool_records_reasons() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let tool = StaticTool {
        name: "write",
        response: json!(null),
    };
    let meta = DispatchMeta::new("agent-1", "sess-1");

    let err = kernel
        .dispatcher
        .dispatch(
            &tool,
            json!({"path": "x"}),
            "call-1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .expect_err("must be denied");
    assert_eq!(err.code(), ErrorCode::NotAllowed);
    assert_eq!(err.reasons(), vec!["policy:tool_not_allowlisted"]);

    let envelopes = kernel.ledger.read_all("sess-1").await.unwrap();
    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[2].payload["status"], "error");
    assert_eq!(envelopes[2].payload["summary"], "policy:tool_not_allowlisted");

    // Denials never feed the feedback tracker.
    assert!(kernel.feedback.stats("write").is_none());
}

// ─── Test 3: anti-double-wrap ─────────────────────────────────────────────────

#[tokio::test]
async fn kernel_wrapped_tool_is_refused() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let meta = DispatchMeta::new("agent-1", "sess-1");

    let wrapped = GatedTool::new(
        Arc::new(StaticTool {
            name: "read",
            response: json!({}),
        }),
        Arc::clone(&kernel.dispatcher),
        meta.clone(),
    );

    let err = kernel
        .dispatcher
        .dispatch(
            &wrapped,
            json!({}),
            "call-1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .expect_err("double wrap must be refused");
    assert!(matches!(err, KernelError::Integrity(_)));

    // Refusal happens before anything is written.
    assert!(kernel.ledger.read_all("sess-1").await.unwrap().is_empty());
}

// ─── Test 4: tool failure writes an error entry ───────────────────────────────

#[tokio::test]
async fn tool_error_writes_error_entry_and_feeds_tracker() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let meta = DispatchMeta::new("agent-1", "sess-1");

    let err = kernel
        .dispatcher
        .dispatch(
            &FailingTool,
            json!({}),
            "call-1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .expect_err("tool failure propagates");
    assert_eq!(err.code(), ErrorCode::Unavailable);

    let envelopes = kernel.ledger.read_all("sess-1").await.unwrap();
    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[2].payload["type"], "error");
    assert!(envelopes[2].payload["message"]
        .as_str()
        .unwrap()
        .contains("disk on fire"));

    let stats = kernel.feedback.stats("read").unwrap();
    assert_eq!(stats.samples, 1);
    assert!(stats.error_rate > 0.0);
}

// ─── Test 5: cancellation is cooperative but always audited ───────────────────

#[tokio::test]
async fn cancellation_still_writes_error_entry() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let meta = DispatchMeta::new("agent-1", "sess-1");
    let signal = CancellationToken::new();

    let cancel = signal.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
    });

    let err = kernel
        .dispatcher
        .dispatch(&BlockingTool, json!({}), "call-1", &meta, signal, null_update())
        .await
        .expect_err("cancelled tool fails");
    assert_eq!(err.code(), ErrorCode::Unavailable);

    let envelopes = kernel.ledger.read_all("sess-1").await.unwrap();
    assert_eq!(envelopes[2].payload["type"], "error");
}

// ─── Test 6: result summaries are opt-in ──────────────────────────────────────

#[tokio::test]
async fn summary_is_omitted_unless_capture_enabled() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let tool = StaticTool {
        name: "read",
        response: json!("a very sensitive output"),
    };
    let meta = DispatchMeta::new("agent-1", "sess-1");
    kernel
        .dispatcher
        .dispatch(
            &tool,
            json!({}),
            "c1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .unwrap();
    let envelopes = kernel.ledger.read_all("sess-1").await.unwrap();
    assert_eq!(envelopes[2].payload["summary"], "omitted");

    // Same dispatch with capture opted in.
    let dir = tempfile::tempdir().unwrap();
    let config = KernelConfig::new(
        None,
        Some(dir.path().join("data")),
        None,
        Some(dir.path().to_path_buf()),
    );
    let env = KernelEnv {
        ledger_capture_output: true,
        ..Default::default()
    };
    let kernel = Kernel::new(config, env, Exposure::Loopback, String::new());
    kernel.policy_store.install_unsigned(read_policy());
    kernel
        .dispatcher
        .dispatch(
            &tool,
            json!({}),
            "c1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .unwrap();
    let envelopes = kernel.ledger.read_all("sess-1").await.unwrap();
    assert_eq!(envelopes[2].payload["summary"], "a very sensitive output");
}

// ─── Constraints can only narrow ──────────────────────────────────────────────

#[tokio::test]
async fn caller_constraints_never_widen_the_policy() {
    let (_dir, kernel) = kernel_with_policy(read_policy());
    let tool = StaticTool {
        name: "exec",
        response: json!(null),
    };

    // The caller asks for exec via constraints the installed policy never
    // granted; intersection must still deny.
    let mut wider = Policy::default();
    wider.mode = PolicyMode::AllowAll;
    wider.exec_safe_bins.insert("git".into());
    wider
        .granted_capabilities
        .insert("proc:spawn:git".into());

    let meta = DispatchMeta {
        constraints: Some(wider),
        ..DispatchMeta::new("agent-1", "sess-1")
    };
    let err = kernel
        .dispatcher
        .dispatch(
            &tool,
            json!({"command": "git status"}),
            "c1",
            &meta,
            CancellationToken::new(),
            null_update(),
        )
        .await
        .expect_err("constraints must not widen");
    assert_eq!(err.code(), ErrorCode::NotAllowed);
}
