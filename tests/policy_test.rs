//! Integration tests for the policy store and gate over wire-format
//! documents.
//!
//! Tests cover:
//! 1. Allowed read with capability grant
//! 2. Exec denied for an unlisted binary
//! 3. Exec host/elevation override attempts
//! 4. Fetch domain allowlist lifecycle
//! 5. Signed-policy loading, tamper refusal, and fail-closed dispatch
//! 6. Environment knobs cannot widen an installed policy

use std::sync::Arc;

use base64::Engine as _;
use ed25519_dalek::pkcs8::EncodePublicKey as _;
use ed25519_dalek::Signer as _;
use serde_json::json;

use wardend::feedback::FeedbackTracker;
use wardend::policy::{Gate, Policy, PolicyStore, Proposal, Verdict, VerifyOptions};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn gate() -> Gate {
    Gate::new(Arc::new(FeedbackTracker::new(false)))
}

fn parse_policy(doc: &str) -> Policy {
    serde_json::from_str(doc).expect("policy parses")
}

fn proposal(tool: &str, args: serde_json::Value) -> Proposal {
    Proposal::new("agent-1", "sess-1", tool, args)
}

// ─── Test 1: allowed read ─────────────────────────────────────────────────────

#[test]
fn allowed_read_grants_declared_capability() {
    let policy = parse_policy(
        r#"{
            "mode": "allowlist",
            "allowTools": ["read"],
            "grantedCapabilities": ["fs:read:workspace"],
            "toolRules": {"read": {"capabilitiesRequired": ["fs:read:workspace"]}}
        }"#,
    );
    let decision = gate().evaluate(&policy, &proposal("read", json!({"path": "README.md"})), true);
    assert_eq!(decision.verdict, Verdict::Allow);
    assert_eq!(decision.caps_granted, vec!["fs:read:workspace"]);
}

// ─── Test 2: exec denied for unknown binary ───────────────────────────────────

#[test]
fn exec_denied_for_unlisted_binary() {
    let policy = parse_policy(
        r#"{
            "mode": "allowlist",
            "allowTools": ["exec"],
            "execSafeBins": ["git", "rg"],
            "grantedCapabilities": ["proc:spawn:git", "proc:spawn:rg"]
        }"#,
    );
    let decision = gate().evaluate(&policy, &proposal("exec", json!({"command": "python -V"})), true);
    assert_eq!(decision.verdict, Verdict::Deny);
    assert_eq!(decision.reasons, vec!["policy:exec_bin_not_allowlisted"]);
}

// ─── Test 3: host override attempt ────────────────────────────────────────────

#[test]
fn exec_host_and_elevation_overrides_both_reported() {
    let policy = parse_policy(
        r#"{
            "mode": "allowlist",
            "allowTools": ["exec"],
            "execSafeBins": ["ls"],
            "grantedCapabilities": ["proc:spawn:ls"]
        }"#,
    );
    let decision = gate().evaluate(
        &policy,
        &proposal("exec", json!({"command": "ls", "host": "gateway", "elevated": true})),
        true,
    );
    assert_eq!(decision.verdict, Verdict::Deny);
    assert!(decision
        .reasons
        .contains(&"policy:exec_host_forbidden:gateway".to_string()));
    assert!(decision
        .reasons
        .contains(&"policy:exec_elevated_forbidden".to_string()));
}

// ─── Test 4: fetch allowed only after domain addition ─────────────────────────

#[test]
fn fetch_lifecycle_empty_then_allowlisted() {
    let g = gate();
    let before = parse_policy(
        r#"{
            "mode": "allowlist",
            "allowTools": ["web_fetch"],
            "enforceFetchDomainAllowlist": true
        }"#,
    );
    let args = json!({"url": "https://docs.example.com/x"});
    let decision = g.evaluate(&before, &proposal("web_fetch", args.clone()), true);
    assert_eq!(decision.reasons, vec!["policy:net_domain_allowlist_empty"]);

    let after = parse_policy(
        r#"{
            "mode": "allowlist",
            "allowTools": ["web_fetch"],
            "enforceFetchDomainAllowlist": true,
            "fetchAllowedDomains": ["docs.example.com"],
            "grantedCapabilities": ["net:outbound", "net:outbound:*"]
        }"#,
    );
    let decision = g.evaluate(&after, &proposal("web_fetch", args), true);
    assert_eq!(decision.verdict, Verdict::Allow);
    assert!(decision
        .caps_granted
        .contains(&"net:outbound:docs.example.com".to_string()));
}

// ─── Test 5: signed policies ──────────────────────────────────────────────────

#[test]
fn signed_policy_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let body = r#"{"mode":"allowlist","allowTools":["read"]}"#;
    let path = dir.path().join("policy.json");
    std::fs::write(&path, body).unwrap();

    let signing = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
    let pem = signing
        .verifying_key()
        .to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
        .unwrap();
    std::fs::write(
        dir.path().join("policy.json.sig"),
        base64::engine::general_purpose::STANDARD.encode(signing.sign(body.as_bytes()).to_bytes()),
    )
    .unwrap();

    let store = PolicyStore::new(VerifyOptions {
        verify: true,
        require_signed: true,
        public_key_pem: Some(pem),
    });

    // Before any load: dispatch fails closed.
    assert!(store.active_for_dispatch().is_err());

    let active = store.load(&path).unwrap();
    assert!(active.signed);
    assert!(store.active_for_dispatch().is_ok());

    // A tampered reload refuses to install and keeps the signed policy.
    std::fs::write(&path, r#"{"mode":"allow_all"}"#).unwrap();
    assert!(store.load(&path).is_err());
    let still = store.active_for_dispatch().unwrap();
    assert_eq!(still.sha256, active.sha256);
    assert!(still.policy.allow_tools.contains("read"));
}

// ─── Test 6: no ambient widening ──────────────────────────────────────────────

#[test]
fn unsigned_install_never_satisfies_signed_mode() {
    // Even with a policy present in memory, signed-policy mode refuses
    // anything that did not pass verification — there is no env combination
    // that widens this.
    let store = PolicyStore::new(VerifyOptions {
        verify: false,
        require_signed: true,
        public_key_pem: None,
    });
    let mut policy = Policy::default();
    policy.allow_tools.insert("read".into());
    store.install_unsigned(policy);
    assert!(store.active_for_dispatch().is_err());
}
