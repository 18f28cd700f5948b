//! Policy gate — the deterministic allow/deny verdict over a proposal.
//!
//! Checks run in a fixed order and short-circuit on the first denial. Every
//! decision carries an integrity stamp minted from a per-gate random nonce;
//! the dispatcher refuses any decision whose stamp does not verify, so a
//! forged or mutated decision can never unlock execution.

use std::sync::Arc;

use rand_core::{OsRng, RngCore};
use serde_json::Value;

use crate::canonical::canonical_len;
use crate::feedback::FeedbackTracker;
use crate::policy::document::{Policy, RiskLevel};
use crate::policy::normalize;
use crate::policy::proposal::Proposal;

// ─── Decision ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    RequireSandboxOnly,
    RequireHuman,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::RequireSandboxOnly => "require_sandbox_only",
            Verdict::RequireHuman => "require_human",
        }
    }
}

/// The gate's verdict over one proposal.
///
/// Deliberately not serializable: a decision is only meaningful inside the
/// process that produced it, stamp and all.
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: Verdict,
    pub reasons: Vec<String>,
    pub risk: RiskLevel,
    /// Present only on `Allow`.
    pub normalized_args: Option<Arc<Value>>,
    pub caps_granted: Vec<String>,
    stamp: u128,
}

// ─── Gate ─────────────────────────────────────────────────────────────────────

pub struct Gate {
    secret: u128,
    feedback: Arc<FeedbackTracker>,
}

impl Gate {
    pub fn new(feedback: Arc<FeedbackTracker>) -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Gate {
            secret: u128::from_le_bytes(bytes),
            feedback,
        }
    }

    /// True iff `decision` was produced by this gate instance.
    pub fn verify_stamp(&self, decision: &Decision) -> bool {
        decision.stamp == self.secret
    }

    fn stamped(&self, decision: DecisionParts) -> Decision {
        Decision {
            verdict: decision.verdict,
            reasons: decision.reasons,
            risk: decision.risk,
            normalized_args: decision.normalized_args,
            caps_granted: decision.caps_granted,
            stamp: self.secret,
        }
    }

    fn deny(&self, risk: RiskLevel, reasons: Vec<String>) -> Decision {
        self.stamped(DecisionParts {
            verdict: Verdict::Deny,
            reasons,
            risk,
            normalized_args: None,
            caps_granted: Vec::new(),
        })
    }

    /// Evaluate `proposal` against `policy`.
    pub fn evaluate(&self, policy: &Policy, proposal: &Proposal, sandboxed: bool) -> Decision {
        let tool = proposal.tool_name.as_str();

        // 1. Normalize. Shape failures carry their own reasons.
        let normalized = match normalize::normalize(tool, &proposal.args, policy) {
            Ok(n) => n,
            Err(reasons) => return self.deny(base_risk(policy, proposal), reasons),
        };

        // 2. Resolve risk, possibly escalated by recent error feedback.
        let risk = self.feedback.adjusted_risk(tool, base_risk(policy, proposal));

        // 3–4. Tool deny / allowlist.
        if policy.deny_tools.contains(tool) {
            return self.deny(risk, vec!["policy:tool_denied".to_string()]);
        }
        if !policy.tool_allowed(tool) {
            return self.deny(risk, vec!["policy:tool_not_allowlisted".to_string()]);
        }

        // 5. Canonical argument size cap.
        let size = canonical_len(&normalized.args) as u64;
        if size > policy.effective_max_args_bytes(tool) {
            return self.deny(risk, vec!["policy:args_too_large".to_string()]);
        }

        // 6. Sandbox rerouting — not a denial.
        let rule = policy.tool_rules.get(tool);
        if rule.map(|r| r.require_sandbox).unwrap_or(false) && !sandboxed {
            return self.stamped(DecisionParts {
                verdict: Verdict::RequireSandboxOnly,
                reasons: vec!["policy:sandbox_required".to_string()],
                risk,
                normalized_args: None,
                caps_granted: Vec::new(),
            });
        }

        // 7. Dynamic demands derived from the normalized arguments.
        if let Some(host) = &normalized.fetch_host {
            if policy.enforce_fetch_domain_allowlist {
                if policy.fetch_allowed_domains.is_empty() {
                    return self.deny(risk, vec!["policy:net_domain_allowlist_empty".to_string()]);
                }
                if !policy.fetch_domain_allowed(host) {
                    return self
                        .deny(risk, vec![format!("policy:net_domain_not_allowlisted:{host}")]);
                }
            }
        }

        // 8. Union explicit demands with dynamic ones, dedup by trim.
        let mut demands: Vec<String> = Vec::new();
        let explicit = proposal
            .capabilities_required
            .iter()
            .chain(rule.iter().flat_map(|r| r.capabilities_required.iter()));
        for cap in explicit.chain(normalized.demands.iter()) {
            let cap = cap.trim();
            if !cap.is_empty() && !demands.iter().any(|d| d == cap) {
                demands.push(cap.to_string());
            }
        }

        // 9. Every demand must be granted.
        let missing: Vec<String> = demands
            .iter()
            .filter(|d| !policy.capability_granted(d))
            .map(|d| format!("capability_missing:{d}"))
            .collect();
        if !missing.is_empty() {
            return self.deny(risk, missing);
        }

        // 10. Allow.
        self.stamped(DecisionParts {
            verdict: Verdict::Allow,
            reasons: Vec::new(),
            risk,
            normalized_args: Some(Arc::new(normalized.args)),
            caps_granted: demands,
        })
    }
}

/// Declared risk → tool-rule risk → name heuristic.
fn base_risk(policy: &Policy, proposal: &Proposal) -> RiskLevel {
    proposal
        .risk
        .or_else(|| {
            policy
                .tool_rules
                .get(&proposal.tool_name)
                .and_then(|r| r.risk)
        })
        .unwrap_or_else(|| RiskLevel::heuristic(&proposal.tool_name))
}

struct DecisionParts {
    verdict: Verdict,
    reasons: Vec<String>,
    risk: RiskLevel,
    normalized_args: Option<Arc<Value>>,
    caps_granted: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::document::{PolicyMode, ToolRule};
    use serde_json::json;

    fn gate() -> Gate {
        Gate::new(Arc::new(FeedbackTracker::new(true)))
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

    fn proposal(tool: &str, args: Value) -> Proposal {
        Proposal::new("agent", "sess-1", tool, args)
    }

    #[test]
    fn allowed_read_grants_capability() {
        let g = gate();
        let d = g.evaluate(&read_policy(), &proposal("read", json!({"path": "README.md"})), true);
        assert_eq!(d.verdict, Verdict::Allow);
        assert_eq!(d.caps_granted, vec!["fs:read:workspace"]);
        assert!(d.normalized_args.is_some());
        assert!(g.verify_stamp(&d));
    }

    #[test]
    fn stamp_does_not_transfer_between_gates() {
        let g1 = gate();
        let g2 = gate();
        let d = g1.evaluate(&read_policy(), &proposal("read", json!({})), true);
        assert!(g1.verify_stamp(&d));
        assert!(!g2.verify_stamp(&d));
    }

    #[test]
    fn deny_tools_overrides_allowlist() {
        let mut p = read_policy();
        p.deny_tools.insert("read".into());
        let d = gate().evaluate(&p, &proposal("read", json!({})), true);
        assert_eq!(d.verdict, Verdict::Deny);
        assert_eq!(d.reasons, vec!["policy:tool_denied"]);
    }

    #[test]
    fn allowlist_mode_blocks_unknown_tool() {
        let d = gate().evaluate(&read_policy(), &proposal("write", json!({})), true);
        assert_eq!(d.verdict, Verdict::Deny);
        assert_eq!(d.reasons, vec!["policy:tool_not_allowlisted"]);
    }

    #[test]
    fn args_size_cap_is_exact_boundary() {
        let mut p = Policy::default();
        p.mode = PolicyMode::AllowAll;
        let args = json!({"k": "v"});
        let exact = canonical_len(&args) as u64;

        p.max_args_bytes = exact;
        let d = gate().evaluate(&p, &proposal("note", args.clone()), true);
        assert_eq!(d.verdict, Verdict::Allow, "boundary size must pass");

        p.max_args_bytes = exact - 1;
        let d = gate().evaluate(&p, &proposal("note", args), true);
        assert_eq!(d.reasons, vec!["policy:args_too_large"]);
    }

    #[test]
    fn sandbox_requirement_reroutes_instead_of_denying() {
        let mut p = read_policy();
        p.tool_rules.get_mut("read").unwrap().require_sandbox = true;
        let g = gate();
        let outside = g.evaluate(&p, &proposal("read", json!({})), false);
        assert_eq!(outside.verdict, Verdict::RequireSandboxOnly);
        let inside = g.evaluate(&p, &proposal("read", json!({})), true);
        assert_eq!(inside.verdict, Verdict::Allow);
    }

    #[test]
    fn exec_unknown_binary_denied() {
        let mut p = Policy::default();
        p.allow_tools.insert("exec".into());
        p.exec_safe_bins.extend(["git".to_string(), "rg".to_string()]);
        p.granted_capabilities
            .extend(["proc:spawn:git".to_string(), "proc:spawn:rg".to_string()]);
        let d = gate().evaluate(&p, &proposal("exec", json!({"command": "python -V"})), true);
        assert_eq!(d.verdict, Verdict::Deny);
        assert_eq!(d.reasons, vec!["policy:exec_bin_not_allowlisted"]);
    }

    #[test]
    fn exec_host_override_collects_both_reasons() {
        let mut p = Policy::default();
        p.allow_tools.insert("exec".into());
        p.exec_safe_bins.insert("ls".into());
        let d = gate().evaluate(
            &p,
            &proposal("exec", json!({"command": "ls", "host": "gateway", "elevated": true})),
            true,
        );
        assert_eq!(d.verdict, Verdict::Deny);
        assert!(d.reasons.contains(&"policy:exec_host_forbidden:gateway".to_string()));
        assert!(d.reasons.contains(&"policy:exec_elevated_forbidden".to_string()));
    }

    #[test]
    fn fetch_requires_domain_allowlist_then_allows() {
        let mut p = Policy::default();
        p.allow_tools.insert("web_fetch".into());
        p.enforce_fetch_domain_allowlist = true;
        let args = json!({"url": "https://docs.example.com/x"});

        let d = gate().evaluate(&p, &proposal("web_fetch", args.clone()), true);
        assert_eq!(d.reasons, vec!["policy:net_domain_allowlist_empty"]);

        p.fetch_allowed_domains.insert("other.example.com".into());
        let d = gate().evaluate(&p, &proposal("web_fetch", args.clone()), true);
        assert_eq!(
            d.reasons,
            vec!["policy:net_domain_not_allowlisted:docs.example.com"]
        );

        p.fetch_allowed_domains.insert("docs.example.com".into());
        p.granted_capabilities.insert("net:outbound:*".into());
        let d = gate().evaluate(&p, &proposal("web_fetch", args), true);
        assert_eq!(d.verdict, Verdict::Allow);
        assert!(d
            .caps_granted
            .contains(&"net:outbound:docs.example.com".to_string()));
    }

    #[test]
    fn missing_capabilities_all_reported() {
        let mut p = Policy::default();
        p.allow_tools.insert("read".into());
        p.tool_rules.insert(
            "read".into(),
            ToolRule {
                capabilities_required: vec!["fs:read:workspace".into(), "fs:read:home".into()],
                ..Default::default()
            },
        );
        let d = gate().evaluate(&p, &proposal("read", json!({})), true);
        assert_eq!(
            d.reasons,
            vec![
                "capability_missing:fs:read:workspace",
                "capability_missing:fs:read:home"
            ]
        );
    }

    #[test]
    fn demands_dedupe_by_trim() {
        let mut p = Policy::default();
        p.allow_tools.insert("read".into());
        p.granted_capabilities.insert("fs:read:workspace".into());
        let prop = proposal("read", json!({}))
            .with_capabilities(vec!["fs:read:workspace".into(), " fs:read:workspace ".into()]);
        let d = gate().evaluate(&p, &prop, true);
        assert_eq!(d.verdict, Verdict::Allow);
        assert_eq!(d.caps_granted, vec!["fs:read:workspace"]);
    }

    #[test]
    fn declared_risk_beats_rule_beats_heuristic() {
        let g = gate();
        let mut p = Policy::default();
        p.mode = PolicyMode::AllowAll;

        let d = g.evaluate(&p, &proposal("note", json!({})), true);
        assert_eq!(d.risk, RiskLevel::Low);

        p.tool_rules.insert(
            "note".into(),
            ToolRule {
                risk: Some(RiskLevel::Medium),
                ..Default::default()
            },
        );
        let d = g.evaluate(&p, &proposal("note", json!({})), true);
        assert_eq!(d.risk, RiskLevel::Medium);

        let d = g.evaluate(
            &p,
            &proposal("note", json!({})).with_declared_risk(Some(RiskLevel::High)),
            true,
        );
        assert_eq!(d.risk, RiskLevel::High);
    }

    #[test]
    fn adaptive_feedback_raises_risk() {
        let feedback = Arc::new(FeedbackTracker::new(true));
        for _ in 0..10 {
            feedback.record("note", false);
        }
        let g = Gate::new(feedback);
        let mut p = Policy::default();
        p.mode = PolicyMode::AllowAll;
        let d = g.evaluate(&p, &proposal("note", json!({})), true);
        assert_eq!(d.risk, RiskLevel::Medium);
    }
}
