//! Policy document model — the signed JSON contract the gate enforces.
//!
//! A policy maps tool names to rules. The kernel never widens a policy at
//! runtime: `Policy::intersect` only flips booleans toward "stricter", takes
//! the minimum of numeric caps, and intersects every allow-set.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ARGS_BYTES: u64 = 64 * 1024;

// ─── Risk ─────────────────────────────────────────────────────────────────────

/// Risk classification for a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// One level up, saturating at `High`.
    pub fn escalate(self) -> RiskLevel {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium | RiskLevel::High => RiskLevel::High,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    /// Heuristic risk from the tool name alone, used when neither the
    /// proposal nor the tool rule declares one.
    pub fn heuristic(tool: &str) -> RiskLevel {
        let name = tool.to_ascii_lowercase();
        const HIGH: &[&str] = &[
            "exec", "bash", "process", "spawn", "fetch", "web", "browser", "http",
        ];
        const MEDIUM: &[&str] = &["write", "edit", "patch", "delete"];
        if HIGH.iter().any(|m| name.contains(m)) {
            RiskLevel::High
        } else if MEDIUM.iter().any(|m| name.contains(m)) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Whether the tool name implies intrinsic danger. Adaptive risk never
    /// relaxes such tools below medium.
    pub fn name_implies_danger(tool: &str) -> bool {
        let name = tool.to_ascii_lowercase();
        ["exec", "spawn", "bash", "process"]
            .iter()
            .any(|m| name.contains(m))
    }
}

// ─── Policy ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    AllowAll,
    #[default]
    Allowlist,
}

/// Per-tool override block (`toolRules` in the document).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolRule {
    pub risk: Option<RiskLevel>,
    pub max_args_bytes: Option<u64>,
    pub capabilities_required: Vec<String>,
    pub require_sandbox: bool,
}

impl ToolRule {
    /// Stricter merge of two rules for the same tool.
    fn intersect(&self, other: &ToolRule) -> ToolRule {
        ToolRule {
            risk: match (self.risk, other.risk) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
            max_args_bytes: match (self.max_args_bytes, other.max_args_bytes) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            capabilities_required: {
                let mut caps = self.capabilities_required.clone();
                for c in &other.capabilities_required {
                    if !caps.contains(c) {
                        caps.push(c.clone());
                    }
                }
                caps
            },
            require_sandbox: self.require_sandbox || other.require_sandbox,
        }
    }
}

/// The active policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Policy {
    pub mode: PolicyMode,
    pub allow_tools: BTreeSet<String>,
    pub deny_tools: BTreeSet<String>,
    pub granted_capabilities: BTreeSet<String>,
    pub exec_safe_bins: BTreeSet<String>,
    pub fetch_allowed_domains: BTreeSet<String>,
    pub fetch_allow_subdomains: bool,
    pub enforce_fetch_domain_allowlist: bool,
    pub block_exec_command_substitution: bool,
    pub max_args_bytes: u64,
    pub tool_rules: BTreeMap<String, ToolRule>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            mode: PolicyMode::Allowlist,
            allow_tools: BTreeSet::new(),
            deny_tools: BTreeSet::new(),
            granted_capabilities: BTreeSet::new(),
            exec_safe_bins: BTreeSet::new(),
            fetch_allowed_domains: BTreeSet::new(),
            fetch_allow_subdomains: false,
            enforce_fetch_domain_allowlist: false,
            block_exec_command_substitution: false,
            max_args_bytes: DEFAULT_MAX_ARGS_BYTES,
            tool_rules: BTreeMap::new(),
        }
    }
}

impl Policy {
    /// Is `tool` allowed by mode + allow/deny sets? Deny strictly overrides.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        if self.deny_tools.contains(tool) {
            return false;
        }
        match self.mode {
            PolicyMode::AllowAll => true,
            PolicyMode::Allowlist => self.allow_tools.contains(tool),
        }
    }

    /// Effective argument-size cap for `tool`: per-tool override wins when
    /// stricter, the document default otherwise.
    pub fn effective_max_args_bytes(&self, tool: &str) -> u64 {
        match self.tool_rules.get(tool).and_then(|r| r.max_args_bytes) {
            Some(per_tool) => per_tool.min(self.max_args_bytes),
            None => self.max_args_bytes,
        }
    }

    /// Whether any granted capability matches `demand`.
    pub fn capability_granted(&self, demand: &str) -> bool {
        self.granted_capabilities
            .iter()
            .any(|grant| capability_matches(grant, demand))
    }

    /// Whether `host` (lowercased, trailing-dot-stripped) is covered by the
    /// fetch domain allowlist.
    pub fn fetch_domain_allowed(&self, host: &str) -> bool {
        for entry in &self.fetch_allowed_domains {
            let entry = entry.to_ascii_lowercase();
            if let Some(suffix) = entry.strip_prefix("*.") {
                // `*.example.com` — any subdomain, not the apex itself.
                if host.len() > suffix.len() && host.ends_with(suffix) {
                    let boundary = host.len() - suffix.len();
                    if host.as_bytes()[boundary - 1] == b'.' {
                        return true;
                    }
                }
            } else if host == entry {
                return true;
            } else if self.fetch_allow_subdomains
                && host.len() > entry.len()
                && host.ends_with(&entry)
                && host.as_bytes()[host.len() - entry.len() - 1] == b'.'
            {
                return true;
            }
        }
        false
    }

    /// Strict intersection with `constraints`. The result is never wider than
    /// either input: sets intersect, permissive booleans AND, restrictive
    /// booleans OR, numeric caps take the minimum, risks escalate.
    pub fn intersect(&self, constraints: &Policy) -> Policy {
        let mut tool_rules = BTreeMap::new();
        for (tool, rule) in &self.tool_rules {
            match constraints.tool_rules.get(tool) {
                Some(other) => {
                    tool_rules.insert(tool.clone(), rule.intersect(other));
                }
                None => {
                    tool_rules.insert(tool.clone(), rule.clone());
                }
            }
        }
        for (tool, rule) in &constraints.tool_rules {
            tool_rules
                .entry(tool.clone())
                .or_insert_with(|| rule.clone());
        }

        Policy {
            // allow_all only if BOTH sides are allow_all.
            mode: if self.mode == PolicyMode::AllowAll && constraints.mode == PolicyMode::AllowAll {
                PolicyMode::AllowAll
            } else {
                PolicyMode::Allowlist
            },
            allow_tools: match (self.mode, constraints.mode) {
                // An allow_all side contributes no allowlist of its own.
                (PolicyMode::AllowAll, PolicyMode::AllowAll) => BTreeSet::new(),
                (PolicyMode::AllowAll, PolicyMode::Allowlist) => constraints.allow_tools.clone(),
                (PolicyMode::Allowlist, PolicyMode::AllowAll) => self.allow_tools.clone(),
                (PolicyMode::Allowlist, PolicyMode::Allowlist) => self
                    .allow_tools
                    .intersection(&constraints.allow_tools)
                    .cloned()
                    .collect(),
            },
            deny_tools: self.deny_tools.union(&constraints.deny_tools).cloned().collect(),
            granted_capabilities: self
                .granted_capabilities
                .intersection(&constraints.granted_capabilities)
                .cloned()
                .collect(),
            exec_safe_bins: self
                .exec_safe_bins
                .intersection(&constraints.exec_safe_bins)
                .cloned()
                .collect(),
            fetch_allowed_domains: self
                .fetch_allowed_domains
                .intersection(&constraints.fetch_allowed_domains)
                .cloned()
                .collect(),
            fetch_allow_subdomains: self.fetch_allow_subdomains
                && constraints.fetch_allow_subdomains,
            enforce_fetch_domain_allowlist: self.enforce_fetch_domain_allowlist
                || constraints.enforce_fetch_domain_allowlist,
            block_exec_command_substitution: self.block_exec_command_substitution
                || constraints.block_exec_command_substitution,
            max_args_bytes: self.max_args_bytes.min(constraints.max_args_bytes),
            tool_rules,
        }
    }
}

// ─── Capability matching ──────────────────────────────────────────────────────

/// Match a colon-delimited capability grant against a demand.
///
/// A `*` segment in the grant matches any remaining suffix of the demand
/// (at least one segment). Plain segments require exact token equality:
/// `proc:spawn:git` matches only `proc:spawn:git`; `net:outbound:*` matches
/// `net:outbound:docs.example.com` but not `net:outbound` itself.
pub fn capability_matches(grant: &str, demand: &str) -> bool {
    let grant = grant.trim();
    let demand = demand.trim();
    if grant.is_empty() || demand.is_empty() {
        return false;
    }

    let mut demand_segs = demand.split(':');
    for grant_seg in grant.split(':') {
        if grant_seg == "*" {
            // Wildcard tail — must cover at least one demand segment.
            return demand_segs.next().is_some();
        }
        match demand_segs.next() {
            Some(d) if d == grant_seg => continue,
            _ => return false,
        }
    }
    // Grant exhausted: exact match only if the demand is too.
    demand_segs.next().is_none()
}
