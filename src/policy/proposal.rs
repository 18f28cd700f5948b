//! Action proposals — immutable records of tool-execution intent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::policy::document::RiskLevel;

/// Where a proposal came from. Attached to ledger entries for replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_hash: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub context_refs: Vec<String>,
}

/// One tool-execution intent. Produced fresh for every attempt and never
/// mutated after construction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub timestamp_ms: i64,
    pub actor: String,
    pub session_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub tool_name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities_required: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Proposal {
    pub fn new(
        actor: impl Into<String>,
        session_key: impl Into<String>,
        tool_name: impl Into<String>,
        args: Value,
    ) -> Self {
        Proposal {
            id: Uuid::new_v4().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
            actor: actor.into(),
            session_key: session_key.into(),
            agent_id: None,
            tool_name: tool_name.into(),
            args,
            capabilities_required: Vec::new(),
            risk: None,
            provenance: None,
        }
    }

    pub fn with_agent(mut self, agent_id: Option<String>) -> Self {
        self.agent_id = agent_id;
        self
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities_required = caps;
        self
    }

    pub fn with_declared_risk(mut self, risk: Option<RiskLevel>) -> Self {
        self.risk = risk;
        self
    }

    pub fn with_provenance(mut self, provenance: Option<Provenance>) -> Self {
        self.provenance = provenance;
        self
    }
}
