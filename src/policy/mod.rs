//! `policy` — the decision core of the kernel.
//!
//! - **Document** — the signed policy model and its strict intersection.
//! - **Store** — load / verify / cache the active policy.
//! - **Normalize** — per-tool argument schemas and derived capability
//!   demands.
//! - **Gate** — the ordered allow/deny pipeline with integrity-stamped
//!   decisions.
//! - **Approval** — pending approvals, awaitable decisions, and one-shot
//!   bind-hashed tokens.
//! - **Proposal** — the immutable record of a tool-execution intent.

pub mod approval;
pub mod document;
pub mod gate;
pub mod normalize;
pub mod proposal;
pub mod store;

// ─── Top-level re-exports ─────────────────────────────────────────────────────

pub use document::{capability_matches, Policy, PolicyMode, RiskLevel, ToolRule};
pub use gate::{Decision, Gate, Verdict};
pub use proposal::{Proposal, Provenance};
pub use store::{ActivePolicy, PolicyStore, VerifyOptions};
