//! Execution budgets clamped onto forwarded node commands.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Hard cap on any node response payload.
pub const MAX_RESPONSE_BYTES: usize = 3 * MIB;

/// Limits applied to one forwarded execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecBudget {
    #[serde(serialize_with = "as_millis")]
    pub timeout: Duration,
    pub max_stdout: usize,
    pub max_stderr: usize,
    pub max_total: usize,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Budget for ordinary forwarded executions.
pub const DEFAULT_EXEC_BUDGET: ExecBudget = ExecBudget {
    timeout: Duration::from_secs(120),
    max_stdout: 2 * MIB,
    max_stderr: MIB,
    max_total: 3 * MIB,
};

/// Tighter budget for commands marked dangerous.
pub const DEFAULT_DANGEROUS_BUDGET: ExecBudget = ExecBudget {
    timeout: Duration::from_secs(60),
    max_stdout: 512 * KIB,
    max_stderr: 256 * KIB,
    max_total: 768 * KIB,
};

impl ExecBudget {
    /// Effective timeout: the user ask never exceeds the budget.
    pub fn clamp_timeout(&self, user_ms: Option<u64>) -> Duration {
        match user_ms {
            Some(ms) => Duration::from_millis(ms).min(self.timeout),
            None => self.timeout,
        }
    }

    /// Wire form injected into forwarded params.
    pub fn to_value(&self) -> Value {
        json!({
            "timeoutMs": self.timeout.as_millis() as u64,
            "maxStdout": self.max_stdout,
            "maxStderr": self.max_stderr,
            "maxTotal": self.max_total,
        })
    }
}
