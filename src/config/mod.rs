use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_PORT: u16 = 4800;
const DEFAULT_GLOBAL_SLOTS: usize = 8;
const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 120;

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// WebSocket server port (default: 4800).
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,wardend=trace".
    log: Option<String>,
    /// Workspace root that contains `.warden/` and bounds node cwd checks.
    workspace_dir: Option<PathBuf>,
    /// Global concurrent dangerous slots (default: 8).
    dangerous_slots: Option<usize>,
    /// Default approval wait, in seconds (default: 120).
    approval_timeout_secs: Option<u64>,
    /// Enable adaptive risk escalation from tool outcome feedback.
    adaptive_risk: Option<bool>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── KernelConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Workspace root; the ledger lives at `<workspace>/.warden/`.
    pub workspace_dir: PathBuf,
    pub dangerous_slots: usize,
    pub approval_timeout: Duration,
    pub adaptive_risk: bool,
}

impl KernelConfig {
    /// Build config from CLI/env args + optional TOML file.
    ///
    /// Priority (highest to lowest):
    ///   1. CLI / env — passed as `Some(value)` from clap
    ///   2. TOML file at `{data_dir}/config.toml`
    ///   3. Built-in defaults
    pub fn new(
        port: Option<u16>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
        workspace_dir: Option<PathBuf>,
    ) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let workspace_dir = workspace_dir
            .or(toml.workspace_dir)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let dangerous_slots = toml.dangerous_slots.unwrap_or(DEFAULT_GLOBAL_SLOTS);
        let approval_timeout = Duration::from_secs(
            toml.approval_timeout_secs
                .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS),
        );
        let adaptive_risk = toml.adaptive_risk.unwrap_or(true);

        KernelConfig {
            port,
            data_dir,
            log,
            workspace_dir,
            dangerous_slots,
            approval_timeout,
            adaptive_risk,
        }
    }

    /// Ledger root: `<workspace>/.warden/ledger`.
    pub fn ledger_dir(&self) -> PathBuf {
        self.workspace_dir.join(".warden").join("ledger")
    }

    /// Dangerous-operation ledger root: `<workspace>/.warden/dangerous`.
    pub fn dangerous_ledger_dir(&self) -> PathBuf {
        self.workspace_dir.join(".warden").join("dangerous")
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::new(None, Some(PathBuf::from(".")), None, None)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/share/wardend"))
        .unwrap_or_else(|| PathBuf::from(".wardend"))
}

// ─── Break-glass environment snapshot ─────────────────────────────────────────

/// The documented break-glass and verification env flags, captured once at
/// startup. When a policy file is installed, nothing here may widen it;
/// these flags act only at their specific call sites.
#[derive(Debug, Clone, Default)]
pub struct KernelEnv {
    /// `WARDEN_VERIFY_POLICY` — require signature verification on load.
    pub verify_policy: bool,
    /// `WARDEN_REQUIRE_SIGNED_POLICY` — dispatch fails closed without a
    /// signed policy.
    pub require_signed_policy: bool,
    /// `WARDEN_POLICY_PATH`.
    pub policy_path: Option<PathBuf>,
    /// `WARDEN_POLICY_PUBKEY` — PEM public key text.
    pub policy_pubkey: Option<String>,
    /// `WARDEN_SAFE_MODE` — dangerous node commands are disabled outright.
    pub safe_mode: bool,
    /// `WARDEN_ALLOW_DANGEROUS_EXPOSED` — permit dangerous commands on an
    /// unsafe exposure.
    pub allow_dangerous_exposed: bool,
    /// `WARDEN_ALLOW_ARBITRARY_ENV` — disable the exec env allowlist.
    pub allow_arbitrary_env: bool,
    /// `WARDEN_ALLOW_POLICY_MUTATION` — gate write APIs on the approvals
    /// table.
    pub allow_policy_mutation: bool,
    /// `WARDEN_ALLOW_BROWSER_PROXY`.
    pub allow_browser_proxy: bool,
    /// `WARDEN_ALLOW_NODE_EXEC`.
    pub allow_node_exec: bool,
    /// `WARDEN_LEDGER_CAPTURE_OUTPUT` — when off, result summaries are the
    /// literal `"omitted"`.
    pub ledger_capture_output: bool,
}

impl KernelEnv {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        KernelEnv {
            verify_policy: env_flag("WARDEN_VERIFY_POLICY"),
            require_signed_policy: env_flag("WARDEN_REQUIRE_SIGNED_POLICY"),
            policy_path: std::env::var_os("WARDEN_POLICY_PATH").map(PathBuf::from),
            policy_pubkey: std::env::var("WARDEN_POLICY_PUBKEY")
                .ok()
                .filter(|s| !s.is_empty()),
            safe_mode: env_flag("WARDEN_SAFE_MODE"),
            allow_dangerous_exposed: env_flag("WARDEN_ALLOW_DANGEROUS_EXPOSED"),
            allow_arbitrary_env: env_flag("WARDEN_ALLOW_ARBITRARY_ENV"),
            allow_policy_mutation: env_flag("WARDEN_ALLOW_POLICY_MUTATION"),
            allow_browser_proxy: env_flag("WARDEN_ALLOW_BROWSER_PROXY"),
            allow_node_exec: env_flag("WARDEN_ALLOW_NODE_EXEC"),
            ledger_capture_output: env_flag("WARDEN_LEDGER_CAPTURE_OUTPUT"),
        }
    }

    /// Whether the break-glass env var named by a command policy is set.
    pub fn break_glass_set(&self, var: &str) -> bool {
        match var {
            "WARDEN_ALLOW_BROWSER_PROXY" => self.allow_browser_proxy,
            "WARDEN_ALLOW_NODE_EXEC" => self.allow_node_exec,
            "WARDEN_ALLOW_DANGEROUS_EXPOSED" => self.allow_dangerous_exposed,
            _ => false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = KernelConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.log, "info");
        assert_eq!(cfg.dangerous_slots, DEFAULT_GLOBAL_SLOTS);
        assert!(cfg.adaptive_risk);
    }

    #[test]
    fn toml_layer_fills_gaps_but_cli_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "port = 5000\nlog = \"debug\"\ndangerous_slots = 2\n",
        )
        .unwrap();
        let cfg = KernelConfig::new(Some(6000), Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.log, "debug");
        assert_eq!(cfg.dangerous_slots, 2);
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "port = {").unwrap();
        let cfg = KernelConfig::new(None, Some(dir.path().to_path_buf()), None, None);
        assert_eq!(cfg.port, DEFAULT_PORT);
    }

    #[test]
    fn ledger_dirs_hang_off_workspace() {
        let cfg = KernelConfig::new(None, Some(PathBuf::from("/tmp/x")), None, Some(PathBuf::from("/ws")));
        assert_eq!(cfg.ledger_dir(), PathBuf::from("/ws/.warden/ledger"));
        assert_eq!(cfg.dangerous_ledger_dir(), PathBuf::from("/ws/.warden/dangerous"));
    }
}
