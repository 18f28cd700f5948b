//! Proposal normalizer — shape- and field-validates tool arguments.
//!
//! Normalization is total: the same tool, arguments, and policy always
//! produce the same outcome, and re-normalizing an already-normalized value
//! is a no-op. Reason tokens use the `invalid:*` namespace for shape errors
//! and `policy:*` for policy-driven rejections.

use serde_json::{Map, Value};

use crate::policy::document::Policy;
use crate::shell;

/// Result of a successful normalization: the cleaned arguments plus the
/// capability demands derived from them.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub args: Value,
    /// Dynamic capability demands (exec bins, fetch hosts, browser eval).
    pub demands: Vec<String>,
    /// Lowercased, dot-stripped hostname for fetch-allowlist checks.
    pub fetch_host: Option<String>,
}

/// Normalize `args` for `tool` under `policy`.
///
/// A non-empty reason list means the proposal must be denied with exactly
/// those reasons.
pub fn normalize(tool: &str, args: &Value, policy: &Policy) -> Result<Normalized, Vec<String>> {
    match tool {
        "exec" => normalize_exec(args, policy),
        "web_fetch" => normalize_web_fetch(args),
        "browser" => normalize_browser(args),
        // Unknown tools pass through unchanged.
        _ => Ok(Normalized {
            args: args.clone(),
            ..Default::default()
        }),
    }
}

fn as_object(args: &Value) -> Result<&Map<String, Value>, Vec<String>> {
    args.as_object()
        .ok_or_else(|| vec!["invalid:args:not_object".to_string()])
}

fn unknown_fields(map: &Map<String, Value>, accepted: &[&str]) -> Vec<String> {
    map.keys()
        .filter(|k| !accepted.contains(&k.as_str()))
        .map(|k| format!("invalid:args:unknown_field:{k}"))
        .collect()
}

// ─── exec ─────────────────────────────────────────────────────────────────────

const EXEC_FIELDS: &[&str] = &[
    "command", "workdir", "yieldMs", "background", "timeout", "pty", "host", "security", "ask",
    "node", "elevated", "env",
];

fn normalize_exec(args: &Value, policy: &Policy) -> Result<Normalized, Vec<String>> {
    let map = as_object(args)?;
    let mut reasons = unknown_fields(map, EXEC_FIELDS);

    let command = match map.get("command") {
        Some(Value::String(s)) if !s.is_empty() => {
            if s.contains('\0') || s.contains('\r') {
                reasons.push("invalid:args:command_control_chars".to_string());
                None
            } else {
                Some(s.as_str())
            }
        }
        Some(Value::String(_)) => {
            reasons.push("invalid:args:command_empty".to_string());
            None
        }
        Some(_) => {
            reasons.push("invalid:args:command_not_string".to_string());
            None
        }
        None => {
            reasons.push("invalid:args:command_missing".to_string());
            None
        }
    };

    if let Some(cmd) = command {
        if policy.block_exec_command_substitution && shell::has_command_substitution(cmd) {
            reasons.push("policy:exec_command_substitution_blocked".to_string());
        }
    }

    // Host pinning: anything but the sandbox is a forbidden escape hatch.
    let host = match map.get("host") {
        None => "sandbox".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            reasons.push("invalid:args:host_not_string".to_string());
            "sandbox".to_string()
        }
    };
    if host != "sandbox" {
        reasons.push(format!("policy:exec_host_forbidden:{host}"));
    }

    if map.get("elevated").and_then(Value::as_bool) == Some(true) {
        reasons.push("policy:exec_elevated_forbidden".to_string());
    }
    for forbidden in ["security", "ask", "node", "env"] {
        if map.contains_key(forbidden) {
            reasons.push(format!("policy:exec_{forbidden}_forbidden"));
        }
    }

    let mut demands = Vec::new();
    if let Some(cmd) = command {
        match shell::leading_token(cmd) {
            Some(token) => {
                let bin = shell::bin_name(&token);
                if !policy.exec_safe_bins.contains(&bin) {
                    reasons.push("policy:exec_bin_not_allowlisted".to_string());
                }
                demands.push(format!("proc:spawn:{bin}"));
            }
            None => reasons.push("invalid:args:command_unparseable".to_string()),
        }
    }

    if !reasons.is_empty() {
        return Err(reasons);
    }

    let mut out = map.clone();
    out.insert("host".to_string(), Value::String(host));
    Ok(Normalized {
        args: Value::Object(out),
        demands,
        fetch_host: None,
    })
}

// ─── web_fetch ────────────────────────────────────────────────────────────────

const FETCH_FIELDS: &[&str] = &["url", "extractMode", "maxChars"];

fn normalize_web_fetch(args: &Value) -> Result<Normalized, Vec<String>> {
    let map = as_object(args)?;
    let mut reasons = unknown_fields(map, FETCH_FIELDS);

    let mut fetch_host = None;
    match map.get("url").and_then(Value::as_str) {
        Some(raw) => match url::Url::parse(raw) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {
                match parsed.host_str() {
                    Some(host) => {
                        let host = host.trim_end_matches('.').to_ascii_lowercase();
                        fetch_host = Some(host);
                    }
                    None => reasons.push("invalid:args:url_no_host".to_string()),
                }
            }
            Ok(parsed) => {
                reasons.push(format!("invalid:args:url_scheme:{}", parsed.scheme()));
            }
            Err(_) => reasons.push("invalid:args:url_unparseable".to_string()),
        },
        None => reasons.push("invalid:args:url_missing".to_string()),
    }

    match map.get("extractMode") {
        None => {}
        Some(Value::String(mode)) if mode == "markdown" || mode == "text" => {}
        Some(_) => reasons.push("invalid:args:extract_mode".to_string()),
    }

    match map.get("maxChars") {
        None => {}
        Some(v) => match v.as_u64() {
            Some(n) if n >= 100 => {}
            _ => reasons.push("invalid:args:max_chars_below_minimum".to_string()),
        },
    }

    if !reasons.is_empty() {
        return Err(reasons);
    }

    let host = fetch_host.clone().expect("host present when no reasons");
    Ok(Normalized {
        args: Value::Object(map.clone()),
        demands: vec![format!("net:outbound:{host}")],
        fetch_host: Some(host),
    })
}

// ─── browser ──────────────────────────────────────────────────────────────────

/// Fields that carry a caller-provided function body inside a browser
/// request. Any of them present forces the unsafe-eval capability demand.
const BROWSER_BODY_FIELDS: &[&str] = &["fn", "function", "script", "pageFunction"];

fn normalize_browser(args: &Value) -> Result<Normalized, Vec<String>> {
    let map = as_object(args)?;
    let mut reasons = Vec::new();
    let mut demands = Vec::new();

    let request = map.get("request").and_then(Value::as_object);
    let has_body = request
        .map(|r| {
            BROWSER_BODY_FIELDS
                .iter()
                .any(|f| r.get(*f).map(Value::is_string).unwrap_or(false))
        })
        .unwrap_or(false);

    // `evaluate`/`wait` are the documented eval kinds; any request carrying
    // a caller-provided function body gets the same treatment.
    if has_body {
        let profile = map.get("profile").and_then(Value::as_str).unwrap_or_default();
        if profile == "chrome" {
            reasons.push("policy:browser_unsafe_eval_chrome_forbidden".to_string());
        } else {
            demands.push("browser:unsafe_eval".to_string());
        }
    }

    if !reasons.is_empty() {
        return Err(reasons);
    }

    // Remaining browser request kinds pass through untouched.
    Ok(Normalized {
        args: args.clone(),
        demands,
        fetch_host: None,
    })
}
