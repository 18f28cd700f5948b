//! Shell-aware command inspection.
//!
//! One parser serves both the proposal normalizer and the node-command
//! re-validation path, so a command that passes the gate cannot read
//! differently at forward time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Env keys that survive into a forwarded command when the arbitrary-env
/// override is off.
pub const SAFE_ENV_KEYS: &[&str] = &[
    "PATH", "HOME", "LANG", "LC_ALL", "TMPDIR", "TERM", "SHELL", "USER", "LOGNAME", "TZ",
    "COLORTERM", "FORCE_COLOR", "NO_COLOR", "NODE_ENV",
];

/// Split a command with shell quoting rules. `None` when the string has
/// unbalanced quoting or a trailing escape.
pub fn split(command: &str) -> Option<Vec<String>> {
    shlex::split(command)
}

/// The leading token of a command after shell-aware splitting.
pub fn leading_token(command: &str) -> Option<String> {
    split(command).and_then(|argv| argv.into_iter().next())
}

/// Binary name for capability demands: the basename of the leading token.
pub fn bin_name(token: &str) -> String {
    Path::new(token)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| token.to_string())
}

/// Whether the command contains `$(` or backtick substitution.
pub fn has_command_substitution(command: &str) -> bool {
    command.contains("$(") || command.contains('`')
}

/// Shell metacharacters that chain or redirect commands. Quoted occurrences
/// do not count; unbalanced quoting counts as abuse.
pub fn has_metacharacter_abuse(command: &str) -> bool {
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = command.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                // Escaped char is literal in double quotes and bare context.
                if chars.next().is_none() {
                    return true;
                }
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            ';' | '|' | '&' | '<' | '>' if !in_single && !in_double => return true,
            _ => {}
        }
    }
    in_single || in_double
}

/// Whether the argv invokes an interpreter with `-c` (inline script escape).
pub fn is_dash_c_invocation(argv: &[String]) -> bool {
    argv.iter().skip(1).any(|a| a == "-c")
}

/// Filter an env map down to the safe allowlist. Returns the offending keys
/// when something outside the allowlist is present.
pub fn check_env_allowlist(env: &BTreeMap<String, String>) -> Result<(), Vec<String>> {
    let bad: Vec<String> = env
        .keys()
        .filter(|k| !SAFE_ENV_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    if bad.is_empty() {
        Ok(())
    } else {
        Err(bad)
    }
}

/// Containment check: `cwd` must resolve (symlinks included) to an existing
/// directory inside `workspace_root`.
pub fn contain_cwd(workspace_root: &Path, cwd: &Path) -> Result<PathBuf, String> {
    let root = workspace_root
        .canonicalize()
        .map_err(|e| format!("workspace root unresolvable: {e}"))?;
    let resolved = cwd
        .canonicalize()
        .map_err(|_| format!("cwd does not exist: {}", cwd.display()))?;
    if !resolved.is_dir() {
        return Err(format!("cwd is not a directory: {}", resolved.display()));
    }
    if !resolved.starts_with(&root) {
        return Err(format!(
            "cwd {} escapes workspace root {}",
            resolved.display(),
            root.display()
        ));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_token_respects_quoting() {
        assert_eq!(leading_token("git status"), Some("git".into()));
        assert_eq!(leading_token("'/usr/bin/rg' -n foo"), Some("/usr/bin/rg".into()));
        assert_eq!(leading_token(""), None);
        assert_eq!(leading_token("\"unterminated"), None);
    }

    #[test]
    fn bin_name_strips_directories() {
        assert_eq!(bin_name("/usr/bin/git"), "git");
        assert_eq!(bin_name("rg"), "rg");
    }

    #[test]
    fn command_substitution_detected() {
        assert!(has_command_substitution("echo $(whoami)"));
        assert!(has_command_substitution("echo `id`"));
        assert!(!has_command_substitution("echo hello"));
    }

    #[test]
    fn unquoted_metacharacters_flagged() {
        assert!(has_metacharacter_abuse("ls; rm -rf /"));
        assert!(has_metacharacter_abuse("cat a | sh"));
        assert!(has_metacharacter_abuse("echo x > /etc/passwd"));
        assert!(!has_metacharacter_abuse("git log"));
        assert!(!has_metacharacter_abuse("echo 'a;b'"));
    }

    #[test]
    fn dash_c_detected() {
        let argv: Vec<String> = ["sh", "-c", "id"].iter().map(|s| s.to_string()).collect();
        assert!(is_dash_c_invocation(&argv));
        let argv: Vec<String> = ["git", "commit", "-m", "x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!is_dash_c_invocation(&argv));
    }

    #[test]
    fn env_allowlist_names_offenders() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("LD_PRELOAD".to_string(), "evil.so".to_string());
        let bad = check_env_allowlist(&env).unwrap_err();
        assert_eq!(bad, vec!["LD_PRELOAD".to_string()]);
    }

    #[test]
    fn cwd_containment() {
        let root = tempfile::tempdir().unwrap();
        let inside = root.path().join("work");
        std::fs::create_dir(&inside).unwrap();
        assert!(contain_cwd(root.path(), &inside).is_ok());

        let other = tempfile::tempdir().unwrap();
        assert!(contain_cwd(root.path(), other.path()).is_err());
        assert!(contain_cwd(root.path(), &root.path().join("missing")).is_err());

        let file = root.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(contain_cwd(root.path(), &file).is_err());
    }
}
