//! Worker environment composition.
//!
//! Four variable sources merge into the environment handed to a worker,
//! lowest to highest precedence: role env file, auth-team env file, tag env
//! file, request body. Later layers overwrite earlier keys. Missing files
//! warn and contribute nothing; only the request layer is validated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Env var names the request layer may never set, compared uppercased.
const BANNED_KEYS: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "SHELL",
    "HOME",
    "USER",
    "SUDO_USER",
    "PWD",
    "OLDPWD",
];

/// Characters that disqualify a request-layer value.
const FORBIDDEN_VALUE_CHARS: &[char] = &['|', '&', ';', '(', ')', '<', '>', '`', '$', '\\'];

/// Maximum length of a request-layer value.
const MAX_VALUE_LEN: usize = 4096;

/// The four env sources, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct EnvSources {
    /// Directory containing `<role>.env` files; layer skipped when None
    pub role_env_root: Option<PathBuf>,

    /// Caller's role; layer skipped when empty
    pub user_role: String,

    /// Env file from the auth collaborator's user record
    pub auth_team_env_file: Option<PathBuf>,

    /// Env file named by the session's `env_file` tag
    pub tag_env_file: Option<PathBuf>,

    /// Request-body environment (validated)
    pub request_env: HashMap<String, String>,
}

/// Merge all sources into the final worker environment.
#[must_use]
pub fn compose(sources: &EnvSources) -> HashMap<String, String> {
    let mut merged = HashMap::new();

    if let Some(ref root) = sources.role_env_root {
        if !sources.user_role.is_empty() {
            let path = root.join(format!("{}.env", sources.user_role));
            merged.extend(load_layer(&path, "role"));
        }
    }

    if let Some(ref path) = sources.auth_team_env_file {
        merged.extend(load_layer(path, "auth-team"));
    }

    if let Some(ref path) = sources.tag_env_file {
        merged.extend(load_layer(path, "tag"));
    }

    for (key, value) in &sources.request_env {
        if accept_request_entry(key, value) {
            merged.insert(key.clone(), value.clone());
        }
    }

    merged
}

/// Load one env file layer; a missing or unreadable file warns and yields
/// nothing.
fn load_layer(path: &Path, layer: &str) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => parse_env_file(&contents),
        Err(e) => {
            tracing::warn!(
                layer,
                path = %path.display(),
                error = %e,
                "env file unavailable, skipping layer"
            );
            HashMap::new()
        }
    }
}

/// Parse `KEY=VALUE` lines. `#` comments and blank lines are ignored, as
/// are lines without `=`.
#[must_use]
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_owned(), value.trim().to_owned());
    }
    vars
}

/// Whether a request-layer entry is admissible; rejected entries warn.
fn accept_request_entry(key: &str, value: &str) -> bool {
    if !is_valid_key(key) {
        tracing::warn!(key, "dropping request env var with invalid key");
        return false;
    }
    if BANNED_KEYS.contains(&key.to_ascii_uppercase().as_str()) {
        tracing::warn!(key, "dropping request env var with reserved key");
        return false;
    }
    if value.len() > MAX_VALUE_LEN {
        tracing::warn!(key, len = value.len(), "dropping oversized request env var");
        return false;
    }
    if value.contains(FORBIDDEN_VALUE_CHARS) {
        tracing::warn!(key, "dropping request env var with shell metacharacters");
        return false;
    }
    true
}

/// `^[A-Za-z_][A-Za-z0-9_]*$`
fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_env(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_comments_and_blanks() {
        let vars = parse_env_file("# comment\n\nA=1\nB = two words \nnot-a-var\n");
        assert_eq!(vars.len(), 2);
        assert_eq!(vars["A"], "1");
        assert_eq!(vars["B"], "two words");
    }

    #[test]
    fn precedence_role_team_tag_request() {
        let dir = TempDir::new().unwrap();
        write_env(&dir, "dev.env", "A=1\nB=1\n");
        let team = write_env(&dir, "team-auth.env", "B=from-auth\n");
        let tag = write_env(&dir, "team.env", "B=2\nC=2\n");

        let mut request_env = HashMap::new();
        request_env.insert("C".to_owned(), "3".to_owned());
        request_env.insert("D".to_owned(), "3".to_owned());

        let merged = compose(&EnvSources {
            role_env_root: Some(dir.path().to_path_buf()),
            user_role: "dev".to_owned(),
            auth_team_env_file: Some(team),
            tag_env_file: Some(tag),
            request_env,
        });

        assert_eq!(merged["A"], "1");
        assert_eq!(merged["B"], "2");
        assert_eq!(merged["C"], "3");
        assert_eq!(merged["D"], "3");
    }

    #[test]
    fn missing_file_is_not_fatal() {
        let mut request_env = HashMap::new();
        request_env.insert("REQUEST_VAR".to_owned(), "v".to_owned());

        let merged = compose(&EnvSources {
            tag_env_file: Some(PathBuf::from("/definitely/missing.env")),
            request_env,
            ..Default::default()
        });

        assert_eq!(merged.len(), 1);
        assert_eq!(merged["REQUEST_VAR"], "v");
    }

    #[test]
    fn role_layer_skipped_without_role() {
        let dir = TempDir::new().unwrap();
        write_env(&dir, ".env", "A=1\n");
        let merged = compose(&EnvSources {
            role_env_root: Some(dir.path().to_path_buf()),
            user_role: String::new(),
            ..Default::default()
        });
        assert!(merged.is_empty());
    }

    #[test]
    fn rejects_banned_keys_case_insensitively() {
        let mut request_env = HashMap::new();
        request_env.insert("PATH".to_owned(), "/x".to_owned());
        request_env.insert("path".to_owned(), "/x".to_owned());
        request_env.insert("Ld_Preload".to_owned(), "evil.so".to_owned());
        request_env.insert("OK".to_owned(), "ok".to_owned());

        let merged = compose(&EnvSources {
            request_env,
            ..Default::default()
        });
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["OK"], "ok");
    }

    #[test]
    fn rejects_invalid_keys() {
        for key in ["1BAD", "BAD-KEY", "BAD KEY", "", "BAD.KEY"] {
            assert!(!is_valid_key(key), "{key:?} should be invalid");
        }
        for key in ["GOOD", "_private", "A1_b2"] {
            assert!(is_valid_key(key), "{key:?} should be valid");
        }
    }

    #[test]
    fn rejects_metacharacter_values() {
        for value in ["a|b", "a&b", "a;b", "a(b", "a)b", "a<b", "a>b", "a`b", "a$b", "a\\b"] {
            let mut request_env = HashMap::new();
            request_env.insert("K".to_owned(), value.to_owned());
            let merged = compose(&EnvSources {
                request_env,
                ..Default::default()
            });
            assert!(merged.is_empty(), "{value:?} should be rejected");
        }
    }

    #[test]
    fn rejects_oversized_values() {
        let mut request_env = HashMap::new();
        request_env.insert("K".to_owned(), "x".repeat(MAX_VALUE_LEN + 1));
        request_env.insert("FITS".to_owned(), "x".repeat(MAX_VALUE_LEN));
        let merged = compose(&EnvSources {
            request_env,
            ..Default::default()
        });
        assert_eq!(merged.len(), 1);
        assert!(merged.contains_key("FITS"));
    }
}
