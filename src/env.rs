//! Environment variables for spawned processes
//!
//! Variables come from several layers, lowest priority first:
//!
//! 1. the env file of the active named environment
//! 2. the project config's block for that environment
//! 3. the supervisor's own process environment
//! 4. fixed overrides (`PYTHONUNBUFFERED`, `PORT`)
//!
//! The merged map is also used to substitute `$NAME` tokens in process arguments.

use crate::config::ProjectPaths;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

pub type EnvironmentMap = HashMap<String, String>;

/// Variable holding the port a routed process should bind
pub const PORT_VAR: &str = "PORT";

/// Forces Python children to flush output line by line
pub const UNBUFFERED_VAR: &str = "PYTHONUNBUFFERED";

fn key_value_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\w+)=(.*)$").expect("valid env line regex"))
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$([_A-Z0-9]+)").expect("valid env token regex"))
}

/// Parse `KEY=VALUE` lines. Lines that don't match are ignored.
pub fn parse_env(content: &str) -> EnvironmentMap {
    content
        .lines()
        .filter_map(|line| key_value_pattern().captures(line))
        .map(|c| (c[1].to_string(), c[2].trim().to_string()))
        .collect()
}

/// Read an env file. A missing or unreadable file gives an empty map.
pub fn read_env_file(path: &Path) -> EnvironmentMap {
    if !path.exists() {
        info!(path = %path.display(), "No env file found");
        return EnvironmentMap::new();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => parse_env(&content),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read env file");
            EnvironmentMap::new()
        }
    }
}

/// Variables from the env file of the active environment
pub fn resolve(paths: &ProjectPaths) -> EnvironmentMap {
    read_env_file(&paths.env_file())
}

/// Merge layers in order; later layers win on duplicate keys
pub fn merge<'a, I>(layers: I) -> EnvironmentMap
where
    I: IntoIterator<Item = &'a EnvironmentMap>,
{
    let mut merged = EnvironmentMap::new();
    for layer in layers {
        merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// Build the full environment for one process.
///
/// `PORT` is always set: to the allocated port for routed processes, otherwise
/// to whatever the supervisor was started with (or empty).
pub fn process_environment(
    file_env: &EnvironmentMap,
    config_env: &EnvironmentMap,
    os_env: &EnvironmentMap,
    port: Option<u16>,
) -> EnvironmentMap {
    let port_value = match port {
        Some(port) => port.to_string(),
        None => os_env.get(PORT_VAR).cloned().unwrap_or_default(),
    };

    let overrides = EnvironmentMap::from([
        (UNBUFFERED_VAR.to_string(), "true".to_string()),
        (PORT_VAR.to_string(), port_value),
    ]);

    merge([file_env, config_env, os_env, &overrides])
}

/// Current process environment (non-UTF-8 entries are dropped)
pub fn os_environment() -> EnvironmentMap {
    std::env::vars().collect()
}

/// Arguments after token substitution, plus any tokens that had no value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injected {
    pub args: Vec<String>,
    pub missing: Vec<String>,
}

/// Replace every `$UPPER_SNAKE` token in each argument with its value from `env`.
///
/// Unknown tokens are left in place so the process fails with its own error.
pub fn inject(args: &[String], env: &EnvironmentMap) -> Injected {
    let mut missing = Vec::new();

    let args = args
        .iter()
        .map(|arg| {
            token_pattern()
                .replace_all(arg, |caps: &Captures| match env.get(&caps[1]) {
                    Some(value) => value.clone(),
                    None => {
                        missing.push(caps[1].to_string());
                        caps[0].to_string()
                    }
                })
                .into_owned()
        })
        .collect();

    for name in &missing {
        if name == PORT_VAR {
            warn!(
                "No value for $PORT - add a route for this process to your config so a port is allocated"
            );
        } else {
            warn!(variable = %name, "No value for ${} in the environment", name);
        }
    }

    Injected { args, missing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn map(pairs: &[(&str, &str)]) -> EnvironmentMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_env_lines() {
        let env = parse_env("KEY=value\nOTHER=  spaced value  \nnot a var\n# COMMENT=1\nEMPTY=\n");

        assert_eq!(env.get("KEY").unwrap(), "value");
        assert_eq!(env.get("OTHER").unwrap(), "spaced value");
        assert_eq!(env.get("EMPTY").unwrap(), "");
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_parse_env_last_write_wins() {
        let env = parse_env("A=1\nA=2");
        assert_eq!(env.get("A").unwrap(), "2");
    }

    #[test]
    fn test_read_missing_env_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_env_file(&dir.path().join("env")).is_empty());
    }

    #[test]
    fn test_read_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env");
        fs::write(&path, "DATABASE_URL=postgres://localhost/app\n").unwrap();

        let env = read_env_file(&path);
        assert_eq!(env.get("DATABASE_URL").unwrap(), "postgres://localhost/app");
    }

    #[test]
    fn test_resolve_reads_active_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env_dir = dir.path().join("etc/environments/staging");
        fs::create_dir_all(&env_dir).unwrap();
        fs::write(env_dir.join("env"), "STAGE=yes\n").unwrap();

        let env = resolve(&ProjectPaths::new(dir.path(), "staging"));
        assert_eq!(env.get("STAGE").unwrap(), "yes");
        assert!(resolve(&ProjectPaths::new(dir.path(), "development")).is_empty());
    }

    #[test]
    fn test_layer_priority() {
        let file_env = map(&[("A", "1")]);
        let config_env = map(&[("A", "2"), ("B", "3")]);
        let os_env = map(&[("A", "4")]);

        let merged = merge([&file_env, &config_env, &os_env]);
        assert_eq!(merged, map(&[("A", "4"), ("B", "3")]));
    }

    #[test]
    fn test_process_environment_overrides() {
        let file_env = map(&[("PYTHONUNBUFFERED", "false"), ("PORT", "1")]);
        let os_env = map(&[("PORT", "3000")]);

        let env = process_environment(&file_env, &EnvironmentMap::new(), &os_env, Some(9999));
        assert_eq!(env.get("PORT").unwrap(), "9999");
        assert_eq!(env.get("PYTHONUNBUFFERED").unwrap(), "true");

        let env = process_environment(&file_env, &EnvironmentMap::new(), &os_env, None);
        assert_eq!(env.get("PORT").unwrap(), "3000");

        let env = process_environment(&file_env, &EnvironmentMap::new(), &EnvironmentMap::new(), None);
        assert_eq!(env.get("PORT").unwrap(), "");
    }

    #[test]
    fn test_inject_replaces_known_and_keeps_missing() {
        let env = map(&[("PORT", "9999")]);
        let injected = inject(&strings(&["x", "0.0.0.0:$PORT", "$MISSING"]), &env);

        assert_eq!(injected.args, strings(&["x", "0.0.0.0:9999", "$MISSING"]));
        assert_eq!(injected.missing, strings(&["MISSING"]));
    }

    #[test]
    fn test_inject_every_occurrence() {
        let env = map(&[("HOST", "localhost"), ("PORT", "80")]);
        let injected = inject(&strings(&["$HOST:$PORT/$HOST"]), &env);

        assert_eq!(injected.args, strings(&["localhost:80/localhost"]));
        assert!(injected.missing.is_empty());
    }

    #[test]
    fn test_inject_ignores_lowercase_tokens() {
        let env = map(&[("home", "nope")]);
        let injected = inject(&strings(&["$home"]), &env);

        assert_eq!(injected.args, strings(&["$home"]));
        assert!(injected.missing.is_empty());
    }

    #[test]
    fn test_inject_missing_port() {
        let injected = inject(&strings(&["--port=$PORT"]), &EnvironmentMap::new());
        assert_eq!(injected.args, strings(&["--port=$PORT"]));
        assert_eq!(injected.missing, strings(&["PORT"]));
    }
}
