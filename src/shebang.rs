//! Interpreter resolution for project scripts
//!
//! A script such as `./manage.py` starting with `#!/usr/bin/env python` runs
//! under `env/bin/python` when the project has one, so a project-local runtime
//! takes precedence over the system interpreter.

use crate::config::ProjectPaths;
use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

fn shebang_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^#!\s*(?:\S*/env\s+)?(\S+)").expect("valid shebang regex")
    })
}

/// Interpreter named by a shebang line, if the line is one
pub fn parse_shebang(line: &str) -> Option<String> {
    shebang_pattern()
        .captures(line.trim_end())
        .map(|c| c[1].to_string())
}

fn first_line(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut buf = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut buf).ok()?;
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// Resolve how `command` should be invoked from the project root.
///
/// Returns either the command itself, a path into the project's executable
/// directory, or `"<interpreter> <command>"` when the script's shebang applies.
pub fn resolve(paths: &ProjectPaths, command: &str) -> String {
    let script = paths.root.join(command);
    let env_bin = paths.env_bin();

    if !script.is_file() {
        let local = env_bin.join(command);
        if local.is_file() {
            return local.to_string_lossy().into_owned();
        }
        return command.to_string();
    }

    let Some(interpreter) = first_line(&script).and_then(|line| parse_shebang(&line)) else {
        return command.to_string();
    };

    let interpreter_name = Path::new(&interpreter)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| interpreter.clone());

    let local_interpreter = env_bin.join(&interpreter_name);
    if local_interpreter.is_file() {
        debug!(command, interpreter = %local_interpreter.display(), "Using project-local interpreter");
        return format!("{} {}", local_interpreter.display(), command);
    }

    format!("{} {}", interpreter, command)
}
