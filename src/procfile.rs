//! Procfile parsing
//!
//! Each line has the form `name: command arg arg ...`. Arguments are split on
//! whitespace with no quoting. Lines that do not match (blank lines, comments,
//! names containing spaces) are skipped.

use regex::Regex;
use std::sync::OnceLock;

/// A single named process from a procfile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
}

/// Processes in the order they appear in the procfile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Procfile {
    entries: Vec<ProcessSpec>,
}

impl Procfile {
    pub fn get(&self, name: &str) -> Option<&ProcessSpec> {
        self.entries.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Later definitions of a name replace earlier ones but keep the original position
    fn insert(&mut self, spec: ProcessSpec) {
        match self.entries.iter_mut().find(|p| p.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.entries.push(spec),
        }
    }
}

fn line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^([A-Za-z0-9_-]+):\s*(.+)$").expect("valid procfile regex"))
}

/// Parse procfile text into an ordered set of processes
pub fn parse(data: &str) -> Procfile {
    let mut procfile = Procfile::default();

    for line in data.lines() {
        let Some(captures) = line_pattern().captures(line) else {
            continue;
        };

        let mut parts = captures[2].split_whitespace().map(String::from);
        let Some(command) = parts.next() else {
            continue;
        };

        procfile.insert(ProcessSpec {
            name: captures[1].to_string(),
            command,
            args: parts.collect(),
        });
    }

    procfile
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_entries_in_order() {
        let procfile = parse("web: http-server . -o\nwatch: watchify $PORT");

        let names: Vec<&str> = procfile.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["web", "watch"]);

        assert_eq!(
            procfile.get("web").unwrap(),
            &ProcessSpec {
                name: "web".to_string(),
                command: "http-server".to_string(),
                args: vec![".".to_string(), "-o".to_string()],
            }
        );
        assert_eq!(procfile.get("watch").unwrap().command, "watchify");
        assert_eq!(procfile.get("watch").unwrap().args, vec!["$PORT"]);
    }

    #[test]
    fn test_name_with_space_is_skipped() {
        let procfile = parse("invalid name: stuff");
        assert!(procfile.is_empty());
    }

    #[test]
    fn test_blank_lines_and_comments_are_skipped() {
        let procfile = parse("\n# comment here\n\nweb: ./manage.py runserver 0.0.0.0:$PORT\n\n");
        assert_eq!(procfile.len(), 1);
        assert_eq!(procfile.get("web").unwrap().command, "./manage.py");
        assert_eq!(
            procfile.get("web").unwrap().args,
            vec!["runserver", "0.0.0.0:$PORT"]
        );
    }

    #[test]
    fn test_names_allow_dashes_and_underscores() {
        let procfile = parse("web-1: a\nworker_2: b");
        assert!(procfile.contains("web-1"));
        assert!(procfile.contains("worker_2"));
    }

    #[test]
    fn test_collapses_repeated_whitespace() {
        let procfile = parse("web:\tnpm   run \t start  ");
        let web = procfile.get("web").unwrap();
        assert_eq!(web.command, "npm");
        assert_eq!(web.args, vec!["run", "start"]);
    }

    #[test]
    fn test_empty_command_is_skipped() {
        assert!(parse("web:    ").is_empty());
        assert!(parse("web:").is_empty());
    }

    #[test]
    fn test_duplicate_name_keeps_first_position() {
        let procfile = parse("web: one\nworker: two\nweb: three");
        let names: Vec<&str> = procfile.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["web", "worker"]);
        assert_eq!(procfile.get("web").unwrap().command, "three");
    }

    #[test]
    fn test_windows_line_endings() {
        let procfile = parse("web: serve\r\nworker: run\r\n");
        assert_eq!(procfile.get("web").unwrap().command, "serve");
        assert_eq!(procfile.get("worker").unwrap().args, Vec::<String>::new());
    }
}
