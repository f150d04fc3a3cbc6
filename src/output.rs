//! Labels and exit reporting for child process output

use crate::config::DEFAULT_ENV;
use crate::protocol::Color;
use colored::Colorize;
use std::process::ExitStatus;

const FAILURE_BANNER: &str = r"

 ███████╗ █████╗ ██╗██╗     ███████╗██████╗
 ██╔════╝██╔══██╗██║██║     ██╔════╝██╔══██╗
 █████╗  ███████║██║██║     █████╗  ██║  ██║
 ██╔══╝  ██╔══██║██║██║     ██╔══╝  ██║  ██║
 ██║     ██║  ██║██║███████╗███████╗██████╔╝
 ╚═╝     ╚═╝  ╚═╝╚═╝╚══════╝╚══════╝╚═════╝

";

const TABLE_FLIP: &str = "(╯°□°)╯︵ ┻━┻";

/// `name` in the default environment, `env:name` otherwise
pub fn display_name(name: &str, env_name: &str) -> String {
    if env_name == DEFAULT_ENV {
        name.to_string()
    } else {
        format!("{}:{}", env_name, name)
    }
}

/// `[ name ] ` with the name padded to `width` characters
pub fn wrap_display_name(name: &str, width: usize) -> String {
    format!("[ {:<width$} ] ", name, width = width)
}

/// Widest display name among `names`
pub fn label_width<'a, I: IntoIterator<Item = &'a str>>(names: I) -> usize {
    names
        .into_iter()
        .map(|n| n.chars().count())
        .max()
        .unwrap_or(0)
}

/// Local wall-clock time as `HH:MM:SS.cc`
pub fn time_now() -> String {
    let now = chrono::Local::now();
    format!(
        "{}.{:02}",
        now.format("%H:%M:%S"),
        now.timestamp_subsec_millis() / 10
    )
}

/// Builds the colored prefix for each output line of one process
#[derive(Debug, Clone)]
pub struct Labeler {
    display_name: String,
    width: usize,
    color: Color,
    timestamps: bool,
}

impl Labeler {
    pub fn new(display_name: String, width: usize, color: Color, timestamps: bool) -> Self {
        Self {
            display_name,
            width,
            color,
            timestamps,
        }
    }

    pub fn prefix(&self) -> String {
        let label = if self.timestamps {
            let time = format!("{} ", time_now());
            let width = self.width + time.chars().count();
            wrap_display_name(&format!("{}{}", time, self.display_name), width)
        } else {
            wrap_display_name(&self.display_name, self.width)
        };
        self.color.paint(&label).to_string()
    }

    pub fn line(&self, text: &str) -> String {
        format!("{}{}", self.prefix(), text)
    }
}

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        matches!(self, ExitReport::Code(0))
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitReport::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitReport::Signal(signal);
            }
        }
        ExitReport::Unknown
    }
}

/// The line printed when a process exits. Failures get the banner.
pub fn exit_message(prefix: &str, report: ExitReport) -> String {
    match report {
        ExitReport::Code(0) => format!("{}{}", prefix, "Process exited with code 0".green()),
        ExitReport::Code(code) => format!(
            "{}{}{} {}",
            FAILURE_BANNER.red(),
            prefix,
            format!("Process exited with code {}", code).red(),
            TABLE_FLIP
        ),
        ExitReport::Signal(signal) => format!(
            "{}{}",
            prefix,
            format!("Process killed by signal {}", signal).red()
        ),
        ExitReport::Unknown => format!("{}{}", prefix, "Process exited".red()),
    }
}
