use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Port of the control channel between supervisor and router (localhost only)
pub const CONTROL_PORT: u16 = 5253;

/// Router HTTP port when `PORT` is not set
pub const DEFAULT_ROUTER_PORT: u16 = 8080;

/// Environment used when none is given on the command line
pub const DEFAULT_ENV: &str = "development";

/// Project-local executables, relative to the project root
pub const ENV_BIN: &str = "env/bin";

/// Per-environment procfile and env file live under here
pub const ENVIRONMENTS_DIR: &str = "etc/environments";

/// Name of the persisted config file in the user's home directory
pub const CONFIG_FILE_NAME: &str = "portside.json";

/// Router HTTP port: `PORT` from the environment, else the default
pub fn router_port() -> u16 {
    router_port_from(std::env::var("PORT").ok().as_deref())
}

pub fn router_port_from(value: Option<&str>) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(DEFAULT_ROUTER_PORT)
}

/// Location of the persisted config (`~/portside.json`)
pub fn config_path() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

/// Projects are keyed by the name of their root directory
pub fn project_name(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Persisted config: one entry per project
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct Config {
    pub projects: HashMap<String, ProjectConfig>,
}

/// Settings for a single project
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct ProjectConfig {
    /// Process name -> public hostname
    #[serde(default)]
    pub routes: HashMap<String, String>,

    /// Environment name -> variables
    #[serde(default)]
    pub env: HashMap<String, HashMap<String, String>>,
}

impl ProjectConfig {
    pub fn route_for(&self, process_name: &str) -> Option<&str> {
        self.routes.get(process_name).map(String::as_str)
    }

    pub fn env_for(&self, env_name: &str) -> HashMap<String, String> {
        self.env.get(env_name).cloned().unwrap_or_default()
    }
}

impl Config {
    /// Load the config file. A missing file is not an error and yields `None`;
    /// a file that exists but does not parse is.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        if content.trim().is_empty() {
            return Ok(Some(Config::default()));
        }

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| ConfigError::Invalid {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn project(&self, name: &str) -> ProjectConfig {
        self.projects.get(name).cloned().unwrap_or_default()
    }
}

/// Files belonging to one named environment of a project
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub env_name: String,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>, env_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            env_name: env_name.into(),
        }
    }

    fn environment_dir(&self) -> PathBuf {
        self.root.join(ENVIRONMENTS_DIR).join(&self.env_name)
    }

    pub fn procfile(&self) -> PathBuf {
        self.environment_dir().join("procfile")
    }

    pub fn env_file(&self) -> PathBuf {
        self.environment_dir().join("env")
    }

    pub fn env_bin(&self) -> PathBuf {
        self.root.join(ENV_BIN)
    }

    /// Read the procfile for this environment
    pub fn read_procfile(&self) -> Result<String, ConfigError> {
        let path = self.procfile();
        if !path.exists() {
            return Err(ConfigError::MissingProcfile(path));
        }
        std::fs::read_to_string(&path).map_err(|source| ConfigError::Read { path, source })
    }
}
