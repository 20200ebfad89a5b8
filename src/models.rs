// src/models.rs

use crate::core::env;
use crate::system::backend::Backend;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

lazy_static! {
    // Anything outside this set is percent-encoded when a service name becomes a file name.
    static ref UNSAFE_FILENAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9_-]").unwrap();
}

// --- CONFIG FILE MODELS (what is read from muster.json / muster.toml) ---

/// The deserialized structure of a single config file.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Other config files whose services and groups are merged into this one.
    #[serde(default)]
    pub imports: Vec<String>,
    /// `KEY=VALUE` entries shared by every service and group in the file.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub groups: Vec<GroupDef>,
    #[serde(default)]
    pub services: Vec<ServiceDef>,
}

/// A group as declared in a config file, with children referenced by name.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GroupDef {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

/// A service as declared in a config file.
///
/// The backend is either given explicitly (`backend = { type = "...", ... }`) or through the
/// `commands` / `launch_checks` shorthand, which selects the command-line backend.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceDef {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub description: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub requires_sudo: bool,
    /// Operating system this service is limited to (`linux`, `macos`/`darwin`, `windows`).
    pub platform: Option<String>,
    /// URL requested by the warmup hook after a successful start.
    pub warmup: Option<String>,
    pub backend: Option<BackendDef>,
    pub commands: Option<serde_json::Value>,
    pub launch_checks: Option<serde_json::Value>,
}

/// An opaque backend descriptor. Only `type` is interpreted here; the rest is handed to
/// the loader registered for that type.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct BackendDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

// --- RESOLVED MODELS ---

/// An immutable, fully resolved service declaration.
pub struct ServiceDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub description: Option<String>,
    /// Working directory, already resolved against the declaring file.
    pub path: Option<PathBuf>,
    /// Service env, with the shared env of its config merged in.
    pub env: Vec<String>,
    pub requires_sudo: bool,
    pub platform: Option<String>,
    pub warmup: Option<String>,
    /// Absolute path of the config file this service was loaded through.
    pub config_file: PathBuf,
    /// The descriptor the backend was built from.
    pub backend_spec: BackendDef,
    pub backend: Arc<dyn Backend>,
}

impl ServiceDefinition {
    /// True if `name` is this service's name or one of its aliases.
    pub fn has_name(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|a| a == name)
    }

    /// Returns the aliases followed by the name.
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids = self.aliases.clone();
        ids.push(self.name.clone());
        ids
    }

    /// A file-system safe key derived from the service name. Distinct names give distinct
    /// keys: every byte outside `[A-Za-z0-9_-]`, `%` and `.` included, becomes `%XX`.
    pub fn state_key(&self) -> String {
        state_key(&self.name)
    }

    /// The run log this service writes to inside `log_dir`.
    pub fn run_log(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(format!(
            "{}.{}",
            self.state_key(),
            crate::constants::RUN_LOG_EXTENSION
        ))
    }
}

impl PartialEq for ServiceDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.aliases == other.aliases
            && self.description == other.description
            && self.path == other.path
            && self.env == other.env
            && self.requires_sudo == other.requires_sudo
            && self.platform == other.platform
            && self.warmup == other.warmup
            && self.config_file == other.config_file
            && self.backend_spec == other.backend_spec
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("path", &self.path)
            .field("env", &self.env)
            .field("config_file", &self.config_file)
            .field("backend", &self.backend_spec.kind)
            .finish()
    }
}

fn state_key(name: &str) -> String {
    UNSAFE_FILENAME_CHARS
        .replace_all(name, |caps: &Captures<'_>| {
            caps.get(0)
                .map(|m| m.as_str().bytes().map(|b| format!("%{:02X}", b)).collect::<String>())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Checks a `platform` field against an operating system name as reported by
/// `std::env::consts::OS`.
pub fn platform_matches(platform: Option<&str>, os: &str) -> bool {
    let Some(wanted) = platform.map(str::trim).filter(|p| !p.is_empty()) else {
        return true;
    };
    let wanted = wanted.to_lowercase();
    match wanted.as_str() {
        "darwin" | "macos" | "osx" => os == "macos",
        other => other == os,
    }
}

// --- OPERATION MODELS ---

/// Settings passed down from a caller (typically a group) to the services it operates on.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextOverride {
    #[serde(default)]
    pub env: Vec<String>,
}

impl ContextOverride {
    /// Combines two overrides. Entries of `self` win; `other` only fills in keys `self` lacks.
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            env: env::merge_inherited(&self.env, &other.env),
        }
    }
}

/// Options shared by every service touched by one build/start/stop/restart invocation.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    /// The directory commands run from when a service declares no path.
    pub working_dir: PathBuf,
    /// Names or aliases of services to leave alone.
    pub exclusions: Vec<String>,
    pub launch_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            exclusions: Vec::new(),
            launch_timeout: crate::constants::DEFAULT_LAUNCH_TIMEOUT,
            stop_timeout: crate::constants::DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl OperationConfig {
    pub fn is_excluded(&self, service: &ServiceDefinition) -> bool {
        self.exclusions.iter().any(|e| service.has_name(e))
    }
}

// --- PERSISTED STATE MODELS ---

/// Lifecycle states recorded in a service's run history.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(label)
    }
}

/// The live record of a running service (`state/<service>.json`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub pid: u32,
    pub service_name: String,
    pub config_file: PathBuf,
    #[serde(default)]
    pub overrides: ContextOverride,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
}

/// One entry in a run's status history.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub status: InstanceStatus,
    pub at: DateTime<Utc>,
    pub message: Option<String>,
}

/// The archived history of a single run (`state/<service>/<run_id>.json`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub service_name: String,
    pub pid: u32,
    pub history: Vec<StatusEntry>,
}

impl RunRecord {
    pub fn latest(&self) -> Option<&StatusEntry> {
        self.history.last()
    }
}

/// A line read from a service's run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub service: String,
    pub message: String,
}
