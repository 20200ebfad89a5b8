// src/system/backend.rs

//! The capability interface every service backend implements, the handle for a launched
//! process, and the registry that maps backend type names to loaders.

use crate::models::BackendDef;
use crate::system::process;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, #[source] std::io::Error),
    #[error("Command '{0}' exited with a non-zero error code.")]
    NonZeroExitStatus(String),
    #[error("This backend has no {0} step.")]
    Unsupported(&'static str),
    #[error("Process {pid} could not be signalled: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },
    #[error("Invalid backend configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Receives build output one line at a time.
pub type OutputSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Everything a backend needs to launch a service.
#[derive(Debug)]
pub struct LaunchContext<'a> {
    pub working_dir: &'a Path,
    /// The fully assembled process environment.
    pub env: &'a HashMap<String, String>,
    /// The file stdout and stderr must be appended to.
    pub run_log: &'a Path,
}

/// Everything a backend needs to stop a service.
#[derive(Debug)]
pub struct StopContext<'a> {
    pub working_dir: &'a Path,
    pub env: &'a HashMap<String, String>,
}

/// How a launched service signals that it is up.
#[derive(Debug, Clone, Default)]
pub enum ReadinessProbe {
    /// Up once the process survived a short grace period.
    #[default]
    Immediate,
    /// Up once a run log line contains this text.
    LogText(String),
    /// Up once a run log line matches this pattern.
    LogPattern(Regex),
    /// Up once every one of these local TCP ports accepts connections.
    Ports(Vec<u16>),
    /// Up once the process has survived this long.
    Wait(Duration),
}

impl ReadinessProbe {
    /// True if this probe is decided by run log lines.
    pub fn watches_log(&self) -> bool {
        matches!(self, Self::LogText(_) | Self::LogPattern(_))
    }

    /// Checks a single run log line against a log-based probe.
    pub fn matches_line(&self, line: &str) -> bool {
        match self {
            Self::LogText(text) => line.contains(text.as_str()),
            Self::LogPattern(re) => re.is_match(line),
            _ => false,
        }
    }
}

/// A handle to a launched process. Processes launched by this invocation keep their
/// [`Child`] so they can be reaped; processes known only from persisted state carry a pid.
#[derive(Debug)]
pub struct RunningProcess {
    pid: u32,
    child: Option<Child>,
}

impl RunningProcess {
    pub fn from_child(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
        }
    }

    pub fn from_pid(pid: u32) -> Self {
        Self { pid, child: None }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking check for process exit.
    pub fn has_exited(&mut self) -> std::io::Result<bool> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?.is_some()),
            None => Ok(!process::is_alive(self.pid)),
        }
    }

    /// Hands an owned child to a background thread that reaps it when it exits, so the
    /// process never lingers as a zombie of this one.
    pub fn detach(mut self) {
        if let Some(mut child) = self.child.take() {
            let spawned = std::thread::Builder::new()
                .name(format!("muster-reaper-{}", self.pid))
                .spawn(move || {
                    let _ = child.wait();
                });
            if let Err(e) = spawned {
                log::warn!("Could not start reaper for PID {}: {}", self.pid, e);
            }
        }
    }
}

/// The capability interface the core uses to build, launch and stop a service. The core
/// never branches on which implementation it holds.
pub trait Backend: Send + Sync + fmt::Debug {
    fn has_build_step(&self) -> bool;

    fn has_launch_step(&self) -> bool;

    /// Runs the build, streaming its output into `output`.
    fn build(
        &self,
        working_dir: &Path,
        env: &HashMap<String, String>,
        output: OutputSink<'_>,
    ) -> BackendResult<()>;

    /// Starts the service and returns as soon as the process exists.
    fn launch(&self, ctx: &LaunchContext<'_>) -> BackendResult<RunningProcess>;

    /// Asks the process to stop. Waiting for the exit is up to the caller.
    fn stop(&self, process: &mut RunningProcess, ctx: &StopContext<'_>) -> BackendResult<()>;

    fn readiness(&self) -> ReadinessProbe {
        ReadinessProbe::Immediate
    }
}

/// Turns an opaque backend descriptor into a backend.
pub trait BackendLoader: Send + Sync {
    /// The `type` this loader handles.
    fn kind(&self) -> &'static str;

    fn load(&self, def: &BackendDef) -> BackendResult<Arc<dyn Backend>>;
}

/// Maps backend type names to loaders. Built once at startup, read-only afterwards.
#[derive(Default)]
pub struct BackendRegistry {
    loaders: BTreeMap<String, Box<dyn BackendLoader>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.loaders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every backend this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(crate::system::commandline::CommandLineLoader));
        registry
    }

    /// Adds a loader, replacing any earlier one for the same type.
    pub fn register(&mut self, loader: Box<dyn BackendLoader>) {
        self.loaders.insert(loader.kind().to_string(), loader);
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.loaders.keys().map(String::as_str).collect()
    }

    pub fn load(&self, def: &BackendDef) -> BackendResult<Arc<dyn Backend>> {
        let loader = self.loaders.get(&def.kind).ok_or_else(|| {
            BackendError::InvalidConfig(format!(
                "unknown backend type '{}' (known: {})",
                def.kind,
                self.kinds().join(", ")
            ))
        })?;
        loader.load(def)
    }
}
