//! # Instance Manager
//!
//! The runtime record of one service: its pid, the overrides it was started with and the
//! state persisted for it between invocations.
//!
//! On disk, each service owns two artifacts under the state directory:
//!
//! - `live/<service>.json`, the live [`InstanceRecord`] (present only while the service runs).
//! - `runs/<service>/<run_id>.json`, one [`RunRecord`] per run with its timestamped status
//!   history.
//!
//! Writers always overwrite whole files; nothing is merged in place.

use crate::constants::{LAUNCH_GRACE_PERIOD, POLL_INTERVAL, RECORD_EXTENSION};
use crate::core::env;
use crate::core::log_follower::{LogFollower, StartAt};
use crate::core::paths::HomeDirs;
use crate::core::tracker::{Task, TaskState};
use crate::models::{
    ContextOverride, InstanceRecord, InstanceStatus, OperationConfig, RunRecord,
    ServiceDefinition, StatusEntry,
};
use crate::system::backend::{
    BackendError, LaunchContext, ReadinessProbe, RunningProcess, StopContext,
};
use crate::system::process;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Corrupt state file '{}': {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("service did not become ready within {0:?}")]
    NotReady(Duration),
    #[error("process {0} exited before it became ready")]
    ExitedEarly(u32),
}

pub type InstanceResult<T> = Result<T, InstanceError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> InstanceError + '_ {
    move |source| InstanceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// --- PERSISTENCE ---

fn live_record_path(service: &ServiceDefinition, dirs: &HomeDirs) -> PathBuf {
    dirs.live_dir
        .join(format!("{}.{}", service.state_key(), RECORD_EXTENSION))
}

fn archive_dir(service: &ServiceDefinition, dirs: &HomeDirs) -> PathBuf {
    dirs.runs_dir.join(service.state_key())
}

fn run_record_path(service: &ServiceDefinition, dirs: &HomeDirs, run_id: Uuid) -> PathBuf {
    archive_dir(service, dirs).join(format!("{}.{}", run_id, RECORD_EXTENSION))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> InstanceResult<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(path)(e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|source| InstanceError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> InstanceResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let content = serde_json::to_string_pretty(value).map_err(|source| InstanceError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, content).map_err(io_err(path))
}

fn remove_if_present(path: &Path) -> InstanceResult<()> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

/// Removes every persisted artifact for `service`. Missing state is not an error.
pub fn delete_all_statuses_for_service(
    service: &ServiceDefinition,
    dirs: &HomeDirs,
) -> InstanceResult<()> {
    log::debug!("Clearing persisted state for '{}'.", service.name);
    remove_if_present(&live_record_path(service, dirs))?;
    remove_if_present(&archive_dir(service, dirs))
}

/// True if the persisted state for `service` carries a pid.
pub fn has_running(service: &Arc<ServiceDefinition>, dirs: &HomeDirs) -> InstanceResult<bool> {
    Ok(Instance::load(Arc::clone(service), &ContextOverride::default(), dirs)?.pid != 0)
}

/// Every live instance record in `state/live`. Anything that is not a record file is skipped.
pub fn load_running_services(dirs: &HomeDirs) -> InstanceResult<Vec<InstanceRecord>> {
    let entries = match fs::read_dir(&dirs.live_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(&dirs.live_dir)(e)),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err(&dirs.live_dir))?.path();
        let is_record = path.is_file()
            && path
                .extension()
                .is_some_and(|e| e == RECORD_EXTENSION);
        if !is_record {
            continue;
        }
        if let Some(record) = read_json::<InstanceRecord>(&path)? {
            if record.pid != 0 {
                records.push(record);
            }
        }
    }
    Ok(records)
}

/// Reads the run log back, for attaching to a failed task.
fn read_run_log(path: &Path) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect(),
        Err(e) => {
            log::debug!("No run log to read back at '{}': {}", path.display(), e);
            Vec::new()
        }
    }
}

// --- INSTANCE ---

/// The runtime record of one service.
#[derive(Debug)]
pub struct Instance {
    /// The running process, or 0.
    pub pid: u32,
    pub service: Arc<ServiceDefinition>,
    pub overrides: ContextOverride,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    dirs: HomeDirs,
    /// Set only for a process launched by this invocation.
    process: Option<RunningProcess>,
}

impl Instance {
    /// Loads the persisted state for `service`, or a not-running instance if there is none.
    /// The persisted overrides win over the caller's.
    pub fn load(
        service: Arc<ServiceDefinition>,
        overrides: &ContextOverride,
        dirs: &HomeDirs,
    ) -> InstanceResult<Self> {
        let record: Option<InstanceRecord> = read_json(&live_record_path(&service, dirs))?;
        let instance = match record {
            Some(record) => Self {
                pid: record.pid,
                overrides: record.overrides.merge(overrides),
                run_id: record.run_id,
                started_at: record.started_at,
                service,
                dirs: dirs.clone(),
                process: None,
            },
            None => Self {
                pid: 0,
                overrides: overrides.clone(),
                run_id: None,
                started_at: None,
                service,
                dirs: dirs.clone(),
                process: None,
            },
        };
        Ok(instance)
    }

    pub fn is_running(&self) -> bool {
        self.pid != 0
    }

    /// The full process environment: this process's, then the overrides, then the service's
    /// own entries. Later layers win.
    pub fn process_env(&self) -> HashMap<String, String> {
        let base: Vec<String> = std::env::vars().map(|(k, v)| format!("{}={}", k, v)).collect();
        env::layered_map([
            base.as_slice(),
            self.overrides.env.as_slice(),
            self.service.env.as_slice(),
        ])
    }

    fn working_dir<'a>(&'a self, cfg: &'a OperationConfig) -> &'a Path {
        self.service.path.as_deref().unwrap_or(&cfg.working_dir)
    }

    pub fn run_log(&self) -> PathBuf {
        self.service.run_log(&self.dirs.log_dir)
    }

    /// The latest entry of the current run's history, if any.
    pub fn status(&self) -> InstanceResult<Option<StatusEntry>> {
        let Some(run_id) = self.run_id else {
            return Ok(None);
        };
        let record: Option<RunRecord> =
            read_json(&run_record_path(&self.service, &self.dirs, run_id))?;
        Ok(record.and_then(|r| r.latest().cloned()))
    }

    fn save_live_record(&self) -> InstanceResult<()> {
        let record = InstanceRecord {
            pid: self.pid,
            service_name: self.service.name.clone(),
            config_file: self.service.config_file.clone(),
            overrides: self.overrides.clone(),
            run_id: self.run_id,
            started_at: self.started_at,
        };
        write_json(&live_record_path(&self.service, &self.dirs), &record)
    }

    /// Appends a status to the current run's history.
    fn record_status(&self, status: InstanceStatus, message: Option<String>) -> InstanceResult<()> {
        let Some(run_id) = self.run_id else {
            return Ok(());
        };
        let path = run_record_path(&self.service, &self.dirs, run_id);
        let mut record = read_json::<RunRecord>(&path)?.unwrap_or_else(|| RunRecord {
            run_id,
            service_name: self.service.name.clone(),
            pid: self.pid,
            history: Vec::new(),
        });
        record.pid = self.pid;
        record.history.push(StatusEntry {
            status,
            at: Utc::now(),
            message,
        });
        write_json(&path, &record)
    }

    // --- BUILD ---

    /// Runs the backend's build step, reporting into `task`.
    pub fn build(&mut self, cfg: &OperationConfig, force: bool, task: &Task) -> InstanceResult<()> {
        if !self.service.backend.has_build_step() || cfg.is_excluded(&self.service) {
            return Ok(());
        }
        if !force && self.is_running() {
            task.set_state(TaskState::Warning, ["Already running, not rebuilding."]);
            return Ok(());
        }
        // A forced rebuild of a running service keeps its live record.
        if !self.is_running() {
            delete_all_statuses_for_service(&self.service, &self.dirs)?;
        }

        task.set(TaskState::InProgress);
        log::debug!("Building '{}'.", self.service.name);
        let env = self.process_env();
        let sink = |line: &str| task.add_output(line);
        match self
            .service
            .backend
            .build(self.working_dir(cfg), &env, &sink)
        {
            Ok(()) => {
                task.set(TaskState::Success);
                Ok(())
            }
            Err(e) => {
                task.set_state(TaskState::Failed, [e.to_string()]);
                Err(e.into())
            }
        }
    }

    // --- START ---

    /// Launches the service and blocks until it is ready, it exits, or the launch timeout
    /// passes. A failed launch is stopped again before returning the error.
    pub fn start_async(&mut self, cfg: &OperationConfig, task: &Task) -> InstanceResult<()> {
        if cfg.is_excluded(&self.service) || !self.service.backend.has_launch_step() {
            return Ok(());
        }
        if self.is_running() {
            task.set_state(
                TaskState::Warning,
                [format!("Already running with PID {}.", self.pid)],
            );
            return Ok(());
        }

        delete_all_statuses_for_service(&self.service, &self.dirs)?;
        let run_log = self.run_log();
        remove_if_present(&run_log)?;
        task.set(TaskState::InProgress);

        self.run_id = Some(Uuid::new_v4());
        self.record_status(InstanceStatus::Starting, None)?;

        let env = self.process_env();
        let ctx = LaunchContext {
            working_dir: self.working_dir(cfg),
            env: &env,
            run_log: &run_log,
        };
        let mut running = match self.service.backend.launch(&ctx) {
            Ok(running) => running,
            Err(e) => {
                let message = e.to_string();
                task.set_state(TaskState::Failed, [message.clone()]);
                self.record_status(InstanceStatus::Failed, Some(message))?;
                self.run_id = None;
                return Err(e.into());
            }
        };

        self.pid = running.pid();
        self.started_at = Some(Utc::now());
        self.save_live_record()?;
        log::debug!("'{}' launched with PID {}.", self.service.name, self.pid);

        let probe = self.service.backend.readiness();
        match wait_until_ready(&mut running, &probe, &run_log, cfg.launch_timeout) {
            Ok(()) => {
                self.record_status(InstanceStatus::Running, None)?;
                running.detach();
                log::debug!("'{}' is ready.", self.service.name);
                if let Some(url) = &self.service.warmup {
                    task.child("Warmup")
                        .set_state(TaskState::Success, [format!("Warmup requested: {}", url)]);
                }
                task.set(TaskState::Success);
                Ok(())
            }
            Err(e) => {
                log::debug!("'{}' failed to start: {}", self.service.name, e);
                let mut output = read_run_log(&run_log);
                output.push(e.to_string());
                task.set_state(TaskState::Failed, output);
                // The half-started process is stopped even if its history cannot be written.
                if let Err(status_err) =
                    self.record_status(InstanceStatus::Failed, Some(e.to_string()))
                {
                    log::warn!(
                        "Could not record the failed start of '{}': {}",
                        self.service.name,
                        status_err
                    );
                }
                self.process = Some(running);
                self.stop_sync(cfg, &task.child("Cleanup"))?;
                Err(e)
            }
        }
    }

    // --- STOP ---

    /// Stops the service and waits for the process to exit.
    pub fn stop_sync(&mut self, cfg: &OperationConfig, task: &Task) -> InstanceResult<()> {
        if !self.is_running() {
            remove_if_present(&live_record_path(&self.service, &self.dirs))?;
            task.set_state(TaskState::Warning, ["Not running."]);
            return Ok(());
        }

        task.set(TaskState::InProgress);
        let mut running = self
            .process
            .take()
            .unwrap_or_else(|| RunningProcess::from_pid(self.pid));
        let env = self.process_env();
        let ctx = StopContext {
            working_dir: self.working_dir(cfg),
            env: &env,
        };

        let stopped = self
            .service
            .backend
            .stop(&mut running, &ctx)
            .and_then(|()| process::ensure_stopped(&mut running, cfg.stop_timeout));
        if let Err(e) = stopped {
            task.set_state(TaskState::Failed, [e.to_string()]);
            return Err(e.into());
        }

        log::debug!("'{}' (PID {}) stopped.", self.service.name, self.pid);
        let recorded = self.record_status(InstanceStatus::Stopped, None);
        self.pid = 0;
        self.run_id = None;
        self.started_at = None;
        remove_if_present(&live_record_path(&self.service, &self.dirs))?;
        if let Err(e) = recorded {
            task.set_state(TaskState::Failed, [e.to_string()]);
            return Err(e);
        }
        task.set(TaskState::Success);
        Ok(())
    }
}

// --- READINESS ---

/// Blocks until `probe` reports the process ready. Exit takes precedence over the timeout,
/// and both take precedence over further log lines.
fn wait_until_ready(
    running: &mut RunningProcess,
    probe: &ReadinessProbe,
    run_log: &Path,
    timeout: Duration,
) -> InstanceResult<()> {
    let deadline = Instant::now() + timeout;
    let exited = |running: &mut RunningProcess| -> InstanceResult<bool> {
        running.has_exited().map_err(io_err(run_log))
    };

    match probe {
        ReadinessProbe::Immediate | ReadinessProbe::Wait(_) => {
            let survive = match probe {
                ReadinessProbe::Wait(d) => *d,
                _ => LAUNCH_GRACE_PERIOD,
            };
            let until = Instant::now() + survive;
            loop {
                if exited(running)? {
                    return Err(InstanceError::ExitedEarly(running.pid()));
                }
                let now = Instant::now();
                if now >= until {
                    return Ok(());
                }
                if now >= deadline {
                    return Err(InstanceError::NotReady(timeout));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        ReadinessProbe::Ports(ports) => loop {
            if exited(running)? {
                return Err(InstanceError::ExitedEarly(running.pid()));
            }
            if Instant::now() >= deadline {
                return Err(InstanceError::NotReady(timeout));
            }
            if ports.iter().all(|port| port_accepts(*port)) {
                return Ok(());
            }
            std::thread::sleep(POLL_INTERVAL);
        },
        ReadinessProbe::LogText(_) | ReadinessProbe::LogPattern(_) => {
            let (tx, rx) = mpsc::channel();
            let _follower = LogFollower::spawn("readiness", run_log, StartAt::Beginning, tx)
                .map_err(io_err(run_log))?;
            loop {
                if exited(running)? {
                    return Err(InstanceError::ExitedEarly(running.pid()));
                }
                if Instant::now() >= deadline {
                    return Err(InstanceError::NotReady(timeout));
                }
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(line) if probe.matches_line(&line.message) => return Ok(()),
                    Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        std::thread::sleep(POLL_INTERVAL);
                    }
                }
            }
        }
    }
}

fn port_accepts(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config_loader::RawConfigSet;
    use crate::core::config_resolver;
    use crate::models::ServiceDef;
    use crate::system::backend::BackendRegistry;
    use serde_json::json;
    use tempfile::TempDir;

    fn service(commands: serde_json::Value, checks: Option<serde_json::Value>) -> Arc<ServiceDefinition> {
        named_service("svc", commands, checks)
    }

    fn named_service(
        name: &str,
        commands: serde_json::Value,
        checks: Option<serde_json::Value>,
    ) -> Arc<ServiceDefinition> {
        let def = ServiceDef {
            name: name.to_string(),
            commands: Some(commands),
            launch_checks: checks,
            ..Default::default()
        };
        let raw = RawConfigSet::from_definitions("/tmp/muster.json", vec![def], vec![], vec![]);
        let graph = config_resolver::resolve(&raw, &BackendRegistry::with_defaults()).unwrap();
        Arc::clone(&graph.service_map()[name])
    }

    fn setup() -> (TempDir, HomeDirs, OperationConfig) {
        let tmp = TempDir::new().unwrap();
        let dirs = HomeDirs::at(tmp.path().join("home")).unwrap();
        let cfg = OperationConfig {
            working_dir: tmp.path().to_path_buf(),
            launch_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        (tmp, dirs, cfg)
    }

    #[test]
    fn test_load_without_state_is_not_running() {
        let (_tmp, dirs, _cfg) = setup();
        let svc = service(json!({ "launch": "sleep 30" }), None);
        let instance = Instance::load(svc.clone(), &ContextOverride::default(), &dirs).unwrap();
        assert_eq!(instance.pid, 0);
        assert!(!has_running(&svc, &dirs).unwrap());
        assert!(instance.status().unwrap().is_none());
    }

    #[test]
    fn test_start_persists_pid_and_stop_clears_it() {
        let (_tmp, dirs, cfg) = setup();
        let svc = service(
            json!({ "launch": "sh -c 'echo up; sleep 30'" }),
            Some(json!({ "log_text": "up" })),
        );
        let root = Task::new_root("start", None);

        let mut instance = Instance::load(svc.clone(), &ContextOverride::default(), &dirs).unwrap();
        instance.start_async(&cfg, &root.child("Start")).unwrap();
        assert_ne!(instance.pid, 0);
        assert_eq!(root.child("Start").state(), TaskState::Success);
        assert!(has_running(&svc, &dirs).unwrap());
        assert_eq!(
            instance.status().unwrap().map(|s| s.status),
            Some(InstanceStatus::Running)
        );

        let running = load_running_services(&dirs).unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].pid, instance.pid);

        let mut reloaded = Instance::load(svc.clone(), &ContextOverride::default(), &dirs).unwrap();
        reloaded.stop_sync(&cfg, &root.child("Stop")).unwrap();
        assert_eq!(reloaded.pid, 0);
        assert_eq!(root.child("Stop").state(), TaskState::Success);
        assert!(!has_running(&svc, &dirs).unwrap());
    }

    #[test]
    fn test_start_when_running_is_a_warning() {
        let (_tmp, dirs, cfg) = setup();
        let svc = service(json!({ "launch": "sleep 30" }), None);
        let mut instance = Instance::load(svc, &ContextOverride::default(), &dirs).unwrap();
        instance.pid = 4_200_001;
        instance.save_live_record().unwrap();

        let task = Task::new_root("start", None);
        instance.start_async(&cfg, &task).unwrap();
        assert_eq!(task.state(), TaskState::Warning);
        assert_eq!(instance.pid, 4_200_001);
    }

    #[test]
    fn test_stop_when_not_running_is_a_warning() {
        let (_tmp, dirs, cfg) = setup();
        let svc = service(json!({ "launch": "sleep 30", "stop": "false" }), None);
        let mut instance = Instance::load(svc, &ContextOverride::default(), &dirs).unwrap();
        let task = Task::new_root("stop", None);
        instance.stop_sync(&cfg, &task).unwrap();
        assert_eq!(task.state(), TaskState::Warning);
    }

    #[test]
    fn test_readiness_timeout_fails_and_cleans_up() {
        let (_tmp, dirs, mut cfg) = setup();
        cfg.launch_timeout = Duration::from_millis(500);
        let svc = service(
            json!({ "launch": "sh -c 'echo booting; sleep 30'" }),
            Some(json!({ "log_text": "never printed" })),
        );
        let task = Task::new_root("start", None);
        let mut instance = Instance::load(svc.clone(), &ContextOverride::default(), &dirs).unwrap();

        let err = instance.start_async(&cfg, &task).unwrap_err();
        assert!(matches!(err, InstanceError::NotReady(_)));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.output().iter().any(|l| l == "booting"));
        assert_eq!(task.child("Cleanup").state(), TaskState::Success);
        assert_eq!(instance.pid, 0);
        assert!(!has_running(&svc, &dirs).unwrap());
    }

    #[test]
    fn test_early_exit_is_a_launch_failure() {
        let (_tmp, dirs, cfg) = setup();
        let svc = service(json!({ "launch": "sh -c 'echo crashed; exit 3'" }), None);
        let task = Task::new_root("start", None);
        let mut instance = Instance::load(svc, &ContextOverride::default(), &dirs).unwrap();
        let err = instance.start_async(&cfg, &task).unwrap_err();
        assert!(matches!(err, InstanceError::ExitedEarly(_)));
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(instance.pid, 0);
    }

    #[test]
    fn test_build_captures_output_and_failure() {
        let (_tmp, dirs, cfg) = setup();
        let svc = service(json!({ "build": "sh -c 'echo compiling; exit 1'" }), None);
        let task = Task::new_root("build", None);
        let mut instance = Instance::load(svc, &ContextOverride::default(), &dirs).unwrap();
        assert!(instance.build(&cfg, false, &task).is_err());
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.output().first().map(String::as_str), Some("compiling"));
    }

    #[test]
    fn test_build_skipped_when_running_unless_forced() {
        let (_tmp, dirs, cfg) = setup();
        let svc = service(json!({ "build": "true" }), None);
        let mut instance = Instance::load(svc, &ContextOverride::default(), &dirs).unwrap();
        instance.pid = 4_200_002;

        let skipped = Task::new_root("build", None);
        instance.build(&cfg, false, &skipped).unwrap();
        assert_eq!(skipped.state(), TaskState::Warning);

        let forced = Task::new_root("build", None);
        instance.build(&cfg, true, &forced).unwrap();
        assert_eq!(forced.state(), TaskState::Success);
    }

    #[test]
    fn test_excluded_service_is_left_alone() {
        let (_tmp, dirs, mut cfg) = setup();
        cfg.exclusions = vec!["svc".to_string()];
        let svc = service(json!({ "build": "false", "launch": "false" }), None);
        let task = Task::new_root("start", None);
        let mut instance = Instance::load(svc, &ContextOverride::default(), &dirs).unwrap();
        instance.build(&cfg, true, &task).unwrap();
        instance.start_async(&cfg, &task).unwrap();
        assert_eq!(task.state(), TaskState::Pending);
    }

    #[test]
    fn test_env_layers_service_over_overrides() {
        let (_tmp, dirs, _cfg) = setup();
        let def = ServiceDef {
            name: "svc".to_string(),
            env: vec!["PORT=1".to_string()],
            ..Default::default()
        };
        let raw = RawConfigSet::from_definitions("/tmp/muster.json", vec![def], vec![], vec![]);
        let graph = config_resolver::resolve(&raw, &BackendRegistry::with_defaults()).unwrap();
        let overrides = ContextOverride {
            env: vec!["PORT=2".to_string(), "MODE=group".to_string()],
        };
        let instance = Instance::load(
            Arc::clone(&graph.service_map()["svc"]),
            &overrides,
            &dirs,
        )
        .unwrap();
        let env = instance.process_env();
        assert_eq!(env.get("PORT").map(String::as_str), Some("1"));
        assert_eq!(env.get("MODE").map(String::as_str), Some("group"));
        assert!(env.contains_key("PATH"));
    }

    #[test]
    fn test_delete_missing_statuses_is_ok() {
        let (_tmp, dirs, _cfg) = setup();
        let svc = service(json!({}), None);
        delete_all_statuses_for_service(&svc, &dirs).unwrap();
        delete_all_statuses_for_service(&svc, &dirs).unwrap();
    }

    #[test]
    fn test_distinct_names_do_not_share_state() {
        let (_tmp, dirs, _cfg) = setup();
        let slashed = named_service("web/api", json!({ "launch": "sleep 30" }), None);
        let underscored = named_service("web_api", json!({ "launch": "sleep 30" }), None);

        let mut instance = Instance::load(slashed.clone(), &ContextOverride::default(), &dirs).unwrap();
        instance.pid = 4_200_077;
        instance.save_live_record().unwrap();

        assert!(has_running(&slashed, &dirs).unwrap());
        assert!(!has_running(&underscored, &dirs).unwrap());
        assert_ne!(slashed.run_log(&dirs.log_dir), underscored.run_log(&dirs.log_dir));
    }

    #[test]
    fn test_clearing_one_service_keeps_another_record() {
        let (_tmp, dirs, _cfg) = setup();
        let plain = named_service("svc", json!({ "launch": "sleep 30" }), None);
        let dotted = named_service("svc.json", json!({ "launch": "sleep 30" }), None);
        for (service, pid) in [(&plain, 4_200_081), (&dotted, 4_200_082)] {
            let mut instance =
                Instance::load(Arc::clone(service), &ContextOverride::default(), &dirs).unwrap();
            instance.pid = pid;
            instance.run_id = Some(Uuid::new_v4());
            instance.save_live_record().unwrap();
            instance.record_status(InstanceStatus::Running, None).unwrap();
        }

        delete_all_statuses_for_service(&dotted, &dirs).unwrap();
        assert!(!has_running(&dotted, &dirs).unwrap());
        let kept = Instance::load(plain, &ContextOverride::default(), &dirs).unwrap();
        assert_eq!(kept.pid, 4_200_081);
        assert_eq!(
            kept.status().unwrap().map(|s| s.status),
            Some(InstanceStatus::Running)
        );
    }

    /// Launches `sleep 30`, then makes the service's run history unwritable.
    #[derive(Debug)]
    struct UnwritableHistoryBackend {
        archive: PathBuf,
        launched: std::sync::Mutex<Option<u32>>,
    }

    impl crate::system::backend::Backend for UnwritableHistoryBackend {
        fn has_build_step(&self) -> bool {
            false
        }

        fn has_launch_step(&self) -> bool {
            true
        }

        fn build(
            &self,
            _working_dir: &Path,
            _env: &HashMap<String, String>,
            _output: crate::system::backend::OutputSink<'_>,
        ) -> crate::system::backend::BackendResult<()> {
            Ok(())
        }

        fn launch(
            &self,
            _ctx: &LaunchContext<'_>,
        ) -> crate::system::backend::BackendResult<RunningProcess> {
            use std::os::unix::process::CommandExt;
            fs::remove_dir_all(&self.archive)?;
            fs::write(&self.archive, "not a directory")?;
            let child = std::process::Command::new("sleep")
                .arg("30")
                .process_group(0)
                .spawn()?;
            *self.launched.lock().unwrap() = Some(child.id());
            Ok(RunningProcess::from_child(child))
        }

        fn stop(
            &self,
            process: &mut RunningProcess,
            _ctx: &StopContext<'_>,
        ) -> crate::system::backend::BackendResult<()> {
            process::send_signal(process.pid(), nix::sys::signal::Signal::SIGTERM)
        }

        fn readiness(&self) -> ReadinessProbe {
            ReadinessProbe::LogText("never printed".to_string())
        }
    }

    #[test]
    fn test_failed_start_is_cleaned_up_even_if_history_cannot_be_written() {
        let (_tmp, dirs, mut cfg) = setup();
        cfg.launch_timeout = Duration::from_millis(300);
        let template = service(json!({ "launch": "sleep 30" }), None);
        let backend = Arc::new(UnwritableHistoryBackend {
            archive: dirs.runs_dir.join(template.state_key()),
            launched: std::sync::Mutex::new(None),
        });
        let svc = Arc::new(ServiceDefinition {
            name: template.name.clone(),
            aliases: Vec::new(),
            description: None,
            path: None,
            env: Vec::new(),
            requires_sudo: false,
            platform: None,
            warmup: None,
            config_file: template.config_file.clone(),
            backend_spec: template.backend_spec.clone(),
            backend: backend.clone(),
        });

        let task = Task::new_root("start", None);
        let mut instance = Instance::load(svc.clone(), &ContextOverride::default(), &dirs).unwrap();
        assert!(instance.start_async(&cfg, &task).is_err());

        let pid = backend.launched.lock().unwrap().expect("process was launched");
        assert!(!process::is_alive(pid));
        assert_eq!(instance.pid, 0);
        assert!(!has_running(&svc, &dirs).unwrap());
        assert_eq!(task.state(), TaskState::Failed);
    }

    #[test]
    fn test_load_running_services_skips_directories() {
        let (_tmp, dirs, _cfg) = setup();
        fs::create_dir_all(dirs.live_dir.join("svc")).unwrap();
        fs::write(dirs.live_dir.join("svc").join("x.json"), "{}").unwrap();
        assert!(load_running_services(&dirs).unwrap().is_empty());
    }
}
