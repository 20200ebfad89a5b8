//! # Orchestrator
//!
//! The flows behind every command. A [`Client`] holds one resolved graph and turns names
//! into service work items, runs them through a [`Pool`] and reports through a fresh task
//! tree per flow. Failures stay attached to the task of the service they belong to; a flow
//! only fails as a whole after every item has run.

use crate::CancellationToken;
use crate::constants::{
    DEFAULT_LAUNCH_TIMEOUT, DEFAULT_LOG_LIVENESS_INTERVAL, DEFAULT_STOP_TIMEOUT, POLL_INTERVAL,
};
use crate::core::config_loader;
use crate::core::config_resolver::{
    ConfigError, GroupChild, GroupDefinition, ResolvedGraph, Target,
};
use crate::core::env;
use crate::core::instance::{self, Instance, InstanceError};
use crate::core::log_follower::{LogFollower, StartAt};
use crate::core::paths::HomeDirs;
use crate::core::tracker::{Task, TaskHandler, TaskSnapshot, TaskState};
use crate::core::ui::{ListEntry, Provider, ServiceStatus};
use crate::core::worker_pool::{Pool, PoolError};
use crate::models::{ContextOverride, OperationConfig, ServiceDefinition};
use crate::system::backend::BackendRegistry;
use crate::system::process;
use anyhow::Context;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No service or group named: {}", .0.join(", "))]
    UnknownNames(Vec<String>),
    #[error("No services or groups were given.")]
    NothingToDo,
    #[error("{count} service(s) failed: {}", .names.join(", "))]
    Failed { count: usize, names: Vec<String> },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Instance(#[from] InstanceError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("Could not follow logs: {0}")]
    Log(#[source] std::io::Error),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Runtime knobs for one client.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker pool size; 0 means unbounded.
    pub concurrency: usize,
    pub launch_timeout: Duration,
    pub stop_timeout: Duration,
    /// How often `log` checks whether any followed service is still running.
    pub log_liveness_interval: Duration,
    /// Working directory for services that declare no path.
    pub working_dir: PathBuf,
    pub exclusions: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 0,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            log_liveness_interval: DEFAULT_LOG_LIVENESS_INTERVAL,
            working_dir: PathBuf::from("."),
            exclusions: Vec::new(),
        }
    }
}

/// A service reached through the requested names, with what its groups contribute.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub service: Arc<ServiceDefinition>,
    pub overrides: ContextOverride,
    /// Names of the groups it was reached through, outermost first.
    pub groups: Vec<String>,
}

/// What a flow does to one service.
type ServiceOp = dyn Fn(&mut Instance, &OperationConfig, &Task) -> anyhow::Result<()> + Send + Sync;

pub struct Client {
    graph: ResolvedGraph,
    dirs: HomeDirs,
    settings: Settings,
    ui: Arc<dyn Provider>,
    handler: Option<TaskHandler>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.graph.file_path)
            .field("dirs", &self.dirs)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Client {
    pub fn new(
        graph: ResolvedGraph,
        dirs: HomeDirs,
        settings: Settings,
        ui: Arc<dyn Provider>,
    ) -> Self {
        Self {
            graph,
            dirs,
            settings,
            ui,
            handler: None,
        }
    }

    /// Loads and resolves `config_path`, then builds a client over the result.
    pub fn load(
        config_path: &Path,
        registry: &BackendRegistry,
        dirs: HomeDirs,
        settings: Settings,
        ui: Arc<dyn Provider>,
    ) -> OrchestratorResult<Self> {
        let raw = config_loader::load_config(config_path)?;
        let graph = crate::core::config_resolver::resolve(&raw, registry)?;
        Ok(Self::new(graph, dirs, settings, ui))
    }

    /// Sets the handler every flow's task tree reports to.
    pub fn with_task_handler(mut self, handler: TaskHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn graph(&self) -> &ResolvedGraph {
        &self.graph
    }

    fn operation_config(&self) -> OperationConfig {
        OperationConfig {
            working_dir: self.settings.working_dir.clone(),
            exclusions: self.settings.exclusions.clone(),
            launch_timeout: self.settings.launch_timeout,
            stop_timeout: self.settings.stop_timeout,
        }
    }

    // --- TARGETS ---

    /// Expands names and aliases into services, walking groups in declared child order.
    /// Group env reaches services as overrides, inner groups winning over outer ones. A
    /// service reached twice is kept once, at its first position.
    pub fn targets(&self, names: &[String]) -> OrchestratorResult<Vec<ServiceTarget>> {
        let unknown: Vec<String> = names
            .iter()
            .filter(|n| self.graph.lookup(n).is_none())
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(OrchestratorError::UnknownNames(unknown));
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for name in names {
            match self.graph.lookup(name) {
                Some(Target::Service(service)) => {
                    push_target(&mut out, &mut seen, service, &[], Vec::new());
                }
                Some(Target::Group(group)) => {
                    self.expand_group(group, &[], &[], &mut seen, &mut out);
                }
                None => {}
            }
        }
        Ok(out)
    }

    fn expand_group(
        &self,
        group: &GroupDefinition,
        outer_env: &[String],
        outer_groups: &[String],
        seen: &mut HashSet<String>,
        out: &mut Vec<ServiceTarget>,
    ) {
        let group_env = env::merge_inherited(&group.env, outer_env);
        let mut path = outer_groups.to_vec();
        path.push(group.name.clone());
        for child in &group.children {
            match child {
                GroupChild::Service(service) => {
                    push_target(out, seen, service, &group_env, path.clone());
                }
                GroupChild::Group(id) => {
                    if let Some(inner) = self.graph.group(*id) {
                        self.expand_group(inner, &group_env, &path, seen, out);
                    }
                }
            }
        }
    }

    // --- FLOWS ---

    /// Builds the named services.
    pub fn build(&self, names: &[String], force: bool) -> OrchestratorResult<TaskSnapshot> {
        let targets = self.required_targets(names)?;
        self.run_flow("Build", targets, self.settings.concurrency, move |instance, cfg, task| {
            instance.build(cfg, force, &task.child("Build"))?;
            Ok(())
        })
    }

    /// Builds (unless `skip_build`) and launches the named services.
    pub fn start(&self, names: &[String], skip_build: bool) -> OrchestratorResult<TaskSnapshot> {
        let targets = self.required_targets(names)?;
        self.run_flow("Start", targets, self.settings.concurrency, move |instance, cfg, task| {
            if !skip_build && !instance.is_running() {
                instance.build(cfg, false, &task.child("Build"))?;
            }
            instance.start_async(cfg, &task.child("Start"))?;
            Ok(())
        })
    }

    /// Stops the named services, last-declared first.
    pub fn stop(&self, names: &[String]) -> OrchestratorResult<TaskSnapshot> {
        let mut targets = self.required_targets(names)?;
        targets.reverse();
        self.run_flow("Stop", targets, self.settings.concurrency, |instance, cfg, task| {
            instance.stop_sync(cfg, &task.child("Stop"))?;
            Ok(())
        })
    }

    /// Stops, rebuilds and starts the named services. With no names, every running service
    /// of this config is restarted after confirmation (skipped when `force`).
    pub fn restart(
        &self,
        names: &[String],
        force: bool,
        skip_build: bool,
    ) -> OrchestratorResult<Option<TaskSnapshot>> {
        if names.is_empty() {
            if !force && !self.ui.confirm("Restart all running services?") {
                self.ui.info("Restart cancelled.");
                return Ok(None);
            }
            return self.restart_all(skip_build).map(Some);
        }
        let targets = self.required_targets(names)?;
        self.run_flow("Restart", targets, self.settings.concurrency, move |instance, cfg, task| {
            restart_one(instance, cfg, task, skip_build)
        })
        .map(Some)
    }

    /// Restarts every running service known to this config, one at a time, in ascending
    /// pid order.
    pub fn restart_all(&self, skip_build: bool) -> OrchestratorResult<TaskSnapshot> {
        let mut records = instance::load_running_services(&self.dirs)?;
        records.sort_by_key(|r| r.pid);

        let mut targets = Vec::with_capacity(records.len());
        for record in records {
            match self.graph.service_map().get(&record.service_name) {
                Some(service) => targets.push(ServiceTarget {
                    service: Arc::clone(service),
                    overrides: record.overrides,
                    groups: Vec::new(),
                }),
                None => log::debug!(
                    "Skipping running service '{}' from '{}'.",
                    record.service_name,
                    record.config_file.display()
                ),
            }
        }
        if targets.is_empty() {
            self.ui.info("No running services to restart.");
        }
        self.run_flow("Restart", targets, 1, move |instance, cfg, task| {
            restart_one(instance, cfg, task, skip_build)
        })
    }

    /// Reports the state of the named services, or of every service when none are named.
    pub fn status(&self, names: &[String]) -> OrchestratorResult<Vec<ServiceStatus>> {
        let services: Vec<Arc<ServiceDefinition>> = if names.is_empty() {
            self.graph.service_map().values().cloned().collect()
        } else {
            self.targets(names)?.into_iter().map(|t| t.service).collect()
        };

        let mut statuses = Vec::with_capacity(services.len());
        for service in services {
            let instance = Instance::load(service, &ContextOverride::default(), &self.dirs)?;
            let latest = instance.status()?;
            statuses.push(ServiceStatus {
                name: instance.service.name.clone(),
                pid: instance.pid,
                status: latest.map(|s| s.status),
                started_at: instance.started_at,
                alive: instance.is_running() && process::is_alive(instance.pid),
            });
        }
        self.ui.status(&statuses);
        Ok(statuses)
    }

    /// Lists every service and group in the config.
    pub fn list(&self) {
        let services: Vec<ListEntry> = self
            .graph
            .service_map()
            .values()
            .map(|s| ListEntry {
                name: s.name.clone(),
                aliases: s.aliases.clone(),
                description: s.description.clone(),
                children: Vec::new(),
            })
            .collect();
        let groups: Vec<ListEntry> = self
            .graph
            .group_map()
            .values()
            .map(|g| ListEntry {
                name: g.name.clone(),
                aliases: g.aliases.clone(),
                description: g.description.clone(),
                children: g.child_names.clone(),
            })
            .collect();
        self.ui.list(&services, &groups);
    }

    /// Follows the run logs of the named services until `cancel` is set or none of them is
    /// running any more.
    pub fn log(&self, names: &[String], cancel: &CancellationToken) -> OrchestratorResult<()> {
        let targets = self.required_targets(names)?;
        let (tx, rx) = mpsc::channel();
        let mut followers = Vec::with_capacity(targets.len());
        for target in &targets {
            let run_log = target.service.run_log(&self.dirs.log_dir);
            let follower =
                LogFollower::spawn(&target.service.name, &run_log, StartAt::Beginning, tx.clone())
                    .map_err(OrchestratorError::Log)?;
            followers.push(follower);
        }
        drop(tx);

        let services: Vec<Arc<ServiceDefinition>> =
            targets.iter().map(|t| Arc::clone(&t.service)).collect();
        let dirs = self.dirs.clone();
        let cancel = Arc::clone(cancel);
        let interval = self.settings.log_liveness_interval;

        // Dropping the followers drops every sender, which ends `show_log`.
        let watcher = std::thread::Builder::new()
            .name("muster-log-watch".to_string())
            .spawn(move || {
                let mut next_check = Instant::now() + interval;
                while !cancel.load(Ordering::Relaxed) {
                    if Instant::now() >= next_check {
                        if !any_running(&services, &dirs) {
                            log::debug!("No followed service is running, ending log.");
                            break;
                        }
                        next_check = Instant::now() + interval;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                drop(followers);
            })
            .map_err(OrchestratorError::Log)?;

        self.ui.show_log(rx, targets.len() > 1);
        if watcher.join().is_err() {
            log::error!("Log watcher thread panicked.");
        }
        Ok(())
    }

    // --- PLUMBING ---

    fn required_targets(&self, names: &[String]) -> OrchestratorResult<Vec<ServiceTarget>> {
        if names.is_empty() {
            return Err(OrchestratorError::NothingToDo);
        }
        self.targets(names)
    }

    /// Runs `op` for every target through a pool of `concurrency` workers, each under its
    /// own task node, and waits for all of them.
    fn run_flow<F>(
        &self,
        name: &str,
        targets: Vec<ServiceTarget>,
        concurrency: usize,
        op: F,
    ) -> OrchestratorResult<TaskSnapshot>
    where
        F: Fn(&mut Instance, &OperationConfig, &Task) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let root = Task::new_root(name, self.handler.clone());
        root.set(TaskState::InProgress);
        let op: Arc<ServiceOp> = Arc::new(op);
        let cfg = Arc::new(self.operation_config());
        let mut service_tasks = Vec::with_capacity(targets.len());

        {
            let pool = Pool::new(concurrency);
            pool.start()?;
            // Drain the pool on every exit path, including a failed enqueue.
            let pool = scopeguard::guard(pool, |pool| {
                pool.stop();
                pool.complete().wait();
            });

            for target in targets {
                let task = target
                    .groups
                    .iter()
                    .fold(root.clone(), |parent, group| parent.child(group))
                    .child(&target.service.name);
                service_tasks.push((target.service.name.clone(), task.clone()));

                let op = Arc::clone(&op);
                let cfg = Arc::clone(&cfg);
                let dirs = self.dirs.clone();
                pool.enqueue(move || {
                    // A panicking item still leaves its task in a terminal state.
                    let _unwinding = scopeguard::guard_on_unwind(task.clone(), |task| {
                        task.set_state(TaskState::Failed, ["Panicked while running."]);
                    });
                    let result = Instance::load(
                        Arc::clone(&target.service),
                        &target.overrides,
                        &dirs,
                    )
                    .with_context(|| format!("Could not load state for '{}'", target.service.name))
                    .and_then(|mut instance| op(&mut instance, cfg.as_ref(), &task));
                    if let Err(e) = &result {
                        task.set_state(TaskState::Failed, [format!("{:#}", e)]);
                    } else {
                        task.set(TaskState::Success);
                    }
                    result
                })?;
            }
        }

        let failed: Vec<String> = service_tasks
            .iter()
            .filter(|(_, task)| task.snapshot().count_in_state(TaskState::Failed) > 0)
            .map(|(name, _)| name.clone())
            .collect();
        if failed.is_empty() {
            root.set(TaskState::Success);
            Ok(root.snapshot())
        } else {
            root.set(TaskState::Failed);
            Err(OrchestratorError::Failed {
                count: failed.len(),
                names: failed,
            })
        }
    }
}

fn push_target(
    out: &mut Vec<ServiceTarget>,
    seen: &mut HashSet<String>,
    service: &Arc<ServiceDefinition>,
    group_env: &[String],
    groups: Vec<String>,
) {
    if seen.insert(service.name.clone()) {
        out.push(ServiceTarget {
            service: Arc::clone(service),
            overrides: ContextOverride {
                env: group_env.to_vec(),
            },
            groups,
        });
    }
}

fn restart_one(
    instance: &mut Instance,
    cfg: &OperationConfig,
    task: &Task,
    skip_build: bool,
) -> anyhow::Result<()> {
    instance.stop_sync(cfg, &task.child("Stop"))?;
    if !skip_build {
        instance.build(cfg, true, &task.child("Build"))?;
    }
    instance.start_async(cfg, &task.child("Start"))?;
    Ok(())
}

fn any_running(services: &[Arc<ServiceDefinition>], dirs: &HomeDirs) -> bool {
    services.iter().any(|s| match instance::has_running(s, dirs) {
        Ok(running) => running,
        Err(e) => {
            log::warn!("Could not read state for '{}': {}", s.name, e);
            false
        }
    })
}
