// tests/orchestrator.rs

use muster::core::orchestrator::{Client, OrchestratorError, Settings};
use muster::core::paths::HomeDirs;
use muster::core::tracker::{TaskHandler, TaskSnapshot, TaskState, TaskUpdate};
use muster::core::ui::{ListEntry, Provider, ServiceStatus};
use muster::models::{BackendDef, LogLine};
use muster::system::backend::{
    Backend, BackendError, BackendLoader, BackendRegistry, BackendResult, LaunchContext,
    OutputSink, RunningProcess, StopContext,
};
use muster::system::process;
use nix::sys::signal::Signal;
use std::collections::HashMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// --- Test doubles ---

/// Shared log of everything the recording backends were asked to do.
#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    envs: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

/// Launches `sleep 30` in its own process group and records every call.
#[derive(Debug)]
struct RecordingBackend {
    label: String,
    with_build: bool,
    panics_on_launch: bool,
    recorder: Arc<Recorder>,
}

impl Backend for RecordingBackend {
    fn has_build_step(&self) -> bool {
        self.with_build
    }

    fn has_launch_step(&self) -> bool {
        true
    }

    fn build(
        &self,
        _working_dir: &Path,
        _env: &HashMap<String, String>,
        output: OutputSink<'_>,
    ) -> BackendResult<()> {
        self.recorder.push(format!("build:{}", self.label));
        output("built");
        Ok(())
    }

    fn launch(&self, ctx: &LaunchContext<'_>) -> BackendResult<RunningProcess> {
        self.recorder.push(format!("launch:{}", self.label));
        if self.panics_on_launch {
            panic!("launch of '{}' blew up", self.label);
        }
        self.recorder
            .envs
            .lock()
            .unwrap()
            .insert(self.label.clone(), ctx.env.clone());
        let child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| BackendError::CommandFailed("sleep 30".to_string(), e))?;
        Ok(RunningProcess::from_child(child))
    }

    fn stop(&self, process: &mut RunningProcess, _ctx: &StopContext<'_>) -> BackendResult<()> {
        self.recorder.push(format!("stop:{}", self.label));
        process::send_signal(process.pid(), Signal::SIGTERM)
    }
}

struct RecordingLoader {
    recorder: Arc<Recorder>,
}

impl BackendLoader for RecordingLoader {
    fn kind(&self) -> &'static str {
        "recording"
    }

    fn load(&self, def: &BackendDef) -> BackendResult<Arc<dyn Backend>> {
        let label = def
            .config
            .get("label")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::InvalidConfig("missing label".to_string()))?;
        let with_build = def
            .config
            .get("build")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let panics_on_launch = def
            .config
            .get("panic")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        Ok(Arc::new(RecordingBackend {
            label: label.to_string(),
            with_build,
            panics_on_launch,
            recorder: Arc::clone(&self.recorder),
        }))
    }
}

#[derive(Debug, Default)]
struct RecordingUi {
    answer: bool,
    infos: Mutex<Vec<String>>,
    lines: Mutex<Vec<LogLine>>,
}

impl Provider for RecordingUi {
    fn info(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn error(&self, message: &str) {
        self.infos.lock().unwrap().push(message.to_string());
    }

    fn confirm(&self, _prompt: &str) -> bool {
        self.answer
    }

    fn list(&self, _services: &[ListEntry], _groups: &[ListEntry]) {}

    fn status(&self, _statuses: &[ServiceStatus]) {}

    fn show_log(&self, lines: Receiver<LogLine>, _multi_service: bool) {
        for line in lines {
            self.lines.lock().unwrap().push(line);
        }
    }
}

// --- Setup ---

struct Fixture {
    _tmp: TempDir,
    config: PathBuf,
    dirs: HomeDirs,
    recorder: Arc<Recorder>,
    ui: Arc<RecordingUi>,
    last_root: Arc<Mutex<Option<TaskSnapshot>>>,
}

impl Fixture {
    fn new(config_json: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let config = tmp.path().join("muster.json");
        fs::write(&config, config_json).unwrap();
        let dirs = HomeDirs::at(tmp.path().join("home")).unwrap();
        Self {
            config,
            dirs,
            recorder: Arc::new(Recorder::default()),
            ui: Arc::new(RecordingUi::default()),
            last_root: Arc::new(Mutex::new(None)),
            _tmp: tmp,
        }
    }

    fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::with_defaults();
        registry.register(Box::new(RecordingLoader {
            recorder: Arc::clone(&self.recorder),
        }));
        registry
    }

    fn client_with(&self, settings: Settings) -> Result<Client, OrchestratorError> {
        let sink = Arc::clone(&self.last_root);
        let handler: TaskHandler = Arc::new(move |update: &TaskUpdate| {
            *sink.lock().unwrap() = Some(update.root.clone());
        });
        let ui: Arc<dyn Provider> = self.ui.clone();
        Ok(Client::load(&self.config, &self.registry(), self.dirs.clone(), settings, ui)?
            .with_task_handler(handler))
    }

    fn client(&self) -> Client {
        self.client_with(Settings {
            working_dir: self.config.parent().unwrap().to_path_buf(),
            launch_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            ..Settings::default()
        })
        .unwrap()
    }

    fn last_root(&self) -> TaskSnapshot {
        self.last_root.lock().unwrap().clone().unwrap()
    }

    fn pid_of(&self, client: &Client, name: &str) -> u32 {
        client.status(&[name.to_string()]).unwrap()[0].pid
    }
}

fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

const RECORDING_CONFIG: &str = r#"{
    "env": ["SHARED=root"],
    "groups": [
        { "name": "all", "children": ["a", "b", "c"], "env": ["MODE=group", "SHARED=group"] }
    ],
    "services": [
        { "name": "a", "backend": { "type": "recording", "label": "a" } },
        { "name": "b", "backend": { "type": "recording", "label": "b", "build": true } },
        { "name": "c", "env": ["MODE=own"], "backend": { "type": "recording", "label": "c" } }
    ]
}"#;

// --- Tests ---

#[test]
fn test_duplicate_alias_fails_resolution() {
    let fixture = Fixture::new(
        r#"{
        "groups": [{ "name": "g1", "children": ["svc-a", "svc-b"] }],
        "services": [
            { "name": "svc-a", "aliases": ["svc-a2"], "commands": { "launch": "sleep 1" } },
            { "name": "svc-b", "commands": { "launch": "sleep 1" } },
            { "name": "svc-a2", "commands": { "launch": "sleep 1" } }
        ]
    }"#,
    );
    let err = fixture.client_with(Settings::default()).unwrap_err();
    assert_eq!(err.to_string(), "Duplicate name or alias: svc-a2");
}

#[test]
fn test_start_twice_warns_and_keeps_pid() {
    let fixture = Fixture::new(RECORDING_CONFIG);
    let client = fixture.client();

    client.start(&names(&["a"]), true).unwrap();
    let pid = fixture.pid_of(&client, "a");
    assert_ne!(pid, 0);

    let second = client.start(&names(&["a"]), true).unwrap();
    assert_eq!(
        second.find(&["a", "Start"]).map(|t| t.state),
        Some(TaskState::Warning)
    );
    assert_eq!(fixture.pid_of(&client, "a"), pid);
    assert_eq!(fixture.recorder.events(), vec!["launch:a"]);

    client.stop(&names(&["a"])).unwrap();
    assert_eq!(fixture.pid_of(&client, "a"), 0);
}

#[test]
fn test_stop_when_not_running_skips_backend() {
    let fixture = Fixture::new(RECORDING_CONFIG);
    let client = fixture.client();

    let snapshot = client.stop(&names(&["all"])).unwrap();
    assert!(fixture.recorder.events().is_empty());
    assert_eq!(snapshot.count_in_state(TaskState::Warning), 3);
    assert_eq!(snapshot.count_in_state(TaskState::Failed), 0);
}

#[test]
fn test_group_start_builds_and_passes_group_env() {
    let fixture = Fixture::new(RECORDING_CONFIG);
    let client = fixture.client();

    let snapshot = client.start(&names(&["all"]), false).unwrap();
    assert_eq!(
        snapshot.find(&["all", "b", "Build"]).map(|t| t.output.clone()),
        Some(vec!["built".to_string()])
    );
    {
        let envs = fixture.recorder.envs.lock().unwrap();
        let a = &envs["a"];
        assert_eq!(a.get("MODE").map(String::as_str), Some("group"));
        assert_eq!(a.get("SHARED").map(String::as_str), Some("root"));
        let c = &envs["c"];
        assert_eq!(c.get("MODE").map(String::as_str), Some("own"));
    }
    let mut events = fixture.recorder.events();
    events.sort();
    assert_eq!(events, vec!["build:b", "launch:a", "launch:b", "launch:c"]);

    client.stop(&names(&["all"])).unwrap();
    for name in ["a", "b", "c"] {
        assert_eq!(fixture.pid_of(&client, name), 0);
    }
}

#[test]
fn test_readiness_timeout_fails_and_cleans_up() {
    let fixture = Fixture::new(
        r#"{
        "services": [{
            "name": "slow",
            "commands": { "launch": "sh -c 'echo warming up; sleep 30'" },
            "launch_checks": { "log_text": "ready to serve" }
        }]
    }"#,
    );
    let client = fixture
        .client_with(Settings {
            launch_timeout: Duration::from_millis(600),
            stop_timeout: Duration::from_secs(5),
            ..Settings::default()
        })
        .unwrap();

    let err = client.start(&names(&["slow"]), true).unwrap_err();
    match err {
        OrchestratorError::Failed { count, names } => {
            assert_eq!(count, 1);
            assert_eq!(names, vec!["slow"]);
        }
        other => panic!("Expected a failed flow, got {:?}", other),
    }

    let root = fixture.last_root();
    let start = root.find(&["slow", "Start"]).unwrap();
    assert_eq!(start.state, TaskState::Failed);
    assert!(start.output.iter().any(|l| l == "warming up"));
    assert!(start.output.iter().any(|l| l.contains("did not become ready")));
    assert_eq!(fixture.pid_of(&client, "slow"), 0);
}

#[test]
fn test_restart_all_goes_in_ascending_pid_order() {
    let fixture = Fixture::new(RECORDING_CONFIG);
    // Records pointing at pids no live process can have.
    for (name, pid) in [("a", 4_200_013), ("b", 4_200_011), ("c", 4_200_012)] {
        let record = serde_json::json!({
            "pid": pid,
            "service_name": name,
            "config_file": fixture.config,
            "overrides": { "env": [] },
            "run_id": null,
            "started_at": null
        });
        fs::write(
            fixture.dirs.live_dir.join(format!("{}.json", name)),
            record.to_string(),
        )
        .unwrap();
    }

    let client = fixture.client();
    client.restart(&[], true, true).unwrap().unwrap();
    assert_eq!(
        fixture.recorder.events(),
        vec!["stop:b", "launch:b", "stop:c", "launch:c", "stop:a", "launch:a"]
    );

    client.stop(&names(&["all"])).unwrap();
}

#[test]
fn test_restart_all_declined_does_nothing() {
    let fixture = Fixture::new(RECORDING_CONFIG);
    let client = fixture.client();
    assert!(client.restart(&[], false, true).unwrap().is_none());
    assert!(fixture.recorder.events().is_empty());
    assert_eq!(
        fixture.ui.infos.lock().unwrap().as_slice(),
        ["Restart cancelled.".to_string()]
    );
}

#[test]
fn test_unknown_names_are_rejected() {
    let fixture = Fixture::new(RECORDING_CONFIG);
    let client = fixture.client();
    let err = client.start(&names(&["a", "nope"]), true).unwrap_err();
    assert_eq!(err.to_string(), "No service or group named: nope");
}

#[test]
fn test_log_follows_until_cancelled() {
    let fixture = Fixture::new(
        r#"{
        "services": [{
            "name": "chatty",
            "commands": { "launch": "sh -c 'echo hello from chatty; sleep 30'" },
            "launch_checks": { "log_text": "hello" }
        }]
    }"#,
    );
    let client = fixture.client();
    client.start(&names(&["chatty"]), true).unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let trigger = Arc::clone(&cancel);
    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(500));
        trigger.store(true, Ordering::Relaxed);
    });
    client.log(&names(&["chatty"]), &cancel).unwrap();
    canceller.join().unwrap();

    let lines = fixture.ui.lines.lock().unwrap().clone();
    assert!(lines.iter().any(|l| l.message == "hello from chatty" && l.service == "chatty"));

    client.stop(&names(&["chatty"])).unwrap();
}

#[test]
fn test_duplicate_from_import_fails_resolution() {
    let fixture = Fixture::new(
        r#"{
        "imports": ["more/extra.json"],
        "services": [{ "name": "api", "commands": { "launch": "sleep 1" } }]
    }"#,
    );
    let more = fixture.config.parent().unwrap().join("more");
    fs::create_dir_all(&more).unwrap();
    fs::write(
        more.join("extra.json"),
        r#"{ "services": [{ "name": "worker", "aliases": ["api"], "commands": { "launch": "sleep 1" } }] }"#,
    )
    .unwrap();

    let err = fixture.client_with(Settings::default()).unwrap_err();
    assert_eq!(err.to_string(), "Duplicate name or alias: api");
}

#[test]
fn test_log_ends_once_nothing_is_running() {
    let fixture = Fixture::new(
        r#"{
        "services": [{
            "name": "chatty",
            "commands": { "launch": "sh -c 'echo hello from chatty; sleep 30'" },
            "launch_checks": { "log_text": "hello" }
        }]
    }"#,
    );
    let client = fixture
        .client_with(Settings {
            working_dir: fixture.config.parent().unwrap().to_path_buf(),
            launch_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            log_liveness_interval: Duration::from_millis(100),
            ..Settings::default()
        })
        .unwrap();
    client.start(&names(&["chatty"]), true).unwrap();

    let cancel = Arc::new(AtomicBool::new(false));
    let started = std::time::Instant::now();
    std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(400));
            client.stop(&names(&["chatty"])).unwrap();
        });
        client.log(&names(&["chatty"]), &cancel).unwrap();
    });

    assert!(!cancel.load(Ordering::Relaxed));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(fixture.pid_of(&client, "chatty"), 0);
    let lines = fixture.ui.lines.lock().unwrap().clone();
    assert!(lines.iter().any(|l| l.message == "hello from chatty"));
}

#[test]
fn test_panicking_item_fails_its_task() {
    let fixture = Fixture::new(
        r#"{
        "services": [
            { "name": "boom", "backend": { "type": "recording", "label": "boom", "panic": true } },
            { "name": "fine", "backend": { "type": "recording", "label": "fine" } }
        ]
    }"#,
    );
    let client = fixture.client();

    let err = client.start(&names(&["boom", "fine"]), true).unwrap_err();
    match err {
        OrchestratorError::Failed { names, .. } => assert_eq!(names, vec!["boom"]),
        other => panic!("Expected a failed flow, got {:?}", other),
    }
    let root = fixture.last_root();
    assert_eq!(root.find(&["boom"]).map(|t| t.state), Some(TaskState::Failed));
    assert_eq!(
        root.find(&["fine", "Start"]).map(|t| t.state),
        Some(TaskState::Success)
    );

    client.stop(&names(&["fine"])).unwrap();
}
