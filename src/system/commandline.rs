// src/system/commandline.rs

//! The command-line backend: services described by a build, launch and stop command.

use crate::constants::COMMANDLINE_BACKEND;
use crate::models::BackendDef;
use crate::system::backend::{
    Backend, BackendError, BackendLoader, BackendResult, LaunchContext, OutputSink,
    ReadinessProbe, RunningProcess, StopContext,
};
use crate::system::process;
use nix::sys::signal::Signal;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Commands {
    pub build: Option<String>,
    pub launch: Option<String>,
    pub stop: Option<String>,
}

/// Readiness checks for a launched command. The first configured check wins, in the order
/// `log_text`, `log_pattern`, `ports`, `wait`.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LaunchChecks {
    pub log_text: Option<String>,
    pub log_pattern: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Milliseconds the process must stay alive.
    pub wait: Option<u64>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CommandLineConfig {
    #[serde(default)]
    pub commands: Commands,
    pub launch_checks: Option<LaunchChecks>,
}

#[derive(Debug, Clone)]
pub struct CommandLineBackend {
    commands: Commands,
    readiness: ReadinessProbe,
}

impl CommandLineBackend {
    pub fn new(config: CommandLineConfig) -> BackendResult<Self> {
        let readiness = match config.launch_checks {
            None => ReadinessProbe::Immediate,
            Some(checks) => readiness_from_checks(checks)?,
        };
        Ok(Self {
            commands: config.commands,
            readiness,
        })
    }
}

fn readiness_from_checks(checks: LaunchChecks) -> BackendResult<ReadinessProbe> {
    if let Some(text) = checks.log_text.filter(|t| !t.is_empty()) {
        return Ok(ReadinessProbe::LogText(text));
    }
    if let Some(pattern) = checks.log_pattern {
        let re = Regex::new(&pattern).map_err(|e| {
            BackendError::InvalidConfig(format!("invalid log_pattern '{}': {}", pattern, e))
        })?;
        return Ok(ReadinessProbe::LogPattern(re));
    }
    if !checks.ports.is_empty() {
        return Ok(ReadinessProbe::Ports(checks.ports));
    }
    Ok(checks
        .wait
        .map_or(ReadinessProbe::Immediate, |ms| {
            ReadinessProbe::Wait(Duration::from_millis(ms))
        }))
}

/// Splits a command line into a ready-to-configure `Command`.
fn prepare_command(command_line: &str, cwd: &Path) -> BackendResult<StdCommand> {
    let trimmed = command_line.trim();
    let parts = shlex::split(trimmed).ok_or_else(|| BackendError::CommandParse(trimmed.to_string()))?;
    let (program, args) = parts
        .split_first()
        .ok_or_else(|| BackendError::CommandParse(trimmed.to_string()))?;
    let mut command = StdCommand::new(program);
    command.args(args).current_dir(dunce::simplified(cwd));
    Ok(command)
}

fn forward_lines<R: Read>(reader: R, output: OutputSink<'_>) {
    for line in BufReader::new(reader).lines() {
        match line {
            Ok(line) => output(&line),
            Err(e) => {
                log::debug!("Stopped reading command output: {}", e);
                break;
            }
        }
    }
}

impl Backend for CommandLineBackend {
    fn has_build_step(&self) -> bool {
        self.commands.build.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    fn has_launch_step(&self) -> bool {
        self.commands.launch.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    fn build(
        &self,
        working_dir: &Path,
        env: &HashMap<String, String>,
        output: OutputSink<'_>,
    ) -> BackendResult<()> {
        let command_line = self
            .commands
            .build
            .as_deref()
            .ok_or(BackendError::Unsupported("build"))?;
        log::debug!("Running build command '{}'.", command_line);

        let mut child = prepare_command(command_line, working_dir)?
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackendError::CommandFailed(command_line.to_string(), e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        std::thread::scope(|scope| {
            if let Some(stderr) = stderr {
                scope.spawn(move || forward_lines(stderr, output));
            }
            if let Some(stdout) = stdout {
                forward_lines(stdout, output);
            }
        });

        let status = child
            .wait()
            .map_err(|e| BackendError::CommandFailed(command_line.to_string(), e))?;
        if !status.success() {
            return Err(BackendError::NonZeroExitStatus(command_line.to_string()));
        }
        Ok(())
    }

    fn launch(&self, ctx: &LaunchContext<'_>) -> BackendResult<RunningProcess> {
        let command_line = self
            .commands
            .launch
            .as_deref()
            .ok_or(BackendError::Unsupported("launch"))?;

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(ctx.run_log)?;
        let err_file = log_file.try_clone()?;

        let child = prepare_command(command_line, ctx.working_dir)?
            .env_clear()
            .envs(ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file))
            // Own process group, so stopping reaches everything the command spawns.
            .process_group(0)
            .spawn()
            .map_err(|e| BackendError::CommandFailed(command_line.to_string(), e))?;
        log::debug!("Launched '{}' with PID {}.", command_line, child.id());
        Ok(RunningProcess::from_child(child))
    }

    fn stop(&self, process: &mut RunningProcess, ctx: &StopContext<'_>) -> BackendResult<()> {
        let Some(command_line) = self.commands.stop.as_deref().filter(|c| !c.trim().is_empty())
        else {
            return process::send_signal(process.pid(), Signal::SIGTERM);
        };

        log::debug!("Running stop command '{}'.", command_line);
        let status = prepare_command(command_line, ctx.working_dir)?
            .envs(ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| BackendError::CommandFailed(command_line.to_string(), e))?;
        if !status.success() {
            return Err(BackendError::NonZeroExitStatus(command_line.to_string()));
        }
        Ok(())
    }

    fn readiness(&self) -> ReadinessProbe {
        self.readiness.clone()
    }
}

/// Loads `type = "commandline"` backends.
#[derive(Debug)]
pub struct CommandLineLoader;

impl BackendLoader for CommandLineLoader {
    fn kind(&self) -> &'static str {
        COMMANDLINE_BACKEND
    }

    fn load(&self, def: &BackendDef) -> BackendResult<Arc<dyn Backend>> {
        let config: CommandLineConfig =
            serde_json::from_value(serde_json::Value::Object(def.config.clone()))
                .map_err(|e| BackendError::InvalidConfig(e.to_string()))?;
        Ok(Arc::new(CommandLineBackend::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn backend(json: &str) -> CommandLineBackend {
        let config: CommandLineConfig = serde_json::from_str(json).unwrap();
        CommandLineBackend::new(config).unwrap()
    }

    #[test]
    fn test_steps_follow_configured_commands() {
        let b = backend(r#"{ "commands": { "launch": "sleep 10" } }"#);
        assert!(!b.has_build_step());
        assert!(b.has_launch_step());
        assert!(matches!(b.readiness(), ReadinessProbe::Immediate));
    }

    #[test]
    fn test_launch_checks_select_probe() {
        let b = backend(r#"{ "launch_checks": { "log_text": "started", "wait": 100 } }"#);
        assert!(matches!(b.readiness(), ReadinessProbe::LogText(t) if t == "started"));

        let b = backend(r#"{ "launch_checks": { "ports": [8080, 8081] } }"#);
        assert!(matches!(b.readiness(), ReadinessProbe::Ports(p) if p == vec![8080, 8081]));

        let b = backend(r#"{ "launch_checks": { "wait": 1500 } }"#);
        assert!(
            matches!(b.readiness(), ReadinessProbe::Wait(d) if d == Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_invalid_pattern_is_a_config_error() {
        let config: CommandLineConfig =
            serde_json::from_str(r#"{ "launch_checks": { "log_pattern": "(unclosed" } }"#).unwrap();
        let err = CommandLineBackend::new(config).unwrap_err();
        assert!(matches!(err, BackendError::InvalidConfig(_)));
    }

    #[test]
    fn test_build_streams_output_lines() {
        let dir = TempDir::new().unwrap();
        let b = backend(r#"{ "commands": { "build": "echo 'hello build'" } }"#);
        let lines = Mutex::new(Vec::new());
        let sink = |line: &str| lines.lock().unwrap().push(line.to_string());
        b.build(dir.path(), &HashMap::new(), &sink).unwrap();
        assert_eq!(lines.into_inner().unwrap(), vec!["hello build"]);
    }

    #[test]
    fn test_failed_build_reports_exit_status() {
        let dir = TempDir::new().unwrap();
        let b = backend(r#"{ "commands": { "build": "false" } }"#);
        let sink = |_: &str| {};
        let err = b.build(dir.path(), &HashMap::new(), &sink).unwrap_err();
        assert!(matches!(err, BackendError::NonZeroExitStatus(_)));
    }

    #[test]
    fn test_launch_writes_to_run_log_and_stops() {
        let dir = TempDir::new().unwrap();
        let run_log = dir.path().join("svc.log");
        let b = backend(r#"{ "commands": { "launch": "sleep 30" } }"#);
        let env: HashMap<String, String> = std::env::vars().collect();
        let ctx = LaunchContext {
            working_dir: dir.path(),
            env: &env,
            run_log: &run_log,
        };
        let mut running = b.launch(&ctx).unwrap();
        assert!(run_log.exists());
        assert!(!running.has_exited().unwrap());

        let stop_ctx = StopContext {
            working_dir: dir.path(),
            env: &env,
        };
        b.stop(&mut running, &stop_ctx).unwrap();
        process::ensure_stopped(&mut running, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_loader_reads_opaque_config() {
        let def: BackendDef = serde_json::from_str(
            r#"{ "type": "commandline", "commands": { "build": "make", "launch": "./run" } }"#,
        )
        .unwrap();
        let loaded = CommandLineLoader.load(&def).unwrap();
        assert!(loaded.has_build_step());
        assert!(loaded.has_launch_step());
    }
}
