// src/constants.rs

use std::time::Duration;

/// Config file names searched for, in order, when no `--config` is given.
pub const CONFIG_FILENAMES: &[&str] = &["muster.json", "muster.toml"];

/// Environment variable that overrides the home directory for state and logs.
pub const HOME_ENV_VAR: &str = "MUSTER_HOME";

/// The name of the directory (under the home root) holding persisted instance state.
pub const STATE_DIR_NAME: &str = "state";

/// The directory (under the state directory) holding one live record per running service.
pub const LIVE_DIR_NAME: &str = "live";

/// The directory (under the state directory) holding each service's archived run records.
pub const RUNS_DIR_NAME: &str = "runs";

/// The name of the directory (under the home root) holding run logs.
pub const LOG_DIR_NAME: &str = "logs";

/// Extension of the live instance record and the archived run records.
pub const RECORD_EXTENSION: &str = "json";

/// Extension of a service run log.
pub const RUN_LOG_EXTENSION: &str = "log";

/// The backend type used by the `commands` shorthand on a service.
pub const COMMANDLINE_BACKEND: &str = "commandline";

/// How long a launch may take to become ready before it is treated as failed.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a stopped process gets to exit before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How often `log` checks whether any followed service is still running.
pub const DEFAULT_LOG_LIVENESS_INTERVAL: Duration = Duration::from_secs(5);

/// How long a launched process with no readiness checks must survive.
pub const LAUNCH_GRACE_PERIOD: Duration = Duration::from_millis(250);

/// Poll interval for log following, readiness checks and exit waits.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);
