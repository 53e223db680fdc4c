use clap::Parser;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const DEFAULT_RUNTIME: &str = "/opt/saba-chan/docker/docker";
const DEFAULT_TAIL_LINES: u32 = 200;
const LOG_FILTER_ENV: &str = "DOCKER_IO_LOG";

const EXIT_USAGE: i32 = 1;
const EXIT_RUNTIME_NOT_FOUND: i32 = 2;
const EXIT_EXEC_FAILED: i32 = 3;
const EXIT_CONFIG: i32 = 4;

/// Replays recent container output, then becomes `<runtime> attach` for the
/// same container.
///
/// Exit codes: 1 usage (or a dry-run plan that cannot be printed), 2 runtime
/// not found, 3 exec failed, 4 config error. Once the attach hand-off
/// succeeds, the exit code is the runtime's.
#[derive(Parser, Debug)]
#[command(name = "docker-io", version, about = "Container console bridge")]
struct Cli {
    /// Container name or id, passed verbatim to the runtime.
    container: OsString,
    /// Runtime executable; overrides the configured path.
    runtime: Option<OsString>,
    /// Lines of history to replay before attaching (0 disables replay).
    #[arg(long)]
    tail: Option<u32>,
    /// Replay history without per-line timestamps.
    #[arg(long)]
    no_timestamps: bool,
    /// Configuration file (default: ~/.config/docker-io/config.yaml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the resolved plan as JSON and exit without running anything.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Error)]
enum BridgeError {
    #[error("config error: {0}")]
    Config(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("runtime not found at {runtime}: {reason}")]
    RuntimeNotFound { runtime: String, reason: String },
    #[error("exec failed: {0}")]
    ExecFailed(io::Error),
}

impl BridgeError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Yaml(_) => EXIT_CONFIG,
            Self::RuntimeNotFound { .. } => EXIT_RUNTIME_NOT_FOUND,
            Self::ExecFailed(_) => EXIT_EXEC_FAILED,
            // Only reachable while printing a dry-run plan.
            Self::Json(_) => EXIT_USAGE,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    runtime: RuntimeConfig,
    replay: ReplayPolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct RuntimeConfig {
    path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct ReplayPolicy {
    tail_lines: u32,
    timestamps: bool,
    merge_stderr: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            runtime: RuntimeConfig::default(),
            replay: ReplayPolicy::default(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_RUNTIME.to_string(),
        }
    }
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            tail_lines: DEFAULT_TAIL_LINES,
            timestamps: true,
            merge_stderr: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ConfigLocation {
    path: PathBuf,
    /// Named explicitly by flag or env; a missing file is an error.
    required: bool,
}

#[derive(Debug, Clone)]
struct BridgePlan {
    container: OsString,
    runtime: OsString,
    replay: ReplayPolicy,
}

impl BridgePlan {
    fn new(cli: &Cli, cfg: &Config) -> Self {
        let runtime = match cli.runtime.as_ref() {
            Some(runtime) => runtime.clone(),
            None if !cfg.runtime.path.trim().is_empty() => OsString::from(&cfg.runtime.path),
            None => OsString::from(DEFAULT_RUNTIME),
        };
        let mut replay = cfg.replay.clone();
        if let Some(tail) = cli.tail {
            replay.tail_lines = tail;
        }
        if cli.no_timestamps {
            replay.timestamps = false;
        }
        Self {
            container: cli.container.clone(),
            runtime,
            replay,
        }
    }

    fn logs_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("logs"),
            OsString::from("--tail"),
            OsString::from(self.replay.tail_lines.to_string()),
        ];
        if self.replay.timestamps {
            args.push(OsString::from("--timestamps"));
        }
        args.push(self.container.clone());
        args
    }

    fn attach_args(&self) -> Vec<OsString> {
        // Signals aimed at the bridge must never reach the container.
        vec![
            OsString::from("attach"),
            OsString::from("--sig-proxy=false"),
            self.container.clone(),
        ]
    }

    fn container_label(&self) -> String {
        self.container.to_string_lossy().into_owned()
    }

    fn runtime_label(&self) -> String {
        self.runtime.to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplayOutcome {
    Completed,
    Skipped,
    Failed { status_code: i32 },
    SpawnFailed { reason: String },
}

impl fmt::Display for ReplayOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed { status_code } => write!(f, "failed with status {status_code}"),
            Self::SpawnFailed { reason } => write!(f, "could not start: {reason}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

trait ContainerRuntime {
    /// Runs the logs command to completion with stdin closed and stdout
    /// inherited, returning its exit status code.
    fn replay_logs(
        &self,
        runtime: &OsStr,
        args: &[OsString],
        merge_stderr: bool,
    ) -> Result<i32, io::Error>;

    fn resolve(&self, runtime: &OsStr) -> Result<PathBuf, which::Error>;

    /// Hands the process over to `program`. On unix this only returns on
    /// failure; elsewhere it returns the child's exit code.
    fn exec(&self, program: &Path, arg0: &OsStr, args: &[OsString]) -> Result<i32, io::Error>;
}

struct SystemRuntime;

impl ContainerRuntime for SystemRuntime {
    fn replay_logs(
        &self,
        runtime: &OsStr,
        args: &[OsString],
        merge_stderr: bool,
    ) -> Result<i32, io::Error> {
        let mut cmd = Command::new(runtime);
        cmd.args(args).stdin(Stdio::null()).stdout(Stdio::inherit());
        if merge_stderr {
            cmd.stderr(io::stdout());
        } else {
            cmd.stderr(Stdio::inherit());
        }
        let status = cmd.status()?;
        Ok(status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 }))
    }

    fn resolve(&self, runtime: &OsStr) -> Result<PathBuf, which::Error> {
        which::which(runtime)
    }

    /// Plain `execve`: unlike `execvp`, a file the kernel refuses to run
    /// (ENOEXEC) is reported instead of being retried through `/bin/sh`.
    #[cfg(unix)]
    fn exec(&self, program: &Path, arg0: &OsStr, args: &[OsString]) -> Result<i32, io::Error> {
        use nix::sys::signal::{signal, SigHandler, Signal};
        use nix::unistd::execve;
        use std::os::unix::ffi::OsStrExt;

        let path = c_string(program.as_os_str().as_bytes())?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(c_string(arg0.as_bytes())?);
        for arg in args {
            argv.push(c_string(arg.as_bytes())?);
        }
        let mut envp = Vec::new();
        for (key, value) in env::vars_os() {
            let mut entry = key.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            envp.push(c_string(&entry)?);
        }
        // The Rust runtime ignores SIGPIPE and ignored signals survive exec.
        // SAFETY: single-threaded, and SIG_DFL installs no handler.
        unsafe {
            let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
        }
        match execve(&path, &argv, &envp) {
            Ok(never) => match never {},
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    #[cfg(not(unix))]
    fn exec(&self, program: &Path, _arg0: &OsStr, args: &[OsString]) -> Result<i32, io::Error> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()?;
        Ok(status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 }))
    }
}

#[cfg(unix)]
fn c_string(bytes: &[u8]) -> Result<std::ffi::CString, io::Error> {
    std::ffi::CString::new(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            std::process::exit(if err.use_stderr() { EXIT_USAGE } else { 0 });
        }
    };
    init_logging();

    let code = match run(&cli, &SystemRuntime) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("docker-io: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_logging() {
    // stdout carries the container console, so diagnostics stay on stderr.
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn run<R: ContainerRuntime>(cli: &Cli, runtime: &R) -> Result<i32, BridgeError> {
    let location = resolve_config_path(cli.config.as_ref());
    let cfg = load_config(&location)?;
    let plan = BridgePlan::new(cli, &cfg);
    if cli.dry_run {
        print_plan(&plan, runtime)?;
        return Ok(0);
    }
    run_bridge(&plan, runtime)
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> ConfigLocation {
    if let Some(path) = override_path {
        return ConfigLocation {
            path: path.clone(),
            required: true,
        };
    }
    if let Ok(path) = env::var("DOCKER_IO_CONFIG") {
        return ConfigLocation {
            path: PathBuf::from(path),
            required: true,
        };
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    ConfigLocation {
        path: base,
        required: false,
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("DOCKER_IO_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("docker-io");
    base
}

fn load_config(location: &ConfigLocation) -> Result<Config, BridgeError> {
    if !location.path.exists() {
        if location.required {
            return Err(BridgeError::Config(format!(
                "config file not found: {}",
                location.path.display()
            )));
        }
        debug!(path = %location.path.display(), "no config file, using defaults");
        return Ok(Config::default());
    }
    let content = fs::read_to_string(&location.path).map_err(|err| {
        BridgeError::Config(format!("cannot read {}: {err}", location.path.display()))
    })?;
    read_config_from_str(&content).map_err(|err| {
        BridgeError::Config(format!(
            "config is invalid. Please edit {} and try again. ({})",
            location.path.display(),
            err
        ))
    })
}

fn read_config_from_str(content: &str) -> Result<Config, BridgeError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != 1 {
        return Err(BridgeError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    Ok(cfg)
}

fn run_bridge<R: ContainerRuntime>(plan: &BridgePlan, runtime: &R) -> Result<i32, BridgeError> {
    let outcome = replay_history(plan, runtime);
    debug!(container = %plan.container_label(), %outcome, "replay stage finished");
    attach(plan, runtime)
}

/// Best effort: a container without logs, or a runtime hiccup, must not
/// keep the caller from attaching.
fn replay_history<R: ContainerRuntime>(plan: &BridgePlan, runtime: &R) -> ReplayOutcome {
    if plan.replay.tail_lines == 0 {
        return ReplayOutcome::Skipped;
    }
    let args = plan.logs_args();
    debug!(runtime = %plan.runtime_label(), ?args, "replaying container history");
    match runtime.replay_logs(&plan.runtime, &args, plan.replay.merge_stderr) {
        Ok(0) => ReplayOutcome::Completed,
        Ok(status_code) => {
            warn!(
                container = %plan.container_label(),
                status_code,
                "log replay exited unsuccessfully; attaching anyway"
            );
            ReplayOutcome::Failed { status_code }
        }
        Err(err) => {
            warn!(
                container = %plan.container_label(),
                runtime = %plan.runtime_label(),
                error = %err,
                "log replay could not start; attaching anyway"
            );
            ReplayOutcome::SpawnFailed {
                reason: err.to_string(),
            }
        }
    }
}

fn attach<R: ContainerRuntime>(plan: &BridgePlan, runtime: &R) -> Result<i32, BridgeError> {
    let program = runtime
        .resolve(&plan.runtime)
        .map_err(|err| BridgeError::RuntimeNotFound {
            runtime: plan.runtime_label(),
            reason: err.to_string(),
        })?;
    debug!(
        program = %program.display(),
        container = %plan.container_label(),
        "handing over to attach"
    );
    runtime
        .exec(&program, &plan.runtime, &plan.attach_args())
        .map_err(BridgeError::ExecFailed)
}

fn print_plan<R: ContainerRuntime>(plan: &BridgePlan, runtime: &R) -> Result<(), BridgeError> {
    let resolved = runtime.resolve(&plan.runtime).ok();
    let logs_argv = if plan.replay.tail_lines == 0 {
        None
    } else {
        Some(argv(&plan.runtime, plan.logs_args()))
    };
    let payload = JsonResult {
        ok: true,
        result: Some(json!({
            "container": plan.container_label(),
            "runtime": plan.runtime_label(),
            "resolved_runtime": resolved,
            "logs_argv": logs_argv,
            "attach_argv": argv(&plan.runtime, plan.attach_args()),
            "replay": plan.replay,
        })),
        error: None,
    };
    print_json(&payload)
}

fn argv(program: &OsStr, args: Vec<OsString>) -> Vec<String> {
    std::iter::once(program)
        .chain(args.iter().map(OsString::as_os_str))
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BridgeError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
