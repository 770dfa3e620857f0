//! External command runner
//!
//! Runs a program on the host or inside the target root (through `chroot`),
//! optionally feeding it input, enforcing a timeout and streaming output
//! lines to a callback. Problems are reported as data in `CommandResult`,
//! never as panics or `Err`.

use crate::job::JobResult;
use crate::process_guard::{self, CommandProcessGroup, TrackedChild};
use crate::storage::GlobalStore;
use nix::sys::signal::Signal;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use strum::{Display, EnumString};
use tracing::{debug, warn};

/// Store key holding the mount point of the system being installed.
pub const ROOT_MOUNT_POINT_KEY: &str = "rootMountPoint";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERMINATE_GRACE: Duration = Duration::from_millis(500);
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Where a command runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum RunLocation {
    #[default]
    Host,
    /// Inside the target root, via `chroot`.
    Target,
}

/// Exit code plus merged stdout/stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub output: String,
}

impl CommandResult {
    /// Killed by a signal, or the wait itself failed.
    pub const CRASHED: i32 = -1;
    pub const FAILED_TO_START: i32 = -2;
    /// Missing target root or working directory.
    pub const NO_WORKING_DIRECTORY: i32 = -3;
    pub const TIMED_OUT: i32 = -4;

    pub fn new(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn this result into a job result with a readable explanation.
    pub fn explain(&self, command: &str, timeout: Option<Duration>) -> JobResult {
        match self.exit_code {
            0 => JobResult::ok(),
            Self::CRASHED => JobResult::error(
                "External command crashed.",
                format!("Command `{}` crashed.", command),
            ),
            Self::FAILED_TO_START => JobResult::error(
                "External command failed to start.",
                format!("Command `{}` failed to start.", command),
            ),
            Self::NO_WORKING_DIRECTORY => JobResult::error(
                "Internal error when starting command.",
                format!("Bad parameters for process job call `{}`.", command),
            ),
            Self::TIMED_OUT => JobResult::error(
                "External command failed to finish.",
                format!(
                    "Command `{}` failed to finish in {} seconds.",
                    command,
                    timeout.unwrap_or_default().as_secs()
                ),
            ),
            code => {
                let mut details =
                    format!("Command `{}` finished with exit code {}.", command, code);
                if !self.output.is_empty() {
                    details.push_str("\nOutput:\n");
                    details.push_str(&self.output);
                }
                JobResult::error("External command finished with errors.", details)
            }
        }
    }
}

/// The target root published in the store, if any.
pub fn target_root(storage: &GlobalStore) -> Option<PathBuf> {
    storage
        .value(ROOT_MOUNT_POINT_KEY)
        .as_str()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

/// Builder for one command execution.
pub struct Runner<'a> {
    argv: Vec<String>,
    location: RunLocation,
    target_root: Option<PathBuf>,
    working_directory: Option<PathBuf>,
    input: Option<String>,
    timeout: Option<Duration>,
    env: Vec<(String, String)>,
    on_output: Option<Box<dyn FnMut(&str) + 'a>>,
}

impl<'a> Runner<'a> {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            location: RunLocation::Host,
            target_root: None,
            working_directory: None,
            input: None,
            timeout: None,
            env: Vec::new(),
            on_output: None,
        }
    }

    pub fn location(mut self, location: RunLocation) -> Self {
        self.location = location;
        self
    }

    pub fn target_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.target_root = Some(root.into());
        self
    }

    /// Use the store's `rootMountPoint` as the target root, if set.
    pub fn target_root_from(mut self, storage: &GlobalStore) -> Self {
        self.target_root = target_root(storage);
        self
    }

    /// Working directory; for target runs it is resolved inside the root.
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Zero means no timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Called with each output line, on the thread that calls `run`.
    pub fn on_output(mut self, callback: impl FnMut(&str) + 'a) -> Self {
        self.on_output = Some(Box::new(callback));
        self
    }

    /// The command as given, joined with spaces.
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }

    pub fn configured_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run and wait for the command.
    pub fn run(self) -> CommandResult {
        let Runner {
            argv,
            location,
            target_root,
            working_directory,
            input,
            timeout,
            env,
            mut on_output,
        } = self;

        if argv.is_empty() {
            return CommandResult::new(CommandResult::FAILED_TO_START, "no command given");
        }

        let (program, cwd) = match resolve_invocation(
            &argv,
            location,
            target_root.as_deref(),
            working_directory.as_deref(),
        ) {
            Ok(resolved) => resolved,
            Err(reason) => {
                warn!("Cannot run `{}`: {}", argv.join(" "), reason);
                return CommandResult::new(CommandResult::NO_WORKING_DIRECTORY, reason);
            }
        };

        debug!("Running {:?} ({}, timeout {:?})", program, location, timeout);

        let mut command = Command::new(&program[0]);
        command
            .args(&program[1..])
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(env)
            .in_new_process_group();
        if let Some(dir) = &cwd {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start `{}`: {}", program[0], e);
                return CommandResult::new(
                    CommandResult::FAILED_TO_START,
                    format!("failed to start {}: {}", program[0], e),
                );
            }
        };
        let _tracked = TrackedChild::new(child.id());

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(input.as_bytes()) {
                    debug!("Writing command input failed: {}", e);
                }
            });
        }

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, tx.clone());
        }
        drop(tx);

        let mut lines: Vec<String> = Vec::new();
        let mut deliver = |line: String| {
            if let Some(callback) = on_output.as_mut() {
                callback(&line);
            }
            lines.push(line);
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pipes_open = true;
        let exit = loop {
            if pipes_open {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(line) => deliver(line),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => pipes_open = false,
                }
            } else {
                thread::sleep(POLL_INTERVAL);
            }

            match child.try_wait() {
                Ok(Some(status)) => break Exit::Status(status),
                Ok(None) => {}
                Err(e) => {
                    warn!("Waiting for `{}` failed: {}", program[0], e);
                    terminate(&mut child);
                    break Exit::Lost;
                }
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    "Command `{}` timed out after {:?}",
                    argv.join(" "),
                    timeout.unwrap_or_default()
                );
                terminate(&mut child);
                break Exit::TimedOut;
            }
        };

        // Lines still in flight after exit; bounded in case a background
        // process inherited the pipes.
        let drain_until = Instant::now() + DRAIN_GRACE;
        while pipes_open {
            let remaining = drain_until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(line) => deliver(line),
                Err(_) => pipes_open = false,
            }
        }

        let exit_code = match exit {
            Exit::Status(status) => exit_code_of(status),
            Exit::TimedOut => CommandResult::TIMED_OUT,
            Exit::Lost => CommandResult::CRASHED,
        };
        debug!("Command `{}` finished with {}", argv.join(" "), exit_code);

        CommandResult::new(exit_code, lines.join("\n"))
    }
}

enum Exit {
    Status(ExitStatus),
    TimedOut,
    Lost,
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(CommandResult::CRASHED)
}

/// Final argv and working directory, or why the command cannot run.
fn resolve_invocation(
    argv: &[String],
    location: RunLocation,
    root: Option<&Path>,
    working_directory: Option<&Path>,
) -> Result<(Vec<String>, Option<PathBuf>), String> {
    match location {
        RunLocation::Host => {
            if let Some(dir) = working_directory {
                if !dir.is_dir() {
                    return Err(format!("working directory {} does not exist", dir.display()));
                }
            }
            Ok((argv.to_vec(), working_directory.map(Path::to_path_buf)))
        }
        RunLocation::Target => {
            let root = root.ok_or_else(|| "no target root is set".to_string())?;
            if !root.is_dir() {
                return Err(format!("target root {} does not exist", root.display()));
            }
            let cwd = match working_directory {
                Some(dir) => {
                    let inside = root.join(dir.strip_prefix("/").unwrap_or(dir));
                    if !inside.is_dir() {
                        return Err(format!(
                            "working directory {} does not exist",
                            inside.display()
                        ));
                    }
                    Some(inside)
                }
                None => None,
            };
            let mut program = vec!["chroot".to_string(), root.display().to_string()];
            program.extend(argv.iter().cloned());
            Ok((program, cwd))
        }
    }
}

fn spawn_line_reader<R: Read + Send + 'static>(source: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    while matches!(buf.last(), Some(b'\n' | b'\r')) {
                        buf.pop();
                    }
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// SIGTERM the child's group, give it a moment, SIGKILL whatever is left,
/// then reap the child.
fn terminate(child: &mut Child) {
    let pgid = child.id();
    let _ = process_guard::signal_group(pgid, Signal::SIGTERM);

    let start = Instant::now();
    while start.elapsed() < TERMINATE_GRACE {
        if let Ok(Some(_)) = child.try_wait() {
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }

    // The group may outlive its leader.
    let _ = process_guard::signal_group(pgid, Signal::SIGKILL);
    if let Err(e) = child.wait() {
        debug!("Reaping process {} failed: {}", pgid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_echo_captures_output() {
        let result = Runner::new(["echo", "hello"]).run();
        assert!(result.success());
        assert_eq!(result.output, "hello");
    }

    #[test]
    fn test_exit_code_reported() {
        let result = Runner::new(["sh", "-c", "exit 3"]).run();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[test]
    fn test_stderr_is_merged() {
        let result = Runner::new(["sh", "-c", "echo out; echo err >&2"]).run();
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[test]
    fn test_input_is_fed_to_stdin() {
        let result = Runner::new(["cat"]).input("line one\nline two\n").run();
        assert!(result.success());
        assert_eq!(result.output, "line one\nline two");
    }

    #[test]
    fn test_callback_sees_captured_lines() {
        let mut seen = Vec::new();
        let result = Runner::new(["sh", "-c", "printf 'a\\nb\\nc\\n'"])
            .on_output(|line| seen.push(line.to_string()))
            .run();
        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(result.output, seen.join("\n"));
    }

    #[test]
    fn test_missing_program_fails_to_start() {
        let result = Runner::new(["/nonexistent/definitely-not-here"]).run();
        assert_eq!(result.exit_code, CommandResult::FAILED_TO_START);
        assert!(!result.output.is_empty());
    }

    #[test]
    fn test_empty_argv_fails_to_start() {
        let result = Runner::new(Vec::<String>::new()).run();
        assert_eq!(result.exit_code, CommandResult::FAILED_TO_START);
    }

    #[test]
    fn test_target_without_root() {
        let result = Runner::new(["true"]).location(RunLocation::Target).run();
        assert_eq!(result.exit_code, CommandResult::NO_WORKING_DIRECTORY);
    }

    #[test]
    fn test_target_with_missing_root() {
        let result = Runner::new(["true"])
            .location(RunLocation::Target)
            .target_root("/nonexistent/target/root")
            .run();
        assert_eq!(result.exit_code, CommandResult::NO_WORKING_DIRECTORY);
    }

    #[test]
    fn test_missing_working_directory() {
        let result = Runner::new(["true"]).working_directory("/nonexistent/dir").run();
        assert_eq!(result.exit_code, CommandResult::NO_WORKING_DIRECTORY);
    }

    #[test]
    fn test_working_directory_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let result = Runner::new(["pwd"]).working_directory(dir.path()).run();
        let reported = std::fs::canonicalize(result.output.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[test]
    fn test_env_is_passed() {
        let result = Runner::new(["sh", "-c", "echo $INSTALLER_TEST_VAR"])
            .env("INSTALLER_TEST_VAR", "present")
            .run();
        assert_eq!(result.output, "present");
    }

    #[test]
    fn test_signal_death_is_crash() {
        let result = Runner::new(["sh", "-c", "kill -9 $$"]).run();
        assert_eq!(result.exit_code, CommandResult::CRASHED);
    }

    #[test]
    fn test_timeout_kills_command() {
        let start = Instant::now();
        let result = Runner::new(["sleep", "10"]).timeout(Duration::from_secs(1)).run();
        assert_eq!(result.exit_code, CommandResult::TIMED_OUT);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let runner = Runner::new(["true"]).timeout(Duration::ZERO);
        assert_eq!(runner.configured_timeout(), None);
        assert!(runner.run().success());
    }

    #[test]
    fn test_explain_messages() {
        assert!(CommandResult::new(0, "").explain("true", None).is_ok());

        let failed = CommandResult::new(2, "boom").explain("make", None);
        assert_eq!(failed.message(), "External command finished with errors.");
        assert!(failed.details().contains("exit code 2"));
        assert!(failed.details().contains("boom"));

        let timed_out = CommandResult::new(CommandResult::TIMED_OUT, "")
            .explain("sleep 10", Some(Duration::from_secs(1)));
        assert!(timed_out.details().contains("1 seconds"));

        let crashed = CommandResult::new(CommandResult::CRASHED, "").explain("x", None);
        assert_eq!(crashed.message(), "External command crashed.");
    }

    #[test]
    fn test_target_root_from_store() {
        let storage = GlobalStore::new();
        assert_eq!(target_root(&storage), None);
        storage.insert(ROOT_MOUNT_POINT_KEY, "");
        assert_eq!(target_root(&storage), None);
        storage.insert(ROOT_MOUNT_POINT_KEY, "/mnt/target");
        assert_eq!(target_root(&storage), Some(PathBuf::from("/mnt/target")));
    }

    #[test]
    fn test_run_location_names() {
        assert_eq!(RunLocation::Target.to_string(), "target");
        assert_eq!(RunLocation::from_str("host").unwrap(), RunLocation::Host);
    }
}
