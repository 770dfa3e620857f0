//! Configured shell command lists
//!
//! Modules that shell out describe their commands in configuration as a
//! single string, a list of strings, or `{command, timeout}` mappings. Each
//! command runs through `sh -c` after variable expansion:
//!
//! - `${ROOT}`: the target root mount point
//! - `${USER}`: the configured user name
//! - `${gs[dotted.key]}`: any scalar from global storage
//!
//! A leading `-` makes a command's failure non-fatal.

use crate::job::{JobContext, JobResult};
use crate::runner::{self, RunLocation, Runner};
use crate::storage::GlobalStore;
use crate::value::StoredValue;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Store key holding the name of the user being created.
pub const USERNAME_KEY: &str = "username";

/// One command with an optional per-command timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    command: String,
    timeout: Option<Duration>,
}

impl CommandLine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn from_value(value: &StoredValue) -> Option<Self> {
        match value {
            StoredValue::String(s) => Some(Self::new(s.as_str())),
            StoredValue::Mapping(map) => {
                let Some(command) = map.get("command").and_then(StoredValue::as_str) else {
                    warn!("Command entry has no 'command' string: {}", value);
                    return None;
                };
                let mut line = Self::new(command);
                match map.get("timeout").and_then(StoredValue::as_i64) {
                    Some(secs) if secs > 0 => line.timeout = Some(Duration::from_secs(secs as u64)),
                    Some(_) => warn!("Ignoring non-positive timeout for '{}'", command),
                    None => {}
                }
                Some(line)
            }
            other => {
                warn!("Ignoring command entry of type {}", other.type_name());
                None
            }
        }
    }
}

/// Ordered commands sharing a run location and default timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandList {
    commands: Vec<CommandLine>,
    location: RunLocation,
    default_timeout: Duration,
}

impl CommandList {
    pub fn new(location: RunLocation, default_timeout: Duration) -> Self {
        Self {
            commands: Vec::new(),
            location,
            default_timeout,
        }
    }

    /// Build from a configuration value; malformed entries are logged and
    /// skipped.
    pub fn from_config(
        value: &StoredValue,
        location: RunLocation,
        default_timeout: Duration,
    ) -> Self {
        let mut list = Self::new(location, default_timeout);
        match value {
            StoredValue::Sequence(items) => {
                list.commands.extend(items.iter().filter_map(CommandLine::from_value));
            }
            StoredValue::Null => {}
            single => list.commands.extend(CommandLine::from_value(single)),
        }
        list
    }

    pub fn push(&mut self, line: CommandLine) {
        self.commands.push(line);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[CommandLine] {
        &self.commands
    }

    pub fn location(&self) -> RunLocation {
        self.location
    }

    /// Run every command in order, stopping at the first failure that is not
    /// marked as ignorable. Progress advances by one step per command.
    pub fn run(&self, ctx: &JobContext) -> JobResult {
        let storage = ctx.storage();
        let total = self.commands.len();

        for (index, line) in self.commands.iter().enumerate() {
            let (ignore_failure, raw) = match line.command.strip_prefix('-') {
                Some(rest) => (true, rest.trim_start()),
                None => (false, line.command.as_str()),
            };

            let command = match expand_variables(raw, storage) {
                Ok(command) => command,
                Err(missing) => {
                    return JobResult::error(
                        "Bad variable in command.",
                        format!("Command `{}` uses {} which is not set.", raw, missing),
                    );
                }
            };

            let timeout = line.timeout.unwrap_or(self.default_timeout);
            info!("Running command {}/{}: {}", index + 1, total, command);
            let result = Runner::new(["/bin/sh", "-c", command.as_str()])
                .location(self.location)
                .target_root_from(storage)
                .timeout(timeout)
                .on_output(|l| debug!("  {}", l))
                .run();

            if !result.success() {
                if ignore_failure {
                    warn!("Command `{}` failed with {}, ignoring", command, result.exit_code);
                } else {
                    return result.explain(&command, Some(timeout));
                }
            }
            ctx.report_progress((index + 1) as f64 / total as f64);
        }
        JobResult::ok()
    }
}

/// Substitute `${ROOT}`, `${USER}` and `${gs[key]}`. Unknown variable names
/// are left for the shell; known ones that are unset yield `Err(name)`.
pub fn expand_variables(command: &str, storage: &GlobalStore) -> Result<String, String> {
    let mut out = String::with_capacity(command.len());
    let mut rest = command;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        match resolve_variable(name, storage) {
            Some(Some(value)) => out.push_str(&value),
            Some(None) => return Err(format!("${{{}}}", name)),
            None => {
                out.push_str("${");
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// `None` for names this expander does not own, `Some(None)` when unset.
fn resolve_variable(name: &str, storage: &GlobalStore) -> Option<Option<String>> {
    let value = match name {
        "ROOT" => runner::target_root(storage).map(|p| p.display().to_string()),
        "USER" => storage.value(USERNAME_KEY).to_plain_string(),
        _ => {
            let key = name.strip_prefix("gs[")?.strip_suffix(']')?;
            storage.lookup(key).and_then(|v| v.to_plain_string())
        }
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Mapping;
    use std::sync::Arc;

    fn store_with_root() -> Arc<GlobalStore> {
        let storage = Arc::new(GlobalStore::new());
        storage.insert(runner::ROOT_MOUNT_POINT_KEY, "/mnt/target");
        storage.insert(USERNAME_KEY, "alice");
        let mut branding = Mapping::new();
        branding.insert("name".to_string(), "Demo OS".into());
        storage.insert("branding", branding);
        storage
    }

    #[test]
    fn test_expand_known_variables() {
        let storage = store_with_root();
        assert_eq!(
            expand_variables("ls ${ROOT}/home/${USER}", &storage).unwrap(),
            "ls /mnt/target/home/alice"
        );
        assert_eq!(
            expand_variables("echo '${gs[branding.name]}'", &storage).unwrap(),
            "echo 'Demo OS'"
        );
    }

    #[test]
    fn test_expand_leaves_shell_variables() {
        let storage = store_with_root();
        assert_eq!(
            expand_variables("echo ${HOME} $PATH", &storage).unwrap(),
            "echo ${HOME} $PATH"
        );
        assert_eq!(
            expand_variables("echo ${unterminated", &storage).unwrap(),
            "echo ${unterminated"
        );
    }

    #[test]
    fn test_expand_missing_variable() {
        let storage = GlobalStore::new();
        assert_eq!(expand_variables("ls ${ROOT}", &storage), Err("${ROOT}".to_string()));
        assert_eq!(
            expand_variables("echo ${gs[branding.name]}", &storage),
            Err("${gs[branding.name]}".to_string())
        );
    }

    #[test]
    fn test_parse_forms() {
        let single =
            CommandList::from_config(&"echo hi".into(), RunLocation::Host, Duration::from_secs(10));
        assert_eq!(single.len(), 1);

        let mut timed = Mapping::new();
        timed.insert("command".to_string(), "sleep 1".into());
        timed.insert("timeout".to_string(), 5.into());
        let list: StoredValue = vec![
            StoredValue::from("true"),
            StoredValue::from(timed),
            StoredValue::from(3),
        ]
        .into();
        let parsed = CommandList::from_config(&list, RunLocation::Target, Duration::from_secs(10));

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.commands()[1].command(), "sleep 1");
        assert_eq!(parsed.commands()[1].timeout(), Some(Duration::from_secs(5)));
        assert_eq!(parsed.location(), RunLocation::Target);
    }

    #[test]
    fn test_run_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let mut list = CommandList::new(RunLocation::Host, Duration::from_secs(10));
        list.push(CommandLine::new("true"));
        list.push(CommandLine::new("exit 4"));
        list.push(CommandLine::new(format!("touch {}", marker.display())));

        let result = list.run(&JobContext::new(Arc::new(GlobalStore::new())));
        assert!(!result.is_ok());
        assert!(result.details().contains("exit code 4"));
        assert!(!marker.exists());
    }

    #[test]
    fn test_dash_prefix_ignores_failure() {
        let mut list = CommandList::new(RunLocation::Host, Duration::from_secs(10));
        list.push(CommandLine::new("-false"));
        list.push(CommandLine::new("true"));
        assert!(list.run(&JobContext::new(Arc::new(GlobalStore::new()))).is_ok());
    }

    #[test]
    fn test_target_without_root_fails() {
        let mut list = CommandList::new(RunLocation::Target, Duration::from_secs(10));
        list.push(CommandLine::new("true"));
        let result = list.run(&JobContext::new(Arc::new(GlobalStore::new())));
        assert_eq!(result.message(), "Internal error when starting command.");
    }
}
