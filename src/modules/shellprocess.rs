//! `shellprocess`: run a fixed list of shell commands
//!
//! ```yaml
//! dontChroot: false
//! timeout: 30
//! name: "Configure system"
//! script:
//!   - "-rm -f ${ROOT}/etc/machine-id"
//!   - command: "systemd-machine-id-setup --root=${ROOT}"
//!     timeout: 60
//! ```

use super::{configured_name, configured_timeout};
use crate::commands::CommandList;
use crate::error::{InstallerError, Result};
use crate::job::{Job, JobContext, JobList, JobResult};
use crate::module::{Module, ModuleEnvironment, ModuleKind};
use crate::value::{get_bool, Mapping};
use tracing::{info, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const KNOWN_KEYS: &[&str] = &["dontChroot", "timeout", "script", "name", "i18n"];

pub struct ShellProcessModule {
    env: ModuleEnvironment,
    name: Option<String>,
    commands: Option<CommandList>,
}

impl ShellProcessModule {
    pub fn new(env: ModuleEnvironment) -> Self {
        Self {
            env,
            name: None,
            commands: None,
        }
    }
}

impl Module for ShellProcessModule {
    fn instance_name(&self) -> &str {
        &self.env.instance
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::ShellProcess
    }

    fn set_configuration_map(&mut self, config: &Mapping) -> Result<()> {
        for key in config.keys().filter(|k| !KNOWN_KEYS.contains(&k.as_str())) {
            warn!("{}: ignoring unknown configuration key '{}'", self.env.instance, key);
        }

        let script = config.get("script").ok_or_else(|| {
            InstallerError::config(format!(
                "{}: no 'script' commands configured",
                self.env.instance
            ))
        })?;

        let location = self.env.target_location(get_bool(config, "dontChroot", false));
        let timeout = configured_timeout(config, DEFAULT_TIMEOUT_SECS);
        let commands = CommandList::from_config(script, location, timeout);
        if commands.is_empty() {
            warn!("{}: 'script' holds no usable commands", self.env.instance);
        }

        self.name = configured_name(config);
        self.commands = Some(commands);
        Ok(())
    }

    fn create_jobs(&self) -> JobList {
        match &self.commands {
            Some(commands) => vec![Box::new(ShellProcessJob {
                name: self
                    .name
                    .clone()
                    .unwrap_or_else(|| "Shell Processes Job".to_string()),
                commands: commands.clone(),
            })],
            None => Vec::new(),
        }
    }
}

/// Runs a `CommandList` to completion.
#[derive(Debug, Clone)]
pub struct ShellProcessJob {
    name: String,
    commands: CommandList,
}

impl ShellProcessJob {
    pub fn new(name: impl Into<String>, commands: CommandList) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }
}

impl Job for ShellProcessJob {
    fn pretty_name(&self) -> String {
        self.name.clone()
    }

    fn exec(&mut self, ctx: &JobContext) -> JobResult {
        if self.commands.is_empty() {
            info!("{}: nothing to run", self.name);
            return JobResult::ok();
        }
        self.commands.run(ctx)
    }
}
