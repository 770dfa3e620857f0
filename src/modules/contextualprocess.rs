//! `contextualprocess`: run commands chosen by global storage values
//!
//! Every configuration key other than `dontChroot` and `timeout` names a
//! (dotted) global storage variable and maps its possible values to command
//! lists. `*` matches any value that has no entry of its own.
//!
//! ```yaml
//! dontChroot: false
//! firmwareType:
//!   efi: "-pkg remove grub-pc"
//!   bios: "-pkg remove grub-efi"
//!   "*": "echo unknown firmware"
//! branding.flavour:
//!   lite: "pkg remove office-suite"
//! ```

use super::configured_timeout;
use crate::commands::CommandList;
use crate::error::Result;
use crate::job::{Job, JobContext, JobList, JobResult};
use crate::module::{Module, ModuleEnvironment, ModuleKind};
use crate::value::{get_bool, Mapping};
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const WILDCARD: &str = "*";

/// Commands to run for each value of one variable.
#[derive(Debug, Clone)]
struct Binding {
    variable: String,
    checks: Vec<(String, CommandList)>,
    wildcard: Option<CommandList>,
}

impl Binding {
    fn commands_for(&self, value: &str) -> Option<&CommandList> {
        self.checks
            .iter()
            .find(|(expected, _)| expected == value)
            .map(|(_, commands)| commands)
            .or(self.wildcard.as_ref())
    }
}

pub struct ContextualProcessModule {
    env: ModuleEnvironment,
    bindings: Vec<Binding>,
}

impl ContextualProcessModule {
    pub fn new(env: ModuleEnvironment) -> Self {
        Self {
            env,
            bindings: Vec::new(),
        }
    }
}

impl Module for ContextualProcessModule {
    fn instance_name(&self) -> &str {
        &self.env.instance
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::ContextualProcess
    }

    fn set_configuration_map(&mut self, config: &Mapping) -> Result<()> {
        let location = self.env.target_location(get_bool(config, "dontChroot", false));
        let timeout = configured_timeout(config, DEFAULT_TIMEOUT_SECS);

        self.bindings.clear();
        for (variable, entry) in config {
            if variable == "dontChroot" || variable == "timeout" {
                continue;
            }
            let Some(values) = entry.as_mapping() else {
                warn!(
                    "{}: configuration for '{}' is a {}, expected a mapping of values to commands",
                    self.env.instance,
                    variable,
                    entry.type_name()
                );
                continue;
            };

            let mut binding = Binding {
                variable: variable.clone(),
                checks: Vec::new(),
                wildcard: None,
            };
            for (value, commands) in values {
                let commands = CommandList::from_config(commands, location, timeout);
                if value == WILDCARD {
                    binding.wildcard = Some(commands);
                } else {
                    binding.checks.push((value.clone(), commands));
                }
            }
            self.bindings.push(binding);
        }

        if self.bindings.is_empty() {
            warn!("{}: no variables configured", self.env.instance);
        }
        Ok(())
    }

    fn create_jobs(&self) -> JobList {
        vec![Box::new(ContextualProcessJob {
            instance: self.env.instance.clone(),
            bindings: self.bindings.clone(),
        })]
    }
}

#[derive(Debug, Clone)]
pub struct ContextualProcessJob {
    instance: String,
    bindings: Vec<Binding>,
}

impl ContextualProcessJob {
    /// Number of configured variables.
    pub fn count(&self) -> usize {
        self.bindings.len()
    }

    /// Number of values configured for `variable`, the `*` entry included.
    pub fn count_values(&self, variable: &str) -> Option<usize> {
        self.bindings
            .iter()
            .find(|b| b.variable == variable)
            .map(|b| b.checks.len() + usize::from(b.wildcard.is_some()))
    }
}

impl Job for ContextualProcessJob {
    fn pretty_name(&self) -> String {
        "Contextual Processes Job".to_string()
    }

    fn exec(&mut self, ctx: &JobContext) -> JobResult {
        for binding in &self.bindings {
            let Some(value) = ctx.storage().lookup(&binding.variable) else {
                warn!(
                    "{}: variable '{}' is not set in global storage",
                    self.instance, binding.variable
                );
                continue;
            };
            // Non-scalar values compare as the empty string.
            let value = value.to_plain_string().unwrap_or_default();

            match binding.commands_for(&value) {
                Some(commands) => {
                    debug!("{}: {} = '{}'", self.instance, binding.variable, value);
                    let result = commands.run(ctx);
                    if !result.is_ok() {
                        return result;
                    }
                }
                None => debug!(
                    "{}: nothing configured for {} = '{}'",
                    self.instance, binding.variable, value
                ),
            }
        }
        JobResult::ok()
    }
}
