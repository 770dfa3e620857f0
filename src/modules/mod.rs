//! Built-in modules

pub mod contextualprocess;
pub mod script;
pub mod shellprocess;

pub use contextualprocess::{ContextualProcessJob, ContextualProcessModule};
pub use script::ScriptModule;
pub use shellprocess::{ShellProcessJob, ShellProcessModule};

use crate::value::{Mapping, StoredValue};

/// Display name from `name:` or `i18n: { name: ... }`, if configured.
pub(crate) fn configured_name(config: &Mapping) -> Option<String> {
    config
        .get("name")
        .or_else(|| config.get("i18n").and_then(|i18n| i18n.get("name")))
        .and_then(StoredValue::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Timeout in seconds from `timeout:`; values below one fall back to `default`.
pub(crate) fn configured_timeout(config: &Mapping, default: u64) -> std::time::Duration {
    let secs = crate::value::get_integer(config, "timeout", default as i64);
    let secs = if secs < 1 {
        tracing::warn!("Timeout {} is below one second, using {}", secs, default);
        default
    } else {
        secs as u64
    };
    std::time::Duration::from_secs(secs)
}
