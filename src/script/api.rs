//! Functions and types registered into the script engine
//!
//! Scripts see `globalstorage` and `job` at the top level. Script functions
//! cannot see top-level variables, so both are also published as
//! `installer::globalstorage` and `installer::job`. Proxy methods take their
//! receiver by value so they work on those read-only module variables.

use super::convert::{from_dynamic, mapping_to_map, to_dynamic};
use crate::job::ProgressSink;
use crate::runner::{CommandResult, RunLocation, Runner};
use crate::storage::GlobalStore;
use crate::value::StoredValue;
use rhai::{
    Array, Dynamic, Engine, EvalAltResult, FnPtr, INT, Map, Module, NativeCallContext, Position,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Prefix for everything scripts log.
pub const LOG_PREFIX: &str = "[SCRIPT JOB]:";

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// Script-side handle to global storage.
#[derive(Debug, Clone)]
pub struct StorageProxy {
    storage: Arc<GlobalStore>,
}

impl StorageProxy {
    pub fn new(storage: Arc<GlobalStore>) -> Self {
        Self { storage }
    }

    fn contains(self, key: &str) -> bool {
        self.storage.contains(key)
    }

    fn value(self, key: &str) -> Dynamic {
        if !self.storage.contains(key) {
            warn!("Unknown GS key {}", key);
            return Dynamic::UNIT;
        }
        to_dynamic(&self.storage.value(key))
    }

    fn insert(self, key: &str, value: Dynamic) -> FnResult<()> {
        let value = from_dynamic(value)
            .map_err(|e| runtime_error(format!("globalstorage.insert('{}'): {}", key, e)))?;
        self.storage.insert(key, value);
        Ok(())
    }

    fn remove(self, key: &str) -> INT {
        if !self.storage.contains(key) {
            warn!("Unknown GS key {}", key);
        }
        self.storage.remove(key) as INT
    }

    fn keys(self) -> Array {
        self.storage.keys().into_iter().map(Dynamic::from).collect()
    }

    fn count(self) -> INT {
        self.storage.count() as INT
    }

    fn lookup(self, key: &str) -> Dynamic {
        self.storage
            .lookup(key)
            .map(|v| to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    }
}

/// Script-side view of the running job.
#[derive(Clone)]
pub struct JobProxy {
    pretty_name: String,
    module_name: String,
    working_path: String,
    configuration: Map,
    progress: ProgressSink,
}

impl JobProxy {
    pub fn new(
        pretty_name: impl Into<String>,
        module_name: impl Into<String>,
        working_path: &Path,
        configuration: &crate::value::Mapping,
        progress: ProgressSink,
    ) -> Self {
        Self {
            pretty_name: pretty_name.into(),
            module_name: module_name.into(),
            working_path: working_path.display().to_string(),
            configuration: mapping_to_map(configuration),
            progress,
        }
    }

    fn setprogress(self, fraction: f64) {
        if fraction.is_nan() {
            return;
        }
        (self.progress)(fraction.clamp(0.0, 1.0));
    }
}

/// Where `target_env_*` functions run and which root they use.
#[derive(Debug, Clone)]
pub struct ProcessBridge {
    storage: Arc<GlobalStore>,
    target: RunLocation,
}

impl ProcessBridge {
    pub fn new(storage: Arc<GlobalStore>, target: RunLocation) -> Self {
        Self { storage, target }
    }

    fn runner<'a>(
        &self,
        location: RunLocation,
        argv: Vec<String>,
        input: &str,
        timeout: INT,
    ) -> Runner<'a> {
        let mut runner = Runner::new(argv)
            .location(location)
            .target_root_from(&self.storage)
            .timeout(Duration::from_secs(timeout.max(0) as u64));
        if !input.is_empty() {
            runner = runner.input(input);
        }
        runner
    }

    fn run(
        &self,
        location: RunLocation,
        command: Dynamic,
        input: &str,
        timeout: INT,
    ) -> FnResult<(Vec<String>, CommandResult)> {
        let argv = command_argv(command)?;
        let result = self.runner(location, argv.clone(), input, timeout).run();
        Ok((argv, result))
    }
}

/// A script command is an array of arguments or one string naming a
/// program (not a shell line).
fn command_argv(command: Dynamic) -> FnResult<Vec<String>> {
    if command.is_string() {
        return Ok(vec![command.to_string()]);
    }
    match command.try_cast::<Array>() {
        Some(items) => Ok(items.into_iter().map(|item| item.to_string()).collect()),
        None => Err(runtime_error("command must be a string or an array of strings")),
    }
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    let message: String = message.into();
    EvalAltResult::ErrorRuntime(Dynamic::from(message), Position::NONE).into()
}

/// The error raised for a failed command: `#{ exit_code, command, output }`.
pub fn command_error(argv: &[String], result: &CommandResult) -> Box<EvalAltResult> {
    let mut map = Map::new();
    map.insert("exit_code".into(), Dynamic::from_int(result.exit_code as INT));
    map.insert("command".into(), Dynamic::from(argv.join(" ")));
    map.insert("output".into(), Dynamic::from(result.output.clone()));
    EvalAltResult::ErrorRuntime(Dynamic::from_map(map), Position::NONE).into()
}

fn raise_on_error(argv: &[String], result: &CommandResult) -> FnResult<INT> {
    if result.success() {
        Ok(0)
    } else {
        Err(command_error(argv, result))
    }
}

/// Register `name(cmd)`, `name(cmd, input)` and `name(cmd, input, timeout)`.
fn register_command_fn<R, F>(engine: &mut Engine, name: &str, f: F)
where
    R: Clone + Send + Sync + 'static,
    F: Fn(Dynamic, &str, INT) -> FnResult<R> + Clone + Send + Sync + 'static,
{
    let g = f.clone();
    engine.register_fn(name, move |command: Dynamic| g(command, "", 0));
    let g = f.clone();
    engine.register_fn(name, move |command: Dynamic, input: &str| g(command, input, 0));
    engine.register_fn(name, move |command: Dynamic, input: &str, timeout: INT| {
        f(command, input, timeout)
    });
}

fn register_process_fns(engine: &mut Engine, bridge: &ProcessBridge) {
    for (prefix, location) in [("target", bridge.target), ("host", RunLocation::Host)] {
        let b = bridge.clone();
        register_command_fn(engine, &format!("{}_env_call", prefix), move |cmd, input, timeout| {
            let (_, result) = b.run(location, cmd, input, timeout)?;
            Ok(result.exit_code as INT)
        });

        let b = bridge.clone();
        let name = format!("check_{}_env_call", prefix);
        register_command_fn(engine, &name, move |cmd, input, timeout| {
            let (argv, result) = b.run(location, cmd, input, timeout)?;
            raise_on_error(&argv, &result)
        });

        let b = bridge.clone();
        let name = format!("check_{}_env_output", prefix);
        register_command_fn(engine, &name, move |cmd, input, timeout| {
            let (argv, result) = b.run(location, cmd, input, timeout)?;
            raise_on_error(&argv, &result)?;
            Ok(result.output)
        });

        let name = format!("{}_env_process_output", prefix);

        let b = bridge.clone();
        engine.register_fn(name.as_str(), move |cmd: Dynamic| -> FnResult<Array> {
            let (argv, result) = b.run(location, cmd, "", 0)?;
            raise_on_error(&argv, &result)?;
            Ok(result.output.lines().map(|l| Dynamic::from(l.to_string())).collect())
        });

        let b = bridge.clone();
        engine.register_fn(
            name.as_str(),
            move |ctx: NativeCallContext, cmd: Dynamic, callback: FnPtr| {
                process_output(&b, &ctx, location, cmd, &callback, "", 0)
            },
        );
        let b = bridge.clone();
        engine.register_fn(
            name.as_str(),
            move |ctx: NativeCallContext, cmd: Dynamic, callback: FnPtr, input: &str| {
                process_output(&b, &ctx, location, cmd, &callback, input, 0)
            },
        );
        let b = bridge.clone();
        engine.register_fn(
            name.as_str(),
            move |ctx: NativeCallContext,
                  cmd: Dynamic,
                  callback: FnPtr,
                  input: &str,
                  timeout: INT| {
                process_output(&b, &ctx, location, cmd, &callback, input, timeout)
            },
        );
    }
}

/// Run with every output line passed to `callback`; the first error the
/// callback raises wins over the command's own result.
fn process_output(
    bridge: &ProcessBridge,
    ctx: &NativeCallContext,
    location: RunLocation,
    command: Dynamic,
    callback: &FnPtr,
    input: &str,
    timeout: INT,
) -> FnResult<INT> {
    let argv = command_argv(command)?;
    let mut callback_error = None;
    let result = bridge
        .runner(location, argv.clone(), input, timeout)
        .on_output(|line| {
            if callback_error.is_none() {
                if let Err(e) = callback.call_within_context::<Dynamic>(ctx, (line.to_string(),)) {
                    callback_error = Some(e);
                }
            }
        })
        .run();

    if let Some(e) = callback_error {
        return Err(e);
    }
    raise_on_error(&argv, &result)
}

fn register_logging(engine: &mut Engine) {
    engine.on_print(|text| info!("{} {}", LOG_PREFIX, text));
    engine.on_debug(|text, _source, _pos| debug!("{} {}", LOG_PREFIX, text));
    engine.register_fn("warning", |text: &str| warn!("{} {}", LOG_PREFIX, text));
    engine.register_fn("error", |text: &str| error!("{} {}", LOG_PREFIX, text));
}

/// Reversible obfuscation for passwords kept in configuration.
///
/// ASCII maps onto ASCII; every other character passes through.
pub fn obscure(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii() {
                char::from((c as u8) ^ 0x1F)
            } else {
                c
            }
        })
        .collect()
}

/// Read a YAML mapping for a script; failures log a warning and give `#{}`.
fn load_yaml(path: &str) -> Map {
    let loaded = std::fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_yaml::from_str::<StoredValue>(&text).map_err(|e| e.to_string()));
    match loaded {
        Ok(StoredValue::Mapping(map)) => mapping_to_map(&map),
        Ok(other) => {
            warn!("Loading YAML from {} failed: top level is a {}", path, other.type_name());
            Map::new()
        }
        Err(e) => {
            warn!("Loading YAML from {} failed: {}", path, e);
            Map::new()
        }
    }
}

fn register_storage(engine: &mut Engine) {
    engine
        .register_type_with_name::<StorageProxy>("GlobalStorage")
        .register_fn("contains", StorageProxy::contains)
        .register_fn("value", StorageProxy::value)
        .register_fn("insert", StorageProxy::insert)
        .register_fn("remove", StorageProxy::remove)
        .register_fn("keys", StorageProxy::keys)
        .register_fn("count", StorageProxy::count)
        .register_fn("lookup", StorageProxy::lookup);
}

fn register_job(engine: &mut Engine) {
    engine
        .register_type_with_name::<JobProxy>("Job")
        .register_get("pretty_name", |job: &mut JobProxy| job.pretty_name.clone())
        .register_get("module_name", |job: &mut JobProxy| job.module_name.clone())
        .register_get("working_path", |job: &mut JobProxy| job.working_path.clone())
        .register_get("configuration", |job: &mut JobProxy| job.configuration.clone())
        .register_fn("setprogress", JobProxy::setprogress)
        .register_fn("setprogress", |job: JobProxy, fraction: INT| {
            job.setprogress(fraction as f64)
        });
}

/// Publish the proxies as `installer::globalstorage` and `installer::job`.
pub fn register_installer_module(engine: &mut Engine, storage: StorageProxy, job: JobProxy) {
    let mut module = Module::new();
    module.set_var("globalstorage", storage);
    module.set_var("job", job);
    engine.register_static_module("installer", module.into());
}

/// Engine with the whole script API registered.
pub fn build_engine(bridge: &ProcessBridge) -> Engine {
    let mut engine = Engine::new();
    register_storage(&mut engine);
    register_job(&mut engine);
    register_process_fns(&mut engine, bridge);
    register_logging(&mut engine);
    engine
        .register_fn("obscure", |text: &str| obscure(text))
        .register_fn("load_yaml", load_yaml);
    engine
}
