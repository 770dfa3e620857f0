//! Jobs written in Rhai
//!
//! A script job compiles its file with the full script API registered and
//! runs it. If the script defines `run()`, that function is the job body and
//! the top level only sets things up; otherwise the top level is the body.
//! An optional `pretty_status_message()` supplies the status text. Inside
//! functions the store and the job are reached as `installer::globalstorage`
//! and `installer::job`.
//!
//! The body's value decides the result:
//!
//! - `()`: success
//! - a string: failure with that message
//! - `[message, details]`: failure
//!
//! Anything else, and any uncaught error, is a failure too.

pub mod api;
pub mod convert;

use crate::job::{Job, JobContext, JobResult};
use crate::runner::RunLocation;
use crate::value::Mapping;
use api::{JobProxy, ProcessBridge, StorageProxy};
use rhai::{CallFnOptions, Dynamic, EvalAltResult, Scope, AST};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ScriptJob {
    script: PathBuf,
    pretty_name: String,
    module_name: String,
    configuration: Mapping,
    target: RunLocation,
}

impl ScriptJob {
    pub fn new(script: impl Into<PathBuf>, module_name: impl Into<String>) -> Self {
        let script = script.into();
        let pretty_name = script
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Script job".to_string());
        Self {
            script,
            pretty_name,
            module_name: module_name.into(),
            configuration: Mapping::new(),
            target: RunLocation::Target,
        }
    }

    pub fn with_pretty_name(mut self, name: impl Into<String>) -> Self {
        self.pretty_name = name.into();
        self
    }

    /// Configuration visible to the script as `job.configuration`.
    pub fn with_configuration(mut self, configuration: Mapping) -> Self {
        self.configuration = configuration;
        self
    }

    /// Where `target_env_*` functions run.
    pub fn with_target_location(mut self, location: RunLocation) -> Self {
        self.target = location;
        self
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    fn working_path(&self) -> &Path {
        self.script.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// The top level has already run once; do not repeat it per call.
fn call_only() -> CallFnOptions<'static> {
    CallFnOptions::new().eval_ast(false)
}

fn has_function(ast: &AST, name: &str) -> bool {
    ast.iter_functions().any(|f| f.name == name && f.params.is_empty())
}

impl Job for ScriptJob {
    fn pretty_name(&self) -> String {
        self.pretty_name.clone()
    }

    fn exec(&mut self, ctx: &JobContext) -> JobResult {
        let source = match std::fs::read_to_string(&self.script) {
            Ok(source) => source,
            Err(e) => {
                return JobResult::error(
                    "Bad main script file",
                    format!("Script file {} cannot be read: {}", self.script.display(), e),
                );
            }
        };

        let storage = StorageProxy::new(Arc::clone(ctx.storage()));
        let job = JobProxy::new(
            self.pretty_name.as_str(),
            self.module_name.as_str(),
            self.working_path(),
            &self.configuration,
            ctx.progress_sink(),
        );
        let bridge = ProcessBridge::new(Arc::clone(ctx.storage()), self.target);
        let mut engine = api::build_engine(&bridge);
        api::register_installer_module(&mut engine, storage.clone(), job.clone());

        let ast = match engine.compile(&source) {
            Ok(ast) => ast,
            Err(e) => {
                return JobResult::error(
                    "Bad main script file",
                    format!("Script {} does not compile: {}", self.script.display(), e),
                );
            }
        };

        let mut scope = Scope::new();
        scope.push("globalstorage", storage);
        scope.push("job", job);

        info!("Running script {}", self.script.display());
        let top_level = match engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast) {
            Ok(value) => value,
            Err(e) => return describe_error(&e),
        };

        if has_function(&ast, "pretty_status_message") {
            let status = engine.call_fn_with_options::<Dynamic>(
                call_only(),
                &mut scope,
                &ast,
                "pretty_status_message",
                (),
            );
            match status {
                Ok(status) if !status.is_unit() => ctx.set_status(status.to_string()),
                Ok(_) => {}
                Err(e) => debug!("pretty_status_message() failed: {}", e),
            }
        }

        let body = if has_function(&ast, "run") {
            match engine.call_fn_with_options::<Dynamic>(call_only(), &mut scope, &ast, "run", ()) {
                Ok(value) => value,
                Err(e) => return describe_error(&e),
            }
        } else {
            top_level
        };

        interpret_return(body)
    }
}

fn interpret_return(value: Dynamic) -> JobResult {
    if value.is_unit() {
        return JobResult::ok();
    }
    if value.is_string() {
        return JobResult::error(value.to_string(), "");
    }
    let type_name = value.type_name();
    match value.try_cast::<rhai::Array>() {
        Some(parts) if parts.len() == 2 => {
            JobResult::error(parts[0].to_string(), parts[1].to_string())
        }
        _ => JobResult::error(
            "Script returned an unexpected value",
            format!(
                "A script job must return nothing, a message, or [message, details]; got {}",
                type_name
            ),
        ),
    }
}

/// Turn an uncaught script error into a job failure; failed commands keep
/// their exit code and output.
fn describe_error(err: &EvalAltResult) -> JobResult {
    match innermost(err) {
        EvalAltResult::ErrorRuntime(value, _) => match value.read_lock::<rhai::Map>() {
            Some(map) if map.contains_key("exit_code") => {
                let field = |key: &str| map.get(key).map(|v| v.to_string()).unwrap_or_default();
                JobResult::error(
                    format!(
                        "Command `{}` failed with exit code {}",
                        field("command"),
                        field("exit_code")
                    ),
                    field("output"),
                )
            }
            _ => JobResult::error("Script error", value.to_string()),
        },
        _ => JobResult::error("Script error", err.to_string()),
    }
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(inner),
        other => other,
    }
}
