//! Invocation scheduling
//!
//! One execution path drives every invocation: validate, stage the
//! environment, load the handler, arm the timer, call the handler, and
//! let the completion paths race through the context's once-guard. The
//! future-style and callback-style entry points differ only in how the
//! outcome reaches the caller.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, info};

use crate::context::{ContextParams, InvocationContext, Outcome};
use crate::handler::{Handler, HandlerOutcome};
use crate::loader::HandlerRegistry;
use funcsim_core::{env, load_credentials, EnvSnapshot, InvokeError, InvokeId};

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Process-wide handler registry shared by the direct API and watch mode
static REGISTRY: Lazy<HandlerRegistry> = Lazy::new(HandlerRegistry::new);

pub fn registry() -> &'static HandlerRegistry {
    &REGISTRY
}

/// The invocation event payload: a value, or a producer invoked once per
/// invocation.
#[derive(Clone)]
pub enum EventSource {
    Value(Value),
    Producer(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl EventSource {
    fn resolve(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Producer(producer) => producer(),
        }
    }
}

impl Default for EventSource {
    fn default() -> Self {
        Self::Value(Value::Null)
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Producer(_) => f.write_str("Producer(..)"),
        }
    }
}

/// Caller-supplied opaque metadata forwarded to the handler
#[derive(Debug, Clone)]
pub enum ClientContext {
    /// Already-structured metadata
    Value(Value),
    /// Stringified form; must parse as JSON before any side effect
    Raw(String),
}

/// Options for one invocation
#[derive(Clone)]
pub struct InvokeOptions {
    /// In-memory handler reference; mutually exclusive with `library`
    pub handler: Option<Arc<dyn Handler>>,
    /// Handler library path; mutually exclusive with `handler`
    pub library: Option<PathBuf>,
    /// Exported constructor name, also the tail of the handler identifier
    pub export: String,
    pub event: EventSource,
    pub timeout_ms: u64,
    pub memory_mb: Option<u64>,
    pub region: Option<String>,
    pub environment: HashMap<String, String>,
    /// Restore custom environment keys after the invocation
    pub destroy_environment: bool,
    pub client_context: Option<ClientContext>,
    pub profile: Option<String>,
    pub credentials_path: Option<PathBuf>,
    /// Conclude only after handler-spawned tasks drain (multi-thread
    /// runtime only)
    pub wait_for_pending_tasks: bool,
}

impl Default for InvokeOptions {
    fn default() -> Self {
        Self {
            handler: None,
            library: None,
            export: "handler".to_string(),
            event: EventSource::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_mb: None,
            region: None,
            environment: HashMap::new(),
            destroy_environment: false,
            client_context: None,
            profile: None,
            credentials_path: None,
            wait_for_pending_tasks: false,
        }
    }
}

/// Run one invocation, settling when the first completion path wins.
pub async fn execute(options: InvokeOptions) -> Result<Value, InvokeError> {
    run(options).await
}

/// Callback-style entry point: drives the shared execution path on a
/// dedicated runtime and hands the outcome to `callback`.
pub fn execute_with_callback<F>(options: InvokeOptions, callback: F)
where
    F: FnOnce(Result<Value, InvokeError>),
{
    let result = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime.block_on(run(options)),
        Err(e) => Err(InvokeError::Configuration(format!(
            "Failed to build invocation runtime: {}",
            e
        ))),
    };
    callback(result);
}

async fn run(options: InvokeOptions) -> Result<Value, InvokeError> {
    enum Source<'a> {
        Memory(&'a Arc<dyn Handler>),
        Library(&'a std::path::Path),
    }

    // Fail-fast validation: no environment mutation, no handler load.
    let source = match (&options.handler, &options.library) {
        (Some(_), Some(_)) => {
            return Err(InvokeError::Configuration(
                "Handler reference and library path are mutually exclusive".to_string(),
            ))
        }
        (None, None) => {
            return Err(InvokeError::Configuration(
                "No handler supplied: set a handler reference or a library path".to_string(),
            ))
        }
        (Some(handler), None) => Source::Memory(handler),
        (None, Some(path)) => Source::Library(path),
    };
    let client_context = match &options.client_context {
        Some(ClientContext::Raw(raw)) => Some(
            serde_json::from_str::<Value>(raw)
                .map_err(|e| InvokeError::Parse(format!("Invalid client context: {}", e)))?,
        ),
        Some(ClientContext::Value(value)) => Some(value.clone()),
        None => None,
    };

    let invoke_id = InvokeId::new();
    let identifier = env::handler_identifier(options.library.as_deref(), &options.export);
    let task_root = env::task_root(options.library.as_deref());

    // Staging happens strictly before the handler load; handler code may
    // read these variables at load time.
    let credentials =
        load_credentials(options.credentials_path.as_deref(), options.profile.as_deref())?;
    let snapshot = EnvSnapshot::for_invocation(
        &identifier,
        &task_root,
        invoke_id.as_str(),
        options.memory_mb,
        options.region.as_deref(),
    )
    .with_defaults(credentials)
    .with_custom(&options.environment, options.destroy_environment);
    let memory_mb = snapshot
        .defaults()
        .get(env::MEMORY_SIZE_VAR)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let staged = snapshot.apply();

    let handler: Arc<dyn Handler> = match source {
        Source::Memory(handler) => Arc::clone(handler),
        Source::Library(path) => match registry().load(path, &options.export) {
            Ok(loaded) => Arc::new(loaded),
            Err(e) => {
                staged.revert();
                return Err(e);
            }
        },
    };

    let event = options.event.resolve();

    let (ctx, completion) = InvocationContext::new(ContextParams {
        function_name: identifier.clone(),
        memory_limit_mb: memory_mb,
        timeout: Duration::from_millis(options.timeout_ms),
        invoke_id: invoke_id.clone(),
        client_context,
        wait_for_pending_tasks: options.wait_for_pending_tasks,
    });
    ctx.set_finalizer(Box::new(move || staged.revert()));
    ctx.start_timeout();

    info!(
        invoke_id = %invoke_id,
        function = %identifier,
        timeout_ms = options.timeout_ms,
        "Invoking handler"
    );

    // A synchronous panic in the handler body is a handler failure, not
    // an engine crash.
    let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(event, ctx.clone())));
    match call {
        Err(panic) => ctx.fail(panic_message(panic.as_ref())),
        Ok(Err(e)) => ctx.fail(e),
        Ok(Ok(HandlerOutcome::Sync)) => ctx.succeed(Value::Null),
        Ok(Ok(HandlerOutcome::Deferred)) => {
            debug!(invoke_id = %invoke_id, "Handler deferred completion to the context");
        }
        Ok(Ok(HandlerOutcome::Async(future))) => {
            let wired = ctx.clone();
            tokio::spawn(async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(value)) => wired.succeed(value),
                    Ok(Err(e)) => wired.fail(e),
                    Err(panic) => wired.fail(panic_message(panic.as_ref())),
                }
            });
        }
    }

    let outcome = completion
        .await
        .map_err(|_| InvokeError::Handler("Completion channel closed".to_string()))?;

    ctx.drain_pending().await;

    match outcome {
        Outcome::Success(value) => Ok(value),
        Outcome::Failure(error) => Err(error),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("Handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("Handler panicked: {}", message)
    } else {
        "Handler panicked".to_string()
    }
}
