//! Invocation context state machine
//!
//! One [`InvocationContext`] exists per invocation. It starts `Pending`
//! and moves to exactly one terminal state; every completion path
//! (explicit call, future settlement, sync return, timeout) routes
//! through a single guarded routine, so the first caller wins and later
//! calls are silent no-ops. The finalization hook fires exactly once, on
//! the winning transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use funcsim_core::{InvokeError, InvokeId};

/// Completion state of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    Succeeded,
    Failed,
}

/// Terminal result delivered over the completion channel
#[derive(Debug)]
pub(crate) enum Outcome {
    Success(Value),
    Failure(InvokeError),
}

pub(crate) struct ContextParams {
    pub function_name: String,
    pub memory_limit_mb: u64,
    pub timeout: Duration,
    pub invoke_id: InvokeId,
    pub client_context: Option<Value>,
    pub wait_for_pending_tasks: bool,
}

/// Per-invocation context passed to the handler
pub struct InvocationContext {
    function_name: String,
    function_version: String,
    memory_limit_mb: u64,
    invoke_id: InvokeId,
    client_context: Option<Value>,
    started: Instant,
    deadline: DateTime<Utc>,
    timeout: Duration,
    wait_for_pending_tasks: bool,
    state: Mutex<CompletionState>,
    completion: Mutex<Option<oneshot::Sender<Outcome>>>,
    timer: Mutex<Option<AbortHandle>>,
    finalizer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    tasks: TaskTracker,
}

impl InvocationContext {
    pub(crate) fn new(params: ContextParams) -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let deadline = Utc::now()
            + chrono::Duration::milliseconds(params.timeout.as_millis() as i64);

        let ctx = Arc::new(Self {
            function_name: params.function_name,
            function_version: funcsim_core::env::FUNCTION_VERSION.to_string(),
            memory_limit_mb: params.memory_limit_mb,
            invoke_id: params.invoke_id,
            client_context: params.client_context,
            started: Instant::now(),
            deadline,
            timeout: params.timeout,
            wait_for_pending_tasks: params.wait_for_pending_tasks,
            state: Mutex::new(CompletionState::Pending),
            completion: Mutex::new(Some(tx)),
            timer: Mutex::new(None),
            finalizer: Mutex::new(None),
            tasks: TaskTracker::new(),
        });

        (ctx, rx)
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn function_version(&self) -> &str {
        &self.function_version
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_mb
    }

    pub fn invoke_id(&self) -> &InvokeId {
        &self.invoke_id
    }

    /// Caller-supplied opaque metadata, forwarded unchanged
    pub fn client_context(&self) -> Option<&Value> {
        self.client_context.as_ref()
    }

    pub fn log_group_name(&self) -> String {
        format!("/aws/lambda/{}", self.function_name)
    }

    pub fn log_stream_name(&self) -> String {
        let suffix: String = self.invoke_id.as_str().chars().take(8).collect();
        format!(
            "{}/[{}]{}",
            Utc::now().format("%Y/%m/%d"),
            self.function_version,
            suffix
        )
    }

    pub fn state(&self) -> CompletionState {
        *self.state.lock()
    }

    /// Wall-clock deadline in milliseconds since the Unix epoch
    pub fn deadline_ms(&self) -> i64 {
        self.deadline.timestamp_millis()
    }

    /// Remaining budget; monotonically non-increasing, never negative.
    pub fn remaining_time(&self) -> Duration {
        self.timeout.saturating_sub(self.started.elapsed())
    }

    pub fn remaining_time_millis(&self) -> u64 {
        self.remaining_time().as_millis() as u64
    }

    /// Complete successfully with a payload.
    pub fn succeed(&self, value: Value) {
        self.complete(Outcome::Success(value));
    }

    /// Complete with a handler failure.
    pub fn fail(&self, error: impl std::fmt::Display) {
        self.complete(Outcome::Failure(InvokeError::Handler(error.to_string())));
    }

    /// Node-style completion: an error wins over a value.
    pub fn done(&self, error: Option<String>, value: Option<Value>) {
        match error {
            Some(message) => self.fail(message),
            None => self.succeed(value.unwrap_or(Value::Null)),
        }
    }

    /// Arm the invocation timer. If it fires before any other completion
    /// path, the invocation fails with a timeout and the timer task is
    /// the one driving finalization.
    pub fn start_timeout(self: &Arc<Self>) {
        let ctx = Arc::clone(self);
        let budget = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            let budget_ms = budget.as_millis() as u64;
            if ctx.complete(Outcome::Failure(InvokeError::Timeout(budget_ms))) {
                warn!(
                    invoke_id = %ctx.invoke_id,
                    function = %ctx.function_name,
                    timeout_ms = budget_ms,
                    "Invocation timed out"
                );
            }
        });
        *self.timer.lock() = Some(handle.abort_handle());
    }

    /// Spawn background work tied to this invocation. Drained before the
    /// engine returns when `wait_for_pending_tasks` is set.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tasks.spawn(future)
    }

    pub(crate) fn set_finalizer(&self, finalizer: Box<dyn FnOnce() + Send>) {
        *self.finalizer.lock() = Some(finalizer);
    }

    /// The guarded completion routine. The first call takes the channel
    /// sender and wins: it records the terminal state, cancels the
    /// pending timer, runs the finalization hook, and resolves the
    /// channel. Every later call observes the taken sender and drops out.
    pub(crate) fn complete(&self, outcome: Outcome) -> bool {
        let Some(tx) = self.completion.lock().take() else {
            debug!(invoke_id = %self.invoke_id, "Completion after terminal state ignored");
            return false;
        };

        *self.state.lock() = match &outcome {
            Outcome::Success(_) => CompletionState::Succeeded,
            Outcome::Failure(_) => CompletionState::Failed,
        };

        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        if let Some(finalizer) = self.finalizer.lock().take() {
            finalizer();
        }

        let _ = tx.send(outcome);
        true
    }

    /// Wait for handler-spawned work after completion, when requested.
    ///
    /// Only honored on the multi-thread runtime flavor; elsewhere the
    /// default behavior (conclude on first completion) applies.
    pub(crate) async fn drain_pending(&self) {
        if !self.wait_for_pending_tasks {
            return;
        }
        match tokio::runtime::Handle::current().runtime_flavor() {
            tokio::runtime::RuntimeFlavor::MultiThread => {
                self.tasks.close();
                self.tasks.wait().await;
            }
            _ => {
                warn!(
                    invoke_id = %self.invoke_id,
                    "wait_for_pending_tasks requires the multi-thread runtime; \
                     concluding on completion instead"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context(timeout: Duration) -> (Arc<InvocationContext>, oneshot::Receiver<Outcome>) {
        InvocationContext::new(ContextParams {
            function_name: "index.handler".to_string(),
            memory_limit_mb: 128,
            timeout,
            invoke_id: InvokeId::with_id("0123456789abcdef0123456789abcdef"),
            client_context: None,
            wait_for_pending_tasks: false,
        })
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let (ctx, rx) = test_context(Duration::from_secs(3));

        ctx.succeed(json!({"winner": true}));
        ctx.succeed(json!({"winner": false}));
        ctx.fail("too late");

        assert_eq!(ctx.state(), CompletionState::Succeeded);
        match rx.await.unwrap() {
            Outcome::Success(value) => assert_eq!(value, json!({"winner": true})),
            Outcome::Failure(e) => panic!("expected success, got {e}"),
        }
    }

    #[tokio::test]
    async fn test_finalizer_fires_exactly_once() {
        let (ctx, _rx) = test_context(Duration::from_secs(3));
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let observed = count.clone();
        ctx.set_finalizer(Box::new(move || {
            observed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        ctx.fail("first");
        ctx.fail("second");
        ctx.succeed(Value::Null);

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_completes_with_timeout_error() {
        let (ctx, rx) = test_context(Duration::from_millis(50));
        ctx.start_timeout();

        match rx.await.unwrap() {
            Outcome::Failure(InvokeError::Timeout(ms)) => assert_eq!(ms, 50),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(ctx.state(), CompletionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_cancels_timer() {
        let (ctx, rx) = test_context(Duration::from_millis(50));
        ctx.start_timeout();
        ctx.succeed(json!("done"));

        // The timer was aborted; advancing past the budget must not
        // change the outcome.
        tokio::time::sleep(Duration::from_millis(200)).await;

        match rx.await.unwrap() {
            Outcome::Success(value) => assert_eq!(value, json!("done")),
            Outcome::Failure(e) => panic!("timer fired after completion: {e}"),
        }
    }

    #[tokio::test]
    async fn test_remaining_time_non_increasing() {
        let (ctx, _rx) = test_context(Duration::from_secs(3));

        let first = ctx.remaining_time();
        let second = ctx.remaining_time();
        assert!(second <= first);
        assert!(first <= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_remaining_time_never_negative() {
        let (ctx, _rx) = test_context(Duration::from_millis(0));
        assert_eq!(ctx.remaining_time(), Duration::ZERO);
        assert_eq!(ctx.remaining_time_millis(), 0);
    }

    #[tokio::test]
    async fn test_done_routes_error_over_value() {
        let (ctx, rx) = test_context(Duration::from_secs(3));
        ctx.done(Some("boom".to_string()), Some(json!("ignored")));

        match rx.await.unwrap() {
            Outcome::Failure(InvokeError::Handler(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected handler failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_done_without_value_is_null_success() {
        let (ctx, rx) = test_context(Duration::from_secs(3));
        ctx.done(None, None);

        match rx.await.unwrap() {
            Outcome::Success(value) => assert_eq!(value, Value::Null),
            Outcome::Failure(e) => panic!("expected success, got {e}"),
        }
    }
}
