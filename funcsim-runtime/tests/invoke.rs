//! End-to-end invocation tests with in-memory handlers

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use funcsim_runtime::{
    execute, handler_fn, ClientContext, CompletionState, EventSource, FnHandler, Handler,
    HandlerOutcome, InvokeError, InvokeOptions,
};

fn in_memory(handler: impl Handler + 'static) -> InvokeOptions {
    InvokeOptions {
        handler: Some(Arc::new(handler)),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_explicit_completion_returns_value() {
    let options = in_memory(FnHandler::new(|_event, ctx| {
        ctx.succeed(json!({"status": "ok"}));
        Ok(HandlerOutcome::Deferred)
    }));

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!({"status": "ok"}));
}

#[tokio::test]
async fn test_second_completion_is_ignored() {
    let options = in_memory(FnHandler::new(|_event, ctx| {
        ctx.succeed(json!("first"));
        ctx.succeed(json!("second"));
        ctx.fail("third");
        Ok(HandlerOutcome::Deferred)
    }));

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!("first"));
}

#[tokio::test]
async fn test_async_handler_resolves_future() {
    let options = in_memory(handler_fn(|event: Value| async move {
        Ok::<_, std::convert::Infallible>(json!({ "echo": event }))
    }));

    let result = execute(InvokeOptions {
        event: EventSource::Value(json!({"x": 1})),
        ..options
    })
    .await
    .unwrap();
    assert_eq!(result, json!({"echo": {"x": 1}}));
}

#[tokio::test]
async fn test_sync_return_succeeds_with_empty_payload() {
    let options = in_memory(FnHandler::new(|_event, _ctx| Ok(HandlerOutcome::Sync)));

    let result = execute(options).await.unwrap();
    assert_eq!(result, Value::Null);
}

#[tokio::test]
async fn test_handler_error_is_handler_failure() {
    let options = in_memory(FnHandler::new(|_event, _ctx| Err("database offline".into())));

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Handler(_)));
    assert!(err.to_string().contains("database offline"));
}

#[tokio::test]
async fn test_handler_panic_is_handler_failure() {
    let options = in_memory(FnHandler::new(|_event, _ctx| panic!("boom")));

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Handler(_)));
    assert!(err.to_string().contains("boom"));
}

#[tokio::test]
async fn test_rejected_future_is_handler_failure() {
    let options = in_memory(handler_fn(|_event: Value| async move {
        Err::<Value, _>("downstream unavailable")
    }));

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Handler(_)));
}

#[tokio::test]
async fn test_timeout_when_handler_never_completes() {
    let options = InvokeOptions {
        timeout_ms: 50,
        ..in_memory(FnHandler::new(|_event, _ctx| Ok(HandlerOutcome::Deferred)))
    };

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Timeout(50)));
}

#[tokio::test]
async fn test_late_completion_after_timeout_is_dropped() {
    let captured: Arc<Mutex<Option<Arc<funcsim_runtime::InvocationContext>>>> =
        Arc::new(Mutex::new(None));

    let slot = captured.clone();
    let options = InvokeOptions {
        timeout_ms: 50,
        ..in_memory(FnHandler::new(move |_event, ctx| {
            *slot.lock().unwrap() = Some(ctx);
            Ok(HandlerOutcome::Deferred)
        }))
    };

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Timeout(_)));

    let ctx = captured.lock().unwrap().take().unwrap();
    ctx.succeed(json!("too late"));
    assert_eq!(ctx.state(), CompletionState::Failed);
}

#[tokio::test]
async fn test_remaining_time_visible_to_handler() {
    let options = InvokeOptions {
        timeout_ms: 5000,
        ..in_memory(FnHandler::new(|_event, ctx| {
            let first = ctx.remaining_time();
            let second = ctx.remaining_time();
            assert!(first <= Duration::from_millis(5000));
            assert!(second <= first);
            ctx.succeed(json!(ctx.remaining_time_millis()));
            Ok(HandlerOutcome::Deferred)
        }))
    };

    let result = execute(options).await.unwrap();
    assert!(result.as_u64().unwrap() <= 5000);
}

#[tokio::test]
async fn test_both_handler_sources_is_configuration_error() {
    let marker = "FUNCSIM_TEST_NO_SIDE_EFFECT";
    std::env::remove_var(marker);

    let mut environment = HashMap::new();
    environment.insert(marker.to_string(), "leaked".to_string());

    let options = InvokeOptions {
        library: Some("/tmp/libhandler.so".into()),
        environment,
        ..in_memory(FnHandler::new(|_event, _ctx| Ok(HandlerOutcome::Sync)))
    };

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Configuration(_)));
    // Fail-fast: validation happens before any environment mutation.
    assert!(std::env::var_os(marker).is_none());
}

#[tokio::test]
async fn test_no_handler_is_configuration_error() {
    let err = execute(InvokeOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvokeError::Configuration(_)));
}

#[tokio::test]
async fn test_invalid_raw_client_context_is_parse_error() {
    let options = InvokeOptions {
        client_context: Some(ClientContext::Raw("{not json".to_string())),
        ..in_memory(FnHandler::new(|_event, _ctx| Ok(HandlerOutcome::Sync)))
    };

    let err = execute(options).await.unwrap_err();
    assert!(matches!(err, InvokeError::Parse(_)));
}

#[tokio::test]
async fn test_raw_client_context_is_parsed_and_forwarded() {
    let options = InvokeOptions {
        client_context: Some(ClientContext::Raw(r#"{"app":"funcsim"}"#.to_string())),
        ..in_memory(FnHandler::new(|_event, ctx| {
            ctx.succeed(ctx.client_context().cloned().unwrap_or(Value::Null));
            Ok(HandlerOutcome::Deferred)
        }))
    };

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!({"app": "funcsim"}));
}

#[tokio::test]
async fn test_event_producer_is_invoked() {
    let options = InvokeOptions {
        event: EventSource::Producer(Arc::new(|| json!({"produced": true}))),
        ..in_memory(FnHandler::new(|event, ctx| {
            ctx.succeed(event);
            Ok(HandlerOutcome::Deferred)
        }))
    };

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!({"produced": true}));
}

#[tokio::test]
async fn test_custom_environment_staged_and_destroyed() {
    let key = "FUNCSIM_TEST_CUSTOM_DESTROY";
    std::env::remove_var(key);

    let mut environment = HashMap::new();
    environment.insert(key.to_string(), "staged".to_string());

    let options = InvokeOptions {
        environment,
        destroy_environment: true,
        ..in_memory(FnHandler::new(move |_event, ctx| {
            ctx.succeed(json!(std::env::var("FUNCSIM_TEST_CUSTOM_DESTROY").unwrap()));
            Ok(HandlerOutcome::Deferred)
        }))
    };

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!("staged"));
    // Reverted by the finalization hook before the result surfaced.
    assert!(std::env::var_os(key).is_none());
}

#[tokio::test]
async fn test_preset_region_survives_staging() {
    std::env::set_var("AWS_REGION", "ap-south-1");

    let options = in_memory(FnHandler::new(|_event, ctx| {
        ctx.succeed(json!(std::env::var("AWS_REGION").unwrap()));
        Ok(HandlerOutcome::Deferred)
    }));

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!("ap-south-1"));
}

#[tokio::test]
async fn test_context_metadata_for_in_memory_handler() {
    let options = in_memory(FnHandler::new(|_event, ctx| {
        assert_eq!(ctx.function_name(), "index.handler");
        assert_eq!(ctx.function_version(), "$LATEST");
        assert_eq!(ctx.log_group_name(), "/aws/lambda/index.handler");
        assert!(!ctx.invoke_id().as_str().is_empty());
        assert!(ctx.deadline_ms() > 0);
        ctx.succeed(Value::Null);
        Ok(HandlerOutcome::Deferred)
    }));

    execute(options).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pending_tasks_drain_before_return() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let finished = Arc::new(AtomicBool::new(false));

    let flag = finished.clone();
    let options = InvokeOptions {
        wait_for_pending_tasks: true,
        ..in_memory(FnHandler::new(move |_event, ctx| {
            let flag = flag.clone();
            ctx.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.store(true, Ordering::SeqCst);
            });
            ctx.succeed(json!("done"));
            Ok(HandlerOutcome::Deferred)
        }))
    };

    let result = execute(options).await.unwrap();
    assert_eq!(result, json!("done"));
    assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_callback_entry_point_delivers_outcome() {
    let options = InvokeOptions {
        handler: Some(Arc::new(FnHandler::new(|_event, ctx| {
            ctx.succeed(json!(42));
            Ok(HandlerOutcome::Deferred)
        }))),
        ..Default::default()
    };

    let delivered = Mutex::new(None);
    funcsim_runtime::execute_with_callback(options, |result| {
        *delivered.lock().unwrap() = Some(result);
    });

    let result = delivered.into_inner().unwrap().unwrap().unwrap();
    assert_eq!(result, json!(42));
}
