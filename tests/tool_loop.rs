//! End-to-end tests across the full stack: hooks over a pool over chat
//! backends over scripted transports.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;

use llmux::{
    Backend, BackendPool, ChatBackend, ChatTurn, FinishReason, HookedBackend, IdentityHook,
    LlmError, MetricsHook, MockTransport, QueryArgs, Queryable, StreamChunk, Tool, ToolCall,
};

fn adder() -> Tool {
    Tool::new(
        "add",
        "Add two numbers",
        json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        }),
        |args: serde_json::Value| async move {
            let a = args["a"].as_f64().ok_or("missing a")?;
            let b = args["b"].as_f64().ok_or("missing b")?;
            Ok(json!(a + b))
        },
    )
}

fn backend_over(transport: Arc<MockTransport>) -> Arc<dyn Backend> {
    Arc::new(ChatBackend::new(transport))
}

#[tokio::test]
async fn pool_fails_over_to_healthy_backend() {
    let sick = Arc::new(MockTransport::named("sick"));
    sick.script_error(LlmError::Timeout);
    let healthy = Arc::new(MockTransport::named("healthy"));
    healthy.script_turn(ChatTurn::text("rescued"));

    let pool = BackendPool::new(vec![backend_over(sick.clone()), backend_over(healthy.clone())])
        .with_max_retries(0)
        .with_backoff_multiplier(0.0);

    // Budget of one attempt: the sick backend is evicted on its failure.
    let err = pool
        .query_text(QueryArgs::new().with("QUERY", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Timeout));
    assert_eq!(pool.len().await, 1);

    let answer = pool
        .query_text(QueryArgs::new().with("QUERY", "hello"))
        .await
        .unwrap();
    assert_eq!(answer, "rescued");
    assert_eq!(sick.round_trips(), 1);
    assert_eq!(healthy.round_trips(), 1);
}

#[tokio::test]
async fn retries_within_one_backend_before_surfacing() {
    let flaky = Arc::new(MockTransport::named("flaky"));
    flaky.script_error(LlmError::NetworkError("blip".into()));
    flaky.script_turn(ChatTurn::text("recovered"));

    let pool = BackendPool::new(vec![backend_over(flaky.clone())])
        .with_max_retries(2)
        .with_backoff_multiplier(0.0);

    let answer = pool
        .query_text(QueryArgs::new().with("QUERY", "hello"))
        .await
        .unwrap();
    assert_eq!(answer, "recovered");
    assert_eq!(flaky.round_trips(), 2);
}

#[tokio::test]
async fn identity_hooks_over_a_pool_change_nothing() {
    let direct_transport = Arc::new(MockTransport::new());
    direct_transport.script_turn(ChatTurn::text("same answer"));
    let direct = ChatBackend::new(direct_transport);
    let expected = direct
        .query_text(QueryArgs::new().with("QUERY", "q").with("temperature", 0.5))
        .await
        .unwrap();

    let transport = Arc::new(MockTransport::new());
    transport.script_turn(ChatTurn::text("same answer"));
    let pool = BackendPool::new(vec![backend_over(transport.clone())]).with_backoff_multiplier(0.0);
    let stacked = HookedBackend::new(Arc::new(pool), Arc::new(IdentityHook))
        .layer(Arc::new(IdentityHook))
        .layer(Arc::new(IdentityHook));

    let answer = stacked
        .query_text(QueryArgs::new().with("QUERY", "q").with("temperature", 0.5))
        .await
        .unwrap();
    assert_eq!(answer, expected);

    // Exactly one underlying round-trip despite three hook layers.
    assert_eq!(transport.round_trips(), 1);
    let seen = transport.requests_seen();
    assert_eq!(seen[0].extra["temperature"], json!(0.5));
}

#[tokio::test]
async fn tool_loop_through_hooked_pool() {
    let transport = Arc::new(MockTransport::new());
    transport.script_turn(ChatTurn::tool_calls(vec![ToolCall::function(
        "c1",
        "add",
        r#"{"a": 19, "b": 23}"#,
    )]));
    transport.script_turn(ChatTurn::text("the answer is 42").with_tokens(5));

    let backend = ChatBackend::new(transport.clone()).with_tool(adder());
    let pool = BackendPool::new(vec![Arc::new(backend)]).with_backoff_multiplier(0.0);

    let metrics = Arc::new(MetricsHook::new());
    let stacked = HookedBackend::new(Arc::new(pool), metrics.clone());

    let answer = stacked
        .query_text(QueryArgs::new().with("QUERY", "what is 19 + 23?"))
        .await
        .unwrap();
    assert_eq!(answer, "the answer is 42");

    // Two round-trips inside one logical (and one hooked) call.
    assert_eq!(transport.round_trips(), 2);
    assert_eq!(metrics.calls(), 1);

    // The tool result went back to the model as message content.
    let seen = transport.requests_seen();
    assert_eq!(seen[1].messages[2].content, "42.0");
}

#[tokio::test]
async fn call_limit_bounds_round_trips_through_the_stack() {
    let transport = Arc::new(MockTransport::new());
    transport.script_turn(ChatTurn::tool_calls(vec![ToolCall::function(
        "c1",
        "add",
        r#"{"a": 1, "b": 2}"#,
    )]));
    transport.script_turn(ChatTurn::tool_calls(vec![ToolCall::function(
        "c2",
        "add",
        r#"{"a": 3, "b": 4}"#,
    )]));
    transport.script_turn(ChatTurn::text("finished"));

    let make_pool = |transport: &Arc<MockTransport>| {
        let backend = ChatBackend::new(transport.clone()).with_tool(adder());
        BackendPool::new(vec![Arc::new(backend) as Arc<dyn Backend>])
            .with_max_retries(0)
            .with_backoff_multiplier(0.0)
    };

    // Budget of one round: the second tool_calls turn exceeds it. The pool
    // has a zero-retry budget, so the failure surfaces unchanged.
    let pool = make_pool(&transport);
    let err = pool
        .query_text(QueryArgs::new().with("QUERY", "go").with("call_limit", 1))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::ToolCallLimitExceeded));

    // Budget of two: the same script completes after two tool rounds.
    let transport = Arc::new(MockTransport::new());
    transport.script_turn(ChatTurn::tool_calls(vec![ToolCall::function(
        "c1",
        "add",
        r#"{"a": 1, "b": 2}"#,
    )]));
    transport.script_turn(ChatTurn::tool_calls(vec![ToolCall::function(
        "c2",
        "add",
        r#"{"a": 3, "b": 4}"#,
    )]));
    transport.script_turn(ChatTurn::text("finished"));

    let pool = make_pool(&transport);
    let answer = pool
        .query_text(QueryArgs::new().with("QUERY", "go").with("call_limit", 2))
        .await
        .unwrap();
    assert_eq!(answer, "finished");
    assert_eq!(transport.round_trips(), 3);
}

#[tokio::test]
async fn streamed_tool_turn_materializes_through_the_stack() {
    let transport = Arc::new(MockTransport::new());
    transport.script_chunks(vec![
        StreamChunk::ToolCallDelta {
            id: Some("c1".to_string()),
            name: Some("add".to_string()),
            arguments: Some(r#"{"a": 40,"#.to_string()),
        },
        StreamChunk::ToolCallDelta {
            id: None,
            name: None,
            arguments: Some(r#" "b": 2}"#.to_string()),
        },
        StreamChunk::Finished {
            reason: FinishReason::ToolCalls,
        },
    ]);
    transport.script_chunks(vec![
        StreamChunk::Content("42".to_string()),
        StreamChunk::Finished {
            reason: FinishReason::Stop,
        },
    ]);

    let backend = ChatBackend::new(transport.clone()).with_tool(adder());
    let pool = BackendPool::new(vec![Arc::new(backend) as Arc<dyn Backend>])
        .with_backoff_multiplier(0.0);

    let stream = pool
        .query_stream(QueryArgs::new().with("QUERY", "what is 40 + 2?"))
        .await
        .unwrap();
    let chunks: Vec<String> = stream.map(|c| c.unwrap()).collect().await;

    // Tools force full materialization: one yield with the final text.
    assert_eq!(chunks, vec!["42"]);
    assert_eq!(transport.round_trips(), 2);
}
