use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use consensus_labeler::gateway::openrouter::{ChatProvider, OpenRouterAdapter};
use consensus_labeler::gateway::{
    chat_cost, Attribution, ChatModel, ChatRequest, FinishReason, GatewayConfig, Message,
    ProviderError, ProviderGateway, TallyUsageSink,
};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-shard-1", server.uri(), Duration::from_secs(5), None).unwrap()
}

fn batch_request(model: &str) -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter(model),
        vec![
            Message::system("Classify sentiment."),
            Message::user("<record index=\"0\" id=\"c1\"><text>great</text></record>"),
        ],
        Attribution::new("classify::fast").with_shard(1),
    )
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 120, "completion_tokens": 30 }
    })
}

#[tokio::test]
async fn adapter_sends_bearer_credential_and_parses_content() {
    let server = MockServer::start().await;
    let body = r#"[{"label":"positive","confidence":{"positive":0.9,"neutral":0.08,"negative":0.02}}]"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-shard-1"))
        .and(body_partial_json(json!({ "model": "google/gemini-2.5-flash" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(body)))
        .expect(1)
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .chat(&batch_request("google/gemini-2.5-flash"))
        .await
        .unwrap();
    assert_eq!(resp.content, body);
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 120);
    assert_eq!(resp.output_tokens, 30);
    assert_eq!(
        resp.cost_nanodollars,
        chat_cost("google/gemini-2.5-flash", 120, 30)
    );
}

#[tokio::test]
async fn structured_output_in_tool_call_is_used_when_content_is_empty() {
    let server = MockServer::start().await;
    let args = r#"{"results":[{"index":0,"label":"neutral","confidence":0.7}]}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let req = batch_request("openai/gpt-5-mini").json();
    let resp = adapter(&server).chat(&req).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn refusal_is_reported_as_refused() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("I cannot classify these comments.")),
        )
        .mount(&server)
        .await;

    let err = adapter(&server)
        .chat(&batch_request("google/gemini-2.5-pro"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn http_429_is_a_retryable_rate_limit_with_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-42")
                .set_body_json(json!({
                    "error": { "message": "quota exceeded", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server)
        .chat(&batch_request("google/gemini-2.5-flash"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("req-42"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn client_errors_are_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "unknown model" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .chat(&batch_request("nope/model"))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(err.context().and_then(|c| c.http_status), Some(400));
}

/// Fails with a 503 for the first `failures` calls, then succeeds.
#[derive(Clone)]
struct FlakyResponder {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Respond for FlakyResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            ResponseTemplate::new(503).set_body_json(json!({
                "error": { "message": "upstream overloaded" }
            }))
        } else {
            ResponseTemplate::new(200).set_body_json(completion("[]"))
        }
    }
}

#[tokio::test]
async fn provider_gateway_retries_server_errors_and_tallies_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            failures: 1,
        })
        .mount(&server)
        .await;

    let usage = Arc::new(TallyUsageSink::new());
    let gateway = ProviderGateway::with_config(
        adapter(&server),
        usage.clone(),
        GatewayConfig {
            max_retries: 1,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let req = ChatRequest::new(
        ChatModel::openrouter("google/gemini-2.5-flash"),
        vec![Message::user("hi")],
        Attribution::new("classify::fast")
            .with_run(Uuid::new_v4())
            .with_shard(2),
    );
    let resp = gateway.chat(req).await.unwrap();
    assert_eq!(resp.content, "[]");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let totals = usage.snapshot();
    let flash = &totals["google/gemini-2.5-flash"];
    assert_eq!(flash.calls, 2);
    assert_eq!(flash.failed_calls, 1);
    assert_eq!(flash.input_tokens, 120);
    assert_eq!(flash.output_tokens, 30);
    assert_eq!(usage.total_cost_nanodollars(), resp.cost_nanodollars);
}

#[tokio::test]
async fn provider_gateway_without_retries_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlakyResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            failures: 5,
        })
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(TallyUsageSink::new()),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::from_millis(0),
        },
    );

    let err = gateway
        .chat(batch_request("google/gemini-2.5-pro"))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
