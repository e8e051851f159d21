use clap::Parser;
use salesrelay::client::{ChatSession, PipelineSession, StreamOutcome};
use salesrelay::main_helper::router;
use salesrelay::reducer::{ChatOptions, ChatState, StageStatus, TurnRole};
use salesrelay::{AppState, Args, ConversationId, RelayError, RunId, TurnId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse(events: &[serde_json::Value]) -> String {
    events
        .iter()
        .map(|e| format!("data: {}\n\n", e))
        .collect::<String>()
}

fn event_stream(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

/// Serves the relay on an ephemeral port in front of `gateway`.
async fn spawn_bff(gateway: &MockServer) -> String {
    let uri = gateway.uri();
    let args = Args::parse_from(["salesrelay", "--gateway-url", uri.as_str()]);
    let app = router(Arc::new(AppState::new(args).unwrap()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn browser(cookie: &str) -> reqwest::Client {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.insert(
        reqwest::header::COOKIE,
        reqwest::header::HeaderValue::from_str(cookie).unwrap(),
    );
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .unwrap()
}

#[tokio::test]
async fn chat_streams_through_the_relay() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sales/meeting-minutes/m-7/chat"))
        .and(header("authorization", "Bearer good"))
        .and(body_json(json!({ "content": "要点は？", "conversation_id": null })))
        .respond_with(event_stream(sse(&[
            json!({ "type": "start", "conversation_id": "c-1" }),
            json!({ "type": "info", "message": "議事録を読み込みました" }),
            json!({ "type": "chunk", "content": "予算は" }),
            json!({ "type": "chunk", "content": "来期確定です" }),
            json!({ "type": "done", "message_id": "msg-3" }),
        ])))
        .expect(1)
        .mount(&gateway)
        .await;

    let bff = spawn_bff(&gateway).await;
    let mut session = ChatSession::new(
        browser("access_token=good; refresh_token=r1"),
        format!("{}/api/sales/meeting-minutes/m-7/chat", bff),
        ChatOptions::default(),
    );
    let body = session.meeting_chat_body("要点は？");
    let outcome = session
        .send("要点は？", &body, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed);
    let reducer = session.reducer();
    assert_eq!(reducer.state(), ChatState::Idle);
    assert_eq!(reducer.conversation_id(), Some(&ConversationId("c-1".into())));

    let turns = reducer.turns();
    let roles: Vec<TurnRole> = turns.iter().map(|t| t.role).collect();
    assert_eq!(roles, vec![TurnRole::User, TurnRole::Info, TurnRole::Assistant]);
    assert_eq!(turns[1].content, "議事録を読み込みました");
    assert_eq!(turns[2].content, "予算は来期確定です");
    assert_eq!(turns[2].id, TurnId("msg-3".into()));
    assert_eq!(turns[0].conversation_id, Some(ConversationId("c-1".into())));

    // follow-up carries the adopted conversation id
    assert_eq!(
        session.meeting_chat_body("次は？"),
        json!({ "content": "次は？", "conversation_id": "c-1" })
    );
}

#[tokio::test]
async fn proposal_chat_splits_thinking_markers() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sales/proposal-chat/stream"))
        .and(body_json(json!({ "query": "提案して", "knowledge_base_id": "kb-1", "area": "関東" })))
        .respond_with(event_stream(sse(&[
            json!({ "type": "start", "conversation_id": "c-9" }),
            json!({ "type": "chunk", "content": "__THINK__顧客は製造業" }),
            json!({ "type": "chunk", "content": "__THINK_END__提案A: 在庫最適化を軸にした段階導入" }),
            json!({ "type": "done" }),
        ])))
        .mount(&gateway)
        .await;

    let options = ChatOptions {
        thinking: true,
        ..ChatOptions::default()
    };
    let mut session = ChatSession::new(
        reqwest::Client::new(),
        format!("{}/sales/proposal-chat/stream", gateway.uri()),
        options,
    );
    let body = ChatSession::proposal_chat_body("提案して", "kb-1", Some("関東"));
    session
        .send("提案して", &body, &CancellationToken::new())
        .await
        .unwrap();

    let assistant = session.reducer().turns().last().unwrap();
    assert_eq!(assistant.role, TurnRole::Assistant);
    assert_eq!(assistant.thinking.as_deref(), Some("顧客は製造業"));
    assert_eq!(assistant.content, "提案A: 在庫最適化を軸にした段階導入");
    assert!(assistant.thinking_duration_secs.is_some());
}

#[tokio::test]
async fn error_event_drops_empty_assistant_turn() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&[
            json!({ "type": "start" }),
            json!({ "type": "error", "error": "LLM quota exceeded" }),
        ])))
        .mount(&gateway)
        .await;

    let mut session = ChatSession::new(reqwest::Client::new(), gateway.uri(), ChatOptions::default());
    let err = session
        .send("hi", &json!({ "content": "hi" }), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err.inner, RelayError::StreamProtocol(ref m) if m == "LLM quota exceeded"));
    let turns = session.reducer().turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::User);
    assert_eq!(session.reducer().state(), ChatState::Idle);
}

#[tokio::test]
async fn http_errors_map_to_typed_failures() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/unauthorized"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Not authenticated" })))
        .mount(&gateway)
        .await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "boom" })))
        .mount(&gateway)
        .await;

    let cancel = CancellationToken::new();
    let mut session = ChatSession::new(
        reqwest::Client::new(),
        format!("{}/unauthorized", gateway.uri()),
        ChatOptions::default(),
    );
    let err = session.send("a", &json!({}), &cancel).await.unwrap_err();
    assert!(matches!(err.inner, RelayError::Unauthenticated(_)));

    let mut session = ChatSession::new(
        reqwest::Client::new(),
        format!("{}/broken", gateway.uri()),
        ChatOptions::default(),
    );
    let err = session.send("b", &json!({}), &cancel).await.unwrap_err();
    assert!(matches!(err.inner, RelayError::UpstreamUnavailable(ref m) if m == "boom"));
    assert_eq!(session.reducer().turns().len(), 1);
    assert_eq!(session.reducer().state(), ChatState::Idle);
}

#[tokio::test]
async fn cancelled_before_send_keeps_only_user_turn() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(event_stream(sse(&[json!({ "type": "chunk", "content": "x" })])))
        .expect(0)
        .mount(&gateway)
        .await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut session = ChatSession::new(reqwest::Client::new(), gateway.uri(), ChatOptions::default());
    let outcome = session.send("hi", &json!({}), &cancel).await.unwrap();

    assert_eq!(outcome, StreamOutcome::Aborted);
    assert_eq!(session.reducer().turns().len(), 1);
    assert_eq!(session.reducer().state(), ChatState::Idle);
}

#[tokio::test]
async fn cancelled_while_waiting_for_response() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            event_stream(sse(&[json!({ "type": "chunk", "content": "late" })]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&gateway)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let mut session = ChatSession::new(reqwest::Client::new(), gateway.uri(), ChatOptions::default());
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        session.send("hi", &json!({}), &cancel),
    )
    .await
    .expect("abort should not wait for the upstream")
    .unwrap();

    assert_eq!(outcome, StreamOutcome::Aborted);
    let turns = session.reducer().turns();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].role, TurnRole::User);
}

#[tokio::test]
async fn pipeline_runs_through_the_relay() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sales/proposal-pipeline/stream"))
        .and(body_json(json!({ "minute_id": "m-1" })))
        .respond_with(event_stream(sse(&[
            json!({ "type": "pipeline_start" }),
            json!({ "type": "stage_start", "stage": 0, "name": "コンテキスト収集" }),
            json!({ "type": "stage_info", "stage": 0, "content": "議事録を取得" }),
            json!({ "type": "stage_complete", "stage": 0, "duration_ms": 120 }),
            json!({ "type": "stage_start", "stage": 1, "skipped": true }),
            json!({ "type": "stage_start", "stage": 2 }),
            json!({ "type": "stage_chunk", "stage": 2, "content": "逆算" }),
            json!({ "type": "error", "stage": 2, "error": "timeout" }),
            json!({ "type": "pipeline_complete", "total_duration_ms": 900 }),
            json!({ "type": "result", "run_id": "run-5" }),
        ])))
        .expect(1)
        .mount(&gateway)
        .await;

    let bff = spawn_bff(&gateway).await;
    let mut session = PipelineSession::new(
        browser("access_token=good"),
        format!("{}/api/sales/proposal-pipeline/stream", bff),
    );
    let outcome = session
        .execute("m-1", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Completed);
    let reducer = session.reducer();
    assert!(reducer.is_complete());
    assert_eq!(reducer.run_id(), Some(&RunId("run-5".into())));

    let statuses: Vec<StageStatus> = reducer.stages().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StageStatus::Completed,
            StageStatus::Skipped,
            StageStatus::Error,
            StageStatus::Pending,
            StageStatus::Pending,
            StageStatus::Pending,
        ]
    );
    assert_eq!(reducer.stage(0).unwrap().duration_ms, Some(120));
    assert_eq!(reducer.section(0).unwrap().content, "議事録を取得\n");
    assert_eq!(reducer.section(1).unwrap().content, "");
    assert_eq!(reducer.section(2).unwrap().content, "逆算\n\nエラー: timeout");
}

#[tokio::test]
async fn loads_a_persisted_run() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sales/proposal-pipeline/runs/run-5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sections": [
                { "stage": 0, "title": "コンテキスト収集", "content": "要約" },
                { "stage": 4, "title": "原稿提案生成", "content": null }
            ],
            "stage_results": {
                "1": { "status": "skipped" },
                "3": { "status": "failed", "duration_ms": 40 }
            }
        })))
        .expect(1)
        .mount(&gateway)
        .await;

    let mut session = PipelineSession::new(
        reqwest::Client::new(),
        format!("{}/sales/proposal-pipeline/stream", gateway.uri()),
    );
    session
        .load_run(
            &format!("{}/sales/proposal-pipeline/runs/", gateway.uri()),
            &RunId("run-5".into()),
        )
        .await
        .unwrap();

    let reducer = session.reducer();
    assert!(reducer.is_complete());
    assert_eq!(reducer.stage(0).unwrap().status, StageStatus::Completed);
    assert_eq!(reducer.stage(1).unwrap().status, StageStatus::Skipped);
    assert_eq!(reducer.stage(3).unwrap().status, StageStatus::Error);
    assert_eq!(reducer.stage(3).unwrap().duration_ms, Some(40));
    assert_eq!(reducer.sections().len(), 2);
    assert_eq!(reducer.section(4).unwrap().content, "");
}

#[tokio::test]
async fn run_without_saved_detail_is_an_error() {
    let gateway = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sales/proposal-pipeline/runs/run-6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "stage_results": { "0": { "status": "completed", "duration_ms": 10 } }
        })))
        .expect(1)
        .mount(&gateway)
        .await;

    let mut session = PipelineSession::new(reqwest::Client::new(), gateway.uri());
    let err = session
        .load_run(
            &format!("{}/sales/proposal-pipeline/runs", gateway.uri()),
            &RunId("run-6".into()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err.inner, RelayError::RunDetailMissing(ref id) if id == "run-6"));
    assert!(!session.reducer().is_complete());
    assert!(session
        .reducer()
        .stages()
        .iter()
        .all(|s| s.status == StageStatus::Pending));
}

#[tokio::test]
async fn pipeline_abort_resets_running_stage() {
    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "detail": "expired" })))
        .mount(&gateway)
        .await;

    let mut session = PipelineSession::new(reqwest::Client::new(), gateway.uri());
    let err = session
        .execute("m-1", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.inner, RelayError::Unauthenticated(ref m) if m == "expired"));
    assert!(session
        .reducer()
        .stages()
        .iter()
        .all(|s| s.status == StageStatus::Pending));
}
