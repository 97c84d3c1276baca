use std::sync::Arc;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use branchchat::accounting::{FinishReason, HeuristicTokenCounter};
use branchchat::config::{ChatConfig, ProviderConfig};
use branchchat::error::ChatError;
use branchchat::session::{event_channel, ChatSession, StreamEvent};
use branchchat::store::MemoryStore;
use branchchat::transport::{CompletionClient, FileUrls};
use branchchat::tree::types::{ContentPart, FileRef, MessageId, Role, UserId};
use branchchat::tree::MessageTree;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OWNER: UserId = UserId(3);
const HE: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\n";
const LLO: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\n";
const USAGE: &str = "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":{\"prompt_tokens\":11,\"completion_tokens\":2,\"total_tokens\":13}}\n\n";
const DONE: &str = "data: [DONE]\n\n";

struct NoFiles;

impl FileUrls for NoFiles {
    fn download_url(&self, file: &FileRef) -> Result<String, ChatError> {
        Err(ChatError::NotFound(format!("file {}", file.id)))
    }
}

fn event_stream<S>(chunks: S) -> Response
where
    S: futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
{
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(chunks))
        .expect("build response")
}

fn static_chunks(chunks: &'static [&'static str]) -> Response {
    event_stream(futures_util::stream::iter(
        chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))),
    ))
}

async fn session_against(app: Router) -> ChatSession {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let provider = ProviderConfig {
        name: "mock".to_string(),
        host: format!("http://{addr}"),
        api_key: "sk-mock".to_string(),
        model: "mock-model".to_string(),
        temperature: 0.2,
        idle_timeout_secs: 1,
        connect_timeout_secs: 1,
        max_retries: 2,
    };
    let tree = Arc::new(MessageTree::new(
        Arc::new(MemoryStore::new()),
        Arc::new(HeuristicTokenCounter),
    ));
    ChatSession::new(
        tree,
        Arc::new(CompletionClient::new(&provider).expect("client")),
        Arc::new(NoFiles),
    )
}

fn drain(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_send_commits_reply_as_new_leaf() {
    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&requests);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<Value>| {
            let captured = Arc::clone(&captured);
            async move {
                captured.lock().push(body);
                static_chunks(&[HE, LLO, USAGE, DONE])
            }
        }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, Some("be brief")).unwrap();
    let (tx, mut rx) = event_channel(&ChatConfig::default());

    let (user, reply) = session
        .send(
            OWNER,
            chat.id,
            vec![ContentPart::text("hi")],
            CancellationToken::new(),
            &tx,
        )
        .await
        .expect("reply");

    assert_eq!(reply.parent_id, Some(user.id));
    assert_eq!(reply.role, Role::Assistant);
    assert_eq!(reply.text(), "Hello");
    let usage = reply.usage.as_ref().expect("usage");
    assert_eq!(usage.input_tokens, 11);
    assert_eq!(usage.output_tokens, 2);
    assert!(usage.is_usage_reliable);
    assert_eq!(usage.finish_reason, FinishReason::Success);

    let (chat, _) = session.tree().snapshot(OWNER, chat.id).unwrap();
    assert_eq!(chat.leaf_message_id, Some(reply.id));

    let events = drain(&mut rx);
    assert_eq!(
        events[..2],
        [
            StreamEvent::Delta { text: "He".into() },
            StreamEvent::Delta { text: "llo".into() },
        ]
    );
    assert!(matches!(
        &events[2],
        StreamEvent::Done { message_id, .. } if *message_id == reply.id
    ));

    let body = requests.lock().pop().expect("request");
    assert_eq!(
        body["messages"],
        json!([
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"}
        ])
    );
}

#[tokio::test]
async fn test_missing_usage_falls_back_to_estimate() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { static_chunks(&[HE, LLO, DONE]) }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, None).unwrap();
    let (tx, _rx) = event_channel(&ChatConfig::default());

    let (_, reply) = session
        .send(
            OWNER,
            chat.id,
            vec![ContentPart::text("hi")],
            CancellationToken::new(),
            &tx,
        )
        .await
        .expect("reply");
    let usage = reply.usage.expect("usage");
    assert!(!usage.is_usage_reliable);
    assert_eq!(usage.output_tokens, 2);
    assert_eq!(usage.input_tokens, 1);
}

#[tokio::test]
async fn test_rejected_request_commits_nothing() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": {"message": "context too long"}})),
            )
        }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, None).unwrap();
    let user = session
        .tree()
        .append(OWNER, chat.id, None, Role::User, vec![ContentPart::text("hi")])
        .unwrap();
    let (tx, mut rx) = event_channel(&ChatConfig::default());

    let err = session
        .respond(OWNER, chat.id, CancellationToken::new(), &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Upstream { status: 400, .. }));
    assert_eq!(err.http_status(), StatusCode::BAD_REQUEST);

    let (chat, forest) = session.tree().snapshot(OWNER, chat.id).unwrap();
    assert_eq!(forest.len(), 1);
    assert_eq!(chat.leaf_message_id, Some(user.id));
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [StreamEvent::Error { status: 400, partial_message_id: None, .. }]
    ));
}

#[tokio::test]
async fn test_timeout_keeps_partial_reply() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async {
            event_stream(
                futures_util::stream::iter(vec![Ok(Bytes::from_static(HE.as_bytes()))])
                    .chain(futures_util::stream::pending()),
            )
        }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, None).unwrap();
    let (tx, mut rx) = event_channel(&ChatConfig::default());

    let err = session
        .send(
            OWNER,
            chat.id,
            vec![ContentPart::text("hi")],
            CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::UpstreamTimeout { .. }));

    let (chat, forest) = session.tree().snapshot(OWNER, chat.id).unwrap();
    let leaf = forest.get(chat.leaf_message_id.unwrap()).unwrap();
    assert_eq!(leaf.role, Role::Assistant);
    assert_eq!(leaf.text(), "He");
    let usage = leaf.usage.as_ref().unwrap();
    assert!(!usage.is_usage_reliable);
    assert_eq!(usage.finish_reason, FinishReason::UpstreamTimeout);

    let events = drain(&mut rx);
    assert_eq!(events[0], StreamEvent::Delta { text: "He".into() });
    assert!(matches!(
        &events[1],
        StreamEvent::Error { status: 504, partial_message_id: Some(id), .. } if *id == leaf.id
    ));
}

#[tokio::test]
async fn test_cancel_before_any_text_commits_nothing() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { event_stream(futures_util::stream::pending()) }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, None).unwrap();
    let user = session
        .tree()
        .append(OWNER, chat.id, None, Role::User, vec![ContentPart::text("hi")])
        .unwrap();
    let (tx, _rx) = event_channel(&ChatConfig::default());
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let err = session
        .respond(OWNER, chat.id, cancel, &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Cancelled));

    let (chat, forest) = session.tree().snapshot(OWNER, chat.id).unwrap();
    assert_eq!(forest.len(), 1);
    assert_eq!(chat.leaf_message_id, Some(user.id));
}

#[tokio::test]
async fn test_respond_uses_selected_branch() {
    let requests: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&requests);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |Json(body): Json<Value>| {
            let captured = Arc::clone(&captured);
            async move {
                captured.lock().push(body);
                static_chunks(&[HE, USAGE, DONE])
            }
        }),
    );
    let session = session_against(app).await;
    let tree = session.tree();
    let chat = tree.create_chat(OWNER, None).unwrap();
    let first = tree
        .append(OWNER, chat.id, None, Role::User, vec![ContentPart::text("first")])
        .unwrap();
    let fork = tree
        .edit_and_fork(OWNER, first.id, vec![ContentPart::text("second")])
        .unwrap();
    tree.set_leaf(OWNER, chat.id, Some(fork.id)).unwrap();
    let (tx, _rx) = event_channel(&ChatConfig::default());

    let reply = session
        .respond(OWNER, chat.id, CancellationToken::new(), &tx)
        .await
        .unwrap();
    assert_eq!(reply.parent_id, Some(fork.id));

    let body = requests.lock().pop().unwrap();
    assert_eq!(body["messages"], json!([{"role": "user", "content": "second"}]));
}

#[tokio::test]
async fn test_reply_without_a_parent_left_ends_with_error_event() {
    let slot: Arc<Mutex<Option<(Arc<MessageTree>, MessageId)>>> = Arc::new(Mutex::new(None));
    let pending = Arc::clone(&slot);
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let pending = Arc::clone(&pending);
            async move {
                let target = pending.lock().take();
                if let Some((tree, user)) = target {
                    tree.delete_subtree(OWNER, user, None).expect("delete parent");
                }
                static_chunks(&[HE, LLO, USAGE, DONE])
            }
        }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, None).unwrap();
    let user = session
        .tree()
        .append(OWNER, chat.id, None, Role::User, vec![ContentPart::text("hi")])
        .unwrap();
    *slot.lock() = Some((Arc::clone(session.tree()), user.id));
    let (tx, mut rx) = event_channel(&ChatConfig::default());

    let err = session
        .respond(OWNER, chat.id, CancellationToken::new(), &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));

    let (_, forest) = session.tree().snapshot(OWNER, chat.id).unwrap();
    assert!(forest.is_empty());
    let events = drain(&mut rx);
    assert_eq!(
        events[..2],
        [
            StreamEvent::Delta { text: "He".into() },
            StreamEvent::Delta { text: "llo".into() },
        ]
    );
    assert!(matches!(
        events.get(2),
        Some(StreamEvent::Error { status: 404, partial_message_id: None, .. })
    ));
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn test_dropped_receiver_leaves_caller_token_alone() {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|| async { static_chunks(&[HE, LLO, USAGE, DONE]) }),
    );
    let session = session_against(app).await;
    let chat = session.tree().create_chat(OWNER, None).unwrap();
    session
        .tree()
        .append(OWNER, chat.id, None, Role::User, vec![ContentPart::text("hi")])
        .unwrap();
    let (tx, rx) = event_channel(&ChatConfig::default());
    drop(rx);
    let caller_token = CancellationToken::new();
    let linked = caller_token.child_token();

    let err = session
        .respond(OWNER, chat.id, caller_token.clone(), &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Cancelled));
    assert!(!caller_token.is_cancelled());
    assert!(!linked.is_cancelled());

    // the text applied before the receiver vanished is kept
    let (chat, forest) = session.tree().snapshot(OWNER, chat.id).unwrap();
    let leaf = forest.get(chat.leaf_message_id.unwrap()).unwrap();
    assert_eq!(leaf.role, Role::Assistant);
    assert_eq!(leaf.text(), "He");
    assert_eq!(
        leaf.usage.as_ref().unwrap().finish_reason,
        FinishReason::Cancelled
    );
}
