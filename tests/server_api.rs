//! HTTP surface of the server, driven in-process and over a real socket.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use todosync::clock::SystemClock;
use todosync::config::SyncConfig;
use todosync::db::LocalStore;
use todosync::models::{Document, DocumentBody, Item};
use todosync::protocol::{EventStreamDecoder, Frame};
use todosync::server::{router, AppState, ChangeNotifier, ServerStore};
use todosync::{HttpRemote, RemoteStore, SyncContext};

struct TestServer {
    app: Router,
    notifier: Arc<ChangeNotifier>,
    _temp_dir: TempDir,
}

async fn server() -> TestServer {
    server_with_heartbeat(Duration::from_secs(30)).await
}

async fn server_with_heartbeat(heartbeat: Duration) -> TestServer {
    let temp_dir = TempDir::new().unwrap();
    let store = ServerStore::open(&temp_dir.path().join("server.db"))
        .await
        .unwrap();
    let notifier = Arc::new(ChangeNotifier::new(
        Arc::new(SystemClock),
        heartbeat,
        8,
    ));
    let app = router(AppState {
        store,
        notifier: notifier.clone(),
    });
    TestServer {
        app,
        notifier,
        _temp_dir: temp_dir,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let server = server().await;
    let (status, body) = send(&server.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_item_lifecycle() {
    let server = server().await;
    let item = Item::new("water plants");
    let payload = serde_json::to_value(&item).unwrap();

    let (status, created) = send(&server.app, Method::POST, "/api/items", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], item.id.as_str());
    assert_eq!(created["completed"], false);

    let (status, _) = send(&server.app, Method::POST, "/api/items", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);

    let uri = format!("/api/items/{}/completed", item.id);
    let (status, updated) = send(&server.app, Method::PUT, &uri, Some(json!({ "completed": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["completed"], true);

    let (_, listed) = send(&server.app, Method::GET, "/api/items", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let uri = format!("/api/items/{}", item.id);
    let (status, _) = send(&server.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&server.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, listed) = send(&server.app, Method::GET, "/api/items", None).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_set_completed_unknown_item_is_404() {
    let server = server().await;
    let (status, body) = send(
        &server.app,
        Method::PUT,
        "/api/items/missing/completed",
        Some(json!({ "completed": true })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["message"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_body_requires_parent_document() {
    let server = server().await;
    let orphan = DocumentBody::new("no-such-document", "text");
    let (status, _) = send(
        &server.app,
        Method::POST,
        "/api/document-bodies",
        Some(serde_json::to_value(&orphan).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let document = Document::new("parent");
    let (status, _) = send(
        &server.app,
        Method::POST,
        "/api/documents",
        Some(serde_json::to_value(&document).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let body = DocumentBody::new(&document.id, "text");
    let (status, _) = send(
        &server.app,
        Method::POST,
        "/api/document-bodies",
        Some(serde_json::to_value(&body).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, bodies) = send(&server.app, Method::GET, "/api/document-bodies", None).await;
    assert_eq!(bodies[0]["documentId"], document.id.as_str());
}

#[tokio::test]
async fn test_last_change_advances_on_mutation_only() {
    let server = server().await;
    let (_, before) = send(&server.app, Method::GET, "/api/changes/last", None).await;
    let before = before["timestamp"].as_i64().unwrap();

    send(&server.app, Method::GET, "/api/items", None).await;
    let (_, unchanged) = send(&server.app, Method::GET, "/api/changes/last", None).await;
    assert_eq!(unchanged["timestamp"].as_i64().unwrap(), before);

    let item = serde_json::to_value(Item::new("x")).unwrap();
    send(&server.app, Method::POST, "/api/items", Some(item)).await;
    let (_, after) = send(&server.app, Method::GET, "/api/changes/last", None).await;
    assert!(after["timestamp"].as_i64().unwrap() > before);
}

#[tokio::test]
async fn test_event_stream_connects_and_cleans_up() {
    let server = server().await;
    let request = Request::builder()
        .uri("/api/events")
        .body(Body::empty())
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    assert_eq!(response.headers()["x-accel-buffering"], "no");
    assert_eq!(server.notifier.connection_count(), 1);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.contains("event: connected\n"));
    assert!(text.contains("\"connectionId\""));

    let item = serde_json::to_value(Item::new("announced")).unwrap();
    send(&server.app, Method::POST, "/api/items", Some(item)).await;
    let next = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(next.to_vec()).unwrap();
    assert!(text.contains("event: item-change\n"));
    assert!(text.contains("\"type\":\"created\""));

    drop(body);
    assert_eq!(server.notifier.connection_count(), 0);
}

#[tokio::test]
async fn test_idle_stream_sends_heartbeat() {
    let server = server_with_heartbeat(Duration::from_millis(50)).await;
    let request = Request::builder()
        .uri("/api/events")
        .body(Body::empty())
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();

    let mut decoder = EventStreamDecoder::new();
    let mut body = response.into_body().into_data_stream();
    let frames = tokio::time::timeout(Duration::from_secs(2), async {
        let mut frames = Vec::new();
        while frames.len() < 2 {
            let chunk = body.next().await.unwrap().unwrap();
            frames.extend(decoder.push(&chunk));
        }
        frames
    })
    .await
    .unwrap();

    assert!(matches!(&frames[0], Frame::Event { name, .. } if name == "connected"));
    assert!(frames[1].is_heartbeat());
}

#[tokio::test]
async fn test_http_remote_against_live_server() {
    let server = server().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let remote: Arc<dyn RemoteStore> = Arc::new(
        HttpRemote::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap(),
    );

    let temp_dir = TempDir::new().unwrap();
    let open = |name: &'static str| {
        let path = temp_dir.path().join(name);
        let remote = remote.clone();
        async move {
            let store = LocalStore::open(&path).await.unwrap();
            SyncContext::new(store, Some(remote), Arc::new(SystemClock), SyncConfig::default())
        }
    };
    let a = open("a.db").await;
    let b = open("b.db").await;

    let item = a.replica().create_item("over the wire").await.unwrap();
    a.replica().set_completed(&item.id, true).await.unwrap();
    assert_eq!(a.tracker().count().await.unwrap(), 0);

    let summary = b.engine().unwrap().reconcile().await.unwrap().unwrap();
    assert!(summary.remote_reachable);
    assert_eq!(summary.pulled_inserted, 1);
    assert!(b.replica().get_item(&item.id).await.unwrap().unwrap().completed);

    let mut stream = remote.subscribe().await.unwrap();
    let connected = stream.next().await.unwrap().unwrap();
    assert!(matches!(&connected, Frame::Event { name, .. } if name == "connected"));

    a.replica().delete_item(&item.id).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match frame {
        Frame::Event { name, data } => {
            assert_eq!(name, "item-change");
            let notice: Value = serde_json::from_str(&data).unwrap();
            assert_eq!(notice["type"], "deleted");
            assert_eq!(notice["entityId"], item.id.as_str());
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    let missing = remote.set_completed("missing", true).await.unwrap_err();
    assert!(!missing.is_connectivity());
}
