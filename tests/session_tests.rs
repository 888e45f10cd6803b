//! End-to-end session tests over an in-memory transport.
//!
//! A mock server sits on the other side of the connector: each test drives
//! the wire protocol frame by frame and asserts what the client puts on the
//! wire and what its public surface delivers.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::future::BoxFuture;
use larkdb::{
    Connector, Direction, Error, ExecutionErrorKind, ExecutionResult, InvalidDataKind, LarkDB,
    LarkOptions, TransportEvent, TransportHandle,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// One accepted connection, seen from the server side.
struct ServerConn {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerConn {
    /// Next frame the client wrote, as parsed JSON.
    async fn recv_frame(&mut self) -> Value {
        let text = timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection");
        serde_json::from_str(&text).expect("client sent invalid JSON")
    }

    /// Next frame with the given tag, skipping client acks along the way.
    async fn expect(&mut self, tag: &str) -> Value {
        loop {
            let frame = self.recv_frame().await;
            let (frame_tag, payload) = split(&frame);
            if frame_tag == tag {
                return payload;
            }
            assert_eq!(frame_tag, "ack", "unexpected {} frame while waiting for {}", frame_tag, tag);
        }
    }

    /// Next client ack, returning the acknowledged event id.
    async fn expect_client_ack(&mut self) -> String {
        let frame = self.recv_frame().await;
        let (tag, payload) = split(&frame);
        assert_eq!(tag, "ack");
        payload["evt-id"].as_str().unwrap().to_string()
    }

    fn send(&self, frame: Value) {
        self.to_client
            .send(TransportEvent::Message(frame.to_string()))
            .expect("client dropped the connection");
    }

    fn ack(&self, event_id: &str) {
        self.send(json!({ "ack": { "evt-id": event_id } }));
    }

    fn error(&self, event_id: &str, err_type: &str) {
        self.send(json!({ "err": { "evt-id": event_id, "err-type": err_type } }));
    }

    fn close(&self) {
        let _ = self.to_client.send(TransportEvent::Closed(None));
    }

    /// Performs the connection handshake, returning the connection id and
    /// the tag that opened it (`con` or `rec`).
    async fn handshake(&mut self) -> (String, String) {
        let frame = self.recv_frame().await;
        let (tag, payload) = split(&frame);
        assert!(tag == "con" || tag == "rec", "expected connection request, got {}", tag);
        let connection_id = payload["con-id"].as_str().unwrap().to_string();
        self.ack(payload["evt-id"].as_str().unwrap());
        (connection_id, tag.to_string())
    }
}

fn split(frame: &Value) -> (&str, Value) {
    let obj = frame.as_object().expect("frame is not an object");
    assert_eq!(obj.len(), 1, "frame must have exactly one top-level key");
    let (tag, payload) = obj.iter().next().unwrap();
    (tag.as_str(), payload.clone())
}

struct MockServer {
    conns: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockServer {
    async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

struct MockConnector {
    conns: mpsc::UnboundedSender<ServerConn>,
}

impl Connector for MockConnector {
    fn connect(&self, _url: &str) -> BoxFuture<'static, larkdb::Result<TransportHandle>> {
        let conns = self.conns.clone();
        Box::pin(async move {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            conns
                .send(ServerConn { from_client: out_rx, to_client: in_tx })
                .map_err(|_| Error::Other("mock server is gone".to_string()))?;
            Ok(TransportHandle { outgoing: out_tx, incoming: in_rx })
        })
    }
}

fn setup(host: &str, configure: impl FnOnce(LarkOptions) -> LarkOptions) -> (LarkDB, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = configure(
        LarkOptions::new(BASE64.encode(host)).with_connector(Arc::new(MockConnector { conns: tx })),
    );
    let db = LarkDB::with_options(options).unwrap();
    (db, MockServer { conns: rx })
}

fn server_doc(id: &str, etag: &str, sort_key: &str, body: Value) -> Value {
    json!({ "id": id, "etag": etag, "skey": [sort_key], "body": body })
}

#[tokio::test]
async fn test_connect_handshake_and_heartbeat() {
    let (db, mut server) = setup("heartbeat-host:1", |o| {
        o.with_heartbeat_interval(Duration::from_millis(100))
    });
    let mut conn = server.accept().await;
    let (_, tag) = conn.handshake().await;
    assert_eq!(tag, "con");

    // Silence triggers a no-op round trip.
    let payload = conn.expect("nop").await;
    conn.ack(payload["evt-id"].as_str().unwrap());

    db.destroy();
}

#[tokio::test]
async fn test_subscribe_snapshot_delta_remove() {
    let (db, mut server) = setup("scenario1-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let mut sub = db
        .collection("msg")
        .order("$modified", Direction::Desc)
        .subscribe()
        .await
        .unwrap();

    let payload = conn.expect("sub").await;
    assert_eq!(payload["col-id"], "msg");
    assert_eq!(payload["order"], json!([ { "$modified": "desc" } ]));
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());

    // Snapshot: a then b.
    conn.send(json!({ "val": {
        "evt-id": "sv1", "sub-id": sub_id, "col-id": "msg",
        "docs": [
            server_doc("a", "e-a", "2", json!({ "t": "hi" })),
            server_doc("b", "e-b", "1", json!({ "t": "yo" })),
        ]
    } }));
    let update = sub.next().await.unwrap().unwrap();
    assert_eq!(doc_ids(&update.documents), ["a", "b"]);
    assert_eq!(doc_ids(&update.inserted), ["a", "b"]);
    assert!(update.updated.is_empty() && update.removed.is_empty());
    assert_eq!(conn.expect_client_ack().await, "sv1");

    // Delta: c sorts to the front.
    conn.send(json!({ "upd": {
        "evt-id": "sv2", "sub-id": sub_id, "col-id": "msg",
        "doc": server_doc("c", "e-c", "3", json!({ "t": "hey" })),
    } }));
    let update = sub.next().await.unwrap().unwrap();
    assert_eq!(doc_ids(&update.documents), ["c", "a", "b"]);
    assert_eq!(doc_ids(&update.inserted), ["c"]);
    assert_eq!(conn.expect_client_ack().await, "sv2");

    // Removal of a.
    conn.send(json!({ "rm": {
        "evt-id": "sv3", "sub-id": sub_id, "col-id": "msg",
        "doc": { "id": "a" },
    } }));
    let update = sub.next().await.unwrap().unwrap();
    assert_eq!(doc_ids(&update.documents), ["c", "b"]);
    assert_eq!(doc_ids(&update.removed), ["a"]);
    assert_eq!(conn.expect_client_ack().await, "sv3");

    db.destroy();
}

#[tokio::test]
async fn test_duplicate_subscriptions_share_one_registration() {
    let (db, mut server) = setup("dedup-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let query = db.collection("msg").order("$created", Direction::Asc);
    let mut first = query.clone().subscribe().await.unwrap();

    let payload = conn.expect("sub").await;
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());
    conn.send(json!({ "val": {
        "evt-id": "sv1", "sub-id": sub_id, "col-id": "msg",
        "docs": [ server_doc("a", "e-a", "1", json!({})) ],
    } }));
    first.next().await.unwrap().unwrap();
    conn.expect_client_ack().await;

    // Second, equivalent subscription: no wire traffic, immediate replay.
    let mut second = query.clone().subscribe().await.unwrap();
    let replay = second.next().await.unwrap().unwrap();
    assert_eq!(doc_ids(&replay.documents), ["a"]);

    // The very next frame on the wire is the fetch below, not another sub.
    let fetch_task = tokio::spawn({
        let col = db.collection("other");
        async move { col.fetch().await }
    });
    let payload = conn.expect("ftc").await;
    assert_eq!(payload["col-id"], "other");
    conn.send(json!({ "res": {
        "ftc-id": payload["ftc-id"], "col-id": "other", "docs": [],
    } }));
    fetch_task.await.unwrap().unwrap();

    db.destroy();
}

#[tokio::test]
async fn test_reconnect_replays_session_state() {
    let (db, mut server) = setup("reconnect-host:1", |o| o.with_auth("secret-token"));

    let mut conn = server.accept().await;
    let (first_conn_id, tag) = conn.handshake().await;
    assert_eq!(tag, "con");
    let payload = conn.expect("auth").await;
    assert_eq!(payload["token"], "secret-token");
    conn.ack(payload["evt-id"].as_str().unwrap());

    let mut sub = db
        .collection("msg")
        .order("$modified", Direction::Desc)
        .subscribe()
        .await
        .unwrap();
    let payload = conn.expect("sub").await;
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());

    // Two mutations go out but are never acknowledged. The second is issued
    // only after the first hit the wire, pinning their relative order.
    let doc_one = db.collection("msg").document("m1");
    let write_one = tokio::spawn(async move { doc_one.mutate(json!({ "n": 1 })).await });
    let first_mut = conn.expect("mut").await;
    assert_eq!(first_mut["doc"]["id"], "m1");

    let doc_two = db.collection("msg").document("m2");
    let write_two = tokio::spawn(async move { doc_two.mutate(json!({ "n": 2 })).await });
    let second_mut = conn.expect("mut").await;
    assert_eq!(second_mut["doc"]["id"], "m2");

    // The server kills the logical session.
    conn.error("whatever", "connection-terminated");

    // Fresh connection: connect (new id), auth, resubscribe, then the two
    // unacknowledged mutations, in that order.
    let mut conn = server.accept().await;
    let (second_conn_id, tag) = conn.handshake().await;
    assert_eq!(tag, "con", "a terminated session must not reconnect with rec");
    assert_ne!(second_conn_id, first_conn_id);

    let payload = conn.expect("auth").await;
    assert_eq!(payload["token"], "secret-token");
    conn.ack(payload["evt-id"].as_str().unwrap());

    let payload = conn.expect("sub").await;
    assert_eq!(payload["sub-id"].as_str().unwrap(), sub_id);
    conn.ack(payload["evt-id"].as_str().unwrap());

    let replay_one = conn.expect("mut").await;
    assert_eq!(replay_one["doc"]["id"], "m1");
    conn.ack(replay_one["evt-id"].as_str().unwrap());
    let replay_two = conn.expect("mut").await;
    assert_eq!(replay_two["doc"]["id"], "m2");
    conn.ack(replay_two["evt-id"].as_str().unwrap());

    assert!(write_one.await.unwrap().is_ok());
    assert!(write_two.await.unwrap().is_ok());

    // The subscription survives across the reconnect.
    conn.send(json!({ "val": {
        "evt-id": "sv1", "sub-id": sub_id, "col-id": "msg",
        "docs": [ server_doc("a", "e-a", "1", json!({})) ],
    } }));
    let update = sub.next().await.unwrap().unwrap();
    assert_eq!(doc_ids(&update.documents), ["a"]);

    db.destroy();
}

#[tokio::test]
async fn test_plain_disconnect_reconnects_with_rec() {
    let (db, mut server) = setup("rec-host:1", |o| o);

    let mut conn = server.accept().await;
    let (conn_id, tag) = conn.handshake().await;
    assert_eq!(tag, "con");

    conn.close();

    // After the settle delay the client redials and resumes the session.
    let mut conn = server.accept().await;
    let (resumed_id, tag) = conn.handshake().await;
    assert_eq!(tag, "rec");
    assert_eq!(resumed_id, conn_id);

    db.destroy();
}

#[tokio::test]
async fn test_fetch_round_trip_and_error() {
    let (db, mut server) = setup("fetch-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let fetch = tokio::spawn({
        let col = db.collection("msg");
        async move { col.fetch().await }
    });
    let payload = conn.expect("ftc").await;
    conn.send(json!({ "res": {
        "ftc-id": payload["ftc-id"], "col-id": "msg",
        "docs": [ server_doc("a", "e-a", "1", json!({ "t": "hi" })) ],
    } }));
    let documents = fetch.await.unwrap().unwrap();
    assert_eq!(doc_ids(&documents), ["a"]);

    let failing = tokio::spawn({
        let col = db.collection("msg");
        async move { col.fetch().await }
    });
    let payload = conn.expect("ftc").await;
    conn.error(payload["evt-id"].as_str().unwrap(), "invalid-request");
    assert_eq!(failing.await.unwrap().unwrap_err(), Error::InvalidRequest);

    db.destroy();
}

#[tokio::test]
async fn test_subscription_cancel_delivers_permission_denied() {
    let (db, mut server) = setup("cancel-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let col = db.collection("private");
    let mut sub = col.clone().subscribe().await.unwrap();
    let payload = conn.expect("sub").await;
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());

    conn.send(json!({ "ca": { "sub-id": sub_id, "col-id": "private" } }));
    assert_eq!(sub.next().await.unwrap().unwrap_err(), Error::PermissionDenied);
    // The handler is gone; the stream ends.
    assert!(sub.next().await.is_none());

    // Subscribing again registers from scratch.
    let _sub2 = col.subscribe().await.unwrap();
    let payload = conn.expect("sub").await;
    assert_ne!(payload["sub-id"].as_str().unwrap(), sub_id);

    db.destroy();
}

#[tokio::test]
async fn test_unsubscribe_after_last_listener_drops() {
    let (db, mut server) = setup("uns-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let sub = db.collection("msg").subscribe().await.unwrap();
    let payload = conn.expect("sub").await;
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());

    drop(sub);
    let payload = conn.expect("uns").await;
    assert_eq!(payload["sub-id"].as_str().unwrap(), sub_id);
    conn.ack(payload["evt-id"].as_str().unwrap());

    db.destroy();
}

#[tokio::test]
async fn test_request_timeout_fails_the_caller() {
    let (db, mut server) = setup("timeout-host:1", |o| {
        o.with_timeout(Duration::from_millis(100))
    });
    let mut conn = server.accept().await;
    conn.handshake().await;

    let doc = db.collection("msg").document("m1");
    let write = tokio::spawn(async move { doc.mutate(json!({ "n": 1 })).await });
    conn.expect("mut").await;
    // Never acknowledged: the timer resolves it.
    assert_eq!(write.await.unwrap().unwrap_err(), Error::Timeout);

    db.destroy();
}

#[tokio::test]
async fn test_invalid_limit_fails_without_wire_traffic() {
    let (db, mut server) = setup("limit-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let result = db.collection("msg").take(501).fetch().await;
    assert_eq!(result.unwrap_err(), Error::InvalidData(InvalidDataKind::InvalidLimit));

    db.destroy();
}

#[tokio::test]
async fn test_authorize_and_rejection() {
    let (db, mut server) = setup("auth-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let auth = tokio::spawn({
        let db = db.clone();
        async move { db.authorize("good-token").await }
    });
    let payload = conn.expect("auth").await;
    assert_eq!(payload["token"], "good-token");
    conn.ack(payload["evt-id"].as_str().unwrap());
    assert!(auth.await.unwrap().is_ok());

    let auth = tokio::spawn({
        let db = db.clone();
        async move { db.authorize("bad-token").await }
    });
    let payload = conn.expect("auth").await;
    conn.error(payload["evt-id"].as_str().unwrap(), "invalid-auth-token");
    assert_eq!(auth.await.unwrap().unwrap_err(), Error::InvalidAuthToken);

    db.destroy();
}

#[tokio::test]
async fn test_overlapping_authorize_calls_coalesce() {
    let (db, mut server) = setup("coalesce-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let first = tokio::spawn({
        let db = db.clone();
        async move { db.authorize("tok").await }
    });
    let payload = conn.expect("auth").await;
    let event_id = payload["evt-id"].as_str().unwrap().to_string();

    // Same token again while the first request is still unacknowledged.
    let second = tokio::spawn({
        let db = db.clone();
        async move { db.authorize("tok").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One ack resolves both callers.
    conn.ack(&event_id);
    assert!(timeout(WAIT, first).await.unwrap().unwrap().is_ok());
    assert!(timeout(WAIT, second).await.unwrap().unwrap().is_ok());

    // No second auth frame was ever queued: the next frame is the fetch.
    let fetch = tokio::spawn({
        let col = db.collection("msg");
        async move { col.fetch().await }
    });
    let payload = conn.expect("ftc").await;
    conn.send(json!({ "res": { "ftc-id": payload["ftc-id"], "col-id": "msg", "docs": [] } }));
    fetch.await.unwrap().unwrap();

    db.destroy();
}

#[tokio::test]
async fn test_cache_secret_follows_committed_token_only() {
    let cache_root = tempfile::TempDir::new().unwrap();

    // First life: a dataset arrives while an authorize is still in flight.
    let (db, mut server) = setup("auth-secret-host:1", |o| {
        o.with_cache().with_cache_root(cache_root.path().to_path_buf())
    });
    let mut conn = server.accept().await;
    conn.handshake().await;

    let mut sub = db.collection("msg").subscribe().await.unwrap();
    let payload = conn.expect("sub").await;
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());

    // The authorize goes out but is never acknowledged.
    let _auth = tokio::spawn({
        let db = db.clone();
        async move { db.authorize("in-flight-token").await }
    });
    conn.expect("auth").await;

    conn.send(json!({ "val": {
        "evt-id": "sv1", "sub-id": sub_id, "col-id": "msg",
        "docs": [ server_doc("a", "e-a", "1", json!({ "t": "hi" })) ],
    } }));
    sub.next().await.unwrap().unwrap();

    // Let the asynchronous cache write land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(sub);
    db.destroy();

    // Second life, still unauthorized: the dataset must be readable, which
    // means it was stored under the committed (absent) secret rather than
    // the never-acknowledged token.
    let (db, mut server) = setup("auth-secret-host:1", |o| {
        o.with_cache().with_cache_root(cache_root.path().to_path_buf())
    });
    let mut conn = server.accept().await;
    conn.handshake().await;

    let mut sub = db.collection("msg").subscribe().await.unwrap();
    conn.expect("sub").await;

    let update = timeout(WAIT, sub.next())
        .await
        .expect("cached dataset was not delivered")
        .unwrap()
        .unwrap();
    assert_eq!(doc_ids(&update.documents), ["a"]);

    db.destroy();
}

#[tokio::test]
async fn test_optimistic_execution_retries_on_write_conflict() {
    let (db, mut server) = setup("execute-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let doc = db.collection("counters").document("c1");
    let execution = tokio::spawn(async move {
        doc.execute(|current| {
            let n = current
                .and_then(|v| v.get("n"))
                .and_then(|n| n.as_i64())
                .unwrap_or(0);
            ExecutionResult::Write(json!({ "n": n + 1 }))
        })
        .await
    });

    // Round one: fetch sees n=1 at etag e1; the conditional write conflicts.
    let payload = conn.expect("ftc").await;
    assert_eq!(payload["filter"], json!({ "$id": "c1" }));
    conn.send(json!({ "res": {
        "ftc-id": payload["ftc-id"], "col-id": "counters",
        "docs": [ server_doc("c1", "e1", "1", json!({ "n": 1 })) ],
    } }));
    let payload = conn.expect("mut").await;
    assert_eq!(payload["doc"]["etag"], "e1");
    assert_eq!(payload["doc"]["body"], json!({ "n": 2 }));
    conn.error(payload["evt-id"].as_str().unwrap(), "write-conflict");

    // Round two: a fresh fetch sees n=5 at etag e2; the write lands.
    let payload = conn.expect("ftc").await;
    conn.send(json!({ "res": {
        "ftc-id": payload["ftc-id"], "col-id": "counters",
        "docs": [ server_doc("c1", "e2", "2", json!({ "n": 5 })) ],
    } }));
    let payload = conn.expect("mut").await;
    assert_eq!(payload["doc"]["etag"], "e2");
    assert_eq!(payload["doc"]["body"], json!({ "n": 6 }));
    conn.ack(payload["evt-id"].as_str().unwrap());

    assert!(execution.await.unwrap().is_ok());

    db.destroy();
}

#[tokio::test]
async fn test_aborted_execution_surfaces_the_error() {
    let (db, mut server) = setup("abort-host:1", |o| o);
    let mut conn = server.accept().await;
    conn.handshake().await;

    let doc = db.collection("counters").document("c1");
    let execution = tokio::spawn(async move {
        doc.execute(|_| ExecutionResult::Abort).await
    });

    let payload = conn.expect("ftc").await;
    conn.send(json!({ "res": { "ftc-id": payload["ftc-id"], "col-id": "counters", "docs": [] } }));

    assert_eq!(
        execution.await.unwrap().unwrap_err(),
        Error::ExecutionFailed(ExecutionErrorKind::Aborted)
    );

    db.destroy();
}

#[tokio::test]
async fn test_cached_dataset_serves_offline_reads() {
    let cache_root = tempfile::TempDir::new().unwrap();

    // First life: receive a snapshot so the cache fills.
    let (db, mut server) = setup("cache-host:1", |o| {
        o.with_cache().with_cache_root(cache_root.path().to_path_buf())
    });
    let mut conn = server.accept().await;
    conn.handshake().await;

    let mut sub = db.collection("msg").subscribe().await.unwrap();
    let payload = conn.expect("sub").await;
    let sub_id = payload["sub-id"].as_str().unwrap().to_string();
    conn.ack(payload["evt-id"].as_str().unwrap());
    conn.send(json!({ "val": {
        "evt-id": "sv1", "sub-id": sub_id, "col-id": "msg",
        "docs": [ server_doc("a", "e-a", "1", json!({ "t": "hi" })) ],
    } }));
    sub.next().await.unwrap().unwrap();

    // The cache write is asynchronous; let it land before tearing down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(sub);
    db.destroy();

    // Second life: the server never answers the subscription, yet the
    // last-known dataset is delivered from disk.
    let (db, mut server) = setup("cache-host:1", |o| {
        o.with_cache().with_cache_root(cache_root.path().to_path_buf())
    });
    let mut conn = server.accept().await;
    conn.handshake().await;

    let mut sub = db.collection("msg").subscribe().await.unwrap();
    conn.expect("sub").await;

    let update = sub.next().await.unwrap().unwrap();
    assert_eq!(doc_ids(&update.documents), ["a"]);
    assert_eq!(doc_ids(&update.inserted), ["a"]);

    db.destroy();
}

fn doc_ids(documents: &[larkdb::Document]) -> Vec<&str> {
    documents.iter().map(|d| d.id.as_str()).collect()
}
