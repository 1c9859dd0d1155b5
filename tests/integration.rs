//! End-to-end tests over a mocked HTTP server: real executor, real wire
//! bodies, no real CouchDB.

use davenport::{BulkDocResult, ClientConfig, Error, RevisionId, Server};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 5_000,
        feed_backoff_ms: 50,
        feed_max_backoff_ms: 200,
        ..Default::default()
    }
}

fn client(mock: &mockito::ServerGuard) -> Arc<Server> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
    Server::with_config(&mock.url(), test_config()).expect("server handle")
}

#[tokio::test]
async fn version_and_uuids() {
    let mut mock = mockito::Server::new_async().await;
    mock.mock("GET", "/")
        .with_status(200)
        .with_body(r#"{"couchdb":"Welcome","version":"1.1.0"}"#)
        .create_async()
        .await;
    mock.mock("GET", "/_uuids")
        .match_query(mockito::Matcher::UrlEncoded("count".into(), "0".into()))
        .with_status(200)
        .with_body(r#"{"uuids":[]}"#)
        .create_async()
        .await;

    let server = client(&mock);
    assert_eq!(server.version().await.unwrap(), "1.1.0");
    // Zero UUIDs is an empty ordered sequence, not an error.
    assert_eq!(server.generate_uuids(0).await.unwrap(), Vec::<String>::new());
}

#[tokio::test]
async fn create_database_conflict_surfaces_412() {
    let mut mock = mockito::Server::new_async().await;
    mock.mock("PUT", "/mail/")
        .with_status(412)
        .with_body(r#"{"error":"file_exists","reason":"exists"}"#)
        .create_async()
        .await;

    let db = client(&mock).database("mail").unwrap();
    let err = db.create().wait().await.unwrap_err();
    assert!(matches!(err, Error::Status { code: 412, .. }));
}

#[tokio::test]
async fn save_then_stale_save_conflicts() {
    let mut mock = mockito::Server::new_async().await;
    let first = mock
        .mock("PUT", "/mail/welcome")
        .with_status(201)
        .with_body(r#"{"ok":true,"id":"welcome","rev":"1-aaa"}"#)
        .expect(1)
        .create_async()
        .await;

    let db = client(&mock).database("mail").unwrap();
    let doc = db.document("welcome").unwrap();

    let op = doc.save(json!({"subject": "hi"})).await;
    let outcome = op.wait().await.unwrap();
    // Waiting again replays the identical outcome without a second request.
    let replay = op.wait().await.unwrap();
    assert_eq!(outcome.status, replay.status);
    assert_eq!(outcome.body, replay.body);
    first.assert_async().await;

    assert_eq!(doc.current_revision(), Some(RevisionId::new("1-aaa")));

    mock.mock("PUT", "/mail/welcome")
        .with_status(409)
        .with_body(r#"{"error":"conflict","reason":"Document update conflict."}"#)
        .create_async()
        .await;
    let err = doc
        .save(json!({"_rev": "0-stale", "subject": "再"}))
        .await
        .wait()
        .await
        .unwrap_err();
    assert_eq!(err, Error::RevisionConflict);
    // The failed write never advanced the tracked revision.
    assert_eq!(doc.current_revision(), Some(RevisionId::new("1-aaa")));
}

#[tokio::test]
async fn bulk_write_mixes_create_update_and_conflict() {
    let mut mock = mockito::Server::new_async().await;
    mock.mock("POST", "/mail/_bulk_docs")
        .match_body(mockito::Matcher::PartialJson(json!({
            "docs": [
                {"_id": "a", "x": 1},
                {"_id": "b", "_rev": "1-abc", "x": 2}
            ]
        })))
        .with_status(201)
        .with_body(
            r#"[{"ok":true,"id":"a","rev":"1-new"},{"id":"b","error":"conflict","reason":"stale"}]"#,
        )
        .create_async()
        .await;

    let db = client(&mock).database("mail").unwrap();
    let results: Vec<BulkDocResult> = db
        .put_changes(vec![
            json!({"_id": "a", "x": 1}),
            json!({"_id": "b", "_rev": "1-abc", "x": 2}),
        ])
        .result()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, "a");
    assert_eq!(results[0].rev, Some(RevisionId::new("1-new")));
    assert_eq!(results[1].id, "b");
    assert!(results[1].is_conflict());

    // Independent outcomes: "a" advanced even though "b" conflicted.
    assert_eq!(
        db.document("a").unwrap().current_revision(),
        Some(RevisionId::new("1-new"))
    );
    assert_eq!(db.document("b").unwrap().current_revision(), None);
}

#[tokio::test]
async fn last_sequence_number_is_lazily_fetched() {
    let mut mock = mockito::Server::new_async().await;
    mock.mock("GET", "/mail/")
        .with_status(200)
        .with_body(r#"{"db_name":"mail","doc_count":3,"update_seq":42}"#)
        .create_async()
        .await;

    let db = client(&mock).database("mail").unwrap();
    assert_eq!(db.last_sequence_number().await.unwrap(), 42);
    assert_eq!(db.document_count().await.unwrap(), 3);
}

#[tokio::test]
async fn change_tracking_delivers_only_new_changes_in_order() {
    let mut mock = mockito::Server::new_async().await;
    mock.mock("GET", "/mail/")
        .with_status(200)
        .with_body(r#"{"db_name":"mail","update_seq":42}"#)
        .create_async()
        .await;
    // The feed opens at the learned sequence; the server only sends newer
    // records (43, 44) and then ends the connection.
    mock.mock("GET", "/mail/_changes")
        .match_query(mockito::Matcher::Regex("since=42".into()))
        .with_status(200)
        .with_chunked_body(|w| {
            w.write_all(b"{\"seq\":43,\"id\":\"doc-a\",\"changes\":[{\"rev\":\"2-aa\"}]}\n")?;
            w.write_all(b"\n")?; // heartbeat
            w.write_all(b"{\"seq\":44,\"id\":\"doc-b\",\"changes\":[{\"rev\":\"1-bb\"}],\"deleted\":true}\n")
        })
        .create_async()
        .await;
    // After processing 44 the client reconnects from there; an empty feed
    // keeps it quietly streaming.
    mock.mock("GET", "/mail/_changes")
        .match_query(mockito::Matcher::Regex("since=44".into()))
        .with_status(200)
        .with_chunked_body(|w| w.write_all(b"\n"))
        .create_async()
        .await;

    let db = client(&mock).database("mail").unwrap();
    let mut changes = db.subscribe();
    db.enable_change_tracking().await.unwrap();
    assert!(db.tracks_changes());

    let first = timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no change before timeout")
        .unwrap();
    assert_eq!(first.seq, 43);
    assert_eq!(first.id, "doc-a");
    assert_eq!(first.rev, RevisionId::new("2-aa"));

    let second = timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no second change")
        .unwrap();
    assert_eq!(second.seq, 44);
    assert!(second.deleted);

    assert!(db.last_sequence_number().await.unwrap() >= 44);
    db.disable_change_tracking();
    assert!(!db.tracks_changes());
}

#[tokio::test]
async fn redelivered_records_are_suppressed_after_reconnect() {
    let mut mock = mockito::Server::new_async().await;
    // Every connection replays the same record: an at-least-once feed.
    mock.mock("GET", "/mail/_changes")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_chunked_body(|w| {
            w.write_all(b"{\"seq\":10,\"id\":\"doc-a\",\"changes\":[{\"rev\":\"3-cc\"}]}\n")
        })
        .create_async()
        .await;

    let db = client(&mock).database("mail").unwrap();
    db.set_last_sequence_number(9);
    let mut changes = db.subscribe();
    db.enable_change_tracking().await.unwrap();

    let first = timeout(Duration::from_secs(5), changes.recv())
        .await
        .expect("no change before timeout")
        .unwrap();
    assert_eq!(first.seq, 10);

    // The feed ends and reconnects, redelivering seq 10; the revision check
    // suppresses it. Nothing further should arrive.
    let nothing = timeout(Duration::from_millis(500), changes.recv()).await;
    assert!(nothing.is_err(), "duplicate notification for redelivery");

    db.disable_change_tracking();
}
