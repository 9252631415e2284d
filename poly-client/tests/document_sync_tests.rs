//! Document lifecycle: versioning, ranged edits, and the deferred delivery
//! queue around adapter initialization.

mod common;

use std::sync::Arc;

use common::{client, new_log, recording_adapter};
use futures_util::FutureExt;
use poly_client::{lsp, AdapterState, Error};

fn ranged_change(
    start: (u32, u32),
    end: (u32, u32),
    text: &str,
) -> lsp::TextDocumentContentChangeEvent {
    lsp::TextDocumentContentChangeEvent {
        range: Some(lsp::Range::new(
            lsp::Position::new(start.0, start.1),
            lsp::Position::new(end.0, end.1),
        )),
        range_length: None,
        text: text.to_string(),
    }
}

fn full_change(text: &str) -> lsp::TextDocumentContentChangeEvent {
    lsp::TextDocumentContentChangeEvent {
        range: None,
        range_length: None,
        text: text.to_string(),
    }
}

#[tokio::test]
async fn update_with_ranged_edits_then_empty_bump() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("typescript", &log))
        .await
        .unwrap();

    client
        .open_document(
            "file:///a.ts",
            "typescript",
            "const value = 1;\nconsole.log(value);\n",
            1,
        )
        .unwrap();

    client
        .update_document(
            "file:///a.ts",
            2,
            vec![
                ranged_change((0, 6), (0, 11), "count"),
                ranged_change((1, 12), (1, 17), "count"),
            ],
        )
        .unwrap();

    let document = client.get_document("file:///a.ts").unwrap().unwrap();
    assert_eq!(document.text, "const count = 1;\nconsole.log(count);\n");
    assert_eq!(document.version, 2);

    // An empty change list is a version-only bump.
    client.update_document("file:///a.ts", 3, vec![]).unwrap();
    let document = client.get_document("file:///a.ts").unwrap().unwrap();
    assert_eq!(document.text, "const count = 1;\nconsole.log(count);\n");
    assert_eq!(document.version, 3);
}

#[tokio::test]
async fn versions_must_strictly_increase() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("typescript", &log))
        .await
        .unwrap();
    client
        .open_document("file:///a.ts", "typescript", "x", 5)
        .unwrap();

    for supplied in [5, 4, 0, -1] {
        let result = client.update_document("file:///a.ts", supplied, vec![full_change("y")]);
        assert!(matches!(result, Err(Error::InvalidVersion { .. })));
    }

    // Failed updates leave both text and version untouched.
    let document = client.get_document("file:///a.ts").unwrap().unwrap();
    assert_eq!(document.text, "x");
    assert_eq!(document.version, 5);

    client
        .update_document("file:///a.ts", 6, vec![full_change("y")])
        .unwrap();
    assert_eq!(client.get_document("file:///a.ts").unwrap().unwrap().version, 6);
}

#[tokio::test]
async fn open_requires_registered_language() {
    let client = client();
    let result = client.open_document("file:///a.rs", "rust", "fn main() {}", 1);
    assert!(matches!(result, Err(Error::UnknownLanguage(_))));
}

#[tokio::test]
async fn update_and_save_require_open_document() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("rust", &log))
        .await
        .unwrap();

    assert!(matches!(
        client.update_document("file:///nope.rs", 2, vec![]),
        Err(Error::DocumentNotOpen(_))
    ));
    assert!(matches!(
        client.save_document("file:///nope.rs"),
        Err(Error::DocumentNotOpen(_))
    ));
    // Closing something that is not open is a no-op.
    client.close_document("file:///nope.rs").unwrap();
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn documents_are_keyed_by_normalized_uri() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("rust", &log))
        .await
        .unwrap();

    client
        .open_document("/home/user/main.rs", "rust", "fn main() {}", 1)
        .unwrap();

    // The bare path and the file URL address the same document.
    let document = client
        .get_document("file:///home/user/main.rs")
        .unwrap()
        .unwrap();
    assert_eq!(document.uri.as_str(), "file:///home/user/main.rs");
}

/// Syncs issued while the adapter initializes are buffered and replayed in
/// host order once it becomes ready.
#[tokio::test]
async fn queued_sync_during_initialization() {
    let client = Arc::new(client());
    let log = new_log();
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

    let spec = recording_adapter("typescript", &log).with_initialize(move |_context| {
        async move {
            gate_rx.await.ok();
            Ok(())
        }
        .boxed()
    });

    let registration = tokio::spawn({
        let client = client.clone();
        async move { client.register_language(spec).await }
    });

    // Wait for the record to reach `initializing` before issuing syncs.
    while !client
        .languages()
        .iter()
        .any(|language| language.state == AdapterState::Initializing)
    {
        tokio::task::yield_now().await;
    }

    client
        .open_document("file:///a.ts", "typescript", "const value = 1;", 1)
        .unwrap();
    client
        .update_document("file:///a.ts", 2, vec![full_change("const value = 1;")])
        .unwrap();
    assert!(log.lock().is_empty(), "syncs must not reach a gated adapter");

    gate_tx.send(()).unwrap();
    registration.await.unwrap().unwrap();

    let entries = log.lock().clone();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].starts_with("open file:///a.ts v1"), "{entries:?}");
    assert!(entries[1].starts_with("update file:///a.ts v2"), "{entries:?}");
}

#[tokio::test]
async fn save_carries_the_current_text() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("rust", &log))
        .await
        .unwrap();
    client
        .open_document("file:///lib.rs", "rust", "pub fn f() {}", 1)
        .unwrap();
    client.save_document("file:///lib.rs").unwrap();

    let entries = log.lock().clone();
    assert_eq!(entries.last().unwrap(), "save file:///lib.rs");
}

#[tokio::test]
async fn reopening_replaces_the_document() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("rust", &log))
        .await
        .unwrap();

    client
        .open_document("file:///a.rs", "rust", "old", 1)
        .unwrap();
    client
        .open_document("file:///a.rs", "rust", "new", 1)
        .unwrap();

    let document = client.get_document("file:///a.rs").unwrap().unwrap();
    assert_eq!(document.text, "new");
}
