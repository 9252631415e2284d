//! The workspace-edit engine: documentChanges, the changes map, file
//! operations, and the server-initiated applyEdit path.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{client, new_log, recording_adapter, CallLog};
use futures_util::FutureExt;
use parking_lot::Mutex;
use poly_client::{lsp, AdapterContext, EditFailure, PolyClient};
use serde_json::json;

fn range(start: (u32, u32), end: (u32, u32)) -> lsp::Range {
    lsp::Range::new(
        lsp::Position::new(start.0, start.1),
        lsp::Position::new(end.0, end.1),
    )
}

fn document_edit(uri: &str, version: i32, edits: Vec<lsp::TextEdit>) -> lsp::TextDocumentEdit {
    lsp::TextDocumentEdit {
        text_document: lsp::OptionalVersionedTextDocumentIdentifier {
            uri: lsp::Url::parse(uri).unwrap(),
            version: Some(version),
        },
        edits: edits.into_iter().map(lsp::OneOf::Left).collect(),
    }
}

/// A client with one registered adapter whose context has been captured,
/// for driving server-initiated requests.
async fn client_with_context(language_id: &str, log: &CallLog) -> (PolyClient, AdapterContext) {
    let client = client();
    let slot: Arc<Mutex<Option<AdapterContext>>> = Arc::new(Mutex::new(None));
    let spec = recording_adapter(language_id, log).with_initialize({
        let slot = slot.clone();
        move |context| {
            slot.lock().replace(context);
            async { Ok(()) }.boxed()
        }
    });
    client.register_language(spec).await.unwrap();
    let context = slot.lock().take().unwrap();
    (client, context)
}

#[tokio::test]
async fn document_changes_pathway_updates_store_and_adapter() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("typescript", &log))
        .await
        .unwrap();
    client
        .open_document("file:///d.ts", "typescript", "l0\nl1\nl2\n0123456789ab\n", 1)
        .unwrap();

    let edit = lsp::WorkspaceEdit {
        document_changes: Some(lsp::DocumentChanges::Edits(vec![document_edit(
            "file:///d.ts",
            1,
            vec![lsp::TextEdit::new(range((3, 10), (3, 11)), "b".to_string())],
        )])),
        ..Default::default()
    };

    let outcome = client.apply_workspace_edit(&edit).unwrap();
    assert!(outcome.applied);
    assert!(outcome.failures.is_empty());

    let document = client.get_document("file:///d.ts").unwrap().unwrap();
    assert_eq!(document.text, "l0\nl1\nl2\n0123456789bb\n");
    assert_eq!(document.version, 2);

    let entries = log.lock().clone();
    let update = entries
        .iter()
        .find(|entry| entry.starts_with("update"))
        .expect("adapter must observe the edit");
    assert!(update.contains("0123456789bb"), "{update}");
}

#[tokio::test]
async fn missing_target_is_reported_not_thrown() {
    let client = client();
    client
        .register_language(recording_adapter("typescript", &new_log()))
        .await
        .unwrap();

    let edit = lsp::WorkspaceEdit {
        document_changes: Some(lsp::DocumentChanges::Edits(vec![document_edit(
            "file:///missing.ts",
            1,
            vec![lsp::TextEdit::new(range((0, 0), (0, 0)), "x".to_string())],
        )])),
        ..Default::default()
    };

    let outcome = client.apply_workspace_edit(&edit).unwrap();
    assert!(!outcome.applied);
    assert_eq!(
        outcome.failures,
        vec![EditFailure {
            uri: "file:///missing.ts".to_string(),
            reason: "Document not open".to_string(),
        }]
    );
    assert_eq!(outcome.failure_reason.as_deref(), Some("Document not open"));
    assert_eq!(outcome.failed_change, Some(0));
}

#[tokio::test]
async fn changes_map_round_trip_bumps_version_once() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("typescript", &log))
        .await
        .unwrap();
    client
        .open_document(
            "file:///r.ts",
            "typescript",
            "const value = 1;\nconsole.log(value);\n",
            1,
        )
        .unwrap();

    // The edit package a rename of `value` to `count` would produce.
    let mut changes = HashMap::new();
    changes.insert(
        lsp::Url::parse("file:///r.ts").unwrap(),
        vec![
            lsp::TextEdit::new(range((0, 6), (0, 11)), "count".to_string()),
            lsp::TextEdit::new(range((1, 12), (1, 17)), "count".to_string()),
        ],
    );
    let edit = lsp::WorkspaceEdit {
        changes: Some(changes),
        ..Default::default()
    };

    let outcome = client.apply_workspace_edit(&edit).unwrap();
    assert!(outcome.applied);

    let document = client.get_document("file:///r.ts").unwrap().unwrap();
    assert_eq!(document.text, "const count = 1;\nconsole.log(count);\n");
    assert_eq!(document.version, 2);
}

#[tokio::test]
async fn rename_operation_moves_the_document() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("typescript", &log))
        .await
        .unwrap();
    client
        .open_document("file:///old.ts", "typescript", "export {};", 3)
        .unwrap();

    let edit = lsp::WorkspaceEdit {
        document_changes: Some(lsp::DocumentChanges::Operations(vec![
            lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Rename(lsp::RenameFile {
                old_uri: lsp::Url::parse("file:///old.ts").unwrap(),
                new_uri: lsp::Url::parse("file:///new.ts").unwrap(),
                options: None,
                annotation_id: None,
            })),
        ])),
        ..Default::default()
    };

    let outcome = client.apply_workspace_edit(&edit).unwrap();
    assert!(outcome.applied);

    assert!(client.get_document("file:///old.ts").unwrap().is_none());
    let moved = client.get_document("file:///new.ts").unwrap().unwrap();
    assert_eq!(moved.text, "export {};");
    assert_eq!(moved.version, 3);

    let entries = log.lock().clone();
    assert!(entries.contains(&"close file:///old.ts".to_string()), "{entries:?}");
    assert!(entries.iter().any(|entry| entry.starts_with("open file:///new.ts")), "{entries:?}");
}

#[tokio::test]
async fn create_and_delete_are_unsupported_but_do_not_abort() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("typescript", &log))
        .await
        .unwrap();
    client
        .open_document("file:///keep.ts", "typescript", "a", 1)
        .unwrap();

    let edit = lsp::WorkspaceEdit {
        document_changes: Some(lsp::DocumentChanges::Operations(vec![
            lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Create(lsp::CreateFile {
                uri: lsp::Url::parse("file:///fresh.ts").unwrap(),
                options: None,
                annotation_id: None,
            })),
            lsp::DocumentChangeOperation::Edit(document_edit(
                "file:///keep.ts",
                1,
                vec![lsp::TextEdit::new(range((0, 0), (0, 1)), "b".to_string())],
            )),
        ])),
        ..Default::default()
    };

    let outcome = client.apply_workspace_edit(&edit).unwrap();
    assert!(!outcome.applied);
    assert_eq!(outcome.failed_change, Some(0));
    assert_eq!(
        outcome.failure_reason.as_deref(),
        Some("Unsupported file operation")
    );
    // The later edit still went through.
    assert_eq!(client.get_document("file:///keep.ts").unwrap().unwrap().text, "b");
}

/// A server-initiated `workspace/applyEdit` flows through the context's
/// built-in handler, mutates the store, and reports the LSP response shape.
#[tokio::test]
async fn server_initiated_apply_edit() {
    let log = new_log();
    let (client, context) = client_with_context("typescript", &log).await;
    client
        .open_document("file:///a.ts", "typescript", "let value = 1;", 1)
        .unwrap();

    let response = context
        .handle_server_request(
            "workspace/applyEdit",
            json!({
                "edit": {
                    "changes": {
                        "file:///a.ts": [{
                            "range": {
                                "start": { "line": 0, "character": 11 },
                                "end": { "line": 0, "character": 12 },
                            },
                            "newText": "2",
                        }],
                    },
                },
            }),
        )
        .unwrap();

    assert_eq!(response["applied"], json!(true));
    assert!(response.get("failureReason").map_or(true, |reason| reason.is_null()));

    let document = client.get_document("file:///a.ts").unwrap().unwrap();
    assert_eq!(document.text, "let value = 2;");
    assert_eq!(document.version, 2);
}

#[tokio::test]
async fn built_in_server_requests() {
    let log = new_log();
    let (_client, context) = client_with_context("typescript", &log).await;

    let config = context
        .handle_server_request(
            "workspace/configuration",
            json!({ "items": [{ "section": "a" }, { "section": "b" }] }),
        )
        .unwrap();
    assert_eq!(config, json!([{}, {}]));

    let action = context
        .handle_server_request(
            "window/showMessageRequest",
            json!({ "type": 1, "message": "pick", "actions": [{ "title": "first" }, { "title": "second" }] }),
        )
        .unwrap();
    assert_eq!(action, json!({ "title": "first" }));

    let none = context
        .handle_server_request("client/registerCapability", json!({ "registrations": [] }))
        .unwrap();
    assert_eq!(none, json!(null));

    // Capability registrations are not swallowed: a subscriber observes the
    // call, and null acknowledges it when nobody answers.
    let seen = Arc::new(AtomicBool::new(false));
    let _cap_sub = _client
        .on_notification("client/registerCapability", {
            let seen = seen.clone();
            move |_payload, _language| {
                seen.store(true, Ordering::SeqCst);
                Ok(None)
            }
        })
        .unwrap();
    let acked = context
        .handle_server_request("client/registerCapability", json!({ "registrations": [] }))
        .unwrap();
    assert_eq!(acked, json!(null));
    assert!(seen.load(Ordering::SeqCst));

    // No folders were configured, so the server gets an empty list.
    let folders = context
        .handle_server_request("workspace/workspaceFolders", json!(null))
        .unwrap();
    assert_eq!(folders, json!([]));

    // Unknown methods are offered to notification subscribers.
    let sub = _client
        .on_notification("custom/answer", |_payload, _language| {
            Ok(Some(json!("answered")))
        })
        .unwrap();
    let answered = context
        .handle_server_request("custom/answer", json!({}))
        .unwrap();
    assert_eq!(answered, json!("answered"));
    sub.cancel();

    let unanswered = context
        .handle_server_request("custom/answer", json!({}))
        .unwrap();
    assert_eq!(unanswered, json!(null));
}
