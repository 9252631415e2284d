//! Resolving host calls to adapters: language hints, URIs, the
//! sole-adapter fallback, and the readiness gate.

mod common;

use std::sync::Arc;

use common::{client, new_log, recording_adapter};
use futures_util::FutureExt;
use poly_client::{AdapterState, Error};
use serde_json::json;

#[tokio::test]
async fn ambiguous_raw_request_is_rejected() {
    let client = client();
    let one = new_log();
    let two = new_log();
    client
        .register_language(recording_adapter("one", &one))
        .await
        .unwrap();
    client
        .register_language(recording_adapter("two", &two))
        .await
        .unwrap();

    let result = client.send_request("ping", json!({})).await;
    assert!(matches!(result, Err(Error::LanguageNotResolved)));

    // Neither adapter was touched.
    assert!(one.lock().is_empty());
    assert!(two.lock().is_empty());
}

#[tokio::test]
async fn sole_adapter_handles_unhinted_calls() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("only", &log))
        .await
        .unwrap();

    let echoed = client.send_request("ping", json!({ "n": 1 })).await.unwrap();
    assert_eq!(echoed, json!({ "method": "ping", "params": { "n": 1 } }));
    assert_eq!(log.lock().as_slice(), ["request ping"]);
}

#[tokio::test]
async fn language_id_hint_wins_over_uri() {
    let client = client();
    let one = new_log();
    let two = new_log();
    client
        .register_language(recording_adapter("one", &one))
        .await
        .unwrap();
    client
        .register_language(recording_adapter("two", &two))
        .await
        .unwrap();

    client
        .open_document("file:///a.one", "one", "text", 1)
        .unwrap();

    // languageId is probed before the URI paths.
    client
        .hover(json!({
            "languageId": "two",
            "textDocument": { "uri": "file:///a.one" },
        }))
        .await
        .unwrap();

    assert!(two.lock().contains(&"hover".to_string()));
    assert!(!one.lock().contains(&"hover".to_string()));
}

#[tokio::test]
async fn uri_routes_to_owning_adapter() {
    let client = client();
    let one = new_log();
    let two = new_log();
    client
        .register_language(recording_adapter("one", &one))
        .await
        .unwrap();
    client
        .register_language(recording_adapter("two", &two))
        .await
        .unwrap();

    client
        .open_document("file:///b.two", "two", "text", 1)
        .unwrap();

    client
        .hover(json!({ "textDocument": { "uri": "file:///b.two" } }))
        .await
        .unwrap();

    assert!(two.lock().contains(&"hover".to_string()));
}

#[tokio::test]
async fn unknown_language_and_unopened_uri() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("one", &log))
        .await
        .unwrap();
    client
        .register_language(recording_adapter("two", &new_log()))
        .await
        .unwrap();

    assert!(matches!(
        client.hover(json!({ "languageId": "cobol" })).await,
        Err(Error::UnknownLanguage(_))
    ));
    assert!(matches!(
        client
            .hover(json!({ "textDocument": { "uri": "file:///ghost.one" } }))
            .await,
        Err(Error::DocumentNotOpen(_))
    ));
}

#[tokio::test]
async fn missing_handler_is_feature_unsupported() {
    let client = client();
    let log = new_log();
    client
        .register_language(recording_adapter("one", &log))
        .await
        .unwrap();

    let result = client.completions(json!({ "languageId": "one" })).await;
    assert!(matches!(
        result,
        Err(Error::FeatureUnsupported { operation: "getCompletions", .. })
    ));
}

#[tokio::test]
async fn initializing_adapter_gates_routed_requests() {
    let client = Arc::new(client());
    let log = new_log();
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

    let spec = recording_adapter("slow", &log).with_initialize(move |_context| {
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
    while !client
        .languages()
        .iter()
        .any(|language| language.state == AdapterState::Initializing)
    {
        tokio::task::yield_now().await;
    }

    let result = client.hover(json!({ "languageId": "slow" })).await;
    assert!(matches!(result, Err(Error::LanguageNotReady(_))));

    gate_tx.send(()).unwrap();
    registration.await.unwrap().unwrap();
    client.hover(json!({ "languageId": "slow" })).await.unwrap();
}

#[tokio::test]
async fn raw_notification_requires_handler_and_never_blocks() {
    let client = client();
    let log = new_log();
    // The recording adapter has no sendNotification handler.
    client
        .register_language(recording_adapter("one", &log))
        .await
        .unwrap();

    let result = client.send_notification("custom/ping", json!({}));
    assert!(matches!(
        result,
        Err(Error::FeatureUnsupported { operation: "sendNotification", .. })
    ));
}
