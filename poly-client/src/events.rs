//! Typed fan-out for diagnostics, workspace events, server notifications,
//! and adapter errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use lsp_types as lsp;
use lsp_types::Url;
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct DiagnosticsEvent {
    pub uri: Url,
    pub language_id: String,
    pub diagnostics: Vec<lsp::Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct WorkspaceEvent {
    pub kind: String,
    pub language_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct AdapterErrorEvent {
    pub language_id: String,
    pub operation: String,
    pub error: Arc<anyhow::Error>,
}

pub type DiagnosticsListener = dyn Fn(&DiagnosticsEvent) -> anyhow::Result<()> + Send + Sync;
pub type WorkspaceListener = dyn Fn(&WorkspaceEvent) -> anyhow::Result<()> + Send + Sync;
/// Receives `(payload, language_id)`. May return a value, which is used to
/// answer an unknown server-initiated request.
pub type NotificationListener = dyn Fn(&Value, &str) -> anyhow::Result<Option<Value>> + Send + Sync;
pub type ErrorListener = dyn Fn(&AdapterErrorEvent) -> anyhow::Result<()> + Send + Sync;

/// A handle to one registered listener. Cancellation is idempotent and
/// remains safe after the client (and its tables) are gone.
pub struct Subscription {
    cancel: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Mutex::new(Some(Box::new(cancel))),
        }
    }

    pub fn cancel(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.lock().is_some())
            .finish()
    }
}

struct ListenerTable<L: ?Sized> {
    entries: Mutex<HashMap<String, Vec<(u64, Arc<L>)>>>,
}

impl<L: ?Sized> Default for ListenerTable<L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<L: ?Sized> ListenerTable<L> {
    fn insert(&self, key: String, token: u64, listener: Arc<L>) {
        self.entries.lock().entry(key).or_default().push((token, listener));
    }

    fn remove(&self, key: &str, token: u64) {
        let mut entries = self.entries.lock();
        if let Some(listeners) = entries.get_mut(key) {
            listeners.retain(|(entry_token, _)| *entry_token != token);
            if listeners.is_empty() {
                entries.remove(key);
            }
        }
    }

    /// Snapshot so listeners run without the table lock held; a listener may
    /// subscribe or cancel without deadlocking.
    fn snapshot(&self, key: &str) -> Vec<Arc<L>> {
        self.entries
            .lock()
            .get(key)
            .map(|listeners| listeners.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default()
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Clone, Default)]
pub(crate) struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_token: AtomicU64,
    diagnostics: ListenerTable<DiagnosticsListener>,
    workspace: ListenerTable<WorkspaceListener>,
    notifications: ListenerTable<NotificationListener>,
    errors: ListenerTable<ErrorListener>,
}

/// Key for the single adapter-error listener set, which is not per-anything.
const ERROR_KEY: &str = "";

impl EventBus {
    fn next_token(&self) -> u64 {
        self.inner.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn subscription<L: ?Sized + Send + Sync + 'static>(
        &self,
        table: impl Fn(&BusInner) -> &ListenerTable<L> + Send + 'static,
        key: String,
        token: u64,
    ) -> Subscription {
        let bus = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(bus) = Weak::upgrade(&bus) {
                table(&bus).remove(&key, token);
            }
        })
    }

    pub fn on_diagnostics(
        &self,
        uri: Url,
        listener: impl Fn(&DiagnosticsEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token();
        let key = uri.to_string();
        self.inner
            .diagnostics
            .insert(key.clone(), token, Arc::new(listener));
        self.subscription(|bus| &bus.diagnostics, key, token)
    }

    pub fn on_workspace_event(
        &self,
        kind: String,
        listener: impl Fn(&WorkspaceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token();
        self.inner
            .workspace
            .insert(kind.clone(), token, Arc::new(listener));
        self.subscription(|bus| &bus.workspace, kind, token)
    }

    pub fn on_notification(
        &self,
        method: String,
        listener: impl Fn(&Value, &str) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token();
        self.inner
            .notifications
            .insert(method.clone(), token, Arc::new(listener));
        self.subscription(|bus| &bus.notifications, method, token)
    }

    pub fn on_error(
        &self,
        listener: impl Fn(&AdapterErrorEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Subscription {
        let token = self.next_token();
        self.inner
            .errors
            .insert(ERROR_KEY.to_string(), token, Arc::new(listener));
        self.subscription(|bus| &bus.errors, ERROR_KEY.to_string(), token)
    }

    pub fn emit_diagnostics(&self, event: DiagnosticsEvent) {
        let key = event.uri.to_string();
        for listener in self.inner.diagnostics.snapshot(&key) {
            if let Err(err) = listener(&event) {
                log::error!("diagnostics listener for {key} failed: {err:#}");
            }
        }
    }

    pub fn emit_workspace_event(&self, event: WorkspaceEvent) {
        for listener in self.inner.workspace.snapshot(&event.kind) {
            if let Err(err) = listener(&event) {
                log::error!("workspace listener for '{}' failed: {err:#}", event.kind);
            }
        }
    }

    /// Fans a server notification out to its method listeners; the first
    /// value any of them returns is handed back (used to answer unknown
    /// server-initiated requests).
    pub fn offer_notification(&self, method: &str, payload: &Value, language_id: &str) -> Option<Value> {
        let mut answer = None;
        for listener in self.inner.notifications.snapshot(method) {
            match listener(payload, language_id) {
                Ok(Some(value)) if answer.is_none() => answer = Some(value),
                Ok(_) => {}
                Err(err) => log::error!("notification listener for '{method}' failed: {err:#}"),
            }
        }
        answer
    }

    pub fn emit_notification(&self, method: &str, payload: &Value, language_id: &str) {
        let _ = self.offer_notification(method, payload, language_id);
    }

    pub fn emit_adapter_error(&self, event: AdapterErrorEvent) {
        log::error!(
            "adapter '{}' failed during '{}': {:#}",
            event.language_id,
            event.operation,
            event.error
        );
        for listener in self.inner.errors.snapshot(ERROR_KEY) {
            if let Err(err) = listener(&event) {
                log::error!("error listener failed: {err:#}");
            }
        }
    }

    /// Drops every listener. Cancelling their subscriptions afterwards is a
    /// no-op.
    pub fn clear(&self) {
        self.inner.diagnostics.clear();
        self.inner.workspace.clear();
        self.inner.notifications.clear();
        self.inner.errors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn event(uri: &Url) -> DiagnosticsEvent {
        DiagnosticsEvent {
            uri: uri.clone(),
            language_id: "rust".to_string(),
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn cancel_is_idempotent_and_isolated() {
        let bus = EventBus::default();
        let uri = Url::parse("file:///a.rs").unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let sub_first = bus.on_diagnostics(uri.clone(), {
            let first = first.clone();
            move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let _sub_second = bus.on_diagnostics(uri.clone(), {
            let second = second.clone();
            move |_| {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit_diagnostics(event(&uri));
        sub_first.cancel();
        sub_first.cancel();
        bus.emit_diagnostics(event(&uri));

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cancel_after_clear_is_safe() {
        let bus = EventBus::default();
        let uri = Url::parse("file:///a.rs").unwrap();
        let sub = bus.on_diagnostics(uri, |_| Ok(()));
        bus.clear();
        sub.cancel();
    }

    #[test]
    fn failing_listener_does_not_stop_fanout() {
        let bus = EventBus::default();
        let uri = Url::parse("file:///a.rs").unwrap();
        let reached = Arc::new(AtomicUsize::new(0));

        let _failing = bus.on_diagnostics(uri.clone(), |_| anyhow::bail!("boom"));
        let _counting = bus.on_diagnostics(uri.clone(), {
            let reached = reached.clone();
            move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit_diagnostics(event(&uri));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_notification_answer_wins() {
        let bus = EventBus::default();
        let _quiet = bus.on_notification("custom/echo".to_string(), |_, _| Ok(None));
        let _first = bus.on_notification("custom/echo".to_string(), |_, _| {
            Ok(Some(Value::from("one")))
        });
        let _second = bus.on_notification("custom/echo".to_string(), |_, _| {
            Ok(Some(Value::from("two")))
        });

        let answer = bus.offer_notification("custom/echo", &Value::Null, "rust");
        assert_eq!(answer, Some(Value::from("one")));
    }

    #[test]
    fn listeners_are_keyed() {
        let bus = EventBus::default();
        let a = Url::parse("file:///a.rs").unwrap();
        let b = Url::parse("file:///b.rs").unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let _sub = bus.on_diagnostics(a.clone(), {
            let count = count.clone();
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        bus.emit_diagnostics(event(&b));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.emit_diagnostics(event(&a));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
