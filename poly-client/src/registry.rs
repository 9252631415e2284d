//! Adapter records, their lifecycle state machine, and the deferred
//! document-sync queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::adapter::{
    AdapterSpec, DisposeHandler, DocumentSyncEvent, InitializeHandler, Operation, RequestHandler,
    SyncHandler,
};
use crate::context::AdapterContext;
use crate::events::AdapterErrorEvent;
use crate::{ClientInner, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Registering,
    Initializing,
    Ready,
    Failed,
    Disposed,
}

pub(crate) struct Lifecycle {
    pub state: AdapterState,
    pub initialized_at: Option<SystemTime>,
    /// Document-sync deliveries observed before the record became ready.
    pub queue: VecDeque<DocumentSyncEvent>,
    /// True while the ready-transition is replaying the queue; deliveries
    /// arriving in that window join the queue instead of overtaking it.
    pub draining: bool,
}

pub(crate) struct AdapterRecord {
    pub language_id: String,
    pub display_name: Option<String>,
    pub capabilities: serde_json::Map<String, Value>,
    pub registered_at: SystemTime,
    pub(crate) handlers: IndexMap<Operation, RequestHandler>,
    pub(crate) sync: Option<SyncHandler>,
    pub(crate) dispose: Mutex<Option<DisposeHandler>>,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    pub(crate) disposables: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl AdapterRecord {
    fn from_spec(spec: AdapterSpec) -> (Arc<Self>, Option<InitializeHandler>) {
        let AdapterSpec {
            language_id,
            display_name,
            capabilities,
            handlers,
            sync,
            initialize,
            dispose,
        } = spec;

        let record = Arc::new(Self {
            language_id,
            display_name,
            capabilities,
            registered_at: SystemTime::now(),
            handlers,
            sync,
            dispose: Mutex::new(dispose),
            lifecycle: Mutex::new(Lifecycle {
                state: AdapterState::Registering,
                initialized_at: None,
                queue: VecDeque::new(),
                draining: false,
            }),
            disposables: Mutex::new(Vec::new()),
        });
        (record, initialize)
    }

    pub fn state(&self) -> AdapterState {
        self.lifecycle.lock().state
    }

    /// The readiness gate for routed operations.
    pub(crate) fn gate(&self) -> Result<()> {
        match self.state() {
            AdapterState::Ready => Ok(()),
            AdapterState::Failed => Err(Error::LanguageFailed(self.language_id.clone())),
            AdapterState::Disposed => Err(Error::UnknownLanguage(self.language_id.clone())),
            AdapterState::Registering | AdapterState::Initializing => {
                Err(Error::LanguageNotReady(self.language_id.clone()))
            }
        }
    }

    pub(crate) fn push_disposable(&self, disposable: Box<dyn FnOnce() + Send>) {
        self.disposables.lock().push(disposable);
    }

    fn run_disposables(&self) {
        for disposable in self.disposables.lock().drain(..) {
            disposable();
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    records: Mutex<IndexMap<String, Arc<AdapterRecord>>>,
}

impl Registry {
    pub fn get(&self, language_id: &str) -> Option<Arc<AdapterRecord>> {
        self.records.lock().get(language_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// The single registered adapter, when there is exactly one.
    pub fn sole(&self) -> Option<Arc<AdapterRecord>> {
        let records = self.records.lock();
        if records.len() == 1 {
            records.values().next().cloned()
        } else {
            None
        }
    }

    pub fn snapshot(&self) -> Vec<Arc<AdapterRecord>> {
        self.records.lock().values().cloned().collect()
    }

    fn insert(&self, record: Arc<AdapterRecord>) -> Result<()> {
        let mut records = self.records.lock();
        if records.contains_key(&record.language_id) {
            return Err(Error::LanguageExists(record.language_id.clone()));
        }
        records.insert(record.language_id.clone(), record);
        Ok(())
    }

    fn remove(&self, language_id: &str) -> Option<Arc<AdapterRecord>> {
        self.records.lock().shift_remove(language_id)
    }

    fn drain(&self) -> Vec<Arc<AdapterRecord>> {
        let mut records = self.records.lock();
        records.drain(..).map(|(_, record)| record).collect()
    }
}

impl ClientInner {
    /// Validates and registers an adapter, driving its initialization to
    /// completion. See the state machine on [`AdapterState`].
    pub(crate) async fn register_language(&self, spec: AdapterSpec) -> Result<()> {
        self.ensure_live()?;
        if spec.language_id.trim().is_empty() {
            return Err(Error::InvalidAdapter(
                "adapter must carry a non-empty languageId".to_string(),
            ));
        }

        let (record, initialize) = AdapterRecord::from_spec(spec);
        self.registry.insert(record.clone())?;

        let Some(initialize) = initialize else {
            // Nothing to wait for; the record can serve immediately.
            let mut lifecycle = record.lifecycle.lock();
            lifecycle.state = AdapterState::Ready;
            lifecycle.initialized_at = Some(SystemTime::now());
            return Ok(());
        };

        record.lifecycle.lock().state = AdapterState::Initializing;
        let context = AdapterContext::new(self.weak_self.clone(), record.language_id.clone());

        match initialize(context).await {
            Ok(()) => {
                self.flush_and_mark_ready(&record);
                Ok(())
            }
            Err(err) => {
                let err = Arc::new(err);
                self.fail_record(&record, err.clone());
                Err(Error::Adapter(err))
            }
        }
    }

    /// Transitions the record to ready and replays its queue in FIFO order.
    /// Deliveries arriving while the replay runs are appended behind it, so
    /// the adapter observes every document-sync call in host order.
    pub(crate) fn flush_and_mark_ready(&self, record: &Arc<AdapterRecord>) {
        {
            let mut lifecycle = record.lifecycle.lock();
            lifecycle.state = AdapterState::Ready;
            lifecycle.initialized_at = Some(SystemTime::now());
            lifecycle.draining = true;
        }

        loop {
            let batch: Vec<DocumentSyncEvent> = {
                let mut lifecycle = record.lifecycle.lock();
                if lifecycle.queue.is_empty() {
                    lifecycle.draining = false;
                    break;
                }
                lifecycle.queue.drain(..).collect()
            };
            for event in batch {
                self.invoke_sync(record, event);
            }
        }
    }

    /// Initialization failed: surface every queued delivery on the error
    /// channel, remove the record, and run its disposables.
    pub(crate) fn fail_record(&self, record: &Arc<AdapterRecord>, error: Arc<anyhow::Error>) {
        let queued: Vec<DocumentSyncEvent> = {
            let mut lifecycle = record.lifecycle.lock();
            lifecycle.state = AdapterState::Failed;
            lifecycle.queue.drain(..).collect()
        };
        for event in queued {
            self.events.emit_adapter_error(AdapterErrorEvent {
                language_id: record.language_id.clone(),
                operation: event.operation().to_string(),
                error: error.clone(),
            });
        }
        self.events.emit_adapter_error(AdapterErrorEvent {
            language_id: record.language_id.clone(),
            operation: "initialize".to_string(),
            error,
        });

        self.registry.remove(&record.language_id);
        record.run_disposables();
    }

    /// Delivers one document-sync event, queueing it while the record is
    /// still coming up. Failed or disposed records drop the delivery.
    pub(crate) fn dispatch_sync(&self, record: &Arc<AdapterRecord>, event: DocumentSyncEvent) {
        {
            let mut lifecycle = record.lifecycle.lock();
            match lifecycle.state {
                AdapterState::Ready if !lifecycle.draining => {}
                AdapterState::Registering | AdapterState::Initializing | AdapterState::Ready => {
                    lifecycle.queue.push_back(event);
                    return;
                }
                AdapterState::Failed | AdapterState::Disposed => return,
            }
        }
        self.invoke_sync(record, event);
    }

    /// Invokes the adapter's sync handler. The handler closure runs here, on
    /// the caller, which is what fixes the delivery order; its future is
    /// spawned and only the error channel hears about failures.
    fn invoke_sync(&self, record: &Arc<AdapterRecord>, event: DocumentSyncEvent) {
        let Some(sync) = record.sync.clone() else {
            return;
        };
        let operation = event.operation();
        let context = self.request_context(&record.language_id);
        let future = sync(event, context);

        let events = self.events.clone();
        let language_id = record.language_id.clone();
        tokio::spawn(async move {
            if let Err(err) = future.await {
                events.emit_adapter_error(AdapterErrorEvent {
                    language_id,
                    operation: operation.to_string(),
                    error: Arc::new(err),
                });
            }
        });
    }

    pub(crate) async fn unregister_language(&self, language_id: &str) -> Result<()> {
        self.ensure_live()?;
        let record = self
            .registry
            .remove(language_id)
            .ok_or_else(|| Error::UnknownLanguage(language_id.to_string()))?;
        self.teardown_record(&record).await;
        Ok(())
    }

    /// Shared teardown for unregistration and client disposal: mark the
    /// record disposed, drop whatever is still queued, run the dispose
    /// handler, then the disposables. Errors are reported, never propagated.
    pub(crate) async fn teardown_record(&self, record: &Arc<AdapterRecord>) {
        {
            let mut lifecycle = record.lifecycle.lock();
            lifecycle.state = AdapterState::Disposed;
            lifecycle.queue.clear();
        }

        let dispose = record.dispose.lock().take();
        if let Some(dispose) = dispose {
            if let Err(err) = dispose().await {
                self.events.emit_adapter_error(AdapterErrorEvent {
                    language_id: record.language_id.clone(),
                    operation: "dispose".to_string(),
                    error: Arc::new(err),
                });
            }
        }
        record.run_disposables();
    }

    pub(crate) fn drain_registry(&self) -> Vec<Arc<AdapterRecord>> {
        self.registry.drain()
    }
}
