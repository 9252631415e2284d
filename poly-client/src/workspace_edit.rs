//! Applying a multi-file workspace edit to the document store and mirroring
//! the resulting changes back to the owning adapters.

use lsp_types as lsp;
use serde::{Deserialize, Serialize};

use crate::adapter::DocumentSyncEvent;
use crate::document::{apply_edit_list, normalize_uri};
use crate::ClientInner;

pub(crate) const REASON_NOT_OPEN: &str = "Document not open";
const REASON_UNSUPPORTED_OP: &str = "Unsupported file operation";

/// What became of one workspace edit. `applied` is true iff nothing failed;
/// otherwise `failure_reason` and `failed_change` describe the first
/// failure, and `failures` lists all of them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOutcome {
    pub applied: bool,
    pub failures: Vec<EditFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_change: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditFailure {
    pub uri: String,
    pub reason: String,
}

#[derive(Default)]
struct OutcomeBuilder {
    failures: Vec<EditFailure>,
    first_reason: Option<String>,
    first_index: Option<usize>,
}

impl OutcomeBuilder {
    fn fail(&mut self, index: usize, uri: impl Into<String>, reason: impl Into<String>) {
        let reason = reason.into();
        if self.first_reason.is_none() {
            self.first_reason = Some(reason.clone());
            self.first_index = Some(index);
        }
        self.failures.push(EditFailure {
            uri: uri.into(),
            reason,
        });
    }

    fn finish(self) -> EditOutcome {
        EditOutcome {
            applied: self.failures.is_empty(),
            failures: self.failures,
            failure_reason: self.first_reason,
            failed_change: self.first_index,
        }
    }
}

fn unwrap_edits(edits: &[lsp::OneOf<lsp::TextEdit, lsp::AnnotatedTextEdit>]) -> Vec<lsp::TextEdit> {
    edits
        .iter()
        .map(|edit| match edit {
            lsp::OneOf::Left(text_edit) => text_edit,
            lsp::OneOf::Right(annotated_text_edit) => &annotated_text_edit.text_edit,
        })
        .cloned()
        .collect()
}

impl ClientInner {
    /// Applies the edit package: `documentChanges` in order first, then the
    /// `changes` map. Every change gets an index; failures are recorded and
    /// the remaining changes still run.
    pub(crate) fn apply_workspace_edit(&self, edit: &lsp::WorkspaceEdit) -> EditOutcome {
        let mut outcome = OutcomeBuilder::default();
        let mut index = 0usize;

        if let Some(document_changes) = &edit.document_changes {
            match document_changes {
                lsp::DocumentChanges::Edits(edits) => {
                    for document_edit in edits {
                        self.apply_document_edit(document_edit, index, &mut outcome);
                        index += 1;
                    }
                }
                lsp::DocumentChanges::Operations(operations) => {
                    for operation in operations {
                        match operation {
                            lsp::DocumentChangeOperation::Edit(document_edit) => {
                                self.apply_document_edit(document_edit, index, &mut outcome);
                            }
                            lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Rename(rename)) => {
                                self.apply_rename(rename, index, &mut outcome);
                            }
                            lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Create(create)) => {
                                outcome.fail(index, create.uri.as_str(), REASON_UNSUPPORTED_OP);
                            }
                            lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Delete(delete)) => {
                                outcome.fail(index, delete.uri.as_str(), REASON_UNSUPPORTED_OP);
                            }
                        }
                        index += 1;
                    }
                }
            }
        }

        if let Some(changes) = &edit.changes {
            for (uri, text_edits) in changes {
                self.apply_change_entry(uri.as_str(), text_edits, index, &mut outcome);
                index += 1;
            }
        }

        outcome.finish()
    }

    fn apply_document_edit(
        &self,
        document_edit: &lsp::TextDocumentEdit,
        index: usize,
        outcome: &mut OutcomeBuilder,
    ) {
        let edits = unwrap_edits(&document_edit.edits);
        self.apply_change_entry(document_edit.text_document.uri.as_str(), &edits, index, outcome);
    }

    /// Applies one URI's edit list through the store, bumps its version by
    /// one, and mirrors an `updateDocument` to the owning adapter.
    fn apply_change_entry(
        &self,
        raw_uri: &str,
        edits: &[lsp::TextEdit],
        index: usize,
        outcome: &mut OutcomeBuilder,
    ) {
        let uri = match normalize_uri(raw_uri) {
            Ok(uri) => uri,
            Err(err) => {
                outcome.fail(index, raw_uri, err.to_string());
                return;
            }
        };

        let (document, changes) = {
            let mut store = self.store.lock();
            let Some(document) = store.get_mut(&uri) else {
                outcome.fail(index, uri.as_str(), REASON_NOT_OPEN);
                return;
            };

            let new_text = match apply_edit_list(&document.text, edits) {
                Ok(new_text) => new_text,
                Err(err) => {
                    outcome.fail(index, uri.as_str(), err.to_string());
                    return;
                }
            };

            document.text = new_text;
            document.version += 1;

            let changes: Vec<lsp::TextDocumentContentChangeEvent> = if edits.is_empty() {
                vec![lsp::TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: document.text.clone(),
                }]
            } else {
                edits
                    .iter()
                    .map(|edit| lsp::TextDocumentContentChangeEvent {
                        range: Some(edit.range),
                        range_length: None,
                        text: edit.new_text.clone(),
                    })
                    .collect()
            };
            (document.clone(), changes)
        };

        if let Some(record) = self.registry.get(&document.language_id) {
            self.dispatch_sync(&record, DocumentSyncEvent::Update { document, changes });
        }
    }

    /// Moves an open document to a new URI, preserving its text, language,
    /// and version, and tells the owning adapter via close + open.
    fn apply_rename(&self, rename: &lsp::RenameFile, index: usize, outcome: &mut OutcomeBuilder) {
        let old_uri = match normalize_uri(rename.old_uri.as_str()) {
            Ok(uri) => uri,
            Err(err) => {
                outcome.fail(index, rename.old_uri.as_str(), err.to_string());
                return;
            }
        };
        let new_uri = match normalize_uri(rename.new_uri.as_str()) {
            Ok(uri) => uri,
            Err(err) => {
                outcome.fail(index, rename.new_uri.as_str(), err.to_string());
                return;
            }
        };

        let (closed, opened) = {
            let mut store = self.store.lock();
            let Some(closed) = store.remove(&old_uri) else {
                outcome.fail(index, old_uri.as_str(), REASON_NOT_OPEN);
                return;
            };
            let mut opened = closed.clone();
            opened.uri = new_uri;
            store.insert(opened.clone());
            (closed, opened)
        };

        if let Some(record) = self.registry.get(&closed.language_id) {
            self.dispatch_sync(&record, DocumentSyncEvent::Close { document: closed });
            self.dispatch_sync(&record, DocumentSyncEvent::Open { document: opened });
        }
    }
}
