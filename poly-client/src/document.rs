//! The authoritative in-memory store of open text documents, plus the URI
//! normalization and position math every other component leans on.

use std::collections::HashMap;
use std::time::SystemTime;

use lsp_types as lsp;
use lsp_types::Url;

use crate::{Error, Result};

/// One open text document. Clones of this are handed to adapters and hosts;
/// the store alone holds the live copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub uri: Url,
    pub language_id: String,
    pub text: String,
    pub version: i32,
    pub opened_at: SystemTime,
}

#[derive(Default)]
pub(crate) struct DocumentStore {
    documents: HashMap<Url, Document>,
}

impl DocumentStore {
    pub fn get(&self, uri: &Url) -> Option<&Document> {
        self.documents.get(uri)
    }

    pub fn get_mut(&mut self, uri: &Url) -> Option<&mut Document> {
        self.documents.get_mut(uri)
    }

    /// Inserts the document, replacing any previous entry at the same URI.
    /// Closing first is the host's responsibility.
    pub fn insert(&mut self, document: Document) {
        self.documents.insert(document.uri.clone(), document);
    }

    pub fn remove(&mut self, uri: &Url) -> Option<Document> {
        self.documents.remove(uri)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    pub fn documents_for_language<'a>(
        &'a self,
        language_id: &'a str,
    ) -> impl Iterator<Item = &'a Document> {
        self.documents
            .values()
            .filter(move |document| document.language_id == language_id)
    }
}

/// Canonicalizes host-supplied URIs. Accepts proper URIs, bare absolute
/// paths, and Windows drive-letter paths; everything is re-emitted in
/// canonical `url` form with any fragment stripped and an uppercased drive
/// letter.
pub fn normalize_uri(input: &str) -> Result<Url> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::InvalidUri("empty URI".to_string()));
    }

    if let Some(path) = windows_drive_path(input) {
        return Url::parse(&format!("file:///{path}"))
            .map_err(|_| Error::InvalidUri(input.to_string()));
    }

    if input.starts_with('/') {
        return Url::from_file_path(input).map_err(|()| Error::InvalidUri(input.to_string()));
    }

    let mut url = Url::parse(input).map_err(|_| Error::InvalidUri(input.to_string()))?;
    url.set_fragment(None);
    if url.scheme() == "file" {
        uppercase_drive_letter(&mut url);
    }
    Ok(url)
}

/// `C:\src\main.rs` or `c:/src/main.rs` → `C:/src/main.rs`.
fn windows_drive_path(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
    {
        let mut path = input.replace('\\', "/");
        path[..1].make_ascii_uppercase();
        Some(path)
    } else {
        None
    }
}

fn uppercase_drive_letter(url: &mut Url) {
    let path = url.path();
    let bytes = path.as_bytes();
    if bytes.len() >= 3
        && bytes[0] == b'/'
        && bytes[1].is_ascii_lowercase()
        && bytes[2] == b':'
    {
        let mut upper = path.to_string();
        upper[1..2].make_ascii_uppercase();
        url.set_path(&upper);
    }
}

/// Maps a position to a byte offset. Lines are split on `\n` with an
/// implicit trailing LF for offset accounting; an out-of-range character
/// clamps to the line's length and an out-of-range line clamps to the end of
/// the text.
pub(crate) fn position_to_offset(text: &str, position: lsp::Position) -> usize {
    let mut offset = 0;
    for (index, line) in text.split('\n').enumerate() {
        if index as u32 == position.line {
            return offset + (position.character as usize).min(line.len());
        }
        offset += line.len() + 1;
    }
    text.len()
}

fn range_to_offsets(text: &str, range: lsp::Range) -> Result<(usize, usize)> {
    let start = position_to_offset(text, range.start);
    let end = position_to_offset(text, range.end);
    if start > end {
        return Err(Error::InvalidPosition(format!(
            "range start {}:{} is past its end {}:{}",
            range.start.line, range.start.character, range.end.line, range.end.character
        )));
    }
    Ok((start, end))
}

/// Applies content changes in order. A change with a range replaces that
/// range; a change without one replaces the whole text.
pub(crate) fn apply_content_changes(
    text: &mut String,
    changes: &[lsp::TextDocumentContentChangeEvent],
) -> Result<()> {
    for change in changes {
        match change.range {
            Some(range) => {
                let (start, end) = range_to_offsets(text, range)?;
                text.replace_range(start..end, &change.text);
            }
            None => *text = change.text.clone(),
        }
    }
    Ok(())
}

/// Applies a workspace-edit style edit list to a full text. Edits are
/// positioned against the input text and applied in reverse document order
/// so earlier offsets stay valid; callers supply non-overlapping edits (the
/// LSP contract) and overlaps are resolved greedily in that order.
pub(crate) fn apply_edit_list(text: &str, edits: &[lsp::TextEdit]) -> Result<String> {
    let mut ordered: Vec<&lsp::TextEdit> = edits.iter().collect();
    ordered.sort_by_key(|edit| (edit.range.start.line, edit.range.start.character));

    let mut result = text.to_string();
    for edit in ordered.iter().rev() {
        let (start, end) = range_to_offsets(&result, edit.range)?;
        result.replace_range(start..end, &edit.new_text);
    }
    Ok(result)
}

impl crate::ClientInner {
    /// Opens (or replaces) a document and tells the owning adapter. The
    /// language must be registered.
    pub(crate) fn open_document(
        &self,
        uri: &str,
        language_id: &str,
        text: String,
        version: i32,
    ) -> crate::Result<()> {
        self.ensure_live()?;
        let uri = normalize_uri(uri)?;
        let record = self
            .registry
            .get(language_id)
            .ok_or_else(|| Error::UnknownLanguage(language_id.to_string()))?;

        let document = Document {
            uri,
            language_id: language_id.to_string(),
            text,
            version,
            opened_at: SystemTime::now(),
        };
        self.store.lock().insert(document.clone());
        self.dispatch_sync(&record, crate::DocumentSyncEvent::Open { document });
        Ok(())
    }

    /// Applies content changes at a strictly increasing version. An empty
    /// change list is a version-only bump, letting hosts resynchronize
    /// version counters without touching the text.
    pub(crate) fn update_document(
        &self,
        uri: &str,
        version: i32,
        changes: Vec<lsp::TextDocumentContentChangeEvent>,
    ) -> crate::Result<()> {
        self.ensure_live()?;
        let uri = normalize_uri(uri)?;

        let document = {
            let mut store = self.store.lock();
            let document = store
                .get_mut(&uri)
                .ok_or_else(|| Error::DocumentNotOpen(uri.to_string()))?;
            if version <= document.version {
                return Err(Error::InvalidVersion {
                    uri: uri.to_string(),
                    current: document.version,
                    supplied: version,
                });
            }

            let mut text = document.text.clone();
            apply_content_changes(&mut text, &changes)?;
            document.text = text;
            document.version = version;
            document.clone()
        };

        let changes = if changes.is_empty() {
            vec![lsp::TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: document.text.clone(),
            }]
        } else {
            changes
        };

        if let Some(record) = self.registry.get(&document.language_id) {
            self.dispatch_sync(
                &record,
                crate::DocumentSyncEvent::Update { document, changes },
            );
        }
        Ok(())
    }

    /// Removes the document and tells the owning adapter. A no-op when the
    /// URI is not open.
    pub(crate) fn close_document(&self, uri: &str) -> crate::Result<()> {
        self.ensure_live()?;
        let uri = normalize_uri(uri)?;
        let Some(document) = self.store.lock().remove(&uri) else {
            return Ok(());
        };
        if let Some(record) = self.registry.get(&document.language_id) {
            self.dispatch_sync(&record, crate::DocumentSyncEvent::Close { document });
        }
        Ok(())
    }

    pub(crate) fn save_document(&self, uri: &str) -> crate::Result<()> {
        self.ensure_live()?;
        let uri = normalize_uri(uri)?;
        let document = self
            .store
            .lock()
            .get(&uri)
            .cloned()
            .ok_or_else(|| Error::DocumentNotOpen(uri.to_string()))?;
        if let Some(record) = self.registry.get(&document.language_id) {
            self.dispatch_sync(&record, crate::DocumentSyncEvent::Save { document });
        }
        Ok(())
    }
}
