//! Bridge between an editor view and a shared [`Document`].
//!
//! ```text
//!  editor change event ──► LocalChangeHandler ──► Document::insert/delete ──► ops out
//!                               ▲ (skipped while guard held)
//!  ops in ──► Document::apply_remote ──► TextChange ──► EditorView::apply_changes
//!                                           (under ReentrancyGuard)
//! ```
//!
//! Rendering a remote change into the view makes the view emit a change
//! event of its own. The guard is held for the whole rendering pass, so that
//! echo never becomes a local edit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::document::{DocError, Document, TextChange};
use crate::ops::Operation;

/// A document shared between the binding and the network side.
pub type SharedDocument = Arc<Mutex<Document>>;

pub fn shared(doc: Document) -> SharedDocument {
    Arc::new(Mutex::new(doc))
}

/// Lock a shared document. A panic elsewhere while holding the lock leaves
/// the document in a consistent state (every mutation is completed before
/// returning), so poisoning is ignored.
pub fn lock(doc: &SharedDocument) -> MutexGuard<'_, Document> {
    doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The editor widget as seen by the binding.
pub trait EditorView {
    fn text(&self) -> String;
    /// Apply positional changes in order.
    fn apply_changes(&mut self, changes: &[TextChange]);
}

/// One discrete edit reported by the editor: `deleted` chars removed at
/// `offset`, then `inserted` placed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit {
    pub offset: usize,
    pub deleted: usize,
    pub inserted: String,
}

impl LocalEdit {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            deleted: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, len: usize) -> Self {
        Self {
            offset,
            deleted: len,
            inserted: String::new(),
        }
    }

    pub fn replace(offset: usize, len: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            deleted: len,
            inserted: text.into(),
        }
    }
}

/// Single-permit, non-blocking guard. `try_enter` either grants the pass or
/// returns `None` immediately.
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    held: AtomicBool,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<GuardPass<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| GuardPass { guard: self })
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases the guard on drop.
#[derive(Debug)]
pub struct GuardPass<'a> {
    guard: &'a ReentrancyGuard,
}

impl Drop for GuardPass<'_> {
    fn drop(&mut self) {
        self.guard.held.store(false, Ordering::Release);
    }
}

/// Translates editor change events into document operations. Cloneable so
/// the editor's event callback can own one.
#[derive(Debug, Clone)]
pub struct LocalChangeHandler {
    doc: SharedDocument,
    guard: Arc<ReentrancyGuard>,
}

impl LocalChangeHandler {
    /// Apply a batch of editor edits. Returns the operations to broadcast,
    /// or nothing if the batch is an echo of a remote change being rendered.
    pub fn handle(&self, edits: &[LocalEdit]) -> Result<Vec<Operation>, DocError> {
        let Some(_pass) = self.guard.try_enter() else {
            log::trace!("ignoring {} edits during remote render", edits.len());
            return Ok(Vec::new());
        };

        // Descending offsets keep the earlier offsets in the batch valid.
        let mut sorted: Vec<&LocalEdit> = edits.iter().collect();
        sorted.sort_by(|a, b| b.offset.cmp(&a.offset));

        let mut doc = lock(&self.doc);
        check_batch(&sorted, doc.len())?;
        let mut ops = Vec::new();
        for edit in sorted {
            if edit.deleted > 0 {
                ops.extend(doc.delete(edit.offset, edit.deleted)?);
            }
            if !edit.inserted.is_empty() {
                ops.push(doc.insert(edit.offset, &edit.inserted)?);
            }
        }
        Ok(ops)
    }
}

/// Rejects a batch before any edit is applied if an edit falls outside the
/// pre-batch text or overlaps the range of the edit after it. `sorted` is in
/// descending offset order.
fn check_batch(sorted: &[&LocalEdit], len: usize) -> Result<(), DocError> {
    let mut limit = len;
    for edit in sorted {
        let end = edit.offset.checked_add(edit.deleted);
        if end.map_or(true, |end| end > limit) {
            return Err(DocError::OutOfBounds {
                position: edit.offset,
                len: limit,
            });
        }
        limit = edit.offset;
    }
    Ok(())
}

/// Owns an editor view and keeps it aligned with a shared document.
pub struct LocalBinding<V: EditorView> {
    view: V,
    handler: LocalChangeHandler,
}

impl<V: EditorView> LocalBinding<V> {
    /// Bind `view` to `doc`. If the view's text differs from the document,
    /// the view is overwritten with the document's text.
    pub fn new(doc: SharedDocument, view: V) -> Self {
        let mut binding = Self {
            view,
            handler: LocalChangeHandler {
                doc,
                guard: Arc::new(ReentrancyGuard::new()),
            },
        };
        binding.resync_view();
        binding
    }

    pub fn view(&self) -> &V {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut V {
        &mut self.view
    }

    pub fn document(&self) -> &SharedDocument {
        &self.handler.doc
    }

    pub fn guard(&self) -> Arc<ReentrancyGuard> {
        Arc::clone(&self.handler.guard)
    }

    /// Handler to register as the editor's change callback.
    pub fn handler(&self) -> LocalChangeHandler {
        self.handler.clone()
    }

    /// Entry point for editor change events.
    pub fn on_local_change(&self, edits: &[LocalEdit]) -> Result<Vec<Operation>, DocError> {
        self.handler.handle(edits)
    }

    /// Integrate remote operations and render whatever they changed.
    /// Operations are always integrated; rendering is skipped if a pass is
    /// already in progress.
    pub fn apply_remote(&mut self, ops: Vec<Operation>) -> Result<Vec<TextChange>, DocError> {
        let mut changes = Vec::new();
        {
            let mut doc = lock(&self.handler.doc);
            for op in ops {
                changes.extend(doc.apply_remote(op)?.changes);
            }
        }
        self.render_remote(&changes);
        Ok(changes)
    }

    /// Render changes that were already integrated elsewhere (e.g. by the
    /// network task). Returns false if skipped because a pass was active.
    pub fn render_remote(&mut self, changes: &[TextChange]) -> bool {
        if changes.is_empty() {
            return true;
        }
        match self.handler.guard.try_enter() {
            Some(_pass) => {
                self.view.apply_changes(changes);
                true
            }
            None => {
                log::trace!("skipping render of {} changes during local pass", changes.len());
                false
            }
        }
    }

    /// Overwrite the view with the document's text if they differ.
    pub fn resync_view(&mut self) {
        let doc_text = lock(&self.handler.doc).text();
        let view_text = self.view.text();
        if doc_text == view_text {
            return;
        }
        let mut changes = Vec::with_capacity(2);
        let view_len = view_text.chars().count();
        if view_len > 0 {
            changes.push(TextChange::Delete {
                index: 0,
                len: view_len,
            });
        }
        if !doc_text.is_empty() {
            changes.push(TextChange::Insert {
                index: 0,
                text: doc_text,
            });
        }
        self.render_remote(&changes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ClientId;
    use std::sync::Mutex as StdMutex;

    /// Plain-string view that replays every rendered change back through an
    /// optional change handler, as a real editor's change event would.
    struct EchoingView {
        text: String,
        echo: Option<LocalChangeHandler>,
        echoed_ops: Arc<StdMutex<Vec<Operation>>>,
        renders: usize,
    }

    impl EchoingView {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                echo: None,
                echoed_ops: Arc::new(StdMutex::new(Vec::new())),
                renders: 0,
            }
        }
    }

    impl EditorView for EchoingView {
        fn text(&self) -> String {
            self.text.clone()
        }

        fn apply_changes(&mut self, changes: &[TextChange]) {
            self.renders += 1;
            let mut edits = Vec::new();
            for change in changes {
                let mut chars: Vec<char> = self.text.chars().collect();
                match change {
                    TextChange::Insert { index, text } => {
                        let _ = chars.splice(*index..*index, text.chars());
                        edits.push(LocalEdit::insert(*index, text.clone()));
                    }
                    TextChange::Delete { index, len } => {
                        chars.drain(*index..*index + *len);
                        edits.push(LocalEdit::delete(*index, *len));
                    }
                }
                self.text = chars.into_iter().collect();
            }
            if let Some(handler) = &self.echo {
                let ops = handler.handle(&edits).unwrap();
                self.echoed_ops.lock().unwrap().extend(ops);
            }
        }
    }

    #[test]
    fn test_guard_is_single_permit() {
        let guard = ReentrancyGuard::new();
        let pass = guard.try_enter();
        assert!(pass.is_some());
        assert!(guard.is_held());
        assert!(guard.try_enter().is_none());
        drop(pass);
        assert!(!guard.is_held());
        assert!(guard.try_enter().is_some());
    }

    #[test]
    fn test_new_binding_aligns_view_with_document() {
        let doc = shared(Document::from_text(ClientId(1), "from server"));
        let binding = LocalBinding::new(doc, EchoingView::new("stale"));
        assert_eq!(binding.view().text, "from server");
    }

    #[test]
    fn test_local_batch_applies_in_descending_offset_order() {
        let doc = shared(Document::from_text(ClientId(1), "abcdef"));
        let binding = LocalBinding::new(doc.clone(), EchoingView::new("abcdef"));

        // Offsets refer to the pre-batch text.
        let ops = binding
            .on_local_change(&[LocalEdit::replace(0, 1, "A"), LocalEdit::delete(4, 2)])
            .unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(lock(&doc).text(), "Abcd");
    }

    #[test]
    fn test_remote_render_does_not_echo_into_document() {
        let origin = shared(Document::from_text(ClientId(1), "hello"));
        let replica = shared(Document::new(ClientId(2)));
        let mut binding = LocalBinding::new(replica.clone(), EchoingView::new(""));
        let echoed = binding.view().echoed_ops.clone();
        binding.view_mut().echo = Some(binding.handler());

        let ops = lock(&origin).diff_since(&Default::default());
        let changes = binding.apply_remote(ops).unwrap();

        assert_eq!(changes.len(), 1);
        assert_eq!(binding.view().text, "hello");
        assert!(echoed.lock().unwrap().is_empty(), "echo must be suppressed");
        assert_eq!(lock(&replica).operation_count(), 1);
    }

    #[test]
    fn test_local_change_after_render_is_accepted() {
        let doc = shared(Document::new(ClientId(2)));
        let mut binding = LocalBinding::new(doc.clone(), EchoingView::new(""));
        binding.render_remote(&[TextChange::Insert {
            index: 0,
            text: "x".to_string(),
        }]);
        let ops = binding.on_local_change(&[LocalEdit::insert(0, "y")]).unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_render_skipped_while_pass_active() {
        let doc = shared(Document::new(ClientId(2)));
        let mut binding = LocalBinding::new(doc, EchoingView::new(""));
        let guard = binding.guard();
        let _pass = guard.try_enter().unwrap();
        let rendered = binding.render_remote(&[TextChange::Insert {
            index: 0,
            text: "x".to_string(),
        }]);
        assert!(!rendered);
        assert_eq!(binding.view().renders, 0);
        assert!(binding.on_local_change(&[LocalEdit::insert(0, "y")]).unwrap().is_empty());
    }

    #[test]
    fn test_out_of_bounds_local_edit_is_an_error() {
        let doc = shared(Document::from_text(ClientId(1), "ab"));
        let binding = LocalBinding::new(doc, EchoingView::new("ab"));
        assert!(binding.on_local_change(&[LocalEdit::delete(1, 5)]).is_err());
    }

    #[test]
    fn test_failed_batch_leaves_document_untouched() {
        let doc = shared(Document::from_text(ClientId(1), "abc"));
        let binding = LocalBinding::new(doc.clone(), EchoingView::new("abc"));
        let before = lock(&doc).operation_count();

        let result = binding.on_local_change(&[LocalEdit::delete(0, 10), LocalEdit::insert(3, "X")]);
        assert!(matches!(result, Err(DocError::OutOfBounds { .. })));
        assert_eq!(lock(&doc).text(), "abc");
        assert_eq!(lock(&doc).operation_count(), before);
    }

    #[test]
    fn test_overlapping_batch_is_rejected() {
        let doc = shared(Document::from_text(ClientId(1), "abcdef"));
        let binding = LocalBinding::new(doc.clone(), EchoingView::new("abcdef"));
        let result = binding.on_local_change(&[LocalEdit::delete(1, 3), LocalEdit::delete(2, 2)]);
        assert!(result.is_err());
        assert_eq!(lock(&doc).text(), "abcdef");
    }

    #[test]
    fn test_insert_at_end_of_deleted_range_is_accepted() {
        let doc = shared(Document::from_text(ClientId(1), "abcd"));
        let binding = LocalBinding::new(doc.clone(), EchoingView::new("abcd"));
        let ops = binding
            .on_local_change(&[LocalEdit::delete(0, 2), LocalEdit::insert(2, "-")])
            .unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(lock(&doc).text(), "-cd");
    }
}
