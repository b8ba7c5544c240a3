//! Progress-callback trait for relay events.
//!
//! Inject an [`Arc<dyn RelayProgressCallback>`] via
//! [`crate::config::RelayConfigBuilder::progress_callback`] to observe chunk
//! submissions and retrievals as they happen. The CLI uses this to drive its
//! progress bar; the library itself only logs.
//!
//! # Example
//!
//! ```rust
//! use pdf2md_relay::{RelayProgressCallback, RelayConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     retrieved: Arc<AtomicUsize>,
//! }
//!
//! impl RelayProgressCallback for CountingCallback {
//!     fn on_chunk_retrieved(&self, chunk: &str, markdown_len: usize) {
//!         self.retrieved.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{chunk}: {markdown_len} bytes");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     retrieved: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = RelayConfig::builder()
//!     .progress_callback(counter as Arc<dyn RelayProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the relay as chunks move through their lifecycle.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait RelayProgressCallback: Send + Sync {
    /// A document's chunks are about to be handled.
    fn on_document_start(&self, document: &str, chunk_count: usize) {
        let _ = (document, chunk_count);
    }

    /// The service accepted a chunk and a marker was written.
    fn on_chunk_submitted(&self, chunk: &str, record_id: &str) {
        let _ = (chunk, record_id);
    }

    /// A chunk's Markdown was written and its marker removed.
    ///
    /// # Arguments
    /// * `markdown_len` — byte length of the stored Markdown
    fn on_chunk_retrieved(&self, chunk: &str, markdown_len: usize) {
        let _ = (chunk, markdown_len);
    }

    /// The service is still working on a chunk.
    fn on_chunk_pending(&self, chunk: &str, pages_processed: Option<u32>) {
        let _ = (chunk, pages_processed);
    }

    /// A chunk failed; `error` is human-readable.
    fn on_chunk_error(&self, chunk: &str, error: &str) {
        let _ = (chunk, error);
    }

    /// The concatenated output of a document was written.
    fn on_document_finalized(&self, document: &str, total_pages: u32) {
        let _ = (document, total_pages);
    }
}

/// A no-op implementation for callers that don't need progress events.
///
/// This is the default when no callback is configured.
pub struct NoopProgressCallback;

impl RelayProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::RelayConfig`].
pub type ProgressCallback = Arc<dyn RelayProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        submitted: AtomicUsize,
        retrieved: AtomicUsize,
        pending: AtomicUsize,
        errors: AtomicUsize,
        finalized_pages: AtomicUsize,
    }

    impl RelayProgressCallback for TrackingCallback {
        fn on_chunk_submitted(&self, _chunk: &str, _record_id: &str) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
        }

        fn on_chunk_retrieved(&self, _chunk: &str, _markdown_len: usize) {
            self.retrieved.fetch_add(1, Ordering::SeqCst);
        }

        fn on_chunk_pending(&self, _chunk: &str, _pages_processed: Option<u32>) {
            self.pending.fetch_add(1, Ordering::SeqCst);
        }

        fn on_chunk_error(&self, _chunk: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_document_finalized(&self, _document: &str, total_pages: u32) {
            self.finalized_pages.store(total_pages as usize, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_document_start("book", 3);
        cb.on_chunk_submitted("book_pages_1_190.pdf", "rec-1");
        cb.on_chunk_pending("book_pages_1_190.pdf", Some(12));
        cb.on_chunk_retrieved("book_pages_1_190.pdf", 42);
        cb.on_chunk_error("book_pages_191_380.pdf", "some error");
        cb.on_document_finalized("book", 450);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_chunk_submitted("a_pages_1_2.pdf", "r1");
        tracker.on_chunk_submitted("a_pages_3_4.pdf", "r2");
        tracker.on_chunk_pending("a_pages_1_2.pdf", None);
        tracker.on_chunk_retrieved("a_pages_1_2.pdf", 100);
        tracker.on_chunk_error("a_pages_3_4.pdf", "remote failure");
        tracker.on_document_finalized("a", 4);

        assert_eq!(tracker.submitted.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.pending.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.retrieved.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.finalized_pages.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_document_start("book", 1);
        cb.on_chunk_retrieved("book_pages_1_10.pdf", 512);
    }
}
