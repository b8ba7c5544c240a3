//! Pipeline stages for chunked, resumable conversion.
//!
//! Each submodule implements exactly one step and can be tested alone.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ probe ──▶ plan ──▶ split ──▶ tracker ──▶ renumber
//! (DjVu→PDF) (lopdf)  (ranges)  (chunks)  (submit/    (shift page
//!                                          retrieve)   markers, join)
//! ```
//!
//! 1. [`input`]    — resolve a source to a submittable PDF, converting DjVu once
//! 2. [`probe`]    — size and page count; the [`probe::PdfEngine`] seam
//! 3. [`plan`]     — pure chunk planning against the service limits
//! 4. [`split`]    — write each planned range as a chunk file; blocking work
//!    runs in `spawn_blocking`
//! 5. [`tracker`]  — submission and retrieval, with state kept as markers
//! 6. [`renumber`] — global page numbers and the concatenated document

pub mod input;
pub mod plan;
pub mod probe;
pub mod renumber;
pub mod split;
pub mod tracker;
