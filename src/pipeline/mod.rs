//! Pipeline stages for document extraction and compliance evaluation.
//!
//! Each submodule implements one step. The collaborators with real I/O
//! (pdfium, the OCR job service, the staging store, the LLM) sit behind
//! traits so the decision logic can be tested with fakes.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ extract ──────────────────────────▶ llm ──▶ verdict
//! (bytes)    ├─ pdf ─▶ tables ─▶ normalize      (prompt)  (reconcile)
//!            └─ ocr ─▶ geometry ─▶ tables
//! ```
//!
//! 1. [`input`]: load a file, detect its kind, check the PDF magic
//! 2. [`pdf`]: local text layer via pdfium; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`tables`]: HTML table fragments to pipe tables; table detection
//! 4. [`normalize`]: deterministic cleanup of PDF-derived text
//! 5. [`ocr`]: stage, submit, poll and paginate an OCR job
//! 6. [`geometry`]: merge OCR lines and table cells without duplication
//! 7. [`extract`]: the decision procedure tying 2–6 together
//! 8. [`llm`]: token budget and the model call with retry/backoff
//! 9. [`verdict`]: pull the answer out of free text and correct it

pub mod extract;
pub mod geometry;
pub mod input;
pub mod llm;
pub mod normalize;
pub mod ocr;
pub mod pdf;
pub mod tables;
pub mod verdict;
